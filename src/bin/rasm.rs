use std::fs;
use std::path::PathBuf;
use std::process;

use failure::{format_err, Error};
use structopt::StructOpt;

use rasm::avr_asm::{self, Options};
use rasm::error::AsmError;

#[derive(StructOpt, Debug)]
#[structopt(name = "rasm", about = "AVR assembler producing flat binary images")]
struct Cmd {
    /// Do not prefix the image with the interrupt vector table
    #[structopt(long = "no-vectors", conflicts_with = "vectors")]
    no_vectors: bool,

    /// Prefix the image with the interrupt vector table (the default)
    #[structopt(long = "vectors")]
    vectors: bool,

    /// Output file
    #[structopt(short = "o", long = "output", parse(from_os_str))]
    output: PathBuf,

    /// Input assembly source
    #[structopt(parse(from_os_str))]
    input: PathBuf,
}

fn diagnostic(input: &PathBuf, err: &AsmError) -> Error {
    match err.span() {
        Some(span) => format_err!("{}:{}: {}", input.display(), span, err.message()),
        None => format_err!("{}: {}", input.display(), err.message()),
    }
}

fn run(cmd: &Cmd) -> Result<(), Error> {
    let source = fs::read_to_string(&cmd.input)
        .map_err(|err| format_err!("{}: {}", cmd.input.display(), err))?;
    let options = Options {
        vectors: !cmd.no_vectors,
        ..Options::default()
    };
    let image =
        avr_asm::assemble(&source, options).map_err(|err| diagnostic(&cmd.input, &err))?;
    fs::write(&cmd.output, &image)
        .map_err(|err| format_err!("{}: {}", cmd.output.display(), err))?;
    Ok(())
}

fn main() {
    env_logger::init();
    let cmd = Cmd::from_args();
    if let Err(err) = run(&cmd) {
        eprintln!("rasm: {}", err);
        process::exit(1);
    }
}
