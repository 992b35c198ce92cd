use std::collections::HashMap;

use byteorder::{ByteOrder, LittleEndian};
use log::debug;

use crate::error::{AsmError, Span};
use crate::insn::{self, EncodedWords, InsnSpec};
use crate::lexer;
use crate::parser::{self, Expr, Item, Operand, ParsedItem, SectionKind};
use crate::symbols::{Env, Value};

/// Interrupt vector slots of an ATmega328-class device, by slot number.
pub const VECTOR_NAMES: [&str; 26] = [
    "RESET",
    "INT0_vect",
    "INT1_vect",
    "PCINT0_vect",
    "PCINT1_vect",
    "PCINT2_vect",
    "WDT_vect",
    "TIMER2_COMPA_vect",
    "TIMER2_COMPB_vect",
    "TIMER2_OVF_vect",
    "TIMER1_CAPT_vect",
    "TIMER1_COMPA_vect",
    "TIMER1_COMPB_vect",
    "TIMER1_OVF_vect",
    "TIMER0_COMPA_vect",
    "TIMER0_COMPB_vect",
    "TIMER0_OVF_vect",
    "SPI_STC_vect",
    "USART_RX_vect",
    "USART_UDRE_vect",
    "USART_TX_vect",
    "ADC_vect",
    "EE_READY_vect",
    "ANALOG_COMP_vect",
    "TWI_vect",
    "SPM_READY_vect",
];

/// A vector slot with no defined handler jumps to itself.
const VECTOR_SELF_LOOP: u16 = 0xCFFF;

#[derive(Clone, Debug)]
pub struct Options {
    /// Prefix the image with the interrupt vector table.
    pub vectors: bool,
    /// Number of vector slots in the table.
    pub vector_count: usize,
}

impl Default for Options {
    fn default() -> Self {
        Options {
            vectors: true,
            vector_count: VECTOR_NAMES.len(),
        }
    }
}

/// Assembles one source file into a flat binary image.
pub fn assemble(source: &str, options: Options) -> Result<Vec<u8>, AsmError> {
    Assembler::new(options).assemble(source)
}

pub struct Assembler {
    env: Env,
    instructions: HashMap<&'static str, InsnSpec>,
    options: Options,
}

impl Assembler {
    pub fn new(options: Options) -> Self {
        Assembler {
            env: Env::new(),
            instructions: insn::instruction_set(),
            options,
        }
    }

    pub fn assemble(&mut self, source: &str) -> Result<Vec<u8>, AsmError> {
        let tokens = lexer::tokenize(source)?;
        let items = parser::parse(&tokens)?;
        debug!("parsed {} items", items.len());
        self.bind_symbols(&items)?;
        let addresses = self.layout(&items)?;
        let text = self.emit(&items, &addresses)?;
        debug!("emitted {} bytes of text", text.len());
        self.compose_image(text)
    }

    fn text_base(&self) -> u32 {
        if self.options.vectors {
            2 * self.options.vector_count as u32
        } else {
            0
        }
    }

    // Applies .equ and .default in source order. Values stay
    // unevaluated; only the binding strength is decided here.
    fn bind_symbols(&mut self, items: &[ParsedItem]) -> Result<(), AsmError> {
        for pi in items {
            match &pi.item {
                Item::Equ { name, value } => {
                    self.check_definable(name, pi.span)?;
                    let value = self.symbol_value(value, pi.span)?;
                    self.env.define_strong(name, value, pi.span)?;
                }
                Item::Default { name, value } => {
                    self.check_definable(name, pi.span)?;
                    let value = self.symbol_value(value, pi.span)?;
                    self.env.define_weak(name, value);
                }
                _ => {}
            }
        }
        Ok(())
    }

    fn check_definable(&self, name: &str, span: Span) -> Result<(), AsmError> {
        if self
            .instructions
            .contains_key(name.to_ascii_lowercase().as_str())
        {
            return Err(AsmError::symbol(
                format!("`{}` is a reserved mnemonic", name),
                span,
            ));
        }
        Ok(())
    }

    fn symbol_value(&self, operand: &Operand, span: Span) -> Result<Value, AsmError> {
        match operand {
            Operand::Reg(n) => Ok(Value::Reg(*n)),
            Operand::Pair { hi, lo } => {
                if *hi != lo + 1 || lo % 2 != 0 {
                    return Err(AsmError::parse(
                        format!("r{}:r{} is not an adjacent even/odd register pair", hi, lo),
                        span,
                    ));
                }
                Ok(Value::Pair { hi: *hi, lo: *lo })
            }
            Operand::Expr(e) => Ok(Value::Expr(e.clone())),
            Operand::Ptr { name, .. } => Ok(Value::Expr(Expr::ident(name.clone()))),
            _ => Err(AsmError::directive(
                "symbol values must be expressions, registers or register pairs",
                span,
            )),
        }
    }

    // Single walk assigning a byte address to every item. Instruction
    // widths depend only on the mnemonic, so one pass suffices; labels
    // are installed as strong bindings as they are passed.
    fn layout(&mut self, items: &[ParsedItem]) -> Result<Vec<u32>, AsmError> {
        let mut text = self.text_base();
        let mut data = 0u32;
        let mut section = SectionKind::Text;
        let mut addresses = Vec::with_capacity(items.len());
        for pi in items {
            let cursor = match section {
                SectionKind::Text => &mut text,
                SectionKind::Data => &mut data,
            };
            addresses.push(*cursor);
            match &pi.item {
                Item::Label(name) => {
                    self.check_definable(name, pi.span)?;
                    self.env.define_strong(
                        name,
                        Value::Expr(Expr::Int(i64::from(*cursor))),
                        pi.span,
                    )?;
                }
                Item::Instruction { mnemonic, .. } => {
                    if section != SectionKind::Text {
                        return Err(AsmError::encode(
                            "instructions are only allowed in .text",
                            pi.span,
                        ));
                    }
                    let spec = self.instructions.get(mnemonic.as_str()).ok_or_else(|| {
                        AsmError::encode(format!("unknown mnemonic `{}`", mnemonic), pi.span)
                    })?;
                    if *cursor % 2 != 0 {
                        return Err(AsmError::encode(
                            "instruction at an odd address, missing .align 2",
                            pi.span,
                        ));
                    }
                    *cursor += 2 * spec.words;
                }
                Item::Byte(args) => {
                    *cursor += byte_payload_len(args);
                }
                Item::Word(exprs) => {
                    *cursor += 2 * exprs.len() as u32;
                }
                Item::Align(n) => {
                    let rem = *cursor % n;
                    if rem != 0 {
                        *cursor += n - rem;
                    }
                }
                Item::Section(kind) => {
                    section = *kind;
                }
                Item::Global(_) | Item::Equ { .. } | Item::Default { .. } => {}
                Item::NumericLabel(_) | Item::Rept(_) | Item::Endr => {
                    return Err(AsmError::parse("unexpanded parser item", pi.span));
                }
            }
        }
        Ok(addresses)
    }

    // Second walk over the items with the now-complete environment,
    // producing the .text byte stream.
    fn emit(&self, items: &[ParsedItem], addresses: &[u32]) -> Result<Vec<u8>, AsmError> {
        let text_base = self.text_base();
        let mut image = Vec::new();
        let mut section = SectionKind::Text;
        for (pi, &addr) in items.iter().zip(addresses) {
            match &pi.item {
                Item::Section(kind) => {
                    section = *kind;
                }
                _ if section == SectionKind::Data => {}
                Item::Instruction { mnemonic, operands } => {
                    debug_assert_eq!(addr, text_base + image.len() as u32);
                    let spec = self.instructions.get(mnemonic.as_str()).ok_or_else(|| {
                        AsmError::encode(format!("unknown mnemonic `{}`", mnemonic), pi.span)
                    })?;
                    match insn::encode(spec, mnemonic, operands, &self.env, addr, pi.span)? {
                        EncodedWords::One(w) => push_word(&mut image, w),
                        EncodedWords::Two(first, second) => {
                            push_word(&mut image, first);
                            push_word(&mut image, second);
                        }
                    }
                }
                Item::Byte(args) => {
                    for arg in args {
                        match arg {
                            Operand::Str(s) => image.extend_from_slice(s.as_bytes()),
                            Operand::Expr(e) => {
                                let v = self.env.eval(e, pi.span)?;
                                if !(-128..=255).contains(&v) {
                                    return Err(AsmError::range(
                                        format!(".byte value {} out of range", v),
                                        pi.span,
                                    ));
                                }
                                image.push(v as u8);
                            }
                            _ => {
                                return Err(AsmError::directive(
                                    ".byte operands must be expressions or strings",
                                    pi.span,
                                ))
                            }
                        }
                    }
                }
                Item::Word(exprs) => {
                    for e in exprs {
                        let v = self.env.eval(e, pi.span)?;
                        if !(-32768..=65535).contains(&v) {
                            return Err(AsmError::range(
                                format!(".word value {} out of range", v),
                                pi.span,
                            ));
                        }
                        push_word(&mut image, v as u16);
                    }
                }
                Item::Align(n) => {
                    while (text_base + image.len() as u32) % n != 0 {
                        image.push(0);
                    }
                }
                _ => {}
            }
        }
        Ok(image)
    }

    // The optional vector table: one RJMP per slot, self-loop when the
    // handler name is undefined.
    fn compose_image(&self, text: Vec<u8>) -> Result<Vec<u8>, AsmError> {
        if !self.options.vectors {
            return Ok(text);
        }
        let mut image = Vec::with_capacity(2 * self.options.vector_count + text.len());
        for slot in 0..self.options.vector_count {
            let handler = VECTOR_NAMES
                .get(slot)
                .copied()
                .filter(|name| self.env.contains(name));
            let word = match handler {
                Some(name) => self.vector_word(name, slot)?,
                None => VECTOR_SELF_LOOP,
            };
            push_word(&mut image, word);
        }
        image.extend_from_slice(&text);
        Ok(image)
    }

    fn vector_word(&self, handler: &str, slot: usize) -> Result<u16, AsmError> {
        let target = self
            .env
            .resolve(handler, Span::new(0, 0))
            .map_err(|err| AsmError::spanless(err.kind(), err.message().to_string()))?;
        let delta = target - (2 * slot as i64 + 2);
        if delta % 2 != 0 {
            return Err(AsmError::spanless(
                crate::error::ErrorKind::Range,
                format!("vector handler `{}` is not word-aligned", handler),
            ));
        }
        let k = delta / 2;
        if !(-2048..2048).contains(&k) {
            return Err(AsmError::spanless(
                crate::error::ErrorKind::Range,
                format!("vector handler `{}` out of RJMP range", handler),
            ));
        }
        Ok(0xC000 | (k as u16) & 0x0FFF)
    }
}

fn byte_payload_len(args: &[Operand]) -> u32 {
    args.iter()
        .map(|arg| match arg {
            Operand::Str(s) => s.as_bytes().len() as u32,
            _ => 1,
        })
        .sum()
}

fn push_word(image: &mut Vec<u8>, word: u16) {
    let mut buf = [0; 2];
    LittleEndian::write_u16(&mut buf, word);
    image.extend_from_slice(&buf);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    fn asm(source: &str) -> Vec<u8> {
        assemble(
            source,
            Options {
                vectors: false,
                ..Options::default()
            },
        )
        .expect("assembly failed")
    }

    fn asm_err(source: &str) -> AsmError {
        assemble(
            source,
            Options {
                vectors: false,
                ..Options::default()
            },
        )
        .expect_err("assembly should fail")
    }

    fn asm_vectors(source: &str) -> Vec<u8> {
        assemble(source, Options::default()).expect("assembly failed")
    }

    #[test]
    fn test_empty_source() {
        assert_eq!(asm(""), b"");
    }

    #[test]
    fn test_rjmp_to_self() {
        assert_eq!(asm("start: rjmp start\n"), [0xFF, 0xCF]);
    }

    #[test]
    fn test_ldi_forward_constant() {
        let source = "        ldi r17, defined_later\n.equ defined_later = 2\n";
        assert_eq!(asm(source), [0x12, 0xE0]);
    }

    #[test]
    fn test_movw_pair_symbols() {
        let source = "\
.equ dstpair = r1:r0
.equ srcpair = r3:r2
        movw dstpair, srcpair
";
        assert_eq!(asm(source), [0x01, 0x01]);
    }

    #[test]
    fn test_default_shadowed_by_equ() {
        let source = "\
.default x = 3
.equ x = 5
        ldi r17, x
";
        assert_eq!(asm(source), [0x15, 0xE0]);
    }

    #[test]
    fn test_default_alone() {
        assert_eq!(asm(".default x = 3\n        ldi r17, x\n"), [0x13, 0xE0]);
    }

    #[test]
    fn test_backward_local_labels() {
        let source = "\
1: ldi r16, 165
2: dec r16
   brne 2b
";
        assert_eq!(asm(source), [0x05, 0xEA, 0x0A, 0x95, 0xF1, 0xF7]);
    }

    #[test]
    fn test_forward_local_label() {
        assert_eq!(asm("rjmp 1f\n1: nop\n"), [0x00, 0xC0, 0x00, 0x00]);
    }

    #[test]
    fn test_label_arithmetic() {
        let source = "\
start: nop
mid:   nop
finish:
       ldi r16, finish - start
";
        assert_eq!(asm(source), [0x00, 0x00, 0x00, 0x00, 0x04, 0xE0]);
    }

    #[test]
    fn test_order_independence() {
        let a = ".equ a = b + 1\n.equ b = 1\nldi r16, a\nldi r17, b\n";
        let b = ".equ b = 1\n.equ a = b + 1\nldi r16, a\nldi r17, b\n";
        assert_eq!(asm(a), asm(b));
        assert_eq!(asm(a), [0x02, 0xE0, 0x11, 0xE0]);
    }

    #[test]
    fn test_mnemonic_case_insensitive() {
        assert_eq!(asm("LDI R17, 2\n"), asm("ldi r17, 2\n"));
    }

    #[test]
    fn test_char_immediate() {
        assert_eq!(asm("ldi r16, ';'\n"), [0x0B, 0xE3]);
    }

    #[test]
    fn test_lo8_hi8() {
        let source = "\
.equ addr = 0x1234
        ldi r16, lo8(addr)
        ldi r17, hi8(addr)
";
        assert_eq!(asm(source), [0x04, 0xE3, 0x12, 0xE1]);
    }

    #[test]
    fn test_register_alias() {
        assert_eq!(asm(".equ tmp = r16\ninc tmp\n"), [0x03, 0x95]);
    }

    #[test]
    fn test_sfr_builtins() {
        assert_eq!(asm("out PORTB, r16\n"), [0x05, 0xB9]);
        assert_eq!(asm("sbi DDRB, 4\n"), [0x24, 0x9A]);
        assert_eq!(asm("lds r16, TCNT1H\n"), [0x00, 0x91, 0x85, 0x00]);
        assert_eq!(asm("sbrs r16, UDRE0\n"), [0x05, 0xFF]);
    }

    #[test]
    fn test_adiw_sbiw_forms() {
        assert_eq!(asm("adiw r24, 1\n"), [0x01, 0x96]);
        assert_eq!(asm("adiw r25:r24, 63\n"), [0xCF, 0x96]);
        assert_eq!(asm("adiw XL, 1\n"), [0x11, 0x96]);
        assert_eq!(asm("sbiw r31:r30, 2\n"), [0x32, 0x97]);
        assert_eq!(asm_err("adiw r22, 1\n").kind(), ErrorKind::Range);
    }

    #[test]
    fn test_indirect_loads_and_stores() {
        assert_eq!(asm("ld r16, X+\n"), [0x0D, 0x91]);
        assert_eq!(asm("st -Y, r1\n"), [0x1A, 0x92]);
        assert_eq!(asm("ldd r2, Z+5\n"), [0x25, 0x80]);
        assert_eq!(asm("std Y+33, r0\n"), [0x09, 0xA2]);
    }

    #[test]
    fn test_lpm_forms() {
        assert_eq!(
            asm("lpm\nlpm r16, Z\nlpm r16, Z+\n"),
            [0xC8, 0x95, 0x04, 0x91, 0x05, 0x91]
        );
    }

    #[test]
    fn test_jmp_call() {
        let source = "\
jmp init
call init
init: nop
";
        assert_eq!(
            asm(source),
            [0x0C, 0x94, 0x04, 0x00, 0x0E, 0x94, 0x04, 0x00, 0x00, 0x00]
        );
    }

    #[test]
    fn test_data_directives() {
        assert_eq!(
            asm(".byte 1, 2, 'A', \"Hi\"\n.word 0x1234, -2\n"),
            [1, 2, 0x41, 0x48, 0x69, 0x34, 0x12, 0xFE, 0xFF]
        );
    }

    #[test]
    fn test_align_pads_with_zeroes() {
        assert_eq!(
            asm("dec r16\n.align 4\ndec r16\n"),
            [0x0A, 0x95, 0x00, 0x00, 0x0A, 0x95]
        );
    }

    #[test]
    fn test_data_section_reservations() {
        let source = "\
.section .data
buf: .byte 1
.section .text
        lds r16, buf
";
        assert_eq!(asm(source), [0x00, 0x91, 0x00, 0x00]);
    }

    #[test]
    fn test_rept_repetition() {
        assert_eq!(asm(".rept 0\nnop\n.endr\n"), b"");
        assert_eq!(asm(".rept 2\ndec r16\n.endr\n"), [0x0A, 0x95, 0x0A, 0x95]);
    }

    #[test]
    fn test_branch_at_range_limit() {
        let near = "\
    brne far
.rept 63
    nop
.endr
far: nop
";
        let bytes = asm(near);
        assert_eq!(&bytes[0..2], &[0xF9, 0xF5]);
        let too_far = "\
    brne far
.rept 64
    nop
.endr
far: nop
";
        assert_eq!(asm_err(too_far).kind(), ErrorKind::Range);
    }

    #[test]
    fn test_range_errors() {
        assert_eq!(asm_err("ldi r15, 1\n").kind(), ErrorKind::Range);
        assert_eq!(asm_err("cbi 0x1F, 8\n").kind(), ErrorKind::Range);
        assert_eq!(asm_err("in r16, 64\n").kind(), ErrorKind::Range);
        assert_eq!(asm_err(".byte 256\n").kind(), ErrorKind::Range);
    }

    #[test]
    fn test_symbol_errors() {
        assert_eq!(
            asm_err(".equ a = a\nldi r16, a\n").kind(),
            ErrorKind::Symbol
        );
        assert_eq!(
            asm_err(".equ a = 1\n.equ a = 2\n").kind(),
            ErrorKind::Symbol
        );
        assert_eq!(asm_err("foo: nop\nfoo: nop\n").kind(), ErrorKind::Symbol);
        assert_eq!(asm_err("rjmp nowhere\n").kind(), ErrorKind::Symbol);
        assert_eq!(asm_err("set: nop\n").kind(), ErrorKind::Symbol);
        assert!(assemble(".equ r0 = 1\n", Options::default()).is_err());
    }

    #[test]
    fn test_alignment_errors() {
        assert_eq!(asm_err(".byte 1\nnop\n").kind(), ErrorKind::Encode);
        assert_eq!(asm_err(".section .data\nnop\n").kind(), ErrorKind::Encode);
    }

    #[test]
    fn test_vector_table_all_undefined() {
        let image = asm_vectors("");
        assert_eq!(image.len(), 52);
        for pair in image.chunks(2) {
            assert_eq!(pair, [0xFF, 0xCF]);
        }
    }

    #[test]
    fn test_vector_table_with_reset() {
        let image = asm_vectors("RESET: rjmp RESET\n");
        assert_eq!(image.len(), 54);
        // Slot 0 jumps to the handler at byte 52: k = 25.
        assert_eq!(&image[0..2], &[0x19, 0xC0]);
        assert_eq!(&image[2..4], &[0xFF, 0xCF]);
        assert_eq!(&image[52..54], &[0xFF, 0xCF]);
    }

    #[test]
    fn test_vector_table_named_handler() {
        let image = asm_vectors("TIMER1_COMPB_vect: reti\n");
        // Slot 12 at byte 24 jumps to byte 52: k = 13.
        assert_eq!(&image[24..26], &[0x0D, 0xC0]);
        assert_eq!(&image[52..54], &[0x18, 0x95]);
    }

    #[test]
    fn test_vector_count_option() {
        let image = assemble(
            "",
            Options {
                vectors: true,
                vector_count: 4,
            },
        )
        .expect("assembly failed");
        assert_eq!(image.len(), 8);
    }

    #[test]
    fn test_global_is_inert() {
        assert_eq!(asm(".global main\nmain: nop\n"), [0x00, 0x00]);
    }
}
