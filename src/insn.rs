use std::collections::HashMap;

use crate::error::{AsmError, Span};
use crate::parser::{Expr, Operand, PtrReg};
use crate::symbols::{Env, Value};

/// One or two 16-bit opcode words, in emission order.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum EncodedWords {
    One(u16),
    Two(u16, u16),
}

/// Encoding family of a mnemonic. The base opcode has zeroes wherever
/// operand bits are merged in.
#[derive(Clone, Copy, Debug)]
pub enum Op {
    /// `Rd, Rr` with five-bit register fields.
    RdRr(u16),
    /// Single-register aliases of `Rd, Rr` ops (`lsl` = `add Rd, Rd`).
    RdRrSame(u16),
    /// `muls`: both registers in r16..r31.
    Muls,
    /// `mulsu`/`fmul` family: both registers in r16..r23.
    Mulsu(u16),
    /// `Rd, K8` with Rd in r16..r31; `cbr` complements K.
    RdK8 { base: u16, complement: bool },
    /// Single five-bit register field (`com`, `push`, ...).
    Rd(u16),
    /// `ser Rd` with Rd in r16..r31.
    Ser,
    /// `adiw`/`sbiw` on the upper four pairs with K6.
    AdiwSbiw(u16),
    /// `movw` register pair move.
    Movw,
    /// `in Rd, A` with a six-bit I/O address.
    In,
    /// `out A, Rr`.
    Out,
    /// `cbi`/`sbi`/`sbic`/`sbis` with a five-bit I/O address and bit.
    IoBit(u16),
    /// `bst`/`bld`/`sbrc`/`sbrs` with a register and bit.
    RdBit(u16),
    /// `bset`/`bclr` with a flag number.
    Flag(u16),
    /// `brbs`/`brbc` aliases with a fixed SREG bit.
    Branch { bit: u8, set: bool },
    /// `brbs`/`brbc` with explicit bit and k7 target.
    BranchBit(u16),
    /// `rjmp`/`rcall` with a k12 target.
    Rel(u16),
    /// `jmp`/`call`, two words, 22-bit word address.
    Jump(u16),
    /// `lds Rd, k16`, two words.
    Lds,
    /// `sts k16, Rr`, two words.
    Sts,
    /// `ld`/`st` through X, Y or Z with optional increment/decrement.
    LdSt { store: bool },
    /// `ldd`/`std` with a six-bit displacement off Y or Z.
    LddStd { store: bool },
    /// `lpm`/`elpm`: implied, `Rd, Z` and `Rd, Z+` forms.
    Lpm { implied: u16, z: u16, z_inc: u16 },
    /// No operands, fixed word.
    Implied(u16),
}

#[derive(Clone, Copy, Debug)]
pub struct InsnSpec {
    /// Opcode length in 16-bit words.
    pub words: u32,
    pub op: Op,
}

macro_rules! define_instructions {
    ($table:expr, { $($name:literal => ($words:expr, $op:expr)),* $(,)? }) => {
        $( $table.insert($name, InsnSpec { words: $words, op: $op }); )*
    };
}

/// Builds the mnemonic table for the classic AVR instruction set.
pub fn instruction_set() -> HashMap<&'static str, InsnSpec> {
    use self::Op::*;

    let mut table = HashMap::new();
    define_instructions!(table, {
        "add"    => (1, RdRr(0x0C00)),
        "adc"    => (1, RdRr(0x1C00)),
        "sub"    => (1, RdRr(0x1800)),
        "sbc"    => (1, RdRr(0x0800)),
        "and"    => (1, RdRr(0x2000)),
        "or"     => (1, RdRr(0x2800)),
        "eor"    => (1, RdRr(0x2400)),
        "cp"     => (1, RdRr(0x1400)),
        "cpc"    => (1, RdRr(0x0400)),
        "cpse"   => (1, RdRr(0x1000)),
        "mov"    => (1, RdRr(0x2C00)),
        "mul"    => (1, RdRr(0x9C00)),
        "lsl"    => (1, RdRrSame(0x0C00)),
        "rol"    => (1, RdRrSame(0x1C00)),
        "tst"    => (1, RdRrSame(0x2000)),
        "clr"    => (1, RdRrSame(0x2400)),
        "muls"   => (1, Muls),
        "mulsu"  => (1, Mulsu(0x0300)),
        "fmul"   => (1, Mulsu(0x0308)),
        "fmuls"  => (1, Mulsu(0x0380)),
        "fmulsu" => (1, Mulsu(0x0388)),
        "ldi"    => (1, RdK8 { base: 0xE000, complement: false }),
        "cpi"    => (1, RdK8 { base: 0x3000, complement: false }),
        "subi"   => (1, RdK8 { base: 0x5000, complement: false }),
        "sbci"   => (1, RdK8 { base: 0x4000, complement: false }),
        "andi"   => (1, RdK8 { base: 0x7000, complement: false }),
        "ori"    => (1, RdK8 { base: 0x6000, complement: false }),
        "sbr"    => (1, RdK8 { base: 0x6000, complement: false }),
        "cbr"    => (1, RdK8 { base: 0x7000, complement: true }),
        "ser"    => (1, Ser),
        "com"    => (1, Rd(0x9400)),
        "neg"    => (1, Rd(0x9401)),
        "swap"   => (1, Rd(0x9402)),
        "inc"    => (1, Rd(0x9403)),
        "asr"    => (1, Rd(0x9405)),
        "lsr"    => (1, Rd(0x9406)),
        "ror"    => (1, Rd(0x9407)),
        "dec"    => (1, Rd(0x940A)),
        "pop"    => (1, Rd(0x900F)),
        "push"   => (1, Rd(0x920F)),
        "adiw"   => (1, AdiwSbiw(0x9600)),
        "sbiw"   => (1, AdiwSbiw(0x9700)),
        "movw"   => (1, Movw),
        "in"     => (1, In),
        "out"    => (1, Out),
        "cbi"    => (1, IoBit(0x9800)),
        "sbic"   => (1, IoBit(0x9900)),
        "sbi"    => (1, IoBit(0x9A00)),
        "sbis"   => (1, IoBit(0x9B00)),
        "bld"    => (1, RdBit(0xF800)),
        "bst"    => (1, RdBit(0xFA00)),
        "sbrc"   => (1, RdBit(0xFC00)),
        "sbrs"   => (1, RdBit(0xFE00)),
        "bset"   => (1, Flag(0x9408)),
        "bclr"   => (1, Flag(0x9488)),
        "brbs"   => (1, BranchBit(0xF000)),
        "brbc"   => (1, BranchBit(0xF400)),
        "brcs"   => (1, Branch { bit: 0, set: true }),
        "brlo"   => (1, Branch { bit: 0, set: true }),
        "brcc"   => (1, Branch { bit: 0, set: false }),
        "brsh"   => (1, Branch { bit: 0, set: false }),
        "breq"   => (1, Branch { bit: 1, set: true }),
        "brne"   => (1, Branch { bit: 1, set: false }),
        "brmi"   => (1, Branch { bit: 2, set: true }),
        "brpl"   => (1, Branch { bit: 2, set: false }),
        "brvs"   => (1, Branch { bit: 3, set: true }),
        "brvc"   => (1, Branch { bit: 3, set: false }),
        "brlt"   => (1, Branch { bit: 4, set: true }),
        "brge"   => (1, Branch { bit: 4, set: false }),
        "brhs"   => (1, Branch { bit: 5, set: true }),
        "brhc"   => (1, Branch { bit: 5, set: false }),
        "brts"   => (1, Branch { bit: 6, set: true }),
        "brtc"   => (1, Branch { bit: 6, set: false }),
        "brie"   => (1, Branch { bit: 7, set: true }),
        "brid"   => (1, Branch { bit: 7, set: false }),
        "rjmp"   => (1, Rel(0xC000)),
        "rcall"  => (1, Rel(0xD000)),
        "jmp"    => (2, Jump(0x940C)),
        "call"   => (2, Jump(0x940E)),
        "lds"    => (2, Lds),
        "sts"    => (2, Sts),
        "ld"     => (1, LdSt { store: false }),
        "st"     => (1, LdSt { store: true }),
        "ldd"    => (1, LddStd { store: false }),
        "std"    => (1, LddStd { store: true }),
        "lpm"    => (1, Lpm { implied: 0x95C8, z: 0x9004, z_inc: 0x9005 }),
        "elpm"   => (1, Lpm { implied: 0x95D8, z: 0x9006, z_inc: 0x9007 }),
        "spm"    => (1, Implied(0x95E8)),
        "nop"    => (1, Implied(0x0000)),
        "ret"    => (1, Implied(0x9508)),
        "reti"   => (1, Implied(0x9518)),
        "ijmp"   => (1, Implied(0x9409)),
        "icall"  => (1, Implied(0x9509)),
        "sleep"  => (1, Implied(0x9588)),
        "break"  => (1, Implied(0x9598)),
        "wdr"    => (1, Implied(0x95A8)),
        "sec"    => (1, Implied(0x9408)),
        "sez"    => (1, Implied(0x9418)),
        "sen"    => (1, Implied(0x9428)),
        "sev"    => (1, Implied(0x9438)),
        "ses"    => (1, Implied(0x9448)),
        "seh"    => (1, Implied(0x9458)),
        "set"    => (1, Implied(0x9468)),
        "sei"    => (1, Implied(0x9478)),
        "clc"    => (1, Implied(0x9488)),
        "clz"    => (1, Implied(0x9498)),
        "cln"    => (1, Implied(0x94A8)),
        "clv"    => (1, Implied(0x94B8)),
        "cls"    => (1, Implied(0x94C8)),
        "clh"    => (1, Implied(0x94D8)),
        "clt"    => (1, Implied(0x94E8)),
        "cli"    => (1, Implied(0x94F8)),
    });
    table
}

fn expect_operands(
    mnemonic: &str,
    operands: &[Operand],
    n: usize,
    span: Span,
) -> Result<(), AsmError> {
    if operands.len() == n {
        Ok(())
    } else {
        Err(AsmError::encode(
            format!(
                "{} expects {} operand{}, got {}",
                mnemonic,
                n,
                if n == 1 { "" } else { "s" },
                operands.len()
            ),
            span,
        ))
    }
}

fn reg(operand: &Operand, env: &Env, span: Span) -> Result<u8, AsmError> {
    match operand {
        Operand::Reg(n) => Ok(*n),
        Operand::Expr(Expr::Ident(name)) => match env.register_binding(name, span)? {
            Value::Reg(n) => Ok(n),
            _ => Err(AsmError::encode(
                format!("`{}` names a register pair, expected a single register", name),
                span,
            )),
        },
        _ => Err(AsmError::encode("expected a register operand", span)),
    }
}

fn reg_window(
    operand: &Operand,
    env: &Env,
    span: Span,
    mnemonic: &str,
    lo: u8,
    hi: u8,
) -> Result<u8, AsmError> {
    let r = reg(operand, env, span)?;
    if r < lo || r > hi {
        return Err(AsmError::range(
            format!("{} requires a register in r{}..r{}, got r{}", mnemonic, lo, hi, r),
            span,
        ));
    }
    Ok(r)
}

/// Resolves a register pair operand to its pair index (`r1:r0` is 0).
/// A bare even register names the pair it starts.
fn pair_index(operand: &Operand, env: &Env, span: Span) -> Result<u16, AsmError> {
    let (hi, lo) = match operand {
        Operand::Pair { hi, lo } => (*hi, *lo),
        Operand::Reg(n) => {
            if n % 2 != 0 {
                return Err(AsmError::range(
                    format!("r{} is odd and cannot start a register pair", n),
                    span,
                ));
            }
            (n + 1, *n)
        }
        Operand::Expr(Expr::Ident(name)) => match env.register_binding(name, span)? {
            Value::Pair { hi, lo } => (hi, lo),
            Value::Reg(n) if n % 2 == 0 => (n + 1, n),
            Value::Reg(n) => {
                return Err(AsmError::range(
                    format!("r{} is odd and cannot start a register pair", n),
                    span,
                ));
            }
            Value::Expr(_) => unreachable!("register_binding returns registers"),
        },
        _ => return Err(AsmError::encode("expected a register pair operand", span)),
    };
    if hi != lo + 1 || lo % 2 != 0 {
        return Err(AsmError::parse(
            format!("r{}:r{} is not an adjacent even/odd register pair", hi, lo),
            span,
        ));
    }
    Ok(u16::from(lo) / 2)
}

fn constant(operand: &Operand, env: &Env, span: Span) -> Result<i64, AsmError> {
    match operand {
        Operand::Expr(e) => env.eval(e, span),
        // A bare pointer name may shadow an ordinary symbol.
        Operand::Ptr { name, .. } => env.resolve(name, span),
        _ => Err(AsmError::encode("expected a constant expression", span)),
    }
}

fn const_unsigned(
    operand: &Operand,
    env: &Env,
    span: Span,
    bits: u32,
    what: &str,
) -> Result<u16, AsmError> {
    let v = constant(operand, env, span)?;
    let max = (1i64 << bits) - 1;
    if v < 0 || v > max {
        return Err(AsmError::range(
            format!("{} {} out of range 0..{}", what, v, max),
            span,
        ));
    }
    Ok(v as u16)
}

fn bit3(operand: &Operand, env: &Env, span: Span, what: &str) -> Result<u16, AsmError> {
    const_unsigned(operand, env, span, 3, what)
}

/// PC-relative displacement in words: the branch target is measured
/// from the address following the instruction.
fn branch_offset(
    operand: &Operand,
    env: &Env,
    pc: u32,
    bits: u32,
    span: Span,
) -> Result<u16, AsmError> {
    let target = constant(operand, env, span)?;
    let delta = target - (i64::from(pc) + 2);
    if delta % 2 != 0 {
        return Err(AsmError::range(
            format!("branch target {} is not word-aligned", target),
            span,
        ));
    }
    let k = delta / 2;
    let max = 1i64 << (bits - 1);
    if k < -max || k >= max {
        return Err(AsmError::range(
            format!(
                "branch displacement {} words out of range {}..{}",
                k,
                -max,
                max - 1
            ),
            span,
        ));
    }
    Ok((k as u16) & ((1u16 << bits) - 1))
}

fn rd_rr(base: u16, d: u8, r: u8) -> u16 {
    base | (u16::from(r) & 0x10) << 5 | u16::from(d) << 4 | u16::from(r) & 0x0F
}

fn ld_st_word(
    store: bool,
    mode: &Operand,
    env: &Env,
    span: Span,
) -> Result<u16, AsmError> {
    let base = match (store, mode) {
        (false, Operand::Ptr { reg: PtrReg::X, .. }) => 0x900C,
        (false, Operand::PtrPostInc(PtrReg::X)) => 0x900D,
        (false, Operand::PtrPreDec(PtrReg::X)) => 0x900E,
        (false, Operand::Ptr { reg: PtrReg::Y, .. }) => 0x8008,
        (false, Operand::PtrPostInc(PtrReg::Y)) => 0x9009,
        (false, Operand::PtrPreDec(PtrReg::Y)) => 0x900A,
        (false, Operand::Ptr { reg: PtrReg::Z, .. }) => 0x8000,
        (false, Operand::PtrPostInc(PtrReg::Z)) => 0x9001,
        (false, Operand::PtrPreDec(PtrReg::Z)) => 0x9002,
        (true, Operand::Ptr { reg: PtrReg::X, .. }) => 0x920C,
        (true, Operand::PtrPostInc(PtrReg::X)) => 0x920D,
        (true, Operand::PtrPreDec(PtrReg::X)) => 0x920E,
        (true, Operand::Ptr { reg: PtrReg::Y, .. }) => 0x8208,
        (true, Operand::PtrPostInc(PtrReg::Y)) => 0x9209,
        (true, Operand::PtrPreDec(PtrReg::Y)) => 0x920A,
        (true, Operand::Ptr { reg: PtrReg::Z, .. }) => 0x8200,
        (true, Operand::PtrPostInc(PtrReg::Z)) => 0x9201,
        (true, Operand::PtrPreDec(PtrReg::Z)) => 0x9202,
        (_, Operand::PtrDisp(..)) => return ldd_std_word(store, mode, env, span),
        _ => {
            return Err(AsmError::encode(
                "expected an X, Y or Z indirect operand",
                span,
            ))
        }
    };
    Ok(base)
}

fn ldd_std_word(
    store: bool,
    mode: &Operand,
    env: &Env,
    span: Span,
) -> Result<u16, AsmError> {
    let (ptr, q_expr) = match mode {
        Operand::PtrDisp(ptr, q) => (*ptr, q),
        _ => {
            return Err(AsmError::encode(
                "expected a Y+q or Z+q displacement operand",
                span,
            ))
        }
    };
    let base = match (store, ptr) {
        (false, PtrReg::Y) => 0x8008,
        (false, PtrReg::Z) => 0x8000,
        (true, PtrReg::Y) => 0x8208,
        (true, PtrReg::Z) => 0x8200,
        (_, PtrReg::X) => {
            return Err(AsmError::range(
                "X does not support a displacement",
                span,
            ))
        }
    };
    let q = const_unsigned(&Operand::Expr(q_expr.clone()), env, span, 6, "displacement")?;
    Ok(base | (q & 0x07) | (q & 0x18) << 7 | (q & 0x20) << 8)
}

/// Encodes one instruction. `pc` is the byte address of the
/// instruction itself.
pub fn encode(
    spec: &InsnSpec,
    mnemonic: &str,
    operands: &[Operand],
    env: &Env,
    pc: u32,
    span: Span,
) -> Result<EncodedWords, AsmError> {
    use self::EncodedWords::{One, Two};

    match spec.op {
        Op::RdRr(base) => {
            expect_operands(mnemonic, operands, 2, span)?;
            let d = reg(&operands[0], env, span)?;
            let r = reg(&operands[1], env, span)?;
            Ok(One(rd_rr(base, d, r)))
        }
        Op::RdRrSame(base) => {
            expect_operands(mnemonic, operands, 1, span)?;
            let d = reg(&operands[0], env, span)?;
            Ok(One(rd_rr(base, d, d)))
        }
        Op::Muls => {
            expect_operands(mnemonic, operands, 2, span)?;
            let d = reg_window(&operands[0], env, span, mnemonic, 16, 31)?;
            let r = reg_window(&operands[1], env, span, mnemonic, 16, 31)?;
            Ok(One(0x0200 | u16::from(d - 16) << 4 | u16::from(r - 16)))
        }
        Op::Mulsu(base) => {
            expect_operands(mnemonic, operands, 2, span)?;
            let d = reg_window(&operands[0], env, span, mnemonic, 16, 23)?;
            let r = reg_window(&operands[1], env, span, mnemonic, 16, 23)?;
            Ok(One(base | u16::from(d - 16) << 4 | u16::from(r - 16)))
        }
        Op::RdK8 { base, complement } => {
            expect_operands(mnemonic, operands, 2, span)?;
            let d = reg_window(&operands[0], env, span, mnemonic, 16, 31)?;
            let mut k = const_unsigned(&operands[1], env, span, 8, "immediate")?;
            if complement {
                k = !k & 0xFF;
            }
            Ok(One(base | (k & 0xF0) << 4 | u16::from(d - 16) << 4 | k & 0x0F))
        }
        Op::Rd(base) => {
            expect_operands(mnemonic, operands, 1, span)?;
            let d = reg(&operands[0], env, span)?;
            Ok(One(base | u16::from(d) << 4))
        }
        Op::Ser => {
            expect_operands(mnemonic, operands, 1, span)?;
            let d = reg_window(&operands[0], env, span, mnemonic, 16, 31)?;
            Ok(One(0xEF0F | u16::from(d - 16) << 4))
        }
        Op::AdiwSbiw(base) => {
            expect_operands(mnemonic, operands, 2, span)?;
            let p = pair_index(&operands[0], env, span)?;
            if p < 12 {
                return Err(AsmError::range(
                    format!("{} operates on the r24..r31 pairs", mnemonic),
                    span,
                ));
            }
            let k = const_unsigned(&operands[1], env, span, 6, "immediate")?;
            Ok(One(base | (p - 12) << 4 | (k & 0x30) << 2 | k & 0x0F))
        }
        Op::Movw => {
            expect_operands(mnemonic, operands, 2, span)?;
            let d = pair_index(&operands[0], env, span)?;
            let r = pair_index(&operands[1], env, span)?;
            Ok(One(0x0100 | d << 4 | r))
        }
        Op::In => {
            expect_operands(mnemonic, operands, 2, span)?;
            let d = reg(&operands[0], env, span)?;
            let a = const_unsigned(&operands[1], env, span, 6, "I/O address")?;
            Ok(One(0xB000 | (a & 0x30) << 5 | u16::from(d) << 4 | a & 0x0F))
        }
        Op::Out => {
            expect_operands(mnemonic, operands, 2, span)?;
            let a = const_unsigned(&operands[0], env, span, 6, "I/O address")?;
            let r = reg(&operands[1], env, span)?;
            Ok(One(0xB800 | (a & 0x30) << 5 | u16::from(r) << 4 | a & 0x0F))
        }
        Op::IoBit(base) => {
            expect_operands(mnemonic, operands, 2, span)?;
            let a = const_unsigned(&operands[0], env, span, 5, "I/O address")?;
            let b = bit3(&operands[1], env, span, "bit number")?;
            Ok(One(base | a << 3 | b))
        }
        Op::RdBit(base) => {
            expect_operands(mnemonic, operands, 2, span)?;
            let d = reg(&operands[0], env, span)?;
            let b = bit3(&operands[1], env, span, "bit number")?;
            Ok(One(base | u16::from(d) << 4 | b))
        }
        Op::Flag(base) => {
            expect_operands(mnemonic, operands, 1, span)?;
            let s = bit3(&operands[0], env, span, "flag number")?;
            Ok(One(base | s << 4))
        }
        Op::Branch { bit, set } => {
            expect_operands(mnemonic, operands, 1, span)?;
            let base = if set { 0xF000 } else { 0xF400 };
            let k = branch_offset(&operands[0], env, pc, 7, span)?;
            Ok(One(base | k << 3 | u16::from(bit)))
        }
        Op::BranchBit(base) => {
            expect_operands(mnemonic, operands, 2, span)?;
            let s = bit3(&operands[0], env, span, "flag number")?;
            let k = branch_offset(&operands[1], env, pc, 7, span)?;
            Ok(One(base | k << 3 | s))
        }
        Op::Rel(base) => {
            expect_operands(mnemonic, operands, 1, span)?;
            let k = branch_offset(&operands[0], env, pc, 12, span)?;
            Ok(One(base | k))
        }
        Op::Jump(base) => {
            expect_operands(mnemonic, operands, 1, span)?;
            let target = constant(&operands[0], env, span)?;
            if target % 2 != 0 {
                return Err(AsmError::range(
                    format!("jump target {} is not word-aligned", target),
                    span,
                ));
            }
            let word = target / 2;
            if word < 0 || word >= 1i64 << 22 {
                return Err(AsmError::range(
                    format!("jump target {} out of 22-bit range", target),
                    span,
                ));
            }
            let hi = base | ((word >> 17) as u16 & 0x1F) << 4 | (word >> 16) as u16 & 1;
            Ok(Two(hi, word as u16))
        }
        Op::Lds => {
            expect_operands(mnemonic, operands, 2, span)?;
            let d = reg(&operands[0], env, span)?;
            let k = const_unsigned(&operands[1], env, span, 16, "data address")?;
            Ok(Two(0x9000 | u16::from(d) << 4, k))
        }
        Op::Sts => {
            expect_operands(mnemonic, operands, 2, span)?;
            let k = const_unsigned(&operands[0], env, span, 16, "data address")?;
            let r = reg(&operands[1], env, span)?;
            Ok(Two(0x9200 | u16::from(r) << 4, k))
        }
        Op::LdSt { store } => {
            expect_operands(mnemonic, operands, 2, span)?;
            let (reg_at, mode_at) = if store { (1, 0) } else { (0, 1) };
            let d = reg(&operands[reg_at], env, span)?;
            let base = ld_st_word(store, &operands[mode_at], env, span)?;
            Ok(One(base | u16::from(d) << 4))
        }
        Op::LddStd { store } => {
            expect_operands(mnemonic, operands, 2, span)?;
            let (reg_at, mode_at) = if store { (1, 0) } else { (0, 1) };
            let d = reg(&operands[reg_at], env, span)?;
            let base = ldd_std_word(store, &operands[mode_at], env, span)?;
            Ok(One(base | u16::from(d) << 4))
        }
        Op::Lpm { implied, z, z_inc } => match operands.len() {
            0 => Ok(One(implied)),
            2 => {
                let d = reg(&operands[0], env, span)?;
                let base = match &operands[1] {
                    Operand::Ptr { reg: PtrReg::Z, .. } => z,
                    Operand::PtrPostInc(PtrReg::Z) => z_inc,
                    _ => {
                        return Err(AsmError::encode(
                            format!("{} takes Z or Z+ as its source", mnemonic),
                            span,
                        ))
                    }
                };
                Ok(One(base | u16::from(d) << 4))
            }
            n => Err(AsmError::encode(
                format!("{} expects 0 or 2 operands, got {}", mnemonic, n),
                span,
            )),
        },
        Op::Implied(word) => {
            expect_operands(mnemonic, operands, 0, span)?;
            Ok(One(word))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn span() -> Span {
        Span::new(1, 1)
    }

    fn encode_one(mnemonic: &str, operands: &[Operand]) -> EncodedWords {
        let table = instruction_set();
        let env = Env::new();
        let spec = table.get(mnemonic).expect("unknown mnemonic");
        encode(spec, mnemonic, operands, &env, 0, span()).expect("encoding failed")
    }

    #[test]
    fn test_rd_rr_field_split() {
        // r field straddles the opcode: bit 9 and bits 3..0.
        assert_eq!(
            encode_one("add", &[Operand::Reg(1), Operand::Reg(2)]),
            EncodedWords::One(0x0C12)
        );
        assert_eq!(
            encode_one("adc", &[Operand::Reg(17), Operand::Reg(16)]),
            EncodedWords::One(0x1F10)
        );
        assert_eq!(
            encode_one("mul", &[Operand::Reg(16), Operand::Reg(10)]),
            EncodedWords::One(0x9D0A)
        );
    }

    #[test]
    fn test_pseudo_aliases() {
        assert_eq!(
            encode_one("lsl", &[Operand::Reg(5)]),
            encode_one("add", &[Operand::Reg(5), Operand::Reg(5)])
        );
        assert_eq!(
            encode_one("clr", &[Operand::Reg(20)]),
            encode_one("eor", &[Operand::Reg(20), Operand::Reg(20)])
        );
    }

    #[test]
    fn test_immediate_nibbles() {
        assert_eq!(
            encode_one("ldi", &[Operand::Reg(16), Operand::Expr(Expr::Int(0xA5))]),
            EncodedWords::One(0xEA05)
        );
        // cbr assembles as andi with the complemented mask.
        assert_eq!(
            encode_one("cbr", &[Operand::Reg(16), Operand::Expr(Expr::Int(0xFF))]),
            EncodedWords::One(0x7000)
        );
    }

    #[test]
    fn test_two_word_forms() {
        assert_eq!(
            encode_one("jmp", &[Operand::Expr(Expr::Int(0))]),
            EncodedWords::Two(0x940C, 0x0000)
        );
        assert_eq!(
            encode_one("lds", &[Operand::Reg(16), Operand::Expr(Expr::Int(0x0100))]),
            EncodedWords::Two(0x9100, 0x0100)
        );
        assert_eq!(
            encode_one("sts", &[Operand::Expr(Expr::Int(0x0100)), Operand::Reg(16)]),
            EncodedWords::Two(0x9300, 0x0100)
        );
    }

    #[test]
    fn test_displacement_bits() {
        // q is scattered over bits 13, 11..10 and 2..0.
        assert_eq!(
            encode_one(
                "std",
                &[
                    Operand::PtrDisp(PtrReg::Y, Expr::Int(33)),
                    Operand::Reg(0)
                ]
            ),
            EncodedWords::One(0xA209)
        );
        assert_eq!(
            encode_one(
                "ldd",
                &[Operand::Reg(2), Operand::PtrDisp(PtrReg::Z, Expr::Int(5))]
            ),
            EncodedWords::One(0x8025)
        );
    }

    #[test]
    fn test_range_errors() {
        let table = instruction_set();
        let env = Env::new();
        let ldi = table.get("ldi").unwrap();
        assert!(encode(
            ldi,
            "ldi",
            &[Operand::Reg(15), Operand::Expr(Expr::Int(1))],
            &env,
            0,
            span()
        )
        .is_err());
        assert!(encode(
            ldi,
            "ldi",
            &[Operand::Reg(16), Operand::Expr(Expr::Int(256))],
            &env,
            0,
            span()
        )
        .is_err());
        let cbi = table.get("cbi").unwrap();
        assert!(encode(
            cbi,
            "cbi",
            &[Operand::Expr(Expr::Int(32)), Operand::Expr(Expr::Int(0))],
            &env,
            0,
            span()
        )
        .is_err());
    }
}
