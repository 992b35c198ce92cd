//! An assembler for the 8-bit AVR instruction set.
//!
//! The library turns assembly source text into a flat binary image:
//! tokens (`lexer`) are parsed into labels, directives and instructions
//! (`parser`), symbol definitions accumulate in an environment that
//! resolves names lazily and order-independently (`symbols`), a layout
//! walk assigns every label a byte address, and the instruction table
//! (`insn`) encodes each mnemonic/operand combination into its 16-bit
//! or 32-bit little-endian opcode (`avr_asm`).

#![recursion_limit = "1024"]

#[macro_use]
extern crate combine;

pub mod avr_asm;
pub mod error;
pub mod insn;
pub mod lexer;
pub mod parser;
pub mod symbols;
