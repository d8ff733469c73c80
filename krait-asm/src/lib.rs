//! Instruction set primitives of the Krait eBPF virtual machine.
//!
//! This crate knows what the bytecode *is*: the 64-bit instruction record,
//! the opcode grid, and the per-opcode rules for which fields may be
//! populated. It deliberately knows nothing about executing it.

#![cfg_attr(docsrs, feature(doc_cfg))]
#![warn(missing_docs)]
#![deny(unused_must_use)]

mod instruction;
pub mod op;
pub mod opcode;
mod table;

#[cfg(test)]
mod encoding_tests;

pub use instruction::{join_wide_immediate, uses_reg_source, wide_immediate, Instruction};
pub use table::{field_checks, FieldCheck, FieldChecks, FieldKind};

/// Identifier of a bytecode register.
pub type RegisterId = u8;

/// The call return register.
pub const REG_RET: RegisterId = 0;
/// First call-argument register; arguments occupy `r1..=r5`.
pub const REG_ARG_FIRST: RegisterId = 1;
/// Last call-argument register.
pub const REG_ARG_LAST: RegisterId = 5;
/// First callee-saved register; `r6..=r9` survive local calls.
pub const REG_SAVED_FIRST: RegisterId = 6;
/// Last callee-saved register.
pub const REG_SAVED_LAST: RegisterId = 9;
/// The read-only frame pointer.
pub const REG_FRAME: RegisterId = 10;
/// Number of addressable registers.
pub const REGISTER_COUNT: usize = 11;
