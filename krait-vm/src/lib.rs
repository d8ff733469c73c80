//! Embeddable eBPF virtual machine and JIT compiler.
//!
//! A host process loads a bytecode program into a [`Vm`], optionally
//! registers helper functions, and runs it either through the interpreter
//! ([`Vm::exec`]) or as native code ([`Vm::compile`]) on x86-64 and AArch64.
//! Programs from untrusted producers pass a static validator before any
//! execution path sees them; emitted code can blind every immediate against
//! code-reuse attacks.

#![warn(missing_docs)]
#![deny(unused_must_use)]

pub mod consts;
pub mod error;
mod helpers;
mod interpreter;
mod jit;
mod program;
mod validator;
mod vm;

pub use helpers::{
    BoundsCheck, DataRelocation, DebugCallout, Dispatcher, DispatcherValidator, Helper,
    StackUsageCalculator,
};
pub use jit::{BasicJitFn, ExtendedJitFn, JitFn, JitMode, TranslateOutput};
pub use vm::Vm;

#[doc(no_inline)]
pub use krait_asm;

pub mod prelude {
    //! Everything an embedder usually needs.

    #[doc(no_inline)]
    pub use krait_asm::{op, opcode, Instruction, RegisterId};

    pub use crate::error::{ConfigError, ExecError, LoadError, TranslateError, VmError};
    pub use crate::helpers::{Dispatcher, Helper};
    pub use crate::jit::{BasicJitFn, ExtendedJitFn, JitFn, JitMode};
    pub use crate::vm::Vm;
}
