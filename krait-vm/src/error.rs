//! Error types of the virtual machine.
//!
//! Four kinds surface to the embedder, mirroring the phases of a program's
//! life: [`LoadError`] from validation, [`TranslateError`] from the JIT,
//! [`ExecError`] from a run, and [`ConfigError`] from misuse of the
//! lifecycle. [`VmError`] is the umbrella the public operations return.

use crate::jit::JitMode;

use thiserror::Error;

/// Rejection of a program at load time.
///
/// The failing instruction aborts validation; the partially copied program is
/// discarded and the machine returns to the unloaded state.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[non_exhaustive]
pub enum LoadError {
    /// The byte buffer does not hold whole instruction records.
    #[error("program length {0} is not a multiple of the instruction size")]
    UnalignedProgram(usize),
    /// The program exceeds the configured instruction cap.
    #[error("too many instructions (maximum {max})")]
    TooManyInstructions {
        /// The configured cap.
        max: u32,
    },
    /// The opcode byte is not part of the instruction set.
    #[error("unknown opcode 0x{opcode:02x} at PC {pc}")]
    UnknownOpcode {
        /// Offending opcode byte.
        opcode: u8,
        /// Index of the offending instruction.
        pc: u32,
    },
    /// A field carries a value its opcode does not permit.
    #[error("invalid {field} {value} for instruction 0x{opcode:02x}")]
    InvalidField {
        /// Which field failed.
        field: &'static str,
        /// The rejected value.
        value: i64,
        /// The opcode whose rule rejected it.
        opcode: u8,
    },
    /// A wide load begins on the last instruction slot.
    #[error("incomplete lddw at PC {pc}")]
    IncompleteWideLoad {
        /// Index of the wide load.
        pc: u32,
    },
    /// The continuation slot of a wide load carries a non-zero opcode.
    #[error("malformed lddw at PC {pc}")]
    MalformedWideLoad {
        /// Index of the wide load's first slot.
        pc: u32,
    },
    /// A helper call names a slot that is neither registered nor accepted by
    /// the external dispatcher's validator.
    #[error("call to unknown helper {helper} at PC {pc}")]
    UnknownHelper {
        /// The requested helper index.
        helper: i64,
        /// Index of the call instruction.
        pc: u32,
    },
    /// A local call does not land on a local-function entry.
    #[error("call to invalid local function target {target} at PC {pc}")]
    InvalidLocalCall {
        /// Computed target index.
        target: i64,
        /// Index of the call instruction.
        pc: u32,
    },
    /// A branch target leaves the program.
    #[error("jump out of bounds at PC {pc} (target {target})")]
    JumpOutOfBounds {
        /// Index of the branch.
        pc: u32,
        /// Computed target index.
        target: i64,
    },
    /// The last instruction is not `EXIT`.
    #[error("program does not end with EXIT")]
    NoTerminalExit,
    /// `CALLX` appears but the selected translator cannot emit it.
    #[error("callx at PC {pc} is not supported on this target")]
    CallxUnsupported {
        /// Index of the instruction.
        pc: u32,
    },
    /// The stack-usage calculator returned an unusable value.
    #[error("local function (at PC {pc}) has improperly sized stack use ({usage})")]
    BadStackUsage {
        /// Entry of the local function.
        pc: u32,
        /// The rejected value.
        usage: u16,
    },
}

/// Failure while translating a loaded program to native code.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[non_exhaustive]
pub enum TranslateError {
    /// The jump fixup table overflowed.
    #[error("too many jump instructions")]
    TooManyJumps,
    /// The literal-load fixup table overflowed.
    #[error("too many load instructions")]
    TooManyLoads,
    /// The PC-relative address fixup table overflowed.
    #[error("too many address calculations")]
    TooManyLeas,
    /// The local-call fixup table overflowed.
    #[error("too many local calls")]
    TooManyLocalCalls,
    /// The output buffer cannot hold the translation.
    #[error("target buffer too small")]
    NotEnoughSpace,
    /// An instruction that validation accepts but this back-end cannot emit.
    #[error("unexpected instruction at PC {pc}: opcode 0x{opcode:02x}")]
    UnexpectedInstruction {
        /// Index of the instruction.
        pc: u32,
        /// Its opcode.
        opcode: u8,
    },
    /// An opcode with no translation rule.
    #[error("unknown instruction at PC {pc}: opcode 0x{opcode:02x}")]
    UnknownInstruction {
        /// Index of the instruction.
        pc: u32,
        /// Its opcode.
        opcode: u8,
    },
    /// A fixup entry could not be resolved to a final location.
    #[error("could not patch the relative addresses in the emitted code")]
    UnresolvedPatch,
    /// No JIT back-end exists for the build target.
    #[error("jit is not supported on this target")]
    UnsupportedTarget,
    /// The kernel refused the executable mapping.
    #[error("executable memory allocation failed (errno {errno})")]
    Memory {
        /// The reported `errno`.
        errno: i32,
    },
}

/// Failure during interpretation.
///
/// The machine stays loaded and reusable after any of these.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[non_exhaustive]
pub enum ExecError {
    /// A load or store failed the bounds check.
    #[error("out of bounds memory access at PC {pc} (addr 0x{addr:x}, size {size})")]
    OutOfBounds {
        /// Index of the faulting instruction.
        pc: u32,
        /// The effective address.
        addr: u64,
        /// Width of the access in bytes.
        size: u64,
    },
    /// The configured per-run instruction budget ran out.
    #[error("instruction limit exceeded")]
    InstructionLimitExceeded,
    /// Local calls nested deeper than the frame stack allows.
    #[error("call depth exceeded at PC {pc}")]
    CallDepthExceeded {
        /// Index of the call that overflowed.
        pc: u32,
    },
    /// Fetched an instruction with no execution rule.
    #[error("unknown opcode 0x{opcode:02x} at PC {pc}")]
    UnknownOpcode {
        /// The opcode byte.
        opcode: u8,
        /// Index of the instruction.
        pc: u32,
    },
    /// A register-indexed call named an empty helper slot.
    #[error("unknown helper {helper} at PC {pc}")]
    UnknownHelper {
        /// The requested index.
        helper: u64,
        /// Index of the call.
        pc: u32,
    },
    /// An atomic operation on an address that is not naturally aligned.
    #[error("misaligned atomic access at PC {pc} (addr 0x{addr:x})")]
    MisalignedAtomic {
        /// Index of the instruction.
        pc: u32,
        /// The effective address.
        addr: u64,
    },
    /// Strict checking caught a read of a never-written register.
    #[error("read of uninitialized register r{reg} at PC {pc}")]
    UninitializedRegister {
        /// The register.
        reg: u8,
        /// Index of the instruction.
        pc: u32,
    },
    /// Strict checking caught an out-of-range shift amount.
    #[error("shift amount {amount} out of range at PC {pc}")]
    ShiftOutOfRange {
        /// The requested amount.
        amount: u64,
        /// Index of the instruction.
        pc: u32,
    },
}

/// Misuse of the machine lifecycle or a setter argument.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[non_exhaustive]
pub enum ConfigError {
    /// The operation requires the unloaded state.
    #[error("operation requires that no program is loaded")]
    ProgramLoaded,
    /// The operation requires a loaded program.
    #[error("operation requires a loaded program")]
    NoProgram,
    /// A helper index outside `0..64`.
    #[error("helper index {0} out of range")]
    HelperIndexOutOfRange(u32),
    /// The program was already compiled in a different mode.
    #[error("program already compiled in {0:?} mode")]
    JitModeMismatch(JitMode),
    /// A setter argument that cannot be honoured.
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),
}

/// Umbrella error returned by the public operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum VmError {
    /// See [`LoadError`].
    #[error(transparent)]
    Load(#[from] LoadError),
    /// See [`TranslateError`].
    #[error(transparent)]
    Translate(#[from] TranslateError),
    /// See [`ExecError`].
    #[error(transparent)]
    Exec(#[from] ExecError),
    /// See [`ConfigError`].
    #[error(transparent)]
    Config(#[from] ConfigError),
}
