//! Machine parameters.

/// Bytes of bytecode stack available to a basic-mode execution.
pub const STACK_SIZE: usize = 512;

/// Stack bytes attributed to the program entry function.
pub const ENTRY_STACK_USAGE: u16 = 512;

/// Stack bytes attributed to a local function when no calculator is
/// registered.
pub const LOCAL_FUNCTION_STACK_USAGE: u16 = 256;

/// Upper bound a stack-usage calculator may return for one function.
pub const MAX_LOCAL_STACK_USAGE: u16 = 512;

/// Default cap on program length, overridable before load.
pub const DEFAULT_MAX_INSTRUCTIONS: u32 = 65_536;

/// Number of helper slots addressable from bytecode.
pub const MAX_HELPERS: usize = 64;

/// Deepest chain of local calls the interpreter will follow.
pub const MAX_CALL_DEPTH: usize = 10;

/// Per-instruction JIT output estimate used to size the code buffer when the
/// embedder did not call `set_jit_code_size`. Sized for the worst case of a
/// blinded wide immediate.
pub const JIT_BYTES_PER_INSTRUCTION: usize = 64;

// Frame layouts assume the whole stack region keeps 16-byte alignment.
static_assertions::const_assert_eq!(STACK_SIZE % 16, 0);
static_assertions::const_assert_eq!(ENTRY_STACK_USAGE % 16, 0);
static_assertions::const_assert_eq!(LOCAL_FUNCTION_STACK_USAGE % 16, 0);
