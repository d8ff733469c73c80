//! Native-code translation of loaded programs.
//!
//! Two back-ends share one contract: given the translation context, a
//! mutable byte buffer and a mode, fill the buffer with native code and
//! report its size plus the offsets of the external-dispatcher slot and the
//! helper table in the data tail. The host back-end is bound when the
//! machine is created; there is no tiering and no intermediate
//! representation.

pub(crate) mod aarch64;
pub(crate) mod memory;
pub(crate) mod support;
pub(crate) mod x86_64;

use crate::error::TranslateError;
use self::memory::ExecMemory;

use krait_asm::Instruction;

/// Which entry signature the translation was produced for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JitMode {
    /// `fn(data, data_len) -> u64`; the machine supplies the 512-byte stack.
    Basic,
    /// `fn(data, data_len, stack, stack_len) -> u64`; the caller supplies
    /// the stack buffer.
    Extended,
}

/// Entry point of a basic-mode translation.
pub type BasicJitFn = unsafe extern "C" fn(data: *mut u8, data_len: u64) -> u64;

/// Entry point of an extended-mode translation.
pub type ExtendedJitFn =
    unsafe extern "C" fn(data: *mut u8, data_len: u64, stack: *mut u8, stack_len: u64) -> u64;

/// Entry pointer of a compiled program, tagged with its mode.
#[derive(Debug, Clone, Copy)]
pub enum JitFn {
    /// See [`BasicJitFn`].
    Basic(BasicJitFn),
    /// See [`ExtendedJitFn`].
    Extended(ExtendedJitFn),
}

/// What a translation reports back besides the bytes themselves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TranslateOutput {
    /// Bytes of the buffer actually used, data tail included.
    pub size: usize,
    /// Offset of the 8-byte external-dispatcher address slot.
    pub dispatcher_offset: u32,
    /// Offset of the 64-entry helper address table.
    pub helper_table_offset: u32,
}

/// JIT targets this build can emit for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TargetArch {
    X86_64,
    Aarch64,
}

/// The architecture of the running host, when a back-end exists for it.
pub(crate) fn host_arch() -> Option<TargetArch> {
    if cfg!(target_arch = "x86_64") {
        Some(TargetArch::X86_64)
    } else if cfg!(target_arch = "aarch64") {
        Some(TargetArch::Aarch64)
    } else {
        None
    }
}

/// Read-only view of the machine state a back-end consumes.
pub(crate) struct TranslateContext<'a> {
    pub insts: &'a [Instruction],
    pub local_entries: &'a [bool],
    pub stack_usages: &'a [u16],
    pub helper_addresses: [u64; crate::consts::MAX_HELPERS],
    /// Address of the external dispatcher, or zero when none is registered.
    pub dispatcher_addr: u64,
    pub unwind_index: Option<u32>,
    pub constant_blinding: bool,
}

/// Translate into `buf` with the back-end for `arch`.
pub(crate) fn translate(
    ctx: &TranslateContext<'_>,
    arch: TargetArch,
    buf: &mut [u8],
    mode: JitMode,
) -> Result<TranslateOutput, TranslateError> {
    match arch {
        TargetArch::X86_64 => x86_64::translate(ctx, buf, mode),
        TargetArch::Aarch64 => aarch64::translate(ctx, buf, mode),
    }
}

/// A finished translation installed in executable memory.
pub(crate) struct CompiledProgram {
    mem: ExecMemory,
    output: TranslateOutput,
    mode: JitMode,
}

impl CompiledProgram {
    pub fn new(
        ctx: &TranslateContext<'_>,
        arch: TargetArch,
        capacity: usize,
        mode: JitMode,
    ) -> Result<Self, TranslateError> {
        let mut mem = ExecMemory::new(capacity)?;
        let output = translate(ctx, arch, mem.as_mut_slice(), mode)?;
        mem.seal()?;
        Ok(Self { mem, output, mode })
    }

    pub fn mode(&self) -> JitMode {
        self.mode
    }

    pub fn output(&self) -> TranslateOutput {
        self.output
    }

    /// The installed entry pointer.
    ///
    /// The transmutes are sound: `seal` has made the mapping executable and
    /// the back-ends emit a function of exactly the advertised signature at
    /// offset zero.
    pub fn entry(&self) -> JitFn {
        let ptr = self.mem.as_ptr();
        match self.mode {
            // Safety: see above.
            JitMode::Basic => JitFn::Basic(unsafe { std::mem::transmute::<*const u8, BasicJitFn>(ptr) }),
            // Safety: see above.
            JitMode::Extended => {
                JitFn::Extended(unsafe { std::mem::transmute::<*const u8, ExtendedJitFn>(ptr) })
            }
        }
    }

    /// Swap the external-dispatcher address in the live buffer.
    pub fn update_dispatcher(&mut self, dispatcher_addr: u64) -> Result<(), TranslateError> {
        self.mem
            .patch(self.output.dispatcher_offset as usize, &dispatcher_addr.to_le_bytes())
    }

    /// Swap one helper address in the live buffer's table.
    pub fn update_helper(&mut self, idx: u32, helper_addr: u64) -> Result<(), TranslateError> {
        let offset = self.output.helper_table_offset as usize + idx as usize * 8;
        self.mem.patch(offset, &helper_addr.to_le_bytes())
    }
}
