//! The machine record and its public surface.
//!
//! One [`Vm`] owns one logical program: the validated instruction copy, the
//! helper table, the configuration flags and the JIT output. Every public
//! operation takes the record first and is guarded by the lifecycle: setters
//! that shape a load are refused while a program is loaded, and execution
//! paths are refused without one. `unload` returns the machine to the
//! unloaded state with every setter re-enabled.

use crate::consts::{DEFAULT_MAX_INSTRUCTIONS, JIT_BYTES_PER_INSTRUCTION, MAX_HELPERS};
use crate::error::{ConfigError, TranslateError, VmError};
use crate::helpers::{
    BoundsCheck, DataRelocation, DebugCallout, Dispatcher, DispatcherValidator, Helper, HelperTable,
    StackUsageCalculator,
};
use crate::interpreter::{self, StackMode};
use crate::jit::{
    self, BasicJitFn, CompiledProgram, JitFn, JitMode, TargetArch, TranslateContext, TranslateOutput,
};
use crate::program::ProgramStore;
use crate::validator::{self, Analysis, ValidationContext};

use krait_asm::Instruction;

use std::ffi::c_void;

use tracing::debug;

pub(crate) struct LoadedProgram {
    store: ProgramStore,
    pub analysis: Analysis,
}

impl LoadedProgram {
    pub fn insts(&self) -> &[Instruction] {
        self.store.as_slice()
    }
}

/// An embeddable virtual machine for one loaded program.
pub struct Vm {
    pub(crate) program: Option<LoadedProgram>,
    jit: Option<CompiledProgram>,
    pub(crate) helpers: HelperTable,
    pub(crate) dispatcher: Option<Dispatcher>,
    dispatcher_validator: Option<DispatcherValidator>,
    pub(crate) bounds_check: Option<(BoundsCheck, *mut c_void)>,
    data_relocation: Option<(DataRelocation, *mut c_void)>,
    pub(crate) debug_callout: Option<(DebugCallout, *mut c_void)>,
    stack_usage_calculator: Option<(StackUsageCalculator, *mut c_void)>,
    pub(crate) bounds_check_enabled: bool,
    pub(crate) undefined_behavior_check_enabled: bool,
    constant_blinding_enabled: bool,
    readonly_bytecode_enabled: bool,
    max_instructions: u32,
    jit_code_size: usize,
    pub(crate) unwind_index: Option<u32>,
    pub(crate) instruction_limit: u64,
    target: Option<TargetArch>,
}

impl Default for Vm {
    fn default() -> Self {
        Self::new()
    }
}

impl Vm {
    /// Create an empty machine bound to the host's JIT target.
    pub fn new() -> Self {
        Self {
            program: None,
            jit: None,
            helpers: HelperTable::default(),
            dispatcher: None,
            dispatcher_validator: None,
            bounds_check: None,
            data_relocation: None,
            debug_callout: None,
            stack_usage_calculator: None,
            bounds_check_enabled: true,
            undefined_behavior_check_enabled: false,
            constant_blinding_enabled: false,
            readonly_bytecode_enabled: true,
            max_instructions: DEFAULT_MAX_INSTRUCTIONS,
            jit_code_size: 0,
            unwind_index: None,
            instruction_limit: 0,
            target: jit::host_arch(),
        }
    }

    fn ensure_unloaded(&self) -> Result<(), ConfigError> {
        if self.program.is_some() {
            Err(ConfigError::ProgramLoaded)
        } else {
            Ok(())
        }
    }

    fn loaded(&self) -> Result<&LoadedProgram, ConfigError> {
        self.program.as_ref().ok_or(ConfigError::NoProgram)
    }

    // Configuration ---------------------------------------------------------

    /// Cap the number of instructions a program may carry. Zero restores the
    /// default of 65,536. Refused while a program is loaded.
    pub fn set_max_instructions(&mut self, max: u32) -> Result<(), VmError> {
        self.ensure_unloaded()?;
        self.max_instructions = if max == 0 { DEFAULT_MAX_INSTRUCTIONS } else { max };
        Ok(())
    }

    /// Fix the JIT code-buffer capacity in bytes. Zero lets the machine size
    /// the buffer from the program length. Refused while a program is loaded.
    pub fn set_jit_code_size(&mut self, bytes: usize) -> Result<(), VmError> {
        self.ensure_unloaded()?;
        self.jit_code_size = bytes;
        Ok(())
    }

    /// Designate the helper whose zero return requests immediate exit.
    pub fn set_unwind_index(&mut self, idx: u32) -> Result<(), VmError> {
        self.ensure_unloaded()?;
        if idx as usize >= MAX_HELPERS {
            return Err(ConfigError::HelperIndexOutOfRange(idx).into());
        }
        self.unwind_index = Some(idx);
        Ok(())
    }

    /// Budget of interpreted instructions per run; zero means unlimited.
    /// Returns the previous budget. The JIT has no step counter.
    pub fn set_instruction_limit(&mut self, limit: u64) -> u64 {
        std::mem::replace(&mut self.instruction_limit, limit)
    }

    /// Enable or disable load/store bounds checking. Returns the previous
    /// setting.
    pub fn toggle_bounds_check(&mut self, enable: bool) -> bool {
        std::mem::replace(&mut self.bounds_check_enabled, enable)
    }

    /// Enable or disable constant blinding of immediates in emitted code.
    /// Returns the previous setting.
    pub fn toggle_constant_blinding(&mut self, enable: bool) -> bool {
        std::mem::replace(&mut self.constant_blinding_enabled, enable)
    }

    /// Enable or disable strict undefined-behaviour checking in the
    /// interpreter. Returns the previous setting.
    pub fn toggle_undefined_behavior_check(&mut self, enable: bool) -> bool {
        std::mem::replace(&mut self.undefined_behavior_check_enabled, enable)
    }

    /// Choose whether the loaded instruction copy is sealed read-only.
    /// Refused while a program is loaded; returns the previous setting.
    pub fn toggle_readonly_bytecode(&mut self, enable: bool) -> Result<bool, VmError> {
        self.ensure_unloaded()?;
        Ok(std::mem::replace(&mut self.readonly_bytecode_enabled, enable))
    }

    // Registration ----------------------------------------------------------

    /// Fill helper slot `idx`, optionally naming it. Refused while a program
    /// is loaded.
    pub fn register_helper(&mut self, idx: u32, name: Option<&str>, func: Helper) -> Result<(), VmError> {
        self.ensure_unloaded()?;
        self.helpers.register(idx, name, func)?;
        Ok(())
    }

    /// Index of the helper registered under `name`, if any.
    pub fn helper_index_by_name(&self, name: &str) -> Option<u32> {
        self.helpers.index_by_name(name)
    }

    /// Route every helper call through `dispatcher` instead of the per-index
    /// table. `validator` is consulted at load time for each called index.
    /// Allowed at any time; a live JIT buffer is patched in place.
    pub fn register_external_dispatcher(
        &mut self,
        dispatcher: Dispatcher,
        validator: Option<DispatcherValidator>,
    ) -> Result<(), VmError> {
        self.dispatcher = Some(dispatcher);
        self.dispatcher_validator = validator;
        if let Some(jit) = self.jit.as_mut() {
            jit.update_dispatcher(dispatcher as usize as u64)?;
        }
        Ok(())
    }

    /// Install a per-instruction debug callout. Interpreter only; reentering
    /// the machine from the callout is forbidden by contract.
    pub fn register_debug_callout(&mut self, cookie: *mut c_void, callout: DebugCallout) {
        self.debug_callout = Some((callout, cookie));
    }

    /// Replace the built-in data/stack bounds rule with `check`.
    pub fn register_bounds_check(&mut self, cookie: *mut c_void, check: BoundsCheck) {
        self.bounds_check = Some((check, cookie));
    }

    /// Install the relocation callback consulted by program-loading front
    /// ends. The core records it; ELF-style loaders query it through
    /// [`Vm::data_relocation`].
    pub fn register_data_relocation(&mut self, cookie: *mut c_void, relocation: DataRelocation) {
        self.data_relocation = Some((relocation, cookie));
    }

    /// The registered data-relocation callback, if any.
    pub fn data_relocation(&self) -> Option<(DataRelocation, *mut c_void)> {
        self.data_relocation
    }

    /// Install the per-function stack-usage calculator used by extended
    /// mode. Refused while a program is loaded.
    pub fn register_stack_usage_calculator(
        &mut self,
        calculator: StackUsageCalculator,
        cookie: *mut c_void,
    ) -> Result<(), VmError> {
        self.ensure_unloaded()?;
        self.stack_usage_calculator = Some((calculator, cookie));
        Ok(())
    }

    // Lifecycle -------------------------------------------------------------

    /// Validate `bytes` and take a defensive copy. At most one program may
    /// be loaded at a time; see [`Vm::unload`].
    pub fn load(&mut self, bytes: &[u8]) -> Result<(), VmError> {
        self.ensure_unloaded()?;

        if bytes.len() % Instruction::LEN != 0 {
            return Err(crate::error::LoadError::UnalignedProgram(bytes.len()).into());
        }
        let insts = Instruction::decode_program(bytes);
        if insts.len() > self.max_instructions as usize {
            return Err(crate::error::LoadError::TooManyInstructions {
                max: self.max_instructions,
            }
            .into());
        }

        let ctx = ValidationContext {
            helpers: &self.helpers,
            has_dispatcher: self.dispatcher.is_some(),
            dispatcher_validator: self.dispatcher_validator,
            stack_usage: self.stack_usage_calculator,
            callx_allowed: self.target != Some(TargetArch::Aarch64),
        };
        let analysis = validator::validate(&insts, &ctx)?;

        debug!(num_insts = insts.len(), "program loaded");
        self.program = Some(LoadedProgram {
            store: ProgramStore::new(insts, self.readonly_bytecode_enabled),
            analysis,
        });
        Ok(())
    }

    /// Discard the loaded program and any JIT output, returning the machine
    /// to the unloaded state. Previously handed-out JIT pointers become
    /// invalid and must not be invoked.
    pub fn unload(&mut self) {
        if self.program.take().is_some() {
            debug!("program unloaded");
        }
        self.jit = None;
    }

    /// Whether a program is currently loaded.
    pub fn is_loaded(&self) -> bool {
        self.program.is_some()
    }

    // Execution -------------------------------------------------------------

    /// Interpret the loaded program against `data`, on the machine's own
    /// 512-byte stack.
    pub fn exec(&mut self, data: &mut [u8]) -> Result<u64, VmError> {
        let program = self.loaded()?;
        let result = interpreter::execute(self, program, data, StackMode::Internal)?;
        Ok(result)
    }

    /// Interpret the loaded program with a caller-supplied stack buffer.
    pub fn exec_ex(&mut self, data: &mut [u8], stack: &mut [u8]) -> Result<u64, VmError> {
        let program = self.loaded()?;
        let result = interpreter::execute(self, program, data, StackMode::External(stack))?;
        Ok(result)
    }

    // Translation -----------------------------------------------------------

    fn translate_context<'a>(&'a self, program: &'a LoadedProgram) -> TranslateContext<'a> {
        TranslateContext {
            insts: program.insts(),
            local_entries: &program.analysis.local_entries,
            stack_usages: &program.analysis.stack_usages,
            helper_addresses: self.helpers.address_table(),
            dispatcher_addr: self.dispatcher.map(|d| d as usize as u64).unwrap_or(0),
            unwind_index: self.unwind_index,
            constant_blinding: self.constant_blinding_enabled,
        }
    }

    fn code_capacity(&self, num_insts: usize) -> usize {
        if self.jit_code_size != 0 {
            self.jit_code_size
        } else {
            num_insts * JIT_BYTES_PER_INSTRUCTION + 4096
        }
    }

    /// Translate and install the loaded program, returning its basic-mode
    /// entry pointer. Idempotent: repeated calls return the same pointer
    /// without retranslating.
    pub fn compile(&mut self) -> Result<BasicJitFn, VmError> {
        match self.compile_ex(JitMode::Basic)? {
            JitFn::Basic(f) => Ok(f),
            JitFn::Extended(_) => unreachable!("basic compilation yields a basic entry"),
        }
    }

    /// Translate and install the loaded program in the requested mode.
    pub fn compile_ex(&mut self, mode: JitMode) -> Result<JitFn, VmError> {
        let program = self.loaded()?;

        if let Some(jit) = self.jit.as_ref() {
            if jit.mode() != mode {
                return Err(ConfigError::JitModeMismatch(jit.mode()).into());
            }
            return Ok(jit.entry());
        }

        let arch = self.target.ok_or(TranslateError::UnsupportedTarget)?;
        let capacity = self.code_capacity(program.insts().len());
        let ctx = self.translate_context(program);
        let compiled = CompiledProgram::new(&ctx, arch, capacity, mode)?;
        debug!(size = compiled.output().size, ?mode, "program compiled");

        let entry = {
            self.jit = Some(compiled);
            self.jit.as_ref().expect("just installed").entry()
        };
        Ok(entry)
    }

    /// Emit basic-mode native code into `buf` without installing anything.
    /// On success reports the used size and tail offsets.
    pub fn translate(&self, buf: &mut [u8]) -> Result<TranslateOutput, VmError> {
        self.translate_ex(buf, JitMode::Basic)
    }

    /// Emit native code for `mode` into `buf` without installing anything.
    pub fn translate_ex(&self, buf: &mut [u8], mode: JitMode) -> Result<TranslateOutput, VmError> {
        let program = self.loaded()?;
        let arch = self.target.ok_or(TranslateError::UnsupportedTarget)?;
        let ctx = self.translate_context(program);
        let output = jit::translate(&ctx, arch, buf, mode)?;
        Ok(output)
    }
}
