//! Static validation of a decoded instruction stream.
//!
//! Runs before any execution path. The checks are applied per instruction in
//! a fixed order: opcode known, field rules, wide-load closure, call linkage,
//! branch targets, and finally the stack-usage survey of local functions.
//! The first failure aborts the load.

use crate::consts::{ENTRY_STACK_USAGE, LOCAL_FUNCTION_STACK_USAGE, MAX_LOCAL_STACK_USAGE};
use crate::error::LoadError;
use crate::helpers::{DispatcherValidator, HelperTable, StackUsageCalculator};

use krait_asm::{field_checks, opcode, Instruction};

use std::ffi::c_void;

/// Everything the validator needs to know about the machine's configuration.
pub(crate) struct ValidationContext<'a> {
    pub helpers: &'a HelperTable,
    pub has_dispatcher: bool,
    pub dispatcher_validator: Option<DispatcherValidator>,
    pub stack_usage: Option<(StackUsageCalculator, *mut c_void)>,
    pub callx_allowed: bool,
}

/// What validation learned about the program; consumed by both engines when
/// laying out frames.
#[derive(Debug, Clone, Default)]
pub(crate) struct Analysis {
    /// One flag per instruction: does a local function begin here?
    pub local_entries: Vec<bool>,
    /// Stack bytes used by the function entered at each marked index; slot 0
    /// always carries the entry function's fixed usage.
    pub stack_usages: Vec<u16>,
}

impl Analysis {
    /// Stack usage of the function whose entry is `pc`.
    pub fn stack_usage(&self, pc: usize) -> u16 {
        self.stack_usages.get(pc).copied().unwrap_or(ENTRY_STACK_USAGE)
    }
}

pub(crate) fn validate(insts: &[Instruction], ctx: &ValidationContext<'_>) -> Result<Analysis, LoadError> {
    let n = insts.len();
    if n == 0 {
        return Err(LoadError::NoTerminalExit);
    }

    // Wide loads consume the following slot; map out the continuation slots
    // first so no later check mistakes one for an instruction.
    let mut second_slot = vec![false; n];
    let mut pc = 0;
    while pc < n {
        if insts[pc].is_wide() {
            if pc + 1 >= n {
                return Err(LoadError::IncompleteWideLoad { pc: pc as u32 });
            }
            if insts[pc + 1].opcode() != 0 {
                return Err(LoadError::MalformedWideLoad { pc: pc as u32 });
            }
            second_slot[pc + 1] = true;
            pc += 2;
        } else {
            pc += 1;
        }
    }

    // Survey local-function entries so call targets can be checked in one
    // forward pass regardless of call direction.
    let mut local_entries = vec![false; n];
    for (pc, inst) in insts.iter().enumerate() {
        if second_slot[pc] || inst.opcode() != opcode::CALL || inst.src() != 1 {
            continue;
        }
        let target = pc as i64 + inst.imm() as i64 + 1;
        if target < 0 || target >= n as i64 || second_slot[target as usize] {
            return Err(LoadError::InvalidLocalCall {
                target,
                pc: pc as u32,
            });
        }
        local_entries[target as usize] = true;
    }

    for (pc, inst) in insts.iter().enumerate() {
        let opcode = inst.opcode();

        if second_slot[pc] {
            // The continuation carries only the high immediate; its other
            // fields were checked by the closure scan above and the pseudo
            // table entry.
            continue;
        }

        let checks = field_checks(opcode).ok_or(LoadError::UnknownOpcode {
            opcode,
            pc: pc as u32,
        })?;
        checks
            .check(inst)
            .map_err(|(field, value)| LoadError::InvalidField {
                field: field.name(),
                value,
                opcode,
            })?;

        match opcode {
            opcode::CALL if inst.src() == 0 => {
                let helper = inst.imm() as i64;
                let known = if ctx.has_dispatcher {
                    match ctx.dispatcher_validator {
                        Some(validator) => helper >= 0 && validator(inst.imm() as u32),
                        None => helper >= 0,
                    }
                } else {
                    ctx.helpers.is_registered(helper)
                };
                if !known {
                    return Err(LoadError::UnknownHelper {
                        helper,
                        pc: pc as u32,
                    });
                }
            }
            opcode::CALL => {
                // Local flavour; the entry survey above has already vetted
                // the target.
            }
            opcode::CALLX => {
                if !ctx.callx_allowed {
                    return Err(LoadError::CallxUnsupported { pc: pc as u32 });
                }
            }
            _ => {
                if let Some(target) = branch_target(pc, inst) {
                    if target < 0 || target > n as i64 {
                        return Err(LoadError::JumpOutOfBounds {
                            pc: pc as u32,
                            target,
                        });
                    }
                }
            }
        }
    }

    if insts[n - 1].opcode() != opcode::EXIT {
        return Err(LoadError::NoTerminalExit);
    }

    let mut stack_usages = vec![0u16; n];
    stack_usages[0] = ENTRY_STACK_USAGE;
    for (pc, marked) in local_entries.iter().enumerate() {
        if !marked || pc == 0 {
            continue;
        }
        let usage = match ctx.stack_usage {
            Some((calculator, cookie)) => {
                let usage = calculator(cookie, pc as u32);
                if usage != 0 && (usage % 16 != 0 || usage > MAX_LOCAL_STACK_USAGE) {
                    return Err(LoadError::BadStackUsage {
                        pc: pc as u32,
                        usage,
                    });
                }
                usage
            }
            None => LOCAL_FUNCTION_STACK_USAGE,
        };
        stack_usages[pc] = usage;
    }

    Ok(Analysis {
        local_entries,
        stack_usages,
    })
}

/// Branch displacement target of `inst` at `pc`, when it has one.
fn branch_target(pc: usize, inst: &Instruction) -> Option<i64> {
    match inst.class() {
        opcode::class::JMP => match inst.opcode() {
            opcode::CALL | opcode::CALLX | opcode::EXIT => None,
            _ => Some(pc as i64 + inst.offset() as i64 + 1),
        },
        opcode::class::JMP32 => match inst.opcode() {
            opcode::JA32 => Some(pc as i64 + inst.imm() as i64 + 1),
            _ => Some(pc as i64 + inst.offset() as i64 + 1),
        },
        _ => None,
    }
}
