//! The bytecode interpreter.
//!
//! A single-threaded fetch/dispatch loop over the validated instruction
//! copy. Registers hold host addresses; every load and store consults the
//! bounds rule first. Atomic operations go through the host's native atomics
//! so their visibility matches what the JIT emits.

use crate::consts::{MAX_CALL_DEPTH, STACK_SIZE};
use crate::error::ExecError;
use crate::vm::{LoadedProgram, Vm};

use krait_asm::{join_wide_immediate, opcode as opc, Instruction};

use std::ffi::c_void;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

/// Where the bytecode stack lives for one run.
pub(crate) enum StackMode<'a> {
    /// The machine's own 512-byte stack.
    Internal,
    /// A caller-supplied buffer (extended mode).
    External(&'a mut [u8]),
}

struct Frame {
    return_pc: usize,
    saved: [u64; 4],
    /// The caller's stack usage: subtracted from `r10` on the way in, added
    /// back on the way out.
    caller_usage: u64,
}

struct Machine<'a> {
    vm: &'a Vm,
    insts: &'a [Instruction],
    regs: [u64; 16],
    init_mask: u16,
    frames: Vec<Frame>,
    data: *mut u8,
    data_len: usize,
    stack: *mut u8,
    stack_len: usize,
    /// Usage of the function currently executing.
    cur_usage: u64,
    // Debug-callout shadow state; only maintained while a callout is
    // registered.
    reg_write_mask: u64,
    stack_write_mask: Vec<u8>,
}

pub(crate) fn execute(
    vm: &Vm,
    program: &LoadedProgram,
    data: &mut [u8],
    stack: StackMode<'_>,
) -> Result<u64, ExecError> {
    let mut internal_stack = [0u8; STACK_SIZE];
    let (stack_ptr, stack_len, extended) = match stack {
        StackMode::Internal => (internal_stack.as_mut_ptr(), STACK_SIZE, false),
        StackMode::External(buf) => (buf.as_mut_ptr(), buf.len(), true),
    };

    let insts = program.insts();
    let mut machine = Machine {
        vm,
        insts,
        regs: [0u64; 16],
        init_mask: 0,
        frames: Vec::new(),
        data: data.as_mut_ptr(),
        data_len: data.len(),
        stack: stack_ptr,
        stack_len,
        cur_usage: program.analysis.stack_usage(0) as u64,
        reg_write_mask: 0,
        stack_write_mask: if vm.debug_callout.is_some() {
            vec![0u8; stack_len.div_ceil(8)]
        } else {
            Vec::new()
        },
    };

    machine.write_reg(1, machine.data as u64);
    machine.write_reg(2, machine.data_len as u64);
    if extended {
        machine.write_reg(3, machine.stack as u64);
        machine.write_reg(4, machine.stack_len as u64);
    }
    machine.regs[10] = machine.stack as u64 + machine.stack_len as u64;
    machine.init_mask |= 1 << 10;

    machine.run(program)
}

/// Width of a memory access in bytes, from the opcode's size bits.
const fn access_size(opcode: u8) -> u64 {
    match opcode & opc::SIZE_MASK {
        opc::size::B => 1,
        opc::size::H => 2,
        opc::size::W => 4,
        _ => 8,
    }
}

impl Machine<'_> {
    fn run(&mut self, program: &LoadedProgram) -> Result<u64, ExecError> {
        let mut pc = 0usize;
        let limit = self.vm.instruction_limit;
        let mut executed = 0u64;

        loop {
            let inst = match self.insts.get(pc) {
                Some(inst) => *inst,
                // A branch target equal to the program length falls past the
                // end, which finishes the run like a top-level EXIT.
                None => return Ok(self.regs[0]),
            };

            if limit != 0 {
                if executed == limit {
                    return Err(ExecError::InstructionLimitExceeded);
                }
                executed += 1;
            }

            self.debug_callout(pc);

            let opcode = inst.opcode();
            let dst = inst.dst();
            let src = inst.src();
            let at = pc as u32;
            let mut next_pc = pc + 1;

            match opcode {
                // ALU32
                opc::ADD_IMM => self.alu32(dst, at, |d| d.wrapping_add(inst.imm() as u32))?,
                opc::ADD_REG => {
                    let s = self.read_reg(src, at)? as u32;
                    self.alu32(dst, at, |d| d.wrapping_add(s))?;
                }
                opc::SUB_IMM => self.alu32(dst, at, |d| d.wrapping_sub(inst.imm() as u32))?,
                opc::SUB_REG => {
                    let s = self.read_reg(src, at)? as u32;
                    self.alu32(dst, at, |d| d.wrapping_sub(s))?;
                }
                opc::MUL_IMM => self.alu32(dst, at, |d| d.wrapping_mul(inst.imm() as u32))?,
                opc::MUL_REG => {
                    let s = self.read_reg(src, at)? as u32;
                    self.alu32(dst, at, |d| d.wrapping_mul(s))?;
                }
                opc::DIV_IMM | opc::DIV_REG | opc::MOD_IMM | opc::MOD_REG => {
                    self.divmod32(&inst, at)?;
                }
                opc::OR_IMM => self.alu32(dst, at, |d| d | inst.imm() as u32)?,
                opc::OR_REG => {
                    let s = self.read_reg(src, at)? as u32;
                    self.alu32(dst, at, |d| d | s)?;
                }
                opc::AND_IMM => self.alu32(dst, at, |d| d & inst.imm() as u32)?,
                opc::AND_REG => {
                    let s = self.read_reg(src, at)? as u32;
                    self.alu32(dst, at, |d| d & s)?;
                }
                opc::LSH_IMM => {
                    let amount = self.shift_amount(inst.imm() as u32 as u64, 32, at)?;
                    self.alu32(dst, at, |d| d.wrapping_shl(amount))?;
                }
                opc::LSH_REG => {
                    let amount = self.shift_amount(self.read_reg(src, at)?, 32, at)?;
                    self.alu32(dst, at, |d| d.wrapping_shl(amount))?;
                }
                opc::RSH_IMM => {
                    let amount = self.shift_amount(inst.imm() as u32 as u64, 32, at)?;
                    self.alu32(dst, at, |d| d.wrapping_shr(amount))?;
                }
                opc::RSH_REG => {
                    let amount = self.shift_amount(self.read_reg(src, at)?, 32, at)?;
                    self.alu32(dst, at, |d| d.wrapping_shr(amount))?;
                }
                opc::NEG => self.alu32(dst, at, |d| d.wrapping_neg())?,
                opc::XOR_IMM => self.alu32(dst, at, |d| d ^ inst.imm() as u32)?,
                opc::XOR_REG => {
                    let s = self.read_reg(src, at)? as u32;
                    self.alu32(dst, at, |d| d ^ s)?;
                }
                opc::MOV_IMM => self.write_reg(dst, inst.imm() as u32 as u64),
                opc::MOV_REG => {
                    let s = self.read_reg(src, at)?;
                    let value = match inst.offset() {
                        8 => s as u8 as i8 as i32 as u32,
                        16 => s as u16 as i16 as i32 as u32,
                        _ => s as u32,
                    };
                    self.write_reg(dst, value as u64);
                }
                opc::ARSH_IMM => {
                    let amount = self.shift_amount(inst.imm() as u32 as u64, 32, at)?;
                    self.alu32(dst, at, |d| (d as i32).wrapping_shr(amount) as u32)?;
                }
                opc::ARSH_REG => {
                    let amount = self.shift_amount(self.read_reg(src, at)?, 32, at)?;
                    self.alu32(dst, at, |d| (d as i32).wrapping_shr(amount) as u32)?;
                }
                opc::LE => {
                    let d = self.read_reg(dst, at)?;
                    let value = if cfg!(target_endian = "little") {
                        truncate(d, inst.imm())
                    } else {
                        swap(d, inst.imm())
                    };
                    self.write_reg(dst, value);
                }
                opc::BE => {
                    let d = self.read_reg(dst, at)?;
                    let value = if cfg!(target_endian = "little") {
                        swap(d, inst.imm())
                    } else {
                        truncate(d, inst.imm())
                    };
                    self.write_reg(dst, value);
                }

                // ALU64
                opc::ADD64_IMM => self.alu64(dst, at, |d| d.wrapping_add(inst.imm() as i64 as u64))?,
                opc::ADD64_REG => {
                    let s = self.read_reg(src, at)?;
                    self.alu64(dst, at, |d| d.wrapping_add(s))?;
                }
                opc::SUB64_IMM => self.alu64(dst, at, |d| d.wrapping_sub(inst.imm() as i64 as u64))?,
                opc::SUB64_REG => {
                    let s = self.read_reg(src, at)?;
                    self.alu64(dst, at, |d| d.wrapping_sub(s))?;
                }
                opc::MUL64_IMM => self.alu64(dst, at, |d| d.wrapping_mul(inst.imm() as i64 as u64))?,
                opc::MUL64_REG => {
                    let s = self.read_reg(src, at)?;
                    self.alu64(dst, at, |d| d.wrapping_mul(s))?;
                }
                opc::DIV64_IMM | opc::DIV64_REG | opc::MOD64_IMM | opc::MOD64_REG => {
                    self.divmod64(&inst, at)?;
                }
                opc::OR64_IMM => self.alu64(dst, at, |d| d | inst.imm() as i64 as u64)?,
                opc::OR64_REG => {
                    let s = self.read_reg(src, at)?;
                    self.alu64(dst, at, |d| d | s)?;
                }
                opc::AND64_IMM => self.alu64(dst, at, |d| d & inst.imm() as i64 as u64)?,
                opc::AND64_REG => {
                    let s = self.read_reg(src, at)?;
                    self.alu64(dst, at, |d| d & s)?;
                }
                opc::LSH64_IMM => {
                    let amount = self.shift_amount(inst.imm() as u32 as u64, 64, at)?;
                    self.alu64(dst, at, |d| d.wrapping_shl(amount))?;
                }
                opc::LSH64_REG => {
                    let amount = self.shift_amount(self.read_reg(src, at)?, 64, at)?;
                    self.alu64(dst, at, |d| d.wrapping_shl(amount))?;
                }
                opc::RSH64_IMM => {
                    let amount = self.shift_amount(inst.imm() as u32 as u64, 64, at)?;
                    self.alu64(dst, at, |d| d.wrapping_shr(amount))?;
                }
                opc::RSH64_REG => {
                    let amount = self.shift_amount(self.read_reg(src, at)?, 64, at)?;
                    self.alu64(dst, at, |d| d.wrapping_shr(amount))?;
                }
                opc::NEG64 => self.alu64(dst, at, |d| d.wrapping_neg())?,
                opc::XOR64_IMM => self.alu64(dst, at, |d| d ^ inst.imm() as i64 as u64)?,
                opc::XOR64_REG => {
                    let s = self.read_reg(src, at)?;
                    self.alu64(dst, at, |d| d ^ s)?;
                }
                opc::MOV64_IMM => self.write_reg(dst, inst.imm() as i64 as u64),
                opc::MOV64_REG => {
                    let s = self.read_reg(src, at)?;
                    let value = match inst.offset() {
                        8 => s as u8 as i8 as i64 as u64,
                        16 => s as u16 as i16 as i64 as u64,
                        32 => s as u32 as i32 as i64 as u64,
                        _ => s,
                    };
                    self.write_reg(dst, value);
                }
                opc::ARSH64_IMM => {
                    let amount = self.shift_amount(inst.imm() as u32 as u64, 64, at)?;
                    self.alu64(dst, at, |d| (d as i64).wrapping_shr(amount) as u64)?;
                }
                opc::ARSH64_REG => {
                    let amount = self.shift_amount(self.read_reg(src, at)?, 64, at)?;
                    self.alu64(dst, at, |d| (d as i64).wrapping_shr(amount) as u64)?;
                }
                opc::BSWAP => {
                    let d = self.read_reg(dst, at)?;
                    self.write_reg(dst, swap(d, inst.imm()));
                }

                // Loads and stores
                opc::LDDW => {
                    let high = self.insts[pc + 1].imm();
                    self.write_reg(dst, join_wide_immediate(inst.imm(), high));
                    next_pc = pc + 2;
                }
                opc::LDXW | opc::LDXH | opc::LDXB | opc::LDXDW => {
                    let base = self.read_reg(src, at)?;
                    let addr = effective_address(base, inst.offset());
                    let size = access_size(opcode);
                    self.bounds_check(addr, size, at)?;
                    // Safety: the bounds rule admitted the range.
                    let value = unsafe {
                        match size {
                            1 => (addr as *const u8).read_unaligned() as u64,
                            2 => (addr as *const u16).read_unaligned() as u64,
                            4 => (addr as *const u32).read_unaligned() as u64,
                            _ => (addr as *const u64).read_unaligned(),
                        }
                    };
                    self.write_reg(dst, value);
                }
                opc::LDXWSX | opc::LDXHSX | opc::LDXBSX => {
                    let base = self.read_reg(src, at)?;
                    let addr = effective_address(base, inst.offset());
                    let size = access_size(opcode);
                    self.bounds_check(addr, size, at)?;
                    // Safety: the bounds rule admitted the range.
                    let value = unsafe {
                        match size {
                            1 => (addr as *const i8).read_unaligned() as i64 as u64,
                            2 => (addr as *const i16).read_unaligned() as i64 as u64,
                            _ => (addr as *const i32).read_unaligned() as i64 as u64,
                        }
                    };
                    self.write_reg(dst, value);
                }
                opc::STW | opc::STH | opc::STB | opc::STDW => {
                    let base = self.read_reg(dst, at)?;
                    let addr = effective_address(base, inst.offset());
                    let size = access_size(opcode);
                    self.bounds_check(addr, size, at)?;
                    // Safety: the bounds rule admitted the range.
                    unsafe {
                        match size {
                            1 => (addr as *mut u8).write_unaligned(inst.imm() as u8),
                            2 => (addr as *mut u16).write_unaligned(inst.imm() as u16),
                            4 => (addr as *mut u32).write_unaligned(inst.imm() as u32),
                            _ => (addr as *mut u64).write_unaligned(inst.imm() as i64 as u64),
                        }
                    }
                    self.note_stack_write(addr, size);
                }
                opc::STXW | opc::STXH | opc::STXB | opc::STXDW => {
                    let base = self.read_reg(dst, at)?;
                    let value = self.read_reg(src, at)?;
                    let addr = effective_address(base, inst.offset());
                    let size = access_size(opcode);
                    self.bounds_check(addr, size, at)?;
                    // Safety: the bounds rule admitted the range.
                    unsafe {
                        match size {
                            1 => (addr as *mut u8).write_unaligned(value as u8),
                            2 => (addr as *mut u16).write_unaligned(value as u16),
                            4 => (addr as *mut u32).write_unaligned(value as u32),
                            _ => (addr as *mut u64).write_unaligned(value),
                        }
                    }
                    self.note_stack_write(addr, size);
                }
                opc::ATOMIC_STORE => self.atomic64(&inst, at)?,
                opc::ATOMIC32_STORE => self.atomic32(&inst, at)?,

                // Control flow
                opc::JA => {
                    next_pc = (pc as i64 + inst.offset() as i64 + 1) as usize;
                }
                opc::JA32 => {
                    next_pc = (pc as i64 + inst.imm() as i64 + 1) as usize;
                }
                _ if is_conditional_branch(opcode) => {
                    if self.branch_taken(&inst, at)? {
                        next_pc = (pc as i64 + inst.offset() as i64 + 1) as usize;
                    }
                }
                opc::CALL if src == 0 => {
                    let helper = inst.imm() as u32;
                    let r0 = self.call_helper(helper, at)?;
                    self.write_reg(0, r0);
                    if self.vm.unwind_index == Some(helper) && r0 == 0 {
                        return Ok(0);
                    }
                }
                opc::CALL => {
                    if self.frames.len() == MAX_CALL_DEPTH {
                        return Err(ExecError::CallDepthExceeded { pc: at });
                    }
                    let target = (pc as i64 + inst.imm() as i64 + 1) as usize;
                    self.frames.push(Frame {
                        return_pc: pc + 1,
                        saved: [self.regs[6], self.regs[7], self.regs[8], self.regs[9]],
                        caller_usage: self.cur_usage,
                    });
                    self.regs[10] -= self.cur_usage;
                    self.cur_usage = program.analysis.stack_usage(target) as u64;
                    next_pc = target;
                }
                opc::CALLX => {
                    let helper = self.read_reg(dst, at)?;
                    let idx = u32::try_from(helper).map_err(|_| ExecError::UnknownHelper {
                        helper,
                        pc: at,
                    })?;
                    let func = self
                        .vm
                        .helpers
                        .get(idx)
                        .ok_or(ExecError::UnknownHelper { helper, pc: at })?
                        .func;
                    let r0 = func(
                        self.regs[1],
                        self.regs[2],
                        self.regs[3],
                        self.regs[4],
                        self.regs[5],
                        self.data.cast::<c_void>(),
                    );
                    self.write_reg(0, r0);
                }
                opc::EXIT => match self.frames.pop() {
                    Some(frame) => {
                        self.regs[10] += frame.caller_usage;
                        self.regs[6] = frame.saved[0];
                        self.regs[7] = frame.saved[1];
                        self.regs[8] = frame.saved[2];
                        self.regs[9] = frame.saved[3];
                        self.cur_usage = frame.caller_usage;
                        next_pc = frame.return_pc;
                    }
                    None => return Ok(self.regs[0]),
                },

                _ => {
                    return Err(ExecError::UnknownOpcode {
                        opcode,
                        pc: at,
                    })
                }
            }

            pc = next_pc;
        }
    }

    // Registers -------------------------------------------------------------

    fn read_reg(&self, reg: u8, pc: u32) -> Result<u64, ExecError> {
        if self.vm.undefined_behavior_check_enabled && self.init_mask & (1 << reg) == 0 {
            return Err(ExecError::UninitializedRegister { reg, pc });
        }
        Ok(self.regs[reg as usize])
    }

    fn write_reg(&mut self, reg: u8, value: u64) {
        self.regs[reg as usize] = value;
        self.init_mask |= 1 << reg;
        self.reg_write_mask |= 1 << reg;
    }

    fn alu32(&mut self, dst: u8, pc: u32, f: impl FnOnce(u32) -> u32) -> Result<(), ExecError> {
        let d = self.read_reg(dst, pc)? as u32;
        self.write_reg(dst, f(d) as u64);
        Ok(())
    }

    fn alu64(&mut self, dst: u8, pc: u32, f: impl FnOnce(u64) -> u64) -> Result<(), ExecError> {
        let d = self.read_reg(dst, pc)?;
        self.write_reg(dst, f(d));
        Ok(())
    }

    fn shift_amount(&self, requested: u64, width: u32, pc: u32) -> Result<u32, ExecError> {
        if self.vm.undefined_behavior_check_enabled && requested >= width as u64 {
            return Err(ExecError::ShiftOutOfRange {
                amount: requested,
                pc,
            });
        }
        Ok(requested as u32 & (width - 1))
    }

    fn divmod32(&mut self, inst: &Instruction, pc: u32) -> Result<(), ExecError> {
        let dividend = self.read_reg(inst.dst(), pc)? as u32;
        let divisor = if inst.opcode() & opc::SRC_REG != 0 {
            self.read_reg(inst.src(), pc)? as u32
        } else {
            inst.imm() as u32
        };
        let modulo = inst.opcode() & opc::ALU_OP_MASK == opc::MOD_IMM & opc::ALU_OP_MASK;
        let signed = inst.offset() == 1;

        let result = if divisor == 0 {
            if modulo {
                dividend
            } else {
                0
            }
        } else if signed {
            let (d, s) = (dividend as i32, divisor as i32);
            if modulo {
                d.wrapping_rem(s) as u32
            } else {
                d.wrapping_div(s) as u32
            }
        } else if modulo {
            dividend % divisor
        } else {
            dividend / divisor
        };

        self.write_reg(inst.dst(), result as u64);
        Ok(())
    }

    fn divmod64(&mut self, inst: &Instruction, pc: u32) -> Result<(), ExecError> {
        let dividend = self.read_reg(inst.dst(), pc)?;
        let divisor = if inst.opcode() & opc::SRC_REG != 0 {
            self.read_reg(inst.src(), pc)?
        } else {
            inst.imm() as i64 as u64
        };
        let modulo = inst.opcode() & opc::ALU_OP_MASK == opc::MOD64_IMM & opc::ALU_OP_MASK;
        let signed = inst.offset() == 1;

        let result = if divisor == 0 {
            if modulo {
                dividend
            } else {
                0
            }
        } else if signed {
            let (d, s) = (dividend as i64, divisor as i64);
            if modulo {
                d.wrapping_rem(s) as u64
            } else {
                d.wrapping_div(s) as u64
            }
        } else if modulo {
            dividend % divisor
        } else {
            dividend / divisor
        };

        self.write_reg(inst.dst(), result);
        Ok(())
    }

    fn branch_taken(&self, inst: &Instruction, pc: u32) -> Result<bool, ExecError> {
        let d = self.read_reg(inst.dst(), pc)?;
        let s = if inst.opcode() & opc::SRC_REG != 0 {
            self.read_reg(inst.src(), pc)?
        } else {
            inst.imm() as i64 as u64
        };

        let wide = inst.class() == opc::class::JMP;
        let (d, s) = if wide {
            (d, s)
        } else {
            (d as u32 as u64, s as u32 as u64)
        };
        let (ds, ss) = if wide {
            (d as i64, s as i64)
        } else {
            (d as u32 as i32 as i64, s as u32 as i32 as i64)
        };

        Ok(match inst.opcode() & opc::JMP_OP_MASK {
            0x10 => d == s,          // JEQ
            0x20 => d > s,           // JGT
            0x30 => d >= s,          // JGE
            0x40 => d & s != 0,      // JSET
            0x50 => d != s,          // JNE
            0x60 => ds > ss,         // JSGT
            0x70 => ds >= ss,        // JSGE
            0xa0 => d < s,           // JLT
            0xb0 => d <= s,          // JLE
            0xc0 => ds < ss,         // JSLT
            _ => ds <= ss,           // JSLE
        })
    }

    // Memory ----------------------------------------------------------------

    fn bounds_check(&self, addr: u64, size: u64, pc: u32) -> Result<(), ExecError> {
        if !self.vm.bounds_check_enabled {
            return Ok(());
        }
        let allowed = match self.vm.bounds_check {
            Some((check, cookie)) => check(cookie, addr, size),
            None => {
                in_region(addr, size, self.data as u64, self.data_len as u64)
                    || in_region(addr, size, self.stack as u64, self.stack_len as u64)
            }
        };
        if allowed {
            Ok(())
        } else {
            Err(ExecError::OutOfBounds { pc, addr, size })
        }
    }

    fn atomic64(&mut self, inst: &Instruction, pc: u32) -> Result<(), ExecError> {
        let base = self.read_reg(inst.dst(), pc)?;
        let addr = effective_address(base, inst.offset());
        self.bounds_check(addr, 8, pc)?;
        if addr % 8 != 0 {
            return Err(ExecError::MisalignedAtomic { pc, addr });
        }
        let value = self.read_reg(inst.src(), pc)?;
        // Safety: bounds and alignment were checked; the host atomics give
        // the same sequentially consistent visibility the JIT's
        // lock-prefixed and LL/SC sequences do.
        let cell = unsafe { AtomicU64::from_ptr(addr as *mut u64) };

        let sub_op = inst.imm();
        let fetch = sub_op & opc::atomic::FETCH != 0;
        match sub_op & !opc::atomic::FETCH {
            _ if sub_op == opc::atomic::XCHG => {
                let old = cell.swap(value, Ordering::SeqCst);
                self.write_reg(inst.src(), old);
            }
            _ if sub_op == opc::atomic::CMPXCHG => {
                let expected = self.read_reg(0, pc)?;
                let old = match cell.compare_exchange(expected, value, Ordering::SeqCst, Ordering::SeqCst) {
                    Ok(old) | Err(old) => old,
                };
                self.write_reg(0, old);
            }
            v if v == opc::atomic::ADD => {
                let old = cell.fetch_add(value, Ordering::SeqCst);
                if fetch {
                    self.write_reg(inst.src(), old);
                }
            }
            v if v == opc::atomic::OR => {
                let old = cell.fetch_or(value, Ordering::SeqCst);
                if fetch {
                    self.write_reg(inst.src(), old);
                }
            }
            v if v == opc::atomic::AND => {
                let old = cell.fetch_and(value, Ordering::SeqCst);
                if fetch {
                    self.write_reg(inst.src(), old);
                }
            }
            v if v == opc::atomic::XOR => {
                let old = cell.fetch_xor(value, Ordering::SeqCst);
                if fetch {
                    self.write_reg(inst.src(), old);
                }
            }
            _ => {
                return Err(ExecError::UnknownOpcode {
                    opcode: inst.opcode(),
                    pc,
                })
            }
        }
        self.note_stack_write(addr, 8);
        Ok(())
    }

    fn atomic32(&mut self, inst: &Instruction, pc: u32) -> Result<(), ExecError> {
        let base = self.read_reg(inst.dst(), pc)?;
        let addr = effective_address(base, inst.offset());
        self.bounds_check(addr, 4, pc)?;
        if addr % 4 != 0 {
            return Err(ExecError::MisalignedAtomic { pc, addr });
        }
        let value = self.read_reg(inst.src(), pc)? as u32;
        // Safety: as in `atomic64`.
        let cell = unsafe { AtomicU32::from_ptr(addr as *mut u32) };

        let sub_op = inst.imm();
        let fetch = sub_op & opc::atomic::FETCH != 0;
        match sub_op & !opc::atomic::FETCH {
            _ if sub_op == opc::atomic::XCHG => {
                let old = cell.swap(value, Ordering::SeqCst);
                self.write_reg(inst.src(), old as u64);
            }
            _ if sub_op == opc::atomic::CMPXCHG => {
                let expected = self.read_reg(0, pc)? as u32;
                let old = match cell.compare_exchange(expected, value, Ordering::SeqCst, Ordering::SeqCst) {
                    Ok(old) | Err(old) => old,
                };
                self.write_reg(0, old as u64);
            }
            v if v == opc::atomic::ADD => {
                let old = cell.fetch_add(value, Ordering::SeqCst);
                if fetch {
                    self.write_reg(inst.src(), old as u64);
                }
            }
            v if v == opc::atomic::OR => {
                let old = cell.fetch_or(value, Ordering::SeqCst);
                if fetch {
                    self.write_reg(inst.src(), old as u64);
                }
            }
            v if v == opc::atomic::AND => {
                let old = cell.fetch_and(value, Ordering::SeqCst);
                if fetch {
                    self.write_reg(inst.src(), old as u64);
                }
            }
            v if v == opc::atomic::XOR => {
                let old = cell.fetch_xor(value, Ordering::SeqCst);
                if fetch {
                    self.write_reg(inst.src(), old as u64);
                }
            }
            _ => {
                return Err(ExecError::UnknownOpcode {
                    opcode: inst.opcode(),
                    pc,
                })
            }
        }
        self.note_stack_write(addr, 4);
        Ok(())
    }

    // Calls -----------------------------------------------------------------

    fn call_helper(&mut self, helper: u32, pc: u32) -> Result<u64, ExecError> {
        let cookie = self.data.cast::<c_void>();
        let (r1, r2, r3, r4, r5) = (
            self.regs[1],
            self.regs[2],
            self.regs[3],
            self.regs[4],
            self.regs[5],
        );
        if let Some(dispatcher) = self.vm.dispatcher {
            return Ok(dispatcher(r1, r2, r3, r4, r5, helper, cookie));
        }
        let entry = self.vm.helpers.get(helper).ok_or(ExecError::UnknownHelper {
            helper: helper as u64,
            pc,
        })?;
        Ok((entry.func)(r1, r2, r3, r4, r5, cookie))
    }

    // Debugging -------------------------------------------------------------

    fn debug_callout(&mut self, pc: usize) {
        let Some((callout, cookie)) = self.vm.debug_callout else {
            return;
        };
        // Safety: the stack buffer is exclusively ours for this run.
        let stack = unsafe { std::slice::from_raw_parts(self.stack, self.stack_len) };
        callout(
            cookie,
            pc as u32,
            &self.regs,
            stack,
            self.reg_write_mask,
            &self.stack_write_mask,
        );
        self.reg_write_mask = 0;
        for byte in &mut self.stack_write_mask {
            *byte = 0;
        }
    }

    fn note_stack_write(&mut self, addr: u64, size: u64) {
        if self.stack_write_mask.is_empty() {
            return;
        }
        let start = self.stack as u64;
        for byte in addr..addr + size {
            if byte >= start && byte < start + self.stack_len as u64 {
                let bit = (byte - start) as usize;
                self.stack_write_mask[bit / 8] |= 1 << (bit % 8);
            }
        }
    }
}

fn effective_address(base: u64, offset: i16) -> u64 {
    base.wrapping_add(offset as i64 as u64)
}

fn in_region(addr: u64, size: u64, start: u64, len: u64) -> bool {
    let end = match addr.checked_add(size) {
        Some(end) => end,
        None => return false,
    };
    addr >= start && end <= start.wrapping_add(len)
}

const fn is_conditional_branch(opcode: u8) -> bool {
    let cls = opcode & opc::CLS_MASK;
    if cls != opc::class::JMP && cls != opc::class::JMP32 {
        return false;
    }
    !matches!(
        opcode,
        opc::JA | opc::JA32 | opc::CALL | opc::CALLX | opc::EXIT
    )
}

/// Mask `value` to the requested swap width without swapping.
const fn truncate(value: u64, width: i32) -> u64 {
    match width {
        8 => value & 0xff,
        16 => value & 0xffff,
        32 => value & 0xffff_ffff,
        _ => value,
    }
}

/// Swap bytes within the requested width and zero the rest.
const fn swap(value: u64, width: i32) -> u64 {
    match width {
        8 => value & 0xff,
        16 => (value as u16).swap_bytes() as u64,
        32 => (value as u32).swap_bytes() as u64,
        _ => value.swap_bytes(),
    }
}
