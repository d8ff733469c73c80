//! AArch64 back-end.
//!
//! Same contract and emitted layout as the x86-64 back-end, expressed in
//! fixed-width A64 instructions. The register mapping is:
//!
//! ```text
//!   bytecode   native      usage
//!   r0         x5          result (x0 doubles as the first parameter, so
//!                          the result moves into place in the epilogue)
//!   r1..r5     x0..x4      parameters, caller-saved
//!   r6..r9     x19..x22    callee-saved
//!   r10        x23         frame pointer
//! ```
//!
//! Outside the mapping: `x24` generates immediates, `x25` carries division
//! and atomic-status intermediates, `x26` large load/store offsets, and
//! `x27` keeps the helper context for the duration of the run. Immediates
//! wider than an A64 encoding allows are materialised into `x24` and the
//! operation proceeds in its register form; constant blinding rides the same
//! conversion.
//!
//! Branch targets land in the fixup tables as byte offsets; resolution
//! encodes the word delta into the 26-bit (unconditional), 19-bit
//! (conditional and literal-load) or 21-bit (`adr`) immediate field.

use crate::consts::MAX_HELPERS;
use crate::error::TranslateError;
use crate::jit::support::{blinding_constant, JitState, PatchableTarget, SpecialTarget};
use crate::jit::{JitMode, TranslateContext, TranslateOutput};

use krait_asm::{join_wide_immediate, opcode as opc, Instruction};

type Reg = u8;

const R0: Reg = 0;
const R1: Reg = 1;
const R2: Reg = 2;
const R3: Reg = 3;
const R4: Reg = 4;
const R5: Reg = 5;
const R6: Reg = 6;
const R8: Reg = 8;
const R19: Reg = 19;
const R20: Reg = 20;
const R21: Reg = 21;
const R22: Reg = 22;
const R23: Reg = 23;
const R24: Reg = 24;
const R25: Reg = 25;
const R26: Reg = 26;
const R27: Reg = 27;
const R28: Reg = 28;
const R29: Reg = 29;
const R30: Reg = 30;
const SP: Reg = 31;
const RZ: Reg = 31;

/// Callee-saved registers spilled by the prologue; kept an even count so
/// they pair into `stp`/`ldp`.
const CALLEE_SAVED: [Reg; 10] = [R19, R20, R21, R22, R23, R24, R25, R26, R27, R28];

/// Scratch for immediate generation.
const TEMP: Reg = R24;
/// Scratch for division intermediates and the atomic status flag.
const TEMP_DIV: Reg = R25;
/// Scratch for large load/store offsets.
const OFFSET_SCRATCH: Reg = R26;
/// Home of the helper context pointer across the run.
const CTX: Reg = R27;

const REGISTER_MAP: [Reg; 11] = [R5, R0, R1, R2, R3, R4, R19, R20, R21, R22, R23];

fn map_register(r: u8) -> Reg {
    REGISTER_MAP[r as usize % REGISTER_MAP.len()]
}

/// Size bit of most instruction encodings (bit 31).
fn sz(sixty_four: bool) -> u32 {
    u32::from(sixty_four) << 31
}

fn emit(s: &mut JitState<'_>, instr: u32) {
    s.emit4(instr);
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum AddSub {
    Add = 0,
    Adds = 1,
    Sub = 2,
    Subs = 3,
}

/// Add/subtract (immediate), with the shifted-12-bit form when needed.
fn emit_addsub_immediate(s: &mut JitState<'_>, sixty_four: bool, op: AddSub, rd: Reg, rn: Reg, imm12: u32) {
    let mut imm12 = imm12;
    let mut shift = 0u32;
    if imm12 >= 0x1000 {
        debug_assert_eq!(imm12 & 0xfff, 0, "immediate not encodable");
        imm12 >>= 12;
        shift = 1 << 22;
    }
    debug_assert!(imm12 < 0x1000);
    emit(
        s,
        sz(sixty_four)
            | shift
            | ((op as u32) << 29)
            | 0x1100_0000
            | (imm12 << 10)
            | ((rn as u32) << 5)
            | rd as u32,
    );
}

/// Add/subtract (shifted register).
fn emit_addsub_register(s: &mut JitState<'_>, sixty_four: bool, op: AddSub, rd: Reg, rn: Reg, rm: Reg) {
    emit(
        s,
        sz(sixty_four) | ((op as u32) << 29) | 0x0b00_0000 | ((rm as u32) << 16) | ((rn as u32) << 5) | rd as u32,
    );
}

#[derive(Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
enum LoadStore {
    Strb = 0x0000_0000,
    Ldrb = 0x0040_0000,
    Ldrsbx = 0x0080_0000,
    Strh = 0x4000_0000,
    Ldrh = 0x4040_0000,
    Ldrshx = 0x4080_0000,
    Strw = 0x8000_0000,
    Ldrw = 0x8040_0000,
    Ldrsw = 0x8080_0000,
    Strx = 0xc000_0000,
    Ldrx = 0xc040_0000,
}

/// Load/store register (unscaled immediate).
fn emit_loadstore_immediate(s: &mut JitState<'_>, op: LoadStore, rt: Reg, rn: Reg, imm9: i16) {
    debug_assert!((-256..256).contains(&imm9));
    let imm9 = (imm9 as u32) & 0x1ff;
    emit(
        s,
        0x3800_0000 | op as u32 | (imm9 << 12) | ((rn as u32) << 5) | rt as u32,
    );
}

/// PC-relative literal load of the external-dispatcher slot.
fn emit_load_literal(s: &mut JitState<'_>, rt: Reg, target: PatchableTarget) {
    s.note_load(target);
    emit(s, 0x5800_0000 | rt as u32);
}

/// PC-relative address of the helper table.
fn emit_adr(s: &mut JitState<'_>, target: PatchableTarget, rd: Reg) {
    s.note_lea(target);
    emit(s, 0x1000_0000 | rd as u32);
}

#[derive(Clone, Copy)]
#[repr(u32)]
enum LoadStorePair {
    Stpx = 0xa900_0000,
    Ldpx = 0xa940_0000,
}

/// Load/store register pair (offset).
fn emit_loadstorepair_immediate(s: &mut JitState<'_>, op: LoadStorePair, rt: Reg, rt2: Reg, rn: Reg, imm: i32) {
    debug_assert_eq!(imm % 8, 0);
    let imm7 = ((imm / 8) as u32) & 0x7f;
    emit(
        s,
        op as u32 | (imm7 << 15) | ((rt2 as u32) << 10) | ((rn as u32) << 5) | rt as u32,
    );
}

#[derive(Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
enum Logical {
    And = 0x0000_0000,
    Orr = 0x2000_0000,
    Eor = 0x4000_0000,
    Ands = 0x6000_0000,
}

/// Logical (shifted register).
fn emit_logical_register(s: &mut JitState<'_>, sixty_four: bool, op: Logical, rd: Reg, rn: Reg, rm: Reg) {
    emit(
        s,
        sz(sixty_four) | op as u32 | (1 << 27) | (1 << 25) | ((rm as u32) << 16) | ((rn as u32) << 5) | rd as u32,
    );
}

/// Register-to-register move.
fn emit_mov(s: &mut JitState<'_>, sixty_four: bool, rd: Reg, rm: Reg) {
    emit_logical_register(s, sixty_four, Logical::Orr, rd, RZ, rm);
}

#[derive(Clone, Copy)]
#[repr(u32)]
enum BranchRegister {
    Blr = 0xd63f_0000,
    Ret = 0xd65f_0000,
}

/// Unconditional branch (register).
fn emit_branch_register(s: &mut JitState<'_>, op: BranchRegister, rn: Reg) {
    emit(s, op as u32 | ((rn as u32) << 5));
}

/// `b` (recorded in the jump table) or `bl` (recorded in the local-call
/// table when the target is a bytecode address). Returns the site offset.
fn emit_branch_immediate(s: &mut JitState<'_>, link: bool, target: PatchableTarget) -> u32 {
    let source = s.offset as u32;
    if link && !matches!(target, PatchableTarget::Special(_)) {
        s.note_local_call(target);
    } else {
        s.note_jump(target);
    }
    emit(s, if link { 0x9400_0000 } else { 0x1400_0000 });
    source
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Condition {
    Eq = 0,
    Ne = 1,
    Hs = 2,
    Lo = 3,
    Hi = 8,
    Ls = 9,
    Ge = 10,
    Lt = 11,
    Gt = 12,
    Le = 13,
}

/// Conditional branch (immediate); returns the site offset.
fn emit_conditional_branch(s: &mut JitState<'_>, cond: Condition, target: PatchableTarget) -> u32 {
    let source = s.offset as u32;
    s.note_jump(target);
    emit(s, 0x5400_0000 | cond as u32);
    source
}

#[derive(Clone, Copy)]
#[repr(u32)]
enum DataProc1 {
    Rev16 = 0x5ac0_0400,
    Rev32 = 0x5ac0_0800,
    Rev64 = 0xdac0_0c00,
}

/// Data-processing (1 source).
fn emit_dataproc_onesource(s: &mut JitState<'_>, sixty_four: bool, op: DataProc1, rd: Reg, rn: Reg) {
    emit(s, sz(sixty_four) | op as u32 | ((rn as u32) << 5) | rd as u32);
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum DataProc2 {
    Udiv = 0x1ac0_0800,
    Sdiv = 0x1ac0_0c00,
    Lslv = 0x1ac0_2000,
    Lsrv = 0x1ac0_2400,
    Asrv = 0x1ac0_2800,
}

/// Data-processing (2 source).
fn emit_dataproc_twosource(s: &mut JitState<'_>, sixty_four: bool, op: DataProc2, rd: Reg, rn: Reg, rm: Reg) {
    emit(
        s,
        sz(sixty_four) | op as u32 | ((rm as u32) << 16) | ((rn as u32) << 5) | rd as u32,
    );
}

#[derive(Clone, Copy)]
enum DataProc3 {
    Madd = 0x1b00_0000,
    Msub = 0x1b00_8000,
}

/// Data-processing (3 source).
fn emit_dataproc_threesource(
    s: &mut JitState<'_>,
    sixty_four: bool,
    op: DataProc3,
    rd: Reg,
    rn: Reg,
    rm: Reg,
    ra: Reg,
) {
    emit(
        s,
        sz(sixty_four) | op as u32 | ((rm as u32) << 16) | ((ra as u32) << 10) | ((rn as u32) << 5) | rd as u32,
    );
}

/// Zero-extend the low `width` bits of `rd` (ubfm).
fn emit_zero_extend(s: &mut JitState<'_>, rd: Reg, width: u32) {
    let imms = width - 1;
    emit(s, 0x5300_0000 | (imms << 10) | ((rd as u32) << 5) | rd as u32);
}

/// Sign-extend the low `width` bits of `rd` into 64 bits (sbfm).
fn emit_sign_extend64(s: &mut JitState<'_>, rd: Reg, rn: Reg, width: u32) {
    let imms = width - 1;
    emit(s, 0x9340_0000 | (imms << 10) | ((rn as u32) << 5) | rd as u32);
}

/// Sign-extend the low `width` bits within a 32-bit value (sbfm, w form).
fn emit_sign_extend32(s: &mut JitState<'_>, rd: Reg, rn: Reg, width: u32) {
    let imms = width - 1;
    emit(s, 0x1300_0000 | (imms << 10) | ((rn as u32) << 5) | rd as u32);
}

/// Materialise `imm` with a movz/movn start and movk continuation, choosing
/// the polarity that needs the fewest instructions.
fn emit_movewide_immediate(s: &mut JitState<'_>, sixty_four: bool, rd: Reg, imm: u64) {
    let halves: u32 = if sixty_four { 4 } else { 2 };
    let mut count0000 = if sixty_four { 0 } else { 2 };
    let mut countffff = 0;
    for i in 0..halves {
        match (imm >> (i * 16)) & 0xffff {
            0xffff => countffff += 1,
            0 => count0000 += 1,
            _ => {}
        }
    }

    const MOVN: u32 = 0x1280_0000;
    const MOVZ: u32 = 0x5280_0000;
    const MOVK: u32 = 0x7280_0000;

    let mut invert = count0000 < countffff;
    let skip_pattern = if invert { 0xffff } else { 0 };
    let mut op = if invert { MOVN } else { MOVZ };

    for i in 0..halves {
        let mut imm16 = (imm >> (i * 16)) & 0xffff;
        if imm16 != skip_pattern {
            if invert {
                imm16 = !imm16 & 0xffff;
            }
            emit(
                s,
                sz(sixty_four) | op | (i << 21) | ((imm16 as u32) << 5) | rd as u32,
            );
            op = MOVK;
            invert = false;
        }
    }

    // imm of all-zero or all-one halves never emitted anything above.
    if op != MOVK {
        emit(s, sz(sixty_four) | op | rd as u32);
    }
}

/// Like [`emit_movewide_immediate`] but the buffer only ever carries
/// `imm ^ key` and `key`.
fn emit_movewide_immediate_blinded(s: &mut JitState<'_>, sixty_four: bool, rd: Reg, imm: u64) {
    let key = blinding_constant();
    let blinded = imm ^ key;
    // Keep the key scratch disjoint from the destination.
    let scratch = if rd == TEMP_DIV { TEMP } else { TEMP_DIV };
    emit_movewide_immediate(s, sixty_four, rd, blinded);
    emit_movewide_immediate(s, sixty_four, scratch, key);
    emit_logical_register(s, sixty_four, Logical::Eor, rd, rd, scratch);
}

fn emit_immediate(s: &mut JitState<'_>, ctx: &TranslateContext<'_>, sixty_four: bool, rd: Reg, imm: u64) {
    if ctx.constant_blinding {
        emit_movewide_immediate_blinded(s, sixty_four, rd, imm);
    } else {
        emit_movewide_immediate(s, sixty_four, rd, imm);
    }
}

// Layout pieces -------------------------------------------------------------

/// The stack as laid out by the prologue, from high to low: frame record,
/// callee-saved block, then the bytecode stack (basic mode).
fn emit_prologue(s: &mut JitState<'_>) {
    emit_addsub_immediate(s, true, AddSub::Sub, SP, SP, 16);
    emit_loadstorepair_immediate(s, LoadStorePair::Stpx, R29, R30, SP, 0);

    emit_addsub_immediate(s, true, AddSub::Sub, SP, SP, (CALLEE_SAVED.len() * 8) as u32);
    for (i, pair) in CALLEE_SAVED.chunks(2).enumerate() {
        emit_loadstorepair_immediate(s, LoadStorePair::Stpx, pair[0], pair[1], SP, (i * 16) as i32);
    }
    emit_addsub_immediate(s, true, AddSub::Add, R29, SP, 0);

    match s.mode {
        JitMode::Basic => {
            emit_addsub_immediate(s, true, AddSub::Add, map_register(10), SP, 0);
            emit_addsub_immediate(s, true, AddSub::Sub, SP, SP, crate::consts::STACK_SIZE as u32);
        }
        JitMode::Extended => {
            // The caller's stack buffer and length arrive in x2/x3, which
            // already hold bytecode r3/r4.
            emit_addsub_immediate(s, true, AddSub::Add, map_register(10), R2, 0);
            emit_addsub_register(s, true, AddSub::Add, map_register(10), map_register(10), R3);
        }
    }

    // Park the context (first parameter) where nothing clobbers it.
    emit_mov(s, true, CTX, R0);

    emit_branch_immediate(s, true, PatchableTarget::Special(SpecialTarget::Enter));
    emit_branch_immediate(s, false, PatchableTarget::Special(SpecialTarget::Exit));
    s.entry_loc = s.offset as u32;
}

fn emit_epilogue(s: &mut JitState<'_>) {
    s.exit_loc = s.offset as u32;

    if map_register(0) != R0 {
        emit_mov(s, true, R0, map_register(0));
    }

    // The run may exit from any bytecode call depth; the saved frame pointer
    // squares the stack away.
    emit_addsub_immediate(s, true, AddSub::Add, SP, R29, 0);

    for (i, pair) in CALLEE_SAVED.chunks(2).enumerate() {
        emit_loadstorepair_immediate(s, LoadStorePair::Ldpx, pair[0], pair[1], SP, (i * 16) as i32);
    }
    emit_addsub_immediate(s, true, AddSub::Add, SP, SP, (CALLEE_SAVED.len() * 8) as u32);

    emit_loadstorepair_immediate(s, LoadStorePair::Ldpx, R29, R30, SP, 0);
    emit_addsub_immediate(s, true, AddSub::Add, SP, SP, 16);

    emit_branch_register(s, BranchRegister::Ret, R30);
}

/// Stage a function's stack usage on entry: the value is pushed twice to
/// keep the stack pointer 16-byte aligned.
fn emit_function_staging(s: &mut JitState<'_>, ctx: &TranslateContext<'_>, i: usize) {
    let is_entry = i == 0 || ctx.local_entries.get(i).copied().unwrap_or(false);
    if !is_entry {
        return;
    }

    let guard = if i != 0 && ctx.insts[i - 1].has_fallthrough() {
        Some(emit_branch_immediate(s, false, PatchableTarget::pc(0)))
    } else {
        None
    };

    let start = s.offset;
    let usage = ctx.stack_usages.get(i).copied().unwrap_or(0);
    emit_movewide_immediate(s, true, TEMP, usage as u64);
    emit_addsub_immediate(s, true, AddSub::Sub, SP, SP, 16);
    emit_loadstorepair_immediate(s, LoadStorePair::Stpx, TEMP, TEMP, SP, 0);
    let len = (s.offset - start) as u32;
    if s.prolog_size == 0 {
        s.prolog_size = len;
    }
    debug_assert_eq!(s.prolog_size, len);

    if let Some(guard) = guard {
        s.set_jump_target_here(guard);
    }
}

/// Helper dispatch: prefer the external dispatcher when its literal slot is
/// non-null, else index the helper table. Mirrors the x86-64 control flow.
fn emit_dispatched_helper_call(s: &mut JitState<'_>, ctx: &TranslateContext<'_>, idx: u32) {
    emit_addsub_immediate(s, true, AddSub::Sub, SP, SP, 16);
    emit_loadstore_immediate(s, LoadStore::Strx, R30, SP, 0);

    emit_load_literal(s, TEMP, PatchableTarget::Special(SpecialTarget::ExternalDispatcher));
    emit_addsub_immediate(s, true, AddSub::Subs, TEMP, TEMP, 0);
    let dispatcher_jump = emit_conditional_branch(s, Condition::Ne, PatchableTarget::pc(0));

    // Per-index path: scale the index into the table.
    emit_immediate(s, ctx, true, R5, idx as u64);
    emit_movewide_immediate(s, true, R6, 3);
    emit_dataproc_twosource(s, true, DataProc2::Lslv, R5, R5, R6);
    emit_adr(s, PatchableTarget::Special(SpecialTarget::LoadHelperTable), TEMP);
    emit_addsub_register(s, true, AddSub::Add, TEMP, TEMP, R5);
    emit_loadstore_immediate(s, LoadStore::Ldrx, TEMP, TEMP, 0);
    // The context is the implicit sixth parameter.
    emit_mov(s, true, R5, CTX);
    let rendezvous = emit_branch_immediate(s, false, PatchableTarget::pc(0));

    // Dispatcher path: the index is the sixth parameter, the context the
    // seventh.
    s.set_jump_target_here(dispatcher_jump);
    emit_immediate(s, ctx, true, R5, idx as u64);
    emit_mov(s, true, R6, CTX);

    s.set_jump_target_here(rendezvous);
    emit_branch_register(s, BranchRegister::Blr, TEMP);

    let result = map_register(0);
    if result != R0 {
        emit_mov(s, true, result, R0);
    }

    emit_loadstore_immediate(s, LoadStore::Ldrx, R30, SP, 0);
    emit_addsub_immediate(s, true, AddSub::Add, SP, SP, 16);
}

/// Local call: adjust the frame register by the staged usage and save what
/// the callee may clobber.
fn emit_local_call(s: &mut JitState<'_>, target_pc: u32) {
    emit_loadstore_immediate(s, LoadStore::Ldrx, TEMP, SP, 0);
    emit_addsub_register(s, true, AddSub::Sub, map_register(10), map_register(10), TEMP);

    emit_addsub_immediate(s, true, AddSub::Sub, SP, SP, 48);
    emit_loadstore_immediate(s, LoadStore::Strx, R30, SP, 0);
    emit_loadstore_immediate(s, LoadStore::Strx, TEMP, SP, 8);
    emit_loadstorepair_immediate(s, LoadStorePair::Stpx, map_register(6), map_register(7), SP, 16);
    emit_loadstorepair_immediate(s, LoadStorePair::Stpx, map_register(8), map_register(9), SP, 32);

    emit_branch_immediate(s, true, PatchableTarget::pc(target_pc));

    emit_loadstore_immediate(s, LoadStore::Ldrx, R30, SP, 0);
    emit_loadstore_immediate(s, LoadStore::Ldrx, TEMP, SP, 8);
    emit_loadstorepair_immediate(s, LoadStorePair::Ldpx, map_register(6), map_register(7), SP, 16);
    emit_loadstorepair_immediate(s, LoadStorePair::Ldpx, map_register(8), map_register(9), SP, 32);
    emit_addsub_immediate(s, true, AddSub::Add, SP, SP, 48);

    emit_addsub_register(s, true, AddSub::Add, map_register(10), map_register(10), TEMP);
}

// Immediate-operand conversion ----------------------------------------------

fn is_imm_op(inst: &Instruction) -> bool {
    let opcode = inst.opcode();
    let class = opcode & opc::CLS_MASK;
    let is_imm = opcode & opc::SRC_REG == 0;
    let is_endian = opcode & opc::ALU_OP_MASK == 0xd0;
    let is_neg = opcode & opc::ALU_OP_MASK == 0x80;
    let is_alu = (class == opc::class::ALU || class == opc::class::ALU64) && !is_endian && !is_neg;
    let is_jmp = class == opc::class::JMP
        && !matches!(opcode, opc::JA | opc::CALL | opc::CALLX | opc::EXIT);
    let is_jmp32 = class == opc::class::JMP32 && opcode != opc::JA32;
    let is_store = class == opc::class::ST;
    (is_imm && (is_alu || is_jmp || is_jmp32)) || is_store
}

/// Whether the immediate fits the instruction's native encoding directly.
fn is_simple_imm(inst: &Instruction) -> bool {
    match inst.opcode() {
        opc::ADD_IMM | opc::ADD64_IMM | opc::SUB_IMM | opc::SUB64_IMM => {
            inst.imm() >= 0 && inst.imm() < 0x1000
        }
        opc::JEQ_IMM | opc::JGT_IMM | opc::JGE_IMM | opc::JNE_IMM | opc::JSGT_IMM
        | opc::JSGE_IMM | opc::JLT_IMM | opc::JLE_IMM | opc::JSLT_IMM | opc::JSLE_IMM
        | opc::JEQ32_IMM | opc::JGT32_IMM | opc::JGE32_IMM | opc::JNE32_IMM
        | opc::JSGT32_IMM | opc::JSGE32_IMM | opc::JLT32_IMM | opc::JLE32_IMM
        | opc::JSLT32_IMM | opc::JSLE32_IMM => inst.imm() >= 0 && inst.imm() < 0x1000,
        opc::MOV_IMM | opc::MOV64_IMM => true,
        _ => false,
    }
}

/// The register form of an immediate-operand opcode.
fn to_reg_op(opcode: u8) -> u8 {
    let class = opcode & opc::CLS_MASK;
    if matches!(
        class,
        opc::class::ALU | opc::class::ALU64 | opc::class::JMP | opc::class::JMP32
    ) {
        opcode | opc::SRC_REG
    } else {
        // ST becomes the matching STX.
        (opcode & !opc::CLS_MASK) | opc::class::STX
    }
}

fn to_addsub(opcode: u8) -> AddSub {
    match opcode & opc::ALU_OP_MASK {
        0x00 => AddSub::Add,
        _ => AddSub::Sub,
    }
}

fn to_logical(opcode: u8) -> Logical {
    match opcode & opc::ALU_OP_MASK {
        0x40 => Logical::Orr,
        0x50 => Logical::And,
        _ => Logical::Eor,
    }
}

fn to_dataproc2(opcode: u8) -> DataProc2 {
    match opcode & opc::ALU_OP_MASK {
        0x60 => DataProc2::Lslv,
        0x70 => DataProc2::Lsrv,
        _ => DataProc2::Asrv,
    }
}

fn to_loadstore(opcode: u8) -> LoadStore {
    match opcode {
        opc::LDXW => LoadStore::Ldrw,
        opc::LDXH => LoadStore::Ldrh,
        opc::LDXB => LoadStore::Ldrb,
        opc::LDXDW => LoadStore::Ldrx,
        opc::LDXWSX => LoadStore::Ldrsw,
        opc::LDXHSX => LoadStore::Ldrshx,
        opc::LDXBSX => LoadStore::Ldrsbx,
        opc::STW | opc::STXW => LoadStore::Strw,
        opc::STH | opc::STXH => LoadStore::Strh,
        opc::STB | opc::STXB => LoadStore::Strb,
        _ => LoadStore::Strx,
    }
}

fn to_condition(opcode: u8) -> Condition {
    match opcode & opc::JMP_OP_MASK {
        0x10 => Condition::Eq,
        0x20 => Condition::Hi,
        0x30 => Condition::Hs,
        0x40 => Condition::Ne, // JSET
        0x50 => Condition::Ne,
        0x60 => Condition::Gt,
        0x70 => Condition::Ge,
        0xa0 => Condition::Lo,
        0xb0 => Condition::Ls,
        0xc0 => Condition::Lt,
        _ => Condition::Le,
    }
}

fn is_alu64_op(inst: &Instruction) -> bool {
    let class = inst.class();
    class == opc::class::ALU64 || class == opc::class::JMP
}

// Atomics -------------------------------------------------------------------

const LDXRW: u32 = 0x885f_7c00;
const STXRW: u32 = 0x8800_7c00;
const LDXRX: u32 = 0xc85f_7c00;
const STXRX: u32 = 0xc800_7c00;

fn emit_load_exclusive(s: &mut JitState<'_>, sixty_four: bool, rt: Reg, rn: Reg) {
    let base = if sixty_four { LDXRX } else { LDXRW };
    emit(s, base | ((rn as u32) << 5) | rt as u32);
}

fn emit_store_exclusive(s: &mut JitState<'_>, sixty_four: bool, rs: Reg, rt: Reg, rn: Reg) {
    let base = if sixty_four { STXRX } else { STXRW };
    emit(s, base | ((rs as u32) << 16) | ((rn as u32) << 5) | rt as u32);
}

/// One atomic read-modify-write as a load-exclusive/store-exclusive retry
/// loop. The effective address moves into a scratch first so the base can
/// never alias the status register.
fn emit_atomic(s: &mut JitState<'_>, ctx: &TranslateContext<'_>, inst: &Instruction, sixty_four: bool) {
    let dst = map_register(inst.dst());
    let src = map_register(inst.src());
    let offset = inst.offset();
    let sub_op = inst.imm();
    let fetch = sub_op & opc::atomic::FETCH != 0;

    let addr = TEMP_DIV;
    let status = OFFSET_SCRATCH;
    let loaded = TEMP;
    // Caller-saved and outside the bytecode mapping; free for the combined
    // value.
    let combined = R8;

    if offset != 0 {
        let magnitude = (offset as i32).unsigned_abs();
        let op = if offset < 0 { AddSub::Sub } else { AddSub::Add };
        if magnitude < 0x1000 {
            emit_addsub_immediate(s, true, op, addr, dst, magnitude);
        } else {
            emit_immediate(s, ctx, true, status, magnitude as u64);
            emit_addsub_register(s, true, op, addr, dst, status);
        }
    } else {
        emit_mov(s, true, addr, dst);
    }

    let retry = s.offset as u32;
    emit_load_exclusive(s, sixty_four, loaded, addr);

    if sub_op == opc::atomic::CMPXCHG {
        let expected = map_register(0);
        emit_addsub_register(s, sixty_four, AddSub::Subs, RZ, loaded, expected);
        let skip_store = emit_conditional_branch(s, Condition::Ne, PatchableTarget::pc(0));

        emit_store_exclusive(s, sixty_four, status, src, addr);
        emit_addsub_immediate(s, false, AddSub::Subs, RZ, status, 0);
        emit_conditional_branch(s, Condition::Ne, PatchableTarget::jit(retry));

        s.set_jump_target_here(skip_store);
        // A w-form move zero-extends, matching the 32-bit flavour's result.
        emit_mov(s, sixty_four, expected, loaded);
        return;
    }

    if sub_op == opc::atomic::XCHG {
        emit_store_exclusive(s, sixty_four, status, src, addr);
        emit_addsub_immediate(s, false, AddSub::Subs, RZ, status, 0);
        emit_conditional_branch(s, Condition::Ne, PatchableTarget::jit(retry));
        emit_mov(s, sixty_four, src, loaded);
        return;
    }

    match sub_op & !opc::atomic::FETCH {
        v if v == opc::atomic::ADD => {
            emit_addsub_register(s, sixty_four, AddSub::Add, combined, loaded, src)
        }
        v if v == opc::atomic::OR => {
            emit_logical_register(s, sixty_four, Logical::Orr, combined, loaded, src)
        }
        v if v == opc::atomic::AND => {
            emit_logical_register(s, sixty_four, Logical::And, combined, loaded, src)
        }
        _ => emit_logical_register(s, sixty_four, Logical::Eor, combined, loaded, src),
    }

    emit_store_exclusive(s, sixty_four, status, combined, addr);
    emit_addsub_immediate(s, false, AddSub::Subs, RZ, status, 0);
    emit_conditional_branch(s, Condition::Ne, PatchableTarget::jit(retry));

    if fetch {
        emit_mov(s, sixty_four, src, loaded);
    }
}

// Translation ---------------------------------------------------------------

pub(crate) fn translate(
    ctx: &TranslateContext<'_>,
    buf: &mut [u8],
    mode: JitMode,
) -> Result<TranslateOutput, TranslateError> {
    let mut state = JitState::new(buf, ctx.insts.len(), mode);

    emit_prologue(&mut state);

    let mut i = 0usize;
    while i < ctx.insts.len() {
        if !state.ok() {
            break;
        }
        let inst = ctx.insts[i];
        emit_function_staging(&mut state, ctx, i);
        state.pc_locs[i] = state.offset as u32;
        i += emit_instruction(&mut state, ctx, i, &inst);
    }

    if let Some(error) = state.status.clone() {
        return Err(error);
    }

    emit_epilogue(&mut state);
    state.pc_locs[ctx.insts.len()] = state.exit_loc;

    emit_data_tail(&mut state, ctx);

    if let Some(error) = state.status.clone() {
        return Err(error);
    }

    resolve(&mut state)?;

    Ok(TranslateOutput {
        size: state.offset,
        dispatcher_offset: state.dispatcher_loc,
        helper_table_offset: state.helper_table_loc,
    })
}

fn emit_data_tail(s: &mut JitState<'_>, ctx: &TranslateContext<'_>) {
    while s.offset % 8 != 0 {
        s.emit1(0);
    }
    s.dispatcher_loc = s.offset as u32;
    s.emit8(ctx.dispatcher_addr);

    s.helper_table_loc = s.offset as u32;
    for addr in ctx.helper_addresses {
        s.emit8(addr);
    }
    debug_assert_eq!(ctx.helper_addresses.len(), MAX_HELPERS);
}

fn emit_instruction(
    s: &mut JitState<'_>,
    ctx: &TranslateContext<'_>,
    i: usize,
    inst: &Instruction,
) -> usize {
    let mut opcode = inst.opcode();
    let dst = map_register(inst.dst());
    let mut src = map_register(inst.src());
    let imm = inst.imm();
    let offset = inst.offset();
    let sixty_four = is_alu64_op(inst);

    let target_pc = if opcode == opc::JA32 {
        (i as i64 + imm as i64 + 1) as u32
    } else {
        (i as i64 + offset as i64 + 1) as u32
    };
    let tgt = PatchableTarget::pc(target_pc);

    // Immediate operands that the native encoding cannot carry (or that must
    // be blinded) go through the immediate scratch, and the operation
    // becomes its register form.
    if is_imm_op(inst)
        && opcode != opc::MOV_IMM
        && opcode != opc::MOV64_IMM
        && (!is_simple_imm(inst) || ctx.constant_blinding)
    {
        // The double-word store writes the sign-extended immediate, so its
        // materialisation must be 64 bits wide.
        let wide = sixty_four || opcode == opc::STDW;
        emit_immediate(s, ctx, wide, TEMP, imm as i64 as u64);
        src = TEMP;
        opcode = to_reg_op(opcode);
    }

    match opcode {
        opc::ADD_IMM | opc::ADD64_IMM | opc::SUB_IMM | opc::SUB64_IMM => {
            emit_addsub_immediate(s, sixty_four, to_addsub(opcode), dst, dst, imm as u32);
        }
        opc::ADD_REG | opc::ADD64_REG | opc::SUB_REG | opc::SUB64_REG => {
            emit_addsub_register(s, sixty_four, to_addsub(opcode), dst, dst, src);
        }
        opc::LSH_REG | opc::RSH_REG | opc::ARSH_REG | opc::LSH64_REG | opc::RSH64_REG
        | opc::ARSH64_REG => {
            emit_dataproc_twosource(s, sixty_four, to_dataproc2(opcode), dst, dst, src);
        }
        opc::MUL_REG | opc::MUL64_REG => {
            emit_dataproc_threesource(s, sixty_four, DataProc3::Madd, dst, dst, src, RZ);
        }
        opc::DIV_REG | opc::DIV64_REG | opc::MOD_REG | opc::MOD64_REG => {
            divmod(s, opcode, dst, dst, src, offset);
        }
        opc::OR_REG | opc::AND_REG | opc::XOR_REG | opc::OR64_REG | opc::AND64_REG
        | opc::XOR64_REG => {
            emit_logical_register(s, sixty_four, to_logical(opcode), dst, dst, src);
        }
        opc::NEG | opc::NEG64 => {
            emit_addsub_register(s, sixty_four, AddSub::Sub, dst, RZ, dst);
        }
        opc::MOV_IMM => emit_immediate(s, ctx, false, dst, imm as u32 as u64),
        opc::MOV64_IMM => emit_immediate(s, ctx, true, dst, imm as i64 as u64),
        opc::MOV_REG => match offset {
            8 => emit_sign_extend32(s, dst, src, 8),
            16 => emit_sign_extend32(s, dst, src, 16),
            _ => emit_mov(s, false, dst, src),
        },
        opc::MOV64_REG => match offset {
            8 => emit_sign_extend64(s, dst, src, 8),
            16 => emit_sign_extend64(s, dst, src, 16),
            32 => emit_sign_extend64(s, dst, src, 32),
            _ => emit_mov(s, true, dst, src),
        },
        opc::LE => {
            // Little-endian host: no swap, only the width mask.
            match imm {
                8 => emit_zero_extend(s, dst, 8),
                16 => emit_zero_extend(s, dst, 16),
                32 => emit_zero_extend(s, dst, 32),
                _ => {}
            }
        }
        opc::BE | opc::BSWAP => {
            match imm {
                16 => {
                    emit_dataproc_onesource(s, sixty_four, DataProc1::Rev16, dst, dst);
                    emit_zero_extend(s, dst, 16);
                }
                32 => {
                    if sixty_four {
                        emit_dataproc_onesource(s, true, DataProc1::Rev32, dst, dst);
                        emit_zero_extend(s, dst, 32);
                    } else {
                        // The w-form rev swaps the full word and zero-extends.
                        emit_dataproc_onesource(s, false, DataProc1::Rev32, dst, dst);
                    }
                }
                64 => emit_dataproc_onesource(s, true, DataProc1::Rev64, dst, dst),
                _ => emit_zero_extend(s, dst, 8),
            }
        }

        opc::JA | opc::JA32 => {
            emit_branch_immediate(s, false, tgt);
        }
        opc::JEQ_IMM | opc::JGT_IMM | opc::JGE_IMM | opc::JLT_IMM | opc::JLE_IMM
        | opc::JNE_IMM | opc::JSGT_IMM | opc::JSGE_IMM | opc::JSLT_IMM | opc::JSLE_IMM
        | opc::JEQ32_IMM | opc::JGT32_IMM | opc::JGE32_IMM | opc::JLT32_IMM | opc::JLE32_IMM
        | opc::JNE32_IMM | opc::JSGT32_IMM | opc::JSGE32_IMM | opc::JSLT32_IMM
        | opc::JSLE32_IMM => {
            emit_addsub_immediate(s, sixty_four, AddSub::Subs, RZ, dst, imm as u32);
            emit_conditional_branch(s, to_condition(opcode), tgt);
        }
        opc::JEQ_REG | opc::JGT_REG | opc::JGE_REG | opc::JLT_REG | opc::JLE_REG
        | opc::JNE_REG | opc::JSGT_REG | opc::JSGE_REG | opc::JSLT_REG | opc::JSLE_REG
        | opc::JEQ32_REG | opc::JGT32_REG | opc::JGE32_REG | opc::JLT32_REG | opc::JLE32_REG
        | opc::JNE32_REG | opc::JSGT32_REG | opc::JSGE32_REG | opc::JSLT32_REG
        | opc::JSLE32_REG => {
            emit_addsub_register(s, sixty_four, AddSub::Subs, RZ, dst, src);
            emit_conditional_branch(s, to_condition(opcode), tgt);
        }
        opc::JSET_REG | opc::JSET32_REG => {
            emit_logical_register(s, sixty_four, Logical::Ands, RZ, dst, src);
            emit_conditional_branch(s, to_condition(opcode), tgt);
        }

        opc::CALL if inst.src() == 0 => {
            emit_dispatched_helper_call(s, ctx, imm as u32);
            if ctx.unwind_index == Some(imm as u32) {
                emit_addsub_immediate(s, true, AddSub::Subs, RZ, map_register(0), 0);
                emit_conditional_branch(s, Condition::Eq, PatchableTarget::Special(SpecialTarget::Exit));
            }
        }
        opc::CALL if inst.src() == 1 => {
            emit_local_call(s, (i as i64 + imm as i64 + 1) as u32);
        }
        opc::CALL => {
            emit_branch_immediate(s, false, PatchableTarget::Special(SpecialTarget::Exit));
        }
        opc::EXIT => {
            emit_addsub_immediate(s, true, AddSub::Add, SP, SP, 16);
            emit_branch_register(s, BranchRegister::Ret, R30);
        }

        opc::LDXW | opc::LDXH | opc::LDXB | opc::LDXDW | opc::LDXWSX | opc::LDXHSX
        | opc::LDXBSX => {
            emit_loadstore(s, ctx, to_loadstore(opcode), dst, src, offset);
        }
        opc::STXW | opc::STXH | opc::STXB | opc::STXDW => {
            // Stores write rt (the bytecode source) through rn (the
            // destination base).
            emit_loadstore(s, ctx, to_loadstore(opcode), src, dst, offset);
        }

        opc::ATOMIC_STORE => emit_atomic(s, ctx, inst, true),
        opc::ATOMIC32_STORE => emit_atomic(s, ctx, inst, false),

        opc::LDDW => {
            let high = ctx.insts[i + 1].imm();
            let value = join_wide_immediate(imm, high);
            s.pc_locs[i + 1] = s.offset as u32;
            emit_immediate(s, ctx, true, dst, value);
            return 2;
        }

        opc::STW | opc::STH | opc::STB | opc::STDW | opc::MUL_IMM | opc::MUL64_IMM
        | opc::DIV_IMM | opc::DIV64_IMM | opc::MOD_IMM | opc::MOD64_IMM | opc::LSH_IMM
        | opc::LSH64_IMM | opc::RSH_IMM | opc::RSH64_IMM | opc::ARSH_IMM | opc::ARSH64_IMM
        | opc::OR_IMM | opc::OR64_IMM | opc::AND_IMM | opc::AND64_IMM | opc::XOR_IMM
        | opc::XOR64_IMM | opc::JSET_IMM | opc::JSET32_IMM => {
            // These reach here only when the immediate conversion above was
            // skipped, which validation rules out.
            s.fail(TranslateError::UnexpectedInstruction {
                pc: i as u32,
                opcode,
            });
        }
        _ => {
            s.fail(TranslateError::UnknownInstruction {
                pc: i as u32,
                opcode,
            });
        }
    }
    1
}

/// Loads and register stores, with the scratch-register path for offsets the
/// unscaled form cannot reach.
fn emit_loadstore(
    s: &mut JitState<'_>,
    ctx: &TranslateContext<'_>,
    op: LoadStore,
    rt: Reg,
    rn: Reg,
    offset: i16,
) {
    if (-256..256).contains(&offset) {
        emit_loadstore_immediate(s, op, rt, rn, offset);
        return;
    }

    // Compute the address into a scratch so large negative offsets work.
    let addr = TEMP_DIV;
    let magnitude = (offset as i32).unsigned_abs();
    let addsub = if offset < 0 { AddSub::Sub } else { AddSub::Add };
    if magnitude < 0x1000 {
        emit_addsub_immediate(s, true, addsub, addr, rn, magnitude);
    } else {
        emit_immediate(s, ctx, true, OFFSET_SCRATCH, magnitude as u64);
        emit_addsub_register(s, true, addsub, addr, rn, OFFSET_SCRATCH);
    }
    emit_loadstore_immediate(s, op, rt, addr, 0);
}

/// `udiv`/`sdiv`, plus `msub` to recover the remainder. Division by zero
/// needs no special casing: the hardware already returns zero, and the
/// remainder path reconstructs the dividend from it.
fn divmod(s: &mut JitState<'_>, opcode: u8, rd: Reg, rn: Reg, rm: Reg, offset: i16) {
    let modulo = opcode & opc::ALU_OP_MASK == opc::MOD_IMM & opc::ALU_OP_MASK;
    let sixty_four = opcode & opc::CLS_MASK == opc::class::ALU64;
    let div_op = if offset == 1 { DataProc2::Sdiv } else { DataProc2::Udiv };
    let div_dest = if modulo { TEMP_DIV } else { rd };

    emit_dataproc_twosource(s, sixty_four, div_op, div_dest, rn, rm);
    if modulo {
        emit_dataproc_threesource(s, sixty_four, DataProc3::Msub, rd, rm, div_dest, rn);
    }
}

// Fixups --------------------------------------------------------------------

fn patch_instruction(buf: &mut [u8], loc: u32, value: u32) {
    let loc = loc as usize;
    let mut instr = u32::from_le_bytes(buf[loc..loc + 4].try_into().expect("in bounds"));
    instr |= value;
    buf[loc..loc + 4].copy_from_slice(&instr.to_le_bytes());
}

/// Write a branch displacement into the conditional (19-bit) or
/// unconditional (26-bit) immediate field at `loc`.
fn resolve_branch_immediate(state: &mut JitState<'_>, loc: u32, rel: i64) -> Result<(), TranslateError> {
    debug_assert_eq!(rel & 3, 0);
    let words = rel >> 2;
    let loc_usize = loc as usize;
    let instr = u32::from_le_bytes(
        state.buf[loc_usize..loc_usize + 4]
            .try_into()
            .expect("in bounds"),
    );
    if instr & 0xfe00_0000 == 0x5400_0000 {
        // Conditional branch.
        if !(-(1 << 18)..(1 << 18)).contains(&words) {
            return Err(TranslateError::UnresolvedPatch);
        }
        patch_instruction(state.buf, loc, ((words as u32) & 0x7_ffff) << 5);
        Ok(())
    } else if instr & 0x7c00_0000 == 0x1400_0000 {
        // Unconditional branch, with or without link.
        if !(-(1 << 25)..(1 << 25)).contains(&words) {
            return Err(TranslateError::UnresolvedPatch);
        }
        patch_instruction(state.buf, loc, (words as u32) & 0x03ff_ffff);
        Ok(())
    } else {
        Err(TranslateError::UnresolvedPatch)
    }
}

fn resolve(state: &mut JitState<'_>) -> Result<(), TranslateError> {
    let jumps = state.jumps.clone();
    for site in &jumps {
        let target = state.target_loc(&site.target)?;
        let rel = target as i64 - site.offset_loc as i64;
        resolve_branch_immediate(state, site.offset_loc, rel)?;
    }

    let loads = state.loads.clone();
    for site in &loads {
        let target = state.target_loc(&site.target)?;
        let rel = target as i64 - site.offset_loc as i64;
        debug_assert_eq!(rel % 4, 0);
        let words = rel >> 2;
        if !(-(1 << 18)..(1 << 18)).contains(&words) {
            return Err(TranslateError::UnresolvedPatch);
        }
        patch_instruction(state.buf, site.offset_loc, ((words as u32) & 0x7_ffff) << 5);
    }

    let leas = state.leas.clone();
    for site in &leas {
        let target = state.target_loc(&site.target)?;
        let rel = target as i64 - site.offset_loc as i64;
        debug_assert_eq!(rel % 4, 0);
        // adr encodes a byte offset; with 4-byte-aligned targets the low
        // pair of bits is zero and the word delta fills immhi.
        let words = rel >> 2;
        if !(-(1 << 18)..(1 << 18)).contains(&words) {
            return Err(TranslateError::UnresolvedPatch);
        }
        patch_instruction(state.buf, site.offset_loc, ((words as u32) & 0x7_ffff) << 5);
    }

    let prolog = state.prolog_size;
    let local_calls = state.local_calls.clone();
    for site in &local_calls {
        let target = state.target_loc(&site.target)?;
        // Enter through the callee's staging sequence.
        let rel = target as i64 - prolog as i64 - site.offset_loc as i64;
        resolve_branch_immediate(state, site.offset_loc, rel)?;
    }

    Ok(())
}
