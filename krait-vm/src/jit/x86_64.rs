//! x86-64 back-end.
//!
//! Emission is a single forward pass over the bytecode; control-flow sites
//! are recorded in the fixup tables and patched afterwards. The System V
//! register mapping is:
//!
//! ```text
//!   bytecode   native    usage
//!   r0         rax       return value
//!   r1..r5     rdi, rsi, rdx, r9, r8   arguments (r4 lives in r9 because
//!                                      rcx is reserved for shift counts and
//!                                      moved into place right before calls)
//!   r6..r9     rbx, r13, r14, r15      callee-saved
//!   r10        rbp       frame pointer
//! ```
//!
//! Outside the mapping, `r11` is the immediate/division scratch, `r10` the
//! blinding-key scratch, and `r12` anchors the host stack so the epilogue
//! can unwind from any call depth; the helper context pointer lives in the
//! stack slot just below the anchor.
//!
//! The emitted layout is: prologue, a call hop so bytecode `EXIT` can `ret`,
//! the translated body, the shared epilogue, the retpoline stub, then the
//! data tail (8-byte external-dispatcher slot and the 64-entry helper
//! address table).

use crate::consts::MAX_HELPERS;
use crate::error::TranslateError;
use crate::jit::support::{blinding_constant, JitState, PatchableTarget, SpecialTarget};
use crate::jit::{JitMode, TranslateContext, TranslateOutput};

use krait_asm::{join_wide_immediate, opcode as opc, Instruction};

const RAX: u8 = 0;
const RCX: u8 = 1;
const RDX: u8 = 2;
const RBX: u8 = 3;
const RSP: u8 = 4;
const RBP: u8 = 5;
const RSI: u8 = 6;
const RDI: u8 = 7;
const R8: u8 = 8;
const R9: u8 = 9;
const R10: u8 = 10;
const R11: u8 = 11;
const R12: u8 = 12;
const R13: u8 = 13;
const R14: u8 = 14;
const R15: u8 = 15;

/// In the System V ABI the fourth bytecode argument would land in `rcx`;
/// it is parked here instead and moved into `rcx` right before calls.
const RCX_ALT: u8 = R9;

/// Immediate and division scratch.
const SCRATCH: u8 = R11;
/// Second scratch for the blinding key.
const KEY_SCRATCH: u8 = R10;
/// Host stack anchor; the context pointer is spilled at `[r12 - 8]`.
const ANCHOR: u8 = R12;
/// Offset of the spilled context pointer relative to the anchor.
const CTX_DISP: i8 = -8;

const NONVOLATILE: [u8; 6] = [RBP, RBX, R12, R13, R14, R15];

const REGISTER_MAP: [u8; 11] = [RAX, RDI, RSI, RDX, R9, R8, RBX, R13, R14, R15, RBP];

fn map_register(r: u8) -> u8 {
    REGISTER_MAP[r as usize % REGISTER_MAP.len()]
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum OperandSize {
    S8,
    S16,
    S32,
    S64,
}

fn operand_size(opcode: u8) -> OperandSize {
    match opcode & opc::SIZE_MASK {
        opc::size::B => OperandSize::S8,
        opc::size::H => OperandSize::S16,
        opc::size::W => OperandSize::S32,
        _ => OperandSize::S64,
    }
}

// Encoding primitives -------------------------------------------------------

fn emit_modrm(s: &mut JitState<'_>, modbits: u8, r: u8, m: u8) {
    s.emit1(modbits | ((r & 7) << 3) | (m & 7));
}

fn emit_modrm_reg2reg(s: &mut JitState<'_>, r: u8, m: u8) {
    emit_modrm(s, 0xc0, r, m);
}

fn emit_modrm_and_displacement(s: &mut JitState<'_>, r: u8, m: u8, d: i32) {
    // rsp/r12 as base require a SIB byte; rbp/r13 with mod 00 would be
    // rip-relative, so they get a zero disp8 instead.
    let sib = (m & 7) == RSP;
    if d == 0 && (m & 7) != RBP {
        emit_modrm(s, 0x00, r, m);
        if sib {
            s.emit1(0x24);
        }
    } else if (-128..=127).contains(&d) {
        emit_modrm(s, 0x40, r, m);
        if sib {
            s.emit1(0x24);
        }
        s.emit1(d as u8);
    } else {
        emit_modrm(s, 0x80, r, m);
        if sib {
            s.emit1(0x24);
        }
        s.emit4(d as u32);
    }
}

fn emit_rex(s: &mut JitState<'_>, w: u8, r: u8, x: u8, b: u8) {
    s.emit1(0x40 | (w << 3) | (r << 2) | (x << 1) | b);
}

/// REX prefix carrying the top bits of `reg` and `rm`; skipped when no bit
/// would be set.
fn emit_basic_rex(s: &mut JitState<'_>, w: u8, reg: u8, rm: u8) {
    if w != 0 || reg & 8 != 0 || rm & 8 != 0 {
        emit_rex(s, w, u8::from(reg & 8 != 0), 0, u8::from(rm & 8 != 0));
    }
}

fn emit_push(s: &mut JitState<'_>, r: u8) {
    emit_basic_rex(s, 0, 0, r);
    s.emit1(0x50 | (r & 7));
}

fn emit_pop(s: &mut JitState<'_>, r: u8) {
    emit_basic_rex(s, 0, 0, r);
    s.emit1(0x58 | (r & 7));
}

// The MR encoding is used when there is a choice; `src` often carries an
// opcode extension instead of a register.

fn emit_alu32(s: &mut JitState<'_>, op: u8, src: u8, dst: u8) {
    emit_basic_rex(s, 0, src, dst);
    s.emit1(op);
    emit_modrm_reg2reg(s, src, dst);
}

fn emit_alu32_imm32(s: &mut JitState<'_>, op: u8, src: u8, dst: u8, imm: i32) {
    emit_alu32(s, op, src, dst);
    s.emit4(imm as u32);
}

fn emit_alu32_imm8(s: &mut JitState<'_>, op: u8, src: u8, dst: u8, imm: i8) {
    emit_alu32(s, op, src, dst);
    s.emit1(imm as u8);
}

fn emit_alu64(s: &mut JitState<'_>, op: u8, src: u8, dst: u8) {
    emit_basic_rex(s, 1, src, dst);
    s.emit1(op);
    emit_modrm_reg2reg(s, src, dst);
}

fn emit_alu64_imm32(s: &mut JitState<'_>, op: u8, src: u8, dst: u8, imm: i32) {
    emit_alu64(s, op, src, dst);
    s.emit4(imm as u32);
}

fn emit_alu64_imm8(s: &mut JitState<'_>, op: u8, src: u8, dst: u8, imm: i8) {
    emit_alu64(s, op, src, dst);
    s.emit1(imm as u8);
}

fn emit_mov(s: &mut JitState<'_>, src: u8, dst: u8) {
    emit_alu64(s, 0x89, src, dst);
}

/// 32-bit register move; zero-extends into the upper half.
fn emit_mov32(s: &mut JitState<'_>, src: u8, dst: u8) {
    emit_alu32(s, 0x89, src, dst);
}

fn emit_cmp_imm32(s: &mut JitState<'_>, dst: u8, imm: i32) {
    emit_alu64_imm32(s, 0x81, 7, dst, imm);
}

fn emit_cmp32_imm32(s: &mut JitState<'_>, dst: u8, imm: i32) {
    emit_alu32_imm32(s, 0x81, 7, dst, imm);
}

fn emit_cmp(s: &mut JitState<'_>, src: u8, dst: u8) {
    emit_alu64(s, 0x39, src, dst);
}

fn emit_cmp32(s: &mut JitState<'_>, src: u8, dst: u8) {
    emit_alu32(s, 0x39, src, dst);
}

/// Conditional branch with a to-be-patched 32-bit displacement; returns the
/// displacement's location for late retargeting.
fn emit_jcc(s: &mut JitState<'_>, code: u8, target: PatchableTarget) -> u32 {
    s.emit1(0x0f);
    s.emit1(code);
    let loc = s.offset as u32;
    s.note_jump(target);
    s.emit4(0);
    loc
}

/// Unconditional branch with a to-be-patched 32-bit displacement; returns
/// the displacement's location for late retargeting.
fn emit_jmp(s: &mut JitState<'_>, target: PatchableTarget) -> u32 {
    s.emit1(0xe9);
    let loc = s.offset as u32;
    s.note_jump(target);
    s.emit4(0);
    loc
}

fn emit_ret(s: &mut JitState<'_>) {
    s.emit1(0xc3);
}

/// Zero-extending load of `[src + offset]` into `dst`.
fn emit_load(s: &mut JitState<'_>, size: OperandSize, src: u8, dst: u8, offset: i32) {
    emit_basic_rex(s, u8::from(size == OperandSize::S64), dst, src);
    match size {
        OperandSize::S8 => {
            s.emit1(0x0f);
            s.emit1(0xb6);
        }
        OperandSize::S16 => {
            s.emit1(0x0f);
            s.emit1(0xb7);
        }
        OperandSize::S32 | OperandSize::S64 => s.emit1(0x8b),
    }
    emit_modrm_and_displacement(s, dst, src, offset);
}

/// Sign-extending load of `[src + offset]` into the full width of `dst`.
fn emit_load_sx(s: &mut JitState<'_>, size: OperandSize, src: u8, dst: u8, offset: i32) {
    emit_basic_rex(s, 1, dst, src);
    match size {
        OperandSize::S8 => {
            s.emit1(0x0f);
            s.emit1(0xbe);
        }
        OperandSize::S16 => {
            s.emit1(0x0f);
            s.emit1(0xbf);
        }
        // movsxd
        _ => s.emit1(0x63),
    }
    emit_modrm_and_displacement(s, dst, src, offset);
}

/// Sign-extended immediate into `dst`, using the shortest encoding.
fn emit_load_imm(s: &mut JitState<'_>, dst: u8, imm: i64) {
    if i32::try_from(imm).is_ok() {
        emit_alu64_imm32(s, 0xc7, 0, dst, imm as i32);
    } else {
        // movabs
        emit_basic_rex(s, 1, 0, dst);
        s.emit1(0xb8 | (dst & 7));
        s.emit8(imm as u64);
    }
}

/// Immediate into `dst` through the blinding sequence: the buffer carries
/// `imm ^ key` and `key`, never `imm` itself.
fn emit_load_imm_blinded(s: &mut JitState<'_>, dst: u8, imm: i64) {
    let key = blinding_constant();
    let blinded = imm as u64 ^ key;
    emit_load_imm(s, dst, blinded as i64);
    emit_load_imm(s, KEY_SCRATCH, key as i64);
    emit_alu64(s, 0x31, KEY_SCRATCH, dst);
}

fn emit_load_immediate(s: &mut JitState<'_>, ctx: &TranslateContext<'_>, dst: u8, imm: i64) {
    if ctx.constant_blinding {
        emit_load_imm_blinded(s, dst, imm);
    } else {
        emit_load_imm(s, dst, imm);
    }
}

/// Store `src` to `[dst + offset]`.
fn emit_store(s: &mut JitState<'_>, size: OperandSize, src: u8, dst: u8, offset: i32) {
    if size == OperandSize::S16 {
        s.emit1(0x66);
    }
    let rexw = u8::from(size == OperandSize::S64);
    if rexw != 0 || src & 8 != 0 || dst & 8 != 0 || size == OperandSize::S8 {
        emit_rex(s, rexw, u8::from(src & 8 != 0), 0, u8::from(dst & 8 != 0));
    }
    s.emit1(if size == OperandSize::S8 { 0x88 } else { 0x89 });
    emit_modrm_and_displacement(s, src, dst, offset);
}

/// Store an immediate to `[dst + offset]`.
fn emit_store_imm32(s: &mut JitState<'_>, size: OperandSize, dst: u8, offset: i32, imm: i32) {
    if size == OperandSize::S16 {
        s.emit1(0x66);
    }
    emit_basic_rex(s, u8::from(size == OperandSize::S64), 0, dst);
    s.emit1(if size == OperandSize::S8 { 0xc6 } else { 0xc7 });
    emit_modrm_and_displacement(s, 0, dst, offset);
    match size {
        OperandSize::S8 => s.emit1(imm as u8),
        OperandSize::S16 => s.emit2(imm as u16),
        _ => s.emit4(imm as u32),
    }
}

/// `dst = [anchor + CTX_DISP]`, the spilled context pointer. The anchor is
/// `r12`, whose base encoding requires a SIB byte.
fn emit_load_ctx(s: &mut JitState<'_>, dst: u8) {
    emit_rex(s, 1, u8::from(dst & 8 != 0), 0, 1);
    s.emit1(0x8b);
    emit_modrm(s, 0x40, dst, 0b100);
    s.emit1(0x24);
    s.emit1(CTX_DISP as u8);
}

/// `push qword [anchor + CTX_DISP]`.
fn emit_push_ctx(s: &mut JitState<'_>) {
    s.emit1(0x41);
    s.emit1(0xff);
    emit_modrm(s, 0x40, 6, 0b100);
    s.emit1(0x24);
    s.emit1(CTX_DISP as u8);
}

/// Indirect call through `rax`, routed via the retpoline stub.
fn emit_call_through_rax(s: &mut JitState<'_>) {
    s.emit1(0xe8);
    s.note_jump(PatchableTarget::Special(SpecialTarget::Retpoline));
    s.emit4(0);
}

/// One local call: adjust `r10` by the caller's staged stack usage, save the
/// callee-saved bytecode registers, and branch-with-link to the callee's
/// staging sequence.
fn emit_local_call(s: &mut JitState<'_>, target_pc: u32) {
    // The staged usage of the current function sits on top of the stack.
    emit_load(s, OperandSize::S64, RSP, SCRATCH, 0);
    emit_alu64(s, 0x29, SCRATCH, map_register(10));

    emit_push(s, map_register(6));
    emit_push(s, map_register(7));
    emit_push(s, map_register(8));
    emit_push(s, map_register(9));

    s.emit1(0xe8);
    s.note_local_call(PatchableTarget::pc(target_pc));
    s.emit4(0);

    emit_pop(s, map_register(9));
    emit_pop(s, map_register(8));
    emit_pop(s, map_register(7));
    emit_pop(s, map_register(6));

    emit_load(s, OperandSize::S64, RSP, SCRATCH, 0);
    emit_alu64(s, 0x01, SCRATCH, map_register(10));
}

/// The two-path helper call: prefer the external dispatcher when its slot is
/// non-null, fall back to the per-index table. Both paths rendezvous at one
/// indirect call with the context pushed as a potential seventh argument.
fn emit_dispatched_helper_call(s: &mut JitState<'_>, ctx: &TranslateContext<'_>, idx: u32) {
    // r4 must migrate into rcx to satisfy the calling convention.
    emit_mov(s, RCX_ALT, RCX);

    emit_alu64_imm8(s, 0x83, 5, RSP, 8);
    emit_push_ctx(s);

    // rip-relative load of the dispatcher slot.
    s.emit1(0x48);
    s.emit1(0x8b);
    s.emit1(0x05);
    s.note_load(PatchableTarget::Special(SpecialTarget::ExternalDispatcher));
    s.emit4(0);

    emit_alu64(s, 0x85, RAX, RAX);
    let dispatcher_jump = emit_jcc(s, 0x85, PatchableTarget::pc(0));

    // Per-index path: reach into the helper table emitted after the code.
    s.emit1(0x48);
    s.emit1(0x8d);
    s.emit1(0x05);
    s.note_lea(PatchableTarget::Special(SpecialTarget::LoadHelperTable));
    s.emit4(0);
    emit_basic_rex(s, 1, RAX, RAX);
    s.emit1(0x8b);
    emit_modrm(s, 0x80, RAX, RAX);
    s.emit4(idx * 8);
    // Context as the sixth argument.
    emit_load_ctx(s, R9);
    let rendezvous_jump = emit_jmp(s, PatchableTarget::pc(0));

    // Dispatcher path: the helper index becomes the sixth argument and the
    // context the seventh, already waiting on the stack.
    s.set_jump_target_here(dispatcher_jump);
    emit_load_immediate(s, ctx, R9, idx as i64);

    s.set_jump_target_here(rendezvous_jump);
    emit_call_through_rax(s);
    emit_alu64_imm8(s, 0x83, 0, RSP, 16);
}

/// Register-indexed helper call. The index is masked into the table; an
/// empty slot terminates the program through the shared epilogue.
fn emit_callx(s: &mut JitState<'_>, dst: u8) {
    emit_mov(s, dst, RAX);
    emit_alu32_imm8(s, 0x83, 4, RAX, (MAX_HELPERS - 1) as i8);
    s.emit1(0x4c);
    s.emit1(0x8d);
    s.emit1(0x1d);
    s.note_lea(PatchableTarget::Special(SpecialTarget::LoadHelperTable));
    s.emit4(0);
    // rax = [r11 + rax*8]
    s.emit1(0x49);
    s.emit1(0x8b);
    s.emit1(0x04);
    s.emit1(0xc3);
    emit_alu64(s, 0x85, RAX, RAX);
    emit_jcc(s, 0x84, PatchableTarget::Special(SpecialTarget::Exit));

    emit_mov(s, RCX_ALT, RCX);
    emit_load_ctx(s, R9);
    emit_call_through_rax(s);
}

/// Multiply, divide and modulo, with the defined divide-by-zero and signed
/// overflow results.
fn muldivmod(s: &mut JitState<'_>, ctx: &TranslateContext<'_>, inst: &Instruction) {
    let opcode = inst.opcode();
    let mul = opcode & opc::ALU_OP_MASK == opc::MUL_IMM & opc::ALU_OP_MASK;
    let div = opcode & opc::ALU_OP_MASK == opc::DIV_IMM & opc::ALU_OP_MASK;
    let modulo = opcode & opc::ALU_OP_MASK == opc::MOD_IMM & opc::ALU_OP_MASK;
    let is64 = opcode & opc::CLS_MASK == opc::class::ALU64;
    let reg_form = opcode & opc::SRC_REG != 0;
    let signed = inst.offset() == 1;
    let dst = map_register(inst.dst());
    let src = map_register(inst.src());
    let imm = inst.imm();

    if mul {
        // imul needs none of the rax/rdx choreography.
        if reg_form {
            emit_basic_rex(s, u8::from(is64), dst, src);
            s.emit1(0x0f);
            s.emit1(0xaf);
            emit_modrm_reg2reg(s, dst, src);
        } else if ctx.constant_blinding {
            emit_load_imm_blinded(s, SCRATCH, imm as i64);
            emit_basic_rex(s, u8::from(is64), dst, SCRATCH);
            s.emit1(0x0f);
            s.emit1(0xaf);
            emit_modrm_reg2reg(s, dst, SCRATCH);
        } else {
            emit_basic_rex(s, u8::from(is64), dst, dst);
            s.emit1(0x69);
            emit_modrm_reg2reg(s, dst, dst);
            s.emit4(imm as u32);
        }
        return;
    }

    // Divisor of zero is fully defined: quotient 0, remainder the dividend.
    if !reg_form && imm == 0 && !ctx.constant_blinding {
        if div {
            emit_alu32(s, 0x31, dst, dst);
        } else if !is64 {
            // The 32-bit remainder is the low word of the dividend.
            emit_mov32(s, dst, dst);
        }
        return;
    }

    if dst != RAX {
        emit_push(s, RAX);
    }
    if dst != RDX {
        emit_push(s, RDX);
    }

    if reg_form {
        emit_mov(s, src, RCX);
    } else {
        emit_load_immediate(s, ctx, RCX, imm as i64);
    }
    emit_mov(s, dst, RAX);

    // test rcx, rcx
    if is64 {
        emit_alu64(s, 0x85, RCX, RCX);
    } else {
        emit_alu32(s, 0x85, RCX, RCX);
    }
    // jne over the zero-divisor fixup: mov rdx, rax; xor eax, eax; jmp store
    let fixup_len: i8 = 3 + 2 + 2;
    emit_jcc_rel8(s, 0x75, fixup_len);
    emit_mov(s, RAX, RDX);
    emit_alu32(s, 0x31, RAX, RAX);
    let to_store = s.offset;
    emit_jmp_rel8_placeholder(s);

    let mut minus_one_jump = None;
    if signed {
        // Divisor -1 would trap on the most negative dividend; the defined
        // result is a wrapped negation (quotient) and zero (remainder).
        if is64 {
            emit_alu64_imm8(s, 0x83, 7, RCX, -1);
        } else {
            emit_alu32_imm8(s, 0x83, 7, RCX, -1);
        }
        // xor edx,edx + neg + jmp; the 32-bit neg lacks a REX byte.
        let fixup: i8 = if is64 { 7 } else { 6 };
        emit_jcc_rel8(s, 0x75, fixup);
        emit_alu32(s, 0x31, RDX, RDX);
        if is64 {
            emit_alu64(s, 0xf7, 3, RAX);
        } else {
            emit_alu32(s, 0xf7, 3, RAX);
        }
        minus_one_jump = Some(s.offset);
        emit_jmp_rel8_placeholder(s);

        if is64 {
            s.emit1(0x48);
        }
        s.emit1(0x99); // cqo / cdq
    } else {
        emit_alu32(s, 0x31, RDX, RDX);
    }

    if is64 {
        emit_rex(s, 1, 0, 0, u8::from(RCX & 8 != 0));
    }
    s.emit1(0xf7);
    emit_modrm_reg2reg(s, if signed { 7 } else { 6 }, RCX);

    // Store label: both fixup paths land here.
    patch_rel8(s, to_store);
    if let Some(from) = minus_one_jump {
        patch_rel8(s, from);
    }

    if dst != RDX {
        if modulo {
            emit_mov(s, RDX, dst);
        }
        emit_pop(s, RDX);
    }
    if dst != RAX {
        if div {
            emit_mov(s, RAX, dst);
        }
        emit_pop(s, RAX);
    }
    if !is64 {
        // The 32-bit flavour leaves a zero-extended result.
        emit_mov32(s, dst, dst);
    }
}

/// Short forward jcc with a fixed byte distance, for in-sequence fixups.
fn emit_jcc_rel8(s: &mut JitState<'_>, code: u8, distance: i8) {
    s.emit1(code);
    s.emit1(distance as u8);
}

/// `jmp rel8` whose displacement is patched by [`patch_rel8`].
fn emit_jmp_rel8_placeholder(s: &mut JitState<'_>) {
    s.emit1(0xeb);
    s.emit1(0);
}

/// Aim the rel8 placeholder issued at `from` at the current offset.
fn patch_rel8(s: &mut JitState<'_>, from: usize) {
    let rel = s.offset as i64 - (from as i64 + 2);
    debug_assert!((-128..=127).contains(&rel));
    if from + 1 < s.buf.len() {
        s.buf[from + 1] = rel as i64 as u8;
    }
}

/// Atomic read-modify-write emission.
fn emit_atomic(s: &mut JitState<'_>, inst: &Instruction, is64: bool) {
    let dst = map_register(inst.dst());
    let src = map_register(inst.src());
    let offset = inst.offset() as i32;
    let sub_op = inst.imm();
    let fetch = sub_op & opc::atomic::FETCH != 0;
    let w = u8::from(is64);

    let alu_opcode = |op: i32| -> u8 {
        match op {
            v if v == opc::atomic::ADD => 0x01,
            v if v == opc::atomic::OR => 0x09,
            v if v == opc::atomic::AND => 0x21,
            _ => 0x31,
        }
    };

    if sub_op == opc::atomic::XCHG {
        // xchg locks implicitly and always fetches.
        emit_basic_rex(s, w, src, dst);
        s.emit1(0x87);
        emit_modrm_and_displacement(s, src, dst, offset);
        if !is64 {
            emit_mov32(s, src, src);
        }
        return;
    }

    if sub_op == opc::atomic::CMPXCHG {
        // rax is both the bytecode r0 and the hardware comparand; it always
        // receives the pre-update value.
        s.emit1(0xf0);
        emit_basic_rex(s, w, src, dst);
        s.emit1(0x0f);
        s.emit1(0xb1);
        emit_modrm_and_displacement(s, src, dst, offset);
        if !is64 {
            emit_mov32(s, RAX, RAX);
        }
        return;
    }

    let masked = sub_op & !opc::atomic::FETCH;
    if !fetch {
        // Plain read-modify-write: one lock-prefixed instruction.
        s.emit1(0xf0);
        emit_basic_rex(s, w, src, dst);
        s.emit1(alu_opcode(masked));
        emit_modrm_and_displacement(s, src, dst, offset);
        return;
    }

    if masked == opc::atomic::ADD {
        // lock xadd returns the pre-update value in src.
        s.emit1(0xf0);
        emit_basic_rex(s, w, src, dst);
        s.emit1(0x0f);
        s.emit1(0xc1);
        emit_modrm_and_displacement(s, src, dst, offset);
        if !is64 {
            emit_mov32(s, src, src);
        }
        return;
    }

    // {or, and, xor} with fetch: a compare-exchange loop. The address moves
    // into the key scratch so a dst of rax cannot collide with the
    // comparand, and rax is preserved around the loop.
    emit_mov(s, dst, KEY_SCRATCH);
    emit_push(s, RAX);
    emit_load(s, if is64 { OperandSize::S64 } else { OperandSize::S32 }, KEY_SCRATCH, RAX, offset);
    let retry = s.offset;
    emit_mov(s, RAX, SCRATCH);
    if src == RAX {
        // rax now holds the loaded value; the bytecode operand was spilled
        // by the push, so combine from [rsp] with the RM form.
        emit_basic_rex(s, w, SCRATCH, 0);
        s.emit1(alu_opcode(masked) + 2);
        emit_modrm(s, 0x00, SCRATCH, 0b100);
        s.emit1(0x24);
    } else if is64 {
        emit_alu64(s, alu_opcode(masked), src, SCRATCH);
    } else {
        emit_alu32(s, alu_opcode(masked), src, SCRATCH);
    }
    s.emit1(0xf0);
    emit_basic_rex(s, w, SCRATCH, KEY_SCRATCH);
    s.emit1(0x0f);
    s.emit1(0xb1);
    emit_modrm_and_displacement(s, SCRATCH, KEY_SCRATCH, offset);
    // jne retry
    let rel = retry as i64 - (s.offset as i64 + 2);
    emit_jcc_rel8(s, 0x75, rel as i8);
    // The pre-update value is in rax; move it to src and restore r0.
    if src == RAX {
        emit_alu64_imm8(s, 0x83, 0, RSP, 8);
    } else if is64 {
        emit_mov(s, RAX, src);
        emit_pop(s, RAX);
    } else {
        emit_mov32(s, RAX, src);
        emit_pop(s, RAX);
    }
}

/// Spectre mitigation for the indirect helper calls, after the published
/// retpoline recipe.
fn emit_retpoline(s: &mut JitState<'_>) -> u32 {
    let retpoline_loc = s.offset as u32;

    // call label1
    s.emit1(0xe8);
    s.emit4(4);

    // capture_ret_spec: pause; jmp capture_ret_spec
    s.emit1(0xf3);
    s.emit1(0x90);
    s.emit1(0xeb);
    s.emit1(0xfc);

    // label1: mov [rsp], rax; ret
    s.emit1(0x48);
    s.emit1(0x89);
    s.emit1(0x04);
    s.emit1(0x24);
    emit_ret(s);

    retpoline_loc
}

// Translation ---------------------------------------------------------------

pub(crate) fn translate(
    ctx: &TranslateContext<'_>,
    buf: &mut [u8],
    mode: JitMode,
) -> Result<TranslateOutput, TranslateError> {
    let mut state = JitState::new(buf, ctx.insts.len(), mode);
    let s = &mut state;

    emit_prologue(s);

    let mut i = 0usize;
    while i < ctx.insts.len() {
        if !s.ok() {
            break;
        }
        let inst = ctx.insts[i];
        emit_function_staging(s, ctx, i);
        s.pc_locs[i] = s.offset as u32;
        i += emit_instruction(s, ctx, i, &inst);
    }

    if let Some(error) = state.status.clone() {
        return Err(error);
    }

    emit_epilogue(&mut state);
    // Branch targets one past the last instruction fall through to the
    // epilogue.
    state.pc_locs[ctx.insts.len()] = state.exit_loc;

    state.retpoline_loc = emit_retpoline(&mut state);
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

fn emit_prologue(s: &mut JitState<'_>) {
    for reg in NONVOLATILE {
        emit_push(s, reg);
    }
    // Anchor the host stack and spill the context (first argument) below it.
    emit_mov(s, RSP, ANCHOR);
    emit_push(s, RDI);

    match s.mode {
        JitMode::Basic => {
            // r10 tops the machine-owned stack carved out of the host stack.
            emit_mov(s, RSP, map_register(10));
            emit_alu64_imm32(s, 0x81, 5, RSP, crate::consts::STACK_SIZE as i32);
        }
        JitMode::Extended => {
            // r10 tops the caller-supplied buffer; r3/r4 already describe it.
            emit_mov(s, RDX, map_register(10));
            emit_alu64(s, 0x01, RCX, map_register(10));
            emit_mov(s, RCX, map_register(4));
        }
    }

    // A call hop so the final EXIT can `ret` into the jump below.
    s.emit1(0xe8);
    s.emit4(5);
    emit_jmp(s, PatchableTarget::Special(SpecialTarget::Exit));
    s.entry_loc = s.offset as u32;
}

/// Stage the stack usage of a function beginning at `i`, jumping around the
/// staging when the preceding instruction can fall into it.
fn emit_function_staging(s: &mut JitState<'_>, ctx: &TranslateContext<'_>, i: usize) {
    let is_entry = i == 0 || ctx.local_entries.get(i).copied().unwrap_or(false);
    if !is_entry {
        return;
    }

    if i != 0 && ctx.insts[i - 1].has_fallthrough() {
        let guard = emit_jmp(s, PatchableTarget::pc(0));
        emit_staging_push(s, ctx, i);
        s.set_jump_target_here(guard);
    } else {
        emit_staging_push(s, ctx, i);
    }
}

fn emit_staging_push(s: &mut JitState<'_>, ctx: &TranslateContext<'_>, i: usize) {
    let start = s.offset;
    let usage = ctx.stack_usages.get(i).copied().unwrap_or(0);
    s.emit1(0x68);
    s.emit4(usage as u32);
    let len = (s.offset - start) as u32;
    if s.prolog_size == 0 {
        s.prolog_size = len;
    }
    debug_assert_eq!(s.prolog_size, len);
}

fn emit_epilogue(s: &mut JitState<'_>) {
    s.exit_loc = s.offset as u32;

    // r0 already lives in rax. The anchor knows where the host frame is no
    // matter how deep the bytecode was when it exited.
    emit_mov(s, ANCHOR, RSP);
    for reg in NONVOLATILE.iter().rev() {
        emit_pop(s, *reg);
    }
    emit_ret(s);
}

fn emit_data_tail(s: &mut JitState<'_>, ctx: &TranslateContext<'_>) {
    while s.offset % 8 != 0 {
        s.emit1(0x00);
    }
    s.dispatcher_loc = s.offset as u32;
    s.emit8(ctx.dispatcher_addr);

    s.helper_table_loc = s.offset as u32;
    for addr in ctx.helper_addresses {
        s.emit8(addr);
    }
}

/// Emit one bytecode instruction; returns how many slots it consumed.
fn emit_instruction(
    s: &mut JitState<'_>,
    ctx: &TranslateContext<'_>,
    i: usize,
    inst: &Instruction,
) -> usize {
    let opcode = inst.opcode();
    let dst = map_register(inst.dst());
    let src = map_register(inst.src());
    let imm = inst.imm();
    let offset = inst.offset() as i32;
    let target_pc = if opcode == opc::JA32 {
        (i as i64 + imm as i64 + 1) as u32
    } else {
        (i as i64 + inst.offset() as i64 + 1) as u32
    };
    let tgt = PatchableTarget::pc(target_pc);
    let blinding = ctx.constant_blinding;

    // With blinding on, immediate operands are materialised through the
    // scratch register and the operation becomes its register form.
    let alu_imm = |s: &mut JitState<'_>, ext: u8, reg_op: u8, is64: bool| {
        if blinding {
            emit_load_imm_blinded(s, SCRATCH, imm as i64);
            if is64 {
                emit_alu64(s, reg_op, SCRATCH, dst);
            } else {
                emit_alu32(s, reg_op, SCRATCH, dst);
            }
        } else if is64 {
            emit_alu64_imm32(s, 0x81, ext, dst, imm);
        } else {
            emit_alu32_imm32(s, 0x81, ext, dst, imm);
        }
    };

    let shift_imm = |s: &mut JitState<'_>, ext: u8, is64: bool| {
        if blinding {
            emit_load_imm_blinded(s, RCX, imm as i64);
            if is64 {
                emit_alu64(s, 0xd3, ext, dst);
            } else {
                emit_alu32(s, 0xd3, ext, dst);
            }
        } else if is64 {
            emit_alu64_imm8(s, 0xc1, ext, dst, imm as i8);
        } else {
            emit_alu32_imm8(s, 0xc1, ext, dst, imm as i8);
        }
    };

    let jump_imm = |s: &mut JitState<'_>, code: u8, is64: bool| {
        if blinding {
            emit_load_imm_blinded(s, SCRATCH, imm as i64);
            if is64 {
                emit_cmp(s, SCRATCH, dst);
            } else {
                emit_cmp32(s, SCRATCH, dst);
            }
        } else if is64 {
            emit_cmp_imm32(s, dst, imm);
        } else {
            emit_cmp32_imm32(s, dst, imm);
        }
        emit_jcc(s, code, tgt);
    };

    let jump_reg = |s: &mut JitState<'_>, code: u8, is64: bool| {
        if is64 {
            emit_cmp(s, src, dst);
        } else {
            emit_cmp32(s, src, dst);
        }
        emit_jcc(s, code, tgt);
    };

    match opcode {
        opc::ADD_IMM => alu_imm(s, 0, 0x01, false),
        opc::ADD_REG => emit_alu32(s, 0x01, src, dst),
        opc::SUB_IMM => alu_imm(s, 5, 0x29, false),
        opc::SUB_REG => emit_alu32(s, 0x29, src, dst),
        opc::OR_IMM => alu_imm(s, 1, 0x09, false),
        opc::OR_REG => emit_alu32(s, 0x09, src, dst),
        opc::AND_IMM => alu_imm(s, 4, 0x21, false),
        opc::AND_REG => emit_alu32(s, 0x21, src, dst),
        opc::XOR_IMM => alu_imm(s, 6, 0x31, false),
        opc::XOR_REG => emit_alu32(s, 0x31, src, dst),
        opc::MUL_IMM | opc::MUL_REG | opc::DIV_IMM | opc::DIV_REG | opc::MOD_IMM | opc::MOD_REG => {
            muldivmod(s, ctx, inst)
        }
        opc::LSH_IMM => shift_imm(s, 4, false),
        opc::LSH_REG => {
            emit_mov(s, src, RCX);
            emit_alu32(s, 0xd3, 4, dst);
        }
        opc::RSH_IMM => shift_imm(s, 5, false),
        opc::RSH_REG => {
            emit_mov(s, src, RCX);
            emit_alu32(s, 0xd3, 5, dst);
        }
        opc::ARSH_IMM => shift_imm(s, 7, false),
        opc::ARSH_REG => {
            emit_mov(s, src, RCX);
            emit_alu32(s, 0xd3, 7, dst);
        }
        opc::NEG => emit_alu32(s, 0xf7, 3, dst),
        opc::MOV_IMM => {
            if blinding {
                emit_load_imm_blinded(s, dst, imm as u32 as i64);
            } else {
                emit_alu32_imm32(s, 0xc7, 0, dst, imm);
            }
        }
        opc::MOV_REG => match inst.offset() {
            8 => {
                // A byte-width source needs the REX prefix even without
                // extension bits, else sil/dil/bpl decode as dh/bh/ch.
                emit_rex(s, 0, u8::from(dst & 8 != 0), 0, u8::from(src & 8 != 0));
                s.emit1(0x0f);
                s.emit1(0xbe);
                emit_modrm_reg2reg(s, dst, src);
            }
            16 => {
                emit_basic_rex(s, 0, dst, src);
                s.emit1(0x0f);
                s.emit1(0xbf);
                emit_modrm_reg2reg(s, dst, src);
            }
            _ => emit_mov32(s, src, dst),
        },
        opc::LE => match imm {
            // Little-endian host: truncate to the requested width.
            8 => emit_alu32_imm32(s, 0x81, 4, dst, 0xff),
            16 => emit_alu32_imm32(s, 0x81, 4, dst, 0xffff),
            32 => emit_mov32(s, dst, dst),
            _ => {}
        },
        opc::BE => emit_swap(s, dst, imm),
        opc::BSWAP => emit_swap(s, dst, imm),

        opc::ADD64_IMM => alu_imm(s, 0, 0x01, true),
        opc::ADD64_REG => emit_alu64(s, 0x01, src, dst),
        opc::SUB64_IMM => alu_imm(s, 5, 0x29, true),
        opc::SUB64_REG => emit_alu64(s, 0x29, src, dst),
        opc::OR64_IMM => alu_imm(s, 1, 0x09, true),
        opc::OR64_REG => emit_alu64(s, 0x09, src, dst),
        opc::AND64_IMM => alu_imm(s, 4, 0x21, true),
        opc::AND64_REG => emit_alu64(s, 0x21, src, dst),
        opc::XOR64_IMM => alu_imm(s, 6, 0x31, true),
        opc::XOR64_REG => emit_alu64(s, 0x31, src, dst),
        opc::MUL64_IMM | opc::MUL64_REG | opc::DIV64_IMM | opc::DIV64_REG | opc::MOD64_IMM
        | opc::MOD64_REG => muldivmod(s, ctx, inst),
        opc::LSH64_IMM => shift_imm(s, 4, true),
        opc::LSH64_REG => {
            emit_mov(s, src, RCX);
            emit_alu64(s, 0xd3, 4, dst);
        }
        opc::RSH64_IMM => shift_imm(s, 5, true),
        opc::RSH64_REG => {
            emit_mov(s, src, RCX);
            emit_alu64(s, 0xd3, 5, dst);
        }
        opc::ARSH64_IMM => shift_imm(s, 7, true),
        opc::ARSH64_REG => {
            emit_mov(s, src, RCX);
            emit_alu64(s, 0xd3, 7, dst);
        }
        opc::NEG64 => emit_alu64(s, 0xf7, 3, dst),
        opc::MOV64_IMM => emit_load_immediate(s, ctx, dst, imm as i64),
        opc::MOV64_REG => match inst.offset() {
            8 => {
                emit_basic_rex(s, 1, dst, src);
                s.emit1(0x0f);
                s.emit1(0xbe);
                emit_modrm_reg2reg(s, dst, src);
            }
            16 => {
                emit_basic_rex(s, 1, dst, src);
                s.emit1(0x0f);
                s.emit1(0xbf);
                emit_modrm_reg2reg(s, dst, src);
            }
            32 => {
                emit_basic_rex(s, 1, dst, src);
                s.emit1(0x63);
                emit_modrm_reg2reg(s, dst, src);
            }
            _ => emit_mov(s, src, dst),
        },

        opc::JA | opc::JA32 => {
            emit_jmp(s, tgt);
        }
        opc::JEQ_IMM => jump_imm(s, 0x84, true),
        opc::JEQ_REG => jump_reg(s, 0x84, true),
        opc::JGT_IMM => jump_imm(s, 0x87, true),
        opc::JGT_REG => jump_reg(s, 0x87, true),
        opc::JGE_IMM => jump_imm(s, 0x83, true),
        opc::JGE_REG => jump_reg(s, 0x83, true),
        opc::JLT_IMM => jump_imm(s, 0x82, true),
        opc::JLT_REG => jump_reg(s, 0x82, true),
        opc::JLE_IMM => jump_imm(s, 0x86, true),
        opc::JLE_REG => jump_reg(s, 0x86, true),
        opc::JNE_IMM => jump_imm(s, 0x85, true),
        opc::JNE_REG => jump_reg(s, 0x85, true),
        opc::JSGT_IMM => jump_imm(s, 0x8f, true),
        opc::JSGT_REG => jump_reg(s, 0x8f, true),
        opc::JSGE_IMM => jump_imm(s, 0x8d, true),
        opc::JSGE_REG => jump_reg(s, 0x8d, true),
        opc::JSLT_IMM => jump_imm(s, 0x8c, true),
        opc::JSLT_REG => jump_reg(s, 0x8c, true),
        opc::JSLE_IMM => jump_imm(s, 0x8e, true),
        opc::JSLE_REG => jump_reg(s, 0x8e, true),
        opc::JSET_IMM => {
            if blinding {
                emit_load_imm_blinded(s, SCRATCH, imm as i64);
                emit_alu64(s, 0x85, SCRATCH, dst);
            } else {
                emit_alu64_imm32(s, 0xf7, 0, dst, imm);
            }
            emit_jcc(s, 0x85, tgt);
        }
        opc::JSET_REG => {
            emit_alu64(s, 0x85, src, dst);
            emit_jcc(s, 0x85, tgt);
        }
        opc::JEQ32_IMM => jump_imm(s, 0x84, false),
        opc::JEQ32_REG => jump_reg(s, 0x84, false),
        opc::JGT32_IMM => jump_imm(s, 0x87, false),
        opc::JGT32_REG => jump_reg(s, 0x87, false),
        opc::JGE32_IMM => jump_imm(s, 0x83, false),
        opc::JGE32_REG => jump_reg(s, 0x83, false),
        opc::JLT32_IMM => jump_imm(s, 0x82, false),
        opc::JLT32_REG => jump_reg(s, 0x82, false),
        opc::JLE32_IMM => jump_imm(s, 0x86, false),
        opc::JLE32_REG => jump_reg(s, 0x86, false),
        opc::JNE32_IMM => jump_imm(s, 0x85, false),
        opc::JNE32_REG => jump_reg(s, 0x85, false),
        opc::JSGT32_IMM => jump_imm(s, 0x8f, false),
        opc::JSGT32_REG => jump_reg(s, 0x8f, false),
        opc::JSGE32_IMM => jump_imm(s, 0x8d, false),
        opc::JSGE32_REG => jump_reg(s, 0x8d, false),
        opc::JSLT32_IMM => jump_imm(s, 0x8c, false),
        opc::JSLT32_REG => jump_reg(s, 0x8c, false),
        opc::JSLE32_IMM => jump_imm(s, 0x8e, false),
        opc::JSLE32_REG => jump_reg(s, 0x8e, false),
        opc::JSET32_IMM => {
            if blinding {
                emit_load_imm_blinded(s, SCRATCH, imm as i64);
                emit_alu32(s, 0x85, SCRATCH, dst);
            } else {
                emit_alu32_imm32(s, 0xf7, 0, dst, imm);
            }
            emit_jcc(s, 0x85, tgt);
        }
        opc::JSET32_REG => {
            emit_alu32(s, 0x85, src, dst);
            emit_jcc(s, 0x85, tgt);
        }

        opc::CALL if inst.src() == 0 => {
            emit_dispatched_helper_call(s, ctx, imm as u32);
            if ctx.unwind_index == Some(imm as u32) {
                emit_cmp_imm32(s, map_register(0), 0);
                emit_jcc(s, 0x84, PatchableTarget::Special(SpecialTarget::Exit));
            }
        }
        opc::CALL if inst.src() == 1 => {
            emit_local_call(s, (i as i64 + imm as i64 + 1) as u32);
        }
        opc::CALL => {
            emit_jmp(s, PatchableTarget::Special(SpecialTarget::Exit));
        }
        opc::CALLX => emit_callx(s, dst),
        opc::EXIT => {
            // Drop the staged stack usage and return to the caller (the
            // local call site, or the prologue hop for the entry function).
            emit_alu64_imm8(s, 0x83, 0, RSP, 8);
            emit_ret(s);
        }

        opc::LDXW => emit_load(s, OperandSize::S32, src, dst, offset),
        opc::LDXH => emit_load(s, OperandSize::S16, src, dst, offset),
        opc::LDXB => emit_load(s, OperandSize::S8, src, dst, offset),
        opc::LDXDW => emit_load(s, OperandSize::S64, src, dst, offset),
        opc::LDXWSX => emit_load_sx(s, OperandSize::S32, src, dst, offset),
        opc::LDXHSX => emit_load_sx(s, OperandSize::S16, src, dst, offset),
        opc::LDXBSX => emit_load_sx(s, OperandSize::S8, src, dst, offset),

        opc::STW | opc::STH | opc::STB | opc::STDW => {
            let size = operand_size(opcode);
            if blinding {
                emit_load_imm_blinded(s, SCRATCH, imm as i64);
                emit_store(s, size, SCRATCH, dst, offset);
            } else {
                emit_store_imm32(s, size, dst, offset, imm);
            }
        }
        opc::STXW | opc::STXH | opc::STXB | opc::STXDW => {
            emit_store(s, operand_size(opcode), src, dst, offset);
        }
        opc::ATOMIC_STORE => emit_atomic(s, inst, true),
        opc::ATOMIC32_STORE => emit_atomic(s, inst, false),

        opc::LDDW => {
            let high = ctx.insts[i + 1].imm();
            let value = join_wide_immediate(imm, high);
            s.pc_locs[i + 1] = s.offset as u32;
            emit_load_immediate(s, ctx, dst, value as i64);
            return 2;
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

/// Byte swap of the low `width` bits, zero-extending the rest.
fn emit_swap(s: &mut JitState<'_>, dst: u8, width: i32) {
    match width {
        16 => {
            s.emit1(0x66);
            emit_alu32_imm8(s, 0xc1, 0, dst, 8);
            emit_alu32_imm32(s, 0x81, 4, dst, 0xffff);
        }
        32 | 64 => {
            emit_basic_rex(s, u8::from(width == 64), 0, dst);
            s.emit1(0x0f);
            s.emit1(0xc8 | (dst & 7));
        }
        _ => {
            // Width 8 swaps nothing; mask to the byte.
            emit_alu32_imm32(s, 0x81, 4, dst, 0xff);
        }
    }
}

// Fixups --------------------------------------------------------------------

/// All four tables patch a 32-bit displacement whose field ends the
/// instruction, so the delta is measured from the end of the field.
fn resolve(state: &mut JitState<'_>) -> Result<(), TranslateError> {
    let jumps = state.jumps.clone();
    for site in &jumps {
        let target = state.target_loc(&site.target)?;
        patch_rel32(state, site.offset_loc, target, 0);
    }

    let loads = state.loads.clone();
    for site in &loads {
        let target = state.target_loc(&site.target)?;
        patch_rel32(state, site.offset_loc, target, 0);
    }

    let leas = state.leas.clone();
    for site in &leas {
        let target = state.target_loc(&site.target)?;
        patch_rel32(state, site.offset_loc, target, 0);
    }

    let prolog = state.prolog_size;
    let local_calls = state.local_calls.clone();
    for site in &local_calls {
        let target = state.target_loc(&site.target)?;
        // A call runs the callee's staging sequence, which sits right
        // before the location recorded for its first instruction.
        patch_rel32(state, site.offset_loc, target, prolog as i64);
    }

    Ok(())
}

fn patch_rel32(state: &mut JitState<'_>, loc: u32, target: u32, back_off: i64) {
    let rel = target as i64 - back_off - (loc as i64 + 4);
    let bytes = (rel as i32).to_le_bytes();
    let loc = loc as usize;
    state.buf[loc..loc + 4].copy_from_slice(&bytes);
}
