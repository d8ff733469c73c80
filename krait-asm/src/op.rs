//! Constructor functions for every instruction.
//!
//! These build [`Instruction`] values with the field layout each opcode
//! expects, so programs assembled in tests or by embedders cannot misplace an
//! operand.

use crate::instruction::{wide_immediate, Instruction};
use crate::opcode as op;
use crate::RegisterId;

macro_rules! alu_imm {
    ($($(#[$attr:meta])* $name:ident => $opcode:expr;)*) => {
        $(
            $(#[$attr])*
            pub const fn $name(dst: RegisterId, imm: i32) -> Instruction {
                Instruction::new($opcode, dst, 0, 0, imm)
            }
        )*
    };
}

macro_rules! alu_reg {
    ($($(#[$attr:meta])* $name:ident => $opcode:expr;)*) => {
        $(
            $(#[$attr])*
            pub const fn $name(dst: RegisterId, src: RegisterId) -> Instruction {
                Instruction::new($opcode, dst, src, 0, 0)
            }
        )*
    };
}

macro_rules! jump_imm {
    ($($(#[$attr:meta])* $name:ident => $opcode:expr;)*) => {
        $(
            $(#[$attr])*
            pub const fn $name(dst: RegisterId, offset: i16, imm: i32) -> Instruction {
                Instruction::new($opcode, dst, 0, offset, imm)
            }
        )*
    };
}

macro_rules! jump_reg {
    ($($(#[$attr:meta])* $name:ident => $opcode:expr;)*) => {
        $(
            $(#[$attr])*
            pub const fn $name(dst: RegisterId, src: RegisterId, offset: i16) -> Instruction {
                Instruction::new($opcode, dst, src, offset, 0)
            }
        )*
    };
}

macro_rules! mem_reg {
    ($($(#[$attr:meta])* $name:ident => $opcode:expr;)*) => {
        $(
            $(#[$attr])*
            pub const fn $name(dst: RegisterId, src: RegisterId, offset: i16) -> Instruction {
                Instruction::new($opcode, dst, src, offset, 0)
            }
        )*
    };
}

macro_rules! store_imm {
    ($($(#[$attr:meta])* $name:ident => $opcode:expr;)*) => {
        $(
            $(#[$attr])*
            pub const fn $name(dst: RegisterId, offset: i16, imm: i32) -> Instruction {
                Instruction::new($opcode, dst, 0, offset, imm)
            }
        )*
    };
}

alu_imm! {
    /// 32-bit `dst += imm`.
    add_imm => op::ADD_IMM;
    /// 32-bit `dst -= imm`.
    sub_imm => op::SUB_IMM;
    /// 32-bit `dst *= imm`.
    mul_imm => op::MUL_IMM;
    /// 32-bit `dst /= imm`, unsigned.
    div_imm => op::DIV_IMM;
    /// 32-bit `dst |= imm`.
    or_imm => op::OR_IMM;
    /// 32-bit `dst &= imm`.
    and_imm => op::AND_IMM;
    /// 32-bit `dst <<= imm`.
    lsh_imm => op::LSH_IMM;
    /// 32-bit `dst >>= imm`, logical.
    rsh_imm => op::RSH_IMM;
    /// 32-bit `dst %= imm`, unsigned.
    mod_imm => op::MOD_IMM;
    /// 32-bit `dst ^= imm`.
    xor_imm => op::XOR_IMM;
    /// 32-bit `dst = imm`.
    mov_imm => op::MOV_IMM;
    /// 32-bit `dst >>= imm`, arithmetic.
    arsh_imm => op::ARSH_IMM;
    /// 64-bit `dst += imm`.
    add64_imm => op::ADD64_IMM;
    /// 64-bit `dst -= imm`.
    sub64_imm => op::SUB64_IMM;
    /// 64-bit `dst *= imm`.
    mul64_imm => op::MUL64_IMM;
    /// 64-bit `dst /= imm`, unsigned.
    div64_imm => op::DIV64_IMM;
    /// 64-bit `dst |= imm`.
    or64_imm => op::OR64_IMM;
    /// 64-bit `dst &= imm`.
    and64_imm => op::AND64_IMM;
    /// 64-bit `dst <<= imm`.
    lsh64_imm => op::LSH64_IMM;
    /// 64-bit `dst >>= imm`, logical.
    rsh64_imm => op::RSH64_IMM;
    /// 64-bit `dst %= imm`, unsigned.
    mod64_imm => op::MOD64_IMM;
    /// 64-bit `dst ^= imm`.
    xor64_imm => op::XOR64_IMM;
    /// 64-bit `dst = imm`, sign-extended.
    mov64_imm => op::MOV64_IMM;
    /// 64-bit `dst >>= imm`, arithmetic.
    arsh64_imm => op::ARSH64_IMM;
}

alu_reg! {
    /// 32-bit `dst += src`.
    add_reg => op::ADD_REG;
    /// 32-bit `dst -= src`.
    sub_reg => op::SUB_REG;
    /// 32-bit `dst *= src`.
    mul_reg => op::MUL_REG;
    /// 32-bit `dst /= src`, unsigned.
    div_reg => op::DIV_REG;
    /// 32-bit `dst |= src`.
    or_reg => op::OR_REG;
    /// 32-bit `dst &= src`.
    and_reg => op::AND_REG;
    /// 32-bit `dst <<= src`.
    lsh_reg => op::LSH_REG;
    /// 32-bit `dst >>= src`, logical.
    rsh_reg => op::RSH_REG;
    /// 32-bit `dst %= src`, unsigned.
    mod_reg => op::MOD_REG;
    /// 32-bit `dst ^= src`.
    xor_reg => op::XOR_REG;
    /// 32-bit `dst = src`.
    mov_reg => op::MOV_REG;
    /// 32-bit `dst >>= src`, arithmetic.
    arsh_reg => op::ARSH_REG;
    /// 64-bit `dst += src`.
    add64_reg => op::ADD64_REG;
    /// 64-bit `dst -= src`.
    sub64_reg => op::SUB64_REG;
    /// 64-bit `dst *= src`.
    mul64_reg => op::MUL64_REG;
    /// 64-bit `dst /= src`, unsigned.
    div64_reg => op::DIV64_REG;
    /// 64-bit `dst |= src`.
    or64_reg => op::OR64_REG;
    /// 64-bit `dst &= src`.
    and64_reg => op::AND64_REG;
    /// 64-bit `dst <<= src`.
    lsh64_reg => op::LSH64_REG;
    /// 64-bit `dst >>= src`, logical.
    rsh64_reg => op::RSH64_REG;
    /// 64-bit `dst %= src`, unsigned.
    mod64_reg => op::MOD64_REG;
    /// 64-bit `dst ^= src`.
    xor64_reg => op::XOR64_REG;
    /// 64-bit `dst = src`.
    mov64_reg => op::MOV64_REG;
    /// 64-bit `dst >>= src`, arithmetic.
    arsh64_reg => op::ARSH64_REG;
}

/// 32-bit `dst = -dst`.
pub const fn neg(dst: RegisterId) -> Instruction {
    Instruction::new(op::NEG, dst, 0, 0, 0)
}

/// 64-bit `dst = -dst`.
pub const fn neg64(dst: RegisterId) -> Instruction {
    Instruction::new(op::NEG64, dst, 0, 0, 0)
}

/// Signed 64-bit division, `dst /= src`.
pub const fn sdiv64_reg(dst: RegisterId, src: RegisterId) -> Instruction {
    Instruction::new(op::DIV64_REG, dst, src, 1, 0)
}

/// Signed 64-bit modulo, `dst %= src`.
pub const fn smod64_reg(dst: RegisterId, src: RegisterId) -> Instruction {
    Instruction::new(op::MOD64_REG, dst, src, 1, 0)
}

/// Signed 32-bit division, `dst /= src`.
pub const fn sdiv_reg(dst: RegisterId, src: RegisterId) -> Instruction {
    Instruction::new(op::DIV_REG, dst, src, 1, 0)
}

/// Signed 32-bit modulo, `dst %= src`.
pub const fn smod_reg(dst: RegisterId, src: RegisterId) -> Instruction {
    Instruction::new(op::MOD_REG, dst, src, 1, 0)
}

/// `dst = src` sign-extended from `width` (8, 16 or 32) into 64 bits.
pub const fn mov64_reg_sx(dst: RegisterId, src: RegisterId, width: i16) -> Instruction {
    Instruction::new(op::MOV64_REG, dst, src, width, 0)
}

/// `dst = low32(src)` sign-extended from `width` (8 or 16).
pub const fn mov_reg_sx(dst: RegisterId, src: RegisterId, width: i16) -> Instruction {
    Instruction::new(op::MOV_REG, dst, src, width, 0)
}

/// Truncate `dst` to little-endian of `width` bits.
pub const fn le(dst: RegisterId, width: i32) -> Instruction {
    Instruction::new(op::LE, dst, 0, 0, width)
}

/// Truncate `dst` to big-endian of `width` bits.
pub const fn be(dst: RegisterId, width: i32) -> Instruction {
    Instruction::new(op::BE, dst, 0, 0, width)
}

/// Unconditionally swap the low `width` bits of `dst`.
pub const fn bswap(dst: RegisterId, width: i32) -> Instruction {
    Instruction::new(op::BSWAP, dst, 0, 0, width)
}

jump_imm! {
    /// Branch if `dst == imm`.
    jeq_imm => op::JEQ_IMM;
    /// Branch if `dst > imm`, unsigned.
    jgt_imm => op::JGT_IMM;
    /// Branch if `dst >= imm`, unsigned.
    jge_imm => op::JGE_IMM;
    /// Branch if `dst & imm`.
    jset_imm => op::JSET_IMM;
    /// Branch if `dst != imm`.
    jne_imm => op::JNE_IMM;
    /// Branch if `dst > imm`, signed.
    jsgt_imm => op::JSGT_IMM;
    /// Branch if `dst >= imm`, signed.
    jsge_imm => op::JSGE_IMM;
    /// Branch if `dst < imm`, unsigned.
    jlt_imm => op::JLT_IMM;
    /// Branch if `dst <= imm`, unsigned.
    jle_imm => op::JLE_IMM;
    /// Branch if `dst < imm`, signed.
    jslt_imm => op::JSLT_IMM;
    /// Branch if `dst <= imm`, signed.
    jsle_imm => op::JSLE_IMM;
    /// Branch if `low32(dst) == imm`.
    jeq32_imm => op::JEQ32_IMM;
    /// Branch if `low32(dst) > imm`, unsigned.
    jgt32_imm => op::JGT32_IMM;
    /// Branch if `low32(dst) >= imm`, unsigned.
    jge32_imm => op::JGE32_IMM;
    /// Branch if `low32(dst) & imm`.
    jset32_imm => op::JSET32_IMM;
    /// Branch if `low32(dst) != imm`.
    jne32_imm => op::JNE32_IMM;
    /// Branch if `low32(dst) > imm`, signed.
    jsgt32_imm => op::JSGT32_IMM;
    /// Branch if `low32(dst) >= imm`, signed.
    jsge32_imm => op::JSGE32_IMM;
    /// Branch if `low32(dst) < imm`, unsigned.
    jlt32_imm => op::JLT32_IMM;
    /// Branch if `low32(dst) <= imm`, unsigned.
    jle32_imm => op::JLE32_IMM;
    /// Branch if `low32(dst) < imm`, signed.
    jslt32_imm => op::JSLT32_IMM;
    /// Branch if `low32(dst) <= imm`, signed.
    jsle32_imm => op::JSLE32_IMM;
}

jump_reg! {
    /// Branch if `dst == src`.
    jeq_reg => op::JEQ_REG;
    /// Branch if `dst > src`, unsigned.
    jgt_reg => op::JGT_REG;
    /// Branch if `dst >= src`, unsigned.
    jge_reg => op::JGE_REG;
    /// Branch if `dst & src`.
    jset_reg => op::JSET_REG;
    /// Branch if `dst != src`.
    jne_reg => op::JNE_REG;
    /// Branch if `dst > src`, signed.
    jsgt_reg => op::JSGT_REG;
    /// Branch if `dst >= src`, signed.
    jsge_reg => op::JSGE_REG;
    /// Branch if `dst < src`, unsigned.
    jlt_reg => op::JLT_REG;
    /// Branch if `dst <= src`, unsigned.
    jle_reg => op::JLE_REG;
    /// Branch if `dst < src`, signed.
    jslt_reg => op::JSLT_REG;
    /// Branch if `dst <= src`, signed.
    jsle_reg => op::JSLE_REG;
    /// Branch if `low32(dst) == low32(src)`.
    jeq32_reg => op::JEQ32_REG;
    /// Branch if `low32(dst) > low32(src)`, unsigned.
    jgt32_reg => op::JGT32_REG;
    /// Branch if `low32(dst) >= low32(src)`, unsigned.
    jge32_reg => op::JGE32_REG;
    /// Branch if `low32(dst) & low32(src)`.
    jset32_reg => op::JSET32_REG;
    /// Branch if `low32(dst) != low32(src)`.
    jne32_reg => op::JNE32_REG;
    /// Branch if `low32(dst) > low32(src)`, signed.
    jsgt32_reg => op::JSGT32_REG;
    /// Branch if `low32(dst) >= low32(src)`, signed.
    jsge32_reg => op::JSGE32_REG;
    /// Branch if `low32(dst) < low32(src)`, unsigned.
    jlt32_reg => op::JLT32_REG;
    /// Branch if `low32(dst) <= low32(src)`, unsigned.
    jle32_reg => op::JLE32_REG;
    /// Branch if `low32(dst) < low32(src)`, signed.
    jslt32_reg => op::JSLT32_REG;
    /// Branch if `low32(dst) <= low32(src)`, signed.
    jsle32_reg => op::JSLE32_REG;
}

/// Unconditional jump by `offset` instructions.
pub const fn ja(offset: i16) -> Instruction {
    Instruction::new(op::JA, 0, 0, offset, 0)
}

/// Unconditional jump by `imm` instructions (32-bit jump class).
pub const fn ja32(imm: i32) -> Instruction {
    Instruction::new(op::JA32, 0, 0, 0, imm)
}

mem_reg! {
    /// `dst = *(u32*)(src + offset)`.
    ldxw => op::LDXW;
    /// `dst = *(u16*)(src + offset)`.
    ldxh => op::LDXH;
    /// `dst = *(u8*)(src + offset)`.
    ldxb => op::LDXB;
    /// `dst = *(u64*)(src + offset)`.
    ldxdw => op::LDXDW;
    /// `dst = *(i32*)(src + offset)`, sign-extended.
    ldxwsx => op::LDXWSX;
    /// `dst = *(i16*)(src + offset)`, sign-extended.
    ldxhsx => op::LDXHSX;
    /// `dst = *(i8*)(src + offset)`, sign-extended.
    ldxbsx => op::LDXBSX;
    /// `*(u32*)(dst + offset) = src`.
    stxw => op::STXW;
    /// `*(u16*)(dst + offset) = src`.
    stxh => op::STXH;
    /// `*(u8*)(dst + offset) = src`.
    stxb => op::STXB;
    /// `*(u64*)(dst + offset) = src`.
    stxdw => op::STXDW;
}

store_imm! {
    /// `*(u32*)(dst + offset) = imm`.
    stw => op::STW;
    /// `*(u16*)(dst + offset) = imm`.
    sth => op::STH;
    /// `*(u8*)(dst + offset) = imm`.
    stb => op::STB;
    /// `*(u64*)(dst + offset) = imm`.
    stdw => op::STDW;
}

/// Load a 64-bit immediate into `dst`; expands to two slots.
pub const fn lddw(dst: RegisterId, imm: u64) -> [Instruction; 2] {
    let (low, high) = wide_immediate(imm);
    [
        Instruction::new(op::LDDW, dst, 0, 0, low),
        Instruction::new(0, 0, 0, 0, high),
    ]
}

/// 64-bit atomic read-modify-write at `dst + offset`; `sub_op` is one of
/// [`crate::opcode::atomic`].
pub const fn atomic(dst: RegisterId, src: RegisterId, offset: i16, sub_op: i32) -> Instruction {
    Instruction::new(op::ATOMIC_STORE, dst, src, offset, sub_op)
}

/// 32-bit atomic read-modify-write at `dst + offset`.
pub const fn atomic32(dst: RegisterId, src: RegisterId, offset: i16, sub_op: i32) -> Instruction {
    Instruction::new(op::ATOMIC32_STORE, dst, src, offset, sub_op)
}

/// Call the helper with index `helper`.
pub const fn call_helper(helper: i32) -> Instruction {
    Instruction::new(op::CALL, 0, 0, 0, helper)
}

/// Call the local function `delta` instructions ahead.
pub const fn call_local(delta: i32) -> Instruction {
    Instruction::new(op::CALL, 0, 1, 0, delta)
}

/// Call the helper whose index is held in `dst`.
pub const fn callx(dst: RegisterId) -> Instruction {
    Instruction::new(op::CALLX, dst, 0, 0, 0)
}

/// Return from the current function, or finish the program.
pub const fn exit() -> Instruction {
    Instruction::new(op::EXIT, 0, 0, 0, 0)
}
