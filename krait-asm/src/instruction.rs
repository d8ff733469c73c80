use crate::opcode::{self, class, CLS_MASK};
use crate::RegisterId;

use core::fmt;

/// A decoded bytecode instruction.
///
/// The wire format is a little-endian 64-bit record: opcode byte, destination
/// and source register nibbles (source in the high nibble), a signed 16-bit
/// offset and a signed 32-bit immediate. [`opcode::LDDW`] occupies two
/// consecutive records; the second carries the high half of the immediate and
/// zeros elsewhere.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Instruction {
    opcode: u8,
    dst: RegisterId,
    src: RegisterId,
    offset: i16,
    imm: i32,
}

impl Instruction {
    /// Size of an encoded instruction in bytes.
    pub const LEN: usize = 8;

    /// Construct an instruction from its five fields.
    ///
    /// Register nibbles are truncated to four bits, matching what the wire
    /// format can carry.
    pub const fn new(opcode: u8, dst: RegisterId, src: RegisterId, offset: i16, imm: i32) -> Self {
        Self {
            opcode,
            dst: dst & 0x0f,
            src: src & 0x0f,
            offset,
            imm,
        }
    }

    /// Opcode byte.
    pub const fn opcode(&self) -> u8 {
        self.opcode
    }

    /// Destination register.
    pub const fn dst(&self) -> RegisterId {
        self.dst
    }

    /// Source register.
    pub const fn src(&self) -> RegisterId {
        self.src
    }

    /// Signed 16-bit offset.
    pub const fn offset(&self) -> i16 {
        self.offset
    }

    /// Signed 32-bit immediate.
    pub const fn imm(&self) -> i32 {
        self.imm
    }

    /// Instruction class, the low three bits of the opcode.
    pub const fn class(&self) -> u8 {
        self.opcode & CLS_MASK
    }

    /// Whether this instruction consumes the following slot as well.
    pub const fn is_wide(&self) -> bool {
        self.opcode == opcode::LDDW
    }

    /// Whether execution can continue at the next instruction.
    ///
    /// Unconditional jumps and `EXIT` transfer control away; everything else,
    /// including conditional branches and calls, can fall through.
    pub const fn has_fallthrough(&self) -> bool {
        !matches!(self.opcode, opcode::JA | opcode::JA32 | opcode::EXIT)
    }

    /// Decode an instruction from its little-endian wire representation.
    pub const fn from_le_bytes(bytes: [u8; Self::LEN]) -> Self {
        Self {
            opcode: bytes[0],
            dst: bytes[1] & 0x0f,
            src: bytes[1] >> 4,
            offset: i16::from_le_bytes([bytes[2], bytes[3]]),
            imm: i32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]),
        }
    }

    /// Encode the instruction into its little-endian wire representation.
    pub const fn to_le_bytes(self) -> [u8; Self::LEN] {
        let offset = self.offset.to_le_bytes();
        let imm = self.imm.to_le_bytes();
        [
            self.opcode,
            (self.src << 4) | (self.dst & 0x0f),
            offset[0],
            offset[1],
            imm[0],
            imm[1],
            imm[2],
            imm[3],
        ]
    }

    /// Decode an instruction from the head of a byte slice.
    ///
    /// Returns `None` when fewer than [`Instruction::LEN`] bytes remain.
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        let head: [u8; Self::LEN] = bytes.get(..Self::LEN)?.try_into().ok()?;
        Some(Self::from_le_bytes(head))
    }

    /// Decode a contiguous program.
    ///
    /// Trailing bytes that do not fill a whole record are ignored, as on the
    /// wire there is no header or trailer to say otherwise.
    pub fn decode_program(bytes: &[u8]) -> Vec<Self> {
        bytes
            .chunks_exact(Self::LEN)
            .map(|chunk| {
                let chunk: [u8; Self::LEN] = chunk.try_into().expect("chunks_exact is exact");
                Self::from_le_bytes(chunk)
            })
            .collect()
    }
}

impl From<[u8; Instruction::LEN]> for Instruction {
    fn from(bytes: [u8; Instruction::LEN]) -> Self {
        Self::from_le_bytes(bytes)
    }
}

impl From<Instruction> for [u8; Instruction::LEN] {
    fn from(inst: Instruction) -> Self {
        inst.to_le_bytes()
    }
}

impl From<Instruction> for u64 {
    fn from(inst: Instruction) -> Self {
        u64::from_le_bytes(inst.to_le_bytes())
    }
}

impl From<u64> for Instruction {
    fn from(raw: u64) -> Self {
        Self::from_le_bytes(raw.to_le_bytes())
    }
}

impl FromIterator<Instruction> for Vec<u8> {
    fn from_iter<T>(iter: T) -> Self
    where
        T: IntoIterator<Item = Instruction>,
    {
        iter.into_iter()
            .flat_map(Instruction::to_le_bytes)
            .collect()
    }
}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "op=0x{:02x} dst=r{} src=r{} off={} imm={}",
            self.opcode, self.dst, self.src, self.offset, self.imm
        )
    }
}

static_assertions::const_assert_eq!(Instruction::LEN, core::mem::size_of::<u64>());

/// Split a 64-bit immediate into the two slots of a wide load.
pub const fn wide_immediate(imm: u64) -> (i32, i32) {
    (imm as u32 as i32, (imm >> 32) as u32 as i32)
}

/// Reassemble the 64-bit immediate of a wide load from its two slots.
pub const fn join_wide_immediate(low: i32, high: i32) -> u64 {
    (low as u32 as u64) | ((high as u32 as u64) << 32)
}

/// Classes whose opcodes read the source-register field as an operand.
pub const fn uses_reg_source(op: u8) -> bool {
    let cls = op & CLS_MASK;
    matches!(cls, class::ALU | class::ALU64 | class::JMP | class::JMP32) && (op & opcode::SRC_REG) != 0
}
