use crate::{op, opcode, Instruction};

use test_case::test_case;

#[test]
fn wire_layout_matches_the_record() {
    // opcode | dst:4,src:4 | offset LE | imm LE
    let inst = Instruction::new(opcode::JNE_IMM, 3, 7, -2, 0x1122_3344);
    let bytes = inst.to_le_bytes();

    assert_eq!(bytes[0], opcode::JNE_IMM);
    assert_eq!(bytes[1], (7 << 4) | 3);
    assert_eq!(i16::from_le_bytes([bytes[2], bytes[3]]), -2);
    assert_eq!(i32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]), 0x1122_3344);

    assert_eq!(Instruction::from_le_bytes(bytes), inst);
}

#[test]
fn register_nibbles_are_truncated() {
    let inst = Instruction::new(opcode::ADD64_REG, 0x1f, 0x2a, 0, 0);
    assert_eq!(inst.dst(), 0x0f);
    assert_eq!(inst.src(), 0x0a);
}

#[test]
fn negative_fields_survive_the_wire() {
    let inst = Instruction::new(opcode::STW, 10, 0, -512, -1);
    let decoded = Instruction::from_le_bytes(inst.to_le_bytes());
    assert_eq!(decoded.offset(), -512);
    assert_eq!(decoded.imm(), -1);
}

#[test]
fn decode_program_ignores_trailing_fragment() {
    let mut bytes: Vec<u8> = [op::mov64_imm(0, 1), op::exit()].into_iter().collect();
    bytes.extend_from_slice(&[0xde, 0xad, 0xbe]);

    let program = Instruction::decode_program(&bytes);
    assert_eq!(program.len(), 2);
    assert_eq!(program[0], op::mov64_imm(0, 1));
    assert_eq!(program[1], op::exit());
}

#[test]
fn wide_load_splits_and_joins() {
    let value = 0x8899_aabb_ccdd_eeff_u64;
    let [low, high] = op::lddw(2, value);

    assert_eq!(low.opcode(), opcode::LDDW);
    assert_eq!(high.opcode(), 0);
    assert_eq!(
        crate::join_wide_immediate(low.imm(), high.imm()),
        value
    );
}

#[test_case(op::ja(3) => false; "ja does not fall through")]
#[test_case(op::ja32(3) => false; "ja32 does not fall through")]
#[test_case(op::exit() => false; "exit does not fall through")]
#[test_case(op::jeq_imm(1, 3, 0) => true; "conditional branch falls through")]
#[test_case(op::call_helper(1) => true; "helper call falls through")]
#[test_case(op::add64_imm(0, 1) => true; "alu falls through")]
fn fallthrough(inst: Instruction) -> bool {
    inst.has_fallthrough()
}

#[test]
fn classes() {
    assert_eq!(op::add_imm(0, 1).class(), opcode::class::ALU);
    assert_eq!(op::add64_imm(0, 1).class(), opcode::class::ALU64);
    assert_eq!(op::ldxb(0, 1, 0).class(), opcode::class::LDX);
    assert_eq!(op::stxb(0, 1, 0).class(), opcode::class::STX);
    assert_eq!(op::jeq_imm(0, 1, 0).class(), opcode::class::JMP);
    assert_eq!(op::jeq32_imm(0, 1, 0).class(), opcode::class::JMP32);
}
