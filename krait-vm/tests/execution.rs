
use krait_vm::prelude::*;
use test_helpers::*;

use krait_asm::opcode::atomic;

use std::ffi::c_void;
use std::sync::atomic::{AtomicUsize, Ordering};

use test_case::test_case;

#[test]
fn add_immediate_chain() {
    let result = interpret([op::mov64_imm(0, 5), op::add64_imm(0, 7), op::exit()], &mut []);
    assert_eq!(result.unwrap(), 12);
}

#[test]
fn alu32_zeroes_the_upper_half() {
    let [lo, hi] = op::lddw(0, 0xdead_beef_0000_0001);
    let result = interpret([lo, hi, op::add_imm(0, 1), op::exit()], &mut []);
    assert_eq!(result.unwrap(), 2);
}

#[test_case(10, 3, 3; "unsigned quotient")]
#[test_case(10, 0, 0; "division by zero yields zero")]
#[test_case(u64::MAX as i64, 2, i64::MAX; "full width unsigned")]
fn div64(dividend: i64, divisor: i64, expected: i64) {
    let [lo, hi] = op::lddw(1, dividend as u64);
    let [lo2, hi2] = op::lddw(2, divisor as u64);
    let result = interpret(
        [
            lo,
            hi,
            lo2,
            hi2,
            op::mov64_reg(0, 1),
            op::div64_reg(0, 2),
            op::exit(),
        ],
        &mut [],
    );
    assert_eq!(result.unwrap(), expected as u64);
}

#[test_case(10, 0, 10; "modulo by zero yields the dividend")]
#[test_case(10, 3, 1; "unsigned remainder")]
fn mod64(dividend: u64, divisor: u64, expected: u64) {
    let [lo, hi] = op::lddw(0, dividend);
    let [lo2, hi2] = op::lddw(2, divisor);
    let result = interpret([lo, hi, lo2, hi2, op::mod64_reg(0, 2), op::exit()], &mut []);
    assert_eq!(result.unwrap(), expected);
}

#[test]
fn signed_division_selected_by_offset() {
    let [lo, hi] = op::lddw(0, (-14i64) as u64);
    let [lo2, hi2] = op::lddw(2, 4);
    let result = interpret([lo, hi, lo2, hi2, op::sdiv64_reg(0, 2), op::exit()], &mut []);
    assert_eq!(result.unwrap() as i64, -3);
}

#[test]
fn signed_division_overflow_wraps() {
    let [lo, hi] = op::lddw(0, i64::MIN as u64);
    let [lo2, hi2] = op::lddw(2, (-1i64) as u64);
    let result = interpret([lo, hi, lo2, hi2, op::sdiv64_reg(0, 2), op::exit()], &mut []);
    assert_eq!(result.unwrap() as i64, i64::MIN);
}

#[test_case(16, 0x0807; "swap half")]
#[test_case(32, 0x0807_0605; "swap word")]
#[test_case(64, 0x0807_0605_0403_0201; "swap double")]
fn bswap_is_width_masked(width: i32, expected: u64) {
    let [lo, hi] = op::lddw(0, 0x0102_0304_0506_0708);
    let result = interpret([lo, hi, op::bswap(0, width), op::exit()], &mut []);
    assert_eq!(result.unwrap(), expected);
}

#[test]
fn le_truncates_on_little_endian_hosts() {
    let [lo, hi] = op::lddw(0, 0x0102_0304_0506_0708);
    let result = interpret([lo, hi, op::le(0, 16), op::exit()], &mut []);
    assert_eq!(result.unwrap(), 0x0708);
}

#[test]
fn shifts_mask_their_amount() {
    // A shift of 66 behaves as a shift of 2 in 64-bit mode.
    let result = interpret(
        [
            op::mov64_imm(0, 1),
            op::mov64_imm(1, 66),
            op::lsh64_reg(0, 1),
            op::exit(),
        ],
        &mut [],
    );
    assert_eq!(result.unwrap(), 4);
}

#[test]
fn arithmetic_shift_extends_the_sign() {
    let [lo, hi] = op::lddw(0, 0x8000_0000_0000_0000);
    let result = interpret([lo, hi, op::arsh64_imm(0, 63), op::exit()], &mut []);
    assert_eq!(result.unwrap(), u64::MAX);
}

#[test]
fn sign_extending_load() {
    let mut data = [0xaa, 0xbb, 0x81, 0xcc, 0xdd];
    let result = interpret([op::ldxbsx(0, 1, 2), op::exit()], &mut data);
    assert_eq!(result.unwrap(), 0xffff_ffff_ffff_ff81);

    let mut data = [0xaa, 0xbb, 0x7f, 0xcc, 0xdd];
    let result = interpret([op::ldxbsx(0, 1, 2), op::exit()], &mut data);
    assert_eq!(result.unwrap(), 0x7f);
}

#[test]
fn sign_extending_move() {
    let result = interpret(
        [
            op::mov64_imm(1, 0x80),
            op::mov64_reg_sx(0, 1, 8),
            op::exit(),
        ],
        &mut [],
    );
    assert_eq!(result.unwrap(), (-128i64) as u64);

    let result = interpret(
        [
            op::mov64_imm(1, 0x80),
            op::mov_reg_sx(0, 1, 8),
            op::exit(),
        ],
        &mut [],
    );
    // The 32-bit flavour sign-extends within the word and zero-extends above.
    assert_eq!(result.unwrap(), 0xffff_ff80);
}

#[test]
fn loads_and_stores_round_trip_through_data() {
    let mut data = [0u8; 16];
    let result = interpret(
        [
            op::stdw(1, 0, 0x1122_3344),
            op::stb(1, 8, 0x7f),
            op::ldxdw(0, 1, 0),
            op::ldxb(2, 1, 8),
            op::add64_reg(0, 2),
            op::exit(),
        ],
        &mut data,
    );
    assert_eq!(result.unwrap(), 0x1122_3344 + 0x7f);
    assert_eq!(&data[..4], &0x1122_3344u32.to_le_bytes());
}

#[test]
fn stack_addressing_through_the_frame_register() {
    let result = interpret(
        [
            op::mov64_imm(2, 33),
            op::stxdw(10, 2, -8),
            op::ldxdw(0, 10, -8),
            op::exit(),
        ],
        &mut [],
    );
    assert_eq!(result.unwrap(), 33);
}

#[test]
fn conditional_branches() {
    // r0 = (r1 == 5) ? 1 : 2, with r1 = 5.
    let result = interpret(
        [
            op::mov64_imm(1, 5),
            op::jeq_imm(1, 2, 5),
            op::mov64_imm(0, 2),
            op::exit(),
            op::mov64_imm(0, 1),
            op::exit(),
        ],
        &mut [],
    );
    assert_eq!(result.unwrap(), 1);
}

#[test]
fn jump32_compares_the_low_word() {
    let [lo, hi] = op::lddw(1, 0xffff_ffff_0000_0005);
    let result = interpret(
        [
            lo,
            hi,
            op::jeq32_imm(1, 2, 5),
            op::mov64_imm(0, 2),
            op::exit(),
            op::mov64_imm(0, 1),
            op::exit(),
        ],
        &mut [],
    );
    assert_eq!(result.unwrap(), 1);
}

#[test]
fn ja32_uses_the_immediate_displacement() {
    let result = interpret(
        [
            op::ja32(1),
            op::exit(),
            op::mov64_imm(0, 9),
            op::exit(),
        ],
        &mut [],
    );
    assert_eq!(result.unwrap(), 9);
}

#[test]
fn signed_compare() {
    let [lo, hi] = op::lddw(1, (-1i64) as u64);
    // -1 < 1 signed, but not unsigned.
    let result = interpret(
        [
            lo,
            hi,
            op::jslt_imm(1, 2, 1),
            op::mov64_imm(0, 0),
            op::exit(),
            op::mov64_imm(0, 1),
            op::exit(),
        ],
        &mut [],
    );
    assert_eq!(result.unwrap(), 1);
}

#[test]
fn atomic_add_and_fetch() {
    let mut cell = 10u64;
    let result = interpret(
        [
            op::mov64_imm(2, 5),
            op::atomic(1, 2, 0, atomic::ADD | atomic::FETCH),
            // r2 now holds the pre-update value.
            op::mov64_reg(0, 2),
            op::exit(),
        ],
        word_bytes(&mut cell),
    );
    assert_eq!(result.unwrap(), 10);
    assert_eq!(cell, 15);
}

#[test]
fn atomic_xchg() {
    let mut cell = 7u64;
    let result = interpret(
        [
            op::mov64_imm(2, 9),
            op::atomic(1, 2, 0, atomic::XCHG),
            op::mov64_reg(0, 2),
            op::exit(),
        ],
        word_bytes(&mut cell),
    );
    assert_eq!(result.unwrap(), 7);
    assert_eq!(cell, 9);
}

#[test]
fn atomic_cmpxchg() {
    // r0 (expected) matches: store happens, r0 keeps the old value.
    let mut cell = 7u64;
    let result = interpret(
        [
            op::mov64_imm(0, 7),
            op::mov64_imm(2, 100),
            op::atomic(1, 2, 0, atomic::CMPXCHG),
            op::exit(),
        ],
        word_bytes(&mut cell),
    );
    assert_eq!(result.unwrap(), 7);
    assert_eq!(cell, 100);

    // Mismatch: memory unchanged, r0 receives the current value.
    let mut cell = 7u64;
    let result = interpret(
        [
            op::mov64_imm(0, 8),
            op::mov64_imm(2, 100),
            op::atomic(1, 2, 0, atomic::CMPXCHG),
            op::exit(),
        ],
        word_bytes(&mut cell),
    );
    assert_eq!(result.unwrap(), 7);
    assert_eq!(cell, 7);
}

#[test]
fn atomic32_masks_to_the_word() {
    let mut cell = 0xffff_ffff_0000_0001u64;
    let result = interpret(
        [
            op::mov64_imm(2, 2),
            op::atomic32(1, 2, 0, atomic::ADD | atomic::FETCH),
            op::mov64_reg(0, 2),
            op::exit(),
        ],
        word_bytes(&mut cell),
    );
    // The fetched value is the low word, zero-extended.
    assert_eq!(result.unwrap(), 1);
    assert_eq!(cell, 0xffff_ffff_0000_0003);
}

#[test]
fn local_calls_preserve_callee_saved_registers() {
    let mut stack = [0u8; 4096];
    let mut vm = vm_with([
        op::mov64_imm(6, 7),
        op::call_local(2),
        op::mov64_reg(0, 6),
        op::exit(),
        op::mov64_imm(6, 99),
        op::exit(),
    ]);
    let result = vm.exec_ex(&mut [], &mut stack);
    assert_eq!(result.unwrap(), 7);
}

#[test]
fn local_call_returns_through_r0() {
    let mut stack = [0u8; 4096];
    let mut vm = vm_with([
        op::call_local(1),
        op::exit(),
        op::mov64_imm(0, 42),
        op::exit(),
    ]);
    assert_eq!(vm.exec_ex(&mut [], &mut stack).unwrap(), 42);
}

#[test]
fn helper_call_and_unwind() {
    let mut vm = Vm::new();
    vm.register_helper(1, Some("identity"), identity_helper).unwrap();
    vm.register_helper(2, Some("zero"), zero_helper).unwrap();
    vm.set_unwind_index(2).unwrap();
    vm.load(&assemble([
        op::mov64_imm(1, 55),
        op::call_helper(1),
        op::call_helper(2),
        // Never reached: helper 2 returned zero and unwound.
        op::mov64_imm(0, 1),
        op::exit(),
    ]))
    .unwrap();
    assert_eq!(vm.exec(&mut []).unwrap(), 0);
}

#[test]
fn out_of_bounds_access_is_reported() {
    let mut data = [0u8; 8];
    let mut vm = vm_with([op::ldxdw(0, 1, 64), op::exit()]);
    let err = vm.exec(&mut data).unwrap_err();
    assert!(matches!(
        err,
        VmError::Exec(ExecError::OutOfBounds { pc: 0, size: 8, .. })
    ));
}

#[test]
fn custom_bounds_check_wins() {
    static CALLS: AtomicUsize = AtomicUsize::new(0);
    fn check(_cookie: *mut c_void, _addr: u64, _size: u64) -> bool {
        CALLS.fetch_add(1, Ordering::Relaxed);
        false
    }

    let mut data = [0u8; 8];
    let mut vm = vm_with([op::ldxdw(0, 1, 0), op::exit()]);
    vm.register_bounds_check(std::ptr::null_mut(), check);
    let err = vm.exec(&mut data).unwrap_err();
    assert!(matches!(err, VmError::Exec(ExecError::OutOfBounds { .. })));
    assert!(CALLS.load(Ordering::Relaxed) > 0);
}

#[test]
fn instruction_limit_is_enforced() {
    let mut vm = vm_with([
        op::mov64_imm(0, 0),
        op::mov64_imm(1, 0),
        op::mov64_imm(2, 0),
        op::exit(),
    ]);
    let previous = vm.set_instruction_limit(2);
    assert_eq!(previous, 0);
    let err = vm.exec(&mut []).unwrap_err();
    assert!(matches!(
        err,
        VmError::Exec(ExecError::InstructionLimitExceeded)
    ));

    vm.set_instruction_limit(0);
    vm.exec(&mut []).unwrap();
}

#[test]
fn undefined_behavior_check_catches_uninitialized_reads() {
    let mut vm = vm_with([op::mov64_reg(0, 5), op::exit()]);
    vm.toggle_undefined_behavior_check(true);
    let err = vm.exec(&mut []).unwrap_err();
    assert!(matches!(
        err,
        VmError::Exec(ExecError::UninitializedRegister { reg: 5, pc: 0 })
    ));
}

#[test]
fn undefined_behavior_check_catches_wild_shifts() {
    let mut vm = vm_with([
        op::mov64_imm(0, 1),
        op::mov64_imm(1, 64),
        op::lsh64_reg(0, 1),
        op::exit(),
    ]);
    vm.toggle_undefined_behavior_check(true);
    let err = vm.exec(&mut []).unwrap_err();
    assert!(matches!(
        err,
        VmError::Exec(ExecError::ShiftOutOfRange { amount: 64, pc: 2 })
    ));
}

#[test]
fn debug_callout_sees_every_step() {
    static STEPS: AtomicUsize = AtomicUsize::new(0);
    fn callout(
        _cookie: *mut c_void,
        _pc: u32,
        registers: &[u64; 16],
        stack: &[u8],
        _register_mask: u64,
        _stack_mask: &[u8],
    ) {
        STEPS.fetch_add(1, Ordering::Relaxed);
        assert_eq!(stack.len(), 512);
        assert_eq!(registers[10], stack.as_ptr() as u64 + 512);
    }

    let mut vm = vm_with([op::mov64_imm(0, 1), op::add64_imm(0, 1), op::exit()]);
    vm.register_debug_callout(std::ptr::null_mut(), callout);
    assert_eq!(vm.exec(&mut []).unwrap(), 2);
    assert_eq!(STEPS.load(Ordering::Relaxed), 3);
}

#[test]
fn branch_past_the_end_finishes_the_run() {
    // A taken branch to one past EXIT ends the program like a fall-off.
    let result = interpret(
        [
            op::mov64_imm(0, 3),
            op::jeq_imm(0, 1, 3),
            op::exit(),
        ],
        &mut [],
    );
    assert_eq!(result.unwrap(), 3);
}
