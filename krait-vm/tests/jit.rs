#![cfg(any(target_arch = "x86_64", target_arch = "aarch64"))]


use krait_vm::prelude::*;
use test_helpers::*;

use krait_asm::opcode::atomic;

fn run_jit(vm: &mut Vm, data: &mut [u8]) -> u64 {
    let entry = vm.compile().expect("translation should succeed");
    unsafe { entry(data.as_mut_ptr(), data.len() as u64) }
}

/// Copy `data` into word-aligned storage (the atomics require natural
/// alignment) and hand it to `f`; returns the result and the final bytes.
fn with_aligned_copy<R>(data: &[u8], f: impl FnOnce(&mut [u8]) -> R) -> (R, Vec<u8>) {
    let mut words = vec![0u64; data.len().div_ceil(8).max(1)];
    let bytes =
        unsafe { std::slice::from_raw_parts_mut(words.as_mut_ptr().cast::<u8>(), data.len()) };
    bytes.copy_from_slice(data);
    let result = f(bytes);
    (result, bytes.to_vec())
}

/// The equivalence that matters: the interpreter and the translation agree
/// bit for bit, edge cases included.
fn assert_engines_agree(ops: &[Instruction], data: &[u8]) {
    let program = assemble(ops.iter().copied());

    let mut vm = Vm::new();
    vm.load(&program).unwrap();

    let (interpreted, interp_data) = with_aligned_copy(data, |bytes| vm.exec(bytes).unwrap());
    let (jitted, jit_data) = with_aligned_copy(data, |bytes| run_jit(&mut vm, bytes));

    assert_eq!(interpreted, jitted, "engines disagree for {ops:?}");
    assert_eq!(interp_data, jit_data, "memory effects disagree for {ops:?}");
}

#[test]
fn addition() {
    let mut vm = vm_with([op::mov64_imm(0, 5), op::add64_imm(0, 7), op::exit()]);
    assert_eq!(run_jit(&mut vm, &mut []), 12);
}

#[test]
fn compile_is_idempotent() {
    let mut vm = vm_with([op::mov64_imm(0, 1), op::exit()]);
    let first = vm.compile().unwrap();
    let second = vm.compile().unwrap();
    assert_eq!(first as usize, second as usize);
}

#[test]
fn mode_mismatch_is_a_config_error() {
    let mut vm = vm_with([op::exit()]);
    vm.compile().unwrap();
    assert!(matches!(
        vm.compile_ex(JitMode::Extended),
        Err(VmError::Config(ConfigError::JitModeMismatch(JitMode::Basic)))
    ));
}

#[test]
fn translate_reports_the_tail_offsets() {
    let vm = vm_with([op::mov64_imm(0, 3), op::exit()]);
    let mut buf = vec![0u8; 16 * 1024];
    let out = vm.translate(&mut buf).unwrap();
    assert!(out.size <= buf.len());
    assert!(out.dispatcher_offset < out.helper_table_offset);
    assert!((out.helper_table_offset as usize) + 64 * 8 <= out.size);
}

#[test]
fn translate_into_a_tiny_buffer_fails() {
    let vm = vm_with([op::mov64_imm(0, 3), op::exit()]);
    let mut buf = vec![0u8; 32];
    assert!(matches!(
        vm.translate(&mut buf),
        Err(VmError::Translate(TranslateError::NotEnoughSpace))
    ));
}

#[test]
fn blinding_changes_the_bytes_but_not_the_result() {
    let ops = [
        op::mov64_imm(0, 0x1234_5678),
        op::add64_imm(0, 0x1111_1111),
        op::exit(),
    ];

    // Two independent translations differ somewhere once blinding is on.
    let mut vm = Vm::new();
    vm.toggle_constant_blinding(true);
    vm.load(&assemble(ops)).unwrap();
    let mut first = vec![0u8; 16 * 1024];
    let mut second = vec![0u8; 16 * 1024];
    let out_a = vm.translate(&mut first).unwrap();
    let out_b = vm.translate(&mut second).unwrap();
    assert!(
        first[..out_a.size] != second[..out_b.size],
        "blinded translations must not repeat"
    );

    // And each still computes the plain result.
    assert_eq!(run_jit(&mut vm, &mut []), 0x2345_6789);

    let mut fresh = Vm::new();
    fresh.toggle_constant_blinding(true);
    fresh.load(&assemble(ops)).unwrap();
    assert_eq!(run_jit(&mut fresh, &mut []), 0x2345_6789);
}

#[test]
fn disabled_blinding_is_deterministic() {
    let vm = vm_with([op::mov64_imm(0, 0x1234_5678), op::exit()]);
    let mut first = vec![0u8; 16 * 1024];
    let mut second = vec![0u8; 16 * 1024];
    let out_a = vm.translate(&mut first).unwrap();
    let out_b = vm.translate(&mut second).unwrap();
    assert_eq!(out_a.size, out_b.size);
    assert_eq!(first[..out_a.size], second[..out_b.size]);
}

#[test]
fn large_program_loads_and_compiles() {
    let mut ops = Vec::with_capacity(66_000);
    ops.push(op::mov64_imm(0, 0));
    for _ in 0..65_998 {
        ops.push(op::ja(0));
    }
    ops.push(op::exit());

    let mut vm = Vm::new();
    vm.set_max_instructions(100_000).unwrap();
    vm.set_jit_code_size(66_000 * 50 + 4096).unwrap();
    vm.load(&assemble(ops)).unwrap();

    assert_eq!(vm.exec(&mut []).unwrap(), 0);
    assert_eq!(run_jit(&mut vm, &mut []), 0);
}

#[test]
fn engines_agree_on_alu_edge_cases() {
    let cases: Vec<Vec<Instruction>> = vec![
        // Division and modulo by zero.
        vec![
            op::mov64_imm(0, 42),
            op::mov64_imm(1, 0),
            op::div64_reg(0, 1),
            op::exit(),
        ],
        vec![
            op::mov64_imm(0, 42),
            op::mov64_imm(1, 0),
            op::mod64_reg(0, 1),
            op::exit(),
        ],
        vec![
            op::mov_imm(0, 42),
            op::mov_imm(1, 0),
            op::div_reg(0, 1),
            op::exit(),
        ],
        vec![
            op::mov_imm(0, 43),
            op::mov_imm(1, 0),
            op::mod_reg(0, 1),
            op::exit(),
        ],
        // Signed division, including the wrapping overflow case.
        {
            let [lo, hi] = op::lddw(0, i64::MIN as u64);
            vec![lo, hi, op::mov64_imm(1, -1), op::sdiv64_reg(0, 1), op::exit()]
        },
        {
            let [lo, hi] = op::lddw(0, (-14i64) as u64);
            vec![lo, hi, op::mov64_imm(1, 4), op::smod64_reg(0, 1), op::exit()]
        },
        // Shift masking and arithmetic shifts.
        vec![
            op::mov64_imm(0, 1),
            op::mov64_imm(1, 66),
            op::lsh64_reg(0, 1),
            op::exit(),
        ],
        vec![
            op::mov_imm(0, -2),
            op::mov_imm(1, 1),
            op::arsh_reg(0, 1),
            op::exit(),
        ],
        // 32-bit operations zero the upper half.
        {
            let [lo, hi] = op::lddw(0, 0xaaaa_bbbb_cccc_dddd);
            vec![lo, hi, op::add_imm(0, 1), op::exit()]
        },
        // Byte swaps.
        {
            let [lo, hi] = op::lddw(0, 0x0102_0304_0506_0708);
            vec![lo, hi, op::bswap(0, 16), op::exit()]
        },
        {
            let [lo, hi] = op::lddw(0, 0x0102_0304_0506_0708);
            vec![lo, hi, op::bswap(0, 32), op::exit()]
        },
        {
            let [lo, hi] = op::lddw(0, 0x0102_0304_0506_0708);
            vec![lo, hi, op::be(0, 16), op::le(0, 16), op::exit()]
        },
        // Sign-extending moves.
        vec![
            op::mov64_imm(1, 0x8081),
            op::mov64_reg_sx(0, 1, 16),
            op::exit(),
        ],
        // Wide immediates and negatives.
        {
            let [lo, hi] = op::lddw(0, 0x8899_aabb_ccdd_eeff);
            vec![lo, hi, op::exit()]
        },
        vec![op::mov64_imm(0, -5), op::add64_imm(0, -6), op::exit()],
        // Conditional branches both ways.
        vec![
            op::mov64_imm(1, 5),
            op::jsgt_imm(1, 2, 4),
            op::mov64_imm(0, 2),
            op::exit(),
            op::mov64_imm(0, 1),
            op::exit(),
        ],
        vec![
            op::mov64_imm(1, 3),
            op::jset_imm(1, 2, 2),
            op::mov64_imm(0, 2),
            op::exit(),
            op::mov64_imm(0, 1),
            op::exit(),
        ],
    ];

    for ops in cases {
        assert_engines_agree(&ops, &[]);
    }
}

#[test]
fn engines_agree_on_memory_operations() {
    let data = [0u8; 1024];

    let cases: Vec<Vec<Instruction>> = vec![
        vec![
            op::stdw(1, 0, 0x0102_0304),
            op::ldxdw(0, 1, 0),
            op::exit(),
        ],
        vec![
            op::mov64_imm(2, -7),
            op::stxw(1, 2, 4),
            op::ldxw(0, 1, 4),
            op::exit(),
        ],
        // Sign-extending loads.
        vec![
            op::sth(1, 0, -2),
            op::ldxhsx(0, 1, 0),
            op::exit(),
        ],
        // Offsets outside the short encodings.
        vec![
            op::mov64_imm(2, 19),
            op::stxdw(1, 2, 768),
            op::ldxdw(0, 1, 768),
            op::exit(),
        ],
        // Stack traffic relative to the frame register.
        vec![
            op::mov64_imm(2, 77),
            op::stxdw(10, 2, -16),
            op::ldxdw(0, 10, -16),
            op::exit(),
        ],
    ];

    for ops in cases {
        assert_engines_agree(&ops, &data);
    }
}

#[test]
fn engines_agree_on_atomics() {
    let data = [0u8; 64];

    let cases: Vec<Vec<Instruction>> = vec![
        vec![
            op::mov64_imm(2, 5),
            op::stxdw(1, 2, 0),
            op::mov64_imm(3, 3),
            op::atomic(1, 3, 0, atomic::ADD),
            op::ldxdw(0, 1, 0),
            op::exit(),
        ],
        vec![
            op::mov64_imm(2, 0xf0),
            op::stxdw(1, 2, 8),
            op::mov64_imm(3, 0x0f),
            op::atomic(1, 3, 8, atomic::OR | atomic::FETCH),
            op::add64_reg(0, 3),
            op::exit(),
        ],
        vec![
            op::mov64_imm(2, 0xff),
            op::stxdw(1, 2, 0),
            op::mov64_imm(3, 0x0f),
            op::atomic(1, 3, 0, atomic::AND | atomic::FETCH),
            op::mov64_reg(0, 3),
            op::exit(),
        ],
        vec![
            op::mov64_imm(2, 1),
            op::stxdw(1, 2, 0),
            op::mov64_imm(3, 7),
            op::atomic(1, 3, 0, atomic::XCHG),
            op::mov64_reg(0, 3),
            op::exit(),
        ],
        vec![
            op::mov64_imm(2, 9),
            op::stxdw(1, 2, 0),
            op::mov64_imm(0, 9),
            op::mov64_imm(3, 11),
            op::atomic(1, 3, 0, atomic::CMPXCHG),
            op::exit(),
        ],
        // 32-bit flavours.
        vec![
            op::mov64_imm(2, 5),
            op::stxw(1, 2, 0),
            op::mov64_imm(3, 3),
            op::atomic32(1, 3, 0, atomic::ADD | atomic::FETCH),
            op::mov64_reg(0, 3),
            op::exit(),
        ],
        vec![
            op::mov64_imm(2, 0b1100),
            op::stxw(1, 2, 4),
            op::mov64_imm(3, 0b1010),
            op::atomic32(1, 3, 4, atomic::XOR | atomic::FETCH),
            op::add64_reg(0, 3),
            op::exit(),
        ],
    ];

    for ops in cases {
        assert_engines_agree(&ops, &data);
    }
}

#[test]
fn extended_mode_runs_on_the_caller_stack() {
    let mut vm = vm_with([
        op::mov64_imm(2, 64),
        op::stxdw(10, 2, -8),
        op::ldxdw(0, 10, -8),
        op::exit(),
    ]);
    let entry = match vm.compile_ex(JitMode::Extended).unwrap() {
        JitFn::Extended(f) => f,
        JitFn::Basic(_) => unreachable!(),
    };
    let mut stack = vec![0u8; 8192];
    let result = unsafe { entry(std::ptr::null_mut(), 0, stack.as_mut_ptr(), stack.len() as u64) };
    assert_eq!(result, 64);
}

#[test]
fn local_calls_through_the_jit() {
    let ops = [
        op::mov64_imm(6, 7),
        op::call_local(2),
        op::mov64_reg(0, 6),
        op::exit(),
        op::mov64_imm(6, 99),
        op::exit(),
    ];

    // Interpreter reference on a caller-supplied stack.
    let mut vm = vm_with(ops);
    let mut stack = vec![0u8; 8192];
    let expected = vm.exec_ex(&mut [], &mut stack).unwrap();
    assert_eq!(expected, 7);

    let entry = match vm.compile_ex(JitMode::Extended).unwrap() {
        JitFn::Extended(f) => f,
        JitFn::Basic(_) => unreachable!(),
    };
    let result = unsafe { entry(std::ptr::null_mut(), 0, stack.as_mut_ptr(), stack.len() as u64) };
    assert_eq!(result, expected);
}

#[test]
fn local_function_entered_by_fallthrough_and_call() {
    // The function at PC 3 is both called and fallen into, exercising the
    // jump-around guard in front of its frame staging.
    let ops = [
        op::mov64_imm(0, 0),
        op::call_local(1),  // target: PC 3
        op::add64_imm(0, 100),
        op::add64_imm(0, 1), // PC 3: the local function
        op::exit(),
    ];

    let mut vm = vm_with(ops);
    let mut stack = vec![0u8; 8192];
    let expected = vm.exec_ex(&mut [], &mut stack).unwrap();
    assert_eq!(expected, 102);

    let entry = match vm.compile_ex(JitMode::Extended).unwrap() {
        JitFn::Extended(f) => f,
        JitFn::Basic(_) => unreachable!(),
    };
    let result = unsafe { entry(std::ptr::null_mut(), 0, stack.as_mut_ptr(), stack.len() as u64) };
    assert_eq!(result, expected);
}

#[test]
fn unwind_helper_exits_the_jit() {
    let mut vm = Vm::new();
    vm.register_helper(1, Some("zero"), zero_helper).unwrap();
    vm.set_unwind_index(1).unwrap();
    vm.load(&assemble([
        op::mov64_imm(0, 77),
        op::call_helper(1),
        op::mov64_imm(0, 1),
        op::exit(),
    ]))
    .unwrap();
    assert_eq!(run_jit(&mut vm, &mut []), 0);
}

#[test]
fn jit_pointer_survives_only_until_unload() {
    let mut vm = vm_with([op::mov64_imm(0, 5), op::exit()]);
    let _ = vm.compile().unwrap();
    vm.unload();
    assert!(matches!(
        vm.compile(),
        Err(VmError::Config(ConfigError::NoProgram))
    ));
}
