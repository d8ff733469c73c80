
use krait_vm::prelude::*;
use test_helpers::*;

use krait_asm::opcode::atomic;

#[test]
fn unknown_opcode_names_the_pc() {
    let mut vm = Vm::new();
    let err = vm
        .load(&assemble([Instruction::new(0x8f, 0, 0, 0, 0), op::exit()]))
        .unwrap_err();
    assert!(err.to_string().contains("unknown opcode 0x8f at PC 0"));
}

#[test]
fn program_at_the_cap_loads_and_one_past_does_not() {
    let at_cap = |n: usize| {
        let mut ops: Vec<Instruction> = (1..n).map(|_| op::ja(0)).collect();
        ops.push(op::exit());
        assemble(ops)
    };

    let mut vm = Vm::new();
    vm.set_max_instructions(8).unwrap();
    vm.load(&at_cap(8)).unwrap();

    let mut vm = Vm::new();
    vm.set_max_instructions(8).unwrap();
    let err = vm.load(&at_cap(9)).unwrap_err();
    assert!(err.to_string().contains("too many instructions"));
}

#[test]
fn zero_restores_the_default_cap() {
    let mut vm = Vm::new();
    vm.set_max_instructions(2).unwrap();
    let program = assemble([op::mov64_imm(0, 0), op::ja(0), op::exit()]);
    assert!(vm.load(&program).is_err());

    vm.set_max_instructions(0).unwrap();
    vm.load(&program).unwrap();
}

#[test]
fn setters_are_refused_while_loaded_and_return_after_unload() {
    let mut vm = vm_with([op::exit()]);
    assert!(matches!(
        vm.set_max_instructions(10),
        Err(VmError::Config(ConfigError::ProgramLoaded))
    ));
    assert!(matches!(
        vm.toggle_readonly_bytecode(false),
        Err(VmError::Config(ConfigError::ProgramLoaded))
    ));

    vm.unload();
    vm.set_max_instructions(10).unwrap();
    // Read-only bytecode defaults to on; the setter reports the old value.
    assert!(vm.toggle_readonly_bytecode(false).unwrap());
    assert!(!vm.toggle_readonly_bytecode(true).unwrap());
}

#[test]
fn reload_after_unload_behaves_like_a_fresh_load() {
    let program = assemble([op::mov64_imm(0, 11), op::exit()]);
    let mut vm = Vm::new();
    vm.load(&program).unwrap();
    assert_eq!(vm.exec(&mut []).unwrap(), 11);

    vm.unload();
    assert!(!vm.is_loaded());
    assert!(matches!(
        vm.exec(&mut []),
        Err(VmError::Config(ConfigError::NoProgram))
    ));

    vm.load(&program).unwrap();
    assert_eq!(vm.exec(&mut []).unwrap(), 11);
}

#[test]
fn load_twice_is_refused() {
    let program = assemble([op::exit()]);
    let mut vm = Vm::new();
    vm.load(&program).unwrap();
    assert!(matches!(
        vm.load(&program),
        Err(VmError::Config(ConfigError::ProgramLoaded))
    ));
}

#[test]
fn ragged_byte_buffers_are_rejected() {
    let mut program = assemble([op::exit()]);
    program.push(0);
    let mut vm = Vm::new();
    assert!(matches!(
        vm.load(&program),
        Err(VmError::Load(LoadError::UnalignedProgram(9)))
    ));
}

#[test]
fn frame_register_writes_are_rejected() {
    let mut vm = Vm::new();
    let err = vm
        .load(&assemble([op::add64_imm(10, 8), op::exit()]))
        .unwrap_err();
    assert!(err.to_string().contains("invalid destination register 10"));
}

#[test]
fn wide_load_needs_its_second_slot() {
    let [first, _] = op::lddw(1, 0x1122_3344_5566_7788);
    let mut vm = Vm::new();
    let err = vm.load(&assemble([first])).unwrap_err();
    assert!(matches!(
        err,
        VmError::Load(LoadError::IncompleteWideLoad { pc: 0 })
    ));
}

#[test]
fn wide_load_second_slot_must_be_empty() {
    let [first, _] = op::lddw(1, 7);
    let mut vm = Vm::new();
    let err = vm
        .load(&assemble([first, op::mov64_imm(0, 0), op::exit()]))
        .unwrap_err();
    assert!(matches!(
        err,
        VmError::Load(LoadError::MalformedWideLoad { pc: 0 })
    ));
}

#[test]
fn branch_targets_must_stay_inside_the_program() {
    let mut vm = Vm::new();
    let err = vm.load(&assemble([op::ja(5), op::exit()])).unwrap_err();
    assert!(matches!(
        err,
        VmError::Load(LoadError::JumpOutOfBounds { pc: 0, target: 6 })
    ));

    // Exactly one past the end is a legal fall-off target.
    let mut vm = Vm::new();
    vm.load(&assemble([op::jeq_imm(1, 1, 0), op::exit()])).unwrap();
}

#[test]
fn backward_branches_may_not_escape() {
    let mut vm = Vm::new();
    let err = vm
        .load(&assemble([op::mov64_imm(0, 0), op::ja(-3), op::exit()]))
        .unwrap_err();
    assert!(matches!(
        err,
        VmError::Load(LoadError::JumpOutOfBounds { pc: 1, target: -1 })
    ));
}

#[test]
fn programs_must_end_with_exit() {
    let mut vm = Vm::new();
    let err = vm
        .load(&assemble([op::mov64_imm(0, 0), op::ja(-2)]))
        .unwrap_err();
    assert!(matches!(err, VmError::Load(LoadError::NoTerminalExit)));
}

#[test]
fn calls_to_unregistered_helpers_are_rejected() {
    let mut vm = Vm::new();
    let err = vm
        .load(&assemble([op::call_helper(3), op::exit()]))
        .unwrap_err();
    assert!(err.to_string().contains("call to unknown helper 3"));
}

#[test]
fn dispatcher_validator_gates_helper_calls() {
    fn only_low_indices(idx: u32) -> bool {
        idx < 4
    }

    let program = assemble([op::call_helper(3), op::exit()]);
    let mut vm = Vm::new();
    vm.register_external_dispatcher(index_dispatcher, Some(only_low_indices))
        .unwrap();
    vm.load(&program).unwrap();

    let rejected = assemble([op::call_helper(9), op::exit()]);
    vm.unload();
    let err = vm.load(&rejected).unwrap_err();
    assert!(err.to_string().contains("call to unknown helper 9"));
}

#[test]
fn local_call_out_of_range_is_rejected() {
    let mut vm = Vm::new();
    let err = vm
        .load(&assemble([op::call_local(-3), op::exit()]))
        .unwrap_err();
    assert!(matches!(
        err,
        VmError::Load(LoadError::InvalidLocalCall { pc: 0, target: -2 })
    ));
}

#[test]
fn local_call_into_a_wide_load_is_rejected() {
    let [first, second] = op::lddw(1, u64::MAX);
    let mut vm = Vm::new();
    // Target is the continuation slot of the wide load.
    let err = vm
        .load(&assemble([op::call_local(1), first, second, op::exit()]))
        .unwrap_err();
    assert!(matches!(
        err,
        VmError::Load(LoadError::InvalidLocalCall { pc: 0, target: 2 })
    ));
}

#[test]
fn atomic_sub_ops_are_checked() {
    let mut vm = Vm::new();
    let err = vm
        .load(&assemble([op::atomic(1, 2, 0, 0x20), op::exit()]))
        .unwrap_err();
    assert!(err.to_string().contains("invalid immediate"));

    let mut vm = Vm::new();
    vm.load(&assemble([
        op::atomic(1, 2, 0, atomic::AND | atomic::FETCH),
        op::exit(),
    ]))
    .unwrap();
}

#[test]
fn stack_usage_calculator_results_are_checked() {
    fn unaligned(_cookie: *mut std::ffi::c_void, _pc: u32) -> u16 {
        24
    }

    let program = assemble([
        op::call_local(1),
        op::exit(),
        op::mov64_imm(0, 1),
        op::exit(),
    ]);

    let mut vm = Vm::new();
    vm.register_stack_usage_calculator(unaligned, std::ptr::null_mut())
        .unwrap();
    let err = vm.load(&program).unwrap_err();
    assert!(err
        .to_string()
        .contains("local function (at PC 2) has improperly sized stack use (24)"));
}

#[test]
fn zero_and_aligned_stack_usages_are_accepted() {
    fn zero(_cookie: *mut std::ffi::c_void, _pc: u32) -> u16 {
        0
    }

    let program = assemble([
        op::call_local(1),
        op::exit(),
        op::mov64_imm(0, 1),
        op::exit(),
    ]);

    let mut vm = Vm::new();
    vm.register_stack_usage_calculator(zero, std::ptr::null_mut())
        .unwrap();
    vm.load(&program).unwrap();
}

#[test]
fn oversized_stack_usage_is_rejected() {
    fn huge(_cookie: *mut std::ffi::c_void, _pc: u32) -> u16 {
        528
    }

    let program = assemble([
        op::call_local(1),
        op::exit(),
        op::mov64_imm(0, 1),
        op::exit(),
    ]);

    let mut vm = Vm::new();
    vm.register_stack_usage_calculator(huge, std::ptr::null_mut())
        .unwrap();
    assert!(vm.load(&program).is_err());
}

#[test]
fn helper_registration_and_lookup_by_name() {
    let mut vm = Vm::new();
    vm.register_helper(7, Some("sum"), sum_helper).unwrap();
    assert_eq!(vm.helper_index_by_name("sum"), Some(7));
    assert_eq!(vm.helper_index_by_name("missing"), None);

    assert!(matches!(
        vm.register_helper(64, None, sum_helper),
        Err(VmError::Config(ConfigError::HelperIndexOutOfRange(64)))
    ));
}

#[test]
fn helper_registration_is_refused_while_loaded() {
    let mut vm = vm_with([op::exit()]);
    assert!(matches!(
        vm.register_helper(1, None, sum_helper),
        Err(VmError::Config(ConfigError::ProgramLoaded))
    ));
}

#[test]
fn readonly_bytecode_default_still_executes() {
    // The sealed copy must behave exactly like the plain one.
    let mut vm = Vm::new();
    vm.load(&assemble([op::mov64_imm(0, 21), op::add64_imm(0, 21), op::exit()]))
        .unwrap();
    assert_eq!(vm.exec(&mut []).unwrap(), 42);

    let mut vm = Vm::new();
    vm.toggle_readonly_bytecode(false).unwrap();
    vm.load(&assemble([op::mov64_imm(0, 21), op::add64_imm(0, 21), op::exit()]))
        .unwrap();
    assert_eq!(vm.exec(&mut []).unwrap(), 42);
}
