
use krait_vm::prelude::*;
use test_helpers::*;

#[test]
fn helper_receives_the_data_pointer_as_context() {
    let mut cell = 0x1_2345_6789u64;
    let mut vm = Vm::new();
    vm.register_helper(1, Some("cookie"), cookie_helper).unwrap();
    vm.load(&assemble([op::call_helper(1), op::exit()])).unwrap();
    let result = vm.exec(word_bytes(&mut cell)).unwrap();
    assert_eq!(result, 0x1_2345_6789);
}

#[test]
fn helper_arguments_come_from_r1_through_r5() {
    let mut vm = Vm::new();
    vm.register_helper(0, Some("sum"), sum_helper).unwrap();
    vm.load(&assemble([
        op::mov64_imm(1, 1),
        op::mov64_imm(2, 2),
        op::mov64_imm(3, 3),
        op::mov64_imm(4, 4),
        op::mov64_imm(5, 5),
        op::call_helper(0),
        op::exit(),
    ]))
    .unwrap();
    assert_eq!(vm.exec(&mut []).unwrap(), 15);
}

#[test]
fn dispatcher_overrides_per_index_lookup() {
    let mut vm = Vm::new();
    // Helper 1 is registered, but the dispatcher takes precedence.
    vm.register_helper(1, Some("identity"), identity_helper).unwrap();
    vm.register_external_dispatcher(index_dispatcher, None).unwrap();
    vm.load(&assemble([
        op::mov64_imm(1, 7),
        op::call_helper(1),
        op::exit(),
    ]))
    .unwrap();
    assert_eq!(vm.exec(&mut []).unwrap(), 1007);
}

#[test]
fn dispatcher_receives_the_context() {
    let mut cell = 0x1_2345_6789u64;
    let mut vm = Vm::new();
    vm.register_external_dispatcher(cookie_dispatcher, None).unwrap();
    vm.load(&assemble([op::call_helper(5), op::exit()])).unwrap();
    assert_eq!(vm.exec(word_bytes(&mut cell)).unwrap(), 0x1_2345_6789);
}

#[cfg(any(target_arch = "x86_64", target_arch = "aarch64"))]
mod jit {
    use super::*;

    fn run_jit(vm: &mut Vm, data: &mut [u8]) -> u64 {
        let entry = vm.compile().expect("translation should succeed");
        unsafe { entry(data.as_mut_ptr(), data.len() as u64) }
    }

    #[test]
    fn helper_dispatch_matches_the_interpreter() {
        let mut cell = 0x1_2345_6789u64;
        let mut vm = Vm::new();
        vm.register_helper(1, Some("cookie"), cookie_helper).unwrap();
        vm.load(&assemble([op::call_helper(1), op::exit()])).unwrap();

        let interpreted = vm.exec(word_bytes(&mut cell)).unwrap();
        let jitted = run_jit(&mut vm, word_bytes(&mut cell));
        assert_eq!(interpreted, 0x1_2345_6789);
        assert_eq!(jitted, interpreted);
    }

    #[test]
    fn helper_arguments_through_the_jit() {
        let mut vm = Vm::new();
        vm.register_helper(0, Some("sum"), sum_helper).unwrap();
        vm.load(&assemble([
            op::mov64_imm(1, 10),
            op::mov64_imm(2, 20),
            op::mov64_imm(3, 30),
            op::mov64_imm(4, 40),
            op::mov64_imm(5, 50),
            op::call_helper(0),
            op::exit(),
        ]))
        .unwrap();
        assert_eq!(run_jit(&mut vm, &mut []), 150);
    }

    #[test]
    fn dispatcher_through_the_jit() {
        let mut vm = Vm::new();
        vm.register_external_dispatcher(index_dispatcher, None).unwrap();
        vm.load(&assemble([
            op::mov64_imm(1, 7),
            op::call_helper(2),
            op::exit(),
        ]))
        .unwrap();
        assert_eq!(run_jit(&mut vm, &mut []), 2007);
    }

    #[test]
    fn dispatcher_registered_after_compile_patches_the_buffer() {
        let mut vm = Vm::new();
        vm.register_helper(1, Some("identity"), identity_helper).unwrap();
        vm.load(&assemble([
            op::mov64_imm(1, 7),
            op::call_helper(1),
            op::exit(),
        ]))
        .unwrap();

        // First run goes through the per-index table.
        assert_eq!(run_jit(&mut vm, &mut []), 7);

        // Swapping the dispatcher in reroutes the already-compiled call.
        vm.register_external_dispatcher(index_dispatcher, None).unwrap();
        assert_eq!(run_jit(&mut vm, &mut []), 1007);
    }
}

#[cfg(target_arch = "x86_64")]
mod callx {
    use super::*;

    #[test]
    fn callx_reads_the_index_from_a_register() {
        let mut vm = Vm::new();
        vm.register_helper(3, Some("identity"), identity_helper).unwrap();
        vm.load(&assemble([
            op::mov64_imm(1, 21),
            op::mov64_imm(0, 3),
            op::callx(0),
            op::exit(),
        ]))
        .unwrap();
        assert_eq!(vm.exec(&mut []).unwrap(), 21);

        let entry = vm.compile().unwrap();
        assert_eq!(unsafe { entry(std::ptr::null_mut(), 0) }, 21);
    }

    #[test]
    fn callx_with_an_empty_slot_is_an_exec_error() {
        let mut vm = Vm::new();
        vm.register_helper(3, Some("identity"), identity_helper).unwrap();
        vm.load(&assemble([
            op::mov64_imm(0, 9),
            op::callx(0),
            op::exit(),
        ]))
        .unwrap();
        let err = vm.exec(&mut []).unwrap_err();
        assert!(matches!(
            err,
            VmError::Exec(ExecError::UnknownHelper { helper: 9, pc: 1 })
        ));
    }
}
