//! End-to-end pipeline tests: DSL → IR → allocation → opcodes → invoke.

use qpu_compiler::dsl::{any, IntElem, IntExpr};
use qpu_compiler::heap::{new_heap, SharedArray};
use qpu_compiler::{compile, CompileError, RecordingDriver, Target, UniformArg};

/// The canonical v3d nop and nop-with-thrsw words, closing every program.
const V3D_NOP: u64 = 0x3c00_3186_bb80_0000;
const V3D_NOP_THRSW: u64 = 0x3c20_3186_bb80_0000;

/// The canonical vc4 nop.
const VC4_NOP: u64 = 0x1000_09e7_009e_7000;

fn add_kernel(k: &mut qpu_compiler::KernelBuilder) {
    let n = k.uniform_int();
    let p = k.uniform_ptr::<IntElem>();
    let x = k.int_var();
    k.assign(x, n + 1);
    let addr = p.at(k.elem_num());
    k.store(addr, x);
}

#[test]
fn v3d_program_ends_with_canonical_tail() {
    let kernel = compile(Target::V3d, add_kernel).unwrap();
    let code = kernel.code();
    assert!(code.len() > 8);

    let tail = &code[code.len() - 8..];
    assert_eq!(
        tail,
        &[
            V3D_NOP_THRSW,
            V3D_NOP_THRSW,
            V3D_NOP,
            V3D_NOP,
            V3D_NOP_THRSW,
            V3D_NOP,
            V3D_NOP,
            V3D_NOP,
        ]
    );
}

#[test]
fn vc4_program_ends_with_end_signal() {
    let kernel = compile(Target::Vc4, add_kernel).unwrap();
    let code = kernel.code();
    assert!(code.len() > 3);

    // END signal word followed by two plain nops
    let end_word = code[code.len() - 3];
    assert_eq!(end_word >> 60, 3, "program-end signal nibble");
    assert_eq!(code[code.len() - 2], VC4_NOP);
    assert_eq!(code[code.len() - 1], VC4_NOP);
}

#[test]
fn same_ast_produces_different_machine_code_per_target() {
    let v3d = compile(Target::V3d, add_kernel).unwrap();
    let vc4 = compile(Target::Vc4, add_kernel).unwrap();
    assert_ne!(v3d.code(), vc4.code());
}

#[test]
fn loop_kernel_compiles_on_both_targets() {
    let build = |k: &mut qpu_compiler::KernelBuilder| {
        let n = k.uniform_int();
        let out = k.uniform_ptr::<IntElem>();
        let sum = k.int_var();
        let i = k.int_var();
        k.assign(sum, 0);
        k.for_(i, 0, IntExpr::from(n), 1, |k| {
            k.assign(sum, sum + i);
        });
        let addr = out.at(k.elem_num());
        k.store(addr, sum);
    };

    let v3d = compile(Target::V3d, build).unwrap();
    // a branch word (op_mul field zero) must be present
    assert!(
        v3d.code().iter().any(|w| (w >> 58) == 0),
        "no branch word in the v3d stream"
    );

    let vc4 = compile(Target::Vc4, build).unwrap();
    // a branch word (signal nibble 15) must be present
    assert!(
        vc4.code().iter().any(|w| (w >> 60) == 15),
        "no branch word in the vc4 stream"
    );
}

#[test]
fn where_kernel_compiles_on_both_targets() {
    let build = |k: &mut qpu_compiler::KernelBuilder| {
        let p = k.uniform_ptr::<IntElem>();
        let x = k.int_var();
        let y = k.int_var();
        k.assign(x, k.elem_num());
        k.where_(
            IntExpr::from(x).lt(8),
            |k| k.assign(y, 1),
            |k| k.assign(y, 0),
        );
        let addr = p.at(k.elem_num());
        k.store(addr, y);
    };

    compile(Target::V3d, build).unwrap();
    compile(Target::Vc4, build).unwrap();
}

#[test]
fn conditional_kernel_compiles() {
    let build = |k: &mut qpu_compiler::KernelBuilder| {
        let n = k.uniform_int();
        let p = k.uniform_ptr::<IntElem>();
        let x = k.int_var();
        k.if_(
            any(IntExpr::from(n).eq(0)),
            |k| k.assign(x, 100),
            |k| k.assign(x, 200),
        );
        let addr = p.at(k.elem_num());
        k.store(addr, x);
    };

    compile(Target::V3d, build).unwrap();
    compile(Target::Vc4, build).unwrap();
}

#[test]
fn accumulator_peephole_fires_on_chained_expressions() {
    let kernel = compile(Target::V3d, |k| {
        let a = k.uniform_int();
        let p = k.uniform_ptr::<IntElem>();
        let x = k.int_var();
        // each intermediate is used exactly once, in the next instruction
        k.assign(x, ((a + 1) + 2) + 3);
        let addr = p.at(k.elem_num());
        k.store(addr, x);
    })
    .unwrap();

    assert!(
        kernel.compile_data().num_accs_introduced > 0,
        "expected accumulator substitutions, got none"
    );
}

#[test]
fn dual_issue_combine_fires_on_shared_operands() {
    let kernel = compile(Target::V3d, |k| {
        let a = k.uniform_float();
        let b = k.uniform_float();
        let p = k.uniform_ptr::<IntElem>();
        let x = k.float_var();
        let y = k.float_var();
        k.assign_f(x, a + b);
        k.assign_f(y, a * b);
        let addr0 = p.at(k.elem_num());
        k.store_f(addr0, x);
        let addr1 = p.at(k.elem_num() + 16);
        k.store_f(addr1, y);
    })
    .unwrap();

    assert!(
        kernel.compile_data().num_instructions_combined > 0,
        "expected at least one dual-issue combine"
    );
}

#[test]
fn full_invoke_with_shared_arrays() {
    let heap = new_heap(0x10000);
    let result: SharedArray<i32> = SharedArray::alloc(&heap, 16).unwrap();

    let mut kernel = compile(Target::V3d, add_kernel).unwrap();
    let mut driver = RecordingDriver::with_heap(heap.clone());

    kernel
        .load(&[UniformArg::Int(41), UniformArg::Address(result.address())])
        .unwrap()
        .invoke(&mut driver, &heap)
        .unwrap();

    assert_eq!(driver.calls, 1);
    assert_eq!(driver.code, kernel.code());
    // slot 2 carries the first argument, slot 3 the array address
    assert_eq!(driver.uniforms[2], 41);
    assert_eq!(driver.uniforms[3], result.address());
}

#[test]
fn mismatched_arguments_are_user_errors() {
    let mut kernel = compile(Target::V3d, add_kernel).unwrap();
    match kernel.load(&[UniformArg::Int(1)]) {
        Err(CompileError::UserAssertion(_)) => {}
        other => panic!("expected UserAssertion, got {other:?}"),
    }
    match kernel.load(&[UniformArg::Address(4), UniformArg::Int(1)]) {
        Err(CompileError::UserAssertion(_)) => {}
        other => panic!("expected UserAssertion, got {other:?}"),
    }
}

#[test]
fn sfu_and_rotate_kernel_compiles_on_both_targets() {
    let build = |k: &mut qpu_compiler::KernelBuilder| {
        let a = k.uniform_float();
        let p = k.uniform_ptr::<qpu_compiler::dsl::FloatElem>();
        let r = k.float_var();
        k.assign_f(r, qpu_compiler::dsl::FloatExpr::from(a).recip());
        let x = k.int_var();
        k.assign(x, k.elem_num().rotate(3));
        let addr = p.at(k.elem_num());
        k.store_f(addr, r);
    };

    compile(Target::V3d, build).unwrap();
    compile(Target::Vc4, build).unwrap();
}
