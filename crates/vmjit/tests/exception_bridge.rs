//! Aborts raised inside compiled code.
//!
//! Covers:
//! - Null guards on every load, store and call
//! - Propagation out of CALL, CALL_K, NEW, NEW_K and THROW
//! - Attribution of nested aborts to the faulting instruction
//! - Frame stack restoration after every abort

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use common::{assert_equivalent, compile, Outcome};
use vmjit::bytecode::opcode::*;
use vmjit::bytecode::{Assembler, RegClass, ScriptFunction};
use vmjit::jit::{JitConfig, JitEngine};
use vmjit::vm::{frame, heap, AbortReason, JitExceptionInfo, ReturnBuffer, VmError, VmFunction, VmValue};

fn finish(asm: Assembler) -> Arc<ScriptFunction> {
    asm.finish().expect("assembles")
}

/// Run compiled code through the raw contract and check the aborted call
/// returned 0 and left the frame stack as it found it.
fn run_aborting(func: &Arc<ScriptFunction>, args: &[VmValue], classes: &[RegClass]) -> JitExceptionInfo {
    let code = compile(func);
    let depth = frame::depth();
    let mut rets = ReturnBuffer::new(classes);
    let mut exc = JitExceptionInfo::new();
    let count = unsafe { code.call_raw(args, rets.slots_mut(), &mut exc) };
    assert!(exc.is_raised(), "{} did not abort", func.name());
    assert_eq!(count, 0);
    assert_eq!(frame::depth(), depth);
    exc
}

/// A native that counts its invocations.
fn counter() -> (Arc<VmFunction>, Arc<AtomicUsize>) {
    let count = Arc::new(AtomicUsize::new(0));
    let seen = count.clone();
    let func = VmFunction::native("counter", move |_, _| {
        seen.fetch_add(1, Ordering::SeqCst);
        Ok(0)
    });
    (func, count)
}

// ============================================================================
// Null guards
// ============================================================================

#[test]
fn test_loads_from_null() {
    let loads = [
        (Opcode::Lb, 1),
        (Opcode::LbR, 1),
        (Opcode::Lbu, 1),
        (Opcode::LbuR, 1),
        (Opcode::Lh, 1),
        (Opcode::LhR, 1),
        (Opcode::Lhu, 1),
        (Opcode::LhuR, 1),
        (Opcode::Lw, 1),
        (Opcode::LwR, 1),
        (Opcode::Lsp, 0),
        (Opcode::LspR, 0),
        (Opcode::Ldp, 0),
        (Opcode::LdpR, 0),
        (Opcode::Lp, 1),
        (Opcode::LpR, 1),
    ];
    let (count_calls, calls) = counter();
    for (op, dst) in loads {
        let mut asm = Assembler::new(op.mnemonic());
        asm.registers(2, 1, 0, 2);
        let k = asm.konst_int(4) as u8;
        let after = asm.konst_function(count_calls.clone()) as u8;
        asm.op(op, dst, 0, if op.mnemonic().ends_with("_R") { 0 } else { k });
        asm.call_konst(after, 0, &[]);
        asm.ret_nil();
        let func = finish(asm);

        let exc = run_aborting(&func, &[VmValue::null(), VmValue::int(4)], &[]);
        assert_eq!(exc.reason(), Some(AbortReason::ReadNil), "{}", op.mnemonic());

        let code = compile(&func);
        let outcome = assert_equivalent(&func, &code, &[VmValue::null(), VmValue::int(4)], &[]);
        assert_eq!(outcome, Outcome::Aborted { reason: AbortReason::ReadNil, arg: 0, at: Some(0) });
    }
    assert_eq!(calls.load(Ordering::SeqCst), 0);
}

#[test]
fn test_stores_to_null() {
    let stores = [
        (Opcode::Sb, 0),
        (Opcode::SbR, 0),
        (Opcode::Sh, 0),
        (Opcode::ShR, 0),
        (Opcode::Sw, 0),
        (Opcode::SwR, 0),
        (Opcode::Ssp, 0),
        (Opcode::SspR, 0),
        (Opcode::Sdp, 0),
        (Opcode::SdpR, 0),
        (Opcode::Sp, 1),
        (Opcode::SpR, 1),
    ];
    for (op, src) in stores {
        let mut asm = Assembler::new(op.mnemonic());
        asm.registers(2, 1, 0, 2);
        let k = asm.konst_int(8) as u8;
        asm.op(op, 0, src, if op.mnemonic().ends_with("_R") { 1 } else { k });
        asm.ret_imm(0, 1, true);
        let func = finish(asm);

        let args = [VmValue::null(), VmValue::int(5), VmValue::int(8)];
        let exc = run_aborting(&func, &args, &[RegClass::Int]);
        assert_eq!(exc.reason(), Some(AbortReason::WriteNil), "{}", op.mnemonic());
        assert_eq!(func.instruction_index(exc.pc as usize), Some(0));
    }
}

#[test]
fn test_call_through_null() {
    let mut asm = Assembler::new("call_null");
    asm.registers(0, 0, 0, 1).max_param(1);
    asm.param_imm(1);
    asm.call(0, 1, &[]);
    asm.ret_nil();
    let func = finish(asm);

    let exc = run_aborting(&func, &[VmValue::null()], &[]);
    assert_eq!(exc.reason(), Some(AbortReason::ReadNil));
    assert_eq!(func.instruction_index(exc.pc as usize), Some(1));
}

// ============================================================================
// Propagation
// ============================================================================

#[test]
fn test_failing_callee_stops_caller() {
    let failing = VmFunction::native("failing", |_, _| Err(VmError::Native("bad input".into())));
    let (count_calls, calls) = counter();
    let mut asm = Assembler::new("caller");
    asm.registers(1, 0, 0, 1).max_param(1);
    let counted = asm.konst_function(count_calls) as u8;
    let callee = asm.konst_function(failing.clone()) as u8;
    asm.param_reg(RegClass::Int, 0);
    let call_k = asm.call_konst(callee, 1, &[(RegClass::Int, 0)]);
    asm.call_konst(counted, 0, &[]);
    asm.ret_reg(0, RegClass::Int, 0, true);
    let func = finish(asm);

    let exc = run_aborting(&func, &[VmValue::int(3)], &[RegClass::Int]);
    assert_eq!(exc.reason(), Some(AbortReason::Other));
    assert_eq!(func.instruction_index(exc.pc as usize), Some(call_k));
    assert!(matches!(exc.payload.as_deref(), Some(VmError::Native(m)) if m == "bad input"));

    // same through a pointer register
    let mut asm = Assembler::new("caller_reg");
    asm.registers(1, 0, 0, 1).max_param(1);
    let counted = asm.konst_function(counter().0) as u8;
    asm.param_reg(RegClass::Int, 0);
    let call = asm.call(0, 1, &[]);
    asm.call_konst(counted, 0, &[]);
    asm.ret_nil();
    let func = finish(asm);
    let pointer = VmValue::pointer(Arc::as_ptr(&failing) as *mut u8);
    let exc = run_aborting(&func, &[VmValue::int(3), pointer], &[]);
    assert_eq!(func.instruction_index(exc.pc as usize), Some(call));

    assert_eq!(calls.load(Ordering::SeqCst), 0);
}

#[test]
fn test_new_rejects_bad_sizes() {
    for size in [-1, heap::MAX_ALLOC_SIZE + 1, i32::MIN] {
        let mut asm = Assembler::new("new");
        asm.registers(1, 0, 0, 1);
        asm.op(Opcode::New, 0, 0, 0);
        asm.ret_imm(0, 1, true);
        let func = finish(asm);
        let exc = run_aborting(&func, &[VmValue::int(size)], &[RegClass::Int]);
        assert_eq!(exc.reason(), Some(AbortReason::ArrayTooLarge));
        assert_eq!(exc.arg, size);

        let mut asm = Assembler::new("new_k");
        asm.registers(1, 0, 0, 1);
        let k = asm.konst_int(size);
        asm.li(0, 0);
        asm.op_bc(Opcode::NewK, 0, k);
        asm.ret_imm(0, 1, true);
        let func = finish(asm);
        let code = compile(&func);
        let outcome = assert_equivalent(&func, &code, &[], &[RegClass::Int]);
        assert_eq!(outcome, Outcome::Aborted { reason: AbortReason::ArrayTooLarge, arg: size, at: Some(1) });
    }
}

#[test]
fn test_throw_carries_object() {
    let mut object = [0u8; 8];
    let address = object.as_mut_ptr();

    let mut asm = Assembler::new("throw_reg");
    asm.registers(0, 0, 0, 1);
    asm.op_bc(Opcode::Throw, 0, 0);
    asm.ret_imm(0, 1, true);
    let func = finish(asm);
    let mut exc = run_aborting(&func, &[VmValue::pointer(address)], &[RegClass::Int]);
    let exception = exc.take().expect("raised");
    assert_eq!(exception.reason, AbortReason::Other);
    assert_eq!(exception.instruction_index(&func), Some(0));
    assert!(matches!(exception.payload, Some(VmError::Thrown { object }) if object == address as usize));

    let mut asm = Assembler::new("throw_konst");
    let k = asm.konst_pointer(0x5150);
    asm.op_bc(Opcode::Throw, 1, k);
    let func = finish(asm);
    let mut exc = run_aborting(&func, &[], &[]);
    let exception = exc.take().expect("raised");
    assert!(matches!(exception.payload, Some(VmError::Thrown { object: 0x5150 })));
}

#[test]
fn test_nested_throw_reports_inner_instruction() {
    let mut inner = Assembler::new("inner");
    inner.registers(1, 0, 0, 0);
    inner.op(Opcode::AddI, 0, 0, 1);
    let k = inner.konst_pointer(0xBAD);
    let throw_pc = inner.op_bc(Opcode::Throw, 1, k);
    inner.ret_nil();
    let inner = finish(inner);

    let mut outer = Assembler::new("outer");
    outer.registers(1, 0, 0, 0).max_param(1);
    let callee = outer.konst_function(VmFunction::script(inner.clone())) as u8;
    outer.li(0, 10);
    outer.param_reg(RegClass::Int, 0);
    outer.call_konst(callee, 1, &[]);
    outer.ret_reg(0, RegClass::Int, 0, true);
    let outer = finish(outer);

    let engine = JitEngine::with_config(JitConfig { capture_listing: true, ..Default::default() });
    engine.compile(&inner).expect("inner compiles");
    engine.compile(&outer).expect("outer compiles");

    let mut rets = ReturnBuffer::new(&[RegClass::Int]);
    let err = engine.call(&outer, &[], &mut rets).unwrap_err();
    assert_eq!(err.instruction_index(&inner), Some(throw_pc));
    assert_eq!(err.instruction_index(&outer), None);
    assert!(matches!(err.payload, Some(VmError::Thrown { object: 0xBAD })));
    assert_eq!(frame::depth(), 0);
}

// ============================================================================
// Arithmetic and depth
// ============================================================================

#[test]
fn test_division_by_zero() {
    for op in [Opcode::DivRR, Opcode::DivuRR, Opcode::ModRR, Opcode::ModuRR] {
        let mut asm = Assembler::new(op.mnemonic());
        asm.registers(2, 0, 0, 0);
        asm.li(1, 0);
        asm.op(op, 0, 0, 1);
        asm.ret_reg(0, RegClass::Int, 0, true);
        let func = finish(asm);
        let exc = run_aborting(&func, &[VmValue::int(10)], &[RegClass::Int]);
        assert_eq!(exc.reason(), Some(AbortReason::DivisionByZero));
        assert_eq!(func.instruction_index(exc.pc as usize), Some(1));
    }
}

#[test]
fn test_runaway_recursion_overflows() {
    // recurse(self): self(self)
    let mut asm = Assembler::new("recurse");
    asm.registers(0, 0, 0, 1).max_param(1);
    asm.param_reg(RegClass::Pointer, 0);
    asm.call(0, 1, &[]);
    asm.ret_nil();
    let func = finish(asm);
    let wrapped = VmFunction::script(func.clone());
    let this = VmValue::pointer(Arc::as_ptr(&wrapped) as *mut u8);

    // every level nests a native call chain; give it room
    std::thread::Builder::new()
        .stack_size(64 * 1024 * 1024)
        .spawn(move || {
            let mut exc = run_aborting(&func, &[this], &[]);
            let exception = exc.take().expect("raised");
            assert!(matches!(exception.payload, Some(VmError::StackOverflow { depth: frame::MAX_FRAME_DEPTH })));
            assert_eq!(exception.instruction_index(&func), Some(1));
            assert_eq!(frame::depth(), 0);
            drop(wrapped);
        })
        .expect("spawn")
        .join()
        .expect("overflow test thread");
}
