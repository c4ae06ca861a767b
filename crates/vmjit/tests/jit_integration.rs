//! End-to-end tests for the JIT engine.
//!
//! Tests cover:
//! - Hot function detection through calls and backward jumps
//! - Code cache bookkeeping and invalidation
//! - Rejected functions staying interpreted
//! - Listing capture
//! - Object lifetime across calls

mod common;

use std::sync::Arc;

use vmjit::bytecode::opcode::*;
use vmjit::bytecode::{Assembler, Instr, RegClass, ScriptFunction, VerifyError};
use vmjit::jit::{compile_function, CodeCache, JitConfig, JitEngine, JitError, JitRuntime, OptLevel};
use vmjit::vm::{heap, ReturnBuffer, VmFunction, VmValue};

fn add_function() -> Arc<ScriptFunction> {
    let mut asm = Assembler::new("add");
    asm.registers(3, 0, 0, 0);
    asm.op(Opcode::AddRR, 2, 0, 1);
    asm.ret_reg(0, RegClass::Int, 2, true);
    asm.finish().unwrap()
}

/// sum(n) = n + (n - 1) + ... + 1
fn sum_function() -> Arc<ScriptFunction> {
    let mut asm = Assembler::new("sum");
    asm.registers(2, 0, 0, 0);
    let top = asm.new_label();
    let done = asm.new_label();
    asm.bind(top);
    asm.op(Opcode::Test, 0, 0, 0);
    asm.jmp(done);
    asm.op(Opcode::AddRR, 1, 1, 0);
    asm.op(Opcode::AddI, 0, 0, (-1i8) as u8);
    asm.jmp(top);
    asm.bind(done);
    asm.ret_reg(0, RegClass::Int, 1, true);
    asm.finish().unwrap()
}

fn call_int(engine: &JitEngine, func: &Arc<ScriptFunction>, args: &[VmValue]) -> i32 {
    let mut rets = ReturnBuffer::new(&[RegClass::Int]);
    let count = engine.call(func, args, &mut rets).unwrap();
    assert_eq!(count, 1);
    rets.int(0).unwrap()
}

// ============================================================================
// Hot function detection
// ============================================================================

#[test]
fn test_call_threshold_triggers_compilation() {
    common::init_tracing();
    let engine = JitEngine::with_config(JitConfig { call_threshold: 10, ..Default::default() });
    let func = add_function();

    for i in 0..9 {
        assert_eq!(call_int(&engine, &func, &[VmValue::int(i), VmValue::int(2)]), i + 2);
        assert!(!engine.is_compiled(&func));
    }
    assert_eq!(call_int(&engine, &func, &[VmValue::int(40), VmValue::int(2)]), 42);
    assert!(engine.is_compiled(&func));
    assert!(func.profile().is_jit_available());
    assert_eq!(func.profile().calls(), 10);

    // stays compiled; further calls hit the cache
    assert_eq!(call_int(&engine, &func, &[VmValue::int(-1), VmValue::int(-1)]), -2);
    assert_eq!(engine.cache().entry_count(), 1);
}

#[test]
fn test_loop_threshold_triggers_compilation() {
    let engine = JitEngine::with_config(JitConfig {
        call_threshold: u32::MAX,
        loop_threshold: 50,
        ..Default::default()
    });
    let func = sum_function();

    assert_eq!(call_int(&engine, &func, &[VmValue::int(100)]), 5050);
    assert!(!engine.is_compiled(&func));
    assert!(func.profile().loops() >= 50);

    assert_eq!(call_int(&engine, &func, &[VmValue::int(10)]), 55);
    assert!(engine.is_compiled(&func));
}

#[test]
fn test_nested_calls_go_through_engine() {
    let inner = add_function();
    let mut asm = Assembler::new("outer");
    asm.registers(1, 0, 0, 0).max_param(2);
    let callee = asm.konst_function(VmFunction::script(inner.clone())) as u8;
    asm.param_reg(RegClass::Int, 0);
    asm.param_imm(100);
    asm.call_konst(callee, 2, &[(RegClass::Int, 0)]);
    asm.ret_reg(0, RegClass::Int, 0, true);
    let outer = asm.finish().unwrap();

    let engine = JitEngine::with_config(JitConfig { call_threshold: 3, ..Default::default() });
    for i in 0..5 {
        assert_eq!(call_int(&engine, &outer, &[VmValue::int(i)]), i + 100);
    }
    assert!(engine.is_compiled(&outer));
    assert!(engine.is_compiled(&inner));
    assert_eq!(engine.cache().entry_count(), 2);
}

#[test]
fn test_oversized_function_stays_interpreted() {
    let engine = JitEngine::with_config(JitConfig {
        call_threshold: 1,
        max_function_size: 2,
        ..Default::default()
    });
    let func = sum_function();
    for _ in 0..3 {
        assert_eq!(call_int(&engine, &func, &[VmValue::int(4)]), 10);
    }
    assert!(!engine.is_compiled(&func));
    assert!(!func.profile().is_jit_failed());
}

// ============================================================================
// Code cache
// ============================================================================

#[test]
fn test_cache_operations() {
    let runtime = JitRuntime::acquire(OptLevel::Speed).unwrap();
    let add = add_function();
    let sum = sum_function();
    let add_code = Arc::new(compile_function(&runtime, &add, false).unwrap());
    let sum_code = Arc::new(compile_function(&runtime, &sum, false).unwrap());
    assert!(add_code.code_size() > 0);

    let cache = CodeCache::new(1024 * 1024);
    assert!(cache.get(add.id()).is_none());
    cache.insert(add.id(), add_code.clone()).unwrap();
    cache.insert(sum.id(), sum_code.clone()).unwrap();
    assert_eq!(cache.total_size(), add_code.code_size() + sum_code.code_size());
    assert!(cache.contains(add.id()));

    // replacing an entry does not double count it
    cache.insert(add.id(), add_code.clone()).unwrap();
    assert_eq!(cache.total_size(), add_code.code_size() + sum_code.code_size());

    cache.invalidate(add.id());
    assert!(!cache.contains(add.id()));
    assert!(cache.get(add.id()).is_none());
    assert_eq!(cache.entry_count(), 2);

    let mut rets = ReturnBuffer::new(&[RegClass::Int]);
    let code = cache.get(sum.id()).unwrap();
    assert_eq!(code.call(&[VmValue::int(3)], &mut rets).unwrap(), 1);
    assert_eq!(rets.int(0), Some(6));

    cache.clear();
    assert_eq!(cache.entry_count(), 0);
    assert_eq!(cache.total_size(), 0);
}

#[test]
fn test_cache_full_keeps_interpreting() {
    let runtime = JitRuntime::acquire(OptLevel::Speed).unwrap();
    let func = add_function();
    let code = Arc::new(compile_function(&runtime, &func, false).unwrap());
    let cache = CodeCache::new(code.code_size() - 1);
    assert!(matches!(cache.insert(func.id(), code), Err(JitError::CacheFull { size: 0, .. })));
    assert_eq!(cache.entry_count(), 0);

    let engine = JitEngine::with_config(JitConfig { call_threshold: 1, max_code_size: 1, ..Default::default() });
    for i in 0..3 {
        assert_eq!(call_int(&engine, &func, &[VmValue::int(i), VmValue::int(i)]), 2 * i);
    }
    assert!(!engine.is_compiled(&func));
    assert!(func.profile().is_jit_failed());
    assert!(matches!(engine.compile(&func), Err(JitError::CacheFull { .. })));
}

#[test]
fn test_invalidate_allows_recompilation() {
    let engine = JitEngine::with_config(JitConfig { call_threshold: 1, ..Default::default() });
    let func = add_function();
    call_int(&engine, &func, &[VmValue::int(1), VmValue::int(1)]);
    assert!(engine.is_compiled(&func));

    engine.invalidate(&func);
    assert!(!engine.is_compiled(&func));
    assert_eq!(call_int(&engine, &func, &[VmValue::int(2), VmValue::int(2)]), 4);
    assert!(engine.is_compiled(&func));
}

// ============================================================================
// Rejected functions
// ============================================================================

#[test]
fn test_malformed_functions_are_not_cached() {
    let engine = JitEngine::new();

    let mut asm = Assembler::new("bad_register");
    asm.registers(1, 0, 0, 0);
    asm.op(Opcode::AddRR, 0, 0, 5);
    asm.ret_nil();
    let func = asm.finish().unwrap();
    let err = engine.compile(&func).unwrap_err();
    assert!(matches!(err, JitError::Verify(VerifyError::RegisterOutOfRange { pc: 0, index: 5, .. })));
    assert!(func.profile().is_jit_failed());

    let mut asm = Assembler::new("bad_opcode");
    asm.registers(1, 0, 0, 0);
    asm.op(Opcode::Nop, 0, 0, 0);
    asm.raw(Instr { op: 0xFE, a: 0, b: 0, c: 0 });
    let func = asm.finish().unwrap();
    assert!(matches!(engine.compile(&func), Err(JitError::UnknownOpcode { pc: 1, op: 0xFE })));

    let mut asm = Assembler::new("param_overflow");
    asm.registers(1, 0, 0, 0).max_param(1);
    asm.param_imm(1);
    asm.param_imm(2);
    asm.ret_nil();
    let func = asm.finish().unwrap();
    assert!(matches!(
        engine.compile(&func),
        Err(JitError::Verify(VerifyError::ParamOverflow { pc: 1, max: 1 }))
    ));

    let mut asm = Assembler::new("bad_flop");
    asm.registers(0, 1, 0, 0);
    asm.op(Opcode::Flop, 0, 0, FLOP_COUNT);
    let func = asm.finish().unwrap();
    assert!(matches!(engine.compile(&func), Err(JitError::Verify(VerifyError::InvalidOperand { pc: 0, .. }))));

    assert_eq!(engine.cache().entry_count(), 0);
}

#[test]
fn test_disabled_engine_never_compiles() {
    let engine = JitEngine::with_config(JitConfig { enabled: false, call_threshold: 1, ..Default::default() });
    let func = sum_function();
    for _ in 0..5 {
        assert_eq!(call_int(&engine, &func, &[VmValue::int(3)]), 6);
    }
    assert!(!engine.is_compiled(&func));
    assert!(engine.runtime().is_none());
    assert!(matches!(engine.compile(&func), Err(JitError::Disabled)));
}

// ============================================================================
// Listings
// ============================================================================

#[test]
fn test_listing_capture() {
    let engine = JitEngine::with_config(JitConfig { capture_listing: true, ..Default::default() });
    let func = sum_function();
    let code = engine.compile(&func).unwrap();
    let listing = code.listing().expect("listing captured");
    assert_eq!(listing.len(), func.code().len());
    assert!(listing[0].contains("TEST"));
    assert!(listing.iter().any(|line| line.contains("ADD_RR")));

    let plain = JitEngine::new();
    let other = add_function();
    assert!(plain.compile(&other).unwrap().listing().is_none());
}

// ============================================================================
// Objects
// ============================================================================

#[test]
fn test_objects_outlive_the_call_until_reset() {
    let mut asm = Assembler::new("make");
    asm.registers(1, 0, 0, 1);
    let size = asm.konst_int(32);
    let off = asm.konst_int(8) as u8;
    asm.op_bc(Opcode::NewK, 0, size);
    asm.op(Opcode::Sw, 0, 0, off);
    asm.ret_reg(0, RegClass::Pointer, 0, true);
    let func = asm.finish().unwrap();

    let engine = JitEngine::with_config(JitConfig { call_threshold: 2, ..Default::default() });
    let before = heap::allocated_bytes();
    let mut objects = Vec::new();
    for i in 0..4 {
        let mut rets = ReturnBuffer::new(&[RegClass::Pointer]);
        assert_eq!(engine.call(&func, &[VmValue::int(i)], &mut rets).unwrap(), 1);
        objects.push(rets.pointer(0).unwrap());
    }
    assert!(engine.is_compiled(&func));

    // interpreted and compiled calls alike leave their objects to the arena
    assert_eq!(heap::allocated_bytes(), before + 4 * 32);
    for (i, object) in objects.iter().enumerate() {
        let word = unsafe { object.add(8).cast::<i32>().read() };
        assert_eq!(word, i as i32);
    }

    unsafe { heap::reset() };
    assert_eq!(heap::allocated_bytes(), 0);
}
