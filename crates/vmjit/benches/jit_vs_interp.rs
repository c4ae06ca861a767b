use std::sync::Arc;

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use vmjit::bytecode::opcode::*;
use vmjit::bytecode::{Assembler, RegClass, ScriptFunction};
use vmjit::jit::{compile_function, JitRuntime, OptLevel};
use vmjit::vm::{interpreter, ReturnBuffer, VmValue};

/// sum(n) = n + (n - 1) + ... + 1
fn sum_loop() -> Arc<ScriptFunction> {
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

/// poly(x) = ((x * 0.5 + 1.25) * x - 3.0) * x, iterated
fn float_poly() -> Arc<ScriptFunction> {
    let mut asm = Assembler::new("poly");
    asm.registers(1, 2, 0, 0);
    let half = asm.konst_float(0.5) as u8;
    let quarter = asm.konst_float(1.25) as u8;
    let three = asm.konst_float(3.0) as u8;
    let top = asm.new_label();
    let done = asm.new_label();
    asm.bind(top);
    asm.op(Opcode::Test, 0, 0, 0);
    asm.jmp(done);
    asm.op(Opcode::MulfRK, 1, 0, half);
    asm.op(Opcode::AddfRK, 1, 1, quarter);
    asm.op(Opcode::MulfRR, 1, 1, 0);
    asm.op(Opcode::SubfRK, 1, 1, three);
    asm.op(Opcode::MulfRR, 1, 1, 0);
    asm.op(Opcode::Flop, 0, 1, FLOP_SIN);
    asm.op(Opcode::AddI, 0, 0, (-1i8) as u8);
    asm.jmp(top);
    asm.bind(done);
    asm.ret_reg(0, RegClass::Float, 0, true);
    asm.finish().unwrap()
}

fn bench_sum_loop(c: &mut Criterion) {
    let func = sum_loop();
    let runtime = JitRuntime::acquire(OptLevel::Speed).unwrap();
    let code = compile_function(&runtime, &func, false).unwrap();
    let mut group = c.benchmark_group("sum_loop");

    for n in [100, 10_000] {
        group.bench_with_input(BenchmarkId::new("interpreter", n), &n, |b, &n| {
            let mut rets = ReturnBuffer::new(&[RegClass::Int]);
            b.iter(|| interpreter::call(&func, &[VmValue::int(black_box(n))], &mut rets).unwrap());
        });
        group.bench_with_input(BenchmarkId::new("jit", n), &n, |b, &n| {
            let mut rets = ReturnBuffer::new(&[RegClass::Int]);
            b.iter(|| code.call(&[VmValue::int(black_box(n))], &mut rets).unwrap());
        });
    }

    group.finish();
}

fn bench_float_poly(c: &mut Criterion) {
    let func = float_poly();
    let runtime = JitRuntime::acquire(OptLevel::Speed).unwrap();
    let code = compile_function(&runtime, &func, false).unwrap();
    let args = [VmValue::int(1000), VmValue::float(0.75)];
    let mut group = c.benchmark_group("float_poly");

    group.bench_function("interpreter", |b| {
        let mut rets = ReturnBuffer::new(&[RegClass::Float]);
        b.iter(|| interpreter::call(&func, black_box(&args), &mut rets).unwrap());
    });
    group.bench_function("jit", |b| {
        let mut rets = ReturnBuffer::new(&[RegClass::Float]);
        b.iter(|| code.call(black_box(&args), &mut rets).unwrap());
    });

    group.finish();
}

fn bench_compile(c: &mut Criterion) {
    let func = float_poly();
    let runtime = JitRuntime::acquire(OptLevel::Speed).unwrap();
    c.bench_function("compile_float_poly", |b| {
        b.iter(|| compile_function(&runtime, black_box(&func), false).unwrap());
    });
}

criterion_group!(benches, bench_sum_loop, bench_float_poly, bench_compile);
criterion_main!(benches);
