//! Reference bytecode interpreter
//!
//! Executes a [`ScriptFunction`] over the shared frame layout with the same
//! calling contract and abort semantics as compiled code. It is the fallback
//! for functions that are not (or cannot be) compiled, and the oracle the JIT
//! is tested against.

use std::ptr;

use crate::bytecode::opcode::*;
use crate::bytecode::{ConstantPool, RegClass, ScriptFunction};
use crate::vm::call;
use crate::vm::exception::{Abort, AbortReason, JitExceptionInfo, ScriptException, VmError};
use crate::vm::frame::{Frame, FrameLayout, FrameStack, Registers};
use crate::vm::function::VmFunction;
use crate::vm::heap;
use crate::vm::ops;
use crate::vm::value::{ReturnBuffer, VmReturn, VmValue};

enum Unwind {
    /// Abort raised by the instruction at the given index.
    Raise(Abort, usize),
    /// A callee already filled in the exception record.
    Propagate,
}

impl Unwind {
    fn at(pc: usize) -> impl Fn(AbortReason) -> Unwind {
        move |reason| Unwind::Raise(Abort::new(reason), pc)
    }
}

/// Interpret `func` with the native calling contract.
pub fn run(func: &ScriptFunction, args: &[VmValue], rets: &mut [VmReturn], exc: &mut JitExceptionInfo) -> i32 {
    if let Err(e) = func.verify() {
        exc.raise(Abort::error(VmError::Verify(e.clone())), ptr::null());
        return 0;
    }

    FrameStack::with(|stack| {
        let frame = match stack.push(func, args) {
            Ok(frame) => frame,
            Err(e) => {
                exc.raise(Abort::error(e), ptr::null());
                return 0;
            }
        };

        let layout = FrameLayout::of(func);
        let count = match unsafe { execute(func, frame, &layout, rets, exc) } {
            Ok(count) => count,
            Err(Unwind::Raise(abort, pc)) => {
                exc.raise(abort, &func.code()[pc]);
                0
            }
            Err(Unwind::Propagate) => 0,
        };

        if let Err(e) = stack.pop() {
            if !exc.is_raised() {
                exc.raise(Abort::error(e), ptr::null());
            }
            return 0;
        }
        count
    })
}

/// Interpret `func` and collect its results, ignoring any installed dispatcher
/// for the outermost call.
pub fn call(func: &ScriptFunction, args: &[VmValue], rets: &mut ReturnBuffer) -> Result<usize, ScriptException> {
    let mut exc = JitExceptionInfo::new();
    let count = run(func, args, rets.slots_mut(), &mut exc);
    match exc.take() {
        Some(exception) => Err(exception),
        None => Ok(count as usize),
    }
}

fn tagged_value(regs: &Registers<'_>, konst: &ConstantPool, flags: u8, index: usize) -> VmValue {
    if flags == REGT_NIL {
        return VmValue::null();
    }
    let from_konst = flags & REGT_KONST != 0;
    match (RegClass::from_regtype(flags), from_konst) {
        (RegClass::Int, false) => VmValue::int(regs.d[index]),
        (RegClass::Int, true) => VmValue::int(konst.ints[index]),
        (RegClass::Float, false) => VmValue::float(regs.f[index]),
        (RegClass::Float, true) => VmValue::float(konst.floats[index]),
        (RegClass::String, false) => VmValue::string(&regs.s[index]),
        (RegClass::String, true) => VmValue::string(&konst.strings[index]),
        (RegClass::Pointer, false) => VmValue::pointer(regs.a[index]),
        (RegClass::Pointer, true) => VmValue::pointer(konst.pointers[index] as *mut u8),
    }
}

/// Store `value` into a return slot of the same class.
///
/// # Safety
/// `slot` must be a valid return slot; string values must point at live strings.
unsafe fn write_return(slot: &VmReturn, value: VmValue) -> Result<(), AbortReason> {
    if slot.class() != value.class() {
        return Err(AbortReason::Other);
    }
    match value.class() {
        RegClass::Int => slot.set_int(value.as_int()),
        RegClass::Float => slot.set_float(value.as_float()),
        RegClass::Pointer => slot.set_pointer(value.as_pointer()),
        RegClass::String => slot.set_string(value.as_string()),
    }
    Ok(())
}

unsafe fn load(kind: MemKind, addr: *const u8, regs: &mut Registers<'_>, dst: usize) {
    match kind {
        MemKind::I8 => regs.d[dst] = ptr::read_unaligned(addr as *const i8) as i32,
        MemKind::U8 => regs.d[dst] = ptr::read_unaligned(addr) as i32,
        MemKind::I16 => regs.d[dst] = ptr::read_unaligned(addr as *const i16) as i32,
        MemKind::U16 => regs.d[dst] = ptr::read_unaligned(addr as *const u16) as i32,
        MemKind::I32 => regs.d[dst] = ptr::read_unaligned(addr as *const i32),
        MemKind::F32 => regs.f[dst] = ptr::read_unaligned(addr as *const f32) as f64,
        MemKind::F64 => regs.f[dst] = ptr::read_unaligned(addr as *const f64),
        MemKind::Ptr => regs.a[dst] = ptr::read_unaligned(addr as *const *mut u8),
    }
}

unsafe fn store(kind: MemKind, addr: *mut u8, regs: &Registers<'_>, src: usize) {
    match kind {
        MemKind::I8 | MemKind::U8 => ptr::write_unaligned(addr as *mut i8, regs.d[src] as i8),
        MemKind::I16 | MemKind::U16 => ptr::write_unaligned(addr as *mut i16, regs.d[src] as i16),
        MemKind::I32 => ptr::write_unaligned(addr as *mut i32, regs.d[src]),
        MemKind::F32 => ptr::write_unaligned(addr as *mut f32, regs.f[src] as f32),
        MemKind::F64 => ptr::write_unaligned(addr as *mut f64, regs.f[src]),
        MemKind::Ptr => ptr::write_unaligned(addr as *mut *mut u8, regs.a[src]),
    }
}

/// # Safety
/// `func` must be verified and `frame` must be its freshly pushed frame.
unsafe fn execute(
    func: &ScriptFunction,
    frame: *mut Frame,
    layout: &FrameLayout,
    rets: &mut [VmReturn],
    exc: &mut JitExceptionInfo,
) -> Result<i32, Unwind> {
    let mut regs = Registers::of(frame, layout);
    let code = func.code();
    let k = func.konst();
    let end = code.len();
    let mut num_param = 0usize;
    let mut pc = 0usize;

    while pc < end {
        let ins = code[pc];
        let (a, b, c) = (ins.a as usize, ins.b as usize, ins.c as usize);
        let raise = Unwind::at(pc);
        let mut next = pc + 1;
        let op = Opcode::from_u8(ins.op).ok_or_else(|| raise(AbortReason::Other))?;

        // Skip target of compare-and-skip instructions.
        let skip = (pc + 2).min(end);

        if let Some((bop, form)) = op.int_binop() {
            let (l, r) = match form {
                OperandForm::RR => (regs.d[b], regs.d[c]),
                OperandForm::RK => (regs.d[b], k.ints[c]),
                OperandForm::KR => (k.ints[b], regs.d[c]),
                OperandForm::RI => (regs.d[b], op.immediate(ins)),
            };
            regs.d[a] = ops::int_binop(bop, l, r).map_err(&raise)?;
        } else if let Some((bop, form)) = op.float_binop() {
            let (l, r) = match form {
                OperandForm::KR => (k.floats[b], regs.f[c]),
                OperandForm::RK => (regs.f[b], k.floats[c]),
                _ => (regs.f[b], regs.f[c]),
            };
            regs.f[a] = ops::float_binop(bop, l, r).map_err(&raise)?;
        } else if let Some((cmp, form)) = op.int_compare() {
            let (l, r) = match form {
                OperandForm::RK => (regs.d[b], k.ints[c]),
                OperandForm::KR => (k.ints[b], regs.d[c]),
                _ => (regs.d[b], regs.d[c]),
            };
            if ops::int_compare(cmp, l, r) != (ins.a & CMP_CHECK != 0) {
                next = skip;
            }
        } else if let Some((cmp, form)) = op.float_compare() {
            let (l, r) = match form {
                OperandForm::RK => (regs.f[b], k.floats[c]),
                OperandForm::KR => (k.floats[b], regs.f[c]),
                _ => (regs.f[b], regs.f[c]),
            };
            if ops::float_compare(cmp, ins.a & CMP_APPROX != 0, l, r) != (ins.a & CMP_CHECK != 0) {
                next = skip;
            }
        } else if let Some((kind, from_register)) = op.load() {
            let base = regs.a[b];
            if base.is_null() {
                return Err(raise(AbortReason::ReadNil));
            }
            let offset = if from_register { regs.d[c] } else { k.ints[c] };
            load(kind, base.wrapping_offset(offset as isize), &mut regs, a);
        } else if let Some((kind, from_register)) = op.store() {
            let base = regs.a[a];
            if base.is_null() {
                return Err(raise(AbortReason::WriteNil));
            }
            let offset = if from_register { regs.d[c] } else { k.ints[c] };
            store(kind, base.wrapping_offset(offset as isize), &regs, b);
        } else {
            match op {
                Opcode::Nop | Opcode::Result => {}
                Opcode::Jmp => {
                    next = (pc as i64 + 1 + ins.abc() as i64) as usize;
                    if next <= pc {
                        func.profile().record_loop();
                    }
                }
                Opcode::Test => {
                    if regs.d[a] != ins.bc() as i32 {
                        next = skip;
                    }
                }
                Opcode::TestN => {
                    if regs.d[a].wrapping_neg() != ins.bc() as i32 {
                        next = skip;
                    }
                }
                Opcode::Ret | Opcode::RetI => {
                    if op == Opcode::Ret && ins.b == REGT_NIL {
                        return Ok(0);
                    }
                    let retnum = (ins.a & !RET_FINAL) as usize;
                    if let Some(slot) = rets.get(retnum) {
                        let value = if op == Opcode::RetI {
                            VmValue::int(ins.bc_signed() as i32)
                        } else {
                            tagged_value(&regs, k, ins.b, c)
                        };
                        write_return(slot, value).map_err(&raise)?;
                    }
                    if ins.a & RET_FINAL != 0 {
                        return Ok((retnum + 1).min(rets.len()) as i32);
                    }
                }
                Opcode::Throw => {
                    let index = ins.bc() as usize;
                    let object = if a == 0 { regs.a[index] as usize } else { k.pointers[index] };
                    return Err(Unwind::Raise(Abort::error(VmError::Thrown { object }), pc));
                }
                Opcode::Bound | Opcode::BoundK | Opcode::BoundR => {
                    let limit = match op {
                        Opcode::Bound => ins.bc() as u32,
                        Opcode::BoundK => k.ints[ins.bc() as usize] as u32,
                        _ => regs.d[b] as u32,
                    };
                    let index = regs.d[a];
                    if index as u32 >= limit {
                        return Err(Unwind::Raise(Abort::with_arg(AbortReason::ArrayOutOfBounds, index), pc));
                    }
                }
                Opcode::Li => regs.d[a] = ins.bc_signed() as i32,
                Opcode::Lk => regs.d[a] = k.ints[ins.bc() as usize],
                Opcode::Lkf => regs.f[a] = k.floats[ins.bc() as usize],
                Opcode::Lks => regs.s[a].clone_from(&k.strings[ins.bc() as usize]),
                Opcode::Lkp => regs.a[a] = k.pointers[ins.bc() as usize] as *mut u8,
                Opcode::Mov => regs.d[a] = regs.d[b],
                Opcode::Movf => regs.f[a] = regs.f[b],
                Opcode::Movs => {
                    let value = regs.s[b].clone();
                    regs.s[a] = value;
                }
                Opcode::Mova => regs.a[a] = regs.a[b],
                Opcode::Cast => match ins.c {
                    CAST_I2F => regs.f[a] = regs.d[b] as f64,
                    CAST_U2F => regs.f[a] = regs.d[b] as u32 as f64,
                    CAST_F2I => regs.d[a] = ops::float_to_int(regs.f[b]),
                    CAST_F2U => regs.d[a] = ops::float_to_uint(regs.f[b]),
                    CAST_I2S => regs.s[a] = ops::int_to_string(regs.d[b]),
                    CAST_U2S => regs.s[a] = ops::uint_to_string(regs.d[b]),
                    CAST_F2S => regs.s[a] = ops::float_to_string(regs.f[b]),
                    CAST_S2I => regs.d[a] = ops::string_to_int(&regs.s[b]),
                    CAST_S2F => regs.f[a] = ops::string_to_float(&regs.s[b]),
                    _ => return Err(raise(AbortReason::Other)),
                },
                Opcode::Param | Opcode::ParamI => {
                    if num_param >= regs.params.len() {
                        let error = VmError::Malformed(format!("parameter area of {} overflowed", func.name()));
                        return Err(Unwind::Raise(Abort::error(error), pc));
                    }
                    let value = if op == Opcode::ParamI {
                        VmValue::int(ins.abc())
                    } else {
                        tagged_value(&regs, k, ins.a, ins.bc() as usize)
                    };
                    regs.params[num_param] = value;
                    num_param += 1;
                }
                Opcode::Call | Opcode::CallK => {
                    let callee = if op == Opcode::Call { regs.a[a] } else { k.pointers[a] as *mut u8 };
                    if callee.is_null() {
                        return Err(raise(AbortReason::ReadNil));
                    }
                    let callee = &*(callee as *const VmFunction);
                    let first = num_param.checked_sub(b).ok_or_else(|| raise(AbortReason::Other))?;

                    let mut returns = [VmReturn::new(ptr::null_mut(), RegClass::Int); MAX_RETURNS];
                    for (i, slot) in returns.iter_mut().enumerate().take(c) {
                        let result = code[pc + 1 + i];
                        let class = RegClass::from_regtype(result.b);
                        let index = result.c as usize;
                        let location = match class {
                            RegClass::Int => &mut regs.d[index] as *mut i32 as *mut u8,
                            RegClass::Float => &mut regs.f[index] as *mut f64 as *mut u8,
                            RegClass::String => &mut regs.s[index] as *mut String as *mut u8,
                            RegClass::Pointer => &mut regs.a[index] as *mut *mut u8 as *mut u8,
                        };
                        *slot = VmReturn::new(location, class);
                    }

                    call::invoke(callee, &regs.params[first..num_param], &mut returns[..c], exc);
                    num_param = first;
                    if exc.is_raised() {
                        exc.attribute_to(&code[pc]);
                        return Err(Unwind::Propagate);
                    }
                    next = pc + 1 + c;
                }
                Opcode::New | Opcode::NewK => {
                    let size = if op == Opcode::New { regs.d[b] } else { k.ints[ins.bc() as usize] };
                    match heap::alloc(size) {
                        Ok(object) => regs.a[a] = object,
                        Err(abort) => return Err(Unwind::Raise(abort, pc)),
                    }
                }
                Opcode::Concat => {
                    let joined = format!("{}{}", regs.s[b], regs.s[c]);
                    regs.s[a] = joined;
                }
                Opcode::Lens => regs.d[a] = regs.s[b].len() as i32,
                Opcode::Cmps => {
                    let l = if ins.a & CMP_BK != 0 { &k.strings[b] } else { &regs.s[b] };
                    let r = if ins.a & CMP_CK != 0 { &k.strings[c] } else { &regs.s[c] };
                    if ops::string_compare(ins.a, l, r) != (ins.a & CMP_CHECK != 0) {
                        next = skip;
                    }
                }
                Opcode::Abs => regs.d[a] = regs.d[b].wrapping_abs(),
                Opcode::Neg => regs.d[a] = regs.d[b].wrapping_neg(),
                Opcode::Not => regs.d[a] = !regs.d[b],
                Opcode::Sext => regs.d[a] = ops::sext(regs.d[b], ins.c),
                Opcode::Flop => regs.f[a] = ops::flop(ins.c, regs.f[b]),
                Opcode::AddaRR | Opcode::AddaRK => {
                    let offset = if op == Opcode::AddaRR { regs.d[c] } else { k.ints[c] };
                    let base = regs.a[b];
                    regs.a[a] = if base.is_null() { base } else { base.wrapping_offset(offset as isize) };
                }
                Opcode::Suba => regs.d[a] = (regs.a[b] as isize).wrapping_sub(regs.a[c] as isize) as i32,
                Opcode::EqaR | Opcode::EqaK => {
                    let r = if op == Opcode::EqaR { regs.a[c] as usize } else { k.pointers[c] };
                    if (regs.a[b] as usize == r) != (ins.a & CMP_CHECK != 0) {
                        next = skip;
                    }
                }
                _ => return Err(raise(AbortReason::Other)),
            }
        }

        (*frame).num_param = num_param as u16;
        pc = next;
    }
    Ok(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::Assembler;
    use crate::vm::frame;

    fn run_int(asm: Assembler, args: &[VmValue]) -> Result<i32, ScriptException> {
        let func = asm.finish().unwrap();
        let mut rets = ReturnBuffer::new(&[RegClass::Int]);
        call(&func, args, &mut rets)?;
        Ok(rets.int(0).unwrap())
    }

    #[test]
    fn test_add_with_aliased_destination() {
        let mut asm = Assembler::new("add");
        asm.registers(2, 0, 0, 0);
        asm.op(Opcode::AddRR, 0, 0, 1);
        asm.ret_reg(0, RegClass::Int, 0, true);
        assert_eq!(run_int(asm, &[VmValue::int(5), VmValue::int(3)]).unwrap(), 8);
    }

    #[test]
    fn test_loop_counts_backward_jumps() {
        // d0 = n, d1 = acc; while d0 > 0 { acc += d0; d0 -= 1 }
        let mut asm = Assembler::new("sum");
        asm.registers(2, 0, 0, 0);
        let top = asm.new_label();
        let done = asm.new_label();
        let zero = asm.konst_int(0);
        asm.bind(top);
        asm.op(Opcode::LeRK, CMP_CHECK, 0, zero as u8);
        asm.jmp(done);
        asm.op(Opcode::AddRR, 1, 1, 0);
        asm.op(Opcode::AddI, 0, 0, (-1i8) as u8);
        asm.jmp(top);
        asm.bind(done);
        asm.ret_reg(0, RegClass::Int, 1, true);

        let func = asm.finish().unwrap();
        let mut rets = ReturnBuffer::new(&[RegClass::Int]);
        call(&func, &[VmValue::int(10)], &mut rets).unwrap();
        assert_eq!(rets.int(0), Some(55));
        assert_eq!(func.profile().loops(), 10);
    }

    #[test]
    fn test_null_load_aborts_and_pops() {
        let mut asm = Assembler::new("load");
        asm.registers(1, 0, 0, 1);
        let off = asm.konst_int(8);
        asm.op(Opcode::Lw, 0, 0, off as u8);
        asm.ret_reg(0, RegClass::Int, 0, true);
        let func = asm.finish().unwrap();

        let before = frame::depth();
        let mut rets = ReturnBuffer::new(&[RegClass::Int]);
        let err = call(&func, &[VmValue::null()], &mut rets).unwrap_err();
        assert_eq!(err.reason, AbortReason::ReadNil);
        assert_eq!(err.instruction_index(&func), Some(0));
        assert_eq!(frame::depth(), before);
    }

    #[test]
    fn test_strings_and_casts() {
        let mut asm = Assembler::new("strings");
        asm.registers(1, 0, 2, 0);
        let hello = asm.konst_string("n=");
        asm.op_bc(Opcode::Lks, 0, hello);
        asm.op(Opcode::Cast, 1, 0, CAST_I2S);
        asm.op(Opcode::Concat, 0, 0, 1);
        asm.ret_reg(0, RegClass::String, 0, true);
        let func = asm.finish().unwrap();

        let mut rets = ReturnBuffer::new(&[RegClass::String]);
        call(&func, &[VmValue::int(42)], &mut rets).unwrap();
        assert_eq!(rets.string(0), Some("n=42"));
    }

    #[test]
    fn test_unverified_function_is_refused() {
        let mut asm = Assembler::new("bad");
        asm.raw(Instr { op: 0xEE, a: 0, b: 0, c: 0 });
        let func = asm.finish().unwrap();
        let err = call(&func, &[], &mut ReturnBuffer::empty()).unwrap_err();
        assert!(matches!(err.payload, Some(VmError::Verify(_))));
    }
}
