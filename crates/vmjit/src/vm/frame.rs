//! Interpreter-compatible stack frames
//!
//! A frame is one heap block: a `#[repr(C)]` header followed by the parameter
//! area and the float, string, pointer and integer register files. The same
//! [`FrameLayout`] is used by the interpreter and by generated code.

use std::alloc::{alloc_zeroed, dealloc, handle_alloc_error, Layout};
use std::cell::Cell;
use std::ptr;

use crate::bytecode::{RegClass, RegisterCounts, ScriptFunction};
use crate::vm::exception::VmError;
use crate::vm::value::VmValue;

/// Alignment of frames and of the parameter area.
pub const FRAME_ALIGN: usize = 16;

/// Maximum nesting of script frames per thread.
pub const MAX_FRAME_DEPTH: usize = 256;

const fn align_up(value: usize, align: usize) -> usize {
    (value + align - 1) & !(align - 1)
}

/// Frame header.
#[repr(C)]
#[derive(Debug)]
pub struct Frame {
    pub parent: *mut Frame,
    pub func: *const ScriptFunction,
    pub num_regs_d: u16,
    pub num_regs_f: u16,
    pub num_regs_s: u16,
    pub num_regs_a: u16,
    pub max_param: u16,
    /// Parameters pushed for the next call (interpreter only).
    pub num_param: u16,
    pub size: u32,
}

impl Frame {
    fn counts(&self) -> RegisterCounts {
        RegisterCounts::new(self.num_regs_d, self.num_regs_f, self.num_regs_s, self.num_regs_a)
    }
}

/// Byte offsets of each frame region, relative to the frame start.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameLayout {
    pub params: usize,
    pub float_regs: usize,
    pub string_regs: usize,
    pub pointer_regs: usize,
    pub int_regs: usize,
    pub size: usize,
}

impl FrameLayout {
    pub const HEADER_SIZE: usize = std::mem::size_of::<Frame>();

    pub fn of(func: &ScriptFunction) -> Self {
        Self::compute(func.regs(), func.max_param())
    }

    pub fn compute(regs: RegisterCounts, max_param: usize) -> Self {
        let params = align_up(Self::HEADER_SIZE, FRAME_ALIGN);
        let float_regs = params + max_param * std::mem::size_of::<VmValue>();
        let string_regs = float_regs + regs.float as usize * std::mem::size_of::<f64>();
        let pointer_regs = string_regs + regs.string as usize * std::mem::size_of::<String>();
        let int_regs = pointer_regs + regs.pointer as usize * std::mem::size_of::<*mut u8>();
        let size = align_up(int_regs + regs.int as usize * std::mem::size_of::<i32>(), FRAME_ALIGN);
        FrameLayout { params, float_regs, string_regs, pointer_regs, int_regs, size }
    }

    /// Offset of register `index` of `class`.
    pub fn register(&self, class: RegClass, index: usize) -> usize {
        match class {
            RegClass::Int => self.int_regs + index * std::mem::size_of::<i32>(),
            RegClass::Float => self.float_regs + index * std::mem::size_of::<f64>(),
            RegClass::String => self.string_regs + index * std::mem::size_of::<String>(),
            RegClass::Pointer => self.pointer_regs + index * std::mem::size_of::<*mut u8>(),
        }
    }

    fn alloc_layout(&self) -> Result<Layout, VmError> {
        Layout::from_size_align(self.size, FRAME_ALIGN)
            .map_err(|e| VmError::Malformed(format!("frame layout: {e}")))
    }
}

/// Mutable views of one live frame's regions.
pub struct Registers<'f> {
    pub params: &'f mut [VmValue],
    pub d: &'f mut [i32],
    pub f: &'f mut [f64],
    pub s: &'f mut [String],
    pub a: &'f mut [*mut u8],
}

impl<'f> Registers<'f> {
    /// # Safety
    /// `frame` must be a live frame built with `layout`, and no other
    /// references into its register area may be used while the view exists.
    pub unsafe fn of(frame: *mut Frame, layout: &FrameLayout) -> Registers<'f> {
        use std::slice::from_raw_parts_mut;

        let header = &*frame;
        let base = frame as *mut u8;
        Registers {
            params: from_raw_parts_mut(base.add(layout.params) as *mut VmValue, header.max_param as usize),
            d: from_raw_parts_mut(base.add(layout.int_regs) as *mut i32, header.num_regs_d as usize),
            f: from_raw_parts_mut(base.add(layout.float_regs) as *mut f64, header.num_regs_f as usize),
            s: from_raw_parts_mut(base.add(layout.string_regs) as *mut String, header.num_regs_s as usize),
            a: from_raw_parts_mut(base.add(layout.pointer_regs) as *mut *mut u8, header.num_regs_a as usize),
        }
    }
}

/// Per-thread chain of script frames.
///
/// `last_frame` must stay the first field: generated code reads it at offset 0.
#[repr(C)]
pub struct FrameStack {
    last_frame: Cell<*mut Frame>,
    depth: Cell<usize>,
}

/// Offset of `FrameStack::last_frame`, read by generated code.
pub const LAST_FRAME_OFFSET: usize = std::mem::offset_of!(FrameStack, last_frame);

thread_local! {
    static FRAME_STACK: FrameStack = const { FrameStack::new() };
}

impl FrameStack {
    const fn new() -> Self {
        FrameStack {
            last_frame: Cell::new(ptr::null_mut()),
            depth: Cell::new(0),
        }
    }

    /// The calling thread's frame stack.
    pub fn current() -> *const FrameStack {
        FRAME_STACK.with(|stack| stack as *const FrameStack)
    }

    pub fn with<R>(f: impl FnOnce(&FrameStack) -> R) -> R {
        FRAME_STACK.with(f)
    }

    pub fn depth(&self) -> usize {
        self.depth.get()
    }

    pub fn last_frame(&self) -> *mut Frame {
        self.last_frame.get()
    }

    /// Allocate a frame for `func` and distribute `args` into its registers.
    pub fn push(&self, func: &ScriptFunction, args: &[VmValue]) -> Result<*mut Frame, VmError> {
        let depth = self.depth.get();
        if depth >= MAX_FRAME_DEPTH {
            return Err(VmError::StackOverflow { depth });
        }

        let layout = FrameLayout::of(func);
        let mem = layout.alloc_layout()?;
        let regs = func.regs();

        let raw = unsafe { alloc_zeroed(mem) };
        if raw.is_null() {
            handle_alloc_error(mem);
        }
        let frame = raw as *mut Frame;
        unsafe {
            frame.write(Frame {
                parent: self.last_frame.get(),
                func,
                num_regs_d: regs.int,
                num_regs_f: regs.float,
                num_regs_s: regs.string,
                num_regs_a: regs.pointer,
                max_param: func.max_param() as u16,
                num_param: 0,
                size: layout.size as u32,
            });
            let strings = raw.add(layout.string_regs) as *mut String;
            for i in 0..regs.string as usize {
                strings.add(i).write(String::new());
            }
        }
        self.last_frame.set(frame);
        self.depth.set(depth + 1);

        if let Err(e) = unsafe { fill_params(frame, &layout, args) } {
            self.pop()?;
            return Err(e);
        }
        Ok(frame)
    }

    /// Release the innermost frame.
    pub fn pop(&self) -> Result<(), VmError> {
        let frame = self.last_frame.get();
        if frame.is_null() {
            return Err(VmError::Malformed("pop of an empty frame stack".to_string()));
        }
        unsafe {
            let header = &*frame;
            let layout = FrameLayout::compute(header.counts(), header.max_param as usize);
            let strings = (frame as *mut u8).add(layout.string_regs) as *mut String;
            for i in 0..header.num_regs_s as usize {
                ptr::drop_in_place(strings.add(i));
            }
            self.last_frame.set(header.parent);
            dealloc(frame as *mut u8, layout.alloc_layout()?);
        }
        self.depth.set(self.depth.get() - 1);
        Ok(())
    }
}

/// Copy call arguments into the first registers of each class, in order.
///
/// # Safety
/// `frame` must be a freshly pushed frame built with `layout`.
unsafe fn fill_params(frame: *mut Frame, layout: &FrameLayout, args: &[VmValue]) -> Result<(), VmError> {
    let mut regs = Registers::of(frame, layout);
    let (mut nd, mut nf, mut ns, mut na) = (0, 0, 0, 0);
    for (i, arg) in args.iter().enumerate() {
        let overflow = || VmError::Malformed(format!("argument {i} does not fit the {} registers", arg.class()));
        match arg.class() {
            RegClass::Int => {
                *regs.d.get_mut(nd).ok_or_else(overflow)? = arg.as_int();
                nd += 1;
            }
            RegClass::Float => {
                *regs.f.get_mut(nf).ok_or_else(overflow)? = arg.as_float();
                nf += 1;
            }
            RegClass::String => {
                regs.s.get_mut(ns).ok_or_else(overflow)?.clone_from(arg.as_string());
                ns += 1;
            }
            RegClass::Pointer => {
                *regs.a.get_mut(na).ok_or_else(overflow)? = arg.as_pointer();
                na += 1;
            }
        }
    }
    Ok(())
}

/// Current frame depth of the calling thread.
pub fn depth() -> usize {
    FrameStack::with(|stack| stack.depth())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::Assembler;

    fn func_with(d: u16, f: u16, s: u16, a: u16, max_param: u16) -> std::sync::Arc<ScriptFunction> {
        let mut asm = Assembler::new("frame");
        asm.registers(d, f, s, a).max_param(max_param);
        asm.ret_nil();
        asm.finish().unwrap()
    }

    #[test]
    fn test_layout_regions() {
        let layout = FrameLayout::compute(RegisterCounts::new(3, 2, 1, 2), 2);
        assert_eq!(FrameLayout::HEADER_SIZE, 32);
        assert_eq!(layout.params, 32);
        assert_eq!(layout.float_regs, 32 + 2 * 16);
        assert_eq!(layout.string_regs, layout.float_regs + 2 * 8);
        assert_eq!(layout.pointer_regs, layout.string_regs + std::mem::size_of::<String>());
        assert_eq!(layout.int_regs, layout.pointer_regs + 2 * 8);
        assert_eq!(layout.size % FRAME_ALIGN, 0);
        assert!(layout.size >= layout.int_regs + 3 * 4);
    }

    #[test]
    fn test_layout_is_deterministic() {
        let func = func_with(4, 3, 2, 1, 5);
        assert_eq!(FrameLayout::of(&func), FrameLayout::of(&func));
        assert_eq!(FrameLayout::of(&func), FrameLayout::compute(func.regs(), 5));
    }

    #[test]
    fn test_push_fills_params_by_class() {
        let func = func_with(2, 1, 1, 1, 0);
        let text = String::from("arg");
        let mut marker = 0u8;
        let args = [
            VmValue::int(7),
            VmValue::float(0.5),
            VmValue::int(-1),
            VmValue::string(&text),
            VmValue::pointer(&mut marker),
        ];

        FrameStack::with(|stack| {
            let before = stack.depth();
            let frame = stack.push(&func, &args).unwrap();
            let regs = unsafe { Registers::of(frame, &FrameLayout::of(&func)) };
            assert_eq!(regs.d.to_vec(), vec![7, -1]);
            assert_eq!(regs.f.to_vec(), vec![0.5]);
            assert_eq!(regs.s[0], "arg");
            assert_eq!(regs.a[0], &mut marker as *mut u8);
            assert_eq!(stack.depth(), before + 1);
            stack.pop().unwrap();
            assert_eq!(stack.depth(), before);
        });
    }

    #[test]
    fn test_argument_overflow_pops_frame() {
        let func = func_with(1, 0, 0, 0, 0);
        FrameStack::with(|stack| {
            let before = stack.depth();
            let err = stack.push(&func, &[VmValue::int(1), VmValue::int(2)]).unwrap_err();
            assert!(matches!(err, VmError::Malformed(_)));
            assert_eq!(stack.depth(), before);
        });
    }

    #[test]
    fn test_depth_limit() {
        let func = func_with(0, 0, 1, 0, 0);
        FrameStack::with(|stack| {
            let mut pushed = 0;
            let err = loop {
                match stack.push(&func, &[]) {
                    Ok(_) => pushed += 1,
                    Err(e) => break e,
                }
            };
            assert!(matches!(err, VmError::StackOverflow { depth: MAX_FRAME_DEPTH }));
            for _ in 0..pushed {
                stack.pop().unwrap();
            }
            assert_eq!(stack.depth(), 0);
        });
    }
}
