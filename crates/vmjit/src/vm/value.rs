//! Tagged call arguments and typed return slots
//!
//! Both types are `#[repr(C)]` because generated code reads and writes them
//! directly; the offsets are mirrored in `jit::backend::abi`.

use std::fmt;

use crate::bytecode::opcode::{REGT_FLOAT, REGT_INT, REGT_POINTER, REGT_STRING};
use crate::bytecode::RegClass;
use crate::vm::exception::VmError;

/// One call argument: an 8-byte payload and a register-type tag.
#[repr(C, align(16))]
#[derive(Clone, Copy, PartialEq)]
pub struct VmValue {
    pub bits: u64,
    pub tag: u8,
}

impl VmValue {
    pub fn int(value: i32) -> Self {
        VmValue { bits: value as i64 as u64, tag: REGT_INT }
    }

    pub fn float(value: f64) -> Self {
        VmValue { bits: value.to_bits(), tag: REGT_FLOAT }
    }

    pub fn pointer(ptr: *mut u8) -> Self {
        VmValue { bits: ptr as u64, tag: REGT_POINTER }
    }

    pub fn null() -> Self {
        Self::pointer(std::ptr::null_mut())
    }

    /// Borrow a string as an argument. The string must outlive the call.
    pub fn string(value: &String) -> Self {
        VmValue { bits: value as *const String as u64, tag: REGT_STRING }
    }

    pub fn class(&self) -> RegClass {
        RegClass::from_regtype(self.tag)
    }

    pub fn as_int(&self) -> i32 {
        self.bits as i32
    }

    pub fn as_float(&self) -> f64 {
        f64::from_bits(self.bits)
    }

    pub fn as_pointer(&self) -> *mut u8 {
        self.bits as *mut u8
    }

    /// # Safety
    /// The value must have been created by [`VmValue::string`] from a live string.
    pub unsafe fn as_string(&self) -> &String {
        &*(self.bits as *const String)
    }
}

impl fmt::Debug for VmValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.class() {
            RegClass::Int => write!(f, "Int({})", self.as_int()),
            RegClass::Float => write!(f, "Float({})", self.as_float()),
            RegClass::String => write!(f, "String({:#x})", self.bits),
            RegClass::Pointer => write!(f, "Pointer({:#x})", self.bits),
        }
    }
}

/// Destination of one return value.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct VmReturn {
    /// Points at an `i32`, `f64`, `*mut u8` or `String` according to `reg_type`.
    pub location: *mut u8,
    pub reg_type: u8,
}

impl VmReturn {
    pub fn new(location: *mut u8, class: RegClass) -> Self {
        VmReturn { location, reg_type: class.regtype() }
    }

    pub fn class(&self) -> RegClass {
        RegClass::from_regtype(self.reg_type)
    }

    /// # Safety
    /// `location` must be valid for the slot's class.
    pub unsafe fn set_int(&self, value: i32) {
        *(self.location as *mut i32) = value;
    }

    /// # Safety
    /// `location` must be valid for the slot's class.
    pub unsafe fn set_float(&self, value: f64) {
        *(self.location as *mut f64) = value;
    }

    /// # Safety
    /// `location` must be valid for the slot's class.
    pub unsafe fn set_pointer(&self, value: *mut u8) {
        *(self.location as *mut *mut u8) = value;
    }

    /// # Safety
    /// `location` must point at an initialized `String`.
    pub unsafe fn set_string(&self, value: &str) {
        let dst = &mut *(self.location as *mut String);
        dst.clear();
        dst.push_str(value);
    }
}

/// Safe view of a caller's return slots handed to native functions.
pub struct ReturnSlots<'a> {
    slots: &'a mut [VmReturn],
}

impl<'a> ReturnSlots<'a> {
    pub(crate) fn new(slots: &'a mut [VmReturn]) -> Self {
        ReturnSlots { slots }
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    fn slot(&self, index: usize, class: RegClass) -> Result<Option<&VmReturn>, VmError> {
        match self.slots.get(index) {
            None => Ok(None),
            Some(slot) if slot.class() == class => Ok(Some(slot)),
            Some(slot) => Err(VmError::Native(format!(
                "return slot {index} expects {} but got {}",
                slot.class(),
                class
            ))),
        }
    }

    /// Write an integer result. Slots beyond the caller's capacity are ignored.
    pub fn set_int(&mut self, index: usize, value: i32) -> Result<(), VmError> {
        if let Some(slot) = self.slot(index, RegClass::Int)? {
            unsafe { slot.set_int(value) };
        }
        Ok(())
    }

    pub fn set_float(&mut self, index: usize, value: f64) -> Result<(), VmError> {
        if let Some(slot) = self.slot(index, RegClass::Float)? {
            unsafe { slot.set_float(value) };
        }
        Ok(())
    }

    pub fn set_pointer(&mut self, index: usize, value: *mut u8) -> Result<(), VmError> {
        if let Some(slot) = self.slot(index, RegClass::Pointer)? {
            unsafe { slot.set_pointer(value) };
        }
        Ok(())
    }

    pub fn set_string(&mut self, index: usize, value: &str) -> Result<(), VmError> {
        if let Some(slot) = self.slot(index, RegClass::String)? {
            unsafe { slot.set_string(value) };
        }
        Ok(())
    }
}

/// A decoded return value.
#[derive(Debug, Clone, PartialEq)]
pub enum ReturnValue {
    Int(i32),
    Float(f64),
    String(String),
    Pointer(*mut u8),
}

/// Owned storage for a caller's return slots.
///
/// Slots point into heap buffers owned by the buffer, so moving the buffer
/// keeps them valid.
pub struct ReturnBuffer {
    cells: Box<[u64]>,
    strings: Box<[String]>,
    slots: Vec<VmReturn>,
}

impl ReturnBuffer {
    pub fn new(classes: &[RegClass]) -> Self {
        let mut cells = vec![0u64; classes.len()].into_boxed_slice();
        let mut strings = vec![String::new(); classes.len()].into_boxed_slice();
        let slots = classes
            .iter()
            .enumerate()
            .map(|(i, class)| {
                let location = match class {
                    RegClass::String => &mut strings[i] as *mut String as *mut u8,
                    _ => &mut cells[i] as *mut u64 as *mut u8,
                };
                VmReturn::new(location, *class)
            })
            .collect();
        ReturnBuffer { cells, strings, slots }
    }

    pub fn empty() -> Self {
        Self::new(&[])
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn slots_mut(&mut self) -> &mut [VmReturn] {
        &mut self.slots
    }

    pub fn get(&self, index: usize) -> Option<ReturnValue> {
        let slot = self.slots.get(index)?;
        let cell = &self.cells[index] as *const u64;
        // Safety: non-string slots point at `cells[index]`, written at the slot's width
        Some(unsafe {
            match slot.class() {
                RegClass::Int => ReturnValue::Int(*(cell as *const i32)),
                RegClass::Float => ReturnValue::Float(*(cell as *const f64)),
                RegClass::Pointer => ReturnValue::Pointer(*(cell as *const *mut u8)),
                RegClass::String => ReturnValue::String(self.strings[index].clone()),
            }
        })
    }

    pub fn int(&self, index: usize) -> Option<i32> {
        match self.get(index)? {
            ReturnValue::Int(v) => Some(v),
            _ => None,
        }
    }

    pub fn float(&self, index: usize) -> Option<f64> {
        match self.get(index)? {
            ReturnValue::Float(v) => Some(v),
            _ => None,
        }
    }

    pub fn pointer(&self, index: usize) -> Option<*mut u8> {
        match self.get(index)? {
            ReturnValue::Pointer(v) => Some(v),
            _ => None,
        }
    }

    pub fn string(&self, index: usize) -> Option<&str> {
        match self.slots.get(index)?.class() {
            RegClass::String => Some(&self.strings[index]),
            _ => None,
        }
    }
}
