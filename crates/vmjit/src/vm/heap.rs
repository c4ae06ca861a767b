//! Thread-local object arena backing NEW
//!
//! Objects are zeroed, 16-byte aligned and live until the arena is reset or
//! the thread exits.

use std::alloc::{alloc_zeroed, dealloc, handle_alloc_error, Layout};
use std::cell::RefCell;

use crate::vm::exception::{Abort, AbortReason};

/// Largest single allocation, in bytes.
pub const MAX_ALLOC_SIZE: i32 = 16 * 1024 * 1024;

const OBJECT_ALIGN: usize = 16;

struct Block {
    ptr: *mut u8,
    layout: Layout,
}

#[derive(Default)]
struct Arena {
    blocks: Vec<Block>,
    bytes: usize,
}

impl Drop for Arena {
    fn drop(&mut self) {
        for block in self.blocks.drain(..) {
            unsafe { dealloc(block.ptr, block.layout) };
        }
    }
}

thread_local! {
    static ARENA: RefCell<Arena> = RefCell::new(Arena::default());
}

/// Allocate a zeroed object of `size` bytes.
pub fn alloc(size: i32) -> Result<*mut u8, Abort> {
    if !(0..=MAX_ALLOC_SIZE).contains(&size) {
        return Err(Abort::with_arg(AbortReason::ArrayTooLarge, size));
    }
    let layout = Layout::from_size_align((size as usize).max(1), OBJECT_ALIGN)
        .map_err(|_| Abort::with_arg(AbortReason::ArrayTooLarge, size))?;
    let ptr = unsafe { alloc_zeroed(layout) };
    if ptr.is_null() {
        handle_alloc_error(layout);
    }
    ARENA.with(|arena| {
        let mut arena = arena.borrow_mut();
        arena.bytes += layout.size();
        arena.blocks.push(Block { ptr, layout });
    });
    Ok(ptr)
}

/// Bytes currently held by this thread's arena.
pub fn allocated_bytes() -> usize {
    ARENA.with(|arena| arena.borrow().bytes)
}

/// Free every object allocated on this thread.
///
/// # Safety
/// No pointer previously returned by [`alloc`] on this thread may be used
/// afterwards.
pub unsafe fn reset() {
    ARENA.with(|arena| {
        let mut arena = arena.borrow_mut();
        for block in arena.blocks.drain(..) {
            dealloc(block.ptr, block.layout);
        }
        arena.bytes = 0;
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alloc_is_zeroed_and_aligned() {
        let ptr = alloc(24).unwrap();
        assert_eq!(ptr as usize % OBJECT_ALIGN, 0);
        let bytes = unsafe { std::slice::from_raw_parts(ptr, 24) };
        assert!(bytes.iter().all(|b| *b == 0));
        assert!(allocated_bytes() >= 24);
    }

    #[test]
    fn test_size_limits() {
        let err = alloc(-1).unwrap_err();
        assert_eq!(err.reason, AbortReason::ArrayTooLarge);
        assert_eq!(err.arg, -1);

        let err = alloc(MAX_ALLOC_SIZE + 1).unwrap_err();
        assert_eq!(err.arg, MAX_ALLOC_SIZE + 1);

        assert!(alloc(0).is_ok());
    }

    #[test]
    fn test_reset() {
        alloc(64).unwrap();
        unsafe { reset() };
        assert_eq!(allocated_bytes(), 0);
    }
}
