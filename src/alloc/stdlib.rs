//! Backends that go straight to the C library heap

use std::ffi::c_void;

use crate::{
    alloc::contract::RawAllocator,
    fatal::{self, Violation},
};

/// `calloc()`, `realloc()` and `free()`
#[derive(Debug, Clone, Copy, Default)]
pub struct Stdlib;

// SAFETY: the C library upholds the contract for its own heap
unsafe impl RawAllocator for Stdlib {
    fn allocate(&self, n: usize, size: usize) -> *mut u8 {
        // SAFETY: `calloc()` has no preconditions, overflow of `n * size`
        //         yields null
        unsafe { libc::calloc(n, size) as *mut u8 }
    }

    unsafe fn reallocate(&self, block: *mut u8, size: usize) -> *mut u8 {
        // SAFETY: `block` is null or from this heap, per the caller
        unsafe { libc::realloc(block as *mut c_void, size) as *mut u8 }
    }

    unsafe fn release(&self, block: *mut u8) {
        // SAFETY: `block` is from this heap, per the caller
        unsafe { libc::free(block as *mut c_void) }
    }

    fn is_stdlib(&self) -> bool {
        true
    }

    fn name(&self) -> &'static str {
        "stdlib"
    }
}

/// [`Stdlib`], but `release` leaks. Handy when blocks are shared with code
/// that might still read them at exit.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoFreeStdlib;

// SAFETY: never releasing is always sound
unsafe impl RawAllocator for NoFreeStdlib {
    fn allocate(&self, n: usize, size: usize) -> *mut u8 {
        Stdlib.allocate(n, size)
    }

    unsafe fn reallocate(&self, block: *mut u8, size: usize) -> *mut u8 {
        // SAFETY: forwarded from the caller
        unsafe { Stdlib.reallocate(block, size) }
    }

    unsafe fn release(&self, _: *mut u8) {}

    fn name(&self) -> &'static str {
        "stdlib-nofree"
    }
}

/// What an allocator points at after
/// [`Allocator::invalidate`](super::contract::Allocator::invalidate): every
/// operation is a fatal violation
#[derive(Debug, Clone, Copy, Default)]
pub struct Invalidated;

#[cold]
fn invalidated(op: &'static str) -> ! {
    fatal::report(
        fatal::default_handler(),
        &Violation::InvalidatedAllocator(op),
        None,
    )
}

// SAFETY: nothing is ever handed out
unsafe impl RawAllocator for Invalidated {
    fn allocate(&self, _: usize, _: usize) -> *mut u8 {
        invalidated("allocate")
    }

    unsafe fn reallocate(&self, _: *mut u8, _: usize) -> *mut u8 {
        invalidated("reallocate")
    }

    unsafe fn release(&self, _: *mut u8) {
        invalidated("release")
    }

    fn name(&self) -> &'static str {
        "invalidated"
    }
}
