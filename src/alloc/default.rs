//! The process-wide default allocator.
//!
//! Every free function here takes an `Option<&Allocator>`; `None` means "the
//! default". Tests swap in a diagnostic allocator with
//! [`DefaultAllocatorScope`] and get the previous one back when the scope
//! ends.

use std::{
    ptr::NonNull,
    sync::{PoisonError, RwLock},
};

use once_cell::sync::Lazy;
use parking_lot::ReentrantMutexGuard;

use crate::{
    alloc::contract::{AllocError, Allocator, DeferredRelease, FailureHandler},
    fatal::exclusive_scope,
};

static DEFAULT: Lazy<RwLock<Allocator>> = Lazy::new(|| RwLock::new(Allocator::stdlib()));

/// A clone of the current default
pub fn default_allocator() -> Allocator {
    DEFAULT
        .read()
        .unwrap_or_else(PoisonError::into_inner)
        .clone()
}

/// Replace the default, returning the previous one
pub fn set_default_allocator(allocator: Allocator) -> Allocator {
    let mut guard = DEFAULT.write().unwrap_or_else(PoisonError::into_inner);
    std::mem::replace(&mut *guard, allocator)
}

fn update_default(f: impl FnOnce(&mut Allocator)) {
    let mut guard = DEFAULT.write().unwrap_or_else(PoisonError::into_inner);
    f(&mut guard)
}

/// The default's failure handler, `None` restores the terminating one
pub fn set_failure_handler(handler: Option<FailureHandler>) {
    update_default(|a| a.set_failure_handler(handler))
}

pub fn set_deferred_release(context: usize, hook: Option<DeferredRelease>) {
    update_default(|a| a.set_deferred_release(context, hook))
}

/// Makes `allocator` the default until dropped. Scopes on other threads wait
/// for this one to end, so concurrently running tests take turns. Nested
/// scopes on the same thread restore in reverse order.
pub struct DefaultAllocatorScope {
    previous: Option<Allocator>,
    _exclusive: ReentrantMutexGuard<'static, ()>,
}

impl DefaultAllocatorScope {
    pub fn new(allocator: Allocator) -> Self {
        let exclusive = exclusive_scope();
        Self {
            previous: Some(set_default_allocator(allocator)),
            _exclusive: exclusive,
        }
    }
}

impl Drop for DefaultAllocatorScope {
    fn drop(&mut self) {
        if let Some(previous) = self.previous.take() {
            set_default_allocator(previous);
        }
    }
}

/// Run `f` with `allocator` as the default
pub fn with_default<R>(allocator: Allocator, f: impl FnOnce() -> R) -> R {
    let _scope = DefaultAllocatorScope::new(allocator);
    f()
}

fn resolve<R>(allocator: Option<&Allocator>, f: impl FnOnce(&Allocator) -> R) -> R {
    match allocator {
        Some(allocator) => f(allocator),
        None => f(&default_allocator()),
    }
}

pub fn malloc(allocator: Option<&Allocator>, size: usize) -> Result<NonNull<u8>, AllocError> {
    resolve(allocator, |a| a.malloc(size))
}

pub fn calloc(
    allocator: Option<&Allocator>,
    n: usize,
    size: usize,
) -> Result<NonNull<u8>, AllocError> {
    resolve(allocator, |a| a.calloc(n, size))
}

/// # Safety
///
/// See [`Allocator::realloc`]
pub unsafe fn realloc(
    allocator: Option<&Allocator>,
    block: *mut u8,
    size: usize,
) -> Result<NonNull<u8>, AllocError> {
    // SAFETY: forwarded from the caller
    resolve(allocator, |a| unsafe { a.realloc(block, size) })
}

/// # Safety
///
/// See [`Allocator::realloc_strict`]
pub unsafe fn realloc_strict(
    allocator: Option<&Allocator>,
    block: *mut u8,
    size: usize,
) -> Result<Option<NonNull<u8>>, AllocError> {
    // SAFETY: forwarded from the caller
    resolve(allocator, |a| unsafe { a.realloc_strict(block, size) })
}

/// # Safety
///
/// See [`Allocator::free`]
pub unsafe fn free(allocator: Option<&Allocator>, block: *mut u8) {
    // SAFETY: forwarded from the caller
    resolve(allocator, |a| unsafe { a.free(block) })
}

/// # Safety
///
/// See [`Allocator::deferred_free`]
pub unsafe fn deferred_free(allocator: Option<&Allocator>, block: *mut u8) -> i32 {
    // SAFETY: forwarded from the caller
    resolve(allocator, |a| unsafe { a.deferred_free(block) })
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    #[test]
    fn default_is_stdlib() {
        let _scope = DefaultAllocatorScope::new(Allocator::stdlib());
        assert!(default_allocator().is_stdlib());
        let block = malloc(None, 16).unwrap();
        unsafe { free(None, block.as_ptr()) };
    }

    fn same_backend(a: &Allocator, b: &Allocator) -> bool {
        Arc::as_ptr(a.backend()) as *const u8 == Arc::as_ptr(b.backend()) as *const u8
    }

    #[test]
    fn scope_restores_previous() {
        let outer = Allocator::stdlib();
        let _outer = DefaultAllocatorScope::new(outer.clone());
        with_default(Allocator::stdlib_nofree(), || {
            assert!(!default_allocator().is_stdlib());
            let block = calloc(None, 2, 8).unwrap();
            assert!(unsafe { realloc_strict(None, block.as_ptr(), 0) }
                .unwrap()
                .is_none());
        });
        assert!(same_backend(&default_allocator(), &outer));
    }

    #[test]
    fn scopes_nest_on_one_thread() {
        let outer = Allocator::stdlib();
        let middle = Allocator::stdlib_nofree();
        let _outer = DefaultAllocatorScope::new(outer.clone());
        {
            let _middle = DefaultAllocatorScope::new(middle.clone());
            with_default(Allocator::stdlib(), || {
                assert!(default_allocator().is_stdlib());
            });
            assert!(same_backend(&default_allocator(), &middle));
        }
        assert!(same_backend(&default_allocator(), &outer));
    }

    #[test]
    fn explicit_allocator_wins() {
        let _scope = DefaultAllocatorScope::new(Allocator::stdlib());
        let nofree = Allocator::stdlib_nofree();
        let block = malloc(Some(&nofree), 8).unwrap();
        let block = unsafe { realloc(Some(&nofree), block.as_ptr(), 64) }.unwrap();
        unsafe { free(Some(&Allocator::stdlib()), block.as_ptr()) };
    }

    fn hand_back(_: usize, release: &dyn Fn(*mut u8), block: *mut u8, _: &Allocator) -> i32 {
        release(block);
        1
    }

    #[test]
    fn default_level_setters() {
        let _scope = DefaultAllocatorScope::new(Allocator::stdlib());
        set_deferred_release(0x10, Some(hand_back));
        assert_eq!(default_allocator().context(), 0x10);
        let block = malloc(None, 8).unwrap();
        assert_eq!(unsafe { deferred_free(None, block.as_ptr()) }, 1);
        set_failure_handler(None);
    }
}
