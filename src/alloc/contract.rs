//! The allocator contract: what every allocation client programs against,
//! regardless of whether the system heap, an arena or the
//! [`DiagnosticAllocator`](super::diagnostic::DiagnosticAllocator) is behind
//! it.
//!
//! A backend only has to provide the three raw operations of
//! [`RawAllocator`]. [`Allocator`] adds the vectoring on top of that: zero size
//! requests, the lenient and strict flavours of `realloc`, the failure handler
//! and the optional deferred-release hook.

use std::{
    fmt, io, process,
    ptr::{self, NonNull},
    sync::Arc,
};

use thiserror::Error;

use crate::{
    alloc::stdlib::{Invalidated, NoFreeStdlib, Stdlib},
    fatal::{self, Violation},
    util::hint::cold,
};

/// A request was refused, either by the backend or by failure injection.
/// Always recoverable.
#[derive(Debug, Error)]
#[error("memory allocation of {size} bytes failed")]
pub struct AllocError {
    size: usize,
    #[source]
    source: io::Error,
}

impl AllocError {
    pub fn new(size: usize) -> Self {
        Self {
            size,
            source: io::Error::from_raw_os_error(libc::ENOMEM),
        }
    }

    /// Bytes that were asked for
    pub fn size(&self) -> usize {
        self.size
    }
}

/// The raw operations a backend provides. Null is the only failure signal at
/// this level.
///
/// # Safety
///
/// - A non-null block returned by `allocate` or `reallocate` must be valid for
///   reads and writes of the requested number of bytes, and must not overlap
///   any other block that is still live.
/// - `allocate` must return zeroed memory.
/// - `reallocate` and `release` must accept any block previously returned by
///   the same backend and not released since.
pub unsafe trait RawAllocator: Send + Sync {
    /// `n` zeroed elements of `size` bytes each
    fn allocate(&self, n: usize, size: usize) -> *mut u8;

    /// Resize `block`, moving it if needed. A null `block` is a fresh
    /// allocation.
    ///
    /// # Safety
    ///
    /// `block` must be null or live in this backend.
    unsafe fn reallocate(&self, block: *mut u8, size: usize) -> *mut u8;

    /// # Safety
    ///
    /// `block` must be live in this backend. It is dangling afterwards.
    unsafe fn release(&self, block: *mut u8);

    /// Does this go straight to the C library heap?
    fn is_stdlib(&self) -> bool {
        false
    }

    fn name(&self) -> &'static str;
}

/// Called when a request is refused. `block` is the block that was being
/// reallocated, or null. If this returns, the refusal surfaces to the caller
/// as an [`AllocError`].
pub type FailureHandler = fn(allocator: &Allocator, block: *mut u8, size: usize);

/// Release indirection for reclamation schemes that must delay the real
/// release (hazard pointers, ABA-safe lists). Gets the hook's own context, the
/// real release operation, the block and the allocator that owns it.
pub type DeferredRelease =
    fn(context: usize, release: &dyn Fn(*mut u8), block: *mut u8, owner: &Allocator) -> i32;

/// Default [`FailureHandler`]: say why and terminate
#[cold]
pub fn allocation_fail(allocator: &Allocator, block: *mut u8, size: usize) {
    let reason = io::Error::last_os_error();
    log::error!("{allocator:?}: failed to allocate {size} bytes ({block:p}): {reason}");
    eprintln!("{allocator:?}: failed to allocate {size} bytes ({block:p}): {reason}");
    process::abort()
}

fn invalidated_fail(_: &Allocator, _: *mut u8, _: usize) {
    fatal::report(
        fatal::default_handler(),
        &Violation::InvalidatedAllocator("fail"),
        None,
    )
}

fn invalidated_deferred_release(
    _: usize,
    _: &dyn Fn(*mut u8),
    _: *mut u8,
    _: &Allocator,
) -> i32 {
    fatal::report(
        fatal::default_handler(),
        &Violation::InvalidatedAllocator("deferred_free"),
        None,
    )
}

/// A backend plus the handlers that decide what a refusal means. Cheap to
/// clone; clones share the backend.
#[derive(Clone)]
pub struct Allocator {
    backend: Arc<dyn RawAllocator>,
    fail: FailureHandler,
    deferred_release: Option<DeferredRelease>,
    context: usize,
}

impl Allocator {
    pub fn new<A>(backend: A) -> Self
    where
        A: RawAllocator + 'static,
    {
        Self::from_shared(Arc::new(backend))
    }

    /// Use a backend that is also held elsewhere, e.g. a diagnostic allocator
    /// that a test wants to inspect afterwards
    pub fn from_shared(backend: Arc<dyn RawAllocator>) -> Self {
        Self {
            backend,
            fail: allocation_fail,
            deferred_release: None,
            context: 0,
        }
    }

    /// The C library heap
    pub fn stdlib() -> Self {
        Self::new(Stdlib)
    }

    /// The C library heap, except that nothing is ever released
    pub fn stdlib_nofree() -> Self {
        Self::new(NoFreeStdlib)
    }

    pub fn backend(&self) -> &Arc<dyn RawAllocator> {
        &self.backend
    }

    /// `None` restores [`allocation_fail`]
    pub fn set_failure_handler(&mut self, handler: Option<FailureHandler>) {
        self.fail = handler.unwrap_or(allocation_fail);
    }

    pub fn with_failure_handler(mut self, handler: FailureHandler) -> Self {
        self.set_failure_handler(Some(handler));
        self
    }

    /// Install (or with `None`, remove) the deferred-release hook, together
    /// with the context handed to it
    pub fn set_deferred_release(&mut self, context: usize, hook: Option<DeferredRelease>) {
        self.context = context;
        self.deferred_release = hook;
    }

    pub fn context(&self) -> usize {
        self.context
    }

    pub fn is_stdlib(&self) -> bool {
        self.backend.is_stdlib()
    }

    /// Make every further use of this allocator (and of this clone only) a
    /// fatal violation. For catching use after teardown.
    pub fn invalidate(&mut self) {
        self.backend = Arc::new(Invalidated);
        self.fail = invalidated_fail;
        self.deferred_release = Some(invalidated_deferred_release);
    }

    /// A fresh block of at least `size` bytes. Zero is rounded up to one
    /// byte so that the result is always a distinct, freeable block.
    pub fn malloc(&self, size: usize) -> Result<NonNull<u8>, AllocError> {
        // SAFETY: null is always a valid `block` for `reallocate`
        let block = unsafe { self.backend.reallocate(ptr::null_mut(), size.max(1)) };
        self.check(block, ptr::null_mut(), size)
    }

    /// `n * size` zeroed bytes
    pub fn calloc(&self, n: usize, size: usize) -> Result<NonNull<u8>, AllocError> {
        let block = self.backend.allocate(n.max(1), size.max(1));
        self.check(block, ptr::null_mut(), n.saturating_mul(size))
    }

    /// Resize `block`. Zero is treated like one byte, so this never releases.
    /// On failure `block` is untouched and still owned by the caller.
    ///
    /// # Safety
    ///
    /// `block` must be null or live in this allocator.
    pub unsafe fn realloc(&self, block: *mut u8, size: usize) -> Result<NonNull<u8>, AllocError> {
        // SAFETY: forwarded from the caller
        let moved = unsafe { self.backend.reallocate(block, size.max(1)) };
        self.check(moved, block, size)
    }

    /// Like [`Self::realloc`], except that a `size` of zero releases `block`
    /// and yields `None`.
    ///
    /// # Safety
    ///
    /// `block` must be null or live in this allocator.
    pub unsafe fn realloc_strict(
        &self,
        block: *mut u8,
        size: usize,
    ) -> Result<Option<NonNull<u8>>, AllocError> {
        if size == 0 {
            // SAFETY: forwarded from the caller
            unsafe { self.free(block) };
            return Ok(None);
        }
        // SAFETY: forwarded from the caller
        unsafe { self.realloc(block, size) }.map(Some)
    }

    /// Release `block`. Null is ignored.
    ///
    /// # Safety
    ///
    /// `block` must be null or live in this allocator. It is dangling
    /// afterwards.
    pub unsafe fn free(&self, block: *mut u8) {
        if block.is_null() {
            return;
        }
        // SAFETY: forwarded from the caller
        unsafe { self.backend.release(block) }
    }

    /// Run the failure handler as if a request for `size` bytes had been
    /// refused
    pub fn fail(&self, block: *mut u8, size: usize) {
        (self.fail)(self, block, size)
    }

    /// Release `block` through the deferred-release hook. Null is ignored.
    /// Without a hook this is a fatal violation.
    ///
    /// # Safety
    ///
    /// `block` must be null or live in this allocator. The hook takes over
    /// ownership.
    pub unsafe fn deferred_free(&self, block: *mut u8) -> i32 {
        if block.is_null() {
            return 0;
        }
        let Some(hook) = self.deferred_release else {
            return fatal::report(
                fatal::default_handler(),
                &Violation::MissingDeferredRelease(block as usize),
                None,
            );
        };
        // SAFETY: the hook only hands back blocks it was given
        let release = |block: *mut u8| unsafe { self.backend.release(block) };
        hook(self.context, &release, block, self)
    }

    fn check(
        &self,
        result: *mut u8,
        block: *mut u8,
        size: usize,
    ) -> Result<NonNull<u8>, AllocError> {
        match NonNull::new(result) {
            Some(result) => Ok(result),
            None => cold(|| {
                self.fail(block, size);
                Err(AllocError::new(size))
            }),
        }
    }
}

impl Default for Allocator {
    fn default() -> Self {
        Self::stdlib()
    }
}

impl fmt::Debug for Allocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Allocator")
            .field("backend", &self.backend.name())
            .field("context", &format_args!("{:#x}", self.context))
            .field("deferred_release", &self.deferred_release.is_some())
            .finish()
    }
}
