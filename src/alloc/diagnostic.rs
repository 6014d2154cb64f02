//! An allocator that wraps another one and keeps track of every block it hands
//! out, so that misuse is caught at the call that commits it.
//!
//! Each address is in one of three states:
//!
//! ```plaintext
//!                 allocate                release
//!   UNTRACKED ---------------> LIVE ---------------> FREED
//!                               ^  \                   |
//!                               |   \ realloc (moved)  |
//!                               |    '---------------->|
//!                               '----------------------'
//!                                 allocate (address reused)
//! ```
//!
//! Anything else is a [`Violation`]: releasing or reallocating an address that
//! is not LIVE, or being handed an address that is still LIVE. Violations go to
//! the fatal channel and never return. Blocks still LIVE at [`reset`] are
//! leaks, which are violations too.
//!
//! The real allocator call happens outside the tracking lock, only the
//! bookkeeping right after it is done inside. Violations are reported after
//! the lock is released.
//!
//! [`reset`]: DiagnosticAllocator::reset

use std::{
    fmt,
    fs::File,
    io::{self, BufWriter, Write},
    path::Path,
    ptr,
    sync::{
        atomic::{AtomicBool, AtomicU8, Ordering},
        Arc, Mutex, MutexGuard, PoisonError, RwLock,
    },
};

use log::Level;
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};

use crate::{
    alloc::{
        contract::{Allocator, RawAllocator},
        default::DefaultAllocatorScope,
        pointer_set::{Handle, PointerSet},
        stdlib::Stdlib,
    },
    config::{Config, ConfigError, MAX_TRACE_LEVEL},
    fatal::{self, FatalHandler, Violation},
    stack::{self, StackCapture, StdBacktrace},
    thread_log,
    util::{hint::cold, print::init_logging},
};

/// Which request sizes failure injection lets through
#[derive(Debug, Clone, Copy, Default)]
pub enum SizePolicy {
    /// Everything
    #[default]
    Unlimited,
    /// Refuse requests of at most this many bytes
    RefuseAtOrBelow(usize),
    /// Refuse requests of more than this many bytes
    RefuseAbove(usize),
    /// Refuse whenever this returns `false`
    Custom(fn(usize) -> bool),
}

impl SizePolicy {
    pub fn may_allocate(&self, size: usize) -> bool {
        match *self {
            Self::Unlimited => true,
            Self::RefuseAtOrBelow(threshold) => size > threshold,
            Self::RefuseAbove(threshold) => size <= threshold,
            Self::Custom(predicate) => predicate(size),
        }
    }
}

/// The LIVE and FREED sets. Only the state transitions live here, reporting
/// is up to the caller (who must drop the lock first).
#[derive(Debug, Default)]
struct Tracking {
    live: PointerSet,
    freed: PointerSet,
}

impl Tracking {
    /// UNTRACKED or FREED -> LIVE
    fn track_new(&mut self, addr: usize) -> Result<Handle, Violation> {
        let handle = Handle::new(addr).ok_or(Violation::ReservedAddress(addr))?;
        self.freed.remove(handle);
        if !self.live.add(handle) {
            return Err(Violation::DuplicateAllocation(handle));
        }
        Ok(handle)
    }

    /// LIVE -> FREED before the real reallocation, which may release the
    /// old address to other threads before it returns
    fn begin_realloc(&mut self, addr: usize) -> Result<Handle, Violation> {
        let handle = match Handle::new(addr) {
            Some(handle) if self.live.remove(handle) => handle,
            Some(handle) if self.freed.contains(handle) => {
                return Err(Violation::ReallocAfterFree(handle))
            }
            _ => return Err(Violation::FalseRealloc(addr)),
        };
        self.freed.add(handle);
        Ok(handle)
    }

    /// The block stayed put, or could not be resized: `old` is LIVE again
    fn cancel_realloc(&mut self, old: Handle) {
        self.freed.remove(old);
        self.live.add(old);
    }

    fn finish_realloc(&mut self, old: Handle, new: usize) -> Result<Handle, Violation> {
        if old.addr() == new {
            self.cancel_realloc(old);
            return Ok(old);
        }
        self.track_new(new)
    }

    /// LIVE -> FREED
    fn track_release(&mut self, addr: usize) -> Result<Handle, Violation> {
        let Some(handle) = Handle::new(addr) else {
            return Err(Violation::InvalidFree(addr));
        };
        if self.live.remove(handle) {
            self.freed.add(handle);
            Ok(handle)
        } else if self.freed.contains(handle) {
            Err(Violation::DoubleFree(handle))
        } else {
            Err(Violation::InvalidFree(addr))
        }
    }

    fn snapshot(&self) -> Snapshot {
        let mut live: Vec<_> = self.live.iter().collect();
        let mut freed: Vec<_> = self.freed.iter().collect();
        live.sort_unstable();
        freed.sort_unstable();
        Snapshot { live, freed }
    }

    fn clear(&mut self) {
        self.live.clear();
        self.freed.clear();
    }
}

/// Tracking state at one point in time, addresses ascending
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Snapshot {
    pub live: Vec<Handle>,
    pub freed: Vec<Handle>,
}

impl Snapshot {
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }

    pub fn write_to_file(&self, path: &Path) -> io::Result<()> {
        let mut out = BufWriter::new(File::create(path)?);
        serde_json::to_writer_pretty(&mut out, self)?;
        out.flush()
    }
}

/// `0x1000-0x100f` for a 16 byte block at `0x1000`
struct Span {
    start: usize,
    len: usize,
}

impl Span {
    fn new(block: *mut u8, len: usize) -> Self {
        Self {
            start: block as usize,
            len,
        }
    }
}

impl fmt::Display for Span {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let end = self.start.wrapping_add(self.len.saturating_sub(1));
        write!(f, "{:#x}-{:#x}", self.start, end)
    }
}

#[cfg(target_os = "linux")]
fn set_errno_enomem() {
    // SAFETY: errno is thread local and always valid for writes
    unsafe { *libc::__errno_location() = libc::ENOMEM }
}

#[cfg(any(target_os = "macos", target_os = "ios", target_os = "freebsd"))]
fn set_errno_enomem() {
    // SAFETY: errno is thread local and always valid for writes
    unsafe { *libc::__error() = libc::ENOMEM }
}

#[cfg(not(any(
    target_os = "linux",
    target_os = "macos",
    target_os = "ios",
    target_os = "freebsd"
)))]
fn set_errno_enomem() {}

/// Refusal: null with `ENOMEM`, tracking untouched
fn refuse() -> *mut u8 {
    set_errno_enomem();
    ptr::null_mut()
}

/// Wraps `A` and tracks every block it hands out. Use it through an
/// [`Allocator`], e.g. `Allocator::from_shared(Arc::new(diagnostic))`.
///
/// The tracking sets are ordinary heap data, so this is not meant to be the
/// `#[global_allocator]`.
pub struct DiagnosticAllocator<A = Stdlib>
where
    A: RawAllocator,
{
    inner: A,
    tracking: Mutex<Tracking>,
    out_of_memory: AtomicBool,
    dont_free: AtomicBool,
    trace_level: AtomicU8,
    size_policy: RwLock<SizePolicy>,
    config: Config,
    fatal: Option<FatalHandler>,
    stack: Box<dyn StackCapture>,
}

impl DiagnosticAllocator<Stdlib> {
    pub fn new() -> Self {
        Self::with_config(Stdlib, Config::default())
    }

    /// Configured from the `DIAGALLOC_*` environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(Self::with_config(Stdlib, Config::from_env()?))
    }
}

impl Default for DiagnosticAllocator<Stdlib> {
    fn default() -> Self {
        Self::new()
    }
}

impl<A> DiagnosticAllocator<A>
where
    A: RawAllocator,
{
    pub fn with_config(inner: A, config: Config) -> Self {
        let trace_level = config.trace_level.min(MAX_TRACE_LEVEL);
        if trace_level > 0 {
            init_logging(trace_level);
            if config.dont_free {
                thread_log!(Level::Info, "memory will not really be freed");
            }
        }
        Self {
            inner,
            tracking: Mutex::new(Tracking::default()),
            out_of_memory: AtomicBool::new(false),
            dont_free: AtomicBool::new(config.dont_free),
            trace_level: AtomicU8::new(trace_level),
            size_policy: RwLock::new(SizePolicy::Unlimited),
            config,
            fatal: None,
            stack: Box::new(StdBacktrace),
        }
    }

    /// Report violations here instead of through
    /// [`fatal::default_handler`]
    pub fn with_fatal_handler(mut self, handler: FatalHandler) -> Self {
        self.fatal = Some(handler);
        self
    }

    pub fn with_stack_capture<S>(mut self, capture: S) -> Self
    where
        S: StackCapture + 'static,
    {
        self.stack = Box::new(capture);
        self
    }

    pub fn inner(&self) -> &A {
        &self.inner
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Refuse every request until cleared
    pub fn set_out_of_memory(&self, out_of_memory: bool) {
        self.out_of_memory.store(out_of_memory, Ordering::SeqCst);
    }

    pub fn out_of_memory(&self) -> bool {
        self.out_of_memory.load(Ordering::SeqCst)
    }

    pub fn set_size_policy(&self, policy: SizePolicy) {
        *self
            .size_policy
            .write()
            .unwrap_or_else(PoisonError::into_inner) = policy;
    }

    pub fn size_policy(&self) -> SizePolicy {
        *self.size_policy.read().unwrap_or_else(PoisonError::into_inner)
    }

    /// Keep released blocks instead of handing them back to the inner
    /// allocator, so their addresses are never reused
    pub fn set_dont_free(&self, dont_free: bool) {
        self.dont_free.store(dont_free, Ordering::SeqCst);
    }

    pub fn dont_free(&self) -> bool {
        self.dont_free.load(Ordering::SeqCst)
    }

    /// 0 to 3, larger values are clamped
    pub fn set_trace_level(&self, level: u8) {
        let level = level.min(MAX_TRACE_LEVEL);
        let previous = self.trace_level.swap(level, Ordering::SeqCst);
        if level > 0 {
            init_logging(level);
        }
        if previous != level {
            log::info!("trace level set to {level}");
        }
    }

    pub fn trace_level(&self) -> u8 {
        self.trace_level.load(Ordering::Relaxed)
    }

    /// Would failure injection let a request of `size` bytes through?
    pub fn may_allocate(&self, size: usize) -> bool {
        !self.out_of_memory() && self.size_policy().may_allocate(size)
    }

    fn lock(&self) -> MutexGuard<'_, Tracking> {
        self.tracking.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn live_count(&self) -> usize {
        self.lock().live.len()
    }

    pub fn freed_count(&self) -> usize {
        self.lock().freed.len()
    }

    pub fn is_live(&self, block: *const u8) -> bool {
        Handle::from_ptr(block).is_some_and(|h| self.lock().live.contains(h))
    }

    pub fn is_freed(&self, block: *const u8) -> bool {
        Handle::from_ptr(block).is_some_and(|h| self.lock().freed.contains(h))
    }

    /// Blocks that are still LIVE, addresses ascending
    pub fn leaks(&self) -> Vec<Handle> {
        self.snapshot().live
    }

    pub fn snapshot(&self) -> Snapshot {
        self.lock().snapshot()
    }

    /// End of a test case: every LIVE block is reported as a leak, which is
    /// fatal. Either way both sets are emptied and the failure-injection and
    /// retain-memory knobs go back to their configured values.
    ///
    /// Must not race with allocations still in flight.
    pub fn reset(&self) {
        let snapshot = {
            let mut tracking = self.lock();
            let snapshot = tracking.snapshot();
            tracking.clear();
            self.restore_knobs();
            snapshot
        };
        if !snapshot.live.is_empty() {
            self.report_leaks(snapshot)
        }
    }

    /// [`Self::reset`] without the leak check, for callers that already have
    /// exclusive access
    pub fn reset_unlocked(&mut self) {
        self.tracking
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        self.restore_knobs();
    }

    /// Leak check of [`Self::reset`] without taking the lock and without
    /// clearing anything
    pub fn detect_leaks_unlocked(&mut self) {
        let snapshot = self
            .tracking
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .snapshot();
        if !snapshot.live.is_empty() {
            self.report_leaks(snapshot)
        }
    }

    fn restore_knobs(&self) {
        self.set_out_of_memory(false);
        self.set_size_policy(SizePolicy::Unlimited);
        self.set_dont_free(self.config.dont_free);
    }

    #[cold]
    fn report_leaks(&self, snapshot: Snapshot) -> ! {
        {
            let mut stderr = io::stderr().lock();
            for leak in &snapshot.live {
                let _ = writeln!(stderr, "### leak {leak}");
            }
        }
        if let Some(path) = &self.config.leak_report {
            if let Err(err) = snapshot.write_to_file(path) {
                log::warn!("could not write leak report to {}: {err}", path.display());
            }
        }
        self.fatal(Violation::Leaks(snapshot.live))
    }

    /// Frames for trace lines and reports. Own frames are filtered out below
    /// trace level 3.
    fn frames(&self) -> Vec<String> {
        let frames = self.stack.capture_frames(stack::MAX_DEPTH);
        if self.trace_level() >= 3 {
            frames
        } else {
            stack::filter_internal(frames)
        }
    }

    #[cold]
    fn fatal(&self, violation: Violation) -> ! {
        let frames = (self.trace_level() >= 2).then(|| self.frames());
        let handler = self.fatal.unwrap_or_else(fatal::default_handler);
        fatal::report(handler, &violation, frames.as_deref())
    }

    fn trace(&self, line: fmt::Arguments<'_>) {
        match self.trace_level() {
            0 => {}
            1 => thread_log!(Level::Info, "{line}"),
            _ => {
                let frames = fatal::format_frames(&self.frames());
                thread_log!(Level::Info, "{line} : [{frames}]");
            }
        }
    }

    fn track_new(&self, block: *mut u8, len: usize) -> *mut u8 {
        let tracked = self.lock().track_new(block as usize);
        if let Err(violation) = tracked {
            self.fatal(violation)
        }
        self.trace(format_args!("alloced {}", Span::new(block, len)));
        block
    }
}

impl<A> fmt::Debug for DiagnosticAllocator<A>
where
    A: RawAllocator,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DiagnosticAllocator")
            .field("inner", &self.inner.name())
            .field("live", &self.live_count())
            .field("freed", &self.freed_count())
            .field("out_of_memory", &self.out_of_memory())
            .field("size_policy", &self.size_policy())
            .field("dont_free", &self.dont_free())
            .field("trace_level", &self.trace_level())
            .finish()
    }
}

// SAFETY: blocks come from `inner` unchanged; tracking only ever adds checks
unsafe impl<A> RawAllocator for DiagnosticAllocator<A>
where
    A: RawAllocator,
{
    fn allocate(&self, n: usize, size: usize) -> *mut u8 {
        let total = n.saturating_mul(size);
        if !self.may_allocate(total) {
            return cold(refuse);
        }
        let block = self.inner.allocate(n, size);
        if block.is_null() {
            return block;
        }
        self.track_new(block, total)
    }

    unsafe fn reallocate(&self, block: *mut u8, size: usize) -> *mut u8 {
        if block.is_null() {
            if !self.may_allocate(size) {
                return cold(refuse);
            }
            // SAFETY: null is always fine
            let fresh = unsafe { self.inner.reallocate(block, size) };
            if fresh.is_null() {
                return fresh;
            }
            return self.track_new(fresh, size);
        }
        if size == 0 {
            // SAFETY: forwarded from the caller
            unsafe { self.release(block) };
            return ptr::null_mut();
        }
        if !self.may_allocate(size) {
            return cold(refuse);
        }

        let begun = self.lock().begin_realloc(block as usize);
        let old = match begun {
            Ok(old) => old,
            Err(violation) => self.fatal(violation),
        };

        // SAFETY: `block` was LIVE, so it came from `inner`
        let moved = unsafe { self.inner.reallocate(block, size) };
        if moved.is_null() {
            // `block` is untouched
            self.lock().cancel_realloc(old);
            return moved;
        }

        let tracked = self.lock().finish_realloc(old, moved as usize);
        if let Err(violation) = tracked {
            self.fatal(violation)
        }
        self.trace(format_args!("realloced {old} -> {}", Span::new(moved, size)));
        moved
    }

    unsafe fn release(&self, block: *mut u8) {
        if block.is_null() {
            return;
        }
        let released = self.lock().track_release(block as usize);
        if let Err(violation) = released {
            self.fatal(violation)
        }
        if !self.dont_free() {
            // SAFETY: `block` was LIVE, so it came from `inner`
            unsafe { self.inner.release(block) }
        }
        self.trace(format_args!("freed {block:p}"));
    }

    fn name(&self) -> &'static str {
        "diagnostic"
    }
}

static GLOBAL: Lazy<Arc<DiagnosticAllocator>> = Lazy::new(|| {
    let allocator = DiagnosticAllocator::from_env().unwrap_or_else(|err| {
        log::warn!("{err}, falling back to defaults");
        DiagnosticAllocator::new()
    });
    Arc::new(allocator)
});

/// The process-wide diagnostic allocator, configured from the environment on
/// first use
pub fn global() -> &'static Arc<DiagnosticAllocator> {
    &GLOBAL
}

/// Make [`global()`] the default allocator until the scope is dropped
pub fn install_global() -> DefaultAllocatorScope {
    DefaultAllocatorScope::new(Allocator::from_shared(GLOBAL.clone()))
}
