//! The fatal-report channel. Allocator misuse is not an error that callers can
//! handle: it is reported here, and the installed [`FatalHandler`] takes the
//! process down (or, in tests, unwinds).
//!
//! Resource exhaustion never comes through here. That goes through the
//! allocator's failure handler and [`AllocError`](crate::alloc::contract::AllocError).

use std::{
    fmt,
    io::{self, Write},
    process,
    sync::{PoisonError, RwLock},
};

use parking_lot::{ReentrantMutex, ReentrantMutexGuard};

use crate::alloc::pointer_set::Handle;

/// A programming error detected at the call that committed it
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Violation {
    /// Release of an address that was never handed out
    InvalidFree(usize),
    /// Release of an address that is already released
    DoubleFree(Handle),
    /// Reallocation of an address that was never handed out
    FalseRealloc(usize),
    /// Reallocation of an address that is already released
    ReallocAfterFree(Handle),
    /// The backing allocator returned an address that is still live
    DuplicateAllocation(Handle),
    /// The backing allocator returned `0` or `usize::MAX` as a block
    ReservedAddress(usize),
    /// Live blocks left over at reset. Never empty.
    Leaks(Vec<Handle>),
    /// `deferred_free` on an allocator with no deferred-release hook
    MissingDeferredRelease(usize),
    /// Any use of an invalidated allocator, naming the operation
    InvalidatedAllocator(&'static str),
}

impl Violation {
    /// The address the violation is about, the first leak for [`Self::Leaks`]
    pub fn addr(&self) -> Option<usize> {
        match self {
            Self::InvalidFree(a)
            | Self::FalseRealloc(a)
            | Self::ReservedAddress(a)
            | Self::MissingDeferredRelease(a) => Some(*a),
            Self::DoubleFree(p) | Self::ReallocAfterFree(p) | Self::DuplicateAllocation(p) => {
                Some(p.addr())
            }
            Self::Leaks(leaks) => leaks.first().map(|p| p.addr()),
            Self::InvalidatedAllocator(_) => None,
        }
    }
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidFree(a) => write!(f, "false free: {a:#x}"),
            Self::DoubleFree(p) => write!(f, "double free: {p}"),
            Self::FalseRealloc(a) => write!(f, "false realloc: {a:#x}"),
            Self::ReallocAfterFree(p) => write!(f, "realloc after free: {p}"),
            Self::DuplicateAllocation(p) => write!(f, "duplicate allocation: {p}"),
            Self::ReservedAddress(a) => write!(f, "reserved address returned: {a:#x}"),
            Self::Leaks(leaks) => match leaks.as_slice() {
                [] => write!(f, "leak"),
                [first] => write!(f, "leak {first}"),
                [first, rest @ ..] => write!(f, "leak {first} (and {} more)", rest.len()),
            },
            Self::MissingDeferredRelease(a) => {
                write!(f, "deferred free without a deferred-release hook: {a:#x}")
            }
            Self::InvalidatedAllocator(op) => write!(f, "{op} on an invalidated allocator"),
        }
    }
}

/// Decides what happens once a violation has been reported. Never returns.
pub type FatalHandler = fn(&Violation) -> !;

/// Default: terminate at the offending call site
#[cold]
pub fn abort_on_violation(_: &Violation) -> ! {
    process::abort()
}

/// For in-process tests: unwind with the violation as the panic message
#[cold]
pub fn panic_on_violation(violation: &Violation) -> ! {
    panic!("{violation}")
}

static DEFAULT_HANDLER: RwLock<FatalHandler> = RwLock::new(abort_on_violation as FatalHandler);

/// The handler used by allocators that were not given one of their own
pub fn default_handler() -> FatalHandler {
    *DEFAULT_HANDLER
        .read()
        .unwrap_or_else(PoisonError::into_inner)
}

/// Replace the process-wide handler, returning the previous one
pub fn set_default_handler(handler: FatalHandler) -> FatalHandler {
    let mut guard = DEFAULT_HANDLER
        .write()
        .unwrap_or_else(PoisonError::into_inner);
    std::mem::replace(&mut *guard, handler)
}

static SCOPES: ReentrantMutex<()> = parking_lot::const_reentrant_mutex(());

/// Held by every save/restore scope of process-wide state. Other threads wait,
/// the owning thread may nest.
pub(crate) fn exclusive_scope() -> ReentrantMutexGuard<'static, ()> {
    SCOPES.lock()
}

/// Swaps the process-wide handler for as long as it lives. Scopes on other
/// threads wait for this one to end, nested scopes restore in reverse order.
pub struct FatalHandlerScope {
    previous: FatalHandler,
    _exclusive: ReentrantMutexGuard<'static, ()>,
}

impl FatalHandlerScope {
    pub fn new(handler: FatalHandler) -> Self {
        let exclusive = exclusive_scope();
        Self {
            previous: set_default_handler(handler),
            _exclusive: exclusive,
        }
    }
}

impl Drop for FatalHandlerScope {
    fn drop(&mut self) {
        set_default_handler(self.previous);
    }
}

/// Render frames outermost call first, `|`-separated
pub fn format_frames(frames: &[String]) -> String {
    frames
        .iter()
        .rev()
        .map(String::as_str)
        .collect::<Vec<_>>()
        .join("|")
}

/// Write the report for `violation` to stderr and hand it to `handler`.
///
/// Must not be called with the tracking lock held.
#[cold]
pub fn report(handler: FatalHandler, violation: &Violation, frames: Option<&[String]>) -> ! {
    {
        let mut stderr = io::stderr().lock();
        // nothing sensible to do if stderr is gone, we're going down anyway
        let _ = write!(stderr, "\n###\n### {violation}");
        if let Some(frames) = frames {
            let _ = write!(stderr, " : [{}]", format_frames(frames));
        }
        let _ = writeln!(stderr);
    }
    handler(violation)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn h(addr: usize) -> Handle {
        Handle::new(addr).unwrap()
    }

    #[test]
    fn leak_message_names_first_address() {
        let v = Violation::Leaks(vec![h(0x10), h(0x20), h(0x30)]);
        assert_eq!(v.to_string(), "leak 0x10 (and 2 more)");
        assert_eq!(v.addr(), Some(0x10));
        assert_eq!(Violation::Leaks(vec![h(0x10)]).to_string(), "leak 0x10");
    }

    #[test]
    fn messages() {
        assert_eq!(Violation::DoubleFree(h(0xab)).to_string(), "double free: 0xab");
        assert_eq!(Violation::InvalidFree(0xcd).to_string(), "false free: 0xcd");
        assert_eq!(
            Violation::InvalidatedAllocator("release").to_string(),
            "release on an invalidated allocator"
        );
        assert_eq!(Violation::InvalidatedAllocator("release").addr(), None);
    }

    #[test]
    fn frames_render_outermost_first() {
        let frames = vec!["inner".to_owned(), "middle".to_owned(), "main".to_owned()];
        assert_eq!(format_frames(&frames), "main|middle|inner");
    }

    fn other_handler(violation: &Violation) -> ! {
        panic!("other: {violation}")
    }

    fn current_handler_message() -> String {
        let payload = std::panic::catch_unwind(|| default_handler()(&Violation::InvalidFree(0x8)))
            .unwrap_err();
        *payload.downcast::<String>().unwrap()
    }

    #[test]
    fn handler_scopes_nest() {
        let _outer = FatalHandlerScope::new(panic_on_violation);
        {
            let _inner = FatalHandlerScope::new(other_handler);
            assert_eq!(current_handler_message(), "other: false free: 0x8");
        }
        assert_eq!(current_handler_message(), "false free: 0x8");
    }

    #[test]
    #[should_panic(expected = "double free: 0x40")]
    fn report_hands_over_to_handler() {
        report(panic_on_violation, &Violation::DoubleFree(h(0x40)), None)
    }
}
