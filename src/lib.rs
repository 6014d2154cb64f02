//! A pluggable allocator contract, and a diagnostic allocator behind it that
//! catches leaks, double frees and frees of foreign memory at the offending
//! call, and can simulate exhaustion for tests.
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use diagalloc::{Allocator, DiagnosticAllocator};
//!
//! let diagnostic = Arc::new(DiagnosticAllocator::new());
//! let allocator = Allocator::from_shared(diagnostic.clone());
//!
//! let block = allocator.malloc(64).unwrap();
//! unsafe { allocator.free(block.as_ptr()) };
//!
//! // aborts, naming the first leak, if anything was left LIVE
//! diagnostic.reset();
//! ```

pub mod alloc;
pub mod config;
pub mod fatal;
pub mod serialize;
pub mod stack;
pub mod util;

pub use alloc::{
    contract::{AllocError, Allocator, RawAllocator},
    diagnostic::{DiagnosticAllocator, SizePolicy},
    pointer_set::{Handle, PointerSet},
};
pub use config::Config;
pub use fatal::Violation;
