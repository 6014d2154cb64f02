//! Call stack capture for trace lines and fatal reports.
//!
//! Only the interface matters to the allocator: a list of symbol strings,
//! innermost frame first. [`StdBacktrace`] is the stock implementation; tests
//! and exotic platforms can plug in their own [`StackCapture`].

use std::backtrace::{Backtrace, BacktraceStatus};

use hashbrown::HashSet;

/// Frame limit used when capturing for reports
pub const MAX_DEPTH: usize = 256;

pub trait StackCapture: Send + Sync {
    /// Symbolized frames, innermost first, at most `max_depth` of them
    fn capture_frames(&self, max_depth: usize) -> Vec<String>;
}

/// Symbolizes via [`std::backtrace::Backtrace::force_capture`], ignoring
/// `RUST_BACKTRACE`
pub struct StdBacktrace;

impl StackCapture for StdBacktrace {
    fn capture_frames(&self, max_depth: usize) -> Vec<String> {
        let backtrace = Backtrace::force_capture();
        match backtrace.status() {
            BacktraceStatus::Captured => parse_frames(&backtrace.to_string(), max_depth),
            _ => Vec::new(),
        }
    }
}

/// Never captures anything
pub struct NoCapture;

impl StackCapture for NoCapture {
    fn capture_frames(&self, _: usize) -> Vec<String> {
        Vec::new()
    }
}

/// Pull the symbol names out of a rendered backtrace:
///
/// ```plaintext
///    4: diagalloc::alloc::diagnostic::DiagnosticAllocator<A>::trace
///              at ./src/alloc/diagnostic.rs:210:29
///    5: my_test::leaks_one_block
/// ```
pub fn parse_frames(rendered: &str, max_depth: usize) -> Vec<String> {
    rendered
        .lines()
        .filter_map(|line| {
            let (index, symbol) = line.trim_start().split_once(": ")?;
            index.parse::<usize>().ok()?;
            Some(strip_hash(symbol.trim()).to_owned())
        })
        .take(max_depth)
        .collect()
}

/// `foo::bar::h0123456789abcdef` -> `foo::bar`
fn strip_hash(symbol: &str) -> &str {
    match symbol.rsplit_once("::h") {
        Some((head, hash)) if hash.len() == 16 && hash.bytes().all(|b| b.is_ascii_hexdigit()) => {
            head
        }
        _ => symbol,
    }
}

const CRATE: &str = env!("CARGO_CRATE_NAME");

const MACHINERY: &[&str] = &["std::backtrace", "std::backtrace_rs", "__rust_"];

fn is_internal(frame: &str) -> bool {
    let frame = frame.trim_start_matches('<');
    let own = frame
        .strip_prefix(CRATE)
        .is_some_and(|rest| rest.starts_with("::"));
    own || MACHINERY.iter().any(|prefix| frame.starts_with(prefix))
}

/// Drop the allocator's own frames and the capture machinery, plus repeats
/// (recursion), so that what is left starts at the caller's fault site.
pub fn filter_internal(frames: Vec<String>) -> Vec<String> {
    let mut seen = HashSet::new();
    frames
        .into_iter()
        .filter(|frame| !is_internal(frame))
        .filter(|frame| seen.insert(frame.clone()))
        .collect()
}
