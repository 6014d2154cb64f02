/// Run `f` on a path the optimizer should treat as unlikely, e.g. a refused
/// request or a violation report
#[cold]
#[inline(never)]
pub fn cold<R, F: FnOnce() -> R>(f: F) -> R {
    f()
}
