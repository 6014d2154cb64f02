//! Run with `DIAGALLOC_TRACE=2 cargo run --example trace_session` to see one
//! trace line per operation, each with the caller's stack.
//!
//! Pass `leak` as an argument to end the session with a leak, which aborts.

use std::{env, sync::Arc};

use diagalloc::{
    alloc::{default, diagnostic::SizePolicy},
    Allocator, DiagnosticAllocator,
};

fn fill(allocator: &Allocator, n: usize) -> Vec<*mut u8> {
    (1..=n)
        .map(|i| allocator.calloc(i, 8).unwrap().as_ptr())
        .collect()
}

fn main() {
    let diagnostic = Arc::new(DiagnosticAllocator::from_env().unwrap_or_else(|err| {
        eprintln!("{err}");
        DiagnosticAllocator::new()
    }));
    let allocator =
        Allocator::from_shared(diagnostic.clone()).with_failure_handler(|_, _, size| {
            eprintln!("refused {size} bytes");
        });

    let blocks = fill(&allocator, 4);
    let grown = unsafe { allocator.realloc(blocks[0], 4096) }.unwrap();

    diagnostic.set_size_policy(SizePolicy::RefuseAbove(64));
    assert!(allocator.malloc(65).is_err());
    diagnostic.set_size_policy(SizePolicy::Unlimited);

    // the same thing through the default allocator
    default::with_default(allocator.clone(), || {
        let block = default::malloc(None, 100).unwrap();
        unsafe { default::free(None, block.as_ptr()) };
    });

    println!("{diagnostic:?}");
    println!("{}", diagnostic.snapshot().to_json().unwrap());

    unsafe { allocator.free(grown.as_ptr()) };
    let leak = env::args().any(|arg| arg == "leak");
    for &block in &blocks[1..blocks.len() - usize::from(leak)] {
        unsafe { allocator.free(block) };
    }

    diagnostic.reset();
    println!("clean");
}
