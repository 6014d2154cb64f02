use std::sync::Once;

use env_logger::Env;

/// Log target for per-operation trace lines
pub const TRACE_TARGET: &str = "diagalloc::trace";

static LOGGER: Once = Once::new();

/// Install `env_logger` unless something else already owns the `log` facade.
/// With tracing on and no `RUST_LOG`, this crate logs at `info`.
pub fn init_logging(trace_level: u8) {
    LOGGER.call_once(|| {
        let default_filter = if trace_level > 0 {
            "warn,diagalloc=info"
        } else {
            "warn"
        };
        // somebody else's logger is fine too
        let _ = env_logger::Builder::from_env(Env::default().default_filter_or(default_filter))
            .try_init();
    });
}

/// `log!()` on the trace target, with the thread name in front of it
#[macro_export]
macro_rules! thread_log {
    ($lvl:expr, $($arg:tt)*) => {
        ::log::log!(
            target: $crate::util::print::TRACE_TARGET,
            $lvl,
            "[{}] {}",
            ::std::thread::current().name().unwrap_or("{unknown}"),
            format_args!($($arg)*)
        )
    };
}
