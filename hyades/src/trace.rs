//! Logging for rank-level debugging.
//!
//! Built with `--features tracing`, the crate logs through `tracing`; rank,
//! destination, handler and byte counts travel as structured fields. Without
//! the feature the macros below swallow their arguments, so trace points in the
//! progress engine compile to nothing.

/// Default filter when `RUST_LOG` is unset.
#[cfg(feature = "tracing")]
const DEFAULT_FILTER: &str = "hyades=trace";

/// Installs a global `fmt` subscriber filtered by `RUST_LOG`.
///
/// Safe to call more than once; later calls are ignored. Rank threads are named
/// `hyades-rank-{n}` and thread names are printed, so each line shows its rank.
/// Does nothing without the `tracing` feature.
#[cfg(feature = "tracing")]
pub fn init_tracing() {
    use tracing_subscriber::{EnvFilter, fmt, prelude::*};

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));
    let layer = fmt::layer()
        .with_target(false)
        .with_thread_names(true)
        .with_timer(fmt::time::uptime());

    // Err means a subscriber is already installed (another test got there first).
    let _ = tracing_subscriber::registry().with(layer).with(filter).try_init();
}

#[cfg(not(feature = "tracing"))]
pub const fn init_tracing() {}

#[cfg(feature = "tracing")]
pub(crate) use tracing::{debug, error, info, trace, warn};

#[cfg(not(feature = "tracing"))]
macro_rules! discard {
    ($($arg:tt)*) => {};
}

#[cfg(not(feature = "tracing"))]
pub(crate) use discard as debug;
#[cfg(not(feature = "tracing"))]
pub(crate) use discard as error;
#[cfg(not(feature = "tracing"))]
pub(crate) use discard as info;
#[cfg(not(feature = "tracing"))]
pub(crate) use discard as trace;
#[cfg(not(feature = "tracing"))]
pub(crate) use discard as warn;
