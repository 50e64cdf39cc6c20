//! Diagnostics for cold queue paths.
//!
//! The queues emit a handful of events: one when a queue is built and one
//! when a blocking operation gives up, each carrying the queue state that
//! matters (capacity, look-ahead window, size at timeout). Everything sits
//! behind the `tracing` cargo feature; with the feature off the macros
//! expand to nothing and the crate carries no instrumentation at all.

/// Installs a compact subscriber for the crate's events.
///
/// Intended for benchmarks and stress runs. Honors `RUST_LOG`, defaulting
/// to `conduit=debug`.
#[cfg(feature = "tracing")]
pub fn init_tracing() {
    use tracing_subscriber::EnvFilter;

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("conduit=debug")),
        )
        .with_target(false)
        .with_thread_names(true)
        .compact()
        .init();
}

/// No-op without the `tracing` feature.
#[cfg(not(feature = "tracing"))]
pub const fn init_tracing() {}

// Only `debug` (construction) and `trace` (timeouts) are ever emitted.
#[cfg(feature = "tracing")]
pub(crate) use tracing::{debug, trace};

// With the feature off both names alias one discarding rule; the field
// expressions at call sites are never evaluated.
#[cfg(not(feature = "tracing"))]
macro_rules! discard {
    ($($event:tt)*) => {};
}

#[cfg(not(feature = "tracing"))]
pub(crate) use discard as debug;
#[cfg(not(feature = "tracing"))]
pub(crate) use discard as trace;
