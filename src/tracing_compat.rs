//! Logging shim.
//!
//! With the `tracing` feature (default) these re-export the `tracing`
//! macros; without it they compile to nothing, keeping the crate free of the
//! dependency for hosts that do their own instrumentation.

#[cfg(feature = "tracing")]
pub(crate) use tracing::{debug, trace};

#[cfg(not(feature = "tracing"))]
macro_rules! noop_event {
    ($($arg:tt)*) => {};
}

#[cfg(not(feature = "tracing"))]
pub(crate) use noop_event as debug;
#[cfg(not(feature = "tracing"))]
pub(crate) use noop_event as trace;
