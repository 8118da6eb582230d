//! Cooperative abort flag shared between submitters and schedulers.
//!
//! An [`AbortController`] owns the flag; any number of [`AbortSignal`]
//! clones observe it. Setting the flag is sticky. The scheduler only reads
//! the signal when a queued task comes up for dispatch — tasks that are
//! already running are never interrupted.
//!
//! # Example
//!
//! ```
//! use taskgate::signal::AbortController;
//!
//! let controller = AbortController::new();
//! let signal = controller.signal();
//! assert!(!signal.aborted());
//! controller.abort();
//! assert!(signal.aborted());
//! ```

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Owner side of an abort flag.
#[derive(Debug, Clone, Default)]
pub struct AbortController {
    flag: Arc<AtomicBool>,
}

impl AbortController {
    /// Creates a controller whose flag is unset.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns an observer handle for this controller's flag.
    #[must_use]
    pub fn signal(&self) -> AbortSignal {
        AbortSignal {
            flag: Arc::clone(&self.flag),
        }
    }

    /// Sets the flag. Idempotent.
    pub fn abort(&self) {
        self.flag.store(true, Ordering::Release);
    }

    /// Returns true once [`abort`](Self::abort) has been called.
    #[must_use]
    pub fn is_aborted(&self) -> bool {
        self.flag.load(Ordering::Acquire)
    }
}

/// Observer side of an abort flag.
#[derive(Debug, Clone)]
pub struct AbortSignal {
    flag: Arc<AtomicBool>,
}

impl AbortSignal {
    /// Returns true once the owning controller has aborted.
    #[must_use]
    pub fn aborted(&self) -> bool {
        self.flag.load(Ordering::Acquire)
    }
}
