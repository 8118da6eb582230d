//! Deterministic single-threaded test host.
//!
//! A [`Lab`] bundles a [`VirtualClock`] with a [`TimerDriverHandle`] and
//! drives a future to completion with controlled time: whenever the future
//! is pending, nothing has woken it, and no timer is due, the clock jumps to
//! the next timer deadline and due timers fire. Millisecond-scale scenarios
//! therefore run instantly and yield exact orderings — no real sleeping, no
//! flakiness.
//!
//! # Example
//!
//! ```
//! use taskgate::lab::Lab;
//! use std::time::Duration;
//!
//! let lab = Lab::new();
//! let timer = lab.timer();
//! lab.block_on(async move {
//!     timer.sleep(Duration::from_millis(250)).await;
//! });
//! assert_eq!(lab.now().as_millis(), 250);
//! ```

use crate::time::{TimerDriverHandle, VirtualClock};
use crate::types::Time;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll, Wake, Waker};
use std::time::Duration;

/// Step ceiling; a run that exceeds it is looping without making progress.
const MAX_STEPS: usize = 1_000_000;

struct WakeFlag(AtomicBool);

impl Wake for WakeFlag {
    fn wake(self: Arc<Self>) {
        self.0.store(true, Ordering::Release);
    }

    fn wake_by_ref(self: &Arc<Self>) {
        self.0.store(true, Ordering::Release);
    }
}

/// Deterministic executor over virtual time.
#[derive(Debug, Clone)]
pub struct Lab {
    clock: Arc<VirtualClock>,
    timer: TimerDriverHandle,
}

impl Lab {
    /// Creates a lab whose clock starts at [`Time::ZERO`].
    #[must_use]
    pub fn new() -> Self {
        let clock = Arc::new(VirtualClock::new());
        let timer = TimerDriverHandle::with_virtual_clock(Arc::clone(&clock));
        Self { clock, timer }
    }

    /// Returns the lab's timer driver; hand this to gates, schedulers, and
    /// sleeps so they all share the lab's clock.
    #[must_use]
    pub fn timer(&self) -> TimerDriverHandle {
        self.timer.clone()
    }

    /// Returns the clock's current reading.
    #[must_use]
    pub fn now(&self) -> Time {
        self.clock.now()
    }

    /// Advances the clock by `duration` and fires every timer that became
    /// due. For stepping state manually between polls; `block_on` advances
    /// on its own.
    pub fn advance(&self, duration: Duration) {
        self.clock.advance(duration);
        while self.timer.fire_due() > 0 {}
    }

    /// Drives `future` to completion under virtual time.
    ///
    /// # Panics
    ///
    /// Panics when the future is pending with nothing woken and no timer
    /// scheduled (a genuine deadlock under this model), or after
    /// an unreasonable number of scheduler steps.
    pub fn block_on<F: Future>(&self, future: F) -> F::Output {
        let mut future = std::pin::pin!(future);
        let flag = Arc::new(WakeFlag(AtomicBool::new(false)));
        let waker = Waker::from(Arc::clone(&flag));
        let mut cx = Context::from_waker(&waker);

        for _ in 0..MAX_STEPS {
            if let Poll::Ready(output) = future.as_mut().poll(&mut cx) {
                return output;
            }
            if flag.0.swap(false, Ordering::AcqRel) {
                continue;
            }
            if self.timer.fire_due() > 0 {
                continue;
            }
            let Some(deadline) = self.timer.next_deadline() else {
                panic!("lab deadlock: future pending with no scheduled timers");
            };
            self.clock.set(deadline);
            self.timer.fire_due();
        }
        panic!("lab exceeded {MAX_STEPS} steps without completing");
    }
}

impl Default for Lab {
    fn default() -> Self {
        Self::new()
    }
}
