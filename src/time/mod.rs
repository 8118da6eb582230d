//! Injected time: clocks, the timer driver, and the [`Sleep`] future.
//!
//! Controllers never read ambient wall-clock time. They hold a
//! [`TimerDriverHandle`] whose [`ClockSource`] is either a [`VirtualClock`]
//! (tests, deterministic hosts) or the process monotonic clock. Timers are
//! generational arena slots ordered by a min-heap of `(deadline, seq)`;
//! cancelling a timer removes its slot and leaves a stale heap entry that is
//! skipped on pop.
//!
//! # Firing
//!
//! [`TimerDriver::fire_due`] pops every timer whose deadline is at or before
//! the clock's current reading and runs its wake action — a [`Waker`] for
//! sleep-style timers, a boxed callback for controller timeouts. Actions run
//! with no driver lock held, so a callback may freely schedule or cancel
//! timers. Same-deadline timers fire in schedule order.

use crate::types::{Time, TimerId};
use crate::util::Arena;
use parking_lot::Mutex;
use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::task::{Context, Poll, Waker};
use std::time::{Duration, Instant};

/// A controllable clock counting nanoseconds from zero.
#[derive(Debug)]
pub struct VirtualClock {
    now_nanos: AtomicU64,
}

impl VirtualClock {
    /// Creates a clock reading [`Time::ZERO`].
    #[must_use]
    pub fn new() -> Self {
        Self::starting_at(Time::ZERO)
    }

    /// Creates a clock with an explicit initial reading.
    #[must_use]
    pub fn starting_at(start: Time) -> Self {
        Self {
            now_nanos: AtomicU64::new(start.as_nanos()),
        }
    }

    /// Returns the current reading.
    #[must_use]
    pub fn now(&self) -> Time {
        Time::from_nanos(self.now_nanos.load(AtomicOrdering::Acquire))
    }

    /// Advances the clock by `duration` and returns the new reading.
    pub fn advance(&self, duration: Duration) -> Time {
        let nanos = u64::try_from(duration.as_nanos()).unwrap_or(u64::MAX);
        let now = self
            .now_nanos
            .fetch_add(nanos, AtomicOrdering::AcqRel)
            .saturating_add(nanos);
        Time::from_nanos(now)
    }

    /// Moves the clock forward to `target`. A reading already at or past
    /// `target` is left unchanged; virtual time never runs backwards.
    pub fn set(&self, target: Time) {
        self.now_nanos
            .fetch_max(target.as_nanos(), AtomicOrdering::AcqRel);
    }
}

impl Default for VirtualClock {
    fn default() -> Self {
        Self::new()
    }
}

/// Where a timer driver reads the current time from.
#[derive(Debug, Clone)]
pub enum ClockSource {
    /// A shared [`VirtualClock`], advanced explicitly.
    Virtual(Arc<VirtualClock>),
    /// The process monotonic clock, anchored at driver creation.
    Monotonic(Instant),
}

impl ClockSource {
    /// A monotonic source anchored at the current instant.
    #[must_use]
    pub fn monotonic() -> Self {
        Self::Monotonic(Instant::now())
    }

    /// Returns the current reading.
    #[must_use]
    pub fn now(&self) -> Time {
        match self {
            Self::Virtual(clock) => clock.now(),
            Self::Monotonic(anchor) => {
                Time::from_nanos(u64::try_from(anchor.elapsed().as_nanos()).unwrap_or(u64::MAX))
            }
        }
    }
}

/// Action taken when a timer fires.
enum TimerWake {
    Waker(Waker),
    Callback(Box<dyn FnOnce() + Send>),
}

impl TimerWake {
    fn run(self) {
        match self {
            Self::Waker(waker) => waker.wake(),
            Self::Callback(callback) => callback(),
        }
    }
}

/// Heap entry; reversed ordering turns `BinaryHeap` into a min-heap on
/// `(deadline, seq)` so same-deadline timers pop in schedule order.
#[derive(Clone, Copy, PartialEq, Eq)]
struct HeapEntry {
    deadline: Time,
    seq: u64,
    id: TimerId,
}

impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .deadline
            .cmp(&self.deadline)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

struct TimerState {
    heap: BinaryHeap<HeapEntry>,
    slots: Arena<TimerWake>,
    next_seq: u64,
}

/// Timer service shared by controllers and [`Sleep`] futures.
pub struct TimerDriver {
    clock: ClockSource,
    state: Mutex<TimerState>,
}

impl TimerDriver {
    /// Creates a driver over the given clock source.
    #[must_use]
    pub fn new(clock: ClockSource) -> Self {
        Self {
            clock,
            state: Mutex::new(TimerState {
                heap: BinaryHeap::new(),
                slots: Arena::new(),
                next_seq: 0,
            }),
        }
    }

    /// Returns the clock's current reading.
    #[must_use]
    pub fn now(&self) -> Time {
        self.clock.now()
    }

    /// Schedules a waker to be woken at `deadline`.
    pub fn schedule_waker(&self, deadline: Time, waker: Waker) -> TimerId {
        self.schedule(deadline, TimerWake::Waker(waker))
    }

    /// Schedules a callback to run at `deadline`.
    ///
    /// The callback runs with no driver lock held and may re-enter the
    /// driver.
    pub fn schedule_callback<F>(&self, deadline: Time, callback: F) -> TimerId
    where
        F: FnOnce() + Send + 'static,
    {
        self.schedule(deadline, TimerWake::Callback(Box::new(callback)))
    }

    fn schedule(&self, deadline: Time, wake: TimerWake) -> TimerId {
        let mut state = self.state.lock();
        let id = TimerId(state.slots.insert(wake));
        let seq = state.next_seq;
        state.next_seq += 1;
        state.heap.push(HeapEntry { deadline, seq, id });
        crate::tracing_compat::trace!(
            timer = ?id,
            deadline_ms = deadline.as_millis(),
            "timer scheduled"
        );
        id
    }

    /// Replaces the waker stored for a waker timer.
    ///
    /// Returns false when the timer already fired, was cancelled, or is a
    /// callback timer.
    pub fn update_waker(&self, id: TimerId, waker: &Waker) -> bool {
        let mut state = self.state.lock();
        match state.slots.get_mut(id.0) {
            Some(TimerWake::Waker(stored)) => {
                if !stored.will_wake(waker) {
                    stored.clone_from(waker);
                }
                true
            }
            _ => false,
        }
    }

    /// Cancels a timer. Returns false when it already fired or was cancelled.
    pub fn cancel(&self, id: TimerId) -> bool {
        let mut state = self.state.lock();
        state.slots.remove(id.0).is_some()
        // The heap entry stays behind and is skipped as stale on pop.
    }

    /// Fires every timer due at the clock's current reading and returns how
    /// many fired. Wake actions run after the driver lock is dropped, in
    /// deadline-then-schedule order.
    pub fn fire_due(&self) -> usize {
        let now = self.clock.now();
        let due: Vec<TimerWake> = {
            let mut state = self.state.lock();
            let mut due = Vec::new();
            while let Some(top) = state.heap.peek().copied() {
                if !state.slots.contains(top.id.0) {
                    // Stale entry left by a cancel.
                    state.heap.pop();
                    continue;
                }
                if top.deadline > now {
                    break;
                }
                state.heap.pop();
                if let Some(wake) = state.slots.remove(top.id.0) {
                    due.push(wake);
                }
            }
            due
        };
        let count = due.len();
        if count > 0 {
            crate::tracing_compat::trace!(count, now_ms = now.as_millis(), "timers fired");
        }
        for wake in due {
            wake.run();
        }
        count
    }

    /// Returns the earliest live deadline, if any.
    #[must_use]
    pub fn next_deadline(&self) -> Option<Time> {
        let mut state = self.state.lock();
        while let Some(top) = state.heap.peek().copied() {
            if state.slots.contains(top.id.0) {
                return Some(top.deadline);
            }
            state.heap.pop();
        }
        None
    }

    /// Returns the number of live timers.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.state.lock().slots.len()
    }
}

impl std::fmt::Debug for TimerDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TimerDriver")
            .field("clock", &self.clock)
            .field("pending", &self.pending())
            .finish()
    }
}

/// Cheaply cloneable handle to a shared [`TimerDriver`].
#[derive(Clone, Debug)]
pub struct TimerDriverHandle {
    driver: Arc<TimerDriver>,
}

impl TimerDriverHandle {
    /// Creates a driver over the given clock source.
    #[must_use]
    pub fn new(clock: ClockSource) -> Self {
        Self {
            driver: Arc::new(TimerDriver::new(clock)),
        }
    }

    /// Creates a driver over the process monotonic clock.
    #[must_use]
    pub fn monotonic() -> Self {
        Self::new(ClockSource::monotonic())
    }

    /// Creates a driver over a shared virtual clock.
    #[must_use]
    pub fn with_virtual_clock(clock: Arc<VirtualClock>) -> Self {
        Self::new(ClockSource::Virtual(clock))
    }

    /// Returns the clock's current reading.
    #[must_use]
    pub fn now(&self) -> Time {
        self.driver.now()
    }

    /// Returns a future completing after `duration` of driver time.
    #[must_use]
    pub fn sleep(&self, duration: Duration) -> Sleep {
        self.sleep_until(self.now().saturating_add(duration))
    }

    /// Returns a future completing once the clock reaches `deadline`.
    #[must_use]
    pub fn sleep_until(&self, deadline: Time) -> Sleep {
        Sleep {
            driver: self.clone(),
            deadline,
            timer: None,
        }
    }

    /// See [`TimerDriver::schedule_callback`].
    pub fn schedule_callback<F>(&self, deadline: Time, callback: F) -> TimerId
    where
        F: FnOnce() + Send + 'static,
    {
        self.driver.schedule_callback(deadline, callback)
    }

    /// See [`TimerDriver::cancel`].
    pub fn cancel(&self, id: TimerId) -> bool {
        self.driver.cancel(id)
    }

    /// See [`TimerDriver::fire_due`].
    pub fn fire_due(&self) -> usize {
        self.driver.fire_due()
    }

    /// See [`TimerDriver::next_deadline`].
    #[must_use]
    pub fn next_deadline(&self) -> Option<Time> {
        self.driver.next_deadline()
    }

    /// See [`TimerDriver::pending`].
    #[must_use]
    pub fn pending(&self) -> usize {
        self.driver.pending()
    }

    pub(crate) fn update_waker(&self, id: TimerId, waker: &Waker) -> bool {
        self.driver.update_waker(id, waker)
    }

    pub(crate) fn schedule_waker(&self, deadline: Time, waker: Waker) -> TimerId {
        self.driver.schedule_waker(deadline, waker)
    }
}

/// Future returned by [`TimerDriverHandle::sleep`] and
/// [`TimerDriverHandle::sleep_until`].
///
/// Dropping a pending sleep cancels its timer.
#[derive(Debug)]
#[must_use = "sleep does nothing unless polled"]
pub struct Sleep {
    driver: TimerDriverHandle,
    deadline: Time,
    timer: Option<TimerId>,
}

impl Sleep {
    /// Returns the deadline this sleep completes at.
    #[must_use]
    pub fn deadline(&self) -> Time {
        self.deadline
    }
}

impl Future for Sleep {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        if self.driver.now() >= self.deadline {
            if let Some(id) = self.timer.take() {
                self.driver.cancel(id);
            }
            return Poll::Ready(());
        }
        match self.timer {
            Some(id) if self.driver.update_waker(id, cx.waker()) => {}
            _ => {
                let id = self
                    .driver
                    .schedule_waker(self.deadline, cx.waker().clone());
                self.timer = Some(id);
            }
        }
        Poll::Pending
    }
}

impl Drop for Sleep {
    fn drop(&mut self) {
        if let Some(id) = self.timer.take() {
            self.driver.cancel(id);
        }
    }
}
