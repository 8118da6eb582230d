//! Counting concurrency gate.
//!
//! A [`Gate`] mediates acquisition of up to `concurrency` simultaneous
//! permits. Acquirers past the limit queue and are promoted under the
//! configured discipline (FIFO pops the oldest waiter, LIFO the newest).
//! An optional release timeout force-returns permits held too long.
//!
//! # Fairness
//!
//! [`Gate::try_acquire`] succeeds only when a slot is free **and** no waiter
//! is queued: opportunistic acquirers never barge past the queue, even when
//! a free slot exists for a moment.
//!
//! # Release semantics
//!
//! Releasing is keyed by [`PermitId`] through a generational arena, so every
//! release path — permit drop, explicit release, force release, release
//! timer — is idempotent; whichever runs first wins and the rest are no-ops.
//!
//! # Events
//!
//! `lock-acquired` and `lock-released` fire synchronously with the state
//! transition; `error` reports release-timeout handler failures. Listeners
//! run with no gate lock held.
//!
//! # Example
//!
//! ```
//! use taskgate::config::GateOptions;
//! use taskgate::gate::Gate;
//!
//! let gate = Gate::new(GateOptions::new().concurrency(2));
//! let first = gate.try_acquire().expect("slot free");
//! let second = gate.try_acquire().expect("slot free");
//! assert!(gate.try_acquire().is_none());
//! drop(first);
//! assert!(gate.is_available());
//! # drop(second);
//! ```

use crate::config::{GateOptions, PermitHandler, QueueType};
use crate::error::{panic_message, EventError, HandlerErrorCode};
use crate::event::{GateEvent, Listeners, PermitInfo, SubscriptionId};
use crate::time::TimerDriverHandle;
use crate::types::{PermitId, TimerId};
use crate::util::Arena;
use parking_lot::Mutex;
use smallvec::SmallVec;
use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll, Waker};
use std::time::Duration;

/// A record of one held admission slot.
#[derive(Debug)]
struct AcquiredPermit {
    acquired_at: crate::types::Time,
    release_timer: Option<TimerId>,
}

#[derive(Debug)]
struct Waiter {
    id: u64,
    waker: Option<Waker>,
}

#[derive(Debug)]
struct GateState {
    concurrency: usize,
    acquired: Arena<AcquiredPermit>,
    waiting: VecDeque<Waiter>,
    /// Permits assigned by dispatch but not yet picked up by their
    /// [`AcquireFuture`].
    handoffs: HashMap<u64, PermitId>,
    next_waiter_id: u64,
}

/// Deferred side effects of a state transition, run after the lock drops.
enum Effect {
    Emit(GateEvent),
    Wake(Waker),
}

type Effects = SmallVec<[Effect; 4]>;

struct GateCore {
    state: Mutex<GateState>,
    queue_type: QueueType,
    release_timeout: Duration,
    release_timeout_handler: Option<PermitHandler>,
    listeners: Listeners<GateEvent>,
    timer: TimerDriverHandle,
}

impl GateCore {
    fn flush(&self, effects: Effects) {
        for effect in effects {
            match effect {
                Effect::Emit(event) => self.listeners.emit(&event),
                Effect::Wake(waker) => waker.wake(),
            }
        }
    }

    /// Inserts a fresh permit and schedules its release timer.
    fn admit_locked(core: &Arc<Self>, state: &mut GateState, fx: &mut Effects) -> PermitId {
        let now = core.timer.now();
        let id = PermitId(state.acquired.insert(AcquiredPermit {
            acquired_at: now,
            release_timer: None,
        }));
        if core.release_timeout > Duration::ZERO {
            let deadline = now.saturating_add(core.release_timeout);
            let weak = Arc::downgrade(core);
            let timer = core.timer.schedule_callback(deadline, move || {
                if let Some(core) = weak.upgrade() {
                    GateCore::on_release_timeout(&core, id);
                }
            });
            if let Some(permit) = state.acquired.get_mut(id.0) {
                permit.release_timer = Some(timer);
            }
        }
        fx.push(Effect::Emit(GateEvent::Acquired(PermitInfo {
            id,
            acquired_at: now,
        })));
        crate::tracing_compat::trace!(permit = ?id, "permit acquired");
        id
    }

    /// Promotes waiters while slots are free.
    fn dispatch_locked(core: &Arc<Self>, state: &mut GateState, fx: &mut Effects) {
        while state.acquired.len() < state.concurrency {
            let waiter = match core.queue_type {
                QueueType::Fifo => state.waiting.pop_front(),
                QueueType::Lifo => state.waiting.pop_back(),
            };
            let Some(waiter) = waiter else { break };
            let id = Self::admit_locked(core, state, fx);
            state.handoffs.insert(waiter.id, id);
            if let Some(waker) = waiter.waker {
                fx.push(Effect::Wake(waker));
            }
        }
    }

    /// Invokes the release token for `id`. Stale ids are no-ops.
    fn release_permit(core: &Arc<Self>, id: PermitId, timeout_reached: bool) -> bool {
        let mut fx = Effects::new();
        let released = {
            let mut state = core.state.lock();
            match state.acquired.remove(id.0) {
                Some(permit) => {
                    if let Some(timer) = permit.release_timer {
                        core.timer.cancel(timer);
                    }
                    fx.push(Effect::Emit(GateEvent::Released {
                        permit: PermitInfo {
                            id,
                            acquired_at: permit.acquired_at,
                        },
                        timeout_reached,
                    }));
                    Self::dispatch_locked(core, &mut state, &mut fx);
                    true
                }
                None => false,
            }
        };
        if released {
            crate::tracing_compat::trace!(permit = ?id, timeout_reached, "permit released");
        }
        core.flush(fx);
        released
    }

    /// Release-timer fire path. The handler runs before the permit is
    /// released; a handler panic becomes an `error` event and never blocks
    /// the release.
    fn on_release_timeout(core: &Arc<Self>, id: PermitId) {
        let info = {
            let mut state = core.state.lock();
            state.acquired.get_mut(id.0).map(|permit| {
                permit.release_timer = None;
                PermitInfo {
                    id,
                    acquired_at: permit.acquired_at,
                }
            })
        };
        let Some(info) = info else { return };
        if let Some(handler) = &core.release_timeout_handler {
            let handler = Arc::clone(handler);
            if let Err(payload) = catch_unwind(AssertUnwindSafe(|| handler(&info))) {
                core.listeners.emit(&GateEvent::Error(EventError {
                    code: HandlerErrorCode::ReleaseTimeoutHandlerFailure,
                    message: panic_message(payload.as_ref()),
                }));
            }
        }
        Self::release_permit(core, id, true);
    }
}

impl std::fmt::Debug for GateCore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("GateCore")
            .field("concurrency", &state.concurrency)
            .field("acquired", &state.acquired.len())
            .field("waiting", &state.waiting.len())
            .field("queue_type", &self.queue_type)
            .finish()
    }
}

/// Counting lock over admission slots. Cloning shares the same gate.
#[derive(Debug, Clone)]
pub struct Gate {
    core: Arc<GateCore>,
}

impl Gate {
    /// Creates a gate over a fresh monotonic timer driver.
    #[must_use]
    pub fn new(options: GateOptions) -> Self {
        Self::with_timer(options, TimerDriverHandle::monotonic())
    }

    /// Creates a gate over a shared timer driver.
    ///
    /// Invalid option values are coerced to defaults; construction never
    /// fails.
    #[must_use]
    pub fn with_timer(options: GateOptions, timer: TimerDriverHandle) -> Self {
        let options = options.sanitized();
        Self {
            core: Arc::new(GateCore {
                state: Mutex::new(GateState {
                    concurrency: options.concurrency,
                    acquired: Arena::new(),
                    waiting: VecDeque::new(),
                    handoffs: HashMap::new(),
                    next_waiter_id: 0,
                }),
                queue_type: options.queue_type,
                release_timeout: options.release_timeout,
                release_timeout_handler: options.release_timeout_handler,
                listeners: Listeners::new(),
                timer,
            }),
        }
    }

    /// Requests a permit. Never fails; the future completes when a slot is
    /// assigned under the queue discipline.
    ///
    /// The waiter is registered immediately, not on first poll. Dropping the
    /// future before completion removes the waiter (or returns an assigned
    /// but unclaimed permit).
    pub fn acquire(&self) -> AcquireFuture {
        let core = Arc::clone(&self.core);
        let mut fx = Effects::new();
        let waiter_id = {
            let mut state = core.state.lock();
            let waiter_id = state.next_waiter_id;
            state.next_waiter_id += 1;
            state.waiting.push_back(Waiter {
                id: waiter_id,
                waker: None,
            });
            GateCore::dispatch_locked(&core, &mut state, &mut fx);
            waiter_id
        };
        core.flush(fx);
        AcquireFuture {
            core,
            waiter_id,
            finished: false,
        }
    }

    /// Acquires a permit only when a slot is free and no waiter is queued.
    ///
    /// The queue check keeps opportunistic acquirers from barging past
    /// waiters that arrived earlier.
    #[must_use]
    pub fn try_acquire(&self) -> Option<GatePermit> {
        let core = Arc::clone(&self.core);
        let mut fx = Effects::new();
        let id = {
            let mut state = core.state.lock();
            if state.acquired.len() >= state.concurrency || !state.waiting.is_empty() {
                None
            } else {
                Some(GateCore::admit_locked(&core, &mut state, &mut fx))
            }
        };
        core.flush(fx);
        id.map(|id| GatePermit { core, id })
    }

    /// Returns true while fewer than `concurrency` permits are held.
    #[must_use]
    pub fn is_available(&self) -> bool {
        let state = self.core.state.lock();
        state.acquired.len() < state.concurrency
    }

    /// Returns the number of currently held permits.
    #[must_use]
    pub fn acquired_count(&self) -> usize {
        self.core.state.lock().acquired.len()
    }

    /// Returns the number of queued waiters.
    #[must_use]
    pub fn waiting_count(&self) -> usize {
        self.core.state.lock().waiting.len()
    }

    /// Force-releases every currently held permit.
    ///
    /// Snapshots the held set first, then invokes each release token;
    /// permits acquired by waiters promoted during the sweep are untouched.
    pub fn release_acquired(&self) {
        let ids: Vec<PermitId> = {
            let state = self.core.state.lock();
            state.acquired.iter().map(|(idx, _)| PermitId(idx)).collect()
        };
        for id in ids {
            GateCore::release_permit(&self.core, id, false);
        }
    }

    /// Changes the concurrency limit. Zero is ignored.
    ///
    /// Raising the limit promotes waiters into the new slots; lowering it
    /// never evicts holders — the gate drains down naturally.
    pub fn change_concurrency(&self, new_limit: usize) {
        if new_limit == 0 {
            return;
        }
        let mut fx = Effects::new();
        {
            let mut state = self.core.state.lock();
            state.concurrency = new_limit;
            GateCore::dispatch_locked(&self.core, &mut state, &mut fx);
        }
        self.core.flush(fx);
    }

    /// Registers an event listener.
    pub fn subscribe<F>(&self, listener: F) -> SubscriptionId
    where
        F: Fn(&GateEvent) + Send + Sync + 'static,
    {
        self.core.listeners.subscribe(listener)
    }

    /// Removes a listener. Returns false when the id is unknown.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.core.listeners.unsubscribe(id)
    }

    /// Returns a snapshot of the gate's counters.
    #[must_use]
    pub fn stats(&self) -> GateStats {
        let state = self.core.state.lock();
        GateStats {
            concurrency: state.concurrency,
            acquired: state.acquired.len(),
            waiting: state.waiting.len(),
            queue_type: self.core.queue_type,
        }
    }

    /// Claims a slot directly, bypassing the waiting queue and gate events.
    ///
    /// Scheduler hook: the task controller runs its own queue discipline and
    /// event taxonomy upstairs and uses the gate purely as the slot ledger.
    pub(crate) fn claim_slot(&self) -> Option<PermitId> {
        let mut state = self.core.state.lock();
        if state.acquired.len() >= state.concurrency {
            return None;
        }
        let now = self.core.timer.now();
        Some(PermitId(state.acquired.insert(AcquiredPermit {
            acquired_at: now,
            release_timer: None,
        })))
    }

    /// Returns a slot claimed with [`claim_slot`](Self::claim_slot).
    /// Idempotent.
    pub(crate) fn release_slot(&self, id: PermitId) -> bool {
        let mut state = self.core.state.lock();
        match state.acquired.remove(id.0) {
            Some(permit) => {
                if let Some(timer) = permit.release_timer {
                    self.core.timer.cancel(timer);
                }
                true
            }
            None => false,
        }
    }
}

/// Snapshot of a gate's counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct GateStats {
    /// Current concurrency limit.
    pub concurrency: usize,
    /// Permits currently held.
    pub acquired: usize,
    /// Waiters currently queued.
    pub waiting: usize,
    /// Queue discipline.
    pub queue_type: QueueType,
}

/// A held admission slot. Released on drop; all release paths are
/// idempotent.
#[derive(Debug)]
#[must_use = "a permit is released as soon as it is dropped"]
pub struct GatePermit {
    core: Arc<GateCore>,
    id: PermitId,
}

impl GatePermit {
    /// Returns the permit's identifier.
    #[must_use]
    pub fn id(&self) -> PermitId {
        self.id
    }

    /// Releases the permit now. Equivalent to dropping it.
    pub fn release(self) {
        drop(self);
    }
}

impl Drop for GatePermit {
    fn drop(&mut self) {
        GateCore::release_permit(&self.core, self.id, false);
    }
}

/// Future returned by [`Gate::acquire`].
#[must_use = "the gate assigns a permit only to polled or dropped futures"]
pub struct AcquireFuture {
    core: Arc<GateCore>,
    waiter_id: u64,
    finished: bool,
}

impl Future for AcquireFuture {
    type Output = GatePermit;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let ready = {
            let mut state = self.core.state.lock();
            if let Some(id) = state.handoffs.remove(&self.waiter_id) {
                Some(id)
            } else {
                if let Some(waiter) = state
                    .waiting
                    .iter_mut()
                    .find(|waiter| waiter.id == self.waiter_id)
                {
                    match &mut waiter.waker {
                        Some(existing) if existing.will_wake(cx.waker()) => {}
                        slot => *slot = Some(cx.waker().clone()),
                    }
                }
                None
            }
        };
        match ready {
            Some(id) => {
                self.finished = true;
                Poll::Ready(GatePermit {
                    core: Arc::clone(&self.core),
                    id,
                })
            }
            None => Poll::Pending,
        }
    }
}

impl Drop for AcquireFuture {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        let unclaimed = {
            let mut state = self.core.state.lock();
            if let Some(id) = state.handoffs.remove(&self.waiter_id) {
                Some(id)
            } else {
                if let Some(position) = state
                    .waiting
                    .iter()
                    .position(|waiter| waiter.id == self.waiter_id)
                {
                    state.waiting.remove(position);
                }
                None
            }
        };
        // A permit assigned but never claimed must go back, or its slot
        // would leak.
        if let Some(id) = unclaimed {
            GateCore::release_permit(&self.core, id, false);
        }
    }
}

impl std::fmt::Debug for AcquireFuture {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AcquireFuture")
            .field("waiter_id", &self.waiter_id)
            .field("finished", &self.finished)
            .finish()
    }
}
