//! Asynchronous task controller.
//!
//! A [`TaskScheduler`] admits up to `concurrency` tasks at once, queues the
//! rest under the configured discipline, and bounds both phases of a task's
//! life: a **waiting timeout** discards tasks that queue too long and a
//! **release timeout** returns a running task's slot while its code keeps
//! executing (the scheduler never preempts user code — it only stops waiting
//! for it).
//!
//! Submission is eager: `run*` appends the entry to the queue and attempts
//! dispatch in the call itself. The returned future then drives the task's
//! code once admitted and performs the finish transition. Its output is a
//! [`Settled`] — the future itself never fails; task errors and discards
//! both arrive as [`Settled::Rejected`].
//!
//! The scheduler wraps a [`Gate`] as its slot ledger: one gate permit per
//! running task. All controller state sits behind a single mutex; every
//! transition collects its side effects (events, handler invocations, waker
//! calls) under the lock and runs them after the guard drops.
//!
//! # Example
//!
//! ```
//! use taskgate::config::SchedulerOptions;
//! use taskgate::lab::Lab;
//! use taskgate::scheduler::TaskScheduler;
//! use std::convert::Infallible;
//! use std::time::Duration;
//!
//! let lab = Lab::new();
//! let scheduler = TaskScheduler::with_timer(SchedulerOptions::new(), lab.timer());
//! let timer = lab.timer();
//!
//! let outcome = lab.block_on(scheduler.run(move || async move {
//!     timer.sleep(Duration::from_millis(10)).await;
//!     Ok::<_, Infallible>("done")
//! }));
//! assert_eq!(outcome.fulfilled(), Some("done"));
//! ```

use crate::config::{
    GateOptions, QueueType, SchedulerOptions, TaskErrorHandler, TaskHandler, TaskOptions,
};
use crate::error::{panic_message, EventError, HandlerErrorCode, RunError, Settled, TaskError};
use crate::event::{Listeners, SubscriptionId, TaskEvent, TaskInfo};
use crate::gate::Gate;
use crate::signal::AbortSignal;
use crate::time::TimerDriverHandle;
use crate::types::{DiscardReason, PermitId, ReleaseReason, TaskId, Time, TimerId};
use crate::util::Arena;
use parking_lot::Mutex;
use smallvec::SmallVec;
use std::collections::VecDeque;
use std::future::Future;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll, Waker};
use std::time::Duration;

/// Where a task currently is in its life cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    /// Queued, not yet admitted.
    Waiting,
    /// Admitted and holding a gate permit.
    Running,
    /// Slot returned early; user code still executing.
    Expired,
    /// Removed from the queue without running; awaiting collection by the
    /// submitter's future.
    Discarded,
}

#[derive(Debug)]
struct TaskEntry {
    submitted_at: Time,
    phase: Phase,
    options: TaskOptions,
    /// Waker of the submitter's [`RunFuture`].
    waker: Option<Waker>,
    discard_reason: Option<DiscardReason>,
    release_reason: Option<ReleaseReason>,
    waiting_timer: Option<TimerId>,
    release_timer: Option<TimerId>,
    permit: Option<PermitId>,
}

impl TaskEntry {
    fn info(&self, id: TaskId) -> TaskInfo {
        TaskInfo {
            id,
            submitted_at: self.submitted_at,
            discard_reason: self.discard_reason,
            release_reason: self.release_reason,
        }
    }
}

/// Lifetime totals, separate from the point-in-time counters.
#[derive(Debug, Clone, Copy, Default)]
struct Totals {
    submitted: u64,
    finished: u64,
    failed: u64,
    discarded: u64,
}

struct SchedState {
    waiting: VecDeque<TaskId>,
    entries: Arena<TaskEntry>,
    /// Number of entries in [`Phase::Expired`].
    expired: usize,
    totals: Totals,
}

/// Controller-wide defaults, resolved per task as `override ?? default`.
struct Defaults {
    waiting_timeout: Duration,
    waiting_timeout_handler: Option<TaskHandler>,
    release_timeout: Duration,
    release_timeout_handler: Option<TaskHandler>,
    error_handler: Option<TaskErrorHandler>,
    signal: Option<AbortSignal>,
}

/// A user-supplied handler due to run, with the error code reported if it
/// panics.
enum HandlerCall {
    Snapshot {
        handler: TaskHandler,
        info: TaskInfo,
        code: HandlerErrorCode,
    },
    Failure {
        handler: TaskErrorHandler,
        info: TaskInfo,
        error: TaskError,
    },
}

/// Deferred side effects of a transition, run in order after the state lock
/// drops.
enum Effect {
    Emit(TaskEvent),
    Wake(Waker),
    Handler(HandlerCall),
}

type Effects = SmallVec<[Effect; 6]>;

struct SchedCore {
    gate: Gate,
    state: Mutex<SchedState>,
    listeners: Listeners<TaskEvent>,
    timer: TimerDriverHandle,
    queue_type: QueueType,
    defaults: Defaults,
}

impl SchedCore {
    fn flush(&self, effects: Effects) {
        for effect in effects {
            match effect {
                Effect::Emit(event) => self.listeners.emit(&event),
                Effect::Wake(waker) => waker.wake(),
                Effect::Handler(call) => self.run_handler(call),
            }
        }
    }

    /// Runs a user handler guarded; a panic becomes an `error` event and
    /// nothing else.
    fn run_handler(&self, call: HandlerCall) {
        let (result, info, code) = match call {
            HandlerCall::Snapshot {
                handler,
                info,
                code,
            } => (
                catch_unwind(AssertUnwindSafe(|| handler(&info))),
                info,
                code,
            ),
            HandlerCall::Failure {
                handler,
                info,
                error,
            } => (
                catch_unwind(AssertUnwindSafe(|| handler(&info, &error))),
                info,
                HandlerErrorCode::ErrorHandlerFailure,
            ),
        };
        if let Err(payload) = result {
            self.listeners.emit(&TaskEvent::Error(
                info,
                EventError {
                    code,
                    message: panic_message(payload.as_ref()),
                },
            ));
        }
    }

    fn submit(core: &Arc<Self>, options: TaskOptions) -> TaskId {
        let mut fx = Effects::new();
        let id = {
            let mut state = core.state.lock();
            let now = core.timer.now();
            let waiting_timeout = options
                .waiting_timeout
                .unwrap_or(core.defaults.waiting_timeout);
            let id = TaskId(state.entries.insert(TaskEntry {
                submitted_at: now,
                phase: Phase::Waiting,
                options,
                waker: None,
                discard_reason: None,
                release_reason: None,
                waiting_timer: None,
                release_timer: None,
                permit: None,
            }));
            state.waiting.push_back(id);
            state.totals.submitted += 1;
            crate::tracing_compat::debug!(
                task = ?id,
                queued = state.waiting.len(),
                "task submitted"
            );
            if waiting_timeout > Duration::ZERO {
                let deadline = now.saturating_add(waiting_timeout);
                let weak = Arc::downgrade(core);
                let timer = core.timer.schedule_callback(deadline, move || {
                    if let Some(core) = weak.upgrade() {
                        SchedCore::on_waiting_timeout(&core, id);
                    }
                });
                if let Some(entry) = state.entries.get_mut(id.0) {
                    entry.waiting_timer = Some(timer);
                }
            }
            Self::dispatch_locked(core, &mut state, &mut fx);
            id
        };
        core.flush(fx);
        id
    }

    /// Admits waiters while slots are free, skipping aborted entries.
    ///
    /// A loop rather than recursion: a long run of pre-aborted waiters must
    /// not grow the stack.
    fn dispatch_locked(core: &Arc<Self>, state: &mut SchedState, fx: &mut Effects) {
        loop {
            if state.waiting.is_empty() || !core.gate.is_available() {
                break;
            }
            let id = match core.queue_type {
                QueueType::Fifo => state.waiting.pop_front(),
                QueueType::Lifo => state.waiting.pop_back(),
            }
            .expect("queue checked non-empty");
            let Some(entry) = state.entries.get_mut(id.0) else {
                continue;
            };
            if let Some(timer) = entry.waiting_timer.take() {
                core.timer.cancel(timer);
            }
            let signal = entry
                .options
                .signal
                .clone()
                .or_else(|| core.defaults.signal.clone());
            if signal.map_or(false, |signal| signal.aborted()) {
                entry.phase = Phase::Discarded;
                entry.discard_reason = Some(DiscardReason::AbortSignal);
                let info = entry.info(id);
                let waker = entry.waker.take();
                state.totals.discarded += 1;
                crate::tracing_compat::debug!(task = ?id, "task discarded by abort signal");
                fx.push(Effect::Emit(TaskEvent::Discarded(info)));
                if let Some(waker) = waker {
                    fx.push(Effect::Wake(waker));
                }
                continue;
            }
            let Some(permit) = core.gate.claim_slot() else {
                match core.queue_type {
                    QueueType::Fifo => state.waiting.push_front(id),
                    QueueType::Lifo => state.waiting.push_back(id),
                }
                break;
            };
            entry.phase = Phase::Running;
            entry.permit = Some(permit);
            let release_timeout = entry
                .options
                .release_timeout
                .unwrap_or(core.defaults.release_timeout);
            if release_timeout > Duration::ZERO {
                let deadline = core.timer.now().saturating_add(release_timeout);
                let weak = Arc::downgrade(core);
                let timer = core.timer.schedule_callback(deadline, move || {
                    if let Some(core) = weak.upgrade() {
                        SchedCore::on_release_timeout(&core, id);
                    }
                });
                entry.release_timer = Some(timer);
            }
            let info = entry.info(id);
            let waker = entry.waker.take();
            crate::tracing_compat::debug!(task = ?id, "task started");
            fx.push(Effect::Emit(TaskEvent::Started(info)));
            if let Some(waker) = waker {
                fx.push(Effect::Wake(waker));
            }
        }
    }

    /// Waiting-timer fire path. Idempotent with respect to dispatch: an
    /// entry that was already promoted is left alone.
    fn on_waiting_timeout(core: &Arc<Self>, id: TaskId) {
        let mut fx = Effects::new();
        {
            let mut state = core.state.lock();
            let is_waiting = state
                .entries
                .get(id.0)
                .map_or(false, |entry| entry.phase == Phase::Waiting);
            if !is_waiting {
                return;
            }
            if let Some(position) = state.waiting.iter().position(|task| *task == id) {
                state.waiting.remove(position);
            }
            let Some(entry) = state.entries.get_mut(id.0) else {
                return;
            };
            entry.waiting_timer = None;
            entry.phase = Phase::Discarded;
            entry.discard_reason = Some(DiscardReason::TimeoutReached);
            let info = entry.info(id);
            let waker = entry.waker.take();
            let handler = entry
                .options
                .waiting_timeout_handler
                .clone()
                .or_else(|| core.defaults.waiting_timeout_handler.clone());
            state.totals.discarded += 1;
            crate::tracing_compat::debug!(task = ?id, "task discarded by waiting timeout");
            fx.push(Effect::Emit(TaskEvent::Discarded(info.clone())));
            if let Some(handler) = handler {
                fx.push(Effect::Handler(HandlerCall::Snapshot {
                    handler,
                    info,
                    code: HandlerErrorCode::WaitingTimeoutHandlerFailure,
                }));
            }
            if let Some(waker) = waker {
                fx.push(Effect::Wake(waker));
            }
        }
        core.flush(fx);
    }

    /// Moves a running entry to expired: the slot is returned and the next
    /// waiter dispatched while the entry's user code keeps executing.
    ///
    /// Pushes the `task-released-before-finished` event and any `Started`
    /// events from the follow-up dispatch; the caller appends the handler
    /// effect afterwards, so the slot is observably free before the handler
    /// runs.
    fn expire_running_locked(
        core: &Arc<Self>,
        state: &mut SchedState,
        id: TaskId,
        reason: ReleaseReason,
        fx: &mut Effects,
    ) -> Option<TaskInfo> {
        let is_running = state
            .entries
            .get(id.0)
            .map_or(false, |entry| entry.phase == Phase::Running);
        if !is_running {
            return None;
        }
        let entry = state.entries.get_mut(id.0)?;
        if let Some(timer) = entry.release_timer.take() {
            core.timer.cancel(timer);
        }
        entry.phase = Phase::Expired;
        entry.release_reason = Some(reason);
        let permit = entry.permit.take();
        let info = entry.info(id);
        state.expired += 1;
        if let Some(permit) = permit {
            core.gate.release_slot(permit);
        }
        crate::tracing_compat::debug!(task = ?id, reason = reason.as_str(), "task released before finished");
        fx.push(Effect::Emit(TaskEvent::ReleasedBeforeFinished(info.clone())));
        Self::dispatch_locked(core, state, fx);
        Some(info)
    }

    /// Release-timer fire path.
    fn on_release_timeout(core: &Arc<Self>, id: TaskId) {
        let mut fx = Effects::new();
        {
            let mut state = core.state.lock();
            let handler = state.entries.get(id.0).and_then(|entry| {
                entry
                    .options
                    .release_timeout_handler
                    .clone()
                    .or_else(|| core.defaults.release_timeout_handler.clone())
            });
            let Some(info) =
                Self::expire_running_locked(core, &mut state, id, ReleaseReason::TimeoutReached, &mut fx)
            else {
                return;
            };
            if let Some(handler) = handler {
                fx.push(Effect::Handler(HandlerCall::Snapshot {
                    handler,
                    info,
                    code: HandlerErrorCode::ReleaseTimeoutHandlerFailure,
                }));
            }
        }
        core.flush(fx);
    }

    /// Finish transition, driven by the submitter's future once the user
    /// code returned.
    fn finish(core: &Arc<Self>, id: TaskId, failure: Option<TaskError>) {
        let mut fx = Effects::new();
        {
            let mut state = core.state.lock();
            let Some(phase) = state.entries.get(id.0).map(|entry| entry.phase) else {
                return;
            };
            let Some(entry) = state.entries.remove(id.0) else {
                return;
            };
            match phase {
                Phase::Running => {
                    if let Some(timer) = entry.release_timer {
                        core.timer.cancel(timer);
                    }
                    if let Some(permit) = entry.permit {
                        core.gate.release_slot(permit);
                    }
                }
                Phase::Expired => {
                    state.expired -= 1;
                }
                // The wrapper only finishes tasks it started.
                Phase::Waiting | Phase::Discarded => {}
            }
            let info = TaskInfo {
                id,
                submitted_at: entry.submitted_at,
                discard_reason: entry.discard_reason,
                release_reason: entry.release_reason,
            };
            if let Some(error) = failure {
                let handler = entry
                    .options
                    .error_handler
                    .clone()
                    .or_else(|| core.defaults.error_handler.clone());
                state.totals.failed += 1;
                crate::tracing_compat::debug!(task = ?id, error = %error, "task failed");
                fx.push(Effect::Emit(TaskEvent::Failure(info.clone(), error.clone())));
                if let Some(handler) = handler {
                    fx.push(Effect::Handler(HandlerCall::Failure {
                        handler,
                        info: info.clone(),
                        error,
                    }));
                }
            }
            state.totals.finished += 1;
            crate::tracing_compat::debug!(task = ?id, "task finished");
            fx.push(Effect::Emit(TaskEvent::Finished(info)));
            if phase == Phase::Running {
                Self::dispatch_locked(core, &mut state, &mut fx);
            }
        }
        core.flush(fx);
    }
}

impl std::fmt::Debug for SchedCore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("SchedCore")
            .field("waiting", &state.waiting.len())
            .field("running", &self.gate.acquired_count())
            .field("expired", &state.expired)
            .field("queue_type", &self.queue_type)
            .finish()
    }
}

/// Asynchronous task controller over a [`Gate`]. Cloning shares the same
/// controller.
#[derive(Debug, Clone)]
pub struct TaskScheduler {
    core: Arc<SchedCore>,
}

impl TaskScheduler {
    /// Creates a scheduler over a fresh monotonic timer driver.
    #[must_use]
    pub fn new(options: SchedulerOptions) -> Self {
        Self::with_timer(options, TimerDriverHandle::monotonic())
    }

    /// Creates a scheduler over a shared timer driver.
    ///
    /// Invalid option values are coerced to defaults; construction never
    /// fails.
    #[must_use]
    pub fn with_timer(options: SchedulerOptions, timer: TimerDriverHandle) -> Self {
        let options = options.sanitized();
        // The inner gate is the slot ledger only: the scheduler runs its own
        // queue discipline and release timers, so the gate gets neither a
        // release timeout nor a handler.
        let gate = Gate::with_timer(
            GateOptions::new()
                .concurrency(options.gate.concurrency)
                .queue_type(options.gate.queue_type),
            timer.clone(),
        );
        Self {
            core: Arc::new(SchedCore {
                gate,
                state: Mutex::new(SchedState {
                    waiting: VecDeque::new(),
                    entries: Arena::new(),
                    expired: 0,
                    totals: Totals::default(),
                }),
                listeners: Listeners::new(),
                timer,
                queue_type: options.gate.queue_type,
                defaults: Defaults {
                    waiting_timeout: options.waiting_timeout,
                    waiting_timeout_handler: options.waiting_timeout_handler,
                    release_timeout: options.gate.release_timeout,
                    release_timeout_handler: options.release_timeout_handler,
                    error_handler: options.error_handler,
                    signal: options.signal,
                },
            }),
        }
    }

    /// Submits a task with controller-default options.
    ///
    /// The entry is queued and dispatch attempted in this call; the returned
    /// future drives the task's code once admitted and resolves to its
    /// [`Settled`] outcome.
    pub fn run<F, Fut, T, E>(&self, task: F) -> RunFuture<F, Fut>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::error::Error + Send + Sync + 'static,
    {
        self.run_with_options(TaskOptions::new(), task)
    }

    /// Submits a task with per-task overrides.
    ///
    /// Overrides are snapshotted now; later changes to the caller's copy
    /// have no effect on this task.
    pub fn run_with_options<F, Fut, T, E>(&self, options: TaskOptions, task: F) -> RunFuture<F, Fut>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::error::Error + Send + Sync + 'static,
    {
        let id = SchedCore::submit(&self.core, options);
        RunFuture {
            core: Arc::clone(&self.core),
            id,
            task: Some(Box::new(task)),
            fut: None,
            done: false,
        }
    }

    /// Submits every task, in order, before any of them is awaited; the
    /// returned future resolves to their outcomes in submission order.
    pub fn run_many<F, Fut, T, E>(&self, tasks: impl IntoIterator<Item = F>) -> RunMany<F, Fut, T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::error::Error + Send + Sync + 'static,
    {
        RunMany::new(tasks.into_iter().map(|task| self.run(task)).collect())
    }

    /// As [`run_many`](Self::run_many), with per-task overrides.
    pub fn run_many_with_options<F, Fut, T, E>(
        &self,
        tasks: impl IntoIterator<Item = (TaskOptions, F)>,
    ) -> RunMany<F, Fut, T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::error::Error + Send + Sync + 'static,
    {
        RunMany::new(
            tasks
                .into_iter()
                .map(|(options, task)| self.run_with_options(options, task))
                .collect(),
        )
    }

    /// Submits one task per argument tuple; `task` is invoked with each
    /// argument once its entry is admitted.
    pub fn run_for_each_args<A, F, Fut, T, E>(
        &self,
        args: impl IntoIterator<Item = A>,
        task: F,
    ) -> RunMany<impl FnOnce() -> Fut, Fut, T>
    where
        F: Fn(A) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::error::Error + Send + Sync + 'static,
    {
        let task = Arc::new(task);
        RunMany::new(
            args.into_iter()
                .map(|arg| {
                    let task = Arc::clone(&task);
                    self.run(move || (task)(arg))
                })
                .collect(),
        )
    }

    /// Submits one task per entity. Alias of
    /// [`run_for_each_args`](Self::run_for_each_args) with entity semantics.
    pub fn run_for_each<A, F, Fut, T, E>(
        &self,
        entities: impl IntoIterator<Item = A>,
        task: F,
    ) -> RunMany<impl FnOnce() -> Fut, Fut, T>
    where
        F: Fn(A) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::error::Error + Send + Sync + 'static,
    {
        self.run_for_each_args(entities, task)
    }

    /// Submits `task` only when a slot is free **and** the waiting queue is
    /// empty, mirroring [`Gate::try_acquire`]: opportunistic submissions
    /// never barge past queued tasks. `Err` hands the task back untouched.
    pub fn try_run<F, Fut, T, E>(&self, task: F) -> Result<RunFuture<F, Fut>, F>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::error::Error + Send + Sync + 'static,
    {
        let available = {
            let state = self.core.state.lock();
            state.waiting.is_empty() && self.core.gate.is_available()
        };
        if available {
            Ok(self.run(task))
        } else {
            Err(task)
        }
    }

    /// Force-releases the slot of every running task (reason `forced`).
    ///
    /// Snapshots the running set first; tasks admitted into the freed slots
    /// during the sweep are untouched. User code keeps executing; each
    /// affected task moves to expired until it returns.
    pub fn release_running_tasks(&self) {
        let mut fx = Effects::new();
        {
            let mut state = self.core.state.lock();
            let running: Vec<TaskId> = state
                .entries
                .iter()
                .filter(|(_, entry)| entry.phase == Phase::Running)
                .map(|(index, _)| TaskId(index))
                .collect();
            for id in running {
                SchedCore::expire_running_locked(
                    &self.core,
                    &mut state,
                    id,
                    ReleaseReason::Forced,
                    &mut fx,
                );
            }
        }
        self.core.flush(fx);
    }

    /// Discards every waiting task (reason `forced`). Running tasks are
    /// untouched.
    pub fn flush_pending_tasks(&self) {
        let mut fx = Effects::new();
        {
            let mut state = self.core.state.lock();
            let drained: Vec<TaskId> = state.waiting.drain(..).collect();
            for id in drained {
                let Some(entry) = state.entries.get_mut(id.0) else {
                    continue;
                };
                if let Some(timer) = entry.waiting_timer.take() {
                    self.core.timer.cancel(timer);
                }
                entry.phase = Phase::Discarded;
                entry.discard_reason = Some(DiscardReason::Forced);
                let info = entry.info(id);
                let waker = entry.waker.take();
                state.totals.discarded += 1;
                fx.push(Effect::Emit(TaskEvent::Discarded(info)));
                if let Some(waker) = waker {
                    fx.push(Effect::Wake(waker));
                }
            }
        }
        self.core.flush(fx);
    }

    /// Returns true while fewer than `concurrency` tasks hold slots.
    #[must_use]
    pub fn is_available(&self) -> bool {
        self.core.gate.is_available()
    }

    /// Number of tasks queued for admission.
    #[must_use]
    pub fn waiting_tasks(&self) -> usize {
        self.core.state.lock().waiting.len()
    }

    /// Number of tasks holding slots.
    #[must_use]
    pub fn running_tasks(&self) -> usize {
        self.core.gate.acquired_count()
    }

    /// Number of tasks whose slot was returned while their code still runs.
    #[must_use]
    pub fn expired_tasks(&self) -> usize {
        self.core.state.lock().expired
    }

    /// Changes the concurrency limit. Zero is ignored.
    ///
    /// Raising the limit dispatches newly admitted waiters; lowering it
    /// never evicts running tasks — the controller drains down naturally.
    pub fn change_concurrent_limit(&self, new_limit: usize) {
        if new_limit == 0 {
            return;
        }
        self.core.gate.change_concurrency(new_limit);
        let mut fx = Effects::new();
        {
            let mut state = self.core.state.lock();
            SchedCore::dispatch_locked(&self.core, &mut state, &mut fx);
        }
        self.core.flush(fx);
    }

    /// Registers an event listener.
    pub fn subscribe<F>(&self, listener: F) -> SubscriptionId
    where
        F: Fn(&TaskEvent) + Send + Sync + 'static,
    {
        self.core.listeners.subscribe(listener)
    }

    /// Removes a listener. Returns false when the id is unknown.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.core.listeners.unsubscribe(id)
    }

    /// Returns a snapshot of counters and lifetime totals.
    #[must_use]
    pub fn stats(&self) -> SchedulerStats {
        let gate = self.core.gate.stats();
        let state = self.core.state.lock();
        SchedulerStats {
            concurrency: gate.concurrency,
            queue_type: gate.queue_type,
            waiting: state.waiting.len(),
            running: gate.acquired,
            expired: state.expired,
            submitted: state.totals.submitted,
            finished: state.totals.finished,
            failed: state.totals.failed,
            discarded: state.totals.discarded,
        }
    }
}

/// Snapshot of a scheduler's counters and lifetime totals.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct SchedulerStats {
    /// Current concurrency limit.
    pub concurrency: usize,
    /// Queue discipline.
    pub queue_type: QueueType,
    /// Tasks queued for admission.
    pub waiting: usize,
    /// Tasks holding slots.
    pub running: usize,
    /// Tasks whose slot was returned while their code still runs.
    pub expired: usize,
    /// Tasks ever submitted.
    pub submitted: u64,
    /// Tasks whose code returned, successes and failures alike.
    pub finished: u64,
    /// Subset of `finished` that returned an error.
    pub failed: u64,
    /// Tasks discarded without running.
    pub discarded: u64,
}

/// Future returned by the single-task `run*` methods.
///
/// Resolves to the task's [`Settled`] outcome and never fails. Dropping it
/// while the task waits removes the entry silently; dropping it while the
/// task runs abandons the user code and returns the slot without emitting
/// `task-finished` (host-level cancellation, outside the event contract).
#[must_use = "the task's code only runs while this future is polled"]
pub struct RunFuture<F, Fut> {
    core: Arc<SchedCore>,
    id: TaskId,
    task: Option<Box<F>>,
    fut: Option<Pin<Box<Fut>>>,
    done: bool,
}

impl<F, Fut> RunFuture<F, Fut> {
    /// The submitted task's identifier.
    #[must_use]
    pub fn task_id(&self) -> TaskId {
        self.id
    }
}

enum Step {
    Start,
    Discarded(DiscardReason),
    Pending,
}

impl<F, Fut, T, E> Future for RunFuture<F, Fut>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::error::Error + Send + Sync + 'static,
{
    type Output = Settled<T>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        assert!(!this.done, "RunFuture polled after completion");
        loop {
            if let Some(fut) = this.fut.as_mut() {
                return match fut.as_mut().poll(cx) {
                    Poll::Ready(output) => {
                        this.fut = None;
                        this.done = true;
                        let settled = match output {
                            Ok(value) => {
                                SchedCore::finish(&this.core, this.id, None);
                                Settled::Fulfilled(value)
                            }
                            Err(error) => {
                                let shared: TaskError = Arc::new(error);
                                SchedCore::finish(&this.core, this.id, Some(Arc::clone(&shared)));
                                Settled::Rejected(RunError::Failed(shared))
                            }
                        };
                        Poll::Ready(settled)
                    }
                    Poll::Pending => Poll::Pending,
                };
            }
            let step = {
                let mut state = this.core.state.lock();
                let snapshot = state
                    .entries
                    .get(this.id.0)
                    .map(|entry| (entry.phase, entry.discard_reason));
                match snapshot {
                    // The entry is gone without this future having consumed
                    // it; treat as a forced discard.
                    None => Step::Discarded(DiscardReason::Forced),
                    Some((Phase::Waiting, _)) => {
                        if let Some(entry) = state.entries.get_mut(this.id.0) {
                            entry.waker = Some(cx.waker().clone());
                        }
                        Step::Pending
                    }
                    Some((Phase::Discarded, reason)) => {
                        state.entries.remove(this.id.0);
                        Step::Discarded(reason.unwrap_or(DiscardReason::Forced))
                    }
                    Some((Phase::Running | Phase::Expired, _)) => Step::Start,
                }
            };
            match step {
                Step::Start => {
                    let task = this.task.take().expect("task invoked exactly once");
                    this.fut = Some(Box::pin((*task)()));
                }
                Step::Discarded(reason) => {
                    this.done = true;
                    return Poll::Ready(Settled::Rejected(RunError::Discarded(reason)));
                }
                Step::Pending => return Poll::Pending,
            }
        }
    }
}

impl<F, Fut> Drop for RunFuture<F, Fut> {
    fn drop(&mut self) {
        if self.done {
            return;
        }
        let mut fx = Effects::new();
        {
            let mut state = self.core.state.lock();
            let Some(phase) = state.entries.get(self.id.0).map(|entry| entry.phase) else {
                return;
            };
            match phase {
                Phase::Waiting => {
                    if let Some(position) =
                        state.waiting.iter().position(|task| *task == self.id)
                    {
                        state.waiting.remove(position);
                    }
                    if let Some(entry) = state.entries.remove(self.id.0) {
                        if let Some(timer) = entry.waiting_timer {
                            self.core.timer.cancel(timer);
                        }
                    }
                }
                Phase::Discarded => {
                    state.entries.remove(self.id.0);
                }
                Phase::Running => {
                    if let Some(entry) = state.entries.remove(self.id.0) {
                        if let Some(timer) = entry.release_timer {
                            self.core.timer.cancel(timer);
                        }
                        if let Some(permit) = entry.permit {
                            self.core.gate.release_slot(permit);
                        }
                        SchedCore::dispatch_locked(&self.core, &mut state, &mut fx);
                    }
                }
                Phase::Expired => {
                    state.expired -= 1;
                    state.entries.remove(self.id.0);
                }
            }
        }
        self.core.flush(fx);
    }
}

impl<F, Fut> std::fmt::Debug for RunFuture<F, Fut> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunFuture")
            .field("task", &self.id)
            .field("done", &self.done)
            .finish()
    }
}

/// Future returned by the batch `run*` methods. Resolves to the outcomes of
/// all submitted tasks in submission order.
#[must_use = "the tasks' code only runs while this future is polled"]
pub struct RunMany<F, Fut, T> {
    futures: Vec<Option<RunFuture<F, Fut>>>,
    results: Vec<Option<Settled<T>>>,
    remaining: usize,
}

impl<F, Fut, T> RunMany<F, Fut, T> {
    fn new(futures: Vec<RunFuture<F, Fut>>) -> Self {
        let remaining = futures.len();
        let mut results = Vec::with_capacity(remaining);
        results.resize_with(remaining, || None);
        Self {
            futures: futures.into_iter().map(Some).collect(),
            results,
            remaining,
        }
    }
}

impl<F, Fut, T> Unpin for RunMany<F, Fut, T> {}

impl<F, Fut, T, E> Future for RunMany<F, Fut, T>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::error::Error + Send + Sync + 'static,
{
    type Output = Vec<Settled<T>>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        for index in 0..this.futures.len() {
            if let Some(future) = this.futures[index].as_mut() {
                if let Poll::Ready(settled) = Pin::new(future).poll(cx) {
                    this.futures[index] = None;
                    this.results[index] = Some(settled);
                    this.remaining -= 1;
                }
            }
        }
        if this.remaining == 0 {
            let results = this
                .results
                .drain(..)
                .map(|slot| slot.expect("every task recorded an outcome"))
                .collect();
            Poll::Ready(results)
        } else {
            Poll::Pending
        }
    }
}

impl<F, Fut, T> std::fmt::Debug for RunMany<F, Fut, T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunMany")
            .field("total", &self.futures.len())
            .field("remaining", &self.remaining)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lab::Lab;
    use std::convert::Infallible;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn lab_scheduler(options: SchedulerOptions) -> (Lab, TaskScheduler) {
        let lab = Lab::new();
        let scheduler = TaskScheduler::with_timer(options, lab.timer());
        (lab, scheduler)
    }

    type BoxedTask =
        Pin<Box<dyn Future<Output = Result<&'static str, std::convert::Infallible>>>>;

    /// Sleep `millis` of virtual time, record `label`, return it. Every call
    /// yields the same closure type, so batches mix freely.
    fn recording_task(
        lab: &Lab,
        order: &Arc<Mutex<Vec<&'static str>>>,
        label: &'static str,
        millis: u64,
    ) -> impl FnOnce() -> BoxedTask {
        let timer = lab.timer();
        let order = Arc::clone(order);
        move || {
            Box::pin(async move {
                timer.sleep(Duration::from_millis(millis)).await;
                order.lock().push(label);
                Ok(label)
            })
        }
    }

    fn event_log(scheduler: &TaskScheduler) -> Arc<Mutex<Vec<String>>> {
        let log = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&log);
        scheduler.subscribe(move |event: &TaskEvent| {
            sink.lock().push(event.name().to_owned());
        });
        log
    }

    #[test]
    fn single_task_runs_to_fulfilled() {
        let (lab, scheduler) = lab_scheduler(SchedulerOptions::new());
        let log = event_log(&scheduler);
        let timer = lab.timer();

        let outcome = lab.block_on(scheduler.run(move || async move {
            timer.sleep(Duration::from_millis(5)).await;
            Ok::<_, Infallible>(42)
        }));

        assert_eq!(outcome.fulfilled(), Some(42));
        assert_eq!(*log.lock(), vec!["task-started", "task-finished"]);
        assert_eq!(scheduler.running_tasks(), 0);
        assert_eq!(scheduler.waiting_tasks(), 0);
    }

    #[test]
    fn failing_task_rejects_and_reports() {
        let (lab, scheduler) = lab_scheduler(SchedulerOptions::new());
        let log = event_log(&scheduler);

        let outcome = lab.block_on(scheduler.run(|| async {
            Err::<u32, _>(std::io::Error::new(std::io::ErrorKind::Other, "boom"))
        }));

        assert!(matches!(
            outcome,
            Settled::Rejected(RunError::Failed(ref error)) if error.to_string() == "boom"
        ));
        assert_eq!(
            *log.lock(),
            vec!["task-started", "task-failure", "task-finished"]
        );
        let stats = scheduler.stats();
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.finished, 1);
    }

    #[test]
    fn error_handler_receives_failure() {
        let seen = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&seen);
        let (lab, scheduler) = lab_scheduler(
            SchedulerOptions::new().on_error(move |_, _| {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        );

        let _ = lab.block_on(scheduler.run(|| async {
            Err::<(), _>(std::io::Error::new(std::io::ErrorKind::Other, "boom"))
        }));
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn queue_limits_concurrency_to_one() {
        let (lab, scheduler) = lab_scheduler(SchedulerOptions::new());
        let order = Arc::new(Mutex::new(Vec::new()));

        let outcomes = lab.block_on(scheduler.run_many(vec![
            recording_task(&lab, &order, "a", 30),
            recording_task(&lab, &order, "b", 20),
            recording_task(&lab, &order, "c", 10),
        ]));

        assert_eq!(outcomes.len(), 3);
        assert!(outcomes.iter().all(Settled::is_fulfilled));
        assert_eq!(*order.lock(), vec!["a", "b", "c"]);
    }

    #[test]
    fn waiting_timeout_discards_queued_task() {
        let (lab, scheduler) =
            lab_scheduler(SchedulerOptions::new().waiting_timeout(Duration::from_millis(30)));
        let log = event_log(&scheduler);
        let order = Arc::new(Mutex::new(Vec::new()));

        let outcomes = lab.block_on(scheduler.run_many(vec![
            recording_task(&lab, &order, "a", 100),
            recording_task(&lab, &order, "b", 100),
        ]));
        assert!(outcomes[0].is_fulfilled());
        assert!(matches!(
            outcomes[1],
            Settled::Rejected(RunError::Discarded(DiscardReason::TimeoutReached))
        ));
        assert_eq!(*order.lock(), vec!["a"]);
        assert_eq!(
            *log.lock(),
            vec!["task-started", "task-discarded", "task-finished"]
        );
    }

    #[test]
    fn per_task_override_beats_controller_default() {
        let (lab, scheduler) =
            lab_scheduler(SchedulerOptions::new().waiting_timeout(Duration::from_millis(30)));
        let order = Arc::new(Mutex::new(Vec::new()));

        // Waiting timeout disabled for the second task only; it outlives the
        // controller default and still runs.
        let outcomes = lab.block_on(scheduler.run_many_with_options(vec![
            (TaskOptions::new(), recording_task(&lab, &order, "a", 100)),
            (
                TaskOptions::new().waiting_timeout(Duration::ZERO),
                recording_task(&lab, &order, "b", 10),
            ),
        ]));
        assert!(outcomes[0].is_fulfilled());
        assert!(outcomes[1].is_fulfilled());
        assert_eq!(*order.lock(), vec!["a", "b"]);
    }

    #[test]
    fn release_timeout_frees_slot_while_code_runs() {
        let (lab, scheduler) =
            lab_scheduler(SchedulerOptions::new().release_timeout(Duration::from_millis(50)));
        let log = event_log(&scheduler);
        let timer = lab.timer();

        let scheduler_probe = scheduler.clone();
        let probe = Arc::new(Mutex::new(Vec::new()));
        let probe_sink = Arc::clone(&probe);

        let outcome = lab.block_on(scheduler.run(move || {
            let timer = timer.clone();
            async move {
                timer.sleep(Duration::from_millis(200)).await;
                // By now the release timer fired long ago.
                probe_sink.lock().push((
                    scheduler_probe.running_tasks(),
                    scheduler_probe.expired_tasks(),
                ));
                Ok::<_, Infallible>(())
            }
        }));

        assert!(outcome.is_fulfilled());
        assert_eq!(*probe.lock(), vec![(0, 1)]);
        assert_eq!(
            *log.lock(),
            vec![
                "task-started",
                "task-released-before-finished",
                "task-finished"
            ]
        );
        assert_eq!(scheduler.expired_tasks(), 0);
    }

    #[test]
    fn abort_signal_discards_queued_not_running() {
        let controller = crate::signal::AbortController::new();
        let (lab, scheduler) =
            lab_scheduler(SchedulerOptions::new().signal(controller.signal()));
        let log = event_log(&scheduler);
        let order = Arc::new(Mutex::new(Vec::new()));

        // The flag flips at 15ms, while "a" is still running and "b" is
        // still queued.
        lab.timer()
            .schedule_callback(crate::types::Time::from_millis(15), move || {
                controller.abort();
            });

        let outcomes = lab.block_on(scheduler.run_many(vec![
            recording_task(&lab, &order, "a", 20),
            recording_task(&lab, &order, "b", 100),
        ]));
        assert!(outcomes[0].is_fulfilled());
        assert!(matches!(
            outcomes[1],
            Settled::Rejected(RunError::Discarded(DiscardReason::AbortSignal))
        ));
        assert_eq!(*order.lock(), vec!["a"]);
        // The dispatch that discards "b" runs inside "a"'s finish
        // transition, after the finish event.
        assert_eq!(
            *log.lock(),
            vec!["task-started", "task-finished", "task-discarded"]
        );
    }

    #[test]
    fn try_run_refuses_when_busy_or_queued() {
        let (lab, scheduler) = lab_scheduler(SchedulerOptions::new());
        let timer = lab.timer();

        let blocker = scheduler.run({
            let timer = timer.clone();
            move || async move {
                timer.sleep(Duration::from_millis(50)).await;
                Ok::<_, Infallible>(())
            }
        });
        // Slot taken: try_run must hand the task back.
        let refused = scheduler.try_run(|| async { Ok::<_, Infallible>(()) });
        assert!(refused.is_err());

        let outcome = lab.block_on(blocker);
        assert!(outcome.is_fulfilled());

        // Slot free and queue empty again.
        let accepted = scheduler.try_run(|| async { Ok::<_, Infallible>(()) });
        assert!(accepted.is_ok());
        let outcome = lab.block_on(accepted.unwrap_or_else(|_| unreachable!()));
        assert!(outcome.is_fulfilled());
    }

    #[test]
    fn flush_pending_discards_only_queued() {
        let (lab, scheduler) = lab_scheduler(SchedulerOptions::new());
        let log = event_log(&scheduler);
        let timer = lab.timer();

        let running = scheduler.run({
            let timer = timer.clone();
            move || async move {
                timer.sleep(Duration::from_millis(10)).await;
                Ok::<_, Infallible>("ran")
            }
        });
        let queued = scheduler.run(|| async { Ok::<_, Infallible>("never") });

        scheduler.flush_pending_tasks();
        // A second flush has nothing left to discard.
        scheduler.flush_pending_tasks();

        let first = lab.block_on(running);
        let second = lab.block_on(queued);
        assert!(first.is_fulfilled());
        assert!(matches!(
            second,
            Settled::Rejected(RunError::Discarded(DiscardReason::Forced))
        ));
        let events = log.lock().clone();
        assert_eq!(
            events
                .iter()
                .filter(|name| name.as_str() == "task-discarded")
                .count(),
            1
        );
    }

    #[test]
    fn release_running_tasks_on_idle_controller_is_silent() {
        let (_lab, scheduler) = lab_scheduler(SchedulerOptions::new());
        let log = event_log(&scheduler);
        scheduler.release_running_tasks();
        assert!(log.lock().is_empty());
        assert_eq!(scheduler.expired_tasks(), 0);
    }

    #[test]
    fn change_concurrent_limit_admits_waiters() {
        let (lab, scheduler) = lab_scheduler(SchedulerOptions::new());
        let started = Arc::new(AtomicUsize::new(0));
        let timer = lab.timer();

        let task = |millis: u64| {
            let timer = timer.clone();
            let started = Arc::clone(&started);
            move || {
                let timer = timer.clone();
                started.fetch_add(1, Ordering::SeqCst);
                async move {
                    timer.sleep(Duration::from_millis(millis)).await;
                    Ok::<_, Infallible>(())
                }
            }
        };

        let batch = scheduler.run_many(vec![task(50), task(50), task(50)]);
        scheduler.change_concurrent_limit(0); // ignored
        assert_eq!(scheduler.stats().concurrency, 1);
        scheduler.change_concurrent_limit(3);

        let outcomes = lab.block_on(batch);
        assert!(outcomes.iter().all(Settled::is_fulfilled));
        assert_eq!(scheduler.stats().concurrency, 3);
    }

    #[test]
    fn waiting_timeout_handler_panic_emits_error_event() {
        let (lab, scheduler) = lab_scheduler(
            SchedulerOptions::new()
                .waiting_timeout(Duration::from_millis(10))
                .on_waiting_timeout(|_| panic!("waiting handler exploded")),
        );
        let errors = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&errors);
        scheduler.subscribe(move |event: &TaskEvent| {
            if let TaskEvent::Error(_, error) = event {
                sink.lock().push(error.code);
            }
        });
        let order = Arc::new(Mutex::new(Vec::new()));

        let outcomes = lab.block_on(scheduler.run_many(vec![
            recording_task(&lab, &order, "blocker", 50),
            recording_task(&lab, &order, "starved", 5),
        ]));
        assert!(outcomes[0].is_fulfilled());
        assert!(outcomes[1].is_rejected());
        assert_eq!(
            *errors.lock(),
            vec![HandlerErrorCode::WaitingTimeoutHandlerFailure]
        );
    }

    #[test]
    fn stats_track_lifetime_totals() {
        let (lab, scheduler) = lab_scheduler(SchedulerOptions::new());

        let ok = move || async move { Ok::<_, std::io::Error>(()) };
        let fail = move || async move {
            Err::<(), _>(std::io::Error::new(std::io::ErrorKind::Other, "boom"))
        };

        let outcomes = lab.block_on(scheduler.run_many(vec![ok]));
        assert!(outcomes[0].is_fulfilled());
        let outcomes = lab.block_on(scheduler.run_many(vec![fail]));
        assert!(outcomes[0].is_rejected());

        let stats = scheduler.stats();
        assert_eq!(stats.submitted, 2);
        assert_eq!(stats.finished, 2);
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.discarded, 0);
        assert_eq!(stats.waiting, 0);
        assert_eq!(stats.running, 0);
    }

    #[test]
    fn dropping_pending_run_future_removes_entry() {
        let (lab, scheduler) = lab_scheduler(SchedulerOptions::new());
        let timer = lab.timer();

        let blocker = scheduler.run({
            let timer = timer.clone();
            move || async move {
                timer.sleep(Duration::from_millis(10)).await;
                Ok::<_, Infallible>(())
            }
        });
        let queued = scheduler.run(|| async { Ok::<_, Infallible>(()) });
        assert_eq!(scheduler.waiting_tasks(), 1);

        drop(queued);
        assert_eq!(scheduler.waiting_tasks(), 0);

        let outcome = lab.block_on(blocker);
        assert!(outcome.is_fulfilled());
    }
}
