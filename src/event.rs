//! Lifecycle events and the observer registry.
//!
//! Events are typed enums whose [`name`](GateEvent::name) methods return the
//! stable wire names (`lock-acquired`, `task-started`, ...). Emission is
//! synchronous relative to the state transition that produced the event, but
//! listeners are always called with no controller lock held: transitions
//! collect their events under the lock and flush them after the guard drops,
//! so a listener may freely re-enter the controller.

use crate::error::{EventError, TaskError};
use crate::types::{DiscardReason, PermitId, ReleaseReason, TaskId, Time};
use parking_lot::Mutex;
use smallvec::SmallVec;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Snapshot of a permit, carried by gate events.
#[derive(Debug, Clone)]
pub struct PermitInfo {
    /// The permit's identifier.
    pub id: PermitId,
    /// When the permit was acquired.
    pub acquired_at: Time,
}

/// Snapshot of a task entry, carried by scheduler events.
#[derive(Debug, Clone)]
pub struct TaskInfo {
    /// The task's identifier.
    pub id: TaskId,
    /// When the task was submitted.
    pub submitted_at: Time,
    /// Set when the task was discarded without running.
    pub discard_reason: Option<DiscardReason>,
    /// Set when the task's slot was returned before its code finished.
    pub release_reason: Option<ReleaseReason>,
}

/// Events emitted by a [`Gate`](crate::gate::Gate).
#[derive(Debug, Clone)]
pub enum GateEvent {
    /// A permit was acquired.
    Acquired(PermitInfo),
    /// A permit was released.
    Released {
        /// The released permit.
        permit: PermitInfo,
        /// True when the release was driven by the release timeout.
        timeout_reached: bool,
    },
    /// A user-supplied handler failed.
    Error(EventError),
}

impl GateEvent {
    /// Stable name of the event.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Acquired(_) => "lock-acquired",
            Self::Released { .. } => "lock-released",
            Self::Error(_) => "error",
        }
    }
}

/// Events emitted by a [`TaskScheduler`](crate::scheduler::TaskScheduler).
#[derive(Debug, Clone)]
pub enum TaskEvent {
    /// A task was admitted; emitted before its code is invoked.
    Started(TaskInfo),
    /// A task's code returned. Emitted exactly once per task that ran, on
    /// success and failure alike.
    Finished(TaskInfo),
    /// A task's code returned an error. Precedes the task's `Finished`
    /// event.
    Failure(TaskInfo, TaskError),
    /// A running task's slot was returned while its code keeps executing.
    /// Precedes the task's eventual `Finished` event.
    ReleasedBeforeFinished(TaskInfo),
    /// A waiting task was removed from the queue without ever running.
    Discarded(TaskInfo),
    /// A user-supplied handler failed while processing the given task.
    Error(TaskInfo, EventError),
}

impl TaskEvent {
    /// Stable name of the event.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Started(_) => "task-started",
            Self::Finished(_) => "task-finished",
            Self::Failure(..) => "task-failure",
            Self::ReleasedBeforeFinished(_) => "task-released-before-finished",
            Self::Discarded(_) => "task-discarded",
            Self::Error(..) => "error",
        }
    }

    /// The task snapshot carried by this event.
    #[must_use]
    pub fn task(&self) -> &TaskInfo {
        match self {
            Self::Started(info)
            | Self::Finished(info)
            | Self::Failure(info, _)
            | Self::ReleasedBeforeFinished(info)
            | Self::Discarded(info)
            | Self::Error(info, _) => info,
        }
    }
}

/// Handle returned by `subscribe`, used to remove a listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

type Listener<E> = Arc<dyn Fn(&E) + Send + Sync>;

/// Observer registry keyed by subscription id.
pub(crate) struct Listeners<E> {
    entries: Mutex<Vec<(u64, Listener<E>)>>,
    next_id: AtomicU64,
}

impl<E> Listeners<E> {
    pub(crate) fn new() -> Self {
        Self {
            entries: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(0),
        }
    }

    pub(crate) fn subscribe<F>(&self, listener: F) -> SubscriptionId
    where
        F: Fn(&E) + Send + Sync + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.entries.lock().push((id, Arc::new(listener)));
        SubscriptionId(id)
    }

    pub(crate) fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut entries = self.entries.lock();
        match entries.iter().position(|(entry_id, _)| *entry_id == id.0) {
            Some(position) => {
                entries.remove(position);
                true
            }
            None => false,
        }
    }

    /// Calls every listener with `event`. The registry lock is dropped
    /// before any listener runs, so listeners may subscribe or unsubscribe
    /// from inside the call.
    pub(crate) fn emit(&self, event: &E) {
        let snapshot: SmallVec<[Listener<E>; 4]> = {
            let entries = self.entries.lock();
            entries.iter().map(|(_, l)| Arc::clone(l)).collect()
        };
        for listener in snapshot {
            listener(event);
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.lock().len()
    }
}

impl<E> std::fmt::Debug for Listeners<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Listeners")
            .field("count", &self.len())
            .finish()
    }
}
