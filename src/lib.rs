//! In-process asynchronous task scheduling over a counting concurrency
//! gate.
//!
//! Three components, leaves first:
//!
//! - [`gate::Gate`] — a counting lock: up to `concurrency` permits out at
//!   once, FIFO or LIFO promotion of waiters, optional release timeout, and
//!   `lock-acquired`/`lock-released` events. Usable on its own as a
//!   mutex/semaphore.
//! - [`scheduler::TaskScheduler`] — a task controller over a gate: submits
//!   unit-of-work closures, bounds their waiting and running phases with
//!   timeouts, supports per-task option overrides and abort signals, and
//!   emits the full task life cycle. The future returned by `run*` never
//!   fails; outcomes arrive as [`Settled`](error::Settled).
//! - [`multi_step::MultiStepGate`] — N independent gates handed as a tuple
//!   to a user callable, one concurrency cap per pipeline stage.
//!
//! Time is injected: every controller takes a
//! [`TimerDriverHandle`](time::TimerDriverHandle), and the [`lab::Lab`]
//! executor drives futures deterministically over a virtual clock — the
//! whole test suite runs on exact simulated milliseconds.
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
//! let scheduler = TaskScheduler::with_timer(
//!     SchedulerOptions::new().concurrency(2),
//!     lab.timer(),
//! );
//!
//! let timer = lab.timer();
//! let outcomes = lab.block_on(scheduler.run_for_each_args(
//!     vec![10u64, 20, 30],
//!     move |millis| {
//!         let timer = timer.clone();
//!         async move {
//!             timer.sleep(Duration::from_millis(millis)).await;
//!             Ok::<_, Infallible>(millis)
//!         }
//!     },
//! ));
//! assert!(outcomes.iter().all(|outcome| outcome.is_fulfilled()));
//! ```

pub mod config;
pub mod error;
pub mod event;
pub mod gate;
pub mod lab;
pub mod multi_step;
pub mod scheduler;
pub mod signal;
pub mod test_logging;
pub mod time;
pub mod types;
pub mod util;

mod tracing_compat;

pub use config::{GateOptions, QueueType, SchedulerOptions, TaskOptions};
pub use error::{EventError, HandlerErrorCode, RunError, Settled, TaskError};
pub use event::{GateEvent, PermitInfo, SubscriptionId, TaskEvent, TaskInfo};
pub use gate::{AcquireFuture, Gate, GatePermit, GateStats};
pub use multi_step::MultiStepGate;
pub use scheduler::{RunFuture, RunMany, SchedulerStats, TaskScheduler};
pub use signal::{AbortController, AbortSignal};
pub use time::{ClockSource, Sleep, TimerDriverHandle, VirtualClock};
pub use types::{DiscardReason, PermitId, ReleaseReason, TaskId, Time, TimerId};
