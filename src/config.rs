//! Option structs, defaults, sanitization, and layered loading.
//!
//! Controllers never refuse to start over a configuration mistake: invalid
//! values are coerced to defaults at construction and invalid live changes
//! are ignored. Programmatic setters are typed; the key/value ingestion path
//! ([`SchedulerOptions::apply_kv`], [`SchedulerOptions::from_env`]) applies
//! the lenient coercion rules for untyped sources:
//!
//! - concurrency: non-numeric, NaN, ±∞, or ≤ 0 falls back to the default of
//!   1; fractional values round half-up (`0.9` → 1, `99.5` → 100)
//! - timeouts: non-numeric values fall back to disabled (zero)
//! - queue type: anything but `fifo`/`lifo` (case-insensitive) falls back to
//!   FIFO
//! - unknown keys are ignored

use crate::error::TaskError;
use crate::event::{PermitInfo, TaskInfo};
use crate::signal::AbortSignal;
use core::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

/// Default concurrency limit.
pub const DEFAULT_CONCURRENCY: usize = 1;

/// Environment variable prefix recognized by
/// [`SchedulerOptions::from_env`].
pub const ENV_PREFIX: &str = "TASKGATE_";

/// Queue discipline used to pick the next waiter when a slot frees up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, serde::Serialize)]
pub enum QueueType {
    /// First in, first out: start order equals submission order.
    #[default]
    Fifo,
    /// Last in, first out: the most recently queued waiter goes next.
    Lifo,
}

impl QueueType {
    /// Stable name of the discipline.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Fifo => "FIFO",
            Self::Lifo => "LIFO",
        }
    }
}

impl fmt::Display for QueueType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for QueueType {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "fifo" => Ok(Self::Fifo),
            "lifo" => Ok(Self::Lifo),
            _ => Err(()),
        }
    }
}

/// Handler invoked with a permit snapshot.
pub type PermitHandler = Arc<dyn Fn(&PermitInfo) + Send + Sync>;

/// Handler invoked with a task snapshot.
pub type TaskHandler = Arc<dyn Fn(&TaskInfo) + Send + Sync>;

/// Handler invoked with a task snapshot and the task's failure.
pub type TaskErrorHandler = Arc<dyn Fn(&TaskInfo, &TaskError) + Send + Sync>;

/// Coerces an untyped concurrency value per the sanitization rules.
///
/// NaN, infinities, and values at or below zero fall back to
/// [`DEFAULT_CONCURRENCY`]; fractional values round half-up.
#[must_use]
pub fn sanitize_concurrency(value: f64) -> usize {
    if !value.is_finite() || value <= 0.0 {
        return DEFAULT_CONCURRENCY;
    }
    let rounded = (value + 0.5).floor();
    if rounded < 1.0 {
        DEFAULT_CONCURRENCY
    } else if rounded >= usize::MAX as f64 {
        usize::MAX
    } else {
        rounded as usize
    }
}

/// Validates an untyped concurrency value for a live limit change.
///
/// Unlike construction, live changes are not coerced: anything that is not a
/// finite integer of at least 1 returns `None` and the caller leaves the
/// current limit unchanged.
#[must_use]
pub fn sanitize_concurrency_change(value: f64) -> Option<usize> {
    if !value.is_finite() || value < 1.0 || value.fract() != 0.0 {
        return None;
    }
    if value >= usize::MAX as f64 {
        Some(usize::MAX)
    } else {
        Some(value as usize)
    }
}

/// Configuration for a [`Gate`](crate::gate::Gate).
#[derive(Clone)]
pub struct GateOptions {
    /// Maximum number of concurrently held permits. Zero is coerced to
    /// [`DEFAULT_CONCURRENCY`] at construction.
    pub concurrency: usize,
    /// Queue discipline for waiting acquirers.
    pub queue_type: QueueType,
    /// How long a permit may be held before it is force-released. Zero
    /// disables the timeout.
    pub release_timeout: Duration,
    /// Called before a permit is released by the release timeout.
    pub release_timeout_handler: Option<PermitHandler>,
}

impl GateOptions {
    /// Options with all defaults: concurrency 1, FIFO, no release timeout.
    #[must_use]
    pub fn new() -> Self {
        Self {
            concurrency: DEFAULT_CONCURRENCY,
            queue_type: QueueType::Fifo,
            release_timeout: Duration::ZERO,
            release_timeout_handler: None,
        }
    }

    /// Sets the concurrency limit.
    #[must_use]
    pub fn concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    /// Sets the queue discipline.
    #[must_use]
    pub fn queue_type(mut self, queue_type: QueueType) -> Self {
        self.queue_type = queue_type;
        self
    }

    /// Sets the release timeout. Zero disables it.
    #[must_use]
    pub fn release_timeout(mut self, timeout: Duration) -> Self {
        self.release_timeout = timeout;
        self
    }

    /// Sets the release-timeout handler.
    #[must_use]
    pub fn on_release_timeout<F>(mut self, handler: F) -> Self
    where
        F: Fn(&PermitInfo) + Send + Sync + 'static,
    {
        self.release_timeout_handler = Some(Arc::new(handler));
        self
    }

    /// Returns a copy with invalid values coerced to defaults.
    #[must_use]
    pub fn sanitized(mut self) -> Self {
        if self.concurrency == 0 {
            self.concurrency = DEFAULT_CONCURRENCY;
        }
        self
    }
}

impl Default for GateOptions {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for GateOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GateOptions")
            .field("concurrency", &self.concurrency)
            .field("queue_type", &self.queue_type)
            .field("release_timeout", &self.release_timeout)
            .field(
                "release_timeout_handler",
                &self.release_timeout_handler.as_ref().map(|_| "<handler>"),
            )
            .finish()
    }
}

/// Configuration for a [`TaskScheduler`](crate::scheduler::TaskScheduler).
///
/// A superset of [`GateOptions`]; the handler fields receive task snapshots
/// rather than permits.
#[derive(Clone, Default)]
pub struct SchedulerOptions {
    /// Gate-level options: concurrency, queue discipline, release timeout.
    /// The scheduler's release-timeout handling replaces the gate-level
    /// handler, so `gate.release_timeout_handler` is unused here.
    pub gate: GateOptions,
    /// How long a task may wait in the queue before being discarded. Zero
    /// disables the timeout.
    pub waiting_timeout: Duration,
    /// Called after a task is discarded by the waiting timeout.
    pub waiting_timeout_handler: Option<TaskHandler>,
    /// Called after a running task's slot is returned by the release
    /// timeout.
    pub release_timeout_handler: Option<TaskHandler>,
    /// Called when a task's code returns an error.
    pub error_handler: Option<TaskErrorHandler>,
    /// Abort flag consulted when queued tasks come up for dispatch.
    pub signal: Option<AbortSignal>,
}

impl SchedulerOptions {
    /// Options with all defaults.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the concurrency limit.
    #[must_use]
    pub fn concurrency(mut self, concurrency: usize) -> Self {
        self.gate.concurrency = concurrency;
        self
    }

    /// Sets the queue discipline.
    #[must_use]
    pub fn queue_type(mut self, queue_type: QueueType) -> Self {
        self.gate.queue_type = queue_type;
        self
    }

    /// Sets the waiting timeout. Zero disables it.
    #[must_use]
    pub fn waiting_timeout(mut self, timeout: Duration) -> Self {
        self.waiting_timeout = timeout;
        self
    }

    /// Sets the waiting-timeout handler.
    #[must_use]
    pub fn on_waiting_timeout<F>(mut self, handler: F) -> Self
    where
        F: Fn(&TaskInfo) + Send + Sync + 'static,
    {
        self.waiting_timeout_handler = Some(Arc::new(handler));
        self
    }

    /// Sets the release timeout. Zero disables it.
    #[must_use]
    pub fn release_timeout(mut self, timeout: Duration) -> Self {
        self.gate.release_timeout = timeout;
        self
    }

    /// Sets the release-timeout handler.
    #[must_use]
    pub fn on_release_timeout<F>(mut self, handler: F) -> Self
    where
        F: Fn(&TaskInfo) + Send + Sync + 'static,
    {
        self.release_timeout_handler = Some(Arc::new(handler));
        self
    }

    /// Sets the error handler.
    #[must_use]
    pub fn on_error<F>(mut self, handler: F) -> Self
    where
        F: Fn(&TaskInfo, &TaskError) + Send + Sync + 'static,
    {
        self.error_handler = Some(Arc::new(handler));
        self
    }

    /// Sets the controller-wide abort signal.
    #[must_use]
    pub fn signal(mut self, signal: AbortSignal) -> Self {
        self.signal = Some(signal);
        self
    }

    /// Returns a copy with invalid values coerced to defaults.
    #[must_use]
    pub fn sanitized(mut self) -> Self {
        self.gate = self.gate.sanitized();
        self
    }

    /// Applies one untyped key/value pair with lenient coercion.
    ///
    /// Recognized keys: `concurrency`, `queue_type`, `waiting_timeout_ms`,
    /// `release_timeout_ms`. Unknown keys and malformed values leave the
    /// options unchanged (or at the field default for recognized keys with
    /// unusable values, matching the coercion rules).
    pub fn apply_kv(&mut self, key: &str, value: &str) {
        match key {
            "concurrency" => {
                self.gate.concurrency = value
                    .trim()
                    .parse::<f64>()
                    .map_or(DEFAULT_CONCURRENCY, sanitize_concurrency);
            }
            "queue_type" => {
                self.gate.queue_type = value.trim().parse().unwrap_or_default();
            }
            "waiting_timeout_ms" => {
                self.waiting_timeout = parse_millis(value);
            }
            "release_timeout_ms" => {
                self.gate.release_timeout = parse_millis(value);
            }
            _ => {}
        }
    }

    /// Builds options from `TASKGATE_`-prefixed environment variables
    /// (`TASKGATE_CONCURRENCY`, `TASKGATE_QUEUE_TYPE`,
    /// `TASKGATE_WAITING_TIMEOUT_MS`, `TASKGATE_RELEASE_TIMEOUT_MS`), with
    /// the same coercion as [`apply_kv`](Self::apply_kv).
    #[must_use]
    pub fn from_env() -> Self {
        let mut options = Self::new();
        for (key, value) in std::env::vars() {
            if let Some(suffix) = key.strip_prefix(ENV_PREFIX) {
                options.apply_kv(&suffix.to_ascii_lowercase(), &value);
            }
        }
        options
    }
}

impl fmt::Debug for SchedulerOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SchedulerOptions")
            .field("gate", &self.gate)
            .field("waiting_timeout", &self.waiting_timeout)
            .field(
                "waiting_timeout_handler",
                &self.waiting_timeout_handler.as_ref().map(|_| "<handler>"),
            )
            .field(
                "release_timeout_handler",
                &self.release_timeout_handler.as_ref().map(|_| "<handler>"),
            )
            .field(
                "error_handler",
                &self.error_handler.as_ref().map(|_| "<handler>"),
            )
            .field("signal", &self.signal.is_some())
            .finish()
    }
}

/// Per-task overrides, snapshotted at submission.
///
/// Every field defaults to "inherit from the controller"; a set field
/// overrides the controller default for that task only.
#[derive(Clone, Default)]
pub struct TaskOptions {
    /// Overrides the controller waiting timeout.
    pub waiting_timeout: Option<Duration>,
    /// Overrides the controller waiting-timeout handler.
    pub waiting_timeout_handler: Option<TaskHandler>,
    /// Overrides the controller release timeout.
    pub release_timeout: Option<Duration>,
    /// Overrides the controller release-timeout handler.
    pub release_timeout_handler: Option<TaskHandler>,
    /// Overrides the controller error handler.
    pub error_handler: Option<TaskErrorHandler>,
    /// Overrides the controller abort signal.
    pub signal: Option<AbortSignal>,
}

impl TaskOptions {
    /// Overrides nothing.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Overrides the waiting timeout. Zero disables it for this task.
    #[must_use]
    pub fn waiting_timeout(mut self, timeout: Duration) -> Self {
        self.waiting_timeout = Some(timeout);
        self
    }

    /// Overrides the waiting-timeout handler.
    #[must_use]
    pub fn on_waiting_timeout<F>(mut self, handler: F) -> Self
    where
        F: Fn(&TaskInfo) + Send + Sync + 'static,
    {
        self.waiting_timeout_handler = Some(Arc::new(handler));
        self
    }

    /// Overrides the release timeout. Zero disables it for this task.
    #[must_use]
    pub fn release_timeout(mut self, timeout: Duration) -> Self {
        self.release_timeout = Some(timeout);
        self
    }

    /// Overrides the release-timeout handler.
    #[must_use]
    pub fn on_release_timeout<F>(mut self, handler: F) -> Self
    where
        F: Fn(&TaskInfo) + Send + Sync + 'static,
    {
        self.release_timeout_handler = Some(Arc::new(handler));
        self
    }

    /// Overrides the error handler.
    #[must_use]
    pub fn on_error<F>(mut self, handler: F) -> Self
    where
        F: Fn(&TaskInfo, &TaskError) + Send + Sync + 'static,
    {
        self.error_handler = Some(Arc::new(handler));
        self
    }

    /// Overrides the abort signal.
    #[must_use]
    pub fn signal(mut self, signal: AbortSignal) -> Self {
        self.signal = Some(signal);
        self
    }
}

impl fmt::Debug for TaskOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskOptions")
            .field("waiting_timeout", &self.waiting_timeout)
            .field("release_timeout", &self.release_timeout)
            .field("signal", &self.signal.is_some())
            .finish()
    }
}

fn parse_millis(value: &str) -> Duration {
    value
        .trim()
        .parse::<u64>()
        .map_or(Duration::ZERO, Duration::from_millis)
}
