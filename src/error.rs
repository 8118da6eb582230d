//! Error and outcome types.
//!
//! Three planes, kept strictly apart:
//!
//! - **User task failure**: the task's own `Err` value. It reaches the caller
//!   as [`Settled::Rejected`], the `task-failure` event, and the error
//!   handler, all sharing one [`TaskError`] allocation.
//! - **Handler failure**: a user-supplied handler panicked. Surfaced only as
//!   an `error` event carrying an [`EventError`] with a stable code; it never
//!   reaches the caller's future and never disturbs controller state.
//! - **Invalid configuration**: coerced to defaults or ignored; constructors
//!   never fail.

use crate::types::DiscardReason;
use core::fmt;
use std::sync::Arc;

/// Shared handle to a user-task failure.
///
/// `Arc` so the same failure can fan out to the caller's [`Settled`], the
/// `task-failure` event, and the error handler without cloning the
/// underlying error.
pub type TaskError = Arc<dyn std::error::Error + Send + Sync + 'static>;

/// Stable codes carried by `error` events when a user-supplied handler
/// fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HandlerErrorCode {
    /// The waiting-timeout handler panicked.
    WaitingTimeoutHandlerFailure,
    /// The release-timeout handler panicked.
    ReleaseTimeoutHandlerFailure,
    /// The error handler panicked.
    ErrorHandlerFailure,
}

impl HandlerErrorCode {
    /// Stable name of the code.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::WaitingTimeoutHandlerFailure => "waiting-timeout-handler-failure",
            Self::ReleaseTimeoutHandlerFailure => "release-timeout-handler-failure",
            Self::ErrorHandlerFailure => "error-handler-failure",
        }
    }
}

impl fmt::Display for HandlerErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Payload of an `error` event.
#[derive(Debug, Clone)]
pub struct EventError {
    /// What failed.
    pub code: HandlerErrorCode,
    /// Panic message of the failed handler.
    pub message: String,
}

impl fmt::Display for EventError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

impl std::error::Error for EventError {}

/// Why a `run*` future resolved without a task value.
#[derive(Debug, Clone)]
pub enum RunError {
    /// The task ran and returned an error.
    Failed(TaskError),
    /// The task was discarded before it ever ran.
    Discarded(DiscardReason),
}

impl RunError {
    /// Returns the discard reason when the task never ran.
    #[must_use]
    pub fn discard_reason(&self) -> Option<DiscardReason> {
        match self {
            Self::Discarded(reason) => Some(*reason),
            Self::Failed(_) => None,
        }
    }
}

impl fmt::Display for RunError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Failed(error) => write!(f, "task failed: {error}"),
            Self::Discarded(reason) => write!(f, "task discarded: {reason}"),
        }
    }
}

impl std::error::Error for RunError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Failed(error) => Some(error.as_ref()),
            Self::Discarded(_) => None,
        }
    }
}

/// Outcome of a scheduled task. The future returned by `run*` never fails;
/// success and failure both arrive through this variant.
#[derive(Debug, Clone)]
pub enum Settled<T> {
    /// The task ran and returned a value.
    Fulfilled(T),
    /// The task failed or was discarded.
    Rejected(RunError),
}

impl<T> Settled<T> {
    /// Returns true for [`Settled::Fulfilled`].
    #[must_use]
    pub fn is_fulfilled(&self) -> bool {
        matches!(self, Self::Fulfilled(_))
    }

    /// Returns true for [`Settled::Rejected`].
    #[must_use]
    pub fn is_rejected(&self) -> bool {
        matches!(self, Self::Rejected(_))
    }

    /// Converts into `Option`, discarding any rejection.
    #[must_use]
    pub fn fulfilled(self) -> Option<T> {
        match self {
            Self::Fulfilled(value) => Some(value),
            Self::Rejected(_) => None,
        }
    }

    /// Converts into a `Result`.
    pub fn into_result(self) -> Result<T, RunError> {
        match self {
            Self::Fulfilled(value) => Ok(value),
            Self::Rejected(error) => Err(error),
        }
    }
}

/// Extracts a printable message from a panic payload.
pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&'static str>() {
        (*message).to_owned()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "handler panicked".to_owned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn boom() -> TaskError {
        Arc::new(std::io::Error::new(std::io::ErrorKind::Other, "boom"))
    }

    #[test]
    fn handler_error_code_stable_names() {
        assert_eq!(
            HandlerErrorCode::WaitingTimeoutHandlerFailure.as_str(),
            "waiting-timeout-handler-failure"
        );
        assert_eq!(
            HandlerErrorCode::ReleaseTimeoutHandlerFailure.as_str(),
            "release-timeout-handler-failure"
        );
        assert_eq!(
            HandlerErrorCode::ErrorHandlerFailure.as_str(),
            "error-handler-failure"
        );
    }

    #[test]
    fn event_error_display_includes_code() {
        let error = EventError {
            code: HandlerErrorCode::ErrorHandlerFailure,
            message: "oops".into(),
        };
        let rendered = error.to_string();
        assert!(rendered.contains("error-handler-failure"));
        assert!(rendered.contains("oops"));
    }

    #[test]
    fn run_error_discard_reason() {
        let discarded = RunError::Discarded(DiscardReason::AbortSignal);
        assert_eq!(discarded.discard_reason(), Some(DiscardReason::AbortSignal));
        assert!(RunError::Failed(boom()).discard_reason().is_none());
    }

    #[test]
    fn run_error_source_chains_task_failure() {
        use std::error::Error;
        assert!(RunError::Failed(boom()).source().is_some());
        assert!(RunError::Discarded(DiscardReason::Forced).source().is_none());
    }

    #[test]
    fn settled_accessors() {
        let ok: Settled<u32> = Settled::Fulfilled(7);
        assert!(ok.is_fulfilled());
        assert_eq!(ok.clone().fulfilled(), Some(7));
        assert_eq!(ok.into_result().unwrap(), 7);

        let rejected: Settled<u32> = Settled::Rejected(RunError::Discarded(DiscardReason::Forced));
        assert!(rejected.is_rejected());
        assert_eq!(rejected.clone().fulfilled(), None);
        assert!(rejected.into_result().is_err());
    }

    #[test]
    fn panic_message_extraction() {
        let static_payload: Box<dyn std::any::Any + Send> = Box::new("static message");
        assert_eq!(panic_message(static_payload.as_ref()), "static message");

        let string_payload: Box<dyn std::any::Any + Send> = Box::new(String::from("owned"));
        assert_eq!(panic_message(string_payload.as_ref()), "owned");

        let opaque: Box<dyn std::any::Any + Send> = Box::new(17u8);
        assert_eq!(panic_message(opaque.as_ref()), "handler panicked");
    }
}
