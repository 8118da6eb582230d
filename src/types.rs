//! Core identifier, time, and reason types.
//!
//! [`Time`] is a plain nanosecond count against an arbitrary epoch; which
//! epoch depends on the injected clock (virtual clocks start at zero,
//! monotonic clocks at process start). Identifier types wrap generational
//! arena indices so stale handles never alias a reused slot.

use crate::util::ArenaIndex;
use core::fmt;
use std::time::Duration;

/// An instant in injected time, measured in nanoseconds.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Time(u64);

impl Time {
    /// The epoch of the injected clock.
    pub const ZERO: Self = Self(0);

    /// Creates a time from a nanosecond count.
    #[inline]
    #[must_use]
    pub const fn from_nanos(nanos: u64) -> Self {
        Self(nanos)
    }

    /// Creates a time from a millisecond count.
    #[inline]
    #[must_use]
    pub const fn from_millis(millis: u64) -> Self {
        Self(millis * 1_000_000)
    }

    /// Returns the nanosecond count.
    #[inline]
    #[must_use]
    pub const fn as_nanos(self) -> u64 {
        self.0
    }

    /// Returns the whole milliseconds elapsed since the epoch.
    #[inline]
    #[must_use]
    pub const fn as_millis(self) -> u64 {
        self.0 / 1_000_000
    }

    /// Adds a duration, saturating at the representable maximum.
    #[must_use]
    pub fn saturating_add(self, duration: Duration) -> Self {
        let nanos = u64::try_from(duration.as_nanos()).unwrap_or(u64::MAX);
        Self(self.0.saturating_add(nanos))
    }

    /// Returns the duration from `earlier` to `self`, or zero when `earlier`
    /// is in the future.
    #[must_use]
    pub fn saturating_since(self, earlier: Self) -> Duration {
        Duration::from_nanos(self.0.saturating_sub(earlier.0))
    }
}

impl fmt::Debug for Time {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Time({}ns)", self.0)
    }
}

impl fmt::Display for Time {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}ms", self.as_millis())
    }
}

/// Identifies an acquired permit at a [`Gate`](crate::gate::Gate).
///
/// Doubles as the release-token key: releasing through a stale id is a no-op.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PermitId(pub(crate) ArenaIndex);

impl fmt::Debug for PermitId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PermitId({}:{})", self.0.index(), self.0.generation())
    }
}

/// Identifies a task submitted to a
/// [`TaskScheduler`](crate::scheduler::TaskScheduler).
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TaskId(pub(crate) ArenaIndex);

impl fmt::Debug for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TaskId({}:{})", self.0.index(), self.0.generation())
    }
}

/// Identifies a scheduled timer at a
/// [`TimerDriver`](crate::time::TimerDriver).
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TimerId(pub(crate) ArenaIndex);

impl fmt::Debug for TimerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TimerId({}:{})", self.0.index(), self.0.generation())
    }
}

/// Why a waiting task was removed from the queue without ever running.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize)]
pub enum DiscardReason {
    /// The waiting timeout elapsed before a slot became available.
    TimeoutReached,
    /// The queue was flushed.
    Forced,
    /// The effective abort signal was set when the task came up for dispatch.
    AbortSignal,
}

impl DiscardReason {
    /// Stable name of the reason.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::TimeoutReached => "timeoutReached",
            Self::Forced => "forced",
            Self::AbortSignal => "abortSignal",
        }
    }
}

impl fmt::Display for DiscardReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a running task's admission slot was returned before its user code
/// finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize)]
pub enum ReleaseReason {
    /// The release timeout elapsed.
    TimeoutReached,
    /// All running tasks were force-released.
    Forced,
}

impl ReleaseReason {
    /// Stable name of the reason.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::TimeoutReached => "timeoutReached",
            Self::Forced => "forced",
        }
    }
}

impl fmt::Display for ReleaseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn time_conversions_round_down() {
        let t = Time::from_millis(120);
        assert_eq!(t.as_millis(), 120);
        assert_eq!(t.as_nanos(), 120_000_000);
        assert_eq!(Time::from_nanos(1_500_000).as_millis(), 1);
    }

    #[test]
    fn time_saturating_add() {
        let t = Time::from_millis(10).saturating_add(Duration::from_millis(5));
        assert_eq!(t, Time::from_millis(15));

        let max = Time::from_nanos(u64::MAX).saturating_add(Duration::from_secs(1));
        assert_eq!(max.as_nanos(), u64::MAX);
    }

    #[test]
    fn time_saturating_since() {
        let early = Time::from_millis(10);
        let late = Time::from_millis(25);
        assert_eq!(late.saturating_since(early), Duration::from_millis(15));
        assert_eq!(early.saturating_since(late), Duration::ZERO);
    }

    #[test]
    fn time_ordering() {
        assert!(Time::ZERO < Time::from_millis(1));
        assert!(Time::from_millis(99) < Time::from_millis(100));
    }

    #[test]
    fn discard_reason_stable_names() {
        assert_eq!(DiscardReason::TimeoutReached.as_str(), "timeoutReached");
        assert_eq!(DiscardReason::Forced.as_str(), "forced");
        assert_eq!(DiscardReason::AbortSignal.as_str(), "abortSignal");
        assert_eq!(DiscardReason::AbortSignal.to_string(), "abortSignal");
    }

    #[test]
    fn release_reason_stable_names() {
        assert_eq!(ReleaseReason::TimeoutReached.as_str(), "timeoutReached");
        assert_eq!(ReleaseReason::Forced.as_str(), "forced");
    }

    #[test]
    fn id_debug_formats() {
        let idx = ArenaIndex::new(3, 1);
        assert_eq!(format!("{:?}", PermitId(idx)), "PermitId(3:1)");
        assert_eq!(format!("{:?}", TaskId(idx)), "TaskId(3:1)");
        assert_eq!(format!("{:?}", TimerId(idx)), "TimerId(3:1)");
    }
}
