//! Test logging infrastructure.
//!
//! Captures typed events with timestamps during tests so a failing
//! assertion can dump the full sequence of what the controller did. Used by
//! the crate's own suites; exported because integration tests need it too.
//!
//! # Example
//!
//! ```
//! use taskgate::test_logging::{TestLogLevel, TestLogger, TestEvent};
//!
//! let logger = TestLogger::new(TestLogLevel::Debug);
//! logger.custom("setup", "creating scheduler");
//! logger.log(TestEvent::TaskObserved { name: "task-started".into() });
//! assert_eq!(logger.event_count(), 2);
//! ```

use std::fmt::Write as _;
use std::sync::{Mutex, OnceLock};
use std::time::{Duration, Instant};

/// Logging verbosity for tests, ordered least to most verbose.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub enum TestLogLevel {
    /// Only errors.
    Error,
    /// Warnings and above.
    Warn,
    /// General test progress.
    #[default]
    Info,
    /// Controller transitions.
    Debug,
    /// Everything, including polls and timer traffic.
    Trace,
}

impl TestLogLevel {
    /// Human-readable name.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Error => "ERROR",
            Self::Warn => "WARN",
            Self::Info => "INFO",
            Self::Debug => "DEBUG",
            Self::Trace => "TRACE",
        }
    }

    /// Reads the level from `TASKGATE_TEST_LOG`, defaulting to `Info`.
    #[must_use]
    pub fn from_env() -> Self {
        std::env::var("TASKGATE_TEST_LOG")
            .ok()
            .and_then(|value| value.parse().ok())
            .unwrap_or_default()
    }
}

impl std::fmt::Display for TestLogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

impl std::str::FromStr for TestLogLevel {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "error" => Ok(Self::Error),
            "warn" | "warning" => Ok(Self::Warn),
            "info" => Ok(Self::Info),
            "debug" => Ok(Self::Debug),
            "trace" => Ok(Self::Trace),
            _ => Err(()),
        }
    }
}

/// A typed event captured by the test logger.
#[derive(Debug, Clone)]
pub enum TestEvent {
    /// A controller event was observed by a listener.
    TaskObserved {
        /// Stable event name.
        name: String,
    },
    /// Virtual time moved.
    ClockAdvanced {
        /// New reading in milliseconds.
        to_millis: u64,
    },
    /// Timers fired.
    TimersFired {
        /// How many.
        count: usize,
    },
    /// Free-form progress note.
    Custom {
        /// Short grouping key.
        category: &'static str,
        /// The note.
        message: String,
    },
    /// Something went wrong.
    Error {
        /// Short grouping key.
        category: &'static str,
        /// What went wrong.
        message: String,
    },
    /// Something looked suspicious.
    Warn {
        /// Short grouping key.
        category: &'static str,
        /// What looked suspicious.
        message: String,
    },
}

impl TestEvent {
    /// The minimum level at which this event is captured.
    #[must_use]
    pub const fn level(&self) -> TestLogLevel {
        match self {
            Self::Error { .. } => TestLogLevel::Error,
            Self::Warn { .. } => TestLogLevel::Warn,
            Self::Custom { .. } | Self::TaskObserved { .. } => TestLogLevel::Info,
            Self::ClockAdvanced { .. } | Self::TimersFired { .. } => TestLogLevel::Trace,
        }
    }

    /// Short grouping key for reports.
    #[must_use]
    pub const fn category(&self) -> &'static str {
        match self {
            Self::TaskObserved { .. } => "event",
            Self::ClockAdvanced { .. } => "clock",
            Self::TimersFired { .. } => "timer",
            Self::Custom { category, .. }
            | Self::Error { category, .. }
            | Self::Warn { category, .. } => category,
        }
    }
}

impl std::fmt::Display for TestEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::TaskObserved { name } => write!(f, "observed {name}"),
            Self::ClockAdvanced { to_millis } => write!(f, "clock -> {to_millis}ms"),
            Self::TimersFired { count } => write!(f, "{count} timers fired"),
            Self::Custom { message, .. }
            | Self::Error { message, .. }
            | Self::Warn { message, .. } => f.write_str(message),
        }
    }
}

/// A timestamped event record.
#[derive(Debug, Clone)]
pub struct LogRecord {
    /// Time since logger creation.
    pub elapsed: Duration,
    /// The event.
    pub event: TestEvent,
}

/// Captures typed events with timestamps and renders a report on demand.
#[derive(Debug)]
pub struct TestLogger {
    level: TestLogLevel,
    events: Mutex<Vec<LogRecord>>,
    start: Instant,
    verbose: bool,
}

impl TestLogger {
    /// Creates a logger capturing at `level` and above.
    #[must_use]
    pub fn new(level: TestLogLevel) -> Self {
        Self {
            level,
            events: Mutex::new(Vec::new()),
            start: Instant::now(),
            verbose: level >= TestLogLevel::Trace,
        }
    }

    /// Creates a logger from the `TASKGATE_TEST_LOG` environment variable.
    #[must_use]
    pub fn from_env() -> Self {
        Self::new(init_test_logging())
    }

    /// Logs an event if it meets the configured level.
    pub fn log(&self, event: TestEvent) {
        if event.level() > self.level {
            return;
        }
        let elapsed = self.start.elapsed();
        if self.verbose {
            eprintln!(
                "[{:>9.3}ms] [{:>5}] {}",
                elapsed.as_secs_f64() * 1000.0,
                event.level().name(),
                event
            );
        }
        self.events
            .lock()
            .expect("lock poisoned")
            .push(LogRecord { elapsed, event });
    }

    /// Logs a free-form progress note.
    pub fn custom(&self, category: &'static str, message: impl Into<String>) {
        self.log(TestEvent::Custom {
            category,
            message: message.into(),
        });
    }

    /// Logs an error.
    pub fn error(&self, category: &'static str, message: impl Into<String>) {
        self.log(TestEvent::Error {
            category,
            message: message.into(),
        });
    }

    /// Returns the number of captured events.
    #[must_use]
    pub fn event_count(&self) -> usize {
        self.events.lock().expect("lock poisoned").len()
    }

    /// Returns a snapshot of all captured events.
    #[must_use]
    pub fn events(&self) -> Vec<LogRecord> {
        self.events.lock().expect("lock poisoned").clone()
    }

    /// Renders a full report of the captured sequence.
    #[must_use]
    pub fn report(&self) -> String {
        let events = self.events.lock().expect("lock poisoned");
        let mut report = String::new();
        let _ = writeln!(report, "=== Test Event Log ({} events) ===", events.len());
        for record in events.iter() {
            let _ = writeln!(
                report,
                "[{:>9.3}ms] [{:>5}] {:>8} | {}",
                record.elapsed.as_secs_f64() * 1000.0,
                record.event.level().name(),
                record.event.category(),
                record.event
            );
        }
        report
    }

    /// Panics with the full report when any error event was captured.
    pub fn assert_no_errors(&self) {
        let errors: Vec<String> = {
            let events = self.events.lock().expect("lock poisoned");
            events
                .iter()
                .filter(|record| matches!(record.event, TestEvent::Error { .. }))
                .map(|record| format!("  - {}", record.event))
                .collect()
        };
        assert!(
            errors.is_empty(),
            "test logged {} errors:\n{}\n\n{}",
            errors.len(),
            errors.join("\n"),
            self.report()
        );
    }

    /// Clears all captured events.
    pub fn clear(&self) {
        self.events.lock().expect("lock poisoned").clear();
    }
}

impl Default for TestLogger {
    fn default() -> Self {
        Self::new(TestLogLevel::Info)
    }
}

/// Snapshots the env-configured log level once per process. Idempotent;
/// call from every test's setup.
pub fn init_test_logging() -> TestLogLevel {
    static LEVEL: OnceLock<TestLogLevel> = OnceLock::new();
    *LEVEL.get_or_init(TestLogLevel::from_env)
}

/// Logs a free-form note to a test logger.
#[macro_export]
macro_rules! test_log {
    ($logger:expr, $cat:literal, $($arg:tt)*) => {
        $logger.log($crate::test_logging::TestEvent::Custom {
            category: $cat,
            message: format!($($arg)*),
        });
    };
}

/// Logs an error to a test logger.
#[macro_export]
macro_rules! test_error {
    ($logger:expr, $cat:literal, $($arg:tt)*) => {
        $logger.log($crate::test_logging::TestEvent::Error {
            category: $cat,
            message: format!($($arg)*),
        });
    };
}

/// Asserts a condition, printing the full log on failure.
#[macro_export]
macro_rules! assert_log {
    ($logger:expr, $cond:expr) => {
        if !$cond {
            eprintln!("{}", $logger.report());
            panic!("assertion failed: {}", stringify!($cond));
        }
    };
    ($logger:expr, $cond:expr, $($arg:tt)*) => {
        if !$cond {
            eprintln!("{}", $logger.report());
            panic!($($arg)*);
        }
    };
}

/// Asserts equality, printing the full log on failure.
#[macro_export]
macro_rules! assert_eq_log {
    ($logger:expr, $left:expr, $right:expr) => {
        if $left != $right {
            eprintln!("{}", $logger.report());
            panic!(
                "assertion failed: `(left == right)`\n  left: {:?}\n right: {:?}",
                $left, $right
            );
        }
    };
}
