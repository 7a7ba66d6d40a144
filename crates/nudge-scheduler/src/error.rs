//! Error types for the scheduler.

use thiserror::Error;

/// Errors that can occur when building repeat rules or timers.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SchedulerError {
    /// Repeat frequency must be at least one unit.
    #[error("repeat frequency must be positive, got {0}")]
    InvalidFrequency(i64),

    /// Weekday mask uses bits beyond Sunday.
    #[error("invalid weekday mask: {0:#x}")]
    InvalidWeekdays(i64),

    /// Unknown repeat type code.
    #[error("unknown repeat type: {0}")]
    UnknownRepeatKind(i64),
}
