//! Timekeeping for nudge.
//!
//! This crate provides the two pure-ish building blocks the service uses to
//! decide when a reminder should notify:
//! - A recurrence engine that advances a repeating reminder past "now"
//! - A countdown scheduler holding per-reminder and periodic wall-clock timers

mod countdown;
mod error;
mod recurrence;
mod types;

pub use countdown::{CountdownToken, Countdowns, Fired, MAX_SLEEP_SECS, TimerKey};
pub use error::SchedulerError;
pub use recurrence::{Advance, Occurrence, is_past_until, local_date, next_occurrence};
pub use types::{Remaining, RepeatKind, RepeatRule, Weekdays};
