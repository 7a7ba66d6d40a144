//! Repeat-rule types.

use chrono::{NaiveDate, Weekday};
use serde::{Deserialize, Serialize};

use crate::SchedulerError;

/// Unit a repeat rule advances by.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RepeatKind {
    Minute,
    Hour,
    Day,
    Week,
}

impl RepeatKind {
    /// Numeric code used in persisted tables. Zero is reserved for "no repeat".
    pub fn code(self) -> i64 {
        match self {
            RepeatKind::Minute => 1,
            RepeatKind::Hour => 2,
            RepeatKind::Day => 3,
            RepeatKind::Week => 4,
        }
    }

    /// Parse a persisted code. `Ok(None)` means the reminder does not repeat.
    pub fn from_code(code: i64) -> Result<Option<Self>, SchedulerError> {
        match code {
            0 => Ok(None),
            1 => Ok(Some(RepeatKind::Minute)),
            2 => Ok(Some(RepeatKind::Hour)),
            3 => Ok(Some(RepeatKind::Day)),
            4 => Ok(Some(RepeatKind::Week)),
            other => Err(SchedulerError::UnknownRepeatKind(other)),
        }
    }
}

/// Set of weekdays stored as a bitmask, Monday in bit 0 through Sunday in bit 6.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Weekdays(u8);

impl Weekdays {
    pub const EMPTY: Weekdays = Weekdays(0);
    pub const ALL: Weekdays = Weekdays(0x7f);

    /// Build from a raw mask, rejecting bits beyond Sunday.
    pub fn from_bits(bits: i64) -> Result<Self, SchedulerError> {
        if !(0..=0x7f).contains(&bits) {
            return Err(SchedulerError::InvalidWeekdays(bits));
        }
        Ok(Weekdays(bits as u8))
    }

    pub fn bits(self) -> u8 {
        self.0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn contains(self, day: Weekday) -> bool {
        self.0 & Self::bit(day) != 0
    }

    pub fn with(self, day: Weekday) -> Self {
        Weekdays(self.0 | Self::bit(day))
    }

    /// Active days as Monday-based offsets (0 = Monday), ascending.
    pub fn offsets(self) -> impl Iterator<Item = u32> {
        (0..7u32).filter(move |offset| self.0 & (1 << offset) != 0)
    }

    fn bit(day: Weekday) -> u8 {
        1 << day.num_days_from_monday()
    }
}

impl FromIterator<Weekday> for Weekdays {
    fn from_iter<I: IntoIterator<Item = Weekday>>(iter: I) -> Self {
        iter.into_iter().fold(Weekdays::EMPTY, Weekdays::with)
    }
}

/// How a reminder repeats after it fires.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RepeatRule {
    pub kind: RepeatKind,
    /// Number of units between occurrences (weeks for `Week`).
    pub frequency: u16,
    /// Active weekdays, only consulted for `Week`. Empty means "the reminder's own weekday".
    #[serde(default)]
    pub days: Weekdays,
    /// Last calendar date an occurrence may fall on.
    #[serde(default)]
    pub until: Option<NaiveDate>,
}

impl RepeatRule {
    /// Create a rule, validating the frequency.
    pub fn new(kind: RepeatKind, frequency: i64) -> Result<Self, SchedulerError> {
        if !(1..=i64::from(u16::MAX)).contains(&frequency) {
            return Err(SchedulerError::InvalidFrequency(frequency));
        }
        Ok(Self {
            kind,
            frequency: frequency as u16,
            days: Weekdays::EMPTY,
            until: None,
        })
    }

    pub fn daily(frequency: i64) -> Result<Self, SchedulerError> {
        Self::new(RepeatKind::Day, frequency)
    }

    pub fn weekly(frequency: i64, days: Weekdays) -> Result<Self, SchedulerError> {
        Ok(Self::new(RepeatKind::Week, frequency)?.on_days(days))
    }

    pub fn on_days(mut self, days: Weekdays) -> Self {
        self.days = days;
        self
    }

    pub fn until(mut self, date: NaiveDate) -> Self {
        self.until = Some(date);
        self
    }

    /// True if an occurrence on `date` lies beyond the end date.
    pub fn is_past_until(&self, date: NaiveDate) -> bool {
        self.until.is_some_and(|until| date > until)
    }
}

/// How many more notifications a reminder may produce.
///
/// This is deliberately separate from whether a repeat rule exists: a
/// one-shot reminder starts at `Times(1)` and drops to `Times(0)` once shown,
/// while a repeating reminder can be `Unlimited`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Remaining {
    Unlimited,
    Times(u32),
}

impl Remaining {
    pub const ONCE: Remaining = Remaining::Times(1);
    pub const NONE: Remaining = Remaining::Times(0);

    /// No further occurrence may notify.
    pub fn is_exhausted(self) -> bool {
        self == Remaining::NONE
    }

    /// Count one occurrence as used.
    pub fn decrement(self) -> Self {
        match self {
            Remaining::Unlimited => Remaining::Unlimited,
            Remaining::Times(n) => Remaining::Times(n.saturating_sub(1)),
        }
    }

    /// Persisted form: `-1` for unlimited, otherwise the count.
    pub fn to_code(self) -> i64 {
        match self {
            Remaining::Unlimited => -1,
            Remaining::Times(n) => i64::from(n),
        }
    }

    pub fn from_code(code: i64) -> Self {
        if code < 0 {
            Remaining::Unlimited
        } else {
            Remaining::Times(u32::try_from(code).unwrap_or(u32::MAX))
        }
    }
}

impl Default for Remaining {
    fn default() -> Self {
        Remaining::ONCE
    }
}
