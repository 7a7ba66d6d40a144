//! Recurrence engine.
//!
//! Given a repeat rule and the occurrence that just fired, compute the next
//! occurrence that lies after "now". Missed occurrences (the machine was
//! asleep, the service was stopped) are consumed silently: each one counts
//! against the remaining repeat budget and becomes the new reference
//! timestamp, but none of them notify.
//!
//! Minute and hour rules step by absolute durations. Day and week rules step
//! through the local calendar so a 09:00 reminder stays at 09:00 across
//! daylight-saving changes.

use chrono::{DateTime, Datelike, Days, NaiveDate, NaiveDateTime, Offset, TimeZone};
use serde::{Deserialize, Serialize};

use crate::{Remaining, RepeatKind, RepeatRule, Weekdays};

/// Notification bookkeeping carried by a repeating reminder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Occurrence {
    /// Unix seconds of the occurrence.
    pub timestamp: i64,
    /// Unix seconds of the last occurrence that was handled.
    pub old_timestamp: i64,
    pub remaining: Remaining,
}

/// Result of advancing a repeat rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Advance {
    /// A later occurrence exists. Its `remaining` may be exhausted if the
    /// budget ran out while skipping missed occurrences; callers must not arm
    /// a timer in that case.
    Next(Occurrence),
    /// The rule produces nothing further. The caller keeps its current values.
    Exhausted,
}

/// Local calendar date of a unix timestamp in `tz`.
pub fn local_date<Tz: TimeZone>(timestamp: i64, tz: &Tz) -> NaiveDate {
    to_local(timestamp, tz).date()
}

/// True if `timestamp` falls on a local date after the rule's end date.
pub fn is_past_until<Tz: TimeZone>(rule: &RepeatRule, timestamp: i64, tz: &Tz) -> bool {
    rule.until.is_some() && rule.is_past_until(local_date(timestamp, tz))
}

/// Advance `current` past `now` according to `rule`.
///
/// `current.timestamp` is the occurrence that was just handled. The caller is
/// expected to have already counted it against `remaining`.
pub fn next_occurrence<Tz: TimeZone>(
    rule: &RepeatRule,
    current: Occurrence,
    now: i64,
    tz: &Tz,
) -> Advance {
    if current.remaining.is_exhausted() || is_past_until(rule, current.timestamp, tz) {
        return Advance::Exhausted;
    }

    let start = to_local(current.timestamp, tz);
    let days = if rule.days.is_empty() {
        Weekdays::EMPTY.with(start.date().weekday())
    } else {
        rule.days
    };

    let mut cursor = Cursor {
        timestamp: current.timestamp,
        local: start,
    };
    let mut old_timestamp = current.old_timestamp;
    let mut remaining = current.remaining;

    let Some(mut next) = step(rule, days, cursor, tz) else {
        return Advance::Exhausted;
    };

    while next.timestamp <= now {
        old_timestamp = next.timestamp;
        remaining = remaining.decrement();
        if remaining.is_exhausted() || rule.is_past_until(next.local.date()) {
            break;
        }
        cursor = next;
        next = match step(rule, days, cursor, tz) {
            Some(next) => next,
            None => return Advance::Exhausted,
        };
    }

    if rule.is_past_until(next.local.date()) {
        return Advance::Exhausted;
    }

    Advance::Next(Occurrence {
        timestamp: next.timestamp,
        old_timestamp,
        remaining,
    })
}

/// Position of the engine: the instant and its wall-clock reading.
#[derive(Debug, Clone, Copy)]
struct Cursor {
    timestamp: i64,
    local: NaiveDateTime,
}

fn step<Tz: TimeZone>(rule: &RepeatRule, days: Weekdays, from: Cursor, tz: &Tz) -> Option<Cursor> {
    let frequency = i64::from(rule.frequency);
    match rule.kind {
        RepeatKind::Minute => absolute(from.timestamp.checked_add(frequency * 60)?, tz),
        RepeatKind::Hour => absolute(from.timestamp.checked_add(frequency * 3600)?, tz),
        RepeatKind::Day => calendar(from, u64::from(rule.frequency), tz),
        RepeatKind::Week => {
            let weekday = from.local.date().weekday().num_days_from_monday();
            calendar(from, week_offset(days, weekday, rule.frequency), tz)
        }
    }
}

/// Days from `weekday` (Monday = 0) to the next active day.
///
/// The next active day later in the same week wins. Otherwise the rule wraps
/// to the first active day of the week and skips `frequency - 1` extra weeks.
fn week_offset(days: Weekdays, weekday: u32, frequency: u16) -> u64 {
    if let Some(later) = days.offsets().find(|&day| day > weekday) {
        return u64::from(later - weekday);
    }
    let first = days.offsets().next().unwrap_or(weekday);
    let to_first = match (first + 7 - weekday) % 7 {
        0 => 7,
        n => n,
    };
    u64::from(to_first) + 7 * u64::from(frequency.saturating_sub(1))
}

fn absolute<Tz: TimeZone>(timestamp: i64, tz: &Tz) -> Option<Cursor> {
    let utc = DateTime::from_timestamp(timestamp, 0)?;
    Some(Cursor {
        timestamp,
        local: utc.with_timezone(tz).naive_local(),
    })
}

fn calendar<Tz: TimeZone>(from: Cursor, days: u64, tz: &Tz) -> Option<Cursor> {
    let local = from.local.checked_add_days(Days::new(days))?;
    let offset = tz
        .offset_from_utc_datetime(&DateTime::from_timestamp(from.timestamp, 0)?.naive_utc())
        .fix()
        .local_minus_utc();
    Some(Cursor {
        timestamp: resolve_local(tz, local, offset),
        local,
    })
}

/// Map a wall-clock reading back to an instant.
///
/// Ambiguous readings (clocks going back) take the earlier instant. Readings
/// inside a gap (clocks going forward) keep the offset in force before the gap.
fn resolve_local<Tz: TimeZone>(tz: &Tz, local: NaiveDateTime, fallback_offset: i32) -> i64 {
    match tz.from_local_datetime(&local).earliest() {
        Some(dt) => dt.timestamp(),
        None => local.and_utc().timestamp() - i64::from(fallback_offset),
    }
}

fn to_local<Tz: TimeZone>(timestamp: i64, tz: &Tz) -> NaiveDateTime {
    DateTime::from_timestamp(timestamp, 0)
        .unwrap_or_default()
        .with_timezone(tz)
        .naive_local()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{FixedOffset, NaiveTime, Utc, Weekday};
    use proptest::prelude::*;
    use test_case::test_case;

    const DAY: i64 = 86_400;

    fn ts(y: i32, m: u32, d: u32, h: u32, min: u32) -> i64 {
        NaiveDate::from_ymd_opt(y, m, d)
            .unwrap()
            .and_time(NaiveTime::from_hms_opt(h, min, 0).unwrap())
            .and_utc()
            .timestamp()
    }

    fn fired(timestamp: i64, remaining: Remaining) -> Occurrence {
        Occurrence {
            timestamp,
            old_timestamp: timestamp,
            remaining,
        }
    }

    fn expect_next(advance: Advance) -> Occurrence {
        match advance {
            Advance::Next(occurrence) => occurrence,
            Advance::Exhausted => panic!("expected another occurrence"),
        }
    }

    #[test]
    fn test_daily_three_times_fires_a_day_apart_then_stops() {
        let rule = RepeatRule::daily(1).unwrap();
        let first = ts(2024, 3, 4, 9, 0);
        let mut occurrence = Occurrence {
            timestamp: first,
            old_timestamp: 0,
            remaining: Remaining::Times(3),
        };
        let mut fire_times = Vec::new();

        loop {
            // What the countdown callback does on fire.
            fire_times.push(occurrence.timestamp);
            occurrence.remaining = occurrence.remaining.decrement();
            occurrence.old_timestamp = occurrence.timestamp;
            let now = occurrence.timestamp;
            match next_occurrence(&rule, occurrence, now, &Utc) {
                Advance::Next(next) => occurrence = next,
                Advance::Exhausted => break,
            }
        }

        assert_eq!(fire_times, vec![first, first + DAY, first + 2 * DAY]);
        assert_eq!(occurrence.remaining, Remaining::NONE);
        assert_eq!(occurrence.old_timestamp, first + 2 * DAY);
    }

    // 2024-03-06 is a Wednesday.
    #[test_case(Weekday::Wed, ts(2024, 3, 8, 9, 0) ; "wednesday goes to friday")]
    #[test_case(Weekday::Fri, ts(2024, 3, 11, 9, 0) ; "friday wraps to monday")]
    #[test_case(Weekday::Mon, ts(2024, 3, 6, 9, 0) ; "monday goes to wednesday")]
    fn test_weekly_mon_wed_fri(fired_on: Weekday, expected: i64) {
        let rule = RepeatRule::weekly(
            1,
            [Weekday::Mon, Weekday::Wed, Weekday::Fri].into_iter().collect(),
        )
        .unwrap();
        let day = match fired_on {
            Weekday::Mon => 4,
            Weekday::Wed => 6,
            _ => 8,
        };
        let at = ts(2024, 3, day, 9, 0);
        let next = expect_next(next_occurrence(&rule, fired(at, Remaining::Unlimited), at, &Utc));
        assert_eq!(next.timestamp, expected);
    }

    #[test]
    fn test_every_other_monday_skips_a_week() {
        let rule = RepeatRule::weekly(2, Weekdays::EMPTY.with(Weekday::Mon)).unwrap();
        let monday = ts(2024, 3, 4, 9, 0);
        let next = expect_next(next_occurrence(
            &rule,
            fired(monday, Remaining::Unlimited),
            monday,
            &Utc,
        ));
        assert_eq!(next.timestamp, monday + 14 * DAY);
    }

    #[test]
    fn test_empty_mask_uses_own_weekday() {
        let rule = RepeatRule::weekly(1, Weekdays::EMPTY).unwrap();
        let thursday = ts(2024, 3, 7, 18, 30);
        let next = expect_next(next_occurrence(
            &rule,
            fired(thursday, Remaining::Unlimited),
            thursday,
            &Utc,
        ));
        assert_eq!(next.timestamp, thursday + 7 * DAY);
    }

    #[test]
    fn test_until_before_next_is_terminal() {
        let at = ts(2024, 3, 4, 9, 0);
        let rule = RepeatRule::daily(2)
            .unwrap()
            .until(NaiveDate::from_ymd_opt(2024, 3, 5).unwrap());
        assert_eq!(
            next_occurrence(&rule, fired(at, Remaining::Unlimited), at, &Utc),
            Advance::Exhausted
        );
    }

    #[test]
    fn test_until_is_inclusive() {
        let at = ts(2024, 3, 4, 9, 0);
        let rule = RepeatRule::daily(1)
            .unwrap()
            .until(NaiveDate::from_ymd_opt(2024, 3, 5).unwrap());
        let next = expect_next(next_occurrence(&rule, fired(at, Remaining::Unlimited), at, &Utc));
        assert_eq!(next.timestamp, at + DAY);
    }

    #[test]
    fn test_catch_up_consumes_missed_occurrences() {
        let rule = RepeatRule::new(RepeatKind::Hour, 1).unwrap();
        let at = ts(2024, 3, 4, 9, 0);
        // Asleep for five and a half hours.
        let now = at + 5 * 3600 + 1800;
        let next = expect_next(next_occurrence(&rule, fired(at, Remaining::Times(10)), now, &Utc));
        assert_eq!(next.timestamp, at + 6 * 3600);
        assert_eq!(next.old_timestamp, at + 5 * 3600);
        assert_eq!(next.remaining, Remaining::Times(5));
    }

    #[test]
    fn test_catch_up_can_exhaust_budget() {
        let rule = RepeatRule::new(RepeatKind::Minute, 15).unwrap();
        let at = ts(2024, 3, 4, 9, 0);
        let now = at + 3600;
        let next = expect_next(next_occurrence(&rule, fired(at, Remaining::Times(2)), now, &Utc));
        assert_eq!(next.remaining, Remaining::NONE);
        assert_eq!(next.timestamp, at + 30 * 60);
        assert_eq!(next.old_timestamp, at + 30 * 60);
    }

    #[test]
    fn test_occurrence_exactly_at_now_is_consumed() {
        let rule = RepeatRule::daily(1).unwrap();
        let at = ts(2024, 3, 4, 9, 0);
        let next = expect_next(next_occurrence(
            &rule,
            fired(at, Remaining::Unlimited),
            at + DAY,
            &Utc,
        ));
        assert_eq!(next.timestamp, at + 2 * DAY);
        assert_eq!(next.old_timestamp, at + DAY);
    }

    #[test]
    fn test_exhausted_budget_is_terminal() {
        // Remaining::NONE means "already used up", which is not the same as
        // a reminder without a rule: that one never reaches the engine.
        let rule = RepeatRule::daily(1).unwrap();
        let at = ts(2024, 3, 4, 9, 0);
        assert_eq!(
            next_occurrence(&rule, fired(at, Remaining::NONE), at, &Utc),
            Advance::Exhausted
        );
    }

    #[test]
    fn test_daily_steps_in_local_time() {
        let tz = FixedOffset::east_opt(-5 * 3600).unwrap();
        // 23:00 local on Monday is 04:00 UTC on Tuesday.
        let at = ts(2024, 3, 5, 4, 0);
        let rule = RepeatRule::weekly(1, Weekdays::EMPTY.with(Weekday::Mon)).unwrap();
        let next = expect_next(next_occurrence(&rule, fired(at, Remaining::Unlimited), at, &tz));
        assert_eq!(next.timestamp, at + 7 * DAY);
        assert_eq!(local_date(next.timestamp, &tz).weekday(), Weekday::Mon);
    }

    #[test]
    fn test_week_offset_wraps() {
        let mon_wed_fri: Weekdays = [Weekday::Mon, Weekday::Wed, Weekday::Fri]
            .into_iter()
            .collect();
        assert_eq!(week_offset(mon_wed_fri, 2, 1), 2);
        assert_eq!(week_offset(mon_wed_fri, 4, 1), 3);
        assert_eq!(week_offset(mon_wed_fri, 4, 3), 17);
        // Saturday is not active but still wraps to Monday.
        assert_eq!(week_offset(mon_wed_fri, 5, 1), 2);
    }

    fn any_rule() -> impl Strategy<Value = RepeatRule> {
        (
            prop_oneof![
                Just(RepeatKind::Minute),
                Just(RepeatKind::Hour),
                Just(RepeatKind::Day),
                Just(RepeatKind::Week),
            ],
            1i64..5,
            0i64..=0x7f,
        )
            .prop_map(|(kind, frequency, days)| {
                RepeatRule::new(kind, frequency)
                    .unwrap()
                    .on_days(Weekdays::from_bits(days).unwrap())
            })
    }

    fn any_remaining() -> impl Strategy<Value = Remaining> {
        prop_oneof![Just(Remaining::Unlimited), (1u32..20).prop_map(Remaining::Times)]
    }

    proptest! {
        #[test]
        fn prop_next_is_after_now_unless_budget_ran_out(
            rule in any_rule(),
            remaining in any_remaining(),
            start in 1_600_000_000i64..1_800_000_000,
            behind in 0i64..(30 * DAY),
        ) {
            let now = start + behind;
            if let Advance::Next(next) = next_occurrence(&rule, fired(start, remaining), now, &Utc) {
                prop_assert!(next.old_timestamp <= now);
                prop_assert!(next.timestamp > start);
                if !next.remaining.is_exhausted() {
                    prop_assert!(next.timestamp > now);
                }
            }
        }

        #[test]
        fn prop_remaining_never_grows(
            rule in any_rule(),
            remaining in any_remaining(),
            start in 1_600_000_000i64..1_800_000_000,
            behind in 0i64..(10 * DAY),
        ) {
            if let Advance::Next(next) = next_occurrence(&rule, fired(start, remaining), start + behind, &Utc) {
                match (remaining, next.remaining) {
                    (Remaining::Unlimited, after) => prop_assert_eq!(after, Remaining::Unlimited),
                    (Remaining::Times(before), Remaining::Times(after)) => prop_assert!(after <= before),
                    (Remaining::Times(_), Remaining::Unlimited) => prop_assert!(false),
                }
            }
        }

        #[test]
        fn prop_never_lands_after_until(
            rule in any_rule(),
            start in 1_600_000_000i64..1_800_000_000,
            span in 0u64..20,
            behind in 0i64..(10 * DAY),
        ) {
            let until = local_date(start, &Utc) + Days::new(span);
            let rule = rule.until(until);
            if let Advance::Next(next) = next_occurrence(&rule, fired(start, Remaining::Unlimited), start + behind, &Utc) {
                prop_assert!(local_date(next.timestamp, &Utc) <= until);
            }
        }

        #[test]
        fn prop_weekly_lands_on_active_day(
            frequency in 1i64..4,
            days in 1i64..=0x7f,
            start in 1_600_000_000i64..1_800_000_000,
        ) {
            let days = Weekdays::from_bits(days).unwrap();
            let rule = RepeatRule::weekly(frequency, days).unwrap();
            let next = expect_next(next_occurrence(&rule, fired(start, Remaining::Unlimited), start, &Utc));
            prop_assert!(days.contains(local_date(next.timestamp, &Utc).weekday()));
            prop_assert!(next.timestamp - start <= 7 * frequency * DAY);
        }
    }
}
