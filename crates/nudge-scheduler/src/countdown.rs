//! Countdown timers.
//!
//! Timers are keyed either by a reminder id or by a name for periodic work.
//! Each key holds at most one armed timer; arming again replaces it. The
//! owner drives the timers from its event loop: sleep for [`Countdowns::sleep`],
//! then drain [`Countdowns::pop_due`].
//!
//! Fire times are wall-clock unix seconds. Sleeps are capped at
//! [`MAX_SLEEP_SECS`] so a suspended machine notices overdue timers soon
//! after it wakes up.

use std::cmp::{Ordering, Reverse};
use std::collections::{BinaryHeap, HashMap};
use std::hash::Hash;
use std::time::Duration;

use tracing::{debug, trace};

/// Maximum time the owner sleeps before re-checking the wall clock.
pub const MAX_SLEEP_SECS: u64 = 60;

/// Stale heap entries tolerated before the heap is rebuilt from live timers.
const COMPACT_SLACK: usize = 64;

/// Handle identifying one arming of a timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CountdownToken(u64);

/// What a timer is attached to.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TimerKey<K> {
    Reminder(K),
    Periodic(String),
}

/// A timer that has elapsed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fired<K, T> {
    pub key: TimerKey<K>,
    pub fire_at: i64,
    pub payload: T,
    /// Interval in seconds for periodic timers.
    pub interval: Option<i64>,
}

#[derive(Debug)]
struct Armed<T> {
    token: CountdownToken,
    fire_at: i64,
    interval: Option<i64>,
    payload: T,
}

#[derive(Debug)]
struct Slot<K> {
    fire_at: i64,
    token: CountdownToken,
    key: TimerKey<K>,
}

impl<K> PartialEq for Slot<K> {
    fn eq(&self, other: &Self) -> bool {
        self.fire_at == other.fire_at && self.token == other.token
    }
}

impl<K> Eq for Slot<K> {}

impl<K> PartialOrd for Slot<K> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<K> Ord for Slot<K> {
    fn cmp(&self, other: &Self) -> Ordering {
        self.fire_at
            .cmp(&other.fire_at)
            .then(self.token.cmp(&other.token))
    }
}

/// Set of armed countdowns ordered by fire time.
///
/// Cancelled and replaced timers stay in the heap until they surface and are
/// discarded because their token no longer matches the armed one, or until
/// they outnumber the live timers and the heap is compacted.
#[derive(Debug)]
pub struct Countdowns<K, T = ()> {
    heap: BinaryHeap<Reverse<Slot<K>>>,
    armed: HashMap<TimerKey<K>, Armed<T>>,
    next_token: u64,
}

impl<K, T> Default for Countdowns<K, T> {
    fn default() -> Self {
        Self {
            heap: BinaryHeap::new(),
            armed: HashMap::new(),
            next_token: 0,
        }
    }
}

impl<K, T> Countdowns<K, T>
where
    K: Clone + Eq + Hash + std::fmt::Debug,
{
    pub fn new() -> Self {
        Self::default()
    }

    /// Arm the timer for a reminder, replacing any existing one.
    pub fn arm(&mut self, id: K, fire_at: i64, payload: T) -> CountdownToken {
        debug!(id = ?id, fire_at, "arming countdown");
        self.insert(TimerKey::Reminder(id), fire_at, None, payload)
    }

    /// Arm (or re-arm) a named periodic timer to fire `interval` seconds after `now`.
    pub fn arm_periodic(
        &mut self,
        name: impl Into<String>,
        interval: i64,
        payload: T,
        now: i64,
    ) -> CountdownToken {
        let name = name.into();
        let interval = interval.max(1);
        debug!(name = %name, interval, "arming periodic timer");
        self.insert(
            TimerKey::Periodic(name),
            now.saturating_add(interval),
            Some(interval),
            payload,
        )
    }

    /// Cancel the timer for a reminder. Returns true if one was armed.
    pub fn cancel(&mut self, id: &K) -> bool {
        let removed = self.armed.remove(&TimerKey::Reminder(id.clone())).is_some();
        if removed {
            debug!(id = ?id, "cancelled countdown");
        }
        removed
    }

    pub fn cancel_periodic(&mut self, name: &str) -> bool {
        self.armed
            .remove(&TimerKey::Periodic(name.to_string()))
            .is_some()
    }

    /// Cancel a timer only if it is still the arming identified by `token`.
    pub fn cancel_token(&mut self, token: CountdownToken) -> bool {
        let key = self
            .armed
            .iter()
            .find(|(_, armed)| armed.token == token)
            .map(|(key, _)| key.clone());
        match key {
            Some(key) => self.armed.remove(&key).is_some(),
            None => false,
        }
    }

    pub fn is_armed(&self, id: &K) -> bool {
        self.armed.contains_key(&TimerKey::Reminder(id.clone()))
    }

    pub fn is_periodic_armed(&self, name: &str) -> bool {
        self.armed.contains_key(&TimerKey::Periodic(name.to_string()))
    }

    /// Fire time of the reminder's armed timer.
    pub fn fire_time(&self, id: &K) -> Option<i64> {
        self.armed
            .get(&TimerKey::Reminder(id.clone()))
            .map(|armed| armed.fire_at)
    }

    /// Number of armed timers, periodic ones included.
    pub fn len(&self) -> usize {
        self.armed.len()
    }

    pub fn is_empty(&self) -> bool {
        self.armed.is_empty()
    }

    /// Ids of reminders with an armed timer.
    pub fn reminder_ids(&self) -> impl Iterator<Item = &K> {
        self.armed.keys().filter_map(|key| match key {
            TimerKey::Reminder(id) => Some(id),
            TimerKey::Periodic(_) => None,
        })
    }

    /// Earliest fire time among live timers.
    pub fn next_deadline(&mut self) -> Option<i64> {
        self.discard_stale();
        self.heap.peek().map(|Reverse(slot)| slot.fire_at)
    }

    /// Remove and return the earliest timer whose fire time is at or before `now`.
    ///
    /// The registration is gone by the time the caller sees it, so the caller
    /// may re-arm the same key while handling it. Repeated calls yield timers
    /// in nondecreasing fire-time order.
    pub fn pop_due(&mut self, now: i64) -> Option<Fired<K, T>> {
        self.discard_stale();
        let due = matches!(self.heap.peek(), Some(Reverse(slot)) if slot.fire_at <= now);
        if !due {
            return None;
        }
        let Reverse(slot) = self.heap.pop()?;
        let armed = self.armed.remove(&slot.key)?;
        trace!(key = ?slot.key, fire_at = slot.fire_at, "countdown elapsed");
        Some(Fired {
            key: slot.key,
            fire_at: armed.fire_at,
            payload: armed.payload,
            interval: armed.interval,
        })
    }

    /// How long the owner should sleep before polling again.
    pub fn sleep_duration(&mut self, now: i64) -> Duration {
        let secs = match self.next_deadline() {
            Some(deadline) => (deadline.saturating_sub(now).max(0) as u64).min(MAX_SLEEP_SECS),
            None => MAX_SLEEP_SECS,
        };
        Duration::from_secs(secs)
    }

    /// Sleep future for use in the owner's `select!`.
    pub fn sleep(&mut self, now: i64) -> tokio::time::Sleep {
        tokio::time::sleep(self.sleep_duration(now))
    }

    /// Drop every timer without firing it.
    pub fn clear(&mut self) {
        let count = self.armed.len();
        self.armed.clear();
        self.heap.clear();
        debug!(count, "cleared all countdowns");
    }

    fn insert(
        &mut self,
        key: TimerKey<K>,
        fire_at: i64,
        interval: Option<i64>,
        payload: T,
    ) -> CountdownToken {
        let token = CountdownToken(self.next_token);
        self.next_token += 1;
        self.heap.push(Reverse(Slot {
            fire_at,
            token,
            key: key.clone(),
        }));
        self.armed.insert(
            key,
            Armed {
                token,
                fire_at,
                interval,
                payload,
            },
        );
        self.compact();
        token
    }

    fn compact(&mut self) {
        let limit = self.armed.len().saturating_mul(2).max(COMPACT_SLACK);
        if self.heap.len() <= limit {
            return;
        }
        let before = self.heap.len();
        let armed = &self.armed;
        self.heap.retain(|Reverse(slot)| {
            armed
                .get(&slot.key)
                .is_some_and(|live| live.token == slot.token)
        });
        trace!(before, after = self.heap.len(), "compacted countdown heap");
    }

    fn discard_stale(&mut self) {
        while let Some(Reverse(slot)) = self.heap.peek() {
            let live = self
                .armed
                .get(&slot.key)
                .is_some_and(|armed| armed.token == slot.token);
            if live {
                break;
            }
            self.heap.pop();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn drain(countdowns: &mut Countdowns<&'static str>, now: i64) -> Vec<(TimerKey<&'static str>, i64)> {
        std::iter::from_fn(|| countdowns.pop_due(now))
            .map(|fired| (fired.key, fired.fire_at))
            .collect()
    }

    #[test]
    fn test_fires_in_time_order() {
        let mut countdowns = Countdowns::new();
        countdowns.arm("c", 300, ());
        countdowns.arm("a", 100, ());
        countdowns.arm("b", 200, ());

        assert_eq!(countdowns.pop_due(99), None);
        assert_eq!(
            drain(&mut countdowns, 1_000),
            vec![
                (TimerKey::Reminder("a"), 100),
                (TimerKey::Reminder("b"), 200),
                (TimerKey::Reminder("c"), 300),
            ]
        );
        assert!(countdowns.is_empty());
    }

    #[test]
    fn test_cancel_before_fire_never_fires() {
        let mut countdowns = Countdowns::new();
        countdowns.arm("a", 100, ());
        assert!(countdowns.cancel(&"a"));
        assert!(!countdowns.cancel(&"a"));

        assert_eq!(drain(&mut countdowns, 10_000), vec![]);
        assert_eq!(countdowns.next_deadline(), None);
    }

    #[test]
    fn test_rearm_replaces_previous_timer() {
        let mut countdowns = Countdowns::new();
        let first = countdowns.arm("a", 100, ());
        let second = countdowns.arm("a", 500, ());
        assert_ne!(first, second);
        assert_eq!(countdowns.fire_time(&"a"), Some(500));
        assert_eq!(countdowns.len(), 1);

        assert_eq!(drain(&mut countdowns, 499), vec![]);
        assert_eq!(drain(&mut countdowns, 500), vec![(TimerKey::Reminder("a"), 500)]);
    }

    #[test]
    fn test_stale_token_cannot_cancel_new_arming() {
        let mut countdowns = Countdowns::new();
        let stale = countdowns.arm("a", 100, ());
        let live = countdowns.arm("a", 200, ());

        assert!(!countdowns.cancel_token(stale));
        assert!(countdowns.is_armed(&"a"));
        assert!(countdowns.cancel_token(live));
        assert!(!countdowns.is_armed(&"a"));
    }

    #[test]
    fn test_registration_removed_before_handler_runs() {
        let mut countdowns = Countdowns::new();
        countdowns.arm("a", 100, ());
        let fired = countdowns.pop_due(100).unwrap();
        assert_eq!(fired.key, TimerKey::Reminder("a"));
        assert!(!countdowns.is_armed(&"a"));

        // Handler re-arms for the next occurrence.
        countdowns.arm("a", 200, ());
        assert_eq!(countdowns.pop_due(150), None);
        assert_eq!(countdowns.fire_time(&"a"), Some(200));
    }

    #[test]
    fn test_periodic_carries_interval() {
        let mut countdowns: Countdowns<&'static str, u8> = Countdowns::new();
        countdowns.arm_periodic("refresh", 900, 7, 1_000);
        countdowns.arm("a", 2_500, 1);

        let fired = countdowns.pop_due(2_000).unwrap();
        assert_eq!(fired.key, TimerKey::Periodic("refresh".to_string()));
        assert_eq!(fired.fire_at, 1_900);
        assert_eq!(fired.interval, Some(900));
        assert_eq!(fired.payload, 7);

        // Re-arming from the fire time keeps the cadence.
        countdowns.arm_periodic("refresh", 900, 7, fired.fire_at);
        assert!(countdowns.is_periodic_armed("refresh"));
        assert!(countdowns.cancel_periodic("refresh"));
        assert_eq!(countdowns.reminder_ids().collect::<Vec<_>>(), vec![&"a"]);
    }

    #[test]
    fn test_rearming_keeps_heap_bounded() {
        let mut countdowns = Countdowns::<&'static str>::new();
        countdowns.arm("near", 10, ());
        for fire_at in 0..10_000 {
            countdowns.arm("far", 100_000 + fire_at, ());
        }
        assert_eq!(countdowns.len(), 2);
        assert!(countdowns.heap.len() <= COMPACT_SLACK + 1);

        assert_eq!(drain(&mut countdowns, 10), vec![(TimerKey::Reminder("near"), 10)]);
        assert_eq!(
            drain(&mut countdowns, 200_000),
            vec![(TimerKey::Reminder("far"), 109_999)]
        );
        assert!(countdowns.heap.is_empty());
    }

    #[test]
    fn test_sleep_duration_is_capped() {
        let mut countdowns = Countdowns::<&'static str>::new();
        assert_eq!(countdowns.sleep_duration(0), Duration::from_secs(MAX_SLEEP_SECS));

        countdowns.arm("a", 10, ());
        assert_eq!(countdowns.sleep_duration(0), Duration::from_secs(10));
        assert_eq!(countdowns.sleep_duration(50), Duration::ZERO);

        countdowns.arm("a", 10_000, ());
        assert_eq!(countdowns.sleep_duration(0), Duration::from_secs(MAX_SLEEP_SECS));
    }

    #[test]
    fn test_clear_drops_everything() {
        let mut countdowns = Countdowns::new();
        countdowns.arm("a", 1, ());
        countdowns.arm_periodic("refresh", 60, (), 0);
        countdowns.clear();

        assert!(countdowns.is_empty());
        assert_eq!(drain(&mut countdowns, i64::MAX), vec![]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sleep_resolves_at_deadline() {
        let mut countdowns = Countdowns::<&'static str>::new();
        countdowns.arm("a", 30, ());

        let started = tokio::time::Instant::now();
        countdowns.sleep(0).await;
        assert_eq!(started.elapsed(), Duration::from_secs(30));
    }
}
