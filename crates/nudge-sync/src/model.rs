//! Reminder and list records.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{NaiveDate, TimeZone};
use nudge_scheduler::{Occurrence, Remaining, RepeatRule, is_past_until, local_date};
use nudge_todo::TaskFields;
use serde::{Deserialize, Serialize};

/// User id of the local, never-synced account.
pub const LOCAL_USER: &str = "local";

/// Id of the local account's default list.
pub const LOCAL_LIST: &str = "local";

/// Display name of the local default list.
pub const LOCAL_LIST_NAME: &str = "Local Reminders";

/// Synced-list selection entry meaning "every list of the account".
pub const SYNC_ALL: &str = "all";

/// A reminder. Times are unix seconds, 0 when unset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reminder {
    pub id: String,
    pub title: String,
    pub description: String,
    /// UTC midnight of the due day.
    pub due_date: i64,
    /// Next notification instant.
    pub timestamp: i64,
    pub completed: bool,
    pub important: bool,
    /// Repeat rule; always `None` for remote-mirrored reminders.
    pub repeat: Option<RepeatRule>,
    /// Notifications left before the reminder goes quiet.
    pub remaining: Remaining,
    /// Last notification instant that was handled.
    pub old_timestamp: i64,
    pub created_timestamp: i64,
    pub updated_timestamp: i64,
    pub list_id: String,
    pub user_id: String,
    /// Remote task id, empty if never pushed.
    pub remote_task_id: String,
}

impl Reminder {
    /// A blank local reminder.
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            title: String::new(),
            description: String::new(),
            due_date: 0,
            timestamp: 0,
            completed: false,
            important: false,
            repeat: None,
            remaining: Remaining::ONCE,
            old_timestamp: 0,
            created_timestamp: 0,
            updated_timestamp: 0,
            list_id: LOCAL_LIST.to_string(),
            user_id: LOCAL_USER.to_string(),
            remote_task_id: String::new(),
        }
    }

    pub fn is_local(&self) -> bool {
        self.user_id == LOCAL_USER
    }

    pub fn occurrence(&self) -> Occurrence {
        Occurrence {
            timestamp: self.timestamp,
            old_timestamp: self.old_timestamp,
            remaining: self.remaining,
        }
    }

    pub fn set_occurrence(&mut self, occurrence: Occurrence) {
        self.timestamp = occurrence.timestamp;
        self.old_timestamp = occurrence.old_timestamp;
        self.remaining = occurrence.remaining;
    }

    /// True if the current timestamp lies beyond the repeat rule's end date.
    pub fn is_past_until<Tz: TimeZone>(&self, tz: &Tz) -> bool {
        self.repeat
            .as_ref()
            .is_some_and(|rule| is_past_until(rule, self.timestamp, tz))
    }

    /// True if a countdown should be armed for the current timestamp.
    ///
    /// An occurrence at or before `old_timestamp` has already been handled.
    pub fn is_armable<Tz: TimeZone>(&self, tz: &Tz) -> bool {
        self.timestamp != 0
            && !self.completed
            && !self.remaining.is_exhausted()
            && !self.is_past_until(tz)
            && self.timestamp > self.old_timestamp
    }

    /// Mark an occurrence that can never notify as handled.
    ///
    /// Returns true if `old_timestamp` changed.
    pub fn settle<Tz: TimeZone>(&mut self, tz: &Tz) -> bool {
        let silent = self.remaining.is_exhausted() || self.is_past_until(tz);
        if self.timestamp != 0 && silent && self.old_timestamp != self.timestamp {
            self.old_timestamp = self.timestamp;
            return true;
        }
        false
    }

    /// Pin the due date to the notification's day.
    pub fn normalize_due_date<Tz: TimeZone>(&mut self, tz: &Tz) {
        if self.timestamp != 0 {
            self.due_date = utc_midnight(local_date(self.timestamp, tz));
        }
    }

    /// Content pushed to a remote task.
    pub fn task_fields(&self) -> TaskFields {
        TaskFields {
            title: self.title.clone(),
            description: self.description.clone(),
            completed: self.completed,
            important: self.important,
            due_date: self.due_date,
            timestamp: self.timestamp,
        }
    }
}

/// Unix seconds of midnight UTC on `date`.
pub fn utc_midnight(date: NaiveDate) -> i64 {
    date.and_hms_opt(0, 0, 0)
        .map(|dt| dt.and_utc().timestamp())
        .unwrap_or(0)
}

/// A task list of some account.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskList {
    pub id: String,
    pub user_id: String,
    pub name: String,
    /// Remote list id, empty for local lists and lists not yet pushed.
    pub remote_id: String,
}

impl TaskList {
    /// The account's built-in list, which cannot be deleted.
    pub fn is_default(&self) -> bool {
        self.id == self.user_id
    }
}

/// All known lists keyed by list id.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ListDirectory {
    lists: BTreeMap<String, TaskList>,
}

impl ListDirectory {
    /// A directory holding only the local default list.
    pub fn with_local_default() -> Self {
        let mut directory = Self::default();
        directory.ensure_local_default();
        directory
    }

    pub fn ensure_local_default(&mut self) {
        self.lists
            .entry(LOCAL_LIST.to_string())
            .or_insert_with(|| TaskList {
                id: LOCAL_LIST.to_string(),
                user_id: LOCAL_USER.to_string(),
                name: LOCAL_LIST_NAME.to_string(),
                remote_id: String::new(),
            });
    }

    pub fn get(&self, id: &str) -> Option<&TaskList> {
        self.lists.get(id)
    }

    pub fn get_mut(&mut self, id: &str) -> Option<&mut TaskList> {
        self.lists.get_mut(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.lists.contains_key(id)
    }

    /// True if `list` exists and belongs to `user`.
    pub fn owns(&self, user: &str, list: &str) -> bool {
        self.lists.get(list).is_some_and(|l| l.user_id == user)
    }

    pub fn insert(&mut self, list: TaskList) {
        self.lists.insert(list.id.clone(), list);
    }

    pub fn remove(&mut self, id: &str) -> Option<TaskList> {
        self.lists.remove(id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &TaskList> {
        self.lists.values()
    }

    pub fn len(&self) -> usize {
        self.lists.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lists.is_empty()
    }

    /// The list of `user` mirroring remote list `remote_id`.
    pub fn find_remote(&self, user: &str, remote_id: &str) -> Option<&TaskList> {
        self.lists
            .values()
            .find(|l| l.user_id == user && l.remote_id == remote_id)
    }

    /// Remote id of a list, if it has been pushed.
    pub fn remote_id(&self, id: &str) -> Option<&str> {
        self.lists
            .get(id)
            .map(|l| l.remote_id.as_str())
            .filter(|remote| !remote.is_empty())
    }

    /// Display names as user id to list id to name.
    pub fn names(&self) -> BTreeMap<String, BTreeMap<String, String>> {
        let mut names: BTreeMap<String, BTreeMap<String, String>> = BTreeMap::new();
        for list in self.lists.values() {
            names
                .entry(list.user_id.clone())
                .or_default()
                .insert(list.id.clone(), list.name.clone());
        }
        names
    }

    /// Keep only the lists matching `keep`.
    pub fn retain(&mut self, keep: impl Fn(&TaskList) -> bool) {
        self.lists.retain(|_, list| keep(list));
    }
}

/// Per-account selection of lists whose tasks are mirrored.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SyncedLists(BTreeMap<String, BTreeSet<String>>);

impl SyncedLists {
    pub fn new(selection: BTreeMap<String, BTreeSet<String>>) -> Self {
        Self(selection)
    }

    pub fn is_synced(&self, user: &str, list: &str) -> bool {
        self.0
            .get(user)
            .is_some_and(|lists| lists.contains(SYNC_ALL) || lists.contains(list))
    }

    /// Mirror every list of `user`.
    pub fn select_all(&mut self, user: &str) {
        self.0
            .insert(user.to_string(), BTreeSet::from([SYNC_ALL.to_string()]));
    }

    pub fn add(&mut self, user: &str, list: &str) {
        self.0
            .entry(user.to_string())
            .or_default()
            .insert(list.to_string());
    }

    /// Drop one list from the selection, keeping the account's entry.
    pub fn remove(&mut self, user: &str, list: &str) -> bool {
        self.0
            .get_mut(user)
            .is_some_and(|lists| lists.remove(list))
    }

    /// Forget the selection of a signed-out account.
    pub fn remove_user(&mut self, user: &str) -> bool {
        self.0.remove(user).is_some()
    }

    pub fn as_map(&self) -> &BTreeMap<String, BTreeSet<String>> {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use nudge_scheduler::RepeatKind;

    fn at(timestamp: i64) -> Reminder {
        Reminder {
            timestamp,
            ..Reminder::new("r1")
        }
    }

    #[test]
    fn test_armable_requires_unhandled_future_occurrence() {
        let mut reminder = at(1_000);
        assert!(reminder.is_armable(&Utc));

        reminder.old_timestamp = 1_000;
        assert!(!reminder.is_armable(&Utc));

        let mut reminder = at(1_000);
        reminder.completed = true;
        assert!(!reminder.is_armable(&Utc));

        assert!(!at(0).is_armable(&Utc));
    }

    #[test]
    fn test_exhausted_and_no_repeat_are_distinct() {
        // No rule, one notification left: fires once.
        let once = at(1_000);
        assert_eq!(once.repeat, None);
        assert!(once.is_armable(&Utc));

        // A rule that has run out: never fires, and is settled silently.
        let mut spent = Reminder {
            repeat: Some(RepeatRule::new(RepeatKind::Day, 1).unwrap()),
            remaining: Remaining::NONE,
            ..at(1_000)
        };
        assert!(!spent.is_armable(&Utc));
        assert!(spent.settle(&Utc));
        assert_eq!(spent.old_timestamp, 1_000);
        assert!(!spent.settle(&Utc));
    }

    #[test]
    fn test_past_until_is_settled() {
        let rule = RepeatRule::new(RepeatKind::Day, 1)
            .unwrap()
            .until(NaiveDate::from_ymd_opt(1970, 1, 1).unwrap());
        let mut reminder = Reminder {
            repeat: Some(rule),
            remaining: Remaining::Unlimited,
            ..at(2 * 86_400)
        };
        assert!(!reminder.is_armable(&Utc));
        assert!(reminder.settle(&Utc));
    }

    #[test]
    fn test_due_date_follows_notification_day() {
        let mut reminder = at(1_709_542_800);
        reminder.due_date = 42;
        reminder.normalize_due_date(&Utc);
        assert_eq!(reminder.due_date, 1_709_510_400);
    }

    #[test]
    fn test_synced_lists_wildcard() {
        let mut synced = SyncedLists::default();
        assert!(!synced.is_synced("u1", "a"));

        synced.add("u1", "a");
        assert!(synced.is_synced("u1", "a"));
        assert!(!synced.is_synced("u1", "b"));

        assert!(synced.remove("u1", "a"));
        assert!(!synced.remove("u1", "a"));
        assert!(!synced.is_synced("u1", "a"));
        assert_eq!(synced.as_map()["u1"], BTreeSet::new());

        synced.select_all("u1");
        assert!(synced.is_synced("u1", "b"));
        assert!(synced.remove_user("u1"));
        assert!(!synced.is_synced("u1", "a"));
    }

    #[test]
    fn test_list_directory_lookups() {
        let mut lists = ListDirectory::with_local_default();
        lists.insert(TaskList {
            id: "u1".to_string(),
            user_id: "u1".to_string(),
            name: "Tasks".to_string(),
            remote_id: "R1".to_string(),
        });
        lists.insert(TaskList {
            id: "abc".to_string(),
            user_id: "u1".to_string(),
            name: "Errands".to_string(),
            remote_id: String::new(),
        });

        assert!(lists.get(LOCAL_LIST).unwrap().is_default());
        assert!(lists.get("u1").unwrap().is_default());
        assert!(!lists.get("abc").unwrap().is_default());
        assert_eq!(lists.find_remote("u1", "R1").map(|l| l.id.as_str()), Some("u1"));
        assert_eq!(lists.remote_id("abc"), None);
        assert!(lists.owns("u1", "abc"));
        assert!(!lists.owns(LOCAL_USER, "abc"));
        assert_eq!(lists.names()["u1"]["abc"], "Errands");
    }
}
