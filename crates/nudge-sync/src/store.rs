//! The reminder and list store.
//!
//! Local reminders and remote-mirrored reminders live in separate tables:
//! only local reminders carry repeat rules, only remote ones carry a user id
//! and a remote task id. Lists are persisted as a name mapping plus an id
//! mapping to remote list ids.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

use chrono::DateTime;
use nudge_scheduler::{Remaining, RepeatKind, RepeatRule, Weekdays};
use tracing::{debug, warn};

use crate::model::utc_midnight;
use crate::tsv::{Row, read_table, render_table, write_atomic};
use crate::{LOCAL_LIST, LOCAL_USER, ListDirectory, Reminder, SyncError, TaskList, new_id};

pub const REMINDERS_FILE: &str = "reminders.tsv";
pub const REMOTE_REMINDERS_FILE: &str = "remote_reminders.tsv";
pub const LISTS_FILE: &str = "lists.json";
pub const LIST_IDS_FILE: &str = "list_ids.tsv";

const LOCAL_COLUMNS: &[&str] = &[
    "id",
    "title",
    "description",
    "due-date",
    "timestamp",
    "completed",
    "important",
    "repeat-type",
    "repeat-frequency",
    "repeat-days",
    "repeat-until",
    "repeat-times",
    "old-timestamp",
    "created-timestamp",
    "updated-timestamp",
    "list-id",
];

const REMOTE_COLUMNS: &[&str] = &[
    "id",
    "title",
    "description",
    "due-date",
    "timestamp",
    "completed",
    "important",
    "repeat-times",
    "old-timestamp",
    "created-timestamp",
    "updated-timestamp",
    "list-id",
    "user-id",
    "remote-task-id",
];

const LIST_ID_COLUMNS: &[&str] = &["list-id", "remote-list-id", "user-id"];

/// Canonical reminder and list state.
#[derive(Debug, Clone)]
pub struct Store {
    dir: Option<PathBuf>,
    local: BTreeMap<String, Reminder>,
    remote: BTreeMap<String, Reminder>,
    lists: ListDirectory,
}

impl Default for Store {
    fn default() -> Self {
        Self::in_memory()
    }
}

impl Store {
    /// A store that never touches disk.
    pub fn in_memory() -> Self {
        Self {
            dir: None,
            local: BTreeMap::new(),
            remote: BTreeMap::new(),
            lists: ListDirectory::with_local_default(),
        }
    }

    /// Load the tables in `dir`. Missing or unreadable tables start empty.
    pub fn open(dir: impl Into<PathBuf>) -> Self {
        let dir = dir.into();
        let mut store = Self {
            dir: Some(dir.clone()),
            ..Self::in_memory()
        };

        for row in load_rows(&dir.join(REMINDERS_FILE)) {
            let reminder = local_from_row(&row);
            store.local.insert(reminder.id.clone(), reminder);
        }
        for row in load_rows(&dir.join(REMOTE_REMINDERS_FILE)) {
            let reminder = remote_from_row(&row);
            store.remote.insert(reminder.id.clone(), reminder);
        }
        store.lists = load_lists(&dir);

        debug!(
            local = store.local.len(),
            remote = store.remote.len(),
            lists = store.lists.len(),
            "loaded store"
        );
        store
    }

    pub fn dir(&self) -> Option<&Path> {
        self.dir.as_deref()
    }

    pub fn get(&self, id: &str) -> Option<&Reminder> {
        self.local.get(id).or_else(|| self.remote.get(id))
    }

    pub fn get_mut(&mut self, id: &str) -> Option<&mut Reminder> {
        match self.local.get_mut(id) {
            Some(reminder) => Some(reminder),
            None => self.remote.get_mut(id),
        }
    }

    /// Insert or replace a reminder, filing it by its account.
    pub fn insert(&mut self, reminder: Reminder) -> Option<Reminder> {
        let previous = self.remove(&reminder.id);
        let table = if reminder.is_local() {
            &mut self.local
        } else {
            &mut self.remote
        };
        table.insert(reminder.id.clone(), reminder);
        previous
    }

    pub fn remove(&mut self, id: &str) -> Option<Reminder> {
        self.local.remove(id).or_else(|| self.remote.remove(id))
    }

    /// Every reminder, local ones first.
    pub fn reminders(&self) -> impl Iterator<Item = &Reminder> {
        self.local.values().chain(self.remote.values())
    }

    pub fn local(&self) -> &BTreeMap<String, Reminder> {
        &self.local
    }

    pub fn remote(&self) -> &BTreeMap<String, Reminder> {
        &self.remote
    }

    pub fn lists(&self) -> &ListDirectory {
        &self.lists
    }

    pub fn lists_mut(&mut self) -> &mut ListDirectory {
        &mut self.lists
    }

    /// True if `id` names any reminder or list.
    pub fn contains_id(&self, id: &str) -> bool {
        self.local.contains_key(id) || self.remote.contains_key(id) || self.lists.contains(id)
    }

    /// A fresh id unique across reminders and lists.
    pub fn mint_id(&self) -> String {
        new_id(|id| self.contains_id(id))
    }

    /// Replace the remote-mirrored state wholesale.
    pub(crate) fn replace_remote(&mut self, remote: BTreeMap<String, Reminder>, lists: ListDirectory) {
        self.remote = remote;
        self.lists = lists;
        self.lists.ensure_local_default();
    }

    /// Write both reminder tables.
    pub fn save_reminders(&self) -> Result<(), SyncError> {
        let Some(dir) = &self.dir else {
            return Ok(());
        };
        write_atomic(
            &dir.join(REMINDERS_FILE),
            &render_table(LOCAL_COLUMNS, self.local.values().map(local_row)),
        )?;
        write_atomic(
            &dir.join(REMOTE_REMINDERS_FILE),
            &render_table(REMOTE_COLUMNS, self.remote.values().map(remote_row)),
        )
    }

    /// Write the list name and id tables.
    pub fn save_lists(&self) -> Result<(), SyncError> {
        let Some(dir) = &self.dir else {
            return Ok(());
        };
        let path = dir.join(LISTS_FILE);
        let names = serde_json::to_string_pretty(&self.lists.names())
            .map_err(|e| SyncError::persistence(&path, e))?;
        write_atomic(&path, &names)?;

        let rows = self
            .lists
            .iter()
            .filter(|list| list.user_id != LOCAL_USER)
            .map(|list| vec![list.id.clone(), list.remote_id.clone(), list.user_id.clone()]);
        write_atomic(&dir.join(LIST_IDS_FILE), &render_table(LIST_ID_COLUMNS, rows))
    }

    pub fn save(&self) -> Result<(), SyncError> {
        self.save_reminders()?;
        self.save_lists()
    }
}

fn load_rows(path: &Path) -> Vec<Row> {
    match read_table(path) {
        Ok(rows) => rows,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "unreadable table, starting empty");
            Vec::new()
        }
    }
}

fn load_lists(dir: &Path) -> ListDirectory {
    let path = dir.join(LISTS_FILE);
    let names: BTreeMap<String, BTreeMap<String, String>> = match std::fs::read_to_string(&path) {
        Ok(content) => serde_json::from_str(&content).unwrap_or_else(|e| {
            warn!(path = %path.display(), error = %e, "unreadable list names");
            BTreeMap::new()
        }),
        Err(_) => BTreeMap::new(),
    };

    let remote_ids: HashMap<String, String> = load_rows(&dir.join(LIST_IDS_FILE))
        .iter()
        .map(|row| (row.text("list-id", ""), row.text("remote-list-id", "")))
        .collect();

    let mut lists = ListDirectory::default();
    for (user, entries) in names {
        for (id, name) in entries {
            let remote_id = remote_ids.get(&id).cloned().unwrap_or_default();
            lists.insert(TaskList {
                id,
                user_id: user.clone(),
                name,
                remote_id,
            });
        }
    }
    lists.ensure_local_default();
    lists
}

fn common_from_row(row: &Row) -> Reminder {
    Reminder {
        title: row.text("title", ""),
        description: row.text("description", ""),
        due_date: row.int("due-date", 0),
        timestamp: row.int("timestamp", 0),
        completed: row.flag("completed"),
        important: row.flag("important"),
        remaining: Remaining::from_code(row.int("repeat-times", Remaining::ONCE.to_code())),
        old_timestamp: row.int("old-timestamp", 0),
        created_timestamp: row.int("created-timestamp", 0),
        updated_timestamp: row.int("updated-timestamp", 0),
        list_id: row.text("list-id", LOCAL_LIST),
        ..Reminder::new(row.text("id", ""))
    }
}

fn local_from_row(row: &Row) -> Reminder {
    Reminder {
        repeat: rule_from_row(row),
        ..common_from_row(row)
    }
}

fn remote_from_row(row: &Row) -> Reminder {
    Reminder {
        user_id: row.text("user-id", LOCAL_USER),
        remote_task_id: row.text("remote-task-id", ""),
        ..common_from_row(row)
    }
}

fn rule_from_row(row: &Row) -> Option<RepeatRule> {
    let kind = match RepeatKind::from_code(row.int("repeat-type", 0)) {
        Ok(kind) => kind?,
        Err(e) => {
            warn!(id = %row.text("id", ""), error = %e, "dropping unreadable repeat rule");
            return None;
        }
    };
    let rule = RepeatRule::new(kind, row.int("repeat-frequency", 1))
        .or_else(|_| RepeatRule::new(kind, 1))
        .ok()?;
    let days = Weekdays::from_bits(row.int("repeat-days", 0)).unwrap_or_default();
    let rule = rule.on_days(days);

    let until = row.int("repeat-until", 0);
    if until > 0 {
        if let Some(date) = DateTime::from_timestamp(until, 0).map(|dt| dt.date_naive()) {
            return Some(rule.until(date));
        }
    }
    Some(rule)
}

fn local_row(reminder: &Reminder) -> Vec<String> {
    let rule = reminder.repeat.as_ref();
    vec![
        reminder.id.clone(),
        reminder.title.clone(),
        reminder.description.clone(),
        reminder.due_date.to_string(),
        reminder.timestamp.to_string(),
        reminder.completed.to_string(),
        reminder.important.to_string(),
        rule.map_or(0, |r| r.kind.code()).to_string(),
        rule.map_or(1, |r| r.frequency).to_string(),
        rule.map_or(0, |r| r.days.bits()).to_string(),
        rule.and_then(|r| r.until)
            .map_or(0, utc_midnight)
            .to_string(),
        reminder.remaining.to_code().to_string(),
        reminder.old_timestamp.to_string(),
        reminder.created_timestamp.to_string(),
        reminder.updated_timestamp.to_string(),
        reminder.list_id.clone(),
    ]
}

fn remote_row(reminder: &Reminder) -> Vec<String> {
    vec![
        reminder.id.clone(),
        reminder.title.clone(),
        reminder.description.clone(),
        reminder.due_date.to_string(),
        reminder.timestamp.to_string(),
        reminder.completed.to_string(),
        reminder.important.to_string(),
        reminder.remaining.to_code().to_string(),
        reminder.old_timestamp.to_string(),
        reminder.created_timestamp.to_string(),
        reminder.updated_timestamp.to_string(),
        reminder.list_id.clone(),
        reminder.user_id.clone(),
        reminder.remote_task_id.clone(),
    ]
}
