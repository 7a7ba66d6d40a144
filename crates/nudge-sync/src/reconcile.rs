//! Merging a remote snapshot into the store.
//!
//! A pass has three steps:
//! 1. [`merge`] builds the new remote-mirrored state from the snapshot, the
//!    previous store contents and the queue [`Overlay`].
//! 2. [`diff`] compares it with the store per id.
//! 3. [`apply`] swaps it in.
//!
//! Local reminders and local lists never pass through here.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use chrono::TimeZone;
use nudge_scheduler::{Remaining, local_date};
use nudge_todo::{RemoteTask, Snapshot};
use tracing::{debug, info};

use crate::{
    LOCAL_USER, ListDirectory, Overlay, Reminder, Store, SyncedLists, TaskList, new_id,
    utc_midnight,
};

/// The remote-mirrored state a snapshot resolves to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Merged {
    pub reminders: BTreeMap<String, Reminder>,
    pub lists: ListDirectory,
}

/// A list whose name appeared or changed, or which disappeared.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct ListChange {
    pub user: String,
    pub list: String,
    pub name: String,
}

/// What a pass changed, by id.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Diff {
    /// Remote reminders added or changed.
    pub changed: Vec<String>,
    /// Remote reminders that disappeared.
    pub removed: Vec<String>,
    pub lists_changed: Vec<ListChange>,
    pub lists_removed: Vec<ListChange>,
}

impl Diff {
    pub fn is_empty(&self) -> bool {
        self.changed.is_empty()
            && self.removed.is_empty()
            && self.lists_changed.is_empty()
            && self.lists_removed.is_empty()
    }
}

/// Resolve `snapshot` against the store and pending queue state.
///
/// Remote tasks keep their local ids across passes; unseen ones get fresh
/// ids. Reminders and lists held by the queue keep their local value, and
/// anything awaiting deletion is left out even if the remote still has it.
pub fn merge<Tz: TimeZone>(
    snapshot: &Snapshot,
    store: &Store,
    synced: &SyncedLists,
    overlay: &Overlay,
    now: i64,
    tz: &Tz,
) -> Merged {
    let known: HashMap<(&str, &str), &str> = store
        .reminders()
        .filter(|r| !r.remote_task_id.is_empty())
        .map(|r| ((r.user_id.as_str(), r.remote_task_id.as_str()), r.id.as_str()))
        .collect();

    let mut lists = ListDirectory::default();
    for list in store.lists().iter().filter(|l| l.user_id == LOCAL_USER) {
        lists.insert(list.clone());
    }
    lists.ensure_local_default();

    let mut reminders = BTreeMap::new();
    let mut minted = BTreeSet::new();
    let mint = |lists: &ListDirectory, minted: &mut BTreeSet<String>| {
        let id = new_id(|candidate| {
            store.contains_id(candidate) || lists.contains(candidate) || minted.contains(candidate)
        });
        minted.insert(id.clone());
        id
    };

    for (user, remote_lists) in snapshot {
        for remote_list in remote_lists {
            if overlay
                .deleted_lists
                .contains(&(user.clone(), remote_list.id.clone()))
            {
                continue;
            }

            let id = if remote_list.default {
                user.clone()
            } else {
                match store.lists().find_remote(user, &remote_list.id) {
                    Some(existing) => existing.id.clone(),
                    None => mint(&lists, &mut minted),
                }
            };
            let name = match store.lists().get(&id) {
                Some(local) if overlay.held_lists.contains(&id) => local.name.clone(),
                _ => remote_list.name.clone(),
            };
            lists.insert(TaskList {
                id: id.clone(),
                user_id: user.clone(),
                name,
                remote_id: remote_list.id.clone(),
            });

            if !synced.is_synced(user, &id) {
                continue;
            }
            for task in &remote_list.tasks {
                if overlay
                    .deleted_tasks
                    .contains(&(user.clone(), task.id.clone()))
                {
                    continue;
                }
                let reminder_id = match known.get(&(user.as_str(), task.id.as_str())) {
                    Some(existing) => existing.to_string(),
                    None => mint(&lists, &mut minted),
                };
                let reminder = match store.get(&reminder_id) {
                    Some(held) if overlay.held_reminders.contains(&reminder_id) => {
                        // Moved to the local account; the queued move deletes it remotely.
                        if held.is_local() {
                            continue;
                        }
                        held.clone()
                    }
                    previous => merge_task(reminder_id.clone(), previous, task, user, &id, now, tz),
                };
                reminders.insert(reminder_id, reminder);
            }
        }

        // Lists created or renamed locally that the remote does not show yet.
        for list in store.lists().iter().filter(|l| &l.user_id == user) {
            if overlay.held_lists.contains(&list.id) && !lists.contains(&list.id) {
                lists.insert(list.clone());
            }
        }
    }

    // Reminders created or edited locally that the remote does not show yet.
    for id in &overlay.held_reminders {
        if reminders.contains_key(id) {
            continue;
        }
        if let Some(held) = store.remote().get(id) {
            if snapshot.contains_key(&held.user_id) && lists.owns(&held.user_id, &held.list_id) {
                reminders.insert(id.clone(), held.clone());
            }
        }
    }

    Merged { reminders, lists }
}

fn merge_task<Tz: TimeZone>(
    id: String,
    previous: Option<&Reminder>,
    task: &RemoteTask,
    user: &str,
    list: &str,
    now: i64,
    tz: &Tz,
) -> Reminder {
    let future = task.reminder_at > now;
    let mut reminder = match previous {
        Some(previous) => previous.clone(),
        None => Reminder {
            remaining: if future { Remaining::ONCE } else { Remaining::NONE },
            old_timestamp: if future { 0 } else { task.reminder_at },
            ..Reminder::new(id)
        },
    };

    if previous.is_some() && reminder.timestamp != task.reminder_at {
        // A moved notification time should notify again.
        reminder.remaining = Remaining::ONCE;
        if !future {
            reminder.old_timestamp = task.reminder_at;
        }
    }

    reminder.title = task.title.trim().to_string();
    reminder.description = task.body.trim().to_string();
    reminder.completed = task.completed;
    reminder.important = task.important;
    reminder.timestamp = task.reminder_at;
    reminder.due_date = if task.reminder_at != 0 {
        utc_midnight(local_date(task.reminder_at, tz))
    } else {
        task.due
    };
    if task.created_at != 0 {
        reminder.created_timestamp = task.created_at;
    }
    if task.updated_at != 0 {
        reminder.updated_timestamp = task.updated_at;
    }
    reminder.repeat = None;
    reminder.list_id = list.to_string();
    reminder.user_id = user.to_string();
    reminder.remote_task_id = task.id.clone();
    reminder
}

/// Compare a merge result with the store.
pub fn diff(store: &Store, merged: &Merged) -> Diff {
    let previous = store.remote();
    let changed = merged
        .reminders
        .iter()
        .filter(|(id, reminder)| previous.get(*id) != Some(*reminder))
        .map(|(id, _)| id.clone())
        .collect();
    let removed = previous
        .keys()
        .filter(|id| !merged.reminders.contains_key(*id))
        .cloned()
        .collect();

    let as_change = |list: &TaskList| ListChange {
        user: list.user_id.clone(),
        list: list.id.clone(),
        name: list.name.clone(),
    };
    let lists_changed = merged
        .lists
        .iter()
        .filter(|list| store.lists().get(&list.id) != Some(*list))
        .map(as_change)
        .collect();
    let lists_removed = store
        .lists()
        .iter()
        .filter(|list| !merged.lists.contains(&list.id))
        .map(as_change)
        .collect();

    Diff {
        changed,
        removed,
        lists_changed,
        lists_removed,
    }
}

/// Swap a merge result into the store, returning what changed.
pub fn apply(store: &mut Store, merged: Merged) -> Diff {
    let diff = diff(store, &merged);
    if !diff.is_empty() {
        debug!(
            changed = diff.changed.len(),
            removed = diff.removed.len(),
            lists_changed = diff.lists_changed.len(),
            lists_removed = diff.lists_removed.len(),
            "applying snapshot"
        );
    }
    store.replace_remote(merged.reminders, merged.lists);
    diff
}

/// Merge `snapshot` into `store` in one step.
#[tracing::instrument(skip_all, fields(accounts = snapshot.len()))]
pub fn reconcile<Tz: TimeZone>(
    store: &mut Store,
    snapshot: &Snapshot,
    synced: &SyncedLists,
    overlay: &Overlay,
    now: i64,
    tz: &Tz,
) -> Diff {
    let merged = merge(snapshot, store, synced, overlay, now, tz);
    let diff = apply(store, merged);
    info!(
        changed = diff.changed.len(),
        removed = diff.removed.len(),
        "reconciled snapshot"
    );
    diff
}
