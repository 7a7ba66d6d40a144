//! Offline operation queue.
//!
//! Remote mutations that could not be delivered are parked here, collapsed
//! per target id, persisted after every change, and replayed in dependency
//! order on the next sync attempt.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use nudge_todo::TaskRemote;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::tsv::write_atomic;
use crate::{Store, SyncError, push};

/// Where a reminder lived before an update, when it moved.
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct UpdateOrigin {
    pub old_user: Option<String>,
    pub old_list: Option<String>,
    /// Remote task id the reminder had in its old location.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub old_task: Option<String>,
    /// Copies created by moves that collapsed into this one.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub strays: Vec<RemoteCopy>,
}

impl UpdateOrigin {
    /// Origin of a reminder moving away from `user`/`list`.
    pub fn moved_from(user: &str, list: &str, task: &str) -> Self {
        Self {
            old_user: Some(user.to_string()),
            old_list: Some(list.to_string()),
            old_task: (!task.is_empty()).then(|| task.to_string()),
            strays: Vec::new(),
        }
    }

    /// Fold a later move into this pending one.
    ///
    /// A later origin holding a different task id means an earlier attempt
    /// already created a copy there, which has to go as well.
    fn absorb(&mut self, later: UpdateOrigin) {
        let stray = match (&later.old_user, &later.old_list, &later.old_task) {
            (Some(user), Some(list), Some(task)) => Some(RemoteCopy {
                user: user.clone(),
                list: list.clone(),
                task: task.clone(),
            }),
            _ => None,
        };
        // A task id is recorded once, where it was first left behind.
        for copy in later.strays.into_iter().chain(stray) {
            let known = self.old_task.as_ref() == Some(&copy.task)
                || self.strays.iter().any(|known| known.task == copy.task);
            if !known {
                self.strays.push(copy);
            }
        }
    }
}

/// A remote task left in a list the reminder no longer belongs to.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RemoteCopy {
    pub user: String,
    /// Local list id.
    pub list: String,
    pub task: String,
}

/// A deferred remote mutation.
///
/// Deletes carry the remote coordinates captured when they were queued,
/// since the local record is gone by the time they replay.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub enum QueueOperation {
    ReminderCreate {
        id: String,
    },
    ReminderUpdate {
        id: String,
        origin: UpdateOrigin,
    },
    ReminderComplete {
        id: String,
    },
    ReminderDelete {
        id: String,
        user: String,
        /// Remote list id.
        list: String,
        remote_id: String,
    },
    ListCreate {
        id: String,
    },
    ListUpdate {
        id: String,
    },
    ListDelete {
        id: String,
        user: String,
        remote_id: String,
    },
}

impl QueueOperation {
    /// Local id of the reminder or list targeted.
    pub fn id(&self) -> &str {
        match self {
            QueueOperation::ReminderCreate { id }
            | QueueOperation::ReminderUpdate { id, .. }
            | QueueOperation::ReminderComplete { id }
            | QueueOperation::ReminderDelete { id, .. }
            | QueueOperation::ListCreate { id }
            | QueueOperation::ListUpdate { id }
            | QueueOperation::ListDelete { id, .. } => id,
        }
    }

    /// Position in replay order.
    pub fn replay_rank(&self) -> u8 {
        match self {
            QueueOperation::ListCreate { .. } => 0,
            QueueOperation::ReminderCreate { .. } => 1,
            QueueOperation::ReminderComplete { .. } => 2,
            QueueOperation::ReminderUpdate { .. } => 3,
            QueueOperation::ListUpdate { .. } => 4,
            QueueOperation::ReminderDelete { .. } => 5,
            QueueOperation::ListDelete { .. } => 6,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct PendingUpdate {
    id: String,
    #[serde(flatten)]
    origin: UpdateOrigin,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct PendingDelete {
    id: String,
    user: String,
    list: String,
    remote_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct PendingListDelete {
    id: String,
    user: String,
    remote_id: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
struct ReminderBuckets {
    create: Vec<String>,
    complete: Vec<String>,
    update: Vec<PendingUpdate>,
    delete: Vec<PendingDelete>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
struct ListBuckets {
    create: Vec<String>,
    update: Vec<String>,
    delete: Vec<PendingListDelete>,
}

/// The persisted queue record.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
struct QueueState {
    reminders: ReminderBuckets,
    lists: ListBuckets,
}

impl QueueState {
    fn is_empty(&self) -> bool {
        self.reminders.create.is_empty()
            && self.reminders.complete.is_empty()
            && self.reminders.update.is_empty()
            && self.reminders.delete.is_empty()
            && self.lists.create.is_empty()
            && self.lists.update.is_empty()
            && self.lists.delete.is_empty()
    }
}

/// Pending work the reconciler must respect.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Overlay {
    /// Reminders whose local value wins over the snapshot.
    pub held_reminders: BTreeSet<String>,
    /// Lists whose local name wins over the snapshot.
    pub held_lists: BTreeSet<String>,
    /// Remote tasks awaiting deletion, as (user, remote task id).
    pub deleted_tasks: BTreeSet<(String, String)>,
    /// Remote lists awaiting deletion, as (user, remote list id).
    pub deleted_lists: BTreeSet<(String, String)>,
}

/// Outcome of a completed flush.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushReport {
    /// Entries delivered to the remote.
    pub pushed: usize,
    /// Entries the remote rejected permanently.
    pub dropped: usize,
}

/// Durable, deduplicating log of deferred remote mutations.
#[derive(Debug, Clone, Default)]
pub struct OperationQueue {
    path: Option<PathBuf>,
    state: QueueState,
}

impl OperationQueue {
    pub fn in_memory() -> Self {
        Self::default()
    }

    /// Load the queue record at `path`. An unreadable record starts empty.
    pub fn load(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let state = match std::fs::read_to_string(&path) {
            Ok(content) => serde_json::from_str(&content).unwrap_or_else(|e| {
                warn!(path = %path.display(), error = %e, "discarding unreadable queue");
                QueueState::default()
            }),
            Err(_) => QueueState::default(),
        };
        Self {
            path: Some(path),
            state,
        }
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn is_empty(&self) -> bool {
        self.state.is_empty()
    }

    pub fn len(&self) -> usize {
        self.pending().len()
    }

    /// Add an operation, collapsing it against what is already queued.
    pub fn enqueue(&mut self, operation: QueueOperation) {
        debug!(?operation, "queueing");
        let reminders = &mut self.state.reminders;
        let lists = &mut self.state.lists;
        match operation {
            QueueOperation::ReminderCreate { id } => {
                if !reminders.create.contains(&id) {
                    reminders.create.push(id);
                }
            }
            QueueOperation::ReminderUpdate { id, origin } => {
                // A queued create replays from live state already.
                if !reminders.create.contains(&id) {
                    reminders.complete.retain(|queued| *queued != id);
                    // The first origin is where the remote copy still lives.
                    match reminders.update.iter_mut().find(|u| u.id == id) {
                        Some(pending) => pending.origin.absorb(origin),
                        None => reminders.update.push(PendingUpdate { id, origin }),
                    }
                }
            }
            QueueOperation::ReminderComplete { id } => {
                let covered = reminders.create.contains(&id)
                    || reminders.complete.contains(&id)
                    || reminders.update.iter().any(|u| u.id == id);
                if !covered {
                    reminders.complete.push(id);
                }
            }
            QueueOperation::ReminderDelete {
                id,
                user,
                list,
                remote_id,
            } => {
                reminders.update.retain(|u| u.id != id);
                reminders.complete.retain(|queued| *queued != id);
                if let Some(index) = reminders.create.iter().position(|queued| *queued == id) {
                    reminders.create.remove(index);
                } else if !remote_id.is_empty() {
                    reminders
                        .delete
                        .retain(|d| !(d.remote_id == remote_id && d.user == user));
                    reminders.delete.push(PendingDelete {
                        id,
                        user,
                        list,
                        remote_id,
                    });
                }
            }
            QueueOperation::ListCreate { id } => {
                if !lists.create.contains(&id) {
                    lists.create.push(id);
                }
            }
            QueueOperation::ListUpdate { id } => {
                if !lists.create.contains(&id) && !lists.update.contains(&id) {
                    lists.update.push(id);
                }
            }
            QueueOperation::ListDelete { id, user, remote_id } => {
                lists.update.retain(|queued| *queued != id);
                if let Some(index) = lists.create.iter().position(|queued| *queued == id) {
                    lists.create.remove(index);
                } else if !remote_id.is_empty()
                    && !lists.delete.iter().any(|d| d.remote_id == remote_id && d.user == user)
                {
                    lists.delete.push(PendingListDelete { id, user, remote_id });
                }
            }
        }
        self.persist_or_log();
    }

    /// Remote copies a pending move of reminder `id` still has to clean up.
    pub fn leftover_copies(&self, id: &str) -> Vec<RemoteCopy> {
        let Some(pending) = self.state.reminders.update.iter().find(|u| u.id == id) else {
            return Vec::new();
        };
        let origin = &pending.origin;
        let first = match (&origin.old_user, &origin.old_list, &origin.old_task) {
            (Some(user), Some(list), Some(task)) => Some(RemoteCopy {
                user: user.clone(),
                list: list.clone(),
                task: task.clone(),
            }),
            _ => None,
        };
        first.into_iter().chain(origin.strays.iter().cloned()).collect()
    }

    /// Everything queued, in replay order.
    pub fn pending(&self) -> Vec<QueueOperation> {
        let reminders = &self.state.reminders;
        let lists = &self.state.lists;

        let list_creates = lists
            .create
            .iter()
            .map(|id| QueueOperation::ListCreate { id: id.clone() });
        let creates = reminders
            .create
            .iter()
            .map(|id| QueueOperation::ReminderCreate { id: id.clone() });
        let completes = reminders
            .complete
            .iter()
            .map(|id| QueueOperation::ReminderComplete { id: id.clone() });
        let updates = reminders.update.iter().map(|u| QueueOperation::ReminderUpdate {
            id: u.id.clone(),
            origin: u.origin.clone(),
        });
        let list_updates = lists
            .update
            .iter()
            .map(|id| QueueOperation::ListUpdate { id: id.clone() });
        let deletes = reminders.delete.iter().map(|d| QueueOperation::ReminderDelete {
            id: d.id.clone(),
            user: d.user.clone(),
            list: d.list.clone(),
            remote_id: d.remote_id.clone(),
        });
        let list_deletes = lists.delete.iter().map(|d| QueueOperation::ListDelete {
            id: d.id.clone(),
            user: d.user.clone(),
            remote_id: d.remote_id.clone(),
        });

        list_creates
            .chain(creates)
            .chain(completes)
            .chain(updates)
            .chain(list_updates)
            .chain(deletes)
            .chain(list_deletes)
            .collect()
    }

    /// Pending state the reconciler overlays on a fresh snapshot.
    pub fn overlay(&self) -> Overlay {
        let reminders = &self.state.reminders;
        let lists = &self.state.lists;
        Overlay {
            held_reminders: reminders
                .create
                .iter()
                .chain(reminders.complete.iter())
                .chain(reminders.update.iter().map(|u| &u.id))
                .cloned()
                .collect(),
            held_lists: lists.create.iter().chain(lists.update.iter()).cloned().collect(),
            deleted_tasks: reminders
                .delete
                .iter()
                .map(|d| (d.user.clone(), d.remote_id.clone()))
                .collect(),
            deleted_lists: lists
                .delete
                .iter()
                .map(|d| (d.user.clone(), d.remote_id.clone()))
                .collect(),
        }
    }

    /// Forget every entry touching `user`, after the account signs out.
    pub fn forget_user(&mut self, store: &Store, user: &str) {
        let owned = |id: &String| {
            store.get(id).is_some_and(|r| r.user_id == user)
                || store.lists().get(id).is_some_and(|l| l.user_id == user)
        };
        let reminders = &mut self.state.reminders;
        reminders.create.retain(|id| !owned(id));
        reminders.complete.retain(|id| !owned(id));
        reminders.update.retain(|u| !owned(&u.id));
        reminders.delete.retain(|d| d.user != user);
        let lists = &mut self.state.lists;
        lists.create.retain(|id| !owned(id));
        lists.update.retain(|id| !owned(id));
        lists.delete.retain(|d| d.user != user);
        self.persist_or_log();
    }

    /// Replay every queued operation against `remote`.
    ///
    /// Entries leave the queue only once their call succeeds or is rejected
    /// permanently. A connectivity failure stops the pass, saves progress,
    /// and is returned so the caller can retry later.
    #[tracing::instrument(skip_all, fields(pending = self.len()))]
    pub async fn flush(
        &mut self,
        store: &mut Store,
        remote: &dyn TaskRemote,
    ) -> Result<FlushReport, SyncError> {
        let mut report = FlushReport::default();
        if self.is_empty() {
            return Ok(report);
        }

        for operation in self.pending() {
            let result = push::perform(store, remote, &operation).await;
            match result {
                Ok(()) => report.pushed += 1,
                Err(e) if e.is_connectivity() => {
                    info!(error = %e, pushed = report.pushed, "remote unreachable, flush deferred");
                    self.persist_or_log();
                    save_or_log(store);
                    return Err(e);
                }
                Err(e) => {
                    warn!(?operation, error = %e, "dropping operation the remote rejected");
                    report.dropped += 1;
                }
            }
            self.remove(&operation);
        }

        self.persist_or_log();
        save_or_log(store);
        info!(pushed = report.pushed, dropped = report.dropped, "flushed queue");
        Ok(report)
    }

    fn remove(&mut self, operation: &QueueOperation) {
        let reminders = &mut self.state.reminders;
        let lists = &mut self.state.lists;
        match operation {
            QueueOperation::ReminderCreate { id } => reminders.create.retain(|q| q != id),
            QueueOperation::ReminderComplete { id } => reminders.complete.retain(|q| q != id),
            QueueOperation::ReminderUpdate { id, .. } => reminders.update.retain(|u| &u.id != id),
            QueueOperation::ReminderDelete { user, remote_id, .. } => reminders
                .delete
                .retain(|d| !(&d.user == user && &d.remote_id == remote_id)),
            QueueOperation::ListCreate { id } => lists.create.retain(|q| q != id),
            QueueOperation::ListUpdate { id } => lists.update.retain(|q| q != id),
            QueueOperation::ListDelete { user, remote_id, .. } => lists
                .delete
                .retain(|d| !(&d.user == user && &d.remote_id == remote_id)),
        }
    }

    /// Write the queue record.
    pub fn save(&self) -> Result<(), SyncError> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let json = serde_json::to_string_pretty(&self.state)
            .map_err(|e| SyncError::persistence(path, e))?;
        write_atomic(path, &json)
    }

    fn persist_or_log(&self) {
        if let Err(e) = self.save() {
            warn!(error = %e, "failed to persist queue");
        }
    }
}

fn save_or_log(store: &Store) {
    if let Err(e) = store.save() {
        warn!(error = %e, "failed to persist store after flush");
    }
}
