//! Remote task-list data types.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Remote state keyed by account user id.
pub type Snapshot = BTreeMap<String, Vec<RemoteList>>;

/// A task list as reported by the remote.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteList {
    pub id: String,
    pub name: String,
    /// The account's built-in list.
    pub default: bool,
    pub tasks: Vec<RemoteTask>,
}

/// A task as reported by the remote. Times are unix seconds, 0 when unset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteTask {
    pub id: String,
    pub title: String,
    /// Plain-text body; empty for non-text bodies.
    pub body: String,
    pub completed: bool,
    pub important: bool,
    pub reminder_at: i64,
    pub due: i64,
    pub created_at: i64,
    pub updated_at: i64,
}

/// Task content pushed to the remote.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TaskFields {
    pub title: String,
    pub description: String,
    pub completed: bool,
    pub important: bool,
    /// Due date as the UTC midnight of the day, 0 for none.
    pub due_date: i64,
    /// Reminder instant, 0 for none.
    pub timestamp: i64,
}

/// What an update sends.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskPatch {
    /// Replace all content fields.
    Full(TaskFields),
    /// Only flip the completion status.
    Completed(bool),
}

impl TaskPatch {
    pub fn completed(&self) -> bool {
        match self {
            TaskPatch::Full(fields) => fields.completed,
            TaskPatch::Completed(completed) => *completed,
        }
    }
}
