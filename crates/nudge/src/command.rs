//! Client requests and their reply channels.

use std::collections::{BTreeMap, BTreeSet};

use nudge_scheduler::{Remaining, RepeatRule};
use nudge_sync::{LOCAL_LIST, LOCAL_USER, Reminder};
use tokio::sync::oneshot;

use crate::ServiceError;

/// Answer to one request.
pub type Reply<T> = oneshot::Sender<Result<T, ServiceError>>;

/// Reminder fields a client sets on create and update.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReminderInput {
    pub title: String,
    pub description: String,
    /// Notification instant in unix seconds, 0 for none.
    pub timestamp: i64,
    /// UTC midnight of the due day, 0 for none. Overridden by `timestamp`.
    pub due_date: i64,
    pub important: bool,
    pub repeat: Option<RepeatRule>,
    pub remaining: Remaining,
    pub list_id: String,
    pub user_id: String,
}

impl Default for ReminderInput {
    fn default() -> Self {
        Self {
            title: String::new(),
            description: String::new(),
            timestamp: 0,
            due_date: 0,
            important: false,
            repeat: None,
            remaining: Remaining::ONCE,
            list_id: LOCAL_LIST.to_string(),
            user_id: LOCAL_USER.to_string(),
        }
    }
}

impl ReminderInput {
    pub fn new(title: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            ..Self::default()
        }
    }

    pub fn at(mut self, timestamp: i64) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn in_list(mut self, user: impl Into<String>, list: impl Into<String>) -> Self {
        self.user_id = user.into();
        self.list_id = list.into();
        self
    }

    pub fn repeating(mut self, rule: RepeatRule, remaining: Remaining) -> Self {
        self.repeat = Some(rule);
        self.remaining = remaining;
        self
    }

    /// Copy the client-owned fields onto `reminder`.
    pub(crate) fn apply_to(self, reminder: &mut Reminder) {
        reminder.title = self.title;
        reminder.description = self.description;
        reminder.timestamp = self.timestamp;
        reminder.due_date = self.due_date;
        reminder.important = self.important;
        reminder.repeat = self.repeat;
        reminder.remaining = self.remaining;
        reminder.list_id = self.list_id;
        reminder.user_id = self.user_id;
    }
}

/// A request to the service loop.
#[derive(Debug)]
pub enum Command {
    CreateReminder {
        app_id: String,
        input: ReminderInput,
        /// Replies with the new id and its creation time.
        reply: Reply<(String, i64)>,
    },
    UpdateReminder {
        app_id: String,
        id: String,
        input: ReminderInput,
        reply: Reply<i64>,
    },
    UpdateCompleted {
        app_id: String,
        id: String,
        completed: bool,
        reply: Reply<i64>,
    },
    RemoveReminder {
        app_id: String,
        id: String,
        reply: Reply<()>,
    },
    ReturnReminders {
        reply: Reply<Vec<Reminder>>,
    },
    ReturnLists {
        reply: Reply<BTreeMap<String, BTreeMap<String, String>>>,
    },
    CreateList {
        app_id: String,
        user: String,
        name: String,
        reply: Reply<String>,
    },
    RenameList {
        app_id: String,
        user: String,
        list: String,
        name: String,
        reply: Reply<()>,
    },
    RemoveList {
        app_id: String,
        user: String,
        list: String,
        reply: Reply<()>,
    },
    GetSyncedLists {
        reply: Reply<BTreeMap<String, BTreeSet<String>>>,
    },
    SetSyncedLists {
        selection: BTreeMap<String, BTreeSet<String>>,
        reply: Reply<()>,
    },
    SetRefreshInterval {
        minutes: u32,
        reply: Reply<()>,
    },
    Refresh {
        reply: Reply<()>,
    },
    GetVersion {
        reply: Reply<String>,
    },
    Accounts {
        reply: Reply<BTreeMap<String, String>>,
    },
    /// Starts sign-in; the outcome arrives as an event.
    Login {
        reply: Reply<()>,
    },
    Logout {
        user: String,
        reply: Reply<()>,
    },
    Quit {
        reply: Reply<()>,
    },
}
