//! Notifications published to clients.

use std::collections::{BTreeMap, BTreeSet};

use nudge_scheduler::Remaining;
use nudge_sync::Reminder;

/// App id used for changes the service makes on its own.
pub const SERVICE_APP_ID: &str = "nudge";

/// Something clients should know about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// A reminder was created or edited.
    ReminderUpdated { app_id: String, reminder: Reminder },
    /// A refresh changed or removed reminders.
    Refreshed {
        updated: Vec<Reminder>,
        removed: Vec<String>,
    },
    CompletedUpdated {
        app_id: String,
        id: String,
        completed: bool,
        updated_timestamp: i64,
    },
    ReminderRemoved { app_id: String, id: String },
    /// A reminder's notification is due. `timestamp` is already the next occurrence.
    ReminderFired {
        id: String,
        title: String,
        description: String,
        timestamp: i64,
        old_timestamp: i64,
        remaining: Remaining,
    },
    ListUpdated {
        app_id: String,
        user: String,
        list: String,
        name: String,
    },
    ListRemoved {
        app_id: String,
        user: String,
        list: String,
    },
    /// Sign-in needs the user to visit a page and enter a code.
    LoginPrompt {
        verification_uri: String,
        user_code: String,
        message: String,
    },
    SignedIn { user: String, email: String },
    LoginFailed { message: String },
    SignedOut { user: String },
    SyncedListsChanged(BTreeMap<String, BTreeSet<String>>),
}
