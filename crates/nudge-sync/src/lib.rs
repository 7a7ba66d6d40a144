//! Reminder state and remote synchronization for nudge.
//!
//! This crate owns everything that has to stay consistent between the local
//! reminder tables and a remote task-list account:
//! - [`Store`]: local and remote-mirrored reminders, lists, and their files
//! - [`OperationQueue`]: remote mutations deferred while offline
//! - [`reconcile`]: merging a remote snapshot with the store and the queue

mod error;
mod ids;
mod model;
pub mod push;
mod queue;
pub mod reconcile;
mod store;
mod tsv;

pub use error::SyncError;
pub use ids::new_id;
pub use model::{
    LOCAL_LIST, LOCAL_LIST_NAME, LOCAL_USER, ListDirectory, Reminder, SYNC_ALL, SyncedLists,
    TaskList, utc_midnight,
};
pub use queue::{FlushReport, OperationQueue, Overlay, QueueOperation, RemoteCopy, UpdateOrigin};
pub use reconcile::{Diff, ListChange};
pub use store::Store;
