//! Remote task-list access for nudge.
//!
//! The sync core only talks to a remote account through the [`TaskRemote`]
//! trait. This crate provides:
//! - [`GraphClient`], a Microsoft To Do client over Microsoft Graph
//! - [`TokenStore`], the per-account OAuth token file
//! - [`MemoryRemote`], an in-process remote with a connectivity switch

mod auth;
mod error;
mod graph;
pub mod memory;
mod remote;
mod types;

pub use auth::{Account, DeviceCodePrompt, TokenStore};
pub use error::TodoError;
pub use graph::{DEFAULT_AUTH_URL, DEFAULT_GRAPH_URL, GraphClient, GraphConfig};
pub use memory::MemoryRemote;
pub use remote::{LoginPrompt, TaskRemote};
pub use types::{RemoteList, RemoteTask, Snapshot, TaskFields, TaskPatch};
