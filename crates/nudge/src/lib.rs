//! nudge: a background reminder service.
//!
//! Keeps local reminders and reminders mirrored from Microsoft To Do
//! accounts, notifies when they are due, and keeps working offline by
//! queueing remote changes until the account can be reached again.
//!
//! Start a [`Service`] and talk to it through its [`ServiceHandle`].

mod command;
pub mod config;
mod error;
mod events;
mod service;

pub use command::{Command, ReminderInput, Reply};
pub use config::{ServiceConfig, Settings};
pub use error::ServiceError;
pub use events::{Event, SERVICE_APP_ID};
pub use service::{Clock, REFRESH_TIMER, Service, ServiceHandle, system_clock};
