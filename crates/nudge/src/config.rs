//! Service configuration and persisted runtime settings.

use std::collections::{BTreeMap, BTreeSet};
use std::io::Write;
use std::path::{Path, PathBuf};

use nudge_sync::SyncedLists;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::ServiceError;

/// Default interval between remote refreshes.
pub const DEFAULT_REFRESH_MINUTES: u32 = 15;

/// Shortest allowed refresh interval.
pub const MIN_REFRESH_MINUTES: u32 = 1;

/// File holding [`Settings`] inside the data directory.
pub const SETTINGS_FILE: &str = "settings.json";

/// File holding the offline queue inside the data directory.
pub const QUEUE_FILE: &str = "queue.json";

/// Settings clients can change at runtime.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Minutes between remote refreshes.
    pub refresh_minutes: u32,
    /// Lists mirrored per account.
    pub synced_lists: SyncedLists,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            refresh_minutes: DEFAULT_REFRESH_MINUTES,
            synced_lists: SyncedLists::default(),
        }
    }
}

impl Settings {
    /// Load settings from `path`. A missing or unreadable file gives defaults.
    pub fn load(path: &Path) -> Self {
        let settings: Settings = match std::fs::read_to_string(path) {
            Ok(content) => serde_json::from_str(&content).unwrap_or_else(|e| {
                warn!(path = %path.display(), error = %e, "unreadable settings, using defaults");
                Settings::default()
            }),
            Err(_) => Settings::default(),
        };
        Settings {
            refresh_minutes: settings.refresh_minutes.max(MIN_REFRESH_MINUTES),
            ..settings
        }
    }

    pub fn save(&self, path: &Path) -> Result<(), ServiceError> {
        let fail = |e: &dyn std::fmt::Display| {
            ServiceError::Persistence(format!("{}: {}", path.display(), e))
        };
        let json = serde_json::to_string_pretty(self).map_err(|e| fail(&e))?;
        let dir = path.parent().unwrap_or_else(|| Path::new("."));
        let mut file = tempfile::NamedTempFile::new_in(dir).map_err(|e| fail(&e))?;
        file.write_all(json.as_bytes()).map_err(|e| fail(&e))?;
        file.persist(path).map_err(|e| fail(&e.error))?;
        Ok(())
    }

    pub fn refresh_secs(&self) -> i64 {
        i64::from(self.refresh_minutes.max(MIN_REFRESH_MINUTES)) * 60
    }

    pub fn set_refresh_minutes(&mut self, minutes: u32) -> Result<(), ServiceError> {
        if minutes < MIN_REFRESH_MINUTES {
            return Err(ServiceError::Validation(format!(
                "refresh interval must be at least {MIN_REFRESH_MINUTES} minute"
            )));
        }
        self.refresh_minutes = minutes;
        Ok(())
    }

    pub fn set_synced_lists(&mut self, selection: BTreeMap<String, BTreeSet<String>>) {
        self.synced_lists = SyncedLists::new(selection);
    }
}

/// How the service is set up at startup.
#[derive(Debug, Clone, Default)]
pub struct ServiceConfig {
    /// Directory for tables, queue and settings. `None` keeps everything in memory.
    pub data_dir: Option<PathBuf>,
    /// Overrides the persisted refresh interval.
    pub refresh_minutes: Option<u32>,
}

impl ServiceConfig {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: Some(data_dir.into()),
            refresh_minutes: None,
        }
    }

    pub fn in_memory() -> Self {
        Self::default()
    }

    pub fn with_refresh_minutes(mut self, minutes: u32) -> Self {
        self.refresh_minutes = Some(minutes);
        self
    }
}
