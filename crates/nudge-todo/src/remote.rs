//! The contract the sync core needs from a remote account.

use std::collections::BTreeMap;

use async_trait::async_trait;

use crate::{Account, DeviceCodePrompt, Snapshot, TaskFields, TaskPatch, TodoError};

/// Callback receiving the device-code instructions during sign-in.
pub type LoginPrompt = Box<dyn FnOnce(DeviceCodePrompt) + Send>;

/// A remote task-management service holding zero or more signed-in accounts.
///
/// Every call fails with an error whose [`TodoError::is_connectivity`] is
/// true when the remote cannot be reached; callers defer the operation in
/// that case.
#[async_trait]
pub trait TaskRemote: Send + Sync {
    /// Signed-in accounts as user id to e-mail.
    async fn list_accounts(&self) -> Result<BTreeMap<String, String>, TodoError>;

    /// Every list of every account, with their tasks.
    async fn fetch_lists_and_tasks(&self) -> Result<Snapshot, TodoError>;

    /// Create a task, returning its remote id.
    async fn create_task(
        &self,
        user: &str,
        list: &str,
        fields: &TaskFields,
    ) -> Result<String, TodoError>;

    /// Update a task, returning its (possibly new) remote id.
    async fn update_task(
        &self,
        user: &str,
        list: &str,
        task: &str,
        patch: &TaskPatch,
    ) -> Result<String, TodoError>;

    async fn delete_task(&self, user: &str, list: &str, task: &str) -> Result<(), TodoError>;

    /// Create a list, returning its remote id.
    async fn create_list(&self, user: &str, name: &str) -> Result<String, TodoError>;

    async fn update_list(&self, user: &str, list: &str, name: &str) -> Result<(), TodoError>;

    async fn delete_list(&self, user: &str, list: &str) -> Result<(), TodoError>;

    /// Sign in a new account. Blocks until the user completes the flow.
    async fn login(&self, prompt: LoginPrompt) -> Result<Account, TodoError>;

    /// Forget an account's tokens.
    async fn logout(&self, user: &str) -> Result<(), TodoError>;
}
