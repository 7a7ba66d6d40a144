//! In-process remote.
//!
//! Holds lists and tasks in memory, records every mutating call, and can be
//! switched offline to exercise deferral paths.

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::Utc;

use crate::{
    Account, DeviceCodePrompt, LoginPrompt, RemoteList, RemoteTask, Snapshot, TaskFields,
    TaskPatch, TaskRemote, TodoError,
};

/// How the remote answers calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Online,
    /// Every call fails with a connectivity error.
    Offline,
    /// Every mutating call fails with a permanent HTTP 400.
    Rejecting,
}

/// A mutating call the remote accepted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteCall {
    CreateTask {
        user: String,
        list: String,
        task: String,
        fields: TaskFields,
    },
    UpdateTask {
        user: String,
        list: String,
        task: String,
        patch: TaskPatch,
    },
    DeleteTask {
        user: String,
        list: String,
        task: String,
    },
    CreateList {
        user: String,
        list: String,
        name: String,
    },
    UpdateList {
        user: String,
        list: String,
        name: String,
    },
    DeleteList {
        user: String,
        list: String,
    },
}

#[derive(Debug)]
struct State {
    mode: Mode,
    accounts: BTreeMap<String, String>,
    lists: Snapshot,
    calls: Vec<RemoteCall>,
    next_id: u64,
    pending_login: Option<Account>,
    failing_deletes: usize,
}

/// Remote backed by in-memory collections.
#[derive(Debug)]
pub struct MemoryRemote {
    state: Mutex<State>,
}

impl Default for MemoryRemote {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryRemote {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State {
                mode: Mode::Online,
                accounts: BTreeMap::new(),
                lists: Snapshot::new(),
                calls: Vec::new(),
                next_id: 1,
                pending_login: None,
                failing_deletes: 0,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        // A panic while holding the lock only happens in a failing test.
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn set_mode(&self, mode: Mode) {
        self.lock().mode = mode;
    }

    pub fn set_online(&self, online: bool) {
        self.set_mode(if online { Mode::Online } else { Mode::Offline });
    }

    /// Make the next `count` task deletes fail with a connectivity error.
    pub fn fail_task_deletes(&self, count: usize) {
        self.lock().failing_deletes = count;
    }

    /// Add a signed-in account with its default list (remote id `"<user>-default"`).
    pub fn add_account(&self, user: &str, email: &str) {
        let mut state = self.lock();
        state.accounts.insert(user.to_string(), email.to_string());
        state.lists.entry(user.to_string()).or_insert_with(|| {
            vec![RemoteList {
                id: format!("{}-default", user),
                name: "Tasks".to_string(),
                default: true,
                tasks: Vec::new(),
            }]
        });
    }

    /// The account the next `login` call signs in.
    pub fn prepare_login(&self, user: &str, email: &str) {
        self.lock().pending_login = Some(Account {
            user_id: user.to_string(),
            email: email.to_string(),
        });
    }

    /// Add a non-default list directly, bypassing call recording.
    pub fn insert_list(&self, user: &str, list: &str, name: &str) {
        let mut state = self.lock();
        state.lists.entry(user.to_string()).or_default().push(RemoteList {
            id: list.to_string(),
            name: name.to_string(),
            default: false,
            tasks: Vec::new(),
        });
    }

    /// Add a task directly, bypassing call recording.
    pub fn insert_task(&self, user: &str, list: &str, task: RemoteTask) {
        let mut state = self.lock();
        if let Some(list) = state
            .lists
            .get_mut(user)
            .and_then(|lists| lists.iter_mut().find(|l| l.id == list))
        {
            list.tasks.push(task);
        }
    }

    /// Mutating calls accepted so far.
    pub fn calls(&self) -> Vec<RemoteCall> {
        self.lock().calls.clone()
    }

    pub fn clear_calls(&self) {
        self.lock().calls.clear();
    }

    /// A task by remote id, searched across all lists of `user`.
    pub fn task(&self, user: &str, task: &str) -> Option<RemoteTask> {
        self.lock()
            .lists
            .get(user)?
            .iter()
            .flat_map(|list| list.tasks.iter())
            .find(|t| t.id == task)
            .cloned()
    }

    pub fn snapshot(&self) -> Snapshot {
        self.lock().lists.clone()
    }

    fn check(state: &State, mutating: bool) -> Result<(), TodoError> {
        match state.mode {
            Mode::Online => Ok(()),
            Mode::Offline => Err(TodoError::Connectivity("remote is offline".to_string())),
            Mode::Rejecting if mutating => Err(TodoError::Http {
                status: 400,
                message: "rejected".to_string(),
            }),
            Mode::Rejecting => Ok(()),
        }
    }

    fn list_mut<'a>(
        state: &'a mut State,
        user: &str,
        list: &str,
    ) -> Result<&'a mut RemoteList, TodoError> {
        state
            .lists
            .get_mut(user)
            .ok_or_else(|| TodoError::UnknownAccount(user.to_string()))?
            .iter_mut()
            .find(|l| l.id == list)
            .ok_or_else(|| TodoError::NotFound(format!("list {}", list)))
    }
}

fn apply_fields(task: &mut RemoteTask, fields: &TaskFields) {
    task.title = fields.title.clone();
    task.body = fields.description.clone();
    task.completed = fields.completed;
    task.important = fields.important;
    task.reminder_at = fields.timestamp;
    task.due = fields.due_date;
    task.updated_at = Utc::now().timestamp();
}

#[async_trait]
impl TaskRemote for MemoryRemote {
    async fn list_accounts(&self) -> Result<BTreeMap<String, String>, TodoError> {
        Ok(self.lock().accounts.clone())
    }

    async fn fetch_lists_and_tasks(&self) -> Result<Snapshot, TodoError> {
        let state = self.lock();
        Self::check(&state, false)?;
        Ok(state.lists.clone())
    }

    async fn create_task(
        &self,
        user: &str,
        list: &str,
        fields: &TaskFields,
    ) -> Result<String, TodoError> {
        let mut state = self.lock();
        Self::check(&state, true)?;
        let id = format!("task-{}", state.next_id);
        state.next_id += 1;

        let now = Utc::now().timestamp();
        let mut task = RemoteTask {
            id: id.clone(),
            title: String::new(),
            body: String::new(),
            completed: false,
            important: false,
            reminder_at: 0,
            due: 0,
            created_at: now,
            updated_at: now,
        };
        apply_fields(&mut task, fields);
        Self::list_mut(&mut state, user, list)?.tasks.push(task);

        state.calls.push(RemoteCall::CreateTask {
            user: user.to_string(),
            list: list.to_string(),
            task: id.clone(),
            fields: fields.clone(),
        });
        Ok(id)
    }

    async fn update_task(
        &self,
        user: &str,
        list: &str,
        task: &str,
        patch: &TaskPatch,
    ) -> Result<String, TodoError> {
        let mut state = self.lock();
        Self::check(&state, true)?;
        let target = Self::list_mut(&mut state, user, list)?
            .tasks
            .iter_mut()
            .find(|t| t.id == task)
            .ok_or_else(|| TodoError::NotFound(format!("task {}", task)))?;
        match patch {
            TaskPatch::Full(fields) => apply_fields(target, fields),
            TaskPatch::Completed(completed) => target.completed = *completed,
        }

        state.calls.push(RemoteCall::UpdateTask {
            user: user.to_string(),
            list: list.to_string(),
            task: task.to_string(),
            patch: patch.clone(),
        });
        Ok(task.to_string())
    }

    async fn delete_task(&self, user: &str, list: &str, task: &str) -> Result<(), TodoError> {
        let mut state = self.lock();
        Self::check(&state, true)?;
        if state.failing_deletes > 0 {
            state.failing_deletes -= 1;
            return Err(TodoError::Connectivity("connection reset".to_string()));
        }
        let tasks = &mut Self::list_mut(&mut state, user, list)?.tasks;
        let before = tasks.len();
        tasks.retain(|t| t.id != task);
        if tasks.len() == before {
            return Err(TodoError::NotFound(format!("task {}", task)));
        }

        state.calls.push(RemoteCall::DeleteTask {
            user: user.to_string(),
            list: list.to_string(),
            task: task.to_string(),
        });
        Ok(())
    }

    async fn create_list(&self, user: &str, name: &str) -> Result<String, TodoError> {
        let mut state = self.lock();
        Self::check(&state, true)?;
        let id = format!("list-{}", state.next_id);
        state.next_id += 1;
        state
            .lists
            .get_mut(user)
            .ok_or_else(|| TodoError::UnknownAccount(user.to_string()))?
            .push(RemoteList {
                id: id.clone(),
                name: name.to_string(),
                default: false,
                tasks: Vec::new(),
            });

        state.calls.push(RemoteCall::CreateList {
            user: user.to_string(),
            list: id.clone(),
            name: name.to_string(),
        });
        Ok(id)
    }

    async fn update_list(&self, user: &str, list: &str, name: &str) -> Result<(), TodoError> {
        let mut state = self.lock();
        Self::check(&state, true)?;
        Self::list_mut(&mut state, user, list)?.name = name.to_string();

        state.calls.push(RemoteCall::UpdateList {
            user: user.to_string(),
            list: list.to_string(),
            name: name.to_string(),
        });
        Ok(())
    }

    async fn delete_list(&self, user: &str, list: &str) -> Result<(), TodoError> {
        let mut state = self.lock();
        Self::check(&state, true)?;
        let lists = state
            .lists
            .get_mut(user)
            .ok_or_else(|| TodoError::UnknownAccount(user.to_string()))?;
        let before = lists.len();
        lists.retain(|l| l.id != list);
        if lists.len() == before {
            return Err(TodoError::NotFound(format!("list {}", list)));
        }

        state.calls.push(RemoteCall::DeleteList {
            user: user.to_string(),
            list: list.to_string(),
        });
        Ok(())
    }

    async fn login(&self, prompt: LoginPrompt) -> Result<Account, TodoError> {
        let account = {
            let mut state = self.lock();
            Self::check(&state, false)?;
            state
                .pending_login
                .take()
                .ok_or_else(|| TodoError::Auth("sign-in declined".to_string()))?
        };
        prompt(DeviceCodePrompt {
            verification_uri: "https://example.invalid/device".to_string(),
            user_code: "NUDGE".to_string(),
            message: "enter NUDGE".to_string(),
        });
        self.add_account(&account.user_id, &account.email);
        Ok(account)
    }

    async fn logout(&self, user: &str) -> Result<(), TodoError> {
        let mut state = self.lock();
        if state.accounts.remove(user).is_none() {
            return Err(TodoError::UnknownAccount(user.to_string()));
        }
        state.lists.remove(user);
        Ok(())
    }
}
