//! Remote writes for single reminders and lists.
//!
//! These are shared by the immediate path (a client mutation trying the
//! remote right away) and by queue replay, so both produce identical calls.
//! Every function reads the live store state at call time.

use nudge_todo::{TaskPatch, TaskRemote, TodoError};
use tracing::debug;

use crate::{LOCAL_LIST, LOCAL_USER, QueueOperation, Store, SyncError, UpdateOrigin};

/// Create or update a reminder's remote task, moving it if it changed lists.
///
/// A reminder moved away from a remote list is created in the new location
/// and then deleted from the old one. Local reminders only trigger the
/// delete half of a move. A replayed move whose create already went through
/// updates that copy instead of creating another.
pub async fn push_reminder(
    store: &mut Store,
    remote: &dyn TaskRemote,
    id: &str,
    origin: &UpdateOrigin,
) -> Result<(), SyncError> {
    let reminder = store
        .get(id)
        .cloned()
        .ok_or_else(|| SyncError::NotFound(format!("reminder {id}")))?;

    let moving = origin
        .old_list
        .as_deref()
        .is_some_and(|old| old != reminder.list_id);
    let current_task = reminder.remote_task_id.clone();
    let old_task = origin.old_task.clone().unwrap_or_else(|| current_task.clone());

    if !is_local_location(&reminder.user_id, &reminder.list_id) {
        let list = remote_list(store, &reminder.list_id)?;
        let fields = reminder.task_fields();
        let existing = if moving && current_task == old_task {
            None
        } else {
            Some(current_task.as_str()).filter(|task| !task.is_empty())
        };
        let task_id = match existing {
            Some(task) => {
                let patch = TaskPatch::Full(fields.clone());
                match remote.update_task(&reminder.user_id, &list, task, &patch).await {
                    Err(TodoError::NotFound(_)) if moving => {
                        remote.create_task(&reminder.user_id, &list, &fields).await?
                    }
                    other => other?,
                }
            }
            None => remote.create_task(&reminder.user_id, &list, &fields).await?,
        };
        debug!(id, task = %task_id, "pushed reminder");
        if let Some(stored) = store.get_mut(id) {
            stored.remote_task_id = task_id;
        }
    }

    if moving {
        let old_user = origin.old_user.as_deref().unwrap_or(&reminder.user_id);
        let old_list = origin.old_list.as_deref().unwrap_or(LOCAL_LIST);
        if !old_task.is_empty() {
            delete_copy(store, remote, old_user, old_list, &old_task).await?;
        }
        for stray in &origin.strays {
            delete_copy(store, remote, &stray.user, &stray.list, &stray.task).await?;
        }
        if is_local_location(&reminder.user_id, &reminder.list_id) {
            if let Some(stored) = store.get_mut(id) {
                stored.remote_task_id.clear();
            }
        }
    }
    Ok(())
}

/// Remove a moved reminder's copy from a list it left.
async fn delete_copy(
    store: &Store,
    remote: &dyn TaskRemote,
    user: &str,
    list: &str,
    task: &str,
) -> Result<(), SyncError> {
    if is_local_location(user, list) {
        return Ok(());
    }
    if let Some(remote_list) = store.lists().remote_id(list) {
        ignore_missing(remote.delete_task(user, remote_list, task).await)?;
        debug!(task, from = list, "removed moved reminder from old list");
    }
    Ok(())
}

/// Send only the completion status of a reminder.
///
/// A reminder that has never reached the remote is pushed in full instead.
pub async fn push_completed(
    store: &mut Store,
    remote: &dyn TaskRemote,
    id: &str,
) -> Result<(), SyncError> {
    let reminder = store
        .get(id)
        .cloned()
        .ok_or_else(|| SyncError::NotFound(format!("reminder {id}")))?;
    if is_local_location(&reminder.user_id, &reminder.list_id) {
        return Ok(());
    }
    if reminder.remote_task_id.is_empty() {
        return push_reminder(store, remote, id, &UpdateOrigin::default()).await;
    }

    let list = remote_list(store, &reminder.list_id)?;
    let task_id = remote
        .update_task(
            &reminder.user_id,
            &list,
            &reminder.remote_task_id,
            &TaskPatch::Completed(reminder.completed),
        )
        .await?;
    if let Some(stored) = store.get_mut(id) {
        stored.remote_task_id = task_id;
    }
    Ok(())
}

/// Delete a remote task. A task already gone counts as deleted.
pub async fn delete_task(
    remote: &dyn TaskRemote,
    user: &str,
    list: &str,
    task: &str,
) -> Result<(), SyncError> {
    ignore_missing(remote.delete_task(user, list, task).await)
}

/// Create a list remotely and record its remote id.
pub async fn push_list_create(
    store: &mut Store,
    remote: &dyn TaskRemote,
    id: &str,
) -> Result<(), SyncError> {
    let list = store
        .lists()
        .get(id)
        .cloned()
        .ok_or_else(|| SyncError::NotFound(format!("list {id}")))?;
    if list.user_id == LOCAL_USER {
        return Ok(());
    }

    let remote_id = remote.create_list(&list.user_id, &list.name).await?;
    debug!(id, remote = %remote_id, "created list");
    if let Some(stored) = store.lists_mut().get_mut(id) {
        stored.remote_id = remote_id;
    }
    Ok(())
}

/// Push a list's current name.
pub async fn push_list_update(
    store: &Store,
    remote: &dyn TaskRemote,
    id: &str,
) -> Result<(), SyncError> {
    let list = store
        .lists()
        .get(id)
        .ok_or_else(|| SyncError::NotFound(format!("list {id}")))?;
    if list.user_id == LOCAL_USER {
        return Ok(());
    }
    let remote_id = remote_list(store, id)?;
    remote
        .update_list(&list.user_id, &remote_id, &list.name)
        .await?;
    Ok(())
}

/// Delete a remote list. A list already gone counts as deleted.
pub async fn delete_list(remote: &dyn TaskRemote, user: &str, list: &str) -> Result<(), SyncError> {
    ignore_missing(remote.delete_list(user, list).await)
}

/// Carry out one queued operation against the remote.
pub async fn perform(
    store: &mut Store,
    remote: &dyn TaskRemote,
    operation: &QueueOperation,
) -> Result<(), SyncError> {
    match operation {
        QueueOperation::ListCreate { id } => push_list_create(store, remote, id).await,
        QueueOperation::ReminderCreate { id } => {
            push_reminder(store, remote, id, &UpdateOrigin::default()).await
        }
        QueueOperation::ReminderComplete { id } => push_completed(store, remote, id).await,
        QueueOperation::ReminderUpdate { id, origin } => {
            push_reminder(store, remote, id, origin).await
        }
        QueueOperation::ListUpdate { id } => push_list_update(store, remote, id).await,
        QueueOperation::ReminderDelete {
            user,
            list,
            remote_id,
            ..
        } => delete_task(remote, user, list, remote_id).await,
        QueueOperation::ListDelete { user, remote_id, .. } => {
            delete_list(remote, user, remote_id).await
        }
    }
}

fn is_local_location(user: &str, list: &str) -> bool {
    user == LOCAL_USER || list == LOCAL_LIST
}

fn remote_list(store: &Store, list: &str) -> Result<String, SyncError> {
    store
        .lists()
        .remote_id(list)
        .map(str::to_string)
        .ok_or_else(|| SyncError::NotFound(format!("remote id of list {list}")))
}

fn ignore_missing(result: Result<(), TodoError>) -> Result<(), SyncError> {
    match result {
        Err(TodoError::NotFound(what)) => {
            debug!(%what, "already gone remotely");
            Ok(())
        }
        other => Ok(other?),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{OperationQueue, Reminder, TaskList};
    use std::collections::BTreeMap;
    use nudge_todo::MemoryRemote;
    use nudge_todo::memory::RemoteCall;
    use pretty_assertions::assert_eq;

    fn account_store(remote: &MemoryRemote) -> Store {
        remote.add_account("u1", "u1@example.com");
        remote.insert_list("u1", "R2", "Errands");
        let mut store = Store::in_memory();
        for (id, remote_id) in [("u1", "u1-default"), ("errands", "R2")] {
            store.lists_mut().insert(TaskList {
                id: id.to_string(),
                user_id: "u1".to_string(),
                name: id.to_string(),
                remote_id: remote_id.to_string(),
            });
        }
        store
    }

    fn remote_reminder(id: &str) -> Reminder {
        Reminder {
            title: "call mum".to_string(),
            user_id: "u1".to_string(),
            list_id: "u1".to_string(),
            ..Reminder::new(id)
        }
    }

    #[tokio::test]
    async fn test_push_creates_then_updates() {
        let remote = MemoryRemote::new();
        let mut store = account_store(&remote);
        store.insert(remote_reminder("a"));

        push_reminder(&mut store, &remote, "a", &UpdateOrigin::default())
            .await
            .unwrap();
        let task = store.get("a").unwrap().remote_task_id.clone();
        assert!(!task.is_empty());

        store.get_mut("a").unwrap().title = "call dad".to_string();
        push_reminder(&mut store, &remote, "a", &UpdateOrigin::default())
            .await
            .unwrap();

        assert_eq!(remote.task("u1", &task).unwrap().title, "call dad");
        assert!(matches!(remote.calls()[1], RemoteCall::UpdateTask { .. }));
    }

    #[tokio::test]
    async fn test_move_between_lists_creates_then_deletes() {
        let remote = MemoryRemote::new();
        let mut store = account_store(&remote);
        store.insert(remote_reminder("a"));
        push_reminder(&mut store, &remote, "a", &UpdateOrigin::default())
            .await
            .unwrap();
        let old_task = store.get("a").unwrap().remote_task_id.clone();
        remote.clear_calls();

        store.get_mut("a").unwrap().list_id = "errands".to_string();
        let origin = UpdateOrigin::moved_from("u1", "u1", &old_task);
        push_reminder(&mut store, &remote, "a", &origin).await.unwrap();

        let calls = remote.calls();
        assert_eq!(calls.len(), 2);
        assert!(matches!(&calls[0], RemoteCall::CreateTask { list, .. } if list == "R2"));
        assert_eq!(
            calls[1],
            RemoteCall::DeleteTask {
                user: "u1".to_string(),
                list: "u1-default".to_string(),
                task: old_task.clone(),
            }
        );
        assert_ne!(store.get("a").unwrap().remote_task_id, old_task);
    }

    #[tokio::test]
    async fn test_move_to_local_only_deletes() {
        let remote = MemoryRemote::new();
        let mut store = account_store(&remote);
        store.insert(remote_reminder("a"));
        push_reminder(&mut store, &remote, "a", &UpdateOrigin::default())
            .await
            .unwrap();
        remote.clear_calls();

        let mut moved = store.get("a").cloned().unwrap();
        let origin = UpdateOrigin::moved_from("u1", "u1", &moved.remote_task_id);
        moved.user_id = LOCAL_USER.to_string();
        moved.list_id = LOCAL_LIST.to_string();
        store.insert(moved);
        push_reminder(&mut store, &remote, "a", &origin).await.unwrap();

        assert!(matches!(remote.calls().as_slice(), [RemoteCall::DeleteTask { .. }]));
        assert!(store.get("a").unwrap().remote_task_id.is_empty());
    }

    fn tasks_by_list(remote: &MemoryRemote, user: &str) -> BTreeMap<String, Vec<String>> {
        remote.snapshot()[user]
            .iter()
            .map(|list| {
                let tasks = list.tasks.iter().map(|t| t.id.clone()).collect();
                (list.id.clone(), tasks)
            })
            .collect()
    }

    #[tokio::test]
    async fn test_retried_move_after_failed_delete_keeps_one_copy() {
        let remote = MemoryRemote::new();
        let mut store = account_store(&remote);
        store.insert(remote_reminder("a"));
        push_reminder(&mut store, &remote, "a", &UpdateOrigin::default())
            .await
            .unwrap();
        let old_task = store.get("a").unwrap().remote_task_id.clone();
        remote.clear_calls();

        store.get_mut("a").unwrap().list_id = "errands".to_string();
        let origin = UpdateOrigin::moved_from("u1", "u1", &old_task);
        remote.fail_task_deletes(1);
        let err = push_reminder(&mut store, &remote, "a", &origin)
            .await
            .unwrap_err();
        assert!(err.is_connectivity());

        push_reminder(&mut store, &remote, "a", &origin).await.unwrap();

        let moved_task = store.get("a").unwrap().remote_task_id.clone();
        let tasks = tasks_by_list(&remote, "u1");
        assert_eq!(tasks["u1-default"], Vec::<String>::new());
        assert_eq!(tasks["R2"], vec![moved_task]);
        let creates = remote
            .calls()
            .iter()
            .filter(|call| matches!(call, RemoteCall::CreateTask { .. }))
            .count();
        assert_eq!(creates, 1);
    }

    #[tokio::test]
    async fn test_folded_moves_remove_intermediate_copy() {
        let remote = MemoryRemote::new();
        let mut store = account_store(&remote);
        remote.insert_list("u1", "R3", "Home");
        store.lists_mut().insert(TaskList {
            id: "home".to_string(),
            user_id: "u1".to_string(),
            name: "home".to_string(),
            remote_id: "R3".to_string(),
        });
        store.insert(remote_reminder("a"));
        push_reminder(&mut store, &remote, "a", &UpdateOrigin::default())
            .await
            .unwrap();
        let first_task = store.get("a").unwrap().remote_task_id.clone();

        // Moved to errands: created there, but the old copy survives.
        store.get_mut("a").unwrap().list_id = "errands".to_string();
        let first_move = UpdateOrigin::moved_from("u1", "u1", &first_task);
        remote.fail_task_deletes(1);
        push_reminder(&mut store, &remote, "a", &first_move)
            .await
            .unwrap_err();
        let mut queue = OperationQueue::in_memory();
        queue.enqueue(QueueOperation::ReminderUpdate {
            id: "a".to_string(),
            origin: first_move,
        });

        // Moved on to home before the queue drained.
        let second_task = store.get("a").unwrap().remote_task_id.clone();
        store.get_mut("a").unwrap().list_id = "home".to_string();
        queue.enqueue(QueueOperation::ReminderUpdate {
            id: "a".to_string(),
            origin: UpdateOrigin::moved_from("u1", "errands", &second_task),
        });
        assert_eq!(queue.len(), 1);

        let report = queue.flush(&mut store, &remote).await.unwrap();
        assert_eq!(report.pushed, 1);

        let final_task = store.get("a").unwrap().remote_task_id.clone();
        let tasks = tasks_by_list(&remote, "u1");
        assert_eq!(tasks["u1-default"], Vec::<String>::new());
        assert_eq!(tasks["R2"], Vec::<String>::new());
        assert_eq!(tasks["R3"], vec![final_task]);
    }

    #[tokio::test]
    async fn test_completion_sends_status_only() {
        let remote = MemoryRemote::new();
        let mut store = account_store(&remote);
        store.insert(remote_reminder("a"));
        push_reminder(&mut store, &remote, "a", &UpdateOrigin::default())
            .await
            .unwrap();
        remote.clear_calls();

        store.get_mut("a").unwrap().completed = true;
        push_completed(&mut store, &remote, "a").await.unwrap();

        assert!(matches!(
            remote.calls().as_slice(),
            [RemoteCall::UpdateTask { patch: TaskPatch::Completed(true), .. }]
        ));
    }

    #[tokio::test]
    async fn test_deleting_missing_task_succeeds() {
        let remote = MemoryRemote::new();
        remote.add_account("u1", "u1@example.com");
        delete_task(&remote, "u1", "u1-default", "nope").await.unwrap();
    }

    #[tokio::test]
    async fn test_offline_push_is_connectivity() {
        let remote = MemoryRemote::new();
        let mut store = account_store(&remote);
        store.insert(remote_reminder("a"));
        remote.set_online(false);

        let err = push_reminder(&mut store, &remote, "a", &UpdateOrigin::default())
            .await
            .unwrap_err();
        assert!(err.is_connectivity());
        assert!(store.get("a").unwrap().remote_task_id.is_empty());
    }
}
