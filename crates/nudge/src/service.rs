//! The reminder service loop.
//!
//! One task owns the store, the offline queue, the countdowns and the
//! settings. Clients talk to it through a [`ServiceHandle`]: requests travel
//! over an mpsc channel and are answered on a oneshot, notifications go out
//! on a broadcast channel. Remote work a request causes is attempted after
//! the request has been answered, so a slow remote never delays a reply.

use std::collections::{BTreeMap, BTreeSet};
use std::ops::ControlFlow;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::{Local, TimeZone, Utc};
use nudge_scheduler::{Advance, Countdowns, TimerKey, next_occurrence};
use nudge_sync::{
    LOCAL_USER, OperationQueue, QueueOperation, Reminder, Store, TaskList, UpdateOrigin, push,
    reconcile,
};
use nudge_todo::{Account, DeviceCodePrompt, LoginPrompt, TaskRemote, TodoError};
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::config::{QUEUE_FILE, SETTINGS_FILE, ServiceConfig, Settings};
use crate::events::SERVICE_APP_ID;
use crate::{Command, Event, ReminderInput, Reply, ServiceError};

/// Request channel buffer size.
const COMMAND_CHANNEL_SIZE: usize = 64;

/// Notification channel capacity. Slow subscribers miss older events.
const EVENT_CHANNEL_SIZE: usize = 256;

/// Name of the periodic refresh timer.
pub const REFRESH_TIMER: &str = "refresh";

/// Source of the current unix time in seconds.
pub type Clock = Arc<dyn Fn() -> i64 + Send + Sync>;

/// The wall clock.
pub fn system_clock() -> Clock {
    Arc::new(|| Utc::now().timestamp())
}

/// The service and the channels feeding it.
pub struct Service<Tz: TimeZone = Local> {
    core: Core<Tz>,
    commands: mpsc::Receiver<Command>,
    logins: mpsc::Receiver<Result<Account, TodoError>>,
}

struct Core<Tz: TimeZone> {
    store: Store,
    queue: OperationQueue,
    countdowns: Countdowns<String>,
    settings: Settings,
    settings_path: Option<PathBuf>,
    remote: Arc<dyn TaskRemote>,
    events: broadcast::Sender<Event>,
    logins: mpsc::Sender<Result<Account, TodoError>>,
    clock: Clock,
    tz: Tz,
    /// Remote work caused by the request being handled.
    outbox: Vec<QueueOperation>,
    refresh_requested: bool,
}

impl<Tz> Service<Tz>
where
    Tz: TimeZone + Send + Sync + 'static,
    Tz::Offset: Send + Sync,
{
    /// Load persisted state and wire up the channels.
    ///
    /// Returns the service and a handle for talking to it.
    pub fn new(
        config: &ServiceConfig,
        remote: Arc<dyn TaskRemote>,
        tz: Tz,
        clock: Clock,
    ) -> (Self, ServiceHandle) {
        let (store, queue, settings_path) = match &config.data_dir {
            Some(dir) => (
                Store::open(dir.clone()),
                OperationQueue::load(dir.join(QUEUE_FILE)),
                Some(dir.join(SETTINGS_FILE)),
            ),
            None => (Store::in_memory(), OperationQueue::in_memory(), None),
        };
        let mut settings = settings_path
            .as_deref()
            .map(Settings::load)
            .unwrap_or_default();
        if let Some(minutes) = config.refresh_minutes {
            if let Err(e) = settings.set_refresh_minutes(minutes) {
                warn!(error = %e, "ignoring refresh interval override");
            }
        }

        let (command_tx, command_rx) = mpsc::channel(COMMAND_CHANNEL_SIZE);
        let (login_tx, login_rx) = mpsc::channel(1);
        let (events, _) = broadcast::channel(EVENT_CHANNEL_SIZE);

        let core = Core {
            store,
            queue,
            countdowns: Countdowns::new(),
            settings,
            settings_path,
            remote,
            events: events.clone(),
            logins: login_tx,
            clock,
            tz,
            outbox: Vec::new(),
            refresh_requested: false,
        };
        let service = Self {
            core,
            commands: command_rx,
            logins: login_rx,
        };
        let handle = ServiceHandle {
            commands: command_tx,
            events,
        };
        (service, handle)
    }

    /// Run the loop until `quit`, a shutdown signal, or every handle is dropped.
    ///
    /// Shutdown drops every armed timer without firing it.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let Service {
            mut core,
            mut commands,
            mut logins,
        } = self;

        info!(
            reminders = core.store.reminders().count(),
            queued = core.queue.len(),
            "service started"
        );
        core.start().await;

        loop {
            let now = core.now();
            tokio::select! {
                biased;

                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("shutdown requested");
                        break;
                    }
                }

                command = commands.recv() => match command {
                    Some(command) => {
                        if core.handle(command).await.is_break() {
                            break;
                        }
                    }
                    None => {
                        debug!("all handles dropped");
                        break;
                    }
                },

                Some(result) = logins.recv() => core.finish_login(result).await,

                _ = core.countdowns.sleep(now) => core.fire_due().await,
            }
        }

        core.stop();
        info!("service stopped");
    }

    /// Spawn the loop as a background task.
    pub fn spawn(self, shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(self.run(shutdown))
    }
}

impl<Tz> Core<Tz>
where
    Tz: TimeZone + Send + Sync + 'static,
    Tz::Offset: Send + Sync,
{
    fn now(&self) -> i64 {
        (self.clock)()
    }

    fn emit(&self, event: Event) {
        trace!(?event, "publishing event");
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    async fn start(&mut self) {
        self.arm_all();
        self.arm_refresh();
        self.refresh_logged().await;
    }

    fn stop(&mut self) {
        self.countdowns.clear();
        self.save_store();
        if let Err(e) = self.queue.save() {
            warn!(error = %e, "failed to save queue");
        }
        self.save_settings();
    }

    async fn handle(&mut self, command: Command) -> ControlFlow<()> {
        match command {
            Command::CreateReminder {
                app_id,
                input,
                reply,
            } => send(reply, self.create_reminder(&app_id, input)),
            Command::UpdateReminder {
                app_id,
                id,
                input,
                reply,
            } => send(reply, self.update_reminder(&app_id, &id, input)),
            Command::UpdateCompleted {
                app_id,
                id,
                completed,
                reply,
            } => send(reply, self.update_completed(&app_id, &id, completed)),
            Command::RemoveReminder { app_id, id, reply } => {
                send(reply, self.remove_reminder(&app_id, &id))
            }
            Command::ReturnReminders { reply } => {
                send(reply, Ok(self.store.reminders().cloned().collect()))
            }
            Command::ReturnLists { reply } => send(reply, Ok(self.store.lists().names())),
            Command::CreateList {
                app_id,
                user,
                name,
                reply,
            } => send(reply, self.create_list(&app_id, &user, &name)),
            Command::RenameList {
                app_id,
                user,
                list,
                name,
                reply,
            } => send(reply, self.rename_list(&app_id, &user, &list, &name)),
            Command::RemoveList {
                app_id,
                user,
                list,
                reply,
            } => send(reply, self.remove_list(&app_id, &user, &list)),
            Command::GetSyncedLists { reply } => {
                send(reply, Ok(self.settings.synced_lists.as_map().clone()))
            }
            Command::SetSyncedLists { selection, reply } => {
                self.set_synced_lists(selection);
                send(reply, Ok(()))
            }
            Command::SetRefreshInterval { minutes, reply } => {
                send(reply, self.set_refresh_interval(minutes))
            }
            Command::Refresh { reply } => {
                let result = self.refresh().await;
                send(reply, result)
            }
            Command::GetVersion { reply } => {
                send(reply, Ok(env!("CARGO_PKG_VERSION").to_string()))
            }
            Command::Accounts { reply } => {
                let result = self.remote.list_accounts().await.map_err(ServiceError::from);
                send(reply, result)
            }
            Command::Login { reply } => {
                self.start_login();
                send(reply, Ok(()))
            }
            Command::Logout { user, reply } => {
                let result = self.logout(&user).await;
                send(reply, result)
            }
            Command::Quit { reply } => {
                info!("quit requested");
                send(reply, Ok(()));
                return ControlFlow::Break(());
            }
        }

        self.sync_outbox().await;
        if std::mem::take(&mut self.refresh_requested) {
            self.refresh_logged().await;
        }
        ControlFlow::Continue(())
    }

    fn validate(&self, input: &ReminderInput) -> Result<(), ServiceError> {
        if input.timestamp < 0 || input.due_date < 0 {
            return Err(ServiceError::Validation(
                "times must not be negative".to_string(),
            ));
        }
        if input.user_id != LOCAL_USER && input.repeat.is_some() {
            return Err(ServiceError::Validation(
                "reminders of remote accounts cannot repeat".to_string(),
            ));
        }
        if !self.store.lists().owns(&input.user_id, &input.list_id) {
            return Err(ServiceError::NotFound(format!(
                "list {} of {}",
                input.list_id, input.user_id
            )));
        }
        Ok(())
    }

    fn create_reminder(
        &mut self,
        app_id: &str,
        input: ReminderInput,
    ) -> Result<(String, i64), ServiceError> {
        self.validate(&input)?;
        let now = self.now();
        let id = self.store.mint_id();

        let mut reminder = Reminder::new(id.clone());
        input.apply_to(&mut reminder);
        reminder.normalize_due_date(&self.tz);
        reminder.created_timestamp = now;
        reminder.updated_timestamp = now;
        let local = reminder.is_local();

        self.store.insert(reminder);
        self.save_reminders();
        self.emit_reminder(app_id, &id);
        self.arm(&id);
        if !local {
            self.outbox
                .push(QueueOperation::ReminderCreate { id: id.clone() });
        }
        info!(id = %id, "created reminder");
        Ok((id, now))
    }

    fn update_reminder(
        &mut self,
        app_id: &str,
        id: &str,
        input: ReminderInput,
    ) -> Result<i64, ServiceError> {
        let previous = self
            .store
            .get(id)
            .cloned()
            .ok_or_else(|| ServiceError::NotFound(format!("reminder {id}")))?;
        self.validate(&input)?;
        let now = self.now();

        let mut reminder = previous.clone();
        input.apply_to(&mut reminder);
        reminder.normalize_due_date(&self.tz);
        reminder.updated_timestamp = now;

        let moved = reminder.user_id != previous.user_id || reminder.list_id != previous.list_id;
        let origin = if moved {
            UpdateOrigin::moved_from(&previous.user_id, &previous.list_id, &previous.remote_task_id)
        } else {
            UpdateOrigin::default()
        };
        let touches_remote = !previous.is_local() || !reminder.is_local();

        self.store.insert(reminder);
        self.save_reminders();
        self.emit_reminder(app_id, id);
        self.arm(id);
        if touches_remote {
            self.outbox.push(QueueOperation::ReminderUpdate {
                id: id.to_string(),
                origin,
            });
        }
        debug!(id, moved, "updated reminder");
        Ok(now)
    }

    fn update_completed(
        &mut self,
        app_id: &str,
        id: &str,
        completed: bool,
    ) -> Result<i64, ServiceError> {
        let now = self.now();
        let reminder = self
            .store
            .get_mut(id)
            .ok_or_else(|| ServiceError::NotFound(format!("reminder {id}")))?;
        reminder.completed = completed;
        reminder.updated_timestamp = now;
        let local = reminder.is_local();

        self.save_reminders();
        if completed {
            self.countdowns.cancel(&id.to_string());
        } else {
            self.arm(id);
        }
        self.emit(Event::CompletedUpdated {
            app_id: app_id.to_string(),
            id: id.to_string(),
            completed,
            updated_timestamp: now,
        });
        if !local {
            self.outbox
                .push(QueueOperation::ReminderComplete { id: id.to_string() });
        }
        Ok(now)
    }

    fn remove_reminder(&mut self, app_id: &str, id: &str) -> Result<(), ServiceError> {
        let reminder = self
            .store
            .remove(id)
            .ok_or_else(|| ServiceError::NotFound(format!("reminder {id}")))?;
        self.countdowns.cancel(&reminder.id);
        self.save_reminders();
        self.emit(Event::ReminderRemoved {
            app_id: app_id.to_string(),
            id: id.to_string(),
        });

        // Copies a half-finished move left in other lists go too.
        for copy in self.queue.leftover_copies(id) {
            if copy.user == LOCAL_USER || copy.task == reminder.remote_task_id {
                continue;
            }
            if let Some(list) = self.store.lists().remote_id(&copy.list) {
                self.outbox.push(QueueOperation::ReminderDelete {
                    id: reminder.id.clone(),
                    user: copy.user,
                    list: list.to_string(),
                    remote_id: copy.task,
                });
            }
        }
        if !reminder.is_local() {
            let list = self
                .store
                .lists()
                .remote_id(&reminder.list_id)
                .unwrap_or_default()
                .to_string();
            self.outbox.push(QueueOperation::ReminderDelete {
                id: reminder.id,
                user: reminder.user_id,
                list,
                remote_id: reminder.remote_task_id,
            });
        }
        info!(id, "removed reminder");
        Ok(())
    }

    fn owned_list(&self, user: &str, list: &str) -> Result<&TaskList, ServiceError> {
        self.store
            .lists()
            .get(list)
            .filter(|l| l.user_id == user)
            .ok_or_else(|| ServiceError::NotFound(format!("list {list} of {user}")))
    }

    fn create_list(&mut self, app_id: &str, user: &str, name: &str) -> Result<String, ServiceError> {
        let name = list_name(name)?;
        if user != LOCAL_USER && !self.store.lists().owns(user, user) {
            return Err(ServiceError::NotFound(format!("account {user}")));
        }

        let id = self.store.mint_id();
        self.store.lists_mut().insert(TaskList {
            id: id.clone(),
            user_id: user.to_string(),
            name: name.clone(),
            remote_id: String::new(),
        });
        self.save_lists();
        self.emit(Event::ListUpdated {
            app_id: app_id.to_string(),
            user: user.to_string(),
            list: id.clone(),
            name,
        });

        if user != LOCAL_USER {
            self.settings.synced_lists.add(user, &id);
            self.save_settings();
            self.outbox
                .push(QueueOperation::ListCreate { id: id.clone() });
        }
        info!(id = %id, user, "created list");
        Ok(id)
    }

    fn rename_list(
        &mut self,
        app_id: &str,
        user: &str,
        list: &str,
        name: &str,
    ) -> Result<(), ServiceError> {
        let name = list_name(name)?;
        self.owned_list(user, list)?;
        if let Some(stored) = self.store.lists_mut().get_mut(list) {
            stored.name = name.clone();
        }
        self.save_lists();
        self.emit(Event::ListUpdated {
            app_id: app_id.to_string(),
            user: user.to_string(),
            list: list.to_string(),
            name,
        });
        if user != LOCAL_USER {
            self.outbox.push(QueueOperation::ListUpdate {
                id: list.to_string(),
            });
        }
        Ok(())
    }

    /// Delete a list together with its reminders.
    fn remove_list(&mut self, app_id: &str, user: &str, list: &str) -> Result<(), ServiceError> {
        let target = self.owned_list(user, list)?.clone();
        if target.is_default() {
            return Err(ServiceError::Validation(format!(
                "the default list of {user} cannot be removed"
            )));
        }

        let doomed: Vec<String> = self
            .store
            .reminders()
            .filter(|r| r.user_id == user && r.list_id == list)
            .map(|r| r.id.clone())
            .collect();
        for id in &doomed {
            self.store.remove(id);
            self.countdowns.cancel(id);
            self.emit(Event::ReminderRemoved {
                app_id: app_id.to_string(),
                id: id.clone(),
            });
        }
        self.store.lists_mut().remove(list);
        self.save_store();
        self.emit(Event::ListRemoved {
            app_id: app_id.to_string(),
            user: user.to_string(),
            list: list.to_string(),
        });
        if self.settings.synced_lists.remove(user, list) {
            self.save_settings();
            self.emit(Event::SyncedListsChanged(
                self.settings.synced_lists.as_map().clone(),
            ));
        }

        if user != LOCAL_USER {
            self.outbox.push(QueueOperation::ListDelete {
                id: target.id,
                user: target.user_id,
                remote_id: target.remote_id,
            });
        }
        info!(list, reminders = doomed.len(), "removed list");
        Ok(())
    }

    fn set_synced_lists(&mut self, selection: BTreeMap<String, BTreeSet<String>>) {
        self.settings.set_synced_lists(selection.clone());
        self.save_settings();
        self.emit(Event::SyncedListsChanged(selection));
        self.refresh_requested = true;
    }

    fn set_refresh_interval(&mut self, minutes: u32) -> Result<(), ServiceError> {
        self.settings.set_refresh_minutes(minutes)?;
        self.save_settings();
        self.arm_refresh();
        info!(minutes, "refresh interval changed");
        Ok(())
    }

    /// Flush the queue, fetch the remote state and merge it in.
    ///
    /// An unreachable remote leaves the store untouched.
    #[tracing::instrument(skip(self))]
    async fn refresh(&mut self) -> Result<(), ServiceError> {
        self.queue.flush(&mut self.store, self.remote.as_ref()).await?;
        let snapshot = self.remote.fetch_lists_and_tasks().await?;

        let now = self.now();
        let overlay = self.queue.overlay();
        let diff = reconcile::reconcile(
            &mut self.store,
            &snapshot,
            &self.settings.synced_lists,
            &overlay,
            now,
            &self.tz,
        );
        self.save_store();

        for id in &diff.removed {
            self.countdowns.cancel(id);
        }
        // Wall-clock drift from a suspend is corrected here.
        self.arm_all();

        for change in diff.lists_changed {
            self.emit(Event::ListUpdated {
                app_id: SERVICE_APP_ID.to_string(),
                user: change.user,
                list: change.list,
                name: change.name,
            });
        }
        for change in diff.lists_removed {
            self.emit(Event::ListRemoved {
                app_id: SERVICE_APP_ID.to_string(),
                user: change.user,
                list: change.list,
            });
        }
        let updated = diff
            .changed
            .iter()
            .filter_map(|id| self.store.get(id).cloned())
            .collect();
        self.emit(Event::Refreshed {
            updated,
            removed: diff.removed,
        });
        Ok(())
    }

    async fn refresh_logged(&mut self) {
        match self.refresh().await {
            Ok(()) => {}
            Err(ServiceError::Connectivity(e)) => info!(error = %e, "remote unreachable, refresh skipped"),
            Err(e) => warn!(error = %e, "refresh failed"),
        }
    }

    /// Try every operation the last request caused.
    async fn sync_outbox(&mut self) {
        for operation in std::mem::take(&mut self.outbox) {
            self.sync_now(operation).await;
        }
    }

    /// Send one operation to the remote, or queue it if that is not possible.
    ///
    /// Anything already queued goes first so the remote sees operations in
    /// the order they were made.
    async fn sync_now(&mut self, operation: QueueOperation) {
        if !self.queue.is_empty() {
            if let Err(e) = self.queue.flush(&mut self.store, self.remote.as_ref()).await {
                debug!(error = %e, ?operation, "queue still pending, deferring");
                self.queue.enqueue(operation);
                return;
            }
        }
        if never_pushed(&operation) {
            // Cancels whatever create is still queued for it.
            self.queue.enqueue(operation);
            return;
        }

        match push::perform(&mut self.store, self.remote.as_ref(), &operation).await {
            Ok(()) => {
                debug!(?operation, "synced");
                self.save_store();
            }
            Err(e) if e.is_connectivity() => {
                info!(error = %e, ?operation, "remote unreachable, queued");
                // Keep remote ids a partial move already obtained.
                self.save_store();
                self.queue.enqueue(operation);
            }
            Err(e) => warn!(error = %e, ?operation, "remote rejected operation"),
        }
    }

    fn start_login(&mut self) {
        let remote = Arc::clone(&self.remote);
        let events = self.events.clone();
        let results = self.logins.clone();
        info!("starting sign-in");
        tokio::spawn(async move {
            let prompt: LoginPrompt = Box::new(move |prompt: DeviceCodePrompt| {
                let _ = events.send(Event::LoginPrompt {
                    verification_uri: prompt.verification_uri,
                    user_code: prompt.user_code,
                    message: prompt.message,
                });
            });
            let result = remote.login(prompt).await;
            let _ = results.send(result).await;
        });
    }

    async fn finish_login(&mut self, result: Result<Account, TodoError>) {
        let account = match result {
            Ok(account) => account,
            Err(e) => {
                warn!(error = %e, "sign-in failed");
                self.emit(Event::LoginFailed {
                    message: e.to_string(),
                });
                return;
            }
        };
        info!(user = %account.user_id, "signed in");
        self.settings.synced_lists.select_all(&account.user_id);
        self.save_settings();
        self.emit(Event::SignedIn {
            user: account.user_id,
            email: account.email,
        });
        self.emit(Event::SyncedListsChanged(
            self.settings.synced_lists.as_map().clone(),
        ));
        self.refresh_logged().await;
    }

    /// Sign out and drop everything mirrored from the account.
    async fn logout(&mut self, user: &str) -> Result<(), ServiceError> {
        if user == LOCAL_USER {
            return Err(ServiceError::Validation(
                "the local account cannot sign out".to_string(),
            ));
        }
        self.remote.logout(user).await?;
        self.queue.forget_user(&self.store, user);

        let removed: Vec<String> = self
            .store
            .remote()
            .values()
            .filter(|r| r.user_id == user)
            .map(|r| r.id.clone())
            .collect();
        for id in &removed {
            self.store.remove(id);
            self.countdowns.cancel(id);
        }
        let lists: Vec<String> = self
            .store
            .lists()
            .iter()
            .filter(|l| l.user_id == user)
            .map(|l| l.id.clone())
            .collect();
        self.store.lists_mut().retain(|l| l.user_id != user);
        self.save_store();
        self.settings.synced_lists.remove_user(user);
        self.save_settings();

        for list in lists {
            self.emit(Event::ListRemoved {
                app_id: SERVICE_APP_ID.to_string(),
                user: user.to_string(),
                list,
            });
        }
        if !removed.is_empty() {
            self.emit(Event::Refreshed {
                updated: Vec::new(),
                removed,
            });
        }
        self.emit(Event::SignedOut {
            user: user.to_string(),
        });
        info!(user, "signed out");
        self.refresh_requested = true;
        Ok(())
    }

    /// Arm the countdown for a reminder's current occurrence.
    ///
    /// An occurrence that can never notify is marked handled instead.
    fn arm(&mut self, id: &str) {
        let key = id.to_string();
        self.countdowns.cancel(&key);
        let Some(reminder) = self.store.get_mut(id) else {
            return;
        };

        if reminder.settle(&self.tz) {
            let reminder = reminder.clone();
            debug!(id, "occurrence cannot notify, marked handled");
            self.save_reminders();
            self.emit(Event::ReminderUpdated {
                app_id: SERVICE_APP_ID.to_string(),
                reminder,
            });
            return;
        }
        if reminder.is_armable(&self.tz) {
            let fire_at = reminder.timestamp;
            self.countdowns.arm(key, fire_at, ());
        }
    }

    fn arm_all(&mut self) {
        let ids: Vec<String> = self.store.reminders().map(|r| r.id.clone()).collect();
        for id in ids {
            self.arm(&id);
        }
    }

    fn arm_refresh(&mut self) {
        let now = self.now();
        let interval = self.settings.refresh_secs();
        self.countdowns.arm_periodic(REFRESH_TIMER, interval, (), now);
    }

    async fn fire_due(&mut self) {
        let now = self.now();
        while let Some(fired) = self.countdowns.pop_due(now) {
            match fired.key {
                TimerKey::Reminder(id) => self.fire_reminder(&id, now),
                TimerKey::Periodic(name) if name == REFRESH_TIMER => {
                    self.arm_refresh();
                    self.refresh_logged().await;
                }
                TimerKey::Periodic(name) => debug!(name = %name, "ignoring unknown periodic timer"),
            }
        }
    }

    /// Notify, count the occurrence, and move a repeating reminder on.
    fn fire_reminder(&mut self, id: &str, now: i64) {
        let Some(reminder) = self.store.get_mut(id) else {
            debug!(id, "countdown for a removed reminder");
            return;
        };
        if !reminder.is_armable(&self.tz) {
            return;
        }

        reminder.remaining = reminder.remaining.decrement();
        reminder.old_timestamp = reminder.timestamp;
        if let Some(rule) = reminder.repeat.clone() {
            if let Advance::Next(next) = next_occurrence(&rule, reminder.occurrence(), now, &self.tz)
            {
                reminder.set_occurrence(next);
                reminder.normalize_due_date(&self.tz);
            }
        }

        let event = Event::ReminderFired {
            id: reminder.id.clone(),
            title: reminder.title.clone(),
            description: reminder.description.clone(),
            timestamp: reminder.timestamp,
            old_timestamp: reminder.old_timestamp,
            remaining: reminder.remaining,
        };
        info!(id, "reminder fired");
        self.emit(event);
        self.save_reminders();
        self.arm(id);
    }

    fn emit_reminder(&self, app_id: &str, id: &str) {
        if let Some(reminder) = self.store.get(id) {
            self.emit(Event::ReminderUpdated {
                app_id: app_id.to_string(),
                reminder: reminder.clone(),
            });
        }
    }

    fn save_reminders(&self) {
        if let Err(e) = self.store.save_reminders() {
            warn!(error = %e, "failed to save reminders");
        }
    }

    fn save_lists(&self) {
        if let Err(e) = self.store.save_lists() {
            warn!(error = %e, "failed to save lists");
        }
    }

    fn save_store(&self) {
        if let Err(e) = self.store.save() {
            warn!(error = %e, "failed to save store");
        }
    }

    fn save_settings(&self) {
        let Some(path) = &self.settings_path else {
            return;
        };
        if let Err(e) = self.settings.save(path) {
            warn!(error = %e, "failed to save settings");
        }
    }
}

fn send<T>(reply: Reply<T>, result: Result<T, ServiceError>) {
    // The client may have given up waiting.
    let _ = reply.send(result);
}

fn list_name(name: &str) -> Result<String, ServiceError> {
    let name = name.trim();
    if name.is_empty() {
        return Err(ServiceError::Validation(
            "list name must not be empty".to_string(),
        ));
    }
    Ok(name.to_string())
}

/// A delete of something the remote never received.
fn never_pushed(operation: &QueueOperation) -> bool {
    matches!(
        operation,
        QueueOperation::ReminderDelete { remote_id, .. } | QueueOperation::ListDelete { remote_id, .. }
            if remote_id.is_empty()
    )
}

/// Cheaply cloneable client side of the service.
#[derive(Clone)]
pub struct ServiceHandle {
    commands: mpsc::Sender<Command>,
    events: broadcast::Sender<Event>,
}

impl ServiceHandle {
    /// Receive notifications published from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.events.subscribe()
    }

    async fn request<T>(
        &self,
        command: impl FnOnce(Reply<T>) -> Command,
    ) -> Result<T, ServiceError> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(command(reply))
            .await
            .map_err(|_| ServiceError::Shutdown)?;
        response.await.map_err(|_| ServiceError::Shutdown)?
    }

    /// Create a reminder, returning its id and creation time.
    pub async fn create_reminder(
        &self,
        app_id: &str,
        input: ReminderInput,
    ) -> Result<(String, i64), ServiceError> {
        self.request(|reply| Command::CreateReminder {
            app_id: app_id.to_string(),
            input,
            reply,
        })
        .await
    }

    /// Replace a reminder's fields, returning the update time.
    pub async fn update_reminder(
        &self,
        app_id: &str,
        id: &str,
        input: ReminderInput,
    ) -> Result<i64, ServiceError> {
        self.request(|reply| Command::UpdateReminder {
            app_id: app_id.to_string(),
            id: id.to_string(),
            input,
            reply,
        })
        .await
    }

    pub async fn update_completed(
        &self,
        app_id: &str,
        id: &str,
        completed: bool,
    ) -> Result<i64, ServiceError> {
        self.request(|reply| Command::UpdateCompleted {
            app_id: app_id.to_string(),
            id: id.to_string(),
            completed,
            reply,
        })
        .await
    }

    pub async fn remove_reminder(&self, app_id: &str, id: &str) -> Result<(), ServiceError> {
        self.request(|reply| Command::RemoveReminder {
            app_id: app_id.to_string(),
            id: id.to_string(),
            reply,
        })
        .await
    }

    pub async fn return_reminders(&self) -> Result<Vec<Reminder>, ServiceError> {
        self.request(|reply| Command::ReturnReminders { reply }).await
    }

    /// List names as user id to list id to name.
    pub async fn return_lists(
        &self,
    ) -> Result<BTreeMap<String, BTreeMap<String, String>>, ServiceError> {
        self.request(|reply| Command::ReturnLists { reply }).await
    }

    pub async fn create_list(
        &self,
        app_id: &str,
        user: &str,
        name: &str,
    ) -> Result<String, ServiceError> {
        self.request(|reply| Command::CreateList {
            app_id: app_id.to_string(),
            user: user.to_string(),
            name: name.to_string(),
            reply,
        })
        .await
    }

    pub async fn rename_list(
        &self,
        app_id: &str,
        user: &str,
        list: &str,
        name: &str,
    ) -> Result<(), ServiceError> {
        self.request(|reply| Command::RenameList {
            app_id: app_id.to_string(),
            user: user.to_string(),
            list: list.to_string(),
            name: name.to_string(),
            reply,
        })
        .await
    }

    pub async fn remove_list(&self, app_id: &str, user: &str, list: &str) -> Result<(), ServiceError> {
        self.request(|reply| Command::RemoveList {
            app_id: app_id.to_string(),
            user: user.to_string(),
            list: list.to_string(),
            reply,
        })
        .await
    }

    pub async fn synced_lists(&self) -> Result<BTreeMap<String, BTreeSet<String>>, ServiceError> {
        self.request(|reply| Command::GetSyncedLists { reply }).await
    }

    pub async fn set_synced_lists(
        &self,
        selection: BTreeMap<String, BTreeSet<String>>,
    ) -> Result<(), ServiceError> {
        self.request(|reply| Command::SetSyncedLists { selection, reply })
            .await
    }

    pub async fn set_refresh_interval(&self, minutes: u32) -> Result<(), ServiceError> {
        self.request(|reply| Command::SetRefreshInterval { minutes, reply })
            .await
    }

    pub async fn refresh(&self) -> Result<(), ServiceError> {
        self.request(|reply| Command::Refresh { reply }).await
    }

    pub async fn version(&self) -> Result<String, ServiceError> {
        self.request(|reply| Command::GetVersion { reply }).await
    }

    /// Signed-in accounts as user id to e-mail.
    pub async fn accounts(&self) -> Result<BTreeMap<String, String>, ServiceError> {
        self.request(|reply| Command::Accounts { reply }).await
    }

    /// Start signing in an account. Watch for `SignedIn` or `LoginFailed`.
    pub async fn login(&self) -> Result<(), ServiceError> {
        self.request(|reply| Command::Login { reply }).await
    }

    pub async fn logout(&self, user: &str) -> Result<(), ServiceError> {
        self.request(|reply| Command::Logout {
            user: user.to_string(),
            reply,
        })
        .await
    }

    pub async fn quit(&self) -> Result<(), ServiceError> {
        self.request(|reply| Command::Quit { reply }).await
    }
}
