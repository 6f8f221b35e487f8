//! Synchronization client.
//!
//! A single supervisor task owns the local [`ClipboardList`]. It performs
//! the initial fetch, keeps the change-stream subscription alive and is
//! the only place the list is mutated. Handles talk to it over a command
//! channel and observe the list through `watch` snapshots.

use std::{collections::HashMap, sync::Arc, time::Duration};

use clipsync_core::{ChangeEvent, ClipboardItem, DeviceId, ItemId, Operation};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::{
    sync::{mpsc, oneshot, watch},
    task::JoinHandle,
};
use tracing::{debug, info, warn};

use crate::{
    list::{ClipboardList, InsertOrder},
    service::{ChangeStream, ClipboardService, TransportError},
};

const GENERIC_FAILURE_MESSAGE: &str = "Network error or server error";

/// Pacing for fetch and subscribe retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// `None` retries forever.
    pub max_attempts: Option<u32>,
    pub jitter: bool,
}

impl ReconnectPolicy {
    /// Retry at once, forever.
    pub fn immediate() -> Self {
        Self {
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            max_attempts: None,
            jitter: false,
        }
    }

    /// Delay before retry number `attempt` (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        let delay = self
            .base_delay
            .saturating_mul(1_u32 << exponent)
            .min(self.max_delay);
        if !self.jitter || delay.is_zero() {
            return delay;
        }
        let spread = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX) / 2;
        let extra = Duration::from_millis(rand::random_range(0..=spread));
        delay.saturating_add(extra).min(self.max_delay)
    }

    fn exhausted(&self, attempts: u32) -> bool {
        self.max_attempts.is_some_and(|max| attempts >= max)
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(30),
            max_attempts: None,
            jitter: true,
        }
    }
}

/// What happens to an optimistically removed item when the server delete fails.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum,
)]
#[serde(rename_all = "snake_case")]
pub enum DeletePolicy {
    /// Leave the list diverged until the next full fetch.
    KeepOptimistic,
    /// Put the item back after a transport failure. A server refusal means
    /// the id is already gone there, so the removal stands.
    #[default]
    Rollback,
    /// Re-fetch the whole list.
    Refetch,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncOptions {
    pub insert_order: InsertOrder,
    pub notify_remote_changes: bool,
    /// Tag writes with the local device id. Untagged writes carry an empty id.
    pub tag_writes: bool,
    pub delete_policy: DeletePolicy,
    /// Re-fetch after each successful resubscribe to recover missed events.
    pub resync_on_reconnect: bool,
    pub reconnect: ReconnectPolicy,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            insert_order: InsertOrder::Prepend,
            notify_remote_changes: true,
            tag_writes: true,
            delete_policy: DeletePolicy::Rollback,
            resync_on_reconnect: false,
            reconnect: ReconnectPolicy::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionState {
    /// Initial fetch not yet applied.
    Fetching,
    /// Fetch applied, first subscription not yet open.
    Connecting,
    Active,
    Failed,
    Resubscribing,
    /// Supervisor exited; no further updates.
    Stopped,
}

/// A change authored by another device, for user-facing notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteChange {
    pub operation: Operation,
    pub title: String,
    pub message: String,
    pub origin_device_id: DeviceId,
}

impl RemoteChange {
    fn new(operation: Operation, item: &ClipboardItem) -> Self {
        let title = match operation {
            Operation::Create => "New clipboard added",
            Operation::Update => "New clipboard updated",
            Operation::Delete => "New clipboard deleted",
        };
        Self {
            operation,
            title: title.to_owned(),
            message: item.content.clone(),
            origin_device_id: item.origin_device_id.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateOutcome {
    Updated,
    /// New content equals current content; nothing was sent.
    Unchanged,
}

#[derive(Debug, Error)]
pub enum WriteError {
    #[error("input is empty")]
    EmptyInput,
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("server rejected request: {0}")]
    Rejected(String),
    #[error("sync client is shut down")]
    Closed,
}

impl WriteError {
    /// Short text for the user. Transport and server failures look the same.
    pub fn user_message(&self) -> &'static str {
        match self {
            WriteError::EmptyInput => "Input is empty!",
            WriteError::Closed => "Clipboard sync is not running",
            WriteError::Transport(_) | WriteError::Rejected(_) => GENERIC_FAILURE_MESSAGE,
        }
    }
}

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("{stage} gave up after {attempts} attempts: {last_error}")]
    RetriesExhausted {
        stage: &'static str,
        attempts: u32,
        last_error: String,
    },
    #[error("sync client is shut down")]
    Closed,
}

#[derive(Debug)]
enum Command {
    RemoveOptimistic {
        id: ItemId,
        reply: oneshot::Sender<Option<(usize, ClipboardItem)>>,
    },
    /// Ends the bookkeeping for one optimistic delete, putting the item
    /// back if `restore` is set and no `delete` event confirmed it.
    SettleDelete {
        id: ItemId,
        restore: Option<(usize, ClipboardItem)>,
    },
    Refetch,
    Shutdown,
}

pub struct SyncClient {
    service: Arc<dyn ClipboardService>,
    device_id: DeviceId,
    options: SyncOptions,
    commands: mpsc::UnboundedSender<Command>,
    items: watch::Receiver<Vec<ClipboardItem>>,
    state: watch::Receiver<SubscriptionState>,
    notifications: Option<mpsc::UnboundedReceiver<RemoteChange>>,
    task: Option<JoinHandle<Result<(), SyncError>>>,
}

impl SyncClient {
    /// Starts the supervisor: initial fetch, then a lasting subscription.
    ///
    /// Must be called inside a tokio runtime.
    pub fn initialize(
        service: Arc<dyn ClipboardService>,
        device_id: impl Into<DeviceId>,
        options: SyncOptions,
    ) -> Self {
        let device_id = device_id.into();
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (items_tx, items_rx) = watch::channel(Vec::new());
        let (state_tx, state_rx) = watch::channel(SubscriptionState::Fetching);
        let (notify_tx, notify_rx) = mpsc::unbounded_channel();

        let supervisor = Supervisor {
            service: Arc::clone(&service),
            device_id: device_id.clone(),
            options,
            list: ClipboardList::new(options.insert_order),
            items_tx,
            state_tx,
            notify_tx,
            commands: command_rx,
            pending_deletes: HashMap::new(),
        };
        let task = tokio::spawn(supervisor.run());

        Self {
            service,
            device_id,
            options,
            commands: command_tx,
            items: items_rx,
            state: state_rx,
            notifications: Some(notify_rx),
            task: Some(task),
        }
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    pub fn items(&self) -> Vec<ClipboardItem> {
        self.items.borrow().clone()
    }

    pub fn watch_items(&self) -> watch::Receiver<Vec<ClipboardItem>> {
        self.items.clone()
    }

    pub fn state(&self) -> SubscriptionState {
        *self.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<SubscriptionState> {
        self.state.clone()
    }

    /// Remote-change notifications. Can be taken once.
    pub fn take_notifications(&mut self) -> Option<mpsc::UnboundedReceiver<RemoteChange>> {
        self.notifications.take()
    }

    /// Waits until the initial fetch has been applied.
    pub async fn wait_until_synced(&self) -> Result<(), SyncError> {
        let mut state = self.state.clone();
        let reached = state
            .wait_for(|state| *state != SubscriptionState::Fetching)
            .await
            .map(|state| *state)
            .map_err(|_| SyncError::Closed)?;
        if reached == SubscriptionState::Stopped {
            return Err(SyncError::Closed);
        }
        Ok(())
    }

    /// Sends new content to the service.
    ///
    /// The local list is not touched; the item shows up when its `create`
    /// event comes back over the subscription.
    pub async fn create_item(&self, content: &str) -> Result<Vec<ItemId>, WriteError> {
        if content.is_empty() {
            return Err(WriteError::EmptyInput);
        }
        let ids = self
            .service
            .create(vec![content.to_owned()], self.write_device_id())
            .await
            .inspect_err(|err| warn!("create failed: {}", err))?;
        if ids.is_empty() {
            warn!("create returned no ids");
            return Err(WriteError::Rejected("no ids returned for create".to_owned()));
        }
        info!(ids = ?ids, "clipboard item created");
        Ok(ids)
    }

    /// Replaces an item's content on the service.
    ///
    /// Identical content is short-circuited locally. As with create, the
    /// list only changes when the `update` event arrives.
    pub async fn update_item(
        &self,
        id: &str,
        new_content: &str,
    ) -> Result<UpdateOutcome, WriteError> {
        if new_content.is_empty() {
            return Err(WriteError::EmptyInput);
        }
        let unchanged = self
            .items
            .borrow()
            .iter()
            .any(|item| item.id == id && item.content == new_content);
        if unchanged {
            debug!(id, "update skipped, content unchanged");
            return Ok(UpdateOutcome::Unchanged);
        }

        let success = self
            .service
            .update(id, new_content, self.write_device_id())
            .await
            .inspect_err(|err| warn!(id, "update failed: {}", err))?;
        if !success {
            warn!(id, "update refused by server");
            return Err(WriteError::Rejected(format!("update of {id} refused")));
        }
        info!(id, "clipboard item updated");
        Ok(UpdateOutcome::Updated)
    }

    /// Removes an item locally at once, then asks the service to delete it.
    ///
    /// On failure the configured [`DeletePolicy`] decides what happens to
    /// the local list.
    pub async fn delete_item(&self, id: &str) -> Result<(), WriteError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.commands
            .send(Command::RemoveOptimistic {
                id: id.to_owned(),
                reply: reply_tx,
            })
            .map_err(|_| WriteError::Closed)?;
        let removed = reply_rx.await.map_err(|_| WriteError::Closed)?;

        let result = match self
            .service
            .delete(vec![id.to_owned()], self.write_device_id())
            .await
        {
            Ok(true) => Ok(()),
            Ok(false) => Err(WriteError::Rejected(format!("delete of {id} refused"))),
            Err(err) => Err(WriteError::Transport(err)),
        };

        match &result {
            Ok(()) => {
                info!(id, "clipboard item deleted");
                self.settle_delete(id, None);
            }
            Err(err) => {
                warn!(id, policy = ?self.options.delete_policy, "delete failed: {}", err);
                self.reconcile_failed_delete(id, err, removed);
            }
        }
        result
    }

    /// Stops the supervisor and waits for it to exit.
    pub async fn shutdown(mut self) -> Result<(), SyncError> {
        let _ = self.commands.send(Command::Shutdown);
        self.stopped().await
    }

    /// Waits for the supervisor to exit on its own, e.g. after retries run out.
    pub async fn stopped(&mut self) -> Result<(), SyncError> {
        match self.task.take() {
            Some(task) => task.await.map_err(|_| SyncError::Closed)?,
            None => Err(SyncError::Closed),
        }
    }

    fn write_device_id(&self) -> &str {
        if self.options.tag_writes {
            &self.device_id
        } else {
            ""
        }
    }

    fn reconcile_failed_delete(
        &self,
        id: &str,
        err: &WriteError,
        removed: Option<(usize, ClipboardItem)>,
    ) {
        match self.options.delete_policy {
            DeletePolicy::KeepOptimistic => self.settle_delete(id, None),
            DeletePolicy::Rollback => {
                let restore = removed.filter(|_| matches!(err, WriteError::Transport(_)));
                self.settle_delete(id, restore);
            }
            DeletePolicy::Refetch => {
                self.settle_delete(id, None);
                let _ = self.commands.send(Command::Refetch);
            }
        }
    }

    fn settle_delete(&self, id: &str, restore: Option<(usize, ClipboardItem)>) {
        let _ = self.commands.send(Command::SettleDelete {
            id: id.to_owned(),
            restore,
        });
    }
}

enum Flow {
    Continue,
    Stop,
}

enum PumpExit {
    Shutdown,
    Failed(String),
}

struct Supervisor {
    service: Arc<dyn ClipboardService>,
    device_id: DeviceId,
    options: SyncOptions,
    list: ClipboardList,
    items_tx: watch::Sender<Vec<ClipboardItem>>,
    state_tx: watch::Sender<SubscriptionState>,
    notify_tx: mpsc::UnboundedSender<RemoteChange>,
    commands: mpsc::UnboundedReceiver<Command>,
    /// Ids removed optimistically whose delete call has not settled.
    /// `true` once a `delete` event for the id has been seen.
    pending_deletes: HashMap<ItemId, bool>,
}

impl Supervisor {
    async fn run(mut self) -> Result<(), SyncError> {
        let result = self.supervise().await;
        match &result {
            Ok(()) => info!("sync supervisor stopped"),
            Err(err) => warn!("sync supervisor stopped: {}", err),
        }
        self.set_state(SubscriptionState::Stopped);
        result
    }

    async fn supervise(&mut self) -> Result<(), SyncError> {
        if !self.initial_fetch().await? {
            return Ok(());
        }
        self.set_state(SubscriptionState::Connecting);

        let policy = self.options.reconnect;
        let mut attempts: u32 = 0;
        loop {
            let resubscribing = *self.state_tx.borrow() == SubscriptionState::Resubscribing;
            let failure = match self.service.subscribe().await {
                Ok(stream) => {
                    attempts = 0;
                    info!(resubscribing, "subscription active");
                    self.set_state(SubscriptionState::Active);
                    if resubscribing && self.options.resync_on_reconnect {
                        self.refetch().await;
                    }
                    match self.pump(stream).await {
                        PumpExit::Shutdown => return Ok(()),
                        PumpExit::Failed(reason) => reason,
                    }
                }
                Err(err) => err.to_string(),
            };

            attempts += 1;
            warn!(attempts, "subscription failed: {}", failure);
            self.set_state(SubscriptionState::Failed);
            if policy.exhausted(attempts) {
                return Err(SyncError::RetriesExhausted {
                    stage: "subscribe",
                    attempts,
                    last_error: failure,
                });
            }
            self.set_state(SubscriptionState::Resubscribing);
            if !self.idle(policy.delay_for(attempts)).await {
                return Ok(());
            }
        }
    }

    /// Returns `false` if shutdown was requested while retrying.
    async fn initial_fetch(&mut self) -> Result<bool, SyncError> {
        let policy = self.options.reconnect;
        let mut attempts: u32 = 0;
        loop {
            attempts += 1;
            match self.service.fetch_all().await {
                Ok(items) => {
                    info!(count = items.len(), attempts, "initial fetch applied");
                    self.list.replace_all(items);
                    self.publish_items();
                    return Ok(true);
                }
                Err(err) => {
                    warn!(attempts, "fetch failed: {}", err);
                    if policy.exhausted(attempts) {
                        return Err(SyncError::RetriesExhausted {
                            stage: "fetch",
                            attempts,
                            last_error: err.to_string(),
                        });
                    }
                    if !self.idle(policy.delay_for(attempts)).await {
                        return Ok(false);
                    }
                }
            }
        }
    }

    async fn refetch(&mut self) {
        match self.service.fetch_all().await {
            Ok(items) => {
                info!(count = items.len(), "list re-fetched");
                self.list.replace_all(items);
                self.publish_items();
            }
            Err(err) => warn!("re-fetch failed: {}", err),
        }
    }

    async fn pump(&mut self, mut stream: ChangeStream) -> PumpExit {
        loop {
            tokio::select! {
                command = self.commands.recv() => {
                    let Some(command) = command else {
                        return PumpExit::Shutdown;
                    };
                    if let Flow::Stop = self.handle_command(command).await {
                        return PumpExit::Shutdown;
                    }
                }
                next = stream.next() => match next {
                    Some(Ok(event)) => self.apply_event(event),
                    Some(Err(err)) => return PumpExit::Failed(err.to_string()),
                    None => return PumpExit::Failed("change stream ended".to_owned()),
                },
            }
        }
    }

    /// Waits out a retry delay while still serving commands.
    ///
    /// Returns `false` if shutdown was requested.
    async fn idle(&mut self, delay: Duration) -> bool {
        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);
        loop {
            tokio::select! {
                _ = &mut sleep => return true,
                command = self.commands.recv() => {
                    let Some(command) = command else {
                        return false;
                    };
                    if let Flow::Stop = self.handle_command(command).await {
                        return false;
                    }
                }
            }
        }
    }

    async fn handle_command(&mut self, command: Command) -> Flow {
        match command {
            Command::RemoveOptimistic { id, reply } => {
                let removed = self.list.remove(&id);
                if removed.is_some() {
                    self.publish_items();
                }
                self.pending_deletes.insert(id, false);
                let _ = reply.send(removed);
            }
            Command::SettleDelete { id, restore } => {
                let confirmed = self.pending_deletes.remove(&id).unwrap_or(false);
                match restore {
                    Some(_) if confirmed => {
                        debug!(id = %id, "delete confirmed by server event, not restoring");
                    }
                    Some((index, item)) => {
                        if self.list.restore(index, item) {
                            info!(id = %id, "restored item after failed delete");
                            self.publish_items();
                        }
                    }
                    None => {}
                }
            }
            Command::Refetch => self.refetch().await,
            Command::Shutdown => return Flow::Stop,
        }
        Flow::Continue
    }

    fn apply_event(&mut self, event: ChangeEvent) {
        if event.operation == Operation::Delete {
            for item in &event.items {
                if let Some(confirmed) = self.pending_deletes.get_mut(&item.id) {
                    *confirmed = true;
                }
            }
        }
        let changed = self.list.apply(&event);
        debug!(
            operation = %event.operation,
            items = event.items.len(),
            changed,
            "change event applied"
        );
        if changed {
            self.publish_items();
        }

        if !self.options.notify_remote_changes {
            return;
        }
        if let Some(item) = event.first_remote_item(&self.device_id) {
            let _ = self.notify_tx.send(RemoteChange::new(event.operation, item));
        }
    }

    fn publish_items(&self) {
        self.items_tx.send_replace(self.list.items().to_vec());
    }

    fn set_state(&self, state: SubscriptionState) {
        self.state_tx.send_replace(state);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_and_caps() {
        let policy = ReconnectPolicy {
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(500),
            max_attempts: None,
            jitter: false,
        };
        assert_eq!(policy.delay_for(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for(3), Duration::from_millis(400));
        assert_eq!(policy.delay_for(4), Duration::from_millis(500));
        assert_eq!(policy.delay_for(u32::MAX), Duration::from_millis(500));
    }

    #[test]
    fn jitter_stays_within_cap() {
        let policy = ReconnectPolicy {
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(150),
            max_attempts: None,
            jitter: true,
        };
        for attempt in 1..10 {
            let delay = policy.delay_for(attempt);
            assert!(delay >= Duration::from_millis(100) && delay <= Duration::from_millis(150));
        }
    }

    #[test]
    fn jitter_saturates_at_huge_delays() {
        let policy = ReconnectPolicy {
            base_delay: Duration::MAX,
            max_delay: Duration::MAX,
            max_attempts: None,
            jitter: true,
        };
        assert_eq!(policy.delay_for(3), Duration::MAX);
    }

    #[test]
    fn immediate_policy_never_waits_or_gives_up() {
        let policy = ReconnectPolicy::immediate();
        assert_eq!(policy.delay_for(7), Duration::ZERO);
        assert!(!policy.exhausted(u32::MAX));
    }

    #[test]
    fn attempt_limit_is_inclusive() {
        let policy = ReconnectPolicy {
            max_attempts: Some(3),
            ..ReconnectPolicy::immediate()
        };
        assert!(!policy.exhausted(2));
        assert!(policy.exhausted(3));
    }

    #[test]
    fn remote_change_titles_follow_operation() {
        let item = ClipboardItem::new("1", "hello", "other");
        let change = RemoteChange::new(Operation::Delete, &item);
        assert_eq!(change.title, "New clipboard deleted");
        assert_eq!(change.message, "hello");
    }

    #[test]
    fn user_message_hides_failure_kind() {
        let transport = WriteError::Transport(TransportError::Closed);
        let rejected = WriteError::Rejected("no".to_owned());
        assert_eq!(transport.user_message(), rejected.user_message());
        assert_eq!(WriteError::EmptyInput.user_message(), "Input is empty!");
    }
}
