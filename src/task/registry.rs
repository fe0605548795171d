//! Update/download task registry.
//!
//! One tokio task owns the [`TaskManager`]; [`TaskRegistry`] handles talk to
//! it over a command channel and wait on oneshot replies. Worker events
//! arrive on a second channel into the same loop, so listener callbacks
//! and state changes never race.
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, oneshot};

use super::background::{
    BackgroundTask, Job, TaskListener, TaskProgress, TaskState, WorkerEvent,
};
use super::locks::LockManager;
use super::manager::{BindingId, OwnerKey, TaskError, TaskManager, TaskOutcome};
use crate::error::ErrorCode;

const QUEUE_CHANNEL_CAPACITY: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    Update,
    Download,
}

impl Action {
    pub fn as_str(self) -> &'static str {
        match self {
            Action::Update => "update",
            Action::Download => "download",
        }
    }
}

/// Registry key: a channel id for updates, an item id for downloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct TaskKey {
    pub id: i64,
    pub action: Action,
}

impl TaskKey {
    pub fn update(channel_id: i64) -> Self {
        Self {
            id: channel_id,
            action: Action::Update,
        }
    }

    pub fn download(item_id: i64) -> Self {
        Self {
            id: item_id,
            action: Action::Download,
        }
    }

    /// Task id used by the manager, e.g. `update/42`.
    pub fn task_id(&self) -> String {
        format!("{}/{}", self.action.as_str(), self.id)
    }

    pub fn parse(task_id: &str) -> Option<Self> {
        let (action, id) = task_id.split_once('/')?;
        let action = match action {
            "update" => Action::Update,
            "download" => Action::Download,
            _ => return None,
        };
        Some(Self {
            id: id.parse().ok()?,
            action,
        })
    }
}

impl fmt::Display for TaskKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.action.as_str(), self.id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueChange {
    Enqueued,
    Dequeued,
}

/// Emitted whenever the number of outstanding tasks of one action changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct QueueEvent {
    pub action: Action,
    pub change: QueueChange,
    pub outstanding: usize,
}

enum Command {
    State {
        key: TaskKey,
        reply: oneshot::Sender<TaskState>,
    },
    Register {
        key: TaskKey,
        job: Arc<dyn Job>,
        reply: oneshot::Sender<Result<(), TaskError>>,
    },
    Unregister {
        key: TaskKey,
        reply: oneshot::Sender<bool>,
    },
    Start {
        key: TaskKey,
        reply: oneshot::Sender<bool>,
    },
    Bind {
        key: TaskKey,
        owner: OwnerKey,
        listener: Arc<dyn TaskListener>,
        priority: bool,
        reply: oneshot::Sender<Option<BindingId>>,
    },
    Launch {
        key: TaskKey,
        job: Arc<dyn Job>,
        owner: OwnerKey,
        listener: Arc<dyn TaskListener>,
        priority: bool,
        reply: oneshot::Sender<Option<BindingId>>,
    },
    Unbind {
        owner: OwnerKey,
        reply: oneshot::Sender<usize>,
    },
    UnbindBinding {
        binding: BindingId,
    },
    Cancel {
        key: TaskKey,
        reply: oneshot::Sender<bool>,
    },
    CancelAll {
        reply: oneshot::Sender<()>,
    },
    ConsumeResult {
        key: TaskKey,
        reply: oneshot::Sender<Option<ErrorCode>>,
    },
    ActiveIds {
        action: Action,
        reply: oneshot::Sender<Vec<i64>>,
    },
}

struct RegistryActor {
    manager: TaskManager,
    queue: broadcast::Sender<QueueEvent>,
}

impl RegistryActor {
    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut events: mpsc::UnboundedReceiver<WorkerEvent>,
    ) {
        loop {
            tokio::select! {
                Some(event) = events.recv() => self.on_worker_event(event),
                command = commands.recv() => match command {
                    Some(command) => self.on_command(command),
                    None => break,
                },
            }
        }
        tracing::debug!("Task registry stopped");
    }

    fn on_command(&mut self, command: Command) {
        // A dropped reply receiver means the caller stopped waiting.
        match command {
            Command::State { key, reply } => {
                let _ = reply.send(self.manager.state(&key.task_id()));
            }
            Command::Register { key, job, reply } => {
                let before = self.outstanding(key.action);
                let result = self
                    .manager
                    .register(key.task_id(), BackgroundTask::new(job));
                self.publish_if_changed(key.action, before);
                let _ = reply.send(result);
            }
            Command::Unregister { key, reply } => {
                let before = self.outstanding(key.action);
                let removed = self.manager.unregister(&key.task_id());
                self.publish_if_changed(key.action, before);
                let _ = reply.send(removed);
            }
            Command::Start { key, reply } => {
                let _ = reply.send(self.manager.start(&key.task_id()));
            }
            Command::Bind {
                key,
                owner,
                listener,
                priority,
                reply,
            } => {
                let binding = self
                    .manager
                    .bind(&key.task_id(), owner, listener, priority);
                let _ = reply.send(binding);
            }
            Command::Launch {
                key,
                job,
                owner,
                listener,
                priority,
                reply,
            } => {
                let _ = reply.send(self.launch(key, job, owner, listener, priority));
            }
            Command::Unbind { owner, reply } => {
                let _ = reply.send(self.manager.unbind(&owner));
            }
            Command::UnbindBinding { binding } => {
                self.manager.unbind_binding(binding);
            }
            Command::Cancel { key, reply } => {
                let _ = reply.send(self.manager.cancel(&key.task_id()));
            }
            Command::CancelAll { reply } => {
                let before = [Action::Update, Action::Download].map(|a| (a, self.outstanding(a)));
                let dropped = self.manager.cancel_all();
                if dropped > 0 {
                    tracing::debug!(dropped, "Unstarted tasks unregistered");
                }
                for (action, before) in before {
                    self.publish_if_changed(action, before);
                }
                let _ = reply.send(());
            }
            Command::ConsumeResult { key, reply } => {
                let _ = reply.send(self.manager.consume_result(&key.task_id()));
            }
            Command::ActiveIds { action, reply } => {
                let _ = reply.send(self.active_ids(action));
            }
        }
    }

    /// Replaces a finished entry under `key` with `job`, binds `listener`
    /// and starts it. Leaves an active entry alone and returns `None`.
    fn launch(
        &mut self,
        key: TaskKey,
        job: Arc<dyn Job>,
        owner: OwnerKey,
        listener: Arc<dyn TaskListener>,
        priority: bool,
    ) -> Option<BindingId> {
        let id = key.task_id();
        let state = self.manager.state(&id);
        if state.is_active() {
            tracing::debug!(task = %key, ?state, "Task already active, not launching");
            return None;
        }

        let before = self.outstanding(key.action);
        // Clears a failed run nobody consumed.
        self.manager.unregister(&id);
        if let Err(e) = self.manager.register(id.clone(), BackgroundTask::new(job)) {
            tracing::error!(task = %key, error = %e, "Launch failed to register");
            return None;
        }
        let binding = self.manager.bind(&id, owner, listener, priority);
        self.manager.start(&id);
        self.publish_if_changed(key.action, before);
        binding
    }

    fn on_worker_event(&mut self, event: WorkerEvent) {
        let key = TaskKey::parse(&event.task_id);
        let before = key.map(|k| self.outstanding(k.action));
        let outcome = self.manager.handle_event(event);
        if let (Some(key), Some(before), Some(outcome)) = (key, before, outcome) {
            if let TaskOutcome::Failed(code) = outcome {
                tracing::debug!(task = %key, error = %code, "Task awaiting result consumption");
            }
            self.publish_if_changed(key.action, before);
        }
    }

    fn active_ids(&self, action: Action) -> Vec<i64> {
        let mut ids: Vec<i64> = self
            .manager
            .ids()
            .filter(|id| self.manager.state(id).is_active())
            .filter_map(TaskKey::parse)
            .filter(|k| k.action == action)
            .map(|k| k.id)
            .collect();
        ids.sort_unstable();
        ids
    }

    fn outstanding(&self, action: Action) -> usize {
        self.active_ids(action).len()
    }

    fn publish_if_changed(&self, action: Action, before: usize) {
        let outstanding = self.outstanding(action);
        let change = if outstanding > before {
            QueueChange::Enqueued
        } else if outstanding < before {
            QueueChange::Dequeued
        } else {
            return;
        };
        // No subscribers is fine.
        let _ = self.queue.send(QueueEvent {
            action,
            change,
            outstanding,
        });
    }
}

/// Cloneable handle to the registry actor.
#[derive(Clone)]
pub struct TaskRegistry {
    commands: mpsc::UnboundedSender<Command>,
    queue: broadcast::Sender<QueueEvent>,
}

impl TaskRegistry {
    /// Spawns the actor on the current tokio runtime. It stops once every
    /// handle (subscriptions included) is dropped.
    pub fn spawn(locks: Arc<LockManager>) -> Self {
        let (commands, command_rx) = mpsc::unbounded_channel();
        let (events, event_rx) = mpsc::unbounded_channel();
        let (queue, _) = broadcast::channel(QUEUE_CHANNEL_CAPACITY);
        let actor = RegistryActor {
            manager: TaskManager::new(locks, events),
            queue: queue.clone(),
        };
        tokio::spawn(actor.run(command_rx, event_rx));
        Self { commands, queue }
    }

    async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> Result<T, TaskError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(make(reply))
            .map_err(|_| TaskError::RegistryClosed)?;
        rx.await.map_err(|_| TaskError::RegistryClosed)
    }

    pub async fn state(&self, key: TaskKey) -> Result<TaskState, TaskError> {
        self.request(|reply| Command::State { key, reply }).await
    }

    /// Registers `job` under `key`.
    ///
    /// # Errors
    ///
    /// `TaskError::AlreadyRegistered` if anything, finished or not, is still
    /// registered under `key`. Unregister first.
    pub async fn register(&self, key: TaskKey, job: Arc<dyn Job>) -> Result<(), TaskError> {
        self.request(|reply| Command::Register { key, job, reply })
            .await?
    }

    pub async fn unregister(&self, key: TaskKey) -> Result<bool, TaskError> {
        self.request(|reply| Command::Unregister { key, reply })
            .await
    }

    pub async fn start(&self, key: TaskKey) -> Result<bool, TaskError> {
        self.request(|reply| Command::Start { key, reply }).await
    }

    /// Binds `listener` to the task under `key`.
    ///
    /// Returns `None` when nothing is registered, which is expected if the
    /// task finished between a state check and this call. The listener
    /// stays bound until the returned [`Subscription`] drops, `owner` is
    /// unbound, or the task ends.
    pub async fn bind(
        &self,
        key: TaskKey,
        owner: OwnerKey,
        listener: Arc<dyn TaskListener>,
        priority: bool,
    ) -> Result<Option<Subscription>, TaskError> {
        let binding = self
            .request(|reply| Command::Bind {
                key,
                owner,
                listener,
                priority,
                reply,
            })
            .await?;
        Ok(binding.map(|binding| Subscription {
            binding: Some(binding),
            commands: self.commands.clone(),
        }))
    }

    /// Registers, binds and starts `job` under `key` in one step, so no other
    /// caller can slip in between the state check and the start.
    ///
    /// Returns `None` without touching anything when a READY, RUNNING or
    /// CANCELING task is already registered under `key`. A FAILED entry is
    /// discarded together with its unconsumed result.
    pub async fn launch(
        &self,
        key: TaskKey,
        job: Arc<dyn Job>,
        owner: OwnerKey,
        listener: Arc<dyn TaskListener>,
        priority: bool,
    ) -> Result<Option<Subscription>, TaskError> {
        let binding = self
            .request(|reply| Command::Launch {
                key,
                job,
                owner,
                listener,
                priority,
                reply,
            })
            .await?;
        Ok(binding.map(|binding| Subscription {
            binding: Some(binding),
            commands: self.commands.clone(),
        }))
    }

    /// Detaches every listener bound by `owner`.
    pub async fn unbind(&self, owner: OwnerKey) -> Result<usize, TaskError> {
        self.request(|reply| Command::Unbind { owner, reply }).await
    }

    pub async fn cancel(&self, key: TaskKey) -> Result<bool, TaskError> {
        self.request(|reply| Command::Cancel { key, reply }).await
    }

    pub async fn cancel_all(&self) -> Result<(), TaskError> {
        self.request(|reply| Command::CancelAll { reply }).await
    }

    pub async fn consume_result(&self, key: TaskKey) -> Result<Option<ErrorCode>, TaskError> {
        self.request(|reply| Command::ConsumeResult { key, reply })
            .await
    }

    /// Ids with a READY, RUNNING or CANCELING task for `action`.
    pub async fn active_ids(&self, action: Action) -> Result<Vec<i64>, TaskError> {
        self.request(|reply| Command::ActiveIds { action, reply })
            .await
    }

    pub fn subscribe_queue(&self) -> broadcast::Receiver<QueueEvent> {
        self.queue.subscribe()
    }
}

/// Scoped listener binding. Dropping it unbinds the listener.
#[must_use = "dropping a Subscription unbinds its listener"]
pub struct Subscription {
    binding: Option<BindingId>,
    commands: mpsc::UnboundedSender<Command>,
}

impl Subscription {
    /// Leaves the listener bound for the rest of the task's life.
    pub fn detach(mut self) {
        self.binding = None;
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(binding) = self.binding.take() {
            // The registry may already be gone; nothing left to unbind then.
            let _ = self.commands.send(Command::UnbindBinding { binding });
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NoticeKind {
    PreRun,
    Progress(TaskProgress),
    PostRun(Result<(), ErrorCode>),
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskNotice {
    pub key: TaskKey,
    pub kind: NoticeKind,
}

/// Listener that forwards callbacks into an mpsc channel.
pub struct ChannelListener {
    tx: mpsc::UnboundedSender<TaskNotice>,
}

impl ChannelListener {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<TaskNotice>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Arc::new(Self { tx }), rx)
    }

    fn forward(&self, task_id: &str, kind: NoticeKind) {
        if let Some(key) = TaskKey::parse(task_id) {
            let _ = self.tx.send(TaskNotice { key, kind });
        }
    }
}

impl TaskListener for ChannelListener {
    fn on_pre_run(&self, task_id: &str) {
        self.forward(task_id, NoticeKind::PreRun);
    }

    fn on_progress(&self, task_id: &str, progress: TaskProgress) {
        self.forward(task_id, NoticeKind::Progress(progress));
    }

    fn on_post_run(&self, task_id: &str, result: Result<(), ErrorCode>) {
        self.forward(task_id, NoticeKind::PostRun(result));
    }

    fn on_cancelled(&self, task_id: &str) {
        self.forward(task_id, NoticeKind::Cancelled);
    }
}
