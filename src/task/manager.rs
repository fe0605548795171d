//! Map from task id to [`BackgroundTask`] plus listener bindings.
//!
//! Not synchronized: the owner (the registry actor) is the only caller.
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;

use super::background::{
    BackgroundTask, TaskId, TaskListener, TaskState, WorkerEvent, WorkerEventKind,
};
use super::locks::LockManager;
use crate::error::ErrorCode;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TaskError {
    /// Registering over a live entry. The caller must unregister first.
    #[error("Task already registered: {0}")]
    AlreadyRegistered(TaskId),

    #[error("Task registry has shut down")]
    RegistryClosed,
}

/// Identifies whoever bound a listener, for mass unbinding.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct OwnerKey(String);

impl OwnerKey {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }
}

impl From<&str> for OwnerKey {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BindingId(u64);

struct Binding {
    id: BindingId,
    owner: OwnerKey,
    listener: Arc<dyn TaskListener>,
    priority: bool,
}

struct Entry {
    task: BackgroundTask,
    bindings: Vec<Binding>,
    error: Option<ErrorCode>,
}

impl Entry {
    /// Priority listeners first, bind order within each group.
    fn listeners(&self) -> Vec<Arc<dyn TaskListener>> {
        let first = self.bindings.iter().filter(|b| b.priority);
        let rest = self.bindings.iter().filter(|b| !b.priority);
        first.chain(rest).map(|b| Arc::clone(&b.listener)).collect()
    }
}

/// How a run ended, as reported by [`TaskManager::handle_event`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskOutcome {
    Succeeded,
    Failed(ErrorCode),
    Cancelled,
}

pub struct TaskManager {
    tasks: HashMap<TaskId, Entry>,
    locks: Arc<LockManager>,
    events: mpsc::UnboundedSender<WorkerEvent>,
    next_generation: u64,
    next_binding: u64,
}

impl TaskManager {
    pub(crate) fn new(locks: Arc<LockManager>, events: mpsc::UnboundedSender<WorkerEvent>) -> Self {
        Self {
            tasks: HashMap::new(),
            locks,
            events,
            next_generation: 1,
            next_binding: 1,
        }
    }

    pub fn state(&self, id: &str) -> TaskState {
        self.tasks
            .get(id)
            .map(|e| e.task.state())
            .unwrap_or(TaskState::Idle)
    }

    /// Ids of every registered task, finished-but-unconsumed ones included.
    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.tasks.keys().map(String::as_str)
    }

    pub fn register(&mut self, id: TaskId, task: BackgroundTask) -> Result<(), TaskError> {
        if self.tasks.contains_key(&id) {
            tracing::error!(task_id = %id, "Duplicate task registration");
            return Err(TaskError::AlreadyRegistered(id));
        }
        tracing::debug!(task_id = %id, "Task registered");
        self.tasks.insert(
            id,
            Entry {
                task,
                bindings: Vec::new(),
                error: None,
            },
        );
        Ok(())
    }

    /// Forgets the task. A running job keeps running; its events become
    /// stale and are dropped.
    pub fn unregister(&mut self, id: &str) -> bool {
        let removed = self.tasks.remove(id).is_some();
        if removed {
            tracing::debug!(task_id = %id, "Task unregistered");
        }
        removed
    }

    /// Attaches a listener. `None` if no task is registered under `id`.
    pub fn bind(
        &mut self,
        id: &str,
        owner: OwnerKey,
        listener: Arc<dyn TaskListener>,
        priority: bool,
    ) -> Option<BindingId> {
        let entry = self.tasks.get_mut(id)?;
        let binding = BindingId(self.next_binding);
        self.next_binding += 1;
        entry.bindings.push(Binding {
            id: binding,
            owner,
            listener,
            priority,
        });
        Some(binding)
    }

    /// Detaches every listener bound by `owner`. Returns how many.
    pub fn unbind(&mut self, owner: &OwnerKey) -> usize {
        let mut removed = 0;
        for entry in self.tasks.values_mut() {
            let before = entry.bindings.len();
            entry.bindings.retain(|b| &b.owner != owner);
            removed += before - entry.bindings.len();
        }
        removed
    }

    pub fn unbind_binding(&mut self, binding: BindingId) -> bool {
        for entry in self.tasks.values_mut() {
            if let Some(pos) = entry.bindings.iter().position(|b| b.id == binding) {
                entry.bindings.remove(pos);
                return true;
            }
        }
        false
    }

    pub fn start(&mut self, id: &str) -> bool {
        let Some(entry) = self.tasks.get_mut(id) else {
            return false;
        };
        let generation = self.next_generation;
        self.next_generation += 1;
        entry
            .task
            .start(id, generation, &self.locks, self.events.clone())
    }

    pub fn cancel(&mut self, id: &str) -> bool {
        match self.tasks.get_mut(id) {
            Some(entry) => entry.task.cancel(),
            None => false,
        }
    }

    /// Drops every listener, cancels every running task and unregisters
    /// tasks that were never started. Failed entries stay so their result
    /// can still be consumed. Returns how many entries were unregistered.
    pub fn cancel_all(&mut self) -> usize {
        let before = self.tasks.len();
        self.tasks.retain(|id, entry| {
            entry.bindings.clear();
            if entry.task.state() == TaskState::Ready {
                tracing::debug!(task_id = %id, "Unstarted task dropped at teardown");
                return false;
            }
            if entry.task.cancel() {
                tracing::debug!(task_id = %id, "Task cancelled at teardown");
            }
            true
        });
        before - self.tasks.len()
    }

    /// Takes the error of a failed task and removes it. `None` for tasks
    /// that are missing or not in `Failed`.
    pub fn consume_result(&mut self, id: &str) -> Option<ErrorCode> {
        if self.state(id) != TaskState::Failed {
            return None;
        }
        self.tasks.remove(id).and_then(|entry| entry.error)
    }

    /// Dispatches a worker event to the listeners. Returns the outcome for
    /// terminal events that belong to the current run.
    pub(crate) fn handle_event(&mut self, event: WorkerEvent) -> Option<TaskOutcome> {
        let id = event.task_id;
        let entry = self.tasks.get_mut(&id)?;
        if entry.task.generation() != Some(event.generation) {
            tracing::debug!(task_id = %id, generation = event.generation, "Dropping stale worker event");
            return None;
        }

        match event.kind {
            WorkerEventKind::PreRun => {
                for listener in entry.listeners() {
                    listener.on_pre_run(&id);
                }
                None
            }
            WorkerEventKind::Progress(progress) => {
                for listener in entry.listeners() {
                    listener.on_progress(&id, progress);
                }
                None
            }
            WorkerEventKind::Finished(result) => {
                entry.task.finished();
                let listeners = entry.listeners();
                let canceling = entry.task.state() == TaskState::Canceling;
                match result {
                    Ok(()) => {
                        self.tasks.remove(&id);
                        for listener in listeners {
                            listener.on_post_run(&id, Ok(()));
                        }
                        tracing::debug!(task_id = %id, "Task finished");
                        Some(TaskOutcome::Succeeded)
                    }
                    Err(code) if code.is_cancellation() || canceling => {
                        self.tasks.remove(&id);
                        for listener in listeners {
                            listener.on_cancelled(&id);
                        }
                        tracing::debug!(task_id = %id, "Task cancelled");
                        Some(TaskOutcome::Cancelled)
                    }
                    Err(code) => {
                        entry.task.set_state(TaskState::Failed);
                        entry.error = Some(code);
                        for listener in listeners {
                            listener.on_post_run(&id, Err(code));
                        }
                        tracing::info!(task_id = %id, error = %code, "Task failed");
                        Some(TaskOutcome::Failed(code))
                    }
                }
            }
        }
    }
}
