//! A single cancellable unit of background work.
//!
//! A [`BackgroundTask`] wraps a [`Job`] and runs it on the tokio runtime.
//! The worker never touches listener state: it only reports
//! [`WorkerEvent`]s into the owner's mailbox, and the owner dispatches them
//! to the bound [`TaskListener`]s.
use async_trait::async_trait;
use futures::FutureExt;
use serde::Serialize;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::locks::{LockKinds, LockManager};
use crate::error::ErrorCode;

pub type TaskId = String;

/// Lifecycle state of a registered task as seen by callers.
///
/// `Idle` means nothing is registered under the id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Idle,
    Ready,
    Running,
    Canceling,
    Failed,
}

impl TaskState {
    /// Registered and not yet finished.
    pub fn is_active(self) -> bool {
        matches!(
            self,
            TaskState::Ready | TaskState::Running | TaskState::Canceling
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TaskProgress {
    pub current: u64,
    pub total: Option<u64>,
}

#[derive(Debug)]
pub(crate) enum WorkerEventKind {
    PreRun,
    Progress(TaskProgress),
    Finished(Result<(), ErrorCode>),
}

/// Message from a worker to the task owner.
///
/// `generation` identifies the run, so events from a task that was
/// unregistered and replaced under the same id are recognizably stale.
#[derive(Debug)]
pub(crate) struct WorkerEvent {
    pub task_id: TaskId,
    pub generation: u64,
    pub kind: WorkerEventKind,
}

/// Handle a running job uses to observe cancellation and report progress.
pub struct TaskContext {
    id: TaskId,
    generation: u64,
    cancel: CancellationToken,
    events: mpsc::UnboundedSender<WorkerEvent>,
}

impl TaskContext {
    pub(crate) fn new(
        id: TaskId,
        generation: u64,
        cancel: CancellationToken,
        events: mpsc::UnboundedSender<WorkerEvent>,
    ) -> Self {
        Self {
            id,
            generation,
            cancel,
            events,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Token to race network reads against.
    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// `Err(Interrupted)` once cancellation has been requested.
    pub fn check_cancelled(&self) -> Result<(), ErrorCode> {
        if self.cancel.is_cancelled() {
            Err(ErrorCode::Interrupted)
        } else {
            Ok(())
        }
    }

    pub fn report_progress(&self, current: u64, total: Option<u64>) {
        self.send(WorkerEventKind::Progress(TaskProgress { current, total }));
    }

    fn send(&self, kind: WorkerEventKind) {
        let event = WorkerEvent {
            task_id: self.id.clone(),
            generation: self.generation,
            kind,
        };
        if self.events.send(event).is_err() {
            tracing::debug!(task_id = %self.id, "Task owner gone, dropping worker event");
        }
    }
}

/// The work a task performs.
#[async_trait]
pub trait Job: Send + Sync + 'static {
    async fn run(&self, cx: &TaskContext) -> Result<(), ErrorCode>;

    /// Locks held for the whole run.
    fn locks(&self) -> LockKinds {
        LockKinds::NONE
    }
}

/// Callbacks for one task. All of them run on the task owner, in order.
pub trait TaskListener: Send + Sync {
    fn on_pre_run(&self, _task_id: &str) {}

    fn on_progress(&self, _task_id: &str, _progress: TaskProgress) {}

    /// Called on success and on failure. Cancellation goes to
    /// [`TaskListener::on_cancelled`] instead.
    fn on_post_run(&self, _task_id: &str, _result: Result<(), ErrorCode>) {}

    fn on_cancelled(&self, _task_id: &str) {}
}

pub struct BackgroundTask {
    job: Arc<dyn Job>,
    state: TaskState,
    cancel: CancellationToken,
    generation: Option<u64>,
    handle: Option<JoinHandle<()>>,
}

impl BackgroundTask {
    pub fn new(job: Arc<dyn Job>) -> Self {
        Self {
            job,
            state: TaskState::Ready,
            cancel: CancellationToken::new(),
            generation: None,
            handle: None,
        }
    }

    pub fn state(&self) -> TaskState {
        self.state
    }

    pub(crate) fn set_state(&mut self, state: TaskState) {
        self.state = state;
    }

    pub(crate) fn generation(&self) -> Option<u64> {
        self.generation
    }

    /// Spawns the job. Only legal from `Ready`; returns false otherwise.
    pub(crate) fn start(
        &mut self,
        id: &str,
        generation: u64,
        locks: &Arc<LockManager>,
        events: mpsc::UnboundedSender<WorkerEvent>,
    ) -> bool {
        if self.state != TaskState::Ready {
            tracing::warn!(task_id = %id, state = ?self.state, "Start requested outside Ready state");
            return false;
        }
        self.state = TaskState::Running;
        self.generation = Some(generation);

        let job = Arc::clone(&self.job);
        let locks = Arc::clone(locks);
        let cx = TaskContext::new(id.to_string(), generation, self.cancel.clone(), events);
        self.handle = Some(tokio::spawn(async move {
            let result = {
                let _guard = locks.acquire(job.locks());
                cx.send(WorkerEventKind::PreRun);
                match AssertUnwindSafe(job.run(&cx)).catch_unwind().await {
                    Ok(result) => result,
                    Err(panic) => {
                        tracing::error!(
                            task_id = %cx.id,
                            error = %panic_message(panic.as_ref()),
                            "Background task panicked"
                        );
                        Err(ErrorCode::Unknown)
                    }
                }
            };
            cx.send(WorkerEventKind::Finished(result));
        }));
        true
    }

    /// Requests cancellation of a running task. Returns whether a
    /// cancellation was initiated.
    pub(crate) fn cancel(&mut self) -> bool {
        if self.state != TaskState::Running {
            return false;
        }
        self.state = TaskState::Canceling;
        self.cancel.cancel();
        true
    }

    pub(crate) fn finished(&mut self) {
        self.handle = None;
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&'static str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Sleepy;

    #[async_trait]
    impl Job for Sleepy {
        async fn run(&self, cx: &TaskContext) -> Result<(), ErrorCode> {
            cx.cancel_token().cancelled().await;
            cx.check_cancelled()
        }

        fn locks(&self) -> LockKinds {
            LockKinds::ALL
        }
    }

    struct Exploding;

    #[async_trait]
    impl Job for Exploding {
        async fn run(&self, _cx: &TaskContext) -> Result<(), ErrorCode> {
            panic!("parser bug");
        }

        fn locks(&self) -> LockKinds {
            LockKinds::ALL
        }
    }

    async fn finished(rx: &mut mpsc::UnboundedReceiver<WorkerEvent>) -> Result<(), ErrorCode> {
        loop {
            match rx.recv().await.map(|e| e.kind) {
                Some(WorkerEventKind::Finished(result)) => return result,
                Some(_) => continue,
                None => panic!("worker vanished"),
            }
        }
    }

    #[tokio::test]
    async fn test_start_only_from_ready() {
        let locks = Arc::new(LockManager::logging());
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut task = BackgroundTask::new(Arc::new(Sleepy));

        assert!(task.start("t", 1, &locks, tx.clone()));
        assert!(!task.start("t", 2, &locks, tx));
        assert_eq!(task.state(), TaskState::Running);

        assert!(task.cancel());
        assert_eq!(task.state(), TaskState::Canceling);
        assert!(!task.cancel());
        assert_eq!(finished(&mut rx).await, Err(ErrorCode::Interrupted));
    }

    #[test]
    fn test_cancel_ready_task_is_refused() {
        let mut task = BackgroundTask::new(Arc::new(Sleepy));
        assert!(!task.cancel());
        assert_eq!(task.state(), TaskState::Ready);
    }

    #[tokio::test]
    async fn test_panic_becomes_unknown_and_releases_locks() {
        let locks = Arc::new(LockManager::logging());
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut task = BackgroundTask::new(Arc::new(Exploding));

        task.start("boom", 1, &locks, tx);
        let first = rx.recv().await.map(|e| e.kind);
        assert!(matches!(first, Some(WorkerEventKind::PreRun)));
        assert_eq!(finished(&mut rx).await, Err(ErrorCode::Unknown));
        assert_eq!(locks.wake().count(), 0);
        assert_eq!(locks.network().count(), 0);
    }
}
