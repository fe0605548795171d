//! Background tasks: channel updates and enclosure downloads.
//!
//! Jobs run on the tokio runtime under a [`TaskRegistry`], which allows at
//! most one live task per `(id, action)` and dispatches lifecycle callbacks
//! to bound [`TaskListener`]s.

mod background;
mod download;
mod locks;
mod manager;
mod registry;
mod update_channel;

pub use background::{BackgroundTask, Job, TaskContext, TaskId, TaskListener, TaskProgress, TaskState};
pub use download::DownloadItemJob;
pub use locks::{
    LockGuard, LockKinds, LockManager, LockProvider, LoggingLockProvider, PlatformLock,
    RefCountedLock,
};
pub use manager::{BindingId, OwnerKey, TaskError, TaskManager, TaskOutcome};
pub use registry::{
    Action, ChannelListener, NoticeKind, QueueChange, QueueEvent, Subscription, TaskKey,
    TaskNotice, TaskRegistry,
};
pub use update_channel::{UpdateChannelJob, UpdateChannelJobFactory};
