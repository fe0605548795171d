//! One-shot wake alarm.
//!
//! Only one alarm is ever outstanding: arming replaces the previous one.
//! A firing carries the epoch-millisecond time it was scheduled for, so the
//! handler can measure how late it runs.
use chrono::{DateTime, Local};
use std::sync::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AlarmFired {
    pub scheduled_ms: i64,
}

pub trait Alarm: Send + Sync {
    /// Arms the alarm for `fire_at`, replacing any armed one. The firing
    /// reports `scheduled_ms`, which usually equals `fire_at` but is kept
    /// across retries.
    fn arm(&self, fire_at: DateTime<Local>, scheduled_ms: i64);

    fn cancel(&self);
}

/// Alarm backed by a sleeping tokio task.
pub struct TokioAlarm {
    tx: mpsc::UnboundedSender<AlarmFired>,
    pending: Mutex<Option<JoinHandle<()>>>,
}

impl TokioAlarm {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<AlarmFired>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let alarm = Self {
            tx,
            pending: Mutex::new(None),
        };
        (alarm, rx)
    }

    fn replace(&self, next: Option<JoinHandle<()>>) {
        let mut pending = self.pending.lock().unwrap_or_else(|p| p.into_inner());
        if let Some(previous) = pending.take() {
            previous.abort();
        }
        *pending = next;
    }
}

impl Alarm for TokioAlarm {
    fn arm(&self, fire_at: DateTime<Local>, scheduled_ms: i64) {
        let delay = (fire_at - Local::now()).to_std().unwrap_or_default();
        let tx = self.tx.clone();
        tracing::debug!(fire_at = %fire_at, delay_secs = delay.as_secs(), "Alarm armed");
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.send(AlarmFired { scheduled_ms });
        });
        self.replace(Some(handle));
    }

    fn cancel(&self) {
        self.replace(None);
    }
}

impl Drop for TokioAlarm {
    fn drop(&mut self) {
        self.replace(None);
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;

    /// Records arm and cancel calls instead of sleeping.
    #[derive(Default)]
    pub(crate) struct RecordingAlarm {
        armed: Mutex<Option<(DateTime<Local>, i64)>>,
        arm_count: Mutex<usize>,
    }

    impl RecordingAlarm {
        pub(crate) fn armed(&self) -> Option<(DateTime<Local>, i64)> {
            *self.armed.lock().unwrap()
        }

        pub(crate) fn arm_count(&self) -> usize {
            *self.arm_count.lock().unwrap()
        }
    }

    impl Alarm for RecordingAlarm {
        fn arm(&self, fire_at: DateTime<Local>, scheduled_ms: i64) {
            *self.armed.lock().unwrap() = Some((fire_at, scheduled_ms));
            *self.arm_count.lock().unwrap() += 1;
        }

        fn cancel(&self) {
            *self.armed.lock().unwrap() = None;
        }
    }
}
