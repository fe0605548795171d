//! Scheduled channel updates.
//!
//! Each channel may carry a schedule: one or more local times of day in
//! seconds since midnight, `/`-separated (`"3600/43200"` is 01:00 and
//! 12:00). The [`ScheduledUpdateController`] keeps a single alarm armed for
//! the nearest of all of them.

mod alarm;
mod clock;
mod controller;
mod exclusive;

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

pub use alarm::{Alarm, AlarmFired, TokioAlarm};
pub use clock::{Clock, ManualClock, SystemClock};
pub use controller::ScheduledUpdateController;
pub use exclusive::{export_channels, import_channels, ExclusiveAccess, ExclusiveAccessError};

use crate::storage::{Database, DatabaseError};
use crate::task::Job;

pub const SECONDS_PER_DAY: u32 = 86_400;

/// Tuning knobs for the controller, see `Config::schedule_settings`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScheduleSettings {
    /// Delay before a firing that arrived while disabled is retried.
    pub retry_delay: Duration,
    /// Firings later than this are stale.
    pub max_lateness: Duration,
    /// Firings earlier than this are stale.
    pub early_tolerance: Duration,
}

impl Default for ScheduleSettings {
    fn default() -> Self {
        Self {
            retry_delay: Duration::from_secs(60),
            max_lateness: Duration::from_secs(3600),
            early_tolerance: Duration::from_secs(5),
        }
    }
}

/// Where the controller reads channel schedules from.
#[async_trait]
pub trait ScheduleSource: Send + Sync {
    /// `(channel_id, schedule text)` for every scheduled channel.
    async fn schedules(&self) -> Result<Vec<(i64, String)>, DatabaseError>;
}

#[async_trait]
impl ScheduleSource for Database {
    async fn schedules(&self) -> Result<Vec<(i64, String)>, DatabaseError> {
        self.channel_schedules().await
    }
}

/// Creates the job for a scheduled channel update.
pub trait UpdateJobFactory: Send + Sync {
    fn update_job(&self, channel_id: i64) -> Arc<dyn Job>;
}

/// Parses a schedule string into seconds-of-day values.
///
/// Entries that are not integers in `0..86400` are skipped with a warning;
/// one bad entry does not disable the others.
pub fn parse_schedule(text: &str) -> Vec<u32> {
    text.split('/')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .filter_map(|s| match s.parse::<u32>() {
            Ok(secs) if secs < SECONDS_PER_DAY => Some(secs),
            _ => {
                tracing::warn!(entry = s, "Ignoring invalid schedule entry");
                None
            }
        })
        .collect()
}

/// Checks a schedule given by a user. Every entry must be valid.
pub fn validate_schedule(text: &str) -> Result<Vec<u32>, String> {
    let mut times = Vec::new();
    for entry in text.split('/').map(str::trim) {
        match entry.parse::<u32>() {
            Ok(secs) if secs < SECONDS_PER_DAY => times.push(secs),
            _ => return Err(format!("'{}' is not a second of the day (0-86399)", entry)),
        }
    }
    Ok(times)
}
