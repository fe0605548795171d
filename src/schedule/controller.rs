//! Alarm-driven scheduled updates.
//!
//! `schedule_next_update` arms one alarm for the nearest schedule point of
//! any channel. When it fires, `handle_alarm` starts an UPDATE task for every
//! channel whose schedule point has passed within the firing's lateness,
//! then arms the next alarm.
use chrono::{DateTime, Duration, Local, Timelike};
use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard};

use super::alarm::Alarm;
use super::clock::Clock;
use super::{parse_schedule, ScheduleSettings, ScheduleSource, UpdateJobFactory, SECONDS_PER_DAY};
use crate::error::ErrorCode;
use crate::task::{OwnerKey, TaskError, TaskKey, TaskListener, TaskRegistry};

const LISTENER_OWNER: &str = "scheduled-update";

#[derive(Debug)]
struct ControllerState {
    enabled: bool,
    /// Alarm handlers currently running.
    handling: usize,
    /// Channels with a scheduled update still running.
    in_flight: HashSet<i64>,
}

type SharedState = Arc<Mutex<ControllerState>>;

fn lock(state: &SharedState) -> MutexGuard<'_, ControllerState> {
    state.lock().unwrap_or_else(|p| p.into_inner())
}

pub struct ScheduledUpdateController {
    source: Arc<dyn ScheduleSource>,
    registry: TaskRegistry,
    jobs: Arc<dyn UpdateJobFactory>,
    alarm: Arc<dyn Alarm>,
    clock: Arc<dyn Clock>,
    settings: ScheduleSettings,
    state: SharedState,
}

/// Seconds until the next occurrence of `scheduled`, in `1..=86400`.
///
/// A schedule point equal to now is a day away: it is being handled right
/// now.
fn forward_distance(now_tod: u32, scheduled: u32) -> u32 {
    match (scheduled + SECONDS_PER_DAY - now_tod) % SECONDS_PER_DAY {
        0 => SECONDS_PER_DAY,
        d => d,
    }
}

/// Seconds since the most recent occurrence of `scheduled`, in `0..86400`.
fn backward_distance(now_tod: u32, scheduled: u32) -> u32 {
    (now_tod + SECONDS_PER_DAY - scheduled) % SECONDS_PER_DAY
}

fn whole_second(t: DateTime<Local>) -> DateTime<Local> {
    t.with_nanosecond(0).unwrap_or(t)
}

/// Bounded to a week so adding it to a timestamp cannot overflow.
fn to_chrono(d: std::time::Duration) -> Duration {
    let week = Duration::days(7);
    Duration::from_std(d).map_or(week, |d| d.min(week))
}

/// Removes a channel from the in-flight set once its update ends.
struct CompletionListener {
    channel_id: i64,
    state: SharedState,
}

impl CompletionListener {
    fn done(&self) {
        let mut state = lock(&self.state);
        state.in_flight.remove(&self.channel_id);
        if state.in_flight.is_empty() && state.handling == 0 {
            tracing::debug!("All scheduled updates finished");
        }
    }
}

impl TaskListener for CompletionListener {
    fn on_post_run(&self, _task_id: &str, result: Result<(), ErrorCode>) {
        if let Err(code) = result {
            tracing::info!(channel_id = self.channel_id, error = %code, "Scheduled update failed");
        }
        self.done();
    }

    fn on_cancelled(&self, _task_id: &str) {
        self.done();
    }
}

/// Counts a running alarm handler for `is_instance_alive`.
struct Handling<'a>(&'a SharedState);

impl<'a> Handling<'a> {
    /// Counts a handler only while scheduling is enabled. The check and the
    /// count share one lock so `try_disable` cannot slip in between.
    fn try_enter(state: &'a SharedState) -> Option<Self> {
        let mut guard = lock(state);
        if !guard.enabled {
            return None;
        }
        guard.handling += 1;
        Some(Self(state))
    }
}

impl Drop for Handling<'_> {
    fn drop(&mut self) {
        lock(self.0).handling -= 1;
    }
}

impl ScheduledUpdateController {
    pub fn new(
        source: Arc<dyn ScheduleSource>,
        registry: TaskRegistry,
        jobs: Arc<dyn UpdateJobFactory>,
        alarm: Arc<dyn Alarm>,
        clock: Arc<dyn Clock>,
        settings: ScheduleSettings,
    ) -> Self {
        Self {
            source,
            registry,
            jobs,
            alarm,
            clock,
            settings,
            state: Arc::new(Mutex::new(ControllerState {
                enabled: true,
                handling: 0,
                in_flight: HashSet::new(),
            })),
        }
    }

    pub fn registry(&self) -> &TaskRegistry {
        &self.registry
    }

    pub fn is_enabled(&self) -> bool {
        lock(&self.state).enabled
    }

    pub fn set_enabled(&self, enabled: bool) {
        lock(&self.state).enabled = enabled;
        tracing::debug!(enabled, "Scheduled updates toggled");
    }

    /// Whether an alarm handler runs or a scheduled update is in flight.
    pub fn is_instance_alive(&self) -> bool {
        let state = lock(&self.state);
        state.handling > 0 || !state.in_flight.is_empty()
    }

    /// Disables scheduling if it is enabled and nothing scheduled is alive.
    /// Returns whether this call disabled it.
    pub(crate) fn try_disable(&self) -> bool {
        let mut state = lock(&self.state);
        if !state.enabled || state.handling > 0 || !state.in_flight.is_empty() {
            return false;
        }
        state.enabled = false;
        true
    }

    /// Arms the alarm for the nearest schedule point after `now`. Returns
    /// when it fires, or `None` if no channel has a schedule.
    pub async fn schedule_next_update(&self, now: DateTime<Local>) -> Option<DateTime<Local>> {
        let schedules = match self.source.schedules().await {
            Ok(schedules) => schedules,
            Err(e) => {
                tracing::error!(error = %e, "Cannot read channel schedules, retrying later");
                let retry_at = now + to_chrono(self.settings.retry_delay);
                self.alarm.arm(retry_at, retry_at.timestamp_millis());
                return Some(retry_at);
            }
        };

        let now_tod = now.num_seconds_from_midnight();
        let nearest = schedules
            .iter()
            .flat_map(|(_, text)| parse_schedule(text))
            .map(|t| forward_distance(now_tod, t))
            .min();

        match nearest {
            Some(distance) => {
                let fire_at = whole_second(now) + Duration::seconds(i64::from(distance));
                self.alarm.arm(fire_at, fire_at.timestamp_millis());
                tracing::info!(fire_at = %fire_at, "Next scheduled update armed");
                Some(fire_at)
            }
            None => {
                self.alarm.cancel();
                tracing::debug!("No channel has a schedule, alarm disarmed");
                None
            }
        }
    }

    /// Reschedules from the current time, e.g. after a schedule edit.
    pub async fn reschedule(&self) -> Option<DateTime<Local>> {
        self.schedule_next_update(self.clock.now()).await
    }

    /// Forced reschedule after a clock or time zone change.
    pub async fn on_time_changed(&self) -> Option<DateTime<Local>> {
        tracing::info!("Clock changed, rescheduling");
        self.reschedule().await
    }

    /// Handles an alarm that was scheduled for `scheduled_ms` (epoch ms).
    pub async fn handle_alarm(&self, scheduled_ms: i64) {
        let now = self.clock.now();
        let Some(_handling) = Handling::try_enter(&self.state) else {
            let retry_at = now + to_chrono(self.settings.retry_delay);
            tracing::info!(retry_at = %retry_at, "Scheduled updates disabled, retrying later");
            self.alarm.arm(retry_at, scheduled_ms);
            return;
        };

        let lateness_ms = now.timestamp_millis() - scheduled_ms;
        let early_ms = self.settings.early_tolerance.as_millis() as i64;
        let late_ms = self.settings.max_lateness.as_millis() as i64;
        if lateness_ms < -early_ms || lateness_ms > late_ms {
            tracing::warn!(lateness_ms, "Ignoring implausible alarm");
            self.schedule_next_update(now).await;
            return;
        }

        let sched_error = (lateness_ms.max(0) / 1000) as u32;
        match self.due_channels(now, sched_error).await {
            Ok(due) => {
                for channel_id in due {
                    if let Err(e) = self.start_update(channel_id).await {
                        tracing::error!(channel_id, error = %e, "Cannot start scheduled update");
                    }
                }
            }
            Err(e) => tracing::error!(error = %e, "Cannot read channel schedules"),
        }

        // The handler's own `now`: points that came due while it ran are
        // still ahead of it.
        self.schedule_next_update(now).await;
    }

    /// Channels with a schedule point at most `sched_error` seconds before
    /// `now`. Each channel appears once, however many of its points match.
    async fn due_channels(
        &self,
        now: DateTime<Local>,
        sched_error: u32,
    ) -> Result<Vec<i64>, crate::storage::DatabaseError> {
        let now_tod = now.num_seconds_from_midnight();
        let schedules = self.source.schedules().await?;
        Ok(schedules
            .into_iter()
            .filter(|(_, text)| {
                parse_schedule(text)
                    .into_iter()
                    .any(|t| backward_distance(now_tod, t) <= sched_error)
            })
            .map(|(id, _)| id)
            .collect())
    }

    async fn start_update(&self, channel_id: i64) -> Result<(), TaskError> {
        let key = TaskKey::update(channel_id);
        if self.registry.state(key).await?.is_active() {
            tracing::debug!(channel_id, "Update already queued, skipping");
            return Ok(());
        }
        // Marked before launching: a fast job may finish before `launch`
        // returns, and its completion must find the mark.
        let marked = lock(&self.state).in_flight.insert(channel_id);
        let listener = Arc::new(CompletionListener {
            channel_id,
            state: Arc::clone(&self.state),
        });
        let launched = self
            .registry
            .launch(
                key,
                self.jobs.update_job(channel_id),
                OwnerKey::new(LISTENER_OWNER),
                listener,
                true,
            )
            .await;

        match launched {
            Ok(Some(subscription)) => {
                subscription.detach();
                tracing::info!(channel_id, "Scheduled update started");
                Ok(())
            }
            Ok(None) => {
                if marked {
                    lock(&self.state).in_flight.remove(&channel_id);
                }
                tracing::debug!(channel_id, "Update already queued, skipping");
                Ok(())
            }
            Err(e) => {
                if marked {
                    lock(&self.state).in_flight.remove(&channel_id);
                }
                Err(e)
            }
        }
    }
}
