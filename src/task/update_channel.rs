//! Channel UPDATE job: fetch, parse, decide action flags, persist, prune.
use async_trait::async_trait;
use std::sync::Arc;

use super::background::{Job, TaskContext};
use super::locks::LockKinds;
use crate::error::ErrorCode;
use crate::feed::policy::{decide_action_type, verify_channel};
use crate::feed::{parse_url, Fetcher};
use crate::schedule::UpdateJobFactory;
use crate::storage::{Database, DatabaseError};

pub struct UpdateChannelJob {
    channel_id: i64,
    db: Database,
    fetcher: Fetcher,
    keep_percent: u8,
}

impl UpdateChannelJob {
    pub fn new(channel_id: i64, db: Database, fetcher: Fetcher, keep_percent: u8) -> Self {
        Self {
            channel_id,
            db,
            fetcher,
            keep_percent,
        }
    }
}

#[async_trait]
impl Job for UpdateChannelJob {
    async fn run(&self, cx: &TaskContext) -> Result<(), ErrorCode> {
        let channel = self
            .db
            .get_channel(self.channel_id)
            .await?
            .ok_or(DatabaseError::ChannelNotFound(self.channel_id))?;

        let result = parse_url(&self.fetcher, &channel.url, cx.cancel_token()).await?;
        if !verify_channel(&result.channel) {
            tracing::info!(channel_id = self.channel_id, url = %channel.url, "Feed has no channel title");
            return Err(ErrorCode::UnsupportedFormat);
        }
        let action = decide_action_type(channel.action, &result.channel, result.items.first());

        // Last point where cancelling leaves the database untouched.
        cx.check_cancelled()?;
        let added = self
            .db
            .apply_parse_result(self.channel_id, &result, action)
            .await?;
        let pruned = self
            .db
            .delete_old_items(Some(self.channel_id), self.keep_percent)
            .await?;

        tracing::info!(
            channel_id = self.channel_id,
            items = result.items.len(),
            added,
            pruned,
            "Channel updated"
        );
        Ok(())
    }

    fn locks(&self) -> LockKinds {
        LockKinds::ALL
    }
}

/// Builds update jobs that share one database and fetcher.
#[derive(Clone)]
pub struct UpdateChannelJobFactory {
    db: Database,
    fetcher: Fetcher,
    keep_percent: u8,
}

impl UpdateChannelJobFactory {
    pub fn new(db: Database, fetcher: Fetcher, keep_percent: u8) -> Self {
        Self {
            db,
            fetcher,
            keep_percent,
        }
    }
}

impl UpdateJobFactory for UpdateChannelJobFactory {
    fn update_job(&self, channel_id: i64) -> Arc<dyn Job> {
        Arc::new(UpdateChannelJob::new(
            channel_id,
            self.db.clone(),
            self.fetcher.clone(),
            self.keep_percent,
        ))
    }
}
