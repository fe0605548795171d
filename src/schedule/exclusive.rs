//! Exclusive database access for bulk maintenance (OPML export/import).
//!
//! Access is granted only while no scheduled update is alive and no UPDATE
//! task is registered; scheduling stays disabled until the guard drops.
use std::collections::HashSet;
use std::path::Path;
use thiserror::Error;

use super::controller::ScheduledUpdateController;
use super::validate_schedule;
use crate::feed::opml::{self, OpmlChannel, OpmlError};
use crate::storage::{Database, DatabaseError};
use crate::task::{Action, TaskError};
use crate::util::HostPolicy;

#[derive(Debug, Error)]
pub enum ExclusiveAccessError {
    #[error("Channel updates are in progress, try again when they finish")]
    Busy,

    #[error(transparent)]
    Registry(#[from] TaskError),

    #[error(transparent)]
    Opml(#[from] OpmlError),

    #[error(transparent)]
    Database(#[from] DatabaseError),
}

/// Proof of exclusive access. Re-enables scheduled updates on drop.
#[must_use = "exclusive access ends when the guard is dropped"]
pub struct ExclusiveAccess<'a> {
    controller: &'a ScheduledUpdateController,
}

impl<'a> ExclusiveAccess<'a> {
    /// # Errors
    ///
    /// `ExclusiveAccessError::Busy` when a scheduled update is alive, an
    /// UPDATE task is active, or someone else holds access.
    pub async fn acquire(
        controller: &'a ScheduledUpdateController,
    ) -> Result<Self, ExclusiveAccessError> {
        if !controller.try_disable() {
            return Err(ExclusiveAccessError::Busy);
        }
        // From here on, dropping the guard undoes the disable.
        let access = Self { controller };
        let active = controller.registry().active_ids(Action::Update).await?;
        if !active.is_empty() {
            tracing::info!(channels = ?active, "Exclusive access refused, updates active");
            return Err(ExclusiveAccessError::Busy);
        }
        tracing::debug!("Exclusive database access acquired");
        Ok(access)
    }
}

impl Drop for ExclusiveAccess<'_> {
    fn drop(&mut self) {
        self.controller.set_enabled(true);
        tracing::debug!("Exclusive database access released");
    }
}

/// Writes every channel with its schedule to an OPML file. Returns the
/// number of channels written.
pub async fn export_channels(
    db: &Database,
    _access: &ExclusiveAccess<'_>,
    path: &Path,
) -> Result<usize, ExclusiveAccessError> {
    let channels: Vec<OpmlChannel> = db
        .list_channels()
        .await?
        .into_iter()
        .map(|c| OpmlChannel {
            title: c.title,
            xml_url: c.url,
            schedule: c.update_time.filter(|s| !s.is_empty()),
        })
        .collect();
    opml::write_file(&channels, path).await?;
    tracing::info!(count = channels.len(), path = %path.display(), "Channels exported");
    Ok(channels.len())
}

/// Subscribes to every channel of an OPML file. Known URLs are left as
/// they are, and URLs `hosts` refuses are skipped. Returns the number of
/// new channels.
pub async fn import_channels(
    db: &Database,
    _access: &ExclusiveAccess<'_>,
    path: &Path,
    hosts: HostPolicy,
) -> Result<usize, ExclusiveAccessError> {
    let channels = opml::read_file(path, hosts).await?;
    let known: HashSet<String> = db.list_channels().await?.into_iter().map(|c| c.url).collect();

    let mut added = 0;
    for channel in channels {
        if known.contains(&channel.xml_url) {
            continue;
        }
        let schedule = channel
            .schedule
            .as_deref()
            .filter(|s| match validate_schedule(s) {
                Ok(_) => true,
                Err(e) => {
                    tracing::warn!(url = %channel.xml_url, error = %e, "Dropping invalid schedule");
                    false
                }
            });
        db.add_channel(&channel.xml_url, &channel.title, schedule).await?;
        added += 1;
    }
    tracing::info!(added, path = %path.display(), "Channels imported");
    Ok(added)
}
