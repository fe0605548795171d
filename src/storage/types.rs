use thiserror::Error;

use crate::feed::{ActionFlags, Enclosure, FeedType};

// ============================================================================
// Error Types
// ============================================================================

#[derive(Debug, Error)]
pub enum DatabaseError {
    /// Another process holds the database lock.
    #[error("Another instance of feedline appears to be running. Please close it and try again.")]
    InstanceLocked,

    #[error("Database migration failed: {0}")]
    Migration(String),

    #[error("Channel {0} not found")]
    ChannelNotFound(i64),

    #[error("Item {0} not found")]
    ItemNotFound(i64),

    #[error("Invalid value: {0}")]
    Invalid(String),

    #[error("Database error: {0}")]
    Other(#[from] sqlx::Error),
}

impl DatabaseError {
    /// Maps SQLite lock failures to [`DatabaseError::InstanceLocked`].
    pub(crate) fn from_sqlx(err: sqlx::Error) -> Self {
        let error_string = err.to_string().to_lowercase();
        if error_string.contains("database is locked")
            || error_string.contains("database table is locked")
            || error_string.contains("sqlite_busy")
            || error_string.contains("sqlite_locked")
            || error_string.contains("unable to open database file")
        {
            return DatabaseError::InstanceLocked;
        }
        DatabaseError::Other(err)
    }
}

// ============================================================================
// Change Notifications
// ============================================================================

/// What changed in the database. Broadcast after every committed write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UpdateType {
    CategoryTable,
    /// Channels were added, removed or re-categorized.
    ChannelTable,
    /// One channel's own columns changed.
    ChannelData(i64),
    ItemTable,
}

// ============================================================================
// Row Types
// ============================================================================

#[derive(Debug, sqlx::FromRow)]
pub(crate) struct ChannelRow {
    pub id: i64,
    pub url: String,
    pub title: String,
    pub description: String,
    pub image_url: String,
    pub feed_type: String,
    pub action: Option<String>,
    pub update_time: Option<String>,
    pub category_id: Option<i64>,
    pub last_update: Option<i64>,
}

impl ChannelRow {
    pub(crate) fn into_channel(self) -> Channel {
        Channel {
            id: self.id,
            url: self.url,
            title: self.title,
            description: self.description,
            image_url: self.image_url,
            feed_type: FeedType::from_db(&self.feed_type),
            action: self.action.as_deref().and_then(ActionFlags::from_db),
            update_time: self.update_time,
            category_id: self.category_id,
            last_update: self.last_update,
        }
    }
}

#[derive(Debug, sqlx::FromRow)]
pub(crate) struct ItemRow {
    pub id: i64,
    pub channel_id: i64,
    pub guid: String,
    pub title: String,
    pub link: String,
    pub description: String,
    pub pub_date: String,
    pub enclosure_url: String,
    pub enclosure_length: String,
    pub enclosure_type: String,
    pub downloaded_path: Option<String>,
    pub fetched_at: i64,
}

impl ItemRow {
    pub(crate) fn into_item(self) -> Item {
        Item {
            id: self.id,
            channel_id: self.channel_id,
            guid: self.guid,
            title: self.title,
            link: self.link,
            description: self.description,
            pub_date: self.pub_date,
            enclosure: Enclosure {
                url: self.enclosure_url,
                length: self.enclosure_length,
                mime_type: self.enclosure_type,
            },
            downloaded_path: self.downloaded_path,
            fetched_at: self.fetched_at,
        }
    }
}

// ============================================================================
// Data Structures
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Channel {
    pub id: i64,
    pub url: String,
    pub title: String,
    pub description: String,
    pub image_url: String,
    pub feed_type: FeedType,
    /// `None` until the first successful update decides it.
    pub action: Option<ActionFlags>,
    /// Seconds-of-day update times, `/`-delimited.
    pub update_time: Option<String>,
    pub category_id: Option<i64>,
    /// Unix seconds of the last successful update.
    pub last_update: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Item {
    pub id: i64,
    pub channel_id: i64,
    pub guid: String,
    pub title: String,
    pub link: String,
    pub description: String,
    pub pub_date: String,
    pub enclosure: Enclosure,
    /// Local file of a completed enclosure download.
    pub downloaded_path: Option<String>,
    pub fetched_at: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Category {
    pub id: i64,
    pub name: String,
}
