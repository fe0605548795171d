use sqlx::QueryBuilder;

use super::items::generate_guid;
use super::schema::Database;
use super::types::{Category, Channel, ChannelRow, DatabaseError, UpdateType};
use crate::feed::{ActionFlags, FeedParseResult};
use crate::util::strip_control_chars;

const CHANNEL_COLUMNS: &str = "id, url, title, description, image_url, feed_type, action, \
                               update_time, category_id, last_update";

impl Database {
    // ========================================================================
    // Channel Operations
    // ========================================================================

    /// Subscribes to a channel, returning its id. Re-adding a known URL
    /// returns the existing id and leaves its schedule alone.
    pub async fn add_channel(
        &self,
        url: &str,
        title: &str,
        update_time: Option<&str>,
    ) -> Result<i64, DatabaseError> {
        let row: (i64,) = sqlx::query_as(
            r#"
            INSERT INTO channels (url, title, update_time) VALUES (?, ?, ?)
            ON CONFLICT(url) DO UPDATE SET url = excluded.url
            RETURNING id
        "#,
        )
        .bind(url)
        .bind(strip_control_chars(title).trim())
        .bind(update_time)
        .fetch_one(&self.pool)
        .await?;
        self.notify(UpdateType::ChannelTable);
        Ok(row.0)
    }

    pub async fn get_channel(&self, id: i64) -> Result<Option<Channel>, DatabaseError> {
        let row: Option<ChannelRow> =
            sqlx::query_as(&format!("SELECT {CHANNEL_COLUMNS} FROM channels WHERE id = ?"))
                .bind(id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.map(ChannelRow::into_channel))
    }

    pub async fn list_channels(&self) -> Result<Vec<Channel>, DatabaseError> {
        let rows: Vec<ChannelRow> =
            sqlx::query_as(&format!("SELECT {CHANNEL_COLUMNS} FROM channels ORDER BY id"))
                .fetch_all(&self.pool)
                .await?;
        Ok(rows.into_iter().map(ChannelRow::into_channel).collect())
    }

    /// Removes a channel and, by cascade, its items.
    pub async fn delete_channel(&self, id: i64) -> Result<bool, DatabaseError> {
        let result = sqlx::query("DELETE FROM channels WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        let deleted = result.rows_affected() > 0;
        if deleted {
            self.notify(UpdateType::ChannelTable);
            self.notify(UpdateType::ItemTable);
        }
        Ok(deleted)
    }

    /// Sets or clears a channel's update schedule.
    pub async fn set_update_time(
        &self,
        id: i64,
        update_time: Option<&str>,
    ) -> Result<(), DatabaseError> {
        let result = sqlx::query("UPDATE channels SET update_time = ? WHERE id = ?")
            .bind(update_time)
            .bind(id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(DatabaseError::ChannelNotFound(id));
        }
        self.notify(UpdateType::ChannelData(id));
        Ok(())
    }

    /// Stores a user-chosen action, e.g. a different program.
    pub async fn set_channel_action(
        &self,
        id: i64,
        action: ActionFlags,
    ) -> Result<(), DatabaseError> {
        let result = sqlx::query("UPDATE channels SET action = ? WHERE id = ?")
            .bind(action.to_db())
            .bind(id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(DatabaseError::ChannelNotFound(id));
        }
        self.notify(UpdateType::ChannelData(id));
        Ok(())
    }

    /// Every non-empty schedule as `(channel_id, update_time)`.
    pub async fn channel_schedules(&self) -> Result<Vec<(i64, String)>, DatabaseError> {
        let rows: Vec<(i64, String)> = sqlx::query_as(
            "SELECT id, update_time FROM channels \
             WHERE update_time IS NOT NULL AND update_time != '' ORDER BY id",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    /// Stores a parse result atomically: channel columns, action flags and
    /// items. Existing items keep their download state and get their
    /// metadata refreshed. Returns the number of new items.
    pub async fn apply_parse_result(
        &self,
        channel_id: i64,
        result: &FeedParseResult,
        action: Option<ActionFlags>,
    ) -> Result<usize, DatabaseError> {
        let now = chrono::Utc::now().timestamp();
        let mut tx = self.pool.begin().await?;

        let updated = sqlx::query(
            r#"
            UPDATE channels SET
                title = ?, description = ?, image_url = ?, feed_type = ?,
                action = ?, last_update = ?
            WHERE id = ?
        "#,
        )
        .bind(&result.channel.title)
        .bind(&result.channel.description)
        .bind(&result.channel.image_ref)
        .bind(result.channel.feed_type.as_str())
        .bind(action.map(ActionFlags::to_db))
        .bind(now)
        .bind(channel_id)
        .execute(&mut *tx)
        .await?;
        if updated.rows_affected() == 0 {
            return Err(DatabaseError::ChannelNotFound(channel_id));
        }

        // Feeds list newest first; inserting in reverse gives newer items
        // higher ids, which is the age order pruning relies on.
        let items: Vec<_> = result
            .items
            .iter()
            .rev()
            .map(|item| (generate_guid(item), item))
            .collect();

        // 11 binds per row keeps a chunk well under SQLite's parameter limit.
        const BATCH_SIZE: usize = 50;
        let mut inserted: usize = 0;

        for chunk in items.chunks(BATCH_SIZE) {
            let mut insert: QueryBuilder<sqlx::Sqlite> = QueryBuilder::new(
                "INSERT OR IGNORE INTO items (channel_id, guid, title, link, description, pub_date, \
                 enclosure_url, enclosure_length, enclosure_type, fetched_at) ",
            );
            insert.push_values(chunk, |mut b, (guid, item)| {
                b.push_bind(channel_id)
                    .push_bind(guid)
                    .push_bind(&item.title)
                    .push_bind(&item.link)
                    .push_bind(&item.description)
                    .push_bind(&item.pub_date)
                    .push_bind(&item.enclosure.url)
                    .push_bind(&item.enclosure.length)
                    .push_bind(&item.enclosure.mime_type)
                    .push_bind(now);
            });
            inserted += insert.build().execute(&mut *tx).await?.rows_affected() as usize;
        }

        for (guid, item) in &items {
            sqlx::query(
                r#"
                UPDATE items SET
                    title = ?, link = ?, description = ?, pub_date = ?,
                    enclosure_url = ?, enclosure_length = ?, enclosure_type = ?
                WHERE channel_id = ? AND guid = ?
            "#,
            )
            .bind(&item.title)
            .bind(&item.link)
            .bind(&item.description)
            .bind(&item.pub_date)
            .bind(&item.enclosure.url)
            .bind(&item.enclosure.length)
            .bind(&item.enclosure.mime_type)
            .bind(channel_id)
            .bind(guid)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;

        self.notify(UpdateType::ChannelData(channel_id));
        if !items.is_empty() {
            self.notify(UpdateType::ItemTable);
        }
        tracing::debug!(channel_id, inserted, total = items.len(), "Stored parse result");
        Ok(inserted)
    }

    /// Prunes the oldest items so that `keep_percent` of each channel's
    /// items remain (rounded up). Downloaded items are never pruned.
    /// `None` prunes every channel. Returns the number of deleted items.
    pub async fn delete_old_items(
        &self,
        channel_id: Option<i64>,
        keep_percent: u8,
    ) -> Result<u64, DatabaseError> {
        if keep_percent > 100 {
            return Err(DatabaseError::Invalid(format!(
                "keep percent {keep_percent} exceeds 100"
            )));
        }
        let channel_ids: Vec<i64> = match channel_id {
            Some(id) => vec![id],
            None => sqlx::query_as::<_, (i64,)>("SELECT id FROM channels")
                .fetch_all(&self.pool)
                .await?
                .into_iter()
                .map(|(id,)| id)
                .collect(),
        };

        let mut tx = self.pool.begin().await?;
        let mut deleted = 0;
        for id in channel_ids {
            let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM items WHERE channel_id = ?")
                .bind(id)
                .fetch_one(&mut *tx)
                .await?;
            let keep = (count * i64::from(keep_percent) + 99) / 100;
            let result = sqlx::query(
                r#"
                DELETE FROM items
                WHERE channel_id = ? AND downloaded_path IS NULL AND id NOT IN (
                    SELECT id FROM items WHERE channel_id = ? ORDER BY id DESC LIMIT ?
                )
            "#,
            )
            .bind(id)
            .bind(id)
            .bind(keep)
            .execute(&mut *tx)
            .await?;
            deleted += result.rows_affected();
        }
        tx.commit().await?;

        if deleted > 0 {
            self.notify(UpdateType::ItemTable);
        }
        Ok(deleted)
    }

    // ========================================================================
    // Category Operations
    // ========================================================================

    /// SEC-014: Control characters are stripped and the name trimmed.
    pub async fn create_category(&self, name: &str) -> Result<i64, DatabaseError> {
        let clean = strip_control_chars(name);
        let clean = clean.trim();
        if clean.is_empty() {
            return Err(DatabaseError::Invalid(
                "category name cannot be empty".to_string(),
            ));
        }
        let row: (i64,) = sqlx::query_as(
            r#"
            INSERT INTO categories (name) VALUES (?)
            ON CONFLICT(name) DO UPDATE SET name = excluded.name
            RETURNING id
        "#,
        )
        .bind(clean)
        .fetch_one(&self.pool)
        .await?;
        self.notify(UpdateType::CategoryTable);
        Ok(row.0)
    }

    pub async fn list_categories(&self) -> Result<Vec<Category>, DatabaseError> {
        let rows: Vec<(i64, String)> = sqlx::query_as("SELECT id, name FROM categories ORDER BY name")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows
            .into_iter()
            .map(|(id, name)| Category { id, name })
            .collect())
    }

    /// Moves a channel into a category, or out of all categories.
    pub async fn set_channel_category(
        &self,
        channel_id: i64,
        category_id: Option<i64>,
    ) -> Result<(), DatabaseError> {
        let result = sqlx::query("UPDATE channels SET category_id = ? WHERE id = ?")
            .bind(category_id)
            .bind(channel_id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(DatabaseError::ChannelNotFound(channel_id));
        }
        self.notify(UpdateType::ChannelTable);
        Ok(())
    }
}
