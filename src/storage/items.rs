use sha2::{Digest, Sha256};

use super::schema::Database;
use super::types::{DatabaseError, Item, ItemRow, UpdateType};
use crate::feed::ParsedItem;

/// OOM guard for a single item query.
const MAX_ITEMS: i64 = 2000;

const ITEM_COLUMNS: &str = "id, channel_id, guid, title, link, description, pub_date, \
                            enclosure_url, enclosure_length, enclosure_type, downloaded_path, \
                            fetched_at";

/// Stable identity of an item within its channel.
///
/// The feed's own guid when present, otherwise a SHA-256 over the fields
/// that identify the item to a reader.
pub(crate) fn generate_guid(item: &ParsedItem) -> String {
    let trimmed = item.guid.trim();
    if !trimmed.is_empty() {
        return trimmed.to_string();
    }
    let input = format!("{}|{}|{}", item.link, item.enclosure.url, item.title);
    format!("{:x}", Sha256::digest(input.as_bytes()))
}

impl Database {
    // ========================================================================
    // Item Operations
    // ========================================================================

    /// A channel's items, newest first.
    pub async fn get_items(&self, channel_id: i64) -> Result<Vec<Item>, DatabaseError> {
        let rows: Vec<ItemRow> = sqlx::query_as(&format!(
            "SELECT {ITEM_COLUMNS} FROM items WHERE channel_id = ? ORDER BY id DESC LIMIT ?"
        ))
        .bind(channel_id)
        .bind(MAX_ITEMS)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(ItemRow::into_item).collect())
    }

    pub async fn get_item(&self, id: i64) -> Result<Option<Item>, DatabaseError> {
        let row: Option<ItemRow> =
            sqlx::query_as(&format!("SELECT {ITEM_COLUMNS} FROM items WHERE id = ?"))
                .bind(id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.map(ItemRow::into_item))
    }

    /// Records the local file of a finished enclosure download.
    pub async fn set_item_downloaded(&self, id: i64, path: &str) -> Result<(), DatabaseError> {
        let result = sqlx::query("UPDATE items SET downloaded_path = ? WHERE id = ?")
            .bind(path)
            .bind(id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(DatabaseError::ItemNotFound(id));
        }
        self.notify(UpdateType::ItemTable);
        Ok(())
    }
}
