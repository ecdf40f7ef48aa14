//! # Last-Read Fallback
//!
//! Local copy of the user's read cursors. Writes only ever move a cursor
//! forward.

use chrono::{DateTime, Utc};
use sqlx::Row;
use uuid::Uuid;

use super::schema::{decode_timestamp, encode_timestamp};
use super::{LocalDatabase, Result};

impl LocalDatabase {
    /// Move the cursor forward to `at`; returns false when it was already
    /// at or past it.
    pub async fn advance_cursor(&self, conversation_id: Uuid, user_id: Uuid, at: DateTime<Utc>) -> Result<bool> {
        let result = sqlx::query(
            "INSERT INTO read_cursors (conversation_id, user_id, last_viewed_at) VALUES (?, ?, ?)
             ON CONFLICT(conversation_id, user_id) DO UPDATE SET last_viewed_at = excluded.last_viewed_at
             WHERE excluded.last_viewed_at > read_cursors.last_viewed_at",
        )
        .bind(conversation_id.to_string())
        .bind(user_id.to_string())
        .bind(encode_timestamp(at))
        .execute(self.pool())
        .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn get_cursor(&self, conversation_id: Uuid, user_id: Uuid) -> Result<Option<DateTime<Utc>>> {
        let row = sqlx::query("SELECT last_viewed_at FROM read_cursors WHERE conversation_id = ? AND user_id = ?")
            .bind(conversation_id.to_string())
            .bind(user_id.to_string())
            .fetch_optional(self.pool())
            .await?;
        match row {
            Some(row) => {
                let text: String = row.try_get("last_viewed_at")?;
                decode_timestamp(&text).map(Some)
            }
            None => Ok(None),
        }
    }
}
