//! # Draft Storage
//!
//! Unsent text per (conversation, user). A draft is cleared by a successful
//! send of the same text or by an explicit discard.

use sqlx::Row;
use uuid::Uuid;

use super::schema::encode_timestamp;
use super::{LocalDatabase, Result};

impl LocalDatabase {
    /// Store a draft; an empty body removes it
    pub async fn save_draft(&self, conversation_id: Uuid, user_id: Uuid, body: &str) -> Result<()> {
        if body.is_empty() {
            return self.clear_draft(conversation_id, user_id).await.map(|_| ());
        }
        sqlx::query(
            "INSERT INTO drafts (conversation_id, user_id, body, updated_at) VALUES (?, ?, ?, ?)
             ON CONFLICT(conversation_id, user_id) DO UPDATE SET body = excluded.body, updated_at = excluded.updated_at",
        )
        .bind(conversation_id.to_string())
        .bind(user_id.to_string())
        .bind(body)
        .bind(encode_timestamp(chrono::Utc::now()))
        .execute(self.pool())
        .await?;
        Ok(())
    }

    pub async fn get_draft(&self, conversation_id: Uuid, user_id: Uuid) -> Result<Option<String>> {
        let row = sqlx::query("SELECT body FROM drafts WHERE conversation_id = ? AND user_id = ?")
            .bind(conversation_id.to_string())
            .bind(user_id.to_string())
            .fetch_optional(self.pool())
            .await?;
        row.map(|row| row.try_get::<String, _>("body")).transpose()
    }

    /// Remove a draft; returns whether one existed
    pub async fn clear_draft(&self, conversation_id: Uuid, user_id: Uuid) -> Result<bool> {
        let result = sqlx::query("DELETE FROM drafts WHERE conversation_id = ? AND user_id = ?")
            .bind(conversation_id.to_string())
            .bind(user_id.to_string())
            .execute(self.pool())
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Remove the draft only if it still holds `body`
    pub async fn clear_draft_if(&self, conversation_id: Uuid, user_id: Uuid, body: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM drafts WHERE conversation_id = ? AND user_id = ? AND body = ?")
            .bind(conversation_id.to_string())
            .bind(user_id.to_string())
            .bind(body)
            .execute(self.pool())
            .await?;
        Ok(result.rows_affected() > 0)
    }
}
