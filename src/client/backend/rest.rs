//! # REST Backend Adapter
//!
//! [`BackendService`] and [`AuthProvider`] over HTTP for a PostgREST-style
//! hosted backend:
//!
//! - `/rest/v1/<table>` row CRUD with `eq.` / `in.` filters
//! - `/storage/v1/object/<bucket>/<key>` object uploads
//! - `/auth/v1/*` authentication
//! - `/realtime/v1/<table>?<filter>` server-sent change feed, one JSON
//!   [`ChangeEvent`] per `data:` line
//!
//! HTTP statuses map onto the engine taxonomy: 401/403 permission denied,
//! 404 not found, 409 conflict, 400/422 validation, everything else and
//! connect failures count as the network being unavailable.

use std::collections::VecDeque;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, SecondsFormat, Utc};
use futures_util::StreamExt;
use reqwest::{Client, Method, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use uuid::Uuid;

use super::{AuthProvider, BackendService, ChangeStream, RowFilter, Session, SignUpRequest};
use crate::client::config::Config;
use crate::client::error::{Result, SyncError};
use crate::shared::error::SharedError;
use crate::shared::event::{ChangeEvent, EntityKind};
use crate::shared::messaging::{
    ChatMessage, Conversation, CreateConversationRequest, GroupNotification, MessageId,
    Participant, Profile, Reaction, ReadCursor, SendMessageRequest, TypingState,
};

/// HTTP adapter for the hosted backend
#[derive(Debug)]
pub struct RestBackend {
    client: Client,
    config: RwLock<Config>,
    session: RwLock<Option<Session>>,
}

#[derive(Debug, Deserialize)]
struct AuthUser {
    id: Uuid,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    expires_in: Option<i64>,
    user: AuthUser,
}

#[derive(Debug, Deserialize)]
struct ConversationRef {
    conversation_id: Uuid,
}

#[derive(Debug, Deserialize)]
struct BlockedRef {
    blocked_id: Uuid,
}

#[derive(Debug, Serialize)]
struct FavouriteRow {
    user_id: Uuid,
    conversation_id: Uuid,
}

#[derive(Debug, Serialize)]
struct BlockRow {
    blocker_id: Uuid,
    blocked_id: Uuid,
}

fn eq(value: impl ToString) -> String {
    format!("eq.{}", value.to_string())
}

/// PostgREST `in.(...)` list with quoted members
fn in_list<T: ToString>(values: &[T]) -> String {
    let quoted: Vec<String> = values
        .iter()
        .map(|v| format!("\"{}\"", v.to_string().replace('"', "\\\"")))
        .collect();
    format!("in.({})", quoted.join(","))
}

fn timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn status_error(status: StatusCode, body: &str) -> SyncError {
    let detail = if body.is_empty() {
        status.to_string()
    } else {
        format!("{} - {}", status, body)
    };
    match status.as_u16() {
        401 | 403 => SyncError::PermissionDenied(detail),
        404 => SyncError::NotFound(detail),
        409 => SyncError::Conflict(detail),
        400 | 422 => SyncError::ValidationFailed(detail),
        _ => SyncError::NetworkUnavailable(detail),
    }
}

/// Incremental `text/event-stream` line decoder
#[derive(Debug, Default)]
pub struct SseDecoder {
    buffer: Vec<u8>,
}

impl SseDecoder {
    /// Feed a chunk; returns the payloads of every completed `data:` line
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buffer.extend_from_slice(chunk);
        let mut payloads = Vec::new();
        while let Some(newline) = self.buffer.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=newline).collect();
            let line = String::from_utf8_lossy(&line);
            let line = line.trim_end_matches(['\n', '\r']);

            // Skip blank separators and comments (keep-alives)
            if line.is_empty() || line.starts_with(':') {
                continue;
            }
            if let Some(data) = line.strip_prefix("data:") {
                payloads.push(data.trim_start().to_string());
            }
        }
        payloads
    }
}

impl RestBackend {
    pub fn new(config: Config) -> Self {
        Self {
            client: Client::new(),
            config: RwLock::new(config),
            session: RwLock::new(None),
        }
    }

    async fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let config = self.config.read().await;
        let mut request = self
            .client
            .request(method, config.api_url(path))
            .timeout(config.app().request_timeout);
        if let Some(key) = config.app().anon_key.as_deref() {
            request = request.header("apikey", key);
        }
        if let Some(bearer) = config.bearer() {
            request = request.header("Authorization", format!("Bearer {}", bearer));
        }
        request
    }

    async fn send(&self, request: RequestBuilder) -> Result<Response> {
        let response = match request.send().await {
            Ok(response) => response,
            Err(e) => return Err(self.transport_error(e).await),
        };
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(status_error(status, &body))
    }

    async fn transport_error(&self, err: reqwest::Error) -> SyncError {
        if err.is_timeout() {
            SyncError::Timeout(self.config.read().await.app().request_timeout)
        } else {
            SyncError::NetworkUnavailable(err.to_string())
        }
    }

    async fn json<T: DeserializeOwned>(&self, response: Response) -> Result<T> {
        match response.json::<T>().await {
            Ok(value) => Ok(value),
            Err(e) if e.is_decode() => Err(SharedError::serialization(e.to_string()).into()),
            Err(e) => Err(self.transport_error(e).await),
        }
    }

    async fn select<T: DeserializeOwned>(&self, table: &str, query: &[(&str, String)]) -> Result<Vec<T>> {
        let request = self
            .request(Method::GET, &format!("/rest/v1/{}", table))
            .await
            .query(&[("select", "*")])
            .query(query);
        let response = self.send(request).await?;
        self.json(response).await
    }

    async fn insert<B: Serialize + ?Sized, T: DeserializeOwned>(&self, table: &str, body: &B) -> Result<Vec<T>> {
        let request = self
            .request(Method::POST, &format!("/rest/v1/{}", table))
            .await
            .header("Prefer", "return=representation")
            .json(body);
        let response = self.send(request).await?;
        self.json(response).await
    }

    async fn insert_minimal<B: Serialize + ?Sized>(&self, table: &str, body: &B, prefer: &str) -> Result<()> {
        let request = self
            .request(Method::POST, &format!("/rest/v1/{}", table))
            .await
            .header("Prefer", prefer)
            .json(body);
        self.send(request).await?;
        Ok(())
    }

    async fn upsert<B: Serialize + ?Sized>(&self, table: &str, body: &B, on_conflict: &str) -> Result<()> {
        let request = self
            .request(Method::POST, &format!("/rest/v1/{}", table))
            .await
            .query(&[("on_conflict", on_conflict)])
            .header("Prefer", "resolution=merge-duplicates,return=minimal")
            .json(body);
        self.send(request).await?;
        Ok(())
    }

    /// Delete matching rows; `NotFound` when nothing matched
    async fn delete(&self, table: &str, query: &[(&str, String)]) -> Result<()> {
        let request = self
            .request(Method::DELETE, &format!("/rest/v1/{}", table))
            .await
            .header("Prefer", "return=representation")
            .query(query);
        let response = self.send(request).await?;
        let removed: Vec<serde_json::Value> = self.json(response).await?;
        if removed.is_empty() {
            return Err(SyncError::not_found(format!("no matching {} row", table)));
        }
        Ok(())
    }

    async fn store_session(&self, token: TokenResponse) -> Session {
        let session = Session {
            access_token: token.access_token,
            user_id: token.user.id,
            expires_at: token
                .expires_in
                .map(|secs| Utc::now() + chrono::Duration::seconds(secs)),
        };
        self.config.write().await.set_token(Some(session.access_token.clone()));
        *self.session.write().await = Some(session.clone());
        tracing::info!("[SYNC] signed in as {}", session.user_id);
        session
    }
}

#[async_trait]
impl BackendService for RestBackend {
    async fn get_conversation(&self, id: Uuid) -> Result<Conversation> {
        let rows: Vec<Conversation> = self.select("conversations", &[("id", eq(id))]).await?;
        rows.into_iter()
            .next()
            .ok_or_else(|| SyncError::not_found(format!("conversation {}", id)))
    }

    async fn list_conversations_for(&self, user_id: Uuid) -> Result<Vec<Conversation>> {
        let refs: Vec<ConversationRef> = self
            .select("conversation_participants", &[("user_id", eq(user_id))])
            .await?;
        if refs.is_empty() {
            return Ok(Vec::new());
        }
        let ids: Vec<Uuid> = refs.iter().map(|r| r.conversation_id).collect();
        self.select(
            "conversations",
            &[("id", in_list(&ids)), ("order", "created_at.asc".to_string())],
        )
        .await
    }

    async fn create_conversation(&self, request: &CreateConversationRequest) -> Result<Conversation> {
        let rows: Vec<Conversation> = self.insert("conversations", request).await?;
        rows.into_iter()
            .next()
            .ok_or_else(|| SharedError::row("conversations", "insert returned no row").into())
    }

    async fn delete_conversation(&self, id: Uuid) -> Result<()> {
        self.delete("conversations", &[("id", eq(id))]).await
    }

    async fn list_participants(&self, conversation_id: Uuid) -> Result<Vec<Participant>> {
        self.select("conversation_participants", &[("conversation_id", eq(conversation_id))])
            .await
    }

    async fn add_participants(&self, rows: &[Participant]) -> Result<()> {
        if rows.is_empty() {
            return Ok(());
        }
        self.insert_minimal(
            "conversation_participants",
            rows,
            "resolution=ignore-duplicates,return=minimal",
        )
        .await
    }

    async fn remove_participant(&self, conversation_id: Uuid, user_id: Uuid) -> Result<()> {
        self.delete(
            "conversation_participants",
            &[("conversation_id", eq(conversation_id)), ("user_id", eq(user_id))],
        )
        .await
    }

    async fn list_messages(&self, conversation_id: Uuid) -> Result<Vec<ChatMessage>> {
        self.select(
            "messages",
            &[
                ("conversation_id", eq(conversation_id)),
                ("order", "created_at.asc,id.asc".to_string()),
            ],
        )
        .await
    }

    async fn latest_message(&self, conversation_id: Uuid) -> Result<Option<ChatMessage>> {
        let rows: Vec<ChatMessage> = self
            .select(
                "messages",
                &[
                    ("conversation_id", eq(conversation_id)),
                    ("order", "created_at.desc,id.desc".to_string()),
                    ("limit", "1".to_string()),
                ],
            )
            .await?;
        Ok(rows.into_iter().next())
    }

    async fn insert_message(&self, request: &SendMessageRequest) -> Result<ChatMessage> {
        let rows: Vec<ChatMessage> = self.insert("messages", request).await?;
        rows.into_iter()
            .next()
            .ok_or_else(|| SharedError::row("messages", "insert returned no row").into())
    }

    async fn count_unread(
        &self,
        conversation_id: Uuid,
        user_id: Uuid,
        after: Option<DateTime<Utc>>,
    ) -> Result<u32> {
        let mut query = vec![
            ("conversation_id", eq(conversation_id)),
            ("sender_id", format!("neq.{}", user_id)),
        ];
        if let Some(cursor) = after {
            query.push(("created_at", format!("gt.{}", timestamp(cursor))));
        }
        let request = self
            .request(Method::GET, "/rest/v1/messages")
            .await
            .query(&[("select", "id")])
            .query(&query);
        let response = self.send(request).await?;
        let rows: Vec<serde_json::Value> = self.json(response).await?;
        Ok(rows.len() as u32)
    }

    async fn list_reactions(&self, message_ids: &[MessageId]) -> Result<Vec<Reaction>> {
        if message_ids.is_empty() {
            return Ok(Vec::new());
        }
        self.select("message_reactions", &[("message_id", in_list(message_ids))])
            .await
    }

    async fn insert_reaction(&self, reaction: &Reaction) -> Result<()> {
        self.insert_minimal("message_reactions", reaction, "return=minimal").await
    }

    async fn delete_reaction(&self, reaction: &Reaction) -> Result<()> {
        self.delete(
            "message_reactions",
            &[
                ("message_id", eq(&reaction.message_id)),
                ("user_id", eq(reaction.user_id)),
                ("emoji", eq(&reaction.emoji)),
            ],
        )
        .await
    }

    async fn get_profiles(&self, ids: &[Uuid]) -> Result<Vec<Profile>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        self.select("profiles", &[("id", in_list(ids))]).await
    }

    async fn upsert_typing(&self, state: &TypingState) -> Result<()> {
        self.upsert("typing_indicators", state, "conversation_id,user_id").await
    }

    async fn list_read_cursors(&self, conversation_id: Uuid) -> Result<Vec<ReadCursor>> {
        self.select("conversation_views", &[("conversation_id", eq(conversation_id))])
            .await
    }

    async fn upsert_read_cursor(&self, cursor: &ReadCursor) -> Result<()> {
        self.upsert("conversation_views", cursor, "conversation_id,user_id").await
    }

    async fn list_favourites(&self, user_id: Uuid) -> Result<Vec<Uuid>> {
        let rows: Vec<ConversationRef> = self
            .select("favourite_conversations", &[("user_id", eq(user_id))])
            .await?;
        Ok(rows.into_iter().map(|r| r.conversation_id).collect())
    }

    async fn set_favourite(&self, user_id: Uuid, conversation_id: Uuid, favourite: bool) -> Result<()> {
        if favourite {
            let row = FavouriteRow { user_id, conversation_id };
            self.insert_minimal(
                "favourite_conversations",
                &row,
                "resolution=ignore-duplicates,return=minimal",
            )
            .await
        } else {
            match self
                .delete(
                    "favourite_conversations",
                    &[("user_id", eq(user_id)), ("conversation_id", eq(conversation_id))],
                )
                .await
            {
                Err(SyncError::NotFound(_)) => Ok(()),
                other => other,
            }
        }
    }

    async fn list_blocked(&self, user_id: Uuid) -> Result<Vec<Uuid>> {
        let rows: Vec<BlockedRef> = self.select("blocked_users", &[("blocker_id", eq(user_id))]).await?;
        Ok(rows.into_iter().map(|r| r.blocked_id).collect())
    }

    async fn set_blocked(&self, user_id: Uuid, blocked_id: Uuid, blocked: bool) -> Result<()> {
        if blocked {
            let row = BlockRow {
                blocker_id: user_id,
                blocked_id,
            };
            self.insert_minimal("blocked_users", &row, "resolution=ignore-duplicates,return=minimal")
                .await
        } else {
            match self
                .delete(
                    "blocked_users",
                    &[("blocker_id", eq(user_id)), ("blocked_id", eq(blocked_id))],
                )
                .await
            {
                Err(SyncError::NotFound(_)) => Ok(()),
                other => other,
            }
        }
    }

    async fn insert_group_notifications(&self, rows: &[GroupNotification]) -> Result<()> {
        if rows.is_empty() {
            return Ok(());
        }
        self.insert_minimal("group_notifications", rows, "return=minimal").await
    }

    async fn upload(&self, bucket: &str, key: &str, bytes: Bytes, content_type: &str) -> Result<String> {
        let request = self
            .request(Method::POST, &format!("/storage/v1/object/{}/{}", bucket, key))
            .await
            .header("Content-Type", content_type)
            .header("x-upsert", "true")
            .body(bytes);
        self.send(request).await?;
        let public_url = self
            .config
            .read()
            .await
            .api_url(&format!("/storage/v1/object/public/{}/{}", bucket, key));
        Ok(public_url)
    }

    async fn subscribe(&self, entity: EntityKind, filter: Option<RowFilter>) -> Result<ChangeStream> {
        let path = format!("/realtime/v1/{}", entity.table());
        let mut request = {
            let config = self.config.read().await;
            let mut request = self
                .client
                .get(config.api_url(&path))
                .header("Accept", "text/event-stream");
            if let Some(key) = config.app().anon_key.as_deref() {
                request = request.header("apikey", key);
            }
            if let Some(bearer) = config.bearer() {
                request = request.header("Authorization", format!("Bearer {}", bearer));
            }
            request
        };
        if let Some(filter) = &filter {
            request = request.query(&[(filter.column, format!("eq.{}", filter.value))]);
        }

        tracing::info!("[BUS] subscribing to {} change feed", entity.table());
        let response = self.send(request).await?;

        let body = Box::pin(response.bytes_stream());
        let stream = futures_util::stream::unfold(
            (body, SseDecoder::default(), VecDeque::<String>::new()),
            |(mut body, mut decoder, mut pending)| async move {
                loop {
                    if let Some(data) = pending.pop_front() {
                        let item = serde_json::from_str::<ChangeEvent>(&data).map_err(SyncError::from);
                        return Some((item, (body, decoder, pending)));
                    }
                    match body.next().await {
                        Some(Ok(chunk)) => pending.extend(decoder.push(&chunk)),
                        Some(Err(e)) => {
                            let err = SyncError::NetworkUnavailable(format!("change feed: {}", e));
                            return Some((Err(err), (body, decoder, pending)));
                        }
                        None => return None,
                    }
                }
            },
        );
        Ok(Box::pin(stream))
    }
}

#[async_trait]
impl AuthProvider for RestBackend {
    async fn sign_up(&self, request: &SignUpRequest) -> Result<()> {
        let body = serde_json::json!({
            "email": request.email,
            "password": request.password,
            "data": {
                "username": request.username,
                "full_name": request.full_name,
            },
        });
        let request = self.request(Method::POST, "/auth/v1/signup").await.json(&body);
        self.send(request).await?;
        Ok(())
    }

    async fn sign_in(&self, email: &str, password: &str) -> Result<Session> {
        let body = serde_json::json!({ "email": email, "password": password });
        let request = self
            .request(Method::POST, "/auth/v1/token")
            .await
            .query(&[("grant_type", "password")])
            .json(&body);
        let response = self.send(request).await?;
        let token: TokenResponse = self.json(response).await?;
        Ok(self.store_session(token).await)
    }

    async fn verify_otp(&self, email: &str, code: &str) -> Result<Session> {
        super::validate_otp_code(code)?;
        let body = serde_json::json!({ "type": "email", "email": email, "token": code });
        let request = self.request(Method::POST, "/auth/v1/verify").await.json(&body);
        let response = self.send(request).await?;
        let token: TokenResponse = self.json(response).await?;
        Ok(self.store_session(token).await)
    }

    async fn reset_password(&self, email: &str) -> Result<()> {
        let body = serde_json::json!({ "email": email });
        let request = self.request(Method::POST, "/auth/v1/recover").await.json(&body);
        self.send(request).await?;
        Ok(())
    }

    async fn session(&self) -> Result<Option<Session>> {
        Ok(self.session.read().await.clone())
    }

    async fn sign_out(&self) -> Result<()> {
        let request = self.request(Method::POST, "/auth/v1/logout").await;
        let result = self.send(request).await;
        self.config.write().await.clear_token();
        *self.session.write().await = None;
        match result {
            Ok(_) | Err(SyncError::PermissionDenied(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }
}
