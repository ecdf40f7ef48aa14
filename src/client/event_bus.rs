//! # Event Bus Client
//!
//! Keeps one change-feed subscription per open conversation and forwards
//! every change to the engine's inbound channel, tagged with the
//! conversation it was subscribed for.
//!
//! ## Behaviour
//!
//! - Each conversation subscribes to its scoped tables (filtered by
//!   conversation id) plus the unscoped reaction and profile feeds
//! - Streams are merged; order is only preserved within one table
//! - A dropped or failed subscription reports `Disconnected`/`Retrying`,
//!   waits with exponential backoff, and resubscribes. Every `Connected`
//!   tells the engine the view may have drifted and needs a resnapshot
//! - Unsubscribing aborts the task; nothing is delivered afterwards

use std::collections::HashMap;
use std::sync::Arc;

use futures_util::StreamExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::client::backend::{BackendService, ChangeStream, RowFilter};
use crate::client::engine::EngineInput;
use crate::client::error::Result;
use crate::client::retry::BackoffStrategy;
use crate::shared::event::{ChangeEvent, EntityKind};

/// Subscription status reported by the bus
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubscriptionStatus {
    Connecting,
    Connected,
    Retrying,
    Error(String),
    Disconnected,
}

/// What a subscription delivers to the engine
#[derive(Debug, Clone, PartialEq)]
pub enum BusMessage {
    Status(SubscriptionStatus),
    Event(ChangeEvent),
}

/// Tables one open conversation listens to
pub fn conversation_entities() -> Vec<EntityKind> {
    let mut entities = EntityKind::CONVERSATION_SCOPED.to_vec();
    entities.push(EntityKind::Reaction);
    entities.push(EntityKind::Profile);
    entities
}

/// Per-conversation change-feed subscriptions
pub struct EventBus {
    backend: Arc<dyn BackendService>,
    backoff: BackoffStrategy,
    inbound: mpsc::UnboundedSender<EngineInput>,
    subscriptions: HashMap<Uuid, JoinHandle<()>>,
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("backoff", &self.backoff)
            .field("subscriptions", &self.subscriptions.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl EventBus {
    pub fn new(
        backend: Arc<dyn BackendService>,
        backoff: BackoffStrategy,
        inbound: mpsc::UnboundedSender<EngineInput>,
    ) -> Self {
        Self {
            backend,
            backoff,
            inbound,
            subscriptions: HashMap::new(),
        }
    }

    /// Start delivering changes of a conversation. Idempotent.
    pub fn subscribe(&mut self, conversation_id: Uuid) {
        if let Some(handle) = self.subscriptions.get(&conversation_id) {
            if !handle.is_finished() {
                return;
            }
        }
        let task = run_subscription(
            self.backend.clone(),
            conversation_id,
            conversation_entities(),
            self.backoff.clone(),
            self.inbound.clone(),
        );
        self.subscriptions.insert(conversation_id, tokio::spawn(task));
    }

    /// Stop delivering changes of a conversation
    pub fn unsubscribe(&mut self, conversation_id: Uuid) -> bool {
        match self.subscriptions.remove(&conversation_id) {
            Some(handle) => {
                handle.abort();
                tracing::info!("[BUS] unsubscribed from conversation {}", conversation_id);
                true
            }
            None => false,
        }
    }

    pub fn is_subscribed(&self, conversation_id: Uuid) -> bool {
        self.subscriptions.contains_key(&conversation_id)
    }

    /// Abort every subscription
    pub fn shutdown(&mut self) {
        for (_, handle) in self.subscriptions.drain() {
            handle.abort();
        }
    }
}

impl Drop for EventBus {
    fn drop(&mut self) {
        self.shutdown();
    }
}

async fn open_streams(
    backend: &dyn BackendService,
    conversation_id: Uuid,
    entities: &[EntityKind],
) -> Result<Vec<ChangeStream>> {
    let mut streams = Vec::with_capacity(entities.len());
    for entity in entities {
        let filter = entity
            .conversation_column()
            .map(|column| RowFilter::eq(column, conversation_id));
        streams.push(backend.subscribe(*entity, filter).await?);
    }
    Ok(streams)
}

/// Subscription loop of one conversation; ends only when the engine is gone
/// or the task is aborted.
async fn run_subscription(
    backend: Arc<dyn BackendService>,
    conversation_id: Uuid,
    entities: Vec<EntityKind>,
    backoff: BackoffStrategy,
    inbound: mpsc::UnboundedSender<EngineInput>,
) {
    let deliver = |message: BusMessage| {
        inbound
            .send(EngineInput::Bus {
                conversation_id,
                message,
            })
            .is_ok()
    };
    let mut attempt: u32 = 0;

    loop {
        if !deliver(BusMessage::Status(SubscriptionStatus::Connecting)) {
            return;
        }

        match open_streams(backend.as_ref(), conversation_id, &entities).await {
            Ok(streams) => {
                tracing::info!("[BUS] subscription established for conversation {}", conversation_id);
                attempt = 0;
                if !deliver(BusMessage::Status(SubscriptionStatus::Connected)) {
                    return;
                }

                let mut merged = futures_util::stream::select_all(streams);
                while let Some(item) = merged.next().await {
                    match item {
                        Ok(event) => {
                            tracing::debug!(
                                "[BUS] {} {:?} for conversation {}",
                                event.entity.table(),
                                event.op,
                                conversation_id
                            );
                            if !deliver(BusMessage::Event(event)) {
                                return;
                            }
                        }
                        Err(e) if e.is_transient() => {
                            tracing::warn!("[BUS] change feed for {} failed: {}", conversation_id, e);
                            break;
                        }
                        Err(e) => {
                            tracing::warn!("[BUS] skipping undecodable change for {}: {}", conversation_id, e);
                        }
                    }
                }

                tracing::warn!("[BUS] change feed for {} lost, will resubscribe", conversation_id);
                if !deliver(BusMessage::Status(SubscriptionStatus::Disconnected)) {
                    return;
                }
            }
            Err(e) => {
                tracing::warn!("[BUS] failed to subscribe to {} (will retry): {}", conversation_id, e);
                if !deliver(BusMessage::Status(SubscriptionStatus::Error(e.to_string()))) {
                    return;
                }
            }
        }

        attempt = attempt.saturating_add(1);
        if !deliver(BusMessage::Status(SubscriptionStatus::Retrying)) {
            return;
        }
        tokio::time::sleep(backoff.delay(attempt)).await;
    }
}
