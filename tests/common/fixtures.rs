//! Test fixtures
//!
//! `World` seeds a `MemoryBackend` with users, profiles and one
//! conversation. Engines run on real time with short timers; sqlite work
//! happens on its own thread, so paused clocks are not used here.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use tokio::sync::broadcast;
use tokio::time::Instant;
use uuid::Uuid;

use chatsync::client::{EngineSignal, LocalDatabase, MemoryBackend, SyncEngine};
use chatsync::shared::messaging::{ChatMessage, Conversation, MessageId, Participant, Profile};
use chatsync::shared::AppConfig;

/// Generous bound for anything that should happen "soon"
pub const EVENTUALLY: Duration = Duration::from_secs(3);
/// Quiet period after which an engine is considered idle
pub const QUIET: Duration = Duration::from_millis(250);

pub fn test_config() -> AppConfig {
    AppConfig::builder()
        .request_timeout(Duration::from_secs(2))
        .read_debounce(Duration::from_millis(300))
        .typing_quiet_period(Duration::from_millis(200))
        .typing_ttl(Duration::from_secs(5))
        .resubscribe_delays(Duration::from_millis(20), Duration::from_millis(100))
        .build()
        .unwrap()
}

/// Fixed point in the past plus `secs`
pub fn at(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
}

pub fn profile(id: Uuid, username: &str, online: bool) -> Profile {
    Profile {
        id,
        username: username.to_string(),
        full_name: None,
        avatar_url: None,
        is_online: online,
        last_seen: None,
    }
}

pub fn text(id: &str, conversation_id: Uuid, sender: Uuid, body: &str, created_at: DateTime<Utc>) -> ChatMessage {
    ChatMessage::new_text(MessageId::from(id), conversation_id, sender, body, created_at)
}

/// Seeded backend shared by every engine of a scenario
pub struct World {
    pub backend: Arc<MemoryBackend>,
    pub alice: Uuid,
    pub bob: Uuid,
    pub conversation: Uuid,
}

impl World {
    /// Direct conversation between alice and bob; bob is offline
    pub async fn direct() -> Self {
        let world = Self::bare();
        world
            .backend
            .seed_conversation(
                Conversation {
                    id: world.conversation,
                    is_group: false,
                    group_name: None,
                    avatar_url: None,
                    created_by: Some(world.alice),
                    created_at: at(0),
                    updated_at: None,
                },
                &[
                    Participant::member(world.conversation, world.alice),
                    Participant::member(world.conversation, world.bob),
                ],
            )
            .await;
        world.seed_profiles().await;
        world
    }

    /// Group named "Crew" with alice as admin plus bob and `extra`
    pub async fn group(extra: &[Uuid]) -> Self {
        let world = Self::bare();
        let mut roster = vec![
            Participant::admin(world.conversation, world.alice),
            Participant::member(world.conversation, world.bob),
        ];
        roster.extend(extra.iter().map(|user| Participant::member(world.conversation, *user)));
        world
            .backend
            .seed_conversation(
                Conversation {
                    id: world.conversation,
                    is_group: true,
                    group_name: Some("Crew".to_string()),
                    avatar_url: None,
                    created_by: Some(world.alice),
                    created_at: at(0),
                    updated_at: None,
                },
                &roster,
            )
            .await;
        world.seed_profiles().await;
        for (i, user) in extra.iter().enumerate() {
            world.backend.seed_profile(profile(*user, &format!("extra{}", i), false)).await;
        }
        world
    }

    fn bare() -> Self {
        Self {
            backend: Arc::new(MemoryBackend::new()),
            alice: Uuid::new_v4(),
            bob: Uuid::new_v4(),
            conversation: Uuid::new_v4(),
        }
    }

    async fn seed_profiles(&self) {
        self.backend.seed_profile(profile(self.alice, "alice", true)).await;
        self.backend.seed_profile(profile(self.bob, "bob", false)).await;
    }

    pub async fn engine(&self, user: Uuid) -> SyncEngine {
        let db = LocalDatabase::in_memory().await.unwrap();
        SyncEngine::start(test_config(), self.backend.clone(), db, user).await.unwrap()
    }

    /// Engine with the shared conversation open and its subscription live
    pub async fn opened(&self, user: Uuid) -> SyncEngine {
        let mut engine = self.engine(user).await;
        engine.open_conversation(self.conversation).await.unwrap();
        engine.settle(QUIET).await;
        engine
    }
}

/// Drive `engine` until `done` holds or `limit` elapses
pub async fn wait_until<F>(engine: &mut SyncEngine, limit: Duration, mut done: F) -> bool
where
    F: FnMut(&SyncEngine) -> bool,
{
    let deadline = Instant::now() + limit;
    loop {
        if done(engine) {
            return true;
        }
        let now = Instant::now();
        if now >= deadline {
            return false;
        }
        let _ = tokio::time::timeout(deadline - now, engine.process_next()).await;
    }
}

/// Every signal received so far
pub fn drain_signals(signals: &mut broadcast::Receiver<EngineSignal>) -> Vec<EngineSignal> {
    let mut out = Vec::new();
    loop {
        match signals.try_recv() {
            Ok(signal) => out.push(signal),
            Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
            Err(_) => return out,
        }
    }
}

/// Drive `engine` for exactly `period`, whatever arrives
pub async fn run_for(engine: &mut SyncEngine, period: Duration) {
    let deadline = Instant::now() + period;
    loop {
        let now = Instant::now();
        if now >= deadline {
            return;
        }
        let _ = tokio::time::timeout(deadline - now, engine.process_next()).await;
    }
}
