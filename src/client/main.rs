/**
 * chatsync demo
 *
 * Two engines share one in-memory backend: alice sends, bob reads and
 * reacts, and both sides print what their local store sees.
 */

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use uuid::Uuid;

use chatsync::client::{Config, LocalDatabase, MemoryBackend, SyncEngine};
use chatsync::shared::messaging::{Conversation, Participant, Profile};

fn profile(id: Uuid, username: &str) -> Profile {
    Profile {
        id,
        username: username.to_string(),
        full_name: None,
        avatar_url: None,
        is_online: true,
        last_seen: None,
    }
}

fn print_view(who: &str, engine: &SyncEngine, conversation_id: Uuid) {
    let Some(state) = engine.snapshot(conversation_id) else {
        println!("[{}] conversation not open", who);
        return;
    };
    println!("[{}] {} messages", who, state.messages().len());
    for entry in state.messages() {
        let status = engine
            .message_status(conversation_id, entry.id())
            .map(|s| format!("{:?}", s))
            .unwrap_or_else(|e| e.to_string());
        let reactions: Vec<&str> = state.reactions(entry.id()).iter().map(|r| r.emoji.as_str()).collect();
        println!(
            "[{}]   {} {:<12} {:?} {}",
            who,
            entry.id(),
            entry.message.body(),
            reactions,
            status
        );
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load environment variables from .env file if present
    dotenv::dotenv().ok();

    let env_filter = std::env::var("RUST_LOG").unwrap_or_else(|_| "chatsync=debug,info".to_string());
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::new(&env_filter))
        .init();

    let config = Config::from_env()?;
    let backend = Arc::new(MemoryBackend::new());

    let (alice, bob) = (Uuid::new_v4(), Uuid::new_v4());
    let conversation_id = Uuid::new_v4();
    backend
        .seed_conversation(
            Conversation {
                id: conversation_id,
                is_group: false,
                group_name: None,
                avatar_url: None,
                created_by: Some(alice),
                created_at: Utc::now(),
                updated_at: None,
            },
            &[
                Participant::member(conversation_id, alice),
                Participant::member(conversation_id, bob),
            ],
        )
        .await;
    backend.seed_profile(profile(alice, "alice")).await;
    backend.seed_profile(profile(bob, "bob")).await;

    let mut alice_engine = SyncEngine::start(
        config.app().clone(),
        backend.clone(),
        LocalDatabase::in_memory().await?,
        alice,
    )
    .await?;
    let mut bob_engine =
        SyncEngine::start(config.app().clone(), backend.clone(), LocalDatabase::in_memory().await?, bob).await?;

    alice_engine.open_conversation(conversation_id).await?;
    bob_engine.open_conversation(conversation_id).await?;

    let quiet = Duration::from_millis(300);
    alice_engine.set_typing(conversation_id, true)?;
    let temp_id = alice_engine.send_message(conversation_id, "hi bob", None).await?;
    println!("[alice] queued {}", temp_id);
    print_view("alice", &alice_engine, conversation_id);

    alice_engine.settle(quiet).await;
    bob_engine.settle(quiet).await;
    print_view("alice", &alice_engine, conversation_id);

    if let Some(message_id) = bob_engine
        .snapshot(conversation_id)
        .and_then(|state| state.last_confirmed().map(|m| m.id.clone()))
    {
        bob_engine.toggle_reaction(conversation_id, &message_id, "👍")?;
    }
    bob_engine.mark_viewed(conversation_id).await?;
    bob_engine.settle(quiet).await;
    alice_engine.settle(quiet).await;

    print_view("bob", &bob_engine, conversation_id);
    print_view("alice", &alice_engine, conversation_id);

    for summary in alice_engine.conversation_list().await? {
        println!(
            "[alice] chat with {} ({} unread): {}",
            summary.title,
            summary.unread_count,
            summary.last_message_preview.unwrap_or_default()
        );
    }

    alice_engine.shutdown();
    bob_engine.shutdown();
    Ok(())
}
