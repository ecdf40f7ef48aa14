//! Read cursor, read status and typing scenarios

use std::time::Duration;

use chatsync::client::backend::{BackendService, InjectedFailure};
use chatsync::shared::messaging::{MessageId, ReadCursor, ReadStatus};

use crate::common::*;

#[tokio::test]
async fn test_read_status_follows_counterpart_cursor() {
    let world = World::direct().await;
    let conv = world.conversation;
    for secs in 1..=3 {
        world
            .backend
            .insert_remote_message(text(&format!("m{}", secs), conv, world.alice, "x", at(secs)))
            .await;
    }
    world
        .backend
        .upsert_read_cursor(&ReadCursor {
            conversation_id: conv,
            user_id: world.bob,
            last_viewed_at: at(2),
        })
        .await
        .unwrap();

    let mut alice = world.opened(world.alice).await;
    let statuses: Vec<ReadStatus> = ["m1", "m2", "m3"]
        .iter()
        .map(|id| alice.message_status(conv, &MessageId::from(*id)).unwrap())
        .collect();
    assert_eq!(statuses, vec![ReadStatus::Read, ReadStatus::Read, ReadStatus::Sent]);

    let mut bob = world.opened(world.bob).await;
    assert_eq!(bob.snapshot(conv).unwrap().unread_count(world.bob), 1);
    bob.mark_viewed(conv).await.unwrap();
    assert_eq!(bob.snapshot(conv).unwrap().unread_count(world.bob), 0);

    assert!(
        wait_until(&mut alice, EVENTUALLY, |e| {
            e.message_status(conv, &MessageId::from("m3")).ok() == Some(ReadStatus::Read)
        })
        .await
    );
}

#[tokio::test]
async fn test_repeated_views_collapse_to_one_write() {
    let world = World::direct().await;
    let conv = world.conversation;
    world
        .backend
        .insert_remote_message(text("m1", conv, world.alice, "x", at(1)))
        .await;
    let mut bob = world.opened(world.bob).await;

    for _ in 0..5 {
        bob.mark_viewed(conv).await.unwrap();
    }
    bob.settle(Duration::from_millis(600)).await;

    assert_eq!(world.backend.call_count("upsert_read_cursor"), 1);
    let cursor = world.backend.read_cursor(conv, world.bob).await.unwrap();
    assert!(cursor.last_viewed_at >= at(1));
}

#[tokio::test]
async fn test_cursor_survives_in_local_store() {
    let world = World::direct().await;
    let conv = world.conversation;
    world
        .backend
        .insert_remote_message(text("m1", conv, world.alice, "x", at(1)))
        .await;
    let mut bob = world.opened(world.bob).await;

    world
        .backend
        .fail_next("upsert_read_cursor", InjectedFailure::PermissionDenied);
    bob.mark_viewed(conv).await.unwrap();
    bob.settle(QUIET).await;
    assert!(world.backend.read_cursor(conv, world.bob).await.is_none());

    bob.close_conversation(conv);
    assert!(!bob.is_open(conv));
    bob.open_conversation(conv).await.unwrap();
    assert_eq!(bob.snapshot(conv).unwrap().unread_count(world.bob), 0);
}

#[tokio::test]
async fn test_typing_shows_then_clears_after_quiet_period() {
    let world = World::direct().await;
    let conv = world.conversation;
    let mut alice = world.opened(world.alice).await;
    let mut bob = world.opened(world.bob).await;

    alice.set_typing(conv, true).unwrap();
    assert!(
        wait_until(&mut bob, EVENTUALLY, |e| {
            e.typing_users(conv).map(|users| users == vec![world.alice]).unwrap_or(false)
        })
        .await
    );
    assert!(alice.typing_users(conv).unwrap().is_empty());

    // quiet period elapses without keystrokes
    alice.settle(Duration::from_millis(500)).await;
    let state = world.backend.typing_state(conv, world.alice).await.unwrap();
    assert!(!state.is_typing);

    assert!(
        wait_until(&mut bob, EVENTUALLY, |e| {
            e.typing_users(conv).map(|users| users.is_empty()).unwrap_or(false)
        })
        .await
    );
}

#[tokio::test]
async fn test_sending_clears_typing() {
    let world = World::direct().await;
    let conv = world.conversation;
    let mut alice = world.opened(world.alice).await;

    alice.set_typing(conv, true).unwrap();
    alice.send_message(conv, "done typing", None).await.unwrap();
    alice.settle(QUIET).await;

    let state = world.backend.typing_state(conv, world.alice).await.unwrap();
    assert!(!state.is_typing);
}

#[tokio::test]
async fn test_conversation_list_counts_unread_and_sorts() {
    let world = World::direct().await;
    let conv = world.conversation;
    for secs in 1..=2 {
        world
            .backend
            .insert_remote_message(text(&format!("m{}", secs), conv, world.alice, "hey there", at(secs)))
            .await;
    }
    let mut bob = world.engine(world.bob).await;
    let other = bob.find_or_create_direct(uuid::Uuid::new_v4()).await.unwrap();

    let list = bob.conversation_list().await.unwrap();
    assert_eq!(list.len(), 2);
    // the new conversation is the most recent activity
    assert_eq!(list[0].id, other);
    assert_eq!(list[0].unread_count, 0);
    let direct = &list[1];
    assert_eq!(direct.id, conv);
    assert_eq!(direct.title, "alice");
    assert!(direct.is_online);
    assert_eq!(direct.unread_count, 2);
    assert_eq!(direct.last_message_preview.as_deref(), Some("hey there"));

    bob.set_favourite(conv, true).await.unwrap();
    let list = bob.conversation_list().await.unwrap();
    assert_eq!(list[0].id, conv);
    assert!(list[0].is_favourite);
    assert!(!list[1].is_favourite);
}
