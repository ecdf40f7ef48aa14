//! Optimistic send scenarios

use std::time::Duration;

use bytes::Bytes;
use chrono::Utc;

use chatsync::client::backend::InjectedFailure;
use chatsync::client::outbox::ATTACHMENT_BUCKET;
use chatsync::client::{EngineSignal, EntryState, SyncError};
use chatsync::shared::messaging::{MessageId, MessageType, ReadStatus};

use crate::common::*;

#[tokio::test]
async fn test_optimistic_send_is_replaced_in_place() {
    let world = World::direct().await;
    let mut alice = world.opened(world.alice).await;
    let conv = world.conversation;

    let temp_id = crate::assert_ok!(alice.send_message(conv, "hello", None).await);
    assert_eq!(temp_id, MessageId::from("tmp-1"));

    let state = alice.snapshot(conv).unwrap();
    assert_eq!(state.messages().len(), 1);
    assert_eq!(state.messages()[0].state, EntryState::Pending);
    assert_eq!(alice.message_status(conv, &temp_id).unwrap(), ReadStatus::Pending);

    assert!(
        wait_until(&mut alice, EVENTUALLY, |e| {
            e.snapshot(conv)
                .is_some_and(|s| s.messages().iter().all(|m| !m.is_optimistic()) && !s.messages().is_empty())
        })
        .await
    );
    alice.settle(QUIET).await;

    let state = alice.snapshot(conv).unwrap();
    assert_eq!(state.messages().len(), 1);
    let confirmed = &state.messages()[0];
    assert!(!confirmed.id().is_temporary());
    crate::assert_bodies!(state, ["hello"]);

    let stored = world.backend.messages(conv).await;
    assert_eq!(stored.len(), 1);
    assert_eq!(&stored[0].id, confirmed.id());
}

#[tokio::test]
async fn test_sends_are_delivered_in_order() {
    let world = World::direct().await;
    let mut alice = world.opened(world.alice).await;
    let conv = world.conversation;

    for body in ["one", "two", "three"] {
        alice.send_message(conv, body, None).await.unwrap();
    }
    assert!(
        wait_until(&mut alice, EVENTUALLY, |e| e.pending_sends().total == 0).await
    );
    alice.settle(QUIET).await;

    let state = alice.snapshot(conv).unwrap();
    crate::assert_bodies!(state, ["one", "two", "three"]);
    let stored: Vec<String> = world
        .backend
        .messages(conv)
        .await
        .iter()
        .map(|m| m.body().to_string())
        .collect();
    assert_eq!(stored, vec!["one", "two", "three"]);
}

#[tokio::test]
async fn test_counterpart_receives_message() {
    let world = World::direct().await;
    let mut alice = world.opened(world.alice).await;
    let mut bob = world.opened(world.bob).await;
    let conv = world.conversation;

    alice.send_message(conv, "are you there?", None).await.unwrap();
    alice.settle(QUIET).await;

    assert!(
        wait_until(&mut bob, EVENTUALLY, |e| {
            e.snapshot(conv).is_some_and(|s| s.messages().len() == 1)
        })
        .await
    );
    let state = bob.snapshot(conv).unwrap();
    crate::assert_bodies!(state, ["are you there?"]);
    assert_eq!(state.unread_count(world.bob), 1);
}

#[tokio::test]
async fn test_failed_send_is_kept_and_retried() {
    let world = World::direct().await;
    let mut alice = world.opened(world.alice).await;
    let mut signals = alice.subscribe_signals();
    let conv = world.conversation;

    world.backend.fail_next("insert_message", InjectedFailure::Network);
    let temp_id = alice.send_message(conv, "flaky", None).await.unwrap();

    assert!(
        wait_until(&mut alice, EVENTUALLY, |e| e.pending_sends().failed == 1).await
    );
    let state = alice.snapshot(conv).unwrap();
    assert!(matches!(state.message(&temp_id).unwrap().state, EntryState::Failed { .. }));
    assert_eq!(alice.message_status(conv, &temp_id).unwrap(), ReadStatus::Failed);
    let received = drain_signals(&mut signals);
    crate::assert_signal!(received, EngineSignal::SendFailed { .. });

    crate::assert_ok!(alice.retry_message(&temp_id));
    assert_eq!(alice.snapshot(conv).unwrap().message(&temp_id).unwrap().state, EntryState::Pending);
    assert!(
        wait_until(&mut alice, EVENTUALLY, |e| e.pending_sends().total == 0).await
    );
    alice.settle(QUIET).await;

    let state = alice.snapshot(conv).unwrap();
    assert!(!state.contains_message(&temp_id));
    crate::assert_bodies!(state, ["flaky"]);
    assert_eq!(world.backend.messages(conv).await.len(), 1);
}

#[tokio::test]
async fn test_failed_send_confirmed_by_echo_is_not_resent() {
    let world = World::direct().await;
    let mut alice = world.opened(world.alice).await;
    let conv = world.conversation;

    world.backend.fail_next("insert_message", InjectedFailure::Network);
    let temp_id = alice.send_message(conv, "hello", None).await.unwrap();
    assert!(
        wait_until(&mut alice, EVENTUALLY, |e| e.pending_sends().failed == 1).await
    );

    // the write landed after all and its row comes back on the feed
    world
        .backend
        .insert_remote_message(text("srv-1", conv, world.alice, "hello", Utc::now()))
        .await;
    assert!(
        wait_until(&mut alice, EVENTUALLY, |e| e.pending_sends().total == 0).await
    );
    let state = alice.snapshot(conv).unwrap();
    assert!(!state.contains_message(&temp_id));
    crate::assert_bodies!(state, ["hello"]);

    crate::assert_err!(alice.retry_message(&temp_id), SyncError::NotFound(_));
    crate::assert_err!(alice.discard_message(&temp_id), SyncError::NotFound(_));
    alice.settle(QUIET).await;

    assert_eq!(world.backend.messages(conv).await.len(), 1);
    assert_eq!(alice.pending_sends().total, 0);
    assert_eq!(alice.snapshot(conv).unwrap().messages().len(), 1);
}

#[tokio::test]
async fn test_failed_send_confirmed_by_resnapshot_is_not_resent() {
    let world = World::direct().await;
    let mut alice = world.opened(world.alice).await;
    let conv = world.conversation;

    world.backend.fail_next("insert_message", InjectedFailure::Network);
    let temp_id = alice.send_message(conv, "hello", None).await.unwrap();
    assert!(
        wait_until(&mut alice, EVENTUALLY, |e| e.pending_sends().failed == 1).await
    );

    // the row lands while the feed is down, so only the resnapshot sees it
    world.backend.set_offline(true);
    run_for(&mut alice, Duration::from_millis(200)).await;
    world
        .backend
        .insert_remote_message(text("srv-1", conv, world.alice, "hello", Utc::now()))
        .await;
    world.backend.set_offline(false);

    assert!(
        wait_until(&mut alice, EVENTUALLY, |e| e.pending_sends().total == 0).await
    );
    let srv = MessageId::from("srv-1");
    assert!(
        wait_until(&mut alice, EVENTUALLY, |e| {
            e.snapshot(conv).is_some_and(|s| s.contains_message(&srv) && !s.contains_message(&temp_id))
        })
        .await
    );

    crate::assert_err!(alice.retry_message(&temp_id), SyncError::NotFound(_));
    alice.settle(QUIET).await;
    assert_eq!(world.backend.messages(conv).await.len(), 1);
    assert_eq!(alice.snapshot(conv).unwrap().messages().len(), 1);
}

#[tokio::test]
async fn test_failed_send_can_be_discarded() {
    let world = World::direct().await;
    let mut alice = world.opened(world.alice).await;
    let conv = world.conversation;

    world.backend.fail_next("insert_message", InjectedFailure::PermissionDenied);
    let temp_id = alice.send_message(conv, "nope", None).await.unwrap();
    crate::assert_err!(alice.discard_message(&temp_id), SyncError::ValidationFailed(_));

    assert!(
        wait_until(&mut alice, EVENTUALLY, |e| e.pending_sends().failed == 1).await
    );
    crate::assert_ok!(alice.discard_message(&temp_id));
    assert!(alice.snapshot(conv).unwrap().messages().is_empty());
    assert_eq!(alice.pending_sends().total, 0);
    crate::assert_err!(alice.retry_message(&temp_id), SyncError::NotFound(_));
}

#[tokio::test]
async fn test_reply_must_reference_known_message() {
    let world = World::direct().await;
    world
        .backend
        .insert_remote_message(text("m1", world.conversation, world.bob, "question", at(1)))
        .await;
    let mut alice = world.opened(world.alice).await;
    let conv = world.conversation;

    crate::assert_err!(
        alice.send_message(conv, "answer", Some(MessageId::from("missing"))).await,
        SyncError::NotFound(_)
    );
    let temp_id = alice
        .send_message(conv, "answer", Some(MessageId::from("m1")))
        .await
        .unwrap();
    let state = alice.snapshot(conv).unwrap();
    assert_eq!(
        state.message(&temp_id).unwrap().message.reply_to,
        Some(MessageId::from("m1"))
    );
}

#[tokio::test]
async fn test_attachment_is_uploaded_before_insert() {
    let world = World::direct().await;
    let mut alice = world.opened(world.alice).await;
    let conv = world.conversation;

    crate::assert_err!(
        alice
            .send_attachment(conv, MessageType::Text, "cat.png", Bytes::from_static(b"png"), None)
            .await,
        SyncError::ValidationFailed(_)
    );
    crate::assert_err!(
        alice
            .send_attachment(conv, MessageType::Image, "cat.png", Bytes::new(), None)
            .await,
        SyncError::ValidationFailed(_)
    );

    alice
        .send_attachment(conv, MessageType::Image, "cat.png", Bytes::from_static(b"png"), None)
        .await
        .unwrap();
    assert!(
        wait_until(&mut alice, EVENTUALLY, |e| e.pending_sends().total == 0).await
    );

    let stored = world.backend.messages(conv).await;
    assert_eq!(stored.len(), 1);
    assert_eq!(stored[0].message_type, MessageType::Image);
    assert_eq!(stored[0].file_name.as_deref(), Some("cat.png"));
    let url = stored[0].file_url.clone().unwrap();
    let key = url
        .strip_prefix(&format!("memory://storage/{}/", ATTACHMENT_BUCKET))
        .unwrap();
    assert!(key.starts_with(&world.conversation.to_string()));
    assert!(key.ends_with(".png"));
    assert_eq!(
        world.backend.object(ATTACHMENT_BUCKET, key).await,
        Some(Bytes::from_static(b"png"))
    );
}
