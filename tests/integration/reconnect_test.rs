//! Disconnect, resubscribe and resnapshot scenarios

use std::time::Duration;

use chrono::Utc;
use uuid::Uuid;

use chatsync::client::backend::InjectedFailure;
use chatsync::client::{EngineSignal, EntryState, SubscriptionStatus, SyncError};
use chatsync::shared::messaging::MessageId;

use crate::common::*;

#[tokio::test]
async fn test_missed_events_are_recovered_by_resnapshot() {
    let world = World::direct().await;
    let conv = world.conversation;
    let mut alice = world.opened(world.alice).await;
    let mut signals = alice.subscribe_signals();

    world.backend.set_offline(true);
    run_for(&mut alice, Duration::from_millis(200)).await;
    world
        .backend
        .insert_remote_message(text("m-missed", conv, world.bob, "while you were away", Utc::now()))
        .await;
    run_for(&mut alice, Duration::from_millis(200)).await;
    assert!(alice.snapshot(conv).unwrap().messages().is_empty());

    world.backend.set_offline(false);
    let missed = MessageId::from("m-missed");
    assert!(
        wait_until(&mut alice, EVENTUALLY, |e| {
            e.snapshot(conv).is_some_and(|s| s.contains_message(&missed))
        })
        .await
    );

    let received = drain_signals(&mut signals);
    crate::assert_signal!(
        received,
        EngineSignal::ConnectionChanged {
            status: SubscriptionStatus::Retrying,
            ..
        }
    );
    crate::assert_signal!(received, EngineSignal::Resynced(_));
}

#[tokio::test]
async fn test_live_events_flow_again_after_reconnect() {
    let world = World::direct().await;
    let conv = world.conversation;
    let mut alice = world.opened(world.alice).await;

    world.backend.drop_subscriptions();
    run_for(&mut alice, Duration::from_millis(300)).await;

    world
        .backend
        .insert_remote_message(text("m-live", conv, world.bob, "back again", Utc::now()))
        .await;
    let live = MessageId::from("m-live");
    assert!(
        wait_until(&mut alice, EVENTUALLY, |e| {
            e.snapshot(conv).is_some_and(|s| s.contains_message(&live))
        })
        .await
    );
    assert_eq!(alice.snapshot(conv).unwrap().messages().len(), 1);
}

#[tokio::test]
async fn test_unconfirmed_send_survives_resnapshot() {
    let world = World::direct().await;
    let conv = world.conversation;
    let mut alice = world.opened(world.alice).await;
    let mut signals = alice.subscribe_signals();

    world.backend.fail_next("insert_message", InjectedFailure::Hang);
    let temp_id = alice.send_message(conv, "stuck", None).await.unwrap();

    world.backend.drop_subscriptions();
    run_for(&mut alice, Duration::from_millis(500)).await;

    crate::assert_signal!(drain_signals(&mut signals), EngineSignal::Resynced(_));
    let state = alice.snapshot(conv).unwrap();
    assert_eq!(state.message(&temp_id).unwrap().state, EntryState::Pending);

    // the hung request hits the request timeout
    assert!(
        wait_until(&mut alice, EVENTUALLY, |e| e.pending_sends().failed == 1).await
    );
    alice.retry_message(&temp_id).unwrap();
    assert!(
        wait_until(&mut alice, EVENTUALLY, |e| e.pending_sends().total == 0).await
    );
    alice.settle(QUIET).await;
    let state = alice.snapshot(conv).unwrap();
    crate::assert_bodies!(state, ["stuck"]);
}

#[tokio::test]
async fn test_removed_user_is_signalled_and_closed() {
    let world = World::group(&[]).await;
    let conv = world.conversation;
    let mut bob = world.opened(world.bob).await;
    let mut signals = bob.subscribe_signals();

    let mut alice = world.engine(world.alice).await;
    alice.remove_member(conv, world.bob).await.unwrap();

    assert!(wait_until(&mut bob, EVENTUALLY, |e| !e.is_open(conv)).await);
    crate::assert_signal!(drain_signals(&mut signals), EngineSignal::RemovedFromConversation(_));
    crate::assert_err!(bob.send_message(conv, "hello?", None).await, SyncError::NotFound(_));
}

#[tokio::test]
async fn test_deleted_conversation_is_signalled() {
    let world = World::group(&[]).await;
    let conv = world.conversation;
    let mut bob = world.opened(world.bob).await;
    let mut signals = bob.subscribe_signals();

    let mut alice = world.engine(world.alice).await;
    alice.delete_group(conv).await.unwrap();

    assert!(wait_until(&mut bob, EVENTUALLY, |e| !e.is_open(conv)).await);
    crate::assert_signal!(drain_signals(&mut signals), EngineSignal::ConversationDeleted(_));
}

#[tokio::test]
async fn test_open_as_non_participant_is_denied() {
    let world = World::direct().await;
    let mut stranger = world.engine(Uuid::new_v4()).await;

    crate::assert_err!(
        stranger.open_conversation(world.conversation).await,
        SyncError::PermissionDenied(_)
    );
    assert!(!stranger.is_open(world.conversation));
    crate::assert_err!(
        stranger.open_conversation(Uuid::new_v4()).await,
        SyncError::NotFound(_)
    );
}
