//! Reaction toggle scenarios

use uuid::Uuid;

use chatsync::client::backend::InjectedFailure;
use chatsync::client::{BackendService, EngineSignal};
use chatsync::shared::messaging::{MessageId, Reaction};

use crate::common::*;

async fn world_with_message() -> World {
    let world = World::direct().await;
    world
        .backend
        .insert_remote_message(text("m1", world.conversation, world.bob, "lunch?", at(1)))
        .await;
    world
}

#[tokio::test]
async fn test_double_toggle_settles_on_absent() {
    let world = world_with_message().await;
    let mut alice = world.opened(world.alice).await;
    let conv = world.conversation;
    let m1 = MessageId::from("m1");

    assert!(alice.toggle_reaction(conv, &m1, "👍").unwrap());
    assert!(!alice.toggle_reaction(conv, &m1, "👍").unwrap());
    assert!(alice.snapshot(conv).unwrap().reactions(&m1).is_empty());

    alice.settle(QUIET).await;

    assert!(alice.snapshot(conv).unwrap().reactions(&m1).is_empty());
    assert!(world.backend.reactions().await.is_empty());
}

#[tokio::test]
async fn test_reaction_reaches_the_other_side() {
    let world = world_with_message().await;
    let mut alice = world.opened(world.alice).await;
    let mut bob = world.opened(world.bob).await;
    let conv = world.conversation;
    let m1 = MessageId::from("m1");

    alice.toggle_reaction(conv, &m1, "🎉").unwrap();
    alice.settle(QUIET).await;

    assert!(
        wait_until(&mut bob, EVENTUALLY, |e| {
            e.snapshot(conv).is_some_and(|s| s.reactions(&m1).len() == 1)
        })
        .await
    );
    let counts = bob.reaction_counts(conv, &m1).unwrap();
    assert_eq!(counts.len(), 1);
    assert_eq!(counts[0].emoji, "🎉");
    assert_eq!(counts[0].count, 1);
    assert!(!counts[0].reacted_by_me);

    let mine = alice.reaction_counts(conv, &m1).unwrap();
    assert!(mine[0].reacted_by_me);
}

#[tokio::test]
async fn test_rejected_reaction_rolls_back_and_signals() {
    let world = world_with_message().await;
    let mut alice = world.opened(world.alice).await;
    let mut signals = alice.subscribe_signals();
    let conv = world.conversation;
    let m1 = MessageId::from("m1");

    world
        .backend
        .fail_next("insert_reaction", InjectedFailure::PermissionDenied);
    assert!(alice.toggle_reaction(conv, &m1, "👍").unwrap());

    assert!(
        wait_until(&mut alice, EVENTUALLY, |e| {
            e.snapshot(conv).is_some_and(|s| s.reactions(&m1).is_empty())
        })
        .await
    );
    let received = drain_signals(&mut signals);
    crate::assert_signal!(received, EngineSignal::ActionFailed { .. });
}

#[tokio::test]
async fn test_existing_reaction_on_add_is_success() {
    let world = world_with_message().await;
    let mut alice = world.opened(world.alice).await;
    let conv = world.conversation;
    let m1 = MessageId::from("m1");

    world.backend.fail_next("insert_reaction", InjectedFailure::Conflict);
    alice.toggle_reaction(conv, &m1, "👍").unwrap();
    alice.settle(QUIET).await;

    assert_eq!(alice.snapshot(conv).unwrap().reactions(&m1).len(), 1);
}

#[tokio::test]
async fn test_reactions_in_other_conversations_are_not_kept() {
    let world = world_with_message().await;
    let conv = world.conversation;
    let mut alice = world.opened(world.alice).await;

    // a conversation alice is not part of
    let (elsewhere, stranger) = (Uuid::new_v4(), Uuid::new_v4());
    world
        .backend
        .insert_remote_message(text("far", elsewhere, stranger, "hi", at(2)))
        .await;
    for emoji in ["👍", "❤️", "😂"] {
        world
            .backend
            .insert_reaction(&Reaction::new(MessageId::from("far"), stranger, emoji))
            .await
            .unwrap();
    }
    world
        .backend
        .insert_reaction(&Reaction::new(MessageId::from("m1"), world.bob, "🎉"))
        .await
        .unwrap();

    let m1 = MessageId::from("m1");
    assert!(
        wait_until(&mut alice, EVENTUALLY, |e| {
            e.snapshot(conv).is_some_and(|s| s.reactions(&m1).len() == 1)
        })
        .await
    );
    alice.settle(QUIET).await;
    let state = alice.snapshot(conv).unwrap();
    assert!(state.reactions(&MessageId::from("far")).is_empty());
    assert!(!state.contains_message(&MessageId::from("far")));
}
