//! Group management scenarios

use uuid::Uuid;

use chatsync::client::SyncError;
use chatsync::shared::messaging::ConversationKind;

use crate::common::*;

#[tokio::test]
async fn test_admin_adds_members_with_announcements() {
    let world = World::group(&[]).await;
    let conv = world.conversation;
    let carol = Uuid::new_v4();
    world.backend.seed_profile(profile(carol, "carol", false)).await;

    let mut alice = world.opened(world.alice).await;
    alice.add_members(conv, &[carol, world.bob]).await.unwrap();

    let state = alice.snapshot(conv).unwrap();
    assert!(state.is_participant(carol));
    assert_eq!(state.profile(carol).map(|p| p.username.as_str()), Some("carol"));

    let notifications = world.backend.notifications().await;
    assert_eq!(notifications.len(), 1);
    assert_eq!(notifications[0].user_id, carol);
    assert_eq!(notifications[0].message, "You were added by alice");

    let messages = world.backend.messages(conv).await;
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].body(), "carol was added by alice");
}

#[tokio::test]
async fn test_members_cannot_manage_the_group() {
    let world = World::group(&[]).await;
    let conv = world.conversation;
    let mut bob = world.engine(world.bob).await;

    crate::assert_err!(
        bob.add_members(conv, &[Uuid::new_v4()]).await,
        SyncError::PermissionDenied(_)
    );
    crate::assert_err!(
        bob.remove_member(conv, world.alice).await,
        SyncError::PermissionDenied(_)
    );
    crate::assert_err!(bob.delete_group(conv).await, SyncError::PermissionDenied(_));
}

#[tokio::test]
async fn test_last_member_out_deletes_the_conversation() {
    let world = World::direct().await;
    let conv = world.conversation;
    let mut alice = world.opened(world.alice).await;
    let mut bob = world.engine(world.bob).await;

    bob.leave_conversation(conv).await.unwrap();
    let list = alice.conversation_list().await.unwrap();
    assert_eq!(list.len(), 1);

    alice.leave_conversation(conv).await.unwrap();
    assert!(!alice.is_open(conv));
    assert!(alice.conversation_list().await.unwrap().is_empty());
    crate::assert_err!(alice.open_conversation(conv).await, SyncError::NotFound(_));
}

#[tokio::test]
async fn test_created_group_lists_with_its_name() {
    let world = World::direct().await;
    let mut alice = world.engine(world.alice).await;

    let group = alice.create_group("Weekend", &[world.bob]).await.unwrap();
    let list = alice.conversation_list().await.unwrap();
    let entry = list.iter().find(|s| s.id == group).unwrap();
    assert_eq!(entry.kind, ConversationKind::Group);
    assert_eq!(entry.title, "Weekend");
    assert_eq!(
        entry.last_message_preview.as_deref(),
        Some("Group \"Weekend\" was created by alice")
    );
}

#[tokio::test]
async fn test_forward_into_direct_conversation() {
    let world = World::group(&[]).await;
    let conv = world.conversation;
    world
        .backend
        .insert_remote_message(text("m1", conv, world.bob, "pass it on", at(1)))
        .await;
    let carol = Uuid::new_v4();
    let mut alice = world.opened(world.alice).await;

    let id = alice
        .forward_message(conv, &chatsync::shared::messaging::MessageId::from("m1"), carol)
        .await
        .unwrap();
    assert!(!id.is_temporary());

    let direct = alice.find_or_create_direct(carol).await.unwrap();
    let forwarded = world.backend.messages(direct).await;
    assert_eq!(forwarded.len(), 1);
    assert_eq!(forwarded[0].body(), "pass it on");
    assert_eq!(forwarded[0].sender_id, world.alice);
}
