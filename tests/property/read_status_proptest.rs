//! Read status derivation

use proptest::prelude::*;
use uuid::Uuid;

use chatsync::client::tracker::message_status;
use chatsync::client::{ConversationState, MessageEntry};
use chatsync::shared::messaging::{derive_status, Participant, ReadStatus};

use crate::common::{at, text};

fn rank(status: ReadStatus) -> u8 {
    match status {
        ReadStatus::Pending | ReadStatus::Failed => 0,
        ReadStatus::Sent => 1,
        ReadStatus::Delivered => 2,
        ReadStatus::Read => 3,
    }
}

proptest! {
    #[test]
    fn test_cursor_at_or_after_message_reads(cursor in 0i64..100, created in 0i64..100, online in any::<bool>()) {
        let (sender, counterpart) = (Uuid::from_u128(1), Uuid::from_u128(2));
        let status = derive_status(sender, counterpart, Some(at(cursor)), at(created), online);
        prop_assert_eq!(status == ReadStatus::Read, cursor >= created);
    }

    #[test]
    fn test_advancing_cursor_never_demotes(
        mut cursors in prop::collection::vec(0i64..100, 1..20),
        created in 0i64..100,
        online in any::<bool>(),
    ) {
        cursors.sort_unstable();
        let (sender, counterpart) = (Uuid::from_u128(1), Uuid::from_u128(2));
        let ranks: Vec<u8> = cursors
            .iter()
            .map(|c| rank(derive_status(sender, counterpart, Some(at(*c)), at(created), online)))
            .collect();
        prop_assert!(ranks.windows(2).all(|w| w[0] <= w[1]));
    }

    #[test]
    fn test_own_cursor_never_marks_read(cursor in 0i64..100, created in 0i64..100) {
        let me = Uuid::from_u128(1);
        prop_assert_ne!(derive_status(me, me, Some(at(cursor)), at(created), false), ReadStatus::Read);
    }

    #[test]
    fn test_group_read_needs_every_recipient(
        cursors in prop::collection::vec(prop::option::of(0i64..50), 2..6),
        created in 0i64..50,
    ) {
        let conv = Uuid::nil();
        let sender = Uuid::from_u128(100);
        let mut state = ConversationState::new();
        state.upsert_participant(Participant::member(conv, sender));
        for (index, cursor) in cursors.iter().enumerate() {
            let user = Uuid::from_u128(index as u128 + 1);
            state.upsert_participant(Participant::member(conv, user));
            if let Some(c) = cursor {
                state.advance_cursor(user, at(*c));
            }
        }

        let entry = MessageEntry::confirmed(text("m", conv, sender, "x", at(created)));
        let everyone_read = cursors.iter().all(|c| c.is_some_and(|c| c >= created));
        prop_assert_eq!(message_status(&state, &entry) == ReadStatus::Read, everyone_read);
    }
}
