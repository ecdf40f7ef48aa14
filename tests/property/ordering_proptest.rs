//! Message log ordering and duplicate delivery

use std::collections::{BTreeMap, HashSet};

use proptest::prelude::*;
use uuid::Uuid;

use chatsync::client::reconciler::Reconciler;
use chatsync::client::{ConversationState, LocalStateStore, MessageEntry};
use chatsync::shared::{ChangeEvent, ChangeOp, EntityKind};

use crate::common::{at, text};

fn message_id(n: u16) -> String {
    format!("m{:03}", n)
}

/// Unique ids with timestamps, plus the same rows in shuffled order
fn arb_permuted() -> impl Strategy<Value = (Vec<(u16, i64)>, Vec<(u16, i64)>)> {
    prop::collection::btree_map(0u16..500, 0i64..30, 1..40)
        .prop_map(|rows| rows.into_iter().collect::<Vec<_>>())
        .prop_flat_map(|rows| (Just(rows.clone()), Just(rows).prop_shuffle()))
}

fn build(rows: &[(u16, i64)]) -> ConversationState {
    let (conv, sender) = (Uuid::nil(), Uuid::from_u128(1));
    let mut state = ConversationState::new();
    for (id, secs) in rows {
        state.upsert_message(MessageEntry::confirmed(text(&message_id(*id), conv, sender, "x", at(*secs))));
    }
    state
}

proptest! {
    #[test]
    fn test_log_stays_sorted_and_unique(rows in prop::collection::vec((0u16..40, 0i64..20), 0..80)) {
        let state = build(&rows);

        let keys: Vec<_> = state
            .messages()
            .iter()
            .map(|e| (e.message.created_at, e.id().to_string()))
            .collect();
        let mut sorted = keys.clone();
        sorted.sort();
        prop_assert_eq!(&keys, &sorted);

        let unique: HashSet<_> = keys.iter().map(|(_, id)| id.clone()).collect();
        prop_assert_eq!(unique.len(), keys.len());

        // last write of an id wins
        let expected: BTreeMap<String, i64> = rows.iter().map(|(id, secs)| (message_id(*id), *secs)).collect();
        prop_assert_eq!(keys.len(), expected.len());
        for (created_at, id) in &keys {
            prop_assert_eq!(*created_at, at(expected[id]));
        }
    }

    #[test]
    fn test_arrival_order_does_not_matter((rows, shuffled) in arb_permuted()) {
        let in_order = build(&rows);
        let mut twice = shuffled.clone();
        twice.extend(shuffled.iter().rev().copied());
        let out_of_order = build(&twice);
        prop_assert_eq!(in_order.messages(), out_of_order.messages());
    }

    #[test]
    fn test_replayed_events_change_nothing(rows in prop::collection::btree_map(0u16..200, 0i64..30, 1..25)) {
        let me = Uuid::from_u128(7);
        let conv = Uuid::from_u128(9);
        let sender = Uuid::from_u128(8);
        let reconciler = Reconciler::new(me, std::time::Duration::from_secs(30));

        let events: Vec<ChangeEvent> = rows
            .iter()
            .map(|(id, secs)| {
                let row = text(&message_id(*id), conv, sender, "hello", at(*secs));
                ChangeEvent::from_row(EntityKind::Message, ChangeOp::Insert, &row).unwrap()
            })
            .collect();

        let mut once = LocalStateStore::new(16);
        once.open(conv);
        for event in &events {
            reconciler.apply_event(&mut once, conv, event).unwrap();
        }

        let mut replayed = LocalStateStore::new(16);
        replayed.open(conv);
        for event in events.iter().chain(events.iter()) {
            reconciler.apply_event(&mut replayed, conv, event).unwrap();
        }

        prop_assert_eq!(
            once.get(conv).unwrap().messages(),
            replayed.get(conv).unwrap().messages()
        );
        prop_assert_eq!(once.get(conv).unwrap().messages().len(), rows.len());
    }
}
