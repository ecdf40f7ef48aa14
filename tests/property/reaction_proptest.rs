//! Reaction toggles and in-flight generations

use std::collections::HashMap;

use proptest::prelude::*;
use uuid::Uuid;

use chatsync::client::outbox::optimistic::OptimisticManager;
use chatsync::client::ConversationState;
use chatsync::shared::messaging::{MessageId, Reaction};

const EMOJI: [&str; 3] = ["👍", "❤️", "😂"];

proptest! {
    #[test]
    fn test_toggle_parity_decides_presence(toggles in prop::collection::vec((0usize..3, 0usize..3), 0..60)) {
        let me = Uuid::from_u128(1);
        let mut state = ConversationState::new();
        let mut counts: HashMap<(usize, usize), u32> = HashMap::new();

        for (message, emoji) in &toggles {
            let reaction = Reaction::new(MessageId::from(format!("m{}", message)), me, EMOJI[*emoji]);
            if state.has_reaction(&reaction) {
                prop_assert!(state.remove_reaction(&reaction));
            } else {
                prop_assert!(state.add_reaction(reaction));
            }
            *counts.entry((*message, *emoji)).or_default() += 1;
        }

        for message in 0..3 {
            let id = MessageId::from(format!("m{}", message));
            for (emoji_index, emoji) in EMOJI.iter().enumerate() {
                let toggled = counts.get(&(message, emoji_index)).copied().unwrap_or(0);
                let present = state.has_reaction(&Reaction::new(id.clone(), me, *emoji));
                prop_assert_eq!(present, toggled % 2 == 1);
            }
            let mine = state.reaction_counts(&id, me);
            prop_assert!(mine.iter().all(|c| c.count == 1 && c.reacted_by_me));
        }
    }

    #[test]
    fn test_only_the_newest_toggle_is_latest(
        order in (1usize..8).prop_flat_map(|n| Just((1..=n as u64).collect::<Vec<_>>()).prop_shuffle())
    ) {
        let id = MessageId::from("m1");
        let mut manager = OptimisticManager::new();
        let newest = order.len() as u64;
        for _ in 0..order.len() {
            manager.begin_toggle(&id, "👍");
        }

        for (finished, generation) in order.iter().enumerate() {
            prop_assert!(manager.is_toggle_pending(&id, "👍"));
            let resolution = manager.finish_toggle(&id, "👍", *generation);
            prop_assert_eq!(resolution.is_latest, *generation == newest);
            prop_assert_eq!(resolution.settled, finished + 1 == order.len());
        }
        prop_assert!(!manager.is_toggle_pending(&id, "👍"));
        prop_assert_eq!(manager.pending_toggles(), 0);
    }
}
