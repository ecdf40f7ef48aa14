//! # Optimistic Bookkeeping
//!
//! Hands out temporary message ids and tracks in-flight reaction toggles.
//!
//! Every toggle of a (message, emoji) pair by the local user gets a
//! generation number. When a toggle fails, only the latest generation may
//! roll the local state back; an older failure has already been superseded
//! by the user's newer intent. While any toggle of a pair is in flight,
//! remote echoes for that pair are ignored.

use std::collections::HashMap;

use crate::shared::messaging::MessageId;

/// Outcome of finishing one toggle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ToggleResolution {
    /// The finished toggle is the user's most recent one for the pair
    pub is_latest: bool,
    /// No toggle of the pair is in flight any more
    pub settled: bool,
}

#[derive(Debug, Clone, Copy)]
struct ReactionIntent {
    generation: u64,
    in_flight: u32,
}

/// Temporary ids and reaction generations
#[derive(Debug, Default)]
pub struct OptimisticManager {
    next_temp: u64,
    reactions: HashMap<(MessageId, String), ReactionIntent>,
}

impl OptimisticManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Next `tmp-<n>` id, unique for the life of the engine
    pub fn next_temp_id(&mut self) -> MessageId {
        self.next_temp += 1;
        MessageId::temporary(self.next_temp)
    }

    /// Register a toggle; returns its generation
    pub fn begin_toggle(&mut self, message_id: &MessageId, emoji: &str) -> u64 {
        let intent = self
            .reactions
            .entry((message_id.clone(), emoji.to_string()))
            .or_insert(ReactionIntent {
                generation: 0,
                in_flight: 0,
            });
        intent.generation += 1;
        intent.in_flight += 1;
        intent.generation
    }

    /// A toggle finished, successfully or not
    pub fn finish_toggle(&mut self, message_id: &MessageId, emoji: &str, generation: u64) -> ToggleResolution {
        let key = (message_id.clone(), emoji.to_string());
        let Some(intent) = self.reactions.get_mut(&key) else {
            return ToggleResolution {
                is_latest: false,
                settled: true,
            };
        };
        intent.in_flight = intent.in_flight.saturating_sub(1);
        let resolution = ToggleResolution {
            is_latest: intent.generation == generation,
            settled: intent.in_flight == 0,
        };
        if resolution.settled {
            self.reactions.remove(&key);
        }
        resolution
    }

    pub fn is_toggle_pending(&self, message_id: &MessageId, emoji: &str) -> bool {
        self.reactions.contains_key(&(message_id.clone(), emoji.to_string()))
    }

    pub fn pending_toggles(&self) -> usize {
        self.reactions.len()
    }
}
