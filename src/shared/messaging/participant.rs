//! Participant and Profile Data Structures

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Membership of a user in a conversation
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct Participant {
    pub conversation_id: Uuid,
    pub user_id: Uuid,
    /// Only meaningful in group conversations
    #[serde(default)]
    pub is_admin: bool,
}

impl Participant {
    pub fn member(conversation_id: Uuid, user_id: Uuid) -> Self {
        Self {
            conversation_id,
            user_id,
            is_admin: false,
        }
    }

    pub fn admin(conversation_id: Uuid, user_id: Uuid) -> Self {
        Self {
            conversation_id,
            user_id,
            is_admin: true,
        }
    }
}

/// Public profile of a user
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Profile {
    pub id: Uuid,
    pub username: String,
    #[serde(default)]
    pub full_name: Option<String>,
    #[serde(default)]
    pub avatar_url: Option<String>,
    /// Whether the user is currently online
    #[serde(default)]
    pub is_online: bool,
    #[serde(default)]
    pub last_seen: Option<DateTime<Utc>>,
}

impl Profile {
    /// Name to show in headers and the chat list
    pub fn display_name(&self) -> &str {
        match self.full_name.as_deref() {
            Some(name) if !name.trim().is_empty() => name,
            _ => &self.username,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_name_falls_back_to_username() {
        let mut profile = Profile {
            id: Uuid::new_v4(),
            username: "alice".to_string(),
            full_name: Some("  ".to_string()),
            avatar_url: None,
            is_online: false,
            last_seen: None,
        };
        assert_eq!(profile.display_name(), "alice");

        profile.full_name = Some("Alice Liddell".to_string());
        assert_eq!(profile.display_name(), "Alice Liddell");
    }

    #[test]
    fn test_participant_admin_flag_defaults_false() {
        let row = serde_json::json!({ "conversation_id": Uuid::nil(), "user_id": Uuid::nil() });
        let p: Participant = serde_json::from_value(row).unwrap();
        assert!(!p.is_admin);
    }
}
