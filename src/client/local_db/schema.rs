//! Database Schema Definitions
//!
//! Tables of the local side store and their migrations. Both tables are
//! keyed by (conversation_id, user_id); timestamps are RFC 3339 strings in
//! UTC with a fixed width so they compare correctly as text.

use chrono::{DateTime, SecondsFormat, Utc};

/// Current database schema version
pub const CURRENT_SCHEMA_VERSION: i32 = 1;

/// Schema migration versions
pub const MIGRATION_VERSIONS: &[i32] = &[1];

pub const CREATE_MIGRATIONS: &str = "CREATE TABLE IF NOT EXISTS schema_migrations (
    version INTEGER PRIMARY KEY,
    applied_at TEXT NOT NULL
)";

pub const CREATE_DRAFTS: &str = "CREATE TABLE IF NOT EXISTS drafts (
    conversation_id TEXT NOT NULL,
    user_id TEXT NOT NULL,
    body TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    PRIMARY KEY (conversation_id, user_id)
)";

pub const CREATE_READ_CURSORS: &str = "CREATE TABLE IF NOT EXISTS read_cursors (
    conversation_id TEXT NOT NULL,
    user_id TEXT NOT NULL,
    last_viewed_at TEXT NOT NULL,
    PRIMARY KEY (conversation_id, user_id)
)";

/// Statements of a migration version
pub fn migration(version: i32) -> &'static [&'static str] {
    match version {
        1 => &[CREATE_DRAFTS, CREATE_READ_CURSORS],
        _ => &[],
    }
}

/// Check if database needs migration
pub fn needs_migration(current_version: i32) -> bool {
    current_version < CURRENT_SCHEMA_VERSION
}

/// Get pending migrations
pub fn get_pending_migrations(current_version: i32) -> Vec<i32> {
    MIGRATION_VERSIONS
        .iter()
        .filter(|&&v| v > current_version)
        .cloned()
        .collect()
}

/// Stored form of a timestamp
pub fn encode_timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub fn decode_timestamp(text: &str) -> sqlx::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(text)
        .map(|at| at.with_timezone(&Utc))
        .map_err(|e| sqlx::Error::Decode(Box::new(e)))
}
