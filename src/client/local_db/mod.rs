//! # Local Database Module
//!
//! Small SQLite side store for state that only lives on this device:
//!
//! - `drafts.rs`: unsent text per (conversation, user)
//! - `cursors.rs`: last-read fallback per (conversation, user), used when
//!   the backend's cursor row is missing or behind
//! - `schema.rs`: table definitions and migrations
//!
//! The store is a cache, never the authority: on snapshot the local cursor
//! is merged as `max(remote, local)`.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use chatsync::client::local_db::LocalDatabase;
//!
//! # async fn demo() -> sqlx::Result<()> {
//! let db = LocalDatabase::in_memory().await?;
//! # Ok(())
//! # }
//! ```

pub mod cursors;
pub mod drafts;
pub mod schema;

use std::path::{Path, PathBuf};

use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Result as SqlxResult, SqlitePool};

/// Result type for local database operations
pub type Result<T> = SqlxResult<T>;

/// Local database connection manager
#[derive(Debug, Clone)]
pub struct LocalDatabase {
    pool: SqlitePool,
}

impl LocalDatabase {
    /// Open or create the database in the platform data directory
    pub async fn new() -> Result<Self> {
        Self::open(&Self::default_path()).await
    }

    /// Open or create the database at `path`
    pub async fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .synchronous(sqlx::sqlite::SqliteSynchronous::Normal);
        let pool = SqlitePoolOptions::new().max_connections(4).connect_with(options).await?;
        tracing::debug!("[STORE] opened local database at {}", path.display());

        let db = Self { pool };
        db.init_schema().await?;
        Ok(db)
    }

    /// Private in-memory database; a single connection keeps it alive
    pub async fn in_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await?;
        let db = Self { pool };
        db.init_schema().await?;
        Ok(db)
    }

    /// Platform-specific path of the database file
    pub fn default_path() -> PathBuf {
        let mut path = dirs::data_dir().unwrap_or_else(std::env::temp_dir);
        path.push("chatsync");
        path.push("local.db");
        path
    }

    async fn init_schema(&self) -> Result<()> {
        sqlx::query(schema::CREATE_MIGRATIONS).execute(&self.pool).await?;
        self.run_migrations().await
    }

    /// Apply every migration newer than the recorded version
    async fn run_migrations(&self) -> Result<()> {
        let current_version: (i32,) = sqlx::query_as("SELECT COALESCE(MAX(version), 0) FROM schema_migrations")
            .fetch_one(&self.pool)
            .await?;

        for version in schema::get_pending_migrations(current_version.0) {
            let mut tx = self.pool.begin().await?;
            for statement in schema::migration(version) {
                sqlx::query(statement).execute(&mut *tx).await?;
            }
            sqlx::query("INSERT INTO schema_migrations (version, applied_at) VALUES (?, ?)")
                .bind(version)
                .bind(schema::encode_timestamp(chrono::Utc::now()))
                .execute(&mut *tx)
                .await?;
            tx.commit().await?;
            tracing::info!("[STORE] applied local schema migration {}", version);
        }
        Ok(())
    }

    /// Get connection pool reference
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}
