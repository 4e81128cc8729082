//! SQLite persistence: node properties, encrypted data entries, the
//! authorized peer set, and the signed update log.
//!
//! One pool, four tables. Every multi-row invariant (peer list replacement,
//! update commit) runs inside an explicit transaction; the helpers in the
//! submodules are generic over the executor so the same query text serves
//! pool and transaction callers.

use std::path::Path;
use std::str::FromStr;

use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Sqlite, SqlitePool, Transaction};

pub mod data;
pub mod node;
pub mod peers;
pub mod updates;

pub use data::DataRow;
pub use peers::PeerRecord;

#[derive(Debug, thiserror::Error)]
pub enum DbError {
    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),

    #[error("corrupt stored value for {0}")]
    CorruptValue(&'static str),
}

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS node (
    key   TEXT NOT NULL PRIMARY KEY,
    value TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS data (
    key               BLOB NOT NULL PRIMARY KEY,
    value             BLOB,
    size              INTEGER NOT NULL DEFAULT 0,
    hash              BLOB NOT NULL,
    in_current        INTEGER NOT NULL DEFAULT 1,
    download_progress INTEGER NOT NULL DEFAULT 0,
    folder_tag        BLOB
);
CREATE INDEX IF NOT EXISTS data_hash_idx ON data (hash);
CREATE INDEX IF NOT EXISTS data_folder_tag_idx ON data (folder_tag);
CREATE TABLE IF NOT EXISTS peers (
    peer_id TEXT NOT NULL PRIMARY KEY,
    addrs   TEXT NOT NULL DEFAULT ''
);
CREATE TABLE IF NOT EXISTS updates (
    update_id          INTEGER NOT NULL PRIMARY KEY,
    signed_update_json TEXT NOT NULL
);
"#;

/// Handle to the node's SQLite database.
#[derive(Clone, Debug)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// Open (or create) the database at `path` and apply the schema.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, DbError> {
        let options = SqliteConnectOptions::new()
            .filename(path.as_ref())
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(8)
            .connect_with(options)
            .await?;
        Self::from_pool(pool).await
    }

    /// An in-memory database for tests. Limited to a single connection so
    /// every caller sees the same store.
    pub async fn memory() -> Result<Self, DbError> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?;
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;
        Self::from_pool(pool).await
    }

    async fn from_pool(pool: SqlitePool) -> Result<Self, DbError> {
        sqlx::raw_sql(SCHEMA).execute(&pool).await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Begin an explicit transaction for a multi-step commit.
    pub async fn begin(&self) -> Result<Transaction<'static, Sqlite>, DbError> {
        Ok(self.pool.begin().await?)
    }
}
