//! The authorized peer set. Mirrors what the in-memory allow map serves to
//! the transport layer; the master's peer updates keep it converged.

use sqlx::{Executor, Row, Sqlite};

use super::{Database, DbError};

/// One authorized peer: its node id string and any known direct addresses
/// (newline-joined in storage, may be empty; discovery handles dialing).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerRecord {
    pub peer_id: String,
    pub addrs: Vec<String>,
}

impl PeerRecord {
    pub fn new(peer_id: impl Into<String>, addrs: Vec<String>) -> Self {
        Self {
            peer_id: peer_id.into(),
            addrs,
        }
    }
}

/// Insert or replace a peer.
pub async fn add_peer<'e, E>(ex: E, peer: &PeerRecord) -> Result<(), DbError>
where
    E: Executor<'e, Database = Sqlite>,
{
    sqlx::query("INSERT OR REPLACE INTO peers (peer_id, addrs) VALUES (?, ?)")
        .bind(&peer.peer_id)
        .bind(peer.addrs.join("\n"))
        .execute(ex)
        .await?;
    Ok(())
}

/// Remove a peer by id.
pub async fn remove_peer<'e, E>(ex: E, peer_id: &str) -> Result<(), DbError>
where
    E: Executor<'e, Database = Sqlite>,
{
    sqlx::query("DELETE FROM peers WHERE peer_id = ?")
        .bind(peer_id)
        .execute(ex)
        .await?;
    Ok(())
}

fn decode_peer(row: &sqlx::sqlite::SqliteRow) -> PeerRecord {
    let addrs: String = row.get("addrs");
    PeerRecord {
        peer_id: row.get("peer_id"),
        addrs: addrs
            .split('\n')
            .filter(|s| !s.is_empty())
            .map(str::to_owned)
            .collect(),
    }
}

impl Database {
    /// All authorized peer ids, ascending. This is the exact input to the
    /// peer list hash.
    pub async fn all_peer_ids(&self) -> Result<Vec<String>, DbError> {
        let rows = sqlx::query("SELECT peer_id FROM peers ORDER BY peer_id")
            .fetch_all(self.pool())
            .await?;
        Ok(rows.iter().map(|r| r.get("peer_id")).collect())
    }

    pub async fn all_peers(&self) -> Result<Vec<PeerRecord>, DbError> {
        let rows = sqlx::query("SELECT peer_id, addrs FROM peers ORDER BY peer_id")
            .fetch_all(self.pool())
            .await?;
        Ok(rows.iter().map(decode_peer).collect())
    }

    pub async fn get_peer(&self, peer_id: &str) -> Result<Option<PeerRecord>, DbError> {
        let row = sqlx::query("SELECT peer_id, addrs FROM peers WHERE peer_id = ?")
            .bind(peer_id)
            .fetch_optional(self.pool())
            .await?;
        Ok(row.as_ref().map(decode_peer))
    }

    /// Atomically replace the entire peer set with the given records. Used
    /// by the full peer-list sync path.
    pub async fn replace_all_peers(&self, peers: &[PeerRecord]) -> Result<(), DbError> {
        let mut tx = self.begin().await?;
        sqlx::query("DELETE FROM peers").execute(&mut *tx).await?;
        for peer in peers {
            add_peer(&mut *tx, peer).await?;
        }
        tx.commit().await?;
        Ok(())
    }
}
