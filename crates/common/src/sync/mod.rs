//! Per-peer reconciliation: bringing this node to the state named by a
//! received update.
//!
//! The engine is transport-agnostic: everything it needs from the update's
//! origin peer goes through [`SyncClient`], which the network layer
//! implements over the wire protocols and tests implement over a second
//! local node. All database mutations for one update commit in a single
//! transaction together with the node properties and the log append, and the
//! in-memory Merkle tree is only swapped after that commit succeeds, so a
//! failed sync leaves the node state untouched for the next retry tick.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncRead;
use tokio::sync::Mutex;

mod data;
pub mod download;

pub use download::{download_file, Download};

use crate::crypto::{entry_hash, Hash32, MerkleTree};
use crate::db::{self, Database, DataRow, DbError, PeerRecord};
use crate::log::{peer_list_hash, PeerAction, SignedUpdate, Update, UpdateError, UpdatePayload};
use crate::objects::{ObjectStore, ObjectStoreError};

/// Server-side cap on hashes per metadata batch.
pub const MAX_METADATA_BATCH: usize = 256;

#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error("database error: {0}")]
    Db(#[from] DbError),

    #[error("update error: {0}")]
    Update(#[from] UpdateError),

    #[error("object store error: {0}")]
    ObjectStore(#[from] ObjectStoreError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("no master public key installed; node is not bound")]
    NoMasterKey,

    #[error("peer list hash mismatch after full sync")]
    PeerListMismatch,

    #[error("merkle root mismatch after sync: expected {expected}, got {got}")]
    RootMismatch { expected: Hash32, got: Hash32 },

    #[error("metadata entry failed hash verification")]
    MetadataHashMismatch,

    #[error("metadata response incomplete: requested {requested}, received {received}")]
    MetadataIncomplete { requested: usize, received: usize },

    #[error("file data short read: expected {expected} bytes, got {got}")]
    ShortRead { expected: u64, got: u64 },

    #[error("transport error: {0}")]
    Transport(#[from] anyhow::Error),
}

/// One entry of a `metadata/1.0` response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetadataEntry {
    pub hash: Hash32,
    #[serde(with = "crate::wire::base64_bytes")]
    pub key: Vec<u8>,
    pub value: Option<Hash32>,
    pub size: u64,
}

impl MetadataEntry {
    /// Recompute the entry hash and check it against the carried one.
    pub fn verify(&self) -> Result<(), SyncError> {
        let computed = entry_hash(&self.key, self.value.as_ref(), self.size);
        if computed != self.hash {
            return Err(SyncError::MetadataHashMismatch);
        }
        Ok(())
    }

    pub fn into_row(self) -> DataRow {
        DataRow {
            key: self.key,
            value: self.value,
            size: self.size,
            hash: self.hash,
        }
    }
}

impl From<DataRow> for MetadataEntry {
    fn from(row: DataRow) -> Self {
        Self {
            hash: row.hash,
            key: row.key,
            value: row.value,
            size: row.size,
        }
    }
}

/// One bucket's hashes, as returned by `data-bucket-hashes/1.0`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BucketHashes {
    pub bucket_index: u32,
    pub hashes: Vec<Hash32>,
}

/// Remote operations against the peer an update arrived from.
#[async_trait]
pub trait SyncClient: Send + Sync {
    /// The peer's full authorized peer list.
    async fn fetch_peer_list(&self) -> Result<Vec<PeerRecord>, SyncError>;

    /// The peer's Merkle bucket hashes, provided its tree has the given
    /// bucket count. Empty on a count mismatch.
    async fn fetch_tree_bucket_hashes(&self, num_buckets: u32) -> Result<Vec<Hash32>, SyncError>;

    /// The entry hashes in the given buckets of the peer's data set.
    async fn fetch_data_bucket_hashes(
        &self,
        bucket_indices: &[u32],
        num_buckets: u32,
    ) -> Result<Vec<BucketHashes>, SyncError>;

    /// Full metadata rows for up to [`MAX_METADATA_BATCH`] entry hashes.
    /// A missing hash on the peer fails the whole batch.
    async fn fetch_metadata(&self, hashes: &[Hash32]) -> Result<Vec<MetadataEntry>, SyncError>;

    /// A byte stream over `[offset, offset + length)` of a blob.
    async fn fetch_file_data(
        &self,
        file_hash: &Hash32,
        offset: u64,
        length: u64,
    ) -> Result<Box<dyn AsyncRead + Send + Unpin>, SyncError>;
}

/// The local state the sync engine operates on.
#[derive(Clone)]
pub struct SyncState {
    pub db: Database,
    pub objects: ObjectStore,
    pub merkle: Arc<Mutex<MerkleTree>>,
}

/// Outcome of processing one received update.
#[derive(Debug)]
pub enum Outcome {
    /// The update was applied; the listed blobs still need downloading.
    Applied { downloads: Vec<Download> },
    /// The update id was not ahead of ours; silently dropped.
    Stale,
}

/// Verify, order-check, and apply a received signed update.
///
/// Callers serialize invocations (one `process_update` at a time per node);
/// the engine itself assumes exclusive ownership of the Merkle tree for the
/// duration of the data sync.
pub async fn process_update(
    state: &SyncState,
    client: &dyn SyncClient,
    signed: &SignedUpdate,
) -> Result<Outcome, SyncError> {
    let master_pub = state
        .db
        .master_public_key()
        .await?
        .ok_or(SyncError::NoMasterKey)?;
    signed.verify(&master_pub)?;
    let update = signed.update()?;

    let current_id = state.db.current_update_id().await?;
    if update.update_id <= current_id {
        tracing::debug!(
            update_id = update.update_id,
            current_id,
            "dropping stale update"
        );
        return Ok(Outcome::Stale);
    }

    sync_peer_list(state, client, &update).await?;
    let downloads = data::sync_data(state, client, &update, signed).await?;

    tracing::info!(
        update_id = update.update_id,
        downloads = downloads.len(),
        "applied update"
    );
    Ok(Outcome::Applied { downloads })
}

/// Bring the local peer set to `update.peer_list_hash`.
async fn sync_peer_list(
    state: &SyncState,
    client: &dyn SyncClient,
    update: &Update,
) -> Result<(), SyncError> {
    let local_hash = state.db.peer_list_hash().await?;
    if update.peer_list_hash == local_hash {
        return Ok(());
    }

    // Fast-forward: a single peer change whose precondition matches.
    if update.prev_peer_list_hash == local_hash {
        if let UpdatePayload::Peer(change) = &update.payload {
            match change.action {
                PeerAction::Add => {
                    let record = PeerRecord::new(
                        change.peer_id.clone(),
                        change.addresses.clone().unwrap_or_default(),
                    );
                    db::peers::add_peer(state.db.pool(), &record).await?;
                }
                PeerAction::Remove => {
                    db::peers::remove_peer(state.db.pool(), &change.peer_id).await?;
                }
            }
            let new_hash = peer_list_hash(&state.db.all_peer_ids().await?);
            if new_hash == update.peer_list_hash {
                return Ok(());
            }
            tracing::warn!(
                expected = %update.peer_list_hash,
                got = %new_hash,
                "peer fast-forward missed; falling back to full peer list sync"
            );
        }
    }

    // Full sync: replace the whole set from the update's origin.
    let peers = client.fetch_peer_list().await?;
    state.db.replace_all_peers(&peers).await?;
    let new_hash = peer_list_hash(&state.db.all_peer_ids().await?);
    if new_hash != update.peer_list_hash {
        return Err(SyncError::PeerListMismatch);
    }
    Ok(())
}
