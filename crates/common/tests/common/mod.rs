//! Shared fixtures for the replication integration tests.
#![allow(dead_code)]

use std::io::{Read, Seek, SeekFrom};
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use tempfile::TempDir;
use tokio::sync::Mutex;

use common::crypto::{Hash32, MerkleTree};
use common::db::{Database, PeerRecord};
use common::log::SignedUpdate;
use common::objects::ObjectStore;
use common::prelude::{App, AppConfig};
use common::sync::{
    BucketHashes, MetadataEntry, SyncClient, SyncError, SyncState,
};

/// A master app rooted in a temp directory.
pub struct TestMaster {
    pub app: App,
    pub mnemonic: String,
    pub dir: TempDir,
}

/// Create a vault master with no network node.
pub async fn master() -> TestMaster {
    let dir = TempDir::new().unwrap();
    let config = AppConfig {
        db_path: dir.path().join("endershare.db"),
        data_dir: dir.path().join("data"),
        port: 0,
    };
    let app = App::open(config).await.unwrap();
    let mnemonic = app.create_vault().await.unwrap();
    TestMaster { app, mnemonic, dir }
}

/// A bare replica: database, object store, and Merkle tree, plus the sync
/// state the engine operates on.
pub struct TestReplica {
    pub state: SyncState,
    _dir: TempDir,
}

/// Create a replica that trusts the given master.
pub async fn replica(master: &TestMaster) -> TestReplica {
    let dir = TempDir::new().unwrap();
    let db = Database::memory().await.unwrap();
    let master_pub = master.app.db().master_public_key().await.unwrap().unwrap();
    db.set_master_public_key(&master_pub).await.unwrap();

    let objects = ObjectStore::open(dir.path().join("data")).unwrap();
    let state = SyncState {
        db,
        objects,
        merkle: Arc::new(Mutex::new(MerkleTree::new(Vec::new()))),
    };
    TestReplica { state, _dir: dir }
}

/// Fetch a signed update out of the master's log.
pub async fn signed_update(master: &TestMaster, update_id: u64) -> SignedUpdate {
    let json = master
        .app
        .db()
        .update_by_id(update_id)
        .await
        .unwrap()
        .expect("update in log");
    SignedUpdate::from_json(&json).unwrap()
}

/// Write a deterministic plaintext file of `len` bytes under the temp dir.
pub fn plain_file(dir: &TempDir, name: &str, len: usize) -> PathBuf {
    let path = dir.path().join(name);
    let content: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();
    std::fs::write(&path, content).unwrap();
    path
}

/// In-process [`SyncClient`] backed by another node's database and object
/// store: what the network client does, without the network.
pub struct LocalSyncClient {
    db: Database,
    objects: ObjectStore,
    /// Cut file streams short after this many bytes, to exercise resume.
    pub truncate_after: Option<u64>,
}

impl LocalSyncClient {
    pub fn for_master(master: &TestMaster) -> Self {
        Self {
            db: master.app.db().clone(),
            objects: master.app.objects().clone(),
            truncate_after: None,
        }
    }
}

#[async_trait]
impl SyncClient for LocalSyncClient {
    async fn fetch_peer_list(&self) -> Result<Vec<PeerRecord>, SyncError> {
        Ok(self.db.all_peers().await?)
    }

    async fn fetch_tree_bucket_hashes(&self, num_buckets: u32) -> Result<Vec<Hash32>, SyncError> {
        let hashes = self.db.all_entry_hashes().await?;
        Ok(MerkleTree::new_with_buckets(hashes, num_buckets as usize).bucket_hashes())
    }

    async fn fetch_data_bucket_hashes(
        &self,
        bucket_indices: &[u32],
        num_buckets: u32,
    ) -> Result<Vec<BucketHashes>, SyncError> {
        let mut reply = Vec::new();
        for &index in bucket_indices {
            let hashes = self
                .db
                .bucket_hashes(index as usize, num_buckets as usize)
                .await?;
            reply.push(BucketHashes {
                bucket_index: index,
                hashes,
            });
        }
        Ok(reply)
    }

    async fn fetch_metadata(&self, hashes: &[Hash32]) -> Result<Vec<MetadataEntry>, SyncError> {
        let entries = self.db.entries_by_hashes(hashes).await?;
        if entries.len() != hashes.len() {
            // The wire protocol closes the stream early in this case.
            return Err(SyncError::Transport(anyhow::anyhow!(
                "requested hash not found"
            )));
        }
        Ok(entries.into_iter().map(Into::into).collect())
    }

    async fn fetch_file_data(
        &self,
        file_hash: &Hash32,
        offset: u64,
        length: u64,
    ) -> Result<Box<dyn tokio::io::AsyncRead + Send + Unpin>, SyncError> {
        let (mut file, total) = self.objects.open_for_read(file_hash)?;
        file.seek(SeekFrom::Start(offset)).map_err(SyncError::Io)?;

        let mut to_read = total.saturating_sub(offset);
        if length > 0 && length < to_read {
            to_read = length;
        }
        if let Some(cap) = self.truncate_after {
            to_read = to_read.min(cap);
        }

        let mut bytes = vec![0u8; to_read as usize];
        file.read_exact(&mut bytes).map_err(SyncError::Io)?;
        Ok(Box::new(std::io::Cursor::new(bytes)))
    }
}
