//! Client side of the wire protocols: the network [`SyncClient`].

use anyhow::{anyhow, Context};
use async_trait::async_trait;
use iroh::endpoint::Connection;
use iroh::{Endpoint, NodeId};
use tokio::io::AsyncRead;

use super::{
    DataBucketHashesRequest, FileDataRequest, PeerInfoMsg, TreeBucketHashesRequest,
    DATA_BUCKET_HASHES_ALPN, FILE_DATA_ALPN, MAX_MESSAGE_SIZE, METADATA_ALPN, PEER_LIST_ALPN,
    TREE_BUCKET_HASHES_ALPN,
};
use crate::crypto::Hash32;
use crate::db::PeerRecord;
use crate::sync::{BucketHashes, MetadataEntry, SyncClient, SyncError, MAX_METADATA_BATCH};

// Generous cap for a full metadata batch reply (256 entries of row
// ciphertext plus JSON overhead).
const MAX_METADATA_REPLY_SIZE: usize = 16 * 1024 * 1024;

/// [`SyncClient`] implementation that talks to one remote peer over the
/// endpoint. Connections are opened per request; iroh reuses the underlying
/// QUIC connection transparently.
///
/// Callers only construct this for peers already in the authorized set
/// (the update origin or a retry source), so the outbound side of the
/// authorization check happens at construction.
#[derive(Debug, Clone)]
pub struct NetworkSyncClient {
    endpoint: Endpoint,
    peer: NodeId,
}

impl NetworkSyncClient {
    pub fn new(endpoint: Endpoint, peer: NodeId) -> Self {
        Self { endpoint, peer }
    }

    pub fn peer(&self) -> NodeId {
        self.peer
    }

    async fn connect(&self, alpn: &'static [u8]) -> Result<Connection, SyncError> {
        self.endpoint
            .connect(self.peer, alpn)
            .await
            .with_context(|| format!("connecting to {} for {}", self.peer, alpn.escape_ascii()))
            .map_err(SyncError::Transport)
    }

    /// One JSON request, one JSON reply.
    async fn request<Req, Reply>(
        &self,
        alpn: &'static [u8],
        request: Option<&Req>,
    ) -> Result<Reply, SyncError>
    where
        Req: serde::Serialize + Sync,
        Reply: serde::de::DeserializeOwned,
    {
        let conn = self.connect(alpn).await?;
        let (mut send, mut recv) = conn
            .open_bi()
            .await
            .map_err(|e| SyncError::Transport(anyhow!("open stream: {e}")))?;

        if let Some(request) = request {
            let bytes = serde_json::to_vec(request)
                .map_err(|e| SyncError::Transport(anyhow!("encode request: {e}")))?;
            send.write_all(&bytes)
                .await
                .map_err(|e| SyncError::Transport(anyhow!("write request: {e}")))?;
        }
        send.finish()
            .map_err(|e| SyncError::Transport(anyhow!("finish request: {e}")))?;

        let reply = recv
            .read_to_end(MAX_MESSAGE_SIZE)
            .await
            .map_err(|e| SyncError::Transport(anyhow!("read reply: {e}")))?;
        serde_json::from_slice(&reply)
            .map_err(|e| SyncError::Transport(anyhow!("decode reply: {e}")))
    }
}

#[async_trait]
impl SyncClient for NetworkSyncClient {
    async fn fetch_peer_list(&self) -> Result<Vec<PeerRecord>, SyncError> {
        let reply: Vec<PeerInfoMsg> = self.request::<(), _>(PEER_LIST_ALPN, None).await?;
        Ok(reply.into_iter().map(Into::into).collect())
    }

    async fn fetch_tree_bucket_hashes(&self, num_buckets: u32) -> Result<Vec<Hash32>, SyncError> {
        self.request(
            TREE_BUCKET_HASHES_ALPN,
            Some(&TreeBucketHashesRequest { num_buckets }),
        )
        .await
    }

    async fn fetch_data_bucket_hashes(
        &self,
        bucket_indices: &[u32],
        num_buckets: u32,
    ) -> Result<Vec<BucketHashes>, SyncError> {
        self.request(
            DATA_BUCKET_HASHES_ALPN,
            Some(&DataBucketHashesRequest {
                bucket_indices: bucket_indices.to_vec(),
                num_buckets,
            }),
        )
        .await
    }

    async fn fetch_metadata(&self, hashes: &[Hash32]) -> Result<Vec<MetadataEntry>, SyncError> {
        if hashes.is_empty() {
            return Ok(Vec::new());
        }
        if hashes.len() > MAX_METADATA_BATCH {
            return Err(SyncError::Transport(anyhow!(
                "metadata batch of {} exceeds the {} hash limit",
                hashes.len(),
                MAX_METADATA_BATCH
            )));
        }

        let conn = self.connect(METADATA_ALPN).await?;
        let (mut send, mut recv) = conn
            .open_bi()
            .await
            .map_err(|e| SyncError::Transport(anyhow!("open stream: {e}")))?;

        // Raw concatenated hashes, then half-close the write direction.
        let mut body = Vec::with_capacity(hashes.len() * 32);
        for hash in hashes {
            body.extend_from_slice(hash.as_bytes());
        }
        send.write_all(&body)
            .await
            .map_err(|e| SyncError::Transport(anyhow!("write hashes: {e}")))?;
        send.finish()
            .map_err(|e| SyncError::Transport(anyhow!("finish hashes: {e}")))?;

        // Newline-delimited JSON entries until the server closes. A close
        // before all entries arrived means at least one hash was unknown;
        // the caller notices the short count and falls back.
        let reply = recv
            .read_to_end(MAX_METADATA_REPLY_SIZE)
            .await
            .map_err(|e| SyncError::Transport(anyhow!("read metadata: {e}")))?;
        let mut entries = Vec::with_capacity(hashes.len());
        for line in reply.split(|&b| b == b'\n') {
            if line.is_empty() {
                continue;
            }
            let entry: MetadataEntry = serde_json::from_slice(line)
                .map_err(|e| SyncError::Transport(anyhow!("decode metadata entry: {e}")))?;
            entries.push(entry);
        }
        Ok(entries)
    }

    async fn fetch_file_data(
        &self,
        file_hash: &Hash32,
        offset: u64,
        length: u64,
    ) -> Result<Box<dyn AsyncRead + Send + Unpin>, SyncError> {
        let conn = self.connect(FILE_DATA_ALPN).await?;
        let (mut send, recv) = conn
            .open_bi()
            .await
            .map_err(|e| SyncError::Transport(anyhow!("open stream: {e}")))?;

        let request = FileDataRequest {
            file_hash: *file_hash,
            offset,
            length,
        };
        let bytes = serde_json::to_vec(&request)
            .map_err(|e| SyncError::Transport(anyhow!("encode request: {e}")))?;
        send.write_all(&bytes)
            .await
            .map_err(|e| SyncError::Transport(anyhow!("write request: {e}")))?;
        send.finish()
            .map_err(|e| SyncError::Transport(anyhow!("finish request: {e}")))?;

        Ok(Box::new(recv))
    }
}
