//! Server-side protocol handlers.
//!
//! Each handler is a thin struct over the node's shared state, registered
//! with the iroh router under its own ALPN. Every accept authenticates the
//! remote node id against the authorized peer set first; strangers get the
//! connection closed with nothing revealed.

use std::io::SeekFrom;
use std::sync::Arc;

use futures::future::BoxFuture;
use iroh::endpoint::{Connection, RecvStream, SendStream};
use iroh::protocol::{AcceptError, ProtocolHandler};
use iroh::NodeId;
use tokio::io::{AsyncReadExt, AsyncSeekExt};

use super::{
    DataBucketHashesRequest, FileDataRequest, PeerInfoMsg, TreeBucketHashesRequest,
    FILE_STREAM_CHUNK_SIZE, MAX_MESSAGE_SIZE, METADATA_PAGE_SIZE,
};
use crate::crypto::HASH_SIZE;
use crate::peer::node::NodeState;
use crate::sync::{BucketHashes, MetadataEntry};

fn accept_err(e: impl Into<Box<dyn std::error::Error + Send + Sync>>) -> AcceptError {
    AcceptError::from(std::io::Error::other(e.into()))
}

/// Check the remote against the authorized peer set; close otherwise.
async fn authorize(state: &NodeState, conn: &Connection) -> Result<NodeId, AcceptError> {
    let node_id = conn.remote_node_id().map_err(|e| {
        tracing::warn!("failed to get remote node id: {e}");
        accept_err(e)
    })?;
    if !state.allowed.read().await.contains(&node_id) {
        tracing::warn!(peer = %node_id, "rejecting stream from unauthorized peer");
        conn.close(0u32.into(), b"unauthorized");
        return Err(accept_err("unauthorized peer"));
    }
    Ok(node_id)
}

async fn read_request<T: serde::de::DeserializeOwned>(
    recv: &mut RecvStream,
) -> Result<T, AcceptError> {
    let bytes = recv
        .read_to_end(MAX_MESSAGE_SIZE)
        .await
        .map_err(|e| accept_err(std::io::Error::other(e)))?;
    serde_json::from_slice(&bytes).map_err(accept_err)
}

async fn send_reply<T: serde::Serialize>(
    send: &mut SendStream,
    reply: &T,
) -> Result<(), AcceptError> {
    let bytes = serde_json::to_vec(reply).map_err(accept_err)?;
    send.write_all(&bytes)
        .await
        .map_err(|e| accept_err(std::io::Error::other(e)))?;
    send.finish().map_err(|e| accept_err(std::io::Error::other(e)))?;
    Ok(())
}

// Fill `buf` from the stream; a short count means the peer half-closed.
async fn read_page(recv: &mut RecvStream, buf: &mut [u8]) -> Result<usize, AcceptError> {
    let mut filled = 0;
    while filled < buf.len() {
        match recv
            .read(&mut buf[filled..])
            .await
            .map_err(|e| accept_err(std::io::Error::other(e)))?
        {
            Some(n) => filled += n,
            None => break,
        }
    }
    Ok(filled)
}

/// `peer-list/1.0`: reply with the full authorized peer list.
#[derive(Debug, Clone)]
pub struct PeerListProtocol(pub(crate) Arc<NodeState>);

impl ProtocolHandler for PeerListProtocol {
    #[allow(refining_impl_trait)]
    fn accept(&self, conn: Connection) -> BoxFuture<'static, Result<(), AcceptError>> {
        let state = self.0.clone();
        Box::pin(async move {
            authorize(&state, &conn).await?;
            let (mut send, mut recv) = conn.accept_bi().await?;
            let _ = recv.read_to_end(MAX_MESSAGE_SIZE).await;

            let peers = state.db.all_peers().await.map_err(accept_err)?;
            let reply: Vec<PeerInfoMsg> = peers.into_iter().map(Into::into).collect();
            send_reply(&mut send, &reply).await
        })
    }
}

/// `tree-bucket-hashes/1.0`: reply with our Merkle bucket hashes, or an
/// empty list when the requested bucket count does not match ours.
#[derive(Debug, Clone)]
pub struct TreeBucketHashesProtocol(pub(crate) Arc<NodeState>);

impl ProtocolHandler for TreeBucketHashesProtocol {
    #[allow(refining_impl_trait)]
    fn accept(&self, conn: Connection) -> BoxFuture<'static, Result<(), AcceptError>> {
        let state = self.0.clone();
        Box::pin(async move {
            authorize(&state, &conn).await?;
            let (mut send, mut recv) = conn.accept_bi().await?;
            let request: TreeBucketHashesRequest = read_request(&mut recv).await?;

            let tree = state.merkle.lock().await;
            let reply = if tree.num_buckets() != request.num_buckets as usize {
                Vec::new()
            } else {
                tree.bucket_hashes()
            };
            drop(tree);
            send_reply(&mut send, &reply).await
        })
    }
}

/// `data-bucket-hashes/1.0`: reply with the entry hashes in the requested
/// buckets, straight from the indexed range scan.
#[derive(Debug, Clone)]
pub struct DataBucketHashesProtocol(pub(crate) Arc<NodeState>);

impl ProtocolHandler for DataBucketHashesProtocol {
    #[allow(refining_impl_trait)]
    fn accept(&self, conn: Connection) -> BoxFuture<'static, Result<(), AcceptError>> {
        let state = self.0.clone();
        Box::pin(async move {
            authorize(&state, &conn).await?;
            let (mut send, mut recv) = conn.accept_bi().await?;
            let request: DataBucketHashesRequest = read_request(&mut recv).await?;

            let mut reply = Vec::with_capacity(request.bucket_indices.len());
            for index in request.bucket_indices {
                let hashes = state
                    .db
                    .bucket_hashes(index as usize, request.num_buckets as usize)
                    .await
                    .map_err(accept_err)?;
                reply.push(BucketHashes {
                    bucket_index: index,
                    hashes,
                });
            }
            send_reply(&mut send, &reply).await
        })
    }
}

/// `metadata/1.0`: the client streams raw 32-byte hashes and half-closes;
/// we stream back one JSON object per entry. Any unknown hash aborts the
/// stream early, which the client treats as a whole-batch failure.
#[derive(Debug, Clone)]
pub struct MetadataProtocol(pub(crate) Arc<NodeState>);

impl ProtocolHandler for MetadataProtocol {
    #[allow(refining_impl_trait)]
    fn accept(&self, conn: Connection) -> BoxFuture<'static, Result<(), AcceptError>> {
        let state = self.0.clone();
        Box::pin(async move {
            authorize(&state, &conn).await?;
            let (mut send, mut recv) = conn.accept_bi().await?;

            let mut page = vec![0u8; METADATA_PAGE_SIZE];
            let mut served = 0usize;
            loop {
                let n = read_page(&mut recv, &mut page).await?;
                if n == 0 {
                    break;
                }
                if n % HASH_SIZE != 0 {
                    return Err(accept_err("metadata request not a multiple of 32 bytes"));
                }
                served += n / HASH_SIZE;
                if served > crate::sync::MAX_METADATA_BATCH {
                    return Err(accept_err("metadata batch exceeds the 256 hash limit"));
                }

                let hashes = page[..n]
                    .chunks_exact(HASH_SIZE)
                    .map(crate::crypto::Hash32::try_from)
                    .collect::<Result<Vec<_>, _>>()
                    .map_err(accept_err)?;

                let entries = state
                    .db
                    .entries_by_hashes(&hashes)
                    .await
                    .map_err(accept_err)?;
                if entries.len() != hashes.len() {
                    // Closing without a full reply is the "not found" signal.
                    return Err(accept_err("requested hash not found"));
                }

                for entry in entries {
                    let mut line =
                        serde_json::to_vec(&MetadataEntry::from(entry)).map_err(accept_err)?;
                    line.push(b'\n');
                    send.write_all(&line)
                        .await
                        .map_err(|e| accept_err(std::io::Error::other(e)))?;
                }

                if n < METADATA_PAGE_SIZE {
                    break;
                }
            }

            send.finish().map_err(|e| accept_err(std::io::Error::other(e)))?;
            Ok(())
        })
    }
}

/// `file-data/1.0`: stream the requested byte range of a blob in 64 KiB
/// chunks.
#[derive(Debug, Clone)]
pub struct FileDataProtocol(pub(crate) Arc<NodeState>);

impl ProtocolHandler for FileDataProtocol {
    #[allow(refining_impl_trait)]
    fn accept(&self, conn: Connection) -> BoxFuture<'static, Result<(), AcceptError>> {
        let state = self.0.clone();
        Box::pin(async move {
            authorize(&state, &conn).await?;
            let (mut send, mut recv) = conn.accept_bi().await?;
            let request: FileDataRequest = read_request(&mut recv).await?;

            let path = state.objects.blob_path(&request.file_hash);
            let mut file = tokio::fs::File::open(&path).await.map_err(accept_err)?;
            let total_size = file.metadata().await.map_err(accept_err)?.len();
            file.seek(SeekFrom::Start(request.offset))
                .await
                .map_err(accept_err)?;

            let mut remaining = total_size.saturating_sub(request.offset);
            if request.length > 0 && request.length < remaining {
                remaining = request.length;
            }

            let mut buf = vec![0u8; FILE_STREAM_CHUNK_SIZE];
            while remaining > 0 {
                let to_read = (remaining as usize).min(FILE_STREAM_CHUNK_SIZE);
                let n = file.read(&mut buf[..to_read]).await.map_err(accept_err)?;
                if n == 0 {
                    break;
                }
                send.write_all(&buf[..n])
                    .await
                    .map_err(|e| accept_err(std::io::Error::other(e)))?;
                remaining -= n as u64;
            }

            send.finish().map_err(|e| accept_err(std::io::Error::other(e)))?;
            Ok(())
        })
    }
}
