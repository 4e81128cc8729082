//! Wire protocols, one ALPN per concern.
//!
//! Request and reply bodies are JSON except for the two streaming flows:
//! `metadata/1.0` (client writes raw 32-byte hashes and half-closes, server
//! streams newline-delimited JSON entries) and `file-data/1.0` (server
//! streams the raw requested byte range). Inbound connections from peers
//! outside the authorized set are closed before any payload is exchanged.

use serde::{Deserialize, Serialize};

pub mod client;
mod handlers;

pub use client::NetworkSyncClient;
pub use handlers::{
    DataBucketHashesProtocol, FileDataProtocol, MetadataProtocol, PeerListProtocol,
    TreeBucketHashesProtocol,
};

use crate::crypto::Hash32;
use crate::db::PeerRecord;

pub const BIND_ALPN: &[u8] = b"/endershare/bind/1.0";
pub const PEER_LIST_ALPN: &[u8] = b"/endershare/peer-list/1.0";
pub const TREE_BUCKET_HASHES_ALPN: &[u8] = b"/endershare/tree-bucket-hashes/1.0";
pub const DATA_BUCKET_HASHES_ALPN: &[u8] = b"/endershare/data-bucket-hashes/1.0";
pub const METADATA_ALPN: &[u8] = b"/endershare/metadata/1.0";
pub const FILE_DATA_ALPN: &[u8] = b"/endershare/file-data/1.0";

/// Size cap for JSON request/reply bodies.
pub(crate) const MAX_MESSAGE_SIZE: usize = 1024 * 1024;

/// The metadata server reads client hashes in pages of this size
/// (256 hashes), and refuses larger batches by construction.
pub(crate) const METADATA_PAGE_SIZE: usize = 8 * 1024;

/// Chunk size for streaming file data onto the wire.
pub(crate) const FILE_STREAM_CHUNK_SIZE: usize = 64 * 1024;

/// One peer in a `peer-list/1.0` reply.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerInfoMsg {
    pub peer_id: String,
    pub addresses: Vec<String>,
}

impl From<PeerRecord> for PeerInfoMsg {
    fn from(record: PeerRecord) -> Self {
        Self {
            peer_id: record.peer_id,
            addresses: record.addrs,
        }
    }
}

impl From<PeerInfoMsg> for PeerRecord {
    fn from(msg: PeerInfoMsg) -> Self {
        PeerRecord::new(msg.peer_id, msg.addresses)
    }
}

/// Request body of `tree-bucket-hashes/1.0`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TreeBucketHashesRequest {
    pub num_buckets: u32,
}

/// Request body of `data-bucket-hashes/1.0`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataBucketHashesRequest {
    pub bucket_indices: Vec<u32>,
    pub num_buckets: u32,
}

/// Request body of `file-data/1.0`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileDataRequest {
    pub file_hash: Hash32,
    pub offset: u64,
    pub length: u64,
}
