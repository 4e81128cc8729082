/**
 * Application facade exposed to front-ends.
 *  - App state machine (fresh / binding / locked / unlocked)
 *  - Vault lifecycle and UI-facing operations
 */
pub mod app;
/**
 * Cryptographic types and operations.
 *  - BLAKE3 hashing and the bucketed Merkle tree
 *  - AES-256-GCM sealing and the framed stream cipher
 *  - Key material, mnemonics, and scrypt derivations
 */
pub mod crypto;
/**
 * SQLite persistence: node properties, encrypted data entries,
 *  the authorized peer set, and the signed update log.
 */
pub mod db;
/**
 * The replicated log: signed updates and master-side publishing.
 */
pub mod log;
/**
 * Content-addressed store for encrypted file blobs on local disk.
 */
pub mod objects;
/**
 * Transport layer: iroh endpoint, wire protocols, broadcast topic,
 *  and the binding handshake.
 */
pub mod peer;
/**
 * The sync engine: reconciling this node with a received update and
 *  downloading blobs with resume.
 */
pub mod sync;
/**
 * The storage facade translating file and folder operations into
 *  encrypted entries.
 */
pub mod vault;
/**
 * Shared wire encoding helpers.
 */
pub mod wire;

pub mod prelude {
    pub use crate::app::{App, AppConfig, AppError, AppState};
    pub use crate::crypto::{Hash32, MerkleTree, VaultKeys};
    pub use crate::db::{Database, DataRow, PeerRecord};
    pub use crate::log::{DataAction, PeerAction, SignedUpdate, Update, UpdatePayload};
    pub use crate::objects::ObjectStore;
    pub use crate::peer::{Node, NodeBuilder};
    pub use crate::sync::{SyncClient, SyncError, SyncState};
    pub use crate::vault::{FolderItem, Vault};
}
