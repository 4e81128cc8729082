//! Entry metadata: the plaintext behind each encrypted row key.

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::crypto::Hash32;

/// The root folder. Always exists, never stored.
pub const ROOT_FOLDER_ID: u64 = 0;

/// Decrypted payload of a data row's ciphertext key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum EntryMeta {
    #[serde(rename = "file")]
    File(FileMeta),
    #[serde(rename = "folder")]
    Folder(FolderMeta),
}

/// A file. `size` is the plaintext size; the ciphertext size lives in the
/// row's `size` column.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileMeta {
    pub name: String,
    pub size: u64,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub modified_at: OffsetDateTime,
    pub folder_id: u64,
}

/// A folder in the tree. Folder id 0 is the implicit root.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FolderMeta {
    pub folder_id: u64,
    pub parent_folder_id: u64,
    pub name: String,
}

/// One listing result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FolderItem {
    File {
        name: String,
        size: u64,
        modified_at: OffsetDateTime,
    },
    Folder {
        folder_id: u64,
        name: String,
    },
}

/// A breadcrumb segment of a folder path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathSegment {
    pub name: String,
    pub folder_id: u64,
}

/// Keyed index tag for a folder's children.
///
/// `blake3::keyed_hash(content_key, folder_id_le64)`: deterministic for the
/// key holder, opaque to replicas, so folder listings never require
/// decrypting row keys.
pub fn folder_tag(content_key: &[u8; 32], folder_id: u64) -> Hash32 {
    blake3::keyed_hash(content_key, &folder_id.to_le_bytes()).into()
}

impl EntryMeta {
    /// The folder this entry lives in (its tag parent).
    pub fn parent_folder_id(&self) -> u64 {
        match self {
            EntryMeta::File(file) => file.folder_id,
            EntryMeta::Folder(folder) => folder.parent_folder_id,
        }
    }
}
