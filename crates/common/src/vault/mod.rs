//! The storage facade: file and folder operations over encrypted rows.
//!
//! Only nodes holding the content key construct a [`Vault`]. User actions
//! become encrypted data rows plus blob writes; the caller (the app layer on
//! a master) hands the produced [`NewEntry`] to the update publisher.
//!
//! Lookups are indexed: children of a folder are found by the keyed folder
//! tag, and the folder tree itself is mirrored in an in-memory index that is
//! rebuilt after sync. No operation decrypts the whole table.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use tokio::sync::Mutex;

pub mod entry;

pub use entry::{
    folder_tag, EntryMeta, FileMeta, FolderItem, FolderMeta, PathSegment, ROOT_FOLDER_ID,
};

use crate::crypto::{self, CryptoError, Hash32};
use crate::db::{self, Database, DataRow, DbError};
use crate::objects::{ObjectStore, ObjectStoreError};

#[derive(Debug, thiserror::Error)]
pub enum VaultError {
    #[error("database error: {0}")]
    Db(#[from] DbError),

    #[error("crypto error: {0}")]
    Crypto(#[from] CryptoError),

    #[error("object store error: {0}")]
    ObjectStore(#[from] ObjectStoreError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("file not found: {name} in folder {folder_id}")]
    FileNotFound { name: String, folder_id: u64 },

    #[error("folder not found: {0}")]
    FolderNotFound(u64),

    #[error("folder {0} is not empty")]
    FolderNotEmpty(u64),

    #[error("the root folder cannot be deleted")]
    CannotDeleteRoot,

    #[error("blob {0} is not available locally yet")]
    BlobUnavailable(Hash32),

    #[error("background task failed: {0}")]
    Task(String),
}

/// A freshly written (or deleted) data row, ready to be published.
#[derive(Debug, Clone)]
pub struct NewEntry {
    pub row: DataRow,
    pub folder_tag: Hash32,
}

#[derive(Debug, Clone)]
struct FolderNode {
    name: String,
    parent: u64,
    /// Ciphertext row key of the folder's own entry.
    row_key: Vec<u8>,
}

#[derive(Debug, Default)]
struct FolderIndex {
    by_id: HashMap<u64, FolderNode>,
    next_id: u64,
}

impl FolderIndex {
    fn allocate(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }
}

/// File and folder operations over the encrypted store.
pub struct Vault {
    db: Database,
    objects: ObjectStore,
    content_key: [u8; 32],
    folders: Mutex<FolderIndex>,
}

impl Vault {
    /// Open the vault and build the folder index from the current rows.
    pub async fn load(
        db: Database,
        objects: ObjectStore,
        content_key: [u8; 32],
    ) -> Result<Self, VaultError> {
        let vault = Self {
            db,
            objects,
            content_key,
            folders: Mutex::new(FolderIndex::default()),
        };
        vault.reload_folder_ids().await?;
        Ok(vault)
    }

    pub fn objects(&self) -> &ObjectStore {
        &self.objects
    }

    fn decrypt_meta(&self, row_key: &[u8]) -> Result<EntryMeta, VaultError> {
        let plaintext = crypto::open(&self.content_key, row_key)?;
        Ok(serde_json::from_slice(&plaintext)?)
    }

    fn seal_meta(&self, meta: &EntryMeta) -> Result<Vec<u8>, VaultError> {
        let json = serde_json::to_vec(meta)?;
        Ok(crypto::seal(&self.content_key, &json)?)
    }

    /// Rebuild the in-memory folder tree and next-id counter by scanning
    /// the table. Called at load and after every applied update.
    pub async fn reload_folder_ids(&self) -> Result<(), VaultError> {
        let mut index = FolderIndex {
            by_id: HashMap::new(),
            // Folder id 0 is the root; fresh ids start past the maximum.
            next_id: 1,
        };
        for row in self.db.all_entries().await? {
            // Rows that fail to decrypt are not ours to interpret.
            let Ok(meta) = self.decrypt_meta(&row.key) else {
                continue;
            };
            if let EntryMeta::Folder(folder) = meta {
                index.next_id = index.next_id.max(folder.folder_id + 1);
                index.by_id.insert(
                    folder.folder_id,
                    FolderNode {
                        name: folder.name,
                        parent: folder.parent_folder_id,
                        row_key: row.key,
                    },
                );
            }
        }
        *self.folders.lock().await = index;
        Ok(())
    }

    /// Encrypt a local file into the object store and record its entry.
    pub async fn add_file(
        &self,
        local_path: &Path,
        name: &str,
        parent_folder_id: u64,
    ) -> Result<NewEntry, VaultError> {
        self.require_folder(parent_folder_id).await?;
        let plain_size = std::fs::metadata(local_path)?.len();

        let objects = self.objects.clone();
        let content_key = self.content_key;
        let src = PathBuf::from(local_path);
        let (value_hash, cipher_size) =
            tokio::task::spawn_blocking(move || objects.write_encrypted(&src, &content_key))
                .await
                .map_err(|e| VaultError::Task(e.to_string()))??;

        let now = time::OffsetDateTime::now_utc();
        let meta = EntryMeta::File(FileMeta {
            name: name.to_owned(),
            size: plain_size,
            created_at: now,
            modified_at: now,
            folder_id: parent_folder_id,
        });
        let row_key = self.seal_meta(&meta)?;
        let hash = crypto::entry_hash(&row_key, Some(&value_hash), cipher_size);
        let tag = folder_tag(&self.content_key, parent_folder_id);

        let row = DataRow {
            key: row_key,
            value: Some(value_hash),
            size: cipher_size,
            hash,
        };
        db::data::put_entry(self.db.pool(), &row, Some(&tag)).await?;
        // The blob is local in full.
        db::data::set_download_progress(self.db.pool(), &value_hash, cipher_size).await?;

        tracing::debug!(name, parent_folder_id, blob = %value_hash, "added file");
        Ok(NewEntry {
            row,
            folder_tag: tag,
        })
    }

    /// Create a folder under `parent_folder_id` and return its new id.
    pub async fn create_folder(
        &self,
        name: &str,
        parent_folder_id: u64,
    ) -> Result<(u64, NewEntry), VaultError> {
        self.require_folder(parent_folder_id).await?;

        let mut index = self.folders.lock().await;
        let folder_id = index.allocate();

        let meta = EntryMeta::Folder(FolderMeta {
            folder_id,
            parent_folder_id,
            name: name.to_owned(),
        });
        let row_key = self.seal_meta(&meta)?;
        let hash = crypto::entry_hash(&row_key, None, 0);
        let tag = folder_tag(&self.content_key, parent_folder_id);

        let row = DataRow {
            key: row_key.clone(),
            value: None,
            size: 0,
            hash,
        };
        db::data::put_entry(self.db.pool(), &row, Some(&tag)).await?;

        index.by_id.insert(
            folder_id,
            FolderNode {
                name: name.to_owned(),
                parent: parent_folder_id,
                row_key,
            },
        );
        drop(index);

        tracing::debug!(name, folder_id, parent_folder_id, "created folder");
        Ok((
            folder_id,
            NewEntry {
                row,
                folder_tag: tag,
            },
        ))
    }

    /// List the contents of a folder via the tag index.
    pub async fn list_folder(&self, folder_id: u64) -> Result<Vec<FolderItem>, VaultError> {
        self.require_folder(folder_id).await?;
        let tag = folder_tag(&self.content_key, folder_id);
        let mut items = Vec::new();
        for row in self.db.entries_by_folder_tag(&tag).await? {
            let Ok(meta) = self.decrypt_meta(&row.key) else {
                continue;
            };
            match meta {
                EntryMeta::File(file) => items.push(FolderItem::File {
                    name: file.name,
                    size: file.size,
                    modified_at: file.modified_at,
                }),
                EntryMeta::Folder(folder) => items.push(FolderItem::Folder {
                    folder_id: folder.folder_id,
                    name: folder.name,
                }),
            }
        }
        Ok(items)
    }

    async fn find_file(
        &self,
        name: &str,
        folder_id: u64,
    ) -> Result<(DataRow, FileMeta), VaultError> {
        let tag = folder_tag(&self.content_key, folder_id);
        for row in self.db.entries_by_folder_tag(&tag).await? {
            let Ok(meta) = self.decrypt_meta(&row.key) else {
                continue;
            };
            if let EntryMeta::File(file) = meta {
                if file.name == name {
                    return Ok((row, file));
                }
            }
        }
        Err(VaultError::FileNotFound {
            name: name.to_owned(),
            folder_id,
        })
    }

    /// Decrypt a stored file to `dest_path`.
    pub async fn export_file(
        &self,
        name: &str,
        folder_id: u64,
        dest_path: &Path,
    ) -> Result<(), VaultError> {
        let (row, _meta) = self.find_file(name, folder_id).await?;
        let value_hash = row.value.ok_or_else(|| VaultError::FileNotFound {
            name: name.to_owned(),
            folder_id,
        })?;

        // A replicated row may precede its blob.
        if !self.objects.exists(&value_hash)
            || self.db.download_progress(&value_hash).await? < row.size
        {
            return Err(VaultError::BlobUnavailable(value_hash));
        }

        let objects = self.objects.clone();
        let content_key = self.content_key;
        let dest = PathBuf::from(dest_path);
        tokio::task::spawn_blocking(move || {
            objects.read_decrypted(&value_hash, &dest, &content_key)
        })
        .await
        .map_err(|e| VaultError::Task(e.to_string()))??;
        Ok(())
    }

    /// Remove a file row. The blob is left in place (no garbage collection
    /// of superseded content).
    pub async fn delete_file(&self, name: &str, folder_id: u64) -> Result<NewEntry, VaultError> {
        let (row, _meta) = self.find_file(name, folder_id).await?;
        db::data::delete_entry(self.db.pool(), &row.key).await?;
        let tag = folder_tag(&self.content_key, folder_id);
        tracing::debug!(name, folder_id, "deleted file");
        Ok(NewEntry {
            row,
            folder_tag: tag,
        })
    }

    /// Remove an empty folder.
    pub async fn delete_folder(&self, folder_id: u64) -> Result<NewEntry, VaultError> {
        if folder_id == ROOT_FOLDER_ID {
            return Err(VaultError::CannotDeleteRoot);
        }

        let children_tag = folder_tag(&self.content_key, folder_id);
        if !self.db.entries_by_folder_tag(&children_tag).await?.is_empty() {
            return Err(VaultError::FolderNotEmpty(folder_id));
        }

        let mut index = self.folders.lock().await;
        let node = index
            .by_id
            .get(&folder_id)
            .cloned()
            .ok_or(VaultError::FolderNotFound(folder_id))?;
        let row = self
            .db
            .get_entry(&node.row_key)
            .await?
            .ok_or(VaultError::FolderNotFound(folder_id))?;

        db::data::delete_entry(self.db.pool(), &node.row_key).await?;
        index.by_id.remove(&folder_id);
        drop(index);

        let tag = folder_tag(&self.content_key, node.parent);
        tracing::debug!(folder_id, "deleted folder");
        Ok(NewEntry {
            row,
            folder_tag: tag,
        })
    }

    /// Breadcrumb path from the root to a folder.
    pub async fn get_folder_path(&self, folder_id: u64) -> Result<Vec<PathSegment>, VaultError> {
        let index = self.folders.lock().await;
        let mut segments = Vec::new();
        let mut current = folder_id;
        while current != ROOT_FOLDER_ID {
            let node = index
                .by_id
                .get(&current)
                .ok_or(VaultError::FolderNotFound(current))?;
            segments.push(PathSegment {
                name: node.name.clone(),
                folder_id: current,
            });
            current = node.parent;
        }
        segments.push(PathSegment {
            name: "/".to_owned(),
            folder_id: ROOT_FOLDER_ID,
        });
        segments.reverse();
        Ok(segments)
    }

    /// Compute folder tags for rows that arrived through sync without one.
    pub async fn backfill_folder_tags(&self) -> Result<usize, VaultError> {
        let mut tagged = 0;
        for row in self.db.entries_missing_folder_tag().await? {
            let Ok(meta) = self.decrypt_meta(&row.key) else {
                continue;
            };
            let tag = folder_tag(&self.content_key, meta.parent_folder_id());
            db::data::set_folder_tag(self.db.pool(), &row.key, &tag).await?;
            tagged += 1;
        }
        if tagged > 0 {
            tracing::debug!(tagged, "backfilled folder tags");
        }
        Ok(tagged)
    }

    /// Entry count and total stored ciphertext bytes.
    pub async fn storage_stats(&self) -> Result<(u64, u64), VaultError> {
        Ok(self.db.storage_stats().await?)
    }

    async fn require_folder(&self, folder_id: u64) -> Result<(), VaultError> {
        if folder_id == ROOT_FOLDER_ID {
            return Ok(());
        }
        let index = self.folders.lock().await;
        if index.by_id.contains_key(&folder_id) {
            Ok(())
        } else {
            Err(VaultError::FolderNotFound(folder_id))
        }
    }
}
