//! Content-addressed store for encrypted file blobs.
//!
//! Each blob lives at `<data_dir>/<hex(hash)>` where the hash is the BLAKE3
//! of the encrypted content. Downloads append; a blob is only trusted after
//! [`ObjectStore::validate_or_remove`] has recomputed its hash.

use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use rand::RngCore;

use crate::crypto::{self, CryptoError, Hash32};

#[derive(Debug, thiserror::Error)]
pub enum ObjectStoreError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("crypto error: {0}")]
    Crypto(#[from] CryptoError),

    #[error("blob {0} not found")]
    NotFound(Hash32),

    #[error("blob {hash} failed validation and was removed")]
    Invalid { hash: Hash32 },
}

/// Filesystem-backed blob store.
#[derive(Debug, Clone)]
pub struct ObjectStore {
    data_dir: PathBuf,
}

impl ObjectStore {
    /// Open the store rooted at `data_dir`, creating the directory if
    /// needed.
    pub fn open(data_dir: impl Into<PathBuf>) -> Result<Self, ObjectStoreError> {
        let data_dir = data_dir.into();
        std::fs::create_dir_all(&data_dir)?;
        Ok(Self { data_dir })
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    pub fn blob_path(&self, hash: &Hash32) -> PathBuf {
        self.data_dir.join(hash.to_hex())
    }

    pub fn exists(&self, hash: &Hash32) -> bool {
        self.blob_path(hash).is_file()
    }

    /// Size of a stored (possibly partial) blob in bytes.
    pub fn len(&self, hash: &Hash32) -> Result<u64, ObjectStoreError> {
        let meta = std::fs::metadata(self.blob_path(hash))
            .map_err(|_| ObjectStoreError::NotFound(*hash))?;
        Ok(meta.len())
    }

    /// Open a blob for reading, returning the handle and its total size.
    pub fn open_for_read(&self, hash: &Hash32) -> Result<(File, u64), ObjectStoreError> {
        let file =
            File::open(self.blob_path(hash)).map_err(|_| ObjectStoreError::NotFound(*hash))?;
        let size = file.metadata()?.len();
        Ok((file, size))
    }

    /// Append bytes to a blob, creating it on first write. Resumable
    /// downloads call this once per buffer flush; the per-hash progress
    /// record in the database keeps writers exclusive.
    pub fn append(&self, hash: &Hash32, bytes: &[u8]) -> Result<(), ObjectStoreError> {
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.blob_path(hash))?;
        file.write_all(bytes)?;
        Ok(())
    }

    /// Truncate a partial blob to `len` bytes, so a resumed download can
    /// append from a known offset. A missing blob is treated as length zero.
    pub fn truncate(&self, hash: &Hash32, len: u64) -> Result<(), ObjectStoreError> {
        let path = self.blob_path(hash);
        match OpenOptions::new().write(true).open(&path) {
            Ok(file) => {
                file.set_len(len)?;
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound && len == 0 => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    pub fn remove(&self, hash: &Hash32) -> Result<(), ObjectStoreError> {
        match std::fs::remove_file(self.blob_path(hash)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Recompute the BLAKE3 of a stored blob. On mismatch the blob is
    /// deleted and an error returned; the caller resets download progress.
    pub fn validate_or_remove(&self, hash: &Hash32) -> Result<(), ObjectStoreError> {
        let (mut file, _) = self.open_for_read(hash)?;
        let mut hasher = blake3::Hasher::new();
        let mut buf = vec![0u8; 64 * 1024];
        loop {
            let n = file.read(&mut buf)?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
        }
        drop(file);

        let computed = Hash32::from(hasher.finalize());
        if computed != *hash {
            self.remove(hash)?;
            return Err(ObjectStoreError::Invalid { hash: *hash });
        }
        Ok(())
    }

    /// Stream-encrypt a local file into the store.
    ///
    /// The ciphertext is written to a temp file while tee-hashing, then
    /// renamed to its content address. Returns the blob hash and the
    /// ciphertext size.
    pub fn write_encrypted(
        &self,
        src_path: &Path,
        content_key: &[u8; 32],
    ) -> Result<(Hash32, u64), ObjectStoreError> {
        let mut src = File::open(src_path)?;

        let mut suffix = [0u8; 8];
        rand::rngs::OsRng.fill_bytes(&mut suffix);
        let temp_path = self.data_dir.join(format!("tmp-{}", hex::encode(suffix)));
        let mut dst = File::create(&temp_path)?;

        let mut hasher = blake3::Hasher::new();
        let size = match crypto::encrypt_stream(&mut dst, &mut src, content_key, Some(&mut hasher))
        {
            Ok(size) => size,
            Err(e) => {
                drop(dst);
                let _ = std::fs::remove_file(&temp_path);
                return Err(e.into());
            }
        };
        dst.sync_all()?;
        drop(dst);

        let hash = Hash32::from(hasher.finalize());
        std::fs::rename(&temp_path, self.blob_path(&hash))?;
        Ok((hash, size))
    }

    /// Stream-decrypt a stored blob to a local file.
    pub fn read_decrypted(
        &self,
        hash: &Hash32,
        dest_path: &Path,
        content_key: &[u8; 32],
    ) -> Result<(), ObjectStoreError> {
        let (mut src, _) = self.open_for_read(hash)?;
        let mut dst = File::create(dest_path)?;
        crypto::decrypt_stream(&mut dst, &mut src, content_key)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::hash;
    use tempfile::TempDir;

    fn store() -> (ObjectStore, TempDir) {
        let dir = TempDir::new().unwrap();
        let store = ObjectStore::open(dir.path().join("data")).unwrap();
        (store, dir)
    }

    #[test]
    fn append_and_validate() {
        let (store, _dir) = store();
        let content = b"encrypted bytes".to_vec();
        let h = hash(&content);

        assert!(!store.exists(&h));
        store.append(&h, &content[..8]).unwrap();
        store.append(&h, &content[8..]).unwrap();

        assert!(store.exists(&h));
        assert_eq!(store.len(&h).unwrap(), content.len() as u64);
        store.validate_or_remove(&h).unwrap();
    }

    #[test]
    fn validate_removes_corrupt_blob() {
        let (store, _dir) = store();
        let h = hash(b"expected content");
        store.append(&h, b"something else").unwrap();

        let err = store.validate_or_remove(&h).unwrap_err();
        assert!(matches!(err, ObjectStoreError::Invalid { .. }));
        assert!(!store.exists(&h), "corrupt blob must be deleted");
    }

    #[test]
    fn write_encrypted_names_blob_by_ciphertext_hash() {
        let (store, dir) = store();
        let src = dir.path().join("plain.bin");
        let plaintext: Vec<u8> = (0..100_000u32).map(|i| (i % 256) as u8).collect();
        std::fs::write(&src, &plaintext).unwrap();

        let key = [5u8; 32];
        let (blob_hash, size) = store.write_encrypted(&src, &key).unwrap();

        assert!(store.exists(&blob_hash));
        assert_eq!(store.len(&blob_hash).unwrap(), size);
        assert!(size > plaintext.len() as u64, "ciphertext carries overhead");
        // The filename is the hash of the stored ciphertext.
        store.validate_or_remove(&blob_hash).unwrap();

        // And it decrypts back to the original bytes.
        let out = dir.path().join("out.bin");
        store.read_decrypted(&blob_hash, &out, &key).unwrap();
        assert_eq!(std::fs::read(&out).unwrap(), plaintext);
    }

    #[test]
    fn open_missing_blob_errors() {
        let (store, _dir) = store();
        let h = hash(b"missing");
        assert!(matches!(
            store.open_for_read(&h),
            Err(ObjectStoreError::NotFound(_))
        ));
    }
}
