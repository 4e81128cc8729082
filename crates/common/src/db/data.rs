//! The encrypted data table: one row per vault entry.
//!
//! `key` is the AES-GCM ciphertext of the entry metadata, `value` the blob
//! content hash (NULL for folders), `size` the ciphertext size, `hash` the
//! entry hash the Merkle tree tracks. `in_current` and `download_progress`
//! are sync bookkeeping; `folder_tag` is the keyed listing index.

use sqlx::{Executor, Row, Sqlite};

use super::{Database, DbError};
use crate::crypto::merkle::bucket_range;
use crate::crypto::{Hash32, HASH_SIZE};

/// One row of the data table, as exchanged with the sync layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataRow {
    pub key: Vec<u8>,
    pub value: Option<Hash32>,
    pub size: u64,
    pub hash: Hash32,
}

fn decode_row(row: &sqlx::sqlite::SqliteRow) -> Result<DataRow, DbError> {
    let value: Option<Vec<u8>> = row.get("value");
    let value = value
        .map(|v| Hash32::try_from(v.as_slice()).map_err(|_| DbError::CorruptValue("data.value")))
        .transpose()?;
    let hash: Vec<u8> = row.get("hash");
    let hash = Hash32::try_from(hash.as_slice()).map_err(|_| DbError::CorruptValue("data.hash"))?;
    Ok(DataRow {
        key: row.get("key"),
        value,
        size: row.get::<i64, _>("size") as u64,
        hash,
    })
}

fn decode_hash(row: &sqlx::sqlite::SqliteRow) -> Result<Hash32, DbError> {
    let hash: Vec<u8> = row.get("hash");
    Hash32::try_from(hash.as_slice()).map_err(|_| DbError::CorruptValue("data.hash"))
}

/// Insert or replace a data entry.
pub async fn put_entry<'e, E>(
    ex: E,
    row: &DataRow,
    folder_tag: Option<&Hash32>,
) -> Result<(), DbError>
where
    E: Executor<'e, Database = Sqlite>,
{
    sqlx::query(
        "INSERT OR REPLACE INTO data (key, value, size, hash, folder_tag) \
         VALUES (?, ?, ?, ?, ?)",
    )
    .bind(&row.key)
    .bind(row.value.as_ref().map(|v| v.to_vec()))
    .bind(row.size as i64)
    .bind(row.hash.to_vec())
    .bind(folder_tag.map(|t| t.to_vec()))
    .execute(ex)
    .await?;
    Ok(())
}

/// Delete a data entry by its ciphertext key.
pub async fn delete_entry<'e, E>(ex: E, key: &[u8]) -> Result<(), DbError>
where
    E: Executor<'e, Database = Sqlite>,
{
    sqlx::query("DELETE FROM data WHERE key = ?")
        .bind(key)
        .execute(ex)
        .await?;
    Ok(())
}

/// Mark every entry stale ahead of a full rebuild.
pub async fn mark_all_stale<'e, E>(ex: E) -> Result<(), DbError>
where
    E: Executor<'e, Database = Sqlite>,
{
    sqlx::query("UPDATE data SET in_current = 0").execute(ex).await?;
    Ok(())
}

/// Mark stale only the entries whose hash falls inside one bucket's range.
/// The diff path uses this so buckets that already match survive untouched.
pub async fn mark_bucket_stale<'e, E>(
    ex: E,
    bucket_index: usize,
    num_buckets: usize,
) -> Result<(), DbError>
where
    E: Executor<'e, Database = Sqlite>,
{
    let (start, end) = bucket_range(bucket_index, num_buckets);
    match end {
        Some(end) => {
            sqlx::query("UPDATE data SET in_current = 0 WHERE hash >= ? AND hash < ?")
                .bind(start.to_vec())
                .bind(end.to_vec())
                .execute(ex)
                .await?
        }
        None => {
            sqlx::query("UPDATE data SET in_current = 0 WHERE hash >= ?")
                .bind(start.to_vec())
                .execute(ex)
                .await?
        }
    };
    Ok(())
}

/// Mark one hash current again.
pub async fn mark_hash_current<'e, E>(ex: E, hash: &Hash32) -> Result<(), DbError>
where
    E: Executor<'e, Database = Sqlite>,
{
    sqlx::query("UPDATE data SET in_current = 1 WHERE hash = ?")
        .bind(hash.to_vec())
        .execute(ex)
        .await?;
    Ok(())
}

/// Delete every entry still marked stale; returns the removed rows so the
/// caller can drop them from the Merkle tree as well.
pub async fn delete_stale<'e, E>(ex: E) -> Result<Vec<DataRow>, DbError>
where
    E: Executor<'e, Database = Sqlite>,
{
    let rows = sqlx::query(
        "DELETE FROM data WHERE in_current = 0 RETURNING key, value, size, hash",
    )
    .fetch_all(ex)
    .await?;
    rows.iter().map(decode_row).collect()
}

/// Record download progress for a blob, keyed by its content hash.
pub async fn set_download_progress<'e, E>(
    ex: E,
    value_hash: &Hash32,
    progress: u64,
) -> Result<(), DbError>
where
    E: Executor<'e, Database = Sqlite>,
{
    sqlx::query("UPDATE data SET download_progress = ? WHERE value = ?")
        .bind(progress as i64)
        .bind(value_hash.to_vec())
        .execute(ex)
        .await?;
    Ok(())
}

/// Every entry hash, ascending, through an arbitrary executor. The sync
/// engine rebuilds its tentative Merkle tree from this inside the commit
/// transaction.
pub async fn all_entry_hashes<'e, E>(ex: E) -> Result<Vec<Hash32>, DbError>
where
    E: Executor<'e, Database = Sqlite>,
{
    let rows = sqlx::query("SELECT hash FROM data ORDER BY hash")
        .fetch_all(ex)
        .await?;
    rows.iter().map(decode_hash).collect()
}

/// Set the folder tag on an existing entry.
pub async fn set_folder_tag<'e, E>(ex: E, key: &[u8], tag: &Hash32) -> Result<(), DbError>
where
    E: Executor<'e, Database = Sqlite>,
{
    sqlx::query("UPDATE data SET folder_tag = ? WHERE key = ?")
        .bind(tag.to_vec())
        .bind(key)
        .execute(ex)
        .await?;
    Ok(())
}

impl Database {
    pub async fn get_entry(&self, key: &[u8]) -> Result<Option<DataRow>, DbError> {
        let row = sqlx::query("SELECT key, value, size, hash FROM data WHERE key = ?")
            .bind(key)
            .fetch_optional(self.pool())
            .await?;
        row.as_ref().map(decode_row).transpose()
    }

    /// All entries, in no particular order. Used only for the folder index
    /// reload on an unlocked node; steady-state lookups go through the
    /// folder tag index.
    pub async fn all_entries(&self) -> Result<Vec<DataRow>, DbError> {
        let rows = sqlx::query("SELECT key, value, size, hash FROM data")
            .fetch_all(self.pool())
            .await?;
        rows.iter().map(decode_row).collect()
    }

    /// Every entry hash, ascending. Feeds Merkle tree construction.
    pub async fn all_entry_hashes(&self) -> Result<Vec<Hash32>, DbError> {
        let rows = sqlx::query("SELECT hash FROM data ORDER BY hash")
            .fetch_all(self.pool())
            .await?;
        rows.iter().map(decode_hash).collect()
    }

    /// The entry hashes landing in one bucket, ascending. The range scan
    /// mirrors the Merkle tree's bucket partitioning exactly.
    pub async fn bucket_hashes(
        &self,
        bucket_index: usize,
        num_buckets: usize,
    ) -> Result<Vec<Hash32>, DbError> {
        let (start, end) = bucket_range(bucket_index, num_buckets);
        let rows = match end {
            Some(end) => {
                sqlx::query("SELECT hash FROM data WHERE hash >= ? AND hash < ? ORDER BY hash")
                    .bind(start.to_vec())
                    .bind(end.to_vec())
                    .fetch_all(self.pool())
                    .await?
            }
            None => {
                sqlx::query("SELECT hash FROM data WHERE hash >= ? ORDER BY hash")
                    .bind(start.to_vec())
                    .fetch_all(self.pool())
                    .await?
            }
        };
        rows.iter().map(decode_hash).collect()
    }

    /// Full rows for a set of entry hashes. Hashes with no local row are
    /// simply absent from the result; the caller compares counts.
    pub async fn entries_by_hashes(&self, hashes: &[Hash32]) -> Result<Vec<DataRow>, DbError> {
        let mut entries = Vec::with_capacity(hashes.len());
        for hash in hashes {
            let row = sqlx::query("SELECT key, value, size, hash FROM data WHERE hash = ?")
                .bind(hash.to_vec())
                .fetch_optional(self.pool())
                .await?;
            if let Some(row) = row {
                entries.push(decode_row(&row)?);
            }
        }
        Ok(entries)
    }

    /// True when an entry with this hash exists locally.
    pub async fn has_entry_hash(&self, hash: &Hash32) -> Result<bool, DbError> {
        let row = sqlx::query("SELECT 1 AS x FROM data WHERE hash = ? LIMIT 1")
            .bind(hash.to_vec())
            .fetch_optional(self.pool())
            .await?;
        Ok(row.is_some())
    }

    /// Entries in one folder, located via the keyed folder tag index.
    pub async fn entries_by_folder_tag(&self, tag: &Hash32) -> Result<Vec<DataRow>, DbError> {
        let rows = sqlx::query("SELECT key, value, size, hash FROM data WHERE folder_tag = ?")
            .bind(tag.to_vec())
            .fetch_all(self.pool())
            .await?;
        rows.iter().map(decode_row).collect()
    }

    /// Entries synced in without a folder tag yet (replicated rows arrive
    /// untagged; the tag needs the content key).
    pub async fn entries_missing_folder_tag(&self) -> Result<Vec<DataRow>, DbError> {
        let rows = sqlx::query("SELECT key, value, size, hash FROM data WHERE folder_tag IS NULL")
            .fetch_all(self.pool())
            .await?;
        rows.iter().map(decode_row).collect()
    }

    /// Download progress for a blob; 0 when unknown or not started.
    pub async fn download_progress(&self, value_hash: &Hash32) -> Result<u64, DbError> {
        let row = sqlx::query("SELECT download_progress FROM data WHERE value = ? LIMIT 1")
            .bind(value_hash.to_vec())
            .fetch_optional(self.pool())
            .await?;
        Ok(row
            .map(|r| r.get::<i64, _>("download_progress") as u64)
            .unwrap_or(0))
    }

    /// Blobs whose recorded download progress is short of their size.
    /// The periodic tick retries these.
    pub async fn incomplete_downloads(&self) -> Result<Vec<(Hash32, u64)>, DbError> {
        let rows = sqlx::query(
            "SELECT DISTINCT value, size FROM data \
             WHERE value IS NOT NULL AND download_progress < size",
        )
        .fetch_all(self.pool())
        .await?;
        rows.iter()
            .map(|r| {
                let value: Vec<u8> = r.get("value");
                let hash = Hash32::try_from(value.as_slice())
                    .map_err(|_| DbError::CorruptValue("data.value"))?;
                Ok((hash, r.get::<i64, _>("size") as u64))
            })
            .collect()
    }

    /// Current entry count and total stored ciphertext bytes.
    pub async fn storage_stats(&self) -> Result<(u64, u64), DbError> {
        let row = sqlx::query(
            "SELECT COUNT(*) AS count, COALESCE(SUM(size), 0) AS total \
             FROM data WHERE in_current = 1",
        )
        .fetch_one(self.pool())
        .await?;
        Ok((
            row.get::<i64, _>("count") as u64,
            row.get::<i64, _>("total") as u64,
        ))
    }
}

// Keep the constant referenced so schema drift shows up here.
const _: () = assert!(HASH_SIZE == 32);

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{entry_hash, hash, merkle::bucket_index};

    fn row(n: u8) -> DataRow {
        let key = vec![n; 48];
        let value = hash(&[n, 1]);
        let hash = entry_hash(&key, Some(&value), 100 + n as u64);
        DataRow {
            key,
            value: Some(value),
            size: 100 + n as u64,
            hash,
        }
    }

    #[tokio::test]
    async fn put_get_delete_roundtrip() {
        let db = Database::memory().await.unwrap();
        let entry = row(1);

        put_entry(db.pool(), &entry, None).await.unwrap();
        assert_eq!(db.get_entry(&entry.key).await.unwrap().unwrap(), entry);

        delete_entry(db.pool(), &entry.key).await.unwrap();
        assert!(db.get_entry(&entry.key).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn bucket_scan_matches_merkle_partitioning() {
        let db = Database::memory().await.unwrap();
        let rows: Vec<DataRow> = (0u8..30).map(row).collect();
        for r in &rows {
            put_entry(db.pool(), r, None).await.unwrap();
        }

        let num_buckets = 4;
        let mut seen = 0;
        for i in 0..num_buckets {
            let bucket = db.bucket_hashes(i, num_buckets).await.unwrap();
            assert!(bucket.windows(2).all(|w| w[0] < w[1]), "ascending order");
            for h in &bucket {
                assert_eq!(bucket_index(h, num_buckets), i);
            }
            seen += bucket.len();
        }
        assert_eq!(seen, rows.len());
    }

    #[tokio::test]
    async fn stale_marking_is_range_scoped() {
        let db = Database::memory().await.unwrap();
        let rows: Vec<DataRow> = (0u8..20).map(row).collect();
        for r in &rows {
            put_entry(db.pool(), r, None).await.unwrap();
        }

        let num_buckets = 4;
        mark_bucket_stale(db.pool(), 0, num_buckets).await.unwrap();
        let deleted = delete_stale(db.pool()).await.unwrap();

        let expected: Vec<&DataRow> = rows
            .iter()
            .filter(|r| bucket_index(&r.hash, num_buckets) == 0)
            .collect();
        assert_eq!(deleted.len(), expected.len());
        // Entries outside the bucket survive.
        let (count, _) = db.storage_stats().await.unwrap();
        assert_eq!(count as usize, rows.len() - expected.len());
    }

    #[tokio::test]
    async fn stale_then_current_survives() {
        let db = Database::memory().await.unwrap();
        let entry = row(7);
        put_entry(db.pool(), &entry, None).await.unwrap();

        mark_all_stale(db.pool()).await.unwrap();
        mark_hash_current(db.pool(), &entry.hash).await.unwrap();
        let deleted = delete_stale(db.pool()).await.unwrap();

        assert!(deleted.is_empty());
        assert!(db.get_entry(&entry.key).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn download_progress_tracks_by_value_hash() {
        let db = Database::memory().await.unwrap();
        let entry = row(2);
        put_entry(db.pool(), &entry, None).await.unwrap();

        let value = entry.value.unwrap();
        assert_eq!(db.download_progress(&value).await.unwrap(), 0);
        set_download_progress(db.pool(), &value, 300 * 1024)
            .await
            .unwrap();
        assert_eq!(db.download_progress(&value).await.unwrap(), 300 * 1024);
    }

    #[tokio::test]
    async fn folder_tag_lookup() {
        let db = Database::memory().await.unwrap();
        let tag = hash(b"tag");
        let tagged = row(3);
        let untagged = row(4);
        put_entry(db.pool(), &tagged, Some(&tag)).await.unwrap();
        put_entry(db.pool(), &untagged, None).await.unwrap();

        let found = db.entries_by_folder_tag(&tag).await.unwrap();
        assert_eq!(found, vec![tagged]);

        let missing = db.entries_missing_folder_tag().await.unwrap();
        assert_eq!(missing, vec![untagged.clone()]);

        set_folder_tag(db.pool(), &untagged.key, &tag).await.unwrap();
        assert!(db.entries_missing_folder_tag().await.unwrap().is_empty());
    }
}
