//! Data-set reconciliation: fast-forward, Merkle diff, and full rebuild.

use sqlx::{Sqlite, Transaction};

use super::{download::Download, BucketHashes, MetadataEntry, SyncClient, SyncError, SyncState};
use crate::crypto::MerkleTree;
use crate::db::{self, DataRow, DbError};
use crate::log::{DataAction, SignedUpdate, Update, UpdatePayload};

/// Apply the data portion of an update and commit the node state.
///
/// Returns the blob downloads the caller should schedule. Every database
/// write, the node-property advance, and the log append happen in one
/// transaction; the Merkle tree is swapped only after the commit succeeds.
pub(super) async fn sync_data(
    state: &SyncState,
    client: &dyn SyncClient,
    update: &Update,
    signed: &SignedUpdate,
) -> Result<Vec<Download>, SyncError> {
    let signed_json = signed.to_json()?;
    let local_hash = state.db.data_hash().await?;

    // Nothing to reconcile: a peer-only update. Just advance the node state.
    if update.data_hash == local_hash {
        let mut tx = state.db.begin().await?;
        commit_node_state(&mut tx, update, &signed_json).await?;
        tx.commit().await.map_err(DbError::from)?;
        return Ok(Vec::new());
    }

    // Fast-forward: one data change whose precondition matches our state.
    if update.prev_data_hash == local_hash {
        if let UpdatePayload::Data(change) = &update.payload {
            let mut tree = state.merkle.lock().await;
            let mut tentative = tree.clone();
            match change.action {
                DataAction::Add | DataAction::Modify => {
                    tentative.insert(change.hash);
                }
                DataAction::Delete => {
                    tentative.delete(&change.hash);
                }
            }

            if tentative.root_hash() == update.data_hash {
                let row = DataRow {
                    key: change.key.clone(),
                    value: change.value,
                    size: change.size,
                    hash: change.hash,
                };
                let mut tx = state.db.begin().await?;
                match change.action {
                    DataAction::Add | DataAction::Modify => {
                        // Folder tags need the content key; sync leaves them
                        // null and the vault backfills after commit.
                        db::data::put_entry(&mut *tx, &row, None).await?;
                    }
                    DataAction::Delete => {
                        db::data::delete_entry(&mut *tx, &row.key).await?;
                    }
                }
                commit_node_state(&mut tx, update, &signed_json).await?;
                tx.commit().await.map_err(DbError::from)?;
                *tree = tentative;

                let downloads = match (change.action, change.value) {
                    (DataAction::Add | DataAction::Modify, Some(value_hash)) => {
                        vec![Download {
                            value_hash,
                            size: change.size,
                        }]
                    }
                    _ => Vec::new(),
                };
                return Ok(downloads);
            }
            tracing::warn!(
                update_id = update.update_id,
                "fast-forward root mismatch; falling back to merkle diff"
            );
        }
    }

    // Out of step: reconcile by buckets against the update's origin peer.
    let num_buckets = update.num_buckets as usize;
    let local_buckets = state.merkle.lock().await.num_buckets();

    let (indices, stale_scope) = if local_buckets != num_buckets {
        // Bucket layouts don't line up at all; rebuild from every bucket.
        tracing::info!(
            update_id = update.update_id,
            local_buckets,
            num_buckets,
            "bucket count mismatch; full rebuild"
        );
        ((0..num_buckets).collect::<Vec<_>>(), StaleScope::All)
    } else {
        let peer_hashes = client.fetch_tree_bucket_hashes(update.num_buckets).await?;
        let diff = state.merkle.lock().await.diff_buckets(&peer_hashes);
        tracing::info!(
            update_id = update.update_id,
            differing = diff.len(),
            "merkle diff"
        );
        (diff.clone(), StaleScope::Buckets(diff))
    };

    reconcile(state, client, update, &signed_json, indices, stale_scope).await
}

enum StaleScope {
    All,
    Buckets(Vec<usize>),
}

async fn reconcile(
    state: &SyncState,
    client: &dyn SyncClient,
    update: &Update,
    signed_json: &str,
    indices: Vec<usize>,
    stale_scope: StaleScope,
) -> Result<Vec<Download>, SyncError> {
    let num_buckets = update.num_buckets as usize;
    let index_args: Vec<u32> = indices.iter().map(|&i| i as u32).collect();
    let remote_buckets: Vec<BucketHashes> = if index_args.is_empty() {
        Vec::new()
    } else {
        client
            .fetch_data_bucket_hashes(&index_args, update.num_buckets)
            .await?
    };

    // Hashes the peer has in the differing ranges; fetch metadata for the
    // ones we don't hold.
    let mut remote_hashes = Vec::new();
    for bucket in &remote_buckets {
        remote_hashes.extend(bucket.hashes.iter().copied());
    }
    let mut to_fetch = Vec::new();
    for hash in &remote_hashes {
        if !state.db.has_entry_hash(hash).await? {
            to_fetch.push(*hash);
        }
    }

    let fetched = fetch_metadata_batched(client, &to_fetch).await?;

    let mut tx = state.db.begin().await?;
    match &stale_scope {
        StaleScope::All => db::data::mark_all_stale(&mut *tx).await?,
        StaleScope::Buckets(buckets) => {
            for &bucket in buckets {
                db::data::mark_bucket_stale(&mut *tx, bucket, num_buckets).await?;
            }
        }
    }
    for hash in &remote_hashes {
        db::data::mark_hash_current(&mut *tx, hash).await?;
    }
    for entry in &fetched {
        db::data::put_entry(&mut *tx, &entry.clone().into_row(), None).await?;
    }
    let removed = db::data::delete_stale(&mut *tx).await?;

    // Verify against the update before committing anything.
    let hashes = db::data::all_entry_hashes(&mut *tx).await?;
    let tentative = MerkleTree::new_with_buckets(hashes, num_buckets);
    let root = tentative.root_hash();
    if root != update.data_hash {
        drop(tx);
        return Err(SyncError::RootMismatch {
            expected: update.data_hash,
            got: root,
        });
    }

    commit_node_state(&mut tx, update, signed_json).await?;
    tx.commit().await.map_err(DbError::from)?;
    *state.merkle.lock().await = tentative;

    tracing::debug!(
        inserted = fetched.len(),
        removed = removed.len(),
        "reconciled data set"
    );

    // Schedule downloads for new file entries, deduplicated by blob hash.
    let mut downloads: Vec<Download> = Vec::new();
    for entry in &fetched {
        if let Some(value_hash) = entry.value {
            if !downloads.iter().any(|d| d.value_hash == value_hash) {
                downloads.push(Download {
                    value_hash,
                    size: entry.size,
                });
            }
        }
    }
    Ok(downloads)
}

async fn fetch_metadata_batched(
    client: &dyn SyncClient,
    hashes: &[crate::crypto::Hash32],
) -> Result<Vec<MetadataEntry>, SyncError> {
    let mut fetched = Vec::with_capacity(hashes.len());
    for batch in hashes.chunks(super::MAX_METADATA_BATCH) {
        let entries = client.fetch_metadata(batch).await?;
        for entry in &entries {
            entry.verify()?;
        }
        fetched.extend(entries);
    }
    if fetched.len() != hashes.len() {
        return Err(SyncError::MetadataIncomplete {
            requested: hashes.len(),
            received: fetched.len(),
        });
    }
    Ok(fetched)
}

async fn commit_node_state(
    tx: &mut Transaction<'_, Sqlite>,
    update: &Update,
    signed_json: &str,
) -> Result<(), DbError> {
    db::node::set_current_update_id(&mut **tx, update.update_id).await?;
    db::node::set_hash_prop(&mut **tx, db::node::PROP_PEER_LIST_HASH, &update.peer_list_hash)
        .await?;
    db::node::set_hash_prop(&mut **tx, db::node::PROP_DATA_HASH, &update.data_hash).await?;
    db::node::node_set(&mut **tx, db::node::PROP_LATEST_UPDATE, signed_json).await?;
    db::updates::insert_signed_update(&mut **tx, update.update_id, signed_json).await?;
    Ok(())
}
