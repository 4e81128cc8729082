//! Master-side update publishing.
//!
//! Each publish reads the current node state, applies the change to the
//! local store and Merkle tree, signs the resulting update, and commits the
//! log row together with the node properties in one transaction. The caller
//! broadcasts the returned signed update. A failed commit restores the tree
//! snapshot so the in-memory state never runs ahead of the database.

use time::OffsetDateTime;
use tokio::sync::Mutex;

use super::update::{
    peer_list_hash, DataAction, DataChange, PeerAction, PeerChange, SignedUpdate, Update,
    UpdateError, UpdatePayload,
};
use crate::crypto::{Hash32, MerkleTree, VaultKeys};
use crate::db::{self, Database, DataRow, DbError, PeerRecord};

#[derive(Debug, thiserror::Error)]
pub enum PublishError {
    #[error("only the master may publish updates")]
    NotMaster,

    #[error("database error: {0}")]
    Db(#[from] DbError),

    #[error("update error: {0}")]
    Update(#[from] UpdateError),
}

/// Publish a data update: apply the entry change locally, then sign and
/// record an update whose `data_hash` is the post-change Merkle root.
///
/// For `Add`/`Modify` the row is (re)written, which is idempotent when the
/// storage facade already wrote it. For `Delete` the row and its tree entry
/// go away.
pub async fn publish_data_update(
    db: &Database,
    merkle: &Mutex<MerkleTree>,
    keys: &VaultKeys,
    action: DataAction,
    entry: DataRow,
    folder_tag: Option<Hash32>,
) -> Result<SignedUpdate, PublishError> {
    if !keys.is_master() {
        return Err(PublishError::NotMaster);
    }

    let current_id = db.current_update_id().await?;
    let prev_data_hash = db.data_hash().await?;
    let peer_hash = db.peer_list_hash().await?;

    // The tree lock is held across the commit so concurrent publishes
    // serialize and the root in the update always matches the log order.
    let mut tree = merkle.lock().await;
    let snapshot = tree.clone();

    match action {
        DataAction::Add | DataAction::Modify => {
            tree.insert(entry.hash);
        }
        DataAction::Delete => {
            tree.delete(&entry.hash);
        }
    }
    let data_hash = tree.root_hash();
    let num_buckets = tree.num_buckets() as u32;

    let update = Update {
        update_id: current_id + 1,
        peer_list_hash: peer_hash,
        prev_peer_list_hash: peer_hash,
        data_hash,
        prev_data_hash,
        num_buckets,
        payload: UpdatePayload::Data(DataChange {
            action,
            key: entry.key.clone(),
            value: entry.value,
            size: entry.size,
            hash: entry.hash,
        }),
        timestamp: OffsetDateTime::now_utc().unix_timestamp(),
    };
    let signed = SignedUpdate::sign(&update, keys)?;
    let signed_json = signed.to_json()?;

    let result = async {
        let mut tx = db.begin().await?;
        match action {
            DataAction::Add | DataAction::Modify => {
                db::data::put_entry(&mut *tx, &entry, folder_tag.as_ref()).await?;
            }
            DataAction::Delete => {
                db::data::delete_entry(&mut *tx, &entry.key).await?;
            }
        }
        db::node::set_current_update_id(&mut *tx, update.update_id).await?;
        db::node::set_hash_prop(&mut *tx, db::node::PROP_DATA_HASH, &data_hash).await?;
        db::node::node_set(&mut *tx, db::node::PROP_LATEST_UPDATE, &signed_json).await?;
        db::updates::insert_signed_update(&mut *tx, update.update_id, &signed_json).await?;
        tx.commit().await?;
        Ok::<(), DbError>(())
    }
    .await;

    if let Err(e) = result {
        *tree = snapshot;
        return Err(e.into());
    }

    tracing::info!(
        update_id = update.update_id,
        ?action,
        data_hash = %data_hash,
        "published data update"
    );
    Ok(signed)
}

/// Publish a peer update: add or remove an authorized peer and sign an
/// update whose `peer_list_hash` reflects the new sorted peer set.
pub async fn publish_peer_update(
    db: &Database,
    merkle: &Mutex<MerkleTree>,
    keys: &VaultKeys,
    action: PeerAction,
    peer_id: &str,
    addresses: Vec<String>,
) -> Result<SignedUpdate, PublishError> {
    if !keys.is_master() {
        return Err(PublishError::NotMaster);
    }

    let current_id = db.current_update_id().await?;
    let prev_peer_hash = db.peer_list_hash().await?;
    let data_hash = db.data_hash().await?;
    let num_buckets = merkle.lock().await.num_buckets() as u32;

    let mut peer_ids = db.all_peer_ids().await?;
    match action {
        PeerAction::Add => {
            if !peer_ids.iter().any(|id| id == peer_id) {
                peer_ids.push(peer_id.to_owned());
            }
        }
        PeerAction::Remove => peer_ids.retain(|id| id != peer_id),
    }
    let new_peer_hash = peer_list_hash(&peer_ids);

    let update = Update {
        update_id: current_id + 1,
        peer_list_hash: new_peer_hash,
        prev_peer_list_hash: prev_peer_hash,
        data_hash,
        prev_data_hash: data_hash,
        num_buckets,
        payload: UpdatePayload::Peer(PeerChange {
            action,
            peer_id: peer_id.to_owned(),
            addresses: match action {
                PeerAction::Add => Some(addresses.clone()),
                PeerAction::Remove => None,
            },
        }),
        timestamp: OffsetDateTime::now_utc().unix_timestamp(),
    };
    let signed = SignedUpdate::sign(&update, keys)?;
    let signed_json = signed.to_json()?;

    let mut tx = db.begin().await?;
    match action {
        PeerAction::Add => {
            db::peers::add_peer(&mut *tx, &PeerRecord::new(peer_id, addresses)).await?;
        }
        PeerAction::Remove => {
            db::peers::remove_peer(&mut *tx, peer_id).await?;
        }
    }
    db::node::set_current_update_id(&mut *tx, update.update_id).await?;
    db::node::set_hash_prop(&mut *tx, db::node::PROP_PEER_LIST_HASH, &new_peer_hash).await?;
    db::node::node_set(&mut *tx, db::node::PROP_LATEST_UPDATE, &signed_json).await?;
    db::updates::insert_signed_update(&mut *tx, update.update_id, &signed_json).await?;
    tx.commit().await.map_err(DbError::from)?;

    tracing::info!(
        update_id = update.update_id,
        ?action,
        peer_id,
        peer_list_hash = %new_peer_hash,
        "published peer update"
    );
    Ok(signed)
}
