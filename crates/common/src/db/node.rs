//! Node properties: replication state, key material, cached latest update.

use ed25519_dalek::VerifyingKey;
use sqlx::{Executor, Row, Sqlite};

use super::{Database, DbError};
use crate::crypto::{Hash32, VaultKeys};
use crate::wire::b64;

pub const PROP_CURRENT_UPDATE_ID: &str = "current_update_id";
pub const PROP_DATA_HASH: &str = "data_hash";
pub const PROP_PEER_LIST_HASH: &str = "peer_list_hash";
pub const PROP_LATEST_UPDATE: &str = "latest_update";
pub const PROP_MASTER_PUBLIC_KEY: &str = "master_public_key";

const PROP_MASTER_PRIVATE_KEY: &str = "master_private_key";
const PROP_PEER_PRIVATE_KEY: &str = "peer_private_key";
const PROP_CONTENT_KEY: &str = "content_key";

/// Get a node property. `None` when unset.
pub async fn node_get<'e, E>(ex: E, key: &str) -> Result<Option<String>, DbError>
where
    E: Executor<'e, Database = Sqlite>,
{
    let row = sqlx::query("SELECT value FROM node WHERE key = ?")
        .bind(key)
        .fetch_optional(ex)
        .await?;
    Ok(row.map(|r| r.get::<String, _>("value")))
}

/// Set a node property, replacing any previous value.
pub async fn node_set<'e, E>(ex: E, key: &str, value: &str) -> Result<(), DbError>
where
    E: Executor<'e, Database = Sqlite>,
{
    sqlx::query("INSERT OR REPLACE INTO node (key, value) VALUES (?, ?)")
        .bind(key)
        .bind(value)
        .execute(ex)
        .await?;
    Ok(())
}

pub async fn node_delete<'e, E>(ex: E, key: &str) -> Result<(), DbError>
where
    E: Executor<'e, Database = Sqlite>,
{
    sqlx::query("DELETE FROM node WHERE key = ?")
        .bind(key)
        .execute(ex)
        .await?;
    Ok(())
}

async fn hash_prop<'e, E>(ex: E, key: &'static str) -> Result<Hash32, DbError>
where
    E: Executor<'e, Database = Sqlite>,
{
    match node_get(ex, key).await? {
        None => Ok(Hash32::ZERO),
        Some(value) => {
            let bytes = b64::decode(&value).map_err(|_| DbError::CorruptValue(key))?;
            Hash32::try_from(bytes.as_slice()).map_err(|_| DbError::CorruptValue(key))
        }
    }
}

/// Set a hash-valued node property (stored base64).
pub async fn set_hash_prop<'e, E>(ex: E, key: &str, hash: &Hash32) -> Result<(), DbError>
where
    E: Executor<'e, Database = Sqlite>,
{
    node_set(ex, key, &b64::encode(hash.as_bytes())).await
}

/// Set the current update id (stored decimal).
pub async fn set_current_update_id<'e, E>(ex: E, id: u64) -> Result<(), DbError>
where
    E: Executor<'e, Database = Sqlite>,
{
    node_set(ex, PROP_CURRENT_UPDATE_ID, &id.to_string()).await
}

impl Database {
    /// The id of the last successfully processed update; 0 before any.
    pub async fn current_update_id(&self) -> Result<u64, DbError> {
        match node_get(self.pool(), PROP_CURRENT_UPDATE_ID).await? {
            None => Ok(0),
            Some(value) => value
                .parse()
                .map_err(|_| DbError::CorruptValue(PROP_CURRENT_UPDATE_ID)),
        }
    }

    /// The Merkle root of the data set as of the last processed update.
    /// Zero for an empty vault.
    pub async fn data_hash(&self) -> Result<Hash32, DbError> {
        hash_prop(self.pool(), PROP_DATA_HASH).await
    }

    /// The hash of the authorized peer set as of the last processed update.
    /// Zero for an empty set.
    pub async fn peer_list_hash(&self) -> Result<Hash32, DbError> {
        hash_prop(self.pool(), PROP_PEER_LIST_HASH).await
    }

    /// The JSON of the most recently applied signed update, kept for cheap
    /// re-broadcast in response to catch-up requests.
    pub async fn latest_update_json(&self) -> Result<Option<String>, DbError> {
        node_get(self.pool(), PROP_LATEST_UPDATE).await
    }

    /// The master public key, once known.
    pub async fn master_public_key(&self) -> Result<Option<VerifyingKey>, DbError> {
        let Some(value) = node_get(self.pool(), PROP_MASTER_PUBLIC_KEY).await? else {
            return Ok(None);
        };
        let bytes = b64::decode(&value).map_err(|_| DbError::CorruptValue(PROP_MASTER_PUBLIC_KEY))?;
        let bytes: [u8; 32] = bytes
            .try_into()
            .map_err(|_| DbError::CorruptValue(PROP_MASTER_PUBLIC_KEY))?;
        VerifyingKey::from_bytes(&bytes)
            .map(Some)
            .map_err(|_| DbError::CorruptValue(PROP_MASTER_PUBLIC_KEY))
    }

    pub async fn set_master_public_key(&self, key: &VerifyingKey) -> Result<(), DbError> {
        node_set(
            self.pool(),
            PROP_MASTER_PUBLIC_KEY,
            &b64::encode(key.as_bytes()),
        )
        .await
    }

    /// Persist the node's key material. Secrets are stored base64 in the
    /// node table; encryption at rest is out of scope.
    pub async fn store_keys(&self, keys: &VaultKeys) -> Result<(), DbError> {
        let mut tx = self.begin().await?;
        match keys.master_seed_bytes() {
            Some(seed) => {
                node_set(&mut *tx, PROP_MASTER_PRIVATE_KEY, &b64::encode(&seed)).await?
            }
            None => node_delete(&mut *tx, PROP_MASTER_PRIVATE_KEY).await?,
        }
        node_set(
            &mut *tx,
            PROP_PEER_PRIVATE_KEY,
            &b64::encode(&keys.peer_seed_bytes()),
        )
        .await?;
        match keys.content_key() {
            Some(key) => node_set(&mut *tx, PROP_CONTENT_KEY, &b64::encode(key)).await?,
            None => node_delete(&mut *tx, PROP_CONTENT_KEY).await?,
        }
        match keys.master_pub_bytes() {
            Some(pub_key) => {
                node_set(&mut *tx, PROP_MASTER_PUBLIC_KEY, &b64::encode(&pub_key)).await?
            }
            None => node_delete(&mut *tx, PROP_MASTER_PUBLIC_KEY).await?,
        }
        tx.commit().await?;
        Ok(())
    }

    /// Load persisted key material. `None` when the node has never been
    /// initialized.
    pub async fn load_keys(&self) -> Result<Option<VaultKeys>, DbError> {
        let peer = match node_get(self.pool(), PROP_PEER_PRIVATE_KEY).await? {
            Some(value) => decode_key32(&value, PROP_PEER_PRIVATE_KEY)?,
            None => return Ok(None),
        };
        let master = match node_get(self.pool(), PROP_MASTER_PRIVATE_KEY).await? {
            Some(value) => Some(decode_key32(&value, PROP_MASTER_PRIVATE_KEY)?),
            None => None,
        };
        let master_pub = match node_get(self.pool(), PROP_MASTER_PUBLIC_KEY).await? {
            Some(value) => Some(decode_key32(&value, PROP_MASTER_PUBLIC_KEY)?),
            None => None,
        };
        let content_key = match node_get(self.pool(), PROP_CONTENT_KEY).await? {
            Some(value) => Some(decode_key32(&value, PROP_CONTENT_KEY)?),
            None => None,
        };

        VaultKeys::from_parts(master, master_pub, peer, content_key)
            .map(Some)
            .map_err(|_| DbError::CorruptValue("key material"))
    }
}

fn decode_key32(value: &str, prop: &'static str) -> Result<[u8; 32], DbError> {
    let bytes = b64::decode(value).map_err(|_| DbError::CorruptValue(prop))?;
    bytes.try_into().map_err(|_| DbError::CorruptValue(prop))
}
