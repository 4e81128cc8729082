//! The signed update: the unit of replication.
//!
//! Every change to the vault (one data entry or one peer) travels as a
//! monotonically numbered, master-signed `Update`. The signature covers the
//! exact JSON bytes produced at signing time; `SignedUpdate` carries those
//! bytes verbatim so verification is reproducible bit for bit regardless of
//! how any other implementation orders its fields.

use ed25519_dalek::{Signature, VerifyingKey};
use serde::{Deserialize, Serialize};

use crate::crypto::{Hash32, KeyError, VaultKeys};
use crate::wire::base64_bytes;

#[derive(Debug, thiserror::Error)]
pub enum UpdateError {
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("key error: {0}")]
    Key(#[from] KeyError),

    #[error("malformed signature")]
    MalformedSignature,

    #[error("invalid update signature")]
    BadSignature,
}

/// A change record published by the master.
///
/// Exactly one of `peer_list_hash` / `data_hash` differs from its `prev_*`
/// counterpart, depending on the payload kind. `num_buckets` is the
/// master's Merkle bucket count at publish time, which replicas adopt when
/// they have to rebuild from scratch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Update {
    pub update_id: u64,
    pub peer_list_hash: Hash32,
    pub prev_peer_list_hash: Hash32,
    pub data_hash: Hash32,
    pub prev_data_hash: Hash32,
    pub num_buckets: u32,
    #[serde(flatten)]
    pub payload: UpdatePayload,
    pub timestamp: i64,
}

/// The change itself, tagged by kind.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "payload")]
pub enum UpdatePayload {
    #[serde(rename = "PEER")]
    Peer(PeerChange),
    #[serde(rename = "DATA")]
    Data(DataChange),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DataAction {
    #[serde(rename = "ADD")]
    Add,
    #[serde(rename = "MODIFY")]
    Modify,
    #[serde(rename = "DELETE")]
    Delete,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PeerAction {
    #[serde(rename = "ADD")]
    Add,
    #[serde(rename = "REMOVE")]
    Remove,
}

/// One data entry change. `value` is the blob content hash (absent for
/// folders); `size` is the ciphertext size stored alongside it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataChange {
    pub action: DataAction,
    #[serde(with = "base64_bytes")]
    pub key: Vec<u8>,
    pub value: Option<Hash32>,
    pub size: u64,
    pub hash: Hash32,
}

/// One peer set change. Addresses accompany ADD only.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerChange {
    pub action: PeerAction,
    pub peer_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub addresses: Option<Vec<String>>,
}

/// BLAKE3 over the ascending-sorted peer id strings. The empty set hashes
/// to zero.
pub fn peer_list_hash<S: AsRef<str>>(peer_ids: &[S]) -> Hash32 {
    if peer_ids.is_empty() {
        return Hash32::ZERO;
    }
    let mut sorted: Vec<&str> = peer_ids.iter().map(AsRef::as_ref).collect();
    sorted.sort_unstable();
    let mut hasher = blake3::Hasher::new();
    for id in sorted {
        hasher.update(id.as_bytes());
    }
    hasher.finalize().into()
}

/// An update plus the master's signature over its canonical bytes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedUpdate {
    /// The canonical JSON bytes of the [`Update`], exactly as signed.
    #[serde(with = "base64_bytes")]
    pub update: Vec<u8>,
    #[serde(with = "base64_bytes")]
    pub signature: Vec<u8>,
}

impl SignedUpdate {
    /// Serialize the update once and sign the resulting bytes with the
    /// master key.
    pub fn sign(update: &Update, keys: &VaultKeys) -> Result<Self, UpdateError> {
        let bytes = serde_json::to_vec(update)?;
        let signature = keys.sign_master(&bytes)?;
        Ok(Self {
            update: bytes,
            signature: signature.to_bytes().to_vec(),
        })
    }

    /// Verify the signature over the carried bytes.
    pub fn verify(&self, master_pub: &VerifyingKey) -> Result<(), UpdateError> {
        let signature = Signature::from_slice(&self.signature)
            .map_err(|_| UpdateError::MalformedSignature)?;
        master_pub
            .verify_strict(&self.update, &signature)
            .map_err(|_| UpdateError::BadSignature)
    }

    /// Parse the carried update.
    pub fn update(&self) -> Result<Update, UpdateError> {
        Ok(serde_json::from_slice(&self.update)?)
    }

    pub fn to_json(&self) -> Result<String, UpdateError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(json: &str) -> Result<Self, UpdateError> {
        Ok(serde_json::from_str(json)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::hash;

    fn sample_update() -> Update {
        Update {
            update_id: 1,
            peer_list_hash: hash(b"peers"),
            prev_peer_list_hash: hash(b"peers"),
            data_hash: hash(b"data"),
            prev_data_hash: Hash32::ZERO,
            num_buckets: 1,
            payload: UpdatePayload::Data(DataChange {
                action: DataAction::Add,
                key: vec![1, 2, 3],
                value: Some(hash(b"blob")),
                size: 1024,
                hash: hash(b"entry"),
            }),
            timestamp: 1_700_000_000,
        }
    }

    #[test]
    fn peer_list_hash_is_sort_invariant() {
        let a = peer_list_hash(&["alpha", "beta", "gamma"]);
        let b = peer_list_hash(&["gamma", "alpha", "beta"]);
        assert_eq!(a, b);
        assert_ne!(a, peer_list_hash(&["alpha", "beta"]));
    }

    #[test]
    fn empty_peer_list_hashes_to_zero() {
        assert_eq!(peer_list_hash::<&str>(&[]), Hash32::ZERO);
    }

    #[test]
    fn update_json_roundtrip() {
        let update = sample_update();
        let json = serde_json::to_string(&update).unwrap();
        assert!(json.contains("\"kind\":\"DATA\""));
        assert!(json.contains("\"payload\""));
        let back: Update = serde_json::from_str(&json).unwrap();
        assert_eq!(back, update);
    }

    #[test]
    fn peer_update_json_roundtrip() {
        let mut update = sample_update();
        update.payload = UpdatePayload::Peer(PeerChange {
            action: PeerAction::Remove,
            peer_id: "abc".into(),
            addresses: None,
        });
        let json = serde_json::to_string(&update).unwrap();
        assert!(json.contains("\"kind\":\"PEER\""));
        assert!(!json.contains("addresses"));
        let back: Update = serde_json::from_str(&json).unwrap();
        assert_eq!(back, update);
    }

    #[test]
    fn sign_verify_roundtrip() {
        let (keys, _mnemonic) = VaultKeys::create().unwrap();
        let update = sample_update();

        let signed = SignedUpdate::sign(&update, &keys).unwrap();
        signed.verify(keys.master_pub().unwrap()).unwrap();
        assert_eq!(signed.update().unwrap(), update);

        // JSON round-trip preserves the signed bytes exactly.
        let json = signed.to_json().unwrap();
        let back = SignedUpdate::from_json(&json).unwrap();
        assert_eq!(back, signed);
        back.verify(keys.master_pub().unwrap()).unwrap();
    }

    #[test]
    fn verify_rejects_tampering() {
        let (keys, _mnemonic) = VaultKeys::create().unwrap();
        let other = VaultKeys::replica();
        let signed = SignedUpdate::sign(&sample_update(), &keys).unwrap();

        // Wrong key: a peer identity is a valid Ed25519 key, just not the
        // master's.
        let wrong_pub = VerifyingKey::from_bytes(other.peer_id().as_bytes()).unwrap();
        assert!(signed.verify(&wrong_pub).is_err());

        // Tampered bytes.
        let mut tampered = signed.clone();
        tampered.update[0] ^= 0x01;
        assert!(matches!(
            tampered.verify(keys.master_pub().unwrap()),
            Err(UpdateError::BadSignature)
        ));
    }

    #[test]
    fn replica_cannot_sign() {
        let keys = VaultKeys::replica();
        assert!(matches!(
            SignedUpdate::sign(&sample_update(), &keys),
            Err(UpdateError::Key(KeyError::MasterKeyRequired))
        ));
    }
}
