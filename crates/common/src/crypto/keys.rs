use bip39::{Language, Mnemonic};
use ed25519_dalek::{Signature, Signer, SigningKey, VerifyingKey};
use iroh::NodeId;
use rand::RngCore;

use super::CryptoError;

/// Size of Ed25519 seeds and public keys in bytes.
pub const KEY_SIZE: usize = 32;

#[derive(Debug, thiserror::Error)]
pub enum KeyError {
    #[error("crypto error: {0}")]
    Crypto(#[from] CryptoError),

    #[error("invalid mnemonic: {0}")]
    InvalidMnemonic(#[from] bip39::Error),

    #[error("invalid key material: {0}")]
    InvalidKey(String),

    #[error("master private key is not available on this node")]
    MasterKeyRequired,
}

/// The key material of a vault node.
///
/// A master node carries the full set: the master signing keypair and the
/// symmetric content key, both derived deterministically from the mnemonic,
/// plus a random per-device peer keypair that doubles as the iroh endpoint
/// identity. Replica nodes carry only the peer keypair; the master public
/// key is installed during binding and the content key never leaves the
/// master's devices.
#[derive(Clone)]
pub struct VaultKeys {
    master: Option<SigningKey>,
    master_pub: Option<VerifyingKey>,
    peer: iroh::SecretKey,
    content_key: Option<[u8; 32]>,
}

impl std::fmt::Debug for VaultKeys {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VaultKeys")
            .field("is_master", &self.is_master())
            .field("peer_id", &self.peer_id())
            .finish_non_exhaustive()
    }
}

fn random_peer_key() -> iroh::SecretKey {
    let mut seed = [0u8; KEY_SIZE];
    rand::rngs::OsRng.fill_bytes(&mut seed);
    iroh::SecretKey::from_bytes(&seed)
}

impl VaultKeys {
    /// Create a fresh vault: 256 bits of entropy, a 24-word BIP-39 mnemonic,
    /// and the keys derived from it. Returns the mnemonic for the user to
    /// write down; it is the only way to reconstruct the vault.
    pub fn create() -> Result<(Self, String), KeyError> {
        let mut entropy = [0u8; 32];
        rand::rngs::OsRng.fill_bytes(&mut entropy);
        let mnemonic = Mnemonic::from_entropy_in(Language::English, &entropy)?;
        let phrase = mnemonic.to_string();
        let keys = Self::from_mnemonic(&phrase)?;
        Ok((keys, phrase))
    }

    /// Reconstruct master keys from a mnemonic. The peer keypair is always
    /// freshly generated; devices are never interchangeable identities.
    pub fn from_mnemonic(mnemonic: &str) -> Result<Self, KeyError> {
        // Validate the phrase before burning scrypt time on it.
        Mnemonic::parse_in_normalized(Language::English, mnemonic)?;

        let seed = super::derive_master_seed(mnemonic)?;
        let master = SigningKey::from_bytes(&seed);
        let master_pub = master.verifying_key();
        let content_key = super::derive_content_key(mnemonic)?;

        Ok(Self {
            master: Some(master),
            master_pub: Some(master_pub),
            peer: random_peer_key(),
            content_key: Some(content_key),
        })
    }

    /// Keys for an untrusted replica: a random peer keypair and nothing else.
    /// The master public key arrives during binding.
    pub fn replica() -> Self {
        Self {
            master: None,
            master_pub: None,
            peer: random_peer_key(),
            content_key: None,
        }
    }

    /// Rebuild from persisted raw key material.
    pub fn from_parts(
        master_seed: Option<[u8; KEY_SIZE]>,
        master_pub: Option<[u8; KEY_SIZE]>,
        peer_seed: [u8; KEY_SIZE],
        content_key: Option<[u8; 32]>,
    ) -> Result<Self, KeyError> {
        let master = master_seed.map(|seed| SigningKey::from_bytes(&seed));
        let master_pub = match (&master, master_pub) {
            (Some(master), _) => Some(master.verifying_key()),
            (None, Some(bytes)) => Some(
                VerifyingKey::from_bytes(&bytes)
                    .map_err(|e| KeyError::InvalidKey(e.to_string()))?,
            ),
            (None, None) => None,
        };
        Ok(Self {
            master,
            master_pub,
            peer: iroh::SecretKey::from_bytes(&peer_seed),
            content_key,
        })
    }

    /// True when this node holds the master signing key.
    pub fn is_master(&self) -> bool {
        self.master.is_some()
    }

    /// The master public key, if known. Absent only on an unbound replica.
    pub fn master_pub(&self) -> Option<&VerifyingKey> {
        self.master_pub.as_ref()
    }

    /// Install the master public key received during binding.
    pub fn install_master_pub(&mut self, key: VerifyingKey) {
        self.master_pub = Some(key);
    }

    /// The content key, present only where decryption is allowed.
    pub fn content_key(&self) -> Option<&[u8; 32]> {
        self.content_key.as_ref()
    }

    /// Install the content key after a successful mnemonic unlock.
    pub fn install_content_key(&mut self, key: [u8; 32]) {
        self.content_key = Some(key);
    }

    pub fn peer_secret(&self) -> &iroh::SecretKey {
        &self.peer
    }

    /// This device's identity on the network.
    pub fn peer_id(&self) -> NodeId {
        self.peer.public()
    }

    pub fn master_seed_bytes(&self) -> Option<[u8; KEY_SIZE]> {
        self.master.as_ref().map(|k| k.to_bytes())
    }

    pub fn master_pub_bytes(&self) -> Option<[u8; KEY_SIZE]> {
        self.master_pub.as_ref().map(|k| k.to_bytes())
    }

    pub fn peer_seed_bytes(&self) -> [u8; KEY_SIZE] {
        self.peer.to_bytes()
    }

    /// Sign a message with the master key. Fails on replicas.
    pub fn sign_master(&self, msg: &[u8]) -> Result<Signature, KeyError> {
        let master = self.master.as_ref().ok_or(KeyError::MasterKeyRequired)?;
        Ok(master.sign(msg))
    }
}

/// Generate a short sync phrase of random BIP-39 words, used to authorize a
/// new replica out of band.
pub fn new_sync_phrase(num_words: usize) -> String {
    let word_list = Language::English.words_by_prefix("");
    let mut rng = rand::rngs::OsRng;
    let words: Vec<&str> = (0..num_words)
        .map(|_| {
            let idx = (rng.next_u32() as usize) % word_list.len();
            word_list[idx]
        })
        .collect();
    words.join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use ed25519_dalek::Verifier;

    const MNEMONIC: &str = "legal winner thank year wave sausage worth useful legal winner \
                            thank year wave sausage worth useful legal winner thank year \
                            wave sausage worth title";

    #[test]
    fn master_keys_deterministic_from_mnemonic() {
        let a = VaultKeys::from_mnemonic(MNEMONIC).unwrap();
        let b = VaultKeys::from_mnemonic(MNEMONIC).unwrap();

        assert_eq!(a.master_pub_bytes(), b.master_pub_bytes());
        assert_eq!(a.content_key(), b.content_key());
        // Peer keys are per-device and never derived.
        assert_ne!(a.peer_seed_bytes(), b.peer_seed_bytes());
    }

    #[test]
    fn create_returns_24_words() {
        let (keys, mnemonic) = VaultKeys::create().unwrap();
        assert_eq!(mnemonic.split_whitespace().count(), 24);
        assert!(keys.is_master());
        assert!(keys.content_key().is_some());

        // The mnemonic round-trips to the same master identity.
        let restored = VaultKeys::from_mnemonic(&mnemonic).unwrap();
        assert_eq!(keys.master_pub_bytes(), restored.master_pub_bytes());
    }

    #[test]
    fn replica_has_no_secrets() {
        let keys = VaultKeys::replica();
        assert!(!keys.is_master());
        assert!(keys.master_pub().is_none());
        assert!(keys.content_key().is_none());
        assert!(matches!(
            keys.sign_master(b"msg"),
            Err(KeyError::MasterKeyRequired)
        ));
    }

    #[test]
    fn sign_and_verify() {
        let keys = VaultKeys::from_mnemonic(MNEMONIC).unwrap();
        let sig = keys.sign_master(b"hello").unwrap();
        let master_pub = keys.master_pub().unwrap();
        assert!(master_pub.verify(b"hello", &sig).is_ok());
        assert!(master_pub.verify(b"other", &sig).is_err());
    }

    #[test]
    fn from_parts_roundtrip() {
        let keys = VaultKeys::from_mnemonic(MNEMONIC).unwrap();
        let restored = VaultKeys::from_parts(
            keys.master_seed_bytes(),
            keys.master_pub_bytes(),
            keys.peer_seed_bytes(),
            keys.content_key().copied(),
        )
        .unwrap();
        assert_eq!(keys.master_pub_bytes(), restored.master_pub_bytes());
        assert_eq!(keys.peer_id(), restored.peer_id());
    }

    #[test]
    fn sync_phrase_has_requested_words() {
        let phrase = new_sync_phrase(4);
        assert_eq!(phrase.split_whitespace().count(), 4);
        for word in phrase.split_whitespace() {
            assert!(Language::English.words_by_prefix("").contains(&word));
        }
    }

    #[test]
    fn invalid_mnemonic_rejected() {
        assert!(VaultKeys::from_mnemonic("not a real mnemonic").is_err());
    }
}
