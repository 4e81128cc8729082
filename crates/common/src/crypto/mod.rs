use std::fmt;
use std::io::{Read, Write};

use aes_gcm::aead::Aead;
use aes_gcm::{Aes256Gcm, Key, KeyInit, Nonce};
use rand::RngCore;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};

pub mod keys;
pub mod merkle;

pub use keys::{KeyError, VaultKeys};
pub use merkle::MerkleTree;

/// Size of all content and entry hashes in bytes (BLAKE3).
pub const HASH_SIZE: usize = 32;

/// Plaintext chunk size for the framed stream cipher.
pub const PLAIN_CHUNK_SIZE: usize = 64 * 1024;

const NONCE_SIZE: usize = 12;
const TAG_SIZE: usize = 16;

/// Per-frame overhead of the stream cipher: nonce plus GCM tag.
pub const FRAME_OVERHEAD: usize = NONCE_SIZE + TAG_SIZE;

/// Salt for deriving the master seed and content key from a mnemonic.
pub const KEY_DERIVATION_SALT: &[u8] = b"endershare";

/// Salt for deriving the binding rendezvous key from a sync phrase.
pub const RENDEZVOUS_SALT: &[u8] = b"endershare-rendezvous";

#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("encryption failed")]
    Encrypt,

    #[error("decryption failed: ciphertext rejected")]
    Decrypt,

    #[error("ciphertext too short")]
    CiphertextTooShort,

    #[error("key derivation failed")]
    KeyDerivation,

    #[error("invalid hash length: expected {HASH_SIZE}, got {0}")]
    InvalidHashLength(usize),

    #[error("master private key is not available on this node")]
    MasterKeyRequired,
}

/// A 32-byte BLAKE3 hash.
///
/// Used for entry hashes, bucket hashes, Merkle roots, peer list hashes and
/// blob content addresses. Ordering is lexicographic over the raw bytes,
/// which is what the bucket range scans rely on. Serializes as base64 on the
/// wire (matching the JSON encoding of every protocol body) and displays as
/// hex everywhere human-facing.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Hash32(pub [u8; HASH_SIZE]);

impl Hash32 {
    /// The all-zero hash. Empty sets (peer list, data set) hash to this.
    pub const ZERO: Hash32 = Hash32([0u8; HASH_SIZE]);

    pub fn from_bytes(bytes: [u8; HASH_SIZE]) -> Self {
        Hash32(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; HASH_SIZE] {
        &self.0
    }

    pub fn to_vec(&self) -> Vec<u8> {
        self.0.to_vec()
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(s: &str) -> Result<Self, CryptoError> {
        let mut buf = [0u8; HASH_SIZE];
        hex::decode_to_slice(s, &mut buf)
            .map_err(|_| CryptoError::InvalidHashLength(s.len() / 2))?;
        Ok(Hash32(buf))
    }

    pub fn is_zero(&self) -> bool {
        *self == Self::ZERO
    }
}

impl TryFrom<&[u8]> for Hash32 {
    type Error = CryptoError;

    fn try_from(bytes: &[u8]) -> Result<Self, Self::Error> {
        if bytes.len() != HASH_SIZE {
            return Err(CryptoError::InvalidHashLength(bytes.len()));
        }
        let mut buf = [0u8; HASH_SIZE];
        buf.copy_from_slice(bytes);
        Ok(Hash32(buf))
    }
}

impl From<blake3::Hash> for Hash32 {
    fn from(hash: blake3::Hash) -> Self {
        Hash32(*hash.as_bytes())
    }
}

impl fmt::Display for Hash32 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl fmt::Debug for Hash32 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Hash32({})", self.to_hex())
    }
}

impl Serialize for Hash32 {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&crate::wire::b64::encode(&self.0))
    }
}

impl<'de> Deserialize<'de> for Hash32 {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        let bytes = crate::wire::b64::decode(&s).map_err(serde::de::Error::custom)?;
        Hash32::try_from(bytes.as_slice()).map_err(serde::de::Error::custom)
    }
}

/// BLAKE3 hash of a byte slice.
pub fn hash(bytes: &[u8]) -> Hash32 {
    blake3::hash(bytes).into()
}

/// Entry hash for a data row.
///
/// Files hash `key ‖ value ‖ size_le64`; folders (no value) hash the key
/// alone. The size is the ciphertext size stored in the same row.
pub fn entry_hash(key: &[u8], value: Option<&Hash32>, size: u64) -> Hash32 {
    let mut hasher = blake3::Hasher::new();
    hasher.update(key);
    if let Some(value) = value {
        hasher.update(value.as_bytes());
        hasher.update(&size.to_le_bytes());
    }
    hasher.finalize().into()
}

/// Encrypt a small buffer with AES-256-GCM.
///
/// Output layout is `nonce ‖ ciphertext ‖ tag` with a fresh random nonce.
pub fn seal(key: &[u8; 32], plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key));
    let mut nonce = [0u8; NONCE_SIZE];
    rand::rngs::OsRng.fill_bytes(&mut nonce);
    let ciphertext = cipher
        .encrypt(Nonce::from_slice(&nonce), plaintext)
        .map_err(|_| CryptoError::Encrypt)?;
    let mut out = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
    out.extend_from_slice(&nonce);
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

/// Decrypt a buffer produced by [`seal`]. Fails on any tag mismatch.
pub fn open(key: &[u8; 32], sealed: &[u8]) -> Result<Vec<u8>, CryptoError> {
    if sealed.len() < NONCE_SIZE + TAG_SIZE {
        return Err(CryptoError::CiphertextTooShort);
    }
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key));
    let (nonce, ciphertext) = sealed.split_at(NONCE_SIZE);
    cipher
        .decrypt(Nonce::from_slice(nonce), ciphertext)
        .map_err(|_| CryptoError::Decrypt)
}

fn read_full<R: Read>(src: &mut R, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = src.read(&mut buf[filled..])?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

/// Encrypt `src` into `dst` in 64 KiB plaintext frames.
///
/// Each frame is independently authenticated as `nonce ‖ ciphertext ‖ tag`.
/// Every ciphertext frame is fed to `tee` as it is written, so the caller
/// obtains the hash of the encrypted content in the same pass. Returns the
/// total number of ciphertext bytes written.
pub fn encrypt_stream<R: Read, W: Write>(
    dst: &mut W,
    src: &mut R,
    key: &[u8; 32],
    mut tee: Option<&mut blake3::Hasher>,
) -> Result<u64, CryptoError> {
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key));
    let mut buf = vec![0u8; PLAIN_CHUNK_SIZE];
    let mut written = 0u64;

    loop {
        let n = read_full(src, &mut buf)?;
        if n == 0 {
            break;
        }

        let mut nonce = [0u8; NONCE_SIZE];
        rand::rngs::OsRng.fill_bytes(&mut nonce);
        let ciphertext = cipher
            .encrypt(Nonce::from_slice(&nonce), &buf[..n])
            .map_err(|_| CryptoError::Encrypt)?;

        dst.write_all(&nonce)?;
        dst.write_all(&ciphertext)?;
        if let Some(hasher) = tee.as_deref_mut() {
            hasher.update(&nonce);
            hasher.update(&ciphertext);
        }
        written += (NONCE_SIZE + ciphertext.len()) as u64;

        if n < PLAIN_CHUNK_SIZE {
            break;
        }
    }

    Ok(written)
}

/// Decrypt a stream produced by [`encrypt_stream`].
///
/// Stops at the first frame that fails authentication; partial output must
/// not be trusted by the caller.
pub fn decrypt_stream<R: Read, W: Write>(
    dst: &mut W,
    src: &mut R,
    key: &[u8; 32],
) -> Result<(), CryptoError> {
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key));
    let frame_size = PLAIN_CHUNK_SIZE + FRAME_OVERHEAD;
    let mut buf = vec![0u8; frame_size];

    loop {
        let n = read_full(src, &mut buf)?;
        if n == 0 {
            break;
        }
        if n <= FRAME_OVERHEAD {
            return Err(CryptoError::CiphertextTooShort);
        }

        let (nonce, ciphertext) = buf[..n].split_at(NONCE_SIZE);
        let plaintext = cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| CryptoError::Decrypt)?;
        dst.write_all(&plaintext)?;

        if n < frame_size {
            break;
        }
    }

    Ok(())
}

fn scrypt_32(password: &[u8], salt: &[u8]) -> Result<[u8; 32], CryptoError> {
    let params = scrypt::Params::new(15, 8, 1, 32).map_err(|_| CryptoError::KeyDerivation)?;
    let mut out = [0u8; 32];
    scrypt::scrypt(password, salt, &params, &mut out).map_err(|_| CryptoError::KeyDerivation)?;
    Ok(out)
}

/// Derive the master signing seed from a mnemonic phrase.
pub fn derive_master_seed(mnemonic: &str) -> Result<[u8; 32], CryptoError> {
    scrypt_32(mnemonic.as_bytes(), KEY_DERIVATION_SALT)
}

/// Derive the symmetric content key from a mnemonic phrase.
///
/// `SHA-256(scrypt(mnemonic, "endershare", 2^15, 8, 1, 32))`: the only key
/// that decrypts vault contents.
pub fn derive_content_key(mnemonic: &str) -> Result<[u8; 32], CryptoError> {
    let seed = derive_master_seed(mnemonic)?;
    Ok(Sha256::digest(seed).into())
}

/// Derive the binding rendezvous seed from a sync phrase.
pub fn derive_rendezvous_seed(phrase: &str) -> Result<[u8; 32], CryptoError> {
    scrypt_32(phrase.as_bytes(), RENDEZVOUS_SALT)
}

/// Compute a response to a binding challenge.
///
/// `scrypt(phrase ‖ peer_challenge, salt, 2^15, 8, 1, 32)`. Both sides of the
/// handshake compute and verify this with their own random salts.
pub fn challenge_response(
    phrase: &str,
    peer_challenge: &[u8; 32],
    salt: &[u8; 32],
) -> Result<[u8; 32], CryptoError> {
    let mut password = Vec::with_capacity(phrase.len() + peer_challenge.len());
    password.extend_from_slice(phrase.as_bytes());
    password.extend_from_slice(peer_challenge);
    scrypt_32(&password, salt)
}

/// Verify a peer's challenge response by recomputing with the received salt.
pub fn verify_challenge_response(
    phrase: &str,
    our_challenge: &[u8; 32],
    salt: &[u8; 32],
    response: &[u8; 32],
) -> bool {
    match challenge_response(phrase, our_challenge, salt) {
        Ok(expected) => expected == *response,
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn seal_open_roundtrip() {
        let key = [7u8; 32];
        let plaintext = b"folder metadata";

        let sealed = seal(&key, plaintext).unwrap();
        assert_ne!(&sealed[NONCE_SIZE..], plaintext.as_slice());

        let opened = open(&key, &sealed).unwrap();
        assert_eq!(opened, plaintext);
    }

    #[test]
    fn open_rejects_tampered_ciphertext() {
        let key = [7u8; 32];
        let mut sealed = seal(&key, b"data").unwrap();
        let last = sealed.len() - 1;
        sealed[last] ^= 0x01;
        assert!(matches!(open(&key, &sealed), Err(CryptoError::Decrypt)));
    }

    #[test]
    fn open_rejects_wrong_key() {
        let sealed = seal(&[1u8; 32], b"data").unwrap();
        assert!(open(&[2u8; 32], &sealed).is_err());
    }

    #[test]
    fn stream_roundtrip_multiple_frames() {
        let key = [3u8; 32];
        // Three full frames plus a partial one.
        let plaintext: Vec<u8> = (0..PLAIN_CHUNK_SIZE * 3 + 1000)
            .map(|i| (i % 251) as u8)
            .collect();

        let mut encrypted = Vec::new();
        let mut tee = blake3::Hasher::new();
        let written = encrypt_stream(
            &mut encrypted,
            &mut Cursor::new(&plaintext),
            &key,
            Some(&mut tee),
        )
        .unwrap();

        assert_eq!(written as usize, encrypted.len());
        assert_eq!(
            encrypted.len(),
            plaintext.len() + 4 * FRAME_OVERHEAD,
            "three full frames and one partial frame"
        );
        // The tee hasher saw exactly the ciphertext bytes.
        assert_eq!(Hash32::from(tee.finalize()), hash(&encrypted));

        let mut decrypted = Vec::new();
        decrypt_stream(&mut decrypted, &mut Cursor::new(&encrypted), &key).unwrap();
        assert_eq!(decrypted, plaintext);
    }

    #[test]
    fn stream_decrypt_rejects_corruption() {
        let key = [3u8; 32];
        let plaintext = vec![0xabu8; 4096];
        let mut encrypted = Vec::new();
        encrypt_stream(&mut encrypted, &mut Cursor::new(&plaintext), &key, None).unwrap();

        encrypted[NONCE_SIZE + 10] ^= 0xff;
        let mut decrypted = Vec::new();
        let result = decrypt_stream(&mut decrypted, &mut Cursor::new(&encrypted), &key);
        assert!(matches!(result, Err(CryptoError::Decrypt)));
    }

    #[test]
    fn entry_hash_distinguishes_files_and_folders() {
        let key = b"ciphertext-key";
        let value = hash(b"blob");
        let file = entry_hash(key, Some(&value), 100);
        let folder = entry_hash(key, None, 0);
        assert_ne!(file, folder);
        assert_eq!(folder, hash(key));
        // Size participates in the file hash.
        assert_ne!(file, entry_hash(key, Some(&value), 101));
    }

    #[test]
    fn content_key_is_deterministic() {
        let mnemonic =
            "legal winner thank year wave sausage worth useful legal winner thank yellow";
        let a = derive_content_key(mnemonic).unwrap();
        let b = derive_content_key(mnemonic).unwrap();
        assert_eq!(a, b);
        assert_ne!(a, derive_master_seed(mnemonic).unwrap());
    }

    #[test]
    fn challenge_roundtrip() {
        let phrase = "ribbon tail frost lamp";
        let challenge = [9u8; 32];
        let salt = [4u8; 32];

        let response = challenge_response(phrase, &challenge, &salt).unwrap();
        assert!(verify_challenge_response(phrase, &challenge, &salt, &response));
        assert!(!verify_challenge_response(
            "wrong phrase",
            &challenge,
            &salt,
            &response
        ));
    }

    #[test]
    fn challenge_with_mangled_salt_fails_cleanly() {
        let phrase = "ribbon tail frost lamp";
        let challenge = [9u8; 32];
        let salt = [4u8; 32];
        let response = challenge_response(phrase, &challenge, &salt).unwrap();

        let mut mangled = salt;
        mangled[0] ^= 0x80;
        assert!(!verify_challenge_response(
            phrase, &challenge, &mangled, &response
        ));
    }

    #[test]
    fn hash32_hex_roundtrip() {
        let h = hash(b"x");
        assert_eq!(Hash32::from_hex(&h.to_hex()).unwrap(), h);
        assert!(Hash32::from_hex("abcd").is_err());
    }
}
