//! The binding handshake: authorizing a new replica with a short phrase.
//!
//! The replica generates a 4-word phrase and waits; the master is given the
//! phrase out of band and initiates. Rendezvous works by deriving an
//! ephemeral Ed25519 identity from the phrase: the replica listens on an
//! endpoint bound to that identity (published through DHT discovery) and
//! the master dials the derived node id. Possession of the phrase is then
//! proven in both directions with salted scrypt challenges before either
//! side reveals anything durable.

use std::time::Duration;

use anyhow::anyhow;
use iroh::discovery::pkarr::dht::DhtDiscovery;
use iroh::endpoint::{Connection, RecvStream, SendStream};
use iroh::{Endpoint, NodeAddr, NodeId};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use super::protocol::{PeerInfoMsg, BIND_ALPN};
use crate::crypto::{self, keys::new_sync_phrase, CryptoError, VaultKeys};
use crate::db::PeerRecord;
use crate::wire::{b64, base64_bytes};

/// Words in a binding phrase.
pub const PHRASE_WORDS: usize = 4;

/// How long the replica waits for a master before giving up.
pub const BIND_TIMEOUT: Duration = Duration::from_secs(60 * 60);

/// Minimum spacing between inbound bind attempts.
const ATTEMPT_DELAY: Duration = Duration::from_millis(250);

/// Deadline for each handshake read.
const READ_TIMEOUT: Duration = Duration::from_secs(30);

const MAX_BIND_MESSAGE: usize = 256 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum BindError {
    #[error("crypto error: {0}")]
    Crypto(#[from] CryptoError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("transport error: {0}")]
    Transport(#[from] anyhow::Error),

    #[error("phrase verification failed")]
    PhraseMismatch,

    #[error("timed out waiting for a handshake message")]
    ReadTimeout,

    #[error("timed out waiting for a peer to bind")]
    BindTimeout,

    #[error("binding cancelled")]
    Cancelled,

    #[error("malformed handshake message: {0}")]
    InvalidMessage(String),
}

/// Challenge answer: the scrypt result and the random salt it used.
#[derive(Debug, Serialize, Deserialize)]
struct ChallengeReplyMsg {
    #[serde(with = "base64_bytes")]
    result: Vec<u8>,
    #[serde(with = "base64_bytes")]
    salt: Vec<u8>,
}

/// Replica's hello after mutual verification: its durable identity.
#[derive(Debug, Serialize, Deserialize)]
struct ReplicaHelloMsg {
    peer_id: String,
}

/// Final message of the handshake, master to replica.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientInfoMsg {
    /// Master public key, base64.
    pub master_public_key: String,
    /// The master's durable peer id.
    pub peer_id: String,
    /// Known direct addresses of the master.
    pub addresses: Vec<String>,
    /// The current authorized peer list.
    pub peer_list: Vec<PeerInfoMsg>,
}

/// What a successful binding installs on the replica.
#[derive(Debug, Clone)]
pub struct BindOutcome {
    pub master_pub: ed25519_dalek::VerifyingKey,
    pub master_peer: PeerRecord,
    pub peers: Vec<PeerRecord>,
}

/// Generate a fresh 4-word binding phrase.
pub fn generate_phrase() -> String {
    new_sync_phrase(PHRASE_WORDS)
}

fn rendezvous_secret(phrase: &str) -> Result<iroh::SecretKey, BindError> {
    let seed = crypto::derive_rendezvous_seed(phrase)?;
    Ok(iroh::SecretKey::from_bytes(&seed))
}

// Buffered reads over the handshake stream: raw byte runs and
// newline-delimited JSON share the connection, so leftovers must carry over.
struct HandshakeReader {
    recv: RecvStream,
    buf: Vec<u8>,
}

impl HandshakeReader {
    fn new(recv: RecvStream) -> Self {
        Self {
            recv,
            buf: Vec::new(),
        }
    }

    async fn fill(&mut self) -> Result<bool, BindError> {
        let mut chunk = [0u8; 4096];
        let read = tokio::time::timeout(READ_TIMEOUT, self.recv.read(&mut chunk))
            .await
            .map_err(|_| BindError::ReadTimeout)?
            .map_err(|e| BindError::Transport(anyhow!("stream read: {e}")))?;
        match read {
            Some(n) => {
                self.buf.extend_from_slice(&chunk[..n]);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn read_exact(&mut self, len: usize) -> Result<Vec<u8>, BindError> {
        while self.buf.len() < len {
            if !self.fill().await? {
                return Err(BindError::InvalidMessage("stream closed early".into()));
            }
        }
        let rest = self.buf.split_off(len);
        Ok(std::mem::replace(&mut self.buf, rest))
    }

    async fn read_json_line<T: serde::de::DeserializeOwned>(&mut self) -> Result<T, BindError> {
        loop {
            if let Some(pos) = self.buf.iter().position(|&b| b == b'\n') {
                let rest = self.buf.split_off(pos + 1);
                let mut line = std::mem::replace(&mut self.buf, rest);
                line.pop(); // trailing newline
                return serde_json::from_slice(&line)
                    .map_err(|e| BindError::InvalidMessage(e.to_string()));
            }
            if self.buf.len() > MAX_BIND_MESSAGE {
                return Err(BindError::InvalidMessage("message too large".into()));
            }
            if !self.fill().await? {
                return Err(BindError::InvalidMessage("stream closed early".into()));
            }
        }
    }
}

async fn send_json_line<T: Serialize>(send: &mut SendStream, msg: &T) -> Result<(), BindError> {
    let mut line =
        serde_json::to_vec(msg).map_err(|e| BindError::InvalidMessage(e.to_string()))?;
    line.push(b'\n');
    send.write_all(&line)
        .await
        .map_err(|e| BindError::Transport(anyhow!("stream write: {e}")))?;
    Ok(())
}

async fn compute_response(
    phrase: &str,
    peer_challenge: [u8; 32],
    salt: [u8; 32],
) -> Result<[u8; 32], BindError> {
    let phrase = phrase.to_owned();
    tokio::task::spawn_blocking(move || {
        crypto::challenge_response(&phrase, &peer_challenge, &salt)
    })
    .await
    .map_err(|e| BindError::Transport(anyhow!("challenge task: {e}")))?
    .map_err(BindError::from)
}

/// Run the mutual challenge over an open handshake stream. Both directions
/// must verify before anything else is said.
async fn mutual_challenge(
    phrase: &str,
    send: &mut SendStream,
    reader: &mut HandshakeReader,
) -> Result<(), BindError> {
    let mut our_challenge = [0u8; 32];
    rand::rngs::OsRng.fill_bytes(&mut our_challenge);
    send.write_all(&our_challenge)
        .await
        .map_err(|e| BindError::Transport(anyhow!("send challenge: {e}")))?;

    let their_challenge: [u8; 32] = reader
        .read_exact(32)
        .await?
        .try_into()
        .map_err(|_| BindError::InvalidMessage("bad challenge length".into()))?;

    let mut our_salt = [0u8; 32];
    rand::rngs::OsRng.fill_bytes(&mut our_salt);
    let our_result = compute_response(phrase, their_challenge, our_salt).await?;
    send_json_line(
        send,
        &ChallengeReplyMsg {
            result: our_result.to_vec(),
            salt: our_salt.to_vec(),
        },
    )
    .await?;

    let their_reply: ChallengeReplyMsg = reader.read_json_line().await?;
    let their_salt: [u8; 32] = their_reply
        .salt
        .as_slice()
        .try_into()
        .map_err(|_| BindError::InvalidMessage("bad salt length".into()))?;
    let expected = compute_response(phrase, our_challenge, their_salt).await?;
    if their_reply.result.as_slice() != expected.as_slice() {
        return Err(BindError::PhraseMismatch);
    }
    Ok(())
}

/// Replica side: the rendezvous endpoint bound under the phrase-derived
/// identity, waiting for a master that knows the phrase.
pub struct BindListener {
    phrase: String,
    endpoint: Endpoint,
}

impl BindListener {
    /// Bind the rendezvous endpoint and start advertising it.
    pub async fn bind(phrase: &str) -> Result<Self, BindError> {
        let secret = rendezvous_secret(phrase)?;
        let discovery = DhtDiscovery::builder()
            .secret_key(secret.clone())
            .build()
            .map_err(|e| BindError::Transport(anyhow!("dht discovery: {e}")))?;
        let endpoint = Endpoint::builder()
            .secret_key(secret)
            .discovery(discovery)
            .alpns(vec![BIND_ALPN.to_vec()])
            .bind()
            .await
            .map_err(|e| BindError::Transport(anyhow!("bind rendezvous endpoint: {e}")))?;
        Ok(Self {
            phrase: phrase.to_owned(),
            endpoint,
        })
    }

    /// The phrase-derived rendezvous identity this listener answers as.
    pub fn node_id(&self) -> NodeId {
        self.endpoint.node_id()
    }

    /// The sockets the rendezvous endpoint is bound to, for dialing
    /// without discovery.
    pub fn bound_sockets(&self) -> Vec<std::net::SocketAddr> {
        self.endpoint.bound_sockets()
    }

    /// Serve bind attempts until one passes mutual verification, the
    /// timeout elapses, or the session is cancelled. Returns the trust
    /// material to install.
    pub async fn accept(
        self,
        our_peer_id: NodeId,
        cancel: CancellationToken,
    ) -> Result<BindOutcome, BindError> {
        tracing::info!("waiting for a master to bind us");
        let deadline = tokio::time::Instant::now() + BIND_TIMEOUT;

        let outcome = loop {
            let incoming = tokio::select! {
                _ = cancel.cancelled() => {
                    self.endpoint.close().await;
                    return Err(BindError::Cancelled);
                }
                _ = tokio::time::sleep_until(deadline) => {
                    self.endpoint.close().await;
                    return Err(BindError::BindTimeout);
                }
                incoming = self.endpoint.accept() => match incoming {
                    Some(incoming) => incoming,
                    None => {
                        self.endpoint.close().await;
                        return Err(BindError::Transport(anyhow!(
                            "rendezvous endpoint closed"
                        )));
                    }
                },
            };

            // One attempt at a time, spaced out to frustrate phrase
            // guessing.
            tokio::time::sleep(ATTEMPT_DELAY).await;

            let conn = match incoming.await {
                Ok(conn) => conn,
                Err(e) => {
                    tracing::debug!("bind connection failed: {e}");
                    continue;
                }
            };

            match accept_bind_attempt(&self.phrase, our_peer_id, &conn).await {
                Ok(outcome) => break outcome,
                Err(BindError::PhraseMismatch) => {
                    tracing::warn!("bind attempt failed phrase verification");
                    conn.close(0u32.into(), b"verification failed");
                }
                Err(e) => {
                    tracing::debug!("bind attempt failed: {e}");
                    conn.close(0u32.into(), b"handshake failed");
                }
            }
        };

        self.endpoint.close().await;
        Ok(outcome)
    }
}

/// Replica side: wait on the rendezvous identity for a master that knows
/// the phrase. Returns the installed trust material on success.
pub async fn wait_for_binding(
    phrase: &str,
    our_peer_id: NodeId,
    cancel: CancellationToken,
) -> Result<BindOutcome, BindError> {
    BindListener::bind(phrase)
        .await?
        .accept(our_peer_id, cancel)
        .await
}

async fn accept_bind_attempt(
    phrase: &str,
    our_peer_id: NodeId,
    conn: &Connection,
) -> Result<BindOutcome, BindError> {
    let (mut send, recv) = conn
        .accept_bi()
        .await
        .map_err(|e| BindError::Transport(anyhow!("accept stream: {e}")))?;
    let mut reader = HandshakeReader::new(recv);

    mutual_challenge(phrase, &mut send, &mut reader).await?;

    // Verified both ways; reveal our durable identity and take the
    // master's.
    send_json_line(
        &mut send,
        &ReplicaHelloMsg {
            peer_id: our_peer_id.to_string(),
        },
    )
    .await?;

    let info: ClientInfoMsg = reader.read_json_line().await?;
    let key_bytes: [u8; 32] = b64::decode(&info.master_public_key)
        .map_err(|e| BindError::InvalidMessage(e.to_string()))?
        .try_into()
        .map_err(|_| BindError::InvalidMessage("bad master key length".into()))?;
    let master_pub = ed25519_dalek::VerifyingKey::from_bytes(&key_bytes)
        .map_err(|e| BindError::InvalidMessage(e.to_string()))?;

    tracing::info!(master = %info.peer_id, "bound to master");
    Ok(BindOutcome {
        master_pub,
        master_peer: PeerRecord::new(info.peer_id, info.addresses),
        peers: info.peer_list.into_iter().map(Into::into).collect(),
    })
}

/// Master side: dial the phrase's rendezvous identity via discovery,
/// verify both ways, and hand the replica its trust material. Returns the
/// replica's durable peer record for authorization.
pub async fn bind_peer(
    endpoint: &Endpoint,
    phrase: &str,
    keys: &VaultKeys,
    peer_list: Vec<PeerRecord>,
    our_addresses: Vec<String>,
) -> Result<PeerRecord, BindError> {
    let rendezvous_id = rendezvous_secret(phrase)?.public();
    bind_peer_at(
        endpoint,
        rendezvous_id.into(),
        phrase,
        keys,
        peer_list,
        our_addresses,
    )
    .await
}

/// Master side, addressed form: run the handshake against an explicitly
/// known rendezvous address. [`bind_peer`] resolves the address from the
/// phrase; this entry point exists for callers that already hold one
/// (direct-dial setups and the loopback tests).
pub async fn bind_peer_at(
    endpoint: &Endpoint,
    target: NodeAddr,
    phrase: &str,
    keys: &VaultKeys,
    peer_list: Vec<PeerRecord>,
    our_addresses: Vec<String>,
) -> Result<PeerRecord, BindError> {
    let master_pub = keys
        .master_pub()
        .ok_or(CryptoError::MasterKeyRequired)
        .map_err(BindError::from)?;

    let conn = endpoint
        .connect(target, BIND_ALPN)
        .await
        .map_err(|e| BindError::Transport(anyhow!("connect rendezvous: {e}")))?;
    let (mut send, recv) = conn
        .open_bi()
        .await
        .map_err(|e| BindError::Transport(anyhow!("open stream: {e}")))?;
    let mut reader = HandshakeReader::new(recv);

    mutual_challenge(phrase, &mut send, &mut reader).await?;

    let hello: ReplicaHelloMsg = reader.read_json_line().await?;
    let replica_id: NodeId = hello
        .peer_id
        .parse()
        .map_err(|_| BindError::InvalidMessage("bad replica peer id".into()))?;

    send_json_line(
        &mut send,
        &ClientInfoMsg {
            master_public_key: b64::encode(&master_pub.to_bytes()),
            peer_id: endpoint.node_id().to_string(),
            addresses: our_addresses,
            peer_list: peer_list.into_iter().map(Into::into).collect(),
        },
    )
    .await?;
    send.finish()
        .map_err(|e| BindError::Transport(anyhow!("finish stream: {e}")))?;

    tracing::info!(replica = %replica_id, "bound new replica");
    Ok(PeerRecord::new(replica_id.to_string(), Vec::new()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn phrase_has_four_words() {
        let phrase = generate_phrase();
        assert_eq!(phrase.split_whitespace().count(), PHRASE_WORDS);
    }

    #[test]
    fn rendezvous_identity_is_deterministic() {
        let a = rendezvous_secret("ribbon tail frost lamp").unwrap();
        let b = rendezvous_secret("ribbon tail frost lamp").unwrap();
        assert_eq!(a.public(), b.public());

        let c = rendezvous_secret("other words entirely here").unwrap();
        assert_ne!(a.public(), c.public());
    }
}
