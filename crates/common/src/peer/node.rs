//! The network node: endpoint, router, gossip topic, and the long-lived
//! tasks that keep a device converged with the master's log.

use std::collections::{HashMap, HashSet};
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddrV4, SocketAddrV6};
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use futures::StreamExt;
use iroh::discovery::pkarr::dht::DhtDiscovery;
use iroh::protocol::Router;
use iroh::{Endpoint, NodeId};
use iroh_gossip::api::{Event, GossipSender};
use iroh_gossip::net::{Gossip, GOSSIP_ALPN};
use tokio::sync::{watch, Mutex, RwLock};
use tokio_util::sync::CancellationToken;

use super::broadcast::{
    encode_envelope, parse_envelope, topic_id, KIND_REQUEST_LATEST_UPDATE, KIND_UPDATE,
};
use super::protocol::{
    DataBucketHashesProtocol, FileDataProtocol, MetadataProtocol, NetworkSyncClient,
    PeerListProtocol, TreeBucketHashesProtocol, DATA_BUCKET_HASHES_ALPN, FILE_DATA_ALPN,
    METADATA_ALPN, PEER_LIST_ALPN, TREE_BUCKET_HASHES_ALPN,
};
use crate::crypto::{MerkleTree, VaultKeys};
use crate::db::Database;
use crate::log::SignedUpdate;
use crate::objects::ObjectStore;
use crate::sync::{self, Download, Outcome, SyncState};
use crate::vault::Vault;

/// Default listen port.
pub const DEFAULT_PORT: u16 = 13000;

/// Interval between catch-up broadcasts and download retries.
pub const SYNC_TICK_INTERVAL: std::time::Duration = std::time::Duration::from_secs(15);

/// State shared between the node and its protocol handlers.
#[derive(Debug)]
pub struct NodeState {
    pub(crate) db: Database,
    pub(crate) objects: ObjectStore,
    pub(crate) merkle: Arc<Mutex<MerkleTree>>,
    pub(crate) allowed: Arc<RwLock<HashSet<NodeId>>>,
}

#[derive(Debug, Clone)]
struct DownloadJob {
    from: NodeId,
    download: Download,
}

#[derive(Clone, Default)]
pub struct NodeBuilder {
    db: Option<Database>,
    objects: Option<ObjectStore>,
    merkle: Option<Arc<Mutex<MerkleTree>>>,
    keys: Option<VaultKeys>,
    port: Option<u16>,
}

impl NodeBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn db(mut self, db: Database) -> Self {
        self.db = Some(db);
        self
    }

    pub fn objects(mut self, objects: ObjectStore) -> Self {
        self.objects = Some(objects);
        self
    }

    pub fn merkle(mut self, merkle: Arc<Mutex<MerkleTree>>) -> Self {
        self.merkle = Some(merkle);
        self
    }

    pub fn keys(mut self, keys: VaultKeys) -> Self {
        self.keys = Some(keys);
        self
    }

    /// Listen port; 0 binds an ephemeral port (tests).
    pub fn port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    pub async fn build(self) -> Result<Node> {
        let db = self.db.context("db must be set")?;
        let objects = self.objects.context("objects must be set")?;
        let merkle = self.merkle.context("merkle must be set")?;
        let keys = self.keys.context("keys must be set")?;
        let port = self.port.unwrap_or(DEFAULT_PORT);

        let secret_key = keys.peer_secret().clone();
        let dht_discovery = DhtDiscovery::builder()
            .secret_key(secret_key.clone())
            .build()
            .context("failed to build dht discovery")?;

        let endpoint = Endpoint::builder()
            .secret_key(secret_key)
            .discovery(dht_discovery)
            .bind_addr_v4(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port))
            .bind_addr_v6(SocketAddrV6::new(Ipv6Addr::UNSPECIFIED, port, 0, 0))
            .bind()
            .await
            .context("failed to bind endpoint")?;

        let state = Arc::new(NodeState {
            db,
            objects,
            merkle,
            allowed: Arc::new(RwLock::new(HashSet::new())),
        });

        let gossip = Gossip::builder().spawn(endpoint.clone());
        let router = Router::builder(endpoint.clone())
            .accept(GOSSIP_ALPN, gossip.clone())
            .accept(PEER_LIST_ALPN, PeerListProtocol(state.clone()))
            .accept(
                TREE_BUCKET_HASHES_ALPN,
                TreeBucketHashesProtocol(state.clone()),
            )
            .accept(
                DATA_BUCKET_HASHES_ALPN,
                DataBucketHashesProtocol(state.clone()),
            )
            .accept(METADATA_ALPN, MetadataProtocol(state.clone()))
            .accept(FILE_DATA_ALPN, FileDataProtocol(state.clone()))
            .spawn();

        let (jobs_tx, jobs_rx) = flume::unbounded::<DownloadJob>();
        let (changes_tx, _) = watch::channel(0u64);

        let node = Node {
            state,
            endpoint,
            router,
            gossip,
            keys,
            sender: Arc::new(Mutex::new(None)),
            process_lock: Arc::new(Mutex::new(())),
            seen: Arc::new(RwLock::new(HashMap::new())),
            vault: Arc::new(RwLock::new(None)),
            changes: Arc::new(changes_tx),
            jobs: jobs_tx,
            cancel: CancellationToken::new(),
        };
        node.reload_allowed_peers().await?;
        node.spawn_download_worker(jobs_rx);

        tracing::info!(peer_id = %node.peer_id(), port, "node started");
        Ok(node)
    }
}

/// A running vault node.
#[derive(Clone)]
pub struct Node {
    state: Arc<NodeState>,
    endpoint: Endpoint,
    router: Router,
    gossip: Gossip,
    keys: VaultKeys,
    sender: Arc<Mutex<Option<GossipSender>>>,
    // Serializes update processing; broadcasts are handled one at a time.
    process_lock: Arc<Mutex<()>>,
    vault: Arc<RwLock<Option<Arc<Vault>>>>,
    // Last time we heard each peer on the topic.
    seen: Arc<RwLock<HashMap<NodeId, time::OffsetDateTime>>>,
    changes: Arc<watch::Sender<u64>>,
    jobs: flume::Sender<DownloadJob>,
    cancel: CancellationToken,
}

impl Node {
    pub fn builder() -> NodeBuilder {
        NodeBuilder::new()
    }

    pub fn peer_id(&self) -> NodeId {
        self.endpoint.node_id()
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub fn db(&self) -> &Database {
        &self.state.db
    }

    pub fn sync_state(&self) -> SyncState {
        SyncState {
            db: self.state.db.clone(),
            objects: self.state.objects.clone(),
            merkle: self.state.merkle.clone(),
        }
    }

    /// Subscribe to data-changed notifications (the applied update id).
    pub fn subscribe_changes(&self) -> watch::Receiver<u64> {
        self.changes.subscribe()
    }

    /// Attach the unlocked vault so applied updates refresh folder state.
    pub async fn set_vault(&self, vault: Arc<Vault>) {
        *self.vault.write().await = Some(vault);
    }

    /// Mirror the peers table into the in-memory authorization set.
    pub async fn reload_allowed_peers(&self) -> Result<()> {
        let mut set = HashSet::new();
        for peer_id in self.state.db.all_peer_ids().await? {
            match NodeId::from_str(&peer_id) {
                Ok(id) => {
                    set.insert(id);
                }
                Err(e) => tracing::warn!(peer_id, "skipping unparseable peer id: {e}"),
            }
        }
        // This node always accepts itself.
        set.insert(self.peer_id());
        *self.state.allowed.write().await = set;
        Ok(())
    }

    pub async fn is_allowed(&self, peer: &NodeId) -> bool {
        self.state.allowed.read().await.contains(peer)
    }

    /// Join the vault's broadcast topic and start the subscription loop and
    /// the periodic catch-up ticker. Requires the master public key.
    pub async fn join_topic(&self) -> Result<()> {
        let master_pub = self
            .state
            .db
            .master_public_key()
            .await?
            .ok_or_else(|| anyhow!("cannot join topic: master public key unknown"))?;

        let me = self.peer_id();
        let bootstrap: Vec<NodeId> = self
            .state
            .allowed
            .read()
            .await
            .iter()
            .copied()
            .filter(|id| *id != me)
            .collect();

        let topic = self
            .gossip
            .subscribe(topic_id(&master_pub), bootstrap)
            .await
            .context("failed to subscribe to broadcast topic")?;
        let (sender, mut receiver) = topic.split();
        *self.sender.lock().await = Some(sender);

        // Subscription loop: one message at a time, stale ids drop early.
        let node = self.clone();
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    event = receiver.next() => match event {
                        Some(Ok(Event::Received(message))) => {
                            node.handle_broadcast(&message.content, message.delivered_from)
                                .await;
                        }
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            tracing::warn!("broadcast receive error: {e}");
                        }
                        None => break,
                    },
                }
            }
            tracing::debug!("broadcast loop stopped");
        });

        // Periodic catch-up: ask for the latest update and retry stalled
        // blob downloads.
        let node = self.clone();
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(SYNC_TICK_INTERVAL);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(e) = node.request_latest_update().await {
                            tracing::debug!("request_latest_update failed: {e}");
                        }
                        if let Err(e) = node.retry_incomplete_downloads().await {
                            tracing::warn!("download retry scan failed: {e}");
                        }
                    }
                }
            }
        });

        tracing::info!("joined broadcast topic");
        Ok(())
    }

    /// Broadcast a signed update to the topic.
    pub async fn broadcast_update(&self, signed_json: &str) -> Result<()> {
        let framed = encode_envelope(KIND_UPDATE, signed_json.as_bytes());
        self.publish(framed).await
    }

    /// Ask the topic for the newest update anyone holds.
    pub async fn request_latest_update(&self) -> Result<()> {
        self.publish(encode_envelope(KIND_REQUEST_LATEST_UPDATE, b""))
            .await
    }

    async fn publish(&self, bytes: Vec<u8>) -> Result<()> {
        let sender = self.sender.lock().await;
        match sender.as_ref() {
            Some(sender) => sender
                .broadcast(bytes.into())
                .await
                .context("gossip broadcast failed"),
            None => Err(anyhow!("broadcast topic not joined")),
        }
    }

    /// When a peer was last heard from on the broadcast topic.
    pub async fn last_seen(&self, peer: &NodeId) -> Option<time::OffsetDateTime> {
        self.seen.read().await.get(peer).copied()
    }

    async fn handle_broadcast(&self, content: &[u8], from: NodeId) {
        if !self.is_allowed(&from).await {
            tracing::debug!(peer = %from, "ignoring broadcast from unauthorized peer");
            return;
        }
        self.seen
            .write()
            .await
            .insert(from, time::OffsetDateTime::now_utc());
        let Some((kind, payload)) = parse_envelope(content) else {
            tracing::warn!(peer = %from, "malformed broadcast envelope");
            return;
        };

        match kind {
            KIND_UPDATE => {
                let signed = match std::str::from_utf8(payload)
                    .map_err(anyhow::Error::from)
                    .and_then(|json| SignedUpdate::from_json(json).map_err(Into::into))
                {
                    Ok(signed) => signed,
                    Err(e) => {
                        tracing::warn!(peer = %from, "malformed update broadcast: {e}");
                        return;
                    }
                };
                self.process_signed_update(&signed, from).await;
            }
            KIND_REQUEST_LATEST_UPDATE => {
                // The master never asks; anyone with state may answer.
                match self.state.db.latest_update_json().await {
                    Ok(Some(json)) => {
                        if let Err(e) = self.broadcast_update(&json).await {
                            tracing::debug!("latest-update rebroadcast failed: {e}");
                        }
                    }
                    Ok(None) => {}
                    Err(e) => tracing::warn!("latest update lookup failed: {e}"),
                }
            }
            other => {
                tracing::warn!(peer = %from, kind = other, "unknown broadcast kind");
            }
        }
    }

    /// Verify and apply one signed update received from `from`.
    pub async fn process_signed_update(&self, signed: &SignedUpdate, from: NodeId) {
        let _guard = self.process_lock.lock().await;
        let client = NetworkSyncClient::new(self.endpoint.clone(), from);
        match sync::process_update(&self.sync_state(), &client, signed).await {
            Ok(Outcome::Applied { downloads }) => {
                for download in downloads {
                    let _ = self.jobs.send(DownloadJob { from, download });
                }
                if let Err(e) = self.reload_allowed_peers().await {
                    tracing::warn!("allowed peer reload failed: {e}");
                }
                if let Some(vault) = self.vault.read().await.as_ref() {
                    if let Err(e) = vault.reload_folder_ids().await {
                        tracing::warn!("folder reload failed: {e}");
                    }
                    if let Err(e) = vault.backfill_folder_tags().await {
                        tracing::warn!("folder tag backfill failed: {e}");
                    }
                }
                if let Ok(update) = signed.update() {
                    let _ = self.changes.send(update.update_id);
                }
            }
            Ok(Outcome::Stale) => {}
            Err(e) => {
                // Leave the node state untouched; the next tick retries.
                tracing::warn!(peer = %from, "update processing failed: {e}");
            }
        }
    }

    async fn retry_incomplete_downloads(&self) -> Result<()> {
        let incomplete = self.state.db.incomplete_downloads().await?;
        if incomplete.is_empty() {
            return Ok(());
        }

        let me = self.peer_id();
        let Some(source) = self
            .state
            .allowed
            .read()
            .await
            .iter()
            .copied()
            .find(|id| *id != me)
        else {
            return Ok(());
        };

        for (value_hash, size) in incomplete {
            let _ = self.jobs.send(DownloadJob {
                from: source,
                download: Download { value_hash, size },
            });
        }
        Ok(())
    }

    fn spawn_download_worker(&self, jobs: flume::Receiver<DownloadJob>) {
        let state = self.sync_state();
        let endpoint = self.endpoint.clone();
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            loop {
                let job = tokio::select! {
                    _ = cancel.cancelled() => break,
                    job = jobs.recv_async() => match job {
                        Ok(job) => job,
                        Err(_) => break,
                    },
                };
                let client = NetworkSyncClient::new(endpoint.clone(), job.from);
                if let Err(e) = sync::download_file(&state, &client, job.download).await {
                    // Metadata is already recorded; the blob is fetched on a
                    // later tick.
                    tracing::warn!(
                        blob = %job.download.value_hash,
                        "blob download failed: {e}"
                    );
                }
            }
            tracing::debug!("download worker stopped");
        });
    }

    pub fn is_master(&self) -> bool {
        self.keys.is_master()
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Stop background tasks and close the endpoint.
    pub async fn shutdown(&self) -> Result<()> {
        self.cancel.cancel();
        self.router.shutdown().await?;
        self.endpoint.close().await;
        Ok(())
    }
}
