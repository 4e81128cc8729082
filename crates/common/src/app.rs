//! The application facade: everything a front-end (CLI, desktop shell)
//! calls. Owns the database, key material, vault, and network node, and
//! wires vault mutations to update publishing on master nodes.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::sync::{watch, Mutex, RwLock};
use tokio_util::sync::CancellationToken;

use crate::crypto::{KeyError, MerkleTree, VaultKeys};
use crate::db::{self, Database, DbError, PeerRecord};
use crate::log::{
    publisher, DataAction, PeerAction, PublishError, SignedUpdate, UpdateError,
};
use crate::objects::{ObjectStore, ObjectStoreError};
use crate::peer::{bind, BindError, Node, NodeBuilder};
use crate::vault::{FolderItem, PathSegment, Vault, VaultError};

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("database error: {0}")]
    Db(#[from] DbError),

    #[error("key error: {0}")]
    Key(#[from] KeyError),

    #[error("vault error: {0}")]
    Vault(#[from] VaultError),

    #[error("object store error: {0}")]
    ObjectStore(#[from] ObjectStoreError),

    #[error("publish error: {0}")]
    Publish(#[from] PublishError),

    #[error("update error: {0}")]
    Update(#[from] UpdateError),

    #[error("bind error: {0}")]
    Bind(#[from] BindError),

    #[error("network error: {0}")]
    Network(#[from] anyhow::Error),

    #[error("vault is locked")]
    VaultLocked,

    #[error("mnemonic does not match this vault")]
    MnemonicMismatch,

    #[error("only master nodes can do this")]
    NotMaster,

    #[error("node is not running")]
    NodeNotRunning,

    #[error("a binding session is already active")]
    BindingInProgress,
}

/// Lifecycle state shown to front-ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppState {
    /// No keys yet: create a vault or start binding.
    Fresh,
    /// A binding session is waiting for a master.
    Binding,
    /// Bound but unable to decrypt (replica, or master pre-unlock).
    Locked,
    /// Content key available; vault operations allowed.
    Unlocked,
}

/// One peer row for the front-end.
#[derive(Debug, Clone)]
pub struct PeerStatus {
    pub peer_id: String,
    pub is_self: bool,
    pub is_online: bool,
    pub last_seen: Option<time::OffsetDateTime>,
}

/// Where the app keeps its on-disk artifacts.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub db_path: PathBuf,
    pub data_dir: PathBuf,
    pub port: u16,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("./endershare.db"),
            data_dir: PathBuf::from("./data"),
            port: crate::peer::node::DEFAULT_PORT,
        }
    }
}

struct BindingSession {
    phrase: String,
    cancel: CancellationToken,
}

struct AppInner {
    config: AppConfig,
    db: Database,
    objects: ObjectStore,
    merkle: Arc<Mutex<MerkleTree>>,
    keys: RwLock<Option<VaultKeys>>,
    vault: RwLock<Option<Arc<Vault>>>,
    node: RwLock<Option<Node>>,
    binding: Mutex<Option<BindingSession>>,
    changes: watch::Sender<u64>,
}

/// The application core. Cheap to clone; all state is shared.
#[derive(Clone)]
pub struct App {
    inner: Arc<AppInner>,
}

impl App {
    /// Open the database and object store and load whatever key material
    /// exists. Does not touch the network; call [`App::start_node`].
    pub async fn open(config: AppConfig) -> Result<Self, AppError> {
        let db = Database::open(&config.db_path).await?;
        let objects = ObjectStore::open(&config.data_dir)?;
        let keys = db.load_keys().await?;
        let merkle = Arc::new(Mutex::new(MerkleTree::new(db.all_entry_hashes().await?)));

        let (changes, _) = watch::channel(0u64);
        let app = Self {
            inner: Arc::new(AppInner {
                config,
                db,
                objects,
                merkle,
                keys: RwLock::new(keys),
                vault: RwLock::new(None),
                node: RwLock::new(None),
                binding: Mutex::new(None),
                changes,
            }),
        };

        // A master that already holds its content key unlocks on open.
        let content_key = {
            let keys = app.inner.keys.read().await;
            keys.as_ref().and_then(|k| k.content_key().copied())
        };
        if let Some(content_key) = content_key {
            app.install_vault(content_key).await?;
        }
        Ok(app)
    }

    pub fn db(&self) -> &Database {
        &self.inner.db
    }

    pub fn objects(&self) -> &ObjectStore {
        &self.inner.objects
    }

    /// Current lifecycle state.
    pub async fn state(&self) -> AppState {
        if self.inner.binding.lock().await.is_some() {
            return AppState::Binding;
        }
        let keys = self.inner.keys.read().await;
        match keys.as_ref() {
            None => AppState::Fresh,
            Some(keys) => {
                if keys.content_key().is_some() {
                    AppState::Unlocked
                } else if keys.master_pub().is_some() {
                    AppState::Locked
                } else {
                    // Peer keys without a master: binding never finished.
                    AppState::Fresh
                }
            }
        }
    }

    pub async fn is_master(&self) -> bool {
        self.inner
            .keys
            .read()
            .await
            .as_ref()
            .map(VaultKeys::is_master)
            .unwrap_or(false)
    }

    /// Notifications carrying the id of each applied update.
    pub fn subscribe_changes(&self) -> watch::Receiver<u64> {
        self.inner.changes.subscribe()
    }

    /// Create a brand-new vault on this device, which becomes the master.
    /// Returns the 24-word mnemonic.
    pub async fn create_vault(&self) -> Result<String, AppError> {
        // Key derivation is scrypt-bound; keep it off the runtime threads.
        let (keys, mnemonic) = tokio::task::spawn_blocking(VaultKeys::create)
            .await
            .map_err(|e| AppError::Network(anyhow::anyhow!("key derivation task: {e}")))??;
        self.install_keys(keys).await?;
        Ok(mnemonic)
    }

    /// Unlock with the vault mnemonic. On a bound device the derived master
    /// key must match the installed master public key.
    pub async fn unlock_with_mnemonic(&self, mnemonic: &str) -> Result<(), AppError> {
        let input = mnemonic.to_owned();
        let derived = tokio::task::spawn_blocking(move || VaultKeys::from_mnemonic(&input))
            .await
            .map_err(|e| AppError::Network(anyhow::anyhow!("key derivation task: {e}")))??;

        let mut keys_slot = self.inner.keys.write().await;
        let keys = match keys_slot.take() {
            Some(existing) => {
                if let Some(installed) = existing.master_pub() {
                    if derived.master_pub().map(|k| k.to_bytes()) != Some(installed.to_bytes()) {
                        *keys_slot = Some(existing);
                        return Err(AppError::MnemonicMismatch);
                    }
                }
                // Keep this device's peer identity.
                VaultKeys::from_parts(
                    derived.master_seed_bytes(),
                    derived.master_pub_bytes(),
                    existing.peer_seed_bytes(),
                    derived.content_key().copied(),
                )?
            }
            None => derived,
        };
        *keys_slot = Some(keys);
        drop(keys_slot);

        self.persist_keys().await?;
        let content_key = {
            let keys = self.inner.keys.read().await;
            keys.as_ref().and_then(|k| k.content_key().copied())
        };
        if let Some(content_key) = content_key {
            self.install_vault(content_key).await?;
        }
        Ok(())
    }

    async fn install_keys(&self, keys: VaultKeys) -> Result<(), AppError> {
        let content_key = keys.content_key().copied();
        *self.inner.keys.write().await = Some(keys);
        self.persist_keys().await?;
        if let Some(content_key) = content_key {
            self.install_vault(content_key).await?;
        }
        Ok(())
    }

    async fn persist_keys(&self) -> Result<(), AppError> {
        let keys = self.inner.keys.read().await;
        let keys = keys.as_ref().ok_or(AppError::VaultLocked)?;
        self.inner.db.store_keys(keys).await?;
        // Every node authorizes itself.
        db::peers::add_peer(
            self.inner.db.pool(),
            &PeerRecord::new(keys.peer_id().to_string(), Vec::new()),
        )
        .await?;
        Ok(())
    }

    async fn install_vault(&self, content_key: [u8; 32]) -> Result<(), AppError> {
        let vault = Arc::new(
            Vault::load(
                self.inner.db.clone(),
                self.inner.objects.clone(),
                content_key,
            )
            .await?,
        );
        *self.inner.vault.write().await = Some(vault.clone());
        if let Some(node) = self.inner.node.read().await.as_ref() {
            node.set_vault(vault).await;
        }
        Ok(())
    }

    async fn vault(&self) -> Result<Arc<Vault>, AppError> {
        self.inner
            .vault
            .read()
            .await
            .clone()
            .ok_or(AppError::VaultLocked)
    }

    async fn keys(&self) -> Result<VaultKeys, AppError> {
        self.inner
            .keys
            .read()
            .await
            .clone()
            .ok_or(AppError::VaultLocked)
    }

    async fn node(&self) -> Result<Node, AppError> {
        self.inner
            .node
            .read()
            .await
            .clone()
            .ok_or(AppError::NodeNotRunning)
    }

    /// Start the network node and, when the master key is known, join the
    /// broadcast topic. Requires key material (fresh replicas get theirs
    /// from [`App::start_replica_binding`]).
    pub async fn start_node(&self) -> Result<(), AppError> {
        let keys = self.keys().await?;
        let node = NodeBuilder::new()
            .db(self.inner.db.clone())
            .objects(self.inner.objects.clone())
            .merkle(self.inner.merkle.clone())
            .keys(keys.clone())
            .port(self.inner.config.port)
            .build()
            .await?;

        if let Some(vault) = self.inner.vault.read().await.clone() {
            node.set_vault(vault).await;
        }

        // Forward node change notifications to app subscribers.
        let mut node_changes = node.subscribe_changes();
        let app = self.clone();
        tokio::spawn(async move {
            while node_changes.changed().await.is_ok() {
                let id = *node_changes.borrow();
                let _ = app.inner.changes.send(id);
            }
        });

        if self.inner.db.master_public_key().await?.is_some() {
            node.join_topic().await?;
        }
        *self.inner.node.write().await = Some(node);
        Ok(())
    }

    /// Stop the network node.
    pub async fn shutdown(&self) -> Result<(), AppError> {
        if let Some(node) = self.inner.node.write().await.take() {
            node.shutdown().await?;
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Binding
    // ------------------------------------------------------------------

    /// Begin waiting for a master to authorize this device. Returns the
    /// 4-word phrase to type on the master.
    pub async fn start_replica_binding(&self) -> Result<String, AppError> {
        let mut binding = self.inner.binding.lock().await;
        if binding.is_some() {
            return Err(AppError::BindingInProgress);
        }

        // First run on this device: create replica keys.
        let has_keys = self.inner.keys.read().await.is_some();
        if !has_keys {
            *self.inner.keys.write().await = Some(VaultKeys::replica());
            self.persist_keys().await?;
        }
        let keys = self.keys().await?;

        let phrase = bind::generate_phrase();
        let cancel = CancellationToken::new();
        *binding = Some(BindingSession {
            phrase: phrase.clone(),
            cancel: cancel.clone(),
        });
        drop(binding);

        let app = self.clone();
        let wait_phrase = phrase.clone();
        tokio::spawn(async move {
            let result = bind::wait_for_binding(&wait_phrase, keys.peer_id(), cancel).await;
            *app.inner.binding.lock().await = None;
            match result {
                Ok(outcome) => {
                    if let Err(e) = app.complete_binding(outcome).await {
                        tracing::error!("failed to install binding outcome: {e}");
                    }
                }
                Err(BindError::Cancelled) => {}
                Err(e) => tracing::error!("binding failed: {e}"),
            }
        });

        Ok(phrase)
    }

    /// The phrase of the active binding session, if any.
    pub async fn binding_phrase(&self) -> Option<String> {
        self.inner
            .binding
            .lock()
            .await
            .as_ref()
            .map(|s| s.phrase.clone())
    }

    /// Cancel an active binding session.
    pub async fn cancel_binding(&self) -> Result<(), AppError> {
        if let Some(session) = self.inner.binding.lock().await.take() {
            session.cancel.cancel();
        }
        Ok(())
    }

    async fn complete_binding(&self, outcome: bind::BindOutcome) -> Result<(), AppError> {
        self.inner.db.set_master_public_key(&outcome.master_pub).await?;
        if let Some(keys) = self.inner.keys.write().await.as_mut() {
            keys.install_master_pub(outcome.master_pub);
        }
        self.persist_keys().await?;

        db::peers::add_peer(self.inner.db.pool(), &outcome.master_peer).await?;
        for peer in &outcome.peers {
            db::peers::add_peer(self.inner.db.pool(), peer).await?;
        }

        if let Some(node) = self.inner.node.read().await.as_ref() {
            node.reload_allowed_peers().await?;
            node.join_topic().await?;
        }
        tracing::info!("binding complete; replica is now authorized");
        Ok(())
    }

    /// Master side: authorize a replica that is waiting with `phrase`.
    pub async fn bind_peer_with_phrase(&self, phrase: &str) -> Result<(), AppError> {
        let keys = self.keys().await?;
        if !keys.is_master() {
            return Err(AppError::NotMaster);
        }
        let node = self.node().await?;

        let peer_list = self.inner.db.all_peers().await?;
        let our_addresses = node
            .endpoint()
            .bound_sockets()
            .into_iter()
            .map(|addr| addr.to_string())
            .collect();

        let record =
            bind::bind_peer(node.endpoint(), phrase, &keys, peer_list, our_addresses).await?;
        self.authorize_peer(&record.peer_id, record.addrs).await
    }

    /// Master side: add a peer to the authorized set and publish the
    /// corresponding update. Binding calls this once the handshake has
    /// verified the phrase.
    pub async fn authorize_peer(
        &self,
        peer_id: &str,
        addresses: Vec<String>,
    ) -> Result<(), AppError> {
        let keys = self.keys().await?;
        if !keys.is_master() {
            return Err(AppError::NotMaster);
        }

        let signed = publisher::publish_peer_update(
            &self.inner.db,
            &self.inner.merkle,
            &keys,
            PeerAction::Add,
            peer_id,
            addresses,
        )
        .await?;
        if let Some(node) = self.inner.node.read().await.as_ref() {
            node.reload_allowed_peers().await?;
            self.broadcast(node, &signed).await;
        }
        Ok(())
    }

    /// Master side: revoke a replica.
    pub async fn remove_peer(&self, peer_id: &str) -> Result<(), AppError> {
        let keys = self.keys().await?;
        if !keys.is_master() {
            return Err(AppError::NotMaster);
        }

        let signed = publisher::publish_peer_update(
            &self.inner.db,
            &self.inner.merkle,
            &keys,
            PeerAction::Remove,
            peer_id,
            Vec::new(),
        )
        .await?;
        if let Some(node) = self.inner.node.read().await.as_ref() {
            node.reload_allowed_peers().await?;
            self.broadcast(node, &signed).await;
        }
        Ok(())
    }

    /// All authorized peers with their last-seen status.
    pub async fn get_peers(&self) -> Result<Vec<PeerStatus>, AppError> {
        let node = self.inner.node.read().await.clone();
        let self_id = {
            let keys = self.inner.keys.read().await;
            keys.as_ref().map(|k| k.peer_id().to_string())
        };

        let mut result = Vec::new();
        for record in self.inner.db.all_peers().await? {
            let is_self = self_id.as_deref() == Some(record.peer_id.as_str());
            let last_seen = match (&node, record.peer_id.parse()) {
                (Some(node), Ok(id)) => node.last_seen(&id).await,
                _ => None,
            };
            let is_online = is_self
                || last_seen
                    .map(|t| time::OffsetDateTime::now_utc() - t < time::Duration::minutes(1))
                    .unwrap_or(false);
            result.push(PeerStatus {
                peer_id: record.peer_id,
                is_self,
                is_online,
                last_seen,
            });
        }
        Ok(result)
    }

    // ------------------------------------------------------------------
    // Vault operations
    // ------------------------------------------------------------------

    pub async fn list_folder(&self, folder_id: u64) -> Result<Vec<FolderItem>, AppError> {
        Ok(self.vault().await?.list_folder(folder_id).await?)
    }

    pub async fn get_folder_path(&self, folder_id: u64) -> Result<Vec<PathSegment>, AppError> {
        Ok(self.vault().await?.get_folder_path(folder_id).await?)
    }

    pub async fn create_folder(
        &self,
        name: &str,
        parent_folder_id: u64,
    ) -> Result<u64, AppError> {
        let vault = self.vault().await?;
        let (folder_id, entry) = vault.create_folder(name, parent_folder_id).await?;
        self.publish_data(DataAction::Add, entry).await?;
        Ok(folder_id)
    }

    pub async fn add_file(
        &self,
        local_path: &Path,
        name: &str,
        folder_id: u64,
    ) -> Result<(), AppError> {
        let vault = self.vault().await?;
        let entry = vault.add_file(local_path, name, folder_id).await?;
        self.publish_data(DataAction::Add, entry).await?;
        Ok(())
    }

    pub async fn export_file(
        &self,
        name: &str,
        folder_id: u64,
        dest_path: &Path,
    ) -> Result<(), AppError> {
        Ok(self
            .vault()
            .await?
            .export_file(name, folder_id, dest_path)
            .await?)
    }

    pub async fn delete_file(&self, name: &str, folder_id: u64) -> Result<(), AppError> {
        let vault = self.vault().await?;
        let entry = vault.delete_file(name, folder_id).await?;
        self.publish_data(DataAction::Delete, entry).await?;
        Ok(())
    }

    pub async fn delete_folder(&self, folder_id: u64) -> Result<(), AppError> {
        let vault = self.vault().await?;
        let entry = vault.delete_folder(folder_id).await?;
        self.publish_data(DataAction::Delete, entry).await?;
        Ok(())
    }

    pub async fn storage_stats(&self) -> Result<(u64, u64), AppError> {
        Ok(self.inner.db.storage_stats().await?)
    }

    async fn publish_data(
        &self,
        action: DataAction,
        entry: crate::vault::NewEntry,
    ) -> Result<(), AppError> {
        let keys = self.keys().await?;
        if !keys.is_master() {
            // Replicas mutate nothing; the vault call should have failed
            // earlier, but the log write is master-only regardless.
            return Err(AppError::NotMaster);
        }

        let signed = publisher::publish_data_update(
            &self.inner.db,
            &self.inner.merkle,
            &keys,
            action,
            entry.row,
            Some(entry.folder_tag),
        )
        .await?;

        if let Some(node) = self.inner.node.read().await.as_ref() {
            self.broadcast(node, &signed).await;
        }
        let _ = self
            .inner
            .changes
            .send(self.inner.db.current_update_id().await?);
        Ok(())
    }

    async fn broadcast(&self, node: &Node, signed: &SignedUpdate) {
        match signed.to_json() {
            Ok(json) => {
                if let Err(e) = node.broadcast_update(&json).await {
                    tracing::warn!("broadcast failed (peers catch up on next tick): {e}");
                }
            }
            Err(e) => tracing::error!("signed update serialization failed: {e}"),
        }
    }
}
