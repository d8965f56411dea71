// Repo backend: one replication node
//
// Wires the stores, the network and the replication manager together and
// drives documents through an external merge engine. A document is the
// causal union of its actors' feeds; the local cursor says how far to follow
// each actor, and clocks gossiped by peers set the minimum a document must
// reach before its patches surface.

use crate::actor::{Actor, ActorError, ActorMsg};
use crate::clock::{union, Clock, Seq, INFINITY};
use crate::config::{ConfigError, RepoConfig};
use crate::doc::{Change, DocBackend, DocError, DocEvent, MergeEngine};
use crate::feed::{FeedError, FeedStore};
use crate::keys::{ActorId, DocId, FeedId, KeyError, PeerId, RepoId};
use crate::messages::{CursorMessage, DocClock, DocCursor, DocumentMessage, RepoMsg};
use crate::net::{
    ConnectionError, MessageRouter, Network, NetworkError, NetworkPeer, Routed, Swarm,
    SwarmConnection,
};
use crate::queue::{Queue, QueueError};
use crate::replication::{Discovery, ReplicationError, ReplicationManager};
use crate::store::{
    ClockStore, ClockUpdate, CursorStore, FileMetadata, KeyStore, Metadata, Storage, StoreError,
};
use crate::store::keys::SELF_REPO;
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

pub const REPO_CHANNEL: &str = "RepoMessages";

/// Key store entry of the metadata ledger's feed
const LEDGER_KEY: &str = "self.ledger";

/// File payloads are split into blocks of at most this size
pub const FILE_BLOCK_SIZE: usize = 64 * 1024;

/// Core error types
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("Storage error: {0}")]
    Store(#[from] StoreError),

    #[error("Feed error: {0}")]
    Feed(#[from] FeedError),

    #[error("Actor error: {0}")]
    Actor(#[from] ActorError),

    #[error("Document error: {0}")]
    Doc(#[from] DocError),

    #[error("Network error: {0}")]
    Network(#[from] NetworkError),

    #[error("Connection error: {0}")]
    Connection(#[from] ConnectionError),

    #[error("Replication error: {0}")]
    Replication(#[from] ReplicationError),

    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("Key error: {0}")]
    Key(#[from] KeyError),

    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    #[error("Document {0} is not open")]
    DocNotOpen(DocId),

    #[error("Document {0} was deleted")]
    DocDeleted(DocId),

    #[error("{0} is not a file")]
    NotAFile(FeedId),

    #[error("File {0} has not fully arrived yet")]
    FileIncomplete(FeedId),

    #[error("Repo is closed")]
    Closed,
}

/// What the repo reports to the application
#[derive(Debug, Clone, PartialEq)]
pub enum RepoEvent<P> {
    /// The document reached its minimum clock; `patch` rebuilds it fully
    Ready {
        doc_id: DocId,
        patch: P,
        clock: Clock,
    },
    Patch {
        doc_id: DocId,
        patch: P,
        local: bool,
        clock: Clock,
    },
    DocumentMessage {
        doc_id: DocId,
        peer: PeerId,
        contents: serde_json::Value,
    },
    /// A stored clock grew: ours after applying changes, or a peer's
    ClockUpdated {
        doc_id: DocId,
        repo: RepoId,
        clock: Clock,
    },
}

impl<P> From<DocEvent<P>> for RepoEvent<P> {
    fn from(event: DocEvent<P>) -> Self {
        match event {
            DocEvent::Ready {
                doc_id,
                patch,
                clock,
            } => RepoEvent::Ready {
                doc_id,
                patch,
                clock,
            },
            DocEvent::Patch {
                doc_id,
                patch,
                local,
                clock,
            } => RepoEvent::Patch {
                doc_id,
                patch,
                local,
                clock,
            },
        }
    }
}

struct RepoInner<E: MergeEngine> {
    id: RepoId,
    engine: Arc<E>,
    storage: Storage,
    feeds: Arc<FeedStore>,
    meta: Metadata,
    clocks: ClockStore,
    cursors: CursorStore,
    network: Arc<Network>,
    replication: Arc<ReplicationManager>,
    router: Arc<MessageRouter<RepoMsg>>,
    actors: RwLock<HashMap<ActorId, Arc<Actor>>>,
    docs: Mutex<HashMap<DocId, DocBackend<E>>>,
    /// Serializes local writes so sequence numbers are handed out once
    writes: Mutex<()>,
    actor_q: Queue<ActorMsg>,
    events: Queue<RepoEvent<E::Patch>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    closed: AtomicBool,
}

/// A replication node. Cloning yields another handle to the same repo.
pub struct RepoBackend<E: MergeEngine> {
    inner: Arc<RepoInner<E>>,
}

impl<E: MergeEngine> Clone for RepoBackend<E> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<E: MergeEngine> RepoBackend<E> {
    /// Open (or create) a repo. Must be called from within a tokio runtime.
    pub fn open(config: RepoConfig, engine: E) -> Result<Self, CoreError> {
        config.network.validate()?;
        let storage = Storage::open_or_temporary(config.storage_path.as_deref())?;
        let keys = KeyStore::open(&storage)?;
        let id = keys.get_or_create(SELF_REPO)?.peer_id();

        let feeds = Arc::new(FeedStore::open(&storage)?);
        let ledger_keys = keys.get_or_create(LEDGER_KEY)?;
        let ledger_id = feeds.create(&ledger_keys)?;
        let meta = Metadata::new(feeds.open_feed(&ledger_id)?);
        let replayed = meta.load()?;

        let clocks = ClockStore::open(&storage)?;
        let cursors = CursorStore::open(&storage)?;
        let network = Network::new(id, config.network.clone());
        let replication = ReplicationManager::new(feeds.clone())?;
        let router = MessageRouter::new(REPO_CHANNEL);

        let inner = Arc::new(RepoInner {
            id,
            engine: Arc::new(engine),
            storage,
            feeds,
            meta,
            clocks,
            cursors,
            network,
            replication,
            router,
            actors: RwLock::new(HashMap::new()),
            docs: Mutex::new(HashMap::new()),
            writes: Mutex::new(()),
            actor_q: Queue::new("actors"),
            events: Queue::new("repo-events"),
            tasks: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        });
        inner.spawn_loops()?;

        info!(
            "Repo {} opened ({}, {} ledger blocks)",
            id.short(),
            if config.is_memory() { "in memory" } else { "persistent" },
            replayed
        );
        Ok(Self { inner })
    }

    pub fn id(&self) -> RepoId {
        self.inner.id
    }

    /// Patches, readiness and messages for the application
    pub fn events(&self) -> Queue<RepoEvent<E::Patch>> {
        self.inner.events.clone()
    }

    pub fn network(&self) -> &Arc<Network> {
        &self.inner.network
    }

    pub fn feeds(&self) -> &Arc<FeedStore> {
        &self.inner.feeds
    }

    /// Known, non-deleted documents
    pub fn doc_ids(&self) -> Vec<DocId> {
        self.inner.meta.doc_ids()
    }

    /// Create a document whose root actor this repo writes.
    pub fn create_doc(&self) -> Result<DocId, CoreError> {
        let inner = &self.inner;
        inner.check_open()?;

        let (root, _) = inner.feeds.create_new()?;
        let doc_id: DocId = root.into();
        inner.meta.add_actor(doc_id, root)?;
        inner.cursors.add_actor(&inner.id, &doc_id, root, INFINITY)?;
        inner.ensure_actor(root)?;

        let ready = {
            let mut docs = inner.docs.lock();
            let mut doc = DocBackend::new(doc_id, inner.engine.clone(), Some(Clock::new()));
            let ready = doc.poll_ready();
            docs.insert(doc_id, doc);
            ready
        };
        inner.emit(ready);
        info!("Created document {}", doc_id.short());
        Ok(doc_id)
    }

    /// Open a document, ours or a peer's. Idempotent.
    pub fn open_doc(&self, doc_id: DocId) -> Result<(), CoreError> {
        let inner = &self.inner;
        inner.check_open()?;
        if inner.meta.is_deleted(&doc_id) {
            return Err(CoreError::DocDeleted(doc_id));
        }
        if inner.docs.lock().contains_key(&doc_id) {
            return Ok(());
        }

        let root = doc_id.root_actor();
        root.verifying_key()?;
        inner.meta.add_actor(doc_id, root)?;
        let cursor = inner.cursors.add_actor(&inner.id, &doc_id, root, INFINITY)?;

        let min_clock = if inner.feeds.is_writable(&root)? {
            Some(Clock::new())
        } else {
            let known = inner.clocks.for_document(&doc_id)?;
            if known.is_empty() {
                None
            } else {
                Some(known.values().fold(Clock::new(), |acc, c| union(&acc, c)))
            }
        };
        debug!(
            "Opening document {} (min clock {:?})",
            doc_id.short(),
            min_clock
        );

        inner.docs.lock().entry(doc_id).or_insert_with(|| {
            DocBackend::new(doc_id, inner.engine.clone(), min_clock)
        });
        for actor in cursor.actors() {
            inner.ensure_actor(*actor)?;
        }
        inner.sync_doc(&doc_id)?;

        let ready = inner.docs.lock().get_mut(&doc_id).and_then(|d| d.poll_ready());
        inner.emit(ready);
        inner.send_cursor_to_doc_peers(&doc_id);
        Ok(())
    }

    /// Record a local change. Returns its sequence number.
    pub fn change(&self, doc_id: &DocId, data: &[u8]) -> Result<Seq, CoreError> {
        let inner = &self.inner;
        inner.check_open()?;
        if inner.meta.is_deleted(doc_id) {
            return Err(CoreError::DocDeleted(*doc_id));
        }
        if !inner.docs.lock().contains_key(doc_id) {
            return Err(CoreError::DocNotOpen(*doc_id));
        }

        let _write = inner.writes.lock();
        let actor = inner.writable_actor(doc_id)?;
        let seq = actor.len() + 1;
        actor.write_change(seq, data)?;

        let (event, clock) = {
            let mut docs = inner.docs.lock();
            let doc = docs.get_mut(doc_id).ok_or(CoreError::DocNotOpen(*doc_id))?;
            let event = doc.apply_local_change(Change {
                actor: actor.id(),
                seq,
                data: data.to_vec(),
            })?;
            (event, doc.clock().clone())
        };
        inner.emit(event);
        inner.store_clock(doc_id, &clock)?;
        Ok(seq)
    }

    /// Fold another document's current state into `doc_id`.
    pub fn merge(&self, doc_id: &DocId, other: &DocId) -> Result<(), CoreError> {
        let inner = &self.inner;
        inner.check_open()?;
        if !inner.docs.lock().contains_key(doc_id) {
            return Err(CoreError::DocNotOpen(*doc_id));
        }
        let clock = self.clock(other).ok_or(CoreError::DocNotOpen(*other))?;
        if clock.is_empty() {
            return Ok(());
        }

        inner.meta.merge(*doc_id, clock.clone())?;
        inner
            .meta
            .add_actors(*doc_id, clock.actors().copied().collect())?;
        inner.cursors.update(&inner.id, doc_id, &clock)?;
        for actor in clock.actors() {
            inner.ensure_actor(*actor)?;
        }
        inner.sync_doc(doc_id)?;
        inner.send_cursor_to_doc_peers(doc_id);
        info!("Merged {} into {}", other.short(), doc_id.short());
        Ok(())
    }

    /// Delete a document. It can never be reopened in this repo.
    pub async fn destroy_doc(&self, doc_id: &DocId) -> Result<(), CoreError> {
        let inner = &self.inner;
        inner.check_open()?;
        inner.meta.delete(*doc_id)?;
        inner.docs.lock().remove(doc_id);
        inner.network.leave(&doc_id.root_actor()).await?;
        info!("Deleted document {}", doc_id.short());
        Ok(())
    }

    /// Send an ephemeral message to every peer replicating the document.
    /// Returns the number of peers it went out to.
    pub fn send_doc_message(
        &self,
        doc_id: &DocId,
        contents: serde_json::Value,
    ) -> Result<usize, CoreError> {
        let inner = &self.inner;
        let root = inner
            .actor(&doc_id.root_actor())
            .ok_or(CoreError::DocNotOpen(*doc_id))?;
        Ok(root.message(&DocumentMessage {
            id: *doc_id,
            contents,
        }))
    }

    /// Current clock of an open document, or the stored one otherwise
    pub fn clock(&self, doc_id: &DocId) -> Option<Clock> {
        if let Some(doc) = self.inner.docs.lock().get(doc_id) {
            return Some(doc.clock().clone());
        }
        self.inner.clocks.get(&self.inner.id, doc_id).ok()
    }

    /// Run `f` on the merge state of an open document
    pub fn with_doc_state<R>(&self, doc_id: &DocId, f: impl FnOnce(&E::State) -> R) -> Option<R> {
        self.inner.docs.lock().get(doc_id).map(|doc| f(doc.state()))
    }

    pub fn is_ready(&self, doc_id: &DocId) -> bool {
        self.inner
            .docs
            .lock()
            .get(doc_id)
            .map(|d| d.is_ready())
            .unwrap_or(false)
    }

    /// Store a flat file in its own feed: a metadata header, then the bytes.
    pub fn write_file(&self, bytes: &[u8], mime_type: &str) -> Result<FeedId, CoreError> {
        let inner = &self.inner;
        inner.check_open()?;
        let (id, _) = inner.feeds.create_new()?;
        let header = FileMetadata {
            bytes: bytes.len() as u64,
            mime_type: mime_type.to_string(),
        };
        let encoded =
            serde_json::to_vec(&header).map_err(|e| StoreError::Serialization(e.to_string()))?;
        inner.feeds.append(&id, &encoded)?;
        for chunk in bytes.chunks(FILE_BLOCK_SIZE) {
            inner.feeds.append(&id, chunk)?;
        }
        inner.meta.add_file(id, header.bytes, mime_type)?;
        inner.share_feed(id);
        info!("Stored file {} ({} bytes)", id.short(), header.bytes);
        Ok(id)
    }

    /// Read a file back. Files from peers start replicating on first read
    /// and report `FileIncomplete` until every block has arrived.
    pub fn read_file(&self, id: &FeedId) -> Result<(Vec<u8>, String), CoreError> {
        let inner = &self.inner;
        let feed = inner.feeds.open_feed(id)?;
        if !inner.meta.is_file(id) {
            inner.share_feed(*id);
        }

        let header = feed.get(0)?.ok_or(CoreError::FileIncomplete(*id))?;
        let header: FileMetadata =
            serde_json::from_slice(&header).map_err(|_| CoreError::NotAFile(*id))?;

        // The header may come from a peer; size the buffer by what is stored
        let stored = feed.len().saturating_sub(1).saturating_mul(FILE_BLOCK_SIZE as u64);
        let mut bytes = Vec::with_capacity(header.bytes.min(stored) as usize);
        for block in feed.get_range(1, feed.len())? {
            bytes.extend_from_slice(&block);
        }
        if (bytes.len() as u64) < header.bytes {
            return Err(CoreError::FileIncomplete(*id));
        }
        bytes.truncate(header.bytes as usize);
        inner.meta.add_file(*id, header.bytes, &header.mime_type)?;
        Ok((bytes, header.mime_type))
    }

    pub async fn attach_swarm(
        &self,
        swarm: Arc<dyn Swarm>,
        incoming: mpsc::UnboundedReceiver<SwarmConnection>,
    ) -> Result<(), CoreError> {
        self.inner.check_open()?;
        self.inner.network.attach_swarm(swarm, incoming).await?;
        Ok(())
    }

    pub async fn close(&self) -> Result<(), CoreError> {
        let inner = &self.inner;
        if inner.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        for task in inner.tasks.lock().drain(..) {
            task.abort();
        }
        inner.replication.close();
        inner.router.close();
        inner.network.close().await;

        let actors: Vec<Arc<Actor>> = inner.actors.write().drain().map(|(_, a)| a).collect();
        for actor in actors {
            actor.close();
        }
        inner.docs.lock().clear();
        inner.feeds.flush()?;
        inner.storage.flush()?;
        info!("Repo {} closed", inner.id.short());
        Ok(())
    }
}

impl<E: MergeEngine> RepoInner<E> {
    fn check_open(&self) -> Result<(), CoreError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(CoreError::Closed);
        }
        Ok(())
    }

    fn spawn_loops(self: &Arc<Self>) -> Result<(), CoreError> {
        let mut peers = self.network.peer_q().subscribe()?;
        let mut discoveries = self.replication.discovery_q().subscribe()?;
        let mut actor_msgs = self.actor_q.subscribe()?;
        let mut repo_msgs = self.router.inbox().subscribe()?;

        let weak: Weak<Self> = Arc::downgrade(self);
        let peer_task = tokio::spawn(async move {
            while let Some(peer) = peers.recv().await {
                let Some(repo) = weak.upgrade() else {
                    break;
                };
                repo.on_peer(&peer);
            }
        });

        let weak: Weak<Self> = Arc::downgrade(self);
        let discovery_task = tokio::spawn(async move {
            while let Some(discovery) = discoveries.recv().await {
                let Some(repo) = weak.upgrade() else {
                    break;
                };
                repo.on_discovery(&discovery);
            }
        });

        let weak: Weak<Self> = Arc::downgrade(self);
        let actor_task = tokio::spawn(async move {
            while let Some(msg) = actor_msgs.recv().await {
                let Some(repo) = weak.upgrade() else {
                    break;
                };
                repo.on_actor_msg(msg);
            }
        });

        let weak: Weak<Self> = Arc::downgrade(self);
        let message_task = tokio::spawn(async move {
            while let Some(Routed { sender, msg }) = repo_msgs.recv().await {
                let Some(repo) = weak.upgrade() else {
                    break;
                };
                repo.on_repo_msg(&sender, msg);
            }
        });

        self.tasks
            .lock()
            .extend([peer_task, discovery_task, actor_task, message_task]);
        Ok(())
    }

    fn emit(&self, event: Option<DocEvent<E::Patch>>) {
        if let Some(event) = event {
            self.events.push(event.into());
        }
    }

    fn emit_clock_update(&self, update: Option<ClockUpdate>) {
        if let Some(update) = update {
            self.events.push(RepoEvent::ClockUpdated {
                doc_id: update.doc_id,
                repo: update.scope,
                clock: update.clock,
            });
        }
    }

    fn store_clock(&self, doc_id: &DocId, clock: &Clock) -> Result<(), CoreError> {
        let (_, update) = self.clocks.update(&self.id, doc_id, clock)?;
        self.emit_clock_update(update);
        Ok(())
    }

    fn actor(&self, id: &ActorId) -> Option<Arc<Actor>> {
        self.actors.read().get(id).cloned()
    }

    /// The actor for `id`, opening its feed and announcing it on first use
    fn ensure_actor(&self, id: ActorId) -> Result<Arc<Actor>, CoreError> {
        if let Some(actor) = self.actor(&id) {
            return Ok(actor);
        }
        let feed = self.feeds.open_feed(&id)?;
        let actor = {
            let mut actors = self.actors.write();
            if let Some(actor) = actors.get(&id) {
                return Ok(actor.clone());
            }
            let actor = Actor::new(feed, self.actor_q.clone())?;
            actors.insert(id, actor.clone());
            actor
        };
        self.share_feed(id);
        Ok(actor)
    }

    /// Make a feed findable: join its topic and offer it to connected peers.
    fn share_feed(&self, id: FeedId) {
        self.replication.add_feed_ids(&[id]);
        let network = self.network.clone();
        tokio::spawn(async move {
            if let Err(e) = network.join(&id).await {
                warn!("Could not join topic for {}: {}", id.short(), e);
            }
        });
    }

    /// An actor of `doc_id` this repo may write, created on first use.
    fn writable_actor(&self, doc_id: &DocId) -> Result<Arc<Actor>, CoreError> {
        for id in self.meta.actors(doc_id) {
            if self.feeds.is_writable(&id)? {
                return self.ensure_actor(id);
            }
        }

        let (id, _) = self.feeds.create_new()?;
        self.meta.add_actor(*doc_id, id)?;
        self.cursors.add_actor(&self.id, doc_id, id, INFINITY)?;
        let actor = self.ensure_actor(id)?;
        info!("Document {}: writing as actor {}", doc_id.short(), id.short());
        self.send_cursor_to_doc_peers(doc_id);
        Ok(actor)
    }

    /// Apply every locally available change the cursor covers and the
    /// document has not seen yet.
    fn sync_doc(&self, doc_id: &DocId) -> Result<(), CoreError> {
        let Some(have) = self.docs.lock().get(doc_id).map(|d| d.clock().clone()) else {
            return Ok(());
        };
        let cursor = self.cursors.get(&self.id, doc_id)?;

        let mut changes = Vec::new();
        for (actor_id, wanted) in cursor.iter() {
            let Some(actor) = self.actor(actor_id) else {
                continue;
            };
            let limit = (*wanted).min(actor.len());
            for seq in have.get(actor_id) + 1..=limit {
                match actor.read_change(seq)? {
                    Some(data) => changes.push(Change {
                        actor: *actor_id,
                        seq,
                        data,
                    }),
                    None => break,
                }
            }
        }

        let (event, clock) = {
            let mut docs = self.docs.lock();
            let Some(doc) = docs.get_mut(doc_id) else {
                return Ok(());
            };
            let event = doc.apply_remote_changes(changes)?;
            (event, doc.clock().clone())
        };
        self.emit(event);
        self.store_clock(doc_id, &clock)
    }

    fn open_doc_ids(&self) -> BTreeSet<DocId> {
        self.docs.lock().keys().copied().collect()
    }

    fn cursor_message(&self, docs: &[DocId]) -> Result<CursorMessage, CoreError> {
        let mut msg = CursorMessage::default();
        for doc_id in docs {
            if self.meta.is_deleted(doc_id) {
                continue;
            }
            let cursor = self.cursors.get(&self.id, doc_id)?;
            if !cursor.is_empty() {
                msg.cursors.push(DocCursor {
                    doc_id: *doc_id,
                    cursor,
                });
            }
            msg.clocks.push(DocClock {
                doc_id: *doc_id,
                clock: self.clocks.get(&self.id, doc_id)?,
            });
        }
        Ok(msg)
    }

    fn send_cursor(&self, peer: &Arc<NetworkPeer>, docs: &[DocId]) {
        let msg = match self.cursor_message(docs) {
            Ok(msg) if !msg.is_empty() => msg,
            Ok(_) => return,
            Err(e) => {
                warn!("Could not build cursor message: {}", e);
                return;
            }
        };
        if let Err(e) = self
            .router
            .send_to_peer(peer, &RepoMsg::CursorMessage(msg))
        {
            debug!("Cursor message to {} failed: {}", peer.id().short(), e);
        }
    }

    /// Tell everyone replicating one of the document's actors about our
    /// cursor and clock.
    fn send_cursor_to_doc_peers(&self, doc_id: &DocId) {
        let mut peers = BTreeSet::new();
        for actor_id in self.meta.actors(doc_id) {
            if let Some(actor) = self.actor(&actor_id) {
                peers.extend(actor.peers());
            }
        }
        for peer_id in peers {
            if let Some(peer) = self.network.peer(&peer_id) {
                self.send_cursor(&peer, &[*doc_id]);
            }
        }
    }

    fn on_peer(&self, peer: &Arc<NetworkPeer>) {
        if let Err(e) = self.replication.on_peer(peer) {
            debug!("Replication with {} not started: {}", peer.id().short(), e);
        }
        if let Err(e) = self.router.listen(peer) {
            debug!("Repo channel with {} not opened: {}", peer.id().short(), e);
        }
    }

    fn on_discovery(&self, discovery: &Discovery) {
        let mut docs: BTreeSet<DocId> = self
            .meta
            .docs_with_actor(&discovery.feed_id)
            .into_iter()
            .collect();
        match self
            .cursors
            .docs_with_actor(&self.id, &discovery.feed_id, 0)
        {
            Ok(found) => docs.extend(found),
            Err(e) => warn!("Cursor lookup failed: {}", e),
        }
        let docs: Vec<DocId> = docs.into_iter().collect();
        debug!(
            "Feed {} shared with {}, sending {} cursor(s)",
            discovery.feed_id.short(),
            discovery.peer.id().short(),
            docs.len()
        );
        self.send_cursor(&discovery.peer, &docs);
    }

    fn on_actor_msg(&self, msg: ActorMsg) {
        let result = match msg {
            ActorMsg::Ready { actor, writable } => {
                debug!("Actor {} ready (writable: {})", actor.short(), writable);
                for doc_id in self.meta.docs_with_actor(&actor) {
                    self.send_cursor_to_doc_peers(&doc_id);
                }
                Ok(())
            }
            ActorMsg::PeerAdd { actor, peer } => {
                debug!("Actor {}: peer {} joined", actor.short(), peer.short());
                Ok(())
            }
            ActorMsg::PeerRemove { actor, peer } => {
                debug!("Actor {}: peer {} left", actor.short(), peer.short());
                Ok(())
            }
            ActorMsg::Download { actor, index } => self.on_download(&actor, index + 1),
            ActorMsg::Sync { actor, .. } => self.on_download(&actor, 1),
            ActorMsg::DocumentMessage { peer, message, .. } => {
                self.events.push(RepoEvent::DocumentMessage {
                    doc_id: message.id,
                    peer,
                    contents: message.contents,
                });
                Ok(())
            }
        };
        if let Err(e) = result {
            warn!("Actor notification failed: {}", e);
        }
    }

    /// Change `seq` of `actor` arrived: sync every open document following
    /// the actor that far.
    fn on_download(&self, actor: &ActorId, seq: Seq) -> Result<(), CoreError> {
        let open = self.open_doc_ids();
        for doc_id in self.cursors.docs_with_actor(&self.id, actor, seq)? {
            if open.contains(&doc_id) {
                self.sync_doc(&doc_id)?;
            }
        }
        Ok(())
    }

    fn on_repo_msg(&self, sender: &Arc<NetworkPeer>, msg: RepoMsg) {
        match msg {
            RepoMsg::CursorMessage(msg) => {
                if let Err(e) = self.on_cursor_message(sender, msg) {
                    warn!("Cursor message from {} failed: {}", sender.id().short(), e);
                }
            }
            RepoMsg::DocumentMessage(message) => {
                self.events.push(RepoEvent::DocumentMessage {
                    doc_id: message.id,
                    peer: sender.id(),
                    contents: message.contents,
                });
            }
        }
    }

    /// Drop actors whose ids are not valid feed keys
    fn valid_actors(&self, clock: &Clock, from: &PeerId) -> Clock {
        clock
            .iter()
            .filter(|(actor, _)| {
                let valid = actor.verifying_key().is_ok();
                if !valid {
                    warn!("Peer {} sent invalid actor id {}", from.short(), actor.short());
                }
                valid
            })
            .map(|(actor, seq)| (*actor, *seq))
            .collect()
    }

    fn on_cursor_message(
        &self,
        sender: &Arc<NetworkPeer>,
        msg: CursorMessage,
    ) -> Result<(), CoreError> {
        let from = sender.id();
        let open = self.open_doc_ids();

        for DocCursor { doc_id, cursor } in msg.cursors {
            if !self.meta.is_doc(&doc_id) || self.meta.is_deleted(&doc_id) {
                debug!("Ignoring cursor for unknown document {}", doc_id.short());
                continue;
            }
            let cursor = self.valid_actors(&cursor, &from);
            let (_, update) = self.cursors.update(&self.id, &doc_id, &cursor)?;
            if update.is_none() {
                continue;
            }

            self.meta
                .add_actors(doc_id, cursor.actors().copied().collect())?;
            for actor in cursor.actors() {
                self.ensure_actor(*actor)?;
            }
            if open.contains(&doc_id) {
                self.sync_doc(&doc_id)?;
            }
            self.send_cursor_to_doc_peers(&doc_id);
        }

        for DocClock { doc_id, clock } in msg.clocks {
            if !self.meta.is_doc(&doc_id) || self.meta.is_deleted(&doc_id) {
                continue;
            }
            let clock = self.valid_actors(&clock, &from);
            let (_, update) = self.clocks.update(&from, &doc_id, &clock)?;
            self.emit_clock_update(update);

            let ready = self
                .docs
                .lock()
                .get_mut(&doc_id)
                .and_then(|doc| doc.update_min_clock(&clock));
            self.emit(ready);
        }
        Ok(())
    }
}

impl<E: MergeEngine> Drop for RepoInner<E> {
    fn drop(&mut self) {
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
    }
}
