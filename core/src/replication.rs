// Replication manager: discovery id gossip and per-connection feed replication
//
// For every confirmed peer connection there is one FeedProtocol session and
// one "ReplicationManager" message channel. Peers tell each other which
// discovery ids they are willing to share; each side replicates the ids it
// also knows and answers with the ones it newly started, so the other side
// starts too. An answer that would be empty is not sent, which ends the
// exchange.

use crate::feed::{FeedError, FeedProtocol, FeedStore};
use crate::keys::{DiscoveryId, FeedId, PeerId};
use crate::messages::ReplicationMsg;
use crate::net::{ConnectionError, ConnectionId, MessageRouter, NetworkPeer, Routed};
use crate::queue::{Queue, QueueError};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

pub const REPLICATION_CHANNEL: &str = "ReplicationManager";

#[derive(Debug, Error)]
pub enum ReplicationError {
    #[error("Peer {0} has no confirmed connection")]
    NotConnected(PeerId),

    #[error("Connection error: {0}")]
    Connection(#[from] ConnectionError),

    #[error("Feed error: {0}")]
    Feed(#[from] FeedError),

    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),
}

/// A feed that started replicating with a peer
#[derive(Debug, Clone)]
pub struct Discovery {
    pub feed_id: FeedId,
    pub discovery_id: DiscoveryId,
    pub peer: Arc<NetworkPeer>,
}

struct Session {
    peer: Arc<NetworkPeer>,
    protocol: Arc<FeedProtocol>,
    watcher: JoinHandle<()>,
}

pub struct ReplicationManager {
    feeds: Arc<FeedStore>,
    router: Arc<MessageRouter<ReplicationMsg>>,
    sessions: Mutex<HashMap<ConnectionId, Session>>,
    discovery_q: Queue<Discovery>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl ReplicationManager {
    pub fn new(feeds: Arc<FeedStore>) -> Result<Arc<Self>, ReplicationError> {
        let router = MessageRouter::new(REPLICATION_CHANNEL);
        let mut inbox = router.inbox().subscribe()?;

        let manager = Arc::new(Self {
            feeds,
            router,
            sessions: Mutex::new(HashMap::new()),
            discovery_q: Queue::new("discovery"),
            tasks: Mutex::new(Vec::new()),
        });

        let weak: Weak<Self> = Arc::downgrade(&manager);
        let task = tokio::spawn(async move {
            while let Some(Routed { sender, msg }) = inbox.recv().await {
                let Some(manager) = weak.upgrade() else {
                    break;
                };
                manager.on_message(&sender, msg);
            }
        });
        manager.tasks.lock().push(task);
        Ok(manager)
    }

    /// Receives an entry every time a feed starts replicating with a peer
    pub fn discovery_q(&self) -> Queue<Discovery> {
        self.discovery_q.clone()
    }

    /// Number of connections with a running replication session
    pub fn session_count(&self) -> usize {
        self.sessions.lock().len()
    }

    /// Set up replication for a newly confirmed peer. Idempotent per
    /// connection.
    pub fn on_peer(self: &Arc<Self>, peer: &Arc<NetworkPeer>) -> Result<(), ReplicationError> {
        let fresh = self.session(peer)?.1;
        if fresh && peer.we_have_authority() {
            let ids = self.feeds.discovery_ids();
            debug!("Offering {} feed(s) to {}", ids.len(), peer.id().short());
            self.send_ids(peer, ids);
        }
        Ok(())
    }

    /// Announce feeds we just created or opened to every connected peer.
    pub fn add_feed_ids(&self, ids: &[FeedId]) {
        if ids.is_empty() {
            return;
        }
        let discovery_ids: Vec<DiscoveryId> = ids.iter().map(|id| id.discovery_id()).collect();
        let peers: Vec<Arc<NetworkPeer>> = self
            .sessions
            .lock()
            .values()
            .map(|s| s.peer.clone())
            .collect();
        for peer in peers {
            self.send_ids(&peer, discovery_ids.clone());
        }
    }

    fn send_ids(&self, peer: &Arc<NetworkPeer>, ids: Vec<DiscoveryId>) {
        if ids.is_empty() {
            return;
        }
        let msg = ReplicationMsg::DiscoveryIds { discovery_ids: ids };
        if let Err(e) = self.router.send_to_peer(peer, &msg) {
            debug!("Could not gossip to {}: {}", peer.id().short(), e);
        }
    }

    /// The replication session on `peer`'s confirmed connection, created on
    /// first use. The flag is true when the session was just created.
    fn session(
        self: &Arc<Self>,
        peer: &Arc<NetworkPeer>,
    ) -> Result<(Arc<FeedProtocol>, bool), ReplicationError> {
        let conn = peer
            .connection()
            .ok_or_else(|| ReplicationError::NotConnected(peer.id()))?;
        let conn_id = conn.id();

        let mut sessions = self.sessions.lock();
        if let Some(session) = sessions.get(&conn_id) {
            return Ok((session.protocol.clone(), false));
        }

        self.router.listen(peer)?;
        let protocol = Arc::new(FeedProtocol::start(&conn, peer.id())?);

        let weak: Weak<Self> = Arc::downgrade(self);
        let watched = conn.clone();
        let watcher = tokio::spawn(async move {
            watched.closed().await;
            if let Some(manager) = weak.upgrade() {
                manager.drop_session(watched.id());
            }
        });

        sessions.insert(
            conn_id,
            Session {
                peer: peer.clone(),
                protocol: protocol.clone(),
                watcher,
            },
        );
        info!("Replication session with {} on {}", peer.id().short(), conn_id);
        Ok((protocol, true))
    }

    fn drop_session(&self, conn_id: ConnectionId) {
        let Some(session) = self.sessions.lock().remove(&conn_id) else {
            return;
        };
        session.protocol.close();
        debug!(
            "Replication session with {} on {} ended",
            session.peer.id().short(),
            conn_id
        );
    }

    fn on_message(self: &Arc<Self>, sender: &Arc<NetworkPeer>, msg: ReplicationMsg) {
        match msg {
            ReplicationMsg::DiscoveryIds { discovery_ids } => {
                self.on_discovery_ids(sender, discovery_ids)
            }
        }
    }

    fn on_discovery_ids(self: &Arc<Self>, peer: &Arc<NetworkPeer>, ids: Vec<DiscoveryId>) {
        let protocol = match self.session(peer) {
            Ok((protocol, _)) => protocol,
            Err(e) => {
                debug!("Ignoring discovery ids from {}: {}", peer.id().short(), e);
                return;
            }
        };

        let mut shared = Vec::new();
        for discovery_id in ids {
            let Some(feed_id) = self.feeds.feed_id_for(&discovery_id) else {
                debug!("Unknown discovery id {} from {}", discovery_id.short(), peer.id().short());
                continue;
            };
            if protocol.is_replicating(&discovery_id) {
                continue;
            }
            let started = self
                .feeds
                .open_feed(&feed_id)
                .and_then(|feed| protocol.replicate(feed));
            match started {
                Ok(true) => {
                    shared.push(discovery_id);
                    self.discovery_q.push(Discovery {
                        feed_id,
                        discovery_id,
                        peer: peer.clone(),
                    });
                }
                Ok(false) => {}
                Err(e) => warn!(
                    "Could not replicate feed {} with {}: {}",
                    feed_id.short(),
                    peer.id().short(),
                    e
                ),
            }
        }

        if !shared.is_empty() {
            debug!("Sharing {} feed(s) with {}", shared.len(), peer.id().short());
        }
        self.send_ids(peer, shared);
    }

    pub fn close(&self) {
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        for (_, session) in self.sessions.lock().drain() {
            session.watcher.abort();
            session.protocol.close();
        }
        self.router.close();
    }
}

impl Drop for ReplicationManager {
    fn drop(&mut self) {
        self.close();
    }
}
