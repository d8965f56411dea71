// Network: swarm membership and connection routing
//
// A swarm is anything that produces raw duplex streams to other nodes
// interested in the same topics. The network handshakes every stream, drops
// self-connections, and hands the rest to the matching NetworkPeer.

use super::connection::{ConnectionError, ConnectionId, PeerConnection};
use super::peer::{NetworkPeer, PeerError};
use crate::config::NetworkConfig;
use crate::keys::{DiscoveryId, FeedId, PeerId};
use crate::queue::Queue;
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Network error types
#[derive(Debug, Error)]
pub enum NetworkError {
    #[error("Network is closed")]
    Closed,

    #[error("Connected to ourselves")]
    SelfConnection,

    #[error("Connection error: {0}")]
    Connection(#[from] ConnectionError),

    #[error("Peer error: {0}")]
    Peer(#[from] PeerError),

    #[error("Swarm error: {0}")]
    Swarm(String),
}

/// Any bidirectional byte stream a swarm can hand over
pub trait DuplexStream: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin + 'static> DuplexStream for T {}

/// A raw connection produced by a swarm
pub struct SwarmConnection {
    pub stream: Box<dyn DuplexStream>,
    /// True on the side that dialed
    pub initiator: bool,
}

impl fmt::Debug for SwarmConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SwarmConnection")
            .field("initiator", &self.initiator)
            .finish_non_exhaustive()
    }
}

/// Topic-based peer discovery. New connections are delivered on the channel
/// handed to [`Network::attach_swarm`] together with the swarm.
#[async_trait]
pub trait Swarm: Send + Sync {
    async fn join(&self, topic: DiscoveryId) -> anyhow::Result<()>;
    async fn leave(&self, topic: DiscoveryId) -> anyhow::Result<()>;
    async fn destroy(&self) -> anyhow::Result<()>;
}

pub struct Network {
    self_id: PeerId,
    config: NetworkConfig,
    peers: RwLock<HashMap<PeerId, Arc<NetworkPeer>>>,
    /// Topics we want to be in, announced to every attached swarm
    topics: RwLock<HashMap<DiscoveryId, FeedId>>,
    swarm: RwLock<Option<Arc<dyn Swarm>>>,
    peer_q: Queue<Arc<NetworkPeer>>,
    next_connection: AtomicU64,
    closed: AtomicBool,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Network {
    pub fn new(self_id: PeerId, config: NetworkConfig) -> Arc<Self> {
        Arc::new(Self {
            self_id,
            config,
            peers: RwLock::new(HashMap::new()),
            topics: RwLock::new(HashMap::new()),
            swarm: RwLock::new(None),
            peer_q: Queue::new("network-peers"),
            next_connection: AtomicU64::new(1),
            closed: AtomicBool::new(false),
            tasks: Mutex::new(Vec::new()),
        })
    }

    pub fn self_id(&self) -> PeerId {
        self.self_id
    }

    pub fn config(&self) -> &NetworkConfig {
        &self.config
    }

    /// Receives a peer every time one of its connections is confirmed
    pub fn peer_q(&self) -> Queue<Arc<NetworkPeer>> {
        self.peer_q.clone()
    }

    fn current_swarm(&self) -> Option<Arc<dyn Swarm>> {
        self.swarm.read().clone()
    }

    /// Join the topic of `feed_id` on the attached swarm (now or later).
    pub async fn join(&self, feed_id: &FeedId) -> Result<(), NetworkError> {
        let topic = feed_id.discovery_id();
        let fresh = self.topics.write().insert(topic, *feed_id).is_none();
        if !fresh {
            return Ok(());
        }
        debug!("Joining topic {} for feed {}", topic.short(), feed_id.short());
        if let Some(swarm) = self.current_swarm() {
            swarm
                .join(topic)
                .await
                .map_err(|e| NetworkError::Swarm(e.to_string()))?;
        }
        Ok(())
    }

    pub async fn leave(&self, feed_id: &FeedId) -> Result<(), NetworkError> {
        let topic = feed_id.discovery_id();
        if self.topics.write().remove(&topic).is_none() {
            return Ok(());
        }
        if let Some(swarm) = self.current_swarm() {
            swarm
                .leave(topic)
                .await
                .map_err(|e| NetworkError::Swarm(e.to_string()))?;
        }
        Ok(())
    }

    pub fn is_joined(&self, feed_id: &FeedId) -> bool {
        self.topics.read().contains_key(&feed_id.discovery_id())
    }

    /// Attach a swarm: join every known topic on it and start accepting the
    /// connections it produces.
    pub async fn attach_swarm(
        self: &Arc<Self>,
        swarm: Arc<dyn Swarm>,
        mut incoming: mpsc::UnboundedReceiver<SwarmConnection>,
    ) -> Result<(), NetworkError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(NetworkError::Closed);
        }
        *self.swarm.write() = Some(swarm.clone());

        let network = self.clone();
        let accept = tokio::spawn(async move {
            while let Some(conn) = incoming.recv().await {
                let network = network.clone();
                tokio::spawn(async move {
                    if let Err(e) = network.on_connection(conn).await {
                        debug!("Dropped incoming connection: {}", e);
                    }
                });
            }
        });
        self.tasks.lock().push(accept);

        let topics: Vec<DiscoveryId> = self.topics.read().keys().copied().collect();
        for topic in topics {
            swarm
                .join(topic)
                .await
                .map_err(|e| NetworkError::Swarm(e.to_string()))?;
        }
        info!("Swarm attached");
        Ok(())
    }

    /// Handshake a raw connection and route it to its peer.
    pub async fn on_connection(
        self: &Arc<Self>,
        raw: SwarmConnection,
    ) -> Result<Arc<NetworkPeer>, NetworkError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(NetworkError::Closed);
        }
        let id = ConnectionId(self.next_connection.fetch_add(1, Ordering::SeqCst));
        let conn = PeerConnection::new(id, raw.stream, raw.initiator, self.config.clone())?;

        let remote = match conn.handshake(self.self_id).await {
            Ok(remote) => remote,
            Err(e) => {
                conn.destroy();
                return Err(e.into());
            }
        };
        if remote == self.self_id {
            warn!("Connection {} loops back to ourselves, dropping it", id);
            conn.destroy();
            return Err(NetworkError::SelfConnection);
        }

        let peer = self.get_or_create_peer(remote);
        peer.add_connection(conn)?;
        Ok(peer)
    }

    pub fn get_or_create_peer(&self, id: PeerId) -> Arc<NetworkPeer> {
        if let Some(peer) = self.peers.read().get(&id) {
            return peer.clone();
        }
        self.peers
            .write()
            .entry(id)
            .or_insert_with(|| NetworkPeer::new(self.self_id, id, self.peer_q.clone()))
            .clone()
    }

    pub fn peer(&self, id: &PeerId) -> Option<Arc<NetworkPeer>> {
        self.peers.read().get(id).cloned()
    }

    pub fn peers(&self) -> Vec<Arc<NetworkPeer>> {
        self.peers.read().values().cloned().collect()
    }

    /// Peers with a confirmed, open connection
    pub fn connected_peers(&self) -> Vec<Arc<NetworkPeer>> {
        self.peers()
            .into_iter()
            .filter(|p| p.is_connected())
            .collect()
    }

    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let swarm = self.swarm.write().take();
        if let Some(swarm) = swarm {
            if let Err(e) = swarm.destroy().await {
                warn!("Swarm shutdown failed: {}", e);
            }
        }
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        for peer in self.peers() {
            peer.close();
        }
        info!("Network closed");
    }
}
