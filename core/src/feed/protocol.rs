// Feed replication protocol
//
// Runs over the "FeedProtocol" channel of one peer connection and replicates
// any number of feeds, each addressed by its discovery id. Per feed:
//
//   Open            both sides announce they replicate the feed
//   Have(length)    sent on open, on Open from the remote, on every growth
//   Want(start)     reply to a Have beyond our length
//   Data(i, block)  reply to a Want, one per block
//
// A feed goes live for this peer (PeerAdd) once both sides have sent Open.
// Document messages ride on named extensions; the remote's Handshake lists
// the names it understands and the first of ours it supports is used.

use super::handle::{Feed, FeedEvent, FeedPeer, SignedBlock};
use super::FeedError;
use crate::keys::{DiscoveryId, FeedId, PeerId};
use crate::messages::{DocumentMessage, RepoMsg};
use crate::net::{ChannelSender, ConnectionError, ConnectionId, PeerConnection};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Weak};
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

pub const PROTOCOL_CHANNEL: &str = "FeedProtocol";

/// Extension names in order of preference. `meshmerge.3` carries a full
/// DocumentMessage; `meshmerge.2` carries only the contents and addresses the
/// document by the feed it was sent on.
pub const EXTENSIONS: [&str; 2] = ["meshmerge.3", "meshmerge.2"];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProtocolMsg {
    Handshake {
        extensions: Vec<String>,
    },
    Open {
        feed: DiscoveryId,
    },
    Have {
        feed: DiscoveryId,
        length: u64,
    },
    Want {
        feed: DiscoveryId,
        start: u64,
    },
    Data {
        feed: DiscoveryId,
        index: u64,
        block: SignedBlock,
    },
    Extension {
        feed: DiscoveryId,
        name: String,
        payload: Vec<u8>,
    },
}

struct Replica {
    feed: Arc<Feed>,
    remote_length: u64,
    requested: u64,
    synced_at: u64,
    live: bool,
}

impl Replica {
    /// Where to start a Want for a remote announcing `length`, if anything is
    /// missing and not already asked for.
    fn want_from(&mut self, length: u64) -> Option<u64> {
        self.remote_length = self.remote_length.max(length);
        let local = self.feed.len();
        if local < length && self.requested < length {
            let start = local.max(self.requested);
            self.requested = length;
            Some(start)
        } else {
            None
        }
    }

    /// Forget outstanding requests so the next Have asks again.
    fn reset_requests(&mut self) {
        self.requested = self.feed.len();
    }
}

#[derive(Default)]
struct ProtocolState {
    replicas: HashMap<DiscoveryId, Replica>,
    remote_opened: HashSet<DiscoveryId>,
    remote_extensions: Option<Vec<String>>,
    closed: bool,
}

struct ProtocolInner {
    peer: PeerId,
    connection: ConnectionId,
    sender: ChannelSender,
    state: Mutex<ProtocolState>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

fn encode_extension(name: &str, message: &DocumentMessage) -> Result<Vec<u8>, FeedError> {
    let encoded = if name == EXTENSIONS[0] {
        serde_json::to_vec(&RepoMsg::DocumentMessage(message.clone()))
    } else {
        serde_json::to_vec(&message.contents)
    };
    encoded.map_err(|e| FeedError::Serialization(e.to_string()))
}

fn decode_extension(name: &str, payload: &[u8], feed: &FeedId) -> Option<DocumentMessage> {
    if name == EXTENSIONS[0] {
        match serde_json::from_slice::<RepoMsg>(payload) {
            Ok(RepoMsg::DocumentMessage(message)) => Some(message),
            _ => None,
        }
    } else if name == EXTENSIONS[1] {
        serde_json::from_slice(payload)
            .ok()
            .map(|contents| DocumentMessage {
                id: (*feed).into(),
                contents,
            })
    } else {
        None
    }
}

impl ProtocolInner {
    fn send(&self, msg: &ProtocolMsg) -> Result<(), FeedError> {
        let bytes = bincode::serialize(msg)?;
        self.sender.write(bytes).map_err(ConnectionError::from)?;
        Ok(())
    }

    fn replica_feed(&self, feed: &DiscoveryId) -> Option<Arc<Feed>> {
        self.state.lock().replicas.get(feed).map(|r| r.feed.clone())
    }

    fn handle(self: &Arc<Self>, msg: ProtocolMsg) {
        let result = match msg {
            ProtocolMsg::Handshake { extensions } => {
                debug!("Peer {} speaks extensions {:?}", self.peer.short(), extensions);
                self.state.lock().remote_extensions = Some(extensions);
                Ok(())
            }
            ProtocolMsg::Open { feed } => self.on_open(feed),
            ProtocolMsg::Have { feed, length } => self.on_have(feed, length),
            ProtocolMsg::Want { feed, start } => self.on_want(feed, start),
            ProtocolMsg::Data { feed, index, block } => {
                self.on_data(feed, index, block);
                Ok(())
            }
            ProtocolMsg::Extension {
                feed,
                name,
                payload,
            } => {
                self.on_extension(feed, &name, &payload);
                Ok(())
            }
        };
        if let Err(e) = result {
            debug!("Peer {}: protocol reply failed: {}", self.peer.short(), e);
        }
    }

    fn on_open(self: &Arc<Self>, feed: DiscoveryId) -> Result<(), FeedError> {
        let length = {
            let mut state = self.state.lock();
            state.remote_opened.insert(feed);
            state.replicas.get(&feed).map(|r| r.feed.len())
        };
        // The remote may have missed our Have while it was not replicating yet
        if let Some(length) = length {
            self.send(&ProtocolMsg::Have { feed, length })?;
            self.make_live(&feed);
        }
        Ok(())
    }

    fn on_have(&self, feed: DiscoveryId, length: u64) -> Result<(), FeedError> {
        let want = {
            let mut state = self.state.lock();
            let Some(replica) = state.replicas.get_mut(&feed) else {
                trace!("Have for a feed we do not replicate");
                return Ok(());
            };
            replica.want_from(length)
        };
        match want {
            Some(start) => self.send(&ProtocolMsg::Want { feed, start }),
            None => {
                self.check_synced(&feed);
                Ok(())
            }
        }
    }

    fn on_want(&self, feed: DiscoveryId, start: u64) -> Result<(), FeedError> {
        let Some(local) = self.replica_feed(&feed) else {
            return Ok(());
        };
        for index in start..local.len() {
            let Some(block) = local.get_signed(index)? else {
                break;
            };
            self.send(&ProtocolMsg::Data { feed, index, block })?;
        }
        Ok(())
    }

    fn on_data(&self, feed: DiscoveryId, index: u64, block: SignedBlock) {
        let Some(local) = self.replica_feed(&feed) else {
            return;
        };
        match local.put(index, block) {
            Ok(0) => {}
            Ok(_) => self.check_synced(&feed),
            Err(e) => {
                warn!(
                    "Peer {} sent a bad block {} for feed {}: {}",
                    self.peer.short(),
                    index,
                    local.id().short(),
                    e
                );
                if let Some(replica) = self.state.lock().replicas.get_mut(&feed) {
                    replica.reset_requests();
                }
            }
        }
    }

    fn on_extension(&self, feed: DiscoveryId, name: &str, payload: &[u8]) {
        let Some(local) = self.replica_feed(&feed) else {
            return;
        };
        match decode_extension(name, payload, &local.id()) {
            Some(message) => local.notify(FeedEvent::Message {
                peer: self.peer,
                message,
            }),
            None => debug!("Ignoring extension '{}' from {}", name, self.peer.short()),
        }
    }

    fn check_synced(&self, feed: &DiscoveryId) {
        let synced = {
            let mut state = self.state.lock();
            let Some(replica) = state.replicas.get_mut(feed) else {
                return;
            };
            let length = replica.feed.len();
            if replica.remote_length > 0
                && length >= replica.remote_length
                && replica.synced_at < replica.remote_length
            {
                replica.synced_at = replica.remote_length;
                Some((replica.feed.clone(), length))
            } else {
                None
            }
        };
        if let Some((local, length)) = synced {
            local.notify(FeedEvent::Sync { length });
        }
    }

    fn make_live(self: &Arc<Self>, feed: &DiscoveryId) {
        let local = {
            let mut state = self.state.lock();
            let Some(replica) = state.replicas.get_mut(feed) else {
                return;
            };
            if replica.live {
                return;
            }
            replica.live = true;
            replica.feed.clone()
        };
        debug!("Feed {} live with peer {}", local.id().short(), self.peer.short());
        local.add_peer(self.clone());
    }

    fn shutdown(&self) {
        let live = {
            let mut state = self.state.lock();
            if state.closed {
                return;
            }
            state.closed = true;
            state
                .replicas
                .drain()
                .filter(|(_, r)| r.live)
                .map(|(_, r)| r.feed)
                .collect::<Vec<_>>()
        };
        for local in live {
            local.remove_peer(&self.peer, self.connection);
        }
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        debug!("Replication with {} on {} stopped", self.peer.short(), self.connection);
    }
}

impl FeedPeer for ProtocolInner {
    fn peer_id(&self) -> PeerId {
        self.peer
    }

    fn connection_id(&self) -> ConnectionId {
        self.connection
    }

    fn send_message(&self, feed: &FeedId, message: &DocumentMessage) -> Result<(), FeedError> {
        let name = {
            let state = self.state.lock();
            let remote = state
                .remote_extensions
                .as_ref()
                .ok_or(FeedError::ExtensionUnsupported)?;
            EXTENSIONS
                .iter()
                .find(|ours| remote.iter().any(|theirs| theirs == *ours))
                .copied()
                .ok_or(FeedError::ExtensionUnsupported)?
        };
        let payload = encode_extension(name, message)?;
        self.send(&ProtocolMsg::Extension {
            feed: feed.discovery_id(),
            name: name.to_string(),
            payload,
        })
    }
}

/// Replication session with one peer over one connection
pub struct FeedProtocol {
    inner: Arc<ProtocolInner>,
}

impl FeedProtocol {
    /// Open the protocol channel on `conn` and send our handshake.
    pub fn start(conn: &PeerConnection, peer: PeerId) -> Result<Self, FeedError> {
        let (sender, mut receiver) = conn.open_channel(PROTOCOL_CHANNEL)?.split();
        let inner = Arc::new(ProtocolInner {
            peer,
            connection: conn.id(),
            sender,
            state: Mutex::new(ProtocolState::default()),
            tasks: Mutex::new(Vec::new()),
        });

        inner.send(&ProtocolMsg::Handshake {
            extensions: EXTENSIONS.iter().map(|e| e.to_string()).collect(),
        })?;

        let reader = inner.clone();
        let task = tokio::spawn(async move {
            while let Some(bytes) = receiver.recv().await {
                match bincode::deserialize::<ProtocolMsg>(&bytes) {
                    Ok(msg) => reader.handle(msg),
                    Err(e) => warn!("Peer {}: undecodable protocol message: {}", reader.peer.short(), e),
                }
            }
            reader.shutdown();
        });
        inner.tasks.lock().push(task);

        Ok(Self { inner })
    }

    pub fn peer_id(&self) -> PeerId {
        self.inner.peer
    }

    pub fn connection_id(&self) -> ConnectionId {
        self.inner.connection
    }

    pub fn is_closed(&self) -> bool {
        self.inner.state.lock().closed
    }

    pub fn is_replicating(&self, feed: &DiscoveryId) -> bool {
        self.inner.state.lock().replicas.contains_key(feed)
    }

    /// Start replicating `feed` with this peer. Returns false if it already was.
    pub fn replicate(&self, feed: Arc<Feed>) -> Result<bool, FeedError> {
        let id = feed.discovery_id();
        let remote_opened = {
            let mut state = self.inner.state.lock();
            if state.closed {
                return Err(FeedError::ProtocolClosed);
            }
            if state.replicas.contains_key(&id) {
                return Ok(false);
            }
            state.replicas.insert(
                id,
                Replica {
                    feed: feed.clone(),
                    remote_length: 0,
                    requested: 0,
                    synced_at: 0,
                    live: false,
                },
            );
            state.remote_opened.contains(&id)
        };

        self.inner.send(&ProtocolMsg::Open { feed: id })?;
        self.inner.send(&ProtocolMsg::Have {
            feed: id,
            length: feed.len(),
        })?;

        let mut length = feed.watch_length();
        let weak: Weak<ProtocolInner> = Arc::downgrade(&self.inner);
        let announcer = tokio::spawn(async move {
            while length.changed().await.is_ok() {
                let current = *length.borrow_and_update();
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                if inner.send(&ProtocolMsg::Have { feed: id, length: current }).is_err() {
                    break;
                }
            }
        });
        self.inner.tasks.lock().push(announcer);

        if remote_opened {
            self.inner.make_live(&id);
        }
        debug!(
            "Replicating feed {} with peer {}",
            feed.id().short(),
            self.inner.peer.short()
        );
        Ok(true)
    }

    /// Stop replicating everything on this connection.
    pub fn close(&self) {
        let _ = self.inner.sender.end();
        self.inner.shutdown();
    }
}
