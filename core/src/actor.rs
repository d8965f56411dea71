// Actor: a document participant backed by exactly one feed
//
// Change `seq` of an actor is block `seq - 1` of its feed. The actor turns
// feed events into ActorMsg notifications for the repo, and guards writes
// so the feed never gets a gap or a duplicate.

use crate::clock::Seq;
use crate::feed::{Feed, FeedError, FeedEvent};
use crate::keys::{ActorId, PeerId};
use crate::messages::DocumentMessage;
use crate::queue::{Queue, QueueError};
use parking_lot::{Mutex, RwLock};
use std::collections::HashSet;
use std::sync::Arc;
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, error};

#[derive(Debug, Error)]
pub enum ActorError {
    #[error("Actor {actor}: expected change {expected}, got {got}")]
    SequenceViolation {
        actor: ActorId,
        expected: Seq,
        got: Seq,
    },

    #[error("Feed error: {0}")]
    Feed(#[from] FeedError),

    #[error("Feed events already taken: {0}")]
    Queue(#[from] QueueError),
}

/// Notifications from actors to the repo
#[derive(Debug, Clone, PartialEq)]
pub enum ActorMsg {
    Ready {
        actor: ActorId,
        writable: bool,
    },
    PeerAdd {
        actor: ActorId,
        peer: PeerId,
    },
    PeerRemove {
        actor: ActorId,
        peer: PeerId,
    },
    /// Block `index` arrived from a peer
    Download {
        actor: ActorId,
        index: u64,
    },
    Sync {
        actor: ActorId,
        length: u64,
    },
    DocumentMessage {
        actor: ActorId,
        peer: PeerId,
        message: DocumentMessage,
    },
}

pub struct Actor {
    id: ActorId,
    feed: Arc<Feed>,
    peers: Arc<RwLock<HashSet<PeerId>>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Actor {
    /// Take over `feed`'s events and start forwarding them to `notify`.
    pub fn new(feed: Arc<Feed>, notify: Queue<ActorMsg>) -> Result<Arc<Self>, ActorError> {
        let id = feed.id();
        let mut events = feed.events()?;
        let peers = Arc::new(RwLock::new(HashSet::new()));

        notify.push(ActorMsg::Ready {
            actor: id,
            writable: feed.is_writable(),
        });

        let known = peers.clone();
        let task = tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                let msg = match event {
                    FeedEvent::Append { .. } => continue,
                    FeedEvent::Download { index } => ActorMsg::Download { actor: id, index },
                    FeedEvent::Sync { length } => ActorMsg::Sync { actor: id, length },
                    FeedEvent::PeerAdd(peer) => {
                        known.write().insert(peer);
                        ActorMsg::PeerAdd { actor: id, peer }
                    }
                    FeedEvent::PeerRemove(peer) => {
                        known.write().remove(&peer);
                        ActorMsg::PeerRemove { actor: id, peer }
                    }
                    FeedEvent::Message { peer, message } => ActorMsg::DocumentMessage {
                        actor: id,
                        peer,
                        message,
                    },
                };
                notify.push(msg);
            }
        });
        debug!("Actor {} ready (writable: {})", id.short(), feed.is_writable());

        Ok(Arc::new(Self {
            id,
            feed,
            peers,
            task: Mutex::new(Some(task)),
        }))
    }

    pub fn id(&self) -> ActorId {
        self.id
    }

    pub fn feed(&self) -> &Arc<Feed> {
        &self.feed
    }

    pub fn is_writable(&self) -> bool {
        self.feed.is_writable()
    }

    /// Number of changes stored locally
    pub fn len(&self) -> Seq {
        self.feed.len()
    }

    pub fn is_empty(&self) -> bool {
        self.feed.is_empty()
    }

    /// Peers currently replicating this actor's feed
    pub fn peers(&self) -> Vec<PeerId> {
        self.peers.read().iter().copied().collect()
    }

    /// Append change `seq`. Only the next sequence number is accepted.
    pub fn write_change(&self, seq: Seq, data: &[u8]) -> Result<Seq, ActorError> {
        let violation = |expected: Seq| {
            error!(
                "Actor {}: refusing change {} (next is {})",
                self.id.short(),
                seq,
                expected
            );
            ActorError::SequenceViolation {
                actor: self.id,
                expected,
                got: seq,
            }
        };

        if seq == 0 {
            return Err(violation(self.feed.len() + 1));
        }
        match self.feed.append_at(seq - 1, data) {
            Ok(_) => Ok(seq),
            Err(FeedError::IndexMismatch { expected, .. }) => Err(violation(expected + 1)),
            Err(e) => Err(e.into()),
        }
    }

    pub fn read_change(&self, seq: Seq) -> Result<Option<Vec<u8>>, ActorError> {
        if seq == 0 {
            return Ok(None);
        }
        Ok(self.feed.get(seq - 1)?)
    }

    /// Send a document message to everyone replicating this actor
    pub fn message(&self, message: &DocumentMessage) -> usize {
        self.feed.message(message)
    }

    pub fn close(&self) {
        if let Some(task) = self.task.lock().take() {
            task.abort();
        }
    }
}

impl Drop for Actor {
    fn drop(&mut self) {
        self.close();
    }
}
