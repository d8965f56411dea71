// Feed handle: one signed append-only log
//
// Block `i` is signed over blake3(feed id || i || data), so a block cannot be
// replayed at another index or in another feed. Blocks are stored contiguously
// from zero; blocks that arrive ahead of the local length wait in memory until
// the gap is filled.

use super::FeedError;
use crate::keys::{self, DiscoveryId, FeedId, KeyPair, PeerId};
use crate::messages::DocumentMessage;
use crate::net::ConnectionId;
use crate::queue::{Queue, QueueError, Subscription};
use ed25519_dalek::VerifyingKey;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, trace, warn};

/// A stored block and its signature
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedBlock {
    pub data: Vec<u8>,
    pub signature: Vec<u8>,
}

/// Feed lifecycle and replication events
#[derive(Debug, Clone, PartialEq)]
pub enum FeedEvent {
    /// A local append
    Append { index: u64 },
    /// A verified block from a peer was stored
    Download { index: u64 },
    /// Caught up with everything a peer announced
    Sync { length: u64 },
    PeerAdd(PeerId),
    PeerRemove(PeerId),
    /// A document message carried by a protocol extension
    Message {
        peer: PeerId,
        message: DocumentMessage,
    },
}

/// A live replication session for a feed
pub trait FeedPeer: Send + Sync {
    fn peer_id(&self) -> PeerId;
    fn connection_id(&self) -> ConnectionId;
    fn send_message(&self, feed: &FeedId, message: &DocumentMessage) -> Result<(), FeedError>;
}

pub(crate) fn block_key(feed: &FeedId, index: u64) -> Vec<u8> {
    let mut key = Vec::with_capacity(40);
    key.extend_from_slice(feed.as_bytes());
    key.extend_from_slice(&index.to_be_bytes());
    key
}

fn signing_digest(feed: &FeedId, index: u64, data: &[u8]) -> [u8; 32] {
    let mut hasher = blake3::Hasher::new();
    hasher.update(feed.as_bytes());
    hasher.update(&index.to_be_bytes());
    hasher.update(data);
    *hasher.finalize().as_bytes()
}

pub struct Feed {
    id: FeedId,
    discovery_id: DiscoveryId,
    key: VerifyingKey,
    signer: Option<KeyPair>,
    blocks: sled::Tree,
    length: watch::Sender<u64>,
    write_lock: Mutex<()>,
    pending: Mutex<BTreeMap<u64, SignedBlock>>,
    peers: RwLock<HashMap<PeerId, Arc<dyn FeedPeer>>>,
    events: Queue<FeedEvent>,
    observed: AtomicBool,
}

impl fmt::Debug for Feed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Feed")
            .field("id", &self.id)
            .field("length", &self.len())
            .field("writable", &self.is_writable())
            .finish()
    }
}

impl Feed {
    /// Open a feed over the shared blocks tree. Writable iff `signer` is given.
    pub fn open(
        id: FeedId,
        signer: Option<KeyPair>,
        blocks: sled::Tree,
    ) -> Result<Self, FeedError> {
        let key = id.verifying_key()?;
        if let Some(signer) = &signer {
            if signer.feed_id() != id {
                return Err(FeedError::KeyMismatch(id));
            }
        }

        let mut length = 0u64;
        while blocks.contains_key(block_key(&id, length))? {
            length += 1;
        }
        let (length, _) = watch::channel(length);

        Ok(Self {
            id,
            discovery_id: id.discovery_id(),
            key,
            signer,
            blocks,
            length,
            write_lock: Mutex::new(()),
            pending: Mutex::new(BTreeMap::new()),
            peers: RwLock::new(HashMap::new()),
            events: Queue::new("feed-events"),
            observed: AtomicBool::new(false),
        })
    }

    pub fn id(&self) -> FeedId {
        self.id
    }

    pub fn discovery_id(&self) -> DiscoveryId {
        self.discovery_id
    }

    pub fn is_writable(&self) -> bool {
        self.signer.is_some()
    }

    pub fn len(&self) -> u64 {
        *self.length.borrow()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Observe length changes
    pub fn watch_length(&self) -> watch::Receiver<u64> {
        self.length.subscribe()
    }

    /// Subscribe to this feed's events. Events are only recorded once
    /// someone has asked for them.
    pub fn events(&self) -> Result<Subscription<FeedEvent>, QueueError> {
        self.observed.store(true, Ordering::SeqCst);
        self.events.subscribe()
    }

    pub(crate) fn notify(&self, event: FeedEvent) {
        if self.observed.load(Ordering::SeqCst) {
            self.events.push(event);
        }
    }

    /// Append a block. Returns its index.
    pub fn append(&self, data: &[u8]) -> Result<u64, FeedError> {
        let _guard = self.write_lock.lock();
        let index = self.len();
        self.append_locked(index, data)
    }

    /// Append only if the feed currently has exactly `index` blocks.
    pub fn append_at(&self, index: u64, data: &[u8]) -> Result<u64, FeedError> {
        let _guard = self.write_lock.lock();
        let length = self.len();
        if length != index {
            return Err(FeedError::IndexMismatch {
                expected: length,
                got: index,
            });
        }
        self.append_locked(index, data)
    }

    fn append_locked(&self, index: u64, data: &[u8]) -> Result<u64, FeedError> {
        let signer = self.signer.as_ref().ok_or(FeedError::ReadOnly(self.id))?;
        let signature = signer.sign(&signing_digest(&self.id, index, data));
        let block = SignedBlock {
            data: data.to_vec(),
            signature: signature.to_vec(),
        };
        self.store(index, &block)?;
        self.length.send_replace(index + 1);
        trace!("Feed {}: appended block {}", self.id.short(), index);
        self.notify(FeedEvent::Append { index });
        Ok(index)
    }

    fn store(&self, index: u64, block: &SignedBlock) -> Result<(), FeedError> {
        let bytes = bincode::serialize(block)?;
        self.blocks.insert(block_key(&self.id, index), bytes)?;
        Ok(())
    }

    /// Check a block received from a peer.
    pub fn verify(&self, index: u64, block: &SignedBlock) -> bool {
        keys::verify(
            &self.key,
            &signing_digest(&self.id, index, &block.data),
            &block.signature,
        )
    }

    /// Store a verified remote block. Returns how many blocks became
    /// available (zero for duplicates and out-of-order blocks).
    pub fn put(&self, index: u64, block: SignedBlock) -> Result<u64, FeedError> {
        if !self.verify(index, &block) {
            warn!("Feed {}: rejecting block {} with bad signature", self.id.short(), index);
            return Err(FeedError::InvalidSignature(index));
        }

        let _guard = self.write_lock.lock();
        let length = self.len();
        if index < length {
            return Ok(0);
        }
        if index > length {
            self.pending.lock().insert(index, block);
            return Ok(0);
        }

        self.store(index, &block)?;
        let mut stored = vec![index];
        let mut next = index + 1;
        {
            let mut pending = self.pending.lock();
            while let Some(block) = pending.remove(&next) {
                self.store(next, &block)?;
                stored.push(next);
                next += 1;
            }
            pending.retain(|i, _| *i > next);
        }
        self.length.send_replace(next);
        debug!("Feed {}: downloaded {} block(s), length {}", self.id.short(), stored.len(), next);

        for index in &stored {
            self.notify(FeedEvent::Download { index: *index });
        }
        Ok(stored.len() as u64)
    }

    pub fn get(&self, index: u64) -> Result<Option<Vec<u8>>, FeedError> {
        Ok(self.get_signed(index)?.map(|block| block.data))
    }

    pub fn get_signed(&self, index: u64) -> Result<Option<SignedBlock>, FeedError> {
        match self.blocks.get(block_key(&self.id, index))? {
            Some(bytes) => Ok(Some(bincode::deserialize(&bytes)?)),
            None => Ok(None),
        }
    }

    pub fn has(&self, index: u64) -> bool {
        index < self.len()
    }

    /// Blocks `start..end`, clamped to the current length
    pub fn get_range(&self, start: u64, end: u64) -> Result<Vec<Vec<u8>>, FeedError> {
        let end = end.min(self.len());
        let mut out = Vec::new();
        for index in start..end {
            match self.get(index)? {
                Some(data) => out.push(data),
                None => return Err(FeedError::MissingBlock(index)),
            }
        }
        Ok(out)
    }

    /// Register a live replication session
    pub fn add_peer(&self, peer: Arc<dyn FeedPeer>) {
        let id = peer.peer_id();
        self.peers.write().insert(id, peer);
        self.notify(FeedEvent::PeerAdd(id));
    }

    /// Drop the session for `peer`, unless it has been replaced by a newer
    /// connection already.
    pub fn remove_peer(&self, peer: &PeerId, connection: ConnectionId) {
        let removed = {
            let mut peers = self.peers.write();
            match peers.get(peer) {
                Some(session) if session.connection_id() == connection => {
                    peers.remove(peer);
                    true
                }
                _ => false,
            }
        };
        if removed {
            self.notify(FeedEvent::PeerRemove(*peer));
        }
    }

    pub fn peers(&self) -> Vec<PeerId> {
        self.peers.read().keys().copied().collect()
    }

    /// Broadcast a document message to every live peer. Returns how many
    /// peers it went out to.
    pub fn message(&self, message: &DocumentMessage) -> usize {
        let peers: Vec<Arc<dyn FeedPeer>> = self.peers.read().values().cloned().collect();
        let mut sent = 0;
        for peer in peers {
            match peer.send_message(&self.id, message) {
                Ok(()) => sent += 1,
                Err(e) => debug!(
                    "Feed {}: message to {} failed: {}",
                    self.id.short(),
                    peer.peer_id().short(),
                    e
                ),
            }
        }
        sent
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Storage;

    fn open_pair() -> (Feed, Feed) {
        let keys = KeyPair::generate();
        let id = keys.feed_id();
        let writer = Feed::open(id, Some(keys), Storage::temporary().unwrap().tree("blocks").unwrap())
            .unwrap();
        let reader = Feed::open(id, None, Storage::temporary().unwrap().tree("blocks").unwrap())
            .unwrap();
        (writer, reader)
    }

    #[test]
    fn test_append_and_get() {
        let (writer, _) = open_pair();
        assert_eq!(writer.append(b"a").unwrap(), 0);
        assert_eq!(writer.append(b"b").unwrap(), 1);
        assert_eq!(writer.len(), 2);
        assert_eq!(writer.get(1).unwrap(), Some(b"b".to_vec()));
        assert_eq!(writer.get(2).unwrap(), None);
        assert_eq!(writer.get_range(0, 10).unwrap().len(), 2);
    }

    #[test]
    fn test_reader_cannot_append() {
        let (_, reader) = open_pair();
        assert!(matches!(reader.append(b"x"), Err(FeedError::ReadOnly(_))));
    }

    #[test]
    fn test_append_at_checks_length() {
        let (writer, _) = open_pair();
        writer.append(b"a").unwrap();
        assert!(matches!(
            writer.append_at(0, b"b"),
            Err(FeedError::IndexMismatch { expected: 1, got: 0 })
        ));
        assert_eq!(writer.append_at(1, b"b").unwrap(), 1);
    }

    #[test]
    fn test_put_out_of_order_fills_gap() {
        let (writer, reader) = open_pair();
        for data in [b"0", b"1", b"2"] {
            writer.append(data).unwrap();
        }
        let block = |i| writer.get_signed(i).unwrap().unwrap();

        assert_eq!(reader.put(2, block(2)).unwrap(), 0);
        assert_eq!(reader.put(1, block(1)).unwrap(), 0);
        assert_eq!(reader.len(), 0);
        assert_eq!(reader.put(0, block(0)).unwrap(), 3);
        assert_eq!(reader.len(), 3);
        assert_eq!(reader.put(0, block(0)).unwrap(), 0);
    }

    #[test]
    fn test_put_rejects_bad_signature() {
        let (writer, reader) = open_pair();
        writer.append(b"real").unwrap();
        let mut block = writer.get_signed(0).unwrap().unwrap();
        block.data = b"fake".to_vec();
        assert!(matches!(reader.put(0, block), Err(FeedError::InvalidSignature(0))));

        // Valid block replayed at another index
        let block = writer.get_signed(0).unwrap().unwrap();
        assert!(!reader.verify(1, &block));
    }

    #[test]
    fn test_length_survives_reopen() {
        let keys = KeyPair::generate();
        let id = keys.feed_id();
        let tree = Storage::temporary().unwrap().tree("blocks").unwrap();
        {
            let feed = Feed::open(id, Some(keys.clone()), tree.clone()).unwrap();
            feed.append(b"x").unwrap();
            feed.append(b"y").unwrap();
        }
        let feed = Feed::open(id, Some(keys), tree).unwrap();
        assert_eq!(feed.len(), 2);
    }

    #[test]
    fn test_wrong_signer_rejected() {
        let id = KeyPair::generate().feed_id();
        let tree = Storage::temporary().unwrap().tree("blocks").unwrap();
        assert!(matches!(
            Feed::open(id, Some(KeyPair::generate()), tree),
            Err(FeedError::KeyMismatch(_))
        ));
    }

    #[tokio::test]
    async fn test_events_only_after_observed() {
        let (writer, _) = open_pair();
        writer.append(b"unseen").unwrap();
        let mut events = writer.events().unwrap();
        writer.append(b"seen").unwrap();
        assert_eq!(events.recv().await, Some(FeedEvent::Append { index: 1 }));
        assert!(events.try_recv().is_none());
    }
}
