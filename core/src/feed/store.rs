// Feed store: every feed this repo knows, writable or not
//
// Feed records (and secret keys for the feeds we own) live in the "feeds"
// tree; blocks for all feeds share the "blocks" tree, keyed by feed id and
// big-endian index. Open handles are cached so every caller sees the same
// Feed, and the discovery id index lets the replication layer resolve ids
// announced by peers.

use super::handle::{block_key, Feed};
use super::FeedError;
use crate::keys::{DiscoveryId, FeedId, KeyPair};
use crate::store::backend::{Storage, TREE_BLOCKS, TREE_FEEDS};
use futures::Stream;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info};
use zeroize::Zeroizing;

#[derive(Serialize, Deserialize)]
struct FeedRecord {
    secret: Option<Vec<u8>>,
}

/// Summary of one feed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeedInfo {
    pub id: FeedId,
    pub discovery_id: DiscoveryId,
    pub length: u64,
    pub writable: bool,
}

pub struct FeedStore {
    records: sled::Tree,
    blocks: sled::Tree,
    feeds: RwLock<HashMap<FeedId, Arc<Feed>>>,
    discovery: RwLock<HashMap<DiscoveryId, FeedId>>,
}

impl FeedStore {
    pub fn open(storage: &Storage) -> Result<Self, FeedError> {
        let records = storage.tree(TREE_FEEDS).map_err(store_err)?;
        let blocks = storage.tree(TREE_BLOCKS).map_err(store_err)?;

        let mut discovery = HashMap::new();
        for key in records.iter().keys() {
            let id = FeedId::from_slice(&key?)?;
            discovery.insert(id.discovery_id(), id);
        }
        debug!("Feed store opened with {} known feeds", discovery.len());

        Ok(Self {
            records,
            blocks,
            feeds: RwLock::new(HashMap::new()),
            discovery: RwLock::new(discovery),
        })
    }

    /// Register a writable feed for `keys`. Idempotent.
    pub fn create(&self, keys: &KeyPair) -> Result<FeedId, FeedError> {
        let id = keys.feed_id();
        let secret = keys.secret_bytes();
        let record = FeedRecord {
            secret: Some(secret.to_vec()),
        };
        let bytes = Zeroizing::new(bincode::serialize(&record)?);
        self.records.insert(id.as_bytes(), bytes.as_slice())?;
        self.records.flush()?;
        self.discovery.write().insert(id.discovery_id(), id);

        // A cached read-only handle would keep refusing appends
        let stale = self
            .feeds
            .read()
            .get(&id)
            .map(|feed| !feed.is_writable())
            .unwrap_or(false);
        if stale {
            self.feeds.write().remove(&id);
        }
        info!("Created feed {}", id.short());
        Ok(id)
    }

    /// Generate a key pair and create its feed
    pub fn create_new(&self) -> Result<(FeedId, KeyPair), FeedError> {
        let keys = KeyPair::generate();
        let id = self.create(&keys)?;
        Ok((id, keys))
    }

    /// Open a feed, registering it read-only if it is new to this store.
    pub fn open_feed(&self, id: &FeedId) -> Result<Arc<Feed>, FeedError> {
        if let Some(feed) = self.feeds.read().get(id) {
            return Ok(feed.clone());
        }
        id.verifying_key()?;

        let signer = match self.records.get(id.as_bytes())? {
            Some(bytes) => {
                let record: FeedRecord = bincode::deserialize(&bytes)?;
                match record.secret {
                    Some(secret) => Some(KeyPair::from_secret_bytes(&Zeroizing::new(secret))?),
                    None => None,
                }
            }
            None => {
                let record = bincode::serialize(&FeedRecord { secret: None })?;
                self.records.insert(id.as_bytes(), record)?;
                self.discovery.write().insert(id.discovery_id(), *id);
                debug!("Registered remote feed {}", id.short());
                None
            }
        };

        let mut feeds = self.feeds.write();
        if let Some(feed) = feeds.get(id) {
            return Ok(feed.clone());
        }
        let feed = Arc::new(Feed::open(*id, signer, self.blocks.clone())?);
        feeds.insert(*id, feed.clone());
        Ok(feed)
    }

    /// An already opened feed handle
    pub fn get(&self, id: &FeedId) -> Option<Arc<Feed>> {
        self.feeds.read().get(id).cloned()
    }

    pub fn has_feed(&self, id: &FeedId) -> bool {
        self.discovery.read().contains_key(&id.discovery_id())
    }

    pub fn is_writable(&self, id: &FeedId) -> Result<bool, FeedError> {
        match self.records.get(id.as_bytes())? {
            Some(bytes) => Ok(bincode::deserialize::<FeedRecord>(&bytes)?.secret.is_some()),
            None => Ok(false),
        }
    }

    pub fn append(&self, id: &FeedId, data: &[u8]) -> Result<u64, FeedError> {
        self.open_feed(id)?.append(data)
    }

    pub fn read(&self, id: &FeedId, index: u64) -> Result<Option<Vec<u8>>, FeedError> {
        self.open_feed(id)?.get(index)
    }

    pub fn read_range(&self, id: &FeedId, start: u64, end: u64) -> Result<Vec<Vec<u8>>, FeedError> {
        self.open_feed(id)?.get_range(start, end)
    }

    /// Every block from `start` on, waiting for new ones as they arrive.
    pub fn stream(
        &self,
        id: &FeedId,
        start: u64,
    ) -> Result<impl Stream<Item = Result<Vec<u8>, FeedError>>, FeedError> {
        let feed = self.open_feed(id)?;
        let length = feed.watch_length();
        Ok(futures::stream::unfold(
            (feed, start, length),
            |(feed, index, mut length)| async move {
                loop {
                    if index < *length.borrow_and_update() {
                        let item = feed
                            .get(index)
                            .and_then(|block| block.ok_or(FeedError::MissingBlock(index)));
                        return Some((item, (feed, index + 1, length)));
                    }
                    if length.changed().await.is_err() {
                        return None;
                    }
                }
            },
        ))
    }

    pub fn info(&self, id: &FeedId) -> Result<FeedInfo, FeedError> {
        let feed = self.open_feed(id)?;
        Ok(FeedInfo {
            id: *id,
            discovery_id: feed.discovery_id(),
            length: feed.len(),
            writable: feed.is_writable(),
        })
    }

    /// Resolve a discovery id announced by a peer
    pub fn feed_id_for(&self, discovery_id: &DiscoveryId) -> Option<FeedId> {
        self.discovery.read().get(discovery_id).copied()
    }

    pub fn discovery_ids(&self) -> Vec<DiscoveryId> {
        self.discovery.read().keys().copied().collect()
    }

    pub fn feed_ids(&self) -> Vec<FeedId> {
        let mut ids: Vec<FeedId> = self.discovery.read().values().copied().collect();
        ids.sort();
        ids
    }

    /// Number of stored blocks for a feed, without opening it
    pub fn stored_blocks(&self, id: &FeedId) -> Result<u64, FeedError> {
        let mut count = 0;
        while self.blocks.contains_key(block_key(id, count))? {
            count += 1;
        }
        Ok(count)
    }

    pub fn flush(&self) -> Result<(), FeedError> {
        self.records.flush()?;
        self.blocks.flush()?;
        Ok(())
    }
}

fn store_err(err: crate::store::StoreError) -> FeedError {
    match err {
        crate::store::StoreError::Sled(e) => FeedError::Sled(e),
        other => FeedError::Serialization(other.to_string()),
    }
}
