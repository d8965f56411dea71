mod common;

use common::{eventually, fast_network, WAIT};
use meshmerge_core::store::Storage;
use meshmerge_core::{FeedStore, KeyPair, MemoryHub, Network, ReplicationManager};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio::time::timeout;

struct Node {
    feeds: Arc<FeedStore>,
    network: Arc<Network>,
    manager: Arc<ReplicationManager>,
    pump: JoinHandle<()>,
}

impl Node {
    async fn start(hub: &MemoryHub) -> Self {
        let storage = Storage::temporary().unwrap();
        let feeds = Arc::new(FeedStore::open(&storage).unwrap());
        let network = Network::new(KeyPair::generate().peer_id(), fast_network());
        let manager = ReplicationManager::new(feeds.clone()).unwrap();

        let mut peers = network.peer_q().subscribe().unwrap();
        let pumped = manager.clone();
        let pump = tokio::spawn(async move {
            while let Some(peer) = peers.recv().await {
                pumped.on_peer(&peer).unwrap();
            }
        });

        let (swarm, incoming) = hub.swarm();
        network.attach_swarm(swarm, incoming).await.unwrap();
        Self {
            feeds,
            network,
            manager,
            pump,
        }
    }

    async fn stop(self) {
        self.pump.abort();
        self.manager.close();
        self.network.close().await;
    }
}

#[tokio::test]
async fn test_shared_feed_replicates_blocks() {
    let hub = MemoryHub::new();
    let a = Node::start(&hub).await;
    let b = Node::start(&hub).await;

    let (feed_id, _keys) = a.feeds.create_new().unwrap();
    a.feeds.append(&feed_id, b"first block").unwrap();
    a.feeds.append(&feed_id, b"second block").unwrap();

    // B only knows the public key
    b.feeds.open_feed(&feed_id).unwrap();
    assert!(!b.feeds.is_writable(&feed_id).unwrap());

    let mut found_a = a.manager.discovery_q().subscribe().unwrap();
    let mut found_b = b.manager.discovery_q().subscribe().unwrap();

    a.network.join(&feed_id).await.unwrap();
    b.network.join(&feed_id).await.unwrap();

    let discovered_a = timeout(WAIT, found_a.recv()).await.unwrap().unwrap();
    let discovered_b = timeout(WAIT, found_b.recv()).await.unwrap().unwrap();
    assert_eq!(discovered_a.feed_id, feed_id);
    assert_eq!(discovered_b.feed_id, feed_id);
    assert_eq!(discovered_b.discovery_id, feed_id.discovery_id());
    assert_eq!(discovered_b.peer.id(), a.network.self_id());

    let feeds_b = b.feeds.clone();
    assert!(eventually(|| feeds_b.get(&feed_id).map(|f| f.len() == 2).unwrap_or(false)).await);
    assert_eq!(
        b.feeds.read(&feed_id, 0).unwrap(),
        a.feeds.read(&feed_id, 0).unwrap()
    );
    assert_eq!(b.feeds.read(&feed_id, 1).unwrap().unwrap(), b"second block".to_vec());

    // Appends after the session started keep flowing
    a.feeds.append(&feed_id, b"third block").unwrap();
    assert!(eventually(|| feeds_b.get(&feed_id).map(|f| f.len() == 3).unwrap_or(false)).await);

    assert_eq!(a.manager.session_count(), 1);
    assert_eq!(b.manager.session_count(), 1);

    a.stop().await;
    b.stop().await;
}

#[tokio::test]
async fn test_unknown_feed_is_not_handed_out() {
    let hub = MemoryHub::new();
    let a = Node::start(&hub).await;
    let b = Node::start(&hub).await;

    let (shared, _) = a.feeds.create_new().unwrap();
    let (private, _) = a.feeds.create_new().unwrap();
    a.feeds.append(&shared, b"public").unwrap();
    a.feeds.append(&private, b"secret").unwrap();
    b.feeds.open_feed(&shared).unwrap();

    a.network.join(&shared).await.unwrap();
    b.network.join(&shared).await.unwrap();

    let feeds_b = b.feeds.clone();
    assert!(eventually(|| feeds_b.get(&shared).map(|f| f.len() == 1).unwrap_or(false)).await);

    // Announcing the private feed again does not make B register it
    a.manager.add_feed_ids(&[private]);
    tokio::time::sleep(std::time::Duration::from_millis(200)).await;
    assert!(!b.feeds.has_feed(&private));
    assert_eq!(b.feeds.feed_ids(), vec![shared]);

    a.stop().await;
    b.stop().await;
}

#[tokio::test]
async fn test_feed_opened_later_joins_running_session() {
    let hub = MemoryHub::new();
    let a = Node::start(&hub).await;
    let b = Node::start(&hub).await;

    let (first, _) = a.feeds.create_new().unwrap();
    let (later, _) = a.feeds.create_new().unwrap();
    a.feeds.append(&first, b"one").unwrap();
    a.feeds.append(&later, b"two").unwrap();
    b.feeds.open_feed(&first).unwrap();

    a.network.join(&first).await.unwrap();
    b.network.join(&first).await.unwrap();
    let feeds_b = b.feeds.clone();
    assert!(eventually(|| feeds_b.get(&first).map(|f| f.len() == 1).unwrap_or(false)).await);

    // B learns of the second feed and offers it over the existing session
    b.feeds.open_feed(&later).unwrap();
    b.manager.add_feed_ids(&[later]);
    assert!(eventually(|| feeds_b.get(&later).map(|f| f.len() == 1).unwrap_or(false)).await);
    assert_eq!(b.feeds.read(&later, 0).unwrap().unwrap(), b"two".to_vec());

    a.stop().await;
    b.stop().await;
}
