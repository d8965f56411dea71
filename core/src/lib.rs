// meshmerge core: feed-based document replication
//
// Documents are the causal union of per-actor append-only feeds. Nodes find
// each other through a swarm, multiplex every protocol over one connection
// per peer, gossip which feeds they share, replicate them block by block and
// only surface a document once it has caught up with what peers reported.

pub mod actor;
pub mod clock;
pub mod config;
pub mod doc;
pub mod feed;
pub mod keys;
pub mod messages;
pub mod net;
pub mod queue;
pub mod replication;
pub mod repo;
pub mod store;

pub use actor::{Actor, ActorError, ActorMsg};
pub use clock::{cmp, is_satisfied, union, Clock, CmpClock, Seq, INFINITY};
pub use config::{ConfigError, NetworkConfig, RepoConfig};
pub use doc::{Change, DocBackend, DocError, DocEvent, MergeEngine};
pub use feed::{Feed, FeedError, FeedEvent, FeedProtocol, FeedStore};
pub use keys::{ActorId, DiscoveryId, DocId, FeedId, KeyError, KeyPair, PeerId, RepoId};
pub use messages::{CursorMessage, DocClock, DocCursor, DocumentMessage, RepoMsg, ReplicationMsg};
pub use net::{MemoryHub, Network, NetworkPeer, PeerConnection, Swarm, SwarmConnection};
pub use queue::{Queue, QueueError, Subscription};
pub use replication::{Discovery, ReplicationError, ReplicationManager};
pub use repo::{CoreError, RepoBackend, RepoEvent};

/// Install a `tracing` subscriber honouring `RUST_LOG`, falling back to
/// `default_level`. Safe to call more than once.
pub fn init_tracing(default_level: &str) {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level)),
        )
        .try_init();
}
