// Feed module: signed append-only logs, their store, and the replication
// protocol that runs per connection

pub mod handle;
pub mod protocol;
pub mod store;

pub use handle::{Feed, FeedEvent, FeedPeer, SignedBlock};
pub use protocol::{FeedProtocol, ProtocolMsg, EXTENSIONS, PROTOCOL_CHANNEL};
pub use store::{FeedInfo, FeedStore};

use crate::keys::{FeedId, KeyError};
use crate::net::ConnectionError;
use thiserror::Error;

/// Feed error types
#[derive(Debug, Error)]
pub enum FeedError {
    #[error("Storage error: {0}")]
    Sled(#[from] sled::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Key error: {0}")]
    Key(#[from] KeyError),

    #[error("Feed {0} is read-only")]
    ReadOnly(FeedId),

    #[error("Unknown feed: {0}")]
    UnknownFeed(FeedId),

    #[error("Key pair does not match feed {0}")]
    KeyMismatch(FeedId),

    #[error("Block {0} has an invalid signature")]
    InvalidSignature(u64),

    #[error("Block {0} is missing")]
    MissingBlock(u64),

    #[error("Expected to write at index {expected}, got {got}")]
    IndexMismatch { expected: u64, got: u64 },

    #[error("Remote supports none of our extensions")]
    ExtensionUnsupported,

    #[error("Replication protocol closed")]
    ProtocolClosed,

    #[error("Connection error: {0}")]
    Connection(#[from] ConnectionError),
}

impl From<bincode::Error> for FeedError {
    fn from(err: bincode::Error) -> Self {
        FeedError::Serialization(err.to_string())
    }
}
