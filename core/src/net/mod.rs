// Network module: multiplexed peer connections and swarm plumbing

pub mod bus;
pub mod connection;
pub mod frame;
pub mod memory;
pub mod mux;
pub mod network;
pub mod peer;
pub mod router;

pub use bus::{BusError, MessageBus};
pub use connection::{ConnectionError, ConnectionId, NetworkMsg, PeerConnection, CONTROL_CHANNEL};
pub use frame::{FrameError, FrameType, MuxCodec, MuxFrame};
pub use memory::{MemoryHub, MemorySwarm};
pub use mux::{Channel, ChannelEvent, ChannelReceiver, ChannelSender, MuxError, Multiplexer};
pub use network::{DuplexStream, Network, NetworkError, Swarm, SwarmConnection};
pub use peer::{NetworkPeer, PeerError, PeerState};
pub use router::{MessageRouter, Routed};
