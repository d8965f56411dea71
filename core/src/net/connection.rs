// Peer connection: one multiplexed stream to a remote repo
//
// Every connection carries a "NetworkMsg" control channel: a Hello exchange
// identifies the remote, heartbeats keep the link alive, and the
// authoritative side uses ConfirmConnection to pick which of several
// connections between the same two peers survives.

use super::bus::{BusError, MessageBus};
use super::mux::{Channel, MuxError, Multiplexer};
use crate::config::{ConfigError, NetworkConfig};
use crate::keys::PeerId;
use crate::queue::Queue;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::{Arc, Weak};
use std::time::Instant;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Name of the control channel every connection opens first
pub const CONTROL_CHANNEL: &str = "NetworkMsg";

/// Connection errors
#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("Connection closed")]
    Closed,

    #[error("Channel error: {0}")]
    Mux(#[from] MuxError),

    #[error("Control channel error: {0}")]
    Bus(#[from] BusError),

    #[error("Handshake timed out")]
    HandshakeTimeout,

    #[error("Invalid network config: {0}")]
    Config(#[from] ConfigError),
}

/// Process-local connection number, used to tell connections to the same
/// peer apart
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Control channel messages
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum NetworkMsg {
    Hello {
        #[serde(rename = "peerId")]
        peer_id: PeerId,
    },
    Heartbeat,
    ConfirmConnection,
}

pub struct PeerConnection {
    id: ConnectionId,
    is_client: bool,
    mux: Multiplexer,
    control: MessageBus<NetworkMsg>,
    /// Control messages other than Hello/Heartbeat, for the owning peer
    messages: Queue<NetworkMsg>,
    remote: watch::Sender<Option<PeerId>>,
    last_seen: Mutex<Instant>,
    config: NetworkConfig,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl fmt::Debug for PeerConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PeerConnection")
            .field("id", &self.id)
            .field("is_client", &self.is_client)
            .field("remote", &*self.remote.borrow())
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl PeerConnection {
    /// Wrap a raw duplex stream. `is_client` is true on the dialing side.
    pub fn new<S>(
        id: ConnectionId,
        stream: S,
        is_client: bool,
        config: NetworkConfig,
    ) -> Result<Arc<Self>, ConnectionError>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        config.validate()?;
        let mux = Multiplexer::new(stream);
        let control = MessageBus::new(mux.open_channel(CONTROL_CHANNEL)?);
        let inbox = control.inbox();
        let (remote, _) = watch::channel(None);

        let conn = Arc::new(Self {
            id,
            is_client,
            mux,
            control,
            messages: Queue::new("connection-messages"),
            remote,
            last_seen: Mutex::new(Instant::now()),
            config,
            tasks: Mutex::new(Vec::new()),
        });

        let control_task = tokio::spawn(control_loop(Arc::downgrade(&conn), inbox));
        let heartbeat_task = tokio::spawn(heartbeat_loop(Arc::downgrade(&conn)));
        conn.tasks.lock().extend([control_task, heartbeat_task]);

        Ok(conn)
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn is_client(&self) -> bool {
        self.is_client
    }

    /// Remote peer id, once its Hello has arrived
    pub fn remote_id(&self) -> Option<PeerId> {
        *self.remote.borrow()
    }

    /// Send our Hello and wait for the remote's.
    pub async fn handshake(&self, self_id: PeerId) -> Result<PeerId, ConnectionError> {
        self.control.send(&NetworkMsg::Hello { peer_id: self_id })?;

        let mut remote = self.remote.subscribe();
        let wait = async {
            loop {
                if let Some(id) = *remote.borrow_and_update() {
                    return Ok(id);
                }
                if remote.changed().await.is_err() {
                    return Err(ConnectionError::Closed);
                }
            }
        };

        tokio::select! {
            result = tokio::time::timeout(self.config.handshake_timeout(), wait) => {
                result.map_err(|_| ConnectionError::HandshakeTimeout)?
            }
            _ = self.mux.closed() => Err(ConnectionError::Closed),
        }
    }

    /// Open an application channel. Names must be unique per connection.
    pub fn open_channel(&self, name: &str) -> Result<Channel, ConnectionError> {
        if self.is_closed() {
            return Err(ConnectionError::Closed);
        }
        Ok(self.mux.open_channel(name)?)
    }

    pub fn send_control(&self, msg: &NetworkMsg) -> Result<(), ConnectionError> {
        Ok(self.control.send(msg)?)
    }

    /// Control messages for the owner of this connection
    pub fn messages(&self) -> Queue<NetworkMsg> {
        self.messages.clone()
    }

    pub fn is_open(&self) -> bool {
        !self.mux.is_closed()
    }

    pub fn is_closed(&self) -> bool {
        self.mux.is_closed()
    }

    pub async fn closed(&self) {
        self.mux.closed().await
    }

    /// Close gracefully, falling back to destroy after the grace period.
    pub async fn close(&self) {
        if self.is_closed() {
            return;
        }
        debug!("Closing connection {}", self.id);
        let _ = tokio::time::timeout(self.config.close_grace(), self.mux.close()).await;
        self.destroy();
    }

    /// Drop the connection immediately.
    pub fn destroy(&self) {
        self.mux.destroy();
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
    }

    fn touch(&self) {
        *self.last_seen.lock() = Instant::now();
    }

    fn on_control(&self, msg: NetworkMsg) {
        self.touch();
        match msg {
            NetworkMsg::Hello { peer_id } => {
                if self.remote.borrow().is_some() {
                    warn!("Connection {}: ignoring repeated Hello", self.id);
                    return;
                }
                info!("Connection {} identified peer {}", self.id, peer_id.short());
                self.remote.send_replace(Some(peer_id));
            }
            NetworkMsg::Heartbeat => {}
            other => self.messages.push(other),
        }
    }
}

impl Drop for PeerConnection {
    fn drop(&mut self) {
        self.destroy();
    }
}

async fn control_loop(weak: Weak<PeerConnection>, inbox: Queue<NetworkMsg>) {
    let Ok(mut inbox) = inbox.subscribe() else {
        return;
    };
    while let Some(msg) = inbox.recv().await {
        let Some(conn) = weak.upgrade() else {
            break;
        };
        conn.on_control(msg);
    }
}

async fn heartbeat_loop(weak: Weak<PeerConnection>) {
    let Some(interval) = weak.upgrade().map(|c| c.config.heartbeat_interval()) else {
        return;
    };
    let mut ticker = tokio::time::interval(interval);
    ticker.tick().await;

    loop {
        ticker.tick().await;
        let Some(conn) = weak.upgrade() else {
            break;
        };
        if conn.is_closed() {
            break;
        }

        let silent = conn.last_seen.lock().elapsed();
        if silent > conn.config.peer_timeout() {
            warn!(
                "Connection {} silent for {:?}, dropping it",
                conn.id, silent
            );
            conn.destroy();
            break;
        }
        if let Err(e) = conn.send_control(&NetworkMsg::Heartbeat) {
            debug!("Connection {}: heartbeat failed: {}", conn.id, e);
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::KeyPair;
    use std::time::Duration;

    fn pair(config: NetworkConfig) -> (Arc<PeerConnection>, Arc<PeerConnection>) {
        let (a, b) = tokio::io::duplex(64 * 1024);
        (
            PeerConnection::new(ConnectionId(1), a, true, config.clone()).unwrap(),
            PeerConnection::new(ConnectionId(2), b, false, config).unwrap(),
        )
    }

    #[test]
    fn test_network_msg_wire_format() {
        let id = KeyPair::generate().peer_id();
        let json = serde_json::to_value(NetworkMsg::Hello { peer_id: id }).unwrap();
        assert_eq!(json["type"], "Hello");
        assert_eq!(json["peerId"], id.to_string());
        assert_eq!(
            serde_json::to_string(&NetworkMsg::ConfirmConnection).unwrap(),
            r#"{"type":"ConfirmConnection"}"#
        );
    }

    #[tokio::test]
    async fn test_handshake_exchanges_ids() {
        let (a, b) = pair(NetworkConfig::default());
        let (ida, idb) = (KeyPair::generate().peer_id(), KeyPair::generate().peer_id());

        let (ra, rb) = tokio::join!(a.handshake(ida), b.handshake(idb));
        assert_eq!(ra.unwrap(), idb);
        assert_eq!(rb.unwrap(), ida);
        assert_eq!(a.remote_id(), Some(idb));
    }

    #[tokio::test]
    async fn test_handshake_times_out_without_hello() {
        let config = NetworkConfig {
            handshake_timeout_ms: 50,
            ..NetworkConfig::default()
        };
        let (a, _b) = pair(config);
        let result = a.handshake(KeyPair::generate().peer_id()).await;
        assert!(matches!(result, Err(ConnectionError::HandshakeTimeout)));
    }

    #[tokio::test]
    async fn test_control_channel_name_is_reserved() {
        let (a, _b) = pair(NetworkConfig::default());
        assert!(matches!(
            a.open_channel(CONTROL_CHANNEL),
            Err(ConnectionError::Mux(MuxError::DuplicateChannel(_)))
        ));
    }

    #[tokio::test]
    async fn test_confirm_is_forwarded_to_owner() {
        let (a, b) = pair(NetworkConfig::default());
        a.send_control(&NetworkMsg::ConfirmConnection).unwrap();
        let msg = tokio::time::timeout(Duration::from_secs(2), b.messages().first())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(msg, NetworkMsg::ConfirmConnection);
    }

    #[tokio::test]
    async fn test_destroy_closes_both_ends() {
        let (a, b) = pair(NetworkConfig::default());
        a.destroy();
        tokio::time::timeout(Duration::from_secs(2), b.closed())
            .await
            .unwrap();
        assert!(b.is_closed());
        assert!(matches!(b.open_channel("x"), Err(ConnectionError::Closed)));
    }

    #[tokio::test]
    async fn test_zero_heartbeat_is_refused() {
        let config: NetworkConfig =
            serde_json::from_str(r#"{"heartbeat_interval_ms":0}"#).unwrap();
        let (stream, _other) = tokio::io::duplex(1024);
        let result = PeerConnection::new(ConnectionId(1), stream, true, config);
        assert!(matches!(
            result,
            Err(ConnectionError::Config(ConfigError::Zero("heartbeat_interval_ms")))
        ));
    }

    #[tokio::test]
    async fn test_silent_peer_times_out() {
        let config = NetworkConfig {
            heartbeat_interval_ms: 20,
            peer_timeout_ms: 60,
            ..NetworkConfig::default()
        };
        // The far end stays open but never speaks
        let (stream, _silent) = tokio::io::duplex(64 * 1024);
        let a = PeerConnection::new(ConnectionId(1), stream, true, config).unwrap();
        tokio::time::timeout(Duration::from_secs(2), a.closed())
            .await
            .unwrap();
        assert!(a.is_closed());
    }
}
