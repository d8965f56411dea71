// Network peer: every connection to one remote repo, deduplicated to one
//
// Both sides may dial each other at once, so two (or more) connections can
// exist between the same pair. The side with the greater peer id has
// authority: it confirms exactly one connection by sending
// ConfirmConnection over it and closes the rest. The other side only ever
// follows confirmations. When the confirmed connection drops, the
// authoritative side promotes another open pending connection, if any.

use super::connection::{ConnectionId, NetworkMsg, PeerConnection};
use crate::keys::PeerId;
use crate::queue::Queue;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Weak};
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PeerError {
    #[error("Peer {0} is closed")]
    Closed(PeerId),
}

/// Connection state of a peer
pub enum PeerState {
    NoConnection,
    Pending(Vec<Arc<PeerConnection>>),
    Confirmed {
        connection: Arc<PeerConnection>,
        pending: Vec<Arc<PeerConnection>>,
    },
    Closed,
}

impl fmt::Debug for PeerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PeerState::NoConnection => write!(f, "NoConnection"),
            PeerState::Pending(p) => write!(f, "Pending({})", p.len()),
            PeerState::Confirmed {
                connection,
                pending,
            } => write!(f, "Confirmed({}, +{})", connection.id(), pending.len()),
            PeerState::Closed => write!(f, "Closed"),
        }
    }
}

pub struct NetworkPeer {
    self_id: PeerId,
    id: PeerId,
    state: Mutex<PeerState>,
    /// Receives this peer on every confirmation
    confirmed: Queue<Arc<NetworkPeer>>,
    watchers: Mutex<HashMap<ConnectionId, Vec<JoinHandle<()>>>>,
}

impl fmt::Debug for NetworkPeer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NetworkPeer")
            .field("id", &self.id)
            .field("state", &*self.state.lock())
            .finish()
    }
}

impl NetworkPeer {
    pub fn new(self_id: PeerId, id: PeerId, confirmed: Queue<Arc<NetworkPeer>>) -> Arc<Self> {
        Arc::new(Self {
            self_id,
            id,
            state: Mutex::new(PeerState::NoConnection),
            confirmed,
            watchers: Mutex::new(HashMap::new()),
        })
    }

    pub fn id(&self) -> PeerId {
        self.id
    }

    /// The greater id decides which connection survives.
    pub fn we_have_authority(&self) -> bool {
        self.self_id > self.id
    }

    /// The confirmed connection, if it is still open
    pub fn connection(&self) -> Option<Arc<PeerConnection>> {
        match &*self.state.lock() {
            PeerState::Confirmed { connection, .. } if connection.is_open() => {
                Some(connection.clone())
            }
            _ => None,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connection().is_some()
    }

    pub fn pending_count(&self) -> usize {
        match &*self.state.lock() {
            PeerState::Pending(pending) | PeerState::Confirmed { pending, .. } => pending.len(),
            _ => 0,
        }
    }

    pub fn is_closed(&self) -> bool {
        matches!(*self.state.lock(), PeerState::Closed)
    }

    /// Adopt a freshly handshaken connection.
    pub fn add_connection(self: &Arc<Self>, conn: Arc<PeerConnection>) -> Result<(), PeerError> {
        let closed = {
            let mut state = self.state.lock();
            match &mut *state {
                PeerState::Closed => true,
                PeerState::NoConnection => {
                    *state = PeerState::Pending(vec![conn.clone()]);
                    false
                }
                PeerState::Pending(pending) | PeerState::Confirmed { pending, .. } => {
                    pending.push(conn.clone());
                    false
                }
            }
        };
        if closed {
            conn.destroy();
            return Err(PeerError::Closed(self.id));
        }
        debug!(
            "Peer {}: added connection {} (client: {})",
            self.id.short(),
            conn.id(),
            conn.is_client()
        );

        self.watch(&conn);
        if self.we_have_authority() {
            self.confirm(&conn, true);
        }
        Ok(())
    }

    fn watch(self: &Arc<Self>, conn: &Arc<PeerConnection>) {
        let weak = Arc::downgrade(self);
        let watched = conn.clone();
        let on_close = tokio::spawn(async move {
            watched.closed().await;
            if let Some(peer) = weak.upgrade() {
                peer.on_connection_closed(&watched);
            }
        });

        let weak: Weak<NetworkPeer> = Arc::downgrade(self);
        let watched = conn.clone();
        let on_control = tokio::spawn(async move {
            let Ok(mut messages) = watched.messages().subscribe() else {
                return;
            };
            while let Some(msg) = messages.recv().await {
                let Some(peer) = weak.upgrade() else {
                    break;
                };
                if msg == NetworkMsg::ConfirmConnection {
                    peer.on_confirm_message(&watched);
                }
            }
        });

        self.watchers
            .lock()
            .insert(conn.id(), vec![on_close, on_control]);
    }

    /// Authoritative side: make `conn` the confirmed connection.
    ///
    /// With `if_unconfirmed`, nothing changes while another open connection
    /// is already confirmed. The check and the transition share one lock.
    fn confirm(self: &Arc<Self>, conn: &Arc<PeerConnection>, if_unconfirmed: bool) -> bool {
        let retired = {
            let mut state = self.state.lock();
            match &*state {
                PeerState::Closed => return false,
                PeerState::Confirmed { connection, .. } => {
                    if connection.id() == conn.id()
                        || (if_unconfirmed && connection.is_open())
                    {
                        return false;
                    }
                }
                _ => {}
            }
            if let Err(e) = conn.send_control(&NetworkMsg::ConfirmConnection) {
                warn!("Peer {}: could not confirm {}: {}", self.id.short(), conn.id(), e);
                return false;
            }

            let (previous, pending) = match std::mem::replace(&mut *state, PeerState::NoConnection)
            {
                PeerState::Pending(pending) => (None, pending),
                PeerState::Confirmed {
                    connection,
                    pending,
                } => (Some(connection), pending),
                PeerState::NoConnection | PeerState::Closed => (None, Vec::new()),
            };
            *state = PeerState::Confirmed {
                connection: conn.clone(),
                pending: Vec::new(),
            };
            previous
                .into_iter()
                .chain(pending)
                .filter(|c| c.id() != conn.id())
                .collect::<Vec<_>>()
        };

        for other in retired {
            debug!("Peer {}: closing redundant connection {}", self.id.short(), other.id());
            tokio::spawn(async move { other.close().await });
        }

        info!("Peer {}: confirmed connection {}", self.id.short(), conn.id());
        self.confirmed.push(self.clone());
        true
    }

    /// Non-authoritative side: follow the remote's choice.
    fn on_confirm_message(self: &Arc<Self>, conn: &Arc<PeerConnection>) {
        if self.we_have_authority() {
            warn!(
                "Peer {} sent ConfirmConnection without authority, ignoring",
                self.id.short()
            );
            return;
        }

        let replaced = {
            let mut state = self.state.lock();
            match std::mem::replace(&mut *state, PeerState::NoConnection) {
                PeerState::Pending(mut pending) => {
                    let Some(pos) = pending.iter().position(|c| c.id() == conn.id()) else {
                        *state = PeerState::Pending(pending);
                        return;
                    };
                    let connection = pending.remove(pos);
                    *state = PeerState::Confirmed {
                        connection,
                        pending,
                    };
                    None
                }
                PeerState::Confirmed {
                    connection,
                    mut pending,
                } => {
                    if connection.id() == conn.id() {
                        *state = PeerState::Confirmed {
                            connection,
                            pending,
                        };
                        return;
                    }
                    let Some(pos) = pending.iter().position(|c| c.id() == conn.id()) else {
                        *state = PeerState::Confirmed {
                            connection,
                            pending,
                        };
                        return;
                    };
                    let promoted = pending.remove(pos);
                    *state = PeerState::Confirmed {
                        connection: promoted,
                        pending,
                    };
                    Some(connection)
                }
                other => {
                    *state = other;
                    return;
                }
            }
        };

        if let Some(old) = replaced {
            tokio::spawn(async move { old.close().await });
        }
        info!("Peer {}: connection {} confirmed by remote", self.id.short(), conn.id());
        self.confirmed.push(self.clone());
    }

    fn on_connection_closed(self: &Arc<Self>, conn: &Arc<PeerConnection>) {
        if let Some(tasks) = self.watchers.lock().remove(&conn.id()) {
            for task in tasks {
                task.abort();
            }
        }

        let lost_confirmed = {
            let mut state = self.state.lock();
            match std::mem::replace(&mut *state, PeerState::NoConnection) {
                PeerState::Pending(mut pending) => {
                    pending.retain(|c| c.id() != conn.id());
                    if !pending.is_empty() {
                        *state = PeerState::Pending(pending);
                    }
                    false
                }
                PeerState::Confirmed {
                    connection,
                    mut pending,
                } => {
                    pending.retain(|c| c.id() != conn.id());
                    if connection.id() == conn.id() {
                        if !pending.is_empty() {
                            *state = PeerState::Pending(pending);
                        }
                        true
                    } else {
                        *state = PeerState::Confirmed {
                            connection,
                            pending,
                        };
                        false
                    }
                }
                other => {
                    *state = other;
                    false
                }
            }
        };

        if !lost_confirmed {
            return;
        }
        info!("Peer {}: confirmed connection {} closed", self.id.short(), conn.id());

        if self.we_have_authority() {
            let candidate = match &*self.state.lock() {
                PeerState::Pending(pending) => pending.iter().find(|c| c.is_open()).cloned(),
                _ => None,
            };
            if let Some(next) = candidate {
                self.confirm(&next, true);
            }
        }
    }

    /// Destroy every connection and refuse new ones.
    pub fn close(&self) {
        let connections = {
            let mut state = self.state.lock();
            match std::mem::replace(&mut *state, PeerState::Closed) {
                PeerState::Pending(pending) => pending,
                PeerState::Confirmed {
                    connection,
                    mut pending,
                } => {
                    pending.push(connection);
                    pending
                }
                _ => Vec::new(),
            }
        };
        for conn in connections {
            conn.destroy();
        }
        for (_, tasks) in self.watchers.lock().drain() {
            for task in tasks {
                task.abort();
            }
        }
        debug!("Peer {} closed", self.id.short());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::NetworkConfig;
    use crate::net::connection::ConnectionId;
    use std::time::Duration;
    use tokio::time::timeout;

    fn ids() -> (PeerId, PeerId) {
        (PeerId::from_bytes([1; 32]), PeerId::from_bytes([2; 32]))
    }

    fn link(n: u64) -> (Arc<PeerConnection>, Arc<PeerConnection>) {
        let (a, b) = tokio::io::duplex(64 * 1024);
        let config = NetworkConfig::default();
        (
            PeerConnection::new(ConnectionId(n), a, true, config.clone()).unwrap(),
            PeerConnection::new(ConnectionId(n + 100), b, false, config).unwrap(),
        )
    }

    #[test]
    fn test_authority_is_greater_id() {
        let (low, high) = ids();
        let q = Queue::new("peers");
        assert!(NetworkPeer::new(high, low, q.clone()).we_have_authority());
        assert!(!NetworkPeer::new(low, high, q).we_have_authority());
    }

    #[tokio::test]
    async fn test_authority_confirms_first_connection() {
        let (low, high) = ids();
        let (qa, qb) = (Queue::new("a"), Queue::new("b"));
        // `auth` runs on the high node and sees the low node, and vice versa
        let auth = NetworkPeer::new(high, low, qa.clone());
        let follower = NetworkPeer::new(low, high, qb.clone());

        let (c_auth, c_follow) = link(1);
        follower.add_connection(c_follow).unwrap();
        assert!(!follower.is_connected());
        auth.add_connection(c_auth).unwrap();
        assert!(auth.is_connected());

        let confirmed = timeout(Duration::from_secs(2), qb.first()).await.unwrap().unwrap();
        assert_eq!(confirmed.id(), high);
        assert!(follower.is_connected());
        assert_eq!(qa.len(), 1);
    }

    #[tokio::test]
    async fn test_follower_ignores_its_own_authority_claims() {
        let (low, high) = ids();
        let q = Queue::new("a");
        let auth = NetworkPeer::new(high, low, q.clone());
        let (c_auth, c_remote) = link(1);
        auth.add_connection(c_auth).unwrap();
        let _ = q.first().await;

        // A confirmation from the low side must not change anything
        c_remote.send_control(&NetworkMsg::ConfirmConnection).unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(auth.is_connected());
        assert!(q.is_empty());
    }

    #[tokio::test]
    async fn test_reconfirm_closes_replaced_connection() {
        let (low, high) = ids();
        let q = Queue::new("a");
        let auth = NetworkPeer::new(high, low, q.clone());
        let (first, _first_remote) = link(1);
        let (second, _second_remote) = link(2);

        auth.add_connection(first.clone()).unwrap();
        auth.add_connection(second.clone()).unwrap();
        assert_eq!(auth.connection().unwrap().id(), first.id());
        assert_eq!(auth.pending_count(), 1);

        assert!(!auth.confirm(&first, false));
        assert!(auth.confirm(&second, false));
        timeout(Duration::from_secs(10), first.closed()).await.unwrap();
        assert_eq!(auth.connection().unwrap().id(), second.id());
        assert_eq!(auth.pending_count(), 0);
        assert_eq!(q.len(), 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_adds_confirm_once() {
        let (low, high) = ids();
        let q = Queue::new("a");
        let auth = NetworkPeer::new(high, low, q.clone());
        let links: Vec<_> = (0..8).map(|n| link(n * 2 + 1)).collect();

        let adds: Vec<_> = links
            .iter()
            .map(|(conn, _)| {
                let auth = auth.clone();
                let conn = conn.clone();
                tokio::spawn(async move { auth.add_connection(conn) })
            })
            .collect();
        for add in adds {
            add.await.unwrap().unwrap();
        }

        assert!(auth.is_connected());
        assert_eq!(auth.pending_count(), 7);
        assert_eq!(q.len(), 1);
        assert!(links.iter().all(|(conn, _)| conn.is_open()));
    }

    #[tokio::test]
    async fn test_close_refuses_new_connections() {
        let (low, high) = ids();
        let peer = NetworkPeer::new(high, low, Queue::new("a"));
        peer.close();
        let (conn, _other) = link(1);
        assert_eq!(
            peer.add_connection(conn.clone()),
            Err(PeerError::Closed(low))
        );
        assert!(conn.is_closed());
    }
}
