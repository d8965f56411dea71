// Message router: one named bus per peer connection, merged into one inbox

use super::bus::MessageBus;
use super::connection::{ConnectionError, ConnectionId};
use super::peer::NetworkPeer;
use crate::queue::Queue;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use tokio::task::JoinHandle;
use tracing::debug;

/// A message and the peer it came from
#[derive(Debug, Clone)]
pub struct Routed<M> {
    pub sender: Arc<NetworkPeer>,
    pub msg: M,
}

struct Route<M> {
    bus: Arc<MessageBus<M>>,
    forwarder: JoinHandle<()>,
}

pub struct MessageRouter<M> {
    channel: String,
    routes: Mutex<HashMap<ConnectionId, Route<M>>>,
    inbox: Queue<Routed<M>>,
}

impl<M> MessageRouter<M>
where
    M: Serialize + DeserializeOwned + Send + 'static,
{
    pub fn new(channel: &str) -> Arc<Self> {
        Arc::new(Self {
            channel: channel.to_string(),
            routes: Mutex::new(HashMap::new()),
            inbox: Queue::new(channel),
        })
    }

    pub fn inbox(&self) -> Queue<Routed<M>> {
        self.inbox.clone()
    }

    /// Start receiving from `peer`'s confirmed connection. Idempotent.
    pub fn listen(
        self: &Arc<Self>,
        peer: &Arc<NetworkPeer>,
    ) -> Result<Arc<MessageBus<M>>, ConnectionError> {
        let conn = peer.connection().ok_or(ConnectionError::Closed)?;

        let mut routes = self.routes.lock();
        if let Some(route) = routes.get(&conn.id()) {
            return Ok(route.bus.clone());
        }

        let bus = Arc::new(MessageBus::new(conn.open_channel(&self.channel)?));
        let mut messages = bus
            .inbox()
            .subscribe()
            .map_err(|_| ConnectionError::Closed)?;
        let inbox = self.inbox.clone();
        let router: Weak<Self> = Arc::downgrade(self);
        let sender = peer.clone();
        let conn_id = conn.id();

        let forwarder = tokio::spawn(async move {
            loop {
                tokio::select! {
                    msg = messages.recv() => match msg {
                        Some(msg) => inbox.push(Routed { sender: sender.clone(), msg }),
                        None => break,
                    },
                    _ = conn.closed() => break,
                }
            }
            if let Some(router) = router.upgrade() {
                router.routes.lock().remove(&conn_id);
            }
            debug!("Route {} for peer {} closed", conn_id, sender.id().short());
        });

        routes.insert(
            conn_id,
            Route {
                bus: bus.clone(),
                forwarder,
            },
        );
        Ok(bus)
    }

    pub fn send_to_peer(
        self: &Arc<Self>,
        peer: &Arc<NetworkPeer>,
        msg: &M,
    ) -> Result<(), ConnectionError> {
        let bus = self.listen(peer)?;
        bus.send(msg)?;
        Ok(())
    }

    pub fn route_count(&self) -> usize {
        self.routes.lock().len()
    }

    pub fn close(&self) {
        for (_, route) in self.routes.lock().drain() {
            route.forwarder.abort();
            route.bus.close();
        }
    }
}
