// In-process swarm
//
// Members that share a topic get connected with a `tokio::io::duplex` pair,
// once per member pair. Used by tests and by single-process setups.

use super::network::{Swarm, SwarmConnection};
use crate::keys::DiscoveryId;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::debug;

const PIPE_CAPACITY: usize = 256 * 1024;

#[derive(Default)]
struct HubState {
    next_member: u64,
    members: HashMap<u64, mpsc::UnboundedSender<SwarmConnection>>,
    topics: HashMap<DiscoveryId, BTreeSet<u64>>,
    linked: HashSet<(u64, u64)>,
}

impl HubState {
    fn link(&mut self, dialer: u64, listener: u64) -> bool {
        let (Some(to_dialer), Some(to_listener)) =
            (self.members.get(&dialer), self.members.get(&listener))
        else {
            return false;
        };
        let (a, b) = tokio::io::duplex(PIPE_CAPACITY);
        let sent_a = to_dialer
            .send(SwarmConnection {
                stream: Box::new(a),
                initiator: true,
            })
            .is_ok();
        let sent_b = to_listener
            .send(SwarmConnection {
                stream: Box::new(b),
                initiator: false,
            })
            .is_ok();
        debug!("Hub linked member {} -> {}", dialer, listener);
        sent_a && sent_b
    }
}

/// Shared rendezvous for [`MemorySwarm`]s. Cheap to clone.
#[derive(Clone, Default)]
pub struct MemoryHub {
    state: Arc<Mutex<HubState>>,
}

impl MemoryHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new member. Its connections arrive on the returned channel.
    pub fn swarm(&self) -> (Arc<MemorySwarm>, mpsc::UnboundedReceiver<SwarmConnection>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut state = self.state.lock();
        let id = state.next_member;
        state.next_member += 1;
        state.members.insert(id, tx);
        let swarm = Arc::new(MemorySwarm {
            id,
            hub: self.clone(),
        });
        (swarm, rx)
    }

    /// Open an extra connection between two members, regardless of topics.
    pub fn connect(&self, dialer: &MemorySwarm, listener: &MemorySwarm) -> bool {
        let mut state = self.state.lock();
        let key = (dialer.id.min(listener.id), dialer.id.max(listener.id));
        state.linked.insert(key);
        state.link(dialer.id, listener.id)
    }

    pub fn member_count(&self) -> usize {
        self.state.lock().members.len()
    }
}

pub struct MemorySwarm {
    id: u64,
    hub: MemoryHub,
}

impl MemorySwarm {
    pub fn id(&self) -> u64 {
        self.id
    }
}

#[async_trait]
impl Swarm for MemorySwarm {
    async fn join(&self, topic: DiscoveryId) -> anyhow::Result<()> {
        let mut state = self.hub.state.lock();
        let others: Vec<u64> = state
            .topics
            .get(&topic)
            .map(|members| members.iter().copied().filter(|m| *m != self.id).collect())
            .unwrap_or_default();
        state.topics.entry(topic).or_default().insert(self.id);

        for other in others {
            let key = (self.id.min(other), self.id.max(other));
            if state.linked.insert(key) {
                state.link(self.id, other);
            }
        }
        Ok(())
    }

    async fn leave(&self, topic: DiscoveryId) -> anyhow::Result<()> {
        let mut state = self.hub.state.lock();
        if let Some(members) = state.topics.get_mut(&topic) {
            members.remove(&self.id);
        }
        Ok(())
    }

    async fn destroy(&self) -> anyhow::Result<()> {
        let mut state = self.hub.state.lock();
        state.members.remove(&self.id);
        for members in state.topics.values_mut() {
            members.remove(&self.id);
        }
        let id = self.id;
        state.linked.retain(|(a, b)| *a != id && *b != id);
        Ok(())
    }
}
