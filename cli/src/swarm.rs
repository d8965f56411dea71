// TCP swarm: listen on a port and dial a fixed list of addresses
//
// There is no topic discovery here. Every dialed node is a candidate for
// every topic, and the replication gossip sorts out which feeds are shared.

use anyhow::{Context, Result};
use async_trait::async_trait;
use meshmerge_core::{DiscoveryId, Swarm, SwarmConnection};
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

const DIAL_ATTEMPTS: u32 = 10;
const DIAL_BACKOFF: Duration = Duration::from_millis(500);

pub struct TcpSwarm {
    local_addr: SocketAddr,
    peers: Vec<String>,
    connections: mpsc::UnboundedSender<SwarmConnection>,
    dialed: AtomicBool,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl TcpSwarm {
    /// Bind the listener and start accepting connections.
    pub async fn bind(
        port: u16,
        peers: Vec<String>,
    ) -> Result<(Arc<Self>, mpsc::UnboundedReceiver<SwarmConnection>)> {
        let listener = TcpListener::bind(("0.0.0.0", port))
            .await
            .with_context(|| format!("Failed to listen on port {}", port))?;
        let local_addr = listener.local_addr().context("Listener has no address")?;
        let (tx, rx) = mpsc::unbounded_channel();

        let accepted = tx.clone();
        let accept = tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, addr)) => {
                        debug!("Accepted connection from {}", addr);
                        let _ = stream.set_nodelay(true);
                        let conn = SwarmConnection {
                            stream: Box::new(stream),
                            initiator: false,
                        };
                        if accepted.send(conn).is_err() {
                            break;
                        }
                    }
                    Err(e) => warn!("Accept failed: {}", e),
                }
            }
        });
        info!("Listening on {}", local_addr);

        let swarm = Arc::new(Self {
            local_addr,
            peers,
            connections: tx,
            dialed: AtomicBool::new(false),
            tasks: Mutex::new(vec![accept]),
        });
        Ok((swarm, rx))
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    fn dial_all(&self) {
        for addr in self.peers.clone() {
            let connections = self.connections.clone();
            let task = tokio::spawn(async move {
                for attempt in 1..=DIAL_ATTEMPTS {
                    match TcpStream::connect(&addr).await {
                        Ok(stream) => {
                            info!("Connected to {}", addr);
                            let _ = stream.set_nodelay(true);
                            let _ = connections.send(SwarmConnection {
                                stream: Box::new(stream),
                                initiator: true,
                            });
                            return;
                        }
                        Err(e) => {
                            debug!("Dial {} attempt {} failed: {}", addr, attempt, e);
                            tokio::time::sleep(DIAL_BACKOFF * attempt).await;
                        }
                    }
                }
                warn!("Giving up on {}", addr);
            });
            self.tasks.lock().push(task);
        }
    }
}

#[async_trait]
impl Swarm for TcpSwarm {
    async fn join(&self, topic: DiscoveryId) -> anyhow::Result<()> {
        debug!("Topic {} joined", topic.short());
        if !self.dialed.swap(true, Ordering::SeqCst) {
            self.dial_all();
        }
        Ok(())
    }

    async fn leave(&self, topic: DiscoveryId) -> anyhow::Result<()> {
        debug!("Topic {} left", topic.short());
        Ok(())
    }

    async fn destroy(&self) -> anyhow::Result<()> {
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        Ok(())
    }
}
