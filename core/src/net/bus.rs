// Message bus: JSON messages over one multiplexed channel

use super::mux::{Channel, ChannelSender, MuxError};
use crate::queue::Queue;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::marker::PhantomData;
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum BusError {
    #[error("Channel error: {0}")]
    Channel(#[from] MuxError),

    #[error("Encoding error: {0}")]
    Encode(String),
}

/// Typed JSON messages on a channel. Incoming messages land in [`inbox`];
/// anything that fails to decode is logged and dropped.
///
/// [`inbox`]: MessageBus::inbox
pub struct MessageBus<M> {
    sender: ChannelSender,
    inbox: Queue<M>,
    reader: JoinHandle<()>,
    _marker: PhantomData<fn(M)>,
}

impl<M> MessageBus<M>
where
    M: Serialize + DeserializeOwned + Send + 'static,
{
    pub fn new(channel: Channel) -> Self {
        let name = channel.name().to_string();
        let (sender, mut receiver) = channel.split();
        let inbox = Queue::new(&name);

        let queue = inbox.clone();
        let reader = tokio::spawn(async move {
            while let Some(bytes) = receiver.recv().await {
                match serde_json::from_slice::<M>(&bytes) {
                    Ok(msg) => queue.push(msg),
                    Err(e) => warn!("Ignoring malformed message on '{}': {}", name, e),
                }
            }
            debug!("Bus '{}' finished", name);
        });

        Self {
            sender,
            inbox,
            reader,
            _marker: PhantomData,
        }
    }

    pub fn send(&self, msg: &M) -> Result<(), BusError> {
        let bytes = serde_json::to_vec(msg).map_err(|e| BusError::Encode(e.to_string()))?;
        self.sender.write(bytes)?;
        Ok(())
    }

    pub fn inbox(&self) -> Queue<M> {
        self.inbox.clone()
    }

    pub fn name(&self) -> &str {
        self.sender.name()
    }

    pub fn is_open(&self) -> bool {
        self.sender.is_open()
    }

    /// Stop sending; the channel closes once the remote ends too.
    pub fn close(&self) {
        let _ = self.sender.end();
    }
}

impl<M> Drop for MessageBus<M> {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::mux::Multiplexer;
    use serde::Deserialize;
    use std::time::Duration;
    use tokio::time::timeout;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    #[serde(tag = "type")]
    enum TestMsg {
        Ping { n: u32 },
        Pong { n: u32 },
    }

    #[tokio::test]
    async fn test_bus_delivers_in_order() {
        let (a, b) = tokio::io::duplex(4096);
        let (ma, mb) = (Multiplexer::new(a), Multiplexer::new(b));
        let bus_a: MessageBus<TestMsg> = MessageBus::new(ma.open_channel("test").unwrap());
        let bus_b: MessageBus<TestMsg> = MessageBus::new(mb.open_channel("test").unwrap());

        bus_a.send(&TestMsg::Ping { n: 1 }).unwrap();
        bus_a.send(&TestMsg::Pong { n: 2 }).unwrap();

        let mut inbox = bus_b.inbox().subscribe().unwrap();
        let first = timeout(Duration::from_secs(2), inbox.recv()).await.unwrap();
        let second = timeout(Duration::from_secs(2), inbox.recv()).await.unwrap();
        assert_eq!(first, Some(TestMsg::Ping { n: 1 }));
        assert_eq!(second, Some(TestMsg::Pong { n: 2 }));
    }

    #[tokio::test]
    async fn test_bus_skips_malformed() {
        let (a, b) = tokio::io::duplex(4096);
        let (ma, mb) = (Multiplexer::new(a), Multiplexer::new(b));
        let raw = ma.open_channel("test").unwrap();
        let bus_b: MessageBus<TestMsg> = MessageBus::new(mb.open_channel("test").unwrap());

        raw.write(&b"{not json"[..]).unwrap();
        raw.write(&br#"{"type":"Unknown"}"#[..]).unwrap();
        raw.write(serde_json::to_vec(&TestMsg::Ping { n: 7 }).unwrap()).unwrap();

        let mut inbox = bus_b.inbox().subscribe().unwrap();
        let msg = timeout(Duration::from_secs(2), inbox.recv()).await.unwrap();
        assert_eq!(msg, Some(TestMsg::Ping { n: 7 }));
    }
}
