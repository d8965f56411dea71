// Multiplexer: named, independently closable channels over one stream
//
// Each side numbers its own channels. A Start frame binds a name to the
// sender's id; both sides send one Start per channel, so a channel exists on
// the wire once it has been announced from both ends, whichever opened first.
// Data/End/Destroy frames always carry the sender's id, and are routed through
// the remote->local map built from Start frames.

use super::frame::{FrameType, MuxCodec, MuxFrame};
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::codec::{FramedRead, FramedWrite};
use tracing::{debug, trace, warn};

/// Data frames held for a remotely started channel nobody here has claimed.
/// Past this the channel is destroyed.
pub const MAX_UNCLAIMED_FRAMES: usize = 1024;

/// Multiplexer error types
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum MuxError {
    #[error("Channel '{0}' is already open")]
    DuplicateChannel(String),

    #[error("Channel is closed")]
    ChannelClosed,

    #[error("Multiplexer is closed")]
    Closed,
}

/// What a channel reader observes, in order: any number of `Data`, at most one
/// `End` (remote finished writing), then exactly one `Close`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    Data(Bytes),
    End,
    Close,
}

struct Slot {
    name: String,
    events: mpsc::UnboundedSender<ChannelEvent>,
    /// Held until a local `open_channel` claims a remotely started channel
    unclaimed: Option<mpsc::UnboundedReceiver<ChannelEvent>>,
    buffered: usize,
    claimed: bool,
    local_ended: bool,
    remote_ended: bool,
    remote_id: Option<u64>,
}

impl Slot {
    fn new(name: &str, claimed: bool) -> (Self, Option<mpsc::UnboundedReceiver<ChannelEvent>>) {
        let (events, rx) = mpsc::unbounded_channel();
        let (unclaimed, claimed_rx) = if claimed { (None, Some(rx)) } else { (Some(rx), None) };
        let slot = Self {
            name: name.to_string(),
            events,
            unclaimed,
            buffered: 0,
            claimed,
            local_ended: false,
            remote_ended: false,
            remote_id: None,
        };
        (slot, claimed_rx)
    }
}

struct MuxState {
    next_id: u64,
    slots: HashMap<u64, Slot>,
    names: HashMap<String, u64>,
    remote: HashMap<u64, u64>,
    /// `None` once the multiplexer is shut down
    outgoing: Option<mpsc::UnboundedSender<MuxFrame>>,
}

impl MuxState {
    fn send(&self, frame: MuxFrame) -> Result<(), MuxError> {
        match self.outgoing.as_ref() {
            Some(tx) => tx.send(frame).map_err(|_| MuxError::Closed),
            None => Err(MuxError::Closed),
        }
    }
}

struct MuxShared {
    state: Mutex<MuxState>,
    closed: watch::Sender<bool>,
    open_channels: watch::Sender<usize>,
}

impl MuxShared {
    fn teardown(&self, state: &mut MuxState, local_id: u64) {
        let Some(slot) = state.slots.remove(&local_id) else {
            return;
        };
        if state.names.get(&slot.name) == Some(&local_id) {
            state.names.remove(&slot.name);
        }
        if let Some(remote_id) = slot.remote_id {
            state.remote.remove(&remote_id);
        }
        let _ = slot.events.send(ChannelEvent::Close);
        trace!("Channel '{}' ({}) closed", slot.name, local_id);
        self.open_channels.send_replace(state.slots.len());
    }

    fn open_channel(self: &Arc<Self>, name: &str) -> Result<Channel, MuxError> {
        let mut state = self.state.lock();
        if state.outgoing.is_none() {
            return Err(MuxError::Closed);
        }

        if let Some(&id) = state.names.get(name) {
            let slot = state.slots.get_mut(&id).ok_or(MuxError::ChannelClosed)?;
            if slot.claimed {
                return Err(MuxError::DuplicateChannel(name.to_string()));
            }
            // The remote opened it first; our Start already went out
            slot.claimed = true;
            let events = slot.unclaimed.take().ok_or(MuxError::ChannelClosed)?;
            return Ok(Channel::new(id, name, self.clone(), events));
        }

        let id = state.next_id;
        state.next_id += 1;
        let (slot, events) = Slot::new(name, true);
        let events = events.ok_or(MuxError::ChannelClosed)?;
        state.slots.insert(id, slot);
        state.names.insert(name.to_string(), id);
        self.open_channels.send_replace(state.slots.len());
        state.send(MuxFrame::start(id, name))?;

        Ok(Channel::new(id, name, self.clone(), events))
    }

    fn on_frame(&self, frame: MuxFrame) {
        let mut state = self.state.lock();
        let remote_id = frame.channel_id;

        if frame.frame_type == FrameType::Start {
            self.on_start(&mut state, remote_id, &frame.body);
            return;
        }

        let Some(&local_id) = state.remote.get(&remote_id) else {
            trace!("Ignoring {:?} for unknown channel {}", frame.frame_type, remote_id);
            return;
        };

        match frame.frame_type {
            FrameType::Start => {}
            FrameType::Data => {
                let Some(slot) = state.slots.get_mut(&local_id) else {
                    return;
                };
                if !slot.claimed {
                    slot.buffered += 1;
                    if slot.buffered > MAX_UNCLAIMED_FRAMES {
                        warn!("Unclaimed channel '{}' overflowed, destroying", slot.name);
                        let _ = state.send(MuxFrame::destroy(local_id));
                        self.teardown(&mut state, local_id);
                        return;
                    }
                }
                let _ = slot.events.send(ChannelEvent::Data(frame.body));
            }
            FrameType::End => {
                let Some(slot) = state.slots.get_mut(&local_id) else {
                    return;
                };
                if slot.remote_ended {
                    return;
                }
                slot.remote_ended = true;
                let _ = slot.events.send(ChannelEvent::End);
                // Nobody here will ever write to an unclaimed channel
                if !slot.claimed || slot.local_ended {
                    let _ = state.send(MuxFrame::destroy(local_id));
                    self.teardown(&mut state, local_id);
                }
            }
            FrameType::Destroy => self.teardown(&mut state, local_id),
        }
    }

    fn on_start(&self, state: &mut MuxState, remote_id: u64, body: &[u8]) {
        let Ok(name) = std::str::from_utf8(body) else {
            warn!("Ignoring Start frame with a non-UTF-8 channel name");
            return;
        };
        if state.remote.contains_key(&remote_id) {
            trace!("Duplicate Start for remote channel {}", remote_id);
            return;
        }

        if let Some(&local_id) = state.names.get(name) {
            if let Some(slot) = state.slots.get_mut(&local_id) {
                if slot.remote_id.is_none() {
                    slot.remote_id = Some(remote_id);
                    state.remote.insert(remote_id, local_id);
                    return;
                }
            }
        }

        let local_id = state.next_id;
        state.next_id += 1;
        let (mut slot, _) = Slot::new(name, false);
        slot.remote_id = Some(remote_id);
        state.slots.insert(local_id, slot);
        state.names.insert(name.to_string(), local_id);
        state.remote.insert(remote_id, local_id);
        self.open_channels.send_replace(state.slots.len());

        debug!("Remote opened channel '{}'", name);
        let _ = state.send(MuxFrame::start(local_id, name));
    }

    fn write(&self, local_id: u64, data: Bytes) -> Result<(), MuxError> {
        let state = self.state.lock();
        match state.slots.get(&local_id) {
            Some(slot) if !slot.local_ended => state.send(MuxFrame::data(local_id, data)),
            _ => Err(MuxError::ChannelClosed),
        }
    }

    fn end(&self, local_id: u64) -> Result<(), MuxError> {
        let mut state = self.state.lock();
        let slot = state
            .slots
            .get_mut(&local_id)
            .ok_or(MuxError::ChannelClosed)?;
        if slot.local_ended {
            return Ok(());
        }
        slot.local_ended = true;
        let remote_ended = slot.remote_ended;

        state.send(MuxFrame::end(local_id))?;
        if remote_ended {
            let _ = state.send(MuxFrame::destroy(local_id));
            self.teardown(&mut state, local_id);
        }
        Ok(())
    }

    fn destroy(&self, local_id: u64) {
        let mut state = self.state.lock();
        if state.slots.contains_key(&local_id) {
            let _ = state.send(MuxFrame::destroy(local_id));
            self.teardown(&mut state, local_id);
        }
    }

    fn is_open(&self, local_id: u64) -> bool {
        self.state.lock().slots.contains_key(&local_id)
    }

    /// Close every channel and stop accepting frames. Frames already queued
    /// for the writer still go out.
    fn shutdown(&self) {
        let mut state = self.state.lock();
        if state.outgoing.take().is_none() {
            return;
        }
        for (_, slot) in state.slots.drain() {
            let _ = slot.events.send(ChannelEvent::Close);
        }
        state.names.clear();
        state.remote.clear();
        self.open_channels.send_replace(0);
        self.closed.send_replace(true);
        debug!("Multiplexer shut down");
    }
}

/// Writing half of a channel. Cheap to clone.
#[derive(Clone)]
pub struct ChannelSender {
    id: u64,
    name: Arc<str>,
    shared: Arc<MuxShared>,
}

impl ChannelSender {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn write(&self, data: impl Into<Bytes>) -> Result<(), MuxError> {
        self.shared.write(self.id, data.into())
    }

    /// Finish writing. The channel closes once the remote ends too.
    pub fn end(&self) -> Result<(), MuxError> {
        self.shared.end(self.id)
    }

    /// Tear the channel down immediately, on both sides.
    pub fn destroy(&self) {
        self.shared.destroy(self.id)
    }

    pub fn is_open(&self) -> bool {
        self.shared.is_open(self.id)
    }
}

/// Reading half of a channel
pub struct ChannelReceiver {
    events: mpsc::UnboundedReceiver<ChannelEvent>,
    finished: bool,
}

impl ChannelReceiver {
    /// Next event; `None` after `Close` has been delivered.
    pub async fn next_event(&mut self) -> Option<ChannelEvent> {
        if self.finished {
            return None;
        }
        match self.events.recv().await {
            Some(ChannelEvent::Close) | None => {
                self.finished = true;
                Some(ChannelEvent::Close)
            }
            Some(event) => Some(event),
        }
    }

    /// Next payload; `None` once the remote has ended or the channel closed.
    pub async fn recv(&mut self) -> Option<Bytes> {
        match self.next_event().await? {
            ChannelEvent::Data(bytes) => Some(bytes),
            ChannelEvent::End | ChannelEvent::Close => None,
        }
    }
}

/// A named channel of a [`Multiplexer`]
pub struct Channel {
    sender: ChannelSender,
    receiver: ChannelReceiver,
}

impl Channel {
    fn new(
        id: u64,
        name: &str,
        shared: Arc<MuxShared>,
        events: mpsc::UnboundedReceiver<ChannelEvent>,
    ) -> Self {
        Self {
            sender: ChannelSender {
                id,
                name: Arc::from(name),
                shared,
            },
            receiver: ChannelReceiver {
                events,
                finished: false,
            },
        }
    }

    pub fn name(&self) -> &str {
        self.sender.name()
    }

    pub fn write(&self, data: impl Into<Bytes>) -> Result<(), MuxError> {
        self.sender.write(data)
    }

    pub fn end(&self) -> Result<(), MuxError> {
        self.sender.end()
    }

    pub fn destroy(&self) {
        self.sender.destroy()
    }

    pub fn is_open(&self) -> bool {
        self.sender.is_open()
    }

    pub async fn next_event(&mut self) -> Option<ChannelEvent> {
        self.receiver.next_event().await
    }

    pub async fn recv(&mut self) -> Option<Bytes> {
        self.receiver.recv().await
    }

    /// End our side and wait for the channel to close. Unread data is dropped.
    pub async fn close(mut self) {
        let _ = self.sender.end();
        while let Some(event) = self.receiver.next_event().await {
            if event == ChannelEvent::Close {
                break;
            }
        }
    }

    pub fn split(self) -> (ChannelSender, ChannelReceiver) {
        (self.sender, self.receiver)
    }
}

/// Channel multiplexer over a duplex byte stream
pub struct Multiplexer {
    shared: Arc<MuxShared>,
    reader: Mutex<Option<JoinHandle<()>>>,
}

impl Multiplexer {
    /// Take ownership of `stream` and start the read and write tasks.
    pub fn new<S>(stream: S) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (read_half, write_half) = tokio::io::split(stream);
        let (outgoing, frames) = mpsc::unbounded_channel();
        let (closed, _) = watch::channel(false);
        let (open_channels, _) = watch::channel(0);

        let shared = Arc::new(MuxShared {
            state: Mutex::new(MuxState {
                next_id: 1,
                slots: HashMap::new(),
                names: HashMap::new(),
                remote: HashMap::new(),
                outgoing: Some(outgoing),
            }),
            closed,
            open_channels,
        });

        tokio::spawn(write_loop(write_half, frames, shared.clone()));
        let reader = tokio::spawn(read_loop(read_half, shared.clone()));

        Self {
            shared,
            reader: Mutex::new(Some(reader)),
        }
    }

    /// Open (or claim) the channel called `name`.
    pub fn open_channel(&self, name: &str) -> Result<Channel, MuxError> {
        self.shared.open_channel(name)
    }

    /// Names of all open channels, claimed or not.
    pub fn channel_names(&self) -> Vec<String> {
        let state = self.shared.state.lock();
        let mut names: Vec<String> = state.slots.values().map(|s| s.name.clone()).collect();
        names.sort();
        names
    }

    pub fn is_closed(&self) -> bool {
        *self.shared.closed.borrow()
    }

    /// Resolves once the multiplexer has shut down.
    pub async fn closed(&self) {
        let mut rx = self.shared.closed.subscribe();
        while !*rx.borrow_and_update() {
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    /// End every channel and wait until the remote has closed them all, then
    /// shut down. Callers bound this with a timeout.
    pub async fn close(&self) {
        let ids: Vec<(u64, bool)> = {
            let state = self.shared.state.lock();
            state.slots.iter().map(|(id, s)| (*id, s.claimed)).collect()
        };
        for (id, claimed) in ids {
            if claimed {
                let _ = self.shared.end(id);
            } else {
                self.shared.destroy(id);
            }
        }

        let mut open = self.shared.open_channels.subscribe();
        while *open.borrow_and_update() > 0 {
            if open.changed().await.is_err() {
                break;
            }
        }
        self.destroy();
    }

    /// Shut down immediately, closing every channel.
    pub fn destroy(&self) {
        self.shared.shutdown();
        if let Some(reader) = self.reader.lock().take() {
            reader.abort();
        }
    }
}

impl Drop for Multiplexer {
    fn drop(&mut self) {
        self.destroy();
    }
}

async fn write_loop<W>(
    write_half: W,
    mut frames: mpsc::UnboundedReceiver<MuxFrame>,
    shared: Arc<MuxShared>,
) where
    W: AsyncWrite + Unpin,
{
    let mut sink = FramedWrite::new(write_half, MuxCodec);
    while let Some(frame) = frames.recv().await {
        if let Err(e) = sink.send(frame).await {
            debug!("Multiplexer write failed: {}", e);
            break;
        }
    }
    let _ = sink.close().await;
    shared.shutdown();
}

async fn read_loop<R>(read_half: R, shared: Arc<MuxShared>)
where
    R: AsyncRead + Unpin,
{
    let mut frames = FramedRead::new(read_half, MuxCodec);
    while let Some(item) = frames.next().await {
        match item {
            Ok(frame) => shared.on_frame(frame),
            Err(e) => {
                warn!("Dropping connection on bad frame: {}", e);
                break;
            }
        }
    }
    shared.shutdown();
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::timeout;

    fn pair() -> (Multiplexer, Multiplexer) {
        let (a, b) = tokio::io::duplex(64 * 1024);
        (Multiplexer::new(a), Multiplexer::new(b))
    }

    async fn next(channel: &mut Channel) -> ChannelEvent {
        timeout(Duration::from_secs(2), channel.next_event())
            .await
            .expect("timed out")
            .expect("channel finished")
    }

    #[tokio::test]
    async fn test_both_sides_open_same_name() {
        let (a, b) = pair();
        let mut ca = a.open_channel("chat").unwrap();
        let mut cb = b.open_channel("chat").unwrap();

        ca.write(Bytes::from_static(b"ping")).unwrap();
        cb.write(Bytes::from_static(b"pong")).unwrap();

        assert_eq!(next(&mut cb).await, ChannelEvent::Data(Bytes::from_static(b"ping")));
        assert_eq!(next(&mut ca).await, ChannelEvent::Data(Bytes::from_static(b"pong")));
    }

    #[tokio::test]
    async fn test_data_before_remote_claims_is_buffered() {
        let (a, b) = pair();
        let ca = a.open_channel("late").unwrap();
        ca.write(Bytes::from_static(b"one")).unwrap();
        ca.write(Bytes::from_static(b"two")).unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;
        let mut cb = b.open_channel("late").unwrap();
        assert_eq!(cb.recv().await.unwrap(), Bytes::from_static(b"one"));
        assert_eq!(cb.recv().await.unwrap(), Bytes::from_static(b"two"));
    }

    #[tokio::test]
    async fn test_duplicate_open_is_rejected() {
        let (a, _b) = pair();
        let _first = a.open_channel("dup").unwrap();
        assert_eq!(
            a.open_channel("dup").err(),
            Some(MuxError::DuplicateChannel("dup".to_string()))
        );
    }

    #[tokio::test]
    async fn test_end_on_both_sides_closes() {
        let (a, b) = pair();
        let mut ca = a.open_channel("bye").unwrap();
        let mut cb = b.open_channel("bye").unwrap();

        ca.end().unwrap();
        assert_eq!(next(&mut cb).await, ChannelEvent::End);
        cb.end().unwrap();

        assert_eq!(next(&mut ca).await, ChannelEvent::End);
        assert_eq!(next(&mut ca).await, ChannelEvent::Close);
        assert_eq!(next(&mut cb).await, ChannelEvent::Close);
        assert!(ca.next_event().await.is_none());
    }

    #[tokio::test]
    async fn test_write_after_end_fails() {
        let (a, _b) = pair();
        let ca = a.open_channel("x").unwrap();
        ca.end().unwrap();
        assert_eq!(ca.write(Bytes::from_static(b"late")), Err(MuxError::ChannelClosed));
    }

    #[tokio::test]
    async fn test_destroy_closes_remote() {
        let (a, b) = pair();
        let ca = a.open_channel("gone").unwrap();
        let mut cb = b.open_channel("gone").unwrap();
        // Make sure both Starts crossed before tearing down
        ca.write(Bytes::from_static(b"hi")).unwrap();
        assert_eq!(next(&mut cb).await, ChannelEvent::Data(Bytes::from_static(b"hi")));

        ca.destroy();
        assert_eq!(next(&mut cb).await, ChannelEvent::Close);
        assert!(!ca.is_open());
    }

    #[tokio::test]
    async fn test_name_reusable_after_close() {
        let (a, b) = pair();
        let ca = a.open_channel("again").unwrap();
        let cb = b.open_channel("again").unwrap();
        tokio::join!(ca.close(), cb.close());

        assert!(a.open_channel("again").is_ok());
    }

    #[tokio::test]
    async fn test_end_on_unclaimed_channel_tears_it_down() {
        let (a, b) = pair();
        let mut ca = a.open_channel("orphan").unwrap();
        ca.write(Bytes::from_static(b"stale")).unwrap();
        ca.end().unwrap();

        // The remote never claims it, so it destroys the channel on End
        assert_eq!(next(&mut ca).await, ChannelEvent::Close);
        assert!(b.channel_names().is_empty());
        assert!(a.channel_names().is_empty());

        let fresh = a.open_channel("orphan").unwrap();
        fresh.write(Bytes::from_static(b"fresh")).unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        let mut cb = b.open_channel("orphan").unwrap();
        assert_eq!(next(&mut cb).await, ChannelEvent::Data(Bytes::from_static(b"fresh")));
    }

    #[tokio::test]
    async fn test_reopened_channel_gets_fresh_id() {
        let (a, b) = pair();
        let ca = a.open_channel("again").unwrap();
        let mut cb = b.open_channel("again").unwrap();
        ca.write(Bytes::from_static(b"old")).unwrap();
        assert_eq!(next(&mut cb).await, ChannelEvent::Data(Bytes::from_static(b"old")));
        let old_id = ca.sender.id;

        ca.destroy();
        assert_eq!(next(&mut cb).await, ChannelEvent::Close);

        let reopened = a.open_channel("again").unwrap();
        assert_ne!(reopened.sender.id, old_id);
        assert!(!ca.is_open());
        assert!(reopened.is_open());

        reopened.write(Bytes::from_static(b"new")).unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        let mut cb = b.open_channel("again").unwrap();
        assert_eq!(next(&mut cb).await, ChannelEvent::Data(Bytes::from_static(b"new")));
    }

    #[tokio::test]
    async fn test_unclaimed_overflow_destroys_channel() {
        let (a, b) = pair();
        let mut ca = a.open_channel("flood").unwrap();
        for n in 0..=MAX_UNCLAIMED_FRAMES {
            if ca.write(Bytes::from(n.to_string())).is_err() {
                break;
            }
        }

        loop {
            match next(&mut ca).await {
                ChannelEvent::Close => break,
                ChannelEvent::Data(_) | ChannelEvent::End => {}
            }
        }
        assert!(b.channel_names().is_empty());
        assert!(b.open_channel("flood").is_ok());
    }

    #[tokio::test]
    async fn test_destroy_multiplexer_closes_everything() {
        let (a, b) = pair();
        let mut ca = a.open_channel("one").unwrap();
        let _cb = b.open_channel("one").unwrap();

        b.destroy();
        assert_eq!(next(&mut ca).await, ChannelEvent::Close);
        timeout(Duration::from_secs(2), a.closed()).await.unwrap();
        assert!(a.is_closed());
        assert_eq!(a.open_channel("two").err(), Some(MuxError::Closed));
    }
}
