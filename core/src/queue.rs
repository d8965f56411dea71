//! Mailbox queue: single-subscriber buffered hand-off
//!
//! `push` never blocks. While nobody is subscribed, items are buffered in
//! order; once a subscriber attaches, the backlog is drained to it first and
//! later items are handed over directly. Dropping a subscription returns any
//! undelivered items to the front of the buffer, so nothing is lost between
//! consumers.

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;

/// Queue error types
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum QueueError {
    #[error("Queue '{0}' already has a subscriber")]
    AlreadySubscribed(String),
}

struct QueueInner<T> {
    buffer: VecDeque<T>,
    subscriber: Option<mpsc::UnboundedSender<T>>,
}

/// Single-subscriber push/pull queue. Cloning yields another handle to the
/// same queue.
pub struct Queue<T> {
    name: Arc<str>,
    inner: Arc<Mutex<QueueInner<T>>>,
}

impl<T> Clone for Queue<T> {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            inner: self.inner.clone(),
        }
    }
}

impl<T> fmt::Debug for Queue<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("Queue")
            .field("name", &self.name)
            .field("buffered", &inner.buffer.len())
            .field("subscribed", &inner.subscriber.is_some())
            .finish()
    }
}

impl<T: Send + 'static> Queue<T> {
    /// Create an empty queue. The name only shows up in logs and errors.
    pub fn new(name: &str) -> Self {
        Self {
            name: Arc::from(name),
            inner: Arc::new(Mutex::new(QueueInner {
                buffer: VecDeque::new(),
                subscriber: None,
            })),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Push an item: hand it to the subscriber, or buffer it.
    pub fn push(&self, item: T) {
        let mut inner = self.inner.lock();
        let item = match inner.subscriber.as_ref() {
            Some(tx) => match tx.send(item) {
                Ok(()) => return,
                // Receiver went away without unsubscribing
                Err(mpsc::error::SendError(item)) => item,
            },
            None => item,
        };
        inner.subscriber = None;
        inner.buffer.push_back(item);
    }

    /// Attach the single subscriber. The backlog is delivered first, in order.
    pub fn subscribe(&self) -> Result<Subscription<T>, QueueError> {
        let mut inner = self.inner.lock();
        if let Some(tx) = inner.subscriber.as_ref() {
            if !tx.is_closed() {
                return Err(QueueError::AlreadySubscribed(self.name.to_string()));
            }
        }

        let (tx, rx) = mpsc::unbounded_channel();
        while let Some(item) = inner.buffer.pop_front() {
            // rx is alive, send cannot fail
            let _ = tx.send(item);
        }
        inner.subscriber = Some(tx);

        Ok(Subscription {
            rx: Some(rx),
            inner: self.inner.clone(),
        })
    }

    /// Wait for the next item without keeping a subscription around.
    pub async fn first(&self) -> Result<T, QueueError> {
        let mut sub = self.subscribe()?;
        match sub.recv().await {
            Some(item) => Ok(item),
            // The queue holds the sender, so this branch is unreachable
            None => std::future::pending().await,
        }
    }

    /// Number of buffered items (always zero while subscribed).
    pub fn len(&self) -> usize {
        self.inner.lock().buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_subscribed(&self) -> bool {
        self.inner
            .lock()
            .subscriber
            .as_ref()
            .map(|tx| !tx.is_closed())
            .unwrap_or(false)
    }

    /// Drop everything buffered.
    pub fn clear(&self) {
        self.inner.lock().buffer.clear();
    }
}

/// Receiving end of a [`Queue`]. Dropping it unsubscribes.
pub struct Subscription<T> {
    rx: Option<mpsc::UnboundedReceiver<T>>,
    inner: Arc<Mutex<QueueInner<T>>>,
}

impl<T> Subscription<T> {
    /// Receive the next item. Never returns `None` while the queue is alive,
    /// so callers usually loop on it inside a task they abort on shutdown.
    pub async fn recv(&mut self) -> Option<T> {
        match self.rx.as_mut() {
            Some(rx) => rx.recv().await,
            None => None,
        }
    }

    pub fn try_recv(&mut self) -> Option<T> {
        self.rx.as_mut().and_then(|rx| rx.try_recv().ok())
    }
}

impl<T> Drop for Subscription<T> {
    fn drop(&mut self) {
        let Some(mut rx) = self.rx.take() else {
            return;
        };
        let mut inner = self.inner.lock();
        inner.subscriber = None;
        rx.close();

        let mut undelivered = Vec::new();
        while let Ok(item) = rx.try_recv() {
            undelivered.push(item);
        }
        for item in undelivered.into_iter().rev() {
            inner.buffer.push_front(item);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_push_before_subscribe_buffers() {
        let q = Queue::new("test");
        q.push(1);
        q.push(2);
        assert_eq!(q.len(), 2);

        let mut sub = q.subscribe().unwrap();
        assert_eq!(sub.recv().await, Some(1));
        assert_eq!(sub.recv().await, Some(2));
        assert!(q.is_empty());
    }

    #[tokio::test]
    async fn test_backlog_drains_before_direct_handoff() {
        let q = Queue::new("test");
        q.push("a");
        let mut sub = q.subscribe().unwrap();
        q.push("b");
        assert_eq!(sub.recv().await, Some("a"));
        assert_eq!(sub.recv().await, Some("b"));
    }

    #[test]
    fn test_second_subscriber_rejected() {
        let q: Queue<u8> = Queue::new("single");
        let _sub = q.subscribe().unwrap();
        assert_eq!(
            q.subscribe().err(),
            Some(QueueError::AlreadySubscribed("single".to_string()))
        );
    }

    #[test]
    fn test_resubscribe_after_drop() {
        let q: Queue<u8> = Queue::new("test");
        let sub = q.subscribe().unwrap();
        drop(sub);
        assert!(q.subscribe().is_ok());
    }

    #[tokio::test]
    async fn test_undelivered_items_return_to_buffer() {
        let q = Queue::new("test");
        let mut sub = q.subscribe().unwrap();
        q.push(1);
        q.push(2);
        q.push(3);
        assert_eq!(sub.recv().await, Some(1));
        drop(sub);

        assert_eq!(q.len(), 2);
        q.push(4);
        let mut sub = q.subscribe().unwrap();
        assert_eq!(sub.try_recv(), Some(2));
        assert_eq!(sub.try_recv(), Some(3));
        assert_eq!(sub.try_recv(), Some(4));
    }

    #[tokio::test]
    async fn test_first_leaves_rest_buffered() {
        let q = Queue::new("test");
        q.push(10);
        q.push(11);
        assert_eq!(q.first().await.unwrap(), 10);
        assert_eq!(q.len(), 1);
        assert!(!q.is_subscribed());
    }

    #[tokio::test]
    async fn test_first_waits_for_push() {
        let q = Queue::new("test");
        let producer = q.clone();
        let handle = tokio::spawn(async move { q.first().await });
        tokio::task::yield_now().await;
        producer.push(7u32);
        assert_eq!(handle.await.unwrap().unwrap(), 7);
    }
}
