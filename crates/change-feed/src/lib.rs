//! Change-feed seam for the realtime sync engine.
//!
//! The remote change feed delivers raw payloads per topic at-least-once and
//! without cross-topic ordering. Everything above this crate only sees the
//! [`ChangeFeed`] trait; [`LocalFeed`] is the in-process implementation used by
//! tests and local wiring, with knobs for readiness, disconnects and
//! authorization denials.

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::RwLock;
use thiserror::Error;
use tokio::sync::{broadcast, watch};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeedMessage {
    pub topic: String,
    pub payload: Bytes,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum FeedError {
    #[error("feed transport not ready")]
    NotReady,
    #[error("not authorized for topic {0}")]
    Unauthorized(String),
    #[error("feed channel closed")]
    Closed,
    #[error("feed transport error: {0}")]
    Transport(String),
}

impl FeedError {
    /// Transient errors are retried by the caller; everything else is terminal.
    pub fn is_transient(&self) -> bool {
        !matches!(self, FeedError::Unauthorized(_))
    }
}

pub type FeedResult<T> = Result<T, FeedError>;

#[async_trait]
pub trait ChangeFeed: Send + Sync {
    /// Resolves once the transport can accept subscriptions.
    async fn ready(&self) {}

    /// Opens a subscription. The receiver reports `Closed` when the transport
    /// drops the topic, which callers treat as a disconnect.
    async fn subscribe(&self, topic: &str) -> FeedResult<broadcast::Receiver<FeedMessage>>;

    fn publish(&self, topic: &str, payload: Bytes) -> FeedResult<()>;
}

/// Simple in-memory feed for tests and non-networked contexts.
pub struct LocalFeed {
    topics: RwLock<HashMap<String, broadcast::Sender<FeedMessage>>>,
    denied: RwLock<HashSet<String>>,
    opens: RwLock<HashMap<String, usize>>,
    ready: watch::Sender<bool>,
    capacity: usize,
}

impl Default for LocalFeed {
    fn default() -> Self {
        Self::with_capacity(64)
    }
}

impl LocalFeed {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (ready, _) = watch::channel(true);
        Self {
            topics: RwLock::new(HashMap::new()),
            denied: RwLock::new(HashSet::new()),
            opens: RwLock::new(HashMap::new()),
            ready,
            capacity: capacity.max(1),
        }
    }

    /// A feed whose transport has not connected yet.
    pub fn not_ready() -> Self {
        let feed = Self::default();
        feed.set_ready(false);
        feed
    }

    pub fn set_ready(&self, ready: bool) {
        self.ready.send_replace(ready);
    }

    pub fn is_ready(&self) -> bool {
        *self.ready.borrow()
    }

    /// Future subscriptions and publishes on `topic` fail as unauthorized.
    pub fn deny(&self, topic: &str) {
        self.denied.write().insert(topic.to_string());
    }

    pub fn allow(&self, topic: &str) {
        self.denied.write().remove(topic);
    }

    /// Drops the topic; every live receiver observes `Closed`.
    pub fn disconnect(&self, topic: &str) {
        self.topics.write().remove(topic);
    }

    pub fn disconnect_all(&self) {
        self.topics.write().clear();
    }

    /// Number of receivers currently attached to `topic`.
    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.topics
            .read()
            .get(topic)
            .map(|sender| sender.receiver_count())
            .unwrap_or(0)
    }

    /// Number of successful `subscribe` calls ever made for `topic`.
    pub fn open_count(&self, topic: &str) -> usize {
        self.opens.read().get(topic).copied().unwrap_or(0)
    }

    fn sender_for(&self, topic: &str) -> broadcast::Sender<FeedMessage> {
        let mut guard = self.topics.write();
        guard
            .entry(topic.to_string())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .clone()
    }

    fn check(&self, topic: &str) -> FeedResult<()> {
        if !self.is_ready() {
            return Err(FeedError::NotReady);
        }
        if self.denied.read().contains(topic) {
            return Err(FeedError::Unauthorized(topic.to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl ChangeFeed for LocalFeed {
    async fn ready(&self) {
        let mut rx = self.ready.subscribe();
        loop {
            let ready = *rx.borrow_and_update();
            if ready {
                return;
            }
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    async fn subscribe(&self, topic: &str) -> FeedResult<broadcast::Receiver<FeedMessage>> {
        self.check(topic)?;
        let receiver = self.sender_for(topic).subscribe();
        *self.opens.write().entry(topic.to_string()).or_insert(0) += 1;
        Ok(receiver)
    }

    fn publish(&self, topic: &str, payload: Bytes) -> FeedResult<()> {
        self.check(topic)?;
        // No listeners is not an error for a fan-out feed.
        let _ = self.sender_for(topic).send(FeedMessage {
            topic: topic.to_string(),
            payload,
        });
        Ok(())
    }
}
