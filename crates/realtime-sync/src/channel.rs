use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use change_feed::{ChangeFeed, FeedError};
use parking_lot::{Mutex, RwLock};
use rand::Rng;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::normalize::{encode_leave, encode_presence};
use crate::{SyncError, SyncResult, TopicKey};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    /// `resumed` is false only for the first successful connect.
    Connected { resumed: bool },
    Message(Bytes),
    Disconnected,
    /// Permanent failure; the handle will not retry.
    Terminal(FeedError),
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Connecting,
    Live,
    Reconnecting,
    Closed,
    Failed,
}

/// Ephemeral per-connection state shared with peers on a thread topic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PresenceState {
    pub typing: bool,
}

static NEXT_HANDLE_ID: AtomicU64 = AtomicU64::new(1);

/// Which handle produced an event. A topic reopened after failure gets a new
/// handle id, so late events of the old handle can be told apart.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ChannelSource {
    pub topic: TopicKey,
    pub handle_id: u64,
}

pub trait EventSink: Send + Sync {
    fn deliver(&self, source: &ChannelSource, event: ChannelEvent);
}

impl<F> EventSink for F
where
    F: Fn(&ChannelSource, ChannelEvent) + Send + Sync,
{
    fn deliver(&self, source: &ChannelSource, event: ChannelEvent) {
        (self)(source, event)
    }
}

/// Exponential backoff with full jitter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    pub base: Duration,
    pub cap: Duration,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(1),
            cap: Duration::from_secs(30),
        }
    }
}

impl Backoff {
    /// Upper bound of the delay for a zero-based attempt.
    pub fn ceiling(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt.min(31)).unwrap_or(u32::MAX);
        self.base.saturating_mul(factor).min(self.cap)
    }

    pub fn delay(&self, attempt: u32) -> Duration {
        let ceiling = self.ceiling(attempt).as_millis() as u64;
        Duration::from_millis(rand::thread_rng().gen_range(0..=ceiling))
    }
}

#[derive(Debug, Clone)]
pub struct ChannelOptions {
    pub connection_id: String,
    pub user_id: Option<String>,
    pub backoff: Backoff,
}

struct ChannelShared {
    topic: TopicKey,
    source: ChannelSource,
    feed: Arc<dyn ChangeFeed>,
    options: ChannelOptions,
    sinks: RwLock<Vec<Arc<dyn EventSink>>>,
    last_published: Mutex<Option<PresenceState>>,
    state: watch::Sender<ChannelState>,
}

impl ChannelShared {
    fn deliver(&self, event: ChannelEvent) {
        let sinks = self.sinks.read().clone();
        for sink in sinks {
            sink.deliver(&self.source, event.clone());
        }
    }

    fn set_state(&self, state: ChannelState) {
        self.state.send_if_modified(|current| {
            if *current == state || *current == ChannelState::Closed {
                return false;
            }
            *current = state;
            true
        });
    }

    fn send_presence(&self, state: PresenceState) -> SyncResult<()> {
        let payload = encode_presence(
            &self.topic,
            &self.options.connection_id,
            self.options.user_id.as_deref(),
            state.typing,
        )?;
        self.feed.publish(self.topic.as_str(), payload)?;
        Ok(())
    }
}

struct ChannelInner {
    shared: Arc<ChannelShared>,
    task: Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl Drop for ChannelInner {
    fn drop(&mut self) {
        if let Some(task) = self.task.get_mut().take() {
            task.abort();
        }
    }
}

/// One logical subscription to a topic. Cloning shares the subscription.
#[derive(Clone)]
pub struct ChannelHandle {
    inner: Arc<ChannelInner>,
}

impl ChannelHandle {
    /// Starts connecting in the background; never fails for a transport that
    /// is not ready yet. Sinks added later with [`ChannelHandle::on_event`]
    /// only see subsequent events.
    pub fn open(topic: TopicKey, feed: Arc<dyn ChangeFeed>, options: ChannelOptions) -> Self {
        Self::open_with(topic, feed, options, Vec::new())
    }

    pub fn open_with(
        topic: TopicKey,
        feed: Arc<dyn ChangeFeed>,
        options: ChannelOptions,
        sinks: Vec<Arc<dyn EventSink>>,
    ) -> Self {
        let (state, _) = watch::channel(ChannelState::Connecting);
        let source = ChannelSource {
            topic: topic.clone(),
            handle_id: NEXT_HANDLE_ID.fetch_add(1, Ordering::Relaxed),
        };
        let shared = Arc::new(ChannelShared {
            topic,
            source,
            feed,
            options,
            sinks: RwLock::new(sinks),
            last_published: Mutex::new(None),
            state,
        });
        let task = tokio::spawn(run(Arc::clone(&shared)));
        Self {
            inner: Arc::new(ChannelInner {
                shared,
                task: Mutex::new(Some(task)),
                closed: AtomicBool::new(false),
            }),
        }
    }

    pub fn topic(&self) -> &TopicKey {
        &self.inner.shared.topic
    }

    /// Unique per opened handle; clones share it.
    pub fn id(&self) -> u64 {
        self.inner.shared.source.handle_id
    }

    pub fn on_event<S: EventSink + 'static>(&self, sink: S) {
        self.inner.shared.sinks.write().push(Arc::new(sink));
    }

    pub fn state(&self) -> ChannelState {
        *self.inner.shared.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<ChannelState> {
        self.inner.shared.state.subscribe()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Publishes ephemeral state now if connected, and again after every
    /// reconnect until replaced.
    pub fn publish(&self, state: PresenceState) -> SyncResult<()> {
        if self.is_closed() {
            return Err(SyncError::ChannelClosed(self.topic().clone()));
        }
        *self.inner.shared.last_published.lock() = Some(state);
        if self.state() != ChannelState::Live {
            debug!(
                target: "sync.channel",
                topic = %self.topic(),
                "queued presence until connected"
            );
            return Ok(());
        }
        match self.inner.shared.send_presence(state) {
            Ok(()) => Ok(()),
            Err(SyncError::Feed(err)) if err.is_transient() => {
                debug!(
                    target: "sync.channel",
                    topic = %self.topic(),
                    error = %err,
                    "presence publish deferred to reconnect"
                );
                Ok(())
            }
            Err(err) => Err(err),
        }
    }

    /// Idempotent; aborts the connection task and any pending reconnect timer.
    pub fn close(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let shared = &self.inner.shared;
        if let Some(task) = self.inner.task.lock().take() {
            task.abort();
        }

        let had_presence = shared.last_published.lock().take().is_some();
        if had_presence && *shared.state.borrow() == ChannelState::Live {
            let leave = encode_leave(&shared.topic, &shared.options.connection_id);
            match leave {
                Ok(payload) => {
                    if let Err(err) = shared.feed.publish(shared.topic.as_str(), payload) {
                        debug!(target: "sync.channel", topic = %shared.topic, error = %err, "leave not delivered");
                    }
                }
                Err(err) => {
                    warn!(target: "sync.channel", topic = %shared.topic, error = %err, "failed to encode leave")
                }
            }
        }

        shared.set_state(ChannelState::Closed);
        shared.deliver(ChannelEvent::Closed);
        info!(target: "sync.channel", topic = %shared.topic, "channel closed");
    }
}

async fn run(shared: Arc<ChannelShared>) {
    let topic = shared.topic.clone();
    let mut attempt: u32 = 0;
    let mut connected_before = false;

    loop {
        shared.feed.ready().await;
        match shared.feed.subscribe(topic.as_str()).await {
            Ok(mut rx) => {
                attempt = 0;
                shared.set_state(ChannelState::Live);
                info!(target: "sync.channel", %topic, resumed = connected_before, "channel live");
                shared.deliver(ChannelEvent::Connected {
                    resumed: connected_before,
                });
                connected_before = true;

                let last = *shared.last_published.lock();
                if let Some(state) = last {
                    if let Err(err) = shared.send_presence(state) {
                        warn!(target: "sync.channel", %topic, error = %err, "failed to restore presence");
                    }
                }

                loop {
                    match rx.recv().await {
                        Ok(msg) => shared.deliver(ChannelEvent::Message(msg.payload)),
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            // Missed events: force the collection through a resync.
                            warn!(target: "sync.channel", %topic, skipped, "channel lagged");
                            shared.deliver(ChannelEvent::Disconnected);
                            shared.deliver(ChannelEvent::Connected { resumed: true });
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }

                shared.set_state(ChannelState::Reconnecting);
                warn!(target: "sync.channel", %topic, "channel disconnected");
                shared.deliver(ChannelEvent::Disconnected);
            }
            Err(err) if !err.is_transient() => {
                error!(target: "sync.channel", %topic, error = %err, "channel failed permanently");
                shared.set_state(ChannelState::Failed);
                shared.deliver(ChannelEvent::Terminal(err));
                return;
            }
            Err(err) => {
                debug!(target: "sync.channel", %topic, error = %err, attempt, "connect attempt failed");
                if connected_before {
                    shared.set_state(ChannelState::Reconnecting);
                }
            }
        }

        let delay = shared.options.backoff.delay(attempt);
        attempt = attempt.saturating_add(1);
        tokio::time::sleep(delay).await;
    }
}
