//! Process-wide registry of channel handles.
//!
//! Consumers `ensure` a topic and `release` it when done. The registry keeps
//! exactly one handle per topic, reference-counts consumers and closes a
//! handle only after its count has stayed at zero for the grace window.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use change_feed::ChangeFeed;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::channel::{ChannelHandle, ChannelOptions, ChannelState, EventSink};
use crate::{SyncError, SyncResult, TopicKey};

struct Slot {
    handle: ChannelHandle,
    refs: usize,
    generation: u64,
    pending_close: Option<JoinHandle<()>>,
}

struct ManagerInner {
    feed: Arc<dyn ChangeFeed>,
    options: ChannelOptions,
    grace: Duration,
    sink: Option<Arc<dyn EventSink>>,
    slots: Mutex<HashMap<TopicKey, Slot>>,
    shut_down: AtomicBool,
}

impl ManagerInner {
    fn open(&self, topic: &TopicKey) -> ChannelHandle {
        let sinks = self.sink.iter().cloned().collect();
        ChannelHandle::open_with(topic.clone(), Arc::clone(&self.feed), self.options.clone(), sinks)
    }

    fn finish_close(&self, topic: &TopicKey, generation: u64) {
        let mut slots = self.slots.lock();
        let due = slots
            .get(topic)
            .map(|slot| slot.refs == 0 && slot.generation == generation)
            .unwrap_or(false);
        if !due {
            return;
        }
        let removed = slots.remove(topic);
        drop(slots);
        if let Some(slot) = removed {
            slot.handle.close();
            info!(target: "sync.manager", %topic, "released topic closed");
        }
    }

    fn sweep(&self) -> usize {
        let drained: Vec<Slot> = self.slots.lock().drain().map(|(_, slot)| slot).collect();
        let count = drained.len();
        for slot in drained {
            if let Some(timer) = slot.pending_close {
                timer.abort();
            }
            slot.handle.close();
        }
        count
    }
}

impl Drop for ManagerInner {
    fn drop(&mut self) {
        let closed = self.sweep();
        if closed > 0 {
            warn!(target: "sync.manager", closed, "subscription manager dropped with open channels");
        }
    }
}

#[derive(Clone)]
pub struct SubscriptionManager {
    inner: Arc<ManagerInner>,
}

impl SubscriptionManager {
    /// `sink`, if given, is attached to every handle this manager opens.
    pub fn new(
        feed: Arc<dyn ChangeFeed>,
        options: ChannelOptions,
        grace: Duration,
        sink: Option<Arc<dyn EventSink>>,
    ) -> Self {
        Self {
            inner: Arc::new(ManagerInner {
                feed,
                options,
                grace,
                sink,
                slots: Mutex::new(HashMap::new()),
                shut_down: AtomicBool::new(false),
            }),
        }
    }

    /// Returns the live handle for `topic`, opening it on first use. A topic
    /// that failed permanently is reopened here.
    pub fn ensure(&self, topic: &TopicKey) -> SyncResult<ChannelHandle> {
        if self.inner.shut_down.load(Ordering::SeqCst) {
            return Err(SyncError::ShutDown);
        }
        let mut slots = self.inner.slots.lock();
        if let Some(slot) = slots.get_mut(topic) {
            if let Some(timer) = slot.pending_close.take() {
                timer.abort();
                slot.generation += 1;
                debug!(target: "sync.manager", %topic, "release cancelled within grace window");
            }
            if slot.handle.state() == ChannelState::Failed {
                info!(target: "sync.manager", %topic, "reopening failed topic");
                slot.handle.close();
                slot.handle = self.inner.open(topic);
                slot.generation += 1;
            }
            slot.refs += 1;
            return Ok(slot.handle.clone());
        }

        let handle = self.inner.open(topic);
        slots.insert(
            topic.clone(),
            Slot {
                handle: handle.clone(),
                refs: 1,
                generation: 0,
                pending_close: None,
            },
        );
        info!(target: "sync.manager", %topic, "opened topic");
        Ok(handle)
    }

    /// Drops one reference; the last one schedules the close.
    pub fn release(&self, topic: &TopicKey) {
        let mut slots = self.inner.slots.lock();
        let Some(slot) = slots.get_mut(topic) else {
            debug!(target: "sync.manager", %topic, "release for unknown topic");
            return;
        };
        if slot.refs == 0 {
            debug!(target: "sync.manager", %topic, "release with no outstanding references");
            return;
        }
        slot.refs -= 1;
        if slot.refs > 0 || slot.pending_close.is_some() {
            return;
        }

        slot.generation += 1;
        let generation = slot.generation;
        if self.inner.grace.is_zero() {
            drop(slots);
            self.inner.finish_close(topic, generation);
            return;
        }

        let weak: Weak<ManagerInner> = Arc::downgrade(&self.inner);
        let grace = self.inner.grace;
        let key = topic.clone();
        slot.pending_close = Some(tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            if let Some(inner) = weak.upgrade() {
                inner.finish_close(&key, generation);
            }
        }));
    }

    /// Current handle without taking a reference.
    pub fn handle(&self, topic: &TopicKey) -> Option<ChannelHandle> {
        self.inner
            .slots
            .lock()
            .get(topic)
            .map(|slot| slot.handle.clone())
    }

    pub fn ref_count(&self, topic: &TopicKey) -> usize {
        self.inner
            .slots
            .lock()
            .get(topic)
            .map(|slot| slot.refs)
            .unwrap_or(0)
    }

    pub fn is_failed(&self, topic: &TopicKey) -> bool {
        self.handle(topic)
            .map(|handle| handle.state() == ChannelState::Failed)
            .unwrap_or(false)
    }

    pub fn open_topics(&self) -> Vec<TopicKey> {
        let mut topics: Vec<TopicKey> = self.inner.slots.lock().keys().cloned().collect();
        topics.sort();
        topics
    }

    /// Closes every handle regardless of outstanding references.
    pub fn shutdown(&self) {
        if self.inner.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }
        let closed = self.inner.sweep();
        info!(target: "sync.manager", closed, "subscription manager shut down");
    }
}
