//! The sync engine: owns the subscription manager and drains channel events
//! into collections, presence and pending writes from a single task.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use change_feed::ChangeFeed;
use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use crate::channel::{
    Backoff, ChannelEvent, ChannelOptions, ChannelSource, ChannelState, EventSink, PresenceState,
};
use crate::manager::SubscriptionManager;
use crate::normalize::{normalize, Inbound, PresenceSignal};
use crate::optimistic::{Mutation, PendingWrite, WriteCoordinator};
use crate::presence::{PresenceAggregator, PresenceRecord, TypingState};
use crate::reconciler::{Collection, Collections, SyncState};
use crate::store::{QuerySpec, RemoteStore, StoreError};
use crate::{
    ChangeEvent, CorrelationId, EntityRow, Notice, Operation, SyncConfig, SyncError, SyncResult,
    TopicKey,
};

const NOTICE_CAPACITY: usize = 256;

enum EngineCommand {
    Channel {
        source: ChannelSource,
        event: ChannelEvent,
    },
    Snapshot {
        topic: TopicKey,
        epoch: u64,
        result: Result<Vec<EntityRow>, StoreError>,
    },
    Resync {
        topic: TopicKey,
    },
    Tick,
}

struct EngineShared {
    manager: SubscriptionManager,
    collections: Collections,
    presence: Mutex<PresenceAggregator>,
    writes: WriteCoordinator,
    store: Arc<dyn RemoteStore>,
    notices: broadcast::Sender<Notice>,
    backoff: Backoff,
    /// Threads the local user is currently typing in.
    typing: Mutex<HashSet<String>>,
}

pub struct SyncEngine {
    shared: Arc<EngineShared>,
    connection_id: String,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    shut_down: AtomicBool,
}

impl SyncEngine {
    /// Spawns the drain and ticker tasks. Must be called inside a tokio runtime.
    pub fn start(config: SyncConfig, feed: Arc<dyn ChangeFeed>, store: Arc<dyn RemoteStore>) -> Self {
        let connection_id = Uuid::new_v4().to_string();
        let (tx, rx) = mpsc::unbounded_channel();

        let sink_tx = tx.clone();
        let sink = move |source: &ChannelSource, event: ChannelEvent| {
            let _ = sink_tx.send(EngineCommand::Channel {
                source: source.clone(),
                event,
            });
        };
        let backoff = Backoff {
            base: config.backoff_base,
            cap: config.backoff_cap,
        };
        let options = ChannelOptions {
            connection_id: connection_id.clone(),
            user_id: config.user_id.clone(),
            backoff,
        };
        let sink: Arc<dyn EventSink> = Arc::new(sink);
        let manager = SubscriptionManager::new(feed, options, config.release_grace, Some(sink));

        let collections = Collections::new(config.clock_skew_allowance);
        let (notices, _) = broadcast::channel(NOTICE_CAPACITY);
        let writes = WriteCoordinator::new(
            collections.clone(),
            Arc::clone(&store),
            notices.clone(),
            config.write_timeout,
        );
        let shared = Arc::new(EngineShared {
            manager,
            collections,
            presence: Mutex::new(PresenceAggregator::new(
                connection_id.clone(),
                config.presence_silence,
            )),
            writes,
            store,
            notices,
            backoff,
            typing: Mutex::new(HashSet::new()),
        });

        let drain = Drain {
            shared: Arc::clone(&shared),
            tx: tx.clone(),
            resync_attempts: HashMap::new(),
        };
        let tasks = vec![
            tokio::spawn(drain.run(rx)),
            tokio::spawn(tick_loop(Arc::clone(&shared), tx, config.clone())),
        ];
        info!(target: "sync.engine", connection = %connection_id, "sync engine started");

        Self {
            shared,
            connection_id,
            tasks: Mutex::new(tasks),
            shut_down: AtomicBool::new(false),
        }
    }

    pub fn connection_id(&self) -> &str {
        &self.connection_id
    }

    /// Subscribes to `topic` and returns the collection it feeds. Every call
    /// must eventually be paired with [`SyncEngine::untrack`].
    pub fn track(&self, topic: &TopicKey) -> SyncResult<Collection> {
        self.ensure_running()?;
        if topic.table().is_none() {
            return Err(SyncError::UnknownTopic(topic.clone()));
        }
        // The handle must exist before the collection is looked up, otherwise a
        // queued close of the previous handle could drop the collection we return.
        self.shared.manager.ensure(topic)?;
        Ok(self.shared.collections.get_or_create(topic))
    }

    pub fn untrack(&self, topic: &TopicKey) {
        self.shared.manager.release(topic);
    }

    pub fn collection(&self, topic: &TopicKey) -> Option<Collection> {
        self.shared.collections.get(topic)
    }

    pub fn open_topics(&self) -> Vec<TopicKey> {
        self.shared.manager.open_topics()
    }

    pub fn channel_state(&self, topic: &TopicKey) -> Option<ChannelState> {
        self.shared.manager.handle(topic).map(|handle| handle.state())
    }

    /// "Someone else is typing" for a thread.
    pub fn presence(&self, thread_id: &str) -> watch::Receiver<bool> {
        self.shared.presence.lock().subscribe(thread_id)
    }

    pub fn set_typing(&self, thread_id: &str, typing: bool) -> SyncResult<()> {
        self.ensure_running()?;
        let topic = TopicKey::thread(thread_id);
        let handle = self
            .shared
            .manager
            .handle(&topic)
            .ok_or_else(|| SyncError::NotTracked(topic.clone()))?;
        {
            let mut threads = self.shared.typing.lock();
            if typing {
                threads.insert(thread_id.to_string());
            } else {
                threads.remove(thread_id);
            }
        }
        handle.publish(PresenceState { typing })
    }

    /// Shows the mutation immediately; confirmation arrives on the feed.
    pub fn begin(&self, mutation: Mutation) -> SyncResult<CorrelationId> {
        self.ensure_running()?;
        Ok(self.shared.writes.begin(mutation))
    }

    pub fn cancel(&self, correlation_id: CorrelationId) -> bool {
        self.shared.writes.cancel(correlation_id)
    }

    pub async fn submit(&self, mutation: Mutation) -> SyncResult<CorrelationId> {
        self.ensure_running()?;
        self.shared.writes.submit(mutation).await
    }

    pub fn pending_writes(&self) -> Vec<PendingWrite> {
        self.shared.writes.pending()
    }

    pub fn notices(&self) -> broadcast::Receiver<Notice> {
        self.shared.notices.subscribe()
    }

    /// Closes every channel and stops background work. Idempotent.
    pub fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        self.shared.manager.shutdown();
        self.shared.writes.shutdown();
        info!(target: "sync.engine", connection = %self.connection_id, "sync engine stopped");
    }

    fn ensure_running(&self) -> SyncResult<()> {
        if self.shut_down.load(Ordering::SeqCst) {
            return Err(SyncError::ShutDown);
        }
        Ok(())
    }
}

impl Drop for SyncEngine {
    fn drop(&mut self) {
        self.shutdown();
    }
}

struct Drain {
    shared: Arc<EngineShared>,
    tx: mpsc::UnboundedSender<EngineCommand>,
    resync_attempts: HashMap<TopicKey, u32>,
}

impl Drain {
    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<EngineCommand>) {
        while let Some(command) = rx.recv().await {
            match command {
                EngineCommand::Channel { source, event } => self.on_channel(source, event),
                EngineCommand::Snapshot {
                    topic,
                    epoch,
                    result,
                } => self.on_snapshot(topic, epoch, result),
                EngineCommand::Resync { topic } => self.on_resync(topic),
                EngineCommand::Tick => self.on_tick(),
            }
        }
        debug!(target: "sync.engine", "engine queue closed");
    }

    fn on_tick(&self) {
        self.shared.presence.lock().tick(Instant::now());
    }

    /// Events from a handle the manager no longer holds for the topic are
    /// dropped, except the ones that only degrade state after a final close.
    fn is_current(&self, source: &ChannelSource, event: &ChannelEvent) -> bool {
        match self.shared.manager.handle(&source.topic) {
            Some(handle) => handle.id() == source.handle_id,
            None => matches!(
                event,
                ChannelEvent::Closed | ChannelEvent::Disconnected | ChannelEvent::Terminal(_)
            ),
        }
    }

    fn on_channel(&mut self, source: ChannelSource, event: ChannelEvent) {
        if !self.is_current(&source, &event) {
            trace!(
                target: "sync.engine",
                topic = %source.topic,
                handle = source.handle_id,
                "dropping event from superseded handle"
            );
            return;
        }
        let topic = source.topic;
        match event {
            ChannelEvent::Message(bytes) => match normalize(&bytes) {
                Some(Inbound::Change(change)) => self.on_change(&topic, change),
                Some(Inbound::Presence(signal)) => self.on_presence(&topic, signal),
                None => {}
            },
            ChannelEvent::Connected { resumed } => {
                debug!(target: "sync.engine", %topic, resumed, "channel connected");
                self.resync_attempts.remove(&topic);
                self.start_sync(&topic);
            }
            ChannelEvent::Disconnected => self.go_stale(&topic),
            ChannelEvent::Closed => {
                self.go_stale(&topic);
                if self.shared.manager.handle(&topic).is_none() {
                    self.forget(&topic);
                }
            }
            ChannelEvent::Terminal(err) => {
                self.go_stale(&topic);
                warn!(target: "sync.engine", %topic, error = %err, "topic failed");
                let _ = self.shared.notices.send(Notice::TopicFailed {
                    topic,
                    reason: err.to_string(),
                });
            }
        }
    }

    fn on_change(&self, topic: &TopicKey, change: ChangeEvent) {
        if topic.table() != Some(change.table.as_str()) {
            debug!(
                target: "sync.engine",
                %topic,
                table = %change.table,
                "change for a table this topic does not carry"
            );
            return;
        }
        let Some(collection) = self.shared.collections.get(topic) else {
            trace!(target: "sync.engine", %topic, "change for untracked topic");
            return;
        };
        let operation = change.operation;
        let report = collection.with(|reconciler| reconciler.apply(change));
        if !report.retired.is_empty() {
            self.shared.writes.settle(&report.retired, operation);
        }
    }

    fn on_presence(&self, topic: &TopicKey, signal: PresenceSignal) {
        let now = Instant::now();
        let mut presence = self.shared.presence.lock();
        match signal {
            PresenceSignal::Update {
                thread_id,
                connection_id,
                user_id,
                typing,
            } => {
                let state = if typing {
                    TypingState::Typing { since: now }
                } else {
                    TypingState::Idle
                };
                presence.record(PresenceRecord {
                    connection_id,
                    thread_id,
                    user_id,
                    state,
                    last_seen_at: now,
                });
            }
            PresenceSignal::Leave {
                thread_id,
                connection_id,
            } => {
                trace!(target: "sync.engine", %topic, thread = %thread_id, "presence leave");
                presence.leave(&connection_id, &thread_id, now);
            }
        }
    }

    fn go_stale(&self, topic: &TopicKey) {
        if let Some(collection) = self.shared.collections.get(topic) {
            collection.with(|reconciler| reconciler.mark_stale());
        }
        if let Some(thread_id) = topic.thread_id() {
            self.shared
                .presence
                .lock()
                .clear_thread(thread_id, Instant::now());
        }
    }

    /// Drops per-topic state once nothing holds the topic open. A collection
    /// with writes still in flight is kept so their rollback has a target.
    fn forget(&mut self, topic: &TopicKey) {
        self.resync_attempts.remove(topic);
        if self.shared.writes.has_pending(topic) {
            debug!(target: "sync.engine", %topic, "keeping closed collection with pending writes");
            return;
        }
        self.shared.collections.remove(topic);
    }

    fn start_sync(&self, topic: &TopicKey) {
        let Some(query) = QuerySpec::for_topic(topic) else {
            return;
        };
        let collection = self.shared.collections.get_or_create(topic);
        let epoch = collection.with(|reconciler| reconciler.begin_sync());
        let store = Arc::clone(&self.shared.store);
        let tx = self.tx.clone();
        let topic = topic.clone();
        tokio::spawn(async move {
            let result = store.query(&query).await;
            let _ = tx.send(EngineCommand::Snapshot {
                topic,
                epoch,
                result,
            });
        });
    }

    fn on_snapshot(
        &mut self,
        topic: TopicKey,
        epoch: u64,
        result: Result<Vec<EntityRow>, StoreError>,
    ) {
        let Some(collection) = self.shared.collections.get(&topic) else {
            return;
        };
        match result {
            Ok(rows) => {
                self.resync_attempts.remove(&topic);
                let report = collection.with(|reconciler| reconciler.complete_sync(epoch, rows));
                // Rows in the snapshot confirm writes the same way an insert does.
                self.shared.writes.settle(&report.confirmed, Operation::Insert);
                self.shared.writes.settle(&report.deleted, Operation::Delete);
            }
            Err(err) => {
                collection.with(|reconciler| reconciler.fail_sync(epoch));
                let attempt = self.resync_attempts.entry(topic.clone()).or_insert(0);
                let delay = self.shared.backoff.delay(*attempt);
                *attempt = attempt.saturating_add(1);
                warn!(
                    target: "sync.engine",
                    %topic,
                    error = %err,
                    retry_in_ms = delay.as_millis() as u64,
                    "bulk fetch failed"
                );
                let tx = self.tx.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    let _ = tx.send(EngineCommand::Resync { topic });
                });
            }
        }
    }

    fn on_resync(&self, topic: TopicKey) {
        let live = self
            .shared
            .manager
            .handle(&topic)
            .map(|handle| handle.state() == ChannelState::Live)
            .unwrap_or(false);
        let stale = self
            .shared
            .collections
            .get(&topic)
            .map(|collection| collection.state() == SyncState::Stale)
            .unwrap_or(false);
        if live && stale {
            self.start_sync(&topic);
        }
    }
}

/// Drives presence expiry and re-announces local typing so peers keep it alive.
async fn tick_loop(
    shared: Arc<EngineShared>,
    tx: mpsc::UnboundedSender<EngineCommand>,
    config: SyncConfig,
) {
    let mut presence_tick = tokio::time::interval(config.presence_tick);
    presence_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut heartbeat = tokio::time::interval(config.typing_heartbeat);
    heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = presence_tick.tick() => {
                if tx.send(EngineCommand::Tick).is_err() {
                    return;
                }
            }
            _ = heartbeat.tick() => {
                let threads: Vec<String> = shared.typing.lock().iter().cloned().collect();
                for thread_id in threads {
                    let topic = TopicKey::thread(&thread_id);
                    let handle = shared.manager.handle(&topic);
                    let sent = handle
                        .map(|handle| handle.publish(PresenceState { typing: true }).is_ok())
                        .unwrap_or(false);
                    if !sent {
                        shared.typing.lock().remove(&thread_id);
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryStore;
    use change_feed::LocalFeed;
    use std::time::Duration;

    async fn until(mut check: impl FnMut() -> bool) {
        for _ in 0..500 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached");
    }

    #[tokio::test(start_paused = true)]
    async fn track_rejects_topics_without_a_table() {
        let feed = Arc::new(LocalFeed::new());
        let engine = SyncEngine::start(SyncConfig::default(), feed, InMemoryStore::new());
        assert!(matches!(
            engine.track(&TopicKey::new("lobby")),
            Err(SyncError::UnknownTopic(_))
        ));
        assert!(engine.open_topics().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn tracked_collection_goes_live_with_snapshot() {
        let feed = Arc::new(LocalFeed::new());
        let store = InMemoryStore::new();
        store
            .seed("quotes", "q1", serde_json::json!({"id": "q1"}))
            .await;
        let engine = SyncEngine::start(SyncConfig::default(), feed, store);
        let collection = engine.track(&TopicKey::entity("quotes")).unwrap();
        until(|| collection.state() == SyncState::Live).await;
        assert!(collection.get("q1").is_some());
        assert_eq!(
            engine.channel_state(&TopicKey::entity("quotes")),
            Some(ChannelState::Live)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn set_typing_requires_tracked_thread() {
        let feed = Arc::new(LocalFeed::new());
        let engine = SyncEngine::start(SyncConfig::default(), feed, InMemoryStore::new());
        assert!(matches!(
            engine.set_typing("9", true),
            Err(SyncError::NotTracked(_))
        ));
    }

    struct FlakyQueries {
        inner: Arc<InMemoryStore>,
        failures: Mutex<u32>,
    }

    #[async_trait::async_trait]
    impl RemoteStore for FlakyQueries {
        async fn insert(&self, table: &str, id: &crate::EntityId, payload: serde_json::Value) -> Result<EntityRow, StoreError> {
            self.inner.insert(table, id, payload).await
        }

        async fn update(&self, table: &str, id: &crate::EntityId, payload: serde_json::Value) -> Result<EntityRow, StoreError> {
            self.inner.update(table, id, payload).await
        }

        async fn delete(&self, table: &str, id: &crate::EntityId) -> Result<(), StoreError> {
            self.inner.delete(table, id).await
        }

        async fn query(&self, query: &QuerySpec) -> Result<Vec<EntityRow>, StoreError> {
            {
                let mut failures = self.failures.lock();
                if *failures > 0 {
                    *failures -= 1;
                    return Err(StoreError::Unavailable("query refused".into()));
                }
            }
            self.inner.query(query).await
        }
    }

    #[tokio::test(start_paused = true)]
    async fn failed_snapshot_retries_until_live() {
        let feed = Arc::new(LocalFeed::new());
        let inner = InMemoryStore::new();
        inner.seed("quotes", "q1", serde_json::json!({"id": "q1"})).await;
        let store = Arc::new(FlakyQueries {
            inner,
            failures: Mutex::new(2),
        });
        let config = SyncConfig {
            backoff_base: Duration::from_millis(20),
            backoff_cap: Duration::from_millis(100),
            ..SyncConfig::default()
        };
        let engine = SyncEngine::start(config, feed, store.clone());

        let collection = engine.track(&TopicKey::entity("quotes")).unwrap();
        until(|| collection.state() == SyncState::Live).await;
        assert!(collection.get("q1").is_some());
        assert_eq!(*store.failures.lock(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_closes_channels_and_refuses_work() {
        let feed = Arc::new(LocalFeed::new());
        let engine = SyncEngine::start(SyncConfig::default(), feed.clone(), InMemoryStore::new());
        let collection = engine.track(&TopicKey::entity("quotes")).unwrap();
        until(|| collection.state() == SyncState::Live).await;

        engine.shutdown();
        engine.shutdown();
        assert!(engine.open_topics().is_empty());
        assert!(matches!(
            engine.track(&TopicKey::entity("quotes")),
            Err(SyncError::ShutDown)
        ));
        until(|| feed.subscriber_count("entity:quotes") == 0).await;
    }

    fn quote_change(id: &str, total: i64) -> ChannelEvent {
        let event = ChangeEvent {
            topic: TopicKey::entity("quotes"),
            table: "quotes".into(),
            operation: Operation::Insert,
            entity_id: id.into(),
            payload: serde_json::json!({"id": id, "total": total}),
            server_timestamp: chrono::Utc::now(),
        };
        ChannelEvent::Message(crate::normalize::encode_change(&event).unwrap())
    }

    #[tokio::test(start_paused = true)]
    async fn events_from_superseded_handle_are_dropped() {
        let feed = Arc::new(LocalFeed::new());
        let engine = SyncEngine::start(SyncConfig::default(), feed, InMemoryStore::new());
        let topic = TopicKey::entity("quotes");
        let collection = engine.track(&topic).unwrap();
        until(|| collection.state() == SyncState::Live).await;

        let (tx, _rx) = mpsc::unbounded_channel();
        let mut drain = Drain {
            shared: Arc::clone(&engine.shared),
            tx,
            resync_attempts: HashMap::new(),
        };
        let current = engine.shared.manager.handle(&topic).unwrap().id();
        let stale = ChannelSource {
            topic: topic.clone(),
            handle_id: current + 1000,
        };

        drain.on_channel(stale.clone(), ChannelEvent::Closed);
        drain.on_channel(stale.clone(), ChannelEvent::Disconnected);
        drain.on_channel(stale.clone(), quote_change("q1", 1));
        assert_eq!(collection.state(), SyncState::Live);
        assert!(collection.get("q1").is_none());
        assert!(engine.collection(&topic).is_some());

        let live = ChannelSource {
            topic: topic.clone(),
            handle_id: current,
        };
        drain.on_channel(live, quote_change("q1", 2));
        assert_eq!(collection.get("q1").unwrap()["total"], 2);
    }

    #[tokio::test(start_paused = true)]
    async fn released_topic_drops_its_collection() {
        let feed = Arc::new(LocalFeed::new());
        let config = SyncConfig {
            release_grace: Duration::from_millis(100),
            ..SyncConfig::default()
        };
        let engine = SyncEngine::start(config, feed, InMemoryStore::new());
        let topics: Vec<TopicKey> = (0..5).map(|n| TopicKey::entity(&format!("t{n}"))).collect();
        for topic in &topics {
            let collection = engine.track(topic).unwrap();
            until(|| collection.state() == SyncState::Live).await;
        }
        assert_eq!(engine.shared.collections.topics().len(), 5);

        for topic in &topics {
            engine.untrack(topic);
        }
        until(|| engine.shared.collections.topics().is_empty()).await;
        assert!(engine.open_topics().is_empty());

        let again = engine.track(&topics[0]).unwrap();
        until(|| again.state() == SyncState::Live).await;
        assert_eq!(engine.shared.collections.topics(), vec![topics[0].clone()]);
    }

    #[tokio::test(start_paused = true)]
    async fn closed_topic_with_pending_write_keeps_collection() {
        let feed = Arc::new(LocalFeed::new());
        let config = SyncConfig {
            release_grace: Duration::from_millis(100),
            ..SyncConfig::default()
        };
        let engine = SyncEngine::start(config, feed, InMemoryStore::new());
        let topic = TopicKey::entity("quotes");
        let collection = engine.track(&topic).unwrap();
        until(|| collection.state() == SyncState::Live).await;
        engine
            .begin(Mutation::insert(topic.clone(), "q1", serde_json::json!({"id": "q1"})))
            .unwrap();

        engine.untrack(&topic);
        until(|| engine.open_topics().is_empty()).await;
        until(|| collection.state() == SyncState::Stale).await;
        assert!(engine.collection(&topic).is_some());
        assert!(collection.is_pending("q1"));
    }
}
