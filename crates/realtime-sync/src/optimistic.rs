//! Optimistic writes: provisional entries, correlation and retirement.

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::reconciler::Collections;
use crate::store::RemoteStore;
use crate::{
    CorrelationId, EntityId, Notice, Operation, SyncError, SyncResult, TopicKey, WriteNotice,
    WriteOutcome,
};

#[derive(Debug, Clone, PartialEq)]
pub struct Mutation {
    pub topic: TopicKey,
    pub entity_id: EntityId,
    pub operation: Operation,
    pub payload: Value,
}

impl Mutation {
    pub fn insert(topic: TopicKey, entity_id: impl Into<EntityId>, payload: Value) -> Self {
        Self {
            topic,
            entity_id: entity_id.into(),
            operation: Operation::Insert,
            payload,
        }
    }

    pub fn update(topic: TopicKey, entity_id: impl Into<EntityId>, payload: Value) -> Self {
        Self {
            topic,
            entity_id: entity_id.into(),
            operation: Operation::Update,
            payload,
        }
    }

    pub fn delete(topic: TopicKey, entity_id: impl Into<EntityId>) -> Self {
        Self {
            topic,
            entity_id: entity_id.into(),
            operation: Operation::Delete,
            payload: Value::Null,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingWrite {
    pub correlation_id: CorrelationId,
    pub topic: TopicKey,
    pub entity_id: EntityId,
    pub submitted_at: DateTime<Utc>,
    pub expected_operation: Operation,
}

struct Tracked {
    write: PendingWrite,
    timer: JoinHandle<()>,
}

struct CoordinatorInner {
    collections: Collections,
    store: Arc<dyn RemoteStore>,
    notices: broadcast::Sender<Notice>,
    timeout: Duration,
    pending: Mutex<HashMap<CorrelationId, Tracked>>,
}

impl CoordinatorInner {
    fn take(&self, correlation_id: CorrelationId) -> Option<PendingWrite> {
        let tracked = self.pending.lock().remove(&correlation_id)?;
        tracked.timer.abort();
        Some(tracked.write)
    }

    fn notify(&self, write: &PendingWrite, outcome: WriteOutcome) {
        let _ = self.notices.send(Notice::Write(WriteNotice {
            correlation_id: write.correlation_id,
            topic: write.topic.clone(),
            entity_id: write.entity_id.clone(),
            outcome,
        }));
    }

    /// Removes the provisional entry and reports the failure once.
    fn fail(&self, correlation_id: CorrelationId, outcome: WriteOutcome) -> bool {
        let Some(write) = self.take(correlation_id) else {
            return false;
        };
        if let Some(collection) = self.collections.get(&write.topic) {
            collection.with(|reconciler| reconciler.rollback(&write.entity_id, correlation_id));
        }
        warn!(
            target: "sync.writes",
            correlation = %correlation_id,
            topic = %write.topic,
            entity = %write.entity_id,
            ?outcome,
            "optimistic write rolled back"
        );
        self.notify(&write, outcome);
        true
    }

    fn expire(&self, correlation_id: CorrelationId) {
        // Already retired (confirmed, cancelled or removed by a delete): no-op.
        if !self.fail(correlation_id, WriteOutcome::TimedOut) {
            debug!(target: "sync.writes", correlation = %correlation_id, "timeout after retirement");
        }
    }
}

#[derive(Clone)]
pub struct WriteCoordinator {
    inner: Arc<CoordinatorInner>,
}

impl WriteCoordinator {
    pub fn new(
        collections: Collections,
        store: Arc<dyn RemoteStore>,
        notices: broadcast::Sender<Notice>,
        timeout: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(CoordinatorInner {
                collections,
                store,
                notices,
                timeout,
                pending: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Applies the provisional entry and starts the confirmation timeout.
    pub fn begin(&self, mutation: Mutation) -> CorrelationId {
        let correlation_id = CorrelationId::new();
        let submitted_at = Utc::now();
        let collection = self.inner.collections.get_or_create(&mutation.topic);

        // Held across staging so a fast confirmation always finds the entry.
        let mut pending = self.inner.pending.lock();
        collection.with(|reconciler| {
            reconciler.stage(
                correlation_id,
                &mutation.entity_id,
                mutation.operation,
                mutation.payload,
                submitted_at,
            )
        });

        let weak: Weak<CoordinatorInner> = Arc::downgrade(&self.inner);
        let timeout = self.inner.timeout;
        let timer = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if let Some(inner) = weak.upgrade() {
                inner.expire(correlation_id);
            }
        });

        debug!(
            target: "sync.writes",
            correlation = %correlation_id,
            topic = %mutation.topic,
            entity = %mutation.entity_id,
            operation = ?mutation.operation,
            "optimistic write staged"
        );
        pending.insert(
            correlation_id,
            Tracked {
                write: PendingWrite {
                    correlation_id,
                    topic: mutation.topic,
                    entity_id: mutation.entity_id,
                    submitted_at,
                    expected_operation: mutation.operation,
                },
                timer,
            },
        );
        correlation_id
    }

    /// Rolls the entity back to its latest confirmed state.
    pub fn cancel(&self, correlation_id: CorrelationId) -> bool {
        self.inner.fail(
            correlation_id,
            WriteOutcome::Rejected("cancelled".into()),
        )
    }

    pub fn reject(&self, correlation_id: CorrelationId, reason: impl Into<String>) -> bool {
        self.inner
            .fail(correlation_id, WriteOutcome::Rejected(reason.into()))
    }

    /// Retires writes the reconciler matched against a confirming event.
    pub fn settle(&self, retired: &[CorrelationId], confirmed_by: Operation) {
        for correlation_id in retired {
            let Some(write) = self.inner.take(*correlation_id) else {
                continue;
            };
            let outcome = if confirmed_by == Operation::Delete
                && write.expected_operation != Operation::Delete
            {
                WriteOutcome::Superseded
            } else {
                WriteOutcome::Confirmed
            };
            debug!(
                target: "sync.writes",
                correlation = %correlation_id,
                entity = %write.entity_id,
                ?outcome,
                "optimistic write retired"
            );
            self.inner.notify(&write, outcome);
        }
    }

    /// `begin`, then perform the write; a store error rolls back and is
    /// returned to the caller.
    pub async fn submit(&self, mutation: Mutation) -> SyncResult<CorrelationId> {
        let table = mutation
            .topic
            .table()
            .ok_or_else(|| SyncError::UnknownTopic(mutation.topic.clone()))?
            .to_string();
        let entity_id = mutation.entity_id.clone();
        let operation = mutation.operation;
        let payload = mutation.payload.clone();
        let correlation_id = self.begin(mutation);

        let store = Arc::clone(&self.inner.store);
        let result = match operation {
            Operation::Insert => store.insert(&table, &entity_id, payload).await.map(|_| ()),
            Operation::Update => store.update(&table, &entity_id, payload).await.map(|_| ()),
            Operation::Delete => store.delete(&table, &entity_id).await,
        };
        match result {
            Ok(()) => {
                info!(
                    target: "sync.writes",
                    correlation = %correlation_id,
                    %table,
                    entity = %entity_id,
                    "write accepted by store"
                );
                Ok(correlation_id)
            }
            Err(err) => {
                self.reject(correlation_id, err.to_string());
                Err(err.into())
            }
        }
    }

    pub fn pending(&self) -> Vec<PendingWrite> {
        let mut writes: Vec<PendingWrite> = self
            .inner
            .pending
            .lock()
            .values()
            .map(|tracked| tracked.write.clone())
            .collect();
        writes.sort_by_key(|write| write.submitted_at);
        writes
    }

    pub fn pending_count(&self) -> usize {
        self.inner.pending.lock().len()
    }

    pub fn has_pending(&self, topic: &TopicKey) -> bool {
        self.inner
            .pending
            .lock()
            .values()
            .any(|tracked| &tracked.write.topic == topic)
    }

    /// Aborts every timeout timer; pending entries are left as they are.
    pub fn shutdown(&self) {
        for (_, tracked) in self.inner.pending.lock().drain() {
            tracked.timer.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reconciler::ApplyOutcome;
    use crate::store::{InMemoryStore, StoreError};
    use crate::ChangeEvent;
    use serde_json::json;

    struct Fixture {
        collections: Collections,
        writes: WriteCoordinator,
        notices: broadcast::Receiver<Notice>,
        store: Arc<InMemoryStore>,
    }

    fn fixture() -> Fixture {
        let collections = Collections::new(Duration::ZERO);
        let collection = collections.get_or_create(&TopicKey::entity("quotes"));
        collection.with(|reconciler| {
            let epoch = reconciler.begin_sync();
            reconciler.complete_sync(epoch, Vec::new());
        });
        let (tx, notices) = broadcast::channel(16);
        let store = InMemoryStore::new();
        let writes = WriteCoordinator::new(
            collections.clone(),
            store.clone(),
            tx,
            Duration::from_secs(10),
        );
        Fixture {
            collections,
            writes,
            notices,
            store,
        }
    }

    fn confirm(fx: &Fixture, operation: Operation, id: &str, payload: Value) -> Vec<CorrelationId> {
        let collection = fx.collections.get(&TopicKey::entity("quotes")).unwrap();
        let report = collection.with(|reconciler| {
            reconciler.apply(ChangeEvent {
                topic: TopicKey::entity("quotes"),
                table: "quotes".into(),
                operation,
                entity_id: id.into(),
                payload,
                server_timestamp: Utc::now(),
            })
        });
        assert_eq!(report.outcome, ApplyOutcome::Applied);
        fx.writes.settle(&report.retired, operation);
        report.retired
    }

    fn outcomes(rx: &mut broadcast::Receiver<Notice>) -> Vec<WriteOutcome> {
        let mut seen = Vec::new();
        while let Ok(Notice::Write(notice)) = rx.try_recv() {
            seen.push(notice.outcome);
        }
        seen
    }

    #[tokio::test(start_paused = true)]
    async fn ghost_insert_times_out_once() {
        let mut fx = fixture();
        let topic = TopicKey::entity("quotes");
        let collection = fx.collections.get(&topic).unwrap();

        fx.writes
            .begin(Mutation::insert(topic.clone(), "e1", json!({"id": "e1"})));
        assert_eq!(collection.get("e1"), Some(json!({"id": "e1"})));

        tokio::time::sleep(Duration::from_secs(11)).await;
        assert!(collection.get("e1").is_none());
        assert_eq!(fx.writes.pending_count(), 0);
        assert_eq!(outcomes(&mut fx.notices), vec![WriteOutcome::TimedOut]);

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert!(outcomes(&mut fx.notices).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn confirmation_cancels_timeout() {
        let mut fx = fixture();
        let topic = TopicKey::entity("quotes");
        let id = fx
            .writes
            .begin(Mutation::insert(topic.clone(), "q1", json!({"id": "q1", "v": 1})));
        let retired = confirm(&fx, Operation::Insert, "q1", json!({"id": "q1", "v": 1, "server": true}));
        assert_eq!(retired, vec![id]);

        tokio::time::sleep(Duration::from_secs(20)).await;
        let collection = fx.collections.get(&topic).unwrap();
        assert_eq!(collection.get("q1").unwrap()["server"], true);
        assert_eq!(outcomes(&mut fx.notices), vec![WriteOutcome::Confirmed]);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_rolls_back_to_confirmed() {
        let mut fx = fixture();
        let topic = TopicKey::entity("quotes");
        confirm(&fx, Operation::Insert, "q1", json!({"total": 1}));
        let id = fx
            .writes
            .begin(Mutation::update(topic.clone(), "q1", json!({"total": 99})));
        let collection = fx.collections.get(&topic).unwrap();
        assert_eq!(collection.get("q1"), Some(json!({"total": 99})));

        assert!(fx.writes.cancel(id));
        assert!(!fx.writes.cancel(id));
        assert_eq!(collection.get("q1"), Some(json!({"total": 1})));
        assert_eq!(
            outcomes(&mut fx.notices),
            vec![WriteOutcome::Rejected("cancelled".into())]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn delete_supersedes_and_timeout_noops() {
        let mut fx = fixture();
        let topic = TopicKey::entity("quotes");
        confirm(&fx, Operation::Insert, "q1", json!({"total": 1}));
        fx.writes
            .begin(Mutation::update(topic.clone(), "q1", json!({"total": 2})));
        confirm(&fx, Operation::Delete, "q1", json!({"id": "q1"}));

        tokio::time::sleep(Duration::from_secs(11)).await;
        assert!(fx.collections.get(&topic).unwrap().get("q1").is_none());
        assert_eq!(outcomes(&mut fx.notices), vec![WriteOutcome::Superseded]);
    }

    #[tokio::test(start_paused = true)]
    async fn store_rejection_rolls_back() {
        let mut fx = fixture();
        let topic = TopicKey::entity("quotes");
        fx.store.fail_next(StoreError::Denied("quotes".into())).await;
        let err = fx
            .writes
            .submit(Mutation::insert(topic.clone(), "q1", json!({"id": "q1"})))
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::Store(StoreError::Denied(_))));
        assert!(fx.collections.get(&topic).unwrap().get("q1").is_none());
        assert!(matches!(
            outcomes(&mut fx.notices).as_slice(),
            [WriteOutcome::Rejected(_)]
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn submit_rejects_unknown_topics() {
        let fx = fixture();
        let err = fx
            .writes
            .submit(Mutation::insert(TopicKey::new("lobby"), "x", json!({})))
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::UnknownTopic(_)));
        assert_eq!(fx.writes.pending_count(), 0);
    }
}
