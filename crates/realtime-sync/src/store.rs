use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use change_feed::ChangeFeed;
use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::warn;

use crate::normalize::encode_change;
use crate::{ChangeEvent, EntityId, EntityRow, Operation, TopicKey, MESSAGES_TABLE, THREAD_FIELD};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error("permission denied: {0}")]
    Denied(String),
    #[error("{table}/{id} not found")]
    NotFound { table: String, id: EntityId },
    #[error("{table}/{id} already exists")]
    Conflict { table: String, id: EntityId },
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// Bulk fetch filter: a whole table, or the rows whose `field` equals `value`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuerySpec {
    pub table: String,
    pub filter: Option<(String, String)>,
}

impl QuerySpec {
    pub fn table(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            filter: None,
        }
    }

    /// Query that backs a topic's collection.
    pub fn for_topic(topic: &TopicKey) -> Option<Self> {
        let table = topic.table()?;
        let filter = topic
            .thread_id()
            .map(|thread| (THREAD_FIELD.to_string(), thread.to_string()));
        Some(Self {
            table: table.to_string(),
            filter,
        })
    }

    fn matches(&self, row: &EntityRow) -> bool {
        match &self.filter {
            None => true,
            Some((field, value)) => match row.payload.get(field) {
                Some(Value::String(found)) => found == value,
                Some(Value::Number(found)) => found.to_string() == *value,
                _ => false,
            },
        }
    }
}

#[async_trait]
pub trait RemoteStore: Send + Sync {
    async fn insert(&self, table: &str, id: &EntityId, payload: Value) -> Result<EntityRow, StoreError>;

    async fn update(&self, table: &str, id: &EntityId, payload: Value) -> Result<EntityRow, StoreError>;

    async fn delete(&self, table: &str, id: &EntityId) -> Result<(), StoreError>;

    async fn query(&self, query: &QuerySpec) -> Result<Vec<EntityRow>, StoreError>;
}

#[derive(Default)]
struct Tables {
    rows: HashMap<String, Vec<EntityRow>>,
    last_timestamp: Option<DateTime<Utc>>,
}

impl Tables {
    /// Strictly increasing commit timestamps.
    fn next_timestamp(&mut self) -> DateTime<Utc> {
        let now = Utc::now();
        let ts = match self.last_timestamp {
            Some(last) if now <= last => last + chrono::Duration::microseconds(1),
            _ => now,
        };
        self.last_timestamp = Some(ts);
        ts
    }
}

/// In-memory adapter for tests and local wiring. With a feed attached it
/// echoes every committed write as a change event, like the real backend.
pub struct InMemoryStore {
    tables: Mutex<Tables>,
    feed: Option<Arc<dyn ChangeFeed>>,
    echo: AtomicBool,
    failures: Mutex<VecDeque<StoreError>>,
    queries: AtomicUsize,
}

impl InMemoryStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::build(None))
    }

    pub fn with_feed(feed: Arc<dyn ChangeFeed>) -> Arc<Self> {
        Arc::new(Self::build(Some(feed)))
    }

    fn build(feed: Option<Arc<dyn ChangeFeed>>) -> Self {
        Self {
            tables: Mutex::new(Tables::default()),
            feed,
            echo: AtomicBool::new(true),
            failures: Mutex::new(VecDeque::new()),
            queries: AtomicUsize::new(0),
        }
    }

    /// Bulk fetches served so far.
    pub fn query_count(&self) -> usize {
        self.queries.load(Ordering::SeqCst)
    }

    /// Commits still succeed but no change events are emitted.
    pub fn set_echo(&self, echo: bool) {
        self.echo.store(echo, Ordering::SeqCst);
    }

    /// The next write fails with `error`.
    pub async fn fail_next(&self, error: StoreError) {
        self.failures.lock().await.push_back(error);
    }

    /// Seeds a row without emitting a change event.
    pub async fn seed(&self, table: &str, id: &str, payload: Value) {
        let mut tables = self.tables.lock().await;
        let updated_at = tables.next_timestamp();
        tables.rows.entry(table.to_string()).or_default().push(EntityRow {
            id: id.to_string(),
            payload,
            updated_at,
        });
    }

    async fn take_failure(&self) -> Result<(), StoreError> {
        match self.failures.lock().await.pop_front() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn emit(&self, table: &str, operation: Operation, row: &EntityRow) {
        let Some(feed) = &self.feed else {
            return;
        };
        if !self.echo.load(Ordering::SeqCst) {
            return;
        }
        let mut topics = vec![TopicKey::entity(table)];
        if table == MESSAGES_TABLE {
            if let Some(thread) = row.payload.get(THREAD_FIELD).and_then(Value::as_str) {
                topics.push(TopicKey::thread(thread));
            }
        }
        for topic in topics {
            let event = ChangeEvent {
                topic: topic.clone(),
                table: table.to_string(),
                operation,
                entity_id: row.id.clone(),
                payload: row.payload.clone(),
                server_timestamp: row.updated_at,
            };
            let published = encode_change(&event)
                .map_err(|err| err.to_string())
                .and_then(|bytes| {
                    feed.publish(topic.as_str(), bytes)
                        .map_err(|err| err.to_string())
                });
            if let Err(err) = published {
                warn!(target: "sync.store", %topic, error = %err, "failed to echo change");
            }
        }
    }
}

#[async_trait]
impl RemoteStore for InMemoryStore {
    async fn insert(&self, table: &str, id: &EntityId, payload: Value) -> Result<EntityRow, StoreError> {
        self.take_failure().await?;
        let row = {
            let mut tables = self.tables.lock().await;
            let updated_at = tables.next_timestamp();
            let rows = tables.rows.entry(table.to_string()).or_default();
            if rows.iter().any(|row| &row.id == id) {
                return Err(StoreError::Conflict {
                    table: table.to_string(),
                    id: id.clone(),
                });
            }
            let row = EntityRow {
                id: id.clone(),
                payload,
                updated_at,
            };
            rows.push(row.clone());
            row
        };
        self.emit(table, Operation::Insert, &row);
        Ok(row)
    }

    async fn update(&self, table: &str, id: &EntityId, payload: Value) -> Result<EntityRow, StoreError> {
        self.take_failure().await?;
        let row = {
            let mut tables = self.tables.lock().await;
            let updated_at = tables.next_timestamp();
            let existing = tables
                .rows
                .get_mut(table)
                .and_then(|rows| rows.iter_mut().find(|row| &row.id == id))
                .ok_or_else(|| StoreError::NotFound {
                    table: table.to_string(),
                    id: id.clone(),
                })?;
            existing.payload = payload;
            existing.updated_at = updated_at;
            existing.clone()
        };
        self.emit(table, Operation::Update, &row);
        Ok(row)
    }

    async fn delete(&self, table: &str, id: &EntityId) -> Result<(), StoreError> {
        self.take_failure().await?;
        let row = {
            let mut tables = self.tables.lock().await;
            let updated_at = tables.next_timestamp();
            let rows = tables.rows.get_mut(table);
            let index = rows
                .as_ref()
                .and_then(|rows| rows.iter().position(|row| &row.id == id));
            match (rows, index) {
                (Some(rows), Some(index)) => {
                    let mut row = rows.remove(index);
                    row.updated_at = updated_at;
                    row
                }
                _ => {
                    return Err(StoreError::NotFound {
                        table: table.to_string(),
                        id: id.clone(),
                    })
                }
            }
        };
        self.emit(table, Operation::Delete, &row);
        Ok(())
    }

    async fn query(&self, query: &QuerySpec) -> Result<Vec<EntityRow>, StoreError> {
        self.queries.fetch_add(1, Ordering::SeqCst);
        let tables = self.tables.lock().await;
        Ok(tables
            .rows
            .get(&query.table)
            .map(|rows| rows.iter().filter(|row| query.matches(row)).cloned().collect())
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::normalize::{normalize, Inbound};
    use change_feed::LocalFeed;
    use serde_json::json;

    #[tokio::test]
    async fn upserts_and_queries_rows() {
        let store = InMemoryStore::new();
        store
            .insert("quotes", &"q1".into(), json!({"id": "q1", "total": 1}))
            .await
            .unwrap();
        let updated = store
            .update("quotes", &"q1".into(), json!({"id": "q1", "total": 2}))
            .await
            .unwrap();
        let rows = store.query(&QuerySpec::table("quotes")).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].payload["total"], 2);
        assert_eq!(rows[0].updated_at, updated.updated_at);

        let conflict = store
            .insert("quotes", &"q1".into(), json!({"id": "q1"}))
            .await
            .unwrap_err();
        assert!(matches!(conflict, StoreError::Conflict { .. }));
        store.delete("quotes", &"q1".into()).await.unwrap();
        assert!(store.query(&QuerySpec::table("quotes")).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn thread_queries_filter_messages() {
        let store = InMemoryStore::new();
        store.seed(MESSAGES_TABLE, "m1", json!({"id": "m1", "thread_id": "42"})).await;
        store.seed(MESSAGES_TABLE, "m2", json!({"id": "m2", "thread_id": "7"})).await;
        let spec = QuerySpec::for_topic(&TopicKey::thread("42")).unwrap();
        let rows = store.query(&spec).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].id, "m1");
        assert!(QuerySpec::for_topic(&TopicKey::new("lobby")).is_none());
    }

    #[tokio::test]
    async fn echoes_writes_to_entity_and_thread_topics() {
        let feed = Arc::new(LocalFeed::new());
        let mut table_rx = feed.subscribe("entity:messages").await.unwrap();
        let mut thread_rx = feed.subscribe("thread:42").await.unwrap();
        let store = InMemoryStore::with_feed(feed.clone());

        store
            .insert(MESSAGES_TABLE, &"m1".into(), json!({"id": "m1", "thread_id": "42"}))
            .await
            .unwrap();
        for rx in [&mut table_rx, &mut thread_rx] {
            let msg = rx.recv().await.unwrap();
            let Some(Inbound::Change(event)) = normalize(&msg.payload) else {
                panic!("expected change");
            };
            assert_eq!(event.entity_id, "m1");
            assert_eq!(event.operation, Operation::Insert);
        }

        store.set_echo(false);
        store
            .update(MESSAGES_TABLE, &"m1".into(), json!({"id": "m1", "thread_id": "42"}))
            .await
            .unwrap();
        assert!(table_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn injected_failures_reject_once() {
        let store = InMemoryStore::new();
        store.fail_next(StoreError::Denied("quotes".into())).await;
        assert!(store.insert("quotes", &"q1".into(), json!({})).await.is_err());
        assert!(store.insert("quotes", &"q1".into(), json!({})).await.is_ok());
    }

    #[tokio::test]
    async fn timestamps_strictly_increase() {
        let store = InMemoryStore::new();
        let mut last = None;
        for i in 0..20 {
            let row = store
                .insert("quotes", &format!("q{i}"), json!({}))
                .await
                .unwrap();
            if let Some(previous) = last {
                assert!(row.updated_at > previous);
            }
            last = Some(row.updated_at);
        }
    }
}
