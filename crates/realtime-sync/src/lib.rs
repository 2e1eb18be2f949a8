//! Realtime sync: client-side subscription and reconciliation engine.
//!
//! Responsibilities:
//! - one live change-feed channel per topic, ref-counted across consumers
//! - normalizing raw feed payloads into canonical change / presence events
//! - reconciling change events with in-memory collections and pending
//!   optimistic writes
//! - aggregating per-connection typing presence into a flag per thread

pub mod channel;
pub mod config;
pub mod engine;
pub mod error;
pub mod manager;
pub mod normalize;
pub mod optimistic;
pub mod presence;
pub mod reconciler;
pub mod store;
pub mod telemetry;

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub use config::SyncConfig;
pub use engine::SyncEngine;
pub use error::{SyncError, SyncResult};

/// Table that carries conversation messages; `thread:<id>` topics scope it.
pub const MESSAGES_TABLE: &str = "messages";
/// Column linking a message row to its thread.
pub const THREAD_FIELD: &str = "thread_id";

pub type EntityId = String;

/// Opaque channel name, `entity:<table>` or `thread:<id>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TopicKey(String);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TopicScope<'a> {
    Entity { table: &'a str },
    Thread { id: &'a str },
    Other,
}

impl TopicKey {
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn entity(table: &str) -> Self {
        Self(format!("entity:{table}"))
    }

    pub fn thread(id: &str) -> Self {
        Self(format!("thread:{id}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn scope(&self) -> TopicScope<'_> {
        match self.0.split_once(':') {
            Some(("entity", table)) if !table.is_empty() => TopicScope::Entity { table },
            Some(("thread", id)) if !id.is_empty() => TopicScope::Thread { id },
            _ => TopicScope::Other,
        }
    }

    /// Table whose rows this topic carries.
    pub fn table(&self) -> Option<&str> {
        match self.scope() {
            TopicScope::Entity { table } => Some(table),
            TopicScope::Thread { .. } => Some(MESSAGES_TABLE),
            TopicScope::Other => None,
        }
    }

    pub fn thread_id(&self) -> Option<&str> {
        match self.scope() {
            TopicScope::Thread { id } => Some(id),
            _ => None,
        }
    }
}

impl fmt::Display for TopicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    Insert,
    Update,
    Delete,
}

/// Canonical form of one row change observed on the feed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub topic: TopicKey,
    pub table: String,
    pub operation: Operation,
    pub entity_id: EntityId,
    pub payload: serde_json::Value,
    pub server_timestamp: DateTime<Utc>,
}

/// A row as returned by a bulk fetch from the remote store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityRow {
    pub id: EntityId,
    pub payload: serde_json::Value,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CorrelationId(Uuid);

impl CorrelationId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for CorrelationId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WriteOutcome {
    Confirmed,
    /// A concurrent change (usually a delete) replaced the local write.
    Superseded,
    Rejected(String),
    TimedOut,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriteNotice {
    pub correlation_id: CorrelationId,
    pub topic: TopicKey,
    pub entity_id: EntityId,
    pub outcome: WriteOutcome,
}

/// User-visible notifications; recoverable conditions never show up here.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Notice {
    Write(WriteNotice),
    TopicFailed { topic: TopicKey, reason: String },
}
