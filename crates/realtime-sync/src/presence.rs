use std::collections::HashMap;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, trace};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TypingState {
    Idle,
    Typing { since: Instant },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PresenceRecord {
    pub connection_id: String,
    pub thread_id: String,
    pub user_id: Option<String>,
    pub state: TypingState,
    pub last_seen_at: Instant,
}

impl PresenceRecord {
    /// Typing counts only while the record keeps being refreshed.
    pub fn is_typing(&self, now: Instant, silence: Duration) -> bool {
        matches!(self.state, TypingState::Typing { .. })
            && now.saturating_duration_since(self.last_seen_at) < silence
    }

    fn is_silent(&self, now: Instant, silence: Duration) -> bool {
        now.saturating_duration_since(self.last_seen_at) >= silence
    }
}

/// A connection present in several threads keeps one record per thread.
type RecordKey = (String, String);

/// Reduces peer presence records into one "someone is typing" flag per thread.
pub struct PresenceAggregator {
    self_connection: String,
    silence: Duration,
    records: HashMap<RecordKey, PresenceRecord>,
    aggregates: HashMap<String, watch::Sender<bool>>,
}

impl PresenceAggregator {
    pub fn new(self_connection: impl Into<String>, silence: Duration) -> Self {
        Self {
            self_connection: self_connection.into(),
            silence,
            records: HashMap::new(),
            aggregates: HashMap::new(),
        }
    }

    /// Replaces any earlier record for the same connection in the same thread.
    pub fn record(&mut self, mut record: PresenceRecord) {
        let key = (record.connection_id.clone(), record.thread_id.clone());
        if let (Some(previous), TypingState::Typing { .. }) = (self.records.get(&key), record.state)
        {
            if let TypingState::Typing { since } = previous.state {
                record.state = TypingState::Typing { since };
            }
        }
        let now = record.last_seen_at;
        let thread = record.thread_id.clone();
        self.records.insert(key, record);
        self.recompute(&thread, now);
    }

    /// Removes the connection from one thread; its other threads are untouched.
    pub fn leave(&mut self, connection_id: &str, thread_id: &str, now: Instant) {
        let key = (connection_id.to_string(), thread_id.to_string());
        if self.records.remove(&key).is_some() {
            debug!(
                target: "sync.presence",
                connection = connection_id,
                thread = thread_id,
                "peer left"
            );
            self.recompute(thread_id, now);
        }
    }

    /// Drops every record for a thread, e.g. after its channel went away.
    pub fn clear_thread(&mut self, thread_id: &str, now: Instant) {
        self.records.retain(|_, record| record.thread_id != thread_id);
        self.recompute(thread_id, now);
    }

    pub fn aggregate(&self, thread_id: &str) -> bool {
        self.aggregate_at(thread_id, Instant::now())
    }

    pub fn aggregate_at(&self, thread_id: &str, now: Instant) -> bool {
        self.records.values().any(|record| {
            record.thread_id == thread_id
                && record.connection_id != self.self_connection
                && record.is_typing(now, self.silence)
        })
    }

    /// Garbage-collects silent records and re-evaluates every aggregate.
    ///
    /// Aggregates nobody watches are dropped once their thread has no records.
    pub fn tick(&mut self, now: Instant) {
        let silence = self.silence;
        let before = self.records.len();
        self.records.retain(|_, record| !record.is_silent(now, silence));
        if self.records.len() != before {
            trace!(
                target: "sync.presence",
                expired = before - self.records.len(),
                "expired silent presence"
            );
        }
        let threads: Vec<String> = self.aggregates.keys().cloned().collect();
        for thread in threads {
            self.recompute(&thread, now);
        }
        let records = &self.records;
        self.aggregates.retain(|thread, sender| {
            sender.receiver_count() > 0 || records.values().any(|record| &record.thread_id == thread)
        });
    }

    pub fn subscribe(&mut self, thread_id: &str) -> watch::Receiver<bool> {
        let current = self.aggregate_at(thread_id, Instant::now());
        self.aggregates
            .entry(thread_id.to_string())
            .or_insert_with(|| watch::channel(current).0)
            .subscribe()
    }

    pub fn records(&self, thread_id: &str) -> Vec<PresenceRecord> {
        self.records
            .values()
            .filter(|record| record.thread_id == thread_id)
            .cloned()
            .collect()
    }

    fn recompute(&mut self, thread_id: &str, now: Instant) {
        let typing = self.aggregate_at(thread_id, now);
        let sender = self
            .aggregates
            .entry(thread_id.to_string())
            .or_insert_with(|| watch::channel(false).0);
        let changed = sender.send_if_modified(|current| {
            if *current == typing {
                return false;
            }
            *current = typing;
            true
        });
        if changed {
            debug!(target: "sync.presence", thread = thread_id, typing, "typing aggregate changed");
        }
    }
}
