//! Entity collections and the rules for merging feed events into them.
//!
//! Each collection moves through `Cold -> Syncing -> Live -> Stale -> Syncing`.
//! While `Live`, change events are applied with last-write-wins by server
//! timestamp. Optimistic writes sit on top of the confirmed value as overlays
//! until a confirming event retires them.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use tokio::sync::watch;
use tracing::{debug, info, trace};

use crate::{ChangeEvent, CorrelationId, EntityId, EntityRow, Operation, TopicKey};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncState {
    Cold,
    Syncing,
    Live,
    Stale,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    Applied,
    /// Held until the in-flight bulk fetch lands.
    Buffered,
    /// Older than what is already stored.
    OutOfOrder,
    /// Collection is not consuming events right now.
    Ignored,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApplyReport {
    pub outcome: ApplyOutcome,
    pub retired: Vec<CorrelationId>,
}

/// Pending writes retired by a completed bulk fetch, split by what retired them.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncReport {
    /// A fetched row or a replayed insert/update covered the write.
    pub confirmed: Vec<CorrelationId>,
    /// The entity is gone: absent from the fetch or removed by a replayed delete.
    pub deleted: Vec<CorrelationId>,
}

impl ApplyReport {
    fn bare(outcome: ApplyOutcome) -> Self {
        Self {
            outcome,
            retired: Vec::new(),
        }
    }
}

/// Visible entry of a collection.
#[derive(Debug, Clone, PartialEq)]
pub struct Entity {
    pub id: EntityId,
    pub payload: Value,
    /// True while an unconfirmed local write decides the payload.
    pub pending: bool,
}

#[derive(Debug, Clone)]
struct Confirmed {
    payload: Value,
    server_timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone)]
struct Overlay {
    correlation_id: CorrelationId,
    /// `None` hides the entity (optimistic delete).
    payload: Option<Value>,
    submitted_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct Slot {
    confirmed: Option<Confirmed>,
    overlays: Vec<Overlay>,
}

impl Slot {
    fn visible(&self) -> Option<&Value> {
        match self.overlays.last() {
            Some(overlay) => overlay.payload.as_ref(),
            None => self.confirmed.as_ref().map(|c| &c.payload),
        }
    }

    fn is_empty(&self) -> bool {
        self.confirmed.is_none() && self.overlays.is_empty()
    }

    fn retire_through(
        &mut self,
        server_timestamp: DateTime<Utc>,
        skew: chrono::Duration,
    ) -> Vec<CorrelationId> {
        let mut retired = Vec::new();
        self.overlays.retain(|overlay| {
            if server_timestamp + skew >= overlay.submitted_at {
                retired.push(overlay.correlation_id);
                false
            } else {
                true
            }
        });
        retired
    }

    /// Retires every overlay up to and including the newest optimistic delete.
    fn retire_deleted(&mut self) -> Vec<CorrelationId> {
        let Some(last_delete) = self
            .overlays
            .iter()
            .rposition(|overlay| overlay.payload.is_none())
        else {
            return Vec::new();
        };
        self.overlays
            .drain(..=last_delete)
            .map(|overlay| overlay.correlation_id)
            .collect()
    }
}

pub struct EntityReconciler {
    topic: TopicKey,
    state: SyncState,
    epoch: u64,
    order: Vec<EntityId>,
    slots: HashMap<EntityId, Slot>,
    tombstones: HashMap<EntityId, DateTime<Utc>>,
    buffered: Vec<ChangeEvent>,
    skew: chrono::Duration,
    revision: watch::Sender<u64>,
}

impl EntityReconciler {
    pub fn new(topic: TopicKey, clock_skew_allowance: std::time::Duration) -> Self {
        let (revision, _) = watch::channel(0);
        Self {
            topic,
            state: SyncState::Cold,
            epoch: 0,
            order: Vec::new(),
            slots: HashMap::new(),
            tombstones: HashMap::new(),
            buffered: Vec::new(),
            skew: chrono::Duration::from_std(clock_skew_allowance)
                .unwrap_or_else(|_| chrono::Duration::zero()),
            revision,
        }
    }

    pub fn topic(&self) -> &TopicKey {
        &self.topic
    }

    pub fn state(&self) -> SyncState {
        self.state
    }

    /// Enters `Syncing` and returns the epoch the bulk fetch must report back.
    /// Confirmed rows and tombstones are discarded; pending overlays survive.
    pub fn begin_sync(&mut self) -> u64 {
        self.epoch += 1;
        let previous = self.state;
        self.state = SyncState::Syncing;
        self.buffered.clear();
        self.tombstones.clear();
        for slot in self.slots.values_mut() {
            slot.confirmed = None;
        }
        self.prune();
        info!(
            target: "sync.reconcile",
            topic = %self.topic,
            from = ?previous,
            epoch = self.epoch,
            "resyncing collection"
        );
        self.bump();
        self.epoch
    }

    /// Loads the bulk fetch result and replays events buffered meanwhile.
    /// Results from an older epoch are discarded. Optimistic deletes of rows
    /// the fetch no longer returns are retired as done.
    pub fn complete_sync(&mut self, epoch: u64, rows: Vec<EntityRow>) -> SyncReport {
        if self.state != SyncState::Syncing || epoch != self.epoch {
            debug!(
                target: "sync.reconcile",
                topic = %self.topic,
                epoch,
                current = self.epoch,
                "discarding superseded snapshot"
            );
            return SyncReport::default();
        }

        let mut report = SyncReport::default();
        let row_count = rows.len();
        for row in rows {
            let slot = Self::slot_entry(&mut self.order, &mut self.slots, &row.id);
            slot.confirmed = Some(Confirmed {
                payload: row.payload,
                server_timestamp: row.updated_at,
            });
            report
                .confirmed
                .extend(slot.retire_through(row.updated_at, self.skew));
        }
        for slot in self.slots.values_mut() {
            if slot.confirmed.is_none() {
                report.deleted.extend(slot.retire_deleted());
            }
        }
        self.prune();

        self.state = SyncState::Live;
        let buffered = std::mem::take(&mut self.buffered);
        let replayed = buffered.len();
        for event in buffered {
            let operation = event.operation;
            let retired = self.apply_live(event).retired;
            match operation {
                Operation::Delete => report.deleted.extend(retired),
                Operation::Insert | Operation::Update => report.confirmed.extend(retired),
            }
        }
        info!(
            target: "sync.reconcile",
            topic = %self.topic,
            rows = row_count,
            replayed,
            confirmed = report.confirmed.len(),
            deleted = report.deleted.len(),
            "collection live"
        );
        self.bump();
        report
    }

    /// A bulk fetch failed; the collection stays untrustworthy.
    pub fn fail_sync(&mut self, epoch: u64) {
        if self.state == SyncState::Syncing && epoch == self.epoch {
            self.state = SyncState::Stale;
            self.buffered.clear();
            self.bump();
        }
    }

    pub fn mark_stale(&mut self) {
        if matches!(self.state, SyncState::Live | SyncState::Syncing) {
            debug!(target: "sync.reconcile", topic = %self.topic, "collection stale");
            self.state = SyncState::Stale;
            self.buffered.clear();
            self.bump();
        }
    }

    pub fn apply(&mut self, event: ChangeEvent) -> ApplyReport {
        match self.state {
            SyncState::Live => self.apply_live(event),
            SyncState::Syncing => {
                self.buffered.push(event);
                ApplyReport::bare(ApplyOutcome::Buffered)
            }
            SyncState::Cold | SyncState::Stale => {
                trace!(
                    target: "sync.reconcile",
                    topic = %self.topic,
                    entity = %event.entity_id,
                    state = ?self.state,
                    "ignoring event outside live state"
                );
                ApplyReport::bare(ApplyOutcome::Ignored)
            }
        }
    }

    fn apply_live(&mut self, event: ChangeEvent) -> ApplyReport {
        let ChangeEvent {
            entity_id,
            operation,
            payload,
            server_timestamp,
            ..
        } = event;

        let report = match operation {
            Operation::Insert | Operation::Update => {
                if let Some(deleted_at) = self.tombstones.get(&entity_id) {
                    if server_timestamp <= *deleted_at {
                        return self.out_of_order(&entity_id, server_timestamp);
                    }
                    self.tombstones.remove(&entity_id);
                }
                if let Some(stored) = self
                    .slots
                    .get(&entity_id)
                    .and_then(|slot| slot.confirmed.as_ref())
                {
                    if server_timestamp < stored.server_timestamp {
                        return self.out_of_order(&entity_id, server_timestamp);
                    }
                }
                // A repeated insert is an upsert.
                let slot = Self::slot_entry(&mut self.order, &mut self.slots, &entity_id);
                slot.confirmed = Some(Confirmed {
                    payload,
                    server_timestamp,
                });
                let retired = slot.retire_through(server_timestamp, self.skew);
                ApplyReport {
                    outcome: ApplyOutcome::Applied,
                    retired,
                }
            }
            Operation::Delete => {
                let tombstone = self
                    .tombstones
                    .entry(entity_id.clone())
                    .or_insert(server_timestamp);
                if server_timestamp > *tombstone {
                    *tombstone = server_timestamp;
                }
                let retired = match self.slots.remove(&entity_id) {
                    Some(slot) => {
                        self.order.retain(|id| id != &entity_id);
                        slot.overlays
                            .into_iter()
                            .map(|overlay| overlay.correlation_id)
                            .collect()
                    }
                    None => Vec::new(),
                };
                ApplyReport {
                    outcome: ApplyOutcome::Applied,
                    retired,
                }
            }
        };

        trace!(
            target: "sync.reconcile",
            topic = %self.topic,
            entity = %entity_id,
            ?operation,
            retired = report.retired.len(),
            "applied change"
        );
        self.bump();
        report
    }

    fn out_of_order(&self, entity_id: &str, server_timestamp: DateTime<Utc>) -> ApplyReport {
        debug!(
            target: "sync.reconcile",
            topic = %self.topic,
            entity = entity_id,
            %server_timestamp,
            "dropping out-of-order change"
        );
        ApplyReport::bare(ApplyOutcome::OutOfOrder)
    }

    /// Layers an optimistic value over the entity until confirmed or rolled back.
    pub fn stage(
        &mut self,
        correlation_id: CorrelationId,
        entity_id: &EntityId,
        operation: Operation,
        payload: Value,
        submitted_at: DateTime<Utc>,
    ) {
        let payload = match operation {
            Operation::Delete => None,
            Operation::Insert | Operation::Update => Some(payload),
        };
        let slot = Self::slot_entry(&mut self.order, &mut self.slots, entity_id);
        slot.overlays.push(Overlay {
            correlation_id,
            payload,
            submitted_at,
        });
        self.bump();
    }

    /// Drops one overlay; the entity falls back to the previous overlay or the
    /// confirmed value, whichever is now on top.
    pub fn rollback(&mut self, entity_id: &str, correlation_id: CorrelationId) -> bool {
        let Some(slot) = self.slots.get_mut(entity_id) else {
            return false;
        };
        let before = slot.overlays.len();
        slot.overlays
            .retain(|overlay| overlay.correlation_id != correlation_id);
        let removed = slot.overlays.len() != before;
        if removed {
            self.prune();
            self.bump();
        }
        removed
    }

    pub fn get(&self, entity_id: &str) -> Option<Value> {
        self.slots
            .get(entity_id)
            .and_then(|slot| slot.visible())
            .cloned()
    }

    pub fn is_pending(&self, entity_id: &str) -> bool {
        self.slots
            .get(entity_id)
            .map(|slot| !slot.overlays.is_empty())
            .unwrap_or(false)
    }

    pub fn confirmed_timestamp(&self, entity_id: &str) -> Option<DateTime<Utc>> {
        self.slots
            .get(entity_id)
            .and_then(|slot| slot.confirmed.as_ref())
            .map(|confirmed| confirmed.server_timestamp)
    }

    pub fn snapshot(&self) -> Vec<Entity> {
        self.order
            .iter()
            .filter_map(|id| {
                let slot = self.slots.get(id)?;
                let payload = slot.visible()?.clone();
                Some(Entity {
                    id: id.clone(),
                    payload,
                    pending: !slot.overlays.is_empty(),
                })
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.slots.values().filter(|slot| slot.visible().is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.revision.subscribe()
    }

    fn slot_entry<'a>(
        order: &mut Vec<EntityId>,
        slots: &'a mut HashMap<EntityId, Slot>,
        entity_id: &EntityId,
    ) -> &'a mut Slot {
        slots.entry(entity_id.clone()).or_insert_with(|| {
            order.push(entity_id.clone());
            Slot::default()
        })
    }

    fn prune(&mut self) {
        self.slots.retain(|_, slot| !slot.is_empty());
        let slots = &self.slots;
        self.order.retain(|id| slots.contains_key(id));
    }

    fn bump(&self) {
        self.revision.send_modify(|revision| *revision += 1);
    }
}

/// Shared, read-only view of one collection for UI consumers.
#[derive(Clone)]
pub struct Collection {
    inner: Arc<Mutex<EntityReconciler>>,
}

impl Collection {
    pub fn new(topic: TopicKey, clock_skew_allowance: std::time::Duration) -> Self {
        Self {
            inner: Arc::new(Mutex::new(EntityReconciler::new(
                topic,
                clock_skew_allowance,
            ))),
        }
    }

    pub fn topic(&self) -> TopicKey {
        self.inner.lock().topic().clone()
    }

    pub fn state(&self) -> SyncState {
        self.inner.lock().state()
    }

    pub fn get(&self, entity_id: &str) -> Option<Value> {
        self.inner.lock().get(entity_id)
    }

    pub fn is_pending(&self, entity_id: &str) -> bool {
        self.inner.lock().is_pending(entity_id)
    }

    pub fn snapshot(&self) -> Vec<Entity> {
        self.inner.lock().snapshot()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }

    /// Revision counter that ticks on every change to the collection.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.inner.lock().subscribe()
    }

    /// Mutation entry point for the engine and the write coordinator. The
    /// closure must not call back into this collection.
    pub(crate) fn with<R>(&self, f: impl FnOnce(&mut EntityReconciler) -> R) -> R {
        f(&mut *self.inner.lock())
    }
}

/// Collections keyed by topic, created on first use.
#[derive(Clone, Default)]
pub struct Collections {
    inner: Arc<RwLock<HashMap<TopicKey, Collection>>>,
    skew: std::time::Duration,
}

impl Collections {
    pub fn new(clock_skew_allowance: std::time::Duration) -> Self {
        Self {
            inner: Arc::default(),
            skew: clock_skew_allowance,
        }
    }

    pub fn get(&self, topic: &TopicKey) -> Option<Collection> {
        self.inner.read().get(topic).cloned()
    }

    pub fn get_or_create(&self, topic: &TopicKey) -> Collection {
        if let Some(existing) = self.get(topic) {
            return existing;
        }
        let mut guard = self.inner.write();
        guard
            .entry(topic.clone())
            .or_insert_with(|| {
                debug!(target: "sync.reconcile", %topic, "creating collection");
                Collection::new(topic.clone(), self.skew)
            })
            .clone()
    }

    /// Forgets the collection; consumers still holding it keep a detached copy.
    pub fn remove(&self, topic: &TopicKey) -> Option<Collection> {
        let removed = self.inner.write().remove(topic);
        if removed.is_some() {
            debug!(target: "sync.reconcile", %topic, "dropping collection");
        }
        removed
    }

    pub fn topics(&self) -> Vec<TopicKey> {
        self.inner.read().keys().cloned().collect()
    }
}

impl std::fmt::Debug for Collections {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Collections")
            .field("topics", &self.topics())
            .finish()
    }
}
