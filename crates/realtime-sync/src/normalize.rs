//! Raw feed payloads to canonical events.
//!
//! Wire envelopes are JSON objects tagged by `type`:
//!
//! - `change`: `{topic, table, event, id, record, old_record, commit_timestamp}`
//! - `presence`: `{topic, connection_id, user_id, typing}`
//! - `presence_leave`: `{topic, connection_id}`
//!
//! An optional `v` field versions the envelope; anything newer than
//! [`WIRE_VERSION`] is dropped.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, warn};

use crate::{ChangeEvent, EntityId, Operation, TopicKey};

pub const WIRE_VERSION: u64 = 1;

#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    Change(ChangeEvent),
    Presence(PresenceSignal),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PresenceSignal {
    Update {
        thread_id: String,
        connection_id: String,
        user_id: Option<String>,
        typing: bool,
    },
    Leave {
        thread_id: String,
        connection_id: String,
    },
}

#[derive(Deserialize)]
struct RawChange {
    topic: String,
    table: String,
    event: String,
    #[serde(default)]
    id: Option<Value>,
    #[serde(default)]
    record: Option<Value>,
    #[serde(default)]
    old_record: Option<Value>,
    commit_timestamp: DateTime<Utc>,
}

#[derive(Deserialize)]
struct RawPresence {
    topic: String,
    connection_id: String,
    #[serde(default)]
    user_id: Option<String>,
    #[serde(default)]
    typing: bool,
}

#[derive(Deserialize)]
struct RawLeave {
    topic: String,
    connection_id: String,
}

/// Returns `None` for anything that does not match a known schema.
pub fn normalize(raw: &[u8]) -> Option<Inbound> {
    let value: Value = match serde_json::from_slice(raw) {
        Ok(value) => value,
        Err(err) => {
            warn!(target: "sync.normalize", error = %err, "dropping malformed payload");
            return None;
        }
    };

    if let Some(version) = value.get("v").and_then(Value::as_u64) {
        if version > WIRE_VERSION {
            debug!(target: "sync.normalize", version, "dropping future-version payload");
            return None;
        }
    }

    let kind = value
        .get("type")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_owned();
    match kind.as_str() {
        "change" => decode::<RawChange>(&kind, value).and_then(change_event),
        "presence" => decode::<RawPresence>(&kind, value).and_then(presence_update),
        "presence_leave" => decode::<RawLeave>(&kind, value).and_then(presence_leave),
        other => {
            debug!(target: "sync.normalize", kind = other, "dropping unknown payload type");
            None
        }
    }
}

fn decode<T: serde::de::DeserializeOwned>(kind: &str, value: Value) -> Option<T> {
    match serde_json::from_value(value) {
        Ok(decoded) => Some(decoded),
        Err(err) => {
            warn!(target: "sync.normalize", kind, error = %err, "payload does not match schema");
            None
        }
    }
}

fn change_event(raw: RawChange) -> Option<Inbound> {
    let operation = match raw.event.to_ascii_lowercase().as_str() {
        "insert" => Operation::Insert,
        "update" => Operation::Update,
        "delete" => Operation::Delete,
        other => {
            warn!(
                target: "sync.normalize",
                event = other,
                topic = %raw.topic,
                "dropping change with unknown operation"
            );
            return None;
        }
    };

    let payload = match operation {
        Operation::Insert | Operation::Update => raw.record,
        Operation::Delete => raw.old_record.or(raw.record),
    };
    let Some(payload) = payload else {
        warn!(target: "sync.normalize", topic = %raw.topic, ?operation, "change without a row");
        return None;
    };
    // The envelope id wins; rows without one fall back to their own `id`.
    let envelope_id = raw.id.as_ref().and_then(id_of);
    let Some(entity_id) = envelope_id.or_else(|| entity_id(&payload)) else {
        warn!(target: "sync.normalize", topic = %raw.topic, ?operation, "change row has no id");
        return None;
    };

    Some(Inbound::Change(ChangeEvent {
        topic: TopicKey::new(raw.topic),
        table: raw.table,
        operation,
        entity_id,
        payload,
        server_timestamp: raw.commit_timestamp,
    }))
}

fn presence_update(raw: RawPresence) -> Option<Inbound> {
    let thread_id = thread_of(&raw.topic)?;
    Some(Inbound::Presence(PresenceSignal::Update {
        thread_id,
        connection_id: raw.connection_id,
        user_id: raw.user_id,
        typing: raw.typing,
    }))
}

fn presence_leave(raw: RawLeave) -> Option<Inbound> {
    let thread_id = thread_of(&raw.topic)?;
    Some(Inbound::Presence(PresenceSignal::Leave {
        thread_id,
        connection_id: raw.connection_id,
    }))
}

fn thread_of(topic: &str) -> Option<String> {
    let key = TopicKey::new(topic);
    let thread = key.thread_id().map(str::to_string);
    if thread.is_none() {
        debug!(target: "sync.normalize", topic, "presence outside a thread topic");
    }
    thread
}

/// Ids arrive as strings or integers depending on the table.
pub fn entity_id(row: &Value) -> Option<EntityId> {
    id_of(row.get("id")?)
}

fn id_of(id: &Value) -> Option<EntityId> {
    match id {
        Value::String(id) if !id.is_empty() => Some(id.clone()),
        Value::Number(id) => Some(id.to_string()),
        _ => None,
    }
}

pub fn encode_change(event: &ChangeEvent) -> serde_json::Result<Bytes> {
    let (record, old_record) = match event.operation {
        Operation::Delete => (Value::Null, event.payload.clone()),
        Operation::Insert | Operation::Update => (event.payload.clone(), Value::Null),
    };
    let envelope = serde_json::to_vec(&serde_json::json!({
        "type": "change",
        "v": WIRE_VERSION,
        "topic": event.topic,
        "table": event.table,
        "event": event.operation,
        "id": event.entity_id,
        "record": record,
        "old_record": old_record,
        "commit_timestamp": event.server_timestamp,
    }))?;
    Ok(Bytes::from(envelope))
}

pub fn encode_presence(
    topic: &TopicKey,
    connection_id: &str,
    user_id: Option<&str>,
    typing: bool,
) -> serde_json::Result<Bytes> {
    let envelope = serde_json::to_vec(&serde_json::json!({
        "type": "presence",
        "v": WIRE_VERSION,
        "topic": topic,
        "connection_id": connection_id,
        "user_id": user_id,
        "typing": typing,
    }))?;
    Ok(Bytes::from(envelope))
}

pub fn encode_leave(topic: &TopicKey, connection_id: &str) -> serde_json::Result<Bytes> {
    let envelope = serde_json::to_vec(&serde_json::json!({
        "type": "presence_leave",
        "v": WIRE_VERSION,
        "topic": topic,
        "connection_id": connection_id,
    }))?;
    Ok(Bytes::from(envelope))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn raw(value: Value) -> Vec<u8> {
        serde_json::to_vec(&value).unwrap()
    }

    #[test]
    fn maps_insert_update_delete() {
        let insert = normalize(&raw(json!({
            "type": "change",
            "topic": "entity:quotes",
            "table": "quotes",
            "event": "INSERT",
            "record": {"id": "q1", "total": 10},
            "commit_timestamp": "2024-05-01T10:00:00Z",
        })))
        .expect("insert");
        let Inbound::Change(event) = insert else {
            panic!("expected change");
        };
        assert_eq!(event.operation, Operation::Insert);
        assert_eq!(event.entity_id, "q1");
        assert_eq!(event.topic, TopicKey::entity("quotes"));
        assert_eq!(event.payload["total"], 10);

        let delete = normalize(&raw(json!({
            "type": "change",
            "topic": "entity:quotes",
            "table": "quotes",
            "event": "delete",
            "old_record": {"id": 7},
            "commit_timestamp": "2024-05-01T10:00:01Z",
        })))
        .expect("delete");
        let Inbound::Change(event) = delete else {
            panic!("expected change");
        };
        assert_eq!(event.operation, Operation::Delete);
        assert_eq!(event.entity_id, "7");
    }

    #[test]
    fn drops_unknown_operations_and_schemas() {
        assert!(normalize(&raw(json!({
            "type": "change",
            "topic": "entity:quotes",
            "table": "quotes",
            "event": "TRUNCATE",
            "record": {"id": "q1"},
            "commit_timestamp": "2024-05-01T10:00:00Z",
        })))
        .is_none());
        assert!(normalize(b"{not json").is_none());
        assert!(normalize(&raw(json!({"type": "broadcast", "topic": "thread:1"}))).is_none());
        assert!(normalize(&raw(json!({
            "type": "change",
            "topic": "entity:quotes",
            "table": "quotes",
            "event": "UPDATE",
            "record": {"total": 3},
            "commit_timestamp": "2024-05-01T10:00:00Z",
        })))
        .is_none());
    }

    #[test]
    fn drops_future_versions() {
        assert!(normalize(&raw(json!({
            "type": "presence",
            "v": 2,
            "topic": "thread:1",
            "connection_id": "c1",
            "typing": true,
        })))
        .is_none());
    }

    #[test]
    fn presence_requires_thread_topic() {
        let bytes = encode_presence(&TopicKey::thread("42"), "c1", Some("u1"), true).unwrap();
        assert_eq!(
            normalize(&bytes),
            Some(Inbound::Presence(PresenceSignal::Update {
                thread_id: "42".into(),
                connection_id: "c1".into(),
                user_id: Some("u1".into()),
                typing: true,
            }))
        );

        let leave = encode_leave(&TopicKey::thread("42"), "c1").unwrap();
        assert_eq!(
            normalize(&leave),
            Some(Inbound::Presence(PresenceSignal::Leave {
                thread_id: "42".into(),
                connection_id: "c1".into(),
            }))
        );

        let misplaced = encode_presence(&TopicKey::entity("quotes"), "c1", None, true).unwrap();
        assert!(normalize(&misplaced).is_none());
    }

    #[test]
    fn encoded_changes_normalize_back() {
        let event = ChangeEvent {
            topic: TopicKey::thread("9"),
            table: "messages".into(),
            operation: Operation::Delete,
            entity_id: "m1".into(),
            payload: json!({"id": "m1", "thread_id": "9"}),
            server_timestamp: "2024-05-01T10:00:00Z".parse().unwrap(),
        };
        let bytes = encode_change(&event).unwrap();
        assert_eq!(normalize(&bytes), Some(Inbound::Change(event)));
    }

    #[test]
    fn encoded_changes_keep_ids_of_rows_without_one() {
        let event = ChangeEvent {
            topic: TopicKey::entity("quotes"),
            table: "quotes".into(),
            operation: Operation::Update,
            entity_id: "e2".into(),
            payload: json!({"v": "t1"}),
            server_timestamp: "2024-05-01T10:00:00Z".parse().unwrap(),
        };
        let bytes = encode_change(&event).unwrap();
        assert_eq!(normalize(&bytes), Some(Inbound::Change(event)));
    }

    #[test]
    fn envelope_id_takes_precedence_over_row_id() {
        let Some(Inbound::Change(event)) = normalize(&raw(json!({
            "type": "change",
            "topic": "entity:quotes",
            "table": "quotes",
            "event": "update",
            "id": 12,
            "record": {"id": "ignored", "total": 1},
            "commit_timestamp": "2024-05-01T10:00:00Z",
        }))) else {
            panic!("expected change");
        };
        assert_eq!(event.entity_id, "12");
    }
}
