use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::types::SequenceNumber;

/// Immutable event envelope, the unit of storage of every stream.
///
/// The stream number (`no`) is assigned by the store at append time, not by
/// the producer; a freshly built event carries `no = 0` until it is
/// persisted. Everything else is producer-supplied.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Position of the event within its stream. Strictly increasing and
    /// dense, starting at 1. Zero means "not yet appended".
    pub no: SequenceNumber,
    /// Uniquely identifies the event among all events of all streams.
    pub uuid: Uuid,
    /// Event type tag, the stable identifier handlers dispatch on.
    pub name: String,
    /// The original, emitted, domain payload.
    pub payload: Value,
    /// Reserved and user-defined labels attached to the event.
    pub metadata: Metadata,
    /// Logical timestamp; secondary order key when merging streams.
    pub created_at: DateTime<Utc>,
}

impl Event {
    /// Builds a new event with a fresh uuid and the current timestamp.
    pub fn new(name: impl Into<String>, payload: Value) -> Self {
        Self {
            no: 0,
            uuid: Uuid::new_v4(),
            name: name.into(),
            payload,
            metadata: Metadata::default(),
            created_at: Utc::now(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub const fn payload(&self) -> &Value {
        &self.payload
    }

    /// Returns a copy of this event with the given stream number.
    #[must_use]
    pub fn with_no(mut self, no: SequenceNumber) -> Self {
        self.no = no;
        self
    }

    /// Returns a copy of this event with the given uuid.
    #[must_use]
    pub fn with_uuid(mut self, uuid: Uuid) -> Self {
        self.uuid = uuid;
        self
    }

    /// Returns a copy of this event with the given timestamp.
    #[must_use]
    pub fn with_created_at(mut self, created_at: DateTime<Utc>) -> Self {
        self.created_at = created_at;
        self
    }

    /// Returns a copy of this event with `_aggregate_version` set.
    #[must_use]
    pub fn with_version(mut self, version: SequenceNumber) -> Self {
        self.metadata.insert(Metadata::AGGREGATE_VERSION, Value::from(version));
        self
    }

    /// Returns a copy of this event with `_aggregate_type` set.
    #[must_use]
    pub fn with_aggregate_type(mut self, aggregate_type: impl Into<String>) -> Self {
        self.metadata
            .insert(Metadata::AGGREGATE_TYPE, Value::from(aggregate_type.into()));
        self
    }

    /// Returns a copy of this event with `_aggregate_id` set.
    #[must_use]
    pub fn with_aggregate_id(mut self, aggregate_id: impl Into<String>) -> Self {
        self.metadata
            .insert(Metadata::AGGREGATE_ID, Value::from(aggregate_id.into()));
        self
    }

    /// Returns a copy of this event with the given metadata label replaced.
    #[must_use]
    pub fn with_metadata(mut self, key: impl Into<String>, value: Value) -> Self {
        self.metadata.insert(key, value);
        self
    }
}

/// Event metadata: a string-keyed label map.
///
/// Three labels are reserved for the aggregate machinery (`_aggregate_id`,
/// `_aggregate_type`, `_aggregate_version`); the engine additionally
/// populates `stream` with the source stream name when events are yielded
/// from a merged load. Everything else is free for applications.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Metadata(BTreeMap<String, Value>);

impl Metadata {
    pub const AGGREGATE_ID: &'static str = "_aggregate_id";
    pub const AGGREGATE_TYPE: &'static str = "_aggregate_type";
    pub const AGGREGATE_VERSION: &'static str = "_aggregate_version";
    pub const STREAM: &'static str = "stream";

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn insert(&mut self, key: impl Into<String>, value: Value) {
        self.0.insert(key.into(), value);
    }

    pub fn aggregate_id(&self) -> Option<&str> {
        self.get(Self::AGGREGATE_ID).and_then(Value::as_str)
    }

    pub fn aggregate_type(&self) -> Option<&str> {
        self.get(Self::AGGREGATE_TYPE).and_then(Value::as_str)
    }

    pub fn aggregate_version(&self) -> Option<SequenceNumber> {
        self.get(Self::AGGREGATE_VERSION).and_then(Value::as_i64)
    }

    /// The source stream name, present once the event came out of a merged
    /// load.
    pub fn stream(&self) -> Option<&str> {
        self.get(Self::STREAM).and_then(Value::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.0.iter()
    }
}

impl FromIterator<(String, Value)> for Metadata {
    fn from_iter<I: IntoIterator<Item = (String, Value)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn builder_replaces_single_field() {
        let event = Event::new("order_placed", json!({"total": 42}));
        let numbered = event.clone().with_no(7);

        assert_eq!(numbered.no, 7);
        assert_eq!(numbered.uuid, event.uuid);
        assert_eq!(numbered.payload, event.payload);
        assert_eq!(event.no, 0);
    }

    #[test]
    fn aggregate_labels_round_trip() {
        let event = Event::new("order_placed", json!({}))
            .with_aggregate_id("order-1")
            .with_aggregate_type("order")
            .with_version(3);

        assert_eq!(event.metadata.aggregate_id(), Some("order-1"));
        assert_eq!(event.metadata.aggregate_type(), Some("order"));
        assert_eq!(event.metadata.aggregate_version(), Some(3));
        assert_eq!(event.metadata.stream(), None);
    }

    #[test]
    fn metadata_serializes_as_plain_map() {
        let mut metadata = Metadata::default();
        metadata.insert("tenant", json!("acme"));

        let value = serde_json::to_value(&metadata).unwrap();
        assert_eq!(value, json!({"tenant": "acme"}));
    }
}
