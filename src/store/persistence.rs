use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::BoxStream;
#[cfg(test)]
use mockall::automock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::StoreError;
use crate::event::Event;
use crate::matcher::MetadataMatcher;
use crate::store::merge::merge_streams;
use crate::types::SequenceNumber;

/// Lazy, finite, non-restartable sequence of events.
pub type EventStream = BoxStream<'static, Result<Event, StoreError>>;

/// Lifecycle status of a persisted projection, polled by the projector and
/// written by the [`ProjectionManager`](crate::projection::ProjectionManager).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProjectionStatus {
    Idle,
    Running,
    Stopping,
    Deleting,
    DeletingInclEmittedEvents,
    Resetting,
}

impl ProjectionStatus {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Running => "running",
            Self::Stopping => "stopping",
            Self::Deleting => "deleting",
            Self::DeletingInclEmittedEvents => "deleting_incl_emitted_events",
            Self::Resetting => "resetting",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "idle" => Some(Self::Idle),
            "running" => Some(Self::Running),
            "stopping" => Some(Self::Stopping),
            "deleting" => Some(Self::Deleting),
            "deleting_incl_emitted_events" => Some(Self::DeletingInclEmittedEvents),
            "resetting" => Some(Self::Resetting),
            _ => None,
        }
    }
}

/// One row of the projections table: the durable checkpoint of a projection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectionRecord {
    pub name: String,
    /// Opaque user state. `Value::Null` means "never persisted a state".
    pub state: Value,
    /// Stream name to last-processed `no`, inclusive.
    pub positions: BTreeMap<String, SequenceNumber>,
    pub status: ProjectionStatus,
    pub locked_until: Option<DateTime<Utc>>,
    pub lock_owner: Option<Uuid>,
}

impl ProjectionRecord {
    /// A fresh, idle record with empty state and no positions.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            state: Value::Null,
            positions: BTreeMap::new(),
            status: ProjectionStatus::Idle,
            locked_until: None,
            lock_owner: None,
        }
    }
}

/// One source of a merged load: a stream, a starting position and an
/// optional filter.
#[derive(Debug, Clone)]
pub struct StreamSelection {
    pub stream: String,
    pub from: SequenceNumber,
    pub matcher: Option<MetadataMatcher>,
}

impl StreamSelection {
    pub fn new(stream: impl Into<String>, from: SequenceNumber) -> Self {
        Self {
            stream: stream.into(),
            from,
            matcher: None,
        }
    }

    #[must_use]
    pub fn with_matcher(mut self, matcher: MetadataMatcher) -> Self {
        self.matcher = Some(matcher);
        self
    }
}

/// The back-end contract the engine consumes. Implementations own the two
/// logical tables (`event_streams`, `projections`) plus one physical storage
/// unit per stream, and must serialize appends per stream so `no` values
/// stay dense.
#[async_trait]
pub trait PersistenceStrategy: Send + Sync {
    /// Idempotent. Safe to call on an already-initialized store.
    async fn create_event_streams_table(&self) -> Result<(), StoreError>;

    /// Idempotent. Safe to call on an already-initialized store.
    async fn create_projections_table(&self) -> Result<(), StoreError>;

    /// Registers the stream name. Fails with
    /// [`StoreError::StreamAlreadyExists`] on duplicates.
    async fn add_stream_to_streams_table(&self, stream: &str) -> Result<(), StoreError>;

    /// Unregisters the stream name. Fails with
    /// [`StoreError::StreamNotFound`] when absent.
    async fn remove_stream_from_streams_table(&self, stream: &str) -> Result<(), StoreError>;

    /// Creates the per-stream physical storage.
    async fn create_schema(&self, stream: &str) -> Result<(), StoreError>;

    /// Drops the per-stream physical storage. Absent storage is not an error.
    async fn drop_schema(&self, stream: &str) -> Result<(), StoreError>;

    async fn has_stream(&self, stream: &str) -> Result<bool, StoreError>;

    /// Every stream currently registered, in stable (sorted) order.
    async fn fetch_stream_names(&self) -> Result<Vec<String>, StoreError>;

    /// Appends the batch atomically, assigning dense `no` values starting at
    /// `max(no) + 1`. Fails with [`StoreError::Concurrency`] when an event's
    /// `(_aggregate_id, _aggregate_version)` pair duplicates a persisted one.
    /// Returns the events as stored, numbers assigned.
    async fn append_to(&self, stream: &str, events: Vec<Event>) -> Result<Vec<Event>, StoreError>;

    /// Lazy ascending-`no` iteration over one stream, starting at `from`,
    /// optionally limited to `count` events after filtering.
    async fn load(
        &self,
        stream: &str,
        from: SequenceNumber,
        count: Option<usize>,
        matcher: Option<MetadataMatcher>,
    ) -> Result<EventStream, StoreError>;

    /// Time-ordered merge of per-stream filtered iterations, ordered by
    /// `(created_at, no)` ascending and stable by selection order under
    /// equal keys. Every yielded event carries its source stream name in
    /// `metadata.stream`.
    async fn merge_and_load(&self, selections: Vec<StreamSelection>) -> Result<EventStream, StoreError> {
        let mut sources = Vec::with_capacity(selections.len());
        for selection in selections {
            let events = self
                .load(&selection.stream, selection.from, None, selection.matcher)
                .await?;
            sources.push((selection.stream, events));
        }
        Ok(merge_streams(sources))
    }

    // Projection records.

    async fn fetch_projection(&self, name: &str) -> Result<Option<ProjectionRecord>, StoreError>;

    /// All persisted projection names, optionally filtered by prefix.
    async fn fetch_projection_names(&self, prefix: Option<&str>) -> Result<Vec<String>, StoreError>;

    /// Inserts or fully replaces the record.
    async fn persist_projection(&self, record: &ProjectionRecord) -> Result<(), StoreError>;

    /// Updates the status of an existing record. Fails with
    /// [`StoreError::ProjectionNotFound`] when absent.
    async fn update_projection_status(&self, name: &str, status: ProjectionStatus) -> Result<(), StoreError>;

    /// Removes the record. Removing an absent record is not an error.
    async fn delete_projection(&self, name: &str) -> Result<(), StoreError>;
}

/// Named advisory lock used to serialize projection runs by name.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait WriteLockStrategy: Send + Sync {
    /// Acquires the named lock. Returns false when it is already held.
    async fn create_lock(&self, name: &str) -> bool;

    /// Releases the named lock. Returns false when it was not held.
    async fn release_lock(&self, name: &str) -> bool;
}
