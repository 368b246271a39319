use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use futures::stream;
use tokio::sync::{Mutex, RwLock};

use crate::error::StoreError;
use crate::event::Event;
use crate::matcher::MetadataMatcher;
use crate::store::persistence::{
    EventStream, PersistenceStrategy, ProjectionRecord, ProjectionStatus, WriteLockStrategy,
};
use crate::types::SequenceNumber;

/// In-memory [`PersistenceStrategy`], the reference back-end.
///
/// Holds the same logical layout a relational back-end would: a streams
/// table, one event log per stream, and a projections table. All writers go
/// through a single `RwLock`, which trivially serializes per-stream appends.
///
/// The store is protected by an [`Arc`] that allows it to be cloneable still
/// having the same memory reference.
#[derive(Clone, Default)]
pub struct InMemoryPersistenceStrategy {
    inner: Arc<RwLock<MemoryBackend>>,
}

#[derive(Default)]
struct MemoryBackend {
    stream_names: BTreeSet<String>,
    storage: BTreeMap<String, Vec<Event>>,
    projections: BTreeMap<String, ProjectionRecord>,
}

impl InMemoryPersistenceStrategy {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl PersistenceStrategy for InMemoryPersistenceStrategy {
    async fn create_event_streams_table(&self) -> Result<(), StoreError> {
        Ok(())
    }

    async fn create_projections_table(&self) -> Result<(), StoreError> {
        Ok(())
    }

    async fn add_stream_to_streams_table(&self, stream: &str) -> Result<(), StoreError> {
        let mut backend = self.inner.write().await;
        if !backend.stream_names.insert(stream.to_string()) {
            return Err(StoreError::StreamAlreadyExists(stream.to_string()));
        }
        Ok(())
    }

    async fn remove_stream_from_streams_table(&self, stream: &str) -> Result<(), StoreError> {
        let mut backend = self.inner.write().await;
        if !backend.stream_names.remove(stream) {
            return Err(StoreError::StreamNotFound(stream.to_string()));
        }
        Ok(())
    }

    async fn create_schema(&self, stream: &str) -> Result<(), StoreError> {
        let mut backend = self.inner.write().await;
        backend.storage.entry(stream.to_string()).or_default();
        Ok(())
    }

    async fn drop_schema(&self, stream: &str) -> Result<(), StoreError> {
        let mut backend = self.inner.write().await;
        backend.storage.remove(stream);
        Ok(())
    }

    async fn has_stream(&self, stream: &str) -> Result<bool, StoreError> {
        let backend = self.inner.read().await;
        Ok(backend.stream_names.contains(stream))
    }

    async fn fetch_stream_names(&self) -> Result<Vec<String>, StoreError> {
        let backend = self.inner.read().await;
        Ok(backend.stream_names.iter().cloned().collect())
    }

    async fn append_to(&self, stream: &str, events: Vec<Event>) -> Result<Vec<Event>, StoreError> {
        let mut backend = self.inner.write().await;
        let log = backend
            .storage
            .get_mut(stream)
            .ok_or_else(|| StoreError::StreamNotFound(stream.to_string()))?;

        // Reject the whole batch before any event becomes visible.
        let mut seen: HashSet<(String, SequenceNumber)> = log
            .iter()
            .filter_map(|event| {
                Some((
                    event.metadata.aggregate_id()?.to_string(),
                    event.metadata.aggregate_version()?,
                ))
            })
            .collect();
        for event in &events {
            if let (Some(id), Some(version)) =
                (event.metadata.aggregate_id(), event.metadata.aggregate_version())
            {
                if !seen.insert((id.to_string(), version)) {
                    return Err(StoreError::Concurrency {
                        aggregate_id: id.to_string(),
                        version,
                    });
                }
            }
        }

        let mut next = log.last().map_or(0, |event| event.no);
        let mut stored = Vec::with_capacity(events.len());
        for event in events {
            next += 1;
            stored.push(event.with_no(next));
        }
        log.extend(stored.iter().cloned());
        Ok(stored)
    }

    async fn load(
        &self,
        stream: &str,
        from: SequenceNumber,
        count: Option<usize>,
        matcher: Option<MetadataMatcher>,
    ) -> Result<EventStream, StoreError> {
        let backend = self.inner.read().await;
        let log = backend
            .storage
            .get(stream)
            .ok_or_else(|| StoreError::StreamNotFound(stream.to_string()))?;

        let selected: Vec<Event> = log
            .iter()
            .filter(|event| event.no >= from)
            .filter(|event| matcher.as_ref().is_none_or(|m| m.matches(event)))
            .take(count.unwrap_or(usize::MAX))
            .cloned()
            .collect();

        Ok(Box::pin(stream::iter(selected.into_iter().map(Ok))))
    }

    async fn fetch_projection(&self, name: &str) -> Result<Option<ProjectionRecord>, StoreError> {
        let backend = self.inner.read().await;
        Ok(backend.projections.get(name).cloned())
    }

    async fn fetch_projection_names(&self, prefix: Option<&str>) -> Result<Vec<String>, StoreError> {
        let backend = self.inner.read().await;
        Ok(backend
            .projections
            .keys()
            .filter(|name| prefix.is_none_or(|p| name.starts_with(p)))
            .cloned()
            .collect())
    }

    async fn persist_projection(&self, record: &ProjectionRecord) -> Result<(), StoreError> {
        let mut backend = self.inner.write().await;
        backend.projections.insert(record.name.clone(), record.clone());
        Ok(())
    }

    async fn update_projection_status(&self, name: &str, status: ProjectionStatus) -> Result<(), StoreError> {
        let mut backend = self.inner.write().await;
        let record = backend
            .projections
            .get_mut(name)
            .ok_or_else(|| StoreError::ProjectionNotFound(name.to_string()))?;
        record.status = status;
        Ok(())
    }

    async fn delete_projection(&self, name: &str) -> Result<(), StoreError> {
        let mut backend = self.inner.write().await;
        backend.projections.remove(name);
        Ok(())
    }
}

/// In-memory advisory lock table.
#[derive(Clone, Default)]
pub struct InMemoryWriteLockStrategy {
    held: Arc<Mutex<HashSet<String>>>,
}

impl InMemoryWriteLockStrategy {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl WriteLockStrategy for InMemoryWriteLockStrategy {
    async fn create_lock(&self, name: &str) -> bool {
        self.held.lock().await.insert(name.to_string())
    }

    async fn release_lock(&self, name: &str) -> bool {
        self.held.lock().await.remove(name)
    }
}
