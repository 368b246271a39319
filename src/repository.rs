use std::marker::PhantomData;

use futures::StreamExt;
use serde_json::Value;

use crate::aggregate::Aggregate;
use crate::error::StoreError;
use crate::event::Metadata;
use crate::matcher::{FieldType, MetadataMatcher, Operation};
use crate::store::EventStore;

/// Loads aggregates by replaying their events and persists new events with
/// optimistic version metadata.
///
/// The repository holds a relation to its [`EventStore`], injected at
/// construction; appends run through the store's middleware chain and the
/// back-end's `(_aggregate_id, _aggregate_version)` uniqueness check.
pub struct AggregateRepository<A> {
    store: EventStore,
    stream: String,
    _aggregate: PhantomData<A>,
}

impl<A> AggregateRepository<A>
where
    A: Aggregate,
{
    pub fn new(store: EventStore, stream: impl Into<String>) -> Self {
        Self {
            store,
            stream: stream.into(),
            _aggregate: PhantomData,
        }
    }

    pub fn stream(&self) -> &str {
        &self.stream
    }

    /// Drains the aggregate's pending events, stamps identity and version
    /// metadata, and appends them. On success the aggregate's version is
    /// advanced and its buffer stays drained.
    #[tracing::instrument(skip_all, fields(aggregate_id = %aggregate.id()), err)]
    pub async fn save(&self, aggregate: &mut A) -> Result<(), StoreError> {
        let pending = aggregate.drain_pending_events();
        if pending.is_empty() {
            return Ok(());
        }

        let id = aggregate.id().to_string();
        let base_version = aggregate.version();
        let count = pending.len() as i64;

        let events: Vec<_> = pending
            .into_iter()
            .zip(1..)
            .map(|(event, offset)| {
                event
                    .with_aggregate_id(id.clone())
                    .with_aggregate_type(A::NAME)
                    .with_version(base_version + offset)
            })
            .collect();

        self.store.append_to(&self.stream, events).await?;
        aggregate.set_version(base_version + count);
        Ok(())
    }

    /// Replays the identity's events into a fresh aggregate. Returns `None`
    /// when no events exist.
    pub async fn load(&self, id: &str) -> Result<Option<A>, StoreError> {
        let matcher = MetadataMatcher::new()
            .with(Metadata::AGGREGATE_ID, Operation::Equals, Value::from(id), FieldType::Metadata)?
            .with(
                Metadata::AGGREGATE_TYPE,
                Operation::Equals,
                Value::from(A::NAME),
                FieldType::Metadata,
            )?;

        let mut events = self.store.load(&self.stream, 1, Some(matcher)).await?;

        let mut aggregate = A::default();
        let mut version = 0;
        let mut replayed = false;
        while let Some(event) = events.next().await {
            let event = event?;
            version = event.metadata.aggregate_version().unwrap_or(version + 1);
            aggregate.apply(&event);
            replayed = true;
        }

        if !replayed {
            return Ok(None);
        }
        aggregate.set_version(version);
        Ok(Some(aggregate))
    }

    /// Like [`load`](Self::load) but absent aggregates are an error.
    pub async fn get(&self, id: &str) -> Result<A, StoreError> {
        self.load(id)
            .await?
            .ok_or_else(|| StoreError::AggregateNotFound(id.to_string()))
    }
}
