use std::collections::HashMap;
use std::sync::Arc;

use crate::aggregate::Aggregate;
use crate::error::StoreError;
use crate::event::Event;
use crate::matcher::MetadataMatcher;
use crate::projection::{ProjectionManager, Projector, ReadModel, ReadModelProjector};
use crate::repository::AggregateRepository;
use crate::types::SequenceNumber;

pub use memory::{InMemoryPersistenceStrategy, InMemoryWriteLockStrategy};
pub use middleware::{EventAction, EventMiddleware, MiddlewareIterator};
pub use persistence::{
    EventStream, PersistenceStrategy, ProjectionRecord, ProjectionStatus, StreamSelection, WriteLockStrategy,
};
#[cfg(test)]
pub(crate) use persistence::MockWriteLockStrategy;

mod memory;
mod merge;
mod middleware;
mod persistence;
#[cfg(feature = "postgres")]
pub mod postgres;

type ProjectionSetup = Arc<dyn Fn(Projector) -> Result<Projector, StoreError> + Send + Sync>;
type ReadModelFactory = Arc<dyn Fn() -> Box<dyn ReadModel> + Send + Sync>;
type ReadModelProjectionSetup = Arc<dyn Fn(ReadModelProjector) -> Result<ReadModelProjector, StoreError> + Send + Sync>;

/// Facade over one [`PersistenceStrategy`]: stream lifecycle, the append
/// middleware chain, filtered and merged loads, repositories and the
/// projection registry.
///
/// The store is protected by an [`Arc`] that allows it to be cloneable still
/// having the same memory reference.
#[derive(Clone)]
pub struct EventStore {
    inner: Arc<InnerEventStore>,
}

impl std::fmt::Debug for EventStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventStore").finish_non_exhaustive()
    }
}

struct InnerEventStore {
    persistence: Arc<dyn PersistenceStrategy>,
    write_locks: Arc<dyn WriteLockStrategy>,
    pre_append: Vec<Arc<dyn EventMiddleware>>,
    appended: Vec<Arc<dyn EventMiddleware>>,
    append_errored: Vec<Arc<dyn EventMiddleware>>,
    loaded: Vec<Arc<dyn EventMiddleware>>,
    projections: HashMap<String, ProjectionSetup>,
    read_model_projections: HashMap<String, (ReadModelFactory, ReadModelProjectionSetup)>,
}

impl EventStore {
    pub fn builder(persistence: impl PersistenceStrategy + 'static) -> EventStoreBuilder {
        EventStoreBuilder::new(Arc::new(persistence))
    }

    /// Creates both logical tables. Idempotent.
    pub async fn install(&self) -> Result<(), StoreError> {
        self.inner.persistence.create_event_streams_table().await?;
        self.inner.persistence.create_projections_table().await
    }

    /// Registers the stream, then creates its physical storage. When storage
    /// creation fails the registration is rolled back, a storage drop is
    /// attempted, and the error surfaces.
    #[tracing::instrument(skip(self), err)]
    pub async fn create_stream(&self, stream: &str) -> Result<(), StoreError> {
        if let Err(error) = self.inner.persistence.add_stream_to_streams_table(stream).await {
            tracing::warn!(stream, error = %error, "stream registration failed");
            return Err(error);
        }

        if let Err(error) = self.inner.persistence.create_schema(stream).await {
            let _ = self.inner.persistence.remove_stream_from_streams_table(stream).await;
            let _ = self.inner.persistence.drop_schema(stream).await;
            return Err(error);
        }

        Ok(())
    }

    /// Unregisters the stream and drops its storage. Unknown streams yield
    /// [`StoreError::StreamNotFound`].
    #[tracing::instrument(skip(self), err)]
    pub async fn delete_stream(&self, stream: &str) -> Result<(), StoreError> {
        self.inner.persistence.remove_stream_from_streams_table(stream).await?;
        self.inner.persistence.drop_schema(stream).await
    }

    pub async fn has_stream(&self, stream: &str) -> Result<bool, StoreError> {
        self.inner.persistence.has_stream(stream).await
    }

    pub async fn stream_names(&self) -> Result<Vec<String>, StoreError> {
        self.inner.persistence.fetch_stream_names().await
    }

    /// Appends the batch, piping every event through the PRE_APPEND chain
    /// first. A failing PRE_APPEND middleware aborts the append; APPENDED and
    /// APPEND_ERRORED middlewares only observe and their failures are logged.
    #[tracing::instrument(skip_all, fields(stream = %stream), err)]
    pub async fn append_to(&self, stream: &str, events: Vec<Event>) -> Result<(), StoreError> {
        if events.is_empty() {
            return Ok(());
        }

        let mut prepared = Vec::with_capacity(events.len());
        for mut event in events {
            for middleware in &self.inner.pre_append {
                event = middleware.apply(event).await?;
            }
            prepared.push(event);
        }

        let on_error = if self.inner.append_errored.is_empty() {
            Vec::new()
        } else {
            prepared.clone()
        };

        match self.inner.persistence.append_to(stream, prepared).await {
            Ok(stored) => {
                for event in &stored {
                    self.observe(&self.inner.appended, event, "appended").await;
                }
                Ok(())
            }
            Err(error) => {
                for event in &on_error {
                    self.observe(&self.inner.append_errored, event, "append_errored").await;
                }
                Err(error)
            }
        }
    }

    async fn observe(&self, middlewares: &[Arc<dyn EventMiddleware>], event: &Event, action: &'static str) {
        for middleware in middlewares {
            if let Err(error) = middleware.apply(event.clone()).await {
                tracing::error!(
                    action,
                    event_id = %event.uuid,
                    middleware = middleware.name(),
                    error = ?error,
                    "observer middleware failed"
                );
            }
        }
    }

    /// Lazy iteration over one stream from `from`, LOADED middlewares applied
    /// per pull.
    pub async fn load(
        &self,
        stream: &str,
        from: SequenceNumber,
        matcher: Option<MetadataMatcher>,
    ) -> Result<MiddlewareIterator, StoreError> {
        let events = self.inner.persistence.load(stream, from, None, matcher).await?;
        Ok(MiddlewareIterator::new(events, self.inner.loaded.clone()))
    }

    /// Time-ordered merged iteration over several streams, LOADED middlewares
    /// applied per pull.
    pub async fn merge_and_load(&self, selections: Vec<StreamSelection>) -> Result<MiddlewareIterator, StoreError> {
        let events = self.inner.persistence.merge_and_load(selections).await?;
        Ok(MiddlewareIterator::new(events, self.inner.loaded.clone()))
    }

    /// Returns a new repository for `A`, bound to this store and the given
    /// stream. Calling this again for the same aggregate type replaces the
    /// prior binding.
    pub fn create_repository<A: Aggregate>(&self, stream: impl Into<String>) -> AggregateRepository<A> {
        AggregateRepository::new(self.clone(), stream)
    }

    pub fn projection_manager(&self) -> ProjectionManager {
        ProjectionManager::new(self.clone())
    }

    /// Returns the registered projector, configured by its setup.
    pub fn get_projector(&self, name: &str) -> Result<Projector, StoreError> {
        let setup = self
            .inner
            .projections
            .get(name)
            .ok_or_else(|| StoreError::ProjectionNotFound(name.to_string()))?;
        setup(self.projection_manager().create_projector(name))
    }

    /// Returns the registered read-model projector, configured by its setup
    /// and owning a read model built by the registered factory.
    pub fn get_read_model_projector(&self, name: &str) -> Result<ReadModelProjector, StoreError> {
        let (factory, setup) = self
            .inner
            .read_model_projections
            .get(name)
            .ok_or_else(|| StoreError::ProjectionNotFound(name.to_string()))?;
        setup(self.projection_manager().create_read_model_projector(name, factory()))
    }

    pub(crate) fn persistence(&self) -> Arc<dyn PersistenceStrategy> {
        Arc::clone(&self.inner.persistence)
    }

    pub(crate) fn write_locks(&self) -> Arc<dyn WriteLockStrategy> {
        Arc::clone(&self.inner.write_locks)
    }
}

/// Struct used to build a brand new [`EventStore`].
pub struct EventStoreBuilder {
    persistence: Arc<dyn PersistenceStrategy>,
    write_locks: Arc<dyn WriteLockStrategy>,
    pre_append: Vec<Arc<dyn EventMiddleware>>,
    appended: Vec<Arc<dyn EventMiddleware>>,
    append_errored: Vec<Arc<dyn EventMiddleware>>,
    loaded: Vec<Arc<dyn EventMiddleware>>,
    projections: HashMap<String, ProjectionSetup>,
    read_model_projections: HashMap<String, (ReadModelFactory, ReadModelProjectionSetup)>,
}

impl EventStoreBuilder {
    fn new(persistence: Arc<dyn PersistenceStrategy>) -> Self {
        Self {
            persistence,
            write_locks: Arc::new(InMemoryWriteLockStrategy::new()),
            pre_append: vec![],
            appended: vec![],
            append_errored: vec![],
            loaded: vec![],
            projections: HashMap::new(),
            read_model_projections: HashMap::new(),
        }
    }

    /// Replaces the default in-memory write-lock strategy.
    pub fn with_write_lock_strategy(mut self, write_locks: impl WriteLockStrategy + 'static) -> Self {
        self.write_locks = Arc::new(write_locks);
        self
    }

    /// Registers a middleware under the given action bucket. Middlewares of
    /// one bucket run in registration order.
    pub fn add_middleware(mut self, action: EventAction, middleware: impl EventMiddleware + 'static) -> Self {
        let middleware: Arc<dyn EventMiddleware> = Arc::new(middleware);
        match action {
            EventAction::PreAppend => self.pre_append.push(middleware),
            EventAction::Appended => self.appended.push(middleware),
            EventAction::AppendErrored => self.append_errored.push(middleware),
            EventAction::Loaded => self.loaded.push(middleware),
        }
        self
    }

    /// Registers a projection. The setup closure receives a bare projector
    /// and performs the build phase (`init`, `from_*`, `when*`).
    pub fn add_projection(
        mut self,
        name: impl Into<String>,
        setup: impl Fn(Projector) -> Result<Projector, StoreError> + Send + Sync + 'static,
    ) -> Self {
        self.projections.insert(name.into(), Arc::new(setup));
        self
    }

    /// Registers a read-model projection together with the factory producing
    /// its read model.
    pub fn add_read_model_projection(
        mut self,
        name: impl Into<String>,
        read_model: impl Fn() -> Box<dyn ReadModel> + Send + Sync + 'static,
        setup: impl Fn(ReadModelProjector) -> Result<ReadModelProjector, StoreError> + Send + Sync + 'static,
    ) -> Self {
        self.read_model_projections
            .insert(name.into(), (Arc::new(read_model), Arc::new(setup)));
        self
    }

    /// Builds the store and eagerly instantiates every registered projection
    /// once, so build-phase misuse surfaces here instead of at first run.
    pub fn try_build(self) -> Result<EventStore, StoreError> {
        let store = EventStore {
            inner: Arc::new(InnerEventStore {
                persistence: self.persistence,
                write_locks: self.write_locks,
                pre_append: self.pre_append,
                appended: self.appended,
                append_errored: self.append_errored,
                loaded: self.loaded,
                projections: self.projections,
                read_model_projections: self.read_model_projections,
            }),
        };

        let manager = store.projection_manager();
        for (name, setup) in &store.inner.projections {
            let _ = setup(manager.create_projector(name.clone()))?;
        }
        for (name, (factory, setup)) in &store.inner.read_model_projections {
            let _ = setup(manager.create_read_model_projector(name.clone(), factory()))?;
        }

        Ok(store)
    }
}
