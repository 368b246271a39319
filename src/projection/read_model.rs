use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use futures::StreamExt;
use serde_json::Value;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::error::{ProjectorError, StoreError};
use crate::event::Event;
use crate::matcher::MetadataMatcher;
use crate::projection::{ProjectorOptions, SourceStream, Sources};
use crate::store::{EventStore, ProjectionRecord, ProjectionStatus, StreamSelection};
use crate::types::SequenceNumber;

/// A mutation queued against a read model, deferred until `persist`.
#[derive(Debug, Clone, PartialEq)]
pub enum ReadModelOperation {
    Insert { key: String, value: Value },
    Update { key: String, value: Value },
    Delete { key: String },
}

/// The user-supplied read-model contract: an external materialization owned
/// by one projection.
///
/// Mutations arrive through [`stack`](ReadModel::stack) and must only become
/// visible when [`persist`](ReadModel::persist) flushes the queue. The
/// projector persists the read model before checkpointing positions, so a
/// crash replays events into an idempotent `stack`/`persist` cycle.
#[async_trait]
pub trait ReadModel: Send + Sync {
    async fn init(&mut self) -> Result<(), StoreError>;

    async fn is_initialized(&self) -> Result<bool, StoreError>;

    /// Flushes every stacked operation.
    async fn persist(&mut self) -> Result<(), StoreError>;

    async fn delete(&mut self) -> Result<(), StoreError>;

    async fn reset(&mut self) -> Result<(), StoreError>;

    /// Queues one mutation.
    fn stack(&mut self, operation: ReadModelOperation);
}

/// Reference [`ReadModel`] keeping its rows in shared memory.
///
/// Clones share the same underlying table, so a factory can hand one clone
/// to the projector and keep another for assertions or queries.
#[derive(Clone, Default)]
pub struct InMemoryReadModel {
    rows: Arc<RwLock<Option<BTreeMap<String, Value>>>>,
    stacked: Vec<ReadModelOperation>,
}

impl InMemoryReadModel {
    pub fn new() -> Self {
        Self::default()
    }

    /// The current value under `key`, if the table is initialized.
    pub async fn row(&self, key: &str) -> Option<Value> {
        self.rows.read().await.as_ref().and_then(|rows| rows.get(key).cloned())
    }

    pub async fn row_count(&self) -> usize {
        self.rows.read().await.as_ref().map_or(0, BTreeMap::len)
    }
}

#[async_trait]
impl ReadModel for InMemoryReadModel {
    async fn init(&mut self) -> Result<(), StoreError> {
        let mut rows = self.rows.write().await;
        if rows.is_none() {
            *rows = Some(BTreeMap::new());
        }
        Ok(())
    }

    async fn is_initialized(&self) -> Result<bool, StoreError> {
        Ok(self.rows.read().await.is_some())
    }

    async fn persist(&mut self) -> Result<(), StoreError> {
        let mut guard = self.rows.write().await;
        let rows = guard.get_or_insert_with(BTreeMap::new);
        for operation in self.stacked.drain(..) {
            match operation {
                ReadModelOperation::Insert { key, value } | ReadModelOperation::Update { key, value } => {
                    rows.insert(key, value);
                }
                ReadModelOperation::Delete { key } => {
                    rows.remove(&key);
                }
            }
        }
        Ok(())
    }

    async fn delete(&mut self) -> Result<(), StoreError> {
        self.stacked.clear();
        *self.rows.write().await = None;
        Ok(())
    }

    async fn reset(&mut self) -> Result<(), StoreError> {
        self.stacked.clear();
        *self.rows.write().await = Some(BTreeMap::new());
        Ok(())
    }

    fn stack(&mut self, operation: ReadModelOperation) {
        self.stacked.push(operation);
    }
}

/// Handler invoked per event: receives the fold context, the current state
/// by value, and the event; returns the replacement state.
pub type ReadModelEventHandler = Arc<dyn Fn(&mut ReadModelContext, Value, &Event) -> Value + Send + Sync>;

enum Handlers {
    None,
    Any(ReadModelEventHandler),
    Map(HashMap<String, ReadModelEventHandler>),
}

/// Per-event side channel available to read-model handlers.
///
/// Stacked operations are forwarded to the owned read model before the fold
/// advances past the current event; `stop` ends the fold after it.
#[derive(Default)]
pub struct ReadModelContext {
    pub(crate) operations: Vec<ReadModelOperation>,
    pub(crate) stopped: bool,
}

impl ReadModelContext {
    /// Queues a mutation against the projection's read model.
    pub fn stack(&mut self, operation: ReadModelOperation) {
        self.operations.push(operation);
    }

    /// Ends the fold after the current event.
    pub fn stop(&mut self) {
        self.stopped = true;
    }
}

/// A [`Projector`](crate::projection::Projector) variant that drives an
/// external read model instead of emitting events.
///
/// The read model is owned for the duration of the run; on checkpoint it is
/// persisted first, positions second, so a crash between the two replays
/// events at-least-once into the read model.
pub struct ReadModelProjector {
    store: EventStore,
    name: String,
    options: ProjectorOptions,
    read_model: Box<dyn ReadModel>,
    state: Option<Value>,
    init_handler: Option<Arc<dyn Fn() -> Value + Send + Sync>>,
    sources: Option<Sources>,
    handlers: Handlers,
    positions: BTreeMap<String, SequenceNumber>,
    is_stopped: bool,
    lock_owner: Option<Uuid>,
}

impl ReadModelProjector {
    pub(crate) fn new(store: EventStore, name: impl Into<String>, read_model: Box<dyn ReadModel>) -> Self {
        Self {
            store,
            name: name.into(),
            options: ProjectorOptions::default(),
            read_model,
            state: None,
            init_handler: None,
            sources: None,
            handlers: Handlers::None,
            positions: BTreeMap::new(),
            is_stopped: false,
            lock_owner: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> Option<&Value> {
        self.state.as_ref()
    }

    pub fn positions(&self) -> &BTreeMap<String, SequenceNumber> {
        &self.positions
    }

    pub fn read_model(&mut self) -> &mut dyn ReadModel {
        &mut *self.read_model
    }

    #[must_use]
    pub fn with_options(mut self, options: ProjectorOptions) -> Self {
        self.options = options;
        self
    }

    // Build phase.

    /// Sets the initial state through a factory, re-run on reset and delete.
    pub fn init(mut self, factory: impl Fn() -> Value + Send + Sync + 'static) -> Result<Self, StoreError> {
        if self.init_handler.is_some() {
            return Err(ProjectorError::AlreadyInitialized.into());
        }
        self.state = Some(factory());
        self.init_handler = Some(Arc::new(factory));
        Ok(self)
    }

    pub fn from_all(mut self) -> Result<Self, StoreError> {
        if self.sources.is_some() {
            return Err(ProjectorError::FromAlreadyCalled.into());
        }
        self.sources = Some(Sources::All);
        Ok(self)
    }

    pub fn from_stream(self, source: SourceStream) -> Result<Self, StoreError> {
        self.from_streams(vec![source])
    }

    pub fn from_streams(mut self, sources: Vec<SourceStream>) -> Result<Self, StoreError> {
        if self.sources.is_some() {
            return Err(ProjectorError::FromAlreadyCalled.into());
        }
        self.sources = Some(Sources::Streams(sources));
        Ok(self)
    }

    /// Registers one handler per event name. Events with no handler are
    /// skipped (their position still advances).
    pub fn when(mut self, handlers: Vec<(String, ReadModelEventHandler)>) -> Result<Self, StoreError> {
        if !matches!(self.handlers, Handlers::None) {
            return Err(ProjectorError::WhenAlreadyCalled.into());
        }
        let mut map = HashMap::with_capacity(handlers.len());
        for (name, handler) in handlers {
            if name.is_empty() {
                return Err(ProjectorError::InvalidHandlerName.into());
            }
            map.insert(name, handler);
        }
        self.handlers = Handlers::Map(map);
        Ok(self)
    }

    /// Registers a single handler invoked for every event.
    pub fn when_any(
        mut self,
        handler: impl Fn(&mut ReadModelContext, Value, &Event) -> Value + Send + Sync + 'static,
    ) -> Result<Self, StoreError> {
        if !matches!(self.handlers, Handlers::None) {
            return Err(ProjectorError::WhenAlreadyCalled.into());
        }
        self.handlers = Handlers::Any(Arc::new(handler));
        Ok(self)
    }

    // Run phase.

    /// Runs the fold; see [`Projector::run`](crate::projection::Projector::run)
    /// for the shared protocol. Additionally initializes the read model
    /// before the first iteration.
    #[tracing::instrument(skip(self), fields(projection = %self.name), err)]
    pub async fn run(&mut self, keep_running: bool) -> Result<(), StoreError> {
        if matches!(self.handlers, Handlers::None) {
            return Err(ProjectorError::NoHandler.into());
        }
        if self.state.is_none() {
            return Err(ProjectorError::StateNotInitialised.into());
        }

        let lock = format!("projection:{}", self.name);
        if !self.store.write_locks().create_lock(&lock).await {
            return Err(StoreError::ProjectionAlreadyRunning(self.name.clone()));
        }

        let result = self.run_inner(keep_running).await;
        self.store.write_locks().release_lock(&lock).await;
        result
    }

    async fn run_inner(&mut self, keep_running: bool) -> Result<(), StoreError> {
        if self.handle_status(keep_running, true).await? {
            return Ok(());
        }

        let persistence = self.store.persistence();
        if persistence.fetch_projection(&self.name).await?.is_none() {
            persistence.persist_projection(&ProjectionRecord::new(&self.name)).await?;
        }

        if !self.read_model.is_initialized().await? {
            self.read_model.init().await?;
        }

        self.prepare_stream_positions().await?;
        self.load().await?;
        self.is_stopped = false;
        self.lock_owner = Some(Uuid::new_v4());
        persistence
            .update_projection_status(&self.name, ProjectionStatus::Running)
            .await?;

        let mut handled_in_block = 0usize;
        loop {
            let mut events = self.store.merge_and_load(self.selections()).await?;
            let mut handled_any = false;

            while let Some(event) = events.next().await {
                let event = event?;
                handled_any = true;
                self.handle_event(event)?;
                handled_in_block += 1;
                if handled_in_block >= self.options.persist_block_size {
                    self.persist(ProjectionStatus::Running).await?;
                    handled_in_block = 0;
                }
                if self.is_stopped {
                    break;
                }
            }
            drop(events);

            if self.is_stopped {
                break;
            }
            if self.handle_status(keep_running, false).await? {
                return Ok(());
            }
            self.prepare_stream_positions().await?;

            if !keep_running || self.is_stopped {
                break;
            }
            if !handled_any {
                tokio::time::sleep(self.options.sleep_on_empty).await;
            }
        }

        self.lock_owner = None;
        self.persist(ProjectionStatus::Idle).await
    }

    /// Applies a remotely requested transition. Returns true when the run
    /// must end without a further checkpoint. On the initial poll the
    /// persisted checkpoint is loaded before a stop persists, so the stop
    /// cannot clobber the record with pristine state.
    async fn handle_status(&mut self, keep_running: bool, initial: bool) -> Result<bool, StoreError> {
        match self.store.projection_manager().fetch_projection_status(&self.name).await {
            ProjectionStatus::Stopping => {
                if initial {
                    self.load().await?;
                }
                self.lock_owner = None;
                self.persist(ProjectionStatus::Idle).await?;
                self.is_stopped = true;
                Ok(true)
            }
            ProjectionStatus::Deleting => {
                self.delete(false).await?;
                Ok(true)
            }
            ProjectionStatus::DeletingInclEmittedEvents => {
                self.delete(true).await?;
                Ok(true)
            }
            ProjectionStatus::Resetting => {
                self.reset().await?;
                if keep_running {
                    self.store
                        .persistence()
                        .update_projection_status(&self.name, ProjectionStatus::Running)
                        .await?;
                }
                Ok(false)
            }
            ProjectionStatus::Idle | ProjectionStatus::Running => Ok(false),
        }
    }

    async fn prepare_stream_positions(&mut self) -> Result<(), StoreError> {
        let streams: Vec<String> = match &self.sources {
            Some(Sources::All) => self.store.stream_names().await?,
            Some(Sources::Streams(sources)) => sources.iter().map(|source| source.stream.clone()).collect(),
            None => return Err(ProjectorError::FromNotCalled.into()),
        };

        for stream in streams {
            self.positions.entry(stream).or_insert(0);
        }
        Ok(())
    }

    async fn load(&mut self) -> Result<(), StoreError> {
        if let Some(record) = self.store.persistence().fetch_projection(&self.name).await? {
            if !record.state.is_null() {
                self.state = Some(record.state);
            }
            for (stream, position) in record.positions {
                self.positions.insert(stream, position);
            }
        }
        Ok(())
    }

    fn selections(&self) -> Vec<StreamSelection> {
        self.positions
            .iter()
            .map(|(stream, position)| {
                let matcher: Option<MetadataMatcher> = match &self.sources {
                    Some(Sources::Streams(sources)) => sources
                        .iter()
                        .find(|source| &source.stream == stream)
                        .and_then(|source| source.matcher.clone()),
                    _ => None,
                };
                StreamSelection {
                    stream: stream.clone(),
                    from: position + 1,
                    matcher,
                }
            })
            .collect()
    }

    fn handle_event(&mut self, event: Event) -> Result<(), StoreError> {
        if let Some(stream) = event.metadata.stream() {
            self.positions.insert(stream.to_string(), event.no);
        }

        let handler = match &self.handlers {
            Handlers::Any(handler) => Some(Arc::clone(handler)),
            Handlers::Map(map) => map.get(event.name()).cloned(),
            Handlers::None => None,
        };
        let Some(handler) = handler else {
            return Ok(());
        };

        let state = self.state.take().unwrap_or(Value::Null);
        let mut context = ReadModelContext::default();
        self.state = Some(handler(&mut context, state, &event));

        for operation in context.operations.drain(..) {
            self.read_model.stack(operation);
        }
        if context.stopped {
            self.is_stopped = true;
        }
        Ok(())
    }

    /// Clears the checkpoint, resets the read model, re-runs the init
    /// handler and writes a fresh idle record.
    pub async fn reset(&mut self) -> Result<(), StoreError> {
        self.prepare_stream_positions().await?;
        for position in self.positions.values_mut() {
            *position = 0;
        }
        self.read_model.reset().await?;
        if let Some(init) = &self.init_handler {
            self.state = Some(init());
        }
        self.lock_owner = None;
        self.persist_record(ProjectionStatus::Idle).await
    }

    /// Removes the projection record and stops the fold. With
    /// `delete_read_model`, the owned read model is wiped too.
    pub async fn delete(&mut self, delete_read_model: bool) -> Result<(), StoreError> {
        self.store.persistence().delete_projection(&self.name).await?;
        self.is_stopped = true;
        self.positions.clear();
        if let Some(init) = &self.init_handler {
            self.state = Some(init());
        }
        if delete_read_model {
            self.read_model.delete().await?;
        }
        Ok(())
    }

    /// Read-model flush first, positions second: the crash window between
    /// the two only ever causes re-application, never a skipped event.
    async fn persist(&mut self, status: ProjectionStatus) -> Result<(), StoreError> {
        self.read_model.persist().await?;
        self.persist_record(status).await
    }

    async fn persist_record(&mut self, status: ProjectionStatus) -> Result<(), StoreError> {
        let running = status == ProjectionStatus::Running;
        let record = ProjectionRecord {
            name: self.name.clone(),
            state: self.state.clone().unwrap_or(Value::Null),
            positions: self.positions.clone(),
            status,
            locked_until: running
                .then(|| Utc::now() + chrono::Duration::milliseconds(self.options.lock_ttl.as_millis() as i64)),
            lock_owner: if running { self.lock_owner } else { None },
        };
        self.store.persistence().persist_projection(&record).await
    }
}
