use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use chrono::Utc;
use futures::StreamExt;
use serde_json::Value;
use uuid::Uuid;

use crate::error::{ProjectorError, StoreError};
use crate::event::Event;
use crate::matcher::MetadataMatcher;
use crate::projection::{ProjectorOptions, SourceStream, Sources};
use crate::store::{EventStore, ProjectionRecord, ProjectionStatus, StreamSelection};
use crate::types::SequenceNumber;

/// Handler invoked per event: receives the fold context, the current state
/// by value, and the event; returns the replacement state.
pub type EventHandler = Arc<dyn Fn(&mut ProjectorContext, Value, &Event) -> Value + Send + Sync>;

enum Handlers {
    None,
    Any(EventHandler),
    Map(HashMap<String, EventHandler>),
}

/// Per-event side channel available to handlers.
///
/// Emits are buffered and flushed by the projector before it advances past
/// the current event; `stop` ends the fold after the current event.
#[derive(Default)]
pub struct ProjectorContext {
    pub(crate) emitted: Vec<(Option<String>, Event)>,
    pub(crate) stopped: bool,
}

impl ProjectorContext {
    /// Writes the event to the projection's own stream.
    pub fn emit(&mut self, event: Event) {
        self.emitted.push((None, event));
    }

    /// Writes the event to an arbitrary stream, creating it if necessary.
    pub fn link_to(&mut self, stream: impl Into<String>, event: Event) {
        self.emitted.push((Some(stream.into()), event));
    }

    /// Ends the fold after the current event.
    pub fn stop(&mut self) {
        self.stopped = true;
    }
}

/// A named, resumable fold over one or more streams.
///
/// Built in three steps (`init`, exactly one `from_*`, exactly one `when*`)
/// and then driven with [`run`](Projector::run). Cooperates with the
/// [`ProjectionManager`](crate::projection::ProjectionManager) by polling
/// the persisted status at its suspension points.
pub struct Projector {
    store: EventStore,
    name: String,
    options: ProjectorOptions,
    state: Option<Value>,
    init_handler: Option<Arc<dyn Fn() -> Value + Send + Sync>>,
    sources: Option<Sources>,
    handlers: Handlers,
    positions: BTreeMap<String, SequenceNumber>,
    is_stopped: bool,
    stream_created: bool,
    lock_owner: Option<Uuid>,
}

impl std::fmt::Debug for Projector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Projector").field("name", &self.name).finish_non_exhaustive()
    }
}

impl Projector {
    pub(crate) fn new(store: EventStore, name: impl Into<String>) -> Self {
        Self {
            store,
            name: name.into(),
            options: ProjectorOptions::default(),
            state: None,
            init_handler: None,
            sources: None,
            handlers: Handlers::None,
            positions: BTreeMap::new(),
            is_stopped: false,
            stream_created: false,
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

    /// Folds over every stream registered in the store, including streams
    /// that appear while the projector runs.
    pub fn from_all(mut self) -> Result<Self, StoreError> {
        if self.sources.is_some() {
            return Err(ProjectorError::FromAlreadyCalled.into());
        }
        self.sources = Some(Sources::All);
        Ok(self)
    }

    /// Folds over one stream, optionally filtered.
    pub fn from_stream(self, source: SourceStream) -> Result<Self, StoreError> {
        self.from_streams(vec![source])
    }

    /// Folds over the declared streams, each optionally filtered.
    pub fn from_streams(mut self, sources: Vec<SourceStream>) -> Result<Self, StoreError> {
        if self.sources.is_some() {
            return Err(ProjectorError::FromAlreadyCalled.into());
        }
        self.sources = Some(Sources::Streams(sources));
        Ok(self)
    }

    /// Registers one handler per event name. Events with no handler are
    /// skipped (their position still advances).
    pub fn when(mut self, handlers: Vec<(String, EventHandler)>) -> Result<Self, StoreError> {
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
        handler: impl Fn(&mut ProjectorContext, Value, &Event) -> Value + Send + Sync + 'static,
    ) -> Result<Self, StoreError> {
        if !matches!(self.handlers, Handlers::None) {
            return Err(ProjectorError::WhenAlreadyCalled.into());
        }
        self.handlers = Handlers::Any(Arc::new(handler));
        Ok(self)
    }

    // Run phase.

    /// Runs the fold. With `keep_running`, iterates until a stop, reset or
    /// delete signal arrives through the projection record; otherwise
    /// processes what is currently in the streams and checkpoints once.
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
                self.handle_event(event).await?;
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

    /// Ensures a cursor exists for every source stream. Under `from_all`,
    /// streams registered after the last iteration are picked up here.
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

    /// Reads the persisted checkpoint into memory. A never-persisted state
    /// (`Value::Null`) keeps the init state.
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

    async fn handle_event(&mut self, event: Event) -> Result<(), StoreError> {
        // The cursor advances to the event's actual number, handler or not,
        // so filtered streams checkpoint correctly.
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
        let mut context = ProjectorContext::default();
        self.state = Some(handler(&mut context, state, &event));

        for (target, emitted) in context.emitted.drain(..) {
            match target {
                None => self.emit(emitted).await?,
                Some(stream) => self.link_to(&stream, emitted).await?,
            }
        }
        if context.stopped {
            self.is_stopped = true;
        }
        Ok(())
    }

    /// Appends to the stream named like the projection, creating it on first
    /// use.
    pub async fn emit(&mut self, event: Event) -> Result<(), StoreError> {
        let stream = self.name.clone();
        if !self.stream_created {
            if !self.store.has_stream(&stream).await? {
                self.store.create_stream(&stream).await?;
            }
            self.stream_created = true;
        }
        self.store.append_to(&stream, vec![event]).await
    }

    /// Appends to an arbitrary stream, creating it if necessary.
    pub async fn link_to(&mut self, stream: &str, event: Event) -> Result<(), StoreError> {
        if !self.store.has_stream(stream).await? {
            self.store.create_stream(stream).await?;
        }
        self.store.append_to(stream, vec![event]).await
    }

    /// Clears the checkpoint, re-runs the init handler, writes a fresh idle
    /// record and drops the emitted stream.
    pub async fn reset(&mut self) -> Result<(), StoreError> {
        self.prepare_stream_positions().await?;
        for position in self.positions.values_mut() {
            *position = 0;
        }
        if let Some(init) = &self.init_handler {
            self.state = Some(init());
        }
        self.lock_owner = None;
        self.persist(ProjectionStatus::Idle).await?;
        self.delete_emitted_stream().await?;
        self.stream_created = false;
        Ok(())
    }

    /// Removes the projection record and stops the fold. With
    /// `include_emitted`, the projection's own stream is dropped too.
    pub async fn delete(&mut self, include_emitted: bool) -> Result<(), StoreError> {
        self.store.persistence().delete_projection(&self.name).await?;
        self.is_stopped = true;
        self.positions.clear();
        if let Some(init) = &self.init_handler {
            self.state = Some(init());
        }
        if include_emitted {
            self.delete_emitted_stream().await?;
            self.stream_created = false;
        }
        Ok(())
    }

    async fn delete_emitted_stream(&self) -> Result<(), StoreError> {
        match self.store.delete_stream(&self.name).await {
            Ok(()) | Err(StoreError::StreamNotFound(_)) => Ok(()),
            Err(error) => Err(error),
        }
    }

    /// Writes state and positions back to the projection record.
    async fn persist(&mut self, status: ProjectionStatus) -> Result<(), StoreError> {
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
