use crate::types::SequenceNumber;

/// All failures surfaced by the engine.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The stream is already registered in the streams table.
    #[error("stream `{0}` already exists")]
    StreamAlreadyExists(String),
    /// The stream is not registered in the streams table.
    #[error("stream `{0}` not found")]
    StreamNotFound(String),
    /// An event with the same `(_aggregate_id, _aggregate_version)` pair is
    /// already persisted in the stream.
    #[error("concurrent modification of aggregate `{aggregate_id}` at version {version}")]
    Concurrency {
        aggregate_id: String,
        version: SequenceNumber,
    },
    /// No projection with this name is registered or persisted.
    #[error("projection `{0}` not found")]
    ProjectionNotFound(String),
    /// Another process holds the write lock of this projection.
    #[error("projection `{0}` is already being run by another process")]
    ProjectionAlreadyRunning(String),
    /// `AggregateRepository::get` found no events for the id.
    #[error("aggregate `{0}` not found")]
    AggregateNotFound(String),
    /// A match clause was built with an operand its operation cannot use.
    #[error("invalid match clause: {0}")]
    InvalidMatcher(String),
    /// Projector build-phase misuse.
    #[error(transparent)]
    Projector(#[from] ProjectorError),
    /// Serialization/deserialization error.
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    /// Sql error.
    #[cfg(feature = "postgres")]
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
    /// Error raised by a user-supplied hook (middleware, read model).
    #[error(transparent)]
    Custom(Box<dyn std::error::Error + Send + Sync>),
}

impl StoreError {
    /// Wraps a user hook error.
    pub fn custom(error: impl std::error::Error + Send + Sync + 'static) -> Self {
        Self::Custom(Box::new(error))
    }
}

/// Misuse of the projector build phase, raised before any event is touched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ProjectorError {
    #[error("projection state already initialized")]
    AlreadyInitialized,
    #[error("from_all/from_stream/from_streams was already called")]
    FromAlreadyCalled,
    #[error("no source streams configured, call from_all/from_stream/from_streams first")]
    FromNotCalled,
    #[error("when/when_any was already called")]
    WhenAlreadyCalled,
    #[error("neither when nor when_any handlers configured")]
    NoHandler,
    #[error("projection state not initialised, call init first")]
    StateNotInitialised,
    #[error("event handler name must be a non-empty string")]
    InvalidHandlerName,
}
