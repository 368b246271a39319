//! This crate gives you an opinionated way of implementing event sourcing
//! with named streams and long-running projections.
//!
//! Events are appended to named, append-only streams through the
//! [`EventStore`] facade and numbered by the store. Aggregate state is the
//! fold of an identity's events, reconstructed by an [`AggregateRepository`].
//! [`Projector`]s fold one or more streams into derived state (or, through a
//! [`ReadModelProjector`], into an external read model), checkpointing their
//! per-stream cursors so a run can resume where the previous one stopped.
//! The [`ProjectionManager`] controls running projectors cooperatively by
//! writing statuses the projectors poll.
//!
//! Persistence is pluggable behind the [`PersistenceStrategy`] trait. The
//! in-memory strategy ships by default; a Postgres strategy is available
//! behind the `postgres` feature.

pub use crate::aggregate::Aggregate;
pub use crate::error::{ProjectorError, StoreError};
pub use crate::event::{Event, Metadata};
pub use crate::matcher::{FieldType, MatchClause, MetadataMatcher, Operation};
pub use crate::projection::{
    EventHandler, InMemoryReadModel, ProjectionManager, Projector, ProjectorContext, ProjectorOptions, ReadModel,
    ReadModelContext, ReadModelEventHandler, ReadModelOperation, ReadModelProjector, SourceStream,
};
pub use crate::repository::AggregateRepository;
pub use crate::store::{
    EventAction, EventMiddleware, EventStore, EventStoreBuilder, EventStream, InMemoryPersistenceStrategy,
    InMemoryWriteLockStrategy, MiddlewareIterator, PersistenceStrategy, ProjectionRecord, ProjectionStatus,
    StreamSelection, WriteLockStrategy,
};

mod aggregate;
mod error;
mod event;
mod matcher;
mod projection;
mod repository;
mod store;

#[cfg(feature = "postgres")]
pub mod postgres {
    //! Provides Postgres implementations of the persistence contracts.
    pub use crate::store::postgres::{PgPersistenceStrategy, PgWriteLockStrategy};
}

pub mod types {
    //! Provides custom types.

    /// Position of an event within its stream; also the unit aggregate
    /// versions are counted in.
    pub type SequenceNumber = i64;
}
