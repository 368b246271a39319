use std::time::Duration;

use typed_builder::TypedBuilder;

use crate::matcher::MetadataMatcher;

pub use manager::ProjectionManager;
pub use projector::{EventHandler, Projector, ProjectorContext};
pub use read_model::{
    InMemoryReadModel, ReadModel, ReadModelContext, ReadModelEventHandler, ReadModelOperation, ReadModelProjector,
};

mod manager;
mod projector;
mod read_model;

/// One source stream of a projection, declared during the build phase.
#[derive(Debug, Clone)]
pub struct SourceStream {
    pub stream: String,
    pub matcher: Option<MetadataMatcher>,
}

impl SourceStream {
    pub fn new(stream: impl Into<String>) -> Self {
        Self {
            stream: stream.into(),
            matcher: None,
        }
    }

    #[must_use]
    pub fn with_matcher(mut self, matcher: MetadataMatcher) -> Self {
        self.matcher = Some(matcher);
        self
    }
}

/// What a projection folds over: every registered stream or a declared list.
#[derive(Debug, Clone)]
pub(crate) enum Sources {
    All,
    Streams(Vec<SourceStream>),
}

/// Tuning knobs of a projector run.
#[derive(Debug, Clone, TypedBuilder)]
pub struct ProjectorOptions {
    /// How long an idle `keep_running` iteration sleeps before re-polling.
    #[builder(default = Duration::from_millis(100))]
    pub sleep_on_empty: Duration,
    /// Checkpoint interval within a fold, in handled events.
    #[builder(default = 1000)]
    pub persist_block_size: usize,
    /// Lease duration written to the projection record while running.
    #[builder(default = Duration::from_secs(1))]
    pub lock_ttl: Duration,
}

impl Default for ProjectorOptions {
    fn default() -> Self {
        Self::builder().build()
    }
}
