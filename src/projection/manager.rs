use crate::error::StoreError;
use crate::projection::{Projector, ReadModel, ReadModelProjector};
use crate::store::{EventStore, ProjectionStatus};

/// Registry and control channel for projectors.
///
/// The manager never invokes a projector directly: it writes the desired
/// status onto the projection record, and the projector polls and reacts at
/// its next suspension point.
#[derive(Clone)]
pub struct ProjectionManager {
    store: EventStore,
}

impl ProjectionManager {
    pub fn new(store: EventStore) -> Self {
        Self { store }
    }

    /// Returns a bare projector bound to this manager's store. The build
    /// phase (`init`, `from_*`, `when*`) is the caller's job.
    pub fn create_projector(&self, name: impl Into<String>) -> Projector {
        Projector::new(self.store.clone(), name)
    }

    /// Returns a bare read-model projector owning the given read model.
    pub fn create_read_model_projector(
        &self,
        name: impl Into<String>,
        read_model: Box<dyn ReadModel>,
    ) -> ReadModelProjector {
        ReadModelProjector::new(self.store.clone(), name, read_model)
    }

    /// The persisted status of the projection.
    ///
    /// Fails open: a missing record or a back-end error reads as `Running`,
    /// so transient failures never stop a healthy projector.
    pub async fn fetch_projection_status(&self, name: &str) -> ProjectionStatus {
        match self.store.persistence().fetch_projection(name).await {
            Ok(Some(record)) => record.status,
            Ok(None) => ProjectionStatus::Running,
            Err(error) => {
                tracing::warn!(projection = name, error = %error, "status fetch failed, assuming running");
                ProjectionStatus::Running
            }
        }
    }

    /// All persisted projection names, optionally filtered by prefix.
    pub async fn fetch_projection_names(&self, prefix: Option<&str>) -> Result<Vec<String>, StoreError> {
        self.store.persistence().fetch_projection_names(prefix).await
    }

    /// The persisted state of the projection.
    pub async fn fetch_projection_state(&self, name: &str) -> Result<serde_json::Value, StoreError> {
        Ok(self.fetch_record(name).await?.state)
    }

    /// The persisted per-stream positions of the projection.
    pub async fn fetch_projection_stream_positions(
        &self,
        name: &str,
    ) -> Result<std::collections::BTreeMap<String, crate::types::SequenceNumber>, StoreError> {
        Ok(self.fetch_record(name).await?.positions)
    }

    async fn fetch_record(&self, name: &str) -> Result<crate::store::ProjectionRecord, StoreError> {
        self.store
            .persistence()
            .fetch_projection(name)
            .await?
            .ok_or_else(|| StoreError::ProjectionNotFound(name.to_string()))
    }

    /// Marks the projection idle.
    pub async fn idle_projection(&self, name: &str) -> Result<(), StoreError> {
        self.update_status(name, ProjectionStatus::Idle).await
    }

    /// Asks the projector to stop after its in-flight event.
    pub async fn stop_projection(&self, name: &str) -> Result<(), StoreError> {
        self.update_status(name, ProjectionStatus::Stopping).await
    }

    /// Asks the projector to clear its checkpoint and start over.
    pub async fn reset_projection(&self, name: &str) -> Result<(), StoreError> {
        self.update_status(name, ProjectionStatus::Resetting).await
    }

    /// Asks the projector to remove itself; with `include_emitted`, its
    /// emitted stream (or owned read model) goes too.
    pub async fn delete_projection(&self, name: &str, include_emitted: bool) -> Result<(), StoreError> {
        let status = if include_emitted {
            ProjectionStatus::DeletingInclEmittedEvents
        } else {
            ProjectionStatus::Deleting
        };
        self.update_status(name, status).await
    }

    async fn update_status(&self, name: &str, status: ProjectionStatus) -> Result<(), StoreError> {
        self.store.persistence().update_projection_status(name, status).await
    }
}
