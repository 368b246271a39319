use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::types::Json;
use uuid::Uuid;

use crate::event::{Event, Metadata};
use crate::types::SequenceNumber;

/// Event row as stored in a per-stream table.
#[derive(sqlx::FromRow)]
pub(crate) struct DbEvent {
    pub no: SequenceNumber,
    pub uuid: Uuid,
    pub name: String,
    pub payload: Json<Value>,
    pub metadata: Json<Metadata>,
    pub created_at: DateTime<Utc>,
}

impl From<DbEvent> for Event {
    fn from(row: DbEvent) -> Self {
        Self {
            no: row.no,
            uuid: row.uuid,
            name: row.name,
            payload: row.payload.0,
            metadata: row.metadata.0,
            created_at: row.created_at,
        }
    }
}
