use std::collections::{BTreeMap, HashMap, VecDeque};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream;
use serde_json::Value;
use sqlx::pool::PoolConnection;
use sqlx::types::Json;
use sqlx::{Pool, Postgres};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::error::StoreError;
use crate::event::Event;
use crate::matcher::MetadataMatcher;
use crate::store::persistence::{
    EventStream, PersistenceStrategy, ProjectionRecord, ProjectionStatus, WriteLockStrategy,
};
use crate::types::SequenceNumber;

use self::event::DbEvent;
use self::migrations::Migrations;
use self::statements::Statements;

mod event;
mod migrations;
mod statements;

/// How many rows one keyset-paginated `load` round-trip fetches.
const LOAD_BATCH_SIZE: usize = 1000;

/// Postgres implementation of the [`PersistenceStrategy`].
///
/// Streams live in one table each (`"{stream}_events"`), registered through
/// the `event_streams` table; projection records live in `projections`.
/// Appends are serialized per stream with a transaction-scoped advisory
/// lock, which keeps `no` values dense under concurrent writers; duplicate
/// `(_aggregate_id, _aggregate_version)` pairs are rejected by a partial
/// unique index.
#[derive(Clone)]
pub struct PgPersistenceStrategy {
    pool: Pool<Postgres>,
}

impl PgPersistenceStrategy {
    pub fn new(pool: Pool<Postgres>) -> Self {
        Self { pool }
    }
}

fn is_unique_violation(error: &sqlx::Error) -> bool {
    matches!(error, sqlx::Error::Database(db) if db.code().as_deref() == Some("23505"))
}

#[async_trait]
impl PersistenceStrategy for PgPersistenceStrategy {
    async fn create_event_streams_table(&self) -> Result<(), StoreError> {
        Migrations::run(&self.pool).await?;
        Ok(())
    }

    async fn create_projections_table(&self) -> Result<(), StoreError> {
        Migrations::run(&self.pool).await?;
        Ok(())
    }

    async fn add_stream_to_streams_table(&self, stream: &str) -> Result<(), StoreError> {
        let result = sqlx::query(statements::ADD_STREAM).bind(stream).execute(&self.pool).await;
        match result {
            Ok(_) => Ok(()),
            Err(error) if is_unique_violation(&error) => Err(StoreError::StreamAlreadyExists(stream.to_string())),
            Err(error) => Err(error.into()),
        }
    }

    async fn remove_stream_from_streams_table(&self, stream: &str) -> Result<(), StoreError> {
        let result = sqlx::query(statements::REMOVE_STREAM).bind(stream).execute(&self.pool).await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::StreamNotFound(stream.to_string()));
        }
        Ok(())
    }

    async fn create_schema(&self, stream: &str) -> Result<(), StoreError> {
        let statements = Statements::new(stream);
        let _ = sqlx::query(statements.create_table()).execute(&self.pool).await?;
        let _ = sqlx::query(statements.create_aggregate_index()).execute(&self.pool).await?;
        Ok(())
    }

    async fn drop_schema(&self, stream: &str) -> Result<(), StoreError> {
        let statements = Statements::new(stream);
        let _ = sqlx::query(statements.drop_table()).execute(&self.pool).await?;
        Ok(())
    }

    async fn has_stream(&self, stream: &str) -> Result<bool, StoreError> {
        Ok(sqlx::query_scalar(statements::HAS_STREAM)
            .bind(stream)
            .fetch_one(&self.pool)
            .await?)
    }

    async fn fetch_stream_names(&self) -> Result<Vec<String>, StoreError> {
        Ok(sqlx::query_scalar(statements::STREAM_NAMES).fetch_all(&self.pool).await?)
    }

    async fn append_to(&self, stream: &str, events: Vec<Event>) -> Result<Vec<Event>, StoreError> {
        if !self.has_stream(stream).await? {
            return Err(StoreError::StreamNotFound(stream.to_string()));
        }

        let statements = Statements::new(stream);
        let mut transaction = self.pool.begin().await?;

        // Serializes appends per stream for the duration of the transaction,
        // which keeps the numbering dense.
        let _ = sqlx::query("SELECT pg_advisory_xact_lock(hashtext($1))")
            .bind(statements.table_name())
            .execute(&mut *transaction)
            .await?;

        let max_no: SequenceNumber = sqlx::query_scalar(statements.select_max_no())
            .fetch_one(&mut *transaction)
            .await?;

        let mut stored = Vec::with_capacity(events.len());
        for (event, offset) in events.into_iter().zip(1..) {
            let event = event.with_no(max_no + offset);
            let result = sqlx::query(statements.insert())
                .bind(event.no)
                .bind(event.uuid)
                .bind(&event.name)
                .bind(Json(&event.payload))
                .bind(Json(&event.metadata))
                .bind(event.created_at)
                .execute(&mut *transaction)
                .await;

            if let Err(error) = result {
                if is_unique_violation(&error) {
                    return Err(StoreError::Concurrency {
                        aggregate_id: event.metadata.aggregate_id().unwrap_or_default().to_string(),
                        version: event.metadata.aggregate_version().unwrap_or_default(),
                    });
                }
                return Err(error.into());
            }
            stored.push(event);
        }

        transaction.commit().await?;
        Ok(stored)
    }

    async fn load(
        &self,
        stream: &str,
        from: SequenceNumber,
        count: Option<usize>,
        matcher: Option<MetadataMatcher>,
    ) -> Result<EventStream, StoreError> {
        if !self.has_stream(stream).await? {
            return Err(StoreError::StreamNotFound(stream.to_string()));
        }

        struct LoadState {
            pool: Pool<Postgres>,
            select: String,
            from: SequenceNumber,
            remaining: usize,
            matcher: Option<MetadataMatcher>,
            buffer: VecDeque<Event>,
            exhausted: bool,
        }

        let state = LoadState {
            pool: self.pool.clone(),
            select: Statements::new(stream).select_from().to_string(),
            from,
            remaining: count.unwrap_or(usize::MAX),
            matcher,
            buffer: VecDeque::new(),
            exhausted: false,
        };

        // Keyset pagination keeps the sequence lazy without tying the
        // stream's lifetime to a borrowed connection.
        Ok(Box::pin(stream::unfold(state, |mut state| async move {
            loop {
                if let Some(event) = state.buffer.pop_front() {
                    return Some((Ok(event), state));
                }
                if state.exhausted || state.remaining == 0 {
                    return None;
                }

                let rows = sqlx::query_as::<_, DbEvent>(&state.select)
                    .bind(state.from)
                    .bind(LOAD_BATCH_SIZE as i64)
                    .fetch_all(&state.pool)
                    .await;

                match rows {
                    Ok(rows) => {
                        if rows.len() < LOAD_BATCH_SIZE {
                            state.exhausted = true;
                        }
                        for row in rows {
                            let event = Event::from(row);
                            state.from = event.no + 1;
                            if state.remaining > 0
                                && state.matcher.as_ref().is_none_or(|matcher| matcher.matches(&event))
                            {
                                state.remaining -= 1;
                                state.buffer.push_back(event);
                            }
                        }
                    }
                    Err(error) => {
                        state.exhausted = true;
                        return Some((Err(error.into()), state));
                    }
                }
            }
        })))
    }

    async fn fetch_projection(&self, name: &str) -> Result<Option<ProjectionRecord>, StoreError> {
        let row: Option<DbProjection> = sqlx::query_as(statements::FETCH_PROJECTION)
            .bind(name)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(ProjectionRecord::from))
    }

    async fn fetch_projection_names(&self, prefix: Option<&str>) -> Result<Vec<String>, StoreError> {
        Ok(sqlx::query_scalar(statements::FETCH_PROJECTION_NAMES)
            .bind(prefix)
            .fetch_all(&self.pool)
            .await?)
    }

    async fn persist_projection(&self, record: &ProjectionRecord) -> Result<(), StoreError> {
        let _ = sqlx::query(statements::PERSIST_PROJECTION)
            .bind(&record.name)
            .bind(Json(&record.state))
            .bind(Json(&record.positions))
            .bind(record.status.as_str())
            .bind(record.locked_until)
            .bind(record.lock_owner)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn update_projection_status(&self, name: &str, status: ProjectionStatus) -> Result<(), StoreError> {
        let result = sqlx::query(statements::UPDATE_PROJECTION_STATUS)
            .bind(name)
            .bind(status.as_str())
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::ProjectionNotFound(name.to_string()));
        }
        Ok(())
    }

    async fn delete_projection(&self, name: &str) -> Result<(), StoreError> {
        let _ = sqlx::query(statements::DELETE_PROJECTION).bind(name).execute(&self.pool).await?;
        Ok(())
    }
}

/// Projection row as stored in the `projections` table.
#[derive(sqlx::FromRow)]
struct DbProjection {
    name: String,
    state: Json<Value>,
    positions: Json<BTreeMap<String, SequenceNumber>>,
    status: String,
    locked_until: Option<DateTime<Utc>>,
    lock_owner: Option<Uuid>,
}

impl From<DbProjection> for ProjectionRecord {
    fn from(row: DbProjection) -> Self {
        Self {
            name: row.name,
            state: row.state.0,
            positions: row.positions.0,
            status: ProjectionStatus::parse(&row.status).unwrap_or(ProjectionStatus::Idle),
            locked_until: row.locked_until,
            lock_owner: row.lock_owner,
        }
    }
}

/// Advisory-lock [`WriteLockStrategy`] on Postgres.
///
/// Session-level advisory locks must be released on the connection that
/// acquired them, so each held lock pins its pool connection until release.
pub struct PgWriteLockStrategy {
    pool: Pool<Postgres>,
    held: Mutex<HashMap<String, PoolConnection<Postgres>>>,
}

impl PgWriteLockStrategy {
    pub fn new(pool: Pool<Postgres>) -> Self {
        Self {
            pool,
            held: Mutex::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl WriteLockStrategy for PgWriteLockStrategy {
    async fn create_lock(&self, name: &str) -> bool {
        let mut held = self.held.lock().await;
        if held.contains_key(name) {
            return false;
        }

        let Ok(mut connection) = self.pool.acquire().await else {
            return false;
        };
        let acquired = sqlx::query_scalar::<_, bool>("SELECT pg_try_advisory_lock(hashtext($1))")
            .bind(name)
            .fetch_one(&mut *connection)
            .await;

        match acquired {
            Ok(true) => {
                held.insert(name.to_string(), connection);
                true
            }
            _ => false,
        }
    }

    async fn release_lock(&self, name: &str) -> bool {
        let Some(mut connection) = self.held.lock().await.remove(name) else {
            return false;
        };
        sqlx::query_scalar::<_, bool>("SELECT pg_advisory_unlock(hashtext($1))")
            .bind(name)
            .fetch_one(&mut *connection)
            .await
            .unwrap_or(false)
    }
}
