use sqlx::postgres::PgQueryResult;
use sqlx::{Pool, Postgres};

use crate::store::postgres::statements;

/// Sets up the engine-owned tables. Runs are idempotent and should happen
/// once per application startup.
pub(crate) struct Migrations;

impl Migrations {
    pub(crate) async fn run(pool: &Pool<Postgres>) -> Result<(), sqlx::Error> {
        let migrations: [&str; 2] = [
            statements::CREATE_EVENT_STREAMS_TABLE,
            statements::CREATE_PROJECTIONS_TABLE,
        ];

        for migration in migrations {
            let _: PgQueryResult = sqlx::query(migration).execute(pool).await?;
        }

        Ok(())
    }
}
