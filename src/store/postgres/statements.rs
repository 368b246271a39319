//! SQL statements, formatted per stream the way the migrations lay the
//! tables out.

pub(crate) const CREATE_EVENT_STREAMS_TABLE: &str = "
    CREATE TABLE IF NOT EXISTS event_streams
    (
      stream_name TEXT NOT NULL,
      created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
      CONSTRAINT event_streams_pkey PRIMARY KEY (stream_name)
    )
    ";

pub(crate) const CREATE_PROJECTIONS_TABLE: &str = "
    CREATE TABLE IF NOT EXISTS projections
    (
      name TEXT NOT NULL,
      state JSONB NOT NULL,
      positions JSONB NOT NULL,
      status TEXT NOT NULL,
      locked_until TIMESTAMPTZ,
      lock_owner UUID,
      CONSTRAINT projections_pkey PRIMARY KEY (name)
    )
    ";

pub(crate) const ADD_STREAM: &str = "INSERT INTO event_streams (stream_name) VALUES ($1)";

pub(crate) const REMOVE_STREAM: &str = "DELETE FROM event_streams WHERE stream_name = $1";

pub(crate) const HAS_STREAM: &str = "SELECT EXISTS (SELECT 1 FROM event_streams WHERE stream_name = $1)";

pub(crate) const STREAM_NAMES: &str = "SELECT stream_name FROM event_streams ORDER BY stream_name";

pub(crate) const FETCH_PROJECTION: &str = "
    SELECT name, state, positions, status, locked_until, lock_owner
    FROM projections
    WHERE name = $1
    ";

pub(crate) const FETCH_PROJECTION_NAMES: &str = "
    SELECT name FROM projections
    WHERE $1::TEXT IS NULL OR name LIKE $1 || '%'
    ORDER BY name
    ";

pub(crate) const PERSIST_PROJECTION: &str = "
    INSERT INTO projections (name, state, positions, status, locked_until, lock_owner)
    VALUES ($1, $2, $3, $4, $5, $6)
    ON CONFLICT (name) DO UPDATE
    SET state = EXCLUDED.state,
        positions = EXCLUDED.positions,
        status = EXCLUDED.status,
        locked_until = EXCLUDED.locked_until,
        lock_owner = EXCLUDED.lock_owner
    ";

pub(crate) const UPDATE_PROJECTION_STATUS: &str = "UPDATE projections SET status = $2 WHERE name = $1";

pub(crate) const DELETE_PROJECTION: &str = "DELETE FROM projections WHERE name = $1";

/// Statements of one stream's event table.
#[derive(Clone, Debug)]
pub(crate) struct Statements {
    table_name: String,
    create_table: String,
    create_aggregate_index: String,
    drop_table: String,
    insert: String,
    select_from: String,
    select_max_no: String,
}

impl Statements {
    pub(crate) fn new(stream: &str) -> Self {
        // Stream names are used as quoted identifiers; embedded quotes are
        // stripped rather than escaped.
        let table_name = format!("{}_events", stream.replace('"', ""));
        let table = format!("\"{table_name}\"");
        let index = format!("\"{table_name}_aggregate\"");
        let pkey = format!("\"{table_name}_pkey\"");

        Self {
            create_table: format!(
                "
                CREATE TABLE IF NOT EXISTS {table}
                (
                  no BIGINT NOT NULL,
                  uuid UUID NOT NULL UNIQUE,
                  name TEXT NOT NULL,
                  payload JSONB NOT NULL,
                  metadata JSONB NOT NULL,
                  created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
                  CONSTRAINT {pkey} PRIMARY KEY (no)
                )
                ",
            ),
            create_aggregate_index: format!(
                "
                CREATE UNIQUE INDEX IF NOT EXISTS {index} ON {table}
                ((metadata->>'_aggregate_id'), (metadata->>'_aggregate_version'))
                WHERE metadata->>'_aggregate_id' IS NOT NULL
                ",
            ),
            drop_table: format!("DROP TABLE IF EXISTS {table}"),
            insert: format!(
                "
                INSERT INTO {table} (no, uuid, name, payload, metadata, created_at)
                VALUES ($1, $2, $3, $4, $5, $6)
                ",
            ),
            select_from: format!(
                "
                SELECT no, uuid, name, payload, metadata, created_at
                FROM {table}
                WHERE no >= $1
                ORDER BY no ASC
                LIMIT $2
                ",
            ),
            select_max_no: format!("SELECT COALESCE(MAX(no), 0) FROM {table}"),
            table_name,
        }
    }

    pub(crate) fn table_name(&self) -> &str {
        &self.table_name
    }

    pub(crate) fn create_table(&self) -> &str {
        &self.create_table
    }

    pub(crate) fn create_aggregate_index(&self) -> &str {
        &self.create_aggregate_index
    }

    pub(crate) fn drop_table(&self) -> &str {
        &self.drop_table
    }

    pub(crate) fn insert(&self) -> &str {
        &self.insert
    }

    pub(crate) fn select_from(&self) -> &str {
        &self.select_from
    }

    pub(crate) fn select_max_no(&self) -> &str {
        &self.select_max_no
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn statements_target_the_stream_table() {
        let statements = Statements::new("users");
        assert_eq!(statements.table_name(), "users_events");
        assert!(statements.insert().contains("\"users_events\""));
        assert!(statements.select_from().contains("WHERE no >= $1"));
    }

    #[test]
    fn quotes_are_stripped_from_identifiers() {
        let statements = Statements::new("we\"ird");
        assert_eq!(statements.table_name(), "weird_events");
    }
}
