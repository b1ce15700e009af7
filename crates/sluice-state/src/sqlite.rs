//! `SQLite`-backed implementation of [`StateBackend`].
//!
//! Uses a single `Mutex<Connection>` for thread safety.

use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use chrono::Utc;
use rusqlite::{Connection, OptionalExtension};
use sluice_types::ids::PipelineName;
use sluice_types::schema::Schema;
use sluice_types::state::PipelineState;

use crate::backend::StateBackend;
use crate::error::{self, StateError};

/// `SQLite` datetime format (UTC, no timezone suffix).
const SQLITE_DATETIME_FMT: &str = "%Y-%m-%d %H:%M:%S";

/// Idempotent DDL for state tables.
const CREATE_TABLES: &str = r"
CREATE TABLE IF NOT EXISTS pipeline_state (
    pipeline TEXT PRIMARY KEY,
    version INTEGER NOT NULL,
    version_hash TEXT NOT NULL,
    state_json TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS schemas (
    pipeline TEXT NOT NULL,
    name TEXT NOT NULL,
    version INTEGER NOT NULL,
    version_hash TEXT NOT NULL,
    schema_json TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    PRIMARY KEY (pipeline, name)
);
";

/// `SQLite`-backed state storage.
///
/// Create with [`SqliteStateBackend::open`] for file-backed persistence
/// or [`SqliteStateBackend::in_memory`] for tests.
pub struct SqliteStateBackend {
    conn: Mutex<Connection>,
}

impl SqliteStateBackend {
    /// Open or create a `SQLite` state database at `path`.
    ///
    /// # Errors
    ///
    /// Returns [`StateError::Io`] if the directory can't be created,
    /// or [`StateError::SqliteContext`] if the database can't be opened.
    pub fn open(path: &Path) -> error::Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path).map_err(StateError::context("open"))?;
        Self::init(conn)
    }

    /// Create an in-memory `SQLite` backend (for testing).
    ///
    /// # Errors
    ///
    /// Returns [`StateError::SqliteContext`] if the in-memory database
    /// can't be initialized.
    pub fn in_memory() -> error::Result<Self> {
        let conn = Connection::open_in_memory().map_err(StateError::context("open"))?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> error::Result<Self> {
        conn.execute_batch(CREATE_TABLES)
            .map_err(StateError::context("create tables"))?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Acquire the connection lock.
    fn lock_conn(&self) -> error::Result<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| StateError::LockPoisoned)
    }

    /// Format current UTC time for `SQLite` storage.
    fn now_sqlite() -> String {
        Utc::now().format(SQLITE_DATETIME_FMT).to_string()
    }

    fn version_column(version: u64) -> i64 {
        i64::try_from(version).unwrap_or(i64::MAX)
    }

    #[cfg(test)]
    fn execute_batch(&self, sql: &str) -> error::Result<()> {
        self.lock_conn()?.execute_batch(sql)?;
        Ok(())
    }
}

impl StateBackend for SqliteStateBackend {
    fn load_state(&self, pipeline: &PipelineName) -> error::Result<Option<PipelineState>> {
        let conn = self.lock_conn()?;
        let raw: Option<String> = conn
            .query_row(
                "SELECT state_json FROM pipeline_state WHERE pipeline = ?1",
                [pipeline.as_str()],
                |row| row.get(0),
            )
            .optional()
            .map_err(StateError::context("load_state"))?;

        raw.map(|json| {
            serde_json::from_str(&json).map_err(|source| StateError::Document {
                what: "state",
                pipeline: pipeline.to_string(),
                source,
            })
        })
        .transpose()
    }

    fn load_schema(&self, pipeline: &PipelineName, name: &str) -> error::Result<Option<Schema>> {
        let conn = self.lock_conn()?;
        let raw: Option<String> = conn
            .query_row(
                "SELECT schema_json FROM schemas WHERE pipeline = ?1 AND name = ?2",
                [pipeline.as_str(), name],
                |row| row.get(0),
            )
            .optional()
            .map_err(StateError::context("load_schema"))?;

        raw.map(|json| {
            serde_json::from_str(&json).map_err(|source| StateError::Document {
                what: "schema",
                pipeline: pipeline.to_string(),
                source,
            })
        })
        .transpose()
    }

    fn list_schemas(&self, pipeline: &PipelineName) -> error::Result<Vec<String>> {
        let conn = self.lock_conn()?;
        let mut stmt = conn
            .prepare("SELECT name FROM schemas WHERE pipeline = ?1 ORDER BY name")
            .map_err(StateError::context("list_schemas: prepare"))?;
        let names = stmt
            .query_map([pipeline.as_str()], |row| row.get(0))
            .map_err(StateError::context("list_schemas: query"))?
            .collect::<Result<Vec<String>, _>>()
            .map_err(StateError::context("list_schemas: read"))?;
        Ok(names)
    }

    fn commit(
        &self,
        pipeline: &PipelineName,
        state: Option<&PipelineState>,
        schemas: &[&Schema],
    ) -> error::Result<()> {
        let document_error = |what, source| StateError::Document {
            what,
            pipeline: pipeline.to_string(),
            source,
        };
        let state_json = state
            .map(serde_json::to_string)
            .transpose()
            .map_err(|e| document_error("state", e))?;
        let schema_jsons = schemas
            .iter()
            .map(|s| serde_json::to_string(s))
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| document_error("schema", e))?;

        let now = Self::now_sqlite();
        let conn = self.lock_conn()?;
        let tx = conn
            .unchecked_transaction()
            .map_err(StateError::context("commit: begin tx"))?;

        if let (Some(state), Some(json)) = (state, state_json) {
            tx.execute(
                "INSERT INTO pipeline_state (pipeline, version, version_hash, state_json, updated_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5) \
                 ON CONFLICT(pipeline) \
                 DO UPDATE SET version = ?2, version_hash = ?3, state_json = ?4, updated_at = ?5",
                rusqlite::params![
                    pipeline.as_str(),
                    Self::version_column(state.version),
                    state.version_hash,
                    json,
                    now,
                ],
            )
            .map_err(StateError::context("commit: state"))?;
        }

        for (schema, json) in schemas.iter().zip(schema_jsons) {
            tx.execute(
                "INSERT INTO schemas (pipeline, name, version, version_hash, schema_json, updated_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6) \
                 ON CONFLICT(pipeline, name) \
                 DO UPDATE SET version = ?3, version_hash = ?4, schema_json = ?5, updated_at = ?6",
                rusqlite::params![
                    pipeline.as_str(),
                    schema.name,
                    Self::version_column(schema.version),
                    schema.version_hash,
                    json,
                    now,
                ],
            )
            .map_err(StateError::context("commit: schema"))?;
        }

        tx.commit().map_err(StateError::context("commit: commit"))?;
        Ok(())
    }

    fn drop_pipeline(&self, pipeline: &PipelineName) -> error::Result<()> {
        let conn = self.lock_conn()?;
        let tx = conn
            .unchecked_transaction()
            .map_err(StateError::context("drop_pipeline: begin tx"))?;
        tx.execute("DELETE FROM pipeline_state WHERE pipeline = ?1", [pipeline.as_str()])
            .map_err(StateError::context("drop_pipeline: state"))?;
        tx.execute("DELETE FROM schemas WHERE pipeline = ?1", [pipeline.as_str()])
            .map_err(StateError::context("drop_pipeline: schemas"))?;
        tx.commit()
            .map_err(StateError::context("drop_pipeline: commit"))?;
        Ok(())
    }
}
