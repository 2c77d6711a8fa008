//! SQLite provenance repository implementation.
//!
//! Implements `ProvenanceRepository` from `strata-core` using sqlx with split
//! read/write pools. Node payloads, chain contexts, wait states, and errors are
//! stored as JSON text. Graph invariants (unique result labels, one producer
//! per data node, existing endpoints) are enforced by the schema; the
//! compare-and-set on process records is a conditional UPDATE.

use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::Row;
use strata_core::repository::ProvenanceRepository;
use strata_types::error::RepositoryError;
use strata_types::node::{Edge, Node, NodeId};
use strata_types::process::{ProcessFilter, ProcessRecord};

use super::pool::DatabasePool;

/// SQLite-backed implementation of `ProvenanceRepository`.
pub struct SqliteProvenanceRepository {
    pool: DatabasePool,
}

impl SqliteProvenanceRepository {
    /// Create a new repository backed by the given database pool.
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &DatabasePool {
        &self.pool
    }

    /// Node count per kind, for status reporting.
    pub async fn count_nodes(&self) -> Result<Vec<(String, i64)>, RepositoryError> {
        sqlx::query_as("SELECT kind, COUNT(*) FROM nodes GROUP BY kind ORDER BY kind")
            .fetch_all(&self.pool.reader)
            .await
            .map_err(map_sqlx_error)
    }

    /// Process record count per status, for status reporting.
    pub async fn count_processes(&self) -> Result<Vec<(String, i64)>, RepositoryError> {
        sqlx::query_as("SELECT status, COUNT(*) FROM processes GROUP BY status ORDER BY status")
            .fetch_all(&self.pool.reader)
            .await
            .map_err(map_sqlx_error)
    }
}

// ---------------------------------------------------------------------------
// Internal row types
// ---------------------------------------------------------------------------

struct NodeRow {
    id: String,
    kind: String,
    label: String,
    payload: String,
    sealed: bool,
    created_at: String,
}

impl NodeRow {
    fn from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            kind: row.try_get("kind")?,
            label: row.try_get("label")?,
            payload: row.try_get("payload")?,
            sealed: row.try_get("sealed")?,
            created_at: row.try_get("created_at")?,
        })
    }

    fn into_node(self) -> Result<Node, RepositoryError> {
        Ok(Node {
            id: parse_id(&self.id)?,
            kind: self.kind.parse().map_err(RepositoryError::Query)?,
            label: self.label,
            payload: serde_json::from_str(&self.payload)
                .map_err(|e| RepositoryError::Query(format!("invalid node payload: {e}")))?,
            sealed: self.sealed,
            created_at: parse_datetime(&self.created_at)?,
        })
    }
}

struct EdgeRow {
    source_id: String,
    target_id: String,
    kind: String,
    label: String,
    created_at: String,
}

impl EdgeRow {
    fn from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            source_id: row.try_get("source_id")?,
            target_id: row.try_get("target_id")?,
            kind: row.try_get("kind")?,
            label: row.try_get("label")?,
            created_at: row.try_get("created_at")?,
        })
    }

    fn into_edge(self) -> Result<Edge, RepositoryError> {
        Ok(Edge {
            source: parse_id(&self.source_id)?,
            target: parse_id(&self.target_id)?,
            kind: self.kind.parse().map_err(RepositoryError::Query)?,
            label: self.label,
            created_at: parse_datetime(&self.created_at)?,
        })
    }
}

struct ProcessRow {
    id: String,
    kind: String,
    label: String,
    status: String,
    context: String,
    next_step_index: i64,
    waiting_on: Option<String>,
    job_id: Option<String>,
    error: Option<String>,
    revision: i64,
    created_at: String,
    updated_at: String,
}

impl ProcessRow {
    fn from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            kind: row.try_get("kind")?,
            label: row.try_get("label")?,
            status: row.try_get("status")?,
            context: row.try_get("context")?,
            next_step_index: row.try_get("next_step_index")?,
            waiting_on: row.try_get("waiting_on")?,
            job_id: row.try_get("job_id")?,
            error: row.try_get("error")?,
            revision: row.try_get("revision")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }

    fn into_record(self) -> Result<ProcessRecord, RepositoryError> {
        let waiting_on = self
            .waiting_on
            .as_deref()
            .map(|s| {
                serde_json::from_str(s)
                    .map_err(|e| RepositoryError::Query(format!("invalid waiting_on: {e}")))
            })
            .transpose()?;

        let error = self
            .error
            .as_deref()
            .map(|s| {
                serde_json::from_str(s)
                    .map_err(|e| RepositoryError::Query(format!("invalid error JSON: {e}")))
            })
            .transpose()?;

        Ok(ProcessRecord {
            id: parse_id(&self.id)?,
            kind: self.kind.parse().map_err(RepositoryError::Query)?,
            label: self.label,
            status: self.status.parse().map_err(RepositoryError::Query)?,
            context: serde_json::from_str(&self.context)
                .map_err(|e| RepositoryError::Query(format!("invalid context JSON: {e}")))?,
            next_step_index: self.next_step_index as usize,
            waiting_on,
            job_id: self.job_id,
            error,
            revision: self.revision as u64,
            created_at: parse_datetime(&self.created_at)?,
            updated_at: parse_datetime(&self.updated_at)?,
        })
    }
}

/// JSON columns of a process record, serialized once per write.
struct ProcessColumns {
    context: String,
    waiting_on: Option<String>,
    error: Option<String>,
}

impl ProcessColumns {
    fn encode(record: &ProcessRecord) -> Result<Self, RepositoryError> {
        let to_json = |what: &str, r: Result<String, serde_json::Error>| {
            r.map_err(|e| RepositoryError::Query(format!("serialize {what}: {e}")))
        };
        Ok(Self {
            context: to_json("context", serde_json::to_string(&record.context))?,
            waiting_on: record
                .waiting_on
                .as_ref()
                .map(|w| to_json("waiting_on", serde_json::to_string(w)))
                .transpose()?,
            error: record
                .error
                .as_ref()
                .map(|e| to_json("error", serde_json::to_string(e)))
                .transpose()?,
        })
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn parse_id(s: &str) -> Result<NodeId, RepositoryError> {
    s.parse::<NodeId>()
        .map_err(|e| RepositoryError::Query(format!("invalid UUID: {e}")))
}

fn parse_datetime(s: &str) -> Result<DateTime<Utc>, RepositoryError> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| RepositoryError::Query(format!("invalid datetime: {e}")))
}

/// Fixed-width so that text ordering matches time ordering.
fn format_datetime(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Constraint violations become the repository's domain errors.
fn map_sqlx_error(err: sqlx::Error) -> RepositoryError {
    match &err {
        sqlx::Error::Database(db) if db.is_unique_violation() => {
            RepositoryError::Conflict(db.message().to_string())
        }
        sqlx::Error::Database(db) if db.is_foreign_key_violation() => RepositoryError::NotFound,
        sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed => RepositoryError::Connection,
        _ => RepositoryError::Query(err.to_string()),
    }
}

const PROCESS_COLUMNS: &str = "id, kind, label, status, context, next_step_index, waiting_on, \
                               job_id, error, revision, created_at, updated_at";

// ---------------------------------------------------------------------------
// ProvenanceRepository impl
// ---------------------------------------------------------------------------

impl ProvenanceRepository for SqliteProvenanceRepository {
    async fn insert_node(&self, node: &Node) -> Result<(), RepositoryError> {
        let payload = serde_json::to_string(&node.payload)
            .map_err(|e| RepositoryError::Query(format!("serialize payload: {e}")))?;

        sqlx::query(
            r#"INSERT INTO nodes (id, kind, label, payload, sealed, created_at)
               VALUES (?, ?, ?, ?, ?, ?)"#,
        )
        .bind(node.id.to_string())
        .bind(node.kind.as_str())
        .bind(&node.label)
        .bind(&payload)
        .bind(node.sealed)
        .bind(format_datetime(&node.created_at))
        .execute(&self.pool.writer)
        .await
        .map_err(map_sqlx_error)?;

        Ok(())
    }

    async fn get_node(&self, id: &NodeId) -> Result<Option<Node>, RepositoryError> {
        let row = sqlx::query(
            "SELECT id, kind, label, payload, sealed, created_at FROM nodes WHERE id = ?",
        )
        .bind(id.to_string())
        .fetch_optional(&self.pool.reader)
        .await
        .map_err(map_sqlx_error)?;

        match row {
            Some(row) => {
                let r = NodeRow::from_row(&row).map_err(|e| RepositoryError::Query(e.to_string()))?;
                Ok(Some(r.into_node()?))
            }
            None => Ok(None),
        }
    }

    async fn seal_node(&self, id: &NodeId) -> Result<(), RepositoryError> {
        let result = sqlx::query("UPDATE nodes SET sealed = 1 WHERE id = ?")
            .bind(id.to_string())
            .execute(&self.pool.writer)
            .await
            .map_err(map_sqlx_error)?;

        if result.rows_affected() == 0 {
            return Err(RepositoryError::NotFound);
        }
        Ok(())
    }

    async fn insert_edge(&self, edge: &Edge) -> Result<(), RepositoryError> {
        sqlx::query(
            r#"INSERT INTO edges (source_id, target_id, kind, label, created_at)
               VALUES (?, ?, ?, ?, ?)"#,
        )
        .bind(edge.source.to_string())
        .bind(edge.target.to_string())
        .bind(edge.kind.as_str())
        .bind(&edge.label)
        .bind(format_datetime(&edge.created_at))
        .execute(&self.pool.writer)
        .await
        .map_err(map_sqlx_error)?;

        Ok(())
    }

    async fn list_incoming(&self, id: &NodeId) -> Result<Vec<Edge>, RepositoryError> {
        let rows = sqlx::query(
            "SELECT source_id, target_id, kind, label, created_at FROM edges WHERE target_id = ? ORDER BY seq",
        )
        .bind(id.to_string())
        .fetch_all(&self.pool.reader)
        .await
        .map_err(map_sqlx_error)?;

        rows.iter()
            .map(|row| {
                EdgeRow::from_row(row)
                    .map_err(|e| RepositoryError::Query(e.to_string()))?
                    .into_edge()
            })
            .collect()
    }

    async fn list_outgoing(&self, id: &NodeId) -> Result<Vec<Edge>, RepositoryError> {
        let rows = sqlx::query(
            "SELECT source_id, target_id, kind, label, created_at FROM edges WHERE source_id = ? ORDER BY seq",
        )
        .bind(id.to_string())
        .fetch_all(&self.pool.reader)
        .await
        .map_err(map_sqlx_error)?;

        rows.iter()
            .map(|row| {
                EdgeRow::from_row(row)
                    .map_err(|e| RepositoryError::Query(e.to_string()))?
                    .into_edge()
            })
            .collect()
    }

    async fn insert_process(&self, record: &ProcessRecord) -> Result<(), RepositoryError> {
        let columns = ProcessColumns::encode(record)?;

        sqlx::query(
            r#"INSERT INTO processes (id, kind, label, status, context, next_step_index,
                                      waiting_on, job_id, error, revision, created_at, updated_at)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"#,
        )
        .bind(record.id.to_string())
        .bind(record.kind.as_str())
        .bind(&record.label)
        .bind(record.status.as_str())
        .bind(&columns.context)
        .bind(record.next_step_index as i64)
        .bind(&columns.waiting_on)
        .bind(&record.job_id)
        .bind(&columns.error)
        .bind(record.revision as i64)
        .bind(format_datetime(&record.created_at))
        .bind(format_datetime(&record.updated_at))
        .execute(&self.pool.writer)
        .await
        .map_err(map_sqlx_error)?;

        Ok(())
    }

    async fn get_process(&self, id: &NodeId) -> Result<Option<ProcessRecord>, RepositoryError> {
        let row = sqlx::query(&format!("SELECT {PROCESS_COLUMNS} FROM processes WHERE id = ?"))
            .bind(id.to_string())
            .fetch_optional(&self.pool.reader)
            .await
            .map_err(map_sqlx_error)?;

        match row {
            Some(row) => {
                let r = ProcessRow::from_row(&row)
                    .map_err(|e| RepositoryError::Query(e.to_string()))?;
                Ok(Some(r.into_record()?))
            }
            None => Ok(None),
        }
    }

    async fn update_process(&self, record: &ProcessRecord) -> Result<u64, RepositoryError> {
        let columns = ProcessColumns::encode(record)?;
        let revision = record.revision + 1;
        let id = record.id.to_string();

        let mut tx = self.pool.writer.begin().await.map_err(map_sqlx_error)?;

        let result = sqlx::query(
            r#"UPDATE processes SET
                 status = ?, context = ?, next_step_index = ?, waiting_on = ?,
                 job_id = ?, error = ?, revision = ?, updated_at = ?
               WHERE id = ? AND revision = ? AND status NOT IN ('finished', 'failed')"#,
        )
        .bind(record.status.as_str())
        .bind(&columns.context)
        .bind(record.next_step_index as i64)
        .bind(&columns.waiting_on)
        .bind(&record.job_id)
        .bind(&columns.error)
        .bind(revision as i64)
        .bind(format_datetime(&record.updated_at))
        .bind(&id)
        .bind(record.revision as i64)
        .execute(&mut *tx)
        .await
        .map_err(map_sqlx_error)?;

        if result.rows_affected() == 0 {
            let current: Option<(String, i64)> =
                sqlx::query_as("SELECT status, revision FROM processes WHERE id = ?")
                    .bind(&id)
                    .fetch_optional(&mut *tx)
                    .await
                    .map_err(map_sqlx_error)?;
            tx.rollback().await.map_err(map_sqlx_error)?;
            return Err(match current {
                None => RepositoryError::NotFound,
                Some((status, stored)) => RepositoryError::Conflict(format!(
                    "process {id} is {status} at revision {stored}, expected revision {}",
                    record.revision
                )),
            });
        }

        if record.status.is_terminal() {
            sqlx::query("UPDATE nodes SET sealed = 1 WHERE id = ?")
                .bind(&id)
                .execute(&mut *tx)
                .await
                .map_err(map_sqlx_error)?;
        }

        tx.commit().await.map_err(map_sqlx_error)?;
        Ok(revision)
    }

    async fn list_processes(
        &self,
        filter: &ProcessFilter,
    ) -> Result<Vec<ProcessRecord>, RepositoryError> {
        let rows = sqlx::query(&format!(
            r#"SELECT {PROCESS_COLUMNS} FROM processes
               WHERE (?1 IS NULL OR status = ?1) AND (?2 IS NULL OR kind = ?2)
               ORDER BY created_at, id
               LIMIT ?3"#
        ))
        .bind(filter.status.map(|s| s.as_str()))
        .bind(filter.kind.map(|k| k.as_str()))
        .bind(filter.limit.map(i64::from).unwrap_or(-1))
        .fetch_all(&self.pool.reader)
        .await
        .map_err(map_sqlx_error)?;

        rows.iter()
            .map(|row| {
                ProcessRow::from_row(row)
                    .map_err(|e| RepositoryError::Query(e.to_string()))?
                    .into_record()
            })
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
