//! SQL implementation of JobStore
//!
//! Runs on top of the jobgrid connection pool; every operation is one
//! short transaction. `next_job` uses `FOR UPDATE SKIP LOCKED` so racing
//! nodes never select the same row, and commits immediately so the lock
//! is released before the (potentially slow) execution starts.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use tracing::{debug, instrument};

use jobgrid_pool::{ConnectionPool, Connector, PooledTransaction, Row, SqlValue};

use crate::job::{EnqueueRequest, Job, JobId, NodeRecord, Priority};
use crate::registry::WorkItemRegistry;
use crate::store::{JobStore, StoreError};

const JOB_COLUMNS: &str = "job_id, work_type, priority, weight, not_before, assigned, failed";

const SINGLETON_LOCK: &str = "SELECT pg_advisory_xact_lock(hashtext($1))";

const CREATE_JOB_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS job (
    job_id      BIGSERIAL PRIMARY KEY,
    work_type   TEXT NOT NULL,
    priority    SMALLINT NOT NULL DEFAULT 0,
    weight      INTEGER NOT NULL DEFAULT 0,
    not_before  TIMESTAMPTZ NOT NULL,
    assigned    TIMESTAMPTZ,
    failed      INTEGER NOT NULL DEFAULT 0
)
"#;

const CREATE_JOB_INDEX: &str = r#"
CREATE INDEX IF NOT EXISTS job_eligibility ON job (priority DESC, not_before ASC)
"#;

const CREATE_NODE_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS node_info (
    hostname  TEXT NOT NULL,
    pid       INTEGER NOT NULL,
    port      INTEGER NOT NULL,
    time      TIMESTAMPTZ NOT NULL,
    PRIMARY KEY (hostname, port)
)
"#;

/// SQL-backed job store.
pub struct SqlJobStore<C: Connector> {
    pool: ConnectionPool<C>,
}

impl<C: Connector> SqlJobStore<C> {
    pub fn new(pool: ConnectionPool<C>) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &ConnectionPool<C> {
        &self.pool
    }

    /// Create the job and node tables plus one work-item table per
    /// registered work type.
    pub async fn ensure_schema(&self, registry: &WorkItemRegistry) -> Result<(), StoreError> {
        let tx = self.pool.transaction();
        let result = async {
            tx.execute(CREATE_JOB_TABLE, &[]).await?;
            tx.execute(CREATE_JOB_INDEX, &[]).await?;
            tx.execute(CREATE_NODE_TABLE, &[]).await?;
            for work_type in registry.work_types() {
                let table = work_item_table(work_type)?;
                let sql = format!(
                    r#"
CREATE TABLE IF NOT EXISTS {table} (
    work_id  BIGSERIAL PRIMARY KEY,
    job_id   BIGINT NOT NULL REFERENCES job(job_id) ON DELETE CASCADE,
    fields   JSONB NOT NULL
)
"#
                );
                tx.execute(&sql, &[]).await?;
            }
            Ok(())
        }
        .await;
        finish(&tx, result).await
    }
}

/// Commit on success, abort on error.
async fn finish<C: Connector, T>(
    tx: &PooledTransaction<C>,
    result: Result<T, StoreError>,
) -> Result<T, StoreError> {
    match result {
        Ok(value) => {
            tx.commit().await?;
            Ok(value)
        }
        Err(e) => {
            let _ = tx.abort().await;
            Err(e)
        }
    }
}

/// Work-item table name for a work type.
///
/// Work types are table-name fragments; reject anything that is not a
/// lowercase identifier rather than quoting our way around it.
fn work_item_table(work_type: &str) -> Result<String, StoreError> {
    let valid = !work_type.is_empty()
        && work_type
            .chars()
            .next()
            .is_some_and(|c| c.is_ascii_lowercase())
        && work_type
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_');
    if !valid {
        return Err(StoreError::Serialization(format!(
            "invalid work type for table name: {work_type:?}"
        )));
    }
    Ok(format!("{work_type}_work_item"))
}

fn col<'r>(row: &'r Row, index: usize) -> Result<&'r SqlValue, StoreError> {
    row.get(index)
        .ok_or_else(|| StoreError::Database(format!("missing column {index}")))
}

fn col_i64(row: &Row, index: usize) -> Result<i64, StoreError> {
    col(row, index)?
        .as_i64()
        .ok_or_else(|| StoreError::Database(format!("column {index} is not an integer")))
}

fn col_text(row: &Row, index: usize) -> Result<String, StoreError> {
    col(row, index)?
        .as_str()
        .map(str::to_string)
        .ok_or_else(|| StoreError::Database(format!("column {index} is not text")))
}

fn col_timestamp(row: &Row, index: usize) -> Result<DateTime<Utc>, StoreError> {
    col(row, index)?
        .as_timestamp()
        .ok_or_else(|| StoreError::Database(format!("column {index} is not a timestamp")))
}

fn col_opt_timestamp(row: &Row, index: usize) -> Result<Option<DateTime<Utc>>, StoreError> {
    let value = col(row, index)?;
    if value.is_null() {
        return Ok(None);
    }
    Ok(Some(col_timestamp(row, index)?))
}

fn job_from_row(row: &Row) -> Result<Job, StoreError> {
    let priority_raw = col_i64(row, 2)?;
    let priority = Priority::from_i16(priority_raw as i16).ok_or_else(|| {
        StoreError::Serialization(format!("unknown priority value {priority_raw}"))
    })?;
    Ok(Job {
        id: col_i64(row, 0)?,
        work_type: col_text(row, 1)?,
        priority,
        weight: col_i64(row, 3)? as i32,
        not_before: col_timestamp(row, 4)?,
        assigned: col_opt_timestamp(row, 5)?,
        failed: col_i64(row, 6)? as i32,
    })
}

#[async_trait]
impl<C: Connector> JobStore for SqlJobStore<C> {
    #[instrument(skip(self, request), fields(work_type = %request.work_type))]
    async fn enqueue(&self, request: EnqueueRequest) -> Result<Job, StoreError> {
        let table = work_item_table(&request.work_type)?;
        let tx = self.pool.transaction();
        let result = async {
            let sql = format!(
                "INSERT INTO job (work_type, priority, weight, not_before) \
                 VALUES ($1, $2, $3, $4) RETURNING {JOB_COLUMNS}"
            );
            let rows = tx
                .execute(
                    &sql,
                    &[
                        SqlValue::from(request.work_type.as_str()),
                        SqlValue::Int(request.priority.as_i16() as i64),
                        SqlValue::Int(request.weight as i64),
                        SqlValue::from(request.not_before),
                    ],
                )
                .await?;
            let job = rows
                .first()
                .map(job_from_row)
                .transpose()?
                .ok_or_else(|| StoreError::Database("insert returned no row".into()))?;

            let sql = format!("INSERT INTO {table} (job_id, fields) VALUES ($1, $2)");
            tx.execute(
                &sql,
                &[SqlValue::Int(job.id), SqlValue::Json(request.fields)],
            )
            .await?;
            Ok(job)
        }
        .await;
        let job = finish(&tx, result).await?;
        debug!(job_id = job.id, "enqueued job");
        Ok(job)
    }

    #[instrument(skip(self))]
    async fn job(&self, job_id: JobId) -> Result<Option<Job>, StoreError> {
        let tx = self.pool.transaction();
        let result = async {
            let sql = format!("SELECT {JOB_COLUMNS} FROM job WHERE job_id = $1");
            let rows = tx.execute(&sql, &[SqlValue::Int(job_id)]).await?;
            rows.first().map(job_from_row).transpose()
        }
        .await;
        finish(&tx, result).await
    }

    #[instrument(skip(self))]
    async fn next_job(
        &self,
        now: DateTime<Utc>,
        min_priority: Priority,
        overdue_cutoff: DateTime<Utc>,
    ) -> Result<Option<Job>, StoreError> {
        let tx = self.pool.transaction();
        let result = async {
            // Claim the best eligible row and mark it assigned in one
            // atomic statement; SKIP LOCKED keeps racing nodes from
            // selecting the same row.
            let sql = format!(
                r#"
WITH candidate AS (
    SELECT job_id
    FROM job
    WHERE not_before <= $1
      AND priority >= $2
      AND (assigned IS NULL OR assigned < $3)
    ORDER BY priority DESC, not_before ASC
    LIMIT 1
    FOR UPDATE SKIP LOCKED
)
UPDATE job j
SET assigned = $1
FROM candidate c
WHERE j.job_id = c.job_id
RETURNING {}
"#,
                JOB_COLUMNS
                    .split(", ")
                    .map(|c| format!("j.{c}"))
                    .collect::<Vec<_>>()
                    .join(", ")
            );
            let rows = tx
                .execute(
                    &sql,
                    &[
                        SqlValue::from(now),
                        SqlValue::Int(min_priority.as_i16() as i64),
                        SqlValue::from(overdue_cutoff),
                    ],
                )
                .await?;
            rows.first().map(job_from_row).transpose()
        }
        .await;
        let leased = finish(&tx, result).await?;
        if let Some(job) = &leased {
            debug!(job_id = job.id, priority = %job.priority, "leased job");
        }
        Ok(leased)
    }

    #[instrument(skip(self))]
    async fn load_work_item(
        &self,
        work_type: &str,
        job_id: JobId,
    ) -> Result<Option<Value>, StoreError> {
        let table = work_item_table(work_type)?;
        let tx = self.pool.transaction();
        let result = async {
            let sql = format!("SELECT fields FROM {table} WHERE job_id = $1");
            let rows = tx.execute(&sql, &[SqlValue::Int(job_id)]).await?;
            match rows.first() {
                None => Ok(None),
                Some(row) => Ok(Some(
                    col(row, 0)?
                        .as_json()
                        .cloned()
                        .ok_or_else(|| StoreError::Database("fields column is not json".into()))?,
                )),
            }
        }
        .await;
        finish(&tx, result).await
    }

    #[instrument(skip(self))]
    async fn complete_job(&self, work_type: &str, job_id: JobId) -> Result<(), StoreError> {
        let table = work_item_table(work_type)?;
        let tx = self.pool.transaction();
        let result = async {
            let sql = format!("DELETE FROM {table} WHERE job_id = $1");
            tx.execute(&sql, &[SqlValue::Int(job_id)]).await?;
            tx.execute("DELETE FROM job WHERE job_id = $1", &[SqlValue::Int(job_id)])
                .await?;
            Ok(())
        }
        .await;
        finish(&tx, result).await?;
        debug!(job_id, "completed job");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn retry_job(&self, job_id: JobId, not_before: DateTime<Utc>) -> Result<(), StoreError> {
        let tx = self.pool.transaction();
        let result = async {
            tx.execute(
                "UPDATE job SET assigned = NULL, failed = failed + 1, not_before = $2 \
                 WHERE job_id = $1",
                &[SqlValue::Int(job_id), SqlValue::from(not_before)],
            )
            .await?;
            Ok(())
        }
        .await;
        finish(&tx, result).await
    }

    #[instrument(skip(self, fields))]
    async fn reschedule_singleton(
        &self,
        work_type: &str,
        fields: Value,
        not_before: DateTime<Utc>,
        force: bool,
    ) -> Result<Job, StoreError> {
        let table = work_item_table(work_type)?;
        let tx = self.pool.transaction();
        let result = async {
            // FOR UPDATE only locks rows that exist; when no pending row
            // does, two racing calls would both insert. The advisory lock
            // serializes the check-then-insert per work type and releases
            // at commit.
            tx.execute(SINGLETON_LOCK, &[SqlValue::from(work_type)])
                .await?;
            let sql = format!(
                "SELECT {JOB_COLUMNS} FROM job \
                 WHERE work_type = $1 AND assigned IS NULL \
                 ORDER BY job_id LIMIT 1 FOR UPDATE"
            );
            let rows = tx.execute(&sql, &[SqlValue::from(work_type)]).await?;

            if let Some(row) = rows.first() {
                let mut job = job_from_row(row)?;
                if force {
                    tx.execute(
                        "UPDATE job SET not_before = $2 WHERE job_id = $1",
                        &[SqlValue::Int(job.id), SqlValue::from(not_before)],
                    )
                    .await?;
                    job.not_before = not_before;
                }
                return Ok(job);
            }

            let sql = format!(
                "INSERT INTO job (work_type, priority, weight, not_before) \
                 VALUES ($1, $2, $3, $4) RETURNING {JOB_COLUMNS}"
            );
            let rows = tx
                .execute(
                    &sql,
                    &[
                        SqlValue::from(work_type),
                        SqlValue::Int(Priority::Low.as_i16() as i64),
                        SqlValue::Int(0),
                        SqlValue::from(not_before),
                    ],
                )
                .await?;
            let job = rows
                .first()
                .map(job_from_row)
                .transpose()?
                .ok_or_else(|| StoreError::Database("insert returned no row".into()))?;

            let sql = format!("INSERT INTO {table} (job_id, fields) VALUES ($1, $2)");
            tx.execute(&sql, &[SqlValue::Int(job.id), SqlValue::Json(fields)])
                .await?;
            Ok(job)
        }
        .await;
        finish(&tx, result).await
    }

    #[instrument(skip(self))]
    async fn pending_count(&self) -> Result<u64, StoreError> {
        let tx = self.pool.transaction();
        let result = async {
            let rows = tx.execute("SELECT COUNT(*) FROM job", &[]).await?;
            let count = rows
                .first()
                .map(|r| col_i64(r, 0))
                .transpose()?
                .unwrap_or(0);
            Ok(count as u64)
        }
        .await;
        finish(&tx, result).await
    }

    #[instrument(skip(self, node), fields(hostname = %node.hostname, port = node.port))]
    async fn register_node(&self, node: &NodeRecord) -> Result<(), StoreError> {
        let tx = self.pool.transaction();
        let result = async {
            tx.execute(
                "INSERT INTO node_info (hostname, pid, port, time) VALUES ($1, $2, $3, $4) \
                 ON CONFLICT (hostname, port) \
                 DO UPDATE SET pid = EXCLUDED.pid, time = EXCLUDED.time",
                &[
                    SqlValue::from(node.hostname.as_str()),
                    SqlValue::Int(node.pid as i64),
                    SqlValue::Int(node.port as i64),
                    SqlValue::from(node.time),
                ],
            )
            .await?;
            Ok(())
        }
        .await;
        finish(&tx, result).await
    }

    #[instrument(skip(self))]
    async fn node_heartbeat(
        &self,
        hostname: &str,
        port: u16,
        time: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let tx = self.pool.transaction();
        let result = async {
            tx.execute(
                "UPDATE node_info SET time = $3 WHERE hostname = $1 AND port = $2",
                &[
                    SqlValue::from(hostname),
                    SqlValue::Int(port as i64),
                    SqlValue::from(time),
                ],
            )
            .await?;
            Ok(())
        }
        .await;
        finish(&tx, result).await
    }

    #[instrument(skip(self))]
    async fn remove_node(&self, hostname: &str, port: u16) -> Result<(), StoreError> {
        let tx = self.pool.transaction();
        let result = async {
            tx.execute(
                "DELETE FROM node_info WHERE hostname = $1 AND port = $2",
                &[SqlValue::from(hostname), SqlValue::Int(port as i64)],
            )
            .await?;
            Ok(())
        }
        .await;
        finish(&tx, result).await
    }

    #[instrument(skip(self))]
    async fn list_nodes(&self) -> Result<Vec<NodeRecord>, StoreError> {
        let tx = self.pool.transaction();
        let result = async {
            let rows = tx
                .execute("SELECT hostname, pid, port, time FROM node_info", &[])
                .await?;
            rows.iter()
                .map(|row| {
                    let port = col_i64(row, 2)?;
                    Ok(NodeRecord {
                        hostname: col_text(row, 0)?,
                        pid: col_i64(row, 1)? as i32,
                        port: u16::try_from(port).map_err(|_| {
                            StoreError::Serialization(format!("port {port} out of range"))
                        })?,
                        time: col_timestamp(row, 3)?,
                    })
                })
                .collect()
        }
        .await;
        finish(&tx, result).await
    }
}
