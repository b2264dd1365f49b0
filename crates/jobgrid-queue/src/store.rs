//! JobStore trait definition and queue-level operations

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use tracing::debug;

use crate::job::{EnqueueRequest, Job, JobId, NodeRecord, Priority};
use crate::work_item::{SingletonWorkItem, WorkItem};

/// Error type for store operations
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Job not found
    #[error("job not found: {0}")]
    JobNotFound(JobId),

    /// Database error
    #[error("database error: {0}")]
    Database(String),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl From<jobgrid_pool::PoolError> for StoreError {
    fn from(e: jobgrid_pool::PoolError) -> Self {
        Self::Database(e.to_string())
    }
}

/// Store for job rows and their typed work-item rows.
///
/// The database is the sole arbiter of which node owns a job; no node
/// holds an authoritative in-memory copy across transactions.
/// Implementations must be thread-safe.
#[async_trait]
pub trait JobStore: Send + Sync + 'static {
    /// Insert a Job row and its work-item row in one transaction.
    async fn enqueue(&self, request: EnqueueRequest) -> Result<Job, StoreError>;

    /// Read one job row, if it still exists.
    async fn job(&self, job_id: JobId) -> Result<Option<Job>, StoreError>;

    /// Atomically lease the best eligible job.
    ///
    /// Eligibility: `not_before <= now`, `priority >= min_priority`, and
    /// unassigned or assigned before `overdue_cutoff`. Candidates are
    /// ordered priority descending then `not_before` ascending. The
    /// selected row gets `assigned = now` within the same transaction,
    /// under row-level locking, so two racing nodes never claim the same
    /// row. Returns `None` when nothing is eligible.
    async fn next_job(
        &self,
        now: DateTime<Utc>,
        min_priority: Priority,
        overdue_cutoff: DateTime<Utc>,
    ) -> Result<Option<Job>, StoreError>;

    /// Load the stored fields of a job's work item.
    ///
    /// `None` means the row was already deleted by another transaction;
    /// performers treat that as work that no longer needs to happen.
    async fn load_work_item(
        &self,
        work_type: &str,
        job_id: JobId,
    ) -> Result<Option<Value>, StoreError>;

    /// Delete a completed job and its work-item row in one transaction.
    async fn complete_job(&self, work_type: &str, job_id: JobId) -> Result<(), StoreError>;

    /// Record a failed execution attempt: clear `assigned`, increment the
    /// failure counter, and push `not_before` to the given time.
    async fn retry_job(&self, job_id: JobId, not_before: DateTime<Utc>) -> Result<(), StoreError>;

    /// Create or update the single pending instance of a singleton type.
    ///
    /// If a pending (unassigned) instance exists and `force` is false, its
    /// `not_before` is left untouched; with `force` the new time wins.
    async fn reschedule_singleton(
        &self,
        work_type: &str,
        fields: Value,
        not_before: DateTime<Utc>,
        force: bool,
    ) -> Result<Job, StoreError>;

    /// Number of job rows still present, leased or not.
    async fn pending_count(&self) -> Result<u64, StoreError>;

    // =========================================================================
    // Node registry
    // =========================================================================

    /// Register or refresh this node's row.
    async fn register_node(&self, node: &NodeRecord) -> Result<(), StoreError>;

    /// Update a node's heartbeat time.
    async fn node_heartbeat(
        &self,
        hostname: &str,
        port: u16,
        time: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    /// Remove a node's row on clean shutdown.
    async fn remove_node(&self, hostname: &str, port: u16) -> Result<(), StoreError>;

    /// All node rows, live or stale.
    async fn list_nodes(&self) -> Result<Vec<NodeRecord>, StoreError>;
}

/// Options for [`enqueue_work`].
#[derive(Debug, Clone)]
pub struct EnqueueOptions {
    /// Earliest time the job may be leased; `None` means immediately.
    pub not_before: Option<DateTime<Utc>>,
    pub priority: Priority,
    pub weight: i32,
}

impl Default for EnqueueOptions {
    fn default() -> Self {
        Self {
            not_before: None,
            priority: Priority::Low,
            weight: 0,
        }
    }
}

impl EnqueueOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_not_before(mut self, time: DateTime<Utc>) -> Self {
        self.not_before = Some(time);
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_weight(mut self, weight: i32) -> Self {
        self.weight = weight;
        self
    }
}

/// Enqueue a typed work item.
pub async fn enqueue_work<W: WorkItem>(
    store: &dyn JobStore,
    item: &W,
    now: DateTime<Utc>,
    options: EnqueueOptions,
) -> Result<Job, StoreError> {
    let fields = serde_json::to_value(item).map_err(|e| StoreError::Serialization(e.to_string()))?;
    let job = store
        .enqueue(EnqueueRequest {
            work_type: W::WORK_TYPE.to_string(),
            fields,
            not_before: options.not_before.unwrap_or(now),
            priority: options.priority,
            weight: options.weight,
        })
        .await?;
    debug!(job_id = job.id, work_type = %job.work_type, "enqueued work");
    Ok(job)
}

/// Reschedule a singleton work item.
pub async fn reschedule_singleton<W: SingletonWorkItem>(
    store: &dyn JobStore,
    item: &W,
    not_before: DateTime<Utc>,
    force: bool,
) -> Result<Job, StoreError> {
    let fields = serde_json::to_value(item).map_err(|e| StoreError::Serialization(e.to_string()))?;
    store
        .reschedule_singleton(W::WORK_TYPE, fields, not_before, force)
        .await
}

/// Block until no job rows remain.
///
/// Drain/quiesce entry point for shutdown and migration tooling.
pub async fn wait_empty(store: &dyn JobStore, poll_interval: Duration) -> Result<(), StoreError> {
    loop {
        if store.pending_count().await? == 0 {
            return Ok(());
        }
        tokio::time::sleep(poll_interval).await;
    }
}
