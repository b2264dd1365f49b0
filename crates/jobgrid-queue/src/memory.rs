//! In-memory implementation of JobStore for testing
//!
//! Stores everything behind one lock and provides the same semantics as
//! the SQL implementation, including the atomicity of `next_job`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde_json::Value;

use crate::job::{EnqueueRequest, Job, JobId, NodeRecord, Priority};
use crate::store::{JobStore, StoreError};

struct StoredJob {
    job: Job,
    fields: Value,
}

/// In-memory job store.
///
/// Primarily for tests; `next_job` runs under a write lock, so concurrent
/// callers observe the same at-most-one-claim behavior the row-locked SQL
/// query provides.
#[derive(Default)]
pub struct MemoryJobStore {
    jobs: RwLock<HashMap<JobId, StoredJob>>,
    nodes: RwLock<HashMap<(String, u16), NodeRecord>>,
    next_id: AtomicI64,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of job rows currently stored (for test assertions)
    pub fn job_count(&self) -> usize {
        self.jobs.read().len()
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn enqueue(&self, request: EnqueueRequest) -> Result<Job, StoreError> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        let job = Job {
            id,
            work_type: request.work_type,
            priority: request.priority,
            weight: request.weight,
            not_before: request.not_before,
            assigned: None,
            failed: 0,
        };
        self.jobs.write().insert(
            id,
            StoredJob {
                job: job.clone(),
                fields: request.fields,
            },
        );
        Ok(job)
    }

    async fn job(&self, job_id: JobId) -> Result<Option<Job>, StoreError> {
        Ok(self.jobs.read().get(&job_id).map(|s| s.job.clone()))
    }

    async fn next_job(
        &self,
        now: DateTime<Utc>,
        min_priority: Priority,
        overdue_cutoff: DateTime<Utc>,
    ) -> Result<Option<Job>, StoreError> {
        let mut jobs = self.jobs.write();
        let best = jobs
            .values()
            .filter(|s| {
                s.job.not_before <= now
                    && s.job.priority >= min_priority
                    && s.job.assigned.map_or(true, |a| a < overdue_cutoff)
            })
            // Highest priority first, then longest-due; id breaks ties so
            // selection is deterministic.
            .min_by_key(|s| (std::cmp::Reverse(s.job.priority), s.job.not_before, s.job.id))
            .map(|s| s.job.id);

        Ok(best.and_then(|id| {
            jobs.get_mut(&id).map(|s| {
                s.job.assigned = Some(now);
                s.job.clone()
            })
        }))
    }

    async fn load_work_item(
        &self,
        work_type: &str,
        job_id: JobId,
    ) -> Result<Option<Value>, StoreError> {
        Ok(self
            .jobs
            .read()
            .get(&job_id)
            .filter(|s| s.job.work_type == work_type)
            .map(|s| s.fields.clone()))
    }

    async fn complete_job(&self, work_type: &str, job_id: JobId) -> Result<(), StoreError> {
        let mut jobs = self.jobs.write();
        if jobs
            .get(&job_id)
            .is_some_and(|s| s.job.work_type == work_type)
        {
            jobs.remove(&job_id);
        }
        Ok(())
    }

    async fn retry_job(&self, job_id: JobId, not_before: DateTime<Utc>) -> Result<(), StoreError> {
        let mut jobs = self.jobs.write();
        let stored = jobs.get_mut(&job_id).ok_or(StoreError::JobNotFound(job_id))?;
        stored.job.assigned = None;
        stored.job.failed += 1;
        stored.job.not_before = not_before;
        Ok(())
    }

    async fn reschedule_singleton(
        &self,
        work_type: &str,
        fields: Value,
        not_before: DateTime<Utc>,
        force: bool,
    ) -> Result<Job, StoreError> {
        let mut jobs = self.jobs.write();
        let pending = jobs
            .values_mut()
            .find(|s| s.job.work_type == work_type && s.job.assigned.is_none());

        if let Some(stored) = pending {
            if force {
                stored.job.not_before = not_before;
            }
            return Ok(stored.job.clone());
        }

        let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        let job = Job {
            id,
            work_type: work_type.to_string(),
            priority: Priority::Low,
            weight: 0,
            not_before,
            assigned: None,
            failed: 0,
        };
        jobs.insert(
            id,
            StoredJob {
                job: job.clone(),
                fields,
            },
        );
        Ok(job)
    }

    async fn pending_count(&self) -> Result<u64, StoreError> {
        Ok(self.jobs.read().len() as u64)
    }

    async fn register_node(&self, node: &NodeRecord) -> Result<(), StoreError> {
        self.nodes
            .write()
            .insert((node.hostname.clone(), node.port), node.clone());
        Ok(())
    }

    async fn node_heartbeat(
        &self,
        hostname: &str,
        port: u16,
        time: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        if let Some(node) = self.nodes.write().get_mut(&(hostname.to_string(), port)) {
            node.time = time;
        }
        Ok(())
    }

    async fn remove_node(&self, hostname: &str, port: u16) -> Result<(), StoreError> {
        self.nodes.write().remove(&(hostname.to_string(), port));
        Ok(())
    }

    async fn list_nodes(&self) -> Result<Vec<NodeRecord>, StoreError> {
        Ok(self.nodes.read().values().cloned().collect())
    }
}
