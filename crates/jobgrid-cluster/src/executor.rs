//! In-process job execution
//!
//! Loads a leased job's work item, runs it, and records the outcome. Work
//! failures are recovered here (unassign, count, cooldown) and never
//! propagate; only store access problems surface to the caller.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use jobgrid_queue::{Clock, JobDescriptor, JobStore, WorkContext, WorkItemRegistry};

use crate::error::ClusterError;

pub struct JobExecutor {
    store: Arc<dyn JobStore>,
    registry: WorkItemRegistry,
    clock: Arc<dyn Clock>,
    retry_cooldown: Duration,
}

impl JobExecutor {
    pub fn new(
        store: Arc<dyn JobStore>,
        registry: WorkItemRegistry,
        clock: Arc<dyn Clock>,
        retry_cooldown: Duration,
    ) -> Self {
        Self {
            store,
            registry,
            clock,
            retry_cooldown,
        }
    }

    /// Execute one leased job to a recorded outcome.
    ///
    /// A job or work-item row that has vanished means another transaction
    /// already dealt with it; that is success, not an error.
    pub async fn execute(&self, descriptor: JobDescriptor) -> Result<(), ClusterError> {
        let Some(job) = self.store.job(descriptor.job_id).await? else {
            debug!(job_id = descriptor.job_id, "job row gone, nothing to do");
            return Ok(());
        };

        let Some(fields) = self
            .store
            .load_work_item(&job.work_type, job.id)
            .await?
        else {
            debug!(job_id = job.id, "work item row gone, removing job");
            self.store.complete_job(&job.work_type, job.id).await?;
            return Ok(());
        };

        let item = match self.registry.load(&job.work_type, fields) {
            Ok(item) => item,
            Err(e) => {
                // Likely a node running older code; leave the job for a
                // node that knows the type.
                warn!(job_id = job.id, work_type = %job.work_type, error = %e,
                      "cannot reconstruct work item, scheduling retry");
                self.retry(job.id).await?;
                return Ok(());
            }
        };

        let ctx = WorkContext {
            job: descriptor,
            store: self.store.clone(),
        };
        match item.do_work(&ctx).await {
            Ok(()) => {
                self.store.complete_job(&job.work_type, job.id).await?;
                debug!(job_id = job.id, work_type = %job.work_type, "job done");
            }
            Err(e) => {
                warn!(job_id = job.id, work_type = %job.work_type, error = %e,
                      "work failed, scheduling retry");
                self.retry(job.id).await?;
            }
        }
        Ok(())
    }

    async fn retry(&self, job_id: jobgrid_queue::JobId) -> Result<(), ClusterError> {
        let cooldown = chrono::Duration::from_std(self.retry_cooldown)
            .unwrap_or_else(|_| chrono::Duration::seconds(60));
        self.store
            .retry_job(job_id, self.clock.now() + cooldown)
            .await?;
        Ok(())
    }
}
