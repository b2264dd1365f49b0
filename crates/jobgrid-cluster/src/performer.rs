//! Performer seam
//!
//! A performer takes an already-leased job descriptor to a recorded
//! outcome. The controller picks among in-process execution, the local
//! worker pool, and peers at dispatch time; everything behind this trait
//! looks the same to the lease loop.

use std::sync::Arc;

use async_trait::async_trait;

use jobgrid_queue::JobDescriptor;

use crate::error::ClusterError;
use crate::executor::JobExecutor;

#[async_trait]
pub trait Performer: Send + Sync + 'static {
    async fn perform(&self, descriptor: JobDescriptor) -> Result<(), ClusterError>;
}

/// Executes jobs on the calling process.
pub struct InlinePerformer {
    executor: Arc<JobExecutor>,
}

impl InlinePerformer {
    pub fn new(executor: Arc<JobExecutor>) -> Self {
        Self { executor }
    }
}

#[async_trait]
impl Performer for InlinePerformer {
    async fn perform(&self, descriptor: JobDescriptor) -> Result<(), ClusterError> {
        self.executor.execute(descriptor).await
    }
}
