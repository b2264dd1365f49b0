//! Typed work-item payloads
//!
//! A [`WorkItem`] is the typed payload and behavior behind a Job row. The
//! `WORK_TYPE` string is what gets persisted; the registry maps it back to
//! the concrete type on any node.

use std::sync::Arc;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::job::JobDescriptor;
use crate::store::JobStore;

/// Failure of a work item's effect.
///
/// Work-execution errors are recovered at the job level (unassign,
/// failure counter, cooldown); they never propagate as process faults.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{0}")]
pub struct WorkError(pub String);

impl WorkError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

/// Context handed to `do_work`.
pub struct WorkContext {
    /// Descriptor of the job being performed
    pub job: JobDescriptor,
    /// Store access, e.g. for enqueuing follow-up work
    pub store: Arc<dyn JobStore>,
}

/// The typed payload and effect of one job.
#[async_trait]
pub trait WorkItem: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Stable string key identifying this type in storage
    const WORK_TYPE: &'static str;

    /// Perform the work. May fail; failures schedule a retry after the
    /// controller's cooldown.
    async fn do_work(&self, ctx: &WorkContext) -> Result<(), WorkError>;
}

/// A work item type constrained to at most one pending instance at a time.
pub trait SingletonWorkItem: WorkItem {}

/// Type-erased work item, as reconstructed by the registry.
#[async_trait]
pub trait AnyWorkItem: Send + Sync {
    fn work_type(&self) -> &str;

    async fn do_work(&self, ctx: &WorkContext) -> Result<(), WorkError>;
}

pub(crate) struct WorkItemWrapper<W: WorkItem> {
    pub(crate) inner: W,
}

#[async_trait]
impl<W: WorkItem> AnyWorkItem for WorkItemWrapper<W> {
    fn work_type(&self) -> &str {
        W::WORK_TYPE
    }

    async fn do_work(&self, ctx: &WorkContext) -> Result<(), WorkError> {
        self.inner.do_work(ctx).await
    }
}
