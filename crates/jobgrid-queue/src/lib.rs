//! Persistent job queue
//!
//! Jobs are rows in a SQL database; their typed payloads live in per-type
//! work-item tables and are reconstructed through a [`WorkItemRegistry`].
//! Leasing is a single atomic claim query, so any number of nodes can pull
//! from the same queue without double execution. An in-memory store with
//! identical semantics backs the test suites.

pub mod clock;
pub mod job;
pub mod memory;
pub mod postgres;
pub mod registry;
pub mod store;
pub mod work_item;

pub use clock::{Clock, ManualClock, SystemClock};
pub use job::{EnqueueRequest, Job, JobDescriptor, JobId, NodeRecord, Priority};
pub use memory::MemoryJobStore;
pub use postgres::SqlJobStore;
pub use registry::{RegistryError, WorkItemRegistry};
pub use store::{
    enqueue_work, reschedule_singleton, wait_empty, EnqueueOptions, JobStore, StoreError,
};
pub use work_item::{AnyWorkItem, SingletonWorkItem, WorkContext, WorkError, WorkItem};
