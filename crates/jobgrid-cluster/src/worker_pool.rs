//! Local worker process pool
//!
//! Workers are separate processes on the same host, reached over framed
//! connections. Each handle tracks its outstanding command count against a
//! ceiling; dispatch always goes to the least-loaded worker with spare
//! capacity.

use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::debug;

use jobgrid_queue::JobDescriptor;

use crate::error::ClusterError;
use crate::performer::Performer;
use crate::protocol::{Command, Reply};
use crate::remote::RemoteConnection;

pub struct WorkerHandle {
    id: usize,
    connection: RemoteConnection,
    load: AtomicI32,
    ceiling: i32,
}

impl WorkerHandle {
    /// Commands dispatched and not yet replied to.
    pub fn current_load(&self) -> i32 {
        self.load.load(Ordering::SeqCst)
    }

    pub fn ceiling(&self) -> i32 {
        self.ceiling
    }
}

/// Pool of local worker connections.
#[derive(Default)]
pub struct WorkerPool {
    workers: Mutex<Vec<Arc<WorkerHandle>>>,
}

impl WorkerPool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_worker<S>(&self, stream: S, ceiling: i32)
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let mut workers = self.workers.lock();
        let id = workers.len();
        workers.push(Arc::new(WorkerHandle {
            id,
            connection: RemoteConnection::spawn(stream),
            load: AtomicI32::new(0),
            ceiling,
        }));
    }

    pub fn is_empty(&self) -> bool {
        self.workers.lock().is_empty()
    }

    /// Whether any worker is below its load ceiling.
    pub fn has_available_capacity(&self) -> bool {
        self.workers
            .lock()
            .iter()
            .any(|w| w.current_load() < w.ceiling)
    }

    fn select(&self) -> Option<Arc<WorkerHandle>> {
        self.workers
            .lock()
            .iter()
            .filter(|w| w.current_load() < w.ceiling)
            .min_by_key(|w| w.current_load())
            .cloned()
    }
}

#[async_trait]
impl Performer for WorkerPool {
    async fn perform(&self, descriptor: JobDescriptor) -> Result<(), ClusterError> {
        let worker = self.select().ok_or(ClusterError::NoCapacity)?;
        worker.load.fetch_add(1, Ordering::SeqCst);
        debug!(worker = worker.id, job_id = descriptor.job_id, "dispatching to worker");
        let result = worker.connection.round_trip(Command::perform(descriptor)).await;
        worker.load.fetch_sub(1, Ordering::SeqCst);
        match result? {
            Reply::Ok => Ok(()),
            Reply::Error { message } => Err(ClusterError::Remote(message)),
        }
    }
}
