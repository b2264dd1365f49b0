//! Node controller
//!
//! One controller runs per node process. It owns the lease loop, the node
//! heartbeat, the inbound listener, and the choice of performer for each
//! leased job. The database stays the sole arbiter of ownership; the
//! controller only decides where an already-leased job executes.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use jobgrid_queue::{
    enqueue_work, Clock, EnqueueOptions, Job, JobDescriptor, JobStore, NodeRecord, Priority,
    WorkItem, WorkItemRegistry,
};

use crate::config::ControllerConfig;
use crate::error::ClusterError;
use crate::executor::JobExecutor;
use crate::peer::PeerClient;
use crate::performer::{InlinePerformer, Performer};
use crate::server::serve_connection;
use crate::worker_pool::WorkerPool;

/// Controller life cycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControllerStatus {
    Stopped,
    Starting,
    Running,
    Stopping,
}

struct Inner {
    store: Arc<dyn JobStore>,
    clock: Arc<dyn Clock>,
    config: ControllerConfig,
    executor: Arc<JobExecutor>,
    inline: InlinePerformer,
    workers: WorkerPool,
    peers: Mutex<Vec<Arc<PeerClient>>>,
    status: Mutex<ControllerStatus>,
    shutdown_tx: watch::Sender<bool>,
    wake: Notify,
    loop_tasks: Mutex<Vec<JoinHandle<()>>>,
    performs: Mutex<Vec<JoinHandle<()>>>,
}

/// Per-node orchestrator over a shared job store.
#[derive(Clone)]
pub struct Controller {
    inner: Arc<Inner>,
}

impl Controller {
    pub fn new(
        store: Arc<dyn JobStore>,
        registry: WorkItemRegistry,
        clock: Arc<dyn Clock>,
        config: ControllerConfig,
    ) -> Self {
        let executor = Arc::new(JobExecutor::new(
            store.clone(),
            registry,
            clock.clone(),
            config.retry_cooldown,
        ));
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            inner: Arc::new(Inner {
                store,
                clock,
                config,
                inline: InlinePerformer::new(executor.clone()),
                executor,
                workers: WorkerPool::new(),
                peers: Mutex::new(Vec::new()),
                status: Mutex::new(ControllerStatus::Stopped),
                shutdown_tx,
                wake: Notify::new(),
                loop_tasks: Mutex::new(Vec::new()),
                performs: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn status(&self) -> ControllerStatus {
        *self.inner.status.lock()
    }

    /// Attach a local worker connection.
    pub fn add_worker<S>(&self, stream: S, ceiling: i32)
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        self.inner.workers.add_worker(stream, ceiling);
    }

    /// Attach a peer controller connection.
    pub fn add_peer(&self, peer: PeerClient) {
        self.inner.peers.lock().push(Arc::new(peer));
    }

    /// Enqueue a work item and wake the lease loop.
    ///
    /// A job already due wakes the loop immediately; one scheduled for
    /// later gets a wake timer for its `not_before`, cancelled by stop.
    pub async fn enqueue<W: WorkItem>(
        &self,
        item: &W,
        options: EnqueueOptions,
    ) -> Result<Job, ClusterError> {
        let now = self.inner.clock.now();
        let job = enqueue_work(self.inner.store.as_ref(), item, now, options).await?;
        match (job.not_before - now).to_std() {
            Err(_) => self.inner.wake.notify_one(),
            Ok(delay) => {
                let inner = self.inner.clone();
                let mut shutdown = self.inner.shutdown_tx.subscribe();
                let task = tokio::spawn(async move {
                    if *shutdown.borrow_and_update() {
                        return;
                    }
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => inner.wake.notify_one(),
                        _ = shutdown.changed() => {}
                    }
                });
                let mut tasks = self.inner.loop_tasks.lock();
                tasks.retain(|t| !t.is_finished());
                tasks.push(task);
            }
        }
        Ok(job)
    }

    /// Wake the lease loop ahead of its next scheduled pass.
    pub fn notify(&self) {
        self.inner.wake.notify_one();
    }

    /// Register the node and start the background loops.
    pub async fn start(&self) -> Result<(), ClusterError> {
        {
            let mut status = self.inner.status.lock();
            if *status != ControllerStatus::Stopped {
                return Err(ClusterError::InvalidState("controller already started"));
            }
            *status = ControllerStatus::Starting;
        }

        let node = NodeRecord {
            hostname: self.inner.config.hostname.clone(),
            pid: std::process::id() as i32,
            port: self.inner.config.port,
            time: self.inner.clock.now(),
        };
        if let Err(e) = self.inner.store.register_node(&node).await {
            *self.inner.status.lock() = ControllerStatus::Stopped;
            return Err(e.into());
        }

        if !self.inner.config.local_only {
            let listener =
                match TcpListener::bind(("0.0.0.0", self.inner.config.port)).await {
                    Ok(listener) => listener,
                    Err(e) => {
                        *self.inner.status.lock() = ControllerStatus::Stopped;
                        return Err(e.into());
                    }
                };
            let inner = self.inner.clone();
            let task = tokio::spawn(async move { inner.accept_loop(listener).await });
            self.inner.loop_tasks.lock().push(task);
        }

        let inner = self.inner.clone();
        let lease_task = tokio::spawn(async move { inner.lease_loop().await });
        let inner = self.inner.clone();
        let heartbeat_task = tokio::spawn(async move { inner.heartbeat_loop().await });
        {
            let mut tasks = self.inner.loop_tasks.lock();
            tasks.push(lease_task);
            tasks.push(heartbeat_task);
        }

        *self.inner.status.lock() = ControllerStatus::Running;
        info!(hostname = %node.hostname, port = node.port, "controller running");
        Ok(())
    }

    /// Stop the loops, wait for in-flight dispatches, and deregister.
    pub async fn stop(&self) -> Result<(), ClusterError> {
        {
            let mut status = self.inner.status.lock();
            match *status {
                ControllerStatus::Stopped => return Ok(()),
                ControllerStatus::Stopping => {
                    return Err(ClusterError::InvalidState("controller already stopping"))
                }
                _ => *status = ControllerStatus::Stopping,
            }
        }

        self.inner.shutdown_tx.send_replace(true);

        let tasks: Vec<_> = self.inner.loop_tasks.lock().drain(..).collect();
        for task in tasks {
            let _ = task.await;
        }
        // Jobs this node already dispatched run to completion.
        let performs: Vec<_> = self.inner.performs.lock().drain(..).collect();
        for task in performs {
            let _ = task.await;
        }

        self.inner
            .store
            .remove_node(&self.inner.config.hostname, self.inner.config.port)
            .await?;
        *self.inner.status.lock() = ControllerStatus::Stopped;
        info!("controller stopped");
        Ok(())
    }
}

impl Inner {
    async fn lease_loop(self: Arc<Self>) {
        // Check the flag's value each turn. A subscription taken after
        // stop() already sent true never sees a change.
        let mut shutdown = self.shutdown_tx.subscribe();
        loop {
            if *shutdown.borrow_and_update() {
                break;
            }
            self.run_lease_pass().await;
            tokio::select! {
                _ = tokio::time::sleep(self.config.lease_interval) => {}
                _ = self.wake.notified() => {}
                _ = shutdown.changed() => break,
            }
        }
        debug!("lease loop exited");
    }

    /// Drain eligible jobs, highest priority tier first. Execution is
    /// spawned; the pass itself never blocks on a job.
    async fn run_lease_pass(self: &Arc<Self>) {
        for priority in Priority::descending() {
            loop {
                if *self.shutdown_tx.subscribe().borrow() {
                    return;
                }
                let now = self.clock.now();
                let cutoff = now
                    - chrono::Duration::from_std(self.config.overdue_timeout)
                        .unwrap_or_else(|_| chrono::Duration::hours(1));
                match self.store.next_job(now, priority, cutoff).await {
                    Ok(Some(job)) => self.spawn_perform(job.descriptor()),
                    Ok(None) => break,
                    Err(e) => {
                        warn!(error = %e, "lease pass aborted");
                        return;
                    }
                }
            }
        }
    }

    fn spawn_perform(self: &Arc<Self>, descriptor: JobDescriptor) {
        let inner = self.clone();
        let task = tokio::spawn(async move {
            if let Err(e) = inner.dispatch(descriptor).await {
                warn!(job_id = descriptor.job_id, error = %e, "dispatch failed");
            }
        });
        let mut performs = self.performs.lock();
        performs.retain(|t| !t.is_finished());
        performs.push(task);
    }

    /// Pick where a leased job executes.
    ///
    /// Local workers win while any has spare capacity; otherwise the
    /// least-loaded peer; otherwise in-process.
    async fn dispatch(&self, descriptor: JobDescriptor) -> Result<(), ClusterError> {
        if self.config.local_only {
            return self.inline.perform(descriptor).await;
        }
        if self.workers.has_available_capacity() {
            return self.workers.perform(descriptor).await;
        }
        if let Some(peer) = self.select_peer() {
            return peer.perform(descriptor).await;
        }
        self.inline.perform(descriptor).await
    }

    fn select_peer(&self) -> Option<Arc<PeerClient>> {
        // min_by_key keeps the first of equals, so ties go to the
        // earliest-attached connection.
        self.peers
            .lock()
            .iter()
            .min_by_key(|p| p.current_load_estimate())
            .cloned()
    }

    async fn heartbeat_loop(self: Arc<Self>) {
        let mut shutdown = self.shutdown_tx.subscribe();
        loop {
            if *shutdown.borrow_and_update() {
                break;
            }
            tokio::select! {
                _ = tokio::time::sleep(self.config.heartbeat_interval) => {}
                _ = shutdown.changed() => break,
            }
            let now = self.clock.now();
            if let Err(e) = self
                .store
                .node_heartbeat(&self.config.hostname, self.config.port, now)
                .await
            {
                warn!(error = %e, "node heartbeat failed");
            }
        }
        debug!("heartbeat loop exited");
    }

    async fn accept_loop(self: Arc<Self>, listener: TcpListener) {
        let mut shutdown = self.shutdown_tx.subscribe();
        loop {
            if *shutdown.borrow_and_update() {
                break;
            }
            tokio::select! {
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, addr)) => {
                            debug!(%addr, "inbound connection");
                            let executor = self.executor.clone();
                            let conn_shutdown = self.shutdown_tx.subscribe();
                            let task = tokio::spawn(async move {
                                if let Err(e) =
                                    serve_connection(stream, executor, conn_shutdown).await
                                {
                                    warn!(%addr, error = %e, "inbound connection failed");
                                }
                            });
                            let mut performs = self.performs.lock();
                            performs.retain(|t| !t.is_finished());
                            performs.push(task);
                        }
                        Err(e) => {
                            warn!(error = %e, "accept failed");
                        }
                    }
                }
                _ = shutdown.changed() => break,
            }
        }
        debug!("accept loop exited");
    }
}
