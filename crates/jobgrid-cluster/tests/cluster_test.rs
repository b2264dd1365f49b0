//! Controller and dispatch behavior over the in-memory store.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;

use jobgrid_cluster::{
    read_frame, serve_connection, write_frame, Command, Controller, ControllerConfig,
    ControllerStatus, JobExecutor, PeerClient, Performer, Reply, WorkerPool,
};
use jobgrid_queue::{
    wait_empty, Clock, EnqueueOptions, JobStore, ManualClock, MemoryJobStore, Priority,
    WorkContext, WorkError, WorkItem, WorkItemRegistry,
};

fn t0() -> chrono::DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap()
}

#[derive(Debug, Serialize, Deserialize)]
struct Sum {
    key: String,
    amount: i64,
}

#[async_trait]
impl WorkItem for Sum {
    const WORK_TYPE: &'static str = "sum";

    async fn do_work(&self, _ctx: &WorkContext) -> Result<(), WorkError> {
        Err(WorkError::new("sum must be registered with a sink"))
    }
}

/// Registry whose `sum` loader adds into a shared map on completion.
fn sum_registry(sink: Arc<Mutex<HashMap<String, i64>>>) -> WorkItemRegistry {
    #[derive(Debug, Deserialize)]
    struct Fields {
        key: String,
        amount: i64,
    }

    struct Sink {
        fields: Fields,
        sink: Arc<Mutex<HashMap<String, i64>>>,
    }

    #[async_trait]
    impl jobgrid_queue::AnyWorkItem for Sink {
        fn work_type(&self) -> &str {
            "sum"
        }

        async fn do_work(&self, _ctx: &WorkContext) -> Result<(), WorkError> {
            *self.sink.lock().entry(self.fields.key.clone()).or_insert(0) += self.fields.amount;
            Ok(())
        }
    }

    let mut registry = WorkItemRegistry::new();
    registry.register_loader("sum", move |fields| {
        let fields: Fields =
            serde_json::from_value(fields).map_err(|e| jobgrid_queue::RegistryError::Deserialize {
                work_type: "sum".to_string(),
                message: e.to_string(),
            })?;
        Ok(Box::new(Sink {
            fields,
            sink: sink.clone(),
        }))
    });
    registry
}

fn local_controller(
    store: Arc<MemoryJobStore>,
    registry: WorkItemRegistry,
    clock: ManualClock,
) -> Controller {
    Controller::new(
        store,
        registry,
        Arc::new(clock),
        ControllerConfig::new()
            .with_local_only(true)
            .with_lease_interval(Duration::from_secs(1)),
    )
}

#[tokio::test(start_paused = true)]
async fn controller_executes_enqueued_jobs() {
    let store = Arc::new(MemoryJobStore::new());
    let results = Arc::new(Mutex::new(HashMap::new()));
    let clock = ManualClock::new(t0());
    let controller = local_controller(store.clone(), sum_registry(results.clone()), clock);

    controller.start().await.unwrap();
    assert_eq!(controller.status(), ControllerStatus::Running);

    controller
        .enqueue(
            &Sum {
                key: "total".into(),
                amount: 3,
            },
            EnqueueOptions::new(),
        )
        .await
        .unwrap();
    controller
        .enqueue(
            &Sum {
                key: "total".into(),
                amount: 7,
            },
            EnqueueOptions::new().with_priority(Priority::High),
        )
        .await
        .unwrap();

    wait_empty(store.as_ref(), Duration::from_millis(50))
        .await
        .unwrap();
    assert_eq!(results.lock().get("total"), Some(&10));

    controller.stop().await.unwrap();
    assert_eq!(controller.status(), ControllerStatus::Stopped);
    assert!(store.list_nodes().await.unwrap().is_empty());
}

/// Registry whose `add` loader records `a + b` per job id on completion.
fn adder_registry(sink: Arc<Mutex<HashMap<i64, i64>>>) -> WorkItemRegistry {
    #[derive(Debug, Deserialize)]
    struct Fields {
        a: i64,
        b: i64,
    }

    struct Adder {
        fields: Fields,
        sink: Arc<Mutex<HashMap<i64, i64>>>,
    }

    #[async_trait]
    impl jobgrid_queue::AnyWorkItem for Adder {
        fn work_type(&self) -> &str {
            "add"
        }

        async fn do_work(&self, ctx: &WorkContext) -> Result<(), WorkError> {
            self.sink
                .lock()
                .insert(ctx.job.job_id, self.fields.a + self.fields.b);
            Ok(())
        }
    }

    let mut registry = WorkItemRegistry::new();
    registry.register_loader("add", move |fields| {
        let fields: Fields =
            serde_json::from_value(fields).map_err(|e| jobgrid_queue::RegistryError::Deserialize {
                work_type: "add".to_string(),
                message: e.to_string(),
            })?;
        Ok(Box::new(Adder {
            fields,
            sink: sink.clone(),
        }))
    });
    registry
}

#[tokio::test(start_paused = true)]
async fn delayed_job_runs_only_after_its_not_before() {
    let store = Arc::new(MemoryJobStore::new());
    let results = Arc::new(Mutex::new(HashMap::new()));
    let clock = ManualClock::new(t0());
    let controller = Controller::new(
        store.clone(),
        adder_registry(results.clone()),
        Arc::new(clock.clone()),
        ControllerConfig::new()
            .with_local_only(true)
            .with_lease_interval(Duration::from_secs(1)),
    );
    controller.start().await.unwrap();

    let job1 = store
        .enqueue(jobgrid_queue::EnqueueRequest {
            work_type: "add".into(),
            fields: serde_json::json!({"a": 1, "b": 2}),
            not_before: t0(),
            priority: Priority::Low,
            weight: 0,
        })
        .await
        .unwrap();
    let job2 = store
        .enqueue(jobgrid_queue::EnqueueRequest {
            work_type: "add".into(),
            fields: serde_json::json!({"a": 3, "b": 4}),
            not_before: t0() + chrono::Duration::seconds(1000),
            priority: Priority::Low,
            weight: 0,
        })
        .await
        .unwrap();
    controller.notify();

    // One second in: only the first job is due.
    clock.advance(Duration::from_secs(1));
    loop {
        if results.lock().contains_key(&job1.id) {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(!results.lock().contains_key(&job2.id));
    assert_eq!(store.job_count(), 1);

    // Past the second job's time both have executed.
    clock.advance(Duration::from_secs(1000));
    wait_empty(store.as_ref(), Duration::from_millis(50))
        .await
        .unwrap();
    let results = results.lock();
    assert_eq!(results.get(&job1.id), Some(&3));
    assert_eq!(results.get(&job2.id), Some(&7));

    drop(results);
    controller.stop().await.unwrap();
}

#[derive(Debug, Serialize, Deserialize)]
struct AlwaysFails;

#[async_trait]
impl WorkItem for AlwaysFails {
    const WORK_TYPE: &'static str = "always_fails";

    async fn do_work(&self, _ctx: &WorkContext) -> Result<(), WorkError> {
        Err(WorkError::new("broken"))
    }
}

#[tokio::test(start_paused = true)]
async fn failed_job_waits_out_the_cooldown() {
    let store = Arc::new(MemoryJobStore::new());
    let clock = ManualClock::new(t0());
    let mut registry = WorkItemRegistry::new();
    registry.register::<AlwaysFails>();
    let controller = Controller::new(
        store.clone(),
        registry,
        Arc::new(clock.clone()),
        ControllerConfig::new()
            .with_local_only(true)
            .with_lease_interval(Duration::from_secs(1))
            .with_retry_cooldown(Duration::from_secs(60)),
    );
    controller.start().await.unwrap();

    let job = controller
        .enqueue(&AlwaysFails, EnqueueOptions::new())
        .await
        .unwrap();

    // Wait for the first failed attempt to be recorded.
    loop {
        if let Some(row) = store.job(job.id).await.unwrap() {
            if row.failed >= 1 {
                assert!(row.assigned.is_none());
                assert_eq!(row.not_before, clock.now() + chrono::Duration::seconds(60));
                break;
            }
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    // The wall clock never reaches the cooldown, so no second attempt.
    tokio::time::sleep(Duration::from_secs(10)).await;
    assert_eq!(store.job(job.id).await.unwrap().unwrap().failed, 1);

    // Once it does, the job is retried and fails again.
    clock.advance(Duration::from_secs(61));
    loop {
        if store.job(job.id).await.unwrap().unwrap().failed >= 2 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    controller.stop().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn two_controllers_execute_a_job_exactly_once() {
    let store = Arc::new(MemoryJobStore::new());
    let executions = Arc::new(AtomicUsize::new(0));

    struct CountOnce {
        executions: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl jobgrid_queue::AnyWorkItem for CountOnce {
        fn work_type(&self) -> &str {
            "count_once"
        }

        async fn do_work(&self, _ctx: &WorkContext) -> Result<(), WorkError> {
            self.executions.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    let mut registry = WorkItemRegistry::new();
    let captured = executions.clone();
    registry.register_loader("count_once", move |_fields| {
        Ok(Box::new(CountOnce {
            executions: captured.clone(),
        }))
    });

    let clock = ManualClock::new(t0());
    let a = local_controller(store.clone(), registry.clone(), clock.clone());
    let b = local_controller(store.clone(), registry, clock);
    a.start().await.unwrap();
    b.start().await.unwrap();

    store
        .enqueue(jobgrid_queue::EnqueueRequest {
            work_type: "count_once".into(),
            fields: serde_json::json!({}),
            not_before: t0(),
            priority: Priority::Medium,
            weight: 1,
        })
        .await
        .unwrap();
    a.notify();
    b.notify();

    wait_empty(store.as_ref(), Duration::from_millis(50))
        .await
        .unwrap();
    assert_eq!(executions.load(Ordering::SeqCst), 1);

    a.stop().await.unwrap();
    b.stop().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn stop_right_after_start_shuts_the_loops_down() {
    let store = Arc::new(MemoryJobStore::new());
    let controller =
        local_controller(store.clone(), WorkItemRegistry::new(), ManualClock::new(t0()));
    controller.start().await.unwrap();

    // The background loops may not have polled yet; stop must still
    // terminate them.
    tokio::time::timeout(Duration::from_secs(30), controller.stop())
        .await
        .expect("stop never finished")
        .unwrap();
    assert_eq!(controller.status(), ControllerStatus::Stopped);
    assert!(store.list_nodes().await.unwrap().is_empty());
}

#[tokio::test]
async fn starting_twice_is_an_error() {
    let store = Arc::new(MemoryJobStore::new());
    let controller = local_controller(store, WorkItemRegistry::new(), ManualClock::new(t0()));
    controller.start().await.unwrap();
    assert!(controller.start().await.is_err());
    controller.stop().await.unwrap();
    // A stopped controller can be started again.
    controller.start().await.unwrap();
    controller.stop().await.unwrap();
}

/// Fake worker process: replies Ok to every command, optionally gated.
fn spawn_fake_worker(
    stream: tokio::io::DuplexStream,
    received: Arc<Mutex<Vec<i64>>>,
    gate: Option<Arc<Notify>>,
) {
    tokio::spawn(async move {
        let mut stream = stream;
        loop {
            let command: Command = match read_frame(&mut stream).await {
                Ok(command) => command,
                Err(_) => return,
            };
            received.lock().push(command.descriptor().job_id);
            if let Some(gate) = &gate {
                gate.notified().await;
            }
            if write_frame(&mut stream, &Reply::Ok).await.is_err() {
                return;
            }
        }
    });
}

fn descriptor(job_id: i64, weight: i32) -> jobgrid_queue::JobDescriptor {
    jobgrid_queue::JobDescriptor {
        job_id,
        priority: Priority::Medium,
        weight,
    }
}

#[tokio::test]
async fn worker_dispatch_goes_to_the_least_loaded() {
    let pool = Arc::new(WorkerPool::new());
    let (near_a, far_a) = tokio::io::duplex(4096);
    let (near_b, far_b) = tokio::io::duplex(4096);

    let received_a = Arc::new(Mutex::new(Vec::new()));
    let received_b = Arc::new(Mutex::new(Vec::new()));
    let gate = Arc::new(Notify::new());
    spawn_fake_worker(far_a, received_a.clone(), Some(gate.clone()));
    spawn_fake_worker(far_b, received_b.clone(), None);

    pool.add_worker(near_a, 2);
    pool.add_worker(near_b, 2);

    // First dispatch lands on worker A and stays in flight behind the gate.
    let first = {
        let pool = pool.clone();
        tokio::spawn(async move { pool.perform(descriptor(1, 1)).await })
    };
    while received_a.lock().is_empty() {
        tokio::task::yield_now().await;
    }

    // With A loaded, the next dispatch goes to B.
    pool.perform(descriptor(2, 1)).await.unwrap();
    assert_eq!(*received_b.lock(), vec![2]);

    gate.notify_one();
    first.await.unwrap().unwrap();
    assert_eq!(*received_a.lock(), vec![1]);
}

#[tokio::test]
async fn worker_pool_reports_no_capacity_at_the_ceiling() {
    let pool = Arc::new(WorkerPool::new());
    let (near, far) = tokio::io::duplex(4096);
    let received = Arc::new(Mutex::new(Vec::new()));
    let gate = Arc::new(Notify::new());
    spawn_fake_worker(far, received.clone(), Some(gate.clone()));
    pool.add_worker(near, 1);

    assert!(pool.has_available_capacity());
    let in_flight = {
        let pool = pool.clone();
        tokio::spawn(async move { pool.perform(descriptor(1, 1)).await })
    };
    while received.lock().is_empty() {
        tokio::task::yield_now().await;
    }

    assert!(!pool.has_available_capacity());
    let err = pool.perform(descriptor(2, 1)).await.unwrap_err();
    assert!(matches!(err, jobgrid_cluster::ClusterError::NoCapacity));

    gate.notify_one();
    in_flight.await.unwrap().unwrap();
    assert!(pool.has_available_capacity());
}

#[tokio::test]
async fn one_worker_carries_concurrent_dispatches_up_to_its_ceiling() {
    let pool = Arc::new(WorkerPool::new());
    let (near, far) = tokio::io::duplex(4096);

    // This worker holds both commands before replying to either, so the
    // test deadlocks unless dispatch pipelines instead of waiting for a
    // reply between sends.
    let server = tokio::spawn(async move {
        let mut stream = far;
        let first: Command = read_frame(&mut stream).await.unwrap();
        let second: Command = read_frame(&mut stream).await.unwrap();
        write_frame(&mut stream, &Reply::Ok).await.unwrap();
        write_frame(&mut stream, &Reply::Ok).await.unwrap();
        (first.descriptor().job_id, second.descriptor().job_id)
    });

    pool.add_worker(near, 2);
    let first = {
        let pool = pool.clone();
        tokio::spawn(async move { pool.perform(descriptor(1, 1)).await })
    };
    let second = {
        let pool = pool.clone();
        tokio::spawn(async move { pool.perform(descriptor(2, 1)).await })
    };
    tokio::time::timeout(Duration::from_secs(5), async {
        first.await.unwrap().unwrap();
        second.await.unwrap().unwrap();
    })
    .await
    .expect("concurrent dispatches never completed");

    let (a, b) = server.await.unwrap();
    let mut ids = [a, b];
    ids.sort_unstable();
    assert_eq!(ids, [1, 2]);
}

#[tokio::test]
async fn peer_dispatch_executes_on_the_serving_side() {
    let store = Arc::new(MemoryJobStore::new());
    let results = Arc::new(Mutex::new(HashMap::new()));
    let registry = sum_registry(results.clone());
    let clock = ManualClock::new(t0());
    let executor = Arc::new(JobExecutor::new(
        store.clone(),
        registry,
        Arc::new(clock),
        Duration::from_secs(60),
    ));

    let (client_end, server_end) = tokio::io::duplex(4096);
    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let server = tokio::spawn(serve_connection(server_end, executor, shutdown_rx));

    let job = jobgrid_queue::enqueue_work(
        store.as_ref(),
        &Sum {
            key: "peer".into(),
            amount: 5,
        },
        t0(),
        EnqueueOptions::new().with_weight(5),
    )
    .await
    .unwrap();
    let leased = store
        .next_job(t0(), Priority::Low, t0() - chrono::Duration::hours(1))
        .await
        .unwrap()
        .unwrap();

    let peer = PeerClient::from_stream("test-peer".into(), client_end);
    assert_eq!(peer.current_load_estimate(), 0);
    peer.perform(leased.descriptor()).await.unwrap();
    assert_eq!(peer.current_load_estimate(), 0);

    assert_eq!(results.lock().get("peer"), Some(&5));
    assert!(store.job(job.id).await.unwrap().is_none());

    shutdown_tx.send_replace(true);
    drop(peer);
    let _ = server.await;
}
