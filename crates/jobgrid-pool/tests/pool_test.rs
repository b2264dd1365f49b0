//! Behavioral tests for the connection pool, driven by the scriptable
//! fake connector.

use std::time::Duration;

use jobgrid_pool::{ConnectionPool, FakeConnector, PoolConfig, PoolError, Row, SqlValue};

fn pool_with(connector: &FakeConnector, max: usize) -> ConnectionPool<FakeConnector> {
    ConnectionPool::new(
        connector.clone(),
        PoolConfig::new()
            .with_max_connections(max)
            .with_connect_retry(Duration::from_secs(2)),
    )
}

#[tokio::test]
async fn execute_returns_canned_rows() {
    let connector = FakeConnector::new();
    connector.set_result("SELECT 1", vec![Row::new(vec![SqlValue::Int(1)])]);
    let pool = pool_with(&connector, 2);

    let tx = pool.transaction();
    let rows = tx.execute("SELECT 1", &[]).await.unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].get(0).and_then(|v| v.as_i64()), Some(1));
    tx.commit().await.unwrap();

    assert_eq!(connector.executed_sql(), vec!["BEGIN", "SELECT 1", "COMMIT"]);
}

#[tokio::test(start_paused = true)]
async fn pool_never_exceeds_max_connections_and_spools_the_extra() {
    let connector = FakeConnector::new();
    let pool = pool_with(&connector, 2);

    let tx1 = pool.transaction();
    let tx2 = pool.transaction();
    tx1.execute("UPDATE a", &[]).await.unwrap();
    tx2.execute("UPDATE b", &[]).await.unwrap();

    // Third transaction must spool: both connections are busy.
    let tx3 = pool.transaction();
    let tx3c = tx3.clone();
    let pending = tokio::spawn(async move { tx3c.execute("UPDATE c", &[]).await });

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!pending.is_finished(), "third statement ran while saturated");

    // Releasing one connection lets the spooled statement execute.
    tx1.commit().await.unwrap();
    pending.await.unwrap().unwrap();
    tx2.commit().await.unwrap();
    tx3.commit().await.unwrap();

    assert_eq!(connector.max_open_connections(), 2);
    assert!(connector.executed_sql().contains(&"UPDATE c".to_string()));
}

#[tokio::test]
async fn begin_failure_on_pooled_connection_is_transparent() {
    let connector = FakeConnector::new();
    connector.set_result("SELECT 2", vec![Row::new(vec![SqlValue::Int(2)])]);
    let pool = pool_with(&connector, 1);

    // Seed the pool with one live connection, then return it.
    let tx = pool.transaction();
    tx.execute("SELECT 2", &[]).await.unwrap();
    tx.commit().await.unwrap();
    assert_eq!(connector.connect_attempts(), 1);

    // The pooled connection "died" while idle: its next BEGIN fails.
    connector.fail_begins(1);
    let tx = pool.transaction();
    let rows = tx.execute("SELECT 2", &[]).await.unwrap();
    assert_eq!(rows[0].get(0).and_then(|v| v.as_i64()), Some(2));
    tx.commit().await.unwrap();

    assert_eq!(connector.connect_attempts(), 2);
}

#[tokio::test]
async fn first_statement_failure_is_retried_on_a_new_connection() {
    let connector = FakeConnector::new();
    connector.set_result("SELECT 3", vec![Row::new(vec![SqlValue::Int(3)])]);
    let pool = pool_with(&connector, 1);

    connector.fail_next_execute("server closed the connection");
    let tx = pool.transaction();
    let rows = tx.execute("SELECT 3", &[]).await.unwrap();
    assert_eq!(rows[0].get(0).and_then(|v| v.as_i64()), Some(3));
    tx.commit().await.unwrap();

    // One reconnect happened and the statement ran on the replacement.
    assert_eq!(connector.connect_attempts(), 2);
    let log = connector.log();
    let select = log.iter().find(|s| s.sql == "SELECT 3").unwrap();
    assert_eq!(select.conn_id, 1);
}

#[tokio::test]
async fn later_statement_failure_surfaces_to_the_caller() {
    let connector = FakeConnector::new();
    let pool = pool_with(&connector, 1);

    let tx = pool.transaction();
    tx.execute("UPDATE a", &[]).await.unwrap();
    connector.fail_next_execute("deadlock detected");
    let err = tx.execute("UPDATE b", &[]).await.unwrap_err();
    assert!(matches!(err, PoolError::Statement(_)));
    assert_eq!(connector.connect_attempts(), 1, "no reconnect for later statements");

    tx.abort().await.unwrap();
}

#[tokio::test]
async fn commit_failure_propagates_and_discards_the_connection() {
    let connector = FakeConnector::new();
    let pool = pool_with(&connector, 1);

    let tx = pool.transaction();
    tx.execute("UPDATE a", &[]).await.unwrap();
    connector.fail_commits(1);
    let err = tx.commit().await.unwrap_err();
    assert!(matches!(err, PoolError::Commit(_)));
    assert_eq!(connector.open_connections(), 0);

    // The slot is still usable; a new connection is opened for it.
    let tx = pool.transaction();
    tx.execute("UPDATE b", &[]).await.unwrap();
    tx.commit().await.unwrap();
    assert_eq!(connector.connect_attempts(), 2);
}

#[tokio::test]
async fn rollback_failure_is_swallowed() {
    let connector = FakeConnector::new();
    let pool = pool_with(&connector, 1);

    let tx = pool.transaction();
    tx.execute("UPDATE a", &[]).await.unwrap();
    connector.fail_rollbacks(1);
    tx.abort().await.unwrap();
    assert_eq!(connector.open_connections(), 0);
}

#[tokio::test]
async fn operations_after_finish_fail() {
    let connector = FakeConnector::new();
    let pool = pool_with(&connector, 1);

    let tx = pool.transaction();
    tx.execute("UPDATE a", &[]).await.unwrap();
    tx.commit().await.unwrap();

    assert!(matches!(
        tx.execute("UPDATE b", &[]).await,
        Err(PoolError::AlreadyFinished)
    ));
    assert!(matches!(tx.commit().await, Err(PoolError::AlreadyFinished)));
    assert!(matches!(tx.abort().await, Err(PoolError::AlreadyFinished)));
    assert!(matches!(
        tx.command_block().await,
        Err(PoolError::AlreadyFinished)
    ));
}

#[tokio::test]
async fn command_block_end_is_mandatory_exactly_once() {
    let connector = FakeConnector::new();
    let pool = pool_with(&connector, 1);

    let tx = pool.transaction();
    let mut block = tx.command_block().await.unwrap();
    block.execute("UPDATE a", &[]).await.unwrap();
    block.end().unwrap();

    assert!(matches!(block.end(), Err(PoolError::AlreadyFinished)));
    assert!(matches!(
        block.execute("UPDATE b", &[]).await,
        Err(PoolError::AlreadyFinished)
    ));

    tx.commit().await.unwrap();
}

#[tokio::test]
async fn command_block_statements_run_contiguously() {
    let connector = FakeConnector::new();
    let pool = pool_with(&connector, 1);

    let tx = pool.transaction();
    let mut block = tx.command_block().await.unwrap();

    // A statement issued on the transaction while the block is open must
    // wait until the block ends.
    let outside_tx = tx.clone();
    let outside = tokio::spawn(async move { outside_tx.execute("OUTSIDE", &[]).await });
    for _ in 0..10 {
        tokio::task::yield_now().await;
    }

    block.execute("IN 1", &[]).await.unwrap();
    block.execute("IN 2", &[]).await.unwrap();
    block.end().unwrap();

    outside.await.unwrap().unwrap();
    tx.commit().await.unwrap();

    assert_eq!(
        connector.executed_sql(),
        vec!["BEGIN", "IN 1", "IN 2", "OUTSIDE", "COMMIT"]
    );
}

#[tokio::test]
async fn dropped_transaction_returns_its_slot() {
    let connector = FakeConnector::new();
    let pool = pool_with(&connector, 1);

    let tx = pool.transaction();
    tx.execute("UPDATE a", &[]).await.unwrap();
    drop(tx);

    // The only slot came back, so the next transaction must not hang.
    let tx = pool.transaction();
    tokio::time::timeout(Duration::from_secs(5), tx.execute("UPDATE b", &[]))
        .await
        .expect("slot was never returned to the pool")
        .unwrap();
    tx.commit().await.unwrap();

    // The abandoned connection is discarded, not reused mid-transaction.
    assert_eq!(connector.connect_attempts(), 2);
    for _ in 0..10 {
        tokio::task::yield_now().await;
    }
    assert_eq!(connector.open_connections(), 1);
}

#[tokio::test(start_paused = true)]
async fn failed_connects_are_retried_on_a_fixed_delay() {
    let connector = FakeConnector::new();
    connector.set_result("SELECT 4", vec![Row::new(vec![SqlValue::Int(4)])]);
    connector.fail_connects(2);
    let pool = pool_with(&connector, 1);

    // The statement stays queued through two retry delays, then succeeds.
    let tx = pool.transaction();
    let rows = tx.execute("SELECT 4", &[]).await.unwrap();
    assert_eq!(rows[0].get(0).and_then(|v| v.as_i64()), Some(4));
    tx.commit().await.unwrap();

    assert_eq!(connector.connect_attempts(), 3);
}

#[tokio::test]
async fn stop_aborts_open_transactions_and_closes_connections() {
    let connector = FakeConnector::new();
    let pool = pool_with(&connector, 2);

    let tx = pool.transaction();
    tx.execute("UPDATE a", &[]).await.unwrap();

    pool.stop().await;

    assert!(connector.executed_sql().contains(&"ROLLBACK".to_string()));
    assert_eq!(connector.open_connections(), 0);
    assert!(matches!(
        tx.execute("UPDATE b", &[]).await,
        Err(PoolError::AlreadyFinished)
    ));
}

#[tokio::test]
async fn transactions_after_stop_fail_with_pool_closed() {
    let connector = FakeConnector::new();
    let pool = pool_with(&connector, 1);
    pool.stop().await;

    let tx = pool.transaction();
    assert!(matches!(
        tx.execute("SELECT 1", &[]).await,
        Err(PoolError::Closed)
    ));
    assert!(matches!(tx.commit().await, Err(PoolError::Closed)));
}

#[tokio::test(start_paused = true)]
async fn spooled_statements_fail_when_the_pool_stops() {
    let connector = FakeConnector::new();
    connector.fail_connects(usize::MAX);
    let pool = pool_with(&connector, 1);

    let tx = pool.transaction();
    let txc = tx.clone();
    let pending = tokio::spawn(async move { txc.execute("SELECT 1", &[]).await });
    for _ in 0..10 {
        tokio::task::yield_now().await;
    }

    pool.stop().await;
    let result = pending.await.unwrap();
    assert!(matches!(result, Err(PoolError::Closed)));
}
