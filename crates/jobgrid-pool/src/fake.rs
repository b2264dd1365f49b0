//! Scriptable in-memory connector for testing
//!
//! This is primarily for tests of the pool and of code layered on top of
//! it. Failures can be injected per operation kind, canned result rows
//! registered per statement, and every executed statement is logged with
//! the id of the connection that ran it.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::connector::{Connector, RawConnection, Row, SqlValue};
use crate::error::DriverError;

/// One statement observed by the fake, in execution order.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutedStatement {
    pub conn_id: usize,
    pub sql: String,
    pub params: Vec<SqlValue>,
}

#[derive(Default)]
struct FakeState {
    connects: AtomicUsize,
    open: AtomicUsize,
    max_open: AtomicUsize,
    fail_connects: AtomicUsize,
    fail_begins: AtomicUsize,
    fail_commits: AtomicUsize,
    fail_rollbacks: AtomicUsize,
    fail_executes: Mutex<VecDeque<String>>,
    results: Mutex<HashMap<String, Vec<Row>>>,
    log: Mutex<Vec<ExecutedStatement>>,
}

/// In-memory connector with scriptable failures.
#[derive(Clone, Default)]
pub struct FakeConnector {
    state: Arc<FakeState>,
}

impl FakeConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Total connect attempts, successful or not
    pub fn connect_attempts(&self) -> usize {
        self.state.connects.load(Ordering::SeqCst)
    }

    /// Connections currently open
    pub fn open_connections(&self) -> usize {
        self.state.open.load(Ordering::SeqCst)
    }

    /// High-water mark of simultaneously open connections
    pub fn max_open_connections(&self) -> usize {
        self.state.max_open.load(Ordering::SeqCst)
    }

    /// Fail the next `n` connect attempts
    pub fn fail_connects(&self, n: usize) {
        self.state.fail_connects.store(n, Ordering::SeqCst);
    }

    /// Fail the next `n` BEGINs
    pub fn fail_begins(&self, n: usize) {
        self.state.fail_begins.store(n, Ordering::SeqCst);
    }

    /// Fail the next `n` commits
    pub fn fail_commits(&self, n: usize) {
        self.state.fail_commits.store(n, Ordering::SeqCst);
    }

    /// Fail the next `n` rollbacks
    pub fn fail_rollbacks(&self, n: usize) {
        self.state.fail_rollbacks.store(n, Ordering::SeqCst);
    }

    /// Fail the next executed statement with the given message
    pub fn fail_next_execute(&self, message: impl Into<String>) {
        self.state.fail_executes.lock().push_back(message.into());
    }

    /// Register canned result rows for a statement
    pub fn set_result(&self, sql: impl Into<String>, rows: Vec<Row>) {
        self.state.results.lock().insert(sql.into(), rows);
    }

    /// Every statement executed so far, including BEGIN/COMMIT/ROLLBACK
    pub fn log(&self) -> Vec<ExecutedStatement> {
        self.state.log.lock().clone()
    }

    /// SQL text of executed statements, in order
    pub fn executed_sql(&self) -> Vec<String> {
        self.state.log.lock().iter().map(|s| s.sql.clone()).collect()
    }
}

#[async_trait]
impl Connector for FakeConnector {
    type Connection = FakeConnection;

    async fn connect(&self) -> Result<Self::Connection, DriverError> {
        let id = self.state.connects.fetch_add(1, Ordering::SeqCst);
        if take_one(&self.state.fail_connects) {
            return Err(DriverError::new("connect refused"));
        }
        let open = self.state.open.fetch_add(1, Ordering::SeqCst) + 1;
        self.state.max_open.fetch_max(open, Ordering::SeqCst);
        Ok(FakeConnection {
            id,
            state: Arc::clone(&self.state),
        })
    }
}

fn take_one(counter: &AtomicUsize) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

/// Connection handed out by [`FakeConnector`].
pub struct FakeConnection {
    id: usize,
    state: Arc<FakeState>,
}

impl FakeConnection {
    fn record(&self, sql: &str, params: &[SqlValue]) {
        self.state.log.lock().push(ExecutedStatement {
            conn_id: self.id,
            sql: sql.to_string(),
            params: params.to_vec(),
        });
    }
}

#[async_trait]
impl RawConnection for FakeConnection {
    async fn begin(&mut self) -> Result<(), DriverError> {
        if take_one(&self.state.fail_begins) {
            return Err(DriverError::new("begin failed"));
        }
        self.record("BEGIN", &[]);
        Ok(())
    }

    async fn execute(&mut self, sql: &str, params: &[SqlValue]) -> Result<Vec<Row>, DriverError> {
        if let Some(message) = self.state.fail_executes.lock().pop_front() {
            return Err(DriverError(message));
        }
        self.record(sql, params);
        Ok(self
            .state
            .results
            .lock()
            .get(sql)
            .cloned()
            .unwrap_or_default())
    }

    async fn commit(&mut self) -> Result<(), DriverError> {
        if take_one(&self.state.fail_commits) {
            return Err(DriverError::new("commit failed"));
        }
        self.record("COMMIT", &[]);
        Ok(())
    }

    async fn rollback(&mut self) -> Result<(), DriverError> {
        if take_one(&self.state.fail_rollbacks) {
            return Err(DriverError::new("rollback failed"));
        }
        self.record("ROLLBACK", &[]);
        Ok(())
    }

    async fn close(self) {
        self.state.open.fetch_sub(1, Ordering::SeqCst);
    }
}
