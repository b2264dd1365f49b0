//! Bounded connection pool with spooled transactions
//!
//! `transaction()` hands back a usable handle immediately even when every
//! physical connection is busy: statements issued on an unattached
//! transaction pend in FIFO order and replay once a connection frees up.
//! A connection that fails its first statement after being handed to a
//! transaction is presumed dead, replaced, and the statement retried once
//! without the caller noticing.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch, Mutex, OwnedMutexGuard};
use tracing::{debug, warn};

use crate::connector::{Connector, RawConnection, Row, SqlValue};
use crate::error::PoolError;

/// Pool configuration
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Maximum number of physical connections open at once
    pub max_connections: usize,

    /// Fixed delay between failed connect attempts
    pub connect_retry: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_connections: 10,
            connect_retry: Duration::from_secs(2),
        }
    }
}

impl PoolConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_connections(mut self, max: usize) -> Self {
        self.max_connections = max.max(1);
        self
    }

    pub fn with_connect_retry(mut self, retry: Duration) -> Self {
        self.connect_retry = retry;
        self
    }
}

/// A connection attached to one transaction.
///
/// `fresh` is true until the first successful user statement; a failure
/// while fresh triggers the discard-and-retry-once path.
struct Holder<C: Connector> {
    conn: C::Connection,
    fresh: bool,
}

enum TxState<C: Connector> {
    /// No physical connection yet; statements spool until one is acquired
    Idle,
    /// Attached to a connection with an open transaction
    Open(Holder<C>),
    /// Committed or aborted
    Finished,
}

struct TxInner<C: Connector> {
    state: TxState<C>,
    free_tx: mpsc::Sender<Option<C::Connection>>,
}

impl<C: Connector> Drop for TxInner<C> {
    fn drop(&mut self) {
        if let TxState::Open(holder) = std::mem::replace(&mut self.state, TxState::Finished) {
            // Dropped without commit or abort. The uncommitted work is lost
            // with the connection, but the slot must go back or the pool
            // shrinks permanently. The channel always has room for it.
            let _ = self.free_tx.try_send(None);
            if let Ok(handle) = tokio::runtime::Handle::try_current() {
                handle.spawn(async move {
                    holder.conn.close().await;
                });
            }
        }
    }
}

struct Shared<C: Connector> {
    connector: C,
    config: PoolConfig,
    /// Free connection slots; `None` means the slot has no live connection
    /// and the next acquirer opens one.
    free_rx: Mutex<mpsc::Receiver<Option<C::Connection>>>,
    free_tx: mpsc::Sender<Option<C::Connection>>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
    /// Live transaction handles, aborted during `stop()`.
    active: parking_lot::Mutex<Vec<std::sync::Weak<Mutex<TxInner<C>>>>>,
}

impl<C: Connector> Shared<C> {
    fn is_closed(&self) -> bool {
        *self.shutdown_rx.borrow()
    }

    /// Resolves once the pool has been stopped.
    async fn closed_wait(&self) {
        let mut rx = self.shutdown_rx.clone();
        loop {
            if *rx.borrow() {
                return;
            }
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    /// Open a connection, retrying on a fixed delay until the pool stops.
    async fn connect_with_retry(&self) -> Result<C::Connection, PoolError> {
        loop {
            if self.is_closed() {
                return Err(PoolError::Closed);
            }
            match self.connector.connect().await {
                Ok(conn) => return Ok(conn),
                Err(e) => {
                    warn!(
                        error = %e,
                        retry_in_ms = self.config.connect_retry.as_millis() as u64,
                        "database connect failed"
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(self.config.connect_retry) => {}
                        _ = self.closed_wait() => return Err(PoolError::Closed),
                    }
                }
            }
        }
    }

    /// Take a free slot, opening a connection for it if needed.
    async fn acquire_conn(&self) -> Result<C::Connection, PoolError> {
        if self.is_closed() {
            return Err(PoolError::Closed);
        }
        let slot = {
            let mut rx = tokio::select! {
                guard = self.free_rx.lock() => guard,
                _ = self.closed_wait() => return Err(PoolError::Closed),
            };
            tokio::select! {
                slot = rx.recv() => slot.ok_or(PoolError::Closed)?,
                _ = self.closed_wait() => return Err(PoolError::Closed),
            }
        };
        match slot {
            Some(conn) => Ok(conn),
            None => self.connect_with_retry().await,
        }
    }

    /// Return a healthy connection to the free list.
    async fn release(&self, conn: C::Connection) {
        // The channel is sized to the pool; send cannot block for long.
        let _ = self.free_tx.send(Some(conn)).await;
    }

    /// Return an empty slot after a connection was discarded, keeping the
    /// pool size constant.
    async fn release_empty_slot(&self) {
        let _ = self.free_tx.send(None).await;
    }

    /// Discard the holder's connection and attach a freshly opened one.
    async fn replace_conn(&self, holder: &mut Holder<C>) -> Result<(), PoolError> {
        let replacement = self.connect_with_retry().await?;
        let old = std::mem::replace(&mut holder.conn, replacement);
        old.close().await;
        holder.fresh = true;
        Ok(())
    }

    /// Acquire a connection and open a transaction on it.
    async fn attach(&self) -> Result<Holder<C>, PoolError> {
        let conn = self.acquire_conn().await?;
        let mut holder: Holder<C> = Holder { conn, fresh: true };
        if let Err(e) = holder.conn.begin().await {
            debug!(error = %e, "begin failed on pooled connection, replacing it");
            self.replace_conn(&mut holder).await?;
            holder
                .conn
                .begin()
                .await
                .map_err(|e| PoolError::Statement(e.0))?;
        }
        Ok(holder)
    }

    /// Run one statement with the first-statement reconnect heuristic.
    async fn run_statement(
        &self,
        holder: &mut Holder<C>,
        sql: &str,
        params: &[SqlValue],
    ) -> Result<Vec<Row>, PoolError> {
        match holder.conn.execute(sql, params).await {
            Ok(rows) => {
                holder.fresh = false;
                Ok(rows)
            }
            Err(e) if holder.fresh => {
                // Nothing has run in this transaction yet, so it is safe to
                // replay BEGIN plus this one statement on a new connection.
                debug!(error = %e, "first statement failed on fresh connection, retrying once");
                self.replace_conn(holder).await?;
                holder
                    .conn
                    .begin()
                    .await
                    .map_err(|e| PoolError::Statement(e.0))?;
                let rows = holder
                    .conn
                    .execute(sql, params)
                    .await
                    .map_err(|e| PoolError::Statement(e.0))?;
                holder.fresh = false;
                Ok(rows)
            }
            Err(e) => Err(PoolError::Statement(e.0)),
        }
    }

    async fn execute_locked(
        &self,
        inner: &mut TxInner<C>,
        sql: &str,
        params: &[SqlValue],
    ) -> Result<Vec<Row>, PoolError> {
        loop {
            match &mut inner.state {
                TxState::Finished => return Err(PoolError::AlreadyFinished),
                TxState::Open(holder) => return self.run_statement(holder, sql, params).await,
                TxState::Idle => {
                    let holder = self.attach().await?;
                    inner.state = TxState::Open(holder);
                }
            }
        }
    }

    async fn finish_locked(&self, inner: &mut TxInner<C>, commit: bool) -> Result<(), PoolError> {
        match std::mem::replace(&mut inner.state, TxState::Finished) {
            TxState::Finished => Err(PoolError::AlreadyFinished),
            TxState::Idle => {
                if self.is_closed() {
                    Err(PoolError::Closed)
                } else {
                    // Nothing was ever executed; there is nothing to persist
                    // or roll back.
                    Ok(())
                }
            }
            TxState::Open(mut holder) => {
                if commit {
                    match holder.conn.commit().await {
                        Ok(()) => {
                            self.release(holder.conn).await;
                            Ok(())
                        }
                        Err(e) => {
                            // Data may not have persisted; surface the error
                            // and discard the connection.
                            holder.conn.close().await;
                            self.release_empty_slot().await;
                            Err(PoolError::Commit(e.0))
                        }
                    }
                } else {
                    match holder.conn.rollback().await {
                        Ok(()) => {
                            self.release(holder.conn).await;
                            Ok(())
                        }
                        Err(e) => {
                            // A connection that cannot roll back is unusable.
                            // The abort itself still succeeds from the
                            // caller's point of view.
                            warn!(error = %e, "rollback failed, discarding connection");
                            holder.conn.close().await;
                            self.release_empty_slot().await;
                            Ok(())
                        }
                    }
                }
            }
        }
    }
}

/// Bounded asynchronous connection pool.
///
/// # Example
///
/// ```ignore
/// let pool = ConnectionPool::new(PgConnector::new(url), PoolConfig::default());
/// let tx = pool.transaction();
/// tx.execute("SELECT 1", &[]).await?;
/// tx.commit().await?;
/// pool.stop().await;
/// ```
pub struct ConnectionPool<C: Connector> {
    shared: Arc<Shared<C>>,
}

impl<C: Connector> Clone for ConnectionPool<C> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<C: Connector> ConnectionPool<C> {
    pub fn new(connector: C, config: PoolConfig) -> Self {
        let (free_tx, free_rx) = mpsc::channel(config.max_connections);
        for _ in 0..config.max_connections {
            // Slots start without live connections; they are opened lazily.
            let _ = free_tx.try_send(None);
        }
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        Self {
            shared: Arc::new(Shared {
                connector,
                config,
                free_rx: Mutex::new(free_rx),
                free_tx,
                shutdown_tx,
                shutdown_rx,
                active: parking_lot::Mutex::new(Vec::new()),
            }),
        }
    }

    /// Begin a logical transaction.
    ///
    /// Returns immediately even when no physical connection is free; the
    /// handle attaches to one the first time a statement is issued.
    pub fn transaction(&self) -> PooledTransaction<C> {
        let inner = Arc::new(Mutex::new(TxInner {
            state: TxState::Idle,
            free_tx: self.shared.free_tx.clone(),
        }));
        {
            let mut active = self.shared.active.lock();
            active.retain(|w| w.strong_count() > 0);
            active.push(Arc::downgrade(&inner));
        }
        PooledTransaction {
            shared: Arc::clone(&self.shared),
            inner,
        }
    }

    /// True once `stop()` has begun.
    pub fn is_closed(&self) -> bool {
        self.shared.is_closed()
    }

    /// Stop the pool.
    ///
    /// Cancels pending connect-retry timers, waits for in-flight statements
    /// to finish, aborts transactions still open, and closes every pooled
    /// connection before returning. Operations on transactions requested
    /// after this point fail with [`PoolError::Closed`].
    pub async fn stop(&self) {
        if self.shared.shutdown_tx.send_replace(true) {
            return; // already stopped
        }

        let open: Vec<Arc<Mutex<TxInner<C>>>> = {
            let mut active = self.shared.active.lock();
            active.drain(..).filter_map(|w| w.upgrade()).collect()
        };
        for tx in open {
            // Locking waits for any in-flight statement on this transaction.
            let mut inner = tx.lock().await;
            if let Err(e) = self.shared.finish_locked(&mut inner, false).await {
                match e {
                    PoolError::AlreadyFinished | PoolError::Closed => {}
                    other => warn!(error = %other, "abort during pool stop failed"),
                }
            }
        }

        let mut rx = self.shared.free_rx.lock().await;
        while let Ok(slot) = rx.try_recv() {
            if let Some(conn) = slot {
                conn.close().await;
            }
        }
        debug!("connection pool stopped");
    }
}

/// Handle for one logical transaction.
///
/// The handle is cheap to clone; all clones address the same transaction,
/// and statements issued concurrently are serialized in arrival order.
pub struct PooledTransaction<C: Connector> {
    shared: Arc<Shared<C>>,
    inner: Arc<Mutex<TxInner<C>>>,
}

impl<C: Connector> Clone for PooledTransaction<C> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<C: Connector> PooledTransaction<C> {
    /// Execute one statement.
    ///
    /// Pends until a physical connection is available if the pool is
    /// saturated.
    pub async fn execute(&self, sql: &str, params: &[SqlValue]) -> Result<Vec<Row>, PoolError> {
        let mut inner = self.inner.lock().await;
        self.shared.execute_locked(&mut inner, sql, params).await
    }

    /// Commit the transaction, releasing its connection to the free pool.
    ///
    /// A commit failure is propagated; the data may not have persisted.
    pub async fn commit(&self) -> Result<(), PoolError> {
        let mut inner = self.inner.lock().await;
        self.shared.finish_locked(&mut inner, true).await
    }

    /// Roll back the transaction.
    ///
    /// A failure of the underlying rollback is not surfaced; the connection
    /// is discarded and replaced instead.
    pub async fn abort(&self) -> Result<(), PoolError> {
        let mut inner = self.inner.lock().await;
        self.shared.finish_locked(&mut inner, false).await
    }

    /// Open an ordered command block.
    ///
    /// Statements issued through the block run contiguously on the
    /// transaction's connection; statements issued on the transaction by
    /// other callers wait until [`CommandBlock::end`] releases the block.
    pub async fn command_block(&self) -> Result<CommandBlock<C>, PoolError> {
        let guard = Arc::clone(&self.inner).lock_owned().await;
        if matches!(guard.state, TxState::Finished) {
            return Err(PoolError::AlreadyFinished);
        }
        Ok(CommandBlock {
            shared: Arc::clone(&self.shared),
            guard: Some(guard),
        })
    }
}

/// Ordered group of statements holding exclusive use of the transaction.
pub struct CommandBlock<C: Connector> {
    shared: Arc<Shared<C>>,
    guard: Option<OwnedMutexGuard<TxInner<C>>>,
}

impl<C: Connector> CommandBlock<C> {
    /// Execute one statement inside the block.
    pub async fn execute(&mut self, sql: &str, params: &[SqlValue]) -> Result<Vec<Row>, PoolError> {
        let inner = self
            .guard
            .as_deref_mut()
            .ok_or(PoolError::AlreadyFinished)?;
        self.shared.execute_locked(inner, sql, params).await
    }

    /// End the block, letting queued statements on the transaction proceed.
    ///
    /// Must be called exactly once; a second call, or `execute` after the
    /// block ended, fails with [`PoolError::AlreadyFinished`].
    pub fn end(&mut self) -> Result<(), PoolError> {
        match self.guard.take() {
            Some(_) => Ok(()),
            None => Err(PoolError::AlreadyFinished),
        }
    }
}
