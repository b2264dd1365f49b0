//! # jobgrid-pool
//!
//! Bounded asynchronous database connection pool.
//!
//! - **Spooled transactions**: `transaction()` returns immediately; when
//!   the pool is saturated, statements pend in order until a physical
//!   connection frees up.
//! - **Transparent reconnect**: a statement that fails first on a freshly
//!   acquired connection is retried once on a replacement connection.
//! - **Command blocks**: ordered statement groups that run contiguously on
//!   one physical connection within a logical transaction.
//! - **Graceful stop**: retry timers cancelled, in-flight statements
//!   drained, open transactions aborted, connections closed.
//!
//! The pool is generic over [`Connector`]; production uses
//! [`PgConnector`], tests use the scriptable [`FakeConnector`].

pub mod connector;
pub mod error;
pub mod fake;
pub mod pool;
pub mod postgres;

pub use connector::{Connector, RawConnection, Row, SqlValue};
pub use error::{DriverError, PoolError};
pub use fake::{ExecutedStatement, FakeConnector};
pub use pool::{CommandBlock, ConnectionPool, PoolConfig, PooledTransaction};
pub use postgres::PgConnector;
