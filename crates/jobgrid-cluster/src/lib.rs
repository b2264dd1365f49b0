//! Clustered execution on top of the persistent job queue
//!
//! Each node process runs one [`Controller`]. Controllers share nothing
//! but the database: leasing in the store decides ownership, and this
//! crate decides where an owned job runs (in-process, on a local worker
//! process, or on a peer node over the wire protocol).

pub mod config;
pub mod controller;
pub mod error;
pub mod executor;
pub mod peer;
pub mod performer;
pub mod protocol;
mod remote;
pub mod server;
pub mod worker_pool;

pub use config::ControllerConfig;
pub use controller::{Controller, ControllerStatus};
pub use error::ClusterError;
pub use executor::JobExecutor;
pub use peer::PeerClient;
pub use performer::{InlinePerformer, Performer};
pub use protocol::{read_frame, write_frame, Command, ProtocolError, Reply};
pub use server::serve_connection;
pub use worker_pool::{WorkerHandle, WorkerPool};
