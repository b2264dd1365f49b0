//! Peer node connections
//!
//! A peer is another controller process reached over TCP. The load
//! estimate is the sum of weights this node has dispatched to the peer and
//! not yet seen replies for; it is an estimate because the peer also takes
//! work from other sources.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tracing::debug;

use jobgrid_queue::JobDescriptor;

use crate::error::ClusterError;
use crate::performer::Performer;
use crate::protocol::{Command, Reply};
use crate::remote::RemoteConnection;

pub struct PeerClient {
    label: String,
    connection: RemoteConnection,
    outstanding_weight: Arc<AtomicI64>,
}

impl PeerClient {
    /// Connect to a peer controller's listener.
    pub async fn connect(addr: &str) -> Result<Self, ClusterError> {
        let stream = TcpStream::connect(addr).await?;
        Ok(Self::from_stream(addr.to_string(), stream))
    }

    /// Wrap an already-established stream (tests use in-memory duplexes).
    pub fn from_stream<S>(label: String, stream: S) -> Self
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        Self {
            label,
            connection: RemoteConnection::spawn(stream),
            outstanding_weight: Arc::new(AtomicI64::new(0)),
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    /// Sum of outstanding dispatched weights.
    pub fn current_load_estimate(&self) -> i64 {
        self.outstanding_weight.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Performer for PeerClient {
    async fn perform(&self, descriptor: JobDescriptor) -> Result<(), ClusterError> {
        let weight = descriptor.weight as i64;
        self.outstanding_weight.fetch_add(weight, Ordering::SeqCst);
        debug!(peer = %self.label, job_id = descriptor.job_id, "dispatching to peer");
        let result = self.connection.round_trip(Command::perform(descriptor)).await;
        self.outstanding_weight.fetch_sub(weight, Ordering::SeqCst);
        match result? {
            Reply::Ok => Ok(()),
            Reply::Error { message } => Err(ClusterError::Remote(message)),
        }
    }
}
