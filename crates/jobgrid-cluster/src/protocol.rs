//! Wire protocol for node-to-node and node-to-worker dispatch
//!
//! Wire format: 4-byte length prefix (big-endian) + JSON payload. One
//! command per request, one reply per command, in order, on a private TCP
//! channel. There is no cancellation message; an abandoned sender just
//! stops waiting for the reply.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use jobgrid_queue::{JobDescriptor, JobId, Priority};

/// Frames above this size are rejected rather than buffered.
pub const MAX_FRAME_LEN: u32 = 1024 * 1024;

/// Protocol errors
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("frame of {0} bytes exceeds the {MAX_FRAME_LEN} byte limit")]
    FrameTooLarge(u32),

    #[error("invalid frame payload: {0}")]
    Encoding(#[from] serde_json::Error),
}

/// Request frames.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum Command {
    /// Execute one already-leased job on the receiving process.
    PerformJob {
        job_id: JobId,
        priority: Priority,
        weight: i32,
    },
}

impl Command {
    pub fn perform(descriptor: JobDescriptor) -> Self {
        Self::PerformJob {
            job_id: descriptor.job_id,
            priority: descriptor.priority,
            weight: descriptor.weight,
        }
    }

    pub fn descriptor(&self) -> JobDescriptor {
        match self {
            Self::PerformJob {
                job_id,
                priority,
                weight,
            } => JobDescriptor {
                job_id: *job_id,
                priority: *priority,
                weight: *weight,
            },
        }
    }
}

/// Reply frames.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "reply", rename_all = "snake_case")]
pub enum Reply {
    Ok,
    Error { message: String },
}

/// Write one length-prefixed JSON frame.
pub async fn write_frame<W, T>(writer: &mut W, message: &T) -> Result<(), ProtocolError>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let payload = serde_json::to_vec(message)?;
    let len = u32::try_from(payload.len()).map_err(|_| ProtocolError::FrameTooLarge(u32::MAX))?;
    if len > MAX_FRAME_LEN {
        return Err(ProtocolError::FrameTooLarge(len));
    }
    writer.write_all(&len.to_be_bytes()).await?;
    writer.write_all(&payload).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one length-prefixed JSON frame.
pub async fn read_frame<R, T>(reader: &mut R) -> Result<T, ProtocolError>
where
    R: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    let mut len_bytes = [0u8; 4];
    reader.read_exact(&mut len_bytes).await?;
    let len = u32::from_be_bytes(len_bytes);
    if len > MAX_FRAME_LEN {
        return Err(ProtocolError::FrameTooLarge(len));
    }
    let mut payload = vec![0u8; len as usize];
    reader.read_exact(&mut payload).await?;
    Ok(serde_json::from_slice(&payload)?)
}
