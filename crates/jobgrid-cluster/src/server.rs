//! Inbound side of the wire protocol
//!
//! Serves PerformJob requests from peers and workers' controllers. One
//! command at a time per connection; a command already being executed runs
//! to completion even when shutdown is signalled between frames.

use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::error::ClusterError;
use crate::executor::JobExecutor;
use crate::protocol::{read_frame, write_frame, Command, Reply, ProtocolError};

pub async fn serve_connection<S>(
    mut stream: S,
    executor: Arc<JobExecutor>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(), ClusterError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    loop {
        if *shutdown.borrow_and_update() {
            debug!("closing inbound connection on shutdown");
            return Ok(());
        }
        let command: Command = tokio::select! {
            frame = read_frame(&mut stream) => match frame {
                Ok(command) => command,
                // Clean disconnect between frames.
                Err(ProtocolError::Io(e))
                    if e.kind() == std::io::ErrorKind::UnexpectedEof =>
                {
                    return Ok(());
                }
                Err(e) => return Err(e.into()),
            },
            _ = shutdown.changed() => {
                debug!("closing inbound connection on shutdown");
                return Ok(());
            }
        };

        let descriptor = command.descriptor();
        let reply = match executor.execute(descriptor).await {
            Ok(()) => Reply::Ok,
            Err(e) => {
                warn!(job_id = descriptor.job_id, error = %e, "remote job execution failed");
                Reply::Error {
                    message: e.to_string(),
                }
            }
        };
        write_frame(&mut stream, &reply).await?;
    }
}
