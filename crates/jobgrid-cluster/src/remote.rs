//! Request/reply handle over one framed connection
//!
//! Two background tasks own the stream halves: the writer sends commands
//! as they arrive, the reader matches replies to callers in send order.
//! Requests pipeline, so a connection carries as many concurrent round
//! trips as its ceiling allows.

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::debug;

use crate::error::ClusterError;
use crate::protocol::{read_frame, write_frame, Command, Reply};

type ReplySlot = oneshot::Sender<Result<Reply, ClusterError>>;

struct Request {
    command: Command,
    reply: ReplySlot,
}

pub(crate) struct RemoteConnection {
    tx: mpsc::Sender<Request>,
    writer: JoinHandle<()>,
    reader: JoinHandle<()>,
}

impl RemoteConnection {
    pub(crate) fn spawn<S>(stream: S) -> Self
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (mut read_half, mut write_half) = tokio::io::split(stream);
        let (tx, mut rx) = mpsc::channel::<Request>(32);
        // Replies arrive in send order; the writer forwards each caller's
        // slot to the reader as soon as its command is on the wire.
        let (pending_tx, mut pending_rx) = mpsc::unbounded_channel::<ReplySlot>();

        let writer = tokio::spawn(async move {
            while let Some(request) = rx.recv().await {
                if let Err(e) = write_frame(&mut write_half, &request.command).await {
                    let _ = request.reply.send(Err(ClusterError::Protocol(e)));
                    debug!("writer exiting after transport failure");
                    break;
                }
                if pending_tx.send(request.reply).is_err() {
                    break;
                }
            }
        });

        let reader = tokio::spawn(async move {
            while let Some(slot) = pending_rx.recv().await {
                match read_frame::<_, Reply>(&mut read_half).await {
                    Ok(reply) => {
                        let _ = slot.send(Ok(reply));
                    }
                    Err(e) => {
                        // Remaining slots drop with the channel; their
                        // callers observe ConnectionClosed.
                        let _ = slot.send(Err(ClusterError::Protocol(e)));
                        debug!("reader exiting after transport failure");
                        break;
                    }
                }
            }
        });

        Self { tx, writer, reader }
    }

    pub(crate) async fn round_trip(&self, command: Command) -> Result<Reply, ClusterError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(Request {
                command,
                reply: reply_tx,
            })
            .await
            .map_err(|_| ClusterError::ConnectionClosed)?;
        reply_rx.await.map_err(|_| ClusterError::ConnectionClosed)?
    }
}

impl Drop for RemoteConnection {
    fn drop(&mut self) {
        self.writer.abort();
        self.reader.abort();
    }
}
