//! Shared TCP plumbing for the built-in drivers: dialing, and the
//! [`TcpConnection`] handle that supervises a connected stream.

use std::io::ErrorKind;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use futures::future::BoxFuture;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::driver::{ConnectError, ConnectTarget, ConnectionHandle};
use crate::stream::ByteBroker;

const READ_BUF_SIZE: usize = 8192;

/// Dial the target over TCP, mapping connection-level failures to
/// [`ConnectError::Unreachable`].
pub(crate) async fn dial(target: &ConnectTarget) -> Result<TcpStream, ConnectError> {
    TcpStream::connect(target.socket_addr())
        .await
        .map_err(|e| ConnectError::Unreachable(e.to_string()))
}

/// Read exactly `N` probe bytes from a freshly connected stream.
///
/// The probe bytes are consumed: a broadcast channel has no replay, so
/// forwarding them before any subscriber exists would lose them anyway.
pub(crate) async fn read_probe<S, const N: usize>(stream: &mut S) -> Result<[u8; N], ConnectError>
where
    S: AsyncRead + Unpin,
{
    let mut buf = [0u8; N];
    stream.read_exact(&mut buf).await.map_err(|e| {
        if e.kind() == ErrorKind::UnexpectedEof {
            ConnectError::Protocol("connection closed before greeting".to_string())
        } else {
            ConnectError::Unreachable(e.to_string())
        }
    })?;
    Ok(buf)
}

/// A live connection over any byte stream (plain TCP or TLS-wrapped).
///
/// Owns a reader task fanning remote output into a [`ByteBroker`] and a
/// writer task draining the input channel into the stream. Both tasks stop
/// when the cancellation token fires or the peer closes.
#[derive(Debug)]
pub struct TcpConnection {
    broker: ByteBroker,
    peer: String,
    cancel: CancellationToken,
    tracker: TaskTracker,
    closed: AtomicBool,
}

impl TcpConnection {
    /// Spawn the IO tasks for `stream` and return the shared handle.
    pub fn spawn<S>(stream: S, peer: String) -> Arc<Self>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (broker, mut input_rx) = ByteBroker::new();
        let cancel = CancellationToken::new();
        let tracker = TaskTracker::new();

        let (mut reader, mut writer) = tokio::io::split(stream);

        let read_broker = broker.clone();
        let read_cancel = cancel.clone();
        let read_peer = peer.clone();
        tracker.spawn(async move {
            let mut buf = [0u8; READ_BUF_SIZE];
            loop {
                tokio::select! {
                    _ = read_cancel.cancelled() => break,
                    result = reader.read(&mut buf) => match result {
                        Ok(0) => {
                            tracing::debug!(peer = %read_peer, "remote closed connection");
                            break;
                        }
                        Ok(n) => read_broker.publish(Bytes::copy_from_slice(&buf[..n])),
                        Err(e) => {
                            tracing::debug!(peer = %read_peer, error = %e, "read failed");
                            break;
                        }
                    },
                }
            }
        });

        let write_cancel = cancel.clone();
        let write_peer = peer.clone();
        tracker.spawn(async move {
            loop {
                tokio::select! {
                    _ = write_cancel.cancelled() => break,
                    msg = input_rx.recv() => match msg {
                        Some(data) => {
                            if let Err(e) = writer.write_all(&data).await {
                                tracing::debug!(peer = %write_peer, error = %e, "write failed");
                                break;
                            }
                        }
                        None => break,
                    },
                }
            }
            let _ = writer.shutdown().await;
        });

        tracker.close();

        Arc::new(Self {
            broker,
            peer,
            cancel,
            tracker,
            closed: AtomicBool::new(false),
        })
    }
}

impl ConnectionHandle for TcpConnection {
    fn subscribe_output(&self) -> broadcast::Receiver<Bytes> {
        self.broker.subscribe()
    }

    fn input(&self) -> mpsc::Sender<Bytes> {
        self.broker.input()
    }

    fn peer(&self) -> String {
        self.peer.clone()
    }

    fn disconnect(&self) -> BoxFuture<'static, ()> {
        let already_closed = self.closed.swap(true, Ordering::SeqCst);
        let cancel = self.cancel.clone();
        let tracker = self.tracker.clone();
        Box::pin(async move {
            if already_closed {
                return;
            }
            cancel.cancel();
            tracker.wait().await;
        })
    }
}
