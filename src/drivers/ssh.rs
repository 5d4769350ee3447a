//! SSH transport driver.
//!
//! Dials the endpoint and reads the server identification line as a
//! liveness probe. No key exchange or channel setup; the handle carries the
//! raw byte stream.

use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;

use crate::driver::{ConnectError, ConnectTarget, ConnectionHandle, Driver};

use super::tcp::{dial, read_probe, TcpConnection};

pub struct SshDriver;

impl Driver for SshDriver {
    fn connect(
        &self,
        target: &ConnectTarget,
        timeout: Duration,
    ) -> BoxFuture<'static, Result<Arc<dyn ConnectionHandle>, ConnectError>> {
        let target = target.clone();
        Box::pin(async move {
            tokio::time::timeout(timeout, async {
                let mut stream = dial(&target).await?;
                let greeting: [u8; 4] = read_probe(&mut stream).await?;
                if &greeting != b"SSH-" {
                    return Err(ConnectError::Protocol(
                        "server did not send an SSH identification line".to_string(),
                    ));
                }
                let peer = stream
                    .peer_addr()
                    .map(|a| a.to_string())
                    .unwrap_or_else(|_| target.socket_addr());
                tracing::debug!(peer = %peer, "ssh identification verified");
                Ok(TcpConnection::spawn(stream, peer) as Arc<dyn ConnectionHandle>)
            })
            .await
            .map_err(|_| ConnectError::Timeout)?
        })
    }
}
