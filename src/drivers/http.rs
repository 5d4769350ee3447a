//! HTTP transport driver.
//!
//! Plain TCP connect; HTTP offers no server-first greeting to probe, so a
//! successful connect is the liveness signal. Request framing and response
//! parsing belong to whoever attaches to the byte stream.

use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;

use crate::driver::{ConnectError, ConnectTarget, ConnectionHandle, Driver};

use super::tcp::{dial, TcpConnection};

pub struct HttpDriver;

impl Driver for HttpDriver {
    fn connect(
        &self,
        target: &ConnectTarget,
        timeout: Duration,
    ) -> BoxFuture<'static, Result<Arc<dyn ConnectionHandle>, ConnectError>> {
        let target = target.clone();
        Box::pin(async move {
            tokio::time::timeout(timeout, async {
                let stream = dial(&target).await?;
                let peer = stream
                    .peer_addr()
                    .map(|a| a.to_string())
                    .unwrap_or_else(|_| target.socket_addr());
                tracing::debug!(peer = %peer, "http transport connected");
                Ok(TcpConnection::spawn(stream, peer) as Arc<dyn ConnectionHandle>)
            })
            .await
            .map_err(|_| ConnectError::Timeout)?
        })
    }
}
