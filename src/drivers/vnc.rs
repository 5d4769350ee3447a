//! VNC transport driver.
//!
//! Reads the 12-byte RFB ProtocolVersion greeting as a liveness probe, then
//! exposes the raw byte stream. No RFB handshake or framebuffer decoding.

use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;

use crate::driver::{ConnectError, ConnectTarget, ConnectionHandle, Driver};

use super::tcp::{dial, read_probe, TcpConnection};

pub struct VncDriver;

impl Driver for VncDriver {
    fn connect(
        &self,
        target: &ConnectTarget,
        timeout: Duration,
    ) -> BoxFuture<'static, Result<Arc<dyn ConnectionHandle>, ConnectError>> {
        let target = target.clone();
        Box::pin(async move {
            tokio::time::timeout(timeout, async {
                let mut stream = dial(&target).await?;
                // "RFB 003.008\n" and friends.
                let greeting: [u8; 12] = read_probe(&mut stream).await?;
                if &greeting[..4] != b"RFB " {
                    return Err(ConnectError::Protocol(
                        "server did not send an RFB greeting".to_string(),
                    ));
                }
                let peer = stream
                    .peer_addr()
                    .map(|a| a.to_string())
                    .unwrap_or_else(|_| target.socket_addr());
                tracing::debug!(
                    peer = %peer,
                    version = %String::from_utf8_lossy(&greeting).trim_end(),
                    "rfb greeting verified"
                );
                Ok(TcpConnection::spawn(stream, peer) as Arc<dyn ConnectionHandle>)
            })
            .await
            .map_err(|_| ConnectError::Timeout)?
        })
    }
}
