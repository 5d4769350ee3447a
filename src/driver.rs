//! Protocol driver abstraction.
//!
//! A [`Driver`] is a stateless connection factory for one protocol; all
//! per-connection state lives in the [`ConnectionHandle`] it returns.
//! Drivers establish and supervise the underlying transport and expose a
//! byte stream. They do not implement protocol codecs.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::future::BoxFuture;
use parking_lot::RwLock;
use serde::ser::SerializeStruct;
use serde::{Serialize, Serializer};
use tokio::sync::{broadcast, mpsc};

use crate::host::{HostRecord, Protocol};

/// Why a connection attempt failed.
///
/// Cloneable so the multiplexer can retain it as a session's `last_error`
/// while also broadcasting it in events.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConnectError {
    #[error("connection attempt timed out")]
    Timeout,
    #[error("endpoint unreachable: {0}")]
    Unreachable(String),
    #[error("authentication failed: {0}")]
    AuthFailed(String),
    #[error("protocol error: {0}")]
    Protocol(String),
}

impl ConnectError {
    /// Stable machine-readable kind string.
    pub fn kind(&self) -> &'static str {
        match self {
            ConnectError::Timeout => "timeout",
            ConnectError::Unreachable(_) => "unreachable",
            ConnectError::AuthFailed(_) => "auth_failed",
            ConnectError::Protocol(_) => "protocol",
        }
    }
}

impl Serialize for ConnectError {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut s = serializer.serialize_struct("ConnectError", 2)?;
        s.serialize_field("kind", self.kind())?;
        s.serialize_field("message", &self.to_string())?;
        s.end()
    }
}

/// Resolved connection parameters handed to a driver.
#[derive(Clone)]
pub struct ConnectTarget {
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
}

impl ConnectTarget {
    /// Build a target from a stored record: split an optional `:port` off
    /// the address, falling back to the protocol's default port.
    pub fn from_record(record: &HostRecord) -> Self {
        let (host, port) = split_host_port(&record.address, record.protocol.default_port());
        Self {
            host,
            port,
            username: record.username.clone(),
            password: record.password.clone(),
        }
    }

    pub fn socket_addr(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

// Manual impl so passwords never reach logs via {:?}.
impl fmt::Debug for ConnectTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectTarget")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

/// Split `host`, `host:port`, or `[v6]:port` into host and port parts.
fn split_host_port(address: &str, default_port: u16) -> (String, u16) {
    if let Some(rest) = address.strip_prefix('[') {
        if let Some((host, port_part)) = rest.split_once(']') {
            let port = port_part
                .strip_prefix(':')
                .and_then(|p| p.parse().ok())
                .unwrap_or(default_port);
            return (host.to_string(), port);
        }
    }
    if let Some((host, port_part)) = address.rsplit_once(':') {
        // A second colon means a bare IPv6 address, not host:port.
        if !host.contains(':') {
            if let Ok(port) = port_part.parse() {
                return (host.to_string(), port);
            }
        }
    }
    (address.to_string(), default_port)
}

/// A live transport connection.
///
/// `disconnect` is idempotent: implementations guard it with an atomic flag
/// so repeat calls are no-ops.
pub trait ConnectionHandle: Send + Sync + fmt::Debug {
    /// Subscribe to bytes arriving from the remote end. Late subscribers
    /// miss earlier output.
    fn subscribe_output(&self) -> broadcast::Receiver<Bytes>;

    /// Sender for bytes destined to the remote end.
    fn input(&self) -> mpsc::Sender<Bytes>;

    /// Remote address, for logging.
    fn peer(&self) -> String;

    /// Close the connection and stop its IO tasks.
    fn disconnect(&self) -> BoxFuture<'static, ()>;
}

/// Connection factory for one protocol.
pub trait Driver: Send + Sync {
    fn connect(
        &self,
        target: &ConnectTarget,
        timeout: Duration,
    ) -> BoxFuture<'static, Result<Arc<dyn ConnectionHandle>, ConnectError>>;
}

/// Maps each [`Protocol`] to its driver. New protocols are supported by
/// registering a driver; nothing else changes.
#[derive(Clone)]
pub struct DriverRegistry {
    drivers: Arc<RwLock<HashMap<Protocol, Arc<dyn Driver>>>>,
}

impl DriverRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self {
            drivers: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// A registry with the four built-in transport drivers wired up.
    pub fn with_defaults() -> Self {
        let registry = Self::new();
        registry.register(Protocol::Ssh, Arc::new(crate::drivers::SshDriver));
        registry.register(Protocol::Vnc, Arc::new(crate::drivers::VncDriver));
        registry.register(Protocol::Http, Arc::new(crate::drivers::HttpDriver));
        registry.register(
            Protocol::Https,
            Arc::new(crate::drivers::HttpsDriver::new()),
        );
        registry
    }

    pub fn register(&self, protocol: Protocol, driver: Arc<dyn Driver>) {
        self.drivers.write().insert(protocol, driver);
    }

    pub fn resolve(&self, protocol: Protocol) -> Option<Arc<dyn Driver>> {
        self.drivers.read().get(&protocol).cloned()
    }
}

impl Default for DriverRegistry {
    fn default() -> Self {
        Self::new()
    }
}
