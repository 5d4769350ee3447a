//! remux -- a connection registry and session multiplexer daemon.
//!
//! Keeps a durable catalog of remote hosts (SSH, VNC, HTTP, HTTPS) and
//! maintains at most one live transport session per endpoint. Sessions are
//! opened asynchronously, observed through lifecycle events, and torn down
//! when closed or when their host record is deleted. An HTTP API exposes the
//! catalog and the session table.

pub mod api;
pub mod config;
pub mod driver;
pub mod drivers;
pub mod host;
pub mod mux;
pub mod store;
pub mod stream;
