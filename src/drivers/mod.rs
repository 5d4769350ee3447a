//! Built-in transport drivers, one per protocol.
//!
//! Each driver dials the endpoint, runs a cheap liveness probe where the
//! protocol offers one (SSH identification line, RFB greeting, TLS
//! handshake), and hands back a [`TcpConnection`](tcp::TcpConnection)
//! supervising the raw byte stream.

mod http;
mod https;
mod ssh;
mod tcp;
mod vnc;

pub use http::HttpDriver;
pub use https::{HttpsDriver, TlsError};
pub use ssh::SshDriver;
pub use tcp::TcpConnection;
pub use vnc::VncDriver;
