//! remux - connection registry and session multiplexer daemon.
//!
//! Keeps a durable catalog of remote hosts and at most one live transport
//! session per endpoint, exposed over an HTTP API. Host records persist in a
//! JSON file under the data directory; sessions live only as long as the
//! process.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use remux::{
    api,
    config::{self, Config},
    driver::DriverRegistry,
    drivers::HttpsDriver,
    host::Protocol,
    mux::{Multiplexer, DEFAULT_CONNECT_TIMEOUT},
    store::HostStore,
};

/// remux - connection registry and session multiplexer
///
/// Stores remote host records (SSH, VNC, HTTP, HTTPS) and multiplexes live
/// transport sessions to them, one per endpoint.
#[derive(Parser, Debug)]
#[command(name = "remux", version, about, long_about = None)]
struct Cli {
    /// Address to bind the HTTP API server
    #[arg(long)]
    bind: Option<SocketAddr>,

    /// Path to a TOML config file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Directory holding the host registry file
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Authentication token required on every API request
    #[arg(long, env = "REMUX_TOKEN")]
    token: Option<String>,

    /// Transport connect timeout in milliseconds
    #[arg(long)]
    connect_timeout_ms: Option<u64>,

    /// Extra PEM CA file trusted by the HTTPS driver
    #[arg(long)]
    tls_ca_file: Option<PathBuf>,
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "remux=info,tower_http=info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();
}

fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|d| d.join("remux").join("config.toml"))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing();

    let file = match cli.config.clone().or_else(default_config_path) {
        Some(path) => Config::load(&path)?.unwrap_or_default(),
        None => Config::default(),
    };

    let bind = match cli.bind {
        Some(addr) => addr,
        None => file
            .bind
            .as_deref()
            .unwrap_or("127.0.0.1:8080")
            .parse()
            .context("invalid bind address in config")?,
    };

    let data_dir = cli
        .data_dir
        .or(file.data_dir)
        .unwrap_or_else(config::default_data_dir);

    let token = cli.token.or(file.token);
    if token.is_none() && !bind.ip().is_loopback() {
        tracing::warn!(
            addr = %bind,
            "binding to a non-loopback address without a token; \
             the API will accept unauthenticated requests"
        );
    }

    let connect_timeout = cli
        .connect_timeout_ms
        .or(file.connect_timeout_ms)
        .map(Duration::from_millis)
        .unwrap_or(DEFAULT_CONNECT_TIMEOUT);

    let drivers = DriverRegistry::with_defaults();
    if let Some(ca_path) = cli.tls_ca_file.or(file.tls_ca_file) {
        let https = HttpsDriver::with_ca_file(&ca_path)
            .with_context(|| format!("loading CA file {}", ca_path.display()))?;
        drivers.register(Protocol::Https, std::sync::Arc::new(https));
        tracing::info!(path = %ca_path.display(), "https driver trusts extra CA file");
    }

    let hosts = HostStore::open(&data_dir)
        .with_context(|| format!("opening host store in {}", data_dir.display()))?;

    let mux = Multiplexer::new(hosts.clone(), drivers, connect_timeout);
    mux.register_pre_delete(&hosts);

    let state = api::AppState { hosts, mux };
    let app = api::router(
        state,
        api::RouterConfig {
            token,
            cors_origins: file.cors_origins,
        },
    );

    let listener = tokio::net::TcpListener::bind(bind)
        .await
        .with_context(|| format!("binding {}", bind))?;
    tracing::info!(addr = %bind, "remux listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("received Ctrl+C, shutting down");
        })
        .await
        .context("http server error")?;

    tracing::info!("remux exiting");
    Ok(())
}
