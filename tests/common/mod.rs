#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::future::BoxFuture;
use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc};

use remux::api::{router, AppState, RouterConfig};
use remux::driver::{ConnectError, ConnectTarget, ConnectionHandle, Driver, DriverRegistry};
use remux::host::Protocol;
use remux::mux::Multiplexer;
use remux::store::HostStore;
use remux::stream::ByteBroker;

/// How a [`StubDriver`] behaves when asked to connect.
#[derive(Clone, Copy)]
pub enum Behavior {
    Succeed,
    Fail,
    Hang,
}

/// Scripted transport driver for tests that do not want real sockets.
pub struct StubDriver {
    behavior: Behavior,
    pub connects: Arc<AtomicUsize>,
    pub disconnects: Arc<AtomicUsize>,
}

impl StubDriver {
    pub fn new(behavior: Behavior) -> Self {
        Self {
            behavior,
            connects: Arc::new(AtomicUsize::new(0)),
            disconnects: Arc::new(AtomicUsize::new(0)),
        }
    }
}

#[derive(Debug)]
struct StubHandle {
    broker: ByteBroker,
    // Keeps the input channel open for the life of the handle.
    _input_rx: std::sync::Mutex<mpsc::Receiver<Bytes>>,
    disconnects: Arc<AtomicUsize>,
    closed: AtomicBool,
}

impl ConnectionHandle for StubHandle {
    fn subscribe_output(&self) -> broadcast::Receiver<Bytes> {
        self.broker.subscribe()
    }

    fn input(&self) -> mpsc::Sender<Bytes> {
        self.broker.input()
    }

    fn peer(&self) -> String {
        "stub".to_string()
    }

    fn disconnect(&self) -> BoxFuture<'static, ()> {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.disconnects.fetch_add(1, Ordering::SeqCst);
        }
        Box::pin(async {})
    }
}

impl Driver for StubDriver {
    fn connect(
        &self,
        _target: &ConnectTarget,
        _timeout: Duration,
    ) -> BoxFuture<'static, Result<Arc<dyn ConnectionHandle>, ConnectError>> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        let behavior = self.behavior;
        let disconnects = self.disconnects.clone();
        Box::pin(async move {
            match behavior {
                Behavior::Succeed => {
                    let (broker, input_rx) = ByteBroker::new();
                    Ok(Arc::new(StubHandle {
                        broker,
                        _input_rx: std::sync::Mutex::new(input_rx),
                        disconnects,
                        closed: AtomicBool::new(false),
                    }) as Arc<dyn ConnectionHandle>)
                }
                Behavior::Fail => Err(ConnectError::Unreachable("stub refused".to_string())),
                Behavior::Hang => futures::future::pending().await,
            }
        })
    }
}

/// Test fixture bundling the store, the mux, and the driver counters.
pub struct Fixture {
    pub hosts: HostStore,
    pub mux: Multiplexer,
    pub connects: Arc<AtomicUsize>,
    pub disconnects: Arc<AtomicUsize>,
}

/// An in-memory stack with a stub SSH driver.
pub fn fixture(behavior: Behavior) -> Fixture {
    let hosts = HostStore::in_memory();
    let driver = StubDriver::new(behavior);
    let connects = driver.connects.clone();
    let disconnects = driver.disconnects.clone();
    let drivers = DriverRegistry::new();
    drivers.register(Protocol::Ssh, Arc::new(driver));
    let mux = Multiplexer::new(hosts.clone(), drivers, Duration::from_secs(1));
    mux.register_pre_delete(&hosts);
    Fixture {
        hosts,
        mux,
        connects,
        disconnects,
    }
}

pub fn app_state(fixture: &Fixture) -> AppState {
    AppState {
        hosts: fixture.hosts.clone(),
        mux: fixture.mux.clone(),
    }
}

/// Starts an HTTP server and returns its address.
pub async fn start_server(app: axum::Router) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    addr
}

/// Spawns a full server over a stub-driver fixture; no auth.
pub async fn start_fixture_server(behavior: Behavior) -> (Fixture, SocketAddr) {
    let fx = fixture(behavior);
    let app = router(app_state(&fx), RouterConfig::default());
    let addr = start_server(app).await;
    (fx, addr)
}

/// Percent-encodes the `|` separator so the key survives a URL path.
pub fn encode_key(key: &str) -> String {
    key.replace('|', "%7C")
}

/// Polls `GET /sessions/{key}` until the session reports `state`, or panics
/// after five seconds.
pub async fn wait_for_state(
    client: &reqwest::Client,
    base: &str,
    key: &str,
    state: &str,
) -> serde_json::Value {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let resp = client
            .get(format!("{}/sessions/{}", base, encode_key(key)))
            .send()
            .await
            .unwrap();
        if resp.status() == reqwest::StatusCode::OK {
            let json: serde_json::Value = resp.json().await.unwrap();
            if json["state"] == state {
                return json;
            }
        }
        if tokio::time::Instant::now() > deadline {
            panic!("session {} never reached state {}", key, state);
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
