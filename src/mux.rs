//! Session multiplexer.
//!
//! Tracks at most one live session per endpoint and drives each through its
//! lifecycle: `Connecting -> Connected | Failed`, `Connected -> Closing ->`
//! removed. Absence from the table is the disconnected state. All driver IO
//! runs in spawned tasks; no multiplexer call blocks on the network.
//!
//! Each lifecycle instance carries a generation number. Completion paths
//! (connect result, cancellation, disconnect) re-check the generation under
//! the lock, so a stale task never mutates a successor session that reused
//! the same endpoint key.
//!
//! Lock order is store before multiplexer, never reversed.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::RwLock;
use serde::Serialize;
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;

use crate::driver::{ConnectError, ConnectTarget, ConnectionHandle, DriverRegistry};
use crate::host::{EndpointKey, HostId, Protocol};
use crate::store::HostStore;

pub const EVENT_CAPACITY: usize = 64;

/// Default bound on a single connection attempt.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Bound on a driver's disconnect. A stuck endpoint never blocks local
/// cleanup; on expiry the entry is removed and the warning logged.
const DISCONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Lifecycle state of a tracked session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Connecting,
    Connected,
    Failed,
    Closing,
}

/// Session lifecycle events, broadcast to observers.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum SessionEvent {
    Opened { key: EndpointKey },
    Connected { key: EndpointKey },
    Failed { key: EndpointKey, error: ConnectError },
    Closed { key: EndpointKey },
}

/// Errors returned by [`Multiplexer::open`].
#[derive(Debug, thiserror::Error)]
pub enum OpenError {
    #[error("no host exists with id {0}")]
    HostNotFound(HostId),
    #[error("no driver registered for protocol {0}")]
    DriverUnavailable(Protocol),
    #[error("session for {0} is closing; retry once teardown completes")]
    Closing(EndpointKey),
}

/// Stable reference to a session returned by `open`.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    pub key: EndpointKey,
    pub host_id: HostId,
}

/// Point-in-time snapshot of one session.
#[derive(Debug, Clone, Serialize)]
pub struct SessionInfo {
    pub key: EndpointKey,
    pub host_id: HostId,
    pub state: SessionState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<ConnectError>,
    pub opened_seq: u64,
}

struct SessionEntry {
    host_id: HostId,
    state: SessionState,
    seq: u64,
    generation: u64,
    cancel: CancellationToken,
    conn: Option<Arc<dyn ConnectionHandle>>,
    last_error: Option<ConnectError>,
}

impl SessionEntry {
    fn info(&self, key: &EndpointKey) -> SessionInfo {
        SessionInfo {
            key: key.clone(),
            host_id: self.host_id,
            state: self.state,
            last_error: self.last_error.clone(),
            opened_seq: self.seq,
        }
    }
}

struct MuxInner {
    sessions: HashMap<EndpointKey, SessionEntry>,
    next_seq: u64,
    next_generation: u64,
}

/// Manages live sessions keyed by endpoint.
#[derive(Clone)]
pub struct Multiplexer {
    store: HostStore,
    drivers: DriverRegistry,
    connect_timeout: Duration,
    inner: Arc<RwLock<MuxInner>>,
    events_tx: broadcast::Sender<SessionEvent>,
}

impl Multiplexer {
    pub fn new(store: HostStore, drivers: DriverRegistry, connect_timeout: Duration) -> Self {
        let (events_tx, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            store,
            drivers,
            connect_timeout,
            inner: Arc::new(RwLock::new(MuxInner {
                sessions: HashMap::new(),
                next_seq: 0,
                next_generation: 0,
            })),
            events_tx,
        }
    }

    /// Wire this multiplexer as the store's pre-delete reaction, so
    /// deleting a host tears its sessions down first.
    pub fn register_pre_delete(&self, store: &HostStore) {
        let mux = self.clone();
        store.on_pre_delete(move |record| {
            let mux = mux.clone();
            let host_id = record.id;
            Box::pin(async move { mux.close_for_host(host_id).await })
        });
    }

    /// Open a session to the given host's endpoint.
    ///
    /// Idempotent: while a session for the endpoint is `Connecting` or
    /// `Connected`, the existing handle is returned and the driver is not
    /// invoked again. A `Failed` entry is restarted in place, keeping its
    /// display order. A `Closing` entry rejects the open; retry once
    /// teardown completes. Never blocks the caller on network IO.
    pub fn open(&self, host_id: HostId) -> Result<SessionHandle, OpenError> {
        let record = self
            .store
            .get(host_id)
            .map_err(|_| OpenError::HostNotFound(host_id))?;
        let key = record.endpoint();
        let driver = self
            .drivers
            .resolve(record.protocol)
            .ok_or(OpenError::DriverUnavailable(record.protocol))?;
        let target = ConnectTarget::from_record(&record);

        let (generation, cancel) = {
            let mut inner = self.inner.write();

            if let Some(entry) = inner.sessions.get(&key) {
                match entry.state {
                    SessionState::Connecting | SessionState::Connected => {
                        return Ok(SessionHandle {
                            key,
                            host_id: entry.host_id,
                        });
                    }
                    SessionState::Closing => return Err(OpenError::Closing(key)),
                    SessionState::Failed => {}
                }
            }

            let generation = inner.next_generation;
            inner.next_generation += 1;
            let cancel = CancellationToken::new();

            if let Some(entry) = inner.sessions.get_mut(&key) {
                // Failed entry: restart in place, keeping its seq.
                entry.host_id = host_id;
                entry.state = SessionState::Connecting;
                entry.generation = generation;
                entry.cancel = cancel.clone();
                entry.conn = None;
                entry.last_error = None;
            } else {
                let seq = inner.next_seq;
                inner.next_seq += 1;
                inner.sessions.insert(
                    key.clone(),
                    SessionEntry {
                        host_id,
                        state: SessionState::Connecting,
                        seq,
                        generation,
                        cancel: cancel.clone(),
                        conn: None,
                        last_error: None,
                    },
                );
            }
            (generation, cancel)
        };

        tracing::info!(key = %key, host = %host_id, "session connecting");
        self.emit(SessionEvent::Opened { key: key.clone() });

        let mux = self.clone();
        let task_key = key.clone();
        let timeout = self.connect_timeout;
        tokio::spawn(async move {
            let outcome = tokio::select! {
                _ = cancel.cancelled() => None,
                result = driver.connect(&target, timeout) => Some(result),
            };
            mux.finish_connect(task_key, generation, outcome);
        });

        Ok(SessionHandle { key, host_id })
    }

    /// Settle a connect attempt. `None` means the attempt was cancelled.
    fn finish_connect(
        &self,
        key: EndpointKey,
        generation: u64,
        outcome: Option<Result<Arc<dyn ConnectionHandle>, ConnectError>>,
    ) {
        let mut event = None;
        let mut orphan = None;
        {
            let mut inner = self.inner.write();
            let current = inner.sessions.get(&key).map(|e| (e.generation, e.state));
            match current {
                Some((gen, _)) if gen != generation => {
                    // A successor owns this key; a raced handle must still
                    // be torn down.
                    if let Some(Ok(conn)) = outcome {
                        orphan = Some(conn);
                    }
                }
                None => {
                    if let Some(Ok(conn)) = outcome {
                        orphan = Some(conn);
                    }
                }
                Some((_, state)) => match outcome {
                    None => {
                        inner.sessions.remove(&key);
                        tracing::info!(key = %key, "connect cancelled");
                        event = Some(SessionEvent::Closed { key: key.clone() });
                    }
                    Some(Ok(conn)) => {
                        if state == SessionState::Closing {
                            inner.sessions.remove(&key);
                            orphan = Some(conn);
                            event = Some(SessionEvent::Closed { key: key.clone() });
                        } else if let Some(entry) = inner.sessions.get_mut(&key) {
                            tracing::info!(key = %key, peer = %conn.peer(), "session connected");
                            entry.state = SessionState::Connected;
                            entry.conn = Some(conn);
                            event = Some(SessionEvent::Connected { key: key.clone() });
                        }
                    }
                    Some(Err(error)) => {
                        if state == SessionState::Closing {
                            inner.sessions.remove(&key);
                            event = Some(SessionEvent::Closed { key: key.clone() });
                        } else if let Some(entry) = inner.sessions.get_mut(&key) {
                            tracing::warn!(key = %key, error = %error, "connect failed");
                            entry.state = SessionState::Failed;
                            entry.last_error = Some(error.clone());
                            event = Some(SessionEvent::Failed {
                                key: key.clone(),
                                error,
                            });
                        }
                    }
                },
            }
        }
        if let Some(conn) = orphan {
            tokio::spawn(conn.disconnect());
        }
        if let Some(event) = event {
            self.emit(event);
        }
    }

    /// Close the session for an endpoint. No-op when absent or already
    /// `Closing`. Returns promptly in all cases; teardown IO runs in a
    /// spawned task bounded by [`DISCONNECT_TIMEOUT`].
    pub fn close(&self, key: &EndpointKey) {
        let mut event = None;
        let mut teardown = None;
        {
            let mut inner = self.inner.write();
            let Some(state) = inner.sessions.get(key).map(|e| e.state) else {
                return;
            };
            match state {
                SessionState::Closing => return,
                SessionState::Connecting => {
                    if let Some(entry) = inner.sessions.get_mut(key) {
                        entry.state = SessionState::Closing;
                        // The connect task observes the cancellation and
                        // removes the entry.
                        entry.cancel.cancel();
                    }
                }
                SessionState::Connected => {
                    if let Some(entry) = inner.sessions.get_mut(key) {
                        entry.state = SessionState::Closing;
                        // Taking the handle makes disconnect run exactly once
                        // no matter how many closes race.
                        if let Some(conn) = entry.conn.take() {
                            teardown = Some((conn, entry.generation));
                        }
                    }
                }
                SessionState::Failed => {
                    inner.sessions.remove(key);
                    event = Some(SessionEvent::Closed { key: key.clone() });
                }
            }
        }
        if let Some(event) = event {
            self.emit(event);
        }
        if let Some((conn, generation)) = teardown {
            tracing::info!(key = %key, "session closing");
            let mux = self.clone();
            let key = key.clone();
            tokio::spawn(async move {
                if tokio::time::timeout(DISCONNECT_TIMEOUT, conn.disconnect())
                    .await
                    .is_err()
                {
                    tracing::warn!(key = %key, "disconnect timed out; removing session anyway");
                }
                mux.remove_closed(key, generation);
            });
        }
    }

    /// Remove a `Closing` entry once its disconnect has settled.
    fn remove_closed(&self, key: EndpointKey, generation: u64) {
        let removed = {
            let mut inner = self.inner.write();
            let matches = inner
                .sessions
                .get(&key)
                .map(|e| e.generation == generation)
                .unwrap_or(false);
            if matches {
                inner.sessions.remove(&key);
            }
            matches
        };
        if removed {
            tracing::info!(key = %key, "session closed");
            self.emit(SessionEvent::Closed { key });
        }
    }

    /// Close every session owned by the host and wait until the entries are
    /// gone. This is the pre-delete reaction: the store's delete commits
    /// only after teardown completes.
    pub async fn close_for_host(&self, host_id: HostId) {
        let keys: Vec<EndpointKey> = {
            let inner = self.inner.read();
            inner
                .sessions
                .iter()
                .filter(|(_, e)| e.host_id == host_id)
                .map(|(k, _)| k.clone())
                .collect()
        };
        if keys.is_empty() {
            return;
        }

        // Subscribe before closing so no removal slips past unobserved.
        let mut events = self.subscribe_events();
        for key in &keys {
            self.close(key);
        }

        loop {
            let remaining = {
                let inner = self.inner.read();
                keys.iter().any(|k| inner.sessions.contains_key(k))
            };
            if !remaining {
                break;
            }
            match events.recv().await {
                Ok(_) => {}
                // Lagged receivers re-check the table rather than assuming
                // a missed Closed.
                Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    }

    /// Snapshots of all tracked sessions, first-open-first-shown.
    pub fn list_active(&self) -> Vec<SessionInfo> {
        let inner = self.inner.read();
        let mut infos: Vec<SessionInfo> =
            inner.sessions.iter().map(|(k, e)| e.info(k)).collect();
        infos.sort_by_key(|i| i.opened_seq);
        infos
    }

    pub fn get(&self, key: &EndpointKey) -> Option<SessionInfo> {
        self.inner.read().sessions.get(key).map(|e| e.info(key))
    }

    /// The live connection handle, if the session is `Connected`.
    pub fn handle_of(&self, key: &EndpointKey) -> Option<Arc<dyn ConnectionHandle>> {
        self.inner
            .read()
            .sessions
            .get(key)
            .and_then(|e| e.conn.clone())
    }

    /// Subscribe to the session's output stream.
    pub fn subscribe_output(&self, key: &EndpointKey) -> Option<broadcast::Receiver<Bytes>> {
        self.handle_of(key).map(|conn| conn.subscribe_output())
    }

    /// Sender for the session's input stream.
    pub fn input(&self, key: &EndpointKey) -> Option<mpsc::Sender<Bytes>> {
        self.handle_of(key).map(|conn| conn.input())
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<SessionEvent> {
        self.events_tx.subscribe()
    }

    fn emit(&self, event: SessionEvent) {
        // Send event (ignore error if there are no receivers).
        let _ = self.events_tx.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::Driver;
    use crate::host::{HostCandidate, HostRecord, Protocol};
    use futures::future::BoxFuture;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    #[derive(Clone, Copy)]
    enum Behavior {
        Succeed,
        Fail,
        Hang,
        SucceedWithStuckDisconnect,
    }

    struct StubDriver {
        behavior: Behavior,
        connects: Arc<AtomicUsize>,
        disconnects: Arc<AtomicUsize>,
    }

    #[derive(Debug)]
    struct StubHandle {
        broker: crate::stream::ByteBroker,
        _input_rx: Mutex<mpsc::Receiver<Bytes>>,
        disconnects: Arc<AtomicUsize>,
        closed: std::sync::atomic::AtomicBool,
        stuck: bool,
    }

    impl StubHandle {
        fn new(disconnects: Arc<AtomicUsize>, stuck: bool) -> Arc<Self> {
            let (broker, input_rx) = crate::stream::ByteBroker::new();
            Arc::new(Self {
                broker,
                _input_rx: Mutex::new(input_rx),
                disconnects,
                closed: std::sync::atomic::AtomicBool::new(false),
                stuck,
            })
        }
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
            let already = self.closed.swap(true, Ordering::SeqCst);
            if !already {
                self.disconnects.fetch_add(1, Ordering::SeqCst);
            }
            if self.stuck {
                Box::pin(futures::future::pending())
            } else {
                Box::pin(futures::future::ready(()))
            }
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
                        Ok(StubHandle::new(disconnects, false) as Arc<dyn ConnectionHandle>)
                    }
                    Behavior::SucceedWithStuckDisconnect => {
                        Ok(StubHandle::new(disconnects, true) as Arc<dyn ConnectionHandle>)
                    }
                    Behavior::Fail => {
                        Err(ConnectError::Unreachable("stub refused".to_string()))
                    }
                    Behavior::Hang => futures::future::pending().await,
                }
            })
        }
    }

    struct Fixture {
        store: HostStore,
        mux: Multiplexer,
        connects: Arc<AtomicUsize>,
        disconnects: Arc<AtomicUsize>,
    }

    fn fixture(behavior: Behavior) -> Fixture {
        let connects = Arc::new(AtomicUsize::new(0));
        let disconnects = Arc::new(AtomicUsize::new(0));
        let drivers = DriverRegistry::new();
        drivers.register(
            Protocol::Ssh,
            Arc::new(StubDriver {
                behavior,
                connects: connects.clone(),
                disconnects: disconnects.clone(),
            }),
        );
        let store = HostStore::in_memory();
        let mux = Multiplexer::new(store.clone(), drivers, Duration::from_secs(1));
        Fixture {
            store,
            mux,
            connects,
            disconnects,
        }
    }

    fn add_host(store: &HostStore, name: &str, address: &str) -> HostRecord {
        store
            .add(HostCandidate {
                name: name.to_string(),
                address: address.to_string(),
                protocol: Protocol::Ssh,
                username: None,
                password: None,
            })
            .unwrap()
    }

    async fn wait_for<F>(events: &mut broadcast::Receiver<SessionEvent>, mut pred: F)
    where
        F: FnMut(&SessionEvent) -> bool,
    {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                match events.recv().await {
                    Ok(event) if pred(&event) => break,
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(_)) => {}
                    Err(broadcast::error::RecvError::Closed) => {
                        panic!("event channel closed while waiting")
                    }
                }
            }
        })
        .await
        .expect("expected event did not arrive")
    }

    #[tokio::test]
    async fn open_unknown_host_fails() {
        let f = fixture(Behavior::Succeed);
        let err = f.mux.open(HostId::generate()).unwrap_err();
        assert!(matches!(err, OpenError::HostNotFound(_)));
    }

    #[tokio::test]
    async fn open_without_driver_fails() {
        let f = fixture(Behavior::Succeed);
        let record = f
            .store
            .add(HostCandidate {
                name: "desk".to_string(),
                address: "10.0.0.9".to_string(),
                protocol: Protocol::Vnc,
                username: None,
                password: None,
            })
            .unwrap();
        let err = f.mux.open(record.id).unwrap_err();
        assert!(matches!(err, OpenError::DriverUnavailable(Protocol::Vnc)));
    }

    #[tokio::test]
    async fn open_reaches_connected() {
        let f = fixture(Behavior::Succeed);
        let record = add_host(&f.store, "db1", "10.0.0.5");
        let mut events = f.mux.subscribe_events();

        let handle = f.mux.open(record.id).unwrap();
        assert_eq!(handle.key.to_string(), "10.0.0.5|SSH");

        wait_for(&mut events, |e| matches!(e, SessionEvent::Connected { .. })).await;

        let info = f.mux.get(&handle.key).unwrap();
        assert_eq!(info.state, SessionState::Connected);
        assert_eq!(info.host_id, record.id);
        assert!(f.mux.handle_of(&handle.key).is_some());
    }

    #[tokio::test]
    async fn idempotent_open_invokes_driver_once() {
        let f = fixture(Behavior::Hang);
        let record = add_host(&f.store, "db1", "10.0.0.5");

        let a = f.mux.open(record.id).unwrap();
        let b = f.mux.open(record.id).unwrap();

        assert_eq!(a.key, b.key);
        assert_eq!(f.connects.load(Ordering::SeqCst), 1);
        assert_eq!(f.mux.list_active().len(), 1);
        assert_eq!(
            f.mux.get(&a.key).unwrap().state,
            SessionState::Connecting
        );
    }

    #[tokio::test]
    async fn two_records_same_endpoint_share_session() {
        let f = fixture(Behavior::Hang);
        let a = add_host(&f.store, "primary", "10.0.0.5");
        let b = add_host(&f.store, "alias", "10.0.0.5");

        f.mux.open(a.id).unwrap();
        f.mux.open(b.id).unwrap();

        assert_eq!(f.connects.load(Ordering::SeqCst), 1);
        assert_eq!(f.mux.list_active().len(), 1);
    }

    #[tokio::test]
    async fn failed_connect_retains_error() {
        let f = fixture(Behavior::Fail);
        let record = add_host(&f.store, "db1", "10.0.0.5");
        let mut events = f.mux.subscribe_events();

        let handle = f.mux.open(record.id).unwrap();
        wait_for(&mut events, |e| matches!(e, SessionEvent::Failed { .. })).await;

        let info = f.mux.get(&handle.key).unwrap();
        assert_eq!(info.state, SessionState::Failed);
        assert_eq!(info.last_error.as_ref().unwrap().kind(), "unreachable");
        // No automatic retry.
        assert_eq!(f.connects.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn reopen_after_failure_reenters_connecting() {
        let f = fixture(Behavior::Fail);
        let record = add_host(&f.store, "db1", "10.0.0.5");
        let mut events = f.mux.subscribe_events();

        let handle = f.mux.open(record.id).unwrap();
        wait_for(&mut events, |e| matches!(e, SessionEvent::Failed { .. })).await;
        let first_seq = f.mux.get(&handle.key).unwrap().opened_seq;

        f.mux.open(record.id).unwrap();
        let info = f.mux.get(&handle.key).unwrap();
        assert_eq!(info.state, SessionState::Connecting);
        assert!(info.last_error.is_none());
        assert_eq!(info.opened_seq, first_seq);
        assert_eq!(f.connects.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn dismiss_failed_session() {
        let f = fixture(Behavior::Fail);
        let record = add_host(&f.store, "db1", "10.0.0.5");
        let mut events = f.mux.subscribe_events();

        let handle = f.mux.open(record.id).unwrap();
        wait_for(&mut events, |e| matches!(e, SessionEvent::Failed { .. })).await;

        f.mux.close(&handle.key);
        assert!(f.mux.get(&handle.key).is_none());
        assert_eq!(f.disconnects.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn close_during_connecting_cancels() {
        let f = fixture(Behavior::Hang);
        let record = add_host(&f.store, "db1", "10.0.0.5");
        let mut events = f.mux.subscribe_events();

        let handle = f.mux.open(record.id).unwrap();
        f.mux.close(&handle.key);

        wait_for(&mut events, |e| matches!(e, SessionEvent::Closed { .. })).await;
        assert!(f.mux.get(&handle.key).is_none());
    }

    #[tokio::test]
    async fn close_connected_disconnects_once() {
        let f = fixture(Behavior::Succeed);
        let record = add_host(&f.store, "db1", "10.0.0.5");
        let mut events = f.mux.subscribe_events();

        let handle = f.mux.open(record.id).unwrap();
        wait_for(&mut events, |e| matches!(e, SessionEvent::Connected { .. })).await;

        f.mux.close(&handle.key);
        wait_for(&mut events, |e| matches!(e, SessionEvent::Closed { .. })).await;

        assert!(f.mux.get(&handle.key).is_none());
        assert_eq!(f.disconnects.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn concurrent_closes_disconnect_once() {
        let f = fixture(Behavior::Succeed);
        let record = add_host(&f.store, "db1", "10.0.0.5");
        let mut events = f.mux.subscribe_events();

        let handle = f.mux.open(record.id).unwrap();
        wait_for(&mut events, |e| matches!(e, SessionEvent::Connected { .. })).await;

        let mut tasks = Vec::new();
        for _ in 0..8 {
            let mux = f.mux.clone();
            let key = handle.key.clone();
            tasks.push(tokio::spawn(async move { mux.close(&key) }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        wait_for(&mut events, |e| matches!(e, SessionEvent::Closed { .. })).await;
        assert!(f.mux.get(&handle.key).is_none());
        assert_eq!(f.disconnects.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn close_absent_is_noop() {
        let f = fixture(Behavior::Succeed);
        let key = EndpointKey {
            address: "10.0.0.5".to_string(),
            protocol: Protocol::Ssh,
        };
        f.mux.close(&key);
        assert!(f.mux.list_active().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn open_while_closing_is_rejected() {
        let f = fixture(Behavior::SucceedWithStuckDisconnect);
        let record = add_host(&f.store, "db1", "10.0.0.5");
        let mut events = f.mux.subscribe_events();

        let handle = f.mux.open(record.id).unwrap();
        wait_for(&mut events, |e| matches!(e, SessionEvent::Connected { .. })).await;

        f.mux.close(&handle.key);
        assert_eq!(
            f.mux.get(&handle.key).unwrap().state,
            SessionState::Closing
        );

        let err = f.mux.open(record.id).unwrap_err();
        assert!(matches!(err, OpenError::Closing(_)));

        // The stuck disconnect is abandoned at the timeout and the entry
        // removed; a fresh open then succeeds.
        wait_for(&mut events, |e| matches!(e, SessionEvent::Closed { .. })).await;
        assert!(f.mux.get(&handle.key).is_none());
        f.mux.open(record.id).unwrap();
    }

    #[tokio::test]
    async fn cascading_delete_tears_down_session() {
        let f = fixture(Behavior::Succeed);
        f.mux.register_pre_delete(&f.store);
        let record = add_host(&f.store, "db1", "10.0.0.5");
        let mut events = f.mux.subscribe_events();

        f.mux.open(record.id).unwrap();
        wait_for(&mut events, |e| matches!(e, SessionEvent::Connected { .. })).await;

        f.store.delete(record.id).await.unwrap();

        assert!(f.mux.list_active().is_empty());
        assert_eq!(f.disconnects.load(Ordering::SeqCst), 1);
        assert!(f.store.list().is_empty());
    }

    #[tokio::test]
    async fn cascading_delete_with_connecting_session() {
        let f = fixture(Behavior::Hang);
        f.mux.register_pre_delete(&f.store);
        let record = add_host(&f.store, "db1", "10.0.0.5");

        f.mux.open(record.id).unwrap();
        f.store.delete(record.id).await.unwrap();

        assert!(f.mux.list_active().is_empty());
        assert!(f.store.list().is_empty());
    }

    #[tokio::test]
    async fn delete_without_session_needs_no_teardown() {
        let f = fixture(Behavior::Succeed);
        f.mux.register_pre_delete(&f.store);
        let record = add_host(&f.store, "db1", "10.0.0.5");

        f.store.delete(record.id).await.unwrap();
        assert_eq!(f.disconnects.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn list_active_is_ordered_by_open_sequence() {
        let f = fixture(Behavior::Hang);
        let a = add_host(&f.store, "a", "10.0.0.1");
        let b = add_host(&f.store, "b", "10.0.0.2");
        let c = add_host(&f.store, "c", "10.0.0.3");

        f.mux.open(a.id).unwrap();
        f.mux.open(b.id).unwrap();
        f.mux.open(c.id).unwrap();

        let addresses: Vec<_> = f
            .mux
            .list_active()
            .into_iter()
            .map(|i| i.key.address)
            .collect();
        assert_eq!(addresses, ["10.0.0.1", "10.0.0.2", "10.0.0.3"]);
    }

    #[tokio::test]
    async fn events_trace_the_lifecycle() {
        let f = fixture(Behavior::Fail);
        let record = add_host(&f.store, "db1", "10.0.0.5");
        let mut events = f.mux.subscribe_events();

        f.mux.open(record.id).unwrap();

        let opened = events.recv().await.unwrap();
        assert!(matches!(opened, SessionEvent::Opened { .. }));
        let failed = events.recv().await.unwrap();
        match failed {
            SessionEvent::Failed { error, .. } => assert_eq!(error.kind(), "unreachable"),
            other => panic!("expected Failed, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn event_json_shape() {
        let key = EndpointKey {
            address: "10.0.0.5".to_string(),
            protocol: Protocol::Ssh,
        };
        let json = serde_json::to_value(SessionEvent::Failed {
            key,
            error: ConnectError::Timeout,
        })
        .unwrap();
        assert_eq!(json["event"], "failed");
        assert_eq!(json["key"], "10.0.0.5|SSH");
        assert_eq!(json["error"]["kind"], "timeout");
    }
}
