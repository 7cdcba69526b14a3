use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use parking_lot::RwLock;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::cluster::node::NodeKey;
use crate::protocol::redis::RespValue;

const REQUEST_QUEUE_CAPACITY: usize = 1024;
const EVENT_CAPACITY: usize = 16;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Ready,
    Closed,
}

#[derive(Debug, Clone)]
pub enum ConnectionEvent {
    Ready,
    Error(Arc<str>),
    End,
}

/// Parameters handed to a connector when a session starts.
#[derive(Debug, Clone)]
pub struct ConnectOptions {
    pub connect_timeout: Duration,
    pub username: Option<String>,
    pub password: Option<String>,
    /// Ask the node for its availability zone during the handshake.
    pub learn_zone: bool,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            username: None,
            password: None,
            learn_zone: false,
        }
    }
}

/// Request queued on a node session.
pub struct SessionCommand {
    /// Send `ASKING` immediately before `request`; its reply is discarded.
    pub asking: bool,
    pub request: RespValue,
    pub respond_to: oneshot::Sender<Result<RespValue>>,
}

/// Spawns and drives the session behind a `NodeConnection`.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    async fn run_session(self: Arc<Self>, link: SessionLink);
}

struct Shared {
    id: u64,
    key: NodeKey,
    options: ConnectOptions,
    state: watch::Sender<ConnectionState>,
    events: broadcast::Sender<ConnectionEvent>,
    zone: RwLock<Option<Arc<str>>>,
    read_only: AtomicBool,
    shutdown: CancellationToken,
}

/// The session side of a connection: request queue plus the hooks used to
/// report lifecycle changes. Dropping the link ends the connection.
pub struct SessionLink {
    rx: mpsc::Receiver<SessionCommand>,
    shared: Arc<Shared>,
}

impl SessionLink {
    pub fn key(&self) -> &NodeKey {
        &self.shared.key
    }

    pub fn options(&self) -> &ConnectOptions {
        &self.shared.options
    }

    pub fn read_only(&self) -> bool {
        self.shared.read_only.load(Ordering::Acquire)
    }

    pub fn shutdown(&self) -> CancellationToken {
        self.shared.shutdown.clone()
    }

    pub async fn recv(&mut self) -> Option<SessionCommand> {
        self.rx.recv().await
    }

    pub fn set_zone(&self, zone: Option<&str>) {
        *self.shared.zone.write() = zone.map(Arc::from);
    }

    pub fn mark_ready(&self) {
        self.shared.state.send_replace(ConnectionState::Ready);
        let _ = self.shared.events.send(ConnectionEvent::Ready);
    }

    pub fn report_error(&self, err: &anyhow::Error) {
        let _ = self
            .shared
            .events
            .send(ConnectionEvent::Error(format!("{err:#}").into()));
    }
}

impl Drop for SessionLink {
    fn drop(&mut self) {
        self.rx.close();
        self.shared.shutdown.cancel();
        self.shared.state.send_replace(ConnectionState::Closed);
        let _ = self.shared.events.send(ConnectionEvent::End);
        debug!(node = %self.shared.key, id = self.shared.id, "node connection ended");
    }
}

/// Handle to a single node connection. Clones share the same session;
/// requests are answered in the order they were queued.
#[derive(Clone)]
pub struct NodeConnection {
    tx: mpsc::Sender<SessionCommand>,
    shared: Arc<Shared>,
}

impl NodeConnection {
    /// Start a session for `key`. The returned receiver is subscribed before
    /// the session runs, so no lifecycle event is missed.
    pub fn spawn(
        connector: Arc<dyn Connector>,
        key: NodeKey,
        options: ConnectOptions,
        read_only: bool,
    ) -> (Self, broadcast::Receiver<ConnectionEvent>) {
        let (tx, rx) = mpsc::channel(REQUEST_QUEUE_CAPACITY);
        let (state, _) = watch::channel(ConnectionState::Connecting);
        let (events, events_rx) = broadcast::channel(EVENT_CAPACITY);
        let shared = Arc::new(Shared {
            id: NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed),
            key,
            options,
            state,
            events,
            zone: RwLock::new(None),
            read_only: AtomicBool::new(read_only),
            shutdown: CancellationToken::new(),
        });
        let link = SessionLink {
            rx,
            shared: shared.clone(),
        };
        tokio::spawn(async move { connector.run_session(link).await });
        (Self { tx, shared }, events_rx)
    }

    pub fn id(&self) -> u64 {
        self.shared.id
    }

    pub fn key(&self) -> &NodeKey {
        &self.shared.key
    }

    pub fn state(&self) -> ConnectionState {
        *self.shared.state.borrow()
    }

    pub fn is_closed(&self) -> bool {
        self.state() == ConnectionState::Closed
    }

    pub fn is_read_only(&self) -> bool {
        self.shared.read_only.load(Ordering::Acquire)
    }

    pub fn availability_zone(&self) -> Option<Arc<str>> {
        self.shared.zone.read().clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.shared.events.subscribe()
    }

    /// Wait until the session has either completed its handshake or ended.
    pub async fn wait_settled(&self) -> ConnectionState {
        let mut state = self.shared.state.subscribe();
        let settled = match state
            .wait_for(|state| *state != ConnectionState::Connecting)
            .await
        {
            Ok(settled) => *settled,
            Err(_) => ConnectionState::Closed,
        };
        settled
    }

    /// Queue `request` and wait for its reply. Error replies from the node
    /// are returned as `Ok`; `Err` means the connection failed.
    pub async fn send(&self, request: RespValue) -> Result<RespValue> {
        self.enqueue(request, false).await
    }

    /// Queue `ASKING` followed by `request` with nothing in between.
    pub async fn send_asking(&self, request: RespValue) -> Result<RespValue> {
        self.enqueue(request, true).await
    }

    async fn enqueue(&self, request: RespValue, asking: bool) -> Result<RespValue> {
        let (respond_to, response) = oneshot::channel();
        self.tx
            .send(SessionCommand {
                asking,
                request,
                respond_to,
            })
            .await
            .map_err(|_| anyhow!("connection to {} is closed", self.shared.key))?;
        response
            .await
            .map_err(|_| anyhow!("connection to {} closed before reply", self.shared.key))?
    }

    /// Switch the session between replica reads and primary mode. The
    /// matching `READONLY`/`READWRITE` is queued without waiting for it.
    pub fn set_read_only(&self, read_only: bool) {
        if self.shared.read_only.swap(read_only, Ordering::AcqRel) == read_only {
            return;
        }
        let command = if read_only { "READONLY" } else { "READWRITE" };
        let tx = self.tx.clone();
        let key = self.shared.key.clone();
        tokio::spawn(async move {
            let (respond_to, _) = oneshot::channel();
            let queued = tx
                .send(SessionCommand {
                    asking: false,
                    request: RespValue::command([command]),
                    respond_to,
                })
                .await;
            if queued.is_err() {
                debug!(node = %key, command, "role switch skipped, connection closed");
            }
        });
    }

    /// Ask the session to terminate. Pending requests fail.
    pub fn close(&self) {
        self.shared.shutdown.cancel();
    }
}

impl std::fmt::Debug for NodeConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeConnection")
            .field("id", &self.shared.id)
            .field("key", &self.shared.key)
            .field("state", &self.state())
            .finish()
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::collections::HashMap;

    use parking_lot::Mutex;

    use super::*;

    type Handler = dyn Fn(&NodeKey, &RespValue) -> RespValue + Send + Sync;

    /// In-memory connector. Every session becomes ready at once, reports the
    /// configured zone and answers through `handler`.
    pub(crate) struct MockConnector {
        handler: Box<Handler>,
        zones: HashMap<NodeKey, String>,
        down: Mutex<Vec<NodeKey>>,
        pub(crate) log: Mutex<Vec<(NodeKey, bool, Vec<u8>)>>,
    }

    impl MockConnector {
        pub(crate) fn new<F>(handler: F) -> Self
        where
            F: Fn(&NodeKey, &RespValue) -> RespValue + Send + Sync + 'static,
        {
            Self {
                handler: Box::new(handler),
                zones: HashMap::new(),
                down: Mutex::new(Vec::new()),
                log: Mutex::new(Vec::new()),
            }
        }

        pub(crate) fn with_zone(mut self, key: NodeKey, zone: &str) -> Self {
            self.zones.insert(key, zone.to_string());
            self
        }

        /// Sessions for `key` fail to connect from now on.
        pub(crate) fn mark_down(&self, key: NodeKey) {
            self.down.lock().push(key);
        }

        /// Commands (node, asking, name) seen so far, excluding role switches.
        pub(crate) fn commands(&self) -> Vec<(NodeKey, bool, Vec<u8>)> {
            self.log.lock().clone()
        }
    }

    #[async_trait]
    impl Connector for MockConnector {
        async fn run_session(self: Arc<Self>, mut link: SessionLink) {
            if self.down.lock().contains(link.key()) {
                link.report_error(&anyhow!("connect ECONNREFUSED {}", link.key()));
                return;
            }
            link.set_zone(self.zones.get(link.key()).map(String::as_str));
            link.mark_ready();
            let shutdown = link.shutdown();
            loop {
                let cmd = tokio::select! {
                    _ = shutdown.cancelled() => break,
                    cmd = link.recv() => match cmd {
                        Some(cmd) => cmd,
                        None => break,
                    },
                };
                let name = cmd
                    .request
                    .as_array()
                    .and_then(|parts| parts.first())
                    .and_then(RespValue::as_bytes)
                    .map(|name| name.to_ascii_uppercase())
                    .unwrap_or_default();
                if name == b"READONLY" || name == b"READWRITE" {
                    let _ = cmd.respond_to.send(Ok(RespValue::simple("OK")));
                    continue;
                }
                self.log
                    .lock()
                    .push((link.key().clone(), cmd.asking, name));
                let reply = (self.handler)(link.key(), &cmd.request);
                let _ = cmd.respond_to.send(Ok(reply));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::MockConnector;
    use super::*;

    fn echo() -> Arc<MockConnector> {
        Arc::new(MockConnector::new(|key, _| RespValue::bulk(key.as_str())))
    }

    #[tokio::test]
    async fn send_returns_reply_and_reports_ready() {
        let key = NodeKey::new("127.0.0.1", 30001);
        let (conn, mut events) =
            NodeConnection::spawn(echo(), key.clone(), ConnectOptions::default(), false);
        assert!(matches!(events.recv().await.unwrap(), ConnectionEvent::Ready));
        let reply = conn.send(RespValue::command(["GET", "foo"])).await.unwrap();
        assert_eq!(reply, RespValue::bulk("127.0.0.1:30001"));
        assert_eq!(conn.state(), ConnectionState::Ready);
    }

    #[tokio::test]
    async fn close_ends_session_and_fails_requests() {
        let key = NodeKey::new("127.0.0.1", 30001);
        let (conn, mut events) =
            NodeConnection::spawn(echo(), key, ConnectOptions::default(), false);
        assert!(matches!(events.recv().await.unwrap(), ConnectionEvent::Ready));
        conn.close();
        assert!(matches!(events.recv().await.unwrap(), ConnectionEvent::End));
        assert!(conn.is_closed());
        assert!(conn.send(RespValue::command(["PING"])).await.is_err());
    }

    #[tokio::test]
    async fn failed_connect_emits_error_then_end() {
        let key = NodeKey::new("127.0.0.1", 30009);
        let connector = echo();
        connector.mark_down(key.clone());
        let (conn, mut events) =
            NodeConnection::spawn(connector, key, ConnectOptions::default(), false);
        assert!(matches!(events.recv().await.unwrap(), ConnectionEvent::Error(_)));
        assert!(matches!(events.recv().await.unwrap(), ConnectionEvent::End));
        assert!(conn.send(RespValue::command(["PING"])).await.is_err());
    }

    #[tokio::test]
    async fn wait_settled_reports_outcome() {
        let up = NodeKey::new("127.0.0.1", 30001);
        let down = NodeKey::new("127.0.0.1", 30009);
        let connector = echo();
        connector.mark_down(down.clone());

        let (ready, _) =
            NodeConnection::spawn(connector.clone(), up, ConnectOptions::default(), false);
        let (failed, _) = NodeConnection::spawn(connector, down, ConnectOptions::default(), false);
        assert_eq!(ready.wait_settled().await, ConnectionState::Ready);
        assert_eq!(failed.wait_settled().await, ConnectionState::Closed);
    }

    #[tokio::test]
    async fn zone_is_exposed_after_handshake() {
        let key = NodeKey::new("127.0.0.1", 30002);
        let connector = Arc::new(
            MockConnector::new(|_, _| RespValue::simple("OK")).with_zone(key.clone(), "zone-a"),
        );
        let (conn, mut events) =
            NodeConnection::spawn(connector, key, ConnectOptions::default(), true);
        assert!(matches!(events.recv().await.unwrap(), ConnectionEvent::Ready));
        assert_eq!(conn.availability_zone().as_deref(), Some("zone-a"));
        assert!(conn.is_read_only());
        conn.set_read_only(false);
        assert!(!conn.is_read_only());
    }
}
