pub mod delay;
pub mod node;
pub mod redirect;
pub mod refresh;
pub mod router;
pub mod slots;

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::future::{join_all, BoxFuture, Shared};
use futures::FutureExt;
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::{interval, sleep, timeout, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::backend::connection::Connector;
use crate::backend::connector::TcpConnector;
use crate::backend::pool::{ConnectionPool, NodeRecord, PoolEvent};
use crate::config::{ClusterOptions, ScaleReads};
use crate::error::ClusterError;
use crate::metrics;
use crate::protocol::redis::{Command, RespValue};
use crate::sentinel::{FailoverDetector, FailoverHandler};

use self::delay::{RefreshAction, RefreshReason, RefreshRequest, RefreshScheduler};
use self::node::{NatMap, NodeKey, NodeRole, RoleFilter};
use self::redirect::{classify, Redirect, ReplyClass, RetryKind};
use self::refresh::fetch_topology;
use self::router::ReadRouter;
use self::slots::{SlotDirectory, SlotTable};

const EVENT_CAPACITY: usize = 256;

const NODE_DOWN_BUCKET: &str = "node-down";
const NODE_ERROR_BUCKET: &str = "node-error";
const CLUSTER_DOWN_BUCKET: &str = "clusterdown";

/// Notifications published by the client.
#[derive(Debug, Clone)]
pub enum ClusterEvent {
    NodeAdded(NodeKey),
    NodeRemoved(NodeKey),
    NodeError { node: NodeKey, error: Arc<str> },
    Ready,
    Refreshed { epoch: u64, source: NodeKey },
    RefreshFailed(ClusterError),
    Failover { monitor: NodeKey },
    /// The pool lost its last node.
    Drain,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientStatus {
    Idle,
    Connecting,
    Ready,
    Closed,
}

/// Where a single dispatch attempt ended up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptState {
    Pending,
    Sent,
    Done,
    RedirectPermanent,
    RedirectTemporary,
    NodeDown,
    RetryLater,
    Failed,
}

impl AttemptState {
    pub fn as_str(self) -> &'static str {
        match self {
            AttemptState::Pending => "pending",
            AttemptState::Sent => "sent",
            AttemptState::Done => "done",
            AttemptState::RedirectPermanent => "redirect_permanent",
            AttemptState::RedirectTemporary => "redirect_temporary",
            AttemptState::NodeDown => "node_down",
            AttemptState::RetryLater => "retry_later",
            AttemptState::Failed => "failed",
        }
    }
}

type SharedRefresh = Shared<BoxFuture<'static, Result<u64, ClusterError>>>;

struct ClusterInner {
    options: ClusterOptions,
    seeds: Vec<NodeKey>,
    nat: NatMap,
    pool: Arc<ConnectionPool>,
    slots: SlotDirectory,
    scheduler: Arc<RefreshScheduler>,
    router: ReadRouter,
    events: broadcast::Sender<ClusterEvent>,
    status: Mutex<ClientStatus>,
    shutdown: CancellationToken,
    started: AtomicBool,
    refresh_inflight: Mutex<Option<SharedRefresh>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    detector: Mutex<Option<FailoverDetector>>,
}

/// Cluster-aware client: routes commands by slot, follows redirections and
/// keeps the slot table and connection pool in step with the cluster.
#[derive(Clone)]
pub struct ClusterClient {
    inner: Arc<ClusterInner>,
}

impl ClusterClient {
    pub fn new(options: ClusterOptions) -> Result<Self, ClusterError> {
        Self::with_connector(options, Arc::new(TcpConnector::new()))
    }

    /// Build a client whose node sessions are driven by `connector`.
    pub fn with_connector(
        options: ClusterOptions,
        connector: Arc<dyn Connector>,
    ) -> Result<Self, ClusterError> {
        options.ensure_valid()?;
        let seeds = options.seed_keys()?;
        let nat = options.nat();
        let pool = ConnectionPool::new(connector, options.connect_options());
        let router = ReadRouter::new(options.scale_reads, options.client_az.as_deref());
        let (events, _) = broadcast::channel(EVENT_CAPACITY);

        let inner = Arc::new_cyclic(|this: &Weak<ClusterInner>| {
            let weak = this.clone();
            let action: RefreshAction = Arc::new(move |bucket: &str, batch: Vec<RefreshRequest>| {
                if let Some(inner) = weak.upgrade() {
                    inner.on_refresh_window(bucket, batch);
                }
            });
            ClusterInner {
                scheduler: RefreshScheduler::new(options.refresh_cooldown(), action),
                options,
                seeds,
                nat,
                pool,
                slots: SlotDirectory::new(),
                router,
                events,
                status: Mutex::new(ClientStatus::Idle),
                shutdown: CancellationToken::new(),
                started: AtomicBool::new(false),
                refresh_inflight: Mutex::new(None),
                tasks: Mutex::new(Vec::new()),
                detector: Mutex::new(None),
            }
        });
        Ok(Self { inner })
    }

    /// Seed the pool, load the first topology and wait for the discovered
    /// nodes to finish their handshake.
    pub async fn connect(&self) -> Result<(), ClusterError> {
        let inner = &self.inner;
        {
            let mut status = inner.status.lock();
            match *status {
                ClientStatus::Closed => return Err(ClusterError::ConnectionClosed),
                ClientStatus::Ready => return Ok(()),
                _ => *status = ClientStatus::Connecting,
            }
        }
        inner.start_background();
        for seed in &inner.seeds {
            if inner.pool.get_existing(seed).is_none() {
                inner.pool.get(seed, NodeRole::Master);
            }
        }

        if let Err(err) = inner.refresh().await {
            let mut status = inner.status.lock();
            if *status == ClientStatus::Connecting {
                *status = ClientStatus::Idle;
            }
            return Err(err);
        }
        inner.wait_settled().await;

        {
            let mut status = inner.status.lock();
            if *status == ClientStatus::Closed {
                return Err(ClusterError::ConnectionClosed);
            }
            *status = ClientStatus::Ready;
        }
        info!(
            nodes = inner.pool.len(),
            epoch = inner.slots.epoch(),
            scale_reads = %inner.options.scale_reads,
            "cluster client ready"
        );
        inner.emit(ClusterEvent::Ready);
        inner.arm_failover_detector().await;
        Ok(())
    }

    /// Route `command` to the node owning its slot and follow redirections
    /// until a final reply, an application error or the retry ceiling.
    pub async fn dispatch(&self, command: Command) -> Result<RespValue, ClusterError> {
        let inner = self.inner.clone();
        if inner.shutdown.is_cancelled() {
            return Err(ClusterError::ConnectionClosed);
        }
        let started = Instant::now();
        let outcome = tokio::select! {
            _ = inner.shutdown.cancelled() => Err(ClusterError::ConnectionClosed),
            result = bounded(inner.options.command_timeout(), inner.execute(command)) => result,
        };
        let label = match &outcome {
            Ok(_) => "ok",
            Err(err) => err.kind(),
        };
        metrics::dispatch(label, started.elapsed());
        outcome
    }

    /// Fetch the topology now. Concurrent callers share one fetch.
    pub async fn refresh(&self) -> Result<u64, ClusterError> {
        self.inner.refresh().await
    }

    pub fn nodes(&self, role: RoleFilter) -> Vec<NodeRecord> {
        self.inner.pool.list(role)
    }

    /// Like [`ClusterClient::nodes`] with the role given as `"all"`,
    /// `"master"` or `"slave"`.
    pub fn nodes_by_name(&self, role: &str) -> Result<Vec<NodeRecord>, ClusterError> {
        Ok(self.nodes(role.parse()?))
    }

    pub fn slot_table(&self) -> Arc<SlotTable> {
        self.inner.slots.load()
    }

    pub fn status(&self) -> ClientStatus {
        *self.inner.status.lock()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ClusterEvent> {
        self.inner.events.subscribe()
    }

    /// Stop background work, fail in-flight commands and close every
    /// connection. The client cannot be reconnected afterwards.
    pub fn disconnect(&self) {
        let inner = &self.inner;
        *inner.status.lock() = ClientStatus::Closed;
        inner.shutdown.cancel();
        inner.scheduler.clear();
        inner.refresh_inflight.lock().take();
        for task in inner.tasks.lock().drain(..) {
            task.abort();
        }
        if let Some(detector) = inner.detector.lock().take() {
            detector.cleanup();
        }
        inner.pool.clear();
        info!("cluster client disconnected");
    }
}

async fn bounded<F>(limit: Option<Duration>, run: F) -> Result<RespValue, ClusterError>
where
    F: Future<Output = Result<RespValue, ClusterError>>,
{
    match limit {
        Some(limit) => match timeout(limit, run).await {
            Ok(result) => result,
            Err(_) => Err(ClusterError::CommandTimeout(limit)),
        },
        None => run.await,
    }
}

impl ClusterInner {
    fn emit(&self, event: ClusterEvent) {
        let _ = self.events.send(event);
    }

    fn start_background(self: &Arc<Self>) {
        if self.started.swap(true, Ordering::AcqRel) {
            return;
        }
        tokio::spawn(forward_pool_events(
            Arc::downgrade(self),
            self.pool.subscribe(),
        ));

        if let Some(period) = self.options.slots_refresh_interval() {
            let weak = Arc::downgrade(self);
            let handle = tokio::spawn(async move {
                let mut ticker = interval(period);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
                ticker.tick().await;
                loop {
                    ticker.tick().await;
                    let Some(inner) = weak.upgrade() else { break };
                    if let Err(err) = inner.refresh().await {
                        debug!(error = %err, "periodic topology refresh failed");
                    }
                }
            });
            self.tasks.lock().push(handle);
        }
    }

    async fn wait_settled(&self) {
        let limit = self.options.connect_options().connect_timeout;
        let pending = self
            .pool
            .list(RoleFilter::All)
            .into_iter()
            .map(|record| async move {
                let _ = timeout(limit, record.connection.wait_settled()).await;
            });
        join_all(pending).await;
    }

    fn on_refresh_window(self: Arc<Self>, bucket: &str, batch: Vec<RefreshRequest>) {
        if self.shutdown.is_cancelled() {
            return;
        }
        let triggers: Vec<String> = batch
            .iter()
            .filter_map(|request| request.trigger.as_ref().map(ToString::to_string))
            .collect();
        debug!(bucket, requests = batch.len(), ?triggers, "running coalesced topology refresh");
        tokio::spawn(async move {
            if let Err(err) = self.refresh().await {
                warn!(error = %err, "coalesced topology refresh failed");
            }
        });
    }

    async fn refresh(self: &Arc<Self>) -> Result<u64, ClusterError> {
        let shared = {
            let mut inflight = self.refresh_inflight.lock();
            match inflight.as_ref() {
                Some(running) => running.clone(),
                None => {
                    let inner = self.clone();
                    let running = async move {
                        let result = inner.refresh_once().await;
                        inner.refresh_inflight.lock().take();
                        result
                    }
                    .boxed()
                    .shared();
                    *inflight = Some(running.clone());
                    running
                }
            }
        };
        shared.await
    }

    async fn refresh_once(&self) -> Result<u64, ClusterError> {
        if self.shutdown.is_cancelled() {
            return Err(ClusterError::ConnectionClosed);
        }
        let epoch = self.slots.reserve();
        let mut candidates = self.pool.keys(RoleFilter::All);
        if candidates.is_empty() {
            debug!(seeds = self.seeds.len(), "pool is empty, probing seed nodes");
            candidates = self.seeds.clone();
        }

        let fetched = fetch_topology(
            &self.pool,
            candidates,
            self.options.slots_refresh_timeout(),
            &self.nat,
        )
        .await;
        let (source, ranges) = match fetched {
            Ok(fetched) => fetched,
            Err(err) => {
                warn!(error = %err, "topology refresh failed");
                metrics::refresh("failed");
                self.emit(ClusterEvent::RefreshFailed(err.clone()));
                return Err(err);
            }
        };

        match self.slots.replace_from(epoch, ranges) {
            Some(published) => {
                let table = self.slots.load();
                self.pool.replace_topology(&table.nodes());
                info!(
                    epoch = published,
                    source = %source,
                    ranges = table.ranges().len(),
                    "cluster topology applied"
                );
                metrics::refresh("applied");
                self.emit(ClusterEvent::Refreshed {
                    epoch: published,
                    source,
                });
                Ok(published)
            }
            None => {
                debug!(epoch, current = self.slots.epoch(), "discarding stale topology");
                metrics::refresh("stale");
                Ok(self.slots.epoch())
            }
        }
    }

    async fn execute(self: &Arc<Self>, mut command: Command) -> Result<RespValue, ClusterError> {
        let mut redirect: Option<Redirect> = None;
        loop {
            let (target, role, asking) = match redirect.take() {
                Some(Redirect::Moved { node, .. }) => (node, NodeRole::Master, false),
                Some(Redirect::Ask { node, .. }) => (node, NodeRole::Master, true),
                None => {
                    let (node, role) = self.resolve_target(&command).await?;
                    (node, role, false)
                }
            };
            trace!(
                node = %target,
                attempt = command.redirections(),
                state = AttemptState::Pending.as_str(),
                "target resolved"
            );

            let record = self.acquire(&target, role);
            let request = command.to_resp();
            let sent = if asking {
                record.connection.send_asking(request).await
            } else {
                record.connection.send(request).await
            };
            trace!(node = %target, asking, state = AttemptState::Sent.as_str(), "reply received");

            let (state, last_error, delay) = match sent {
                Err(err) => {
                    metrics::redirect("node_down");
                    self.scheduler.schedule(RefreshRequest::new(
                        NODE_DOWN_BUCKET,
                        RefreshReason::NodeDown,
                        Some(target.clone()),
                    ));
                    (
                        AttemptState::NodeDown,
                        format!("{err:#}"),
                        self.options.retry_delay_on_failover(),
                    )
                }
                Ok(reply) => match classify(reply, &target) {
                    ReplyClass::Done(value) => {
                        trace!(node = %target, state = AttemptState::Done.as_str(), "command finished");
                        return Ok(value);
                    }
                    ReplyClass::Rejected(message) => {
                        trace!(node = %target, state = AttemptState::Failed.as_str(), "command rejected");
                        return Err(ClusterError::CommandRejectedByNode {
                            node: target,
                            message: message.into(),
                        });
                    }
                    ReplyClass::Redirect(next) => {
                        let next = next.translate(&self.nat);
                        let (state, message, delay) = match &next {
                            Redirect::Moved { slot, node } => {
                                metrics::redirect("moved");
                                self.on_moved(*slot, node);
                                (
                                    AttemptState::RedirectPermanent,
                                    format!("MOVED {slot} {node}"),
                                    self.options.retry_delay_on_moved(),
                                )
                            }
                            Redirect::Ask { slot, node } => {
                                metrics::redirect("ask");
                                (
                                    AttemptState::RedirectTemporary,
                                    format!("ASK {slot} {node}"),
                                    Duration::ZERO,
                                )
                            }
                        };
                        redirect = Some(next);
                        (state, message, delay)
                    }
                    ReplyClass::Retry { kind, message } => {
                        let delay = match kind {
                            RetryKind::ClusterDown => {
                                metrics::redirect("clusterdown");
                                self.scheduler.schedule(RefreshRequest::new(
                                    CLUSTER_DOWN_BUCKET,
                                    RefreshReason::ClusterDown,
                                    Some(target.clone()),
                                ));
                                self.options.retry_delay_on_cluster_down()
                            }
                            RetryKind::TryAgain => {
                                metrics::redirect("tryagain");
                                self.options.retry_delay_on_try_again()
                            }
                            RetryKind::Loading => {
                                metrics::redirect("loading");
                                self.options.retry_delay_on_try_again()
                            }
                        };
                        (AttemptState::RetryLater, message, delay)
                    }
                },
            };

            let attempts = command.record_redirection();
            if attempts > self.options.max_redirections {
                warn!(
                    node = %target,
                    attempts,
                    state = state.as_str(),
                    error = %last_error,
                    "giving up on command"
                );
                if state == AttemptState::NodeDown {
                    return Err(ClusterError::NodeUnreachable {
                        node: target,
                        reason: last_error.into(),
                    });
                }
                return Err(ClusterError::RedirectionLimitExceeded {
                    attempts,
                    last_node: Some(target),
                    last_error: last_error.into(),
                });
            }
            debug!(
                node = %target,
                attempt = attempts,
                state = state.as_str(),
                error = %last_error,
                "retrying command"
            );
            if !delay.is_zero() {
                sleep(delay).await;
            }
        }
    }

    /// Point the slot at its new owner right away and ask for a full
    /// refresh within the cooldown window.
    fn on_moved(&self, slot: u16, target: &NodeKey) {
        let bucket = match self.slots.lookup(slot) {
            Some(range) if &range.master == target => return,
            Some(range) => moved_bucket(range.start, range.end),
            None => moved_bucket(slot, slot),
        };
        let epoch = self.slots.reassign(slot, target);
        debug!(slot, node = %target, epoch, bucket = %bucket, "slot reassigned after MOVED");
        self.scheduler.schedule(RefreshRequest::new(
            bucket,
            RefreshReason::Moved { slot },
            Some(target.clone()),
        ));
    }

    /// Existing records are used as they are; a missing node is created
    /// with `role`.
    fn acquire(&self, node: &NodeKey, role: NodeRole) -> NodeRecord {
        match self.pool.get_existing(node) {
            Some(record) => record,
            None => self.pool.get(node, role),
        }
    }

    async fn resolve_target(
        self: &Arc<Self>,
        command: &Command,
    ) -> Result<(NodeKey, NodeRole), ClusterError> {
        let Some(slot) = command.slot() else {
            return self.any_node(command.is_read_only()).await;
        };
        let range = match self.slots.lookup(slot) {
            Some(range) => range,
            None => {
                self.refresh().await?;
                match self.slots.lookup(slot) {
                    Some(range) => range,
                    None => {
                        debug!(slot, "slot not covered after refresh, using a random master");
                        return self.any_node(false).await;
                    }
                }
            }
        };
        if command.is_read_only() {
            Ok(self.router.select(&range, &*self.pool))
        } else {
            Ok((range.master, NodeRole::Master))
        }
    }

    async fn any_node(self: &Arc<Self>, read_only: bool) -> Result<(NodeKey, NodeRole), ClusterError> {
        let filter = match (read_only, self.router.policy()) {
            (false, _) | (true, ScaleReads::Master) => RoleFilter::Master,
            (true, ScaleReads::Slave) => RoleFilter::Slave,
            (true, _) => RoleFilter::All,
        };
        if let Some(record) = self
            .pool
            .sample(filter)
            .or_else(|| self.pool.sample(RoleFilter::Master))
        {
            return Ok((record.key().clone(), record.role));
        }
        self.refresh().await?;
        self.pool
            .sample(RoleFilter::Master)
            .map(|record| (record.key().clone(), record.role))
            .ok_or(ClusterError::NoAvailableNode("master"))
    }

    async fn arm_failover_detector(self: &Arc<Self>) {
        let monitors = match self.options.sentinel_keys() {
            Ok(monitors) if !monitors.is_empty() => monitors,
            _ => return,
        };
        let detector = FailoverDetector::new(
            monitors,
            self.options.connect_options().connect_timeout,
        );
        let relay = Arc::new(FailoverRelay {
            client: Arc::downgrade(self),
        });
        let live = detector.subscribe(relay).await;
        if live == 0 {
            warn!("no monitor accepted the failover subscription");
        }
        if self.shutdown.is_cancelled() {
            detector.cleanup();
            return;
        }
        if let Some(previous) = self.detector.lock().replace(detector) {
            previous.cleanup();
        }
    }

    async fn rediscover(self: Arc<Self>, monitor: NodeKey) {
        if self.shutdown.is_cancelled() {
            return;
        }
        if let Some(detector) = self.detector.lock().take() {
            detector.cleanup();
        }
        self.emit(ClusterEvent::Failover {
            monitor: monitor.clone(),
        });
        self.pool.clear();
        match self.refresh().await {
            Ok(epoch) => info!(epoch, monitor = %monitor, "topology rediscovered after failover"),
            Err(err) => warn!(monitor = %monitor, error = %err, "rediscovery after failover failed"),
        }
        self.arm_failover_detector().await;
    }
}

struct FailoverRelay {
    client: Weak<ClusterInner>,
}

#[async_trait]
impl FailoverHandler for FailoverRelay {
    async fn on_failover(&self, monitor: &NodeKey, payload: &str) {
        let Some(inner) = self.client.upgrade() else { return };
        debug!(monitor = %monitor, payload, "master switch, rediscovering topology");
        tokio::spawn(inner.rediscover(monitor.clone()));
    }
}

async fn forward_pool_events(client: Weak<ClusterInner>, mut events: broadcast::Receiver<PoolEvent>) {
    loop {
        let event = match events.recv().await {
            Ok(event) => event,
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(skipped, "pool events lagged");
                continue;
            }
            Err(broadcast::error::RecvError::Closed) => break,
        };
        let Some(inner) = client.upgrade() else { break };
        match event {
            PoolEvent::NodeAdded(node) => inner.emit(ClusterEvent::NodeAdded(node)),
            PoolEvent::NodeRemoved(node) => inner.emit(ClusterEvent::NodeRemoved(node)),
            PoolEvent::NodeError { node, error } => {
                if !inner.shutdown.is_cancelled() && inner.slots.load().owns_slots(&node) {
                    inner.scheduler.schedule(RefreshRequest::new(
                        NODE_ERROR_BUCKET,
                        RefreshReason::NodeError,
                        Some(node.clone()),
                    ));
                }
                inner.emit(ClusterEvent::NodeError { node, error });
            }
            PoolEvent::Drained => {
                inner.emit(ClusterEvent::Drain);
                if inner.shutdown.is_cancelled() {
                    break;
                }
            }
        }
    }
}

/// MOVED signals for one slot range share a refresh window.
fn moved_bucket(start: u16, end: u16) -> String {
    format!("moved:{start}-{end}")
}
