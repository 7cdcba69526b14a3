use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use async_trait::async_trait;
use futures::future::join_all;
use futures::StreamExt;
use parking_lot::Mutex;
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::backend::connector::{execute, open_stream};
use crate::cluster::node::NodeKey;
use crate::protocol::redis::{RespCodec, RespValue};

pub const SWITCH_MASTER_CHANNEL: &str = "+switch-master";

/// Reacts to a master switch announced by a monitor node.
#[async_trait]
pub trait FailoverHandler: Send + Sync + 'static {
    async fn on_failover(&self, monitor: &NodeKey, payload: &str);
}

/// Watches monitor nodes for `+switch-master` and hands the first
/// notification to the handler. Later notifications are ignored; the owner
/// arms a new detector once it has reconnected.
pub struct FailoverDetector {
    monitors: Vec<NodeKey>,
    connect_timeout: Duration,
    disconnected: Arc<AtomicBool>,
    shutdown: CancellationToken,
    listeners: Mutex<Vec<JoinHandle<()>>>,
}

impl FailoverDetector {
    pub fn new(monitors: Vec<NodeKey>, connect_timeout: Duration) -> Self {
        Self {
            monitors,
            connect_timeout,
            disconnected: Arc::new(AtomicBool::new(false)),
            shutdown: CancellationToken::new(),
            listeners: Mutex::new(Vec::new()),
        }
    }

    pub fn monitors(&self) -> &[NodeKey] {
        &self.monitors
    }

    /// Subscribe on every monitor concurrently. Monitors that cannot be
    /// reached are logged and skipped; returns how many subscriptions are live.
    pub async fn subscribe(&self, handler: Arc<dyn FailoverHandler>) -> usize {
        debug!(monitors = self.monitors.len(), "starting failover detector");
        let attempts = self
            .monitors
            .iter()
            .map(|monitor| open_subscription(monitor, self.connect_timeout));
        let results = join_all(attempts).await;

        let mut live = 0;
        let mut listeners = self.listeners.lock();
        for (monitor, result) in self.monitors.iter().zip(results) {
            match result {
                Ok(framed) => {
                    live += 1;
                    listeners.push(tokio::spawn(listen(
                        monitor.clone(),
                        framed,
                        handler.clone(),
                        self.disconnected.clone(),
                        self.shutdown.clone(),
                    )));
                }
                Err(err) => {
                    warn!(monitor = %monitor, error = %err, "failed to subscribe to failover messages");
                }
            }
        }
        if self.shutdown.is_cancelled() {
            listeners.drain(..).for_each(|listener| listener.abort());
        }
        live
    }

    pub fn is_disconnected(&self) -> bool {
        self.disconnected.load(Ordering::Acquire)
    }

    /// Stop listening and close every monitor link.
    pub fn cleanup(&self) {
        self.disconnected.store(true, Ordering::Release);
        self.shutdown.cancel();
        for listener in self.listeners.lock().drain(..) {
            listener.abort();
        }
    }
}

impl Drop for FailoverDetector {
    fn drop(&mut self) {
        self.cleanup();
    }
}

async fn open_subscription(
    monitor: &NodeKey,
    connect_timeout: Duration,
) -> Result<Framed<TcpStream, RespCodec>> {
    let mut framed = open_stream(monitor, connect_timeout).await?;
    let ack = execute(
        &mut framed,
        RespValue::command(["SUBSCRIBE", SWITCH_MASTER_CHANNEL]),
        connect_timeout,
    )
    .await?;
    if let Some(message) = ack.error_message() {
        bail!("subscribe rejected: {message}");
    }
    let confirmed = ack
        .as_array()
        .and_then(|parts| parts.first())
        .and_then(RespValue::as_bytes)
        .map_or(false, |kind| kind.eq_ignore_ascii_case(b"subscribe"));
    if !confirmed {
        bail!("unexpected subscribe reply {ack:?}");
    }
    Ok(framed)
}

async fn listen(
    monitor: NodeKey,
    mut framed: Framed<TcpStream, RespCodec>,
    handler: Arc<dyn FailoverHandler>,
    disconnected: Arc<AtomicBool>,
    shutdown: CancellationToken,
) {
    loop {
        let frame = tokio::select! {
            _ = shutdown.cancelled() => break,
            frame = framed.next() => frame,
        };
        match frame {
            Some(Ok(value)) => {
                let Some(payload) = switch_master_payload(&value) else { continue };
                if disconnected.swap(true, Ordering::AcqRel) {
                    debug!(monitor = %monitor, "failover already handled, notification ignored");
                    continue;
                }
                info!(monitor = %monitor, payload = %payload, "failover detected, disconnecting");
                handler.on_failover(&monitor, &payload).await;
            }
            Some(Err(err)) => {
                warn!(monitor = %monitor, error = %err, "failover monitor link failed");
                break;
            }
            None => {
                debug!(monitor = %monitor, "failover monitor closed the link");
                break;
            }
        }
    }
}

/// Payload of a `message` push on the switch-master channel.
pub fn switch_master_payload(value: &RespValue) -> Option<String> {
    let parts = value.as_array()?;
    match parts {
        [kind, channel, payload] => {
            let is_message = kind.as_bytes()?.eq_ignore_ascii_case(b"message");
            if !is_message || channel.as_bytes()? != SWITCH_MASTER_CHANNEL.as_bytes() {
                return None;
            }
            Some(String::from_utf8_lossy(payload.as_bytes()?).into_owned())
        }
        _ => None,
    }
}
