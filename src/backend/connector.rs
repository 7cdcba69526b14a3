use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
#[cfg(any(unix, windows))]
use socket2::{SockRef, TcpKeepalive};
use tokio::net::TcpStream;
use tokio::sync::oneshot;
use tokio::time::timeout;
use tokio_util::codec::Framed;
use tracing::{debug, info, warn};

use crate::backend::connection::{Connector, SessionLink};
use crate::cluster::node::NodeKey;
use crate::metrics;
use crate::protocol::redis::{RespCodec, RespValue};

const TCP_KEEPALIVE: Duration = Duration::from_secs(60);

/// Connector speaking RESP2 over TCP. Each session owns one socket and
/// pipelines requests, pairing replies with requests in FIFO order.
#[derive(Debug, Default)]
pub struct TcpConnector;

enum Pending {
    Reply(oneshot::Sender<Result<RespValue>>),
    Discard,
}

impl TcpConnector {
    pub fn new() -> Self {
        Self
    }

    async fn handshake(
        &self,
        link: &SessionLink,
        framed: &mut Framed<TcpStream, RespCodec>,
    ) -> Result<()> {
        let options = link.options();
        let step_timeout = options.connect_timeout;
        if let Some(password) = &options.password {
            let mut auth = vec!["AUTH".to_string()];
            if let Some(username) = &options.username {
                auth.push(username.clone());
            }
            auth.push(password.clone());
            let reply = execute(framed, RespValue::command(auth), step_timeout).await?;
            if let Some(message) = reply.error_message() {
                bail!("authentication rejected: {message}");
            }
        }

        if options.learn_zone {
            let reply = execute(framed, RespValue::command(["HELLO"]), step_timeout).await?;
            match reply.error_message() {
                Some(message) => {
                    debug!(node = %link.key(), error = %message, "HELLO unsupported, zone unknown")
                }
                None => link.set_zone(availability_zone(&reply)),
            }
        }

        if link.read_only() {
            let reply = execute(framed, RespValue::command(["READONLY"]), step_timeout).await?;
            if let Some(message) = reply.error_message() {
                warn!(node = %link.key(), error = %message, "node refused READONLY");
            }
        }
        Ok(())
    }
}

/// Open a framed TCP stream to `node` with nodelay and keepalive set.
pub(crate) async fn open_stream(
    node: &NodeKey,
    connect_timeout: Duration,
) -> Result<Framed<TcpStream, RespCodec>> {
    let address = node.socket_addr();
    let stream = timeout(connect_timeout, TcpStream::connect(&address))
        .await
        .with_context(|| format!("connection to {} timed out", address))??;
    stream
        .set_nodelay(true)
        .with_context(|| format!("failed to set TCP_NODELAY for {}", address))?;
    #[cfg(any(unix, windows))]
    {
        let keepalive = TcpKeepalive::new().with_time(TCP_KEEPALIVE);
        if let Err(err) = SockRef::from(&stream).set_tcp_keepalive(&keepalive) {
            warn!(node = %node, error = %err, "failed to enable node TCP keepalive");
        }
    }
    Ok(Framed::new(stream, RespCodec))
}

pub(crate) async fn execute(
    framed: &mut Framed<TcpStream, RespCodec>,
    request: RespValue,
    step_timeout: Duration,
) -> Result<RespValue> {
    timeout(step_timeout, framed.send(request))
        .await
        .context("timed out sending command")??;
    match timeout(step_timeout, framed.next()).await {
        Ok(Some(Ok(value))) => Ok(value),
        Ok(Some(Err(err))) => Err(err),
        Ok(None) => Err(anyhow!("node closed connection")),
        Err(_) => Err(anyhow!("timed out waiting for reply")),
    }
}

/// Zone advertised in a `HELLO` reply (flat key/value array).
fn availability_zone(reply: &RespValue) -> Option<&str> {
    let fields = reply.as_array()?;
    fields.chunks(2).find_map(|pair| match pair {
        [name, value] => {
            let name = name.as_bytes()?;
            if name.eq_ignore_ascii_case(b"availability_zone") || name.eq_ignore_ascii_case(b"az") {
                value
                    .as_bytes()
                    .and_then(|zone| std::str::from_utf8(zone).ok())
                    .filter(|zone| !zone.is_empty())
            } else {
                None
            }
        }
        _ => None,
    })
}

#[async_trait]
impl Connector for TcpConnector {
    async fn run_session(self: Arc<Self>, mut link: SessionLink) {
        let node = link.key().clone();
        let shutdown = link.shutdown();
        let connect_timeout = link.options().connect_timeout;

        let connected = tokio::select! {
            _ = shutdown.cancelled() => return,
            result = async {
                let mut framed = open_stream(&node, connect_timeout).await?;
                self.handshake(&link, &mut framed).await?;
                Ok::<_, anyhow::Error>(framed)
            } => result,
        };
        let framed = match connected {
            Ok(framed) => framed,
            Err(err) => {
                warn!(node = %node, error = %err, "failed to connect to cluster node");
                metrics::node_event("connect_error");
                link.report_error(&err);
                return;
            }
        };
        info!(node = %node, read_only = link.read_only(), "cluster node session established");
        link.mark_ready();

        let (mut sink, mut stream) = framed.split();
        let mut inflight: VecDeque<Pending> = VecDeque::new();

        loop {
            tokio::select! {
                biased;

                _ = shutdown.cancelled() => break,
                frame = stream.next() => match frame {
                    Some(Ok(value)) => match inflight.pop_front() {
                        Some(Pending::Reply(tx)) => {
                            if tx.send(Ok(value)).is_err() {
                                debug!(node = %node, "reply dropped, caller went away");
                            }
                        }
                        Some(Pending::Discard) => {}
                        None => debug!(node = %node, "unsolicited frame from node ignored"),
                    },
                    Some(Err(err)) => {
                        warn!(node = %node, error = %err, "failed to decode node reply");
                        link.report_error(&err);
                        break;
                    }
                    None => {
                        debug!(node = %node, "node closed connection");
                        break;
                    }
                },
                cmd = link.recv() => {
                    let cmd = match cmd {
                        Some(cmd) => cmd,
                        None => break,
                    };
                    if cmd.asking {
                        if let Err(err) = sink.feed(RespValue::command(["ASKING"])).await {
                            let _ = cmd.respond_to.send(Err(anyhow!("failed to write ASKING: {err}")));
                            link.report_error(&err);
                            break;
                        }
                        inflight.push_back(Pending::Discard);
                    }
                    if let Err(err) = sink.send(cmd.request).await {
                        let _ = cmd.respond_to.send(Err(anyhow!("failed to write command: {err}")));
                        link.report_error(&err);
                        break;
                    }
                    inflight.push_back(Pending::Reply(cmd.respond_to));
                }
            }
        }

        for pending in inflight {
            if let Pending::Reply(tx) = pending {
                let _ = tx.send(Err(anyhow!("connection to {} closed", node)));
            }
        }
        debug!(node = %node, "cluster node session terminated");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zone_is_read_from_hello_pairs() {
        let reply = RespValue::Array(vec![
            RespValue::bulk("server"),
            RespValue::bulk("valkey"),
            RespValue::bulk("proto"),
            RespValue::Integer(2),
            RespValue::bulk("availability_zone"),
            RespValue::bulk("us-east-1a"),
        ]);
        assert_eq!(availability_zone(&reply), Some("us-east-1a"));

        let short = RespValue::Array(vec![RespValue::bulk("az"), RespValue::bulk("zone-b")]);
        assert_eq!(availability_zone(&short), Some("zone-b"));
    }

    #[test]
    fn missing_or_empty_zone_is_none() {
        let reply = RespValue::Array(vec![RespValue::bulk("server"), RespValue::bulk("redis")]);
        assert_eq!(availability_zone(&reply), None);
        let empty = RespValue::Array(vec![RespValue::bulk("availability_zone"), RespValue::bulk("")]);
        assert_eq!(availability_zone(&empty), None);
        assert_eq!(availability_zone(&RespValue::simple("OK")), None);
    }
}
