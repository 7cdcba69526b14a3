use std::time::Duration;

use anyhow::{anyhow, Result};
use rand::seq::SliceRandom;
use rand::thread_rng;
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::backend::pool::ConnectionPool;
use crate::error::ClusterError;
use crate::protocol::redis::RespValue;

use super::node::{NatMap, NodeKey, NodeRole};
use super::slots::{parse_slots_reply, SlotRange};

/// Ask candidates for `CLUSTER SLOTS` one at a time, in random order, until
/// one answers with a parseable layout.
pub async fn fetch_topology(
    pool: &ConnectionPool,
    mut candidates: Vec<NodeKey>,
    probe_timeout: Duration,
    nat: &NatMap,
) -> Result<(NodeKey, Vec<SlotRange>), ClusterError> {
    candidates.sort();
    candidates.dedup();
    candidates.shuffle(&mut thread_rng());

    let mut last_failure: Option<(NodeKey, String)> = None;
    for node in candidates {
        match probe(pool, &node, probe_timeout, nat).await {
            Ok(ranges) => {
                debug!(node = %node, ranges = ranges.len(), "fetched cluster slots");
                return Ok((node, ranges));
            }
            Err(err) => {
                warn!(node = %node, error = %err, "failed to fetch slots from node");
                last_failure = Some((node, format!("{err:#}")));
            }
        }
    }

    let (last_node, last_error) = match last_failure {
        Some((node, error)) => (Some(node), error),
        None => (None, "no node to query".to_string()),
    };
    Err(ClusterError::TopologyRefreshFailed {
        last_node,
        last_error: last_error.into(),
    })
}

async fn probe(
    pool: &ConnectionPool,
    node: &NodeKey,
    probe_timeout: Duration,
    nat: &NatMap,
) -> Result<Vec<SlotRange>> {
    let record = match pool.get_existing(node) {
        Some(record) => record,
        None => pool.get(node, NodeRole::Master),
    };
    if record.connection.is_closed() {
        return Err(anyhow!("connection is closed"));
    }
    let reply = timeout(
        probe_timeout,
        record
            .connection
            .send(RespValue::command(["CLUSTER", "SLOTS"])),
    )
    .await
    .map_err(|_| anyhow!("timed out after {:?}", probe_timeout))??;
    let ranges = parse_slots_reply(&reply, nat)?;
    if ranges.is_empty() {
        return Err(anyhow!("node reported no slot assignments"));
    }
    Ok(ranges)
}
