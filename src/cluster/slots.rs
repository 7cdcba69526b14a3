use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::{anyhow, bail, Result};
use arc_swap::ArcSwap;
use tracing::warn;

use crate::protocol::redis::{RespValue, SLOT_COUNT};

use super::node::{NatMap, NodeDescriptor, NodeKey, NodeRole};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotRange {
    pub start: u16,
    pub end: u16,
    pub master: NodeKey,
    pub replicas: Vec<NodeKey>,
}

impl SlotRange {
    pub fn new(start: u16, end: u16, master: NodeKey, replicas: Vec<NodeKey>) -> Self {
        Self {
            start,
            end,
            master,
            replicas,
        }
    }

    pub fn contains(&self, slot: u16) -> bool {
        self.start <= slot && slot <= self.end
    }

    fn overlaps(&self, other: &SlotRange) -> bool {
        self.start <= other.end && other.start <= self.end
    }
}

/// Immutable slot-to-owner mapping. Ranges are sorted and disjoint; slots
/// outside every range are uncovered.
#[derive(Debug, Clone, Default)]
pub struct SlotTable {
    ranges: Vec<SlotRange>,
    epoch: u64,
}

impl SlotTable {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Build a table from ranges in reply order. When two ranges overlap the
    /// later one wins and the earlier is discarded.
    pub fn from_ranges(ranges: Vec<SlotRange>, epoch: u64) -> Self {
        let mut accepted: Vec<SlotRange> = Vec::with_capacity(ranges.len());
        for range in ranges {
            if range.start > range.end || range.end >= SLOT_COUNT {
                warn!(start = range.start, end = range.end, "dropping out-of-bounds slot range");
                continue;
            }
            accepted.retain(|existing| {
                let conflict = existing.overlaps(&range);
                if conflict {
                    warn!(
                        discarded_start = existing.start,
                        discarded_end = existing.end,
                        discarded_master = %existing.master,
                        start = range.start,
                        end = range.end,
                        master = %range.master,
                        "overlapping slot ranges in topology reply"
                    );
                }
                !conflict
            });
            accepted.push(range);
        }
        accepted.sort_by_key(|range| range.start);
        Self {
            ranges: accepted,
            epoch,
        }
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn ranges(&self) -> &[SlotRange] {
        &self.ranges
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    pub fn lookup(&self, slot: u16) -> Option<&SlotRange> {
        let idx = self.ranges.partition_point(|range| range.start <= slot);
        let candidate = self.ranges.get(idx.checked_sub(1)?)?;
        candidate.contains(slot).then_some(candidate)
    }

    /// Every node mentioned by the table. A node listed both as master and
    /// replica is reported as master.
    pub fn nodes(&self) -> Vec<NodeDescriptor> {
        let mut roles: BTreeMap<NodeKey, NodeRole> = BTreeMap::new();
        for range in &self.ranges {
            roles.insert(range.master.clone(), NodeRole::Master);
        }
        for range in &self.ranges {
            for replica in &range.replicas {
                roles.entry(replica.clone()).or_insert(NodeRole::Slave);
            }
        }
        roles
            .into_iter()
            .map(|(key, role)| NodeDescriptor::new(key, role))
            .collect()
    }

    /// Whether `key` is the master of at least one range.
    pub fn owns_slots(&self, key: &NodeKey) -> bool {
        self.ranges.iter().any(|range| &range.master == key)
    }

    /// Copy of this table with `slot` moved to `owner`, splitting the range
    /// that held it.
    fn with_slot_owner(&self, slot: u16, owner: &NodeKey, epoch: u64) -> Self {
        let mut ranges = Vec::with_capacity(self.ranges.len() + 2);
        for range in &self.ranges {
            if !range.contains(slot) {
                ranges.push(range.clone());
                continue;
            }
            if range.start < slot {
                ranges.push(SlotRange::new(
                    range.start,
                    slot - 1,
                    range.master.clone(),
                    range.replicas.clone(),
                ));
            }
            if range.end > slot {
                ranges.push(SlotRange::new(
                    slot + 1,
                    range.end,
                    range.master.clone(),
                    range.replicas.clone(),
                ));
            }
        }
        ranges.push(SlotRange::new(slot, slot, owner.clone(), Vec::new()));
        ranges.sort_by_key(|range| range.start);
        Self { ranges, epoch }
    }
}

/// Holder of the current table. Readers take a snapshot without locking;
/// writers publish a whole new table with a larger epoch.
#[derive(Debug)]
pub struct SlotDirectory {
    current: ArcSwap<SlotTable>,
    tickets: AtomicU64,
}

impl Default for SlotDirectory {
    fn default() -> Self {
        Self::new()
    }
}

impl SlotDirectory {
    pub fn new() -> Self {
        Self {
            current: ArcSwap::from_pointee(SlotTable::empty()),
            tickets: AtomicU64::new(0),
        }
    }

    pub fn load(&self) -> Arc<SlotTable> {
        self.current.load_full()
    }

    pub fn epoch(&self) -> u64 {
        self.current.load().epoch
    }

    pub fn lookup(&self, slot: u16) -> Option<SlotRange> {
        self.current.load().lookup(slot).cloned()
    }

    /// Reserve an epoch for a fetch that is about to start.
    pub fn reserve(&self) -> u64 {
        self.tickets.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// True when a table at least as new as `epoch` is already published.
    pub fn is_stale(&self, epoch: u64) -> bool {
        self.current.load().epoch >= epoch
    }

    /// Publish `ranges` under a fresh epoch.
    pub fn replace(&self, ranges: Vec<SlotRange>) -> u64 {
        let epoch = self.reserve();
        self.replace_from(epoch, ranges)
            .unwrap_or_else(|| self.epoch())
    }

    /// Publish `ranges` fetched under `epoch` unless a newer table won the
    /// race. Returns the published epoch.
    pub fn replace_from(&self, epoch: u64, ranges: Vec<SlotRange>) -> Option<u64> {
        let table = Arc::new(SlotTable::from_ranges(ranges, epoch));
        self.publish(table)
    }

    /// Point `slot` at `owner` in a copy of the current table.
    pub fn reassign(&self, slot: u16, owner: &NodeKey) -> u64 {
        let epoch = self.reserve();
        let previous = self.current.load();
        let table = Arc::new(previous.with_slot_owner(slot, owner, epoch));
        self.publish(table).unwrap_or_else(|| self.epoch())
    }

    fn publish(&self, table: Arc<SlotTable>) -> Option<u64> {
        let epoch = table.epoch;
        let mut published = false;
        self.current.rcu(|current| {
            if current.epoch >= epoch {
                published = false;
                Arc::clone(current)
            } else {
                published = true;
                Arc::clone(&table)
            }
        });
        published.then_some(epoch)
    }
}

/// Parse a `CLUSTER SLOTS` reply into ranges, translating every address
/// through `nat`.
pub fn parse_slots_reply(resp: &RespValue, nat: &NatMap) -> Result<Vec<SlotRange>> {
    let entries = match resp {
        RespValue::Array(values) => values,
        RespValue::Error(err) => bail!("CLUSTER SLOTS failed: {}", String::from_utf8_lossy(err)),
        _ => bail!("CLUSTER SLOTS must return an array"),
    };

    let mut ranges = Vec::with_capacity(entries.len());
    for entry in entries {
        let fields = entry
            .as_array()
            .ok_or_else(|| anyhow!("slot entry must be an array"))?;
        if fields.len() < 3 {
            bail!("slot entry must contain start, end, and master");
        }
        let start = extract_integer(&fields[0])?;
        let end = extract_integer(&fields[1])?;
        if start < 0 || start > end || end >= SLOT_COUNT as i64 {
            bail!("slot range {}-{} out of bounds", start, end);
        }
        let master = nat.translate(&extract_endpoint(&fields[2])?);
        let replicas = fields[3..]
            .iter()
            .map(|field| extract_endpoint(field).map(|key| nat.translate(&key)))
            .collect::<Result<Vec<_>>>()?;
        ranges.push(SlotRange::new(start as u16, end as u16, master, replicas));
    }
    Ok(ranges)
}

fn extract_integer(value: &RespValue) -> Result<i64> {
    value
        .as_integer()
        .ok_or_else(|| anyhow!("expected integer slot field, got {:?}", value))
}

fn extract_endpoint(value: &RespValue) -> Result<NodeKey> {
    let fields = value
        .as_array()
        .ok_or_else(|| anyhow!("endpoint must be array"))?;
    if fields.len() < 2 {
        bail!("endpoint must contain host and port");
    }
    let host = fields[0]
        .as_bytes()
        .ok_or_else(|| anyhow!("endpoint host must be string"))?;
    let host = std::str::from_utf8(host)?;
    let port = extract_integer(&fields[1])?;
    let port = u16::try_from(port).map_err(|_| anyhow!("invalid endpoint port {port}"))?;
    Ok(NodeKey::new(host, port))
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn key(port: u16) -> NodeKey {
        NodeKey::new("127.0.0.1", port)
    }

    fn endpoint(host: &str, port: i64) -> RespValue {
        RespValue::Array(vec![
            RespValue::BulkString(Bytes::copy_from_slice(host.as_bytes())),
            RespValue::Integer(port),
            RespValue::bulk("node-id"),
        ])
    }

    fn sample_table() -> SlotTable {
        SlotTable::from_ranges(
            vec![
                SlotRange::new(8192, 16383, key(7001), vec![key(7003)]),
                SlotRange::new(0, 8191, key(7000), vec![key(7002)]),
            ],
            1,
        )
    }

    #[test]
    fn lookup_uses_sorted_ranges() {
        let table = sample_table();
        assert_eq!(table.lookup(0).map(|r| r.master.port()), Some(7000));
        assert_eq!(table.lookup(8191).map(|r| r.master.port()), Some(7000));
        assert_eq!(table.lookup(8192).map(|r| r.master.port()), Some(7001));
        assert_eq!(table.lookup(16383).map(|r| r.master.port()), Some(7001));
    }

    #[test]
    fn uncovered_slot_returns_none() {
        let table = SlotTable::from_ranges(vec![SlotRange::new(100, 200, key(7000), vec![])], 1);
        assert!(table.lookup(99).is_none());
        assert!(table.lookup(201).is_none());
        assert!(SlotTable::empty().lookup(0).is_none());
    }

    #[test]
    fn later_overlapping_range_wins() {
        let table = SlotTable::from_ranges(
            vec![
                SlotRange::new(0, 100, key(7000), vec![]),
                SlotRange::new(50, 150, key(7001), vec![]),
            ],
            1,
        );
        assert_eq!(table.ranges().len(), 1);
        assert_eq!(table.lookup(10), None);
        assert_eq!(table.lookup(60).map(|r| r.master.port()), Some(7001));
    }

    #[test]
    fn nodes_prefer_master_role() {
        let table = SlotTable::from_ranges(
            vec![
                SlotRange::new(0, 10, key(7000), vec![key(7001)]),
                SlotRange::new(11, 20, key(7001), vec![key(7002)]),
            ],
            1,
        );
        let nodes = table.nodes();
        assert_eq!(nodes.len(), 3);
        let role_of = |port| nodes.iter().find(|n| n.key.port() == port).map(|n| n.role);
        assert_eq!(role_of(7000), Some(NodeRole::Master));
        assert_eq!(role_of(7001), Some(NodeRole::Master));
        assert_eq!(role_of(7002), Some(NodeRole::Slave));
    }

    #[test]
    fn out_of_order_refresh_is_discarded() {
        let directory = SlotDirectory::new();
        let older = directory.reserve();
        let newer = directory.reserve();
        assert_eq!(
            directory.replace_from(newer, vec![SlotRange::new(0, 16383, key(7001), vec![])]),
            Some(newer)
        );
        assert!(directory.is_stale(older));
        assert_eq!(
            directory.replace_from(older, vec![SlotRange::new(0, 16383, key(7000), vec![])]),
            None
        );
        assert_eq!(directory.lookup(0).map(|r| r.master.port()), Some(7001));
        assert_eq!(directory.epoch(), newer);
    }

    #[test]
    fn replace_increases_epoch() {
        let directory = SlotDirectory::new();
        let first = directory.replace(vec![SlotRange::new(0, 16383, key(7000), vec![])]);
        let second = directory.replace(vec![SlotRange::new(0, 16383, key(7001), vec![])]);
        assert!(second > first);
        assert_eq!(directory.load().epoch(), second);
    }

    #[test]
    fn reassign_moves_single_slot() {
        let directory = SlotDirectory::new();
        directory.replace(vec![SlotRange::new(0, 100, key(7000), vec![key(7002)])]);
        directory.reassign(50, &key(7001));
        let table = directory.load();
        assert_eq!(table.lookup(49).map(|r| r.master.port()), Some(7000));
        assert_eq!(table.lookup(50).map(|r| r.master.port()), Some(7001));
        assert_eq!(table.lookup(51).map(|r| r.master.port()), Some(7000));
        assert_eq!(table.lookup(100).map(|r| r.master.port()), Some(7000));
        assert_eq!(table.ranges().len(), 3);
    }

    #[test]
    fn parse_basic_slot_layout() {
        let resp = RespValue::Array(vec![RespValue::Array(vec![
            RespValue::Integer(0),
            RespValue::Integer(2),
            endpoint("127.0.0.1", 7000),
            endpoint("127.0.0.1", 7001),
        ])]);
        let ranges = parse_slots_reply(&resp, &NatMap::Identity).expect("slot ranges");
        assert_eq!(ranges, vec![SlotRange::new(0, 2, key(7000), vec![key(7001)])]);
    }

    #[test]
    fn parse_applies_nat_mapping() {
        let nat = NatMap::from_fn(|k| (k.port() == 7000).then(|| NodeKey::new("10.1.1.1", 17000)));
        let resp = RespValue::Array(vec![RespValue::Array(vec![
            RespValue::Integer(0),
            RespValue::Integer(16383),
            endpoint("127.0.0.1", 7000),
        ])]);
        let ranges = parse_slots_reply(&resp, &nat).unwrap();
        assert_eq!(ranges[0].master, NodeKey::new("10.1.1.1", 17000));
    }

    #[test]
    fn parse_rejects_malformed_entries() {
        let nat = NatMap::Identity;
        assert!(parse_slots_reply(&RespValue::simple("OK"), &nat).is_err());
        assert!(parse_slots_reply(&RespValue::error("ERR cluster support disabled"), &nat).is_err());
        let bad_range = RespValue::Array(vec![RespValue::Array(vec![
            RespValue::Integer(10),
            RespValue::Integer(5),
            endpoint("127.0.0.1", 7000),
        ])]);
        assert!(parse_slots_reply(&bad_range, &nat).is_err());
    }
}
