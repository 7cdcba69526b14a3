use std::sync::Arc;

use rand::seq::SliceRandom;
use rand::thread_rng;

use crate::backend::pool::ConnectionPool;
use crate::config::ScaleReads;

use super::node::{NodeKey, NodeRole};
use super::slots::SlotRange;

/// What the router needs to know about live nodes.
pub trait NodeView {
    /// Whether a usable connection to `key` exists.
    fn is_available(&self, key: &NodeKey) -> bool;
    /// Zone reported by the node, if learned yet.
    fn zone(&self, key: &NodeKey) -> Option<Arc<str>>;
}

impl NodeView for ConnectionPool {
    fn is_available(&self, key: &NodeKey) -> bool {
        self.get_existing(key)
            .map_or(false, |record| !record.connection.is_closed())
    }

    fn zone(&self, key: &NodeKey) -> Option<Arc<str>> {
        self.get_existing(key)
            .and_then(|record| record.availability_zone())
    }
}

/// Picks the node serving a read-only command for a slot range.
#[derive(Debug, Clone)]
pub struct ReadRouter {
    policy: ScaleReads,
    client_az: Option<Arc<str>>,
}

impl ReadRouter {
    pub fn new(policy: ScaleReads, client_az: Option<&str>) -> Self {
        Self {
            policy,
            client_az: client_az.map(Arc::from),
        }
    }

    pub fn policy(&self) -> ScaleReads {
        self.policy
    }

    /// Choose the target for a read. Replicas without a live connection are
    /// skipped; the master is the fallback of every policy.
    pub fn select(&self, range: &SlotRange, view: &dyn NodeView) -> (NodeKey, NodeRole) {
        let master = (range.master.clone(), NodeRole::Master);
        let replicas: Vec<&NodeKey> = range
            .replicas
            .iter()
            .filter(|key| view.is_available(key))
            .collect();

        let pick = match self.policy {
            ScaleReads::Master => None,
            ScaleReads::Slave => pick_replica(&replicas),
            ScaleReads::All => {
                let mut candidates: Vec<(NodeKey, NodeRole)> = replicas
                    .iter()
                    .map(|key| ((*key).clone(), NodeRole::Slave))
                    .collect();
                if view.is_available(&range.master) {
                    candidates.push(master.clone());
                }
                candidates.choose(&mut thread_rng()).cloned()
            }
            ScaleReads::AzAffinity => {
                let (local, remote) = self.partition(&replicas, view);
                pick_replica(&local).or_else(|| pick_replica(&remote))
            }
            ScaleReads::AzAffinityReplicasAndPrimary => {
                let (local, remote) = self.partition(&replicas, view);
                pick_replica(&local)
                    .or_else(|| pick_replica(&remote))
                    .or_else(|| {
                        (self.is_local(&range.master, view) && view.is_available(&range.master))
                            .then(|| master.clone())
                    })
            }
        };
        pick.unwrap_or(master)
    }

    fn is_local(&self, key: &NodeKey, view: &dyn NodeView) -> bool {
        match (&self.client_az, view.zone(key)) {
            (Some(client), Some(zone)) => client.as_ref() == zone.as_ref(),
            _ => false,
        }
    }

    fn partition<'a>(
        &self,
        replicas: &[&'a NodeKey],
        view: &dyn NodeView,
    ) -> (Vec<&'a NodeKey>, Vec<&'a NodeKey>) {
        replicas.iter().copied().partition(|key| self.is_local(key, view))
    }
}

fn pick_replica(candidates: &[&NodeKey]) -> Option<(NodeKey, NodeRole)> {
    candidates
        .choose(&mut thread_rng())
        .map(|key| ((*key).clone(), NodeRole::Slave))
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    #[derive(Default)]
    struct FakeView {
        zones: HashMap<NodeKey, Arc<str>>,
        down: Vec<NodeKey>,
    }

    impl FakeView {
        fn with_zone(mut self, port: u16, zone: &str) -> Self {
            self.zones.insert(key(port), Arc::from(zone));
            self
        }

        fn down(mut self, port: u16) -> Self {
            self.down.push(key(port));
            self
        }
    }

    impl NodeView for FakeView {
        fn is_available(&self, key: &NodeKey) -> bool {
            !self.down.contains(key)
        }

        fn zone(&self, key: &NodeKey) -> Option<Arc<str>> {
            self.zones.get(key).cloned()
        }
    }

    fn key(port: u16) -> NodeKey {
        NodeKey::new("127.0.0.1", port)
    }

    fn range() -> SlotRange {
        SlotRange::new(0, 16383, key(30001), vec![key(30003), key(30004)])
    }

    fn zoned() -> FakeView {
        FakeView::default()
            .with_zone(30001, "zone-a")
            .with_zone(30003, "zone-a")
            .with_zone(30004, "zone-b")
    }

    fn az(policy: ScaleReads) -> ReadRouter {
        ReadRouter::new(policy, Some("zone-a"))
    }

    #[test]
    fn master_policy_always_reads_master() {
        let router = ReadRouter::new(ScaleReads::Master, None);
        for _ in 0..20 {
            assert_eq!(router.select(&range(), &zoned()), (key(30001), NodeRole::Master));
        }
    }

    #[test]
    fn slave_policy_spreads_over_replicas() {
        let router = ReadRouter::new(ScaleReads::Slave, None);
        let mut seen = std::collections::HashSet::new();
        for _ in 0..200 {
            let (node, role) = router.select(&range(), &zoned());
            assert_eq!(role, NodeRole::Slave);
            seen.insert(node.port());
        }
        assert_eq!(seen.len(), 2);
    }

    #[test]
    fn slave_policy_falls_back_to_master() {
        let router = ReadRouter::new(ScaleReads::Slave, None);
        let bare = SlotRange::new(0, 10, key(30001), vec![]);
        assert_eq!(router.select(&bare, &zoned()), (key(30001), NodeRole::Master));
    }

    #[test]
    fn all_policy_includes_master() {
        let router = ReadRouter::new(ScaleReads::All, None);
        let mut seen = std::collections::HashSet::new();
        for _ in 0..300 {
            seen.insert(router.select(&range(), &zoned()).0.port());
        }
        assert_eq!(seen.len(), 3);
    }

    #[test]
    fn az_affinity_reads_only_local_replica() {
        let router = az(ScaleReads::AzAffinity);
        for _ in 0..1000 {
            assert_eq!(router.select(&range(), &zoned()), (key(30003), NodeRole::Slave));
        }
    }

    #[test]
    fn az_affinity_uses_remote_replica_when_local_is_down() {
        let router = az(ScaleReads::AzAffinity);
        let view = zoned().down(30003);
        assert_eq!(router.select(&range(), &view), (key(30004), NodeRole::Slave));
    }

    #[test]
    fn az_affinity_uses_master_without_replicas() {
        let router = az(ScaleReads::AzAffinity);
        let view = zoned().down(30003).down(30004);
        assert_eq!(router.select(&range(), &view), (key(30001), NodeRole::Master));
    }

    #[test]
    fn unknown_zone_counts_as_remote() {
        let router = az(ScaleReads::AzAffinity);
        let view = FakeView::default().with_zone(30004, "zone-b");
        let (node, role) = router.select(&range(), &view);
        assert_eq!(role, NodeRole::Slave);
        assert!(node == key(30003) || node == key(30004));
    }

    #[test]
    fn replicas_and_primary_prefers_local_replica() {
        let router = az(ScaleReads::AzAffinityReplicasAndPrimary);
        assert_eq!(router.select(&range(), &zoned()), (key(30003), NodeRole::Slave));
    }

    #[test]
    fn replicas_and_primary_prefers_remote_replica_over_local_master() {
        let router = az(ScaleReads::AzAffinityReplicasAndPrimary);
        let view = zoned().down(30003);
        for _ in 0..100 {
            assert_eq!(router.select(&range(), &view), (key(30004), NodeRole::Slave));
        }
    }

    #[test]
    fn replicas_and_primary_uses_local_master_after_replicas() {
        let router = az(ScaleReads::AzAffinityReplicasAndPrimary);
        let view = zoned().down(30003).down(30004);
        assert_eq!(router.select(&range(), &view), (key(30001), NodeRole::Master));
    }

    #[test]
    fn replicas_and_primary_uses_remote_replica_when_master_is_remote() {
        let router = az(ScaleReads::AzAffinityReplicasAndPrimary);
        let remote = SlotRange::new(0, 16383, key(30002), vec![key(30004)]);
        let view = FakeView::default().with_zone(30002, "zone-b").with_zone(30004, "zone-b");
        assert_eq!(router.select(&remote, &view), (key(30004), NodeRole::Slave));
    }

    #[test]
    fn replicas_and_primary_falls_back_to_remote_master() {
        let router = az(ScaleReads::AzAffinityReplicasAndPrimary);
        let remote = SlotRange::new(0, 16383, key(30002), vec![]);
        let view = FakeView::default().with_zone(30002, "zone-b");
        assert_eq!(router.select(&remote, &view), (key(30002), NodeRole::Master));
    }
}
