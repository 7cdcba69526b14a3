use std::sync::{Arc, Weak};

use hashbrown::HashMap;
use parking_lot::RwLock;
use rand::seq::SliceRandom;
use rand::thread_rng;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::backend::connection::{ConnectOptions, ConnectionEvent, Connector, NodeConnection};
use crate::cluster::node::{NodeDescriptor, NodeKey, NodeRole, RoleFilter};
use crate::metrics;

const POOL_EVENT_CAPACITY: usize = 256;

#[derive(Debug, Clone)]
pub enum PoolEvent {
    NodeAdded(NodeKey),
    NodeRemoved(NodeKey),
    NodeError { node: NodeKey, error: Arc<str> },
    Drained,
}

/// A pooled connection together with its current role.
#[derive(Debug, Clone)]
pub struct NodeRecord {
    pub connection: NodeConnection,
    pub role: NodeRole,
}

impl NodeRecord {
    pub fn key(&self) -> &NodeKey {
        self.connection.key()
    }

    pub fn availability_zone(&self) -> Option<Arc<str>> {
        self.connection.availability_zone()
    }
}

struct Entry {
    connection: NodeConnection,
    role: NodeRole,
    watcher: JoinHandle<()>,
}

impl Entry {
    fn record(&self) -> NodeRecord {
        NodeRecord {
            connection: self.connection.clone(),
            role: self.role,
        }
    }
}

/// One live connection per node key, classified as master or slave.
pub struct ConnectionPool {
    connector: Arc<dyn Connector>,
    options: ConnectOptions,
    records: RwLock<HashMap<NodeKey, Entry>>,
    events: broadcast::Sender<PoolEvent>,
    this: Weak<ConnectionPool>,
}

impl ConnectionPool {
    pub fn new(connector: Arc<dyn Connector>, options: ConnectOptions) -> Arc<Self> {
        let (events, _) = broadcast::channel(POOL_EVENT_CAPACITY);
        Arc::new_cyclic(|this| Self {
            connector,
            options,
            records: RwLock::new(HashMap::new()),
            events,
            this: this.clone(),
        })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PoolEvent> {
        self.events.subscribe()
    }

    /// Connection for `key`, created on first use. An existing connection is
    /// reclassified in place when `role` differs.
    pub fn get(&self, key: &NodeKey, role: NodeRole) -> NodeRecord {
        let mut guard = self.records.write();
        if let Some(entry) = guard.get_mut(key) {
            if entry.role != role {
                debug!(node = %key, from = entry.role.as_str(), to = role.as_str(), "node role changed");
                entry.role = role;
                entry.connection.set_read_only(role == NodeRole::Slave);
            }
            return entry.record();
        }

        let (connection, events) = NodeConnection::spawn(
            self.connector.clone(),
            key.clone(),
            self.options.clone(),
            role == NodeRole::Slave,
        );
        let watcher = tokio::spawn(watch_connection(
            self.this.clone(),
            key.clone(),
            connection.id(),
            events,
        ));
        let entry = Entry {
            connection,
            role,
            watcher,
        };
        let record = entry.record();
        guard.insert(key.clone(), entry);
        metrics::pool_size(guard.len());
        drop(guard);

        debug!(node = %key, role = role.as_str(), "node added to pool");
        metrics::node_event("added");
        let _ = self.events.send(PoolEvent::NodeAdded(key.clone()));
        record
    }

    pub fn get_existing(&self, key: &NodeKey) -> Option<NodeRecord> {
        self.records.read().get(key).map(Entry::record)
    }

    pub fn list(&self, filter: RoleFilter) -> Vec<NodeRecord> {
        self.records
            .read()
            .values()
            .filter(|entry| filter.matches(entry.role))
            .map(Entry::record)
            .collect()
    }

    pub fn keys(&self, filter: RoleFilter) -> Vec<NodeKey> {
        self.records
            .read()
            .iter()
            .filter(|(_, entry)| filter.matches(entry.role))
            .map(|(key, _)| key.clone())
            .collect()
    }

    /// A uniformly random record matching `filter`.
    pub fn sample(&self, filter: RoleFilter) -> Option<NodeRecord> {
        let candidates = self.list(filter);
        candidates.choose(&mut thread_rng()).cloned()
    }

    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.read().is_empty()
    }

    /// Reconcile the pool with a freshly discovered node set. Nodes absent
    /// from `nodes` are closed; a node listed as both master and slave is
    /// treated as master.
    pub fn replace_topology(&self, nodes: &[NodeDescriptor]) {
        let mut desired: HashMap<NodeKey, NodeRole> = HashMap::with_capacity(nodes.len());
        for node in nodes {
            let role = desired.entry(node.key.clone()).or_insert(node.role);
            if node.role == NodeRole::Master {
                *role = NodeRole::Master;
            }
        }

        for (key, role) in &desired {
            self.get(key, *role);
        }
        let stale: Vec<NodeKey> = self
            .records
            .read()
            .keys()
            .filter(|key| !desired.contains_key(*key))
            .cloned()
            .collect();
        for key in stale {
            self.remove(&key);
        }
        info!(nodes = self.len(), "connection pool reconciled with topology");
    }

    /// Drop `key` from the pool and close its connection.
    pub fn remove(&self, key: &NodeKey) -> Option<NodeConnection> {
        let (entry, now_empty) = {
            let mut guard = self.records.write();
            let entry = guard.remove(key)?;
            metrics::pool_size(guard.len());
            (entry, guard.is_empty())
        };
        entry.watcher.abort();
        entry.connection.close();
        self.announce_removed(key, now_empty);
        Some(entry.connection)
    }

    /// Close every connection.
    pub fn clear(&self) {
        let drained: Vec<(NodeKey, Entry)> = self.records.write().drain().collect();
        metrics::pool_size(0);
        let total = drained.len();
        for (idx, (key, entry)) in drained.into_iter().enumerate() {
            entry.watcher.abort();
            entry.connection.close();
            self.announce_removed(&key, idx + 1 == total);
        }
    }

    fn remove_ended(&self, key: &NodeKey, connection_id: u64) {
        let now_empty = {
            let mut guard = self.records.write();
            match guard.get(key) {
                Some(entry) if entry.connection.id() == connection_id => {
                    guard.remove(key);
                }
                _ => return,
            }
            metrics::pool_size(guard.len());
            guard.is_empty()
        };
        self.announce_removed(key, now_empty);
    }

    fn announce_removed(&self, key: &NodeKey, now_empty: bool) {
        debug!(node = %key, "node removed from pool");
        metrics::node_event("removed");
        let _ = self.events.send(PoolEvent::NodeRemoved(key.clone()));
        if now_empty {
            debug!("connection pool drained");
            let _ = self.events.send(PoolEvent::Drained);
        }
    }
}

async fn watch_connection(
    pool: Weak<ConnectionPool>,
    key: NodeKey,
    connection_id: u64,
    mut events: broadcast::Receiver<ConnectionEvent>,
) {
    loop {
        let event = match events.recv().await {
            Ok(event) => event,
            Err(broadcast::error::RecvError::Lagged(_)) => continue,
            Err(broadcast::error::RecvError::Closed) => break,
        };
        let Some(pool) = pool.upgrade() else { break };
        match event {
            ConnectionEvent::Ready => {}
            ConnectionEvent::Error(error) => {
                metrics::node_event("error");
                let _ = pool.events.send(PoolEvent::NodeError {
                    node: key.clone(),
                    error,
                });
            }
            ConnectionEvent::End => {
                pool.remove_ended(&key, connection_id);
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::backend::connection::testing::MockConnector;
    use crate::protocol::redis::RespValue;

    fn key(port: u16) -> NodeKey {
        NodeKey::new("127.0.0.1", port)
    }

    fn pool() -> (Arc<ConnectionPool>, Arc<MockConnector>) {
        let connector = Arc::new(MockConnector::new(|_, _| RespValue::simple("OK")));
        (
            ConnectionPool::new(connector.clone(), ConnectOptions::default()),
            connector,
        )
    }

    async fn next_event(rx: &mut broadcast::Receiver<PoolEvent>) -> PoolEvent {
        tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("pool event")
            .expect("event channel open")
    }

    #[tokio::test]
    async fn role_change_keeps_same_connection() {
        let (pool, _) = pool();
        let master = pool.get(&key(30001), NodeRole::Master);
        let slave = pool.get(&key(30001), NodeRole::Slave);
        assert_eq!(master.connection.id(), slave.connection.id());
        assert_eq!(slave.role, NodeRole::Slave);
        assert!(slave.connection.is_read_only());
        assert_eq!(pool.keys(RoleFilter::Slave), vec![key(30001)]);
        assert!(pool.keys(RoleFilter::Master).is_empty());
        assert_eq!(pool.len(), 1);
    }

    #[tokio::test]
    async fn replace_topology_prefers_master_role() {
        let (pool, _) = pool();
        pool.replace_topology(&[
            NodeDescriptor::new(key(30001), NodeRole::Slave),
            NodeDescriptor::new(key(30001), NodeRole::Master),
            NodeDescriptor::new(key(30002), NodeRole::Slave),
        ]);
        assert_eq!(pool.get_existing(&key(30001)).unwrap().role, NodeRole::Master);
        assert_eq!(pool.get_existing(&key(30002)).unwrap().role, NodeRole::Slave);
    }

    #[tokio::test]
    async fn removed_node_is_announced_once() {
        let (pool, _) = pool();
        let mut events = pool.subscribe();
        let first = [
            NodeDescriptor::new(key(30001), NodeRole::Master),
            NodeDescriptor::new(key(30002), NodeRole::Master),
            NodeDescriptor::new(key(30003), NodeRole::Master),
        ];
        pool.replace_topology(&first);
        let dropped = pool.get_existing(&key(30003)).unwrap().connection;
        pool.replace_topology(&first[..2]);

        assert!(pool.get_existing(&key(30003)).is_none());
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(dropped.is_closed());

        let mut removed = 0;
        while let Ok(event) = events.try_recv() {
            if let PoolEvent::NodeRemoved(node) = event {
                assert_eq!(node, key(30003));
                removed += 1;
            }
        }
        assert_eq!(removed, 1);
    }

    #[tokio::test]
    async fn disjoint_topology_swap_does_not_drain() {
        let (pool, _) = pool();
        pool.replace_topology(&[NodeDescriptor::new(key(30001), NodeRole::Master)]);
        let mut events = pool.subscribe();
        pool.replace_topology(&[NodeDescriptor::new(key(30002), NodeRole::Master)]);

        let mut seen = Vec::new();
        while let Ok(event) = events.try_recv() {
            seen.push(event);
        }
        assert!(!seen.iter().any(|event| matches!(event, PoolEvent::Drained)));
        assert!(matches!(seen.first(), Some(PoolEvent::NodeAdded(node)) if *node == key(30002)));
        assert!(seen
            .iter()
            .any(|event| matches!(event, PoolEvent::NodeRemoved(node) if *node == key(30001))));
        assert_eq!(pool.keys(RoleFilter::All), vec![key(30002)]);
    }

    #[tokio::test]
    async fn sample_on_empty_pool_is_none() {
        let (pool, _) = pool();
        assert!(pool.sample(RoleFilter::All).is_none());
        pool.get(&key(30001), NodeRole::Master);
        assert!(pool.sample(RoleFilter::Slave).is_none());
        assert_eq!(pool.sample(RoleFilter::Master).map(|r| r.key().clone()), Some(key(30001)));
    }

    #[tokio::test]
    async fn ended_connection_is_removed_and_pool_drains() {
        let (pool, connector) = pool();
        connector.mark_down(key(30009));
        let mut events = pool.subscribe();
        pool.get(&key(30009), NodeRole::Master);

        assert!(matches!(next_event(&mut events).await, PoolEvent::NodeAdded(_)));
        assert!(matches!(next_event(&mut events).await, PoolEvent::NodeError { .. }));
        assert!(matches!(next_event(&mut events).await, PoolEvent::NodeRemoved(_)));
        assert!(matches!(next_event(&mut events).await, PoolEvent::Drained));
        assert!(pool.is_empty());
    }

    #[tokio::test]
    async fn clear_closes_everything() {
        let (pool, _) = pool();
        let a = pool.get(&key(30001), NodeRole::Master).connection;
        let b = pool.get(&key(30002), NodeRole::Slave).connection;
        let mut events = pool.subscribe();
        pool.clear();
        assert!(pool.is_empty());
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(a.is_closed() && b.is_closed());
        let mut drained = false;
        while let Ok(event) = events.try_recv() {
            drained |= matches!(event, PoolEvent::Drained);
        }
        assert!(drained);
    }
}
