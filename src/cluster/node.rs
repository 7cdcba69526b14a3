use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::ClusterError;

pub const DEFAULT_HOST: &str = "127.0.0.1";
pub const DEFAULT_PORT: u16 = 6379;

/// Canonical `host:port` identity of a node. IPv6 hosts are stored without
/// brackets, so `[::1]:6379` and `::1:6379` name the same node.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeKey {
    key: Arc<str>,
    host_len: usize,
    port: u16,
}

impl NodeKey {
    pub fn new(host: &str, port: u16) -> Self {
        let host = host.trim_start_matches('[').trim_end_matches(']');
        let host = if host.is_empty() { DEFAULT_HOST } else { host };
        Self {
            key: format!("{host}:{port}").into(),
            host_len: host.len(),
            port,
        }
    }

    /// Parse an address as it appears in seeds, redirects and NAT tables.
    ///
    /// The port is taken after the last `:`; a missing port defaults to 6379
    /// and a bare IPv6 literal (`::1`) is recognised as host-only.
    pub fn parse(address: &str) -> Option<Self> {
        let address = address.trim();
        if address.is_empty() {
            return None;
        }
        if let Some(rest) = address.strip_prefix('[') {
            let (host, tail) = rest.split_once(']')?;
            let port = match tail.strip_prefix(':') {
                Some(port) => port.parse().ok()?,
                None if tail.is_empty() => DEFAULT_PORT,
                None => return None,
            };
            return Some(Self::new(host, port));
        }
        match address.rsplit_once(':') {
            None => Some(Self::new(address, DEFAULT_PORT)),
            Some((host, _)) if host.ends_with(':') => Some(Self::new(address, DEFAULT_PORT)),
            Some((host, port)) => Some(Self::new(host, port.parse().ok()?)),
        }
    }

    pub fn host(&self) -> &str {
        &self.key[..self.host_len]
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn as_str(&self) -> &str {
        &self.key
    }

    /// Address usable with `TcpStream::connect`.
    pub fn socket_addr(&self) -> String {
        if self.host().contains(':') {
            format!("[{}]:{}", self.host(), self.port)
        } else {
            self.key.to_string()
        }
    }
}

impl fmt::Display for NodeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.key)
    }
}

impl fmt::Debug for NodeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeKey({})", self.key)
    }
}

impl FromStr for NodeKey {
    type Err = ClusterError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        NodeKey::parse(s).ok_or_else(|| ClusterError::invalid_config(format!("invalid node address '{s}'")))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NodeRole {
    Master,
    Slave,
}

impl NodeRole {
    pub fn as_str(self) -> &'static str {
        match self {
            NodeRole::Master => "master",
            NodeRole::Slave => "slave",
        }
    }
}

/// Role selector for pool listings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoleFilter {
    All,
    Master,
    Slave,
}

impl RoleFilter {
    pub fn matches(self, role: NodeRole) -> bool {
        match self {
            RoleFilter::All => true,
            RoleFilter::Master => role == NodeRole::Master,
            RoleFilter::Slave => role == NodeRole::Slave,
        }
    }
}

impl FromStr for RoleFilter {
    type Err = ClusterError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "all" => Ok(RoleFilter::All),
            "master" => Ok(RoleFilter::Master),
            "slave" => Ok(RoleFilter::Slave),
            other => Err(ClusterError::invalid_config(format!(
                "Invalid role \"{other}\". Expected \"all\", \"master\" or \"slave\""
            ))),
        }
    }
}

impl From<NodeRole> for RoleFilter {
    fn from(role: NodeRole) -> Self {
        match role {
            NodeRole::Master => RoleFilter::Master,
            NodeRole::Slave => RoleFilter::Slave,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeDescriptor {
    pub key: NodeKey,
    pub role: NodeRole,
}

impl NodeDescriptor {
    pub fn new(key: NodeKey, role: NodeRole) -> Self {
        Self { key, role }
    }
}

/// NAT table value, either `"host:port"` or `{ host, port }`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(untagged)]
pub enum NatTarget {
    Address(String),
    Endpoint { host: String, port: u16 },
}

impl NatTarget {
    fn resolve(&self) -> Option<NodeKey> {
        match self {
            NatTarget::Address(address) => NodeKey::parse(address),
            NatTarget::Endpoint { host, port } if !host.is_empty() => Some(NodeKey::new(host, *port)),
            NatTarget::Endpoint { .. } => None,
        }
    }
}

type MapperFn = dyn Fn(&NodeKey) -> Option<NodeKey> + Send + Sync;

/// Translates addresses advertised by the cluster into reachable ones.
#[derive(Clone, Default)]
pub enum NatMap {
    #[default]
    Identity,
    Table(Arc<HashMap<String, NodeKey>>),
    Mapper(Arc<MapperFn>),
}

impl NatMap {
    /// Build a static table. Entries whose target cannot be parsed are
    /// dropped, so lookups for them fall back to the advertised address.
    pub fn from_table(table: &HashMap<String, NatTarget>) -> Self {
        if table.is_empty() {
            return NatMap::Identity;
        }
        let mut entries = HashMap::with_capacity(table.len());
        for (source, target) in table {
            match target.resolve() {
                Some(key) => {
                    let source = NodeKey::parse(source)
                        .map(|key| key.as_str().to_string())
                        .unwrap_or_else(|| source.clone());
                    entries.insert(source, key);
                }
                None => warn!(source = %source, "ignoring invalid NAT mapping entry"),
            }
        }
        NatMap::Table(Arc::new(entries))
    }

    pub fn from_fn<F>(mapper: F) -> Self
    where
        F: Fn(&NodeKey) -> Option<NodeKey> + Send + Sync + 'static,
    {
        NatMap::Mapper(Arc::new(mapper))
    }

    pub fn translate(&self, key: &NodeKey) -> NodeKey {
        let mapped = match self {
            NatMap::Identity => None,
            NatMap::Table(table) => table.get(key.as_str()).cloned(),
            NatMap::Mapper(mapper) => mapper(key),
        };
        mapped.unwrap_or_else(|| key.clone())
    }
}

impl fmt::Debug for NatMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NatMap::Identity => f.write_str("NatMap::Identity"),
            NatMap::Table(table) => f.debug_tuple("NatMap::Table").field(table).finish(),
            NatMap::Mapper(_) => f.write_str("NatMap::Mapper(..)"),
        }
    }
}
