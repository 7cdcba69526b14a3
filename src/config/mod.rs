use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use tokio::fs;

use crate::backend::connection::ConnectOptions;
use crate::cluster::node::{NatMap, NatTarget, NodeKey};
use crate::error::ClusterError;

fn default_max_redirections() -> usize {
    16
}

fn default_retry_delay_on_failover() -> u64 {
    100
}

fn default_retry_delay_on_try_again() -> u64 {
    100
}

fn default_retry_delay_on_cluster_down() -> u64 {
    100
}

fn default_refresh_cooldown() -> u64 {
    100
}

fn default_slots_refresh_timeout() -> u64 {
    1_000
}

fn default_connect_timeout() -> u64 {
    10_000
}

/// Read distribution policy for read-only commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ScaleReads {
    #[default]
    Master,
    Slave,
    All,
    /// Replicas in the client's zone, then any replica, then the master.
    AzAffinity,
    /// Replicas in the client's zone, then any replica, then the master
    /// (a master in the client's zone first).
    AzAffinityReplicasAndPrimary,
}

impl ScaleReads {
    pub fn as_str(self) -> &'static str {
        match self {
            ScaleReads::Master => "master",
            ScaleReads::Slave => "slave",
            ScaleReads::All => "all",
            ScaleReads::AzAffinity => "az_affinity",
            ScaleReads::AzAffinityReplicasAndPrimary => "az_affinity_replicas_and_primary",
        }
    }

    pub fn needs_zone(self) -> bool {
        matches!(
            self,
            ScaleReads::AzAffinity | ScaleReads::AzAffinityReplicasAndPrimary
        )
    }
}

impl FromStr for ScaleReads {
    type Err = ClusterError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "master" | "master-only" => Ok(ScaleReads::Master),
            "slave" | "uniform-replica" => Ok(ScaleReads::Slave),
            "all" | "uniform-all" => Ok(ScaleReads::All),
            "az_affinity" | "AZAffinity" | "az-affinity-replica-only" => Ok(ScaleReads::AzAffinity),
            "az_affinity_replicas_and_primary"
            | "AZAffinityReplicasAndPrimary"
            | "az-affinity-replica-then-master" => Ok(ScaleReads::AzAffinityReplicasAndPrimary),
            other => Err(ClusterError::invalid_config(format!(
                "Invalid option scaleReads \"{other}\". Expected \"all\", \"master\", \"slave\", \"AZAffinity\" or \"AZAffinityReplicasAndPrimary\""
            ))),
        }
    }
}

impl fmt::Display for ScaleReads {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for ScaleReads {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for ScaleReads {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// Options recognised by the cluster client. Durations are milliseconds.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ClusterOptions {
    #[serde(default)]
    pub seeds: Vec<String>,
    #[serde(default = "default_max_redirections")]
    pub max_redirections: usize,
    #[serde(default = "default_retry_delay_on_failover")]
    pub retry_delay_on_failover: u64,
    #[serde(default)]
    pub retry_delay_on_moved: u64,
    #[serde(default = "default_retry_delay_on_try_again")]
    pub retry_delay_on_try_again: u64,
    #[serde(default = "default_retry_delay_on_cluster_down")]
    pub retry_delay_on_cluster_down: u64,
    /// Coalescing window for topology refresh requests.
    #[serde(default = "default_refresh_cooldown")]
    pub refresh_cooldown: u64,
    #[serde(default)]
    pub scale_reads: ScaleReads,
    #[serde(default)]
    pub client_az: Option<String>,
    #[serde(default)]
    pub nat_map: HashMap<String, NatTarget>,
    #[serde(default)]
    pub slots_refresh_interval: Option<u64>,
    #[serde(default = "default_slots_refresh_timeout")]
    pub slots_refresh_timeout: u64,
    #[serde(default)]
    pub command_timeout: Option<u64>,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout: u64,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    /// Monitor nodes watched for `+switch-master`. Empty disables detection.
    #[serde(default)]
    pub sentinels: Vec<String>,
    #[serde(skip)]
    pub nat_mapper: Option<NatMap>,
}

impl Default for ClusterOptions {
    fn default() -> Self {
        Self {
            seeds: Vec::new(),
            max_redirections: default_max_redirections(),
            retry_delay_on_failover: default_retry_delay_on_failover(),
            retry_delay_on_moved: 0,
            retry_delay_on_try_again: default_retry_delay_on_try_again(),
            retry_delay_on_cluster_down: default_retry_delay_on_cluster_down(),
            refresh_cooldown: default_refresh_cooldown(),
            scale_reads: ScaleReads::default(),
            client_az: None,
            nat_map: HashMap::new(),
            slots_refresh_interval: None,
            slots_refresh_timeout: default_slots_refresh_timeout(),
            command_timeout: None,
            connect_timeout: default_connect_timeout(),
            username: None,
            password: None,
            sentinels: Vec::new(),
            nat_mapper: None,
        }
    }
}

impl ClusterOptions {
    pub fn with_seeds<I, S>(seeds: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            seeds: seeds.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }

    /// Load options from a TOML file.
    pub async fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path)
            .await
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        let options: ClusterOptions = toml::from_str(&raw)
            .with_context(|| format!("failed to parse config file {}", path.display()))?;
        options.ensure_valid()?;
        Ok(options)
    }

    /// Install a NAT mapping function; it takes precedence over `nat_map`.
    pub fn with_nat_mapper<F>(mut self, mapper: F) -> Self
    where
        F: Fn(&NodeKey) -> Option<NodeKey> + Send + Sync + 'static,
    {
        self.nat_mapper = Some(NatMap::from_fn(mapper));
        self
    }

    pub fn ensure_valid(&self) -> Result<(), ClusterError> {
        if self.seeds.is_empty() {
            return Err(ClusterError::invalid_config("at least one seed node is required"));
        }
        self.seed_keys()?;
        self.sentinel_keys()?;
        if self.scale_reads.needs_zone()
            && self.client_az.as_deref().map_or(true, str::is_empty)
        {
            return Err(ClusterError::invalid_config(format!(
                "scale_reads {} requires client_az",
                self.scale_reads
            )));
        }
        if self.slots_refresh_timeout == 0 {
            return Err(ClusterError::invalid_config("slots_refresh_timeout must be > 0"));
        }
        if self.connect_timeout == 0 {
            return Err(ClusterError::invalid_config("connect_timeout must be > 0"));
        }
        if self.slots_refresh_interval == Some(0) {
            return Err(ClusterError::invalid_config("slots_refresh_interval must be > 0"));
        }
        if self.command_timeout == Some(0) {
            return Err(ClusterError::invalid_config("command_timeout must be > 0"));
        }
        Ok(())
    }

    pub fn seed_keys(&self) -> Result<Vec<NodeKey>, ClusterError> {
        self.seeds.iter().map(|seed| seed.parse()).collect()
    }

    pub fn sentinel_keys(&self) -> Result<Vec<NodeKey>, ClusterError> {
        self.sentinels.iter().map(|node| node.parse()).collect()
    }

    pub fn nat(&self) -> NatMap {
        match &self.nat_mapper {
            Some(mapper) => mapper.clone(),
            None => NatMap::from_table(&self.nat_map),
        }
    }

    pub fn connect_options(&self) -> ConnectOptions {
        ConnectOptions {
            connect_timeout: Duration::from_millis(self.connect_timeout),
            username: self.username.clone(),
            password: self.password.clone(),
            learn_zone: self.scale_reads.needs_zone(),
        }
    }

    pub fn retry_delay_on_failover(&self) -> Duration {
        Duration::from_millis(self.retry_delay_on_failover)
    }

    pub fn retry_delay_on_moved(&self) -> Duration {
        Duration::from_millis(self.retry_delay_on_moved)
    }

    pub fn retry_delay_on_try_again(&self) -> Duration {
        Duration::from_millis(self.retry_delay_on_try_again)
    }

    pub fn retry_delay_on_cluster_down(&self) -> Duration {
        Duration::from_millis(self.retry_delay_on_cluster_down)
    }

    pub fn refresh_cooldown(&self) -> Duration {
        Duration::from_millis(self.refresh_cooldown)
    }

    pub fn slots_refresh_timeout(&self) -> Duration {
        Duration::from_millis(self.slots_refresh_timeout)
    }

    pub fn slots_refresh_interval(&self) -> Option<Duration> {
        self.slots_refresh_interval.map(Duration::from_millis)
    }

    pub fn command_timeout(&self) -> Option<Duration> {
        self.command_timeout.map(Duration::from_millis)
    }
}
