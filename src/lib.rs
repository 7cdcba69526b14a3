//! Cluster topology and redirection engine for a sharded Redis cluster.
//!
//! [`ClusterClient`] routes each command to the node owning its hash slot,
//! follows `MOVED`/`ASK` redirections, coalesces topology refreshes and keeps
//! a pool of node connections in step with the discovered layout.

pub mod backend;
pub mod cluster;
pub mod config;
pub mod error;
pub mod metrics;
pub mod protocol;
pub mod sentinel;
pub mod utils;

pub use cluster::node::{NodeKey, NodeRole, RoleFilter};
pub use cluster::{ClientStatus, ClusterClient, ClusterEvent};
pub use config::{ClusterOptions, ScaleReads};
pub use error::ClusterError;
pub use protocol::redis::{Command, RespValue};
