use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

use crate::cluster::node::NodeKey;

/// Errors surfaced to callers of the cluster client.
///
/// The type is `Clone` so one topology refresh outcome can be handed to
/// every command waiting on it.
#[derive(Debug, Clone, Error)]
pub enum ClusterError {
    #[error("node {node} unreachable: {reason}")]
    NodeUnreachable { node: NodeKey, reason: Arc<str> },

    #[error(
        "too many cluster redirections ({attempts} attempts), last error from {}: {last_error}",
        display_node(.last_node)
    )]
    RedirectionLimitExceeded {
        attempts: usize,
        last_node: Option<NodeKey>,
        last_error: Arc<str>,
    },

    #[error("failed to refresh slots cache, last error from {}: {last_error}", display_node(.last_node))]
    TopologyRefreshFailed {
        last_node: Option<NodeKey>,
        last_error: Arc<str>,
    },

    #[error("invalid configuration: {0}")]
    InvalidConfiguration(Arc<str>),

    #[error("{message}")]
    CommandRejectedByNode { node: NodeKey, message: Arc<str> },

    #[error("command timed out after {0:?}")]
    CommandTimeout(Duration),

    #[error("no {0} node available")]
    NoAvailableNode(&'static str),

    #[error("connection is closed")]
    ConnectionClosed,
}

impl ClusterError {
    pub fn invalid_config(message: impl Into<String>) -> Self {
        ClusterError::InvalidConfiguration(message.into().into())
    }

    /// Stable label for metrics and logs.
    pub fn kind(&self) -> &'static str {
        match self {
            ClusterError::NodeUnreachable { .. } => "node_unreachable",
            ClusterError::RedirectionLimitExceeded { .. } => "redirection_limit",
            ClusterError::TopologyRefreshFailed { .. } => "refresh_failed",
            ClusterError::InvalidConfiguration(_) => "invalid_configuration",
            ClusterError::CommandRejectedByNode { .. } => "rejected",
            ClusterError::CommandTimeout(_) => "timeout",
            ClusterError::NoAvailableNode(_) => "no_node",
            ClusterError::ConnectionClosed => "closed",
        }
    }

    /// The last node consulted, when one is known.
    pub fn node(&self) -> Option<&NodeKey> {
        match self {
            ClusterError::NodeUnreachable { node, .. }
            | ClusterError::CommandRejectedByNode { node, .. } => Some(node),
            ClusterError::RedirectionLimitExceeded { last_node, .. }
            | ClusterError::TopologyRefreshFailed { last_node, .. } => last_node.as_ref(),
            _ => None,
        }
    }
}

fn display_node(node: &Option<NodeKey>) -> String {
    match node {
        Some(node) => node.to_string(),
        None => "<none>".to_string(),
    }
}
