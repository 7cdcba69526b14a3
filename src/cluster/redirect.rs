use crate::protocol::redis::RespValue;

use super::node::{NatMap, NodeKey};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Redirect {
    /// The slot permanently lives elsewhere.
    Moved { slot: u16, node: NodeKey },
    /// The slot is migrating; retry once at `node` after `ASKING`.
    Ask { slot: u16, node: NodeKey },
}

impl Redirect {
    pub fn node(&self) -> &NodeKey {
        match self {
            Redirect::Moved { node, .. } | Redirect::Ask { node, .. } => node,
        }
    }

    pub fn slot(&self) -> u16 {
        match self {
            Redirect::Moved { slot, .. } | Redirect::Ask { slot, .. } => *slot,
        }
    }

    /// Rewrite the target the way addresses learned from topology are.
    pub fn translate(self, nat: &NatMap) -> Self {
        match self {
            Redirect::Moved { slot, node } => Redirect::Moved { slot, node: nat.translate(&node) },
            Redirect::Ask { slot, node } => Redirect::Ask { slot, node: nat.translate(&node) },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryKind {
    TryAgain,
    ClusterDown,
    Loading,
}

/// A node reply sorted by what the dispatcher should do next.
#[derive(Debug, Clone, PartialEq)]
pub enum ReplyClass {
    Done(RespValue),
    Redirect(Redirect),
    Retry { kind: RetryKind, message: String },
    Rejected(String),
}

/// Parse `MOVED <slot> <addr>` / `ASK <slot> <addr>`. An address with an
/// empty host (`:6379`) refers to the host of `origin`.
pub fn parse_redirect(message: &str, origin: &NodeKey) -> Option<Redirect> {
    let mut parts = message.split_whitespace();
    let kind = parts.next()?;
    if kind != "MOVED" && kind != "ASK" {
        return None;
    }
    let slot = parts.next()?.parse::<u16>().ok()?;
    let address = parts.next()?;
    let node = if let Some(port) = address.strip_prefix(':').filter(|rest| !rest.contains(':')) {
        NodeKey::new(origin.host(), port.parse().ok()?)
    } else {
        NodeKey::parse(address)?
    };
    Some(if kind == "MOVED" {
        Redirect::Moved { slot, node }
    } else {
        Redirect::Ask { slot, node }
    })
}

pub fn classify(reply: RespValue, origin: &NodeKey) -> ReplyClass {
    let message = match reply.error_message() {
        Some(message) => message,
        None => return ReplyClass::Done(reply),
    };
    if let Some(redirect) = parse_redirect(&message, origin) {
        return ReplyClass::Redirect(redirect);
    }
    let prefix = message.split_whitespace().next().unwrap_or_default();
    let kind = match prefix {
        "TRYAGAIN" => RetryKind::TryAgain,
        "CLUSTERDOWN" => RetryKind::ClusterDown,
        "LOADING" => RetryKind::Loading,
        _ => return ReplyClass::Rejected(message),
    };
    ReplyClass::Retry { kind, message }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn origin() -> NodeKey {
        NodeKey::new("10.0.0.5", 30001)
    }

    #[test]
    fn parse_moved_redirect() {
        let redirect = parse_redirect("MOVED 3999 127.0.0.1:6381", &origin()).unwrap();
        assert_eq!(
            redirect,
            Redirect::Moved { slot: 3999, node: NodeKey::new("127.0.0.1", 6381) }
        );
    }

    #[test]
    fn parse_ask_redirect() {
        let redirect = parse_redirect("ASK 3999 10.0.0.1:6381", &origin()).unwrap();
        assert_eq!(redirect, Redirect::Ask { slot: 3999, node: NodeKey::new("10.0.0.1", 6381) });
    }

    #[test]
    fn parse_ipv6_redirect() {
        let redirect = parse_redirect("MOVED 12 ::1:30002", &origin()).unwrap();
        assert_eq!(redirect.node(), &NodeKey::new("::1", 30002));
        let redirect = parse_redirect("ASK 12 [fe80::1]:30002", &origin()).unwrap();
        assert_eq!(redirect.node().host(), "fe80::1");
    }

    #[test]
    fn empty_host_uses_origin() {
        let redirect = parse_redirect("MOVED 7 :30009", &origin()).unwrap();
        assert_eq!(redirect.node(), &NodeKey::new("10.0.0.5", 30009));
        assert_eq!(redirect.slot(), 7);
    }

    #[test]
    fn redirect_target_goes_through_nat() {
        let nat = NatMap::from_fn(|key| {
            (key == &NodeKey::new("10.0.0.2", 30002)).then(|| NodeKey::new("127.0.0.1", 30002))
        });
        let moved = parse_redirect("MOVED 12182 10.0.0.2:30002", &origin()).unwrap();
        assert_eq!(
            moved.translate(&nat),
            Redirect::Moved { slot: 12182, node: NodeKey::new("127.0.0.1", 30002) }
        );
        let ask = parse_redirect("ASK 5 10.0.0.3:30003", &origin()).unwrap();
        assert_eq!(ask.translate(&nat).node(), &NodeKey::new("10.0.0.3", 30003));
    }

    #[test]
    fn malformed_redirects_are_not_redirects() {
        assert!(parse_redirect("MOVED", &origin()).is_none());
        assert!(parse_redirect("MOVED abc 1.1.1.1:1", &origin()).is_none());
        assert!(parse_redirect("ERR MOVED 1 1.1.1.1:1", &origin()).is_none());
    }

    #[test]
    fn classify_sorts_replies() {
        assert_eq!(
            classify(RespValue::bulk("v"), &origin()),
            ReplyClass::Done(RespValue::bulk("v"))
        );
        assert!(matches!(
            classify(RespValue::error("MOVED 1 127.0.0.1:1"), &origin()),
            ReplyClass::Redirect(Redirect::Moved { .. })
        ));
        assert!(matches!(
            classify(RespValue::error("TRYAGAIN Multiple keys request during rehashing"), &origin()),
            ReplyClass::Retry { kind: RetryKind::TryAgain, .. }
        ));
        assert!(matches!(
            classify(RespValue::error("CLUSTERDOWN The cluster is down"), &origin()),
            ReplyClass::Retry { kind: RetryKind::ClusterDown, .. }
        ));
        assert_eq!(
            classify(RespValue::error("WRONGTYPE bad"), &origin()),
            ReplyClass::Rejected("WRONGTYPE bad".into())
        );
    }
}
