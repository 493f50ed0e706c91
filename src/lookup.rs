//! Bootstrap resolution and the pure merge/termination logic behind
//! the iterative `find_node` lookup, per `spec.md` §4.F. The stateful
//! part of the iteration (sending queries, waiting on the dispatcher,
//! folding responders into the routing table) lives on `Dht` in
//! `dht.rs`, which owns the dispatcher this module has no access to.

use std::collections::HashMap;
use std::net::{SocketAddr, SocketAddrV4, ToSocketAddrs};
use std::time::Duration;

use crate::node::{self, Node, NodeId};

/// Well-known mainline routers used to join the network when no
/// contacts are known yet.
pub const DEFAULT_BOOTSTRAP_ROUTERS: &[&str] = &[
    "router.bittorrent.com:6881",
    "router.utorrent.com:6881",
    "dht.transmissionbt.com:6881",
];

pub const PER_REQUEST_TIMEOUT: Duration = Duration::from_secs(2);
pub const BOOTSTRAP_TIMEOUT: Duration = Duration::from_secs(3);

/// `near` is kept at this width between rounds; the final result is
/// truncated further to `routing::K` by the caller.
pub const ROUND_WIDTH: usize = 16;

/// Resolves `host:port` strings to IPv4 addresses. Entries that fail
/// to resolve, or resolve only to IPv6, are dropped with a logged
/// warning rather than aborting the whole bootstrap.
pub fn resolve_bootstrap_addrs(hosts: &[String]) -> Vec<SocketAddrV4> {
    let mut out = Vec::new();
    for host in hosts {
        match host.to_socket_addrs() {
            Ok(addrs) => {
                let v4 = addrs.into_iter().find_map(|a| match a {
                    SocketAddr::V4(v4) => Some(v4),
                    SocketAddr::V6(_) => None,
                });
                match v4 {
                    Some(addr) => out.push(addr),
                    None => log::warn!("bootstrap host {host} has no IPv4 address"),
                }
            }
            Err(err) => log::warn!("failed to resolve bootstrap host {host}: {err}"),
        }
    }
    out
}

/// Unions `current` with freshly observed `responses`, dedupes by id
/// (the earlier-seen entry wins), sorts by ascending XOR distance to
/// `target`, and keeps the closest `k`. This is the pure core of
/// `spec.md` §4.F step 3c, split out so it's testable without a
/// socket.
pub fn merge_closest(target: &NodeId, current: &[Node], responses: Vec<Node>, k: usize) -> Vec<Node> {
    let mut by_id: HashMap<NodeId, Node> = HashMap::with_capacity(current.len() + responses.len());
    for n in current.iter().cloned() {
        by_id.entry(n.id).or_insert(n);
    }
    for n in responses {
        by_id.entry(n.id).or_insert(n);
    }
    let mut merged: Vec<Node> = by_id.into_values().collect();
    node::sort_by_distance(target, &mut merged);
    merged.truncate(k);
    merged
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::net::SocketAddrV4;

    fn addr() -> SocketAddrV4 {
        "127.0.0.1:6881".parse().unwrap()
    }

    #[test]
    fn merge_closest_keeps_k_nearest() {
        let target = NodeId::random();
        let current: Vec<Node> = (0..5).map(|_| Node::new(NodeId::random(), addr())).collect();
        let responses: Vec<Node> = (0..20).map(|_| Node::new(NodeId::random(), addr())).collect();
        let merged = merge_closest(&target, &current, responses, ROUND_WIDTH);
        assert!(merged.len() <= ROUND_WIDTH);
        for w in merged.windows(2) {
            assert!(w[0].id.distance(&target) <= w[1].id.distance(&target));
        }
    }

    #[test]
    fn merge_closest_dedupes_by_id() {
        let target = NodeId::random();
        let id = NodeId::random();
        let current = vec![Node::new(id, addr())];
        let responses = vec![Node::new(id, addr())];
        let merged = merge_closest(&target, &current, responses, ROUND_WIDTH);
        assert_eq!(merged.len(), 1);
    }

    #[test]
    fn merge_closest_empty_responses_keeps_current() {
        let target = NodeId::random();
        let current: Vec<Node> = (0..3).map(|_| Node::new(NodeId::random(), addr())).collect();
        let merged = merge_closest(&target, &current, Vec::new(), ROUND_WIDTH);
        assert_eq!(merged.len(), 3);
    }

    #[test]
    fn resolve_bootstrap_addrs_accepts_literal_ipv4() {
        let hosts = vec!["127.0.0.1:6881".to_string()];
        let resolved = resolve_bootstrap_addrs(&hosts);
        assert_eq!(resolved, vec![addr()]);
    }

    #[test]
    fn resolve_bootstrap_addrs_drops_unresolvable_host() {
        let hosts = vec!["this-host-does-not-resolve.invalid:6881".to_string()];
        let resolved = resolve_bootstrap_addrs(&hosts);
        assert!(resolved.is_empty());
    }
}
