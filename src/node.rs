//! The DHT data model: [`NodeId`], XOR distance, and the [`Node`] contact
//! record with its liveness state machine.

use std::fmt;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::time::{Duration, Instant};

use rand::RngCore;

pub const ID_LEN: usize = 20;
/// Compact node = 20-byte id + 4-byte ipv4 + 2-byte port.
pub const COMPACT_NODE_LEN: usize = ID_LEN + 6;
pub const COMPACT_ADDR_LEN: usize = 6;

const ACTIVE_THRESHOLD: Duration = Duration::from_secs(15 * 60);
const DEAD_THRESHOLD: Duration = Duration::from_secs(20 * 60);

/// A 160-bit opaque identifier. Equality and ordering are byte-identity;
/// XOR distance is computed separately via [`NodeId::distance`].
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NodeId([u8; ID_LEN]);

impl NodeId {
    pub fn new(bytes: [u8; ID_LEN]) -> Self {
        NodeId(bytes)
    }

    pub fn random() -> Self {
        let mut bytes = [0u8; ID_LEN];
        rand::thread_rng().fill_bytes(&mut bytes);
        NodeId(bytes)
    }

    /// A random id within the range `[self, self | (2^power - 1 masked in)]`
    /// of a bucket — used to pick a lookup target that stimulates a
    /// specific, possibly stale, bucket.
    pub fn random_in_range(range_start: &NodeId, power: u32) -> NodeId {
        let mut bytes = range_start.0;
        if power == 0 {
            return NodeId(bytes);
        }
        let mut rand_bytes = [0u8; ID_LEN];
        rand::thread_rng().fill_bytes(&mut rand_bytes);
        // The low `power` bits are randomized, the rest kept from range_start.
        let total_bits = (ID_LEN as u32) * 8;
        let fixed_bits = total_bits - power;
        for bit in fixed_bits..total_bits {
            let byte_idx = (bit / 8) as usize;
            let bit_in_byte = 7 - (bit % 8);
            let mask = 1u8 << bit_in_byte;
            let rand_bit = rand_bytes[byte_idx] & mask;
            bytes[byte_idx] = (bytes[byte_idx] & !mask) | rand_bit;
        }
        NodeId(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; ID_LEN] {
        &self.0
    }

    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        if bytes.len() != ID_LEN {
            return None;
        }
        let mut out = [0u8; ID_LEN];
        out.copy_from_slice(bytes);
        Some(NodeId(out))
    }

    pub fn from_hex(hex: &str) -> Option<Self> {
        if hex.len() != ID_LEN * 2 {
            return None;
        }
        let mut out = [0u8; ID_LEN];
        for (i, byte) in out.iter_mut().enumerate() {
            *byte = u8::from_str_radix(&hex[i * 2..i * 2 + 2], 16).ok()?;
        }
        Some(NodeId(out))
    }

    pub fn to_hex(&self) -> String {
        use fmt::Write;
        let mut s = String::with_capacity(ID_LEN * 2);
        for b in &self.0 {
            write!(s, "{b:02x}").unwrap();
        }
        s
    }

    /// XOR distance, interpreted as a big-endian 160-bit unsigned integer.
    pub fn distance(&self, other: &NodeId) -> Distance {
        let mut out = [0u8; ID_LEN];
        for i in 0..ID_LEN {
            out[i] = self.0[i] ^ other.0[i];
        }
        Distance(out)
    }

    /// Index of the highest differing bit between `self` and `other`,
    /// counted from the most significant bit (0-based). `None` if equal.
    pub fn diverging_bit(&self, other: &NodeId) -> Option<u32> {
        let dist = self.distance(other);
        for (byte_idx, byte) in dist.0.iter().enumerate() {
            if *byte != 0 {
                let bit_in_byte = byte.leading_zeros();
                return Some((byte_idx as u32) * 8 + bit_in_byte);
            }
        }
        None
    }

    /// The value of bit `index` (0 = most significant bit of byte 0).
    pub fn bit(&self, index: u32) -> bool {
        let byte_idx = (index / 8) as usize;
        let bit_in_byte = 7 - (index % 8);
        (self.0[byte_idx] >> bit_in_byte) & 1 == 1
    }

    pub fn with_bit_set(&self, index: u32, value: bool) -> NodeId {
        let mut bytes = self.0;
        let byte_idx = (index / 8) as usize;
        let bit_in_byte = 7 - (index % 8);
        let mask = 1u8 << bit_in_byte;
        if value {
            bytes[byte_idx] |= mask;
        } else {
            bytes[byte_idx] &= !mask;
        }
        NodeId(bytes)
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeId({})", self.to_hex())
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

/// The XOR distance between two [`NodeId`]s, as a 160-bit big-endian
/// unsigned integer. Ordered lexicographically, which is the correct
/// ordering for a big-endian unsigned integer.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Distance([u8; ID_LEN]);

impl Distance {
    pub const ZERO: Distance = Distance([0u8; ID_LEN]);
    pub const MAX: Distance = Distance([0xffu8; ID_LEN]);

    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; ID_LEN]
    }
}

impl fmt::Debug for Distance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        use fmt::Write;
        let mut s = String::with_capacity(ID_LEN * 2);
        for b in &self.0 {
            write!(s, "{b:02x}").unwrap();
        }
        write!(f, "Distance({s})")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContactState {
    Active,
    Inactive,
    Dead,
}

/// A known peer contact: id, address, and last-observed liveness.
#[derive(Clone)]
pub struct Node {
    pub id: NodeId,
    pub addr: SocketAddrV4,
    pub last_seen: Instant,
}

impl Node {
    pub fn new(id: NodeId, addr: SocketAddrV4) -> Self {
        Node {
            id,
            addr,
            last_seen: Instant::now(),
        }
    }

    pub fn touch(&mut self) {
        self.last_seen = Instant::now();
    }

    pub fn state(&self, now: Instant) -> ContactState {
        let age = now.saturating_duration_since(self.last_seen);
        if age < ACTIVE_THRESHOLD {
            ContactState::Active
        } else if age < DEAD_THRESHOLD {
            ContactState::Inactive
        } else {
            ContactState::Dead
        }
    }

    pub fn compact(&self) -> [u8; COMPACT_NODE_LEN] {
        let mut out = [0u8; COMPACT_NODE_LEN];
        out[..ID_LEN].copy_from_slice(self.id.as_bytes());
        out[ID_LEN..].copy_from_slice(&compact_address(&self.addr));
        out
    }

    pub fn from_compact(bytes: &[u8]) -> Option<Node> {
        if bytes.len() != COMPACT_NODE_LEN {
            return None;
        }
        let id = NodeId::from_slice(&bytes[..ID_LEN])?;
        let addr = decompact_address(&bytes[ID_LEN..])?;
        Some(Node::new(id, addr))
    }
}

impl fmt::Debug for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Node")
            .field("id", &self.id)
            .field("addr", &self.addr)
            .finish()
    }
}

pub fn compact_address(addr: &SocketAddrV4) -> [u8; COMPACT_ADDR_LEN] {
    let mut out = [0u8; COMPACT_ADDR_LEN];
    out[..4].copy_from_slice(&addr.ip().octets());
    out[4..].copy_from_slice(&addr.port().to_be_bytes());
    out
}

pub fn decompact_address(bytes: &[u8]) -> Option<SocketAddrV4> {
    if bytes.len() != COMPACT_ADDR_LEN {
        return None;
    }
    let ip = Ipv4Addr::new(bytes[0], bytes[1], bytes[2], bytes[3]);
    let port = u16::from_be_bytes([bytes[4], bytes[5]]);
    Some(SocketAddrV4::new(ip, port))
}

/// Concatenates up to `limit` contacts into their compact 26-byte form,
/// per `spec.md` §4.B / §6 (used for `find_node_response.nodes`).
pub fn compact_node_list(nodes: &[Node], limit: usize) -> Vec<u8> {
    let mut out = Vec::with_capacity(nodes.len().min(limit) * COMPACT_NODE_LEN);
    for node in nodes.iter().take(limit) {
        out.extend_from_slice(&node.compact());
    }
    out
}

/// Parses a concatenation of compact nodes, skipping any trailing
/// partial record.
pub fn parse_compact_nodes(bytes: &[u8]) -> Vec<Node> {
    bytes
        .chunks(COMPACT_NODE_LEN)
        .filter(|c| c.len() == COMPACT_NODE_LEN)
        .filter_map(Node::from_compact)
        .collect()
}

/// Sorts `nodes` by ascending XOR distance to `target`. Stable: equal
/// distances keep their relative input order.
pub fn sort_by_distance(target: &NodeId, nodes: &mut [Node]) {
    nodes.sort_by_key(|n| n.id.distance(target));
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn distance_identity_and_symmetry() {
        let a = NodeId::random();
        let b = NodeId::random();
        assert!(a.distance(&a).is_zero());
        assert_eq!(a.distance(&b).0, b.distance(&a).0);
    }

    #[test]
    fn distance_triangle_inequality() {
        // distance(a, c) <= distance(a, b) XOR distance(b, c), compared
        // as 160-bit big-endian unsigned integers (i.e. bytewise, since
        // that ordering agrees with numeric ordering for fixed width).
        for _ in 0..50 {
            let a = NodeId::random();
            let b = NodeId::random();
            let c = NodeId::random();
            let ac = a.distance(&c);
            let ab = a.distance(&b);
            let bc = b.distance(&c);
            let mut xord = [0u8; ID_LEN];
            for i in 0..ID_LEN {
                xord[i] = ab.0[i] ^ bc.0[i];
            }
            assert!(ac.0 <= xord);
        }
    }

    #[test]
    fn compact_round_trip() {
        let node = Node::new(NodeId::random(), "127.0.0.1:6881".parse().unwrap());
        let compact = node.compact();
        assert_eq!(compact.len(), COMPACT_NODE_LEN);
        let back = Node::from_compact(&compact).unwrap();
        assert_eq!(back.id, node.id);
        assert_eq!(back.addr, node.addr);
    }

    #[test]
    fn sort_by_distance_is_monotone() {
        let target = NodeId::random();
        let mut nodes: Vec<Node> = (0..10)
            .map(|_| Node::new(NodeId::random(), "127.0.0.1:6881".parse().unwrap()))
            .collect();
        sort_by_distance(&target, &mut nodes);
        for w in nodes.windows(2) {
            assert!(w[0].id.distance(&target) <= w[1].id.distance(&target));
        }
    }

    #[test]
    fn diverging_bit_matches_bit_accessor() {
        let a = NodeId::new([0u8; ID_LEN]);
        let mut raw = [0u8; ID_LEN];
        raw[0] = 0b0010_0000;
        let b = NodeId::new(raw);
        assert_eq!(a.diverging_bit(&b), Some(2));
        assert_eq!(a.bit(2), false);
        assert_eq!(b.bit(2), true);
    }

    #[test]
    fn hex_round_trip() {
        let id = NodeId::random();
        let hex = id.to_hex();
        assert_eq!(NodeId::from_hex(&hex), Some(id));
    }
}
