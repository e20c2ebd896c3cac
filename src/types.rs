//! Core types used throughout the cluster metadata subsystem.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::str::FromStr;
use twox_hash::XxHash64;

/// Node identifier assigned by the metadata log when a node registers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NodeId(pub u32);

impl NodeId {
    /// Returns the raw id.
    pub fn id(self) -> u32 {
        self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for NodeId {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.trim().parse::<u32>().map(NodeId)
    }
}

/// Version of a cluster metadata snapshot.
///
/// Every accepted transformation produces a snapshot at the next epoch, so the
/// epoch is a total order over the cluster's topology history.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct Epoch(pub u64);

impl Epoch {
    /// Epoch of the empty snapshot, before anything was committed.
    pub const EMPTY: Epoch = Epoch(0);
    /// Epoch of the first committed transformation.
    pub const FIRST: Epoch = Epoch(1);

    /// The epoch following this one.
    pub fn next(self) -> Epoch {
        Epoch(self.0 + 1)
    }

    /// Whether this epoch is strictly after `other`.
    pub fn is_after(self, other: Epoch) -> bool {
        self.0 > other.0
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for Epoch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Epoch({})", self.0)
    }
}

/// A position on the token ring.
///
/// The ring spans the full `i64` range. `Token::MIN` is the ring minimum: it
/// marks the wrap-around point and is never assigned to a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Token(pub i64);

/// Number of positions on the ring, as a float.
const RING_SIZE: f64 = 18_446_744_073_709_551_616.0; // 2^64

impl Token {
    /// The ring minimum.
    pub const MIN: Token = Token(i64::MIN);

    /// Hash an arbitrary key onto the ring.
    pub fn for_key(key: &[u8]) -> Token {
        let mut hasher = XxHash64::with_seed(0);
        key.hash(&mut hasher);
        let token = hasher.finish() as i64;
        if token == i64::MIN {
            Token(i64::MAX)
        } else {
            Token(token)
        }
    }

    pub fn value(self) -> i64 {
        self.0
    }

    /// Fraction of the ring covered by the range `(self, next]`.
    ///
    /// A range from a token to itself covers the whole ring.
    pub fn size(self, next: Token) -> f64 {
        let distance = next.0.wrapping_sub(self.0) as u64;
        if distance == 0 {
            1.0
        } else {
            distance as f64 / RING_SIZE
        }
    }

    /// Token halfway along the range `(self, next]`, wrapping around the ring.
    pub fn midpoint(self, next: Token) -> Token {
        let distance = next.0.wrapping_sub(self.0) as u64;
        let half = if distance == 0 { u64::MAX / 2 + 1 } else { distance / 2 };
        let mid = self.0.wrapping_add(half as i64);
        if mid == i64::MIN {
            Token(i64::MIN + 1)
        } else {
            Token(mid)
        }
    }

    /// Next position a node may own, skipping the ring minimum.
    pub fn next_valid(self) -> Token {
        match self.0.checked_add(1) {
            Some(v) => Token(v),
            None => Token(i64::MIN + 1),
        }
    }

    /// Whether a node may own this position.
    pub fn is_valid(self) -> bool {
        self != Token::MIN
    }
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for Token {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.trim().parse::<i64>().map(Token)
    }
}

/// Physical placement of a node.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Location {
    pub datacenter: String,
    pub rack: String,
}

impl Location {
    pub fn new(datacenter: impl Into<String>, rack: impl Into<String>) -> Self {
        Self {
            datacenter: datacenter.into(),
            rack: rack.into(),
        }
    }
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.datacenter, self.rack)
    }
}

/// Lifecycle state of a node as recorded in the metadata directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NodeState {
    /// Known to the cluster, owns no tokens yet.
    Registered,
    /// Joining the ring (or replacing another node).
    Bootstrapping,
    /// Full ring member.
    Joined,
    /// Moving to new tokens.
    Moving,
    /// Being decommissioned or removed.
    Leaving,
    /// Removed from the ring.
    Left,
}

impl NodeState {
    /// Whether the node currently participates in the token ring.
    pub fn is_ring_member(&self) -> bool {
        matches!(self, NodeState::Joined | NodeState::Moving | NodeState::Leaving)
    }
}

impl fmt::Display for NodeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeState::Registered => write!(f, "REGISTERED"),
            NodeState::Bootstrapping => write!(f, "BOOTSTRAPPING"),
            NodeState::Joined => write!(f, "JOINED"),
            NodeState::Moving => write!(f, "MOVING"),
            NodeState::Leaving => write!(f, "LEAVING"),
            NodeState::Left => write!(f, "LEFT"),
        }
    }
}
