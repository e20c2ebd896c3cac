//! Peer health as seen from this node.

mod liveness;

pub use liveness::{LivenessProbe, PeerLiveness};
