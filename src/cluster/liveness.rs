//! Best-effort peer liveness.
//!
//! Health is fed in by whatever failure detector the node runs (heartbeats,
//! request outcomes). Reads never block on the network: a liveness check is a
//! lookup in the last known state, so it cannot be stalled by the same
//! failure it is asked about.

use crate::types::NodeId;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::time::Instant;
use tracing::{info, warn};

/// Non-blocking liveness check.
pub trait LivenessProbe: Send + Sync + std::fmt::Debug {
    /// Whether the node is currently believed to be alive.
    fn is_alive(&self, node_id: NodeId) -> bool;
}

#[derive(Debug, Clone)]
struct PeerHealth {
    last_seen: Instant,
    failed_checks: usize,
    is_alive: bool,
}

impl PeerHealth {
    fn new() -> Self {
        Self {
            last_seen: Instant::now(),
            failed_checks: 0,
            is_alive: true,
        }
    }

    fn mark_seen(&mut self) {
        self.last_seen = Instant::now();
        self.failed_checks = 0;
        self.is_alive = true;
    }
}

/// Liveness registry driven by health check results.
///
/// A peer is declared down after `failure_confirmations` consecutive failed
/// checks and up again on the next successful one. Unknown peers are down.
#[derive(Debug)]
pub struct PeerLiveness {
    local: NodeId,
    failure_confirmations: usize,
    peers: RwLock<HashMap<NodeId, PeerHealth>>,
}

impl PeerLiveness {
    pub fn new(local: NodeId, failure_confirmations: usize) -> Self {
        Self {
            local,
            failure_confirmations: failure_confirmations.max(1),
            peers: RwLock::new(HashMap::new()),
        }
    }

    /// Record a successful check or any message received from the peer.
    pub fn handle_alive(&self, node_id: NodeId) {
        let mut peers = self.peers.write();
        let health = peers.entry(node_id).or_insert_with(PeerHealth::new);
        if !health.is_alive {
            info!(node_id = %node_id, "Peer recovered");
        }
        health.mark_seen();
    }

    /// Record a failed check.
    pub fn handle_failed_check(&self, node_id: NodeId) {
        let mut peers = self.peers.write();
        if let Some(health) = peers.get_mut(&node_id) {
            health.failed_checks += 1;
            if health.failed_checks >= self.failure_confirmations && health.is_alive {
                health.is_alive = false;
                warn!(
                    node_id = %node_id,
                    failed_checks = health.failed_checks,
                    "Peer confirmed down"
                );
            }
        }
    }

    /// Mark a peer down immediately, e.g. after an explicit shutdown notice.
    pub fn mark_down(&self, node_id: NodeId) {
        if let Some(health) = self.peers.write().get_mut(&node_id) {
            health.is_alive = false;
        }
    }

    /// Time since the peer was last seen alive.
    pub fn last_seen(&self, node_id: NodeId) -> Option<std::time::Duration> {
        self.peers
            .read()
            .get(&node_id)
            .map(|h| h.last_seen.elapsed())
    }

    /// Peers currently considered alive.
    pub fn live_peers(&self) -> Vec<NodeId> {
        let mut live: Vec<NodeId> = self
            .peers
            .read()
            .iter()
            .filter(|(_, h)| h.is_alive)
            .map(|(id, _)| *id)
            .collect();
        live.sort();
        live
    }
}

impl LivenessProbe for PeerLiveness {
    fn is_alive(&self, node_id: NodeId) -> bool {
        if node_id == self.local {
            return true;
        }
        self.peers
            .read()
            .get(&node_id)
            .map(|h| h.is_alive)
            .unwrap_or(false)
    }
}
