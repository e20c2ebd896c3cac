//! State kept by the local process about itself and the sequences it drives.

use super::{OperationKind, Step};
use crate::types::NodeId;
use parking_lot::RwLock;
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::info;

/// Operational mode of the local node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperationMode {
    Starting,
    Joining,
    JoinFailed,
    Normal,
    Leaving,
    Decommissioned,
    DecommissionFailed,
    Moving,
    MoveFailed,
}

impl OperationMode {
    /// Mode while an operation of `kind` runs on the local node.
    pub fn running(kind: OperationKind) -> Self {
        match kind {
            OperationKind::Join | OperationKind::Replace => OperationMode::Joining,
            OperationKind::Leave | OperationKind::Remove => OperationMode::Leaving,
            OperationKind::Move => OperationMode::Moving,
        }
    }

    /// Mode after an operation of `kind` failed on the local node.
    pub fn failed(kind: OperationKind) -> Self {
        match kind {
            OperationKind::Join | OperationKind::Replace => OperationMode::JoinFailed,
            OperationKind::Leave | OperationKind::Remove => OperationMode::DecommissionFailed,
            OperationKind::Move => OperationMode::MoveFailed,
        }
    }

    /// Mode after an operation of `kind` finished on the local node.
    pub fn finished(kind: OperationKind) -> Self {
        match kind {
            OperationKind::Leave | OperationKind::Remove => OperationMode::Decommissioned,
            _ => OperationMode::Normal,
        }
    }

    /// Mode after an operation of `kind` was cancelled on the local node.
    pub fn cancelled(kind: OperationKind) -> Self {
        match kind {
            OperationKind::Join | OperationKind::Replace => OperationMode::Starting,
            _ => OperationMode::Normal,
        }
    }

    pub fn is_failed(&self) -> bool {
        matches!(
            self,
            OperationMode::JoinFailed | OperationMode::DecommissionFailed | OperationMode::MoveFailed
        )
    }
}

impl fmt::Display for OperationMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            OperationMode::Starting => "STARTING",
            OperationMode::Joining => "JOINING",
            OperationMode::JoinFailed => "JOINING_FAILED",
            OperationMode::Normal => "NORMAL",
            OperationMode::Leaving => "LEAVING",
            OperationMode::Decommissioned => "DECOMMISSIONED",
            OperationMode::DecommissionFailed => "DECOMMISSION_FAILED",
            OperationMode::Moving => "MOVING",
            OperationMode::MoveFailed => "MOVE_FAILED",
        };
        write!(f, "{}", s)
    }
}

/// Progress of the sequence driven for one node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SequenceState {
    None,
    Preparing,
    InProgress { step: Step },
    Finished,
    Cancelled,
    Failed { reason: String },
}

impl SequenceState {
    /// Check if this is a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SequenceState::Finished | SequenceState::Cancelled | SequenceState::Failed { .. }
        )
    }
}

impl fmt::Display for SequenceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SequenceState::None => write!(f, "none"),
            SequenceState::Preparing => write!(f, "preparing"),
            SequenceState::InProgress { step } => write!(f, "in_progress({})", step),
            SequenceState::Finished => write!(f, "finished"),
            SequenceState::Cancelled => write!(f, "cancelled"),
            SequenceState::Failed { reason } => write!(f, "failed: {}", reason),
        }
    }
}

/// The local node's identity and operational mode.
#[derive(Debug)]
pub struct LocalNode {
    endpoint: SocketAddr,
    node_id: RwLock<Option<NodeId>>,
    mode: RwLock<OperationMode>,
    networking: AtomicBool,
}

impl LocalNode {
    /// A node that has not registered yet.
    pub fn new(endpoint: SocketAddr) -> Self {
        Self {
            endpoint,
            node_id: RwLock::new(None),
            mode: RwLock::new(OperationMode::Starting),
            networking: AtomicBool::new(true),
        }
    }

    /// A registered node in the given mode.
    pub fn registered(node_id: NodeId, endpoint: SocketAddr, mode: OperationMode) -> Self {
        let node = Self::new(endpoint);
        *node.node_id.write() = Some(node_id);
        *node.mode.write() = mode;
        node
    }

    pub fn endpoint(&self) -> SocketAddr {
        self.endpoint
    }

    pub fn node_id(&self) -> Option<NodeId> {
        *self.node_id.read()
    }

    pub fn set_node_id(&self, node_id: NodeId) {
        *self.node_id.write() = Some(node_id);
    }

    /// Whether `node_id` is this node.
    pub fn is_local(&self, node_id: NodeId) -> bool {
        self.node_id() == Some(node_id)
    }

    pub fn mode(&self) -> OperationMode {
        *self.mode.read()
    }

    pub fn set_mode(&self, mode: OperationMode) {
        let mut current = self.mode.write();
        if *current != mode {
            info!(from = %*current, to = %mode, "Operation mode changed");
            *current = mode;
        }
    }

    /// Stop serving peers after leaving the cluster.
    pub fn shutdown_networking(&self) {
        if self.networking.swap(false, Ordering::SeqCst) {
            info!(endpoint = %self.endpoint, "Networking shut down");
        }
    }

    pub fn is_networking_enabled(&self) -> bool {
        self.networking.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mode_transitions_per_kind() {
        assert_eq!(OperationMode::running(OperationKind::Leave), OperationMode::Leaving);
        assert_eq!(
            OperationMode::failed(OperationKind::Move),
            OperationMode::MoveFailed
        );
        assert_eq!(
            OperationMode::finished(OperationKind::Leave),
            OperationMode::Decommissioned
        );
        assert_eq!(
            OperationMode::cancelled(OperationKind::Join),
            OperationMode::Starting
        );
        assert!(OperationMode::DecommissionFailed.is_failed());
        assert!(!OperationMode::Leaving.is_failed());
    }

    #[test]
    fn test_local_node() {
        let node = LocalNode::new("127.0.0.1:7000".parse().unwrap());
        assert_eq!(node.node_id(), None);
        node.set_node_id(NodeId(3));
        assert!(node.is_local(NodeId(3)));
        node.shutdown_networking();
        assert!(!node.is_networking_enabled());
    }
}
