//! Immutable cluster metadata snapshots.
//!
//! A [`ClusterMetadata`] is only ever produced by executing a
//! [`Transformation`](crate::transformation::Transformation) against its
//! predecessor. Snapshots are cheap to share behind an `Arc` and are never
//! mutated once published.

mod directory;
mod in_progress;
mod placement;
mod token_map;

pub use directory::{Directory, NodeRecord};
pub use in_progress::InProgressSequences;
pub use placement::{PlacementMap, Placements, ReplicationParams};
pub use token_map::{TokenMap, TokenRange};

use crate::error::Result;
use crate::sequences::OperationKind;
use crate::types::{Epoch, NodeId, NodeState, Token};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::net::SocketAddr;

/// A versioned view of the cluster topology.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterMetadata {
    pub epoch: Epoch,
    pub directory: Directory,
    pub token_map: TokenMap,
    pub in_progress: InProgressSequences,
    pub placements: Placements,
    pub replication: ReplicationParams,
    /// Nodes authoritative for the metadata log itself.
    pub cms_members: BTreeSet<NodeId>,
}

impl ClusterMetadata {
    /// The snapshot before anything has been committed.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Empty snapshot with the given replication settings.
    pub fn with_replication(replication: ReplicationParams) -> Self {
        Self {
            replication,
            ..Self::default()
        }
    }

    /// Nodes currently holding tokens.
    pub fn ring_members(&self) -> BTreeSet<NodeId> {
        self.token_map.nodes()
    }

    /// Lifecycle state of a node.
    pub fn state(&self, node_id: NodeId) -> Option<NodeState> {
        self.directory.state(node_id)
    }

    /// Endpoints of the CMS members.
    pub fn cms_endpoints(&self) -> BTreeSet<SocketAddr> {
        self.cms_members
            .iter()
            .filter_map(|id| self.directory.endpoint(*id))
            .collect()
    }

    /// Node that owns `token` or has reserved it through an in-progress
    /// join, move or replacement.
    pub fn token_claimant(&self, token: Token) -> Option<NodeId> {
        if let Some(owner) = self.token_map.owner(token) {
            return Some(owner);
        }
        self.in_progress
            .iter()
            .filter(|op| matches!(op.kind, OperationKind::Join | OperationKind::Move))
            .find(|op| op.tokens.contains(&token))
            .map(|op| op.node_id)
    }

    /// Nodes serving reads for `key`.
    pub fn read_replicas_for_key(&self, key: &[u8]) -> Vec<NodeId> {
        self.placements.read_replicas(Token::for_key(key))
    }

    /// Nodes that must receive writes for `key`, including pending owners.
    pub fn write_replicas_for_key(&self, key: &[u8]) -> Vec<NodeId> {
        self.placements.write_replicas(Token::for_key(key))
    }

    /// The ring as it will look once every started operation finishes, or
    /// `None` if no operation has passed its START step.
    pub fn pending_ring(&self) -> Option<TokenMap> {
        let mut started = self.in_progress.iter().filter(|op| op.has_started()).peekable();
        started.peek()?;

        let mut future = self.token_map.clone();
        for op in started {
            match op.kind {
                OperationKind::Join => {
                    let assigned = future.assign(op.node_id, &op.tokens);
                    debug_assert!(assigned.is_ok(), "reserved token already owned: {:?}", assigned);
                }
                OperationKind::Move => {
                    let replaced = future.replace_tokens(op.node_id, &op.tokens);
                    debug_assert!(replaced.is_ok(), "reserved token already owned: {:?}", replaced);
                }
                OperationKind::Replace => {
                    if let Some(replaced) = op.replaced {
                        future.transfer(replaced, op.node_id);
                    }
                }
                OperationKind::Leave | OperationKind::Remove => {
                    future.remove_node(op.node_id);
                }
            }
        }
        Some(future)
    }

    /// Recompute placements from the current and pending rings.
    pub(crate) fn rebuild_placements(&mut self) {
        let pending = self.pending_ring();
        self.placements = Placements::compute(
            &self.replication,
            &self.token_map,
            pending.as_ref(),
            &self.directory,
        );
    }

    /// Serialize to bytes.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    /// Deserialize from bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        Ok(bincode::deserialize(bytes)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sequences::MultiStepOperation;
    use crate::types::Location;
    use uuid::Uuid;

    fn two_node_metadata() -> ClusterMetadata {
        let mut md = ClusterMetadata::with_replication(ReplicationParams::Simple { replicas: 1 });
        for i in 1..=2u8 {
            let id = md
                .directory
                .register(SocketAddr::from(([10, 0, 0, i], 7000)), Location::new("dc1", "r1"));
            md.directory.set_state(id, NodeState::Joined);
            md.token_map.assign(id, &[Token(i as i64 * 100)]).unwrap();
        }
        md.rebuild_placements();
        md
    }

    #[test]
    fn test_bytes_roundtrip() {
        let md = two_node_metadata();
        let decoded = ClusterMetadata::from_bytes(&md.to_bytes().unwrap()).unwrap();
        assert_eq!(decoded, md);
    }

    #[test]
    fn test_no_pending_ring_until_start() {
        let mut md = two_node_metadata();
        let joining = md
            .directory
            .register(SocketAddr::from(([10, 0, 0, 3], 7000)), Location::new("dc1", "r1"));
        let op = MultiStepOperation::new(
            Uuid::nil(),
            OperationKind::Join,
            joining,
            NodeState::Registered,
            md.epoch,
        )
        .with_tokens(vec![Token(150)]);
        md.in_progress.insert(op.clone());

        assert!(md.pending_ring().is_none());
        assert_eq!(md.token_claimant(Token(150)), Some(joining));

        md.in_progress.replace(op.advanced(Epoch(2)));
        let future = md.pending_ring().unwrap();
        assert_eq!(future.owner(Token(150)), Some(joining));
        assert!(md.token_map.owner(Token(150)).is_none());
    }

    #[test]
    #[should_panic(expected = "reserved token already owned")]
    fn test_pending_ring_rejects_reservation_of_owned_token() {
        let mut md = two_node_metadata();
        let joining = md
            .directory
            .register(SocketAddr::from(([10, 0, 0, 3], 7000)), Location::new("dc1", "r1"));
        // Bypasses transformation validation: Token(100) belongs to node 1.
        let op = MultiStepOperation::new(
            Uuid::nil(),
            OperationKind::Join,
            joining,
            NodeState::Registered,
            md.epoch,
        )
        .with_tokens(vec![Token(100)]);
        md.in_progress.insert(op.advanced(Epoch(2)));

        md.pending_ring();
    }

    #[test]
    fn test_key_lookup_follows_ring() {
        let md = two_node_metadata();
        for key in [&b"alpha"[..], b"beta", b"gamma", b"delta", b""] {
            let token = Token::for_key(key);
            let primary = md.token_map.primary_for(token).unwrap();
            assert_eq!(md.read_replicas_for_key(key), vec![primary], "{:?}", key);
            assert_eq!(md.write_replicas_for_key(key), vec![primary]);
        }
        assert_eq!(Token::for_key(b"alpha"), Token::for_key(b"alpha"));
    }
}
