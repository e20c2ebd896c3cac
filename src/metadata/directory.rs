//! Node directory: identity, address, location and lifecycle state.

use crate::types::{Location, NodeId, NodeState};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::net::SocketAddr;

/// Everything the cluster knows about one node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeRecord {
    pub id: NodeId,
    pub endpoint: SocketAddr,
    pub location: Location,
    pub state: NodeState,
}

/// Registry mapping node ids to their records, with an endpoint index.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Directory {
    next_id: u32,
    nodes: BTreeMap<NodeId, NodeRecord>,
    endpoints: BTreeMap<SocketAddr, NodeId>,
}

impl Directory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new node. Ids are handed out in registration order.
    ///
    /// Callers validate that the endpoint is free.
    pub(crate) fn register(&mut self, endpoint: SocketAddr, location: Location) -> NodeId {
        self.next_id += 1;
        let id = NodeId(self.next_id);
        self.nodes.insert(
            id,
            NodeRecord {
                id,
                endpoint,
                location,
                state: NodeState::Registered,
            },
        );
        self.endpoints.insert(endpoint, id);
        id
    }

    pub(crate) fn unregister(&mut self, node_id: NodeId) -> Option<NodeRecord> {
        let record = self.nodes.remove(&node_id)?;
        self.endpoints.remove(&record.endpoint);
        Some(record)
    }

    pub(crate) fn set_state(&mut self, node_id: NodeId, state: NodeState) {
        if let Some(record) = self.nodes.get_mut(&node_id) {
            record.state = state;
        }
    }

    pub(crate) fn update_endpoint(&mut self, node_id: NodeId, endpoint: SocketAddr) {
        if let Some(record) = self.nodes.get_mut(&node_id) {
            self.endpoints.remove(&record.endpoint);
            record.endpoint = endpoint;
            self.endpoints.insert(endpoint, node_id);
        }
    }

    pub fn get(&self, node_id: NodeId) -> Option<&NodeRecord> {
        self.nodes.get(&node_id)
    }

    pub fn contains(&self, node_id: NodeId) -> bool {
        self.nodes.contains_key(&node_id)
    }

    pub fn endpoint(&self, node_id: NodeId) -> Option<SocketAddr> {
        self.nodes.get(&node_id).map(|r| r.endpoint)
    }

    pub fn location(&self, node_id: NodeId) -> Option<&Location> {
        self.nodes.get(&node_id).map(|r| &r.location)
    }

    pub fn state(&self, node_id: NodeId) -> Option<NodeState> {
        self.nodes.get(&node_id).map(|r| r.state)
    }

    /// Node id registered at an endpoint.
    pub fn peer_id(&self, endpoint: SocketAddr) -> Option<NodeId> {
        self.endpoints.get(&endpoint).copied()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// All records in id order.
    pub fn records(&self) -> impl Iterator<Item = &NodeRecord> {
        self.nodes.values()
    }

    /// Nodes in the given state.
    pub fn nodes_in_state(&self, state: NodeState) -> Vec<NodeId> {
        self.nodes
            .values()
            .filter(|r| r.state == state)
            .map(|r| r.id)
            .collect()
    }

    /// Ring members of a datacenter, grouped by rack.
    pub fn datacenter_racks(&self, datacenter: &str) -> BTreeMap<String, BTreeSet<NodeId>> {
        let mut racks: BTreeMap<String, BTreeSet<NodeId>> = BTreeMap::new();
        for record in self.nodes.values() {
            if record.state.is_ring_member() && record.location.datacenter == datacenter {
                racks
                    .entry(record.location.rack.clone())
                    .or_default()
                    .insert(record.id);
            }
        }
        racks
    }
}
