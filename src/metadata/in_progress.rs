//! Registry of in-progress multi-step operations, at most one per node.

use crate::sequences::{MultiStepOperation, OperationKind};
use crate::types::NodeId;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InProgressSequences {
    operations: BTreeMap<NodeId, MultiStepOperation>,
}

impl InProgressSequences {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, node_id: NodeId) -> Option<&MultiStepOperation> {
        self.operations.get(&node_id)
    }

    pub fn contains(&self, node_id: NodeId) -> bool {
        self.operations.contains_key(&node_id)
    }

    /// Whether the node is the target of an operation or is being replaced by one.
    pub fn involves(&self, node_id: NodeId) -> bool {
        self.contains(node_id)
            || self
                .operations
                .values()
                .any(|op| op.replaced == Some(node_id))
    }

    /// Whether a registered operation for the node has the given kind.
    pub fn is_kind(&self, node_id: NodeId, kind: OperationKind) -> bool {
        self.get(node_id).map(|op| op.kind == kind).unwrap_or(false)
    }

    pub fn len(&self) -> usize {
        self.operations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &MultiStepOperation> {
        self.operations.values()
    }

    /// Register an operation. Returns false if the node already has one.
    pub(crate) fn insert(&mut self, operation: MultiStepOperation) -> bool {
        if self.operations.contains_key(&operation.node_id) {
            return false;
        }
        self.operations.insert(operation.node_id, operation);
        true
    }

    pub(crate) fn replace(&mut self, operation: MultiStepOperation) {
        self.operations.insert(operation.node_id, operation);
    }

    pub(crate) fn remove(&mut self, node_id: NodeId) -> Option<MultiStepOperation> {
        self.operations.remove(&node_id)
    }
}
