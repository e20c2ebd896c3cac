//! Multi-step operation records stored in cluster metadata.

use crate::types::{Epoch, NodeId, NodeState, Token};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Kind of a long-running topology change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OperationKind {
    /// A registered node joins the ring.
    Join,
    /// A node decommissions itself.
    Leave,
    /// An operator removes a dead node.
    Remove,
    /// A node moves to a new token.
    Move,
    /// A new node takes over the tokens of a dead one.
    Replace,
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OperationKind::Join => write!(f, "JOIN"),
            OperationKind::Leave => write!(f, "LEAVE"),
            OperationKind::Remove => write!(f, "REMOVE"),
            OperationKind::Move => write!(f, "MOVE"),
            OperationKind::Replace => write!(f, "REPLACE"),
        }
    }
}

/// One individually committed step of an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Step {
    /// Start streaming; new owners begin receiving writes.
    Start,
    /// Streaming finished.
    Mid,
    /// Ownership handed over; the operation is removed.
    Finish,
}

impl Step {
    /// Steps every operation walks through, in order.
    pub const ALL: [Step; 3] = [Step::Start, Step::Mid, Step::Finish];
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Step::Start => write!(f, "START"),
            Step::Mid => write!(f, "MID"),
            Step::Finish => write!(f, "FINISH"),
        }
    }
}

/// An in-progress topology change registered against a node id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MultiStepOperation {
    /// Operation id, fixed when the operation is prepared.
    pub id: Uuid,
    pub kind: OperationKind,
    /// Node the operation is registered against.
    pub node_id: NodeId,
    /// Tokens the node acquires (join, move, replace) or gives up (leave, remove).
    pub tokens: Vec<Token>,
    /// Tokens the node held before a move.
    pub previous_tokens: Vec<Token>,
    /// Node being replaced.
    pub replaced: Option<NodeId>,
    /// Skip replication-factor safety checks.
    pub force: bool,
    /// Lifecycle state to restore on cancellation.
    pub previous_state: NodeState,
    /// Ordered steps.
    pub steps: Vec<Step>,
    /// Index into `steps` of the next step to commit.
    pub next_index: usize,
    /// Epoch of the last commit that touched this operation.
    pub latest_modification: Epoch,
}

impl MultiStepOperation {
    pub(crate) fn new(
        id: Uuid,
        kind: OperationKind,
        node_id: NodeId,
        previous_state: NodeState,
        epoch: Epoch,
    ) -> Self {
        Self {
            id,
            kind,
            node_id,
            tokens: Vec::new(),
            previous_tokens: Vec::new(),
            replaced: None,
            force: false,
            previous_state,
            steps: Step::ALL.to_vec(),
            next_index: 0,
            latest_modification: epoch,
        }
    }

    pub(crate) fn with_tokens(mut self, tokens: Vec<Token>) -> Self {
        self.tokens = tokens;
        self
    }

    pub(crate) fn with_previous_tokens(mut self, tokens: Vec<Token>) -> Self {
        self.previous_tokens = tokens;
        self
    }

    pub(crate) fn with_replaced(mut self, replaced: NodeId) -> Self {
        self.replaced = Some(replaced);
        self
    }

    pub(crate) fn with_force(mut self, force: bool) -> Self {
        self.force = force;
        self
    }

    /// The next step to commit, if any remain.
    pub fn next_step(&self) -> Option<Step> {
        self.steps.get(self.next_index).copied()
    }

    /// Steps not yet committed.
    pub fn remaining_steps(&self) -> &[Step] {
        &self.steps[self.next_index.min(self.steps.len())..]
    }

    /// Whether the START step has been committed.
    pub fn has_started(&self) -> bool {
        self.next_index > 0
    }

    /// Copy of this operation with the next step committed at `epoch`.
    pub(crate) fn advanced(&self, epoch: Epoch) -> Self {
        let mut next = self.clone();
        next.next_index += 1;
        next.latest_modification = epoch;
        next
    }

    /// Human-readable status line.
    pub fn status(&self) -> String {
        match self.next_step() {
            Some(step) => format!(
                "{} of node {}: next step {} ({}/{})",
                self.kind,
                self.node_id,
                step,
                self.next_index + 1,
                self.steps.len()
            ),
            None => format!("{} of node {}: complete", self.kind, self.node_id),
        }
    }
}
