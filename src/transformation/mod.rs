//! Transformations: the only way to produce a new metadata snapshot.
//!
//! A transformation is a self-contained command. [`Transformation::execute`]
//! validates it against a snapshot and either returns the successor snapshot
//! at the next epoch or a [`Rejection`]. Execution is a pure function of the
//! command and the input snapshot, so replaying the log always reproduces the
//! same history. Anything random (operation ids) is fixed when the command is
//! built, never when it executes.

use crate::error::{Rejection, Result};
use crate::metadata::{ClusterMetadata, ReplicationParams};
use crate::sequences::{MultiStepOperation, OperationKind, Step};
use crate::types::{Location, NodeId, NodeState, Token};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::net::SocketAddr;
use uuid::Uuid;

/// Why a node leaves the ring.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LeaveKind {
    /// The node decommissions itself.
    Decommission,
    /// An operator removes a dead node.
    Remove,
}

impl LeaveKind {
    pub fn operation_kind(self) -> OperationKind {
        match self {
            LeaveKind::Decommission => OperationKind::Leave,
            LeaveKind::Remove => OperationKind::Remove,
        }
    }
}

/// A command mapping one metadata snapshot to the next.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Transformation {
    /// Add a node to the directory.
    Register {
        endpoint: SocketAddr,
        location: Location,
    },

    /// Change the address of a registered node.
    UpdateEndpoint {
        node_id: NodeId,
        endpoint: SocketAddr,
    },

    /// Drop a node that owns nothing.
    Unregister { node_id: NodeId },

    /// Start a join, reserving `tokens`.
    PrepareJoin {
        operation_id: Uuid,
        node_id: NodeId,
        tokens: Vec<Token>,
    },

    /// Start a decommission or removal.
    PrepareLeave {
        operation_id: Uuid,
        node_id: NodeId,
        kind: LeaveKind,
        force: bool,
    },

    /// Start moving a node to `tokens`.
    PrepareMove {
        operation_id: Uuid,
        node_id: NodeId,
        tokens: Vec<Token>,
    },

    /// Start replacing `replaced` with the registered node `replacement`.
    PrepareReplace {
        operation_id: Uuid,
        replaced: NodeId,
        replacement: NodeId,
    },

    /// Commit the next step of a node's operation.
    AdvanceSequence { node_id: NodeId, step: Step },

    /// Revert and drop a node's operation.
    CancelInProgress { node_id: NodeId },

    /// Change CMS membership.
    ReconfigureCms {
        add: Vec<NodeId>,
        remove: Vec<NodeId>,
    },

    /// Change cluster replication settings.
    SetReplication { params: ReplicationParams },
}

fn reject<T>(reason: impl Into<String>) -> std::result::Result<T, Rejection> {
    Err(Rejection::new(reason))
}

impl Transformation {
    /// Create a Register command.
    pub fn register(endpoint: SocketAddr, location: Location) -> Self {
        Self::Register { endpoint, location }
    }

    /// Create a PrepareJoin command with a fresh operation id.
    pub fn prepare_join(node_id: NodeId, tokens: Vec<Token>) -> Self {
        Self::PrepareJoin {
            operation_id: Uuid::new_v4(),
            node_id,
            tokens,
        }
    }

    /// Create a PrepareLeave command with a fresh operation id.
    pub fn prepare_leave(node_id: NodeId, kind: LeaveKind, force: bool) -> Self {
        Self::PrepareLeave {
            operation_id: Uuid::new_v4(),
            node_id,
            kind,
            force,
        }
    }

    /// Create a PrepareMove command with a fresh operation id.
    pub fn prepare_move(node_id: NodeId, tokens: Vec<Token>) -> Self {
        Self::PrepareMove {
            operation_id: Uuid::new_v4(),
            node_id,
            tokens,
        }
    }

    /// Create a PrepareReplace command with a fresh operation id.
    pub fn prepare_replace(replaced: NodeId, replacement: NodeId) -> Self {
        Self::PrepareReplace {
            operation_id: Uuid::new_v4(),
            replaced,
            replacement,
        }
    }

    /// Create an AdvanceSequence command.
    pub fn advance(node_id: NodeId, step: Step) -> Self {
        Self::AdvanceSequence { node_id, step }
    }

    /// Create a CancelInProgress command.
    pub fn cancel(node_id: NodeId) -> Self {
        Self::CancelInProgress { node_id }
    }

    /// Short name for logs.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Register { .. } => "REGISTER",
            Self::UpdateEndpoint { .. } => "UPDATE_ENDPOINT",
            Self::Unregister { .. } => "UNREGISTER",
            Self::PrepareJoin { .. } => "PREPARE_JOIN",
            Self::PrepareLeave { .. } => "PREPARE_LEAVE",
            Self::PrepareMove { .. } => "PREPARE_MOVE",
            Self::PrepareReplace { .. } => "PREPARE_REPLACE",
            Self::AdvanceSequence { .. } => "ADVANCE_SEQUENCE",
            Self::CancelInProgress { .. } => "CANCEL_SEQUENCE",
            Self::ReconfigureCms { .. } => "RECONFIGURE_CMS",
            Self::SetReplication { .. } => "SET_REPLICATION",
        }
    }

    /// Whether this command changes ring membership. These are refused
    /// while the cluster is migrating.
    pub fn is_membership_change(&self) -> bool {
        matches!(
            self,
            Self::PrepareJoin { .. }
                | Self::PrepareLeave { .. }
                | Self::PrepareMove { .. }
                | Self::PrepareReplace { .. }
                | Self::AdvanceSequence { .. }
                | Self::CancelInProgress { .. }
                | Self::ReconfigureCms { .. }
        )
    }

    /// Validate against `prev` and produce the successor snapshot.
    pub fn execute(&self, prev: &ClusterMetadata) -> std::result::Result<ClusterMetadata, Rejection> {
        let mut next = prev.clone();
        next.epoch = prev.epoch.next();

        match self {
            Self::Register { endpoint, location } => {
                if let Some(existing) = prev.directory.peer_id(*endpoint) {
                    return reject(format!(
                        "endpoint {} is already registered as node {}",
                        endpoint, existing
                    ));
                }
                next.directory.register(*endpoint, location.clone());
            }

            Self::UpdateEndpoint { node_id, endpoint } => {
                require_registered(prev, *node_id)?;
                match prev.directory.peer_id(*endpoint) {
                    Some(other) if other != *node_id => {
                        return reject(format!(
                            "endpoint {} is already registered as node {}",
                            endpoint, other
                        ));
                    }
                    _ => next.directory.update_endpoint(*node_id, *endpoint),
                }
            }

            Self::Unregister { node_id } => {
                let state = require_registered(prev, *node_id)?;
                if !matches!(state, NodeState::Registered | NodeState::Left) {
                    return reject(format!(
                        "node {} is {}; only REGISTERED or LEFT nodes can be unregistered",
                        node_id, state
                    ));
                }
                require_no_operation(prev, *node_id)?;
                next.directory.unregister(*node_id);
                next.cms_members.remove(node_id);
            }

            Self::PrepareJoin {
                operation_id,
                node_id,
                tokens,
            } => {
                require_state(prev, *node_id, &[NodeState::Registered])?;
                require_no_operation(prev, *node_id)?;
                require_unclaimed_tokens(prev, tokens)?;

                let op = MultiStepOperation::new(
                    *operation_id,
                    OperationKind::Join,
                    *node_id,
                    NodeState::Registered,
                    next.epoch,
                )
                .with_tokens(tokens.clone());
                next.in_progress.insert(op);
                next.directory.set_state(*node_id, NodeState::Bootstrapping);
            }

            Self::PrepareLeave {
                operation_id,
                node_id,
                kind,
                force,
            } => {
                let state =
                    require_state(prev, *node_id, &[NodeState::Joined, NodeState::Leaving])?;
                require_no_operation(prev, *node_id)?;
                if !force {
                    require_enough_replicas_without(prev, *node_id)?;
                }

                let op = MultiStepOperation::new(
                    *operation_id,
                    kind.operation_kind(),
                    *node_id,
                    state,
                    next.epoch,
                )
                .with_tokens(prev.token_map.tokens_of(*node_id))
                .with_force(*force);
                next.in_progress.insert(op);
                next.directory.set_state(*node_id, NodeState::Leaving);
            }

            Self::PrepareMove {
                operation_id,
                node_id,
                tokens,
            } => {
                require_state(prev, *node_id, &[NodeState::Joined])?;
                require_no_operation(prev, *node_id)?;
                require_unclaimed_tokens(prev, tokens)?;

                let op = MultiStepOperation::new(
                    *operation_id,
                    OperationKind::Move,
                    *node_id,
                    NodeState::Joined,
                    next.epoch,
                )
                .with_tokens(tokens.clone())
                .with_previous_tokens(prev.token_map.tokens_of(*node_id));
                next.in_progress.insert(op);
                next.directory.set_state(*node_id, NodeState::Moving);
            }

            Self::PrepareReplace {
                operation_id,
                replaced,
                replacement,
            } => {
                if replaced == replacement {
                    return reject(format!("node {} cannot replace itself", replaced));
                }
                require_state(prev, *replaced, &[NodeState::Joined])?;
                require_state(prev, *replacement, &[NodeState::Registered])?;
                require_no_operation(prev, *replaced)?;
                require_no_operation(prev, *replacement)?;

                let op = MultiStepOperation::new(
                    *operation_id,
                    OperationKind::Replace,
                    *replacement,
                    NodeState::Registered,
                    next.epoch,
                )
                .with_tokens(prev.token_map.tokens_of(*replaced))
                .with_replaced(*replaced);
                next.in_progress.insert(op);
                next.directory.set_state(*replacement, NodeState::Bootstrapping);
            }

            Self::AdvanceSequence { node_id, step } => {
                let op = match prev.in_progress.get(*node_id) {
                    Some(op) => op,
                    None => {
                        return reject(format!("no in-progress operation for node {}", node_id))
                    }
                };
                match op.next_step() {
                    Some(expected) if expected == *step => {}
                    Some(expected) => {
                        return reject(format!(
                            "stale step {} for {} of node {}; next step is {}",
                            step, op.kind, node_id, expected
                        ));
                    }
                    None => {
                        return reject(format!(
                            "{} of node {} has no remaining steps",
                            op.kind, node_id
                        ));
                    }
                }

                if *step == Step::Finish {
                    finish(op, &mut next)?;
                } else {
                    next.in_progress.replace(op.advanced(next.epoch));
                }
            }

            Self::CancelInProgress { node_id } => {
                let op = match prev.in_progress.get(*node_id) {
                    Some(op) => op,
                    None => {
                        return reject(format!("no in-progress operation for node {}", node_id))
                    }
                };
                next.directory.set_state(*node_id, op.previous_state);
                next.in_progress.remove(*node_id);
            }

            Self::ReconfigureCms { add, remove } => {
                let mut members: BTreeSet<NodeId> = prev.cms_members.clone();
                for node_id in remove {
                    if !members.remove(node_id) {
                        return reject(format!("node {} is not a CMS member", node_id));
                    }
                }
                for node_id in add {
                    let state = require_registered(prev, *node_id)?;
                    if state == NodeState::Left {
                        return reject(format!("node {} has left and cannot join the CMS", node_id));
                    }
                    if !members.insert(*node_id) {
                        return reject(format!("node {} is already a CMS member", node_id));
                    }
                }
                if members.is_empty() {
                    return reject("reconfiguration would leave the CMS without members");
                }
                next.cms_members = members;
            }

            Self::SetReplication { params } => {
                let valid = match params {
                    ReplicationParams::Simple { replicas } => *replicas > 0,
                    ReplicationParams::NetworkTopology { datacenters } => {
                        !datacenters.is_empty() && datacenters.values().all(|r| *r > 0)
                    }
                };
                if !valid {
                    return reject("replication factor must be positive");
                }
                next.replication = params.clone();
            }
        }

        next.rebuild_placements();
        Ok(next)
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

impl fmt::Display for Transformation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Register { endpoint, location } => {
                write!(f, "REGISTER({} @ {})", endpoint, location)
            }
            Self::PrepareJoin { node_id, tokens, .. } => {
                write!(f, "PREPARE_JOIN({}, {} tokens)", node_id, tokens.len())
            }
            Self::PrepareLeave { node_id, kind, .. } => {
                write!(f, "PREPARE_LEAVE({}, {:?})", node_id, kind)
            }
            Self::PrepareMove { node_id, .. } => write!(f, "PREPARE_MOVE({})", node_id),
            Self::PrepareReplace {
                replaced,
                replacement,
                ..
            } => write!(f, "PREPARE_REPLACE({} -> {})", replaced, replacement),
            Self::AdvanceSequence { node_id, step } => {
                write!(f, "ADVANCE_SEQUENCE({}, {})", node_id, step)
            }
            Self::CancelInProgress { node_id } => write!(f, "CANCEL_SEQUENCE({})", node_id),
            other => write!(f, "{}", other.name()),
        }
    }
}

/// Apply the terminal step of an operation to `next`.
fn finish(op: &MultiStepOperation, next: &mut ClusterMetadata) -> std::result::Result<(), Rejection> {
    let node_id = op.node_id;
    match op.kind {
        OperationKind::Join => {
            if let Err((token, owner)) = next.token_map.assign(node_id, &op.tokens) {
                return reject(format!("token {} is already owned by node {}", token, owner));
            }
            next.directory.set_state(node_id, NodeState::Joined);
        }
        OperationKind::Leave | OperationKind::Remove => {
            next.token_map.remove_node(node_id);
            next.directory.set_state(node_id, NodeState::Left);
            next.cms_members.remove(&node_id);
        }
        OperationKind::Move => {
            if let Err((token, owner)) = next.token_map.replace_tokens(node_id, &op.tokens) {
                return reject(format!("token {} is already owned by node {}", token, owner));
            }
            next.directory.set_state(node_id, NodeState::Joined);
        }
        OperationKind::Replace => {
            let replaced = match op.replaced {
                Some(replaced) => replaced,
                None => return reject(format!("replacement of node {} names no target", node_id)),
            };
            next.token_map.transfer(replaced, node_id);
            next.directory.set_state(node_id, NodeState::Joined);
            next.directory.set_state(replaced, NodeState::Left);
            if next.cms_members.remove(&replaced) {
                next.cms_members.insert(node_id);
            }
        }
    }
    next.in_progress.remove(node_id);
    Ok(())
}

fn require_registered(
    md: &ClusterMetadata,
    node_id: NodeId,
) -> std::result::Result<NodeState, Rejection> {
    match md.directory.state(node_id) {
        Some(state) => Ok(state),
        None => reject(format!("node {} is not registered", node_id)),
    }
}

fn require_state(
    md: &ClusterMetadata,
    node_id: NodeId,
    allowed: &[NodeState],
) -> std::result::Result<NodeState, Rejection> {
    let state = require_registered(md, node_id)?;
    if !allowed.contains(&state) {
        return reject(format!(
            "node {} is in state {}, expected one of {:?}",
            node_id, state, allowed
        ));
    }
    Ok(state)
}

fn require_no_operation(md: &ClusterMetadata, node_id: NodeId) -> std::result::Result<(), Rejection> {
    if let Some(op) = md.in_progress.get(node_id) {
        return reject(format!(
            "node {} already has an in-progress {} operation",
            node_id, op.kind
        ));
    }
    if md.in_progress.involves(node_id) {
        return reject(format!("node {} is being replaced", node_id));
    }
    Ok(())
}

fn require_unclaimed_tokens(md: &ClusterMetadata, tokens: &[Token]) -> std::result::Result<(), Rejection> {
    if tokens.is_empty() {
        return reject("at least one token is required");
    }
    let mut seen = BTreeSet::new();
    for token in tokens {
        if !token.is_valid() {
            return reject(format!("token {} is the ring minimum and cannot be owned", token));
        }
        if !seen.insert(*token) {
            return reject(format!("token {} is listed twice", token));
        }
        if let Some(owner) = md.token_claimant(*token) {
            return reject(format!("token {} is already owned by node {}", token, owner));
        }
    }
    Ok(())
}

/// Check that taking `node_id` out of the ring keeps enough nodes to
/// satisfy the replication factor of its datacenter.
fn require_enough_replicas_without(
    md: &ClusterMetadata,
    node_id: NodeId,
) -> std::result::Result<(), Rejection> {
    let leaving: BTreeSet<NodeId> = md
        .in_progress
        .iter()
        .filter(|op| matches!(op.kind, OperationKind::Leave | OperationKind::Remove))
        .map(|op| op.node_id)
        .collect();
    let remaining = |filter: &dyn Fn(NodeId) -> bool| {
        md.token_map
            .nodes()
            .into_iter()
            .filter(|n| *n != node_id && !leaving.contains(n) && filter(*n))
            .count()
    };

    let (needed, available) = match &md.replication {
        ReplicationParams::Simple { replicas } => (*replicas, remaining(&|_| true)),
        ReplicationParams::NetworkTopology { .. } => {
            let dc = match md.directory.location(node_id) {
                Some(location) => location.datacenter.clone(),
                None => return reject(format!("node {} is not registered", node_id)),
            };
            let needed = md.replication.replicas_in(&dc);
            let in_dc = |n: NodeId| {
                md.directory
                    .location(n)
                    .map(|l| l.datacenter == dc)
                    .unwrap_or(false)
            };
            (needed, remaining(&in_dc))
        }
    };

    if available < needed {
        return reject(format!(
            "not enough live nodes to maintain replication factor {} ({} would remain); \
             use force to override",
            needed, available
        ));
    }
    Ok(())
}
