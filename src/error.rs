//! Error types for cluster metadata management.

use crate::types::{Epoch, NodeId, Token};
use serde::{Deserialize, Serialize};
use std::io;
use thiserror::Error;

/// Result type alias for cluster metadata operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type.
#[derive(Error, Debug)]
pub enum Error {
    /// A transformation failed validation against the current snapshot.
    #[error("transformation rejected: {0}")]
    Rejected(#[from] Rejection),

    /// An operator request failed its preconditions before anything was committed.
    #[error("{0}")]
    Precondition(String),

    /// The log kept advancing underneath us until the retry budget ran out.
    #[error("commit failed after {attempts} attempts, last seen {last_epoch}")]
    CommitRetriesExhausted { attempts: usize, last_epoch: Epoch },

    /// Token allocation errors.
    #[error("allocation error: {0}")]
    Allocation(#[from] AllocationError),

    /// Multi-step operation errors.
    #[error("sequence error: {0}")]
    Sequence(#[from] SequenceError),

    /// Network communication errors.
    #[error("network error: {0}")]
    Network(#[from] NetworkError),

    /// Log replay errors.
    #[error("log error: {0}")]
    Log(#[from] LogError),

    /// Configuration errors.
    #[error("config error: {0}")]
    Config(String),

    /// A bounded wait expired.
    #[error("operation timed out")]
    Timeout,

    /// Generic internal error.
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Shorthand for a precondition failure.
    pub fn precondition(msg: impl Into<String>) -> Self {
        Error::Precondition(msg.into())
    }

    /// Whether the failure happened before anything was appended to the log.
    pub fn is_precondition(&self) -> bool {
        matches!(self, Error::Precondition(_) | Error::Rejected(_))
    }
}

/// Validation failure of a transformation. Terminal: retrying the same
/// transformation against the same snapshot fails the same way.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[error("{reason}")]
pub struct Rejection {
    pub reason: String,
}

impl Rejection {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

/// Token allocation errors.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum AllocationError {
    /// A freshly allocated token is owned by a node sharing the allocation ring.
    #[error("allocated token {token} already assigned to node {owner}; is another node also allocating tokens?")]
    TokenClash { token: Token, owner: NodeId },

    /// Rack layout cannot satisfy the replication factor.
    #[error("token allocation failed: the number of racks {racks} in datacenter {datacenter} is lower than its replication factor {replicas}")]
    RackConfiguration {
        datacenter: String,
        racks: usize,
        replicas: usize,
    },

    /// The node to allocate for is not in the directory.
    #[error("node {0} is not registered")]
    UnknownNode(NodeId),

    /// Requested token count is unusable.
    #[error("invalid token count: {0}")]
    InvalidTokenCount(usize),

    /// An explicitly requested token is already owned.
    #[error("token {token} is already owned by node {owner}")]
    TokenOwned { token: Token, owner: NodeId },
}

/// Multi-step operation errors.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SequenceError {
    /// No operation registered for the node.
    #[error("no in-progress operation for node {0}")]
    NotInProgress(NodeId),

    /// A step could not be executed.
    #[error("step {step} of {kind} for node {node_id} failed: {reason}")]
    StepFailed {
        node_id: NodeId,
        kind: String,
        step: String,
        reason: String,
    },

    /// A step did not complete within its deadline.
    #[error("step {step} for node {node_id} timed out")]
    StepTimeout { node_id: NodeId, step: String },
}

/// Network communication errors.
#[derive(Error, Debug)]
pub enum NetworkError {
    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Deserialization error.
    #[error("deserialization error: {0}")]
    Deserialization(String),

    /// No handler registered for a verb.
    #[error("no handler for verb {0}")]
    NoHandler(String),

    /// Frame is truncated or has a bad length prefix.
    #[error("malformed frame: {0}")]
    MalformedFrame(String),

    /// I/O error.
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

/// Log storage and replay errors.
#[derive(Error, Debug)]
pub enum LogError {
    /// Entries are not contiguous.
    #[error("log gap: expected {expected}, found {found}")]
    Gap { expected: Epoch, found: Epoch },

    /// A logged entry no longer applies cleanly during replay.
    #[error("entry at {epoch} failed to replay: {reason}")]
    Replay { epoch: Epoch, reason: String },
}

impl From<bincode::Error> for Error {
    fn from(e: bincode::Error) -> Self {
        Error::Network(NetworkError::Serialization(e.to_string()))
    }
}
