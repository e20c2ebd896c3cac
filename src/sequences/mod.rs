//! Multi-step membership operations.
//!
//! A join, leave, removal, move or replacement is a saga of individually
//! committed steps:
//!
//! ```text
//! Prepare* ──► START ──► MID ──► FINISH
//!    │           │        │
//!    └───────────┴────────┴──► CancelInProgress (reverts Prepare)
//! ```
//!
//! The Prepare transformation registers the operation in the snapshot; each
//! step is an `AdvanceSequence` commit; FINISH applies the ownership change
//! and removes the operation. Because progress lives in the snapshot, any
//! process can pick up an operation where another stopped.

mod local_state;
mod operation;
mod reconfigure;
mod sequencer;
mod single_node;

pub use local_state::{LocalNode, OperationMode, SequenceState};
pub use operation::{MultiStepOperation, OperationKind, Step};
pub use reconfigure::{cms_replacement_candidate, maybe_reconfigure_cms};
pub use sequencer::{NoopStepExecutor, Sequencer, StepExecutor};
pub use single_node::SingleNodeSequences;
