//! Cluster topology management for a partitioned data store.
//!
//! This crate keeps every node's view of the cluster consistent through:
//! - a **replicated metadata log** of validated transformations, each one
//!   producing the next epoch of an immutable [`ClusterMetadata`] snapshot
//! - a **multi-step sequencer** that drives join, leave, remove, move and
//!   replace one committed step at a time, resumable after a crash
//! - **seed-based discovery** for nodes that do not yet know the cluster
//! - a **deterministic token allocator** that keeps replicated ownership
//!   balanced as nodes join
//!
//! # Example
//!
//! ```rust,no_run
//! use ringmaster::{ClusterMetadataService, CommitConfig, LocalLog, Location, Transformation};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let log = Arc::new(LocalLog::new());
//!     let cms = ClusterMetadataService::new(log, CommitConfig::default());
//!
//!     // Every change is validated against the latest snapshot, then appended.
//!     let md = cms
//!         .commit(Transformation::register("10.0.0.1:7000".parse()?, Location::new("dc1", "rack1")))
//!         .await?;
//!     println!("epoch {} knows {} nodes", md.epoch, md.directory.len());
//!
//!     Ok(())
//! }
//! ```
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────┐
//! │   Operator entrypoints (SingleNodeSequences) │
//! └─────────────────────────────────────────────┘
//!                     │
//!                     ▼
//! ┌─────────────────────────────────────────────┐
//! │  Sequencer: start / advance / resume /      │
//! │  cancel, per-node step serialization        │
//! └─────────────────────────────────────────────┘
//!                     │
//!     ┌───────────────┼───────────────┐
//!     ▼               ▼               ▼
//! ┌─────────┐   ┌──────────┐   ┌────────────┐
//! │ Token   │   │ Metadata │   │ Liveness / │
//! │Allocator│   │ Service  │   │ Discovery  │
//! └─────────┘   └──────────┘   └────────────┘
//!                     │
//!                     ▼
//!              LogTransport (LocalLog)
//! ```
//!
//! # Consistency Model
//!
//! - **Commits**: optimistic; a transformation is validated against the
//!   latest epoch and appended only if no one else appended first
//! - **Reads**: snapshots are immutable and shared; a reader never sees a
//!   partially applied change
//! - **Replay**: re-executing the log from its initial snapshot reproduces
//!   the published state exactly

pub mod allocation;
pub mod cluster;
pub mod config;
pub mod discovery;
pub mod error;
pub mod log;
pub mod metadata;
pub mod network;
pub mod node;
pub mod sequences;
pub mod service;
pub mod testing;
pub mod transformation;
pub mod types;

// Re-export main types for convenience
pub use config::{AllocationConfig, CommitConfig, DiscoveryConfig, RingmasterConfig, SequenceConfig};
pub use error::{Error, Result};
pub use node::RingmasterNode;
pub use types::{Epoch, Location, NodeId, NodeState, Token};

// Metadata and log
pub use log::{replay, LocalLog, LogEntry, LogTransport};
pub use metadata::{ClusterMetadata, ReplicationParams};
pub use service::{ClusterMetadataService, ServiceState};
pub use transformation::{LeaveKind, Transformation};

// Membership changes
pub use cluster::{LivenessProbe, PeerLiveness};
pub use sequences::{
    MultiStepOperation, OperationKind, OperationMode, Sequencer, SingleNodeSequences, Step,
    StepExecutor,
};

// Token allocation
pub use allocation::{allocate_tokens, BootstrapTokens, OwnershipStats, TokenAllocation};

// Discovery
pub use discovery::{DiscoveredNodes, Discovery, DiscoveryKind};
