//! Drives multi-step operations to completion.
//!
//! The step list always comes from the current snapshot, never from local
//! memory, so a fresh sequencer over the same log picks up wherever a
//! previous process stopped. Advancement of one node's operation is
//! serialized by a per-node async lock; different nodes advance concurrently.

use super::local_state::{LocalNode, OperationMode, SequenceState};
use super::{MultiStepOperation, OperationKind, Step};
use crate::cluster::LivenessProbe;
use crate::config::SequenceConfig;
use crate::error::{Error, Result, SequenceError};
use crate::metadata::ClusterMetadata;
use crate::service::ClusterMetadataService;
use crate::transformation::Transformation;
use crate::types::{NodeId, NodeState};
use dashmap::DashMap;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, error, info};

/// External work performed before a step commits (streaming, cleanup).
#[async_trait::async_trait]
pub trait StepExecutor: Send + Sync + std::fmt::Debug {
    /// Run the work for `step` of `operation`.
    async fn execute(&self, operation: &MultiStepOperation, step: Step) -> Result<()>;
}

/// Executor with no external work.
#[derive(Debug, Default)]
pub struct NoopStepExecutor;

#[async_trait::async_trait]
impl StepExecutor for NoopStepExecutor {
    async fn execute(&self, _operation: &MultiStepOperation, _step: Step) -> Result<()> {
        Ok(())
    }
}

/// Starts, advances, resumes and cancels multi-step operations.
pub struct Sequencer {
    cms: Arc<ClusterMetadataService>,
    local: Arc<LocalNode>,
    liveness: Arc<dyn LivenessProbe>,
    executor: Arc<dyn StepExecutor>,
    config: SequenceConfig,
    locks: DashMap<NodeId, Arc<Mutex<()>>>,
    states: RwLock<HashMap<NodeId, SequenceState>>,
}

impl Sequencer {
    pub fn new(
        cms: Arc<ClusterMetadataService>,
        local: Arc<LocalNode>,
        liveness: Arc<dyn LivenessProbe>,
        config: SequenceConfig,
    ) -> Self {
        Self {
            cms,
            local,
            liveness,
            executor: Arc::new(NoopStepExecutor),
            config,
            locks: DashMap::new(),
            states: RwLock::new(HashMap::new()),
        }
    }

    /// Use `executor` for per-step external work.
    pub fn with_executor(mut self, executor: Arc<dyn StepExecutor>) -> Self {
        self.executor = executor;
        self
    }

    pub fn cms(&self) -> &Arc<ClusterMetadataService> {
        &self.cms
    }

    pub fn local(&self) -> &Arc<LocalNode> {
        &self.local
    }

    pub fn liveness(&self) -> &Arc<dyn LivenessProbe> {
        &self.liveness
    }

    /// Sequence state for a node as observed by this sequencer.
    pub fn state(&self, node_id: NodeId) -> SequenceState {
        self.states
            .read()
            .get(&node_id)
            .cloned()
            .unwrap_or(SequenceState::None)
    }

    fn set_state(&self, node_id: NodeId, state: SequenceState) {
        debug!(node_id = %node_id, state = %state, "SEQUENCE: state changed");
        self.states.write().insert(node_id, state);
    }

    fn lock_for(&self, node_id: NodeId) -> Arc<Mutex<()>> {
        self.locks
            .entry(node_id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Commit a Prepare transformation, registering a new operation.
    pub async fn start(&self, transformation: Transformation) -> Result<Arc<ClusterMetadata>> {
        let (node_id, kind) = match &transformation {
            Transformation::PrepareJoin { node_id, .. } => (*node_id, OperationKind::Join),
            Transformation::PrepareLeave { node_id, kind, .. } => (*node_id, kind.operation_kind()),
            Transformation::PrepareMove { node_id, .. } => (*node_id, OperationKind::Move),
            Transformation::PrepareReplace { replacement, .. } => {
                (*replacement, OperationKind::Replace)
            }
            other => {
                return Err(Error::Internal(format!(
                    "{} does not start an operation",
                    other.name()
                )))
            }
        };

        let lock = self.lock_for(node_id);
        let _guard = lock.lock().await;

        if let Some(existing) = self.cms.metadata().in_progress.get(node_id) {
            return Err(Error::precondition(format!(
                "node {} already has an in-progress {} operation",
                node_id, existing.kind
            )));
        }

        self.set_state(node_id, SequenceState::Preparing);
        match self.cms.commit(transformation).await {
            Ok(md) => {
                self.set_state(node_id, SequenceState::InProgress { step: Step::Start });
                if self.local.is_local(node_id) {
                    self.local.set_mode(OperationMode::running(kind));
                }
                info!(node_id = %node_id, kind = %kind, epoch = %md.epoch, "SEQUENCE: operation started");
                Ok(md)
            }
            Err(e) => {
                self.set_state(node_id, SequenceState::None);
                Err(e)
            }
        }
    }

    /// Commit every remaining step of the node's operation.
    pub async fn advance(&self, node_id: NodeId) -> Result<Arc<ClusterMetadata>> {
        let lock = self.lock_for(node_id);
        let _guard = lock.lock().await;

        let mut md = self.cms.metadata();
        let mut op = match md.in_progress.get(node_id) {
            Some(op) => op.clone(),
            None => return Err(SequenceError::NotInProgress(node_id).into()),
        };
        debug!(
            node_id = %node_id,
            latest_modification = %op.latest_modification,
            epoch = %md.epoch,
            status = %op.status(),
            "SEQUENCE: advancing"
        );

        while let Some(step) = op.next_step() {
            self.set_state(node_id, SequenceState::InProgress { step });
            md = match self.commit_step(&op, step).await {
                Ok(next) => next,
                Err(e) => {
                    self.fail(&op, &e);
                    return Err(e);
                }
            };
            op = match md.in_progress.get(node_id) {
                Some(next) if next.id == op.id => next.clone(),
                _ => break,
            };
        }

        let outcome = Self::outcome(&op, &md);
        if self.local.is_local(node_id) {
            let mode = match outcome {
                SequenceState::Finished => OperationMode::finished(op.kind),
                _ => OperationMode::cancelled(op.kind),
            };
            self.local.set_mode(mode);
        }
        info!(node_id = %node_id, kind = %op.kind, outcome = %outcome, epoch = %md.epoch, "SEQUENCE: operation ended");
        self.set_state(node_id, outcome);
        Ok(md)
    }

    /// Continue a registered operation, e.g. after a restart or a failure.
    pub async fn resume(&self, node_id: NodeId) -> Result<Arc<ClusterMetadata>> {
        let md = self.cms.metadata();
        let op = md
            .in_progress
            .get(node_id)
            .ok_or(SequenceError::NotInProgress(node_id))?;
        info!(
            node_id = %node_id,
            latest_modification = %op.latest_modification,
            epoch = %md.epoch,
            status = %op.status(),
            "SEQUENCE: resuming"
        );
        if self.local.is_local(node_id) {
            self.local.set_mode(OperationMode::running(op.kind));
        }
        self.advance(node_id).await
    }

    /// Cancel the node's operation, which must be of `expected` kind.
    ///
    /// The local node's operation can only be cancelled once it has failed.
    /// A remote node's operation can only be cancelled while that node is down.
    pub async fn cancel(&self, node_id: NodeId, expected: OperationKind) -> Result<Arc<ClusterMetadata>> {
        let lock = self.lock_for(node_id);
        let _guard = lock.lock().await;

        let md = self.cms.metadata();
        let op = match md.in_progress.get(node_id) {
            Some(op) if op.kind == expected => op,
            other => {
                let found = other.map(|op| op.status()).unwrap_or_else(|| "none".to_string());
                let msg = format!(
                    "No {} operation in progress for {}, can't abort ({})",
                    expected, node_id, found
                );
                info!("{}", msg);
                return Err(Error::precondition(msg));
            }
        };

        if self.local.is_local(node_id) {
            let required = match op.kind {
                OperationKind::Remove => None,
                kind => Some(OperationMode::failed(kind)),
            };
            if let Some(required) = required {
                if self.local.mode() != required {
                    let msg = format!("Can't abort a {} operation unless it has failed", expected);
                    info!("{}", msg);
                    return Err(Error::precondition(msg));
                }
            }
        } else if self.liveness.is_alive(node_id) {
            let endpoint = md
                .directory
                .endpoint(node_id)
                .map(|e| e.to_string())
                .unwrap_or_else(|| "unknown".to_string());
            let msg = format!(
                "Can't abort a {} operation for a node {} ({}) that is UP - run abortdecommission on that instance",
                expected, node_id, endpoint
            );
            info!("{}", msg);
            return Err(Error::precondition(msg));
        }

        let kind = op.kind;
        let md = self.cms.commit(Transformation::cancel(node_id)).await?;
        if self.local.is_local(node_id) {
            self.local.set_mode(OperationMode::cancelled(kind));
        }
        self.set_state(node_id, SequenceState::Cancelled);
        info!(node_id = %node_id, kind = %kind, epoch = %md.epoch, "SEQUENCE: operation cancelled");
        Ok(md)
    }

    /// Run external work for a step and commit it, bounded by the step timeout.
    async fn commit_step(&self, op: &MultiStepOperation, step: Step) -> Result<Arc<ClusterMetadata>> {
        let node_id = op.node_id;
        let work = async {
            if let Err(e) = self.executor.execute(op, step).await {
                return Err(Error::from(SequenceError::StepFailed {
                    node_id,
                    kind: op.kind.to_string(),
                    step: step.to_string(),
                    reason: e.to_string(),
                }));
            }
            self.cms.commit(Transformation::advance(node_id, step)).await
        };

        match tokio::time::timeout(self.config.step_timeout, work).await {
            Ok(Ok(md)) => Ok(md),
            Ok(Err(Error::Rejected(rejection))) => {
                // Someone else may have committed this step already.
                let current = self.cms.metadata();
                match current.in_progress.get(node_id) {
                    Some(now) if now.id == op.id && now.next_index > op.next_index => {
                        debug!(node_id = %node_id, step = %step, "SEQUENCE: step advanced concurrently");
                        Ok(current)
                    }
                    Some(now) if now.id == op.id => Err(Error::Rejected(rejection)),
                    _ => Ok(current),
                }
            }
            Ok(Err(e)) => Err(e),
            Err(_) => Err(SequenceError::StepTimeout {
                node_id,
                step: step.to_string(),
            }
            .into()),
        }
    }

    fn fail(&self, op: &MultiStepOperation, e: &Error) {
        error!(node_id = %op.node_id, kind = %op.kind, error = %e, "SEQUENCE: operation failed");
        self.set_state(
            op.node_id,
            SequenceState::Failed {
                reason: e.to_string(),
            },
        );
        if self.local.is_local(op.node_id) {
            self.local.set_mode(OperationMode::failed(op.kind));
        }
    }

    /// Whether an operation that is no longer registered finished or was cancelled.
    fn outcome(op: &MultiStepOperation, md: &ClusterMetadata) -> SequenceState {
        let finished = match op.kind {
            OperationKind::Join | OperationKind::Replace => {
                md.state(op.node_id) == Some(NodeState::Joined)
            }
            OperationKind::Leave | OperationKind::Remove => {
                md.state(op.node_id) == Some(NodeState::Left)
            }
            OperationKind::Move => {
                let mut expected = op.tokens.clone();
                expected.sort();
                md.token_map.tokens_of(op.node_id) == expected
            }
        };
        if finished {
            SequenceState::Finished
        } else {
            SequenceState::Cancelled
        }
    }
}

impl std::fmt::Debug for Sequencer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Sequencer")
            .field("local", &self.local.node_id())
            .field("tracked", &self.states.read().len())
            .finish()
    }
}
