//! Operator entrypoints for sequences that change a single node.
//!
//! Each entrypoint checks its preconditions against the current snapshot and
//! the local node's mode, then hands off to the [`Sequencer`]. Nothing is
//! committed when a precondition fails.

use super::local_state::OperationMode;
use super::reconfigure::maybe_reconfigure_cms;
use super::sequencer::Sequencer;
use super::OperationKind;
use crate::allocation::BootstrapTokens;
use crate::config::AllocationConfig;
use crate::error::{Error, Result};
use crate::metadata::ClusterMetadata;
use crate::service::ServiceState;
use crate::transformation::{LeaveKind, Transformation};
use crate::types::{NodeId, NodeState, Token};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Decommission, remove, move, join and replace entrypoints.
#[derive(Debug, Clone)]
pub struct SingleNodeSequences {
    sequencer: Arc<Sequencer>,
}

impl SingleNodeSequences {
    pub fn new(sequencer: Arc<Sequencer>) -> Self {
        Self { sequencer }
    }

    pub fn sequencer(&self) -> &Arc<Sequencer> {
        &self.sequencer
    }

    fn ensure_not_migrating(&self, action: &str) -> Result<()> {
        if self.sequencer.cms().state() != ServiceState::Ready {
            return Err(Error::precondition(format!(
                "This cluster is migrating to cluster metadata, can't {} until that is done.",
                action
            )));
        }
        Ok(())
    }

    fn local_id(&self) -> Result<NodeId> {
        self.sequencer
            .local()
            .node_id()
            .ok_or_else(|| Error::precondition("local node is not registered"))
    }

    /// Decommission the local node.
    ///
    /// With `force`, the node leaves even if too few nodes remain to satisfy
    /// the replication factor.
    pub async fn decommission(&self, force: bool, shutdown_networking: bool) -> Result<Arc<ClusterMetadata>> {
        self.ensure_not_migrating("decommission")?;

        let mode = self.sequencer.local().mode();
        if !matches!(
            mode,
            OperationMode::Leaving | OperationMode::Normal | OperationMode::DecommissionFailed
        ) {
            return Err(Error::precondition(format!(
                "Node in {} state; wait for status to become normal",
                mode
            )));
        }
        debug!("DECOMMISSIONING");

        let node_id = self.local_id()?;
        let cms = self.sequencer.cms();
        maybe_reconfigure_cms(cms, node_id).await?;

        let md = cms.metadata();
        let md = match md.in_progress.get(node_id) {
            None => {
                info!(epoch = %md.epoch, node_id = %node_id, "starting decommission");
                self.sequencer
                    .start(Transformation::prepare_leave(node_id, LeaveKind::Decommission, force))
                    .await?;
                self.sequencer.advance(node_id).await?
            }
            Some(op) if op.kind == OperationKind::Leave => {
                info!(
                    latest_modification = %op.latest_modification,
                    epoch = %md.epoch,
                    status = %op.status(),
                    "Resuming decommission"
                );
                self.sequencer.resume(node_id).await?
            }
            Some(_) => {
                return Err(Error::precondition(
                    "Can not decommission a node that has an in-progress sequence",
                ));
            }
        };

        if shutdown_networking {
            self.sequencer.local().shutdown_networking();
        }
        Ok(md)
    }

    /// Cancel a failed decommission. `None` targets the local node.
    pub async fn abort_decommission(&self, node_id: Option<&str>) -> Result<Arc<ClusterMetadata>> {
        self.abort(node_id, OperationKind::Leave).await
    }

    /// Remove a dead node from the ring.
    pub async fn remove_node(&self, target: NodeId, force: bool) -> Result<Arc<ClusterMetadata>> {
        let md = self.sequencer.cms().metadata();
        if self.sequencer.local().is_local(target) {
            return Err(Error::precondition("Cannot remove self"));
        }
        let endpoint = md
            .directory
            .endpoint(target)
            .ok_or_else(|| Error::precondition("Host ID not found."))?;
        if self.sequencer.liveness().is_alive(target) {
            return Err(Error::precondition(format!(
                "Node {} is alive and owns this ID. Use decommission command to remove it from the ring",
                endpoint
            )));
        }

        match md.state(target) {
            Some(state) if state.is_ring_member() => {
                if state == NodeState::Leaving {
                    warn!(
                        endpoint = %endpoint,
                        "Node is already leaving or being removed, continuing removal anyway"
                    );
                }
            }
            _ => {
                return Err(Error::precondition(
                    "Node to be removed is not a member of the token ring",
                ));
            }
        }

        if md.in_progress.contains(target) {
            return Err(Error::precondition(
                "Can not remove a node that has an in-progress sequence",
            ));
        }

        let cms = self.sequencer.cms();
        maybe_reconfigure_cms(cms, target).await?;

        info!(epoch = %md.epoch, node_id = %target, "starting removenode");
        self.sequencer
            .start(Transformation::prepare_leave(target, LeaveKind::Remove, force))
            .await?;
        self.sequencer.advance(target).await
    }

    /// Cancel a removal.
    pub async fn abort_remove_node(&self, node_id: &str) -> Result<Arc<ClusterMetadata>> {
        self.abort(Some(node_id), OperationKind::Remove).await
    }

    /// Move the local node to `token`.
    pub async fn move_to(&self, token: Token) -> Result<Arc<ClusterMetadata>> {
        self.ensure_not_migrating("move")?;

        let md = self.sequencer.cms().metadata();
        if md.token_map.owner(token).is_some() {
            return Err(Error::precondition(format!(
                "target token {} is already owned by another node.",
                token
            )));
        }

        let node_id = self.local_id()?;
        if md.token_map.tokens_of(node_id).len() > 1 {
            error!("Invalid request to move(Token); This node has more than one token and cannot be moved thusly.");
            return Err(Error::precondition(
                "This node has more than one token and cannot be moved thusly.",
            ));
        }

        self.sequencer
            .start(Transformation::prepare_move(node_id, vec![token]))
            .await?;
        let md = self.sequencer.advance(node_id).await?;
        debug!(token = %token, "Successfully moved to new token");
        Ok(md)
    }

    /// Resume a failed move of the local node.
    pub async fn resume_move(&self) -> Result<Arc<ClusterMetadata>> {
        self.ensure_not_migrating("move")?;

        let node_id = self.local_id()?;
        let md = self.sequencer.cms().metadata();
        if !md.in_progress.is_kind(node_id, OperationKind::Move) {
            let msg = "No move operation in progress, can't resume";
            info!("{}", msg);
            return Err(Error::precondition(msg));
        }
        if self.sequencer.local().mode() != OperationMode::MoveFailed {
            let msg = "Can't resume a move operation unless it has failed";
            info!("{}", msg);
            return Err(Error::precondition(msg));
        }
        self.sequencer.resume(node_id).await
    }

    /// Cancel a failed move. `None` targets the local node.
    pub async fn abort_move(&self, node_id: Option<&str>) -> Result<Arc<ClusterMetadata>> {
        self.abort(node_id, OperationKind::Move).await
    }

    /// Join the ring at `tokens`.
    pub async fn join(&self, tokens: Vec<Token>) -> Result<Arc<ClusterMetadata>> {
        self.ensure_not_migrating("join")?;
        let node_id = self.local_id()?;

        let md = self.sequencer.cms().metadata();
        if md.in_progress.is_kind(node_id, OperationKind::Join) {
            info!(node_id = %node_id, "Resuming join");
            return self.sequencer.resume(node_id).await;
        }

        self.sequencer
            .start(Transformation::prepare_join(node_id, tokens))
            .await?;
        self.sequencer.advance(node_id).await
    }

    /// Join the ring with tokens chosen per `config`: explicit initial tokens,
    /// the balancing allocator, or random positions.
    pub async fn bootstrap(&self, config: &AllocationConfig) -> Result<Arc<ClusterMetadata>> {
        let node_id = self.local_id()?;
        let md = self.sequencer.cms().metadata();
        let tokens = match md.in_progress.get(node_id) {
            Some(op) if op.kind == OperationKind::Join => op.tokens.clone(),
            _ => BootstrapTokens::new(config).choose(&md, node_id)?,
        };
        self.join(tokens).await
    }

    /// Take over the tokens of the dead node `replaced`.
    pub async fn replace(&self, replaced: NodeId) -> Result<Arc<ClusterMetadata>> {
        self.ensure_not_migrating("replace")?;
        let node_id = self.local_id()?;

        if self.sequencer.liveness().is_alive(replaced) {
            return Err(Error::precondition(format!(
                "Cannot replace a live node {}",
                replaced
            )));
        }

        let md = self.sequencer.cms().metadata();
        if md.in_progress.is_kind(node_id, OperationKind::Replace) {
            info!(node_id = %node_id, "Resuming replacement");
            return self.sequencer.resume(node_id).await;
        }

        let cms = self.sequencer.cms();
        maybe_reconfigure_cms(cms, replaced).await?;
        self.sequencer
            .start(Transformation::prepare_replace(replaced, node_id))
            .await?;
        self.sequencer.advance(node_id).await
    }

    async fn abort(&self, node_id: Option<&str>, kind: OperationKind) -> Result<Arc<ClusterMetadata>> {
        self.ensure_not_migrating(&format!("abort {}", kind))?;

        let target = match node_id {
            Some(s) => s
                .parse::<NodeId>()
                .map_err(|_| Error::precondition(format!("invalid node id: {}", s)))?,
            None => self.local_id()?,
        };
        self.sequencer.cancel(target, kind).await
    }
}
