//! Testing utilities: in-process clusters and a simulated network.
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │ TestCluster                                                  │
//! │   LocalLog ──► ClusterMetadataService (shared by all nodes)  │
//! │                                                              │
//! │   TestNode (per node id)                                     │
//! │     LocalNode + PeerLiveness ──► Sequencer ──► Single-node   │
//! │                                                sequences     │
//! └──────────────────────────────────────────────────────────────┘
//! ┌──────────────────────────────────────────────────────────────┐
//! │ SimulatedNetwork                                             │
//! │   per node: VerbHandlers + SimulatedDelivery                 │
//! │   deterministic drops (every nth request), partitions        │
//! └──────────────────────────────────────────────────────────────┘
//! ```

mod simulated_network;

#[cfg(test)]
mod sequence_scenario_tests;

pub use simulated_network::{FailurePolicy, SimulatedDelivery, SimulatedNetwork};

use crate::cluster::PeerLiveness;
use crate::config::{CommitConfig, SequenceConfig};
use crate::error::{Error, Result};
use crate::log::LocalLog;
use crate::metadata::{ClusterMetadata, ReplicationParams};
use crate::sequences::{LocalNode, OperationMode, Sequencer, SingleNodeSequences, Step, StepExecutor};
use crate::service::ClusterMetadataService;
use crate::transformation::Transformation;
use crate::types::{Location, NodeId, Token};
use std::net::SocketAddr;
use std::sync::Arc;

/// A cluster sharing one in-process log.
#[derive(Debug)]
pub struct TestCluster {
    pub log: Arc<LocalLog>,
    pub cms: Arc<ClusterMetadataService>,
    /// Nodes joined at construction, in id order.
    pub nodes: Vec<NodeId>,
}

impl TestCluster {
    /// Endpoint of the node registered `index`-th.
    pub fn endpoint(index: u32) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, index as u8], 7000))
    }

    /// Token given to the `index`-th joined node.
    pub fn token_for(index: u32) -> Token {
        Token(index as i64 * 1_000_000)
    }

    /// `count` nodes in dc1/rack1, each joined with one token. The first
    /// node is the only CMS member.
    pub async fn with_joined_nodes(count: usize, replication: ReplicationParams) -> Result<Self> {
        let log = Arc::new(LocalLog::with_initial(ClusterMetadata::with_replication(replication)));
        let cms = Arc::new(ClusterMetadataService::new(log.clone(), CommitConfig::default()));
        let cluster = Self {
            log,
            cms,
            nodes: Vec::new(),
        };

        let mut nodes = Vec::with_capacity(count);
        for index in 1..=count as u32 {
            let node_id = cluster.register(index).await?;
            cluster
                .cms
                .commit(Transformation::prepare_join(node_id, vec![Self::token_for(index)]))
                .await?;
            for step in Step::ALL {
                cluster.cms.commit(Transformation::advance(node_id, step)).await?;
            }
            nodes.push(node_id);
        }
        if let Some(first) = nodes.first() {
            cluster
                .cms
                .commit(Transformation::ReconfigureCms {
                    add: vec![*first],
                    remove: vec![],
                })
                .await?;
        }

        Ok(Self { nodes, ..cluster })
    }

    /// Register the `index`-th node without joining it.
    pub async fn register(&self, index: u32) -> Result<NodeId> {
        let endpoint = Self::endpoint(index);
        let md = self
            .cms
            .commit(Transformation::register(endpoint, Location::new("dc1", "rack1")))
            .await?;
        md.directory
            .peer_id(endpoint)
            .ok_or_else(|| Error::Internal(format!("{} missing after registration", endpoint)))
    }

    pub fn metadata(&self) -> Arc<ClusterMetadata> {
        self.cms.metadata()
    }

    /// The view of the cluster from `node_id`, with every other node alive.
    pub fn node(&self, node_id: NodeId) -> TestNode {
        self.build_node(node_id, None)
    }

    /// Like [`TestCluster::node`], running `executor` for every step.
    pub fn node_with_executor(&self, node_id: NodeId, executor: Arc<dyn StepExecutor>) -> TestNode {
        self.build_node(node_id, Some(executor))
    }

    fn build_node(&self, node_id: NodeId, executor: Option<Arc<dyn StepExecutor>>) -> TestNode {
        let md = self.cms.metadata();
        let endpoint = md
            .directory
            .endpoint(node_id)
            .unwrap_or_else(|| Self::endpoint(node_id.id()));
        let mode = match md.state(node_id) {
            Some(state) if state.is_ring_member() => OperationMode::Normal,
            _ => OperationMode::Starting,
        };
        let local = Arc::new(LocalNode::registered(node_id, endpoint, mode));

        let liveness = Arc::new(PeerLiveness::new(node_id, 1));
        for record in md.directory.records() {
            liveness.handle_alive(record.id);
        }

        let mut sequencer = Sequencer::new(
            self.cms.clone(),
            local.clone(),
            liveness.clone(),
            SequenceConfig::default(),
        );
        if let Some(executor) = executor {
            sequencer = sequencer.with_executor(executor);
        }
        let sequencer = Arc::new(sequencer);

        TestNode {
            local,
            liveness,
            sequences: SingleNodeSequences::new(sequencer.clone()),
            sequencer,
        }
    }
}

/// One node's local state and entrypoints.
#[derive(Debug, Clone)]
pub struct TestNode {
    pub local: Arc<LocalNode>,
    pub liveness: Arc<PeerLiveness>,
    pub sequencer: Arc<Sequencer>,
    pub sequences: SingleNodeSequences,
}

impl TestNode {
    /// Mark `peer` down in this node's liveness view.
    pub fn mark_down(&self, peer: NodeId) {
        self.liveness.mark_down(peer);
    }
}
