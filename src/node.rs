//! A node wired from configuration: transport, discovery, metadata service
//! and membership entrypoints.

use crate::cluster::PeerLiveness;
use crate::config::RingmasterConfig;
use crate::discovery::{DiscoveredNodes, Discovery};
use crate::error::{Error, Result};
use crate::log::LogTransport;
use crate::metadata::ClusterMetadata;
use crate::network::{NetworkServer, TcpDelivery, Verb, VerbHandlers};
use crate::sequences::{LocalNode, OperationMode, Sequencer, SingleNodeSequences};
use crate::service::ClusterMetadataService;
use crate::transformation::Transformation;
use crate::types::NodeId;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{error, info};

/// Consecutive failed checks before a peer is considered down.
const FAILURE_CONFIRMATIONS: usize = 3;

/// A running cluster member.
///
/// Starting a node binds its listener, registers it in the metadata log
/// (seating it in the CMS if the CMS is still empty) and answers discovery
/// requests. Joining the ring is a separate step, see [`RingmasterNode::bootstrap`].
pub struct RingmasterNode {
    config: RingmasterConfig,
    endpoint: SocketAddr,
    node_id: NodeId,
    cms: Arc<ClusterMetadataService>,
    discovery: Arc<Discovery>,
    liveness: Arc<PeerLiveness>,
    sequences: SingleNodeSequences,
    shutdown_tx: mpsc::Sender<()>,
}

impl RingmasterNode {
    /// Start a node on top of `log`.
    pub async fn start(config: RingmasterConfig, log: Arc<dyn LogTransport>) -> Result<Self> {
        config.validate()?;
        let handlers = VerbHandlers::new();
        let (server, shutdown_tx) = NetworkServer::bind(config.endpoint, Arc::new(handlers.clone())).await?;
        let endpoint = server.local_addr()?;
        info!(endpoint = %endpoint, location = %config.location, "Starting node");

        tokio::spawn(async move {
            if let Err(e) = server.run().await {
                error!(error = %e, "Network server error");
            }
        });

        let cms = Arc::new(ClusterMetadataService::new(log, config.commit.clone()));
        let discovery = Arc::new(Discovery::new(
            endpoint,
            config.discovery.clone(),
            Arc::new(TcpDelivery::new()),
        ));
        discovery.set_cms(cms.clone());
        handlers.register(Verb::DiscoverReq, discovery.clone());

        let md = Self::register(&cms, endpoint, &config).await?;
        let node_id = md
            .directory
            .peer_id(endpoint)
            .ok_or_else(|| Error::Internal(format!("{} missing after registration", endpoint)))?;

        let mode = match md.state(node_id) {
            Some(state) if state.is_ring_member() => OperationMode::Normal,
            _ => OperationMode::Starting,
        };
        let local = Arc::new(LocalNode::registered(node_id, endpoint, mode));
        let liveness = Arc::new(PeerLiveness::new(node_id, FAILURE_CONFIRMATIONS));
        let sequencer = Arc::new(Sequencer::new(
            cms.clone(),
            local,
            liveness.clone(),
            config.sequence.clone(),
        ));

        info!(node_id = %node_id, endpoint = %endpoint, epoch = %md.epoch, "Node started");
        Ok(Self {
            config,
            endpoint,
            node_id,
            cms,
            discovery,
            liveness,
            sequences: SingleNodeSequences::new(sequencer),
            shutdown_tx,
        })
    }

    async fn register(
        cms: &ClusterMetadataService,
        endpoint: SocketAddr,
        config: &RingmasterConfig,
    ) -> Result<Arc<ClusterMetadata>> {
        let mut md = cms.metadata();
        if md.directory.peer_id(endpoint).is_none() {
            md = cms
                .commit(Transformation::register(endpoint, config.location.clone()))
                .await?;
        }

        if md.cms_members.is_empty() {
            if let Some(node_id) = md.directory.peer_id(endpoint) {
                info!(node_id = %node_id, "CMS: seating first member");
                md = cms
                    .commit(Transformation::ReconfigureCms {
                        add: vec![node_id],
                        remove: vec![],
                    })
                    .await?;
            }
        }
        Ok(md)
    }

    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    /// Address the node is listening on.
    pub fn endpoint(&self) -> SocketAddr {
        self.endpoint
    }

    pub fn metadata(&self) -> Arc<ClusterMetadata> {
        self.cms.metadata()
    }

    pub fn cms(&self) -> &Arc<ClusterMetadataService> {
        &self.cms
    }

    pub fn liveness(&self) -> &Arc<PeerLiveness> {
        &self.liveness
    }

    pub fn sequences(&self) -> &SingleNodeSequences {
        &self.sequences
    }

    /// Find peers through the configured seeds.
    pub async fn discover(&self, rounds: usize) -> DiscoveredNodes {
        self.discovery.discover(rounds).await
    }

    /// Join the ring with tokens chosen from the allocation config.
    pub async fn bootstrap(&self) -> Result<Arc<ClusterMetadata>> {
        self.sequences.bootstrap(&self.config.allocation).await
    }

    /// Stop answering requests.
    pub async fn shutdown(&self) {
        info!(node_id = %self.node_id, "Shutting down node");
        let _ = self.shutdown_tx.send(()).await;
    }
}

impl std::fmt::Debug for RingmasterNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RingmasterNode")
            .field("node_id", &self.node_id)
            .field("endpoint", &self.endpoint)
            .field("epoch", &self.cms.metadata().epoch)
            .finish()
    }
}
