//! In-memory message delivery with deterministic failure injection.

use crate::network::{FailureReason, Message, MessageDelivery, VerbHandlers};
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tracing::trace;

/// Which requests the network drops.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailurePolicy {
    /// Deliver everything.
    None,
    /// Every nth request a node sends to a reachable peer times out.
    EveryNth(u64),
}

impl FailurePolicy {
    fn drops(&self, count: u64) -> bool {
        match self {
            FailurePolicy::None => false,
            FailurePolicy::EveryNth(n) => *n > 0 && count % n == 0,
        }
    }
}

struct SimulatedNode {
    handlers: VerbHandlers,
    sent: AtomicU64,
    delivered_any: AtomicBool,
}

/// A set of in-memory nodes. Requests to addresses without a node time out.
pub struct SimulatedNetwork {
    nodes: RwLock<HashMap<SocketAddr, Arc<SimulatedNode>>>,
    partitions: RwLock<HashSet<(SocketAddr, SocketAddr)>>,
    policy: FailurePolicy,
}

impl SimulatedNetwork {
    pub fn new(policy: FailurePolicy) -> Arc<Self> {
        Arc::new(Self {
            nodes: RwLock::new(HashMap::new()),
            partitions: RwLock::new(HashSet::new()),
            policy,
        })
    }

    /// Add a node and return its handlers and outbound delivery.
    pub fn add_node(self: &Arc<Self>, addr: SocketAddr) -> (VerbHandlers, Arc<SimulatedDelivery>) {
        let handlers = VerbHandlers::new();
        self.nodes.write().insert(
            addr,
            Arc::new(SimulatedNode {
                handlers: handlers.clone(),
                sent: AtomicU64::new(0),
                delivered_any: AtomicBool::new(false),
            }),
        );
        let delivery = Arc::new(SimulatedDelivery {
            network: self.clone(),
            local: addr,
        });
        (handlers, delivery)
    }

    /// Cut traffic between two nodes in both directions.
    pub fn partition(&self, a: SocketAddr, b: SocketAddr) {
        let mut partitions = self.partitions.write();
        partitions.insert((a, b));
        partitions.insert((b, a));
    }

    pub fn heal(&self) {
        self.partitions.write().clear();
    }

    /// Whether `addr` got at least one request through to a peer.
    pub fn has_delivered(&self, addr: SocketAddr) -> bool {
        self.nodes
            .read()
            .get(&addr)
            .map_or(false, |n| n.delivered_any.load(Ordering::SeqCst))
    }

    /// Nodes that got at least one request through.
    pub fn connected(&self) -> HashSet<SocketAddr> {
        self.nodes
            .read()
            .iter()
            .filter(|(_, n)| n.delivered_any.load(Ordering::SeqCst))
            .map(|(addr, _)| *addr)
            .collect()
    }

    fn deliver(&self, from: SocketAddr, to: SocketAddr, message: Message) -> Result<Message, FailureReason> {
        let (sender, target) = {
            let nodes = self.nodes.read();
            (nodes.get(&from).cloned(), nodes.get(&to).cloned())
        };
        let Some(target) = target else {
            trace!(from = %from, to = %to, "SIM: no such node");
            return Err(FailureReason::Timeout);
        };
        if self.partitions.read().contains(&(from, to)) {
            trace!(from = %from, to = %to, "SIM: partitioned");
            return Err(FailureReason::Timeout);
        }
        if let Some(sender) = &sender {
            let count = sender.sent.fetch_add(1, Ordering::SeqCst) + 1;
            if self.policy.drops(count) {
                trace!(from = %from, to = %to, count, "SIM: injected failure");
                return Err(FailureReason::Timeout);
            }
            sender.delivered_any.store(true, Ordering::SeqCst);
        }

        match target.handlers.dispatch(message) {
            Ok(Some(response)) => Ok(response),
            Ok(None) => Err(FailureReason::Timeout),
            Err(_) => Err(FailureReason::NoHandler),
        }
    }
}

impl std::fmt::Debug for SimulatedNetwork {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SimulatedNetwork")
            .field("nodes", &self.nodes.read().len())
            .field("policy", &self.policy)
            .finish()
    }
}

/// Outbound side of one simulated node.
#[derive(Debug)]
pub struct SimulatedDelivery {
    network: Arc<SimulatedNetwork>,
    local: SocketAddr,
}

#[async_trait::async_trait]
impl MessageDelivery for SimulatedDelivery {
    async fn request(&self, to: SocketAddr, message: Message) -> Result<Message, FailureReason> {
        // Let the other tasks of the round run before answering.
        tokio::task::yield_now().await;
        self.network.deliver(self.local, to, message)
    }
}
