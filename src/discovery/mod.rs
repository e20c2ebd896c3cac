//! Bootstrap peer discovery.
//!
//! A node with no position in the metadata log learns the live peer set by
//! repeatedly asking its seeds (and every peer it has heard of so far) who
//! they know:
//!
//! ```text
//!   round n:   seeds ∪ discovered ──DISCOVER_REQ──► peers   (one task each,
//!                                 ◄─DISCOVER_RSP──          own deadline)
//!              discovered ∪= responses
//!   stop when: discovered ≠ ∅ and unchanged for `rounds` rounds
//!              | a peer answers with the CMS endpoints
//!              | max_rounds reached
//! ```
//!
//! A peer that already knows the CMS short-circuits the attempt by answering
//! [`DiscoveryKind::CmsOnly`].

use crate::config::DiscoveryConfig;
use crate::network::{FailureReason, Message, MessageDelivery, Payload, Verb, VerbHandler};
use crate::service::ClusterMetadataService;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::task::JoinSet;
use tracing::{debug, info, trace};

/// What a discovery response describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DiscoveryKind {
    /// Every peer the responder has heard from.
    KnownPeers,
    /// The members of the cluster metadata service.
    CmsOnly,
}

/// A set of peer addresses collected during discovery.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveredNodes {
    pub nodes: BTreeSet<SocketAddr>,
    pub kind: DiscoveryKind,
}

impl DiscoveredNodes {
    pub fn new(nodes: BTreeSet<SocketAddr>, kind: DiscoveryKind) -> Self {
        Self { nodes, kind }
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

/// Discovery state of one node. Serves `DISCOVER_REQ` as well as issuing it.
pub struct Discovery {
    local: SocketAddr,
    config: DiscoveryConfig,
    delivery: Arc<dyn MessageDelivery>,
    discovered: RwLock<BTreeSet<SocketAddr>>,
    cms: RwLock<Option<Arc<ClusterMetadataService>>>,
    next_id: AtomicU64,
}

impl Discovery {
    pub fn new(local: SocketAddr, config: DiscoveryConfig, delivery: Arc<dyn MessageDelivery>) -> Self {
        Self {
            local,
            config,
            delivery,
            discovered: RwLock::new(BTreeSet::new()),
            cms: RwLock::new(None),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn local(&self) -> SocketAddr {
        self.local
    }

    /// Peers heard of so far.
    pub fn discovered(&self) -> BTreeSet<SocketAddr> {
        self.discovered.read().clone()
    }

    /// Attach the metadata service once this node has a log position; from
    /// then on requests are answered with the CMS endpoints.
    pub fn set_cms(&self, cms: Arc<ClusterMetadataService>) {
        *self.cms.write() = Some(cms);
    }

    /// Run one discovery attempt.
    ///
    /// Ends once the discovered set is non-empty and has not changed for
    /// `rounds` consecutive rounds, when a peer reports the CMS endpoints, or
    /// after `max_rounds` rounds. A node that never completes a request
    /// returns an empty set.
    pub async fn discover(&self, rounds: usize) -> DiscoveredNodes {
        let mut unchanged = 0usize;
        let mut last_count = self.discovered.read().len();

        for round in 1..=self.config.max_rounds {
            let candidates = self.candidates();
            trace!(local = %self.local, round, candidates = candidates.len(), "DISCOVERY: starting round");

            if let Some(cms) = self.discover_once(candidates).await {
                info!(local = %self.local, cms = ?cms.nodes, "DISCOVERY: found CMS members");
                return cms;
            }

            let count = self.discovered.read().len();
            if count == last_count {
                unchanged += 1;
            } else {
                unchanged = 0;
                last_count = count;
            }

            if count > 0 && unchanged >= rounds {
                break;
            }
            tokio::time::sleep(self.config.round_interval).await;
        }

        let nodes = self.discovered();
        info!(local = %self.local, discovered = nodes.len(), "DISCOVERY: finished");
        DiscoveredNodes::new(nodes, DiscoveryKind::KnownPeers)
    }

    fn candidates(&self) -> BTreeSet<SocketAddr> {
        let mut candidates: BTreeSet<SocketAddr> = self.config.seeds.iter().copied().collect();
        candidates.extend(self.discovered.read().iter().copied());
        candidates
    }

    /// One round: a request per candidate, each in its own task under the
    /// request deadline. Waits for all of them.
    async fn discover_once(&self, candidates: BTreeSet<SocketAddr>) -> Option<DiscoveredNodes> {
        let mut tasks = JoinSet::new();
        for peer in candidates {
            let delivery = self.delivery.clone();
            let request = Message::discover(self.next_id.fetch_add(1, Ordering::Relaxed), self.local);
            let deadline = self.config.request_timeout;
            tasks.spawn(async move {
                let outcome = match tokio::time::timeout(deadline, delivery.request(peer, request)).await {
                    Ok(outcome) => outcome,
                    Err(_) => Err(FailureReason::Timeout),
                };
                (peer, outcome)
            });
        }

        let mut responses = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((peer, Ok(response))) => responses.push((peer, response)),
                Ok((peer, Err(reason))) => {
                    debug!(local = %self.local, peer = %peer, reason = %reason, "DISCOVERY: request failed");
                }
                Err(e) => debug!(local = %self.local, error = %e, "DISCOVERY: request task failed"),
            }
        }
        // Completion order varies; merge in address order.
        responses.sort_by_key(|(peer, _)| *peer);

        let mut discovered = self.discovered.write();
        for (peer, response) in responses {
            match response.payload {
                Payload::Discovered(found) if found.kind == DiscoveryKind::CmsOnly => return Some(found),
                Payload::Discovered(found) => {
                    discovered.insert(peer);
                    discovered.extend(found.nodes);
                }
                other => debug!(local = %self.local, peer = %peer, payload = ?other, "DISCOVERY: unexpected response"),
            }
        }
        None
    }

    fn response_for(&self) -> DiscoveredNodes {
        if let Some(cms) = self.cms.read().as_ref() {
            let members = cms.metadata().cms_endpoints();
            if !members.is_empty() {
                return DiscoveredNodes::new(members, DiscoveryKind::CmsOnly);
            }
        }
        DiscoveredNodes::new(self.discovered(), DiscoveryKind::KnownPeers)
    }
}

impl VerbHandler for Discovery {
    fn handle(&self, message: Message) -> Option<Message> {
        if message.verb != Verb::DiscoverReq {
            return None;
        }
        self.discovered.write().insert(message.from);
        let payload = Payload::Discovered(self.response_for());
        Some(message.response(self.local, Verb::DiscoverRsp, payload))
    }
}

impl fmt::Debug for Discovery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Discovery")
            .field("local", &self.local)
            .field("seeds", &self.config.seeds)
            .field("discovered", &self.discovered.read().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug)]
    struct Unreachable;

    #[async_trait::async_trait]
    impl MessageDelivery for Unreachable {
        async fn request(&self, _to: SocketAddr, _message: Message) -> Result<Message, FailureReason> {
            Err(FailureReason::Unreachable)
        }
    }

    fn addr(i: u8) -> SocketAddr {
        SocketAddr::from(([127, 0, 100, i], 7000))
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_reachable_seed_yields_empty_set() {
        let config = DiscoveryConfig::default().with_seeds(vec![addr(100)]).with_max_rounds(4);
        let discovery = Discovery::new(addr(1), config, Arc::new(Unreachable));

        let found = discovery.discover(2).await;
        assert!(found.is_empty());
        assert_eq!(found.kind, DiscoveryKind::KnownPeers);
    }

    #[test]
    fn test_handler_records_requester() {
        let discovery = Discovery::new(addr(1), DiscoveryConfig::default(), Arc::new(Unreachable));

        let rsp = discovery.handle(Message::discover(3, addr(2))).unwrap();
        assert_eq!(rsp.id, 3);
        assert_eq!(rsp.from, addr(1));
        match rsp.payload {
            Payload::Discovered(found) => {
                assert_eq!(found.kind, DiscoveryKind::KnownPeers);
                assert!(found.nodes.contains(&addr(2)));
            }
            other => panic!("unexpected payload {:?}", other),
        }
    }
}
