//! Token allocation.
//!
//! [`TokenAllocation`] picks ring positions for a node so that replicated
//! ownership stays balanced among the nodes it shares an allocation ring with.
//! Which nodes those are follows from the replication factor and the rack
//! layout of the node's datacenter (see [`AllocationStrategy`]).
//!
//! A computed token that is already claimed by a node in the same allocation
//! ring means two nodes allocated concurrently; the whole allocation fails
//! with [`AllocationError::TokenClash`]. Tokens claimed by nodes outside the
//! ring are skipped by probing forward to the next valid token.

mod allocator;
mod bootstrap;
mod stats;
mod strategy;

pub use allocator::TokenAllocator;
pub use bootstrap::BootstrapTokens;
pub use stats::{OwnershipStats, WARN_STDEV_GROWTH};
pub use strategy::{AllocationStrategy, Group};

use crate::error::{AllocationError, Result};
use crate::metadata::{ClusterMetadata, ReplicationParams};
use crate::types::{Location, NodeId, NodeState, Token};
use std::collections::{BTreeMap, HashMap};
use tracing::{debug, info, warn};

/// Allocation session over a working copy of the metadata.
///
/// Each allocation is applied to the working copy, so consecutive calls see
/// the tokens handed out before them.
#[derive(Debug, Clone)]
pub struct TokenAllocation {
    metadata: ClusterMetadata,
    replication: ReplicationParams,
    num_tokens: usize,
    strategies: HashMap<Location, AllocationStrategy>,
}

impl TokenAllocation {
    pub fn new(metadata: ClusterMetadata, replication: ReplicationParams, num_tokens: usize) -> Result<Self> {
        if num_tokens == 0 {
            return Err(AllocationError::InvalidTokenCount(num_tokens).into());
        }
        Ok(Self {
            metadata,
            replication,
            num_tokens,
            strategies: HashMap::new(),
        })
    }

    /// Allocate as if `replicas` copies were kept in `datacenter` only.
    pub fn for_local_replicas(
        metadata: ClusterMetadata,
        datacenter: &str,
        replicas: usize,
        num_tokens: usize,
    ) -> Result<Self> {
        Self::new(metadata, ReplicationParams::local(datacenter, replicas), num_tokens)
    }

    /// Working copy, including every allocation made so far.
    pub fn metadata(&self) -> &ClusterMetadata {
        &self.metadata
    }

    /// Choose tokens for a registered node.
    pub fn allocate(&mut self, node_id: NodeId) -> Result<Vec<Token>> {
        let location = self
            .metadata
            .directory
            .location(node_id)
            .cloned()
            .ok_or(AllocationError::UnknownNode(node_id))?;
        let strategy = self.strategy(&location)?;

        let groups = strategy.ring_groups(&self.metadata.directory);
        let ring: BTreeMap<Token, NodeId> = self
            .metadata
            .token_map
            .iter()
            .filter(|(_, owner)| groups.contains_key(owner))
            .collect();

        let mut allocator = TokenAllocator::new(ring, groups, strategy.replicas());
        let tokens = allocator.add_unit(node_id, self.num_tokens);
        let tokens = self.adjust_for_clashes(&strategy, tokens)?;

        let before = self.ring_stats(&strategy);
        self.metadata
            .token_map
            .assign(node_id, &tokens)
            .map_err(|(token, owner)| AllocationError::TokenOwned { token, owner })?;
        self.metadata.directory.set_state(node_id, NodeState::Joined);
        let after = self.ring_stats(&strategy);

        info!(node_id = %node_id, tokens = ?tokens, "Selected tokens");
        debug!(before = %before, after = %after, "Replicated ownership in allocation ring");
        if let Some(message) = before.growth_warning(&after) {
            warn!("{}", message);
        }

        Ok(tokens)
    }

    /// Ownership statistics of the allocation ring a node at `location` would join.
    pub fn ring_ownership(&mut self, location: &Location) -> Result<OwnershipStats> {
        let strategy = self.strategy(location)?;
        Ok(self.ring_stats(&strategy))
    }

    fn strategy(&mut self, location: &Location) -> Result<AllocationStrategy> {
        if let Some(strategy) = self.strategies.get(location) {
            return Ok(strategy.clone());
        }
        let strategy = AllocationStrategy::for_location(&self.replication, &self.metadata.directory, location)?;
        self.strategies.insert(location.clone(), strategy.clone());
        Ok(strategy)
    }

    /// Resolve collisions with tokens already claimed elsewhere.
    fn adjust_for_clashes(&self, strategy: &AllocationStrategy, tokens: Vec<Token>) -> Result<Vec<Token>> {
        let mut adjusted: Vec<Token> = Vec::with_capacity(tokens.len());
        for mut token in tokens {
            loop {
                if adjusted.contains(&token) {
                    token = token.next_valid();
                    continue;
                }
                let Some(owner) = self.metadata.token_claimant(token) else {
                    break;
                };
                let same_ring = self
                    .metadata
                    .directory
                    .location(owner)
                    .map_or(false, |loc| strategy.in_allocation_ring(loc));
                if same_ring {
                    return Err(AllocationError::TokenClash { token, owner }.into());
                }
                token = token.next_valid();
            }
            adjusted.push(token);
        }
        adjusted.sort();
        Ok(adjusted)
    }

    /// Per-token replicated ownership of every ring member, using the real
    /// replication settings over the full ring.
    fn ring_stats(&self, strategy: &AllocationStrategy) -> OwnershipStats {
        let md = &self.metadata;
        let mut owned: BTreeMap<NodeId, f64> = BTreeMap::new();
        for (range, _) in md.token_map.ranges() {
            let representative = range.start.midpoint(range.end);
            for node in self.replication.replicas_for(representative, &md.token_map, &md.directory) {
                *owned.entry(node).or_insert(0.0) += range.size();
            }
        }

        let values: Vec<f64> = owned
            .into_iter()
            .filter(|(node, _)| {
                md.directory
                    .location(*node)
                    .map_or(false, |loc| strategy.in_allocation_ring(loc))
            })
            .filter_map(|(node, share)| {
                let count = md.token_map.tokens_of(node).len();
                (count > 0).then(|| share / count as f64)
            })
            .collect();
        OwnershipStats::from_values(&values)
    }
}

/// Allocate `num_tokens` tokens for `node_id` against `metadata`.
pub fn allocate_tokens(
    metadata: &ClusterMetadata,
    replication: &ReplicationParams,
    node_id: NodeId,
    num_tokens: usize,
) -> Result<Vec<Token>> {
    TokenAllocation::new(metadata.clone(), replication.clone(), num_tokens)?.allocate(node_id)
}
