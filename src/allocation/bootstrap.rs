//! Token choice for a joining node.

use super::TokenAllocation;
use crate::config::AllocationConfig;
use crate::error::{AllocationError, Result};
use crate::metadata::ClusterMetadata;
use crate::types::{NodeId, Token};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::BTreeSet;
use tracing::info;

/// Picks the tokens a node bootstraps with.
///
/// Explicit tokens win, then the balancing allocator when a replication
/// factor is configured, then random positions.
#[derive(Debug, Clone)]
pub struct BootstrapTokens<'a> {
    config: &'a AllocationConfig,
}

impl<'a> BootstrapTokens<'a> {
    pub fn new(config: &'a AllocationConfig) -> Self {
        Self { config }
    }

    pub fn choose(&self, metadata: &ClusterMetadata, node_id: NodeId) -> Result<Vec<Token>> {
        if !self.config.initial_tokens.is_empty() {
            return self.initial(metadata);
        }
        if self.config.num_tokens == 0 {
            return Err(AllocationError::InvalidTokenCount(0).into());
        }

        match self.config.allocate_for_replicas {
            Some(replicas) => {
                let location = metadata
                    .directory
                    .location(node_id)
                    .ok_or(AllocationError::UnknownNode(node_id))?;
                let mut allocation = TokenAllocation::for_local_replicas(
                    metadata.clone(),
                    &location.datacenter,
                    replicas,
                    self.config.num_tokens,
                )?;
                allocation.allocate(node_id)
            }
            None => Ok(self.random(metadata)),
        }
    }

    fn initial(&self, metadata: &ClusterMetadata) -> Result<Vec<Token>> {
        let mut tokens = BTreeSet::new();
        for token in &self.config.initial_tokens {
            if let Some(owner) = metadata.token_claimant(*token) {
                return Err(AllocationError::TokenOwned { token: *token, owner }.into());
            }
            if !token.is_valid() || !tokens.insert(*token) {
                return Err(AllocationError::InvalidTokenCount(self.config.initial_tokens.len()).into());
            }
        }
        info!(tokens = ?tokens, "Using configured initial tokens");
        Ok(tokens.into_iter().collect())
    }

    fn random(&self, metadata: &ClusterMetadata) -> Vec<Token> {
        let mut rng = match self.config.random_seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_os_rng(),
        };

        let mut tokens = BTreeSet::new();
        while tokens.len() < self.config.num_tokens {
            let token = Token(rng.random::<i64>());
            if token.is_valid() && metadata.token_claimant(token).is_none() {
                tokens.insert(token);
            }
        }
        info!(tokens = ?tokens, "Generated random tokens");
        tokens.into_iter().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::types::{Location, NodeState};
    use std::net::SocketAddr;

    fn metadata_with_owner() -> (ClusterMetadata, NodeId, NodeId) {
        let mut md = ClusterMetadata::empty();
        let owner = md.directory.register(SocketAddr::from(([10, 0, 0, 1], 7000)), Location::new("dc1", "r1"));
        md.token_map.assign(owner, &[Token(100)]).unwrap();
        md.directory.set_state(owner, NodeState::Joined);
        let joining = md.directory.register(SocketAddr::from(([10, 0, 0, 2], 7000)), Location::new("dc1", "r1"));
        (md, owner, joining)
    }

    #[test]
    fn test_initial_tokens_must_be_free() {
        let (md, owner, joining) = metadata_with_owner();
        let config = AllocationConfig::default().with_initial_tokens(vec![Token(5), Token(100)]);
        let err = BootstrapTokens::new(&config).choose(&md, joining).unwrap_err();
        assert!(matches!(
            err,
            Error::Allocation(AllocationError::TokenOwned { token: Token(100), owner: o }) if o == owner
        ));

        let config = AllocationConfig::default().with_initial_tokens(vec![Token(7), Token(5)]);
        let tokens = BootstrapTokens::new(&config).choose(&md, joining).unwrap();
        assert_eq!(tokens, vec![Token(5), Token(7)]);
    }

    #[test]
    fn test_seeded_random_tokens_are_reproducible() {
        let (md, _, joining) = metadata_with_owner();
        let config = AllocationConfig::default().with_num_tokens(8).with_random_seed(42);
        let first = BootstrapTokens::new(&config).choose(&md, joining).unwrap();
        let second = BootstrapTokens::new(&config).choose(&md, joining).unwrap();
        assert_eq!(first, second);
        assert_eq!(first.len(), 8);
        assert!(!first.contains(&Token(100)));
    }

    #[test]
    fn test_allocator_used_when_replicas_configured() {
        let (md, _, joining) = metadata_with_owner();
        let config = AllocationConfig::default()
            .with_num_tokens(4)
            .with_allocate_for_replicas(1);
        let tokens = BootstrapTokens::new(&config).choose(&md, joining).unwrap();
        assert_eq!(tokens.len(), 4);
        assert!(tokens.iter().all(|t| md.token_claimant(*t).is_none()));
    }
}
