//! Configuration types for the cluster metadata subsystem.

use crate::error::{Error, Result};
use crate::service::RetryPolicy;
use crate::types::{Location, Token};
use std::net::SocketAddr;
use std::time::Duration;

/// Main configuration for a node participating in cluster metadata.
#[derive(Debug, Clone)]
pub struct RingmasterConfig {
    /// Address this node is reachable at.
    pub endpoint: SocketAddr,

    /// Datacenter and rack of this node.
    pub location: Location,

    /// Commit loop configuration.
    pub commit: CommitConfig,

    /// Discovery configuration.
    pub discovery: DiscoveryConfig,

    /// Token allocation configuration.
    pub allocation: AllocationConfig,

    /// Multi-step operation configuration.
    pub sequence: SequenceConfig,
}

impl Default for RingmasterConfig {
    fn default() -> Self {
        Self {
            endpoint: SocketAddr::from(([127, 0, 0, 1], 7000)),
            location: Location::new("dc1", "rack1"),
            commit: CommitConfig::default(),
            discovery: DiscoveryConfig::default(),
            allocation: AllocationConfig::default(),
            sequence: SequenceConfig::default(),
        }
    }
}

impl RingmasterConfig {
    /// Create a new configuration for the given endpoint.
    pub fn new(endpoint: SocketAddr) -> Self {
        Self {
            endpoint,
            ..Default::default()
        }
    }

    /// Set the node location.
    pub fn with_location(mut self, location: Location) -> Self {
        self.location = location;
        self
    }

    /// Set seed addresses for discovery.
    pub fn with_seeds(mut self, seeds: Vec<SocketAddr>) -> Self {
        self.discovery.seeds = seeds;
        self
    }

    /// Set commit configuration.
    pub fn with_commit_config(mut self, commit: CommitConfig) -> Self {
        self.commit = commit;
        self
    }

    /// Set discovery configuration.
    pub fn with_discovery_config(mut self, discovery: DiscoveryConfig) -> Self {
        self.discovery = discovery;
        self
    }

    /// Set allocation configuration.
    pub fn with_allocation_config(mut self, allocation: AllocationConfig) -> Self {
        self.allocation = allocation;
        self
    }

    /// Set sequence configuration.
    pub fn with_sequence_config(mut self, sequence: SequenceConfig) -> Self {
        self.sequence = sequence;
        self
    }

    /// Reject settings a node cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.commit.retry.max_attempts == 0 {
            return Err(Error::Config("commit.retry.max_attempts must be at least 1".to_string()));
        }
        if self.commit.retry.multiplier < 1.0 {
            return Err(Error::Config("commit.retry.multiplier must be at least 1.0".to_string()));
        }
        if self.discovery.max_rounds == 0 {
            return Err(Error::Config("discovery.max_rounds must be at least 1".to_string()));
        }
        if self.allocation.initial_tokens.is_empty() && self.allocation.num_tokens == 0 {
            return Err(Error::Config(
                "allocation.num_tokens must be at least 1 without initial tokens".to_string(),
            ));
        }
        if self.allocation.allocate_for_replicas == Some(0) {
            return Err(Error::Config("allocation.allocate_for_replicas must be at least 1".to_string()));
        }
        if self.sequence.step_timeout.is_zero() {
            return Err(Error::Config("sequence.step_timeout must be positive".to_string()));
        }
        Ok(())
    }
}

/// Optimistic commit configuration.
#[derive(Debug, Clone)]
pub struct CommitConfig {
    /// Retry budget and backoff for conflicting appends.
    pub retry: RetryPolicy,

    /// Upper bound on a single commit including all retries.
    pub timeout: Duration,
}

impl Default for CommitConfig {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            timeout: Duration::from_secs(10),
        }
    }
}

impl CommitConfig {
    /// Set the retry policy.
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Set the overall commit deadline.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

/// Bootstrap discovery configuration.
#[derive(Debug, Clone)]
pub struct DiscoveryConfig {
    /// Seed addresses contacted every round.
    pub seeds: Vec<SocketAddr>,

    /// Deadline for each individual discovery request.
    pub request_timeout: Duration,

    /// Pause between rounds.
    pub round_interval: Duration,

    /// Hard cap on rounds per attempt, whatever the caller asks for.
    pub max_rounds: usize,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            seeds: Vec::new(),
            request_timeout: Duration::from_secs(2),
            round_interval: Duration::from_millis(500),
            max_rounds: 30,
        }
    }
}

impl DiscoveryConfig {
    /// Set seed addresses.
    pub fn with_seeds(mut self, seeds: Vec<SocketAddr>) -> Self {
        self.seeds = seeds;
        self
    }

    /// Set the per-request deadline.
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Set the pause between rounds.
    pub fn with_round_interval(mut self, interval: Duration) -> Self {
        self.round_interval = interval;
        self
    }

    /// Set the hard cap on rounds.
    pub fn with_max_rounds(mut self, rounds: usize) -> Self {
        self.max_rounds = rounds;
        self
    }
}

/// Token selection configuration for joining nodes.
#[derive(Debug, Clone)]
pub struct AllocationConfig {
    /// Tokens per node.
    pub num_tokens: usize,

    /// Run the balancing allocator for this local replication factor.
    /// When unset, tokens are chosen at random.
    pub allocate_for_replicas: Option<usize>,

    /// Explicit tokens, used verbatim when non-empty.
    pub initial_tokens: Vec<Token>,

    /// Seed for random token selection (reproducible tests).
    pub random_seed: Option<u64>,
}

impl Default for AllocationConfig {
    fn default() -> Self {
        Self {
            num_tokens: 16,
            allocate_for_replicas: None,
            initial_tokens: Vec::new(),
            random_seed: None,
        }
    }
}

impl AllocationConfig {
    /// Set tokens per node.
    pub fn with_num_tokens(mut self, num_tokens: usize) -> Self {
        self.num_tokens = num_tokens;
        self
    }

    /// Enable the balancing allocator for the given replication factor.
    pub fn with_allocate_for_replicas(mut self, replicas: usize) -> Self {
        self.allocate_for_replicas = Some(replicas);
        self
    }

    /// Use explicit initial tokens.
    pub fn with_initial_tokens(mut self, tokens: Vec<Token>) -> Self {
        self.initial_tokens = tokens;
        self
    }

    /// Seed the random token generator.
    pub fn with_random_seed(mut self, seed: u64) -> Self {
        self.random_seed = Some(seed);
        self
    }
}

/// Multi-step operation configuration.
#[derive(Debug, Clone)]
pub struct SequenceConfig {
    /// Deadline for executing a single step (external work plus its commit).
    pub step_timeout: Duration,
}

impl Default for SequenceConfig {
    fn default() -> Self {
        Self {
            step_timeout: Duration::from_secs(60),
        }
    }
}

impl SequenceConfig {
    /// Set the per-step deadline.
    pub fn with_step_timeout(mut self, timeout: Duration) -> Self {
        self.step_timeout = timeout;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = RingmasterConfig::default();
        assert_eq!(config.location, Location::new("dc1", "rack1"));
        assert_eq!(config.allocation.num_tokens, 16);
        assert!(config.discovery.seeds.is_empty());
        assert!(config.commit.retry.max_attempts > 0);
    }

    #[test]
    fn test_config_builder() {
        let seed: SocketAddr = "127.0.0.1:7001".parse().unwrap();
        let config = RingmasterConfig::new("127.0.0.1:7002".parse().unwrap())
            .with_location(Location::new("dc2", "r3"))
            .with_seeds(vec![seed])
            .with_allocation_config(AllocationConfig::default().with_allocate_for_replicas(3));

        assert_eq!(config.discovery.seeds, vec![seed]);
        assert_eq!(config.location.datacenter, "dc2");
        assert_eq!(config.allocation.allocate_for_replicas, Some(3));
    }

    #[test]
    fn test_validate() {
        assert!(RingmasterConfig::default().validate().is_ok());

        let invalid = [
            RingmasterConfig::default()
                .with_allocation_config(AllocationConfig::default().with_num_tokens(0)),
            RingmasterConfig::default()
                .with_discovery_config(DiscoveryConfig::default().with_max_rounds(0)),
            RingmasterConfig::default().with_commit_config(
                CommitConfig::default().with_retry(RetryPolicy::default().with_max_attempts(0)),
            ),
            RingmasterConfig::default()
                .with_allocation_config(AllocationConfig::default().with_allocate_for_replicas(0)),
            RingmasterConfig::default()
                .with_sequence_config(SequenceConfig::default().with_step_timeout(Duration::ZERO)),
        ];
        for config in invalid {
            let err = config.validate().unwrap_err();
            assert!(matches!(err, Error::Config(_)), "{:?}", err);
        }

        // Explicit tokens make the token count irrelevant.
        let explicit = RingmasterConfig::default().with_allocation_config(
            AllocationConfig::default()
                .with_num_tokens(0)
                .with_initial_tokens(vec![Token(1)]),
        );
        assert!(explicit.validate().is_ok());
    }
}
