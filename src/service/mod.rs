//! Cluster Metadata Service: the single coordination point for commits.
//!
//! Every mutation goes through [`ClusterMetadataService::commit`], which runs
//! an optimistic read-validate-append loop against the [`LogTransport`]. A
//! conflicting append means someone else committed first; the loop re-reads
//! the log and tries again under a bounded [`RetryPolicy`]. Validation
//! failures are terminal and never reach the log.
//!
//! The service is an explicit handle. Components that commit take an
//! `Arc<ClusterMetadataService>`; there is no process-wide instance.

mod retry;

pub use retry::{Backoff, RetryPolicy};

use crate::config::CommitConfig;
use crate::error::{Error, Result};
use crate::log::{AppendOutcome, LogTransport};
use crate::metadata::ClusterMetadata;
use crate::transformation::Transformation;
use crate::types::Epoch;
use parking_lot::RwLock;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// How this node currently manages membership.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceState {
    /// Membership still comes from the legacy gossip mechanism.
    Gossip,
    /// Migrating from gossip to the metadata log.
    Migrating,
    /// The metadata log is authoritative.
    Ready,
}

impl fmt::Display for ServiceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServiceState::Gossip => write!(f, "GOSSIP"),
            ServiceState::Migrating => write!(f, "MIGRATING"),
            ServiceState::Ready => write!(f, "READY"),
        }
    }
}

/// Commit counters.
#[derive(Debug, Default)]
pub struct CommitStats {
    commits: AtomicU64,
    conflicts: AtomicU64,
    rejections: AtomicU64,
}

impl CommitStats {
    /// Transformations appended.
    pub fn commits(&self) -> u64 {
        self.commits.load(Ordering::Relaxed)
    }

    /// Appends that lost a race and were retried.
    pub fn conflicts(&self) -> u64 {
        self.conflicts.load(Ordering::Relaxed)
    }

    /// Transformations refused by validation.
    pub fn rejections(&self) -> u64 {
        self.rejections.load(Ordering::Relaxed)
    }
}

/// Handle for reading and committing cluster metadata.
pub struct ClusterMetadataService {
    log: Arc<dyn LogTransport>,
    config: CommitConfig,
    state: RwLock<ServiceState>,
    stats: CommitStats,
}

impl ClusterMetadataService {
    /// Create a service committing through `log`.
    pub fn new(log: Arc<dyn LogTransport>, config: CommitConfig) -> Self {
        Self {
            log,
            config,
            state: RwLock::new(ServiceState::Ready),
            stats: CommitStats::default(),
        }
    }

    /// The latest committed snapshot.
    pub fn metadata(&self) -> Arc<ClusterMetadata> {
        self.log.current()
    }

    /// The underlying log.
    pub fn log(&self) -> &Arc<dyn LogTransport> {
        &self.log
    }

    pub fn state(&self) -> ServiceState {
        *self.state.read()
    }

    pub fn set_state(&self, state: ServiceState) {
        let mut current = self.state.write();
        if *current != state {
            info!(from = %*current, to = %state, "CMS: service state changed");
            *current = state;
        }
    }

    /// Whether membership changes are currently refused.
    pub fn is_migrating(&self) -> bool {
        self.state() == ServiceState::Migrating
    }

    pub fn stats(&self) -> &CommitStats {
        &self.stats
    }

    /// Wait until the log reaches `epoch`.
    pub async fn await_epoch(&self, epoch: Epoch, timeout: Duration) -> Result<Arc<ClusterMetadata>> {
        self.log.await_epoch(epoch, timeout).await
    }

    /// Commit a transformation, retrying on conflicts.
    ///
    /// Returns the snapshot the transformation produced.
    pub async fn commit(&self, transformation: Transformation) -> Result<Arc<ClusterMetadata>> {
        if transformation.is_membership_change() && self.is_migrating() {
            return Err(Error::precondition(
                "cluster is migrating to the metadata log; membership changes are not allowed",
            ));
        }

        match tokio::time::timeout(self.config.timeout, self.commit_loop(transformation)).await {
            Ok(result) => result,
            Err(_) => {
                warn!(timeout = ?self.config.timeout, "CMS: commit deadline expired");
                Err(Error::Timeout)
            }
        }
    }

    async fn commit_loop(&self, transformation: Transformation) -> Result<Arc<ClusterMetadata>> {
        let mut backoff = self.config.retry.backoff();
        let mut attempts = 0;

        loop {
            attempts += 1;
            let current = self.log.current();

            // Validate locally first so invalid commands never reach the log.
            if let Err(rejection) = transformation.execute(&current) {
                self.stats.rejections.fetch_add(1, Ordering::Relaxed);
                debug!(
                    transformation = %transformation,
                    epoch = %current.epoch,
                    reason = %rejection,
                    "CMS: transformation rejected"
                );
                return Err(rejection.into());
            }

            match self.log.append(transformation.clone(), current.epoch).await? {
                AppendOutcome::Accepted(next) => {
                    self.stats.commits.fetch_add(1, Ordering::Relaxed);
                    info!(
                        transformation = %transformation,
                        epoch = %next.epoch,
                        attempts,
                        "CMS: committed"
                    );
                    return Ok(next);
                }
                AppendOutcome::Rejected(rejection) => {
                    self.stats.rejections.fetch_add(1, Ordering::Relaxed);
                    return Err(rejection.into());
                }
                AppendOutcome::Conflict { current } => {
                    self.stats.conflicts.fetch_add(1, Ordering::Relaxed);
                    match backoff.next_delay() {
                        Some(delay) => {
                            debug!(
                                transformation = %transformation,
                                epoch = %current.epoch,
                                attempts,
                                "CMS: log advanced concurrently, retrying"
                            );
                            tokio::time::sleep(delay).await;
                        }
                        None => {
                            warn!(
                                transformation = %transformation,
                                attempts,
                                "CMS: commit retries exhausted"
                            );
                            return Err(Error::CommitRetriesExhausted {
                                attempts,
                                last_epoch: current.epoch,
                            });
                        }
                    }
                }
            }
        }
    }
}

impl fmt::Debug for ClusterMetadataService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClusterMetadataService")
            .field("epoch", &self.metadata().epoch)
            .field("state", &self.state())
            .field("commits", &self.stats.commits())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::log::{LocalLog, LogEntry};
    use crate::types::{Location, NodeId};
    use std::net::SocketAddr;
    use std::sync::atomic::AtomicUsize;
    use tokio::sync::watch;

    fn register(i: u8) -> Transformation {
        Transformation::register(
            SocketAddr::from(([10, 0, 0, i], 7000)),
            Location::new("dc1", "r1"),
        )
    }

    /// Log where a competing writer commits right before each of our
    /// appends, for the first `contended` appends.
    #[derive(Debug)]
    struct ContendedLog {
        inner: LocalLog,
        contended: AtomicUsize,
        competitor_port: AtomicUsize,
    }

    impl ContendedLog {
        fn new(contended: usize) -> Self {
            Self {
                inner: LocalLog::new(),
                contended: AtomicUsize::new(contended),
                competitor_port: AtomicUsize::new(9000),
            }
        }
    }

    #[async_trait::async_trait]
    impl LogTransport for ContendedLog {
        async fn append(&self, t: Transformation, expected: Epoch) -> Result<AppendOutcome> {
            if self.contended.load(Ordering::SeqCst) > 0 {
                self.contended.fetch_sub(1, Ordering::SeqCst);
                let port = self.competitor_port.fetch_add(1, Ordering::SeqCst) as u16;
                let competitor = Transformation::register(
                    SocketAddr::from(([10, 9, 9, 9], port)),
                    Location::new("dc1", "r1"),
                );
                let epoch = self.inner.current().epoch;
                self.inner.append(competitor, epoch).await?;
            }
            self.inner.append(t, expected).await
        }

        fn current(&self) -> Arc<ClusterMetadata> {
            self.inner.current()
        }

        fn subscribe(&self) -> watch::Receiver<Arc<ClusterMetadata>> {
            self.inner.subscribe()
        }

        fn entries_since(&self, epoch: Epoch) -> Vec<LogEntry> {
            self.inner.entries_since(epoch)
        }
    }

    fn fast_config(max_attempts: usize) -> CommitConfig {
        CommitConfig::default().with_retry(
            RetryPolicy::default()
                .with_max_attempts(max_attempts)
                .with_backoff(Duration::from_millis(1), Duration::from_millis(2)),
        )
    }

    #[tokio::test]
    async fn test_commit_advances_epoch() {
        let cms = ClusterMetadataService::new(Arc::new(LocalLog::new()), CommitConfig::default());
        let md = cms.commit(register(1)).await.unwrap();
        assert_eq!(md.epoch, Epoch::FIRST);
        assert_eq!(cms.metadata().epoch, Epoch::FIRST);
        assert_eq!(cms.stats().commits(), 1);
    }

    #[tokio::test]
    async fn test_invalid_commit_never_appends() {
        let log = Arc::new(LocalLog::new());
        let cms = ClusterMetadataService::new(log.clone(), CommitConfig::default());
        let err = cms.commit(Transformation::cancel(NodeId(3))).await.unwrap_err();
        assert!(matches!(err, Error::Rejected(_)));
        assert!(log.is_empty());
        assert_eq!(cms.stats().rejections(), 1);
    }

    #[tokio::test]
    async fn test_conflicts_are_retried() {
        let log = Arc::new(ContendedLog::new(2));
        let cms = ClusterMetadataService::new(log.clone(), fast_config(5));
        let md = cms.commit(register(1)).await.unwrap();
        // Two competing registrations landed first.
        assert_eq!(md.epoch, Epoch(3));
        assert_eq!(cms.stats().conflicts(), 2);
    }

    #[tokio::test]
    async fn test_retry_exhaustion_is_terminal() {
        let log = Arc::new(ContendedLog::new(usize::MAX));
        let cms = ClusterMetadataService::new(log, fast_config(3));
        let err = cms.commit(register(1)).await.unwrap_err();
        match err {
            Error::CommitRetriesExhausted {
                attempts,
                last_epoch,
            } => {
                assert_eq!(attempts, 3);
                assert_eq!(last_epoch, Epoch(3));
            }
            other => panic!("unexpected error: {}", other),
        }
    }

    #[tokio::test]
    async fn test_migrating_rejects_membership_changes() {
        let cms = ClusterMetadataService::new(Arc::new(LocalLog::new()), CommitConfig::default());
        cms.commit(register(1)).await.unwrap();
        cms.set_state(ServiceState::Migrating);

        let err = cms
            .commit(Transformation::prepare_join(NodeId(1), vec![crate::types::Token(1)]))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Precondition(_)));
        assert_eq!(cms.metadata().epoch, Epoch::FIRST);

        // Registration is not a membership change.
        cms.commit(register(2)).await.unwrap();
    }
}
