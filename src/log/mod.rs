//! The metadata log: a totally ordered history of transformations.
//!
//! The replication mechanics behind the log are external; this module defines
//! the [`LogTransport`] seam the service commits through, the entry encoding,
//! and pure [`replay`] of an entry sequence.

mod local;

pub use local::LocalLog;

use crate::error::{LogError, Rejection, Result};
use crate::metadata::ClusterMetadata;
use crate::transformation::Transformation;
use crate::types::Epoch;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

/// A committed transformation and the epoch it produced.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    pub epoch: Epoch,
    pub transformation: Transformation,
}

impl LogEntry {
    pub fn new(epoch: Epoch, transformation: Transformation) -> Self {
        Self {
            epoch,
            transformation,
        }
    }

    /// Serialize to bytes.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    /// Deserialize from bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        Ok(bincode::deserialize(bytes)?)
    }
}

/// Result of an append attempt.
#[derive(Debug, Clone)]
pub enum AppendOutcome {
    /// The transformation committed and produced this snapshot.
    Accepted(Arc<ClusterMetadata>),
    /// The log moved past the expected epoch.
    Conflict { current: Arc<ClusterMetadata> },
    /// The transformation failed validation at the log.
    Rejected(Rejection),
}

/// Transport that makes appends to the metadata log linearizable.
#[async_trait::async_trait]
pub trait LogTransport: Send + Sync + std::fmt::Debug {
    /// Append `transformation` if the log is still at `expected`.
    async fn append(&self, transformation: Transformation, expected: Epoch)
        -> Result<AppendOutcome>;

    /// The latest committed snapshot.
    fn current(&self) -> Arc<ClusterMetadata>;

    /// Watch committed snapshots.
    fn subscribe(&self) -> watch::Receiver<Arc<ClusterMetadata>>;

    /// Entries committed after `epoch`, in order.
    fn entries_since(&self, epoch: Epoch) -> Vec<LogEntry>;

    /// Wait until the log reaches at least `epoch`.
    async fn await_epoch(&self, epoch: Epoch, timeout: Duration) -> Result<Arc<ClusterMetadata>> {
        let mut rx = self.subscribe();
        let waited = tokio::time::timeout(timeout, rx.wait_for(|md| md.epoch >= epoch)).await;
        match waited {
            Ok(Ok(md)) => Ok(Arc::clone(&md)),
            Ok(Err(_)) => Err(crate::error::Error::Internal(
                "metadata log closed".to_string(),
            )),
            Err(_) => Err(crate::error::Error::Timeout),
        }
    }
}

/// Re-execute `entries` on top of `initial`.
///
/// Entries must be contiguous from `initial.epoch`. Every entry was valid
/// when it committed, so a rejection here means the history is corrupt.
pub fn replay(initial: &ClusterMetadata, entries: &[LogEntry]) -> Result<ClusterMetadata> {
    let mut metadata = initial.clone();
    for entry in entries {
        let expected = metadata.epoch.next();
        if entry.epoch != expected {
            return Err(LogError::Gap {
                expected,
                found: entry.epoch,
            }
            .into());
        }
        metadata = entry
            .transformation
            .execute(&metadata)
            .map_err(|rejection| LogError::Replay {
                epoch: entry.epoch,
                reason: rejection.reason,
            })?;
    }
    Ok(metadata)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::types::{Location, NodeId, Token};
    use std::net::SocketAddr;

    fn entries() -> Vec<LogEntry> {
        let addr = SocketAddr::from(([10, 0, 0, 1], 7000));
        vec![
            LogEntry::new(
                Epoch(1),
                Transformation::register(addr, Location::new("dc1", "r1")),
            ),
            LogEntry::new(
                Epoch(2),
                Transformation::prepare_join(NodeId(1), vec![Token(10)]),
            ),
        ]
    }

    #[test]
    fn test_replay_builds_snapshot() {
        let md = replay(&ClusterMetadata::empty(), &entries()).unwrap();
        assert_eq!(md.epoch, Epoch(2));
        assert!(md.in_progress.contains(NodeId(1)));
    }

    #[test]
    fn test_replay_detects_gap() {
        let mut entries = entries();
        entries[1].epoch = Epoch(3);
        let err = replay(&ClusterMetadata::empty(), &entries).unwrap_err();
        assert!(matches!(
            err,
            Error::Log(LogError::Gap {
                expected: Epoch(2),
                found: Epoch(3)
            })
        ));
    }

    #[test]
    fn test_replay_reports_invalid_entry() {
        let mut entries = entries();
        entries.swap(0, 1);
        entries[0].epoch = Epoch(1);
        entries[1].epoch = Epoch(2);
        let err = replay(&ClusterMetadata::empty(), &entries).unwrap_err();
        assert!(matches!(err, Error::Log(LogError::Replay { epoch: Epoch(1), .. })));
    }

    #[test]
    fn test_entry_bytes_roundtrip() {
        let entry = entries().remove(0);
        assert_eq!(LogEntry::from_bytes(&entry.to_bytes().unwrap()).unwrap(), entry);
    }
}
