//! In-process metadata log.

use super::{AppendOutcome, LogEntry, LogTransport};
use crate::error::Result;
use crate::metadata::ClusterMetadata;
use crate::transformation::Transformation;
use crate::types::Epoch;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, trace};

struct LogState {
    current: Arc<ClusterMetadata>,
    entries: Vec<LogEntry>,
}

/// Single-process log used for embedding and tests.
///
/// Appends are serialized by a mutex, which gives the same compare-and-append
/// semantics a replicated log provides: an append only succeeds if the log is
/// still at the epoch the caller read.
pub struct LocalLog {
    initial: Arc<ClusterMetadata>,
    state: Mutex<LogState>,
    tx: watch::Sender<Arc<ClusterMetadata>>,
}

impl LocalLog {
    /// Create a log starting from the empty snapshot.
    pub fn new() -> Self {
        Self::with_initial(ClusterMetadata::empty())
    }

    /// Create a log starting from `initial`.
    pub fn with_initial(initial: ClusterMetadata) -> Self {
        let initial = Arc::new(initial);
        let (tx, _rx) = watch::channel(Arc::clone(&initial));
        Self {
            state: Mutex::new(LogState {
                current: Arc::clone(&initial),
                entries: Vec::new(),
            }),
            initial,
            tx,
        }
    }

    /// Snapshot the log started from.
    pub fn initial(&self) -> Arc<ClusterMetadata> {
        Arc::clone(&self.initial)
    }

    /// All committed entries.
    pub fn entries(&self) -> Vec<LogEntry> {
        self.state.lock().entries.clone()
    }

    /// Number of committed entries.
    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for LocalLog {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for LocalLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("LocalLog")
            .field("epoch", &state.current.epoch)
            .field("entries", &state.entries.len())
            .finish()
    }
}

#[async_trait::async_trait]
impl LogTransport for LocalLog {
    async fn append(
        &self,
        transformation: Transformation,
        expected: Epoch,
    ) -> Result<AppendOutcome> {
        let mut state = self.state.lock();
        if state.current.epoch != expected {
            trace!(
                expected = %expected,
                current = %state.current.epoch,
                "LOG: append conflict"
            );
            return Ok(AppendOutcome::Conflict {
                current: Arc::clone(&state.current),
            });
        }

        let next = match transformation.execute(&state.current) {
            Ok(next) => Arc::new(next),
            Err(rejection) => return Ok(AppendOutcome::Rejected(rejection)),
        };

        debug!(
            epoch = %next.epoch,
            transformation = %transformation,
            "LOG: appended entry"
        );
        state
            .entries
            .push(LogEntry::new(next.epoch, transformation));
        state.current = Arc::clone(&next);
        self.tx.send_replace(Arc::clone(&next));
        Ok(AppendOutcome::Accepted(next))
    }

    fn current(&self) -> Arc<ClusterMetadata> {
        Arc::clone(&self.state.lock().current)
    }

    fn subscribe(&self) -> watch::Receiver<Arc<ClusterMetadata>> {
        self.tx.subscribe()
    }

    fn entries_since(&self, epoch: Epoch) -> Vec<LogEntry> {
        self.state
            .lock()
            .entries
            .iter()
            .filter(|e| e.epoch.is_after(epoch))
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::log::replay;
    use crate::types::{Location, NodeId};
    use std::net::SocketAddr;
    use std::time::Duration;

    fn register(i: u8) -> Transformation {
        Transformation::register(
            SocketAddr::from(([10, 0, 0, i], 7000)),
            Location::new("dc1", "r1"),
        )
    }

    #[tokio::test]
    async fn test_append_advances_epoch() {
        let log = LocalLog::new();
        let outcome = log.append(register(1), Epoch::EMPTY).await.unwrap();
        match outcome {
            AppendOutcome::Accepted(md) => assert_eq!(md.epoch, Epoch::FIRST),
            other => panic!("unexpected outcome: {:?}", other),
        }
        assert_eq!(log.current().epoch, Epoch::FIRST);
        assert_eq!(log.len(), 1);
    }

    #[tokio::test]
    async fn test_stale_expected_epoch_conflicts() {
        let log = LocalLog::new();
        log.append(register(1), Epoch::EMPTY).await.unwrap();
        let outcome = log.append(register(2), Epoch::EMPTY).await.unwrap();
        assert!(matches!(
            outcome,
            AppendOutcome::Conflict { current } if current.epoch == Epoch::FIRST
        ));
        assert_eq!(log.len(), 1);
    }

    #[tokio::test]
    async fn test_invalid_append_rejected() {
        let log = LocalLog::new();
        let outcome = log
            .append(Transformation::cancel(NodeId(1)), Epoch::EMPTY)
            .await
            .unwrap();
        assert!(matches!(outcome, AppendOutcome::Rejected(_)));
        assert_eq!(log.current().epoch, Epoch::EMPTY);
    }

    #[tokio::test]
    async fn test_entries_replay_to_current() {
        let log = LocalLog::new();
        for i in 1..=3u8 {
            let epoch = log.current().epoch;
            log.append(register(i), epoch).await.unwrap();
        }
        let replayed = replay(&log.initial(), &log.entries()).unwrap();
        assert_eq!(&replayed, log.current().as_ref());
        assert_eq!(log.entries_since(Epoch(2)).len(), 1);
    }

    #[tokio::test]
    async fn test_await_epoch() {
        let log = Arc::new(LocalLog::new());
        let waiter = {
            let log = Arc::clone(&log);
            tokio::spawn(async move { log.await_epoch(Epoch(2), Duration::from_secs(5)).await })
        };
        log.append(register(1), Epoch(0)).await.unwrap();
        log.append(register(2), Epoch(1)).await.unwrap();
        let md = waiter.await.unwrap().unwrap();
        assert_eq!(md.epoch, Epoch(2));

        let err = log
            .await_epoch(Epoch(10), Duration::from_millis(20))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Timeout));
    }
}
