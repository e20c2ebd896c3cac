//! End-to-end membership scenarios over a shared in-process log.

use super::{TestCluster, TestNode};
use crate::config::AllocationConfig;
use crate::error::{Error, Result, SequenceError};
use crate::metadata::ReplicationParams;
use crate::sequences::{MultiStepOperation, OperationKind, OperationMode, SequenceState, Step, StepExecutor};
use crate::service::ServiceState;
use crate::transformation::{LeaveKind, Transformation};
use crate::types::{NodeState, Token};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

async fn four_node_cluster() -> TestCluster {
    TestCluster::with_joined_nodes(4, ReplicationParams::Simple { replicas: 3 })
        .await
        .unwrap()
}

fn precondition_message(result: Result<impl std::fmt::Debug>) -> String {
    match result {
        Err(Error::Precondition(msg)) => msg,
        other => panic!("expected a precondition failure, got {:?}", other),
    }
}

/// Fails one step until healed.
#[derive(Debug)]
struct FlakyExecutor {
    fail_on: Step,
    failing: AtomicBool,
    calls: AtomicUsize,
}

impl FlakyExecutor {
    fn new(fail_on: Step) -> Arc<Self> {
        Arc::new(Self {
            fail_on,
            failing: AtomicBool::new(true),
            calls: AtomicUsize::new(0),
        })
    }

    fn heal(&self) {
        self.failing.store(false, Ordering::SeqCst);
    }
}

#[async_trait::async_trait]
impl StepExecutor for FlakyExecutor {
    async fn execute(&self, _operation: &MultiStepOperation, step: Step) -> Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if step == self.fail_on && self.failing.load(Ordering::SeqCst) {
            return Err(Error::Internal("streaming failed".to_string()));
        }
        Ok(())
    }
}

#[tokio::test]
async fn test_decommission_removes_node_from_ring() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("debug")
        .with_test_writer()
        .try_init();

    let cluster = four_node_cluster().await;
    let leaving = cluster.nodes[3];
    let node = cluster.node(leaving);

    let md = node.sequences.decommission(false, true).await.unwrap();

    assert!(!md.ring_members().contains(&leaving));
    assert!(md.in_progress.is_empty());
    assert_eq!(md.state(leaving), Some(NodeState::Left));
    assert_eq!(node.local.mode(), OperationMode::Decommissioned);
    assert_eq!(node.sequencer.state(leaving), SequenceState::Finished);
    assert!(!node.local.is_networking_enabled());
    assert_eq!(cluster.metadata().epoch, md.epoch);
}

#[tokio::test]
async fn test_decommission_of_cms_member_hands_over_seat() {
    let cluster = four_node_cluster().await;
    let cms_node = cluster.nodes[0];
    assert!(cluster.metadata().cms_members.contains(&cms_node));

    let md = cluster.node(cms_node).sequences.decommission(false, false).await.unwrap();

    assert!(!md.cms_members.contains(&cms_node));
    assert!(md.cms_members.contains(&cluster.nodes[1]));
    assert_eq!(md.state(cms_node), Some(NodeState::Left));
}

#[tokio::test]
async fn test_decommission_without_enough_replicas_needs_force() {
    let cluster = TestCluster::with_joined_nodes(3, ReplicationParams::Simple { replicas: 3 })
        .await
        .unwrap();
    let node = cluster.node(cluster.nodes[2]);
    let epoch = cluster.metadata().epoch;

    let err = node.sequences.decommission(false, false).await.unwrap_err();
    assert!(err.to_string().contains("use force"), "{}", err);
    assert_eq!(cluster.metadata().epoch, epoch);
    assert!(cluster.metadata().in_progress.is_empty());

    let md = node.sequences.decommission(true, false).await.unwrap();
    assert_eq!(md.state(cluster.nodes[2]), Some(NodeState::Left));
}

#[tokio::test]
async fn test_move_to_owned_token_is_rejected_before_append() {
    let cluster = four_node_cluster().await;
    let node = cluster.node(cluster.nodes[1]);
    let epoch = cluster.metadata().epoch;
    let entries = cluster.log.len();

    let msg = precondition_message(node.sequences.move_to(TestCluster::token_for(3)).await);
    assert!(msg.contains("already owned by another node"), "{}", msg);

    assert_eq!(cluster.metadata().epoch, epoch);
    assert_eq!(cluster.log.len(), entries);
    assert_eq!(node.local.mode(), OperationMode::Normal);
}

#[tokio::test]
async fn test_move_completes() {
    let cluster = four_node_cluster().await;
    let mover = cluster.nodes[1];
    let node = cluster.node(mover);

    let md = node.sequences.move_to(Token(2_500_000)).await.unwrap();

    assert_eq!(md.token_map.tokens_of(mover), vec![Token(2_500_000)]);
    assert_eq!(md.token_map.owner(TestCluster::token_for(2)), None);
    assert_eq!(md.state(mover), Some(NodeState::Joined));
    assert_eq!(node.local.mode(), OperationMode::Normal);
}

#[tokio::test]
async fn test_abort_move_requires_failed_move() {
    let cluster = four_node_cluster().await;
    let mover = cluster.nodes[1];
    let node = cluster.node(mover);

    node.sequencer
        .start(Transformation::prepare_move(mover, vec![Token(2_500_000)]))
        .await
        .unwrap();
    assert_eq!(node.local.mode(), OperationMode::Moving);
    let before = cluster.metadata();

    let msg = precondition_message(node.sequences.abort_move(None).await);
    assert_eq!(msg, "Can't abort a MOVE operation unless it has failed");

    let after = cluster.metadata();
    assert_eq!(after.epoch, before.epoch);
    assert_eq!(after.in_progress.get(mover), before.in_progress.get(mover));
}

#[tokio::test]
async fn test_failed_move_can_be_resumed() {
    let cluster = four_node_cluster().await;
    let mover = cluster.nodes[1];
    let executor = FlakyExecutor::new(Step::Mid);
    let node = cluster.node_with_executor(mover, executor.clone());

    let err = node.sequences.move_to(Token(2_500_000)).await.unwrap_err();
    assert!(matches!(err, Error::Sequence(SequenceError::StepFailed { .. })), "{:?}", err);
    assert_eq!(node.local.mode(), OperationMode::MoveFailed);
    assert!(matches!(node.sequencer.state(mover), SequenceState::Failed { .. }));

    let op = cluster.metadata().in_progress.get(mover).cloned().unwrap();
    assert_eq!(op.next_step(), Some(Step::Mid));
    assert_eq!(executor.calls.load(Ordering::SeqCst), 2);

    executor.heal();
    let md = node.sequences.resume_move().await.unwrap();
    assert_eq!(md.token_map.tokens_of(mover), vec![Token(2_500_000)]);
    assert!(md.in_progress.is_empty());
    assert_eq!(node.local.mode(), OperationMode::Normal);
    assert_eq!(node.sequencer.state(mover), SequenceState::Finished);
}

#[tokio::test]
async fn test_failed_move_can_be_aborted() {
    let cluster = four_node_cluster().await;
    let mover = cluster.nodes[1];
    let node = cluster.node_with_executor(mover, FlakyExecutor::new(Step::Mid));

    assert!(node.sequences.move_to(Token(2_500_000)).await.is_err());
    let md = node.sequences.abort_move(None).await.unwrap();

    assert!(md.in_progress.is_empty());
    assert_eq!(md.state(mover), Some(NodeState::Joined));
    assert_eq!(md.token_map.tokens_of(mover), vec![TestCluster::token_for(2)]);
    assert_eq!(md.token_claimant(Token(2_500_000)), None);
    assert_eq!(node.local.mode(), OperationMode::Normal);
    assert_eq!(node.sequencer.state(mover), SequenceState::Cancelled);
}

#[tokio::test]
async fn test_resume_move_without_failure_is_rejected() {
    let cluster = four_node_cluster().await;
    let node = cluster.node(cluster.nodes[1]);

    let msg = precondition_message(node.sequences.resume_move().await);
    assert_eq!(msg, "No move operation in progress, can't resume");

    node.sequencer
        .start(Transformation::prepare_move(cluster.nodes[1], vec![Token(7)]))
        .await
        .unwrap();
    let msg = precondition_message(node.sequences.resume_move().await);
    assert_eq!(msg, "Can't resume a move operation unless it has failed");
}

#[tokio::test]
async fn test_cancel_remote_join_restores_state_and_tokens() {
    let cluster = four_node_cluster().await;
    let joining = cluster.register(5).await.unwrap();
    let joiner = cluster.node(joining);
    joiner
        .sequencer
        .start(Transformation::prepare_join(joining, vec![Token(42)]))
        .await
        .unwrap();
    assert_eq!(cluster.metadata().token_claimant(Token(42)), Some(joining));
    assert_eq!(joiner.local.mode(), OperationMode::Joining);

    // Alive peers must abort locally.
    let operator = cluster.node(cluster.nodes[0]);
    let msg = precondition_message(operator.sequencer.cancel(joining, OperationKind::Join).await);
    assert!(msg.contains("that is UP"), "{}", msg);
    assert!(msg.contains(&TestCluster::endpoint(5).to_string()));

    operator.mark_down(joining);
    let md = operator.sequencer.cancel(joining, OperationKind::Join).await.unwrap();

    assert_eq!(md.state(joining), Some(NodeState::Registered));
    assert_eq!(md.token_claimant(Token(42)), None);
    assert!(md.in_progress.is_empty());

    // Tokens are free for someone else now.
    let other = cluster.register(6).await.unwrap();
    cluster
        .cms
        .commit(Transformation::prepare_join(other, vec![Token(42)]))
        .await
        .unwrap();
}

#[tokio::test]
async fn test_cancel_with_wrong_kind_is_rejected() {
    let cluster = four_node_cluster().await;
    let mover = cluster.nodes[1];
    let node = cluster.node_with_executor(mover, FlakyExecutor::new(Step::Start));
    assert!(node.sequences.move_to(Token(2_500_000)).await.is_err());

    let msg = precondition_message(node.sequences.abort_decommission(None).await);
    assert!(
        msg.starts_with(&format!("No LEAVE operation in progress for {}, can't abort", mover)),
        "{}",
        msg
    );
    assert!(cluster.metadata().in_progress.is_kind(mover, OperationKind::Move));
}

#[tokio::test]
async fn test_duplicate_advance_is_stale() {
    let cluster = four_node_cluster().await;
    let leaving = cluster.nodes[3];
    cluster
        .cms
        .commit(Transformation::prepare_leave(leaving, LeaveKind::Decommission, false))
        .await
        .unwrap();
    cluster.cms.commit(Transformation::advance(leaving, Step::Start)).await.unwrap();
    let epoch = cluster.metadata().epoch;

    let err = cluster
        .cms
        .commit(Transformation::advance(leaving, Step::Start))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Rejected(ref r) if r.reason.contains("stale step")), "{:?}", err);
    assert_eq!(cluster.metadata().epoch, epoch);
}

#[tokio::test]
async fn test_fresh_sequencer_resumes_from_snapshot() {
    let cluster = four_node_cluster().await;
    let leaving = cluster.nodes[3];

    // First process registers the leave and gets through START, then dies.
    {
        let first = cluster.node(leaving);
        first
            .sequencer
            .start(Transformation::prepare_leave(leaving, LeaveKind::Decommission, false))
            .await
            .unwrap();
        cluster.cms.commit(Transformation::advance(leaving, Step::Start)).await.unwrap();
    }
    assert_eq!(
        cluster.metadata().in_progress.get(leaving).and_then(|op| op.next_step()),
        Some(Step::Mid)
    );

    let restarted: TestNode = cluster.node(leaving);
    let md = restarted.sequences.decommission(false, false).await.unwrap();

    assert_eq!(md.state(leaving), Some(NodeState::Left));
    assert!(md.in_progress.is_empty());
    assert_eq!(restarted.local.mode(), OperationMode::Decommissioned);
}

#[tokio::test]
async fn test_remove_dead_node() {
    let cluster = four_node_cluster().await;
    let operator = cluster.node(cluster.nodes[0]);
    let target = cluster.nodes[3];

    let msg = precondition_message(operator.sequences.remove_node(cluster.nodes[0], false).await);
    assert_eq!(msg, "Cannot remove self");

    let msg = precondition_message(operator.sequences.remove_node(target, false).await);
    assert!(msg.contains("is alive and owns this ID"), "{}", msg);

    operator.mark_down(target);
    let md = operator.sequences.remove_node(target, false).await.unwrap();
    assert_eq!(md.state(target), Some(NodeState::Left));
    assert!(!md.ring_members().contains(&target));

    let msg = precondition_message(operator.sequences.remove_node(target, false).await);
    assert_eq!(msg, "Node to be removed is not a member of the token ring");
}

#[tokio::test]
async fn test_migrating_cluster_rejects_operations() {
    let cluster = four_node_cluster().await;
    cluster.cms.set_state(ServiceState::Migrating);
    let node = cluster.node(cluster.nodes[3]);
    let epoch = cluster.metadata().epoch;

    let msg = precondition_message(node.sequences.decommission(false, false).await);
    assert_eq!(
        msg,
        "This cluster is migrating to cluster metadata, can't decommission until that is done."
    );
    let msg = precondition_message(node.sequences.move_to(Token(5)).await);
    assert!(msg.contains("can't move"));
    assert_eq!(cluster.metadata().epoch, epoch);
}

#[tokio::test]
async fn test_replace_dead_node() {
    let cluster = four_node_cluster().await;
    let dead = cluster.nodes[2];
    let replacement = cluster.register(5).await.unwrap();
    let node = cluster.node(replacement);

    let msg = precondition_message(node.sequences.replace(dead).await);
    assert!(msg.contains("Cannot replace a live node"), "{}", msg);

    node.mark_down(dead);
    let md = node.sequences.replace(dead).await.unwrap();

    assert_eq!(md.state(dead), Some(NodeState::Left));
    assert_eq!(md.state(replacement), Some(NodeState::Joined));
    assert_eq!(md.token_map.tokens_of(replacement), vec![TestCluster::token_for(3)]);
    assert_eq!(node.local.mode(), OperationMode::Normal);
}

#[tokio::test]
async fn test_bootstrap_with_allocated_tokens() {
    let cluster = four_node_cluster().await;
    let joining = cluster.register(5).await.unwrap();
    let node = cluster.node(joining);

    let config = AllocationConfig::default()
        .with_num_tokens(4)
        .with_allocate_for_replicas(3);
    let md = node.sequences.bootstrap(&config).await.unwrap();

    assert_eq!(md.state(joining), Some(NodeState::Joined));
    assert_eq!(md.token_map.tokens_of(joining).len(), 4);
    assert_eq!(node.local.mode(), OperationMode::Normal);
}

#[tokio::test]
async fn test_failed_join_can_only_be_cancelled_once_failed() {
    let cluster = four_node_cluster().await;
    let joining = cluster.register(5).await.unwrap();
    let node = cluster.node_with_executor(joining, FlakyExecutor::new(Step::Mid));
    assert_eq!(node.local.mode(), OperationMode::Starting);

    // Registered but never driven locally: nothing has failed yet.
    cluster
        .cms
        .commit(Transformation::prepare_join(joining, vec![Token(42)]))
        .await
        .unwrap();
    let entries = cluster.log.len();
    let msg = precondition_message(node.sequencer.cancel(joining, OperationKind::Join).await);
    assert_eq!(msg, "Can't abort a JOIN operation unless it has failed");
    assert_eq!(cluster.log.len(), entries);
    assert_eq!(cluster.metadata().token_claimant(Token(42)), Some(joining));

    let err = node.sequences.join(vec![Token(42)]).await.unwrap_err();
    assert!(matches!(err, Error::Sequence(SequenceError::StepFailed { .. })), "{:?}", err);
    assert_eq!(node.local.mode(), OperationMode::JoinFailed);
    assert_eq!(cluster.metadata().state(joining), Some(NodeState::Bootstrapping));

    let md = node.sequencer.cancel(joining, OperationKind::Join).await.unwrap();
    assert_eq!(md.state(joining), Some(NodeState::Registered));
    assert_eq!(md.token_claimant(Token(42)), None);
    assert!(md.in_progress.is_empty());
    assert!(!md.ring_members().contains(&joining));
    assert_eq!(node.local.mode(), OperationMode::Starting);
    assert_eq!(node.sequencer.state(joining), SequenceState::Cancelled);
}
