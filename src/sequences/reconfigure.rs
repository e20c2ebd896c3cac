//! Keep the CMS adequate while membership changes.

use crate::error::{Error, Result};
use crate::metadata::ClusterMetadata;
use crate::service::ClusterMetadataService;
use crate::transformation::Transformation;
use crate::types::{NodeId, NodeState};
use std::sync::Arc;
use tracing::info;

/// Lowest-id joined node that could take over a CMS seat.
pub fn cms_replacement_candidate(md: &ClusterMetadata, leaving: NodeId) -> Option<NodeId> {
    md.directory
        .nodes_in_state(NodeState::Joined)
        .into_iter()
        .filter(|id| *id != leaving)
        .filter(|id| !md.cms_members.contains(id))
        .find(|id| !md.in_progress.involves(*id))
}

/// If `leaving` is a CMS member, commit a reconfiguration that hands its seat
/// to another node. Returns `None` when nothing had to change.
pub async fn maybe_reconfigure_cms(
    cms: &ClusterMetadataService,
    leaving: NodeId,
) -> Result<Option<Arc<ClusterMetadata>>> {
    let md = cms.metadata();
    if !md.cms_members.contains(&leaving) {
        return Ok(None);
    }

    let transformation = match cms_replacement_candidate(&md, leaving) {
        Some(replacement) => {
            info!(leaving = %leaving, replacement = %replacement, "CMS: reassigning seat");
            Transformation::ReconfigureCms {
                add: vec![replacement],
                remove: vec![leaving],
            }
        }
        None if md.cms_members.len() > 1 => {
            info!(leaving = %leaving, "CMS: shrinking, no eligible replacement");
            Transformation::ReconfigureCms {
                add: vec![],
                remove: vec![leaving],
            }
        }
        None => {
            return Err(Error::precondition(format!(
                "node {} is the last CMS member and no other node can take over",
                leaving
            )));
        }
    };

    cms.commit(transformation).await.map(Some)
}
