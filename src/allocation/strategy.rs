//! Allocation rings: which nodes compete with a new node for ownership.

use crate::error::AllocationError;
use crate::metadata::{Directory, ReplicationParams};
use crate::types::{Location, NodeId};
use std::collections::BTreeMap;

/// Replication unit inside an allocation ring.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Group {
    Node(NodeId),
    Rack(String),
}

/// How tokens are balanced for nodes of one (datacenter, rack).
///
/// | condition                 | allocation ring                 |
/// |---------------------------|---------------------------------|
/// | replicas <= 1             | datacenter, every node its own  |
/// | racks == replicas         | one ring per rack, 1 replica    |
/// | racks > replicas          | datacenter, grouped by rack     |
/// | racks == 1                | datacenter                      |
/// | 1 < racks < replicas      | configuration error             |
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AllocationStrategy {
    /// `None` matches every datacenter.
    datacenter: Option<String>,
    /// `None` matches every rack of the datacenter.
    rack: Option<String>,
    replicas: usize,
    group_by_rack: bool,
}

impl AllocationStrategy {
    /// Strategy for a node at `location`.
    pub fn for_location(
        replication: &ReplicationParams,
        directory: &Directory,
        location: &Location,
    ) -> Result<Self, AllocationError> {
        match replication {
            ReplicationParams::Simple { replicas } => Ok(Self {
                datacenter: None,
                rack: None,
                replicas: *replicas,
                group_by_rack: false,
            }),
            ReplicationParams::NetworkTopology { .. } => {
                let dc = location.datacenter.clone();
                let replicas = replication.replicas_in(&dc);

                // A rack with no ring members yet counts as a separate unit.
                let dc_racks = directory.datacenter_racks(&dc);
                let racks = if dc_racks.contains_key(&location.rack) {
                    dc_racks.len()
                } else {
                    1
                };

                Self::from_counts(dc, &location.rack, replicas, racks)
            }
        }
    }

    fn from_counts(datacenter: String, rack: &str, replicas: usize, racks: usize) -> Result<Self, AllocationError> {
        let strategy = |rack: Option<String>, replicas: usize, group_by_rack: bool| Self {
            datacenter: Some(datacenter.clone()),
            rack,
            replicas,
            group_by_rack,
        };

        if replicas <= 1 {
            Ok(strategy(None, 1, false))
        } else if racks == replicas {
            Ok(strategy(Some(rack.to_string()), 1, false))
        } else if racks > replicas {
            Ok(strategy(None, replicas, true))
        } else if racks == 1 {
            Ok(strategy(None, replicas, false))
        } else {
            Err(AllocationError::RackConfiguration {
                datacenter,
                racks,
                replicas,
            })
        }
    }

    pub fn replicas(&self) -> usize {
        self.replicas
    }

    pub fn groups_by_rack(&self) -> bool {
        self.group_by_rack
    }

    /// Whether a node at `location` shares ownership with the allocating node.
    pub fn in_allocation_ring(&self, location: &Location) -> bool {
        self.datacenter.as_ref().map_or(true, |dc| *dc == location.datacenter)
            && self.rack.as_ref().map_or(true, |rack| *rack == location.rack)
    }

    pub fn group_of(&self, node_id: NodeId, location: &Location) -> Group {
        if self.group_by_rack {
            Group::Rack(location.rack.clone())
        } else {
            Group::Node(node_id)
        }
    }

    /// Groups of every registered node inside the allocation ring.
    pub(crate) fn ring_groups(&self, directory: &Directory) -> BTreeMap<NodeId, Group> {
        directory
            .records()
            .filter(|r| self.in_allocation_ring(&r.location))
            .map(|r| (r.id, self.group_of(r.id, &r.location)))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn build(replicas: usize, racks: usize) -> Result<AllocationStrategy, AllocationError> {
        AllocationStrategy::from_counts("dc1".to_string(), "r1", replicas, racks)
    }

    #[test]
    fn test_grouping_table() {
        let single = build(1, 4).unwrap();
        assert_eq!(single.replicas(), 1);
        assert!(single.in_allocation_ring(&Location::new("dc1", "r9")));
        assert!(!single.in_allocation_ring(&Location::new("dc2", "r1")));

        let per_rack = build(3, 3).unwrap();
        assert_eq!(per_rack.replicas(), 1);
        assert!(per_rack.in_allocation_ring(&Location::new("dc1", "r1")));
        assert!(!per_rack.in_allocation_ring(&Location::new("dc1", "r2")));

        let grouped = build(3, 5).unwrap();
        assert!(grouped.groups_by_rack());
        assert_eq!(grouped.replicas(), 3);
        assert_eq!(
            grouped.group_of(NodeId(7), &Location::new("dc1", "r2")),
            Group::Rack("r2".to_string())
        );

        let whole_dc = build(3, 1).unwrap();
        assert!(!whole_dc.groups_by_rack());
        assert_eq!(whole_dc.group_of(NodeId(7), &Location::new("dc1", "r1")), Group::Node(NodeId(7)));
    }

    #[test]
    fn test_too_few_racks_is_fatal() {
        let err = build(3, 2).unwrap_err();
        assert_eq!(
            err,
            AllocationError::RackConfiguration {
                datacenter: "dc1".to_string(),
                racks: 2,
                replicas: 3,
            }
        );
    }

    #[test]
    fn test_simple_replication_spans_everything() {
        let strategy = AllocationStrategy::for_location(
            &ReplicationParams::Simple { replicas: 3 },
            &Directory::new(),
            &Location::new("dc1", "r1"),
        )
        .unwrap();
        assert!(strategy.in_allocation_ring(&Location::new("dc2", "r5")));
        assert_eq!(strategy.replicas(), 3);
    }
}
