//! Replica placement: which nodes hold each range of the ring.
//!
//! Placement walks the token ring clockwise from the end of a range and picks
//! distinct nodes until the replication factor is met. Network-topology
//! replication does this per datacenter and prefers unseen racks first.

use super::directory::Directory;
use super::token_map::{TokenMap, TokenRange};
use crate::types::{NodeId, Token};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Replication settings used to compute placements.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReplicationParams {
    /// `replicas` copies anywhere on the ring.
    Simple { replicas: usize },
    /// Per-datacenter replica counts.
    NetworkTopology { datacenters: BTreeMap<String, usize> },
}

impl Default for ReplicationParams {
    fn default() -> Self {
        ReplicationParams::Simple { replicas: 3 }
    }
}

impl ReplicationParams {
    /// Network-topology replication for a single datacenter.
    pub fn local(datacenter: impl Into<String>, replicas: usize) -> Self {
        let mut datacenters = BTreeMap::new();
        datacenters.insert(datacenter.into(), replicas);
        ReplicationParams::NetworkTopology { datacenters }
    }

    /// Replica count configured for a datacenter.
    pub fn replicas_in(&self, datacenter: &str) -> usize {
        match self {
            ReplicationParams::Simple { replicas } => *replicas,
            ReplicationParams::NetworkTopology { datacenters } => {
                datacenters.get(datacenter).copied().unwrap_or(0)
            }
        }
    }

    /// Replica nodes for the range whose primary token is at or after `position`.
    pub fn replicas_for(
        &self,
        position: Token,
        token_map: &TokenMap,
        directory: &Directory,
    ) -> Vec<NodeId> {
        match self {
            ReplicationParams::Simple { replicas } => {
                let wanted = (*replicas).min(token_map.nodes().len());
                let mut chosen: Vec<NodeId> = Vec::with_capacity(wanted);
                for (_, node) in token_map.walk_from(position) {
                    if chosen.len() >= wanted {
                        break;
                    }
                    if !chosen.contains(&node) {
                        chosen.push(node);
                    }
                }
                chosen
            }
            ReplicationParams::NetworkTopology { datacenters } => {
                let mut chosen = Vec::new();
                for (dc, replicas) in datacenters {
                    chosen.extend(Self::datacenter_replicas(
                        dc, *replicas, position, token_map, directory,
                    ));
                }
                chosen
            }
        }
    }

    fn datacenter_replicas(
        datacenter: &str,
        replicas: usize,
        position: Token,
        token_map: &TokenMap,
        directory: &Directory,
    ) -> Vec<NodeId> {
        let in_dc = |node: NodeId| {
            directory
                .location(node)
                .map(|l| l.datacenter == datacenter)
                .unwrap_or(false)
        };
        let dc_nodes: BTreeSet<NodeId> = token_map.nodes().into_iter().filter(|n| in_dc(*n)).collect();
        let wanted = replicas.min(dc_nodes.len());

        let mut chosen: Vec<NodeId> = Vec::with_capacity(wanted);
        let mut skipped: Vec<NodeId> = Vec::new();
        let mut seen_racks: BTreeSet<&str> = BTreeSet::new();

        for (_, node) in token_map.walk_from(position) {
            if chosen.len() >= wanted {
                break;
            }
            if !in_dc(node) || chosen.contains(&node) || skipped.contains(&node) {
                continue;
            }
            let rack = directory.location(node).map(|l| l.rack.as_str()).unwrap_or("");
            if seen_racks.insert(rack) {
                chosen.push(node);
            } else {
                skipped.push(node);
            }
        }

        // Not enough distinct racks: fill with skipped nodes in ring order.
        for node in skipped {
            if chosen.len() >= wanted {
                break;
            }
            chosen.push(node);
        }
        chosen
    }
}

/// Mapping from ranges to the nodes responsible for them.
pub type PlacementMap = BTreeMap<TokenRange, Vec<NodeId>>;

/// Read and write placements of a metadata snapshot.
///
/// Writes cover every node that holds or is about to hold a range, so they
/// are a superset of reads while operations are in flight.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Placements {
    pub reads: PlacementMap,
    pub writes: PlacementMap,
}

impl Placements {
    /// Compute placements for the current ring and, when operations are in
    /// flight, the ring they will produce.
    pub fn compute(
        replication: &ReplicationParams,
        current: &TokenMap,
        pending: Option<&TokenMap>,
        directory: &Directory,
    ) -> Self {
        let reads = Self::placement_map(replication, current, directory);
        let writes = match pending {
            None => reads.clone(),
            Some(future) => Self::union_placement(replication, current, future, directory),
        };
        Self { reads, writes }
    }

    fn placement_map(
        replication: &ReplicationParams,
        ring: &TokenMap,
        directory: &Directory,
    ) -> PlacementMap {
        ring.ranges()
            .into_iter()
            .map(|(range, _)| (range, replication.replicas_for(range.end, ring, directory)))
            .collect()
    }

    fn union_placement(
        replication: &ReplicationParams,
        current: &TokenMap,
        future: &TokenMap,
        directory: &Directory,
    ) -> PlacementMap {
        let boundaries: BTreeSet<Token> = current
            .tokens()
            .into_iter()
            .chain(future.tokens())
            .collect();
        let last = match boundaries.iter().next_back() {
            Some(last) => *last,
            None => return PlacementMap::new(),
        };

        let mut map = PlacementMap::new();
        let mut previous = last;
        for end in boundaries {
            let mut nodes = replication.replicas_for(end, current, directory);
            for node in replication.replicas_for(end, future, directory) {
                if !nodes.contains(&node) {
                    nodes.push(node);
                }
            }
            map.insert(TokenRange::new(previous, end), nodes);
            previous = end;
        }
        map
    }

    /// Read replicas for the range containing `token`.
    pub fn read_replicas(&self, token: Token) -> Vec<NodeId> {
        Self::lookup(&self.reads, token)
    }

    /// Write replicas for the range containing `token`.
    pub fn write_replicas(&self, token: Token) -> Vec<NodeId> {
        Self::lookup(&self.writes, token)
    }

    fn lookup(map: &PlacementMap, token: Token) -> Vec<NodeId> {
        map.iter()
            .find(|(range, _)| range.contains(token))
            .map(|(_, nodes)| nodes.clone())
            .unwrap_or_default()
    }
}
