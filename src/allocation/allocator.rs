//! Greedy token selection inside one allocation ring.
//!
//! Tokens are added one at a time. Every range of the current sub-ring offers
//! its midpoint as a candidate; the candidate leaving the lowest variance of
//! per-token replicated ownership across ring members wins. Ties go to the
//! smaller token so results are reproducible.

use super::strategy::Group;
use crate::types::{NodeId, Token};
use std::collections::{BTreeMap, BTreeSet};

/// Replicated ownership of every node in `ring`: the total size of the ranges
/// it holds a replica of.
///
/// Replicas of a range are the owners of the first `replicas` distinct groups
/// met walking clockwise from the range's end token.
pub(crate) fn replicated_ownership(
    ring: &BTreeMap<Token, NodeId>,
    replicas: usize,
    groups: &BTreeMap<NodeId, Group>,
) -> BTreeMap<NodeId, f64> {
    let mut ownership: BTreeMap<NodeId, f64> = BTreeMap::new();
    if ring.is_empty() {
        return ownership;
    }

    let entries: Vec<(Token, NodeId)> = ring.iter().map(|(t, n)| (*t, *n)).collect();
    let group_of = |node: NodeId| groups.get(&node).cloned().unwrap_or(Group::Node(node));
    let distinct: BTreeSet<Group> = entries.iter().map(|(_, n)| group_of(*n)).collect();
    let wanted = replicas.max(1).min(distinct.len());

    for i in 0..entries.len() {
        let prev = entries[(i + entries.len() - 1) % entries.len()].0;
        let size = prev.size(entries[i].0);

        let mut seen: BTreeSet<Group> = BTreeSet::new();
        for step in 0..entries.len() {
            if seen.len() >= wanted {
                break;
            }
            let node = entries[(i + step) % entries.len()].1;
            if seen.insert(group_of(node)) {
                *ownership.entry(node).or_insert(0.0) += size;
            }
        }
    }
    ownership
}

/// Ownership divided by token count, per node.
pub(crate) fn per_token_ownership(
    ring: &BTreeMap<Token, NodeId>,
    replicas: usize,
    groups: &BTreeMap<NodeId, Group>,
) -> Vec<f64> {
    let mut counts: BTreeMap<NodeId, usize> = BTreeMap::new();
    for node in ring.values() {
        *counts.entry(*node).or_insert(0) += 1;
    }
    replicated_ownership(ring, replicas, groups)
        .into_iter()
        .map(|(node, owned)| owned / counts.get(&node).copied().unwrap_or(1) as f64)
        .collect()
}

fn variance(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    values.iter().map(|v| (v - mean) * (v - mean)).sum::<f64>() / n
}

/// `count` positions spread evenly around the ring.
pub(crate) fn evenly_spaced(count: usize) -> Vec<Token> {
    let span: i128 = 1i128 << 64;
    (0..count as i128)
        .map(|i| {
            let offset = (2 * i + 1) * span / (2 * count as i128);
            Token((i64::MIN as i128 + offset) as i64)
        })
        .collect()
}

/// Greedy allocator over a snapshot of one allocation ring.
#[derive(Debug, Clone)]
pub struct TokenAllocator {
    ring: BTreeMap<Token, NodeId>,
    groups: BTreeMap<NodeId, Group>,
    replicas: usize,
}

impl TokenAllocator {
    pub fn new(ring: BTreeMap<Token, NodeId>, groups: BTreeMap<NodeId, Group>, replicas: usize) -> Self {
        Self { ring, groups, replicas }
    }

    /// Choose `num_tokens` positions for `node_id` and add them to the ring.
    pub fn add_unit(&mut self, node_id: NodeId, num_tokens: usize) -> Vec<Token> {
        self.groups.entry(node_id).or_insert(Group::Node(node_id));

        if self.ring.is_empty() {
            let tokens = evenly_spaced(num_tokens);
            for token in &tokens {
                self.ring.insert(*token, node_id);
            }
            return tokens;
        }

        let mut chosen = Vec::with_capacity(num_tokens);
        for _ in 0..num_tokens {
            match self.best_candidate(node_id) {
                Some(token) => {
                    self.ring.insert(token, node_id);
                    chosen.push(token);
                }
                None => break,
            }
        }
        chosen.sort();
        chosen
    }

    fn best_candidate(&mut self, node_id: NodeId) -> Option<Token> {
        let mut best: Option<(Token, f64)> = None;
        for candidate in self.candidates() {
            self.ring.insert(candidate, node_id);
            let score = variance(&per_token_ownership(&self.ring, self.replicas, &self.groups));
            self.ring.remove(&candidate);

            // Candidates come in ascending order; keep the first minimum.
            if best.map_or(true, |(_, s)| score < s) {
                best = Some((candidate, score));
            }
        }
        best.map(|(token, _)| token)
    }

    fn candidates(&self) -> BTreeSet<Token> {
        let tokens: Vec<Token> = self.ring.keys().copied().collect();
        let mut candidates = BTreeSet::new();
        for (i, end) in tokens.iter().enumerate() {
            let start = tokens[(i + tokens.len() - 1) % tokens.len()];
            let mid = start.midpoint(*end);
            if mid.is_valid() && !self.ring.contains_key(&mid) {
                candidates.insert(mid);
            }
        }
        candidates
    }

    pub fn ring(&self) -> &BTreeMap<Token, NodeId> {
        &self.ring
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node_groups(ids: &[u32]) -> BTreeMap<NodeId, Group> {
        ids.iter().map(|i| (NodeId(*i), Group::Node(NodeId(*i)))).collect()
    }

    #[test]
    fn test_evenly_spaced_on_empty_ring() {
        let mut allocator = TokenAllocator::new(BTreeMap::new(), BTreeMap::new(), 3);
        let tokens = allocator.add_unit(NodeId(1), 4);
        assert_eq!(tokens, evenly_spaced(4));
        assert!(tokens.iter().all(|t| t.is_valid()));
        assert!(tokens.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn test_second_unit_splits_ranges() {
        let mut allocator = TokenAllocator::new(BTreeMap::new(), BTreeMap::new(), 1);
        let first = allocator.add_unit(NodeId(1), 2);
        let second = allocator.add_unit(NodeId(2), 2);

        for token in &second {
            assert!(!first.contains(token));
        }
        let owned = replicated_ownership(allocator.ring(), 1, &node_groups(&[1, 2]));
        let a = owned[&NodeId(1)];
        let b = owned[&NodeId(2)];
        assert!((a - 0.5).abs() < 1e-9, "node 1 owns {}", a);
        assert!((b - 0.5).abs() < 1e-9, "node 2 owns {}", b);
    }

    #[test]
    fn test_allocation_is_deterministic() {
        let run = || {
            let mut allocator = TokenAllocator::new(BTreeMap::new(), BTreeMap::new(), 2);
            (1..=5).map(|i| allocator.add_unit(NodeId(i), 4)).collect::<Vec<_>>()
        };
        assert_eq!(run(), run());
    }

    #[test]
    fn test_replicated_ownership_sums_to_replicas() {
        let mut ring = BTreeMap::new();
        for (i, token) in evenly_spaced(6).into_iter().enumerate() {
            ring.insert(token, NodeId(i as u32 % 3 + 1));
        }
        let owned = replicated_ownership(&ring, 2, &node_groups(&[1, 2, 3]));
        let total: f64 = owned.values().sum();
        assert!((total - 2.0).abs() < 1e-9);
        for share in owned.values() {
            assert!((share - 2.0 / 3.0).abs() < 1e-9);
        }
    }

    #[test]
    fn test_groups_count_once_per_range() {
        // Two nodes in one rack, one in another: with rack grouping each range
        // gets exactly one replica per rack.
        let tokens = evenly_spaced(3);
        let ring: BTreeMap<Token, NodeId> = tokens.iter().copied().zip([NodeId(1), NodeId(2), NodeId(3)]).collect();
        let mut groups = BTreeMap::new();
        groups.insert(NodeId(1), Group::Rack("a".to_string()));
        groups.insert(NodeId(2), Group::Rack("a".to_string()));
        groups.insert(NodeId(3), Group::Rack("b".to_string()));

        let owned = replicated_ownership(&ring, 2, &groups);
        let rack_a = owned.get(&NodeId(1)).copied().unwrap_or(0.0) + owned.get(&NodeId(2)).copied().unwrap_or(0.0);
        let rack_b = owned.get(&NodeId(3)).copied().unwrap_or(0.0);
        assert!((rack_a - 1.0).abs() < 1e-9);
        assert!((rack_b - 1.0).abs() < 1e-9);
    }
}
