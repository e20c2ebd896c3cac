//! Sorted token ring.
//!
//! Each token marks the inclusive end of a range `(previous, token]`, and the
//! node owning the token is the primary owner of that range. Lookups walk the
//! underlying `BTreeMap`, so finding the owner of a position is O(log n).

use crate::types::{NodeId, Token};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// A range of the ring, `(start, end]`. When `start == end` the range covers
/// the whole ring.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TokenRange {
    pub start: Token,
    pub end: Token,
}

impl TokenRange {
    pub fn new(start: Token, end: Token) -> Self {
        Self { start, end }
    }

    /// Fraction of the ring this range covers.
    pub fn size(&self) -> f64 {
        self.start.size(self.end)
    }

    /// Whether the range contains `token`.
    pub fn contains(&self, token: Token) -> bool {
        if self.start == self.end {
            return true;
        }
        if self.start < self.end {
            token > self.start && token <= self.end
        } else {
            token > self.start || token <= self.end
        }
    }
}

/// Token ownership map.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenMap {
    tokens: BTreeMap<Token, NodeId>,
}

impl TokenMap {
    /// Create an empty ring.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of tokens on the ring.
    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }

    /// Owner of exactly this token, if any.
    pub fn owner(&self, token: Token) -> Option<NodeId> {
        self.tokens.get(&token).copied()
    }

    /// All tokens in ring order.
    pub fn tokens(&self) -> Vec<Token> {
        self.tokens.keys().copied().collect()
    }

    /// Tokens owned by a node, in ring order.
    pub fn tokens_of(&self, node_id: NodeId) -> Vec<Token> {
        self.tokens
            .iter()
            .filter(|(_, owner)| **owner == node_id)
            .map(|(token, _)| *token)
            .collect()
    }

    /// Nodes owning at least one token.
    pub fn nodes(&self) -> BTreeSet<NodeId> {
        self.tokens.values().copied().collect()
    }

    /// Whether a node owns any token.
    pub fn contains_node(&self, node_id: NodeId) -> bool {
        self.tokens.values().any(|owner| *owner == node_id)
    }

    /// Iterate `(token, owner)` in ring order.
    pub fn iter(&self) -> impl Iterator<Item = (Token, NodeId)> + '_ {
        self.tokens.iter().map(|(t, n)| (*t, *n))
    }

    /// The first token at or after `position`, wrapping around the ring.
    pub fn successor(&self, position: Token) -> Option<Token> {
        self.tokens
            .range(position..)
            .next()
            .or_else(|| self.tokens.iter().next())
            .map(|(token, _)| *token)
    }

    /// Primary owner of the range containing `position`.
    pub fn primary_for(&self, position: Token) -> Option<NodeId> {
        self.successor(position).and_then(|t| self.owner(t))
    }

    /// Walk the ring clockwise starting at the token owning `position`.
    ///
    /// Every token is visited exactly once.
    pub fn walk_from(&self, position: Token) -> impl Iterator<Item = (Token, NodeId)> + '_ {
        self.tokens
            .range(position..)
            .chain(self.tokens.range(..position))
            .map(|(t, n)| (*t, *n))
    }

    /// Ranges of the ring, each paired with its primary owner.
    pub fn ranges(&self) -> Vec<(TokenRange, NodeId)> {
        let mut out = Vec::with_capacity(self.tokens.len());
        let last = match self.tokens.keys().next_back() {
            Some(last) => *last,
            None => return out,
        };

        let mut previous = last;
        for (token, owner) in &self.tokens {
            out.push((TokenRange::new(previous, *token), *owner));
            previous = *token;
        }
        out
    }

    /// Assign tokens to a node. Fails without changes if any token is owned
    /// by someone else.
    pub fn assign(&mut self, node_id: NodeId, tokens: &[Token]) -> Result<(), (Token, NodeId)> {
        for token in tokens {
            if let Some(owner) = self.owner(*token) {
                if owner != node_id {
                    return Err((*token, owner));
                }
            }
        }
        for token in tokens {
            self.tokens.insert(*token, node_id);
        }
        Ok(())
    }

    /// Remove every token owned by a node, returning them.
    pub fn remove_node(&mut self, node_id: NodeId) -> Vec<Token> {
        let removed = self.tokens_of(node_id);
        self.tokens.retain(|_, owner| *owner != node_id);
        removed
    }

    /// Replace a node's tokens with a new set.
    pub fn replace_tokens(
        &mut self,
        node_id: NodeId,
        tokens: &[Token],
    ) -> Result<Vec<Token>, (Token, NodeId)> {
        let previous = self.tokens_of(node_id);
        self.remove_node(node_id);
        if let Err(clash) = self.assign(node_id, tokens) {
            // Restore the original ownership before reporting.
            for token in &previous {
                self.tokens.insert(*token, node_id);
            }
            return Err(clash);
        }
        Ok(previous)
    }

    /// Hand every token of `from` to `to`.
    pub fn transfer(&mut self, from: NodeId, to: NodeId) -> Vec<Token> {
        let moved = self.tokens_of(from);
        for token in &moved {
            self.tokens.insert(*token, to);
        }
        moved
    }
}
