//! The in-memory trie node model.
//!
//! A node is identified by its path from the root. It carries an optional
//! value digest and a table of child edges keyed by token. Each edge stores
//! the compressed key (the chain of single-child nodes collapsed into the
//! edge), the child's id, and whether the child node carries a value.
//!
//! A node id of `None` marks a stale edge: the child's subtree has pending
//! changes and the id must be recomputed before hashing or persisting.

use crate::key::Key;
use std::collections::BTreeMap;

/// A 32-byte node hash.
pub type NodeId = [u8; 32];

/// A child edge of a node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Child {
    /// The tokens between the parent's key (plus the child's token) and the
    /// child node's key.
    pub compressed_key: Key,
    /// The child node's id, or `None` when it must be recomputed.
    pub id: Option<NodeId>,
    /// Whether the child node carries a value.
    pub has_value: bool,
}

/// A node's child table. `BTreeMap` gives the token-ascending iteration
/// order the hash input format requires.
pub type ChildTable = BTreeMap<u8, Child>;

/// A trie node as persisted and hashed: a value digest plus a child table.
///
/// The node's key is contextual (it is the lookup key of the node) and is
/// not part of this struct.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Node {
    /// The digest of the node's value: the raw value if short, otherwise
    /// its hash. `None` when the node has no value.
    pub value_digest: Option<Vec<u8>>,
    /// The child edges, keyed by token.
    pub children: ChildTable,
}

impl Node {
    /// Whether the node has neither a value nor children. Only the root of
    /// an empty trie is allowed to look like this.
    pub fn is_empty(&self) -> bool {
        self.value_digest.is_none() && self.children.is_empty()
    }
}
