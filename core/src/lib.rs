#![warn(missing_docs)]

//! Core logic for an authenticated radix trie.
//!
//! This crate holds everything that does not need a store or a lock: key
//! and token arithmetic, the node model, the deterministic node-hashing
//! rule, the wire codecs for persisted records, and proof verification.
//! The database built on top of it lives in the `merkledb` crate.

pub mod codec;
pub mod hasher;
pub mod key;
pub mod node;
pub mod proof;

pub use key::{BranchFactor, Key};
pub use node::{Child, ChildTable, Node, NodeId};
pub use proof::{Proof, ProofError, ProofNode, RangeProof};
