#![warn(missing_docs)]

//! A versioned, cryptographically authenticated key-value store built on a
//! radix merkle trie.
//!
//! The database maps arbitrary byte keys to arbitrary byte values and
//! authenticates the whole mapping under a 32-byte root id. Mutations are
//! staged in layered in-memory [`TrieView`]s over the committed base and
//! land in the backing [`OrderedByteStore`] through a single atomic batch
//! per commit. Inclusion, exclusion, and range [`Proof`]s verify against
//! any root still covered by the bounded commit history.
//!
//! ```
//! use merkledb::{MemoryStore, MerkleDb, Options, ViewChanges};
//! use std::sync::Arc;
//!
//! let db = MerkleDb::open(Arc::new(MemoryStore::new()), Options::new()).unwrap();
//! db.insert(b"north", b"1").unwrap();
//!
//! let view = db.new_view(ViewChanges::new().put(&b"south"[..], &b"2"[..])).unwrap();
//! assert_eq!(view.get(b"south").unwrap(), Some(b"2".to_vec()));
//! assert_eq!(db.get(b"south").unwrap(), None);
//!
//! view.commit_to_db().unwrap();
//! assert_eq!(db.get(b"south").unwrap(), Some(b"2".to_vec()));
//!
//! let proof = db.get_proof(b"north").unwrap();
//! proof.verify(&db.root(), 4).unwrap();
//! ```

mod db;
mod error;
mod history;
mod memory;
mod metrics;
mod nodestore;
mod options;
mod store;
mod view;

pub use db::MerkleDb;
pub use error::Error;
pub use memory::MemoryStore;
pub use metrics::{ActiveMetrics, Metrics};
pub use options::Options;
pub use store::{BatchOp, OrderedByteStore, StoreIterator};
pub use view::{TrieView, ValueOp, ViewChanges};

pub use merkledb_core::proof::{Proof, ProofError, ProofNode, RangeProof};
pub use merkledb_core::{BranchFactor, Child, ChildTable, Key, Node, NodeId};
