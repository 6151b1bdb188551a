//! The database: the committed base every view ultimately reads through.
//!
//! `MerkleDb` owns the backing store, the node store and its cache, the
//! current root id, the change-summary history, and the registry of live
//! views. Commits are serialized by a process-wide lock; everything a
//! commit changes lands in the store through one atomic batch before any
//! in-memory state is touched.

use crate::history::{ChangeSummary, TrieHistory, ValueChangeRecord};
use crate::metrics::Metrics;
use crate::nodestore::{
    history_key, initialized_key, root_key, stage_node_delete, stage_node_put, value_key,
    NodeStore,
};
use crate::store::{BatchOp, OrderedByteStore, StoreIterator};
use crate::view::{Parent, TrieView, ValueOp, ViewChanges};
use crate::{Error, Options};
use merkledb_core::codec::{self, SummaryEntry};
use merkledb_core::hasher::hash_node;
use merkledb_core::proof::{Proof, RangeProof};
use merkledb_core::{Key, Node, NodeId};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

pub(crate) struct DbShared {
    pub(crate) nodestore: NodeStore,
    store: Arc<dyn OrderedByteStore>,
    pub(crate) token_size: usize,
    /// Process-wide commit lock: held exclusively while committing, shared
    /// while creating views.
    pub(crate) commit_lock: RwLock<()>,
    root: Mutex<NodeId>,
    history: Mutex<TrieHistory>,
    child_views: Mutex<Vec<Weak<TrieView>>>,
    pub(crate) metrics: Metrics,
    closed: AtomicBool,
}

impl DbShared {
    pub(crate) fn new_view(
        self: &Arc<Self>,
        changes: ViewChanges,
    ) -> Result<Arc<TrieView>, Error> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::Closed);
        }
        let _guard = self.commit_lock.read();
        let view = TrieView::build(self.clone(), Parent::Db, changes)?;
        let mut children = self.child_views.lock();
        children.retain(|weak| weak.strong_count() > 0);
        children.push(Arc::downgrade(&view));
        Ok(view)
    }

    /// Apply a commit: stage every node and value change, the new root
    /// marker, and the history records into one batch, write it, and only
    /// then update in-memory state. A failed batch leaves everything
    /// untouched.
    pub(crate) fn commit_changes(
        &self,
        node_changes: HashMap<Key, Option<Node>>,
        value_changes: HashMap<Key, Option<Vec<u8>>>,
        summaries: Vec<ChangeSummary>,
    ) -> Result<(), Error> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::Closed);
        }
        // UNWRAP: every commit carries at least one summary.
        let new_root = summaries.last().unwrap().root_id;

        let mut batch =
            Vec::with_capacity(node_changes.len() + value_changes.len() + summaries.len() + 1);

        let mut node_keys: Vec<&Key> = node_changes.keys().collect();
        node_keys.sort();
        for key in node_keys {
            match &node_changes[key] {
                Some(node) => stage_node_put(&mut batch, key, node),
                None => stage_node_delete(&mut batch, key),
            }
        }

        let mut changed_keys: Vec<&Key> = value_changes.keys().collect();
        changed_keys.sort();
        for key in changed_keys {
            match &value_changes[key] {
                Some(value) => batch.push(BatchOp::Put {
                    key: value_key(key.bytes()),
                    value: value.clone(),
                }),
                None => batch.push(BatchOp::Delete {
                    key: value_key(key.bytes()),
                }),
            }
        }

        batch.push(BatchOp::Put {
            key: root_key(),
            value: new_root.to_vec(),
        });

        let mut history = self.history.lock();
        let mut index = history.next_index();
        for summary in &summaries {
            let entries: Vec<SummaryEntry> = summary
                .values
                .iter()
                .map(|(key, record)| SummaryEntry {
                    key: key.clone(),
                    before: record.before.clone(),
                    after: record.after.clone(),
                })
                .collect();
            batch.push(BatchOp::Put {
                key: history_key(index),
                value: codec::encode_summary(&summary.root_id, &entries),
            });
            index += 1;
        }
        for evicted in history.evicted_by(summaries.len()) {
            batch.push(BatchOp::Delete {
                key: history_key(evicted),
            });
        }

        self.store.write_batch(batch)?;

        // the batch is durable; now the in-memory state may follow it
        for summary in summaries {
            history.record(summary);
        }
        drop(history);
        self.nodestore
            .apply_node_changes(node_changes.iter().map(|(key, node)| (key, node.as_ref())));
        *self.root.lock() = new_root;
        self.metrics.record(|m| &m.commits);
        log::debug!(
            "committed root {:02x}{:02x}{:02x}{:02x}.. ({} node changes, {} value changes)",
            new_root[0],
            new_root[1],
            new_root[2],
            new_root[3],
            node_changes.len(),
            value_changes.len(),
        );
        Ok(())
    }

    /// After a successful commit of `chain` (base-most first): every view
    /// descended from the committed base is invalidated, except the chain
    /// itself. The committed tip's children are re-based onto the
    /// database before the cascade reaches them.
    pub(crate) fn retarget_after_commit(&self, chain: &[Arc<TrieView>]) {
        let mut db_children = self.child_views.lock();
        let old = std::mem::take(&mut *db_children);
        for weak in old {
            if let Some(view) = weak.upgrade() {
                if !Arc::ptr_eq(&view, &chain[0]) {
                    view.invalidate();
                }
            }
        }

        for (i, view) in chain.iter().enumerate() {
            let children = view.take_children();
            for weak in children {
                let Some(child) = weak.upgrade() else { continue };
                if i + 1 < chain.len() && Arc::ptr_eq(&child, &chain[i + 1]) {
                    continue; // committed along with this chain
                }
                child.set_parent_to_db();
                child.invalidate();
            }
        }
    }

    pub(crate) fn root_id(&self) -> NodeId {
        *self.root.lock()
    }
}

/// A versioned, authenticated key-value store over a radix merkle trie.
pub struct MerkleDb {
    shared: Arc<DbShared>,
}

impl MerkleDb {
    /// Open a database over `store` with the given options, initializing
    /// the store on first use.
    pub fn open(store: Arc<dyn OrderedByteStore>, options: Options) -> Result<Self, Error> {
        let token_size = options.branch_factor.token_size();
        let metrics = Metrics::new(options.metrics);
        let nodestore = NodeStore::new(
            store.clone(),
            token_size,
            options.node_cache_entries,
            metrics.clone(),
        );
        let mut history = TrieHistory::new(options.history_length);

        let root_id = if !nodestore.is_initialized()? {
            let root = Node::default();
            let root_id = hash_node(&Key::empty(), None, &root.children);
            let mut batch = Vec::new();
            stage_node_put(&mut batch, &Key::empty(), &root);
            batch.push(BatchOp::Put {
                key: root_key(),
                value: root_id.to_vec(),
            });
            batch.push(BatchOp::Put {
                key: initialized_key(),
                value: Vec::new(),
            });
            // the bootstrap summary makes the initial root provable from
            // history like any committed root
            batch.push(BatchOp::Put {
                key: history_key(0),
                value: codec::encode_summary(&root_id, &[]),
            });
            store.write_batch(batch)?;
            history.restore(
                0,
                ChangeSummary {
                    root_id,
                    values: HashMap::new(),
                },
            );
            log::debug!("initialized empty database");
            root_id
        } else {
            let root_id = nodestore.read_root_id()?.ok_or(Error::NoValidRoot)?;
            for (index, summary_root, entries) in nodestore.read_history()? {
                let values = entries
                    .into_iter()
                    .map(|entry| {
                        (
                            entry.key,
                            ValueChangeRecord {
                                before: entry.before,
                                after: entry.after,
                            },
                        )
                    })
                    .collect();
                history.restore(
                    index,
                    ChangeSummary {
                        root_id: summary_root,
                        values,
                    },
                );
            }
            root_id
        };

        Ok(MerkleDb {
            shared: Arc::new(DbShared {
                nodestore,
                store,
                token_size,
                commit_lock: RwLock::new(()),
                root: Mutex::new(root_id),
                history: Mutex::new(history),
                child_views: Mutex::new(Vec::new()),
                metrics,
                closed: AtomicBool::new(false),
            }),
        })
    }

    /// The id of the current committed root.
    pub fn root(&self) -> NodeId {
        self.shared.root_id()
    }

    /// Get the committed value stored at `key`.
    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, Error> {
        self.shared
            .nodestore
            .get_value(&Key::from_bytes(key, self.shared.token_size))
    }

    /// Get many committed values at once. Each absent key yields
    /// [`Error::NotFound`] in its slot.
    pub fn get_many(&self, keys: &[&[u8]]) -> Vec<Result<Vec<u8>, Error>> {
        keys.iter()
            .map(|key| match self.get(key) {
                Ok(Some(value)) => Ok(value),
                Ok(None) => Err(Error::NotFound),
                Err(err) => Err(err),
            })
            .collect()
    }

    /// Insert `key -> value` and commit it.
    pub fn insert(&self, key: &[u8], value: &[u8]) -> Result<(), Error> {
        let view = self.shared.new_view(ViewChanges::new().put(key, value))?;
        view.commit_to_db()
    }

    /// Remove `key` and commit the removal. Removing an absent key
    /// succeeds.
    pub fn remove(&self, key: &[u8]) -> Result<(), Error> {
        let view = self.shared.new_view(ViewChanges::new().delete(key))?;
        view.commit_to_db()
    }

    /// Create a view over the current committed state with `changes`
    /// applied.
    pub fn new_view(&self, changes: ViewChanges) -> Result<Arc<TrieView>, Error> {
        self.shared.new_view(changes)
    }

    /// A proof that `key` is, or is not, in the committed trie.
    pub fn get_proof(&self, key: &[u8]) -> Result<Proof, Error> {
        self.shared.new_view(ViewChanges::new())?.get_proof(key)
    }

    /// A range proof over the committed trie for `[start, end]`, carrying
    /// at most `max_length` pairs.
    pub fn get_range_proof(
        &self,
        start: Option<&[u8]>,
        end: Option<&[u8]>,
        max_length: usize,
    ) -> Result<RangeProof, Error> {
        self.shared
            .new_view(ViewChanges::new())?
            .get_range_proof(start, end, max_length)
    }

    /// A range proof against `root`, a recently committed root still
    /// covered by the history ring. Fails with
    /// [`Error::InsufficientHistory`] for roots no longer tracked.
    pub fn get_range_proof_at_root(
        &self,
        root: NodeId,
        start: Option<&[u8]>,
        end: Option<&[u8]>,
        max_length: usize,
    ) -> Result<RangeProof, Error> {
        let changes = self.shared.history.lock().changes_to_root(&root)?;
        let ops = changes
            .into_iter()
            .map(|(key, value)| {
                let op = match value {
                    Some(value) => ValueOp::Put(value),
                    None => ValueOp::Delete,
                };
                (key.bytes().to_vec(), op)
            })
            .collect();
        let view = self.shared.new_view(ViewChanges { ops })?;
        view.get_range_proof(start, end, max_length)
    }

    /// Iterate the committed values in key order.
    pub fn iterator(&self) -> Result<StoreIterator, Error> {
        self.iterator_with_start(&[])
    }

    /// Iterate the committed values with key at or after `start`, in key
    /// order.
    pub fn iterator_with_start(&self, start: &[u8]) -> Result<StoreIterator, Error> {
        self.shared.nodestore.value_iterator(start)
    }

    /// Hint the store to compact `[start, limit)`. A `limit` of `None`
    /// resolves to just past the greatest existing key; on an empty store
    /// this is a no-op.
    pub fn compact(&self, start: &[u8], limit: Option<&[u8]>) -> Result<(), Error> {
        let resolved = match limit {
            Some(limit) => Some(limit.to_vec()),
            None => {
                let mut greatest = None;
                for entry in self.shared.store.iterator()? {
                    greatest = Some(entry?.0);
                }
                match greatest {
                    None => return Ok(()), // empty store
                    Some(mut key) => {
                        key.push(0x00); // just past the greatest key
                        Some(key)
                    }
                }
            }
        };
        if let Some(limit) = &resolved {
            if start >= limit.as_slice() {
                return Ok(());
            }
        }
        self.shared.store.compact(start, resolved.as_deref())
    }

    /// Close the database and its store. Live views become unusable as
    /// their store reads start failing; the store warns about (but
    /// tolerates) any iterators that were never released.
    pub fn close(&self) -> Result<(), Error> {
        if self.shared.closed.swap(true, Ordering::AcqRel) {
            return Err(Error::Closed);
        }
        self.shared.store.close()
    }

    /// This database's metrics handle.
    pub fn metrics(&self) -> Metrics {
        self.shared.metrics.clone()
    }
}
