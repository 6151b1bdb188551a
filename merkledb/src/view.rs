//! The view layer: uncommitted overlays over the committed trie.
//!
//! A [`TrieView`] captures a batch of value changes against its parent (an
//! ancestor view, or the committed database) and materializes the trie
//! edits they imply when its node ids are calculated. Views stack: reads
//! fall through to the parent, and committing a view flattens its chain of
//! uncommitted ancestors into one atomic batch.
//!
//! Invalidation: committing a view invalidates every view that descends
//! from the committed base except the committed chain itself. The flag is
//! checked on entry and exit of operations that read ancestor state, so an
//! invalidation racing a read yields [`Error::Invalid`], never stale data.
//!
//! Lock discipline: a thread may take a view's validity lock only when it
//! holds no ancestor's validity lock (descent-only). Parent links are
//! strong and child registries are weak, so view trees never form
//! reference cycles.

use crate::db::DbShared;
use crate::history::{ChangeSummary, ValueChangeRecord};
use crate::Error;
use merkledb_core::hasher::{hash_node, value_digest};
use merkledb_core::key::common_prefix_len;
use merkledb_core::proof::{Proof, ProofNode, RangeProof};
use merkledb_core::{Child, ChildTable, Key, Node, NodeId};
use parking_lot::RwLock;
use rayon::prelude::*;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock, Weak};

/// A single value operation of a view's change batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValueOp {
    /// Set the key to the given value.
    Put(Vec<u8>),
    /// Remove the key.
    Delete,
}

/// A batch of value changes used to create a view. Operations apply in
/// order; the last operation for a key wins.
#[derive(Debug, Clone, Default)]
pub struct ViewChanges {
    /// The ordered operations.
    pub ops: Vec<(Vec<u8>, ValueOp)>,
}

impl ViewChanges {
    /// An empty batch.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a put.
    pub fn put(mut self, key: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) -> Self {
        self.ops.push((key.into(), ValueOp::Put(value.into())));
        self
    }

    /// Append a delete.
    pub fn delete(mut self, key: impl Into<Vec<u8>>) -> Self {
        self.ops.push((key.into(), ValueOp::Delete));
        self
    }
}

#[derive(Clone)]
pub(crate) enum Parent {
    Db,
    View(Arc<TrieView>),
}

struct Validity {
    invalidated: bool,
    parent: Parent,
    children: Vec<Weak<TrieView>>,
}

#[derive(Default)]
struct ViewState {
    /// Pending value changes, before and after.
    values: HashMap<Key, ValueChangeRecord>,
    /// Pending node edits: a child table, or `None` as a deletion
    /// tombstone. A live empty node is `Some(empty)`, never `None`.
    nodes: HashMap<Key, Option<ChildTable>>,
    /// Fully resolved nodes (concrete child ids and value digests),
    /// filled in by node id calculation and consumed by commit.
    resolved: HashMap<Key, Node>,
    root_id: Option<NodeId>,
}

/// A mutable overlay on a parent trie. Created with a batch of changes;
/// the parent is unaffected until [`TrieView::commit_to_db`].
pub struct TrieView {
    db: Arc<DbShared>,
    state: RwLock<ViewState>,
    validity: RwLock<Validity>,
    /// Readers hold this shared; commit holds it exclusively.
    commit_lock: RwLock<()>,
    committed: AtomicBool,
    nodes_calculated: AtomicBool,
    calc: OnceLock<Result<NodeId, Error>>,
}

impl TrieView {
    /// Build a view over `parent` with the given changes applied. The
    /// caller registers the view in its parent's child list.
    pub(crate) fn build(
        db: Arc<DbShared>,
        parent: Parent,
        changes: ViewChanges,
    ) -> Result<Arc<TrieView>, Error> {
        let view = TrieView {
            db,
            state: RwLock::new(ViewState::default()),
            validity: RwLock::new(Validity {
                invalidated: false,
                parent,
                children: Vec::new(),
            }),
            commit_lock: RwLock::new(()),
            committed: AtomicBool::new(false),
            nodes_calculated: AtomicBool::new(false),
            calc: OnceLock::new(),
        };

        let token_size = view.token_size();
        let root_children = view
            .parent_lookup_children(&Key::empty())?
            .ok_or(Error::NoValidRoot)?;
        {
            let mut state = view.state.write();
            state.nodes.insert(Key::empty(), Some(root_children));
            for (key_bytes, op) in changes.ops {
                let key = Key::from_bytes(&key_bytes, token_size);
                let after = match op {
                    ValueOp::Put(value) => Some(value),
                    ValueOp::Delete => None,
                };
                view.record_value_change(&mut state, key, after)?;
            }
        }
        Ok(Arc::new(view))
    }

    fn token_size(&self) -> usize {
        self.db.token_size
    }

    fn parent(&self) -> Parent {
        self.validity.read().parent.clone()
    }

    /// Re-parent this view directly onto the committed database. Called
    /// when an ancestor chain ending at this view's parent commits.
    pub(crate) fn set_parent_to_db(&self) {
        self.validity.write().parent = Parent::Db;
    }

    /// Detach and return this view's child registry.
    pub(crate) fn take_children(&self) -> Vec<Weak<TrieView>> {
        std::mem::take(&mut self.validity.write().children)
    }

    /// Whether this view has been invalidated by an ancestor commit.
    pub fn is_invalid(&self) -> bool {
        self.validity.read().invalidated
    }

    /// Invalidate this view and all of its descendants.
    pub(crate) fn invalidate(&self) {
        let children = {
            let mut validity = self.validity.write();
            validity.invalidated = true;
            std::mem::take(&mut validity.children)
        };
        for weak in children {
            if let Some(child) = weak.upgrade() {
                child.invalidate();
            }
        }
    }

    // ---- reads ----

    /// Get the value stored at `key`, checking this view's own changes
    /// first and falling through to the parent.
    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, Error> {
        let key = Key::from_bytes(key, self.token_size());
        self.lookup_value(&key)
    }

    pub(crate) fn lookup_value(&self, key: &Key) -> Result<Option<Vec<u8>>, Error> {
        if self.is_invalid() {
            return Err(Error::Invalid);
        }
        let value = {
            let state = self.state.read();
            self.value_in(&state, key)?
        };
        // no ancestor change can have raced this read if we are still valid
        if self.is_invalid() {
            return Err(Error::Invalid);
        }
        Ok(value)
    }

    fn value_in(&self, state: &ViewState, key: &Key) -> Result<Option<Vec<u8>>, Error> {
        if let Some(record) = state.values.get(key) {
            self.db.metrics.record(|m| &m.view_value_hits);
            return Ok(record.after.clone());
        }
        self.db.metrics.record(|m| &m.view_value_misses);
        self.parent_lookup_value(key)
    }

    fn parent_lookup_value(&self, key: &Key) -> Result<Option<Vec<u8>>, Error> {
        match self.parent() {
            Parent::Db => self.db.nodestore.get_value(key),
            Parent::View(parent) => parent.lookup_value(key),
        }
    }

    pub(crate) fn lookup_children(&self, key: &Key) -> Result<Option<ChildTable>, Error> {
        if self.is_invalid() {
            return Err(Error::Invalid);
        }
        let children = {
            let state = self.state.read();
            self.children_in(&state, key)?
        };
        if self.is_invalid() {
            return Err(Error::Invalid);
        }
        Ok(children)
    }

    fn children_in(&self, state: &ViewState, key: &Key) -> Result<Option<ChildTable>, Error> {
        if let Some(entry) = state.nodes.get(key) {
            self.db.metrics.record(|m| &m.view_node_hits);
            // a tombstone means the node is deleted in this view
            return Ok(entry.clone());
        }
        self.db.metrics.record(|m| &m.view_node_misses);
        self.parent_lookup_children(key)
    }

    fn parent_lookup_children(&self, key: &Key) -> Result<Option<ChildTable>, Error> {
        match self.parent() {
            Parent::Db => Ok(self.db.nodestore.get_node(key)?.map(|node| node.children)),
            Parent::View(parent) => parent.lookup_children(key),
        }
    }

    // ---- mutation (only during construction and id calculation) ----

    fn record_value_change(
        &self,
        state: &mut ViewState,
        key: Key,
        after: Option<Vec<u8>>,
    ) -> Result<(), Error> {
        if self.nodes_calculated.load(Ordering::Acquire) {
            return Err(Error::NodesAlreadyCalculated);
        }
        if after.is_some() && !key.has_whole_bytes(self.token_size()) {
            return Err(Error::PartialByteLengthWithValue);
        }
        if let Some(existing) = state.values.get_mut(&key) {
            existing.after = after;
            return Ok(());
        }
        let before = self.parent_lookup_value(&key)?;
        state.values.insert(key, ValueChangeRecord { before, after });
        Ok(())
    }

    fn record_new_node(&self, state: &mut ViewState, key: &Key) {
        state.nodes.insert(key.clone(), Some(ChildTable::new()));
    }

    /// Record a visited node's full children snapshot before any of its
    /// entries are replaced, so edits never lose sibling edges.
    fn record_visited_path(&self, state: &mut ViewState, path: &[(Key, ChildTable)]) {
        for (key, table) in path {
            state
                .nodes
                .entry(key.clone())
                .or_insert_with(|| Some(table.clone()));
        }
        for pair in path.windows(2) {
            self.record_pending_child_change(state, &pair[0].0, &pair[1].0);
        }
    }

    fn record_node_deleted(&self, state: &mut ViewState, key: &Key) {
        state.nodes.insert(key.clone(), None);
    }

    fn record_child_entry(&self, state: &mut ViewState, key: &Key, token: u8, entry: Child) {
        let slot = state
            .nodes
            .entry(key.clone())
            .or_insert_with(|| Some(ChildTable::new()));
        if slot.is_none() {
            // a tombstoned node revived by a new edge starts from scratch
            *slot = Some(ChildTable::new());
        }
        // UNWRAP: the slot was just made live.
        slot.as_mut().unwrap().insert(token, entry);
    }

    /// Replace `key`'s child entry pointing at `child_key` with a stale
    /// one, forcing the child's id to be recomputed.
    fn record_pending_child_change(&self, state: &mut ViewState, key: &Key, child_key: &Key) {
        let token_size = self.token_size();
        self.record_child_entry(
            state,
            key,
            child_key.token(key.len(), token_size),
            Child {
                compressed_key: child_key.skip(key.len() + 1, token_size),
                id: None,
                has_value: false,
            },
        );
    }

    fn record_child_change(&self, state: &mut ViewState, key: &Key, child_key: &Key, entry: Child) {
        let token_size = self.token_size();
        self.record_child_entry(state, key, child_key.token(key.len(), token_size), entry);
    }

    fn record_child_removed(&self, state: &mut ViewState, key: &Key, child_key: &Key) {
        if let Some(Some(table)) = state.nodes.get_mut(key) {
            table.remove(&child_key.token(key.len(), self.token_size()));
        }
    }

    /// The nodes along the path toward `key`: the root first, ending at
    /// the node with the largest matching prefix of `key`.
    fn path_to_key(
        &self,
        state: &ViewState,
        key: &Key,
    ) -> Result<Vec<(Key, ChildTable)>, Error> {
        let token_size = self.token_size();
        let mut current_key = Key::empty();
        let mut current = self
            .children_in(state, &current_key)?
            .ok_or(Error::GetPathToFailure)?;
        let mut path = vec![(current_key.clone(), current.clone())];

        while current_key.len() < key.len() {
            let token = key.token(current_key.len(), token_size);
            let Some(child) = current.get(&token) else {
                break;
            };
            if !key.iterated_has_prefix(&child.compressed_key, current_key.len() + 1, token_size) {
                break;
            }
            current_key = key.take(
                current_key.len() + 1 + child.compressed_key.len(),
                token_size,
            );
            current = self
                .children_in(state, &current_key)?
                .ok_or_else(|| Error::Corrupt("dangling child pointer".into()))?;
            path.push((current_key.clone(), current.clone()));
        }
        Ok(path)
    }

    /// Materialize the insertion of a node at `key`, splitting a diverging
    /// edge into a branch when needed. The value itself lives in the
    /// pending value map; this only maintains the node structure.
    fn insert_in(&self, state: &mut ViewState, key: &Key) -> Result<(), Error> {
        if self.nodes_calculated.load(Ordering::Acquire) {
            return Err(Error::NodesAlreadyCalculated);
        }
        let token_size = self.token_size();
        let path = self.path_to_key(state, key)?;
        self.record_visited_path(state, &path);
        // UNWRAP: the path always contains at least the root.
        let (closest_key, closest_children) = path.last().unwrap();
        if closest_key == key {
            return Ok(());
        }

        let token = key.token(closest_key.len(), token_size);
        let Some(existing) = closest_children.get(&token).cloned() else {
            // no edge in the way: hang a fresh leaf off the closest node
            self.record_child_change(
                state,
                closest_key,
                key,
                Child {
                    compressed_key: key.skip(closest_key.len() + 1, token_size),
                    id: None,
                    has_value: false,
                },
            );
            self.record_new_node(state, key);
            return Ok(());
        };

        // the key diverges inside the existing edge: split it with a
        // branch at the longest common prefix
        let common = common_prefix_len(
            &existing.compressed_key,
            key,
            closest_key.len() + 1,
            token_size,
        );
        if existing.compressed_key.len() <= common {
            // the edge fully matched, so the walk should have descended it
            return Err(Error::GetPathToFailure);
        }
        let branch_key = key.take(closest_key.len() + 1 + common, token_size);
        self.record_child_change(
            state,
            closest_key,
            &branch_key,
            Child {
                compressed_key: branch_key.skip(closest_key.len() + 1, token_size),
                id: None,
                has_value: false,
            },
        );
        self.record_child_entry(
            state,
            &branch_key,
            existing.compressed_key.token(common, token_size),
            Child {
                compressed_key: existing.compressed_key.skip(common + 1, token_size),
                id: existing.id,
                has_value: existing.has_value,
            },
        );
        if key != &branch_key {
            self.record_child_change(
                state,
                &branch_key,
                key,
                Child {
                    compressed_key: key.skip(branch_key.len() + 1, token_size),
                    id: None,
                    has_value: false,
                },
            );
            self.record_new_node(state, key);
        }
        Ok(())
    }

    /// Materialize the removal of the value at `key`: drop the node if it
    /// has no children left and path-compress what remains.
    fn remove_in(&self, state: &mut ViewState, key: &Key) -> Result<(), Error> {
        if self.nodes_calculated.load(Ordering::Acquire) {
            return Err(Error::NodesAlreadyCalculated);
        }
        if self.children_in(state, key)?.is_none() {
            // the key has no node, so there is nothing to remove
            return Ok(());
        }

        let path = self.path_to_key(state, key)?;
        self.record_visited_path(state, &path);
        if &path[path.len() - 1].0 != key {
            return Ok(());
        }

        let parent_key = path.len().checked_sub(2).map(|i| path[i].0.clone());
        let grandparent_key = path.len().checked_sub(3).map(|i| path[i].0.clone());

        let node_children = self.children_in(state, key)?.unwrap_or_default();
        if !node_children.is_empty() {
            // still a branch or extension: merge it into its only child if
            // it has exactly one and no value
            return self.compress_node_path(state, parent_key.as_ref(), key);
        }

        match parent_key {
            Some(parent_key) => {
                self.record_node_deleted(state, key);
                self.record_child_removed(state, &parent_key, key);
                self.compress_node_path(state, grandparent_key.as_ref(), &parent_key)
            }
            None => {
                // the root is never deleted; removing its value with no
                // children leaves the empty root
                state.nodes.insert(Key::empty(), Some(ChildTable::new()));
                Ok(())
            }
        }
    }

    /// Merge the node at `node_key` into its single child if it has no
    /// value, collapsing the two edges into one compressed edge on
    /// `parent_key`.
    fn compress_node_path(
        &self,
        state: &mut ViewState,
        parent_key: Option<&Key>,
        node_key: &Key,
    ) -> Result<(), Error> {
        if self.nodes_calculated.load(Ordering::Acquire) {
            return Err(Error::NodesAlreadyCalculated);
        }
        let Some(parent_key) = parent_key else {
            return Ok(()); // never collapse the root
        };
        let node_children = self.children_in(state, node_key)?.unwrap_or_default();
        if node_children.len() != 1 {
            return Ok(());
        }
        if self.value_in(state, node_key)?.is_some() {
            return Ok(());
        }

        let token_size = self.token_size();
        self.record_node_deleted(state, node_key);
        // UNWRAP: there is exactly one entry.
        let (token, entry) = node_children.into_iter().next().unwrap();
        let child_key = node_key.extend(token, &entry.compressed_key, token_size);
        self.record_child_change(
            state,
            parent_key,
            &child_key,
            Child {
                compressed_key: child_key.skip(parent_key.len() + 1, token_size),
                id: entry.id,
                has_value: entry.has_value,
            },
        );
        Ok(())
    }

    // ---- node id calculation ----

    /// Calculate the ids of all changed nodes and return the view's root
    /// id. Runs at most once; afterwards the view accepts no more
    /// modifications. Subsequent calls return the cached result.
    pub(crate) fn calculate_node_ids(&self) -> Result<NodeId, Error> {
        self.calc
            .get_or_init(|| self.calculate_node_ids_inner())
            .clone()
    }

    fn calculate_node_ids_inner(&self) -> Result<NodeId, Error> {
        if self.is_invalid() {
            return Err(Error::Invalid);
        }

        // phase 1: fold the pending values into pending node edits
        {
            let mut state = self.state.write();
            let mut keys: Vec<Key> = state.values.keys().cloned().collect();
            keys.sort();
            for key in keys {
                // UNWRAP: the key was just read from the map.
                let is_insert = state.values.get(&key).unwrap().after.is_some();
                if is_insert {
                    self.insert_in(&mut state, &key)?;
                } else {
                    self.remove_in(&mut state, &key)?;
                }
            }
        }

        // phase 2: recompute ids bottom-up; subtrees hash in parallel and
        // each computation returns fresh data, so the result is a pure
        // function of the final state
        let (root_id, resolved) = {
            let state = self.state.read();
            let root_value = self.value_in(&state, &Key::empty())?;
            let (root_id, _, resolved) =
                self.compute_subtree(&state, Key::empty(), root_value)?;
            (root_id, resolved)
        };

        {
            let mut state = self.state.write();
            for (key, node) in &resolved {
                state.nodes.insert(key.clone(), Some(node.children.clone()));
            }
            state.resolved = resolved.into_iter().collect();
            state.root_id = Some(root_id);
        }
        self.nodes_calculated.store(true, Ordering::Release);

        if self.is_invalid() {
            return Err(Error::Invalid);
        }
        Ok(root_id)
    }

    /// Recompute the subtree rooted at `key`, returning its id, whether
    /// its node holds a value, and every resolved node under it.
    fn compute_subtree(
        &self,
        state: &ViewState,
        key: Key,
        value: Option<Vec<u8>>,
    ) -> Result<(NodeId, bool, Vec<(Key, Node)>), Error> {
        let token_size = self.token_size();
        let mut table = self
            .children_in(state, &key)?
            .ok_or(Error::GetPathToFailure)?;

        let stale: Vec<(u8, Child)> = table
            .iter()
            .filter(|(_, child)| child.id.is_none())
            .map(|(token, child)| (*token, child.clone()))
            .collect();

        type Computed = (u8, NodeId, bool, Vec<(Key, Node)>);
        let compute_child = |(token, child): (u8, Child)| -> Result<Computed, Error> {
            let child_key = key.extend(token, &child.compressed_key, token_size);
            let child_value = self.value_in(state, &child_key)?;
            let (id, has_value, resolved) =
                self.compute_subtree(state, child_key, child_value)?;
            Ok((token, id, has_value, resolved))
        };

        let computed: Vec<Computed> = if stale.len() > 1 {
            stale
                .into_par_iter()
                .map(compute_child)
                .collect::<Result<_, Error>>()?
        } else {
            stale
                .into_iter()
                .map(compute_child)
                .collect::<Result<_, Error>>()?
        };

        let mut resolved = Vec::new();
        for (token, id, has_value, mut child_resolved) in computed {
            // UNWRAP: the token came from this table.
            let entry = table.get_mut(&token).unwrap();
            entry.id = Some(id);
            entry.has_value = has_value;
            resolved.append(&mut child_resolved);
        }

        let digest = value.as_deref().map(value_digest);
        let id = hash_node(&key, digest.as_deref(), &table);
        self.db.metrics.record(|m| &m.nodes_hashed);
        let has_value = digest.is_some();
        resolved.push((
            key,
            Node {
                value_digest: digest,
                children: table,
            },
        ));
        Ok((id, has_value, resolved))
    }

    /// The id of this view's root, calculating node ids if necessary.
    pub fn root(&self) -> Result<NodeId, Error> {
        self.calculate_node_ids()
    }

    // ---- views over views ----

    /// Create a child view with the given changes applied on top of this
    /// view's state. If this view has been committed, the request is
    /// redirected to its parent.
    pub fn new_view(self: &Arc<Self>, changes: ViewChanges) -> Result<Arc<TrieView>, Error> {
        if self.is_invalid() {
            return Err(Error::Invalid);
        }
        let _guard = self.commit_lock.read();
        if self.committed.load(Ordering::Acquire) {
            return match self.parent() {
                Parent::Db => self.db.new_view(changes),
                Parent::View(parent) => parent.new_view(changes),
            };
        }
        self.calculate_node_ids()?;
        let child = TrieView::build(self.db.clone(), Parent::View(self.clone()), changes)?;

        let mut validity = self.validity.write();
        if validity.invalidated {
            return Err(Error::Invalid);
        }
        validity.children.retain(|weak| weak.strong_count() > 0);
        validity.children.push(Arc::downgrade(&child));
        Ok(child)
    }

    // ---- proofs ----

    /// A proof that `key` is, or is not, in this view's trie.
    pub fn get_proof(&self, key: &[u8]) -> Result<Proof, Error> {
        self.calculate_node_ids()?;
        let key = Key::from_bytes(key, self.token_size());
        let state = self.state.read();
        self.proof_in(&state, key)
    }

    fn proof_in(&self, state: &ViewState, key: Key) -> Result<Proof, Error> {
        let token_size = self.token_size();
        let path = self.path_to_key(state, &key)?;

        let mut proof = Proof {
            key: key.clone(),
            value: None,
            path: Vec::with_capacity(path.len() + 1),
        };
        let mut closest_value = None;
        for (node_key, children) in &path {
            closest_value = self.value_in(state, node_key)?;
            proof.path.push(ProofNode {
                key: node_key.clone(),
                value_digest: closest_value.as_deref().map(value_digest),
                children: children.clone(),
            });
        }

        // UNWRAP: the path always contains at least the root.
        let (closest_key, closest_children) = path.last().unwrap();
        if closest_key == &key {
            proof.value = closest_value;
        } else {
            // no node at the key; if a child sits where the walk would
            // have descended, include it to pin the absence branch
            let token = key.token(closest_key.len(), token_size);
            if let Some(child) = closest_children.get(&token) {
                let child_key = closest_key.extend(token, &child.compressed_key, token_size);
                let children = self
                    .children_in(state, &child_key)?
                    .ok_or_else(|| Error::Corrupt("dangling child pointer".into()))?;
                let child_value = self.value_in(state, &child_key)?;
                proof.path.push(ProofNode {
                    key: child_key,
                    value_digest: child_value.as_deref().map(value_digest),
                    children,
                });
            }
        }

        if self.is_invalid() {
            return Err(Error::Invalid);
        }
        Ok(proof)
    }

    /// A range proof for (at least part of) the key range `[start, end]`,
    /// carrying at most `max_length` key-value pairs.
    pub fn get_range_proof(
        &self,
        start: Option<&[u8]>,
        end: Option<&[u8]>,
        max_length: usize,
    ) -> Result<RangeProof, Error> {
        if let (Some(start), Some(end)) = (start, end) {
            if start > end {
                return Err(Error::StartAfterEnd);
            }
        }
        if max_length == 0 {
            return Err(Error::InvalidMaxLength);
        }
        self.calculate_node_ids()?;
        let token_size = self.token_size();
        let state = self.state.read();

        let key_values = self.collect_range(&state, start, end, max_length)?;

        let mut end_proof = match (key_values.last(), end) {
            (Some((greatest, _)), _) => {
                // prove the greatest *returned* pair, which may fall short
                // of the requested end when truncated by max_length
                self.proof_in(&state, Key::from_bytes(greatest, token_size))?
                    .path
            }
            (None, Some(end)) => self.proof_in(&state, Key::from_bytes(end, token_size))?.path,
            (None, None) => Vec::new(),
        };

        let mut start_proof = match start {
            Some(start) => self.proof_in(&state, Key::from_bytes(start, token_size))?.path,
            None => Vec::new(),
        };
        let shared = start_proof
            .iter()
            .zip(end_proof.iter())
            .take_while(|(a, b)| a.key == b.key)
            .count();
        start_proof.drain(..shared);

        if key_values.is_empty() && start_proof.is_empty() && end_proof.is_empty() {
            end_proof = self.proof_in(&state, Key::empty())?.path;
        }

        if self.is_invalid() {
            return Err(Error::Invalid);
        }
        Ok(RangeProof {
            key_values,
            start_proof,
            end_proof,
        })
    }

    /// The committed and pending values merged, ascending, within
    /// `[start, end]`, at most `max_length` of them.
    fn collect_range(
        &self,
        state: &ViewState,
        start: Option<&[u8]>,
        end: Option<&[u8]>,
        max_length: usize,
    ) -> Result<Vec<(Vec<u8>, Vec<u8>)>, Error> {
        let token_size = self.token_size();

        let mut pending: BTreeMap<Vec<u8>, Option<Vec<u8>>> = BTreeMap::new();
        for (key, record) in &state.values {
            if key.has_whole_bytes(token_size) {
                pending.insert(key.bytes().to_vec(), record.after.clone());
            }
        }
        if let Parent::View(parent) = self.parent() {
            parent.gather_changed_values(&mut pending)?;
        }
        pending.retain(|key, _| start.map_or(true, |s| key.as_slice() >= s));

        let mut db_iter = self.db.nodestore.value_iterator(start.unwrap_or(&[]))?.peekable();
        let mut pending_iter = pending.into_iter().peekable();
        let mut out = Vec::new();

        while out.len() < max_length {
            let db_key = match db_iter.peek() {
                Some(Ok((key, _))) => Some(key.clone()),
                Some(Err(_)) => {
                    // UNWRAP: just peeked an error.
                    return Err(db_iter.next().unwrap().unwrap_err());
                }
                None => None,
            };
            let pending_key = pending_iter.peek().map(|(key, _)| key.clone());

            let take_db = match (&db_key, &pending_key) {
                (None, None) => break,
                (Some(_), None) => true,
                (None, Some(_)) => false,
                (Some(db_key), Some(pending_key)) => db_key < pending_key,
            };
            let (key, value) = if take_db {
                // UNWRAP: just peeked.
                let (key, value) = db_iter.next().unwrap()?;
                (key, Some(value))
            } else {
                // pending entries override the committed store
                if db_key == pending_key {
                    db_iter.next();
                }
                // UNWRAP: just peeked.
                pending_iter.next().unwrap()
            };

            if end.map_or(false, |e| key.as_slice() > e) {
                break;
            }
            if let Some(value) = value {
                out.push((key, value));
            }
        }
        Ok(out)
    }

    /// Collect this view's (and its ancestors') pending value changes that
    /// are not already present in `out`. Descendants call this with their
    /// own changes pre-inserted, so the newest change for a key wins.
    fn gather_changed_values(
        &self,
        out: &mut BTreeMap<Vec<u8>, Option<Vec<u8>>>,
    ) -> Result<(), Error> {
        if self.is_invalid() {
            return Err(Error::Invalid);
        }
        {
            let token_size = self.token_size();
            let state = self.state.read();
            for (key, record) in &state.values {
                if key.has_whole_bytes(token_size) {
                    out.entry(key.bytes().to_vec())
                        .or_insert_with(|| record.after.clone());
                }
            }
        }
        match self.parent() {
            Parent::View(parent) => parent.gather_changed_values(out),
            Parent::Db => Ok(()),
        }
    }

    // ---- commit ----

    /// Commit this view's changes (and those of any uncommitted ancestor
    /// views) to the database in one atomic batch.
    ///
    /// On success every sibling view is invalidated and this view's
    /// children are re-parented onto the committed database. On failure
    /// the database and this view are unchanged, and the commit may be
    /// retried.
    pub fn commit_to_db(self: &Arc<Self>) -> Result<(), Error> {
        let _db_commit_guard = self.db.commit_lock.write();

        if self.committed.load(Ordering::Acquire) {
            return Err(Error::Committed);
        }
        if self.is_invalid() {
            return Err(Error::Invalid);
        }

        // the chain of uncommitted views, base-most first
        let mut chain = vec![self.clone()];
        loop {
            // UNWRAP: the chain is never empty.
            let parent = chain.last().unwrap().parent();
            match parent {
                Parent::View(parent) => chain.push(parent),
                Parent::Db => break,
            }
        }
        chain.reverse();

        for view in &chain {
            view.calculate_node_ids()?;
        }

        let guards: Vec<_> = chain.iter().map(|view| view.commit_lock.write()).collect();

        let mut node_changes: HashMap<Key, Option<Node>> = HashMap::new();
        let mut value_changes: HashMap<Key, Option<Vec<u8>>> = HashMap::new();
        let mut summaries = Vec::with_capacity(chain.len());
        for view in &chain {
            let state = view.state.read();
            for (key, entry) in &state.nodes {
                if entry.is_none() {
                    node_changes.insert(key.clone(), None);
                }
            }
            for (key, node) in &state.resolved {
                node_changes.insert(key.clone(), Some(node.clone()));
            }
            for (key, record) in &state.values {
                value_changes.insert(key.clone(), record.after.clone());
            }
            summaries.push(ChangeSummary {
                // UNWRAP: node ids were calculated above.
                root_id: state.root_id.unwrap(),
                values: state.values.clone(),
            });
        }

        self.db
            .commit_changes(node_changes, value_changes, summaries)?;

        for view in &chain {
            view.committed.store(true, Ordering::Release);
        }
        drop(guards);

        self.db.retarget_after_commit(&chain);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryStore;
    use crate::{MerkleDb, Options};

    fn db() -> MerkleDb {
        MerkleDb::open(Arc::new(MemoryStore::new()), Options::new()).unwrap()
    }

    #[test]
    fn values_at_partial_byte_keys_are_rejected() {
        let db = db();
        let view = db.new_view(ViewChanges::new()).unwrap();
        let mut state = view.state.write();
        let key = Key::from_bytes(&[0xab], 4).take(1, 4);
        assert_eq!(
            view.record_value_change(&mut state, key.clone(), Some(b"v".to_vec())),
            Err(Error::PartialByteLengthWithValue)
        );
        // a removal at a partial-byte key is fine
        assert_eq!(view.record_value_change(&mut state, key, None), Ok(()));
    }

    #[test]
    fn no_modification_after_calculation() {
        let db = db();
        let view = db.new_view(ViewChanges::new().put(&b"a"[..], &b"1"[..])).unwrap();
        view.root().unwrap();
        let mut state = view.state.write();
        let key = Key::from_bytes(b"b", 4);
        assert_eq!(
            view.record_value_change(&mut state, key.clone(), Some(b"2".to_vec())),
            Err(Error::NodesAlreadyCalculated)
        );
        assert_eq!(view.insert_in(&mut state, &key), Err(Error::NodesAlreadyCalculated));
        assert_eq!(view.remove_in(&mut state, &key), Err(Error::NodesAlreadyCalculated));
    }

    #[test]
    fn resolved_nodes_have_concrete_ids() {
        let db = db();
        let view = db
            .new_view(
                ViewChanges::new()
                    .put(&b"ab"[..], &b"1"[..])
                    .put(&b"ac"[..], &b"2"[..])
                    .put(&b"b"[..], &b"3"[..]),
            )
            .unwrap();
        view.root().unwrap();
        let state = view.state.read();
        for (key, node) in &state.resolved {
            for child in node.children.values() {
                assert!(child.id.is_some(), "stale child under {:?}", key);
            }
        }
    }
}
