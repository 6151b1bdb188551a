//! The change-summary ring.
//!
//! Every commit appends a summary: the root it produced plus the values it
//! changed, keyed by before/after. The ring is bounded; summaries are also
//! persisted so the history survives reopening. Walking the ring backwards
//! from the newest summary rebuilds the value state at any root it still
//! covers, which is what powers proofs against recently committed roots.

use crate::Error;
use merkledb_core::{Key, NodeId};
use std::collections::{HashMap, VecDeque};

/// A single key's value transition inside one commit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct ValueChangeRecord {
    pub(crate) before: Option<Vec<u8>>,
    pub(crate) after: Option<Vec<u8>>,
}

/// One commit's worth of changes, keyed by the root it produced.
#[derive(Debug, Clone)]
pub(crate) struct ChangeSummary {
    pub(crate) root_id: NodeId,
    pub(crate) values: HashMap<Key, ValueChangeRecord>,
}

/// A bounded ring of the most recent change summaries.
pub(crate) struct TrieHistory {
    ring: VecDeque<(u64, ChangeSummary)>,
    next_index: u64,
    capacity: usize,
}

impl TrieHistory {
    pub(crate) fn new(capacity: usize) -> Self {
        TrieHistory {
            ring: VecDeque::with_capacity(capacity.min(1024)),
            next_index: 0,
            capacity,
        }
    }

    /// The index the next recorded summary will get.
    pub(crate) fn next_index(&self) -> u64 {
        self.next_index
    }

    /// Indices that fall out of the ring when `added` summaries join it.
    pub(crate) fn evicted_by(&self, added: usize) -> Vec<u64> {
        let total = self.ring.len() + added;
        let excess = total.saturating_sub(self.capacity.max(1));
        self.ring
            .iter()
            .take(excess)
            .map(|(index, _)| *index)
            .collect()
    }

    /// Append a summary, dropping the oldest entries beyond capacity.
    pub(crate) fn record(&mut self, summary: ChangeSummary) -> u64 {
        let index = self.next_index;
        self.next_index += 1;
        self.ring.push_back((index, summary));
        while self.ring.len() > self.capacity.max(1) {
            self.ring.pop_front();
        }
        index
    }

    /// Restore a summary loaded from the store, oldest first.
    pub(crate) fn restore(&mut self, index: u64, summary: ChangeSummary) {
        self.next_index = self.next_index.max(index + 1);
        self.ring.push_back((index, summary));
        while self.ring.len() > self.capacity.max(1) {
            self.ring.pop_front();
        }
    }

    /// The value changes that turn the current committed state back into
    /// the state at `root`: for every key changed since, the value it held
    /// then. Empty when `root` is the current root.
    pub(crate) fn changes_to_root(
        &self,
        root: &NodeId,
    ) -> Result<HashMap<Key, Option<Vec<u8>>>, Error> {
        let position = self
            .ring
            .iter()
            .rposition(|(_, summary)| &summary.root_id == root)
            .ok_or(Error::InsufficientHistory)?;

        let mut changes = HashMap::new();
        // newest first; older summaries overwrite, since undoing a chain
        // ends at the value the oldest undone summary started from
        for (_, summary) in self.ring.iter().skip(position + 1).rev() {
            for (key, record) in &summary.values {
                changes.insert(key.clone(), record.before.clone());
            }
        }
        Ok(changes)
    }
}
