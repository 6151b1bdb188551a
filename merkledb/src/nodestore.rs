//! Persisted layout and node access.
//!
//! The store's key space is partitioned by a leading prefix byte:
//!
//! ```text
//! 0x00 || "root"                -> current root id (32 bytes)
//! 0x00 || "history" || be64(i)  -> serialized change summary
//! 0x00 || "initialized"         -> presence sentinel
//! 0x01 || varint(len) || packed -> encoded node record
//! 0x02 || raw key bytes         -> raw value bytes
//! ```
//!
//! Values are stored under their raw bytes so the value table iterates in
//! logical key order; node keys carry a length prefix because they may end
//! in a partial byte. Decoded nodes are cached in an LRU, with negative
//! entries for misses.

use crate::metrics::Metrics;
use crate::store::{BatchOp, OrderedByteStore, StoreIterator};
use crate::Error;
use lru::LruCache;
use merkledb_core::{codec, Key, Node, NodeId};
use parking_lot::Mutex;
use std::num::NonZeroUsize;
use std::sync::Arc;

const METADATA_PREFIX: u8 = 0x00;
const NODE_PREFIX: u8 = 0x01;
const VALUE_PREFIX: u8 = 0x02;

const ROOT_SUFFIX: &[u8] = b"root";
const HISTORY_SUFFIX: &[u8] = b"history";
const INITIALIZED_SUFFIX: &[u8] = b"initialized";

fn metadata_key(suffix: &[u8]) -> Vec<u8> {
    let mut key = Vec::with_capacity(1 + suffix.len());
    key.push(METADATA_PREFIX);
    key.extend_from_slice(suffix);
    key
}

pub(crate) fn node_key(key: &Key) -> Vec<u8> {
    let mut out = Vec::with_capacity(2 + key.bytes().len());
    out.push(NODE_PREFIX);
    codec::put_key(&mut out, key);
    out
}

pub(crate) fn value_key(key_bytes: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(1 + key_bytes.len());
    out.push(VALUE_PREFIX);
    out.extend_from_slice(key_bytes);
    out
}

pub(crate) fn root_key() -> Vec<u8> {
    metadata_key(ROOT_SUFFIX)
}

pub(crate) fn initialized_key() -> Vec<u8> {
    metadata_key(INITIALIZED_SUFFIX)
}

pub(crate) fn history_key(index: u64) -> Vec<u8> {
    let mut key = metadata_key(HISTORY_SUFFIX);
    key.extend_from_slice(&index.to_be_bytes());
    key
}

fn history_index(store_key: &[u8]) -> Result<u64, Error> {
    let suffix_len = 1 + HISTORY_SUFFIX.len();
    let raw: [u8; 8] = store_key[suffix_len..]
        .try_into()
        .map_err(|_| Error::Corrupt("malformed history key".into()))?;
    Ok(u64::from_be_bytes(raw))
}

/// Loads and persists trie nodes and values, with an LRU cache of decoded
/// nodes in front of the store.
pub(crate) struct NodeStore {
    store: Arc<dyn OrderedByteStore>,
    token_size: usize,
    // negative entries cache known-absent nodes
    cache: Mutex<LruCache<Key, Option<Node>>>,
    metrics: Metrics,
}

impl NodeStore {
    pub(crate) fn new(
        store: Arc<dyn OrderedByteStore>,
        token_size: usize,
        cache_entries: usize,
        metrics: Metrics,
    ) -> Self {
        NodeStore {
            store,
            token_size,
            // UNWRAP: Options rejects a zero cache capacity.
            cache: Mutex::new(LruCache::new(NonZeroUsize::new(cache_entries).unwrap())),
            metrics,
        }
    }

    pub(crate) fn get_node(&self, key: &Key) -> Result<Option<Node>, Error> {
        if let Some(cached) = self.cache.lock().get(key) {
            self.metrics.record(|m| &m.node_cache_hits);
            return Ok(cached.clone());
        }
        self.metrics.record(|m| &m.node_cache_misses);
        let node = match self.store.get(&node_key(key))? {
            Some(bytes) => Some(codec::decode_node(&bytes, self.token_size)?),
            None => None,
        };
        self.cache.lock().put(key.clone(), node.clone());
        Ok(node)
    }

    pub(crate) fn get_value(&self, key: &Key) -> Result<Option<Vec<u8>>, Error> {
        if !key.has_whole_bytes(self.token_size) {
            return Ok(None);
        }
        self.store.get(&value_key(key.bytes()))
    }

    /// Iterate raw values with logical key at or after `start`.
    pub(crate) fn value_iterator(&self, start: &[u8]) -> Result<StoreIterator, Error> {
        let iter = self
            .store
            .iterator_with_start_and_prefix(&value_key(start), &[VALUE_PREFIX])?;
        Ok(Box::new(iter.map(|entry| {
            entry.map(|(key, value)| (key[1..].to_vec(), value))
        })))
    }

    pub(crate) fn read_root_id(&self) -> Result<Option<NodeId>, Error> {
        match self.store.get(&root_key())? {
            None => Ok(None),
            Some(bytes) => {
                let id: NodeId = bytes
                    .as_slice()
                    .try_into()
                    .map_err(|_| Error::Corrupt("root marker is not 32 bytes".into()))?;
                Ok(Some(id))
            }
        }
    }

    pub(crate) fn is_initialized(&self) -> Result<bool, Error> {
        self.store.has(&initialized_key())
    }

    /// Load all persisted change summaries, oldest first.
    pub(crate) fn read_history(
        &self,
    ) -> Result<Vec<(u64, NodeId, Vec<codec::SummaryEntry>)>, Error> {
        let mut out = Vec::new();
        let iter = self
            .store
            .iterator_with_prefix(&metadata_key(HISTORY_SUFFIX))?;
        for entry in iter {
            let (key, bytes) = entry?;
            let index = history_index(&key)?;
            let (root_id, entries) = codec::decode_summary(&bytes, self.token_size)?;
            out.push((index, root_id, entries));
        }
        Ok(out)
    }

    /// Update the cache after a batch of node changes has been applied to
    /// the store.
    pub(crate) fn apply_node_changes<'a>(
        &self,
        changes: impl Iterator<Item = (&'a Key, Option<&'a Node>)>,
    ) {
        let mut cache = self.cache.lock();
        for (key, node) in changes {
            cache.put(key.clone(), node.cloned());
        }
    }
}

/// Stage a node write into a batch.
pub(crate) fn stage_node_put(batch: &mut Vec<BatchOp>, key: &Key, node: &Node) {
    batch.push(BatchOp::Put {
        key: node_key(key),
        value: codec::encode_node(node),
    });
}

/// Stage a node deletion into a batch.
pub(crate) fn stage_node_delete(batch: &mut Vec<BatchOp>, key: &Key) {
    batch.push(BatchOp::Delete { key: node_key(key) });
}
