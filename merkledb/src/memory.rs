//! An in-memory [`OrderedByteStore`].
//!
//! The reference backend: a `BTreeMap` behind a read-write lock. Iterators
//! copy their range out of the map at creation, which gives them the
//! stable-snapshot guarantee for free. Useful for tests and as the model
//! implementation for real engines.

use crate::store::{BatchOp, OrderedByteStore, StoreIterator};
use crate::Error;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::{
    atomic::{AtomicBool, AtomicUsize, Ordering},
    Arc,
};

/// An in-memory, snapshot-iterating byte store.
#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Inner>,
}

#[derive(Default)]
struct Inner {
    map: RwLock<BTreeMap<Vec<u8>, Vec<u8>>>,
    closed: AtomicBool,
    open_iterators: AtomicUsize,
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    fn check_open(&self) -> Result<(), Error> {
        if self.inner.closed.load(Ordering::Acquire) {
            Err(Error::Closed)
        } else {
            Ok(())
        }
    }
}

impl OrderedByteStore for MemoryStore {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, Error> {
        self.check_open()?;
        Ok(self.inner.map.read().get(key).cloned())
    }

    fn put(&self, key: &[u8], value: &[u8]) -> Result<(), Error> {
        self.check_open()?;
        self.inner.map.write().insert(key.to_vec(), value.to_vec());
        Ok(())
    }

    fn delete(&self, key: &[u8]) -> Result<(), Error> {
        self.check_open()?;
        self.inner.map.write().remove(key);
        Ok(())
    }

    fn write_batch(&self, batch: Vec<BatchOp>) -> Result<(), Error> {
        self.check_open()?;
        // one write guard for the whole batch makes it atomic
        let mut map = self.inner.map.write();
        for op in batch {
            match op {
                BatchOp::Put { key, value } => {
                    map.insert(key, value);
                }
                BatchOp::Delete { key } => {
                    map.remove(&key);
                }
            }
        }
        Ok(())
    }

    fn iterator_with_start_and_prefix(
        &self,
        start: &[u8],
        prefix: &[u8],
    ) -> Result<StoreIterator, Error> {
        self.check_open()?;
        let snapshot: Vec<(Vec<u8>, Vec<u8>)> = self
            .inner
            .map
            .read()
            .range(start.to_vec()..)
            .filter(|(key, _)| key.starts_with(prefix))
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect();
        self.inner.open_iterators.fetch_add(1, Ordering::Relaxed);
        Ok(Box::new(SnapshotIterator {
            entries: snapshot.into_iter(),
            store: self.inner.clone(),
        }))
    }

    fn compact(&self, _start: &[u8], _limit: Option<&[u8]>) -> Result<(), Error> {
        self.check_open()
    }

    fn close(&self) -> Result<(), Error> {
        self.check_open()?;
        self.inner.closed.store(true, Ordering::Release);
        let leaked = self.inner.open_iterators.load(Ordering::Relaxed);
        if leaked > 0 {
            log::warn!("memory store closed with {} unreleased iterators", leaked);
        }
        Ok(())
    }
}

struct SnapshotIterator {
    entries: std::vec::IntoIter<(Vec<u8>, Vec<u8>)>,
    store: Arc<Inner>,
}

impl Iterator for SnapshotIterator {
    type Item = Result<(Vec<u8>, Vec<u8>), Error>;

    fn next(&mut self) -> Option<Self::Item> {
        self.entries.next().map(Ok)
    }
}

impl Drop for SnapshotIterator {
    fn drop(&mut self) {
        self.store.open_iterators.fetch_sub(1, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn get_put_delete() {
        let store = MemoryStore::new();
        assert_eq!(store.get(b"a"), Ok(None));
        store.put(b"a", b"1").unwrap();
        assert_eq!(store.get(b"a"), Ok(Some(b"1".to_vec())));
        assert_eq!(store.has(b"a"), Ok(true));
        store.delete(b"a").unwrap();
        assert_eq!(store.get(b"a"), Ok(None));
        // deleting an absent key is fine
        store.delete(b"a").unwrap();
    }

    #[test]
    fn batch_is_atomic_under_snapshot() {
        let store = MemoryStore::new();
        store.put(b"a", b"1").unwrap();
        let mut iter = store.iterator().unwrap();
        store
            .write_batch(vec![
                BatchOp::Put {
                    key: b"b".to_vec(),
                    value: b"2".to_vec(),
                },
                BatchOp::Delete { key: b"a".to_vec() },
            ])
            .unwrap();

        // the iterator sees the pre-batch snapshot
        assert_eq!(iter.next(), Some(Ok((b"a".to_vec(), b"1".to_vec()))));
        assert_eq!(iter.next(), None);

        // the store sees the post-batch state
        assert_eq!(store.get(b"a"), Ok(None));
        assert_eq!(store.get(b"b"), Ok(Some(b"2".to_vec())));
    }

    #[test]
    fn iterators_are_ordered_and_bounded() {
        let store = MemoryStore::new();
        for key in [&b"ab"[..], b"aa", b"b", b"ac"] {
            store.put(key, key).unwrap();
        }
        let keys: Vec<Vec<u8>> = store
            .iterator_with_start_and_prefix(b"ab", b"a")
            .unwrap()
            .map(|entry| entry.unwrap().0)
            .collect();
        assert_eq!(keys, vec![b"ab".to_vec(), b"ac".to_vec()]);

        let keys: Vec<Vec<u8>> = store
            .iterator_with_prefix(b"a")
            .unwrap()
            .map(|entry| entry.unwrap().0)
            .collect();
        assert_eq!(keys, vec![b"aa".to_vec(), b"ab".to_vec(), b"ac".to_vec()]);
    }

    #[test]
    fn closed_store_errors() {
        let store = MemoryStore::new();
        store.put(b"a", b"1").unwrap();
        store.close().unwrap();
        assert_eq!(store.get(b"a"), Err(Error::Closed));
        assert_eq!(store.put(b"a", b"1"), Err(Error::Closed));
        assert_eq!(store.iterator().err(), Some(Error::Closed));
        assert_eq!(store.close(), Err(Error::Closed));
    }

    #[test]
    fn leaked_iterator_does_not_corrupt_close() {
        let store = MemoryStore::new();
        store.put(b"a", b"1").unwrap();
        let iter = store.iterator().unwrap();
        store.close().unwrap();
        // the leaked iterator still drains its snapshot
        assert_eq!(iter.count(), 1);
    }
}
