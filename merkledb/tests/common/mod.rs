#![allow(dead_code)]

use merkledb::{
    BatchOp, Error, MemoryStore, MerkleDb, Options, OrderedByteStore, StoreIterator, ViewChanges,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// The token size of the default branch factor, used by proof verifiers.
pub const TS: usize = 4;

pub fn new_db() -> MerkleDb {
    MerkleDb::open(Arc::new(MemoryStore::new()), Options::new()).unwrap()
}

pub fn db_over(store: Arc<dyn OrderedByteStore>) -> MerkleDb {
    MerkleDb::open(store, Options::new()).unwrap()
}

/// Build a database holding exactly `pairs` and return its root.
#[allow(dead_code)]
pub fn root_of(pairs: &[(&[u8], &[u8])]) -> [u8; 32] {
    let db = new_db();
    let mut changes = ViewChanges::new();
    for (key, value) in pairs {
        changes = changes.put(*key, *value);
    }
    let view = db.new_view(changes).unwrap();
    view.commit_to_db().unwrap();
    db.root()
}

/// A store wrapper that fails the next atomic batch write, for exercising
/// commit failure paths.
#[allow(dead_code)]
pub struct FailingStore {
    inner: MemoryStore,
    fail_next_batch: AtomicBool,
}

#[allow(dead_code)]
impl FailingStore {
    pub fn new() -> Self {
        FailingStore {
            inner: MemoryStore::new(),
            fail_next_batch: AtomicBool::new(false),
        }
    }

    pub fn fail_next_batch(&self) {
        self.fail_next_batch.store(true, Ordering::Release);
    }
}

impl OrderedByteStore for FailingStore {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, Error> {
        self.inner.get(key)
    }

    fn put(&self, key: &[u8], value: &[u8]) -> Result<(), Error> {
        self.inner.put(key, value)
    }

    fn delete(&self, key: &[u8]) -> Result<(), Error> {
        self.inner.delete(key)
    }

    fn write_batch(&self, batch: Vec<BatchOp>) -> Result<(), Error> {
        if self.fail_next_batch.swap(false, Ordering::AcqRel) {
            return Err(Error::Corrupt("simulated batch write failure".into()));
        }
        self.inner.write_batch(batch)
    }

    fn iterator_with_start_and_prefix(
        &self,
        start: &[u8],
        prefix: &[u8],
    ) -> Result<StoreIterator, Error> {
        self.inner.iterator_with_start_and_prefix(start, prefix)
    }

    fn compact(&self, start: &[u8], limit: Option<&[u8]>) -> Result<(), Error> {
        self.inner.compact(start, limit)
    }

    fn close(&self) -> Result<(), Error> {
        self.inner.close()
    }
}
