//! The durable backend contract.
//!
//! The trie persists through any key-ordered byte store that can apply a
//! batch atomically. The concrete engine (typically a log-structured merge
//! store) is a collaborator; the database only relies on the guarantees
//! spelled out here: atomic batches, key-ordered iteration, and stable
//! snapshots within an iterator's lifetime.

use crate::Error;

/// One operation of an atomic write batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BatchOp {
    /// Set `key` to `value`.
    Put {
        /// The key to write.
        key: Vec<u8>,
        /// The value to write.
        value: Vec<u8>,
    },
    /// Remove `key` if present.
    Delete {
        /// The key to remove.
        key: Vec<u8>,
    },
}

/// A key-ordered iterator over store entries.
///
/// Iterators observe a stable snapshot of the store taken at creation.
/// They should be dropped promptly: implementations track outstanding
/// iterators and warn (but must not corrupt state) if the store is closed
/// while some are still live.
pub type StoreIterator = Box<dyn Iterator<Item = Result<(Vec<u8>, Vec<u8>), Error>> + Send>;

/// A persistent ordered map from bytes to bytes.
///
/// All operations fail with [`Error::Closed`] after [`close`] has been
/// called.
///
/// [`close`]: OrderedByteStore::close
pub trait OrderedByteStore: Send + Sync {
    /// Get the value stored at `key`.
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, Error>;

    /// Whether `key` is present.
    fn has(&self, key: &[u8]) -> Result<bool, Error> {
        Ok(self.get(key)?.is_some())
    }

    /// Set `key` to `value`.
    fn put(&self, key: &[u8], value: &[u8]) -> Result<(), Error>;

    /// Remove `key` if present.
    fn delete(&self, key: &[u8]) -> Result<(), Error>;

    /// Apply `batch` atomically: either every operation is visible after
    /// this returns, or none is.
    fn write_batch(&self, batch: Vec<BatchOp>) -> Result<(), Error>;

    /// Iterate the whole store in key order.
    fn iterator(&self) -> Result<StoreIterator, Error> {
        self.iterator_with_start_and_prefix(&[], &[])
    }

    /// Iterate entries whose key starts with `prefix`, in key order.
    fn iterator_with_prefix(&self, prefix: &[u8]) -> Result<StoreIterator, Error> {
        self.iterator_with_start_and_prefix(prefix, prefix)
    }

    /// Iterate entries with key at or after `start`, in key order.
    fn iterator_with_start(&self, start: &[u8]) -> Result<StoreIterator, Error> {
        self.iterator_with_start_and_prefix(start, &[])
    }

    /// Iterate entries with key at or after `start` whose key starts with
    /// `prefix`, in key order.
    fn iterator_with_start_and_prefix(
        &self,
        start: &[u8],
        prefix: &[u8],
    ) -> Result<StoreIterator, Error>;

    /// Hint that the store may compact the key range `[start, limit)`.
    /// A no-op is acceptable. `start >= limit` is a no-op; a `limit` of
    /// `None` means "through the greatest existing key".
    fn compact(&self, start: &[u8], limit: Option<&[u8]>) -> Result<(), Error>;

    /// Close the store. Outstanding iterators may be tolerated with a
    /// warning but must not corrupt state.
    fn close(&self) -> Result<(), Error>;
}
