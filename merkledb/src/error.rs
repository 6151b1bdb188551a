use merkledb_core::codec::DecodeError;

/// The error type for database and view operations.
///
/// Every kind is surfaced to the caller; none are swallowed internally.
/// [`Error::Invalid`] is sticky: once a view is invalidated, every
/// subsequent operation on it returns it.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    /// The key is absent. Returned only where absence is a distinct
    /// outcome from an error, such as batched multi-key reads.
    #[error("key not found")]
    NotFound,
    /// The database has been closed.
    #[error("operation on a closed database")]
    Closed,
    /// The trie this view was based on has changed, rendering the view
    /// invalid.
    #[error("view invalidated by an ancestor commit")]
    Invalid,
    /// The view has already been committed.
    #[error("view has been committed")]
    Committed,
    /// A value may only be stored at a key occupying a whole number of
    /// bytes, since the backing store is byte-addressed.
    #[error("cannot store a value at a key with a partial-byte length")]
    PartialByteLengthWithValue,
    /// A range query's start bound is greater than its end bound.
    #[error("start key is after end key")]
    StartAfterEnd,
    /// A range proof was requested with a zero length limit.
    #[error("range proof max length must be greater than zero")]
    InvalidMaxLength,
    /// The parent trie had no root to build a view on.
    #[error("no valid root to build the view on")]
    NoValidRoot,
    /// The view's node ids have been calculated; it no longer accepts
    /// modifications.
    #[error("cannot modify the trie after node ids have been calculated")]
    NodesAlreadyCalculated,
    /// The path walk failed to return the closest node. Seeing this is a
    /// bug.
    #[error("path walk failed to return the closest node")]
    GetPathToFailure,
    /// The history ring no longer reaches the requested root.
    #[error("insufficient history to reach the requested root")]
    InsufficientHistory,
    /// A persisted record failed to decode.
    #[error("corrupt database record: {0}")]
    Corrupt(String),
}

impl From<DecodeError> for Error {
    fn from(err: DecodeError) -> Self {
        Error::Corrupt(err.to_string())
    }
}
