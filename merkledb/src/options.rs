use merkledb_core::BranchFactor;

/// Options when opening a [`crate::MerkleDb`] instance.
pub struct Options {
    pub(crate) branch_factor: BranchFactor,
    /// How many change summaries the history ring retains.
    pub(crate) history_length: usize,
    /// Capacity of the decoded-node cache, in entries.
    pub(crate) node_cache_entries: usize,
    /// Enable or disable metrics collection.
    pub(crate) metrics: bool,
}

impl Options {
    /// Create a new `Options` instance with the default values.
    pub fn new() -> Self {
        Self {
            branch_factor: BranchFactor::Sixteen,
            history_length: 128,
            node_cache_entries: 1024,
            metrics: false,
        }
    }

    /// Set the trie's branch factor. This is fixed at creation; reopening
    /// a database with a different branch factor misreads its records.
    ///
    /// Default: sixteen.
    pub fn branch_factor(&mut self, branch_factor: BranchFactor) {
        self.branch_factor = branch_factor;
    }

    /// Set how many committed change summaries are retained for proofs
    /// against past roots.
    ///
    /// Default: 128.
    pub fn history_length(&mut self, history_length: usize) {
        self.history_length = history_length;
    }

    /// Set the capacity of the in-memory node cache.
    ///
    /// May not be zero.
    pub fn node_cache_entries(&mut self, node_cache_entries: usize) {
        assert!(node_cache_entries > 0);
        self.node_cache_entries = node_cache_entries;
    }

    /// Set metrics collection on or off.
    ///
    /// Default: off.
    pub fn metrics(&mut self, metrics: bool) {
        self.metrics = metrics;
    }
}

impl Default for Options {
    fn default() -> Self {
        Self::new()
    }
}
