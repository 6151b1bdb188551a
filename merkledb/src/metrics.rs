use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};

/// Metrics collector. When inactive, every record call is a no-op.
#[derive(Clone)]
pub enum Metrics {
    /// Metrics are being collected.
    Active(Arc<ActiveMetrics>),
    /// Metrics collection is disabled.
    Inactive,
}

/// Counters collected during execution.
#[derive(Default)]
pub struct ActiveMetrics {
    /// Value lookups answered by a view's own pending changes.
    pub view_value_hits: AtomicU64,
    /// Value lookups that fell through to an ancestor.
    pub view_value_misses: AtomicU64,
    /// Node lookups answered by a view's own pending edits.
    pub view_node_hits: AtomicU64,
    /// Node lookups that fell through to an ancestor.
    pub view_node_misses: AtomicU64,
    /// Node reads served from the decoded-node cache.
    pub node_cache_hits: AtomicU64,
    /// Node reads that went to the store.
    pub node_cache_misses: AtomicU64,
    /// Node ids recomputed by hash calculation.
    pub nodes_hashed: AtomicU64,
    /// Successful commits.
    pub commits: AtomicU64,
}

impl Metrics {
    /// Returns the Metrics object, active or not based on the input.
    pub fn new(active: bool) -> Self {
        if active {
            Metrics::Active(Arc::new(ActiveMetrics::default()))
        } else {
            Metrics::Inactive
        }
    }

    pub(crate) fn record(&self, counter: impl Fn(&ActiveMetrics) -> &AtomicU64) {
        if let Metrics::Active(metrics) = self {
            counter(metrics).fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Print collected metrics to stdout.
    pub fn print(&self) {
        match self {
            Metrics::Active(m) => {
                println!("metrics");
                let pairs = [
                    ("view value hits", &m.view_value_hits),
                    ("view value misses", &m.view_value_misses),
                    ("view node hits", &m.view_node_hits),
                    ("view node misses", &m.view_node_misses),
                    ("node cache hits", &m.node_cache_hits),
                    ("node cache misses", &m.node_cache_misses),
                    ("nodes hashed", &m.nodes_hashed),
                    ("commits", &m.commits),
                ];
                for (name, counter) in pairs {
                    println!("  {:<20} {}", name, counter.load(Ordering::Relaxed));
                }
            }
            Metrics::Inactive => {
                println!("Metrics collection was not activated")
            }
        }
    }
}
