//! Metrics for feedsync.

use iroh_metrics::{Counter, MetricsGroup};

/// Counters for the reconciliation engine.
#[derive(Debug, Default, MetricsGroup)]
#[metrics(name = "feedsync")]
#[non_exhaustive]
pub struct Metrics {
    /// Number of feed insert events applied to the cache.
    pub feed_inserts_applied: Counter,
    /// Number of feed insert events dropped as duplicates.
    pub feed_inserts_deduped: Counter,
    /// Number of feed update events applied to the cache.
    pub feed_updates_applied: Counter,
    /// Number of feed update events dropped as stale.
    pub feed_updates_stale: Counter,
    /// Number of feed delete events processed.
    pub feed_deletes: Counter,
    /// Number of optimistic mutations applied.
    pub optimistic_applied: Counter,
    /// Number of mutations confirmed by the authority.
    pub mutations_confirmed: Counter,
    /// Number of mutations rolled back after failure.
    pub mutations_rolled_back: Counter,
    /// Number of pages applied from fetches.
    pub pages_applied: Counter,
    /// Number of fetch results dropped as superseded.
    pub fetches_superseded: Counter,
    /// Number of full resynchronizations after reconnects.
    pub resyncs: Counter,
    /// Number of times the engine actor loop ticked.
    pub actor_tick_main: Counter,
}
