//! Prometheus metrics for the consensus core.

use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::registry::Registry;

/// Consensus metrics. Cloning shares the underlying series.
#[derive(Clone, Debug, Default)]
pub struct Metrics {
    /// Height the core is working on.
    pub height: Gauge,

    /// Round the core is at within the current height.
    pub round: Gauge,

    /// Blocks committed.
    pub commits: Counter,

    /// Rounds skipped forward on two-thirds votes from a higher round.
    pub round_skips: Counter,

    /// Write-ahead log fsyncs.
    pub wal_syncs: Counter,

    /// Conflicting vote pairs observed.
    pub equivocations: Counter,

    /// Proposals rejected as untimely.
    pub untimely_proposals: Counter,
}

impl Metrics {
    /// Create the metrics and register them under the `consensus` prefix.
    pub fn register(registry: &mut Registry) -> Self {
        let metrics = Self::default();
        let sub = registry.sub_registry_with_prefix("consensus");

        sub.register("height", "Height the core is working on", metrics.height.clone());
        sub.register("round", "Round within the current height", metrics.round.clone());
        sub.register("commits", "Blocks committed", metrics.commits.clone());
        sub.register(
            "round_skips",
            "Rounds skipped forward on votes from a higher round",
            metrics.round_skips.clone(),
        );
        sub.register("wal_syncs", "Write-ahead log fsyncs", metrics.wal_syncs.clone());
        sub.register(
            "equivocations",
            "Conflicting vote pairs observed",
            metrics.equivocations.clone(),
        );
        sub.register(
            "untimely_proposals",
            "Proposals rejected as untimely",
            metrics.untimely_proposals.clone(),
        );

        metrics
    }
}
