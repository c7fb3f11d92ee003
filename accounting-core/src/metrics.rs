//! Metrics collection for observability
//!
//! Prometheus metrics for monitoring the accounting processor.
//!
//! # Metrics
//!
//! - `accounting_charges_accepted_total` - Charges that were applied
//! - `accounting_charges_declined_total` - Charges declined for lack of credit
//! - `accounting_charges_replayed_total` - Charges answered from the transaction log
//! - `accounting_deposits_total` - Sub-allocations created
//! - `accounting_root_deposits_total` - Root allocations created
//! - `accounting_allocation_updates_total` - Administrative updates applied
//! - `accounting_forwarded_commands_total` - Commands sent to the active processor
//! - `accounting_commit_duration_seconds` - Histogram of store commit latencies

use prometheus::{Encoder, Histogram, HistogramOpts, IntCounter, Registry, TextEncoder};
use std::sync::Arc;

/// Metrics collector
///
/// Collectors are registered on a registry owned by this instance, so several
/// services can live in one process (tests, embedded use).
#[derive(Clone)]
pub struct Metrics {
    /// Applied charges
    pub charges_accepted: IntCounter,

    /// Declined charges
    pub charges_declined: IntCounter,

    /// Replayed charges
    pub charges_replayed: IntCounter,

    /// Created sub-allocations
    pub deposits_total: IntCounter,

    /// Created root allocations
    pub root_deposits_total: IntCounter,

    /// Applied allocation updates
    pub allocation_updates_total: IntCounter,

    /// Commands forwarded to the leader
    pub forwarded_total: IntCounter,

    /// Commit duration histogram
    pub commit_duration: Histogram,

    /// Prometheus registry
    pub registry: Arc<Registry>,
}

impl std::fmt::Debug for Metrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Metrics")
            .field("charges_accepted", &self.charges_accepted.get())
            .field("charges_declined", &self.charges_declined.get())
            .finish_non_exhaustive()
    }
}

fn counter(registry: &Registry, name: &str, help: &str) -> prometheus::Result<IntCounter> {
    let counter = IntCounter::new(name, help)?;
    registry.register(Box::new(counter.clone()))?;
    Ok(counter)
}

impl Metrics {
    /// Create new metrics collector
    pub fn new() -> prometheus::Result<Self> {
        let registry = Arc::new(Registry::new());

        let charges_accepted = counter(
            &registry,
            "accounting_charges_accepted_total",
            "Total number of applied charges",
        )?;
        let charges_declined = counter(
            &registry,
            "accounting_charges_declined_total",
            "Total number of declined charges",
        )?;
        let charges_replayed = counter(
            &registry,
            "accounting_charges_replayed_total",
            "Total number of charges answered from the transaction log",
        )?;
        let deposits_total = counter(
            &registry,
            "accounting_deposits_total",
            "Total number of sub-allocations created",
        )?;
        let root_deposits_total = counter(
            &registry,
            "accounting_root_deposits_total",
            "Total number of root allocations created",
        )?;
        let allocation_updates_total = counter(
            &registry,
            "accounting_allocation_updates_total",
            "Total number of administrative allocation updates",
        )?;
        let forwarded_total = counter(
            &registry,
            "accounting_forwarded_commands_total",
            "Total number of commands forwarded to the active processor",
        )?;

        let commit_duration = Histogram::with_opts(
            HistogramOpts::new(
                "accounting_commit_duration_seconds",
                "Histogram of store commit latencies",
            )
            .buckets(vec![0.001, 0.005, 0.010, 0.025, 0.050, 0.100, 0.250, 0.500, 1.0]),
        )?;
        registry.register(Box::new(commit_duration.clone()))?;

        Ok(Self {
            charges_accepted,
            charges_declined,
            charges_replayed,
            deposits_total,
            root_deposits_total,
            allocation_updates_total,
            forwarded_total,
            commit_duration,
            registry,
        })
    }

    /// Record a charge outcome
    pub fn record_charge(&self, accepted: bool) {
        if accepted {
            self.charges_accepted.inc();
        } else {
            self.charges_declined.inc();
        }
    }

    /// Record a charge answered from the transaction log
    pub fn record_replay(&self) {
        self.charges_replayed.inc();
    }

    /// Record commit duration
    pub fn record_commit_duration(&self, duration_seconds: f64) {
        self.commit_duration.observe(duration_seconds);
    }

    /// Get metrics registry
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Render all metrics in the Prometheus text format
    pub fn render(&self) -> crate::Result<String> {
        let mut buffer = Vec::new();
        TextEncoder::new()
            .encode(&self.registry.gather(), &mut buffer)
            .map_err(|e| crate::Error::Other(format!("Failed to encode metrics: {}", e)))?;
        String::from_utf8(buffer).map_err(|e| crate::Error::Other(e.to_string()))
    }
}
