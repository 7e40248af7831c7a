//! Metrics collection for observability
//!
//! This module provides Prometheus metrics for monitoring ledger closes.
//! Collectors are registered into a per-instance registry so several
//! ledgers can live in one process.
//!
//! # Metrics
//!
//! - `ledger_closes_total` - Total number of closed ledgers
//! - `ledger_transactions_applied_total` - Transactions that succeeded
//! - `ledger_transactions_failed_total` - Transactions charged but failed
//! - `ledger_transactions_not_applied_total` - Transactions excluded from apply
//! - `ledger_apply_duration_seconds` - Histogram of apply latencies
//! - `ledger_last_closed_seq` - Sequence of the last closed ledger

use prometheus::{Histogram, HistogramOpts, IntCounter, IntGauge, Registry};
use std::fmt;
use std::sync::Arc;

/// Metrics collector
#[derive(Clone)]
pub struct Metrics {
    /// Total ledgers closed
    pub closes_total: IntCounter,

    /// Transactions applied successfully
    pub txs_applied: IntCounter,

    /// Transactions whose operations failed
    pub txs_failed: IntCounter,

    /// Transactions left out of apply
    pub txs_not_applied: IntCounter,

    /// Apply duration histogram
    pub apply_duration: Histogram,

    /// Last closed ledger sequence
    pub last_closed_seq: IntGauge,

    /// Prometheus registry
    pub registry: Arc<Registry>,
}

impl fmt::Debug for Metrics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Metrics")
            .field("closes_total", &self.closes_total.get())
            .field("last_closed_seq", &self.last_closed_seq.get())
            .finish()
    }
}

impl Metrics {
    /// Create a collector with its own registry
    pub fn new() -> prometheus::Result<Self> {
        Self::with_registry(Arc::new(Registry::new()))
    }

    /// Create a collector registering into `registry`
    pub fn with_registry(registry: Arc<Registry>) -> prometheus::Result<Self> {
        let closes_total = IntCounter::new("ledger_closes_total", "Total number of closed ledgers")?;
        registry.register(Box::new(closes_total.clone()))?;

        let txs_applied = IntCounter::new(
            "ledger_transactions_applied_total",
            "Transactions applied successfully",
        )?;
        registry.register(Box::new(txs_applied.clone()))?;

        let txs_failed = IntCounter::new(
            "ledger_transactions_failed_total",
            "Transactions charged a fee whose operations failed",
        )?;
        registry.register(Box::new(txs_failed.clone()))?;

        let txs_not_applied = IntCounter::new(
            "ledger_transactions_not_applied_total",
            "Transactions excluded from apply",
        )?;
        registry.register(Box::new(txs_not_applied.clone()))?;

        let apply_duration = Histogram::with_opts(
            HistogramOpts::new(
                "ledger_apply_duration_seconds",
                "Histogram of ledger apply latencies",
            )
            .buckets(vec![0.001, 0.005, 0.010, 0.025, 0.050, 0.100, 0.250, 0.500, 1.0]),
        )?;
        registry.register(Box::new(apply_duration.clone()))?;

        let last_closed_seq =
            IntGauge::new("ledger_last_closed_seq", "Sequence of the last closed ledger")?;
        registry.register(Box::new(last_closed_seq.clone()))?;

        Ok(Self {
            closes_total,
            txs_applied,
            txs_failed,
            txs_not_applied,
            apply_duration,
            last_closed_seq,
            registry,
        })
    }

    /// Record a ledger close
    pub fn record_close(
        &self,
        seq: u64,
        applied: usize,
        failed: usize,
        not_applied: usize,
        duration_seconds: f64,
    ) {
        self.closes_total.inc();
        self.txs_applied.inc_by(applied as u64);
        self.txs_failed.inc_by(failed as u64);
        self.txs_not_applied.inc_by(not_applied as u64);
        self.apply_duration.observe(duration_seconds);
        self.last_closed_seq.set(seq as i64);
    }

    /// Get metrics registry
    pub fn registry(&self) -> &Registry {
        &self.registry
    }
}
