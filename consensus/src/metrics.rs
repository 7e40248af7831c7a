//! Prometheus metrics for the herder
//!
//! - `herder_transactions_received_total` - Transactions submitted or flooded in
//! - `herder_transactions_rejected_total` - Transactions refused by the pool
//! - `herder_pending_transactions` - Current pool size
//! - `herder_envelopes_received_total` - Envelopes received from peers
//! - `herder_fetch_requests_total` - Fetches started for unknown items

use prometheus::{IntCounter, IntGauge, Registry};
use std::fmt;
use std::sync::Arc;

/// Herder metrics collector
#[derive(Clone)]
pub struct HerderMetrics {
    /// Transactions received
    pub txs_received: IntCounter,

    /// Transactions rejected
    pub txs_rejected: IntCounter,

    /// Pending pool size
    pub pending_txs: IntGauge,

    /// Envelopes received
    pub envelopes_received: IntCounter,

    /// Fetch requests started
    pub fetch_requests: IntCounter,

    /// Prometheus registry
    pub registry: Arc<Registry>,
}

impl fmt::Debug for HerderMetrics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HerderMetrics")
            .field("txs_received", &self.txs_received.get())
            .field("pending_txs", &self.pending_txs.get())
            .finish()
    }
}

impl HerderMetrics {
    /// Create a collector with its own registry
    pub fn new() -> prometheus::Result<Self> {
        Self::with_registry(Arc::new(Registry::new()))
    }

    /// Create a collector registering into `registry`
    pub fn with_registry(registry: Arc<Registry>) -> prometheus::Result<Self> {
        let txs_received = IntCounter::new(
            "herder_transactions_received_total",
            "Transactions submitted or flooded in",
        )?;
        registry.register(Box::new(txs_received.clone()))?;

        let txs_rejected = IntCounter::new(
            "herder_transactions_rejected_total",
            "Transactions refused by the pending pool",
        )?;
        registry.register(Box::new(txs_rejected.clone()))?;

        let pending_txs = IntGauge::new("herder_pending_transactions", "Pending pool size")?;
        registry.register(Box::new(pending_txs.clone()))?;

        let envelopes_received = IntCounter::new(
            "herder_envelopes_received_total",
            "SCP envelopes received from peers",
        )?;
        registry.register(Box::new(envelopes_received.clone()))?;

        let fetch_requests = IntCounter::new(
            "herder_fetch_requests_total",
            "Fetches started for unknown transaction sets and quorum sets",
        )?;
        registry.register(Box::new(fetch_requests.clone()))?;

        Ok(Self {
            txs_received,
            txs_rejected,
            pending_txs,
            envelopes_received,
            fetch_requests,
            registry,
        })
    }

    /// Get metrics registry
    pub fn registry(&self) -> &Registry {
        &self.registry
    }
}
