//! Application context for one validator.
//!
//! A [`Node`] owns the clock, the herder and the overlay, and is the only
//! place they meet. Everything runs inside [`Node::crank`]: inbound
//! messages first, then due timers, then the herder's outbox is flushed to
//! the overlay.

use crate::clock::{ClockMode, VirtualClock};
use crate::config::Config;
use crate::herder::{Herder, HerderEvent, HerderGateway, Outbound};
use crate::metrics::HerderMetrics;
use crate::overlay::{Overlay, OverlayMessage};
use crate::{NodeId, Result};
use ledger_core::metrics::Metrics;
use ledger_core::storage::open_store;
use ledger_core::{LedgerManager, SignedTransaction};
use prometheus::Registry;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, trace, warn};

/// One validator: clock, herder and overlay
pub struct Node {
    clock: VirtualClock<HerderEvent>,
    herder: Herder,
    overlay: Box<dyn Overlay>,
    registry: Arc<Registry>,
}

impl fmt::Debug for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Node")
            .field("id", &self.herder.local_id())
            .field("clock", &self.clock)
            .field("herder", &self.herder.state())
            .finish()
    }
}

impl Node {
    /// Assemble a node from parts
    pub fn new(clock: VirtualClock<HerderEvent>, herder: Herder, overlay: Box<dyn Overlay>) -> Self {
        Self {
            clock,
            herder,
            overlay,
            registry: Arc::new(Registry::new()),
        }
    }

    /// Open storage and build a node as configured
    pub fn from_config(config: &Config, overlay: Box<dyn Overlay>) -> Result<Self> {
        let keypair = config.keypair()?;
        let quorum_set = config.quorum_set.to_quorum_set(keypair.identity())?;
        let registry = Arc::new(Registry::new());

        let store = open_store(&config.ledger)?;
        let ledger = LedgerManager::open_or_genesis(
            store,
            config.ledger.params.clone(),
            config.root_identity()?,
            0,
        )?
        .with_metrics(Metrics::with_registry(Arc::clone(&registry))?);

        let herder = Herder::new(keypair, quorum_set, ledger, config.herder_config())?
            .with_metrics(HerderMetrics::with_registry(Arc::clone(&registry))?);

        let clock = match config.clock {
            ClockMode::Virtual => {
                VirtualClock::new_virtual(chrono::Utc::now().timestamp().max(0) as u64)
            }
            ClockMode::RealTime => VirtualClock::new_real_time(),
        };

        info!(
            node = %herder.local_id(),
            clock = ?config.clock,
            storage = ?config.ledger.storage,
            "Node assembled"
        );

        Ok(Self {
            clock,
            herder,
            overlay,
            registry,
        })
    }

    /// Node id
    pub fn id(&self) -> NodeId {
        self.herder.local_id()
    }

    /// The herder
    pub fn herder(&self) -> &Herder {
        &self.herder
    }

    /// The herder, for local-only operations that bypass flooding
    pub fn herder_mut(&mut self) -> &mut Herder {
        &mut self.herder
    }

    /// The clock
    pub fn clock(&self) -> &VirtualClock<HerderEvent> {
        &self.clock
    }

    /// Metrics registry shared by the ledger and the herder
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Schedule the first ledger trigger
    pub fn start(&mut self) {
        self.herder.start(&mut self.clock);
    }

    /// Due time of the next timer
    pub fn next_due(&self) -> Option<Duration> {
        self.clock.next_due()
    }

    /// Move a virtual clock forward
    pub fn advance_to(&mut self, to: Duration) -> Result<()> {
        self.clock.advance_to(to)
    }

    /// Process inbound messages and due timers; returns how many ran.
    /// Zero means idle.
    pub fn crank(&mut self) -> usize {
        let mut work = 0;
        self.herder.set_peers(self.overlay.peers());

        while let Some((from, bytes)) = self.overlay.poll() {
            work += 1;
            match OverlayMessage::from_bytes(&bytes) {
                Ok(message) => {
                    trace!(node = %self.id(), peer = %from, kind = message.name(), "Message received");
                    self.herder.recv_message(&mut self.clock, from, message);
                }
                Err(e) => warn!(peer = %from, error = %e, "Dropping undecodable message"),
            }
        }

        let herder = &mut self.herder;
        work += self.clock.crank(|clock, event| herder.handle_event(clock, event));

        self.flush();
        work
    }

    fn flush(&mut self) {
        for outbound in self.herder.drain_outbox() {
            let (to, message) = match outbound {
                Outbound::Broadcast(message) => (None, message),
                Outbound::Send { to, message } => (Some(to), message),
            };
            let bytes = match message.to_bytes() {
                Ok(bytes) => bytes,
                Err(e) => {
                    warn!(kind = message.name(), error = %e, "Failed to encode message");
                    continue;
                }
            };
            match to {
                Some(peer) => self.overlay.send_to(&peer, bytes),
                None => self.overlay.broadcast(bytes),
            }
        }
    }
}

impl HerderGateway for Node {
    fn recv_transaction(&mut self, tx: SignedTransaction) -> bool {
        let accepted = self.herder.submit_transaction(tx);
        self.flush();
        accepted
    }
}
