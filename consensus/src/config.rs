//! Configuration for a consensus node

use crate::clock::ClockMode;
use crate::fetcher::FetchConfig;
use crate::herder::HerderConfig;
use crate::quorum::{QuorumMember, QuorumSet};
use crate::{Error, NodeId, Result};
use ledger_core::crypto::KeyPair;
use ledger_core::Identity;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Consensus node configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Hex ed25519 seed of the node key; when empty the key is derived
    /// from `node_name`
    pub node_seed: String,

    /// Name used to derive a key when no seed is configured
    pub node_name: String,

    /// Hex identity of the genesis root account; empty means the key
    /// derived from the name "root"
    pub root_account: String,

    /// Trust configuration
    pub quorum_set: QuorumSetConfig,

    /// Timeouts and intervals
    pub timing: TimingConfig,

    /// Closed slots kept in memory
    pub max_slots_to_remember: u64,

    /// How far ahead of the last closed ledger envelopes are accepted
    pub ledger_validity_bracket: u64,

    /// Time source
    pub clock: ClockMode,

    /// Ledger configuration
    pub ledger: ledger_core::Config,
}

/// Quorum set as written in a config file
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct QuorumSetConfig {
    /// Members that must agree
    pub threshold: u32,

    /// Validator identities (hex)
    pub validators: Vec<String>,

    /// Nested sets
    pub inner_sets: Vec<QuorumSetConfig>,
}

/// Timing configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimingConfig {
    /// Delay between a ledger close and the next trigger (ms)
    pub ledger_close_interval_ms: u64,

    /// First nomination round timeout (ms)
    pub nomination_timeout_ms: u64,

    /// Nomination timeout cap (ms)
    pub nomination_timeout_max_ms: u64,

    /// First ballot round timeout (ms)
    pub ballot_timeout_ms: u64,

    /// Ballot timeout cap (ms)
    pub ballot_timeout_max_ms: u64,

    /// Wait for one peer before asking the next (ms)
    pub fetch_retry_ms: u64,

    /// Fetch retry cap (ms)
    pub fetch_retry_max_ms: u64,

    /// Largest accepted lead of a nominated close time over local time (s)
    pub max_close_time_drift_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            node_seed: String::new(),
            node_name: "node-1".to_string(),
            root_account: String::new(),
            quorum_set: QuorumSetConfig::default(),
            timing: TimingConfig::default(),
            max_slots_to_remember: 12,
            ledger_validity_bracket: 100,
            clock: ClockMode::RealTime,
            ledger: ledger_core::Config::default(),
        }
    }
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            ledger_close_interval_ms: 5_000,
            nomination_timeout_ms: 1_000,
            nomination_timeout_max_ms: 30 * 60 * 1_000,
            ballot_timeout_ms: 1_000,
            ballot_timeout_max_ms: 30 * 60 * 1_000,
            fetch_retry_ms: 1_500,
            fetch_retry_max_ms: 30_000,
            max_close_time_drift_secs: 60,
        }
    }
}

impl QuorumSetConfig {
    /// Build the quorum set; an empty config means "trust only `local`"
    pub fn to_quorum_set(&self, local: NodeId) -> Result<QuorumSet> {
        if self.validators.is_empty() && self.inner_sets.is_empty() {
            return Ok(QuorumSet::singleton(local));
        }
        let qset = self.build()?;
        qset.check_sanity().map_err(Error::InvalidQuorumSet)?;
        Ok(qset)
    }

    fn build(&self) -> Result<QuorumSet> {
        let mut members = Vec::with_capacity(self.validators.len() + self.inner_sets.len());
        for hex in &self.validators {
            members.push(QuorumMember::Validator(Identity::from_hex(hex)?));
        }
        for inner in &self.inner_sets {
            members.push(QuorumMember::Inner(inner.build()?));
        }
        Ok(QuorumSet {
            threshold: self.threshold,
            members,
        })
    }
}

impl Config {
    /// Load from file
    pub fn from_file(path: impl AsRef<std::path::Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)
            .map_err(|e| Error::Config(format!("Failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Load from environment variables
    pub fn from_env() -> Result<Self> {
        let mut config = Config {
            ledger: ledger_core::Config::from_env()?,
            ..Config::default()
        };

        if let Ok(seed) = std::env::var("CONSENSUS_NODE_SEED") {
            config.node_seed = seed;
        }

        if let Ok(name) = std::env::var("CONSENSUS_NODE_NAME") {
            config.node_name = name;
        }

        if let Ok(root) = std::env::var("CONSENSUS_ROOT_ACCOUNT") {
            config.root_account = root;
        }

        if let Ok(validators) = std::env::var("CONSENSUS_VALIDATORS") {
            config.quorum_set.validators = validators
                .split(',')
                .map(str::trim)
                .filter(|v| !v.is_empty())
                .map(str::to_string)
                .collect();
        }

        if let Ok(threshold) = std::env::var("CONSENSUS_QUORUM_THRESHOLD") {
            config.quorum_set.threshold = parse_env("CONSENSUS_QUORUM_THRESHOLD", &threshold)?;
        }

        if let Ok(interval) = std::env::var("CONSENSUS_CLOSE_INTERVAL_MS") {
            config.timing.ledger_close_interval_ms = parse_env("CONSENSUS_CLOSE_INTERVAL_MS", &interval)?;
        }

        if let Ok(clock) = std::env::var("CONSENSUS_CLOCK") {
            config.clock = match clock.as_str() {
                "virtual" => ClockMode::Virtual,
                "realtime" => ClockMode::RealTime,
                other => return Err(Error::Config(format!("Unknown clock mode: {}", other))),
            };
        }

        config.validate()?;
        Ok(config)
    }

    /// Reject settings a node cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.timing.ledger_close_interval_ms == 0 {
            return Err(Error::Config("ledger_close_interval_ms must be positive".to_string()));
        }
        if self.timing.nomination_timeout_ms == 0 || self.timing.ballot_timeout_ms == 0 {
            return Err(Error::Config("round timeouts must be positive".to_string()));
        }
        if self.timing.fetch_retry_ms == 0 {
            return Err(Error::Config("fetch_retry_ms must be positive".to_string()));
        }
        if self.ledger_validity_bracket == 0 {
            return Err(Error::Config("ledger_validity_bracket must be positive".to_string()));
        }
        self.ledger.validate()?;
        Ok(())
    }

    /// Node signing key
    pub fn keypair(&self) -> Result<KeyPair> {
        if self.node_seed.is_empty() {
            Ok(KeyPair::from_name(&self.node_name))
        } else {
            Ok(KeyPair::from_hex_seed(&self.node_seed)?)
        }
    }

    /// Genesis root account
    pub fn root_identity(&self) -> Result<Identity> {
        if self.root_account.is_empty() {
            Ok(KeyPair::from_name("root").identity())
        } else {
            Ok(Identity::from_hex(&self.root_account)?)
        }
    }

    /// Herder settings derived from this config
    pub fn herder_config(&self) -> HerderConfig {
        let t = &self.timing;
        HerderConfig {
            ledger_close_interval: Duration::from_millis(t.ledger_close_interval_ms),
            nomination_timeout: Duration::from_millis(t.nomination_timeout_ms),
            nomination_timeout_max: Duration::from_millis(t.nomination_timeout_max_ms),
            ballot_timeout: Duration::from_millis(t.ballot_timeout_ms),
            ballot_timeout_max: Duration::from_millis(t.ballot_timeout_max_ms),
            fetch: FetchConfig {
                initial_timeout: Duration::from_millis(t.fetch_retry_ms),
                max_timeout: Duration::from_millis(t.fetch_retry_max_ms),
            },
            max_slots_to_remember: self.max_slots_to_remember,
            ledger_validity_bracket: self.ledger_validity_bracket,
            max_close_time_drift: Duration::from_secs(t.max_close_time_drift_secs),
        }
    }
}

fn parse_env<T: std::str::FromStr>(name: &str, value: &str) -> Result<T> {
    value
        .parse()
        .map_err(|_| Error::Config(format!("Invalid value for {}: {}", name, value)))
}
