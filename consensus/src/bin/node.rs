//! Consensus Node Binary
//!
//! Runs a standalone validator on the wall clock until Ctrl-C.
//! `consensus-node gen-seed` prints a fresh node seed and exits.

use consensus::{Config, LoopbackNetwork, Node};
use ledger_core::crypto::KeyPair;
use std::time::Duration;
use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

const IDLE_SLEEP: Duration = Duration::from_millis(50);
const STATUS_INTERVAL: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    if std::env::args().nth(1).as_deref() == Some("gen-seed") {
        let kp = KeyPair::generate();
        println!("Secret seed: {}", kp.to_hex_seed());
        println!("Public: {}", kp.identity().to_hex());
        return Ok(());
    }

    // Initialize tracing
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env())
        .init();

    info!("Starting consensus node");

    // Load configuration
    let config = if let Ok(config_path) = std::env::var("CONSENSUS_CONFIG") {
        info!("Loading config from: {}", config_path);
        Config::from_file(&config_path)?
    } else {
        info!("Loading config from environment variables");
        Config::from_env()?
    };

    let network = LoopbackNetwork::new();
    let overlay = network.connect(config.keypair()?.identity());
    let mut node = Node::from_config(&config, Box::new(overlay))?;

    info!(
        node = %node.id(),
        ledger = node.herder().ledger().last_closed().seq,
        data_dir = ?config.ledger.data_dir,
        "Consensus node running"
    );
    node.start();

    let mut status = tokio::time::interval(STATUS_INTERVAL);
    let shutdown = signal::ctrl_c();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            result = &mut shutdown => {
                match result {
                    Ok(()) => info!("Received shutdown signal"),
                    Err(err) => error!("Unable to listen for shutdown signal: {}", err),
                }
                break;
            }
            _ = status.tick() => {
                match node.herder().info().to_json() {
                    Ok(json) => info!(status = %json, "Herder status"),
                    Err(e) => error!(error = %e, "Failed to render status"),
                }
            }
            _ = tokio::time::sleep(IDLE_SLEEP) => {
                while node.crank() > 0 {
                    if node.herder().is_halted() {
                        break;
                    }
                }
            }
        }

        if node.herder().is_halted() {
            error!(
                reason = node.herder().halt_reason().unwrap_or("unknown"),
                "Herder halted; operator intervention required"
            );
            break;
        }
    }

    info!("Shutting down consensus node...");
    info!("Consensus node stopped");
    Ok(())
}
