//! # devpoll agent
//!
//! Long-running service that polls BACnet devices through a gateway.
//!
//! ## Architecture
//!
//! The agent runs one select loop over:
//! 1. **Updates**: point values delivered by the per-device poll timers
//! 2. **Commands**: JSON lines on stdin (add, status, per-device actions)
//! 3. **Session**: the gateway connection; the agent stops when it closes
//!
//! Each device's timer runs as its own task, so a slow device never delays
//! another.

use anyhow::Result;
use tracing_subscriber::EnvFilter;

mod config;
mod persistence;
mod runtime;
mod session;

pub use config::AgentConfig;
pub use runtime::Agent;

#[tokio::main]
async fn main() -> Result<()> {
    // Logs go to stderr; stdout carries command replies
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "Starting devpoll agent");

    let config = AgentConfig::from_env()?;
    tracing::info!(
        store = %config.persistence.store_type,
        seeds = config.devices.len(),
        "Configuration loaded"
    );

    let agent = Agent::new(config)?;
    agent.run().await?;

    Ok(())
}
