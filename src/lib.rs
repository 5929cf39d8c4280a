//! Library root for `message-digester`.
//!
//! The digester watches selected chat channels and periodically emails each
//! server's recipients a digest of what was said since the last one:
//! - Per-server configuration (channels, recipients, interval) set via chat commands
//! - An in-memory window of messages per server, collected as they are posted
//! - A scheduler that closes each window when its interval elapses and delivers
//!   at most one digest per period
//!
//! The chat platform, renderer, mail transport and persistence sit behind traits,
//! with Slack, HTML, SMTP and JSON file implementations.

pub mod base;
pub mod digest;
pub mod interaction;
pub mod runtime;
pub mod service;

use base::{config::Config, types::Void};
use rustls::crypto;
use tracing::info;

/// Public async entry for the binary crate.
///
/// Installs the crypto provider, wires the runtime from `config`, and runs
/// until shutdown.
pub async fn start(config: Config) -> Void {
    info!("Starting message-digester ...");

    // Start the crypto provider.
    crypto::ring::default_provider().install_default().map_err(|_| anyhow::anyhow!("A crypto provider is already installed."))?;

    // Initialize the runtime.
    let runtime = runtime::Runtime::new(config).await?;

    // Start the runtime.
    runtime.start().await?;

    Ok(())
}
