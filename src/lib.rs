//! Zenoh bridge for host statistics.
//!
//! Samples raw kernel counters from proc-style text sources, derives
//! per-interval metrics (CPU deltas, memory usage, per-interface and
//! per-device counters) into an in-memory registry, and publishes them
//! to Zenoh:
//!
//! - snapshot mode: a timestamped frame of the whole registry on
//!   `<prefix>/<hostname>/stats`
//! - per-category mode: one payload per subsystem on
//!   `<prefix>/<hostname>/<category>` (e.g. `hoststats/web01/cpu/total`)
//!
//! An optional WebSocket endpoint streams live JSON frames to viewers.

pub mod config;
pub mod connection;
pub mod engine;
pub mod error;
pub mod publisher;
pub mod readers;
pub mod registry;
pub mod serialization;
pub mod stream;
pub mod transport;

use config::{LogFormat, LoggingConfig};
use error::{AgentError, Result};

/// Initialize the tracing subscriber from the logging configuration.
///
/// `RUST_LOG`, when set, overrides the configured level.
pub fn init_tracing(config: &LoggingConfig) -> Result<()> {
    use tracing_subscriber::{EnvFilter, fmt, prelude::*};

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));

    match config.format {
        LogFormat::Text => {
            tracing_subscriber::registry()
                .with(fmt::layer())
                .with(filter)
                .try_init()
                .map_err(|e| AgentError::config(format!("failed to initialize tracing: {e}")))?;
        }
        LogFormat::Json => {
            tracing_subscriber::registry()
                .with(fmt::layer().json())
                .with(filter)
                .try_init()
                .map_err(|e| AgentError::config(format!("failed to initialize tracing: {e}")))?;
        }
    }

    Ok(())
}
