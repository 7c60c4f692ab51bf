use anyhow::{anyhow, Result};
use tracing_subscriber::EnvFilter;

/// `RUST_LOG` when set, otherwise `default_level` for every target.
pub fn env_filter(default_level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level))
}

pub fn init_logging(default_level: &str) -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(env_filter(default_level))
        .with_target(true)
        .try_init()
        .map_err(|e| anyhow!("Failed to initialize logging: {e}"))
}
