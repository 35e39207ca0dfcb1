//! Tracing subscriber setup
//!
//! `RUST_LOG` wins when set. Otherwise the filter follows the configured
//! progress verbosity.

use anyhow::{Context, Result};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use super::progress::LogLevel;

/// Default filter directive for a verbosity level
pub fn default_directive(level: LogLevel) -> &'static str {
    match level {
        LogLevel::Quiet => "mediasweep=warn",
        LogLevel::Normal => "mediasweep=info",
        LogLevel::Verbose => "mediasweep=debug",
    }
}

/// Install the global subscriber. JSON output when `json` is set.
pub fn init_tracing(level: LogLevel, json: bool) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| default_directive(level).into());

    tracing_subscriber::registry()
        .with(filter)
        .with(json.then(|| fmt::layer().json()))
        .with((!json).then(fmt::layer))
        .try_init()
        .context("Failed to install tracing subscriber")
}
