//! Tracing subscriber setup.
//!
//! `RUST_LOG` wins when set; otherwise the configured level applies to this
//! crate and `warn` to everything else.

use tracing_subscriber::EnvFilter;

use crate::config::ApplicationConfig;
use crate::error::{AppResult, DaqError};

/// Build the filter used by [`init`].
pub fn env_filter(level: &str) -> AppResult<EnvFilter> {
    if let Ok(filter) = EnvFilter::try_from_default_env() {
        return Ok(filter);
    }
    let directive = format!("warn,daq_orchestrator={}", level.to_lowercase());
    EnvFilter::try_new(&directive)
        .map_err(|e| DaqError::Configuration(format!("Invalid log filter '{}': {}", directive, e)))
}

/// Install the global subscriber. Calling it twice is harmless.
pub fn init(config: &ApplicationConfig) -> AppResult<()> {
    let filter = env_filter(&config.log_level)?;
    let result = if config.json_logs {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .try_init()
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(true)
            .try_init()
    };
    if result.is_err() {
        tracing::debug!("Tracing subscriber already installed");
    }
    Ok(())
}
