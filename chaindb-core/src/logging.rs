//! Tracing subscriber setup
//!
//! `RUST_LOG` takes precedence over the configured level.

use crate::config::{LogFormat, LoggingSettings};
use anyhow::Result;
use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter, Registry,
};

fn env_filter(settings: &LoggingSettings) -> Result<EnvFilter> {
    match EnvFilter::try_from_default_env() {
        Ok(filter) => Ok(filter),
        Err(_) => EnvFilter::try_new(&settings.level)
            .map_err(|e| anyhow::anyhow!("Invalid log level {:?}: {}", settings.level, e)),
    }
}

/// Install the global subscriber.
///
/// Fails instead of panicking if a subscriber is already installed.
pub fn init_logging(settings: &LoggingSettings) -> Result<()> {
    let subscriber = Registry::default().with(env_filter(settings)?);

    match settings.format {
        LogFormat::Json => {
            let json_layer = fmt::layer()
                .json()
                .with_span_events(FmtSpan::CLOSE)
                .with_current_span(true)
                .with_target(true)
                .with_thread_ids(true);

            subscriber
                .with(json_layer)
                .try_init()
                .map_err(|e| anyhow::anyhow!("Failed to install log subscriber: {}", e))?;
        }
        LogFormat::Text => {
            let fmt_layer = fmt::layer().with_target(true).compact();

            subscriber
                .with(fmt_layer)
                .try_init()
                .map_err(|e| anyhow::anyhow!("Failed to install log subscriber: {}", e))?;
        }
    }

    tracing::info!(
        level = %settings.level,
        format = ?settings.format,
        slow_op_threshold_us = settings.slow_op_threshold_us,
        "Logging initialized"
    );

    Ok(())
}
