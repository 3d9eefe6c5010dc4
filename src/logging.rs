//! Structured logging setup.
//!
//! The filter comes from `RUST_LOG` (default `info`). `LOG_FORMAT=json` switches
//! to newline-delimited JSON for log aggregation, anything else prints
//! human-readable lines.
//!
//! Run and sponsor context is carried by spans opened around each pipeline
//! ([`run_span`], [`provider_span`], [`sponsor_span`]), so every event logged
//! while processing a sponsor is tagged with the run id, chain, provider and
//! sponsor without any global logger state.

use alloy::primitives::Address;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Human,
    Json,
}

impl LogFormat {
    pub fn from_env() -> Self {
        match std::env::var("LOG_FORMAT") {
            Ok(value) if value.eq_ignore_ascii_case("json") => LogFormat::Json,
            _ => LogFormat::Human,
        }
    }
}

/// Install the global subscriber. Returns an error if one is already installed.
pub fn init(format: LogFormat) -> Result<(), tracing_subscriber::util::TryInitError> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    match format {
        LogFormat::Human => tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true))
            .try_init(),
        LogFormat::Json => tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_target(true).with_current_span(true))
            .try_init(),
    }
}

pub fn run_span(run_id: &str) -> tracing::Span {
    tracing::info_span!("run", run_id = %run_id)
}

pub fn provider_span(chain_id: u64, provider: &str) -> tracing::Span {
    tracing::info_span!("provider", chain_id, provider = %provider)
}

pub fn sponsor_span(sponsor: &Address) -> tracing::Span {
    tracing::info_span!("sponsor", sponsor = %sponsor)
}
