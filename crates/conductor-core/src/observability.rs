//! Logging setup and status views.

use std::sync::Once;

use serde::{Deserialize, Serialize};
use tracing_subscriber::{EnvFilter, prelude::*};

use crate::app::dispatcher::DispatcherStats;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

static INIT: Once = Once::new();

fn build_env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
}

/// Installs the global subscriber. `RUST_LOG` overrides the default `info`
/// filter. Later calls, and calls after another subscriber was installed,
/// do nothing.
pub fn init_tracing(log_format: LogFormat) {
    INIT.call_once(|| {
        let env_filter = build_env_filter();
        let result = match log_format {
            LogFormat::Text => tracing_subscriber::registry()
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_target(true)
                        .compact()
                        .with_filter(env_filter),
                )
                .try_init(),
            LogFormat::Json => tracing_subscriber::registry()
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_target(true)
                        .json()
                        .with_filter(env_filter),
                )
                .try_init(),
        };
        if let Err(e) = result {
            eprintln!("tracing subscriber already installed: {e}");
        }
    });
}

/// Point-in-time view of a running engine.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct EngineStatus {
    pub instance_id: String,
    pub owned_shards: usize,
    pub cached_namespaces: usize,
    pub dispatcher: DispatcherStats,
}
