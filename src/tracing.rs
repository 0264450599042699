//! Log output wiring.
//!
//! Local runs get compact human-readable lines; anything else gets
//! flattened JSON for the log pipeline. The sandbox runtime clients are
//! noisy at debug, so they are filtered down unless `RUST_LOG` says
//! otherwise.

use anyhow::Result;
use tracing_subscriber::{Layer, layer::SubscriberExt};

use crate::config::InvokerConfig;

const DEFAULT_DIRECTIVES: &str = "info,bollard=warn,hyper=warn,reqwest=warn";

fn env_filter() -> tracing_subscriber::EnvFilter {
    tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(DEFAULT_DIRECTIVES))
}

pub fn setup_tracing(config: &InvokerConfig) -> Result<()> {
    let registry = tracing_subscriber::Registry::default();

    if config.structured_logging() {
        let layer = json_subscriber::fmt::layer()
            .with_span_list(false)
            .flatten_event(true)
            .flatten_current_span_on_top_level(true)
            .with_filter(env_filter());
        tracing::subscriber::set_global_default(registry.with(layer))?;
    } else {
        // Interactive use: timestamps and targets are clutter next to the
        // container/activation fields every log line already carries.
        let layer = tracing_subscriber::fmt::layer()
            .compact()
            .with_target(false)
            .with_filter(env_filter());
        tracing::subscriber::set_global_default(registry.with(layer))?;
    }

    tracing::debug!(invoker_id = %config.invoker_id, env = %config.env, "logging initialized");
    Ok(())
}
