//! Tracing subscriber bootstrap and the shared Prometheus registry. Every subsystem
//! registers its own counters/gauges against the `Registry` handed to it at
//! construction time, rather than relying on a global.

use crate::config::TracingConfig;
use prometheus::Registry;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

pub fn init_tracing(config: &TracingConfig) {
    let filter = EnvFilter::try_new(&config.env_filter).unwrap_or_else(|_| EnvFilter::new("info"));

    let fmt_layer = if config.json {
        tracing_subscriber::fmt::layer().json().boxed()
    } else {
        tracing_subscriber::fmt::layer().boxed()
    };

    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt_layer)
        .try_init();
}

/// Thin wrapper so subsystems can register metrics without reaching for a global
/// registry; each service constructs its own and passes it down explicitly.
#[derive(Clone)]
pub struct Metrics {
    pub registry: Registry,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            registry: Registry::new(),
        }
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}
