use common::config::LoggingSettings;
use common::{Error, Result};
use tracing_subscriber::{EnvFilter, Registry, fmt, layer::SubscriberExt};

/// Installs the global subscriber. `RUST_LOG` wins over the configured level.
pub fn init_subscriber(settings: &LoggingSettings) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&settings.level))
        .map_err(|e| Error::Config(format!("Invalid log filter '{}': {}", settings.level, e)))?;

    let registry = Registry::default().with(filter);
    let installed = if settings.json {
        tracing::subscriber::set_global_default(registry.with(fmt::layer().json()))
    } else {
        tracing::subscriber::set_global_default(registry.with(fmt::layer()))
    };
    installed.map_err(|e| Error::Other(format!("Failed to set global default subscriber: {}", e)))
}
