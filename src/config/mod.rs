//! Configuration loading.
//!
//! Sources, lowest priority first:
//! - built-in defaults (`Settings::default()`)
//! - `config/default.{toml,yaml,json}` when present
//! - environment variables prefixed with `PERIL`, sections split by `__`
//!   (e.g. `PERIL__BROKER__URI`, `PERIL__TOPOLOGY__TOPIC_EXCHANGE`)

mod settings;

use config::{Config, ConfigError, Environment, File};

use crate::config::settings::PartialSettings;

pub use settings::{BrokerSettings, LoggingSettings, PersistenceSettings, Settings};

pub fn load_config() -> Result<Settings, ConfigError> {
    load_config_from("config/default")
}

/// Load configuration with `path` (extension optional) as the file layer.
pub fn load_config_from(path: &str) -> Result<Settings, ConfigError> {
    let builder = Config::builder()
        .add_source(File::with_name(path).required(false))
        .add_source(
            Environment::with_prefix("PERIL")
                .prefix_separator("__")
                .separator("__"),
        );

    let config = builder.build()?;

    // Try to deserialize what is available
    let partial: PartialSettings = config.try_deserialize()?;

    Ok(partial.merge_with_defaults())
}
