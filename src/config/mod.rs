//! Configuration loading for the admission control service.
//!
//! Settings come from an optional config file plus environment
//! variables; anything unset falls back to the defaults baked into the
//! models. Validation happens once in main, not here.

use std::env;

use ::config::{Config as ConfigBuilder, ConfigError, Environment, File};

use crate::models::Config;

/// Load configuration from a file (if present) and the environment.
pub fn load_config() -> Result<Config, ConfigError> {
    let config_file = env::var("CONFIG_FILE").unwrap_or_else(|_| "config/default.toml".to_string());

    let config = ConfigBuilder::builder()
        .add_source(File::with_name(&config_file).required(false))
        .add_source(Environment::default().separator("__"))
        .build()?;

    config.try_deserialize()
}
