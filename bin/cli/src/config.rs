//! Centralized CLI configuration.
//!
//! This module provides strongly-typed configuration for the CLI, loaded via
//! the `config` crate from environment variables. Nested keys use `__` as the
//! separator, so `PROVIDER__API_KEY` sets [`ProviderConfig::api_key`] and
//! `ENGINE__MAX_ROUNDS` sets [`EngineConfig::max_rounds`].

use colloquy_ai::ProviderConfig;
use colloquy_engine::EngineConfig;
use serde::Deserialize;

/// CLI configuration composed from library configs.
#[derive(Debug, Clone, Deserialize)]
pub struct CliConfig {
    /// PostgreSQL connection URL. History is kept in memory when unset.
    #[serde(default)]
    pub database_url: Option<String>,

    /// Completion endpoint settings.
    #[serde(default)]
    pub provider: ProviderConfig,

    /// Orchestrator settings.
    #[serde(default)]
    pub engine: EngineConfig,
}

impl CliConfig {
    /// Loads configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns an error if a variable is present but invalid.
    pub fn from_env() -> Result<Self, config::ConfigError> {
        Self::from_source(
            config::Environment::default()
                .separator("__")
                .try_parsing(true),
        )
    }

    fn from_source<S>(source: S) -> Result<Self, config::ConfigError>
    where
        S: config::Source + Send + Sync + 'static,
    {
        config::Config::builder()
            .add_source(source)
            .build()?
            .try_deserialize()
    }
}
