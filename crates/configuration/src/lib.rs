use crate::error::ConfigError;

// Declare the modules that make up this crate.
pub mod error;
pub mod settings;
pub mod telemetry;

// Re-export the core types to provide a clean public API.
pub use settings::{
    AdmissionSettings, Config, DatabaseConfig, EngineSettings, ExchangesConfig, ExecutionSettings,
    LifecycleSettings, LoggingConfig, PaperConfig, RetrySettings, TierConfig, VenueConfig,
};
pub use telemetry::init_tracing;

/// Loads the application configuration.
///
/// Reads `config.toml` (or the given path) when present, then applies environment
/// overrides such as `RELAY__ENGINE__DRY_RUN=true`. Missing sections fall back to
/// their defaults. The result is validated before it is returned.
pub fn load_config(path: Option<&str>) -> Result<Config, ConfigError> {
    let builder = config::Config::builder()
        .add_source(config::File::with_name(path.unwrap_or("config.toml")).required(path.is_some()))
        .add_source(
            config::Environment::with_prefix("RELAY")
                .prefix_separator("__")
                .separator("__")
                .list_separator(",")
                .with_list_parse_key("database.replica_urls")
                .with_list_parse_key("engine.quote_currencies")
                .try_parsing(true),
        )
        .build()?;

    // Attempt to deserialize the entire configuration into our `Config` struct
    let config = builder.try_deserialize::<Config>()?;
    config.validate()?;

    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn loads_defaults_when_no_file_is_present() {
        // Tests run from the crate directory, which has no config.toml.
        let config = load_config(None).unwrap();
        assert_eq!(config.tiers.len(), Config::default().tiers.len());
        assert!(config.tier("premium").is_some());
    }

    #[test]
    fn an_explicit_path_must_exist() {
        assert!(load_config(Some("does-not-exist.toml")).is_err());
    }
}
