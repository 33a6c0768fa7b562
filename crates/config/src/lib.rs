//! Configuration loading
//!
//! Settings are an enumerated struct tree; there are no free-form string
//! keys at runtime. Sources are layered: `config/default.toml`, an optional
//! `config/{env}.toml`, then `CALLWEAVE__`-prefixed environment variables
//! (double underscore as separator, e.g.
//! `CALLWEAVE__SERVER__PORT=8080`).

mod settings;

pub use settings::{
    CapsSettings, CorrectionSettings, OfflineSettings, PipelineSettings, ScyllaSettings,
    ServerSettings, ServiceSettings, Settings, StorageMode, StorageSettings, WebhookSettings,
};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),
}

/// Load settings for the given environment name (e.g. "production").
///
/// Missing files are fine; every field carries a serde default so a bare
/// process starts with a usable configuration.
pub fn load_settings(env: Option<&str>) -> Result<Settings, ConfigError> {
    let mut builder = config::Config::builder()
        .add_source(config::File::with_name("config/default").required(false));

    if let Some(env) = env {
        builder =
            builder.add_source(config::File::with_name(&format!("config/{}", env)).required(false));
    }

    let settings = builder
        .add_source(
            config::Environment::with_prefix("CALLWEAVE")
                .separator("__")
                .try_parsing(true),
        )
        .build()?
        .try_deserialize::<Settings>()?;

    Ok(settings)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_load_without_files() {
        let settings = load_settings(None).unwrap();
        assert_eq!(settings.pipeline.end_of_turn_pause_ms, 1500);
        assert_eq!(settings.caps.stt_in_flight_cap, 32);
    }
}
