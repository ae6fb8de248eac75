//! Layered engine configuration.
//!
//! Built-in defaults, then an optional TOML file, then `FERRY_*` environment
//! variables. The result is validated before it is handed to the engine.

use std::path::Path;

use ferry_core::{Error, Result};
use ferry_flow::EngineConfig;
use tracing::debug;

/// Prefix of environment overrides.
pub const ENV_PREFIX: &str = "FERRY_";

/// Load the configuration from every layer.
///
/// # Errors
///
/// Returns an error if the file cannot be read or parsed, an override does not
/// parse, or the final values fail validation.
pub fn load_config(path: Option<&Path>) -> Result<EngineConfig> {
    let config = match path {
        Some(path) => load_toml_file(path)?,
        None => EngineConfig::default(),
    };
    let vars = std::env::vars_os()
        .filter_map(|(name, value)| Some((name.into_string().ok()?, value.into_string().ok()?)));
    let config = apply_env(config, vars)?;
    validate(&config)?;
    Ok(config)
}

/// Read a TOML file; fields it omits keep their defaults.
///
/// # Errors
///
/// Returns `Error::FileReadFailed` or `Error::TomlParseFailed`.
pub fn load_toml_file(path: &Path) -> Result<EngineConfig> {
    let content =
        std::fs::read_to_string(path).map_err(|e| Error::file_read_failed(path, e.to_string()))?;
    let config: EngineConfig = toml::from_str(&content)?;
    debug!(path = %path.display(), "Loaded config file");
    Ok(config)
}

/// Apply `FERRY_*` overrides from the given variables.
///
/// Unknown `FERRY_*` names are ignored; a known name with a value that does
/// not parse is an error.
///
/// # Errors
///
/// Returns `Error::InvalidConfig` naming the offending variable.
pub fn apply_env(
    mut config: EngineConfig,
    vars: impl IntoIterator<Item = (String, String)>,
) -> Result<EngineConfig> {
    for (name, value) in vars {
        let Some(key) = name.strip_prefix(ENV_PREFIX) else {
            continue;
        };
        match key {
            "EXTERNAL_RESEND_WINDOW_MS" => {
                config.external_resend_window_ms = parse(&name, &value)?;
            }
            "MAX_EXTERNAL_RETRIES" => config.max_external_retries = parse(&name, &value)?,
            "DEFAULT_EXTERNAL_TTL_SECONDS" => {
                config.default_external_ttl_seconds = parse(&name, &value)?;
            }
            "SESSION_RESEND_WINDOW_MS" => {
                config.session_resend_window_ms = parse(&name, &value)?;
            }
            "SESSION_MAX_LOOKAHEAD" => config.session_max_lookahead = parse(&name, &value)?,
            "WORKER_PARTITIONS" => config.worker_partitions = parse(&name, &value)?,
            "CHECKPOINT_COMPRESSION_LEVEL" => {
                config.checkpoint_compression_level = parse(&name, &value)?;
            }
            _ => continue,
        }
        debug!(variable = %name, "Applied environment override");
    }
    Ok(config)
}

fn parse<T>(name: &str, value: &str) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    value
        .trim()
        .parse()
        .map_err(|e| Error::invalid_config(name, format!("'{value}': {e}")))
}

fn validate(config: &EngineConfig) -> Result<()> {
    config
        .validate()
        .map_err(|e| Error::invalid_config("engine", e.to_string()))
}
