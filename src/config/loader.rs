use std::path::Path;

use config::{Config, Environment, File, FileFormat};
use eyre::{Context, Result};

use crate::config::models::{Configuration, ServerConfig};

/// Prefix of environment variables overriding settings (`RULEWAY__LISTEN_ADDR`, ...).
pub const ENV_PREFIX: &str = "RULEWAY";

/// Determine file format based on extension (YAML when unknown).
pub fn format_for_path(path: &Path) -> FileFormat {
    match path.extension().and_then(|ext| ext.to_str()) {
        Some("yaml") | Some("yml") => FileFormat::Yaml,
        Some("json") => FileFormat::Json,
        Some("toml") => FileFormat::Toml,
        Some("ini") => FileFormat::Ini,
        _ => FileFormat::Yaml,
    }
}

fn path_str(path: &Path) -> Result<&str> {
    path.to_str()
        .ok_or_else(|| eyre::eyre!("Invalid UTF-8 path: {}", path.display()))
}

/// Load the binary settings from a file, with `RULEWAY__*` environment overrides.
pub fn load_server_config(config_path: &str) -> Result<ServerConfig> {
    let config_path = Path::new(config_path);

    let settings = Config::builder()
        .add_source(File::new(path_str(config_path)?, format_for_path(config_path)))
        .add_source(Environment::with_prefix(ENV_PREFIX).separator("__"))
        .build()
        .with_context(|| format!("Failed to build settings from {}", config_path.display()))?;

    settings.try_deserialize().with_context(|| {
        format!(
            "Failed to deserialize settings from {}",
            config_path.display()
        )
    })
}

/// Load a routes document (`{ routers: { ... } }`) from disk.
pub fn load_configuration(path: &Path) -> Result<Configuration> {
    let settings = Config::builder()
        .add_source(File::new(path_str(path)?, format_for_path(path)))
        .build()
        .with_context(|| format!("Failed to read routes document {}", path.display()))?;

    settings
        .try_deserialize()
        .with_context(|| format!("Failed to deserialize routes document {}", path.display()))
}

/// Parse a routes document held in memory.
pub fn parse_configuration(content: &str, format: FileFormat) -> Result<Configuration> {
    let settings = Config::builder()
        .add_source(File::from_str(content, format))
        .build()
        .wrap_err("Failed to parse routes document")?;

    settings
        .try_deserialize()
        .wrap_err("Failed to deserialize routes document")
}
