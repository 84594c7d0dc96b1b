pub mod file;
pub mod http;

pub use self::file::{FILE_PROVIDER_NAME, FileProvider};
pub use self::http::{HTTP_PROVIDER_NAME, HttpProvider};

use std::sync::Arc;

use eyre::{Context, Result};

use crate::{config::models::ProvidersConfig, ports::provider::ProviderRegistry};

/// Build the provider registry described by the settings file.
pub fn registry_from_config(config: &ProvidersConfig) -> Result<ProviderRegistry> {
    let mut registry = ProviderRegistry::new();

    if let Some(file) = &config.file {
        registry.register(Arc::new(FileProvider::new(&file.path)));
    }

    if let Some(http) = &config.http {
        let interval = http
            .poll_interval()
            .wrap_err_with(|| format!("Invalid poll interval: {}", http.poll_interval))?;
        registry.register(Arc::new(HttpProvider::new(&http.url, interval)?));
    }

    Ok(registry)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::models::{FileProviderConfig, HttpProviderConfig};

    #[test]
    fn test_registry_from_config() {
        let config = ProvidersConfig {
            file: Some(FileProviderConfig {
                path: "routes.yaml".into(),
            }),
            http: Some(HttpProviderConfig {
                url: "http://127.0.0.1:9000/routes".to_string(),
                poll_interval: "250ms".to_string(),
            }),
        };

        let registry = registry_from_config(&config).unwrap();
        assert_eq!(registry.names(), vec!["file", "http"]);
    }

    #[test]
    fn test_bad_poll_interval_is_rejected() {
        let config = ProvidersConfig {
            file: None,
            http: Some(HttpProviderConfig {
                url: "http://127.0.0.1:9000/routes".to_string(),
                poll_interval: "soon".to_string(),
            }),
        };

        assert!(registry_from_config(&config).is_err());
    }
}
