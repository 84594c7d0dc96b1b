#![allow(clippy::collapsible_if)]

use std::net::SocketAddr;

use crate::{
    config::models::{Configuration, ProvidersConfig, RouteSpec, ServerConfig},
    core::{backend::parse_server_url, router::Router},
    ports::http_handler::{handler_fn, not_found},
};

/// Validation result type alias
pub type ValidationResult<T> = Result<T, ValidationError>;

/// Validation error types
#[derive(Debug, thiserror::Error, Clone)]
pub enum ValidationError {
    #[error("Missing required field: {field}")]
    MissingField { field: String },

    #[error("Invalid field '{field}': {message}")]
    InvalidField { field: String, message: String },

    #[error("Invalid listen address '{address}': {reason}")]
    InvalidListenAddress { address: String, reason: String },

    #[error("Invalid route '{route}': {message}")]
    InvalidRoute { route: String, message: String },

    #[error("Validation failed: {message}")]
    ValidationFailed { message: String },
}

/// Checks the binary's settings file and routes documents before use.
pub struct ServerConfigValidator;

impl ServerConfigValidator {
    /// Validate the settings file.
    pub fn validate(config: &ServerConfig) -> ValidationResult<()> {
        let mut errors = Vec::new();

        if let Err(e) = Self::validate_listen_address(&config.listen_addr) {
            errors.push(e);
        }

        if config.providers.is_empty() {
            errors.push(ValidationError::MissingField {
                field: "providers".to_string(),
            });
        } else {
            errors.extend(Self::validate_providers(&config.providers));
        }

        Self::finish(errors)
    }

    /// Validate a routes document: every route must be installable.
    pub fn validate_configuration(configuration: &Configuration) -> ValidationResult<()> {
        let errors: Vec<_> = configuration
            .routers
            .iter()
            .flat_map(|(name, spec)| Self::validate_route(name, spec))
            .collect();

        Self::finish(errors)
    }

    fn validate_listen_address(address: &str) -> ValidationResult<()> {
        if address.parse::<SocketAddr>().is_err() {
            return Err(ValidationError::InvalidListenAddress {
                address: address.to_string(),
                reason: "Must be in format 'IP:PORT' (e.g., '127.0.0.1:8080')".to_string(),
            });
        }
        Ok(())
    }

    fn validate_providers(providers: &ProvidersConfig) -> Vec<ValidationError> {
        let mut errors = Vec::new();

        if let Some(file) = &providers.file {
            if file.path.trim().is_empty() {
                errors.push(ValidationError::MissingField {
                    field: "providers.file.path".to_string(),
                });
            }
        }

        if let Some(http) = &providers.http {
            if let Err(e) = url::Url::parse(&http.url) {
                errors.push(ValidationError::InvalidField {
                    field: "providers.http.url".to_string(),
                    message: format!("Invalid URL format: {e}"),
                });
            }
            match http.poll_interval() {
                Ok(interval) if interval.is_zero() => {
                    errors.push(ValidationError::InvalidField {
                        field: "providers.http.poll_interval".to_string(),
                        message: "Must be greater than zero".to_string(),
                    });
                }
                Ok(_) => {}
                Err(e) => errors.push(ValidationError::InvalidField {
                    field: "providers.http.poll_interval".to_string(),
                    message: e.to_string(),
                }),
            }
        }

        errors
    }

    fn validate_route(name: &str, spec: &RouteSpec) -> Vec<ValidationError> {
        let mut errors = Vec::new();
        let invalid = |message: String| ValidationError::InvalidRoute {
            route: name.to_string(),
            message,
        };

        if let Err(e) = parse_server_url(&spec.server) {
            errors.push(invalid(e.to_string()));
        }

        // compile on a scratch router so template errors surface too
        let mut scratch = Router::new();
        if let Err(e) = scratch.add_route(&spec.rule, 0, handler_fn(|_| not_found())) {
            errors.push(invalid(e.to_string()));
        }

        if !spec.path.is_empty() && !spec.path.starts_with('/') {
            errors.push(invalid(format!(
                "path '{}' must start with '/'",
                spec.path
            )));
        }

        errors
    }

    fn finish(mut errors: Vec<ValidationError>) -> ValidationResult<()> {
        if errors.len() > 1 {
            return Err(ValidationError::ValidationFailed {
                message: Self::format_multiple_errors(&errors),
            });
        }
        match errors.pop() {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    fn format_multiple_errors(errors: &[ValidationError]) -> String {
        let mut message = format!("Found {} validation errors:\n", errors.len());
        for (i, error) in errors.iter().enumerate() {
            message.push_str(&format!("  {}. {}\n", i + 1, error));
        }
        message
    }
}
