//! Configuration data structures for ruleway.
//!
//! Two families live here:
//! * the **routes document** pushed by providers ([`Configuration`], [`RouteSpec`])
//!   together with the pipeline types built from it ([`Message`],
//!   [`ConfigurationSet`], [`MergedConfiguration`]);
//! * the **settings** of the hosting binary ([`ServerConfig`]).
//!
//! All of them are serde‑friendly and carry defaults so that minimal files stay concise.
//! Copies are plain `Clone`s: a provider's configuration is never patched, only replaced.
use std::{collections::BTreeMap, time::Duration};

use serde::{Deserialize, Serialize};

/// Separator between a route name and its owning provider in merged keys.
pub const QUALIFIER_SEPARATOR: char = '@';

/// One named route as declared by a provider.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq, Default)]
pub struct RouteSpec {
    /// Destination URL of the backend (e.g. `http://service:8080`).
    pub server: String,
    /// Predicate rule, e.g. `PathPrefix("/api")`.
    pub rule: String,
    /// Optional prefix stripped from the request path before proxying.
    #[serde(default)]
    pub path: String,
}

impl RouteSpec {
    pub fn new(server: impl Into<String>, rule: impl Into<String>) -> Self {
        Self {
            server: server.into(),
            rule: rule.into(),
            path: String::new(),
        }
    }

    /// Set the prefix stripped before the request reaches the backend.
    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        self.path = path.into();
        self
    }
}

/// One provider's declared desired state: route name → [`RouteSpec`].
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq, Default)]
pub struct Configuration {
    #[serde(default)]
    pub routers: BTreeMap<String, RouteSpec>,
}

impl Configuration {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder style helper used by providers and tests.
    pub fn with_route(mut self, name: impl Into<String>, spec: RouteSpec) -> Self {
        self.routers.insert(name.into(), spec);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.routers.is_empty()
    }
}

/// A provider push. `configuration == None` means "no update".
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub provider_name: String,
    pub configuration: Option<Configuration>,
}

impl Message {
    pub fn new(provider_name: impl Into<String>, configuration: Configuration) -> Self {
        Self {
            provider_name: provider_name.into(),
            configuration: Some(configuration),
        }
    }

    /// A push carrying nothing; the watcher drops it on ingestion.
    pub fn empty(provider_name: impl Into<String>) -> Self {
        Self {
            provider_name: provider_name.into(),
            configuration: None,
        }
    }
}

/// Flattened, provider‑qualified union of every provider's routes.
///
/// Keys are `"<name>@<provider>"`; iteration order is the key order, which makes
/// route registration order deterministic across rebuilds.
pub type MergedConfiguration = BTreeMap<String, RouteSpec>;

/// Build the qualified key of a route owned by `provider`.
pub fn qualified_name(name: &str, provider: &str) -> String {
    format!("{name}{QUALIFIER_SEPARATOR}{provider}")
}

/// Last accepted [`Configuration`] per provider name.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ConfigurationSet {
    providers: BTreeMap<String, Configuration>,
}

impl ConfigurationSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace (never patch) the entry of `provider`.
    pub fn insert(&mut self, provider: impl Into<String>, configuration: Configuration) {
        self.providers.insert(provider.into(), configuration);
    }

    pub fn get(&self, provider: &str) -> Option<&Configuration> {
        self.providers.get(provider)
    }

    pub fn len(&self) -> usize {
        self.providers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }

    pub fn providers(&self) -> impl Iterator<Item = &str> {
        self.providers.keys().map(String::as_str)
    }

    /// Flatten every provider's routes under qualified names.
    pub fn merge(&self) -> MergedConfiguration {
        let mut merged = MergedConfiguration::new();
        for (provider, configuration) in &self.providers {
            for (name, spec) in &configuration.routers {
                merged.insert(qualified_name(name, provider), spec.clone());
            }
        }
        merged
    }
}

fn default_listen_addr() -> String {
    "127.0.0.1:8080".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_poll_interval() -> String {
    "10s".to_string()
}

/// Logging options of the binary.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct LogConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub json: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

/// Settings of the file provider.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct FileProviderConfig {
    /// Routes document to watch (YAML, JSON or TOML).
    pub path: String,
}

/// Settings of the HTTP polling provider.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct HttpProviderConfig {
    pub url: String,
    /// Parsed by humantime, e.g. "10s", "1m".
    #[serde(default = "default_poll_interval")]
    pub poll_interval: String,
}

impl HttpProviderConfig {
    pub fn poll_interval(&self) -> Result<Duration, humantime::DurationError> {
        humantime::parse_duration(&self.poll_interval)
    }
}

/// Which providers the binary wires into the watcher.
#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct ProvidersConfig {
    #[serde(default)]
    pub file: Option<FileProviderConfig>,
    #[serde(default)]
    pub http: Option<HttpProviderConfig>,
}

impl ProvidersConfig {
    pub fn is_empty(&self) -> bool {
        self.file.is_none() && self.http.is_none()
    }
}

/// Settings file of the `ruleway` binary.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
    #[serde(default)]
    pub log: LogConfig,
    #[serde(default)]
    pub providers: ProvidersConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            log: LogConfig::default(),
            providers: ProvidersConfig::default(),
        }
    }
}
