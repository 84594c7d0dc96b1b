//! Ruleway - a hot-reloadable reverse-proxy routing layer.
//!
//! Routing declarations come from any number of independent **providers**
//! (a watched file, a polled HTTP endpoint, or your own [`ports::Provider`]).
//! A [`core::ConfigurationWatcher`] collects their snapshots, discards empty and
//! repeated ones, coalesces bursts per provider and merges everything into one
//! namespaced view (`route@provider`). Each applied view is compiled into a
//! fresh [`core::Router`] and swapped in atomically, so traffic keeps flowing
//! while the routing table changes underneath it.
//!
//! # Rules
//! Routes are selected by path rules:
//! `PathPrefix("/api")`, `Path("/a") || Path("/b")`,
//! `PathPrefix("/y") && Path("/y")`. Path arguments may contain variables such
//! as `{id}` or `{id:[0-9]+}`. Longer rules win unless a priority is given.
//!
//! # Quick Example
//! ```no_run
//! use std::sync::Arc;
//!
//! use ruleway::{
//!     adapters::{FileProvider, HttpHandler},
//!     core::ConfigurationWatcher,
//!     ports::ProviderRegistry,
//! };
//!
//! # #[tokio::main] async fn main() -> eyre::Result<()> {
//! let providers = ProviderRegistry::new().with(Arc::new(FileProvider::new("routes.yaml")));
//! let handler = Arc::new(HttpHandler::new());
//!
//! let watcher = ConfigurationWatcher::new(providers);
//! watcher.add_listener(handler.listener());
//! watcher.start()?;
//!
//! let listener = tokio::net::TcpListener::bind("127.0.0.1:8080").await?;
//! axum::serve(listener, handler.into_app()).await?;
//! # Ok(()) }
//! ```
//!
//! # Architecture
//! **Ports** (traits) live in [`ports`], **adapters** (providers, the HTTP
//! entry point, middleware) in [`adapters`], and the rule compiler, router,
//! backends and watcher in [`core`].
//!
//! # Error Handling
//! Construction errors are typed ([`core::RuleError`], [`core::BackendError`],
//! [`core::WatcherError`]); provider and loader failures are `eyre::Report`s
//! with context attached. Nothing on the request path panics: an unreachable
//! backend answers `502 Bad Gateway`, an unmatched path `404 Not Found`.
pub mod config;
pub mod metrics;
pub mod ports;
pub mod tracing_setup;
pub mod utils;

pub mod adapters;
pub mod core;

pub use crate::{
    adapters::{FileProvider, HttpHandler, HttpProvider, StripPrefix},
    core::{Backend, ConfigurationWatcher, Router},
    ports::{Provider, ProviderRegistry, RequestHandler},
    utils::GracefulShutdown,
};
