pub mod config_providers;
pub mod http_handler;
pub mod middleware;

pub use config_providers::{FileProvider, HttpProvider, registry_from_config};
pub use http_handler::HttpHandler;
pub use middleware::{StripPrefix, request_timing_middleware};
