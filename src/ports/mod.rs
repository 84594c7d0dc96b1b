pub mod http_handler;
pub mod provider;

pub use http_handler::{RequestHandler, SharedHandler};
pub use provider::{MessageSink, Provider, ProviderRegistry};
