pub mod loader;
pub mod models;
pub mod validation;

pub use loader::{load_configuration, load_server_config, parse_configuration};
pub use models::*;
pub use validation::{ServerConfigValidator, ValidationError, ValidationResult};
