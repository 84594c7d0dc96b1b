pub mod backend;
pub mod mailbox;
pub mod router;
pub mod rule;
pub mod watcher;

pub use backend::{Backend, BackendError, BackendTransport};
pub use mailbox::CoalescingMailbox;
pub use router::{Route, Router};
pub use rule::{MatcherKind, RuleError, RuleNode, parse_rule};
pub use watcher::{ConfigurationListener, ConfigurationWatcher, WatcherError};
