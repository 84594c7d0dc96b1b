use std::sync::Arc;

use async_trait::async_trait;
use eyre::Result;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::config::models::Message;

/// Sink a provider pushes its snapshots into (the watcher's ingestion queue).
pub type MessageSink = mpsc::Sender<Message>;

/// Trait for configuration providers feeding the configuration watcher.
///
/// A provider owns one source of routing declarations (a file, a remote
/// endpoint, ...) and pushes a [`Message`] whenever it has a new snapshot.
/// Sending into the sink blocks while the ingestion queue is full.
#[async_trait]
pub trait Provider: Send + Sync {
    /// Name used to qualify this provider's routes (`route@name`).
    fn name(&self) -> &str;

    /// Validate the provider's own settings before it starts.
    async fn init(&self) -> Result<()>;

    /// Push snapshots into `sink` until `shutdown` fires or a fatal error occurs.
    async fn provide(&self, sink: MessageSink, shutdown: CancellationToken) -> Result<()>;
}

/// Ordered set of providers owned by a watcher instance.
#[derive(Default, Clone)]
pub struct ProviderRegistry {
    providers: Vec<Arc<dyn Provider>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, provider: Arc<dyn Provider>) -> &mut Self {
        self.providers.push(provider);
        self
    }

    pub fn with(mut self, provider: Arc<dyn Provider>) -> Self {
        self.providers.push(provider);
        self
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<dyn Provider>> {
        self.providers.iter()
    }

    pub fn len(&self) -> usize {
        self.providers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }

    pub fn names(&self) -> Vec<String> {
        self.providers.iter().map(|p| p.name().to_string()).collect()
    }
}
