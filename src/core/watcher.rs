//! Configuration watcher: the multi-producer / single-writer reload pipeline.
//!
//! ```text
//! providers ──► ingestion queue ──► relay(provider) ──► mailbox ──► validated queue ──► apply ──► listeners
//!   (N tasks)      (bounded 100)     dedup, 1 per        latest        (bounded 100)     single
//!                                    provider            wins                            writer
//! ```
//!
//! * The ingestion loop drops empty pushes and hands every other message to the
//!   relay of its provider, creating the relay on first sight.
//! * A relay discards a message identical to the previous one it saw and offers
//!   the rest to a [`CoalescingMailbox`]; a companion task drains the mailbox into
//!   the validated queue. Bursts from one provider therefore collapse to the
//!   latest snapshot.
//! * The apply loop is the only writer of the [`ConfigurationSet`]. It publishes
//!   each new set through an [`ArcSwap`] and runs the listeners synchronously, in
//!   registration order, so at most one rebuild is in flight.
//!
//! Relay queues are bounded ([`RELAY_QUEUE_CAPACITY`]). A relay only ever waits
//! on its own queue (the mailbox offer is non-blocking), so a busy apply loop or
//! slow listener cannot stall the ingestion loop for other providers.
use std::{
    collections::HashMap,
    sync::{Arc, Mutex, PoisonError, RwLock},
};

use arc_swap::ArcSwap;
use thiserror::Error;
use tokio::{sync::mpsc, task::JoinHandle};
use tokio_util::{sync::CancellationToken, task::TaskTracker};

use crate::{
    config::models::{ConfigurationSet, MergedConfiguration, Message},
    core::mailbox::CoalescingMailbox,
    metrics,
    ports::provider::{Provider, ProviderRegistry},
};

/// Capacity of the queue shared by all providers.
pub const INGESTION_QUEUE_CAPACITY: usize = 100;
/// Capacity of the queue feeding the apply loop.
pub const VALIDATED_QUEUE_CAPACITY: usize = 100;
/// Capacity of each per-provider relay queue.
pub const RELAY_QUEUE_CAPACITY: usize = 16;

/// Callback invoked with the merged view after every successful apply.
pub type ConfigurationListener = Box<dyn Fn(&MergedConfiguration) + Send + Sync>;

type Listeners = Arc<RwLock<Vec<ConfigurationListener>>>;

#[derive(Error, Debug)]
#[non_exhaustive]
pub enum WatcherError {
    #[error("Configuration watcher already started")]
    AlreadyStarted,
}

/// Orchestrates providers, de-duplication, merging and listener notification.
pub struct ConfigurationWatcher {
    providers: ProviderRegistry,
    configuration_set: Arc<ArcSwap<ConfigurationSet>>,
    listeners: Listeners,
    ingestion_tx: mpsc::Sender<Message>,
    ingestion_rx: Mutex<Option<mpsc::Receiver<Message>>>,
    shutdown: CancellationToken,
    tasks: TaskTracker,
    provider_tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl ConfigurationWatcher {
    pub fn new(providers: ProviderRegistry) -> Self {
        let (ingestion_tx, ingestion_rx) = mpsc::channel(INGESTION_QUEUE_CAPACITY);
        Self {
            providers,
            configuration_set: Arc::new(ArcSwap::from_pointee(ConfigurationSet::new())),
            listeners: Arc::new(RwLock::new(Vec::new())),
            ingestion_tx,
            ingestion_rx: Mutex::new(Some(ingestion_rx)),
            shutdown: CancellationToken::new(),
            tasks: TaskTracker::new(),
            provider_tasks: Mutex::new(Vec::new()),
        }
    }

    /// Register a callback invoked on every successful apply.
    pub fn add_listener<F>(&self, listener: F)
    where
        F: Fn(&MergedConfiguration) + Send + Sync + 'static,
    {
        self.listeners
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Box::new(listener));
    }

    /// Sender feeding the ingestion queue, for pushes that do not come from a
    /// registered provider.
    pub fn sender(&self) -> mpsc::Sender<Message> {
        self.ingestion_tx.clone()
    }

    /// Snapshot of the last accepted configuration of every provider.
    pub fn configuration_set(&self) -> Arc<ConfigurationSet> {
        self.configuration_set.load_full()
    }

    /// Merged view of the current configuration set.
    pub fn merged(&self) -> MergedConfiguration {
        self.configuration_set.load().merge()
    }

    /// Token cancelled by [`ConfigurationWatcher::stop`].
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Launch the ingestion and apply loops, then every registered provider.
    pub fn start(&self) -> Result<(), WatcherError> {
        let ingestion_rx = self
            .ingestion_rx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .ok_or(WatcherError::AlreadyStarted)?;
        let (validated_tx, validated_rx) = mpsc::channel(VALIDATED_QUEUE_CAPACITY);

        tracing::info!(
            providers = ?self.providers.names(),
            "Starting configuration watcher"
        );

        self.tasks.spawn(run_ingestion(
            ingestion_rx,
            validated_tx,
            self.shutdown.clone(),
            self.tasks.clone(),
        ));
        self.tasks.spawn(run_apply(
            validated_rx,
            self.configuration_set.clone(),
            self.listeners.clone(),
            self.shutdown.clone(),
        ));

        let mut provider_tasks = self
            .provider_tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        for provider in self.providers.iter() {
            provider_tasks.push(tokio::spawn(run_provider(
                provider.clone(),
                self.ingestion_tx.clone(),
                self.shutdown.child_token(),
            )));
        }
        Ok(())
    }

    /// Stop the pipeline and wait for its tasks (relays included) to finish.
    /// Providers are signalled and aborted if they have not returned.
    pub async fn stop(&self) {
        tracing::info!("Stopping configuration watcher");
        self.shutdown.cancel();
        self.tasks.close();
        self.tasks.wait().await;

        let provider_tasks = std::mem::take(
            &mut *self
                .provider_tasks
                .lock()
                .unwrap_or_else(PoisonError::into_inner),
        );
        for task in provider_tasks {
            task.abort();
        }
        tracing::info!("Configuration watcher stopped");
    }
}

impl Drop for ConfigurationWatcher {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

async fn run_provider(
    provider: Arc<dyn Provider>,
    sink: mpsc::Sender<Message>,
    shutdown: CancellationToken,
) {
    let name = provider.name().to_string();

    if let Err(e) = provider.init().await {
        tracing::error!(provider = %name, "Provider initialization failed: {:#}", e);
        metrics::increment_provider_failures(&name);
        return;
    }

    tracing::info!(provider = %name, "Starting provider");
    match provider.provide(sink, shutdown).await {
        Ok(()) => tracing::info!(provider = %name, "Provider stopped"),
        Err(e) => {
            tracing::error!(provider = %name, "Provider failed: {:#}", e);
            metrics::increment_provider_failures(&name);
        }
    }
}

async fn run_ingestion(
    mut ingestion_rx: mpsc::Receiver<Message>,
    validated_tx: mpsc::Sender<Message>,
    shutdown: CancellationToken,
    tasks: TaskTracker,
) {
    let mut relays: HashMap<String, mpsc::Sender<Message>> = HashMap::new();

    loop {
        let message = tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            message = ingestion_rx.recv() => match message {
                Some(message) => message,
                None => break,
            },
        };

        if message.configuration.is_none() {
            tracing::debug!(
                provider = %message.provider_name,
                "Skipping empty configuration"
            );
            metrics::increment_messages_dropped(&message.provider_name, "empty");
            continue;
        }

        let provider = message.provider_name.clone();
        let relay = relays.entry(provider.clone()).or_insert_with(|| {
            spawn_relay(&provider, validated_tx.clone(), shutdown.clone(), &tasks)
        });

        tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            sent = relay.send(message) => {
                if sent.is_err() {
                    tracing::warn!(provider = %provider, "Relay closed, recreating on next message");
                    relays.remove(&provider);
                }
            }
        }
    }

    tracing::debug!("Ingestion loop finished");
}

/// Start the relay of one provider and return the sender feeding it.
fn spawn_relay(
    provider: &str,
    validated_tx: mpsc::Sender<Message>,
    shutdown: CancellationToken,
    tasks: &TaskTracker,
) -> mpsc::Sender<Message> {
    tracing::debug!(provider, "Creating relay");

    let (relay_tx, relay_rx) = mpsc::channel(RELAY_QUEUE_CAPACITY);
    let mailbox = Arc::new(CoalescingMailbox::new());

    tasks.spawn(drain_mailbox(
        mailbox.clone(),
        validated_tx,
        shutdown.clone(),
    ));
    tasks.spawn(run_relay(
        provider.to_string(),
        relay_rx,
        mailbox,
        shutdown,
    ));

    relay_tx
}

async fn run_relay(
    provider: String,
    mut relay_rx: mpsc::Receiver<Message>,
    mailbox: Arc<CoalescingMailbox<Message>>,
    shutdown: CancellationToken,
) {
    let mut previous: Option<Message> = None;

    loop {
        let message = tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            message = relay_rx.recv() => match message {
                Some(message) => message,
                None => break,
            },
        };

        if previous.as_ref() == Some(&message) {
            tracing::debug!(provider = %provider, "Skipping same configuration");
            metrics::increment_messages_dropped(&provider, "duplicate");
            continue;
        }

        previous = Some(message.clone());
        if mailbox.offer(message).is_some() {
            tracing::debug!(provider = %provider, "Superseded a pending configuration");
            metrics::increment_messages_dropped(&provider, "superseded");
        }
    }

    mailbox.close();
    tracing::debug!(provider = %provider, "Relay finished");
}

async fn drain_mailbox(
    mailbox: Arc<CoalescingMailbox<Message>>,
    validated_tx: mpsc::Sender<Message>,
    shutdown: CancellationToken,
) {
    loop {
        let message = tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            message = mailbox.take() => match message {
                Some(message) => message,
                None => break,
            },
        };

        tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            sent = validated_tx.send(message) => {
                if sent.is_err() {
                    break;
                }
            }
        }
    }
}

async fn run_apply(
    mut validated_rx: mpsc::Receiver<Message>,
    configuration_set: Arc<ArcSwap<ConfigurationSet>>,
    listeners: Listeners,
    shutdown: CancellationToken,
) {
    loop {
        let message = tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            message = validated_rx.recv() => match message {
                Some(message) => message,
                None => break,
            },
        };

        apply_message(&configuration_set, &listeners, message);
    }

    tracing::debug!("Apply loop finished");
}

fn apply_message(
    configuration_set: &ArcSwap<ConfigurationSet>,
    listeners: &RwLock<Vec<ConfigurationListener>>,
    message: Message,
) {
    let Message {
        provider_name,
        configuration,
    } = message;
    let Some(configuration) = configuration else {
        return;
    };

    let route_count = configuration.routers.len();
    let mut next = ConfigurationSet::clone(&configuration_set.load());
    next.insert(provider_name.clone(), configuration);

    let next = Arc::new(next);
    configuration_set.store(next.clone());

    let merged = next.merge();
    tracing::info!(
        provider = %provider_name,
        routes = route_count,
        merged_routes = merged.len(),
        "Applying configuration"
    );
    metrics::increment_configuration_applies(&provider_name);

    for listener in listeners
        .read()
        .unwrap_or_else(PoisonError::into_inner)
        .iter()
    {
        listener(&merged);
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::atomic::{AtomicUsize, Ordering},
        time::Duration,
    };

    use super::*;
    use crate::config::models::{Configuration, RouteSpec};

    fn configuration(server: &str) -> Configuration {
        Configuration::new().with_route("a", RouteSpec::new(server, r#"PathPrefix("/")"#))
    }

    fn recording_watcher() -> (ConfigurationWatcher, mpsc::UnboundedReceiver<MergedConfiguration>) {
        let watcher = ConfigurationWatcher::new(ProviderRegistry::new());
        let (tx, rx) = mpsc::unbounded_channel();
        watcher.add_listener(move |merged| {
            let _ = tx.send(merged.clone());
        });
        (watcher, rx)
    }

    async fn next_merged(
        rx: &mut mpsc::UnboundedReceiver<MergedConfiguration>,
    ) -> MergedConfiguration {
        tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("timed out waiting for listener")
            .expect("listener channel closed")
    }

    #[tokio::test]
    async fn test_apply_notifies_listener_with_qualified_names() {
        let (watcher, mut rx) = recording_watcher();
        watcher.start().unwrap();

        watcher
            .sender()
            .send(Message::new("p1", configuration("http://one")))
            .await
            .unwrap();
        let merged = next_merged(&mut rx).await;
        assert_eq!(merged.len(), 1);
        assert_eq!(merged["a@p1"].server, "http://one");

        watcher
            .sender()
            .send(Message::new("p2", configuration("http://two")))
            .await
            .unwrap();
        let merged = next_merged(&mut rx).await;
        let keys: Vec<_> = merged.keys().cloned().collect();
        assert_eq!(keys, vec!["a@p1".to_string(), "a@p2".to_string()]);
        assert_eq!(merged["a@p2"].server, "http://two");

        assert_eq!(watcher.configuration_set().len(), 2);
        watcher.stop().await;
    }

    #[tokio::test]
    async fn test_identical_pushes_apply_once() {
        let (watcher, mut rx) = recording_watcher();
        watcher.start().unwrap();

        let sender = watcher.sender();
        sender
            .send(Message::new("file", configuration("http://one")))
            .await
            .unwrap();
        let _ = next_merged(&mut rx).await;
        sender
            .send(Message::new("file", configuration("http://one")))
            .await
            .unwrap();

        let second = tokio::time::timeout(Duration::from_millis(200), rx.recv()).await;
        assert!(second.is_err(), "duplicate push reached the listener");
        watcher.stop().await;
    }

    #[tokio::test]
    async fn test_empty_message_is_dropped() {
        let (watcher, mut rx) = recording_watcher();
        watcher.start().unwrap();

        watcher.sender().send(Message::empty("file")).await.unwrap();
        watcher
            .sender()
            .send(Message::new("file", configuration("http://after")))
            .await
            .unwrap();

        let merged = next_merged(&mut rx).await;
        assert_eq!(merged["a@file"].server, "http://after");
        watcher.stop().await;
    }

    #[tokio::test]
    async fn test_listeners_run_in_registration_order() {
        let watcher = ConfigurationWatcher::new(ProviderRegistry::new());
        let order = Arc::new(Mutex::new(Vec::new()));
        for id in 0..3 {
            let order = order.clone();
            watcher.add_listener(move |_| order.lock().unwrap().push(id));
        }
        let (done_tx, mut done_rx) = mpsc::unbounded_channel();
        watcher.add_listener(move |_| {
            let _ = done_tx.send(());
        });

        watcher.start().unwrap();
        watcher
            .sender()
            .send(Message::new("p", configuration("http://x")))
            .await
            .unwrap();
        tokio::time::timeout(Duration::from_secs(2), done_rx.recv())
            .await
            .unwrap();

        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2]);
        watcher.stop().await;
    }

    #[tokio::test]
    async fn test_burst_settles_on_latest_without_regressing() {
        let (watcher, mut rx) = recording_watcher();
        watcher.start().unwrap();

        let sender = watcher.sender();
        for i in 0..50 {
            sender
                .send(Message::new("burst", configuration(&format!("http://v{i}"))))
                .await
                .unwrap();
        }

        let mut seen = Vec::new();
        loop {
            let merged = next_merged(&mut rx).await;
            let server = merged["a@burst"].server.clone();
            let version: usize = server.trim_start_matches("http://v").parse().unwrap();
            seen.push(version);
            if version == 49 {
                break;
            }
        }
        assert!(seen.windows(2).all(|w| w[0] < w[1]), "applied out of order: {seen:?}");
        watcher.stop().await;
    }

    struct FloodProvider;

    #[async_trait::async_trait]
    impl Provider for FloodProvider {
        fn name(&self) -> &str {
            "flood"
        }

        async fn init(&self) -> eyre::Result<()> {
            Ok(())
        }

        async fn provide(
            &self,
            sink: mpsc::Sender<Message>,
            shutdown: CancellationToken,
        ) -> eyre::Result<()> {
            let mut i = 0usize;
            while !shutdown.is_cancelled() {
                let message = Message::new("flood", configuration(&format!("http://f{i}")));
                if sink.send(message).await.is_err() {
                    break;
                }
                i += 1;
                if i % 64 == 0 {
                    tokio::task::yield_now().await;
                }
            }
            Ok(())
        }
    }

    struct OnceProvider {
        name: &'static str,
    }

    #[async_trait::async_trait]
    impl Provider for OnceProvider {
        fn name(&self) -> &str {
            self.name
        }

        async fn init(&self) -> eyre::Result<()> {
            Ok(())
        }

        async fn provide(
            &self,
            sink: mpsc::Sender<Message>,
            shutdown: CancellationToken,
        ) -> eyre::Result<()> {
            sink.send(Message::new(self.name, configuration("http://quiet")))
                .await?;
            shutdown.cancelled().await;
            Ok(())
        }
    }

    struct FailingProvider;

    #[async_trait::async_trait]
    impl Provider for FailingProvider {
        fn name(&self) -> &str {
            "broken"
        }

        async fn init(&self) -> eyre::Result<()> {
            Ok(())
        }

        async fn provide(
            &self,
            _sink: mpsc::Sender<Message>,
            _shutdown: CancellationToken,
        ) -> eyre::Result<()> {
            eyre::bail!("source unreachable")
        }
    }

    #[tokio::test]
    async fn test_flooding_provider_does_not_starve_others() {
        let providers = ProviderRegistry::new()
            .with(Arc::new(FailingProvider))
            .with(Arc::new(FloodProvider))
            .with(Arc::new(OnceProvider { name: "quiet" }));
        let watcher = ConfigurationWatcher::new(providers);
        let applies = Arc::new(AtomicUsize::new(0));
        let (tx, mut rx) = mpsc::unbounded_channel();
        {
            let applies = applies.clone();
            watcher.add_listener(move |merged| {
                applies.fetch_add(1, Ordering::SeqCst);
                if merged.contains_key("a@quiet") {
                    let _ = tx.send(());
                }
            });
        }
        watcher.start().unwrap();

        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("quiet provider was starved")
            .unwrap();
        assert!(watcher.configuration_set().get("broken").is_none());
        assert!(applies.load(Ordering::SeqCst) >= 1);

        tokio::time::timeout(Duration::from_secs(5), watcher.stop())
            .await
            .expect("stop did not finish");
    }

    #[tokio::test]
    async fn test_second_start_fails() {
        let watcher = ConfigurationWatcher::new(ProviderRegistry::new());
        watcher.start().unwrap();
        assert!(matches!(watcher.start(), Err(WatcherError::AlreadyStarted)));
        watcher.stop().await;
    }

    #[tokio::test]
    async fn test_stop_terminates_pipeline() {
        let (watcher, mut rx) = recording_watcher();
        watcher.start().unwrap();
        watcher
            .sender()
            .send(Message::new("p", configuration("http://x")))
            .await
            .unwrap();
        let _ = next_merged(&mut rx).await;

        tokio::time::timeout(Duration::from_secs(2), watcher.stop())
            .await
            .expect("stop did not finish");
        assert!(watcher.shutdown_token().is_cancelled());
    }
}
