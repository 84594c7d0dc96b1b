use std::path::{Path, PathBuf};

use async_trait::async_trait;
use eyre::{Context, Result};
use notify::{RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::{
    config::{loader::load_configuration, models::Message},
    ports::provider::{MessageSink, Provider},
};

pub const FILE_PROVIDER_NAME: &str = "file";

/// Provider reading a routes document from disk and re-reading it whenever
/// the file is created, modified or replaced.
pub struct FileProvider {
    path: PathBuf,
}

impl FileProvider {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn watch_dir(&self) -> &Path {
        match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        }
    }

    /// Read the document and push it. Parse failures are logged, not pushed.
    async fn push_current(&self, sink: &MessageSink) -> Result<()> {
        let configuration = match load_configuration(&self.path) {
            Ok(configuration) => configuration,
            Err(e) => {
                tracing::error!(
                    provider = FILE_PROVIDER_NAME,
                    path = %self.path.display(),
                    "Failed to load routes document: {:#}",
                    e
                );
                return Ok(());
            }
        };

        tracing::debug!(
            provider = FILE_PROVIDER_NAME,
            routes = configuration.routers.len(),
            "Pushing routes document"
        );
        sink.send(Message::new(FILE_PROVIDER_NAME, configuration))
            .await
            .map_err(|_| eyre::eyre!("Configuration watcher is no longer receiving"))
    }
}

#[async_trait]
impl Provider for FileProvider {
    fn name(&self) -> &str {
        FILE_PROVIDER_NAME
    }

    async fn init(&self) -> Result<()> {
        if self.path.file_name().is_none() {
            eyre::bail!("Invalid routes document path: {}", self.path.display());
        }
        let dir = self.watch_dir();
        if !dir.is_dir() {
            eyre::bail!("Directory {} does not exist", dir.display());
        }
        Ok(())
    }

    async fn provide(&self, sink: MessageSink, shutdown: CancellationToken) -> Result<()> {
        let file_name = self
            .path
            .file_name()
            .ok_or_else(|| eyre::eyre!("Invalid routes document path"))?
            .to_owned();

        let (change_tx, mut change_rx) = mpsc::channel::<()>(1);
        let mut watcher =
            notify::recommended_watcher(move |res: notify::Result<notify::Event>| match res {
                Ok(event) => {
                    if (event.kind.is_modify() || event.kind.is_create())
                        && event
                            .paths
                            .iter()
                            .any(|p| p.file_name() == Some(file_name.as_os_str()))
                    {
                        tracing::debug!("Routes document changed: {:?}", event.kind);
                        // a pending signal already covers this change
                        let _ = change_tx.try_send(());
                    }
                }
                Err(e) => tracing::error!("File watch error: {:?}", e),
            })
            .wrap_err("Failed to create file watcher")?;

        watcher
            .watch(self.watch_dir(), RecursiveMode::NonRecursive)
            .wrap_err_with(|| format!("Failed to watch {}", self.watch_dir().display()))?;

        tracing::info!(
            provider = FILE_PROVIDER_NAME,
            path = %self.path.display(),
            "Watching routes document"
        );

        self.push_current(&sink).await?;

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                changed = change_rx.recv() => {
                    if changed.is_none() {
                        break;
                    }
                    self.push_current(&sink).await?;
                }
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use tempfile::tempdir;
    use tokio::time::{Duration, timeout};

    use super::*;

    const INITIAL: &str = r#"
routers:
  api:
    server: "http://127.0.0.1:9001"
    rule: 'PathPrefix("/api")'
"#;

    const UPDATED: &str = r#"
routers:
  api:
    server: "http://127.0.0.1:9002"
    rule: 'PathPrefix("/api")'
    path: "/api"
"#;

    #[tokio::test]
    async fn test_init_rejects_missing_directory() {
        let provider = FileProvider::new("/definitely/not/here/routes.yaml");
        assert!(provider.init().await.is_err());
    }

    #[tokio::test]
    async fn test_file_provider_pushes_initial_and_changed_document() -> Result<()> {
        let dir = tempdir()?;
        let file_path = dir.path().join("routes.yaml");
        fs::write(&file_path, INITIAL)?;

        let provider = std::sync::Arc::new(FileProvider::new(&file_path));
        provider.init().await?;

        let (tx, mut rx) = mpsc::channel(16);
        let shutdown = CancellationToken::new();
        let task = {
            let provider = provider.clone();
            let shutdown = shutdown.clone();
            tokio::spawn(async move { provider.provide(tx, shutdown).await })
        };

        let first = timeout(Duration::from_secs(2), rx.recv())
            .await?
            .expect("provider closed");
        assert_eq!(first.provider_name, FILE_PROVIDER_NAME);
        let routers = first.configuration.unwrap().routers;
        assert_eq!(routers["api"].server, "http://127.0.0.1:9001");

        tokio::time::sleep(Duration::from_millis(100)).await;
        fs::write(&file_path, UPDATED)?;

        let updated = loop {
            let message = timeout(Duration::from_secs(5), rx.recv())
                .await?
                .expect("provider closed");
            let configuration = message.configuration.unwrap();
            let done = configuration
                .routers
                .get("api")
                .is_some_and(|spec| spec.server.ends_with("9002"));
            if done {
                break configuration;
            }
        };
        assert_eq!(updated.routers["api"].path, "/api");

        shutdown.cancel();
        timeout(Duration::from_secs(2), task).await???;
        Ok(())
    }

    #[tokio::test]
    async fn test_unparseable_document_is_not_pushed() -> Result<()> {
        let dir = tempdir()?;
        let file_path = dir.path().join("routes.json");
        fs::write(&file_path, "{ not json")?;

        let provider = FileProvider::new(&file_path);
        let (tx, mut rx) = mpsc::channel(16);
        provider.push_current(&tx).await?;

        assert!(rx.try_recv().is_err());
        Ok(())
    }
}
