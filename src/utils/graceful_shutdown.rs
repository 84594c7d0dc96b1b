use std::{future::Future, time::Duration};

use eyre::{Result, WrapErr};
use tokio::{signal, time::timeout};
use tokio_util::sync::CancellationToken;

/// Default time allowed for the listener and the watcher to wind down.
pub const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

/// Turns SIGINT / SIGTERM into a cancelled token shared by the listener and
/// the configuration watcher.
#[derive(Clone)]
pub struct GracefulShutdown {
    token: CancellationToken,
    shutdown_timeout: Duration,
}

impl Default for GracefulShutdown {
    fn default() -> Self {
        Self::new()
    }
}

impl GracefulShutdown {
    pub fn new() -> Self {
        Self::with_timeout(DEFAULT_SHUTDOWN_TIMEOUT)
    }

    pub fn with_timeout(shutdown_timeout: Duration) -> Self {
        Self {
            token: CancellationToken::new(),
            shutdown_timeout,
        }
    }

    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    pub fn is_shutdown_initiated(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Request shutdown without waiting for a signal.
    pub fn trigger(&self) {
        if !self.token.is_cancelled() {
            tracing::info!("Shutdown triggered");
            self.token.cancel();
        }
    }

    /// Resolves once shutdown has been requested.
    pub async fn wait(&self) {
        self.token.cancelled().await;
    }

    /// Wait for SIGINT or SIGTERM (or a manual trigger), then cancel the token.
    pub async fn run_signal_handler(&self) -> Result<()> {
        let terminate = wait_for_sigterm()?;

        tokio::select! {
            res = signal::ctrl_c() => {
                res.wrap_err("Failed to listen for Ctrl+C")?;
                tracing::info!("Received SIGINT, initiating graceful shutdown");
            }
            _ = terminate => {
                tracing::info!("Received SIGTERM, initiating graceful shutdown");
            }
            _ = self.token.cancelled() => return Ok(()),
        }

        self.trigger();
        Ok(())
    }

    /// Run `fut` to completion or give up after the shutdown timeout.
    /// Returns `false` on timeout.
    pub async fn drain<F>(&self, what: &str, fut: F) -> bool
    where
        F: Future<Output = ()>,
    {
        match timeout(self.shutdown_timeout, fut).await {
            Ok(()) => true,
            Err(_) => {
                tracing::warn!(
                    "{} did not stop within {}",
                    what,
                    humantime::format_duration(self.shutdown_timeout)
                );
                false
            }
        }
    }
}

#[cfg(unix)]
fn wait_for_sigterm() -> Result<impl Future<Output = ()>> {
    use tokio::signal::unix::{SignalKind, signal};

    let mut sigterm =
        signal(SignalKind::terminate()).wrap_err("Failed to register SIGTERM handler")?;
    Ok(async move {
        sigterm.recv().await;
    })
}

#[cfg(not(unix))]
fn wait_for_sigterm() -> Result<impl Future<Output = ()>> {
    Ok(std::future::pending::<()>())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_trigger_cancels_token() {
        let shutdown = GracefulShutdown::new();
        let token = shutdown.token();
        assert!(!shutdown.is_shutdown_initiated());

        shutdown.trigger();
        assert!(shutdown.is_shutdown_initiated());
        assert!(token.is_cancelled());
        shutdown.wait().await;
    }

    #[tokio::test]
    async fn test_signal_handler_returns_after_trigger() {
        let shutdown = GracefulShutdown::new();
        let handler = {
            let shutdown = shutdown.clone();
            tokio::spawn(async move { shutdown.run_signal_handler().await })
        };

        shutdown.trigger();
        let result = timeout(Duration::from_secs(1), handler).await.unwrap().unwrap();
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_drain_times_out() {
        let shutdown = GracefulShutdown::with_timeout(Duration::from_millis(20));
        assert!(shutdown.drain("fast task", async {}).await);
        assert!(
            !shutdown
                .drain("stuck task", std::future::pending::<()>())
                .await
        );
    }
}
