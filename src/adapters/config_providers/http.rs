use std::time::Duration;

use async_trait::async_trait;
use eyre::{Context, Result};
use reqwest::Client;
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::{
    config::models::{Configuration, Message},
    ports::provider::{MessageSink, Provider},
};

pub const HTTP_PROVIDER_NAME: &str = "http";

const FETCH_TIMEOUT: Duration = Duration::from_secs(10);

/// Provider polling a URL serving a JSON routes document.
///
/// Every successful fetch is pushed; identical snapshots are discarded by the
/// watcher's relay, so no change detection happens here.
pub struct HttpProvider {
    url: String,
    poll_interval: Duration,
    client: Client,
}

impl HttpProvider {
    pub fn new(url: impl Into<String>, poll_interval: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(FETCH_TIMEOUT)
            .build()
            .wrap_err("Failed to build HTTP client")?;

        Ok(Self {
            url: url.into(),
            poll_interval,
            client,
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    async fn fetch(&self) -> Result<Configuration> {
        let response = self
            .client
            .get(&self.url)
            .send()
            .await
            .wrap_err("Failed to send request")?
            .error_for_status()
            .wrap_err("Routes endpoint returned an error status")?;

        response
            .json::<Configuration>()
            .await
            .wrap_err("Failed to decode JSON routes document")
    }
}

#[async_trait]
impl Provider for HttpProvider {
    fn name(&self) -> &str {
        HTTP_PROVIDER_NAME
    }

    async fn init(&self) -> Result<()> {
        Url::parse(&self.url).wrap_err_with(|| format!("Invalid routes URL: {}", self.url))?;
        if self.poll_interval.is_zero() {
            eyre::bail!("Poll interval must be greater than zero");
        }
        Ok(())
    }

    async fn provide(&self, sink: MessageSink, shutdown: CancellationToken) -> Result<()> {
        tracing::info!(
            provider = HTTP_PROVIDER_NAME,
            url = %self.url,
            interval = %humantime::format_duration(self.poll_interval),
            "Polling routes endpoint"
        );

        let mut interval = tokio::time::interval(self.poll_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = interval.tick() => {}
            }

            match self.fetch().await {
                Ok(configuration) => {
                    let message = Message::new(HTTP_PROVIDER_NAME, configuration);
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        sent = sink.send(message) => {
                            sent.map_err(|_| eyre::eyre!("Configuration watcher is no longer receiving"))?;
                        }
                    }
                }
                Err(e) => {
                    tracing::warn!(
                        provider = HTTP_PROVIDER_NAME,
                        url = %self.url,
                        "Failed to poll routes endpoint: {:#}",
                        e
                    );
                }
            }
        }

        Ok(())
    }
}
