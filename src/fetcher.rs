use crate::config::FetchConfig;
use crate::http::build_client;
use reqwest::Client;
use std::time::Duration;
use thiserror::Error;
use tokio::time::sleep;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("invalid proxy `{proxy}`: {message}")]
    InvalidProxy { proxy: String, message: String },
    #[error("HTTP {status} from {url}")]
    Status { url: String, status: u16 },
    #[error("request to {url} failed: {message}")]
    Transport { url: String, message: String },
    #[error("gave up on {url} after {attempts} attempts: {last}")]
    Exhausted {
        url: String,
        attempts: u32,
        last: Box<FetchError>,
    },
}

/// Fetches catalogue pages, optionally through a forward proxy.
pub struct PageFetcher {
    client: Client,
    attempts: u32,
    retry_delay: Duration,
}

impl PageFetcher {
    pub fn new(config: &FetchConfig, proxy: Option<&str>) -> Result<Self, FetchError> {
        let client = build_client(config, proxy).map_err(|err| FetchError::InvalidProxy {
            proxy: proxy.unwrap_or_default().to_string(),
            message: err.to_string(),
        })?;
        Ok(Self {
            client,
            attempts: config.attempts.max(1),
            retry_delay: config.retry_delay,
        })
    }

    /// Single GET; any transport failure or non-2xx status is an error.
    pub async fn fetch(&self, url: &str) -> Result<String, FetchError> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|err| FetchError::Transport {
                url: url.to_string(),
                message: err.to_string(),
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::Status {
                url: url.to_string(),
                status: status.as_u16(),
            });
        }

        response.text().await.map_err(|err| FetchError::Transport {
            url: url.to_string(),
            message: err.to_string(),
        })
    }

    /// Up to `attempts` tries with a fixed delay between them.
    pub async fn fetch_with_retry(&self, url: &str) -> Result<String, FetchError> {
        let mut attempt = 1;
        loop {
            match self.fetch(url).await {
                Ok(body) => {
                    debug!(target = "catalog.fetch", url, attempt, bytes = body.len(), "page fetched");
                    return Ok(body);
                }
                Err(err) if attempt >= self.attempts => {
                    return Err(FetchError::Exhausted {
                        url: url.to_string(),
                        attempts: attempt,
                        last: Box::new(err),
                    });
                }
                Err(err) => {
                    warn!(
                        target = "catalog.fetch",
                        url,
                        attempt,
                        max_attempts = self.attempts,
                        error = %err,
                        "page fetch failed; retrying in {:.1}s",
                        self.retry_delay.as_secs_f64()
                    );
                    sleep(self.retry_delay).await;
                    attempt += 1;
                }
            }
        }
    }
}
