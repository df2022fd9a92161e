use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;

/// Decides whether a service is serving requests, not merely started.
#[async_trait]
pub trait HealthCheck: Send + Sync {
    /// One probe of `url`, giving up after `timeout`.
    async fn check(&self, url: &str, timeout: Duration) -> Result<()>;
}

/// Healthy means a 2xx answer to `GET url`.
#[derive(Debug, Clone, Default)]
pub struct HttpHealthCheck {
    client: reqwest::Client,
}

impl HttpHealthCheck {
    pub fn new() -> Result<Self> {
        let client = reqwest::Client::builder()
            .no_proxy()
            .build()
            .context("building HTTP client")?;
        Ok(Self { client })
    }
}

#[async_trait]
impl HealthCheck for HttpHealthCheck {
    async fn check(&self, url: &str, timeout: Duration) -> Result<()> {
        let response = self
            .client
            .get(url)
            .timeout(timeout)
            .send()
            .await
            .context("health request")?;
        if !response.status().is_success() {
            bail!("health check returned status {}", response.status());
        }
        Ok(())
    }
}
