use anyhow::{Context, Result};
use common::HttpConfig;
use reqwest::Client;
use std::time::Duration;
use tracing::info;

/// HTTP fetcher for feed bodies.
///
/// Every failure here is soft: a status >= 400, a transport error, or a
/// timeout logs the source identity and yields `None` so the orchestrator
/// skips the source for this run instead of aborting the pipeline.
pub struct FeedFetcher {
    client: Client,
}

impl FeedFetcher {
    pub fn new(cfg: &HttpConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(cfg.timeout_seconds))
            .user_agent(cfg.user_agent.clone())
            .redirect(reqwest::redirect::Policy::limited(5))
            .build()
            .context("failed to build reqwest client")?;
        Ok(Self { client })
    }

    pub async fn fetch(&self, source_name: &str, url: &str) -> Option<String> {
        let response = match self.client.get(url).send().await {
            Ok(r) => r,
            Err(e) => {
                info!(source = source_name, url, error = %e, "news_source_fetch_error");
                return None;
            }
        };

        let status = response.status();
        if status.as_u16() >= 400 {
            info!(source = source_name, url, %status, "news_source_fetch_error");
            return None;
        }

        match response.text().await {
            Ok(body) => Some(body),
            Err(e) => {
                info!(source = source_name, url, error = %e, "news_source_fetch_error");
                None
            }
        }
    }
}
