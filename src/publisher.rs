// ABOUTME: External content publishing for oversize outbound messages.
// ABOUTME: POSTs markdown pages and replaces the delivered message with a short summary.

use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use serde_json::json;

use crate::config::BridgeConfig;
use crate::splitter::{extract_title, preview, SUMMARY_PREVIEW_LEN};

/// Publish request timeout
const PUBLISH_TIMEOUT: Duration = Duration::from_secs(10);

/// A page created by the publisher
#[derive(Debug, Deserialize)]
pub struct PublishedPage {
    pub id: String,
    pub url: String,
}

/// Client for the optional content-publishing service.
pub struct ContentPublisher {
    client: reqwest::Client,
    base_url: String,
    token: String,
    public_base: Option<String>,
}

impl ContentPublisher {
    pub fn new(base_url: &str, token: &str, public_base: Option<&str>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(PUBLISH_TIMEOUT)
            .build()
            .context("Failed to build content publisher HTTP client")?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            token: token.to_string(),
            public_base: public_base.map(|base| base.trim_end_matches('/').to_string()),
        })
    }

    /// Build a publisher from config when both url and token are present.
    pub fn from_config(config: &BridgeConfig) -> Result<Option<Self>> {
        match (&config.publisher_url, &config.publisher_token) {
            (Some(url), Some(token)) => Ok(Some(Self::new(
                url,
                token,
                config.publisher_public_url.as_deref(),
            )?)),
            _ => Ok(None),
        }
    }

    /// Publish a markdown page, returning the server-assigned id and url.
    pub async fn publish(&self, title: &str, body: &str, summary: &str) -> Result<PublishedPage> {
        let response = self
            .client
            .post(format!("{}/api/publish", self.base_url))
            .bearer_auth(&self.token)
            .json(&json!({
                "title": title,
                "body": body,
                "type": "markdown",
                "summary": summary,
            }))
            .send()
            .await
            .context("Publish request failed")?;

        let status = response.status();
        if !status.is_success() {
            bail!("Publisher returned {}", status);
        }

        response
            .json::<PublishedPage>()
            .await
            .context("Publisher response is not valid JSON")
    }

    /// Publish an oversize message and return the short summary that replaces
    /// it in delivery. Any failure returns `None` and the caller falls back
    /// to chunked delivery of the original text.
    pub async fn publish_summary(&self, message: &str) -> Option<String> {
        let title = extract_title(message);
        let preview = preview(message, SUMMARY_PREVIEW_LEN);

        match self.publish(&title, message, &preview).await {
            Ok(page) => {
                let url = match &self.public_base {
                    Some(base) => format!("{}/p/{}", base, page.id),
                    None => page.url,
                };
                tracing::info!(title = %title, url = %url, "Published oversize message");
                Some(format!("{}\n\n{}\n\nLire la suite : {}", title, preview, url))
            }
            Err(e) => {
                tracing::warn!(error = %e, "Content publish failed, falling back to chunked delivery");
                None
            }
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
