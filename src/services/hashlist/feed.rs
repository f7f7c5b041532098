//! Hash-list feed: a GitHub repository of published hash-list pages

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use std::time::Duration;
use tracing::debug;

use crate::config::Config;
use crate::error::ProviderError;
use crate::services::metrics;

/// One published document
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct DocumentDescriptor {
    pub name: String,
}

impl DocumentDescriptor {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }

    /// Only HTML pages carry payloads
    pub fn is_document(&self) -> bool {
        self.name.ends_with(".html")
    }

    /// Name of the decoded artifact that marks this document as processed
    pub fn marker_name(&self) -> String {
        let stem = self.name.strip_suffix(".html").unwrap_or(&self.name);
        format!("{}.json", stem)
    }
}

#[async_trait]
pub trait HashlistFeed: Send + Sync {
    /// One page (1-based) of the document listing
    async fn list_documents(
        &self,
        page: usize,
        per_page: usize,
    ) -> Result<Vec<DocumentDescriptor>, ProviderError>;

    /// Raw document body
    async fn fetch_document(&self, document: &DocumentDescriptor) -> Result<String, ProviderError>;
}

/// GitHub contents API for the listing, raw.githubusercontent for bodies
pub struct GithubHashlistFeed {
    http: Client,
    list_url: String,
    raw_url: String,
}

impl GithubHashlistFeed {
    pub fn new(
        list_url: &str,
        raw_url: &str,
        user_agent: &str,
        timeout: Duration,
    ) -> Result<Self, ProviderError> {
        // GitHub rejects requests without a User-Agent
        let http = Client::builder()
            .user_agent(user_agent)
            .timeout(timeout)
            .build()
            .map_err(|e| ProviderError::Network(e.to_string()))?;

        Ok(Self {
            http,
            list_url: list_url.trim_end_matches('/').to_string(),
            raw_url: raw_url.trim_end_matches('/').to_string(),
        })
    }

    pub fn from_config(config: &Config) -> Result<Self, ProviderError> {
        Self::new(
            &config.hashlist_list_url,
            &config.hashlist_raw_url,
            &config.user_agent,
            Duration::from_secs(config.listing_timeout_secs),
        )
    }

    async fn get_text(&self, endpoint: &'static str, url: &str) -> Result<String, ProviderError> {
        debug!("Hashlist feed request: {}", url);
        metrics::record_provider_call("hashlists", endpoint);

        let response = self
            .http
            .get(url)
            .send()
            .await
            .map_err(ProviderError::from)?;

        let status = response.status();
        if !status.is_success() {
            return Err(ProviderError::Http(status.as_u16()));
        }

        let text = response.text().await.map_err(ProviderError::from)?;
        if text.is_empty() {
            return Err(ProviderError::EmptyResponse);
        }
        Ok(text)
    }
}

#[async_trait]
impl HashlistFeed for GithubHashlistFeed {
    async fn list_documents(
        &self,
        page: usize,
        per_page: usize,
    ) -> Result<Vec<DocumentDescriptor>, ProviderError> {
        let url = format!("{}?page={}&per_page={}", self.list_url, page, per_page);
        let text = self.get_text("contents", &url).await?;
        serde_json::from_str(&text).map_err(|e| ProviderError::Parse(e.to_string()))
    }

    async fn fetch_document(&self, document: &DocumentDescriptor) -> Result<String, ProviderError> {
        let url = format!(
            "{}/{}",
            self.raw_url,
            urlencoding::encode(&document.name)
        );
        self.get_text("raw", &url).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_marker_name() {
        let doc = DocumentDescriptor::new("abc123.html");
        assert!(doc.is_document());
        assert_eq!(doc.marker_name(), "abc123.json");
        assert!(!DocumentDescriptor::new("README.md").is_document());
    }

    #[test]
    fn test_listing_ignores_extra_fields() {
        let docs: Vec<DocumentDescriptor> = serde_json::from_str(
            r#"[{"name":"a.html","path":"a.html","sha":"x","size":10,"type":"file"}]"#,
        )
        .unwrap();
        assert_eq!(docs, vec![DocumentDescriptor::new("a.html")]);
    }
}
