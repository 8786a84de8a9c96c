//! Publishing finished uploads to remote media storage.

use async_trait::async_trait;
use reelforge_common::{Error, Result};
use reqwest::{multipart, Client};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;
use tokio_util::io::ReaderStream;

use crate::config::PublishConfig;

/// Uploads a local file somewhere it can be played from.
#[async_trait]
pub trait Publisher: Send + Sync {
    /// Publish `path`, returning its remote URL.
    async fn publish(&self, path: &Path) -> Result<String>;
}

/// Reply of the upload endpoint. Either field may carry the URL.
#[derive(Debug, Deserialize)]
struct PublishReply {
    secure_url: Option<String>,
    url: Option<String>,
}

/// Posts the file as a multipart form to an HTTP endpoint.
pub struct HttpPublisher {
    client: Client,
    endpoint: String,
    api_key: Option<String>,
    resource_type: String,
}

impl HttpPublisher {
    pub fn new(
        endpoint: impl Into<String>,
        api_key: Option<String>,
        resource_type: impl Into<String>,
        timeout: Duration,
    ) -> Self {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_else(|e| {
                tracing::warn!("Failed to build HTTP client with timeout: {}", e);
                Client::new()
            });

        Self {
            client,
            endpoint: endpoint.into(),
            api_key,
            resource_type: resource_type.into(),
        }
    }

    /// Build a publisher from config; `None` when publishing is disabled.
    pub fn from_config(config: &PublishConfig) -> Option<Self> {
        if !config.enabled {
            return None;
        }
        let endpoint = config.endpoint.clone()?;
        Some(Self::new(
            endpoint,
            config.api_key.clone(),
            config.resource_type.clone(),
            Duration::from_secs(config.timeout_secs),
        ))
    }
}

#[async_trait]
impl Publisher for HttpPublisher {
    async fn publish(&self, path: &Path) -> Result<String> {
        let file = tokio::fs::File::open(path)
            .await
            .map_err(|e| Error::storage(format!("open {}", path.display()), e))?;
        let len = file
            .metadata()
            .await
            .map_err(|e| Error::storage(format!("stat {}", path.display()), e))?
            .len();

        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "upload".to_string());
        let content_type = crate::streaming::guess_content_type(&file_name);

        let body = reqwest::Body::wrap_stream(ReaderStream::new(file));
        let part = multipart::Part::stream_with_length(body, len)
            .file_name(file_name.clone())
            .mime_str(content_type)
            .map_err(|e| Error::Publish(format!("invalid content type: {e}")))?;
        let form = multipart::Form::new()
            .text("resource_type", self.resource_type.clone())
            .part("file", part);

        let mut request = self.client.post(&self.endpoint).multipart(form);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request
            .send()
            .await
            .map_err(|e| Error::Publish(format!("request to {} failed: {}", self.endpoint, e)))?;

        let status = response.status();
        if !status.is_success() {
            let error = response.text().await.unwrap_or_default();
            return Err(Error::Publish(format!(
                "{} responded {}: {}",
                self.endpoint, status, error
            )));
        }

        let reply: PublishReply = response
            .json()
            .await
            .map_err(|e| Error::Publish(format!("unreadable reply: {e}")))?;
        let url = reply
            .secure_url
            .or(reply.url)
            .ok_or_else(|| Error::Publish("reply carries no url".to_string()))?;

        tracing::info!(file = %file_name, bytes = len, url = %url, "Published upload");
        Ok(url)
    }
}
