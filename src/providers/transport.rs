use super::error::ProviderError;
use super::streaming::LineStream;
use crate::cli::GatewayConfig;
use bytes::Bytes;
use futures::stream::{Stream, StreamExt};
use reqwest::{Client, RequestBuilder, Response};
use std::pin::Pin;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Raw response body split into lines
pub type RawLines = Pin<Box<dyn Stream<Item = Result<String, ProviderError>> + Send>>;

/// HTTP transport shared by every provider adapter.
///
/// All requests are JSON POSTs against the gateway backend. Anything
/// outside 2xx fails with `UnexpectedStatus` before the body is read.
#[derive(Clone)]
pub struct Transport {
    client: Client,
    base_url: String,
    api_key: Option<String>,
    request_timeout: Duration,
    idle_timeout: Option<Duration>,
}

impl Transport {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: None,
            request_timeout: Duration::from_secs(120),
            idle_timeout: None,
        }
    }

    pub fn from_config(config: &GatewayConfig) -> Self {
        Self::new(config.base_url.clone())
            .with_api_key(config.api_key.clone())
            .with_request_timeout(Duration::from_secs(config.request_timeout_secs))
            .with_idle_timeout(config.stream_idle_timeout())
    }

    /// Bearer token sent as `Authorization` on every request
    pub fn with_api_key(mut self, api_key: Option<String>) -> Self {
        self.api_key = api_key.filter(|k| !k.is_empty());
        self
    }

    /// Total time budget for one-shot requests
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Longest wait for the next streamed line; `None` waits forever
    pub fn with_idle_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.idle_timeout = timeout;
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn idle_timeout(&self) -> Option<Duration> {
        self.idle_timeout
    }

    /// Absolute URL for a backend route such as `/api/chatgpt/chat`
    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn post(&self, url: &str) -> RequestBuilder {
        let builder = self
            .client
            .post(url)
            .header("Content-Type", "application/json");

        match &self.api_key {
            Some(key) => builder.bearer_auth(key),
            None => builder,
        }
    }

    async fn check_status(url: &str, response: Response) -> Result<Response, ProviderError> {
        if !response.status().is_success() {
            let status = response.status().as_u16();
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            tracing::error!("POST {} failed with status {}: {}", url, status, error_text);
            return Err(ProviderError::UnexpectedStatus {
                status,
                message: error_text,
            });
        }
        Ok(response)
    }

    /// POST `body` and expose the response body as lines in arrival order.
    ///
    /// Cancelling `cancel` while the request is still in flight drops it and
    /// returns `ProviderError::Cancelled`. Dropping the returned stream
    /// closes the connection.
    pub async fn stream_lines(
        &self,
        path: &str,
        body: &serde_json::Value,
        cancel: &CancellationToken,
    ) -> Result<RawLines, ProviderError> {
        let url = self.url(path);
        tracing::debug!("POST {} (streaming)", url);

        let send = self.post(&url).json(body).send();
        let response = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(ProviderError::Cancelled),
            response = send => response?,
        };
        let response = Self::check_status(&url, response).await?;

        let bytes = response
            .bytes_stream()
            .map(|chunk| chunk.map_err(ProviderError::from));
        Ok(Box::pin(LineStream::new(bytes)))
    }

    /// POST and buffer the whole response body
    pub async fn request(
        &self,
        path: &str,
        body: Option<&serde_json::Value>,
    ) -> Result<Bytes, ProviderError> {
        let url = self.url(path);
        tracing::debug!("POST {}", url);

        let mut builder = self.post(&url).timeout(self.request_timeout);
        if let Some(body) = body {
            builder = builder.json(body);
        }

        let response = builder.send().await?;
        let response = Self::check_status(&url, response).await?;
        Ok(response.bytes().await?)
    }

    /// `request` followed by JSON decoding of the body
    pub async fn request_json<T: serde::de::DeserializeOwned>(
        &self,
        path: &str,
        body: &serde_json::Value,
    ) -> Result<T, ProviderError> {
        let bytes = self.request(path, Some(body)).await?;
        serde_json::from_slice(&bytes).map_err(|e| {
            tracing::error!("Failed to parse response from {}: {}", path, e);
            tracing::error!("Response body was: {}", String::from_utf8_lossy(&bytes));
            ProviderError::from(e)
        })
    }
}
