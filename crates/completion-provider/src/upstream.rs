//! Upstream OpenAI-compatible completion API

use crate::protocol::RequestBody;
use async_trait::async_trait;
use reqwest::Client;
use serde_json::Value;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;

// ============================================================================
// Error Types
// ============================================================================

#[derive(Error, Debug)]
pub enum UpstreamError {
    #[error("HTTP error: {0}")]
    Http(String),

    #[error("API error {status}: {body}")]
    Api { status: u16, body: String },

    #[error("Stream error: {0}")]
    Stream(String),

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    /// The request could not be built locally; nothing reached the API
    #[error("Invalid request: {0}")]
    InvalidRequest(String),
}

impl UpstreamError {
    /// Errors surfaced by the API or its transport, as opposed to local faults
    pub fn is_service_error(&self) -> bool {
        !matches!(self, UpstreamError::InvalidRequest(_))
    }
}

impl From<reqwest::Error> for UpstreamError {
    fn from(err: reqwest::Error) -> Self {
        UpstreamError::Http(err.to_string())
    }
}

pub type ChunkReceiver = mpsc::Receiver<Result<Value, UpstreamError>>;

// ============================================================================
// Completion API Trait
// ============================================================================

/// An OpenAI-compatible completion API.
///
/// Responses and chunks are returned as raw JSON so they can be forwarded verbatim.
#[async_trait]
pub trait CompletionApi: Send + Sync {
    /// Non-streaming completion; the response carries `usage` inline
    async fn complete(&self, body: &RequestBody) -> Result<Value, UpstreamError>;

    /// Streaming completion. Chunks arrive in order; the last one carries `usage`.
    /// An `Err` item ends the stream.
    async fn complete_stream(&self, body: &RequestBody) -> Result<ChunkReceiver, UpstreamError>;
}

// ============================================================================
// HTTP Client
// ============================================================================

pub struct OpenAiClient {
    base_url: String,
    api_key: Option<String>,
    client: Client,
}

impl OpenAiClient {
    pub fn new(
        base_url: impl Into<String>,
        api_key: Option<String>,
        timeout: Duration,
    ) -> Result<Self, UpstreamError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| UpstreamError::InvalidRequest(e.to_string()))?;

        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key,
            client,
        })
    }

    async fn post(&self, body: &RequestBody, stream: bool) -> Result<reqwest::Response, UpstreamError> {
        let url = format!("{}{}", self.base_url, body.endpoint());
        let payload = body
            .upstream_payload(stream)
            .map_err(|e| UpstreamError::InvalidRequest(e.to_string()))?;

        let mut request = self.client.post(&url).json(&payload);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        tracing::debug!(url = %url, stream, "Sending upstream request");
        let response = request.send().await?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(UpstreamError::Api { status, body });
        }

        Ok(response)
    }
}

#[async_trait]
impl CompletionApi for OpenAiClient {
    async fn complete(&self, body: &RequestBody) -> Result<Value, UpstreamError> {
        let response = self.post(body, false).await?;
        let text = response.text().await?;
        serde_json::from_str(&text).map_err(|e| UpstreamError::InvalidResponse(e.to_string()))
    }

    async fn complete_stream(&self, body: &RequestBody) -> Result<ChunkReceiver, UpstreamError> {
        let response = self.post(body, true).await?;
        let (tx, rx) = mpsc::channel(100);

        tokio::spawn(async move {
            use eventsource_stream::Eventsource;
            use futures::StreamExt;

            let stream = response.bytes_stream().eventsource();
            let mut stream = Box::pin(stream);

            while let Some(event_result) = stream.next().await {
                let item = match event_result {
                    Ok(event) => {
                        if event.data == "[DONE]" {
                            return;
                        }
                        parse_chunk(&event.data)
                    }
                    Err(e) => Err(UpstreamError::Stream(e.to_string())),
                };

                let failed = item.is_err();
                if tx.send(item).await.is_err() || failed {
                    return;
                }
            }

            let _ = tx
                .send(Err(UpstreamError::Stream(
                    "stream ended before [DONE]".to_string(),
                )))
                .await;
        });

        Ok(rx)
    }
}

fn parse_chunk(data: &str) -> Result<Value, UpstreamError> {
    let chunk: Value =
        serde_json::from_str(data).map_err(|e| UpstreamError::InvalidResponse(e.to_string()))?;

    if let Some(error) = chunk.get("error") {
        return Err(UpstreamError::Stream(error.to_string()));
    }
    Ok(chunk)
}
