//! HTTP client for OpenAI-compatible chat-completion endpoints.

use crate::error::UpstreamError;
use crate::provider::sse::SseStream;
use crate::provider::types::{ChatOutcome, ChatRequest, ChatResponse};
use crate::provider::{ChatProvider, DeltaStream};
use futures_util::StreamExt;
use std::time::Duration;

/// Cap on surfaced error-body text.
const MAX_ERROR_BODY_BYTES: usize = 4096;

/// Default wall-clock limit for one completion request.
const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 600;

/// Default allowed gap between stream reads.
const DEFAULT_READ_IDLE_TIMEOUT_SECS: u64 = 120;

/// Client for `POST {base_url}/chat/completions`.
///
/// Sends bearer auth when an API key is configured. Performs no retries;
/// the agent layer decides whether a failed request is retried.
pub struct OpenAiProvider {
    http: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
}

impl OpenAiProvider {
    /// Build a client with default timeouts.
    ///
    /// # Arguments
    /// * `base_url` - Endpoint base, e.g. `https://api.openai.com/v1`.
    /// * `api_key` - Bearer token, when the endpoint requires one.
    pub fn new(base_url: impl Into<String>, api_key: Option<String>) -> Result<Self, UpstreamError> {
        Self::with_timeouts(
            base_url,
            api_key,
            Duration::from_secs(DEFAULT_REQUEST_TIMEOUT_SECS),
            Duration::from_secs(DEFAULT_READ_IDLE_TIMEOUT_SECS),
        )
    }

    /// Build a client with explicit wall-clock and read-idle timeouts.
    pub fn with_timeouts(
        base_url: impl Into<String>,
        api_key: Option<String>,
        request_timeout: Duration,
        read_idle_timeout: Duration,
    ) -> Result<Self, UpstreamError> {
        let http = reqwest::Client::builder()
            .timeout(request_timeout)
            .read_timeout(read_idle_timeout)
            .build()
            .map_err(|e| UpstreamError::Connect(e.to_string()))?;

        Ok(Self {
            http,
            base_url: base_url.into(),
            api_key,
        })
    }

    fn endpoint(&self) -> String {
        format!("{}/chat/completions", self.base_url.trim_end_matches('/'))
    }

    async fn send(&self, request: &ChatRequest) -> Result<reqwest::Response, UpstreamError> {
        let mut builder = self.http.post(self.endpoint()).json(request);
        if let Some(key) = &self.api_key {
            builder = builder.bearer_auth(key);
        }

        let response = builder.send().await.map_err(|e| {
            if e.is_connect() || e.is_timeout() {
                UpstreamError::Connect(e.to_string())
            } else {
                UpstreamError::Connect(format!("request failed: {e}"))
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            let mut body = response.text().await.unwrap_or_default();
            body.truncate(MAX_ERROR_BODY_BYTES);
            return Err(UpstreamError::Http {
                status: status.as_u16(),
                body,
            });
        }

        Ok(response)
    }
}

#[async_trait::async_trait]
impl ChatProvider for OpenAiProvider {
    async fn complete(&self, request: &ChatRequest) -> Result<ChatOutcome, UpstreamError> {
        let mut request = request.clone();
        request.stream = false;

        let response = self.send(&request).await?;
        let parsed: ChatResponse = response
            .json()
            .await
            .map_err(|e| UpstreamError::MalformedStream(format!("bad response body: {e}")))?;

        let content = parsed
            .choices
            .first()
            .and_then(|c| c.message.content.clone())
            .unwrap_or_default();

        Ok(ChatOutcome {
            content,
            usage: parsed.usage,
        })
    }

    async fn complete_stream(&self, request: &ChatRequest) -> Result<DeltaStream, UpstreamError> {
        let mut request = request.clone();
        request.stream = true;

        let response = self.send(&request).await?;
        let deltas = SseStream::new(response.bytes_stream()).filter_map(|item| async move {
            match item {
                Ok(chunk) => chunk
                    .choices
                    .into_iter()
                    .next()
                    .and_then(|c| c.delta.content)
                    .filter(|text| !text.is_empty())
                    .map(Ok),
                Err(e) => Some(Err(e)),
            }
        });

        Ok(Box::pin(deltas))
    }

    fn provider_name(&self) -> &str {
        "openai-compat"
    }
}
