//! OpenAI-compatible chat completions provider.
//!
//! OpenAI and Mistral share the `/chat/completions` wire format, so one
//! implementation serves both. The configured base URL already carries the
//! version segment (`https://api.mistral.ai/v1`).

use super::sse::fragment_stream;
use super::{DeliveryMode, FragmentStream, Provider, ProviderError};
use crate::message::Message;
use async_trait::async_trait;
use futures_util::stream::{self, TryStreamExt};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};

/// A provider that speaks the OpenAI-compatible chat completions API.
pub struct CompatibleProvider {
    name: String,
    base_url: String,
    api_key: Option<String>,
    model: String,
    mode: DeliveryMode,
    request_timeout: Duration,
    client: Client,
}

#[derive(Debug, Serialize)]
struct CompletionRequest<'a> {
    model: &'a str,
    messages: &'a [Message],
    stream: bool,
}

#[derive(Debug, Deserialize)]
struct CompletionResponse {
    #[serde(default)]
    choices: Vec<CompletionChoice>,
    #[serde(default)]
    usage: Option<CompletionUsage>,
}

#[derive(Debug, Deserialize)]
struct CompletionChoice {
    message: CompletionMessage,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CompletionMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CompletionUsage {
    prompt_tokens: Option<i64>,
    completion_tokens: Option<i64>,
}

impl CompatibleProvider {
    /// Create a new OpenAI-compatible provider.
    pub fn new(
        name: &str,
        base_url: &str,
        api_key: Option<&str>,
        model: &str,
        mode: DeliveryMode,
    ) -> Self {
        Self {
            name: name.to_string(),
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.map(ToString::to_string),
            model: model.to_string(),
            mode,
            request_timeout: Duration::from_secs(300),
            client: Self::build_client(Duration::from_secs(10)),
        }
    }

    /// Override the connect timeout and the whole-request timeout for batch calls.
    ///
    /// Streaming calls are only bounded by the connect timeout.
    pub fn with_timeouts(mut self, connect: Duration, request: Duration) -> Self {
        self.client = Self::build_client(connect);
        self.request_timeout = request;
        self
    }

    fn build_client(connect_timeout: Duration) -> Client {
        Client::builder()
            .connect_timeout(connect_timeout)
            .tcp_nodelay(true)
            .build()
            .unwrap_or_else(|_| Client::new())
    }

    fn endpoint(&self) -> String {
        format!("{}/chat/completions", self.base_url)
    }

    fn error(&self, message: impl Into<String>, status_code: Option<u16>) -> ProviderError {
        ProviderError {
            provider: self.name.clone(),
            model: self.model.clone(),
            message: message.into(),
            status_code,
        }
    }

    /// Send a completion request and check the status line.
    async fn send(
        &self,
        messages: &[Message],
        stream: bool,
    ) -> Result<reqwest::Response, ProviderError> {
        let api_key = self.api_key.as_deref().ok_or_else(|| {
            self.error(
                format!("{} API key not set. Set the appropriate env var.", self.name),
                None,
            )
        })?;

        let body = CompletionRequest {
            model: &self.model,
            messages,
            stream,
        };

        let mut req = self
            .client
            .post(self.endpoint())
            .bearer_auth(api_key)
            .json(&body);

        if stream {
            req = req.header("Accept", "text/event-stream");
        } else {
            req = req.timeout(self.request_timeout);
        }

        let response = req
            .send()
            .await
            .map_err(|e| self.error(format!("Request failed: {}", e), None))?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response.text().await.unwrap_or_default();
            return Err(self.error(
                format!("API error ({}): {}", status.as_u16(), error_text),
                Some(status.as_u16()),
            ));
        }

        Ok(response)
    }

    /// Open a streaming completion and decode its event stream.
    async fn open_stream(&self, messages: Vec<Message>) -> Result<FragmentStream, ProviderError> {
        let response = self.send(&messages, true).await?;

        let provider = self.name.clone();
        let model = self.model.clone();
        let fragments = fragment_stream(response.bytes_stream()).map_err(move |e| ProviderError {
            provider: provider.clone(),
            model: model.clone(),
            message: format!("Stream interrupted: {}", e),
            status_code: None,
        });

        Ok(Box::pin(fragments))
    }
}

#[async_trait]
impl Provider for CompatibleProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn model(&self) -> &str {
        &self.model
    }

    fn mode(&self) -> DeliveryMode {
        self.mode
    }

    async fn chat(&self, messages: &[Message]) -> Result<String, ProviderError> {
        let start = Instant::now();
        let response = self.send(messages, false).await?;

        let result: CompletionResponse = response
            .json()
            .await
            .map_err(|e| self.error(format!("Failed to parse response: {}", e), None))?;

        let choice = result
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| self.error(format!("No response from {}", self.name), None))?;

        tracing::debug!(
            provider = %self.name,
            model = %self.model,
            latency_ms = start.elapsed().as_millis() as u64,
            input_tokens = result.usage.as_ref().and_then(|u| u.prompt_tokens).unwrap_or(0),
            output_tokens = result.usage.as_ref().and_then(|u| u.completion_tokens).unwrap_or(0),
            finish_reason = choice.finish_reason.as_deref().unwrap_or("unknown"),
            "Completion received"
        );

        Ok(choice.message.content.unwrap_or_default())
    }

    async fn chat_stream(&self, messages: Vec<Message>) -> Result<FragmentStream, ProviderError> {
        match self.mode {
            DeliveryMode::Streaming => self.open_stream(messages).await,
            DeliveryMode::Batch => {
                let reply = self.chat(&messages).await?;
                Ok(Box::pin(stream::once(async move {
                    Ok::<_, ProviderError>(reply)
                })))
            }
        }
    }
}
