//! Upstream LLM provider abstraction.
//!
//! A provider turns an ordered message context into assistant reply text,
//! either as one complete reply (batch) or as a sequence of fragments
//! (streaming). Both shapes are exposed through [`Provider::chat_stream`] so
//! the relay has a single code path.

mod compatible;
pub mod sse;

pub use compatible::CompatibleProvider;

use crate::message::Message;
use async_trait::async_trait;
use briggie_common::config::ProviderConfig;
use futures_util::stream::{self, Stream};
use std::pin::Pin;
use std::sync::Arc;

// ============================================================================
// Provider Trait
// ============================================================================

/// Lazily produced reply fragments. Consumed exactly once.
pub type FragmentStream = Pin<Box<dyn Stream<Item = Result<String, ProviderError>> + Send>>;

/// How a provider delivers its reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryMode {
    /// One complete reply, nothing observable before it is done
    Batch,
    /// Incremental fragments as the upstream produces them
    Streaming,
}

/// Unified interface for LLM providers.
#[async_trait]
pub trait Provider: Send + Sync {
    /// Get the provider name.
    fn name(&self) -> &str;

    /// Get the model requests are sent to.
    fn model(&self) -> &str;

    /// Get the delivery granularity.
    fn mode(&self) -> DeliveryMode;

    /// Produce the complete reply for `messages`.
    async fn chat(&self, messages: &[Message]) -> Result<String, ProviderError>;

    /// Produce the reply for `messages` as fragments.
    ///
    /// The default wraps [`Provider::chat`] into a single fragment.
    async fn chat_stream(&self, messages: Vec<Message>) -> Result<FragmentStream, ProviderError> {
        let reply = self.chat(&messages).await?;
        Ok(Box::pin(stream::once(async move { Ok::<_, ProviderError>(reply) })))
    }
}

/// Error from a provider.
#[derive(Debug, Clone)]
pub struct ProviderError {
    pub provider: String,
    pub model: String,
    pub message: String,
    pub status_code: Option<u16>,
}

impl std::fmt::Display for ProviderError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}:{}] {}", self.provider, self.model, self.message)
    }
}

impl std::error::Error for ProviderError {}

/// Create the provider selected by configuration.
pub fn build_provider(config: &ProviderConfig) -> Arc<dyn Provider> {
    let mode = if config.streaming() {
        DeliveryMode::Streaming
    } else {
        DeliveryMode::Batch
    };

    let provider = CompatibleProvider::new(
        config.kind.as_str(),
        config.base_url(),
        config.api_key.as_deref(),
        config.model(),
        mode,
    )
    .with_timeouts(
        std::time::Duration::from_secs(config.connect_timeout_secs()),
        std::time::Duration::from_secs(config.request_timeout_secs()),
    );

    tracing::info!(
        provider = %config.kind,
        model = %config.model(),
        mode = ?mode,
        base_url = %config.base_url(),
        "Provider configured"
    );

    Arc::new(provider)
}
