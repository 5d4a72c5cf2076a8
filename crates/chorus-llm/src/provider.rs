//! LLM Provider trait

use crate::types::{LlmRequest, ModelSpec, StreamDelta};
use futures::Stream;
use std::pin::Pin;
use tokio_util::sync::CancellationToken;

/// Result type for LLM operations
pub type LlmResult<T> = Result<T, LlmError>;

/// LLM error types
#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("request failed: {0}")]
    RequestFailed(String),

    #[error("authentication failed: {0}")]
    AuthFailed(String),

    #[error("rate limited: retry after {retry_after_ms}ms")]
    RateLimited { retry_after_ms: u64 },

    #[error("context overflow: {0}")]
    ContextOverflow(String),

    #[error("invalid response: {0}")]
    InvalidResponse(String),

    #[error("stream error: {0}")]
    StreamError(String),

    #[error("cancelled")]
    Cancelled,

    #[error("network error: {0}")]
    NetworkError(#[from] reqwest::Error),
}

/// Stream type for LLM responses
pub type LlmStream = Pin<Box<dyn Stream<Item = LlmResult<StreamDelta>> + Send>>;

/// LLM Provider trait. A provider may host several models; `model_specs`
/// advertises each with its tags so the slug allocator's model-tier
/// fallback (spec §4.G) can pick one without the rest of the system
/// knowing the provider's wire protocol.
#[async_trait::async_trait]
pub trait LlmProvider: Send + Sync {
    fn name(&self) -> &str;
    fn model_specs(&self) -> &[ModelSpec];

    fn supports_model(&self, model: &str) -> bool {
        self.model_specs().iter().any(|m| m.id == model)
    }

    /// Stream a completion response. `cancel` is always honored promptly:
    /// once fired, the underlying HTTP connection is dropped and the
    /// stream yields `LlmError::Cancelled` in place of further deltas.
    async fn complete_stream(
        &self,
        request: LlmRequest,
        cancel: CancellationToken,
    ) -> LlmResult<LlmStream>;
}
