//! Error taxonomy shared across the workspace.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("authentication failed: {reason}")]
    AuthFailed { reason: String },

    #[error("connection closed: {0}")]
    ConnectionClosed(String),

    #[error("invalid message: {0}")]
    InvalidMessage(String),

    #[error("conversation not found: {0}")]
    ConversationNotFound(String),

    #[error("method not found: {0}")]
    MethodNotFound(String),

    #[error("conversation {conversation_id} model mismatch: sticky model is {sticky}, request used {requested}")]
    ModelMismatch {
        conversation_id: String,
        sticky: String,
        requested: String,
    },

    #[error("conversation {0} already has a turn in progress")]
    TurnInProgress(String),

    #[error("sequence conflict in conversation {conversation_id}: expected next {expected}, tail is {actual}")]
    SequenceConflict {
        conversation_id: String,
        expected: u64,
        actual: u64,
    },

    #[error("slug generation failed: {0}")]
    SlugGenerationFailed(String),

    #[error("failed to generate unique slug after {attempts} attempts")]
    SlugExhausted { attempts: u32 },

    #[error("llm request failed: {provider} - {message}")]
    LlmError { provider: String, message: String },

    #[error("tool error: {name} - {message}")]
    ToolError { name: String, message: String },

    #[error("config error: {0}")]
    ConfigError(String),

    #[error("io error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("json error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub fn auth_failed(reason: impl Into<String>) -> Self {
        Self::AuthFailed {
            reason: reason.into(),
        }
    }

    pub fn llm_error(provider: impl Into<String>, message: impl Into<String>) -> Self {
        Self::LlmError {
            provider: provider.into(),
            message: message.into(),
        }
    }

    pub fn tool_error(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::ToolError {
            name: name.into(),
            message: message.into(),
        }
    }

    pub fn model_mismatch(
        conversation_id: impl Into<String>,
        sticky: impl Into<String>,
        requested: impl Into<String>,
    ) -> Self {
        Self::ModelMismatch {
            conversation_id: conversation_id.into(),
            sticky: sticky.into(),
            requested: requested.into(),
        }
    }

    pub fn sequence_conflict(
        conversation_id: impl Into<String>,
        expected: u64,
        actual: u64,
    ) -> Self {
        Self::SequenceConflict {
            conversation_id: conversation_id.into(),
            expected,
            actual,
        }
    }

    /// The text the manager appends as an `error` entry when an LLM call
    /// fails — the observable end-of-turn contract requires this fixed
    /// prefix regardless of the underlying provider error.
    pub fn llm_turn_message(&self) -> String {
        format!("LLM request failed: {self}")
    }
}
