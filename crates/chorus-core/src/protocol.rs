//! Wire format published through the Subscription Bus and served over the
//! gateway's HTTP/SSE surface (spec §6).

use crate::types::{ConversationId, Message};
use serde::{Deserialize, Serialize};

/// Public, serializable view of a `Conversation` row.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ConversationSnapshot {
    pub conversation_id: ConversationId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub slug: Option<String>,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub updated_at: chrono::DateTime<chrono::Utc>,
    pub archived: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cwd: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model_id: Option<String>,
}

impl From<&crate::types::Conversation> for ConversationSnapshot {
    fn from(c: &crate::types::Conversation) -> Self {
        Self {
            conversation_id: c.id,
            slug: c.slug.clone(),
            created_at: c.created_at,
            updated_at: c.updated_at,
            archived: c.archived,
            cwd: c.cwd.clone(),
            model_id: c.model_id.clone(),
        }
    }
}

/// Out-of-band side channel for list membership/ordering changes, carried
/// inside a `StreamSnapshot` or delivered standalone on the list bus.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ConversationListUpdate {
    Update { conversation: ConversationSnapshot },
    Delete { conversation_id: ConversationId },
}

/// The bus's value type: usually one newly-appended message plus the
/// conversation's current derived state.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StreamSnapshot {
    pub messages: Vec<Message>,
    pub conversation: ConversationSnapshot,
    pub agent_working: bool,
    /// Omitted on the wire when 0 (§4.F: "observers retain their previous
    /// value" when a non-agent entry carries no usage payload).
    #[serde(skip_serializing_if = "is_zero")]
    pub context_window_size: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub conversation_list_update: Option<ConversationListUpdate>,
}

fn is_zero(n: &u64) -> bool {
    *n == 0
}

impl StreamSnapshot {
    pub fn for_append(
        message: Message,
        conversation: ConversationSnapshot,
        agent_working: bool,
    ) -> Self {
        let context_window_size = message
            .usage
            .as_ref()
            .map(|u| u.context_window_tokens as u64)
            .unwrap_or(0);
        Self {
            messages: vec![message],
            conversation,
            agent_working,
            context_window_size,
            conversation_list_update: None,
        }
    }

    pub fn with_list_update(mut self, update: ConversationListUpdate) -> Self {
        self.conversation_list_update = Some(update);
        self
    }
}

/// Uniform error body for the HTTP surface.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiError {
    pub code: String,
    pub message: String,
}

impl ApiError {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
        }
    }
}

impl From<&crate::error::Error> for ApiError {
    fn from(e: &crate::error::Error) -> Self {
        use crate::error::Error::*;
        let code = match e {
            AuthFailed { .. } => "auth_failed",
            ConnectionClosed(_) => "connection_closed",
            InvalidMessage(_) => "invalid_message",
            ConversationNotFound(_) => "conversation_not_found",
            MethodNotFound(_) => "method_not_found",
            ModelMismatch { .. } => "model_mismatch",
            TurnInProgress(_) => "turn_in_progress",
            SequenceConflict { .. } => "sequence_conflict",
            SlugGenerationFailed(_) => "slug_generation_failed",
            SlugExhausted { .. } => "slug_exhausted",
            LlmError { .. } => "llm_error",
            ToolError { .. } => "tool_error",
            ConfigError(_) => "config_error",
            IoError(_) => "io_error",
            JsonError(_) => "json_error",
            Internal(_) => "internal_error",
        };
        Self::new(code, e.to_string())
    }
}
