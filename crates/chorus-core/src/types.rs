//! Domain types: conversations, messages, and their payloads.
//!
//! `Message` is the append-only journal row described in the data model.
//! Its body is modeled as an internally-tagged enum (a `type` discriminant)
//! rather than a flat row of optional columns — the same information, but a
//! shape the compiler checks instead of one only a query planner enforces.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Opaque conversation identifier. `Copy` because `Uuid` is.
#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub struct ConversationId(pub Uuid);

impl ConversationId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConversationId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConversationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for ConversationId {
    type Err = uuid::Error;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

/// A conversation's durable metadata row.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Conversation {
    pub id: ConversationId,
    pub slug: Option<String>,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub updated_at: chrono::DateTime<chrono::Utc>,
    pub archived: bool,
    pub cwd: Option<String>,
    /// Fixed on the first turn; later turns with a different id are rejected.
    pub model_id: Option<String>,
}

impl Conversation {
    pub fn new(id: ConversationId, cwd: Option<String>) -> Self {
        let now = chrono::Utc::now();
        Self {
            id,
            slug: None,
            created_at: now,
            updated_at: now,
            archived: false,
            cwd,
            model_id: None,
        }
    }
}

/// Discriminant mirroring the data model's `type ∈ {user, agent, tool, error, gitinfo}`.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    User,
    Agent,
    Tool,
    Error,
    Gitinfo,
}

/// A piece of content inside a tool-result: text or base64-encoded media.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ContentPart {
    Text { text: String },
    Media { media_type: String, data: String },
}

impl ContentPart {
    pub fn text(s: impl Into<String>) -> Self {
        Self::Text { text: s.into() }
    }
}

/// Content block inside an `agent` entry: either text the model said or a
/// tool it invoked.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AgentContentBlock {
    Text {
        text: String,
    },
    ToolUse {
        id: String,
        tool_name: String,
        input: serde_json::Value,
    },
}

/// One invocation's paired result, as persisted in a `tool` entry.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ToolResultPayload {
    pub tool_use_id: String,
    pub content: Vec<ContentPart>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub display: Option<serde_json::Value>,
    pub is_error: bool,
}

impl ToolResultPayload {
    pub fn text(tool_use_id: impl Into<String>, text: impl Into<String>, is_error: bool) -> Self {
        Self {
            tool_use_id: tool_use_id.into(),
            content: vec![ContentPart::text(text)],
            display: None,
            is_error,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Usage {
    pub input_tokens: u32,
    pub output_tokens: u32,
    /// Context window size reported by the model for this step; 0 means
    /// "not reported" and observers should retain their previous value.
    pub context_window_tokens: u32,
}

/// The five message payload shapes, internally tagged by `type`.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum MessageBody {
    User {
        text: String,
    },
    Agent {
        content: Vec<AgentContentBlock>,
        end_of_turn: bool,
    },
    Tool {
        results: Vec<ToolResultPayload>,
    },
    Error {
        message: String,
    },
    Gitinfo {
        #[serde(skip_serializing_if = "Option::is_none")]
        branch: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        commit: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        dirty: Option<bool>,
    },
}

impl MessageBody {
    pub fn kind(&self) -> MessageKind {
        match self {
            Self::User { .. } => MessageKind::User,
            Self::Agent { .. } => MessageKind::Agent,
            Self::Tool { .. } => MessageKind::Tool,
            Self::Error { .. } => MessageKind::Error,
            Self::Gitinfo { .. } => MessageKind::Gitinfo,
        }
    }

    /// `tool_use` ids this entry introduces (agent entries only).
    pub fn introduced_tool_use_ids(&self) -> Vec<&str> {
        match self {
            Self::Agent { content, .. } => content
                .iter()
                .filter_map(|b| match b {
                    AgentContentBlock::ToolUse { id, .. } => Some(id.as_str()),
                    _ => None,
                })
                .collect(),
            _ => Vec::new(),
        }
    }
}

/// An append-only journal entry.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Message {
    pub message_id: Uuid,
    pub conversation_id: ConversationId,
    pub sequence_id: u64,
    #[serde(flatten)]
    pub body: MessageBody,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub display: Option<serde_json::Value>,
    pub created_at: chrono::DateTime<chrono::Utc>,
}

impl Message {
    pub fn kind(&self) -> MessageKind {
        self.body.kind()
    }

    /// True for an `agent` entry with `end_of_turn = true`.
    pub fn is_final_agent_turn(&self) -> bool {
        matches!(
            self.body,
            MessageBody::Agent { end_of_turn: true, .. }
        )
    }
}

/// Per spec §8's `agent_working` rule: ignoring trailing `gitinfo` entries,
/// the turn is "not working" iff the tail is a final `agent` entry or an
/// `error` entry. Returns `false` for an empty list or an all-`gitinfo`
/// list (no agent entry has ever run — see DESIGN.md for why this reads
/// "not working" rather than "working").
pub fn agent_working(messages: &[Message]) -> bool {
    let tail = messages
        .iter()
        .rev()
        .find(|m| m.kind() != MessageKind::Gitinfo);
    match tail {
        None => false,
        Some(m) => !matches!(
            m.body,
            MessageBody::Agent { end_of_turn: true, .. } | MessageBody::Error { .. }
        ),
    }
}
