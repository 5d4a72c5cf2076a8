//! Message Log (spec §4.B): an append-only per-conversation journal with
//! dense, gap-free `sequence_id` allocation and ordered range reads.
//!
//! This is not the SQL persistence layer (out of scope per spec §1) — it is
//! the seam that layer would plug into. `LogStore` is the interface;
//! `InMemoryLogStore` is the one implementation this workspace ships.

use chorus_core::{ConversationId, Error, Message, MessageBody, Result, Usage};
use dashmap::DashMap;
use serde_json::Value;
use tokio::sync::Mutex as AsyncMutex;
use uuid::Uuid;

/// The Message Log's contract. `append` assigns the next `sequence_id`
/// within a single conversation's serialization domain; callers (the
/// Conversation Manager's turn worker) are the only writers for a given
/// conversation, so no cross-conversation locking is needed here.
#[async_trait::async_trait]
pub trait LogStore: Send + Sync {
    async fn append(
        &self,
        conversation_id: ConversationId,
        body: MessageBody,
        usage: Option<Usage>,
        display: Option<Value>,
    ) -> Result<Message>;

    async fn list(&self, conversation_id: ConversationId) -> Vec<Message>;

    async fn get_tail(&self, conversation_id: ConversationId) -> Option<Message>;
}

/// `tokio::sync::Mutex`-guarded `Vec<Message>` per conversation. Sequence
/// allocation takes the conversation's own lock, so concurrent appends to
/// *different* conversations never contend with each other.
#[derive(Default)]
pub struct InMemoryLogStore {
    conversations: DashMap<ConversationId, AsyncMutex<Vec<Message>>>,
}

impl InMemoryLogStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl LogStore for InMemoryLogStore {
    async fn append(
        &self,
        conversation_id: ConversationId,
        body: MessageBody,
        usage: Option<Usage>,
        display: Option<Value>,
    ) -> Result<Message> {
        let entry = self
            .conversations
            .entry(conversation_id)
            .or_insert_with(|| AsyncMutex::new(Vec::new()));
        let mut messages = entry.lock().await;

        let sequence_id = messages.last().map(|m| m.sequence_id + 1).unwrap_or(0);
        let message = Message {
            message_id: Uuid::new_v4(),
            conversation_id,
            sequence_id,
            body,
            usage,
            display,
            created_at: chrono::Utc::now(),
        };
        messages.push(message.clone());
        Ok(message)
    }

    async fn list(&self, conversation_id: ConversationId) -> Vec<Message> {
        match self.conversations.get(&conversation_id) {
            Some(entry) => entry.lock().await.clone(),
            None => Vec::new(),
        }
    }

    async fn get_tail(&self, conversation_id: ConversationId) -> Option<Message> {
        let entry = self.conversations.get(&conversation_id)?;
        entry.lock().await.last().cloned()
    }
}

/// Surfaces an append failure as the synthesized `error` entry a caller
/// should record in a subsequent append, per spec §4.B's failure semantics.
pub fn append_failure_message(err: &Error) -> String {
    format!("message log append failed: {err}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use chorus_core::AgentContentBlock;

    #[tokio::test]
    async fn sequence_ids_are_dense_and_gap_free() {
        let store = InMemoryLogStore::new();
        let conv = ConversationId::new();
        for i in 0..5 {
            store
                .append(conv, MessageBody::User { text: format!("msg {i}") }, None, None)
                .await
                .unwrap();
        }
        let seqs: Vec<u64> = store.list(conv).await.iter().map(|m| m.sequence_id).collect();
        assert_eq!(seqs, vec![0, 1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn separate_conversations_each_start_at_zero() {
        let store = InMemoryLogStore::new();
        let a = ConversationId::new();
        let b = ConversationId::new();
        store.append(a, MessageBody::User { text: "a0".into() }, None, None).await.unwrap();
        store.append(a, MessageBody::User { text: "a1".into() }, None, None).await.unwrap();
        store.append(b, MessageBody::User { text: "b0".into() }, None, None).await.unwrap();

        assert_eq!(store.list(a).await.len(), 2);
        assert_eq!(store.list(b).await.len(), 1);
        assert_eq!(store.get_tail(b).await.unwrap().sequence_id, 0);
    }

    #[tokio::test]
    async fn get_tail_on_unknown_conversation_is_none() {
        let store = InMemoryLogStore::new();
        assert!(store.get_tail(ConversationId::new()).await.is_none());
    }

    #[tokio::test]
    async fn appended_agent_entry_round_trips_tool_use_ids() {
        let store = InMemoryLogStore::new();
        let conv = ConversationId::new();
        let msg = store
            .append(
                conv,
                MessageBody::Agent {
                    content: vec![AgentContentBlock::ToolUse {
                        id: "tu-1".into(),
                        tool_name: "read".into(),
                        input: serde_json::json!({}),
                    }],
                    end_of_turn: false,
                },
                None,
                None,
            )
            .await
            .unwrap();
        assert_eq!(msg.body.introduced_tool_use_ids(), vec!["tu-1"]);
    }
}
