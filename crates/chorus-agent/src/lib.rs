//! The Message Log, Conversation Manager, and Slug Allocator (spec §4.B,
//! §4.E, §4.G) — the per-conversation state and turn-loop half of the
//! system. The Server Coordinator (chorus-gateway) owns one of these per
//! active conversation.

pub mod context;
pub mod conversation_store;
pub mod log;
pub mod manager;
pub mod slug;

pub use context::ContextManager;
pub use conversation_store::ConversationStore;
pub use log::{append_failure_message, InMemoryLogStore, LogStore};
pub use manager::{ConversationManager, ManagerConfig};
pub use slug::{sanitize, SlugAllocator, TEST_MODEL_ID};
