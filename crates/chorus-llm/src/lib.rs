//! Provider adapters with streaming support. Specified only as a
//! collaborator interface — the retry/backoff internals of any given
//! provider are out of scope; what matters to the rest of the workspace is
//! the `LlmProvider` trait and the tag-aware registry built on it.

pub mod anthropic;
pub mod provider;
pub mod registry;
pub mod types;

pub use anthropic::AnthropicProvider;
pub use provider::{LlmError, LlmProvider, LlmResult, LlmStream};
pub use registry::LlmRegistry;
pub use types::*;
