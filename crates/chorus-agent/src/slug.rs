//! Slug Allocator (spec §4.G): turns a conversation's first user message
//! into a short, URL-safe, unique label via an LLM call, with model-tier
//! fallback and bounded conflict retry.

use chorus_core::{ConversationId, Error, Result};
use chorus_llm::{LlmContent, LlmMessage, LlmRegistry, LlmRequest, LlmStream, StreamDelta};
use futures::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::conversation_store::ConversationStore;

/// Sticky model id tests can assign to a conversation to route slug
/// generation straight to a registered fake, bypassing the tag-based
/// fallback chain entirely.
pub const TEST_MODEL_ID: &str = "test-deterministic-slug-model";

const SLUG_CALL_TIMEOUT: Duration = Duration::from_secs(10);
const MAX_CONFLICT_RETRIES: u32 = 100;
const MAX_SLUG_LEN: usize = 60;

const FALLBACK_TAGS: [&str; 2] = ["slug", "slug-backup"];

pub struct SlugAllocator {
    llm_registry: Arc<LlmRegistry>,
    conversations: Arc<ConversationStore>,
}

impl SlugAllocator {
    pub fn new(llm_registry: Arc<LlmRegistry>, conversations: Arc<ConversationStore>) -> Self {
        Self { llm_registry, conversations }
    }

    /// Generates and persists a slug for `conversation_id`, from the text of
    /// its first user message. Fired exactly once per conversation by the
    /// coordinator, on the side, after the triggering turn has already
    /// started — failure here never blocks or fails the turn itself.
    pub async fn assign_slug(&self, conversation_id: ConversationId, sticky_model_id: &str, user_text: &str) -> Result<String> {
        let raw = self.generate_candidate(sticky_model_id, user_text).await?;
        let sanitized = sanitize(&raw);
        if sanitized.is_empty() {
            return Err(Error::SlugGenerationFailed(
                "generated slug is empty after sanitization".to_string(),
            ));
        }

        if self.conversations.try_set_slug(conversation_id, &sanitized) {
            return Ok(sanitized);
        }
        for attempt in 1..=MAX_CONFLICT_RETRIES {
            let candidate = format!("{sanitized}-{attempt}");
            let candidate = truncate(&candidate);
            if self.conversations.try_set_slug(conversation_id, &candidate) {
                return Ok(candidate);
            }
        }
        Err(Error::SlugExhausted { attempts: MAX_CONFLICT_RETRIES })
    }

    /// Generation-only step: tries the conversation's sticky model directly
    /// when it's the deterministic test model, otherwise walks
    /// `["slug", "slug-backup"]` tags across the registry in order, falling
    /// back to the sticky model itself if no tagged model answers.
    async fn generate_candidate(&self, sticky_model_id: &str, user_text: &str) -> Result<String> {
        if sticky_model_id == TEST_MODEL_ID {
            if let Some(provider) = self.llm_registry.provider_for_model(sticky_model_id) {
                if let Ok(text) = call_model(provider, sticky_model_id, user_text).await {
                    return Ok(text);
                }
            }
        }

        for tag in FALLBACK_TAGS {
            for (provider, model_id) in self.llm_registry.models_tagged(tag) {
                if let Ok(text) = call_model(provider, &model_id, user_text).await {
                    return Ok(text);
                }
            }
        }

        if let Some(provider) = self.llm_registry.provider_for_model(sticky_model_id) {
            if let Ok(text) = call_model(provider, sticky_model_id, user_text).await {
                return Ok(text);
            }
        }

        Err(Error::SlugGenerationFailed(
            "no configured model produced a slug".to_string(),
        ))
    }
}

async fn call_model(
    provider: Arc<dyn chorus_llm::LlmProvider>,
    model_id: &str,
    user_text: &str,
) -> std::result::Result<String, ()> {
    let prompt = format!(
        "Generate a short, descriptive slug (2-6 words, lowercase, hyphen-separated) \
         summarizing this conversation. Respond with only the slug, nothing else.\n\n{user_text}"
    );
    let request = LlmRequest {
        model: model_id.to_string(),
        messages: vec![LlmMessage { role: "user".to_string(), content: LlmContent::Text(prompt) }],
        tools: None,
        max_tokens: Some(32),
        temperature: None,
        system: None,
    };

    let cancel = CancellationToken::new();
    let call = async {
        let stream = provider.complete_stream(request, cancel.clone()).await.map_err(|_| ())?;
        first_text(stream).await
    };

    match tokio::time::timeout(SLUG_CALL_TIMEOUT, call).await {
        Ok(result) => result,
        Err(_) => {
            cancel.cancel();
            Err(())
        }
    }
}

/// First non-empty `Text` delta, skipping `Thinking`. Good enough for a
/// single short completion — the slug allocator doesn't need the full
/// accumulation machinery the turn loop uses.
async fn first_text(mut stream: LlmStream) -> std::result::Result<String, ()> {
    let mut text = String::new();
    while let Some(delta) = stream.next().await {
        match delta {
            Ok(StreamDelta::Text(chunk)) => text.push_str(&chunk),
            Ok(StreamDelta::Done { .. }) => break,
            Ok(StreamDelta::Error(_)) => return Err(()),
            Err(_) => return Err(()),
            _ => {}
        }
    }
    if text.trim().is_empty() {
        Err(())
    } else {
        Ok(text)
    }
}

fn truncate(s: &str) -> String {
    if s.len() <= MAX_SLUG_LEN {
        s.to_string()
    } else {
        s.chars().take(MAX_SLUG_LEN).collect::<String>().trim_end_matches('-').to_string()
    }
}

/// Lowercases, collapses any run of non-`[a-z0-9]` into a single `-`, and
/// trims leading/trailing `-`, bounding the result to `MAX_SLUG_LEN`.
pub fn sanitize(input: &str) -> String {
    let lowered = input.trim().to_lowercase();
    let mut out = String::with_capacity(lowered.len());
    let mut last_was_dash = false;
    for c in lowered.chars() {
        if c.is_ascii_alphanumeric() {
            out.push(c);
            last_was_dash = false;
        } else if !last_was_dash && !out.is_empty() {
            out.push('-');
            last_was_dash = true;
        }
    }
    let trimmed = out.trim_end_matches('-');
    truncate(trimmed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chorus_llm::{LlmError, LlmProvider, LlmResult, ModelSpec};

    #[test]
    fn sanitize_collapses_whitespace_and_punctuation() {
        assert_eq!(sanitize("Fix the Login Bug!!"), "fix-the-login-bug");
        assert_eq!(sanitize("  leading and trailing  "), "leading-and-trailing");
        assert_eq!(sanitize("multiple___underscores"), "multiple-underscores");
    }

    #[test]
    fn sanitize_of_pure_punctuation_is_empty() {
        assert_eq!(sanitize("!!!???"), "");
    }

    #[test]
    fn sanitize_truncates_long_input() {
        let long = "word-".repeat(30);
        let sanitized = sanitize(&long);
        assert!(sanitized.len() <= MAX_SLUG_LEN);
    }

    struct FixedReplyProvider {
        model_id: String,
        reply: String,
        specs: Vec<ModelSpec>,
    }

    #[async_trait]
    impl LlmProvider for FixedReplyProvider {
        fn name(&self) -> &str {
            "fixed-reply"
        }
        fn model_specs(&self) -> &[ModelSpec] {
            &self.specs
        }
        async fn complete_stream(&self, request: LlmRequest, _cancel: CancellationToken) -> LlmResult<LlmStream> {
            assert_eq!(request.model, self.model_id);
            let deltas = vec![
                Ok(StreamDelta::Text(self.reply.clone())),
                Ok(StreamDelta::Done { stop_reason: Some("end_turn".to_string()), usage: None }),
            ];
            Ok(Box::pin(futures::stream::iter(deltas)))
        }
    }

    struct FailingProvider {
        specs: Vec<ModelSpec>,
    }

    #[async_trait]
    impl LlmProvider for FailingProvider {
        fn name(&self) -> &str {
            "failing"
        }
        fn model_specs(&self) -> &[ModelSpec] {
            &self.specs
        }
        async fn complete_stream(&self, _request: LlmRequest, _cancel: CancellationToken) -> LlmResult<LlmStream> {
            Err(LlmError::RequestFailed("boom".to_string()))
        }
    }

    #[tokio::test]
    async fn deterministic_test_model_bypasses_tag_fallback() {
        let mut registry = LlmRegistry::new();
        registry.register(Arc::new(FixedReplyProvider {
            model_id: TEST_MODEL_ID.to_string(),
            reply: "Fix The Bug".to_string(),
            specs: vec![ModelSpec::new(TEST_MODEL_ID, &[])],
        }));
        let conversations = Arc::new(ConversationStore::new());
        let id = ConversationId::new();
        conversations.create(id, None);

        let allocator = SlugAllocator::new(Arc::new(registry), conversations.clone());
        let slug = allocator.assign_slug(id, TEST_MODEL_ID, "fix the bug please").await.unwrap();
        assert_eq!(slug, "fix-the-bug");
        assert_eq!(conversations.get(id).unwrap().slug, Some("fix-the-bug".to_string()));
    }

    #[tokio::test]
    async fn falls_back_to_slug_backup_tag_when_primary_fails() {
        let mut registry = LlmRegistry::new();
        registry.register(Arc::new(FailingProvider {
            specs: vec![ModelSpec::new("primary-slug-model", &["slug"])],
        }));
        registry.register(Arc::new(FixedReplyProvider {
            model_id: "backup-slug-model".to_string(),
            reply: "backup generated slug".to_string(),
            specs: vec![ModelSpec::new("backup-slug-model", &["slug-backup"])],
        }));
        let conversations = Arc::new(ConversationStore::new());
        let id = ConversationId::new();
        conversations.create(id, None);

        let allocator = SlugAllocator::new(Arc::new(registry), conversations.clone());
        let slug = allocator.assign_slug(id, "unrelated-sticky-model", "hello").await.unwrap();
        assert_eq!(slug, "backup-generated-slug");
    }

    #[tokio::test]
    async fn conflicting_slug_gets_numeric_suffix() {
        let mut registry = LlmRegistry::new();
        registry.register(Arc::new(FixedReplyProvider {
            model_id: TEST_MODEL_ID.to_string(),
            reply: "same slug".to_string(),
            specs: vec![ModelSpec::new(TEST_MODEL_ID, &[])],
        }));
        let conversations = Arc::new(ConversationStore::new());
        let taken = ConversationId::new();
        let id = ConversationId::new();
        conversations.create(taken, None);
        conversations.create(id, None);
        assert!(conversations.try_set_slug(taken, "same-slug"));

        let allocator = SlugAllocator::new(Arc::new(registry), conversations.clone());
        let slug = allocator.assign_slug(id, TEST_MODEL_ID, "irrelevant").await.unwrap();
        assert_eq!(slug, "same-slug-1");
    }

    #[tokio::test]
    async fn no_model_answers_is_a_generation_failure() {
        let registry = LlmRegistry::new();
        let conversations = Arc::new(ConversationStore::new());
        let id = ConversationId::new();
        conversations.create(id, None);

        let allocator = SlugAllocator::new(Arc::new(registry), conversations.clone());
        let err = allocator.assign_slug(id, "no-such-model", "hello").await.unwrap_err();
        assert!(matches!(err, Error::SlugGenerationFailed(_)));
    }
}
