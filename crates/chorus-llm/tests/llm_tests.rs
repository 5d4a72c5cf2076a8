//! Tests for chorus-llm: wire types, provider trait, and the tag-aware registry.
//! No network calls — the Anthropic provider's HTTP path is exercised only
//! through its types and cancellation plumbing.

use chorus_llm::*;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

// ===========================================================================
// LlmRequest
// ===========================================================================

#[test]
fn llm_request_default() {
    let req = LlmRequest::default();
    assert!(req.model.contains("claude"));
    assert!(req.messages.is_empty());
    assert!(req.tools.is_none());
    assert_eq!(req.max_tokens, Some(8192));
    assert!(req.temperature.is_none());
    assert!(req.system.is_none());
}

// ===========================================================================
// LlmContent
// ===========================================================================

#[test]
fn llm_content_from_string() {
    let c: LlmContent = "hello".into();
    match c {
        LlmContent::Text(s) => assert_eq!(s, "hello"),
        _ => panic!("Expected Text"),
    }
}

#[test]
fn llm_content_text_serde() {
    let c = LlmContent::Text("hello".into());
    let json = serde_json::to_string(&c).unwrap();
    assert_eq!(json, r#""hello""#);
}

#[test]
fn llm_content_blocks_serde() {
    let c = LlmContent::Blocks(vec![ContentBlock::Text { text: "hi".into() }]);
    let json = serde_json::to_string(&c).unwrap();
    assert!(json.contains(r#""type":"text""#));
    let back: LlmContent = serde_json::from_str(&json).unwrap();
    match back {
        LlmContent::Blocks(blocks) => assert_eq!(blocks.len(), 1),
        _ => panic!("Expected Blocks"),
    }
}

// ===========================================================================
// ContentBlock
// ===========================================================================

#[test]
fn content_block_tool_use_serde() {
    let b = ContentBlock::ToolUse {
        id: "tc-1".into(),
        name: "read".into(),
        input: serde_json::json!({"path": "/tmp/foo"}),
    };
    let json = serde_json::to_string(&b).unwrap();
    assert!(json.contains(r#""type":"tool_use""#));
}

#[test]
fn content_block_tool_result_no_error_skipped() {
    let b = ContentBlock::ToolResult {
        tool_use_id: "tc-1".into(),
        content: "ok".into(),
        is_error: None,
    };
    let json = serde_json::to_string(&b).unwrap();
    assert!(!json.contains("is_error"));
}

// ===========================================================================
// AccumulatedToolCall
// ===========================================================================

#[test]
fn accumulated_tool_call_parse_valid() {
    let tc = AccumulatedToolCall {
        id: "tc-1".into(),
        name: "read".into(),
        arguments: r#"{"path":"/tmp/foo"}"#.into(),
    };
    let parsed = tc.parse_arguments().unwrap();
    assert_eq!(parsed["path"], "/tmp/foo");
}

#[test]
fn accumulated_tool_call_parse_invalid() {
    let tc = AccumulatedToolCall {
        id: "tc-1".into(),
        name: "read".into(),
        arguments: "not json".into(),
    };
    assert!(tc.parse_arguments().is_err());
}

// ===========================================================================
// ModelSpec
// ===========================================================================

#[test]
fn model_spec_has_tag() {
    let spec = ModelSpec::new("claude-haiku-4-5-20251001", &["slug-backup"]);
    assert!(spec.has_tag("slug-backup"));
    assert!(!spec.has_tag("slug"));
}

// ===========================================================================
// AnthropicProvider — shape only, no network
// ===========================================================================

#[test]
fn anthropic_provider_supports_model() {
    let provider = AnthropicProvider::new("fake");
    assert!(provider.supports_model("claude-haiku-4-5-20251001"));
    assert!(!provider.supports_model("gpt-4"));
}

#[tokio::test]
async fn anthropic_provider_honors_a_pre_cancelled_token() {
    let provider = AnthropicProvider::new("fake-key-never-sent");
    let cancel = CancellationToken::new();
    cancel.cancel();

    let request = LlmRequest {
        model: "claude-haiku-4-5-20251001".into(),
        messages: vec![LlmMessage {
            role: "user".into(),
            content: LlmContent::Text("hello".into()),
        }],
        max_tokens: Some(16),
        ..Default::default()
    };

    // A pre-cancelled token must short-circuit before any request is sent.
    let result = provider.complete_stream(request, cancel).await;
    assert!(result.is_err());
}

// ===========================================================================
// LlmRegistry — model-tier fallback support for the slug allocator
// ===========================================================================

struct FakeProvider {
    label: &'static str,
    specs: Vec<ModelSpec>,
}

#[async_trait::async_trait]
impl LlmProvider for FakeProvider {
    fn name(&self) -> &str {
        self.label
    }

    fn model_specs(&self) -> &[ModelSpec] {
        &self.specs
    }

    async fn complete_stream(
        &self,
        _request: LlmRequest,
        _cancel: CancellationToken,
    ) -> LlmResult<LlmStream> {
        unimplemented!("not exercised by registry tests")
    }
}

#[test]
fn registry_lists_tagged_models_in_registration_order() {
    let mut registry = LlmRegistry::new();
    registry.register(Arc::new(FakeProvider {
        label: "primary",
        specs: vec![
            ModelSpec::new("model-a", &["slug"]),
            ModelSpec::new("model-b", &["slug-backup"]),
        ],
    }));
    registry.register(Arc::new(FakeProvider {
        label: "secondary",
        specs: vec![ModelSpec::new("model-c", &["slug"])],
    }));

    let tagged: Vec<String> = registry
        .models_tagged("slug")
        .into_iter()
        .map(|(_, id)| id)
        .collect();
    assert_eq!(tagged, vec!["model-a".to_string(), "model-c".to_string()]);
}

#[test]
fn registry_finds_provider_for_model() {
    let mut registry = LlmRegistry::new();
    registry.register(Arc::new(FakeProvider {
        label: "primary",
        specs: vec![ModelSpec::new("model-a", &["slug"])],
    }));
    assert!(registry.provider_for_model("model-a").is_some());
    assert!(registry.provider_for_model("nonexistent").is_none());
}
