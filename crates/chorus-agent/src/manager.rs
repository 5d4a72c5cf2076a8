//! Conversation Manager (spec §4.E): the per-conversation turn loop and its
//! cancellation. One instance owns one conversation's private bus, its
//! sticky model enforcement, and the single in-flight turn invariant.

use chorus_core::{
    AgentContentBlock, Bus, Conversation, ConversationId, ConversationListUpdate,
    ConversationSnapshot, Error, Message, MessageBody, Result, StreamSnapshot, ToolResultPayload,
    Usage as CoreUsage, agent_working,
};
use chorus_llm::{
    ContentBlock, LlmContent, LlmMessage, LlmProvider, LlmRequest, StreamDelta,
};
use chorus_tools::ToolRegistry;
use futures::StreamExt;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::conversation_store::ConversationStore;
use crate::log::{append_failure_message, LogStore};

/// Ceiling on tool-then-model round trips in a single turn. Guards against a
/// model that never stops calling tools; hit in practice only by a
/// misbehaving or adversarial model.
const MAX_TURN_STEPS: usize = 50;

/// Per-tool-call timeout. Independent per invocation, per spec §4.E's
/// "invoke in parallel ... with independent timeouts".
const TOOL_CALL_TIMEOUT: Duration = Duration::from_secs(120);

/// How long `CancelConversation` waits for the in-flight turn task to
/// observe cancellation and exit before giving up on joining it.
const CANCEL_JOIN_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Clone)]
pub struct ManagerConfig {
    pub system_prompt: Option<String>,
    pub max_tokens: u32,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            system_prompt: None,
            max_tokens: 8192,
        }
    }
}

struct TurnHandle {
    id: Uuid,
    cancel: CancellationToken,
    join: JoinHandle<()>,
}

/// Owns one conversation's turn loop. Constructed once per conversation
/// (usually by the Server Coordinator's `get_or_create_manager`) and kept
/// alive for as long as the conversation is active.
pub struct ConversationManager {
    conversation_id: ConversationId,
    log: Arc<dyn LogStore>,
    conversations: Arc<ConversationStore>,
    tools: Arc<ToolRegistry>,
    list_bus: Arc<Bus<ConversationListUpdate>>,
    config: ManagerConfig,

    /// Private per-conversation stream, subscribed to by SSE clients.
    bus: Bus<StreamSnapshot>,
    current_turn: AsyncMutex<Option<TurnHandle>>,
    closed: AtomicBool,
}

impl ConversationManager {
    /// Hydrates a manager from the log. If the tail shows a turn was
    /// in-flight when the process last stopped, synthesizes an `error` entry
    /// terminating it rather than attempting to resume — there is no
    /// in-flight LLM stream or tool process left to resume (decided open
    /// question, see DESIGN.md).
    pub async fn hydrate(
        conversation_id: ConversationId,
        log: Arc<dyn LogStore>,
        conversations: Arc<ConversationStore>,
        tools: Arc<ToolRegistry>,
        list_bus: Arc<Bus<ConversationListUpdate>>,
        config: ManagerConfig,
    ) -> Result<Arc<Self>> {
        let manager = Arc::new(Self {
            conversation_id,
            log,
            conversations,
            tools,
            list_bus,
            config,
            bus: Bus::new(),
            current_turn: AsyncMutex::new(None),
            closed: AtomicBool::new(false),
        });

        let messages = manager.log.list(conversation_id).await;
        if agent_working(&messages) {
            tracing::warn!(
                conversation_id = %conversation_id,
                "hydrating conversation with an in-flight-looking tail; terminating with a synthesized error"
            );
            let msg = manager
                .log
                .append(
                    conversation_id,
                    MessageBody::Error {
                        message: "turn interrupted by restart".to_string(),
                    },
                    None,
                    None,
                )
                .await?;
            manager.publish_append(msg).await;
        }

        Ok(manager)
    }

    pub fn conversation_id(&self) -> ConversationId {
        self.conversation_id
    }

    pub fn subscribe(&self, cancel: CancellationToken, since: i64) -> chorus_core::Subscription<StreamSnapshot> {
        self.bus.subscribe(cancel, since)
    }

    /// Accepts a user message and starts a turn, unless one is already in
    /// flight (`Error::TurnInProgress`) or `model_id` conflicts with the
    /// conversation's sticky model (`Error::ModelMismatch`).
    ///
    /// Returns `true` if this was the conversation's first message — the
    /// caller (coordinator) uses that to fire slug allocation exactly once.
    pub async fn accept_user_message(
        self: &Arc<Self>,
        llm: Arc<dyn LlmProvider>,
        model_id: &str,
        text: &str,
    ) -> Result<bool> {
        let mut turn_guard = self.current_turn.lock().await;
        if turn_guard.is_some() {
            return Err(Error::TurnInProgress(self.conversation_id.to_string()));
        }

        match self.conversations.sticky_model(self.conversation_id) {
            Some(sticky) if sticky != model_id => {
                return Err(Error::model_mismatch(
                    self.conversation_id.to_string(),
                    sticky,
                    model_id.to_string(),
                ));
            }
            Some(_) => {}
            None => self.conversations.set_sticky_model(self.conversation_id, model_id),
        }

        let existing = self.log.list(self.conversation_id).await;
        let is_first_message = existing.is_empty();

        let msg = self
            .log
            .append(self.conversation_id, MessageBody::User { text: text.to_string() }, None, None)
            .await?;
        self.publish_append(msg).await;

        let cancel = CancellationToken::new();
        let turn_id = Uuid::new_v4();
        let this = self.clone();
        let model = model_id.to_string();
        let turn_cancel = cancel.clone();
        let join = tokio::spawn(async move {
            this.run_turn(turn_cancel.clone(), model, llm).await;
            let mut guard = this.current_turn.lock().await;
            if matches!(&*guard, Some(h) if h.id == turn_id) {
                *guard = None;
            }
        });

        *turn_guard = Some(TurnHandle { id: turn_id, cancel, join });
        Ok(is_first_message)
    }

    /// Cancels the in-flight turn (if any), waits a bounded time for it to
    /// exit, and records an `error` tail noting the cancellation.
    pub async fn cancel_conversation(self: &Arc<Self>) -> Result<()> {
        let turn = self.current_turn.lock().await.take();
        if let Some(turn) = turn {
            turn.cancel.cancel();
            let _ = tokio::time::timeout(CANCEL_JOIN_TIMEOUT, turn.join).await;
        } else {
            return Ok(());
        }

        let msg = self
            .log
            .append(
                self.conversation_id,
                MessageBody::Error {
                    message: "turn cancelled by user".to_string(),
                },
                None,
                None,
            )
            .await?;
        self.publish_append(msg).await;
        Ok(())
    }

    /// Touches `updated_at` without appending anything — used by the
    /// coordinator's idle-keepalive path, distinct from message activity.
    pub fn touch(&self) {
        self.conversations.touch_activity(self.conversation_id);
    }

    /// Stops the turn loop without recording a cancellation entry — used
    /// when the coordinator is evicting this manager, not when a user asked
    /// to cancel. The turn's own error-entry-on-cancel path still fires in
    /// `cancel_conversation`; this is a quieter shutdown for eviction.
    pub async fn stop_loop(&self) {
        self.closed.store(true, Ordering::SeqCst);
        if let Some(turn) = self.current_turn.lock().await.take() {
            turn.cancel.cancel();
            let _ = tokio::time::timeout(CANCEL_JOIN_TIMEOUT, turn.join).await;
        }
    }

    async fn publish_append(&self, msg: Message) {
        self.conversations.touch_activity(self.conversation_id);
        let conversation = match self.conversations.get(self.conversation_id) {
            Some(c) => c,
            None => return,
        };
        let messages = self.log.list(self.conversation_id).await;
        let working = agent_working(&messages);
        let snapshot = ConversationSnapshot::from(&conversation);
        let list_update = ConversationListUpdate::Update { conversation: snapshot.clone() };
        let stream_snapshot = StreamSnapshot::for_append(msg, snapshot, working).with_list_update(list_update.clone());
        self.bus.publish(stream_snapshot.messages[0].sequence_id as i64, stream_snapshot);
        self.list_bus.broadcast(list_update);
    }

    async fn run_turn(self: Arc<Self>, cancel: CancellationToken, model_id: String, llm: Arc<dyn LlmProvider>) {
        for _ in 0..MAX_TURN_STEPS {
            if cancel.is_cancelled() {
                return;
            }

            let history = self.log.list(self.conversation_id).await;
            let request = LlmRequest {
                model: model_id.clone(),
                messages: to_llm_messages(&history),
                tools: Some(self.tools.get_definitions()),
                max_tokens: Some(self.config.max_tokens),
                temperature: None,
                system: self.system_prompt(),
            };

            let stream = match llm.complete_stream(request, cancel.clone()).await {
                Ok(s) => s,
                Err(e) => {
                    self.append_turn_error(Error::llm_error("unknown", e.to_string()).llm_turn_message())
                        .await;
                    return;
                }
            };

            let outcome = consume_stream(stream).await;
            let outcome = match outcome {
                Ok(o) => o,
                Err(message) => {
                    self.append_turn_error(message).await;
                    return;
                }
            };

            if cancel.is_cancelled() {
                return;
            }

            let end_of_turn = outcome.tool_calls.is_empty();
            let mut content = Vec::new();
            if !outcome.text.is_empty() {
                content.push(AgentContentBlock::Text { text: outcome.text.clone() });
            }
            for call in &outcome.tool_calls {
                content.push(AgentContentBlock::ToolUse {
                    id: call.id.clone(),
                    tool_name: call.name.clone(),
                    input: call.input.clone(),
                });
            }

            let usage = outcome.usage.map(|u| CoreUsage {
                input_tokens: u.input_tokens,
                output_tokens: u.output_tokens,
                context_window_tokens: u.input_tokens + u.output_tokens,
            });

            let append = self
                .log
                .append(
                    self.conversation_id,
                    MessageBody::Agent { content, end_of_turn },
                    usage,
                    None,
                )
                .await;
            let msg = match append {
                Ok(m) => m,
                Err(e) => {
                    tracing::error!(error = %e, "failed to append agent entry");
                    self.append_turn_error(append_failure_message(&e)).await;
                    return;
                }
            };
            self.publish_append(msg).await;

            if end_of_turn {
                return;
            }

            let results = self.dispatch_tools(&outcome.tool_calls, cancel.clone()).await;
            let append = self
                .log
                .append(self.conversation_id, MessageBody::Tool { results }, None, None)
                .await;
            match append {
                Ok(m) => self.publish_append(m).await,
                Err(e) => {
                    tracing::error!(error = %e, "failed to append tool entry");
                    self.append_turn_error(append_failure_message(&e)).await;
                    return;
                }
            }
        }

        self.append_turn_error("turn exceeded the maximum number of tool steps".to_string())
            .await;
    }

    async fn dispatch_tools(
        &self,
        calls: &[ParsedToolCall],
        cancel: CancellationToken,
    ) -> Vec<ToolResultPayload> {
        let futures = calls.iter().map(|call| {
            let tools = self.tools.clone();
            let cancel = cancel.clone();
            let call = call.clone();
            async move {
                let result = tokio::time::timeout(
                    TOOL_CALL_TIMEOUT,
                    tools.execute_cancellable(&call.name, call.input.clone(), cancel),
                )
                .await;
                match result {
                    Ok(tool_result) => {
                        let (content, display, is_error) = tool_result.into_parts();
                        ToolResultPayload {
                            tool_use_id: call.id.clone(),
                            content,
                            display,
                            is_error,
                        }
                    }
                    Err(_) => ToolResultPayload::text(
                        call.id.clone(),
                        format!("tool '{}' timed out after {:?}", call.name, TOOL_CALL_TIMEOUT),
                        true,
                    ),
                }
            }
        });
        futures::future::join_all(futures).await
    }

    async fn append_turn_error(&self, message: String) {
        match self
            .log
            .append(self.conversation_id, MessageBody::Error { message }, None, None)
            .await
        {
            Ok(m) => self.publish_append(m).await,
            Err(e) => tracing::error!(error = %e, "failed to append turn-error entry"),
        }
    }

    fn system_prompt(&self) -> Option<String> {
        let tool_prompts = self.tools.combined_prompts();
        match (&self.config.system_prompt, tool_prompts.is_empty()) {
            (Some(base), true) => Some(base.clone()),
            (Some(base), false) => Some(format!("{base}\n\n{tool_prompts}")),
            (None, true) => None,
            (None, false) => Some(tool_prompts),
        }
    }
}

#[derive(Clone)]
struct ParsedToolCall {
    id: String,
    name: String,
    input: serde_json::Value,
}

struct TurnOutcome {
    text: String,
    tool_calls: Vec<ParsedToolCall>,
    usage: Option<chorus_llm::Usage>,
}

/// Drains a provider's stream into one turn's worth of content, accumulating
/// tool-call argument fragments by id as they're delivered.
async fn consume_stream(mut stream: chorus_llm::LlmStream) -> std::result::Result<TurnOutcome, String> {
    let mut text = String::new();
    let mut order: Vec<String> = Vec::new();
    let mut calls: HashMap<String, chorus_llm::AccumulatedToolCall> = HashMap::new();
    let mut usage = None;

    while let Some(delta) = stream.next().await {
        match delta {
            Ok(StreamDelta::Text(chunk)) => text.push_str(&chunk),
            Ok(StreamDelta::Thinking(_)) => {}
            Ok(StreamDelta::ToolCallStart { id, name }) => {
                order.push(id.clone());
                calls.insert(id.clone(), chorus_llm::AccumulatedToolCall { id, name, arguments: String::new() });
            }
            Ok(StreamDelta::ToolCallDelta { id, arguments }) => {
                if let Some(call) = calls.get_mut(&id) {
                    call.arguments.push_str(&arguments);
                }
            }
            Ok(StreamDelta::ToolCallEnd { .. }) => {}
            Ok(StreamDelta::Done { usage: u, .. }) => {
                usage = u;
                break;
            }
            Ok(StreamDelta::Error(message)) => return Err(format!("LLM request failed: {message}")),
            Err(e) => return Err(format!("LLM request failed: {e}")),
        }
    }

    let mut tool_calls = Vec::with_capacity(order.len());
    for id in order {
        if let Some(call) = calls.remove(&id) {
            let input = call.parse_arguments().unwrap_or(serde_json::Value::Object(Default::default()));
            tool_calls.push(ParsedToolCall { id: call.id, name: call.name, input });
        }
    }

    Ok(TurnOutcome { text, tool_calls, usage })
}

/// Replays the log into the wire format the LLM provider expects. `error`
/// and `gitinfo` entries carry no role an LLM understands, so they're
/// skipped — they stay in the durable log for observers, just not replayed.
fn to_llm_messages(messages: &[Message]) -> Vec<LlmMessage> {
    let mut out = Vec::with_capacity(messages.len());
    for message in messages {
        match &message.body {
            MessageBody::User { text } => out.push(LlmMessage {
                role: "user".to_string(),
                content: LlmContent::Text(text.clone()),
            }),
            MessageBody::Agent { content, .. } => {
                let blocks = content
                    .iter()
                    .map(|b| match b {
                        AgentContentBlock::Text { text } => ContentBlock::Text { text: text.clone() },
                        AgentContentBlock::ToolUse { id, tool_name, input } => ContentBlock::ToolUse {
                            id: id.clone(),
                            name: tool_name.clone(),
                            input: input.clone(),
                        },
                    })
                    .collect();
                out.push(LlmMessage { role: "assistant".to_string(), content: LlmContent::Blocks(blocks) });
            }
            MessageBody::Tool { results } => {
                let blocks = results
                    .iter()
                    .map(|r| ContentBlock::ToolResult {
                        tool_use_id: r.tool_use_id.clone(),
                        content: flatten_content(&r.content),
                        is_error: if r.is_error { Some(true) } else { None },
                    })
                    .collect();
                out.push(LlmMessage { role: "user".to_string(), content: LlmContent::Blocks(blocks) });
            }
            MessageBody::Error { .. } | MessageBody::Gitinfo { .. } => {}
        }
    }
    out
}

fn flatten_content(parts: &[chorus_core::ContentPart]) -> String {
    parts
        .iter()
        .map(|p| match p {
            chorus_core::ContentPart::Text { text } => text.clone(),
            chorus_core::ContentPart::Media { media_type, .. } => format!("<{media_type} data>"),
        })
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::log::InMemoryLogStore;
    use async_trait::async_trait;
    use chorus_llm::{LlmError, LlmResult, ModelSpec};
    use std::pin::Pin;
    use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};

    /// Replies once with plain text and `end_turn`, no tool calls.
    struct EchoProvider {
        specs: Vec<ModelSpec>,
    }

    #[async_trait]
    impl LlmProvider for EchoProvider {
        fn name(&self) -> &str {
            "echo"
        }
        fn model_specs(&self) -> &[ModelSpec] {
            &self.specs
        }
        async fn complete_stream(
            &self,
            _request: LlmRequest,
            _cancel: CancellationToken,
        ) -> LlmResult<chorus_llm::LlmStream> {
            let deltas = vec![
                Ok(StreamDelta::Text("hello back".to_string())),
                Ok(StreamDelta::Done {
                    stop_reason: Some("end_turn".to_string()),
                    usage: Some(chorus_llm::Usage { input_tokens: 3, output_tokens: 2 }),
                }),
            ];
            Ok(Box::pin(futures::stream::iter(deltas)))
        }
    }

    /// Calls `noop` once, then replies with text and ends the turn.
    struct ToolThenDoneProvider {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl LlmProvider for ToolThenDoneProvider {
        fn name(&self) -> &str {
            "tool-then-done"
        }
        fn model_specs(&self) -> &[ModelSpec] {
            static SPECS: std::sync::OnceLock<Vec<ModelSpec>> = std::sync::OnceLock::new();
            SPECS.get_or_init(|| vec![ModelSpec::new("test-model", &[])])
        }
        async fn complete_stream(
            &self,
            _request: LlmRequest,
            _cancel: CancellationToken,
        ) -> LlmResult<chorus_llm::LlmStream> {
            let n = self.calls.fetch_add(1, AtomicOrdering::SeqCst);
            let deltas: Vec<LlmResult<StreamDelta>> = if n == 0 {
                vec![
                    Ok(StreamDelta::ToolCallStart { id: "tu-1".to_string(), name: "noop".to_string() }),
                    Ok(StreamDelta::ToolCallDelta { id: "tu-1".to_string(), arguments: "{}".to_string() }),
                    Ok(StreamDelta::ToolCallEnd { id: "tu-1".to_string() }),
                    Ok(StreamDelta::Done { stop_reason: Some("tool_use".to_string()), usage: None }),
                ]
            } else {
                vec![
                    Ok(StreamDelta::Text("done".to_string())),
                    Ok(StreamDelta::Done { stop_reason: Some("end_turn".to_string()), usage: None }),
                ]
            };
            Ok(Box::pin(futures::stream::iter(deltas)))
        }
    }

    struct NoopTool;

    #[async_trait]
    impl chorus_tools::Tool for NoopTool {
        fn name(&self) -> &str {
            "noop"
        }
        fn description(&self) -> &str {
            "does nothing"
        }
        fn input_schema(&self) -> serde_json::Value {
            serde_json::json!({"type": "object"})
        }
        async fn execute(&self, _args: serde_json::Value) -> chorus_tools::ToolResult {
            chorus_tools::ToolResult::text("ok")
        }
    }

    fn registry() -> Arc<ToolRegistry> {
        let mut r = ToolRegistry::new();
        r.register(NoopTool);
        Arc::new(r)
    }

    #[tokio::test]
    async fn single_turn_ends_with_no_tool_calls() {
        let id = ConversationId::new();
        let log: Arc<dyn LogStore> = Arc::new(InMemoryLogStore::new());
        let conversations = Arc::new(ConversationStore::new());
        conversations.create(id, None);
        let list_bus = Arc::new(Bus::new());
        let manager = ConversationManager::hydrate(
            id,
            log.clone(),
            conversations.clone(),
            registry(),
            list_bus,
            ManagerConfig::default(),
        )
        .await
        .unwrap();

        let llm: Arc<dyn LlmProvider> = Arc::new(EchoProvider { specs: vec![ModelSpec::new("test-model", &[])] });
        let is_first = manager.accept_user_message(llm, "test-model", "hi").await.unwrap();
        assert!(is_first);

        // Give the spawned turn a moment to run to completion.
        for _ in 0..50 {
            let msgs = log.list(id).await;
            if msgs.iter().any(|m| m.is_final_agent_turn()) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        let msgs = log.list(id).await;
        assert_eq!(msgs.len(), 2);
        assert!(!agent_working(&msgs));
    }

    #[tokio::test]
    async fn second_model_id_on_same_conversation_is_rejected() {
        let id = ConversationId::new();
        let log: Arc<dyn LogStore> = Arc::new(InMemoryLogStore::new());
        let conversations = Arc::new(ConversationStore::new());
        conversations.create(id, None);
        let list_bus = Arc::new(Bus::new());
        let manager = ConversationManager::hydrate(
            id,
            log.clone(),
            conversations.clone(),
            registry(),
            list_bus,
            ManagerConfig::default(),
        )
        .await
        .unwrap();

        let llm: Arc<dyn LlmProvider> = Arc::new(EchoProvider { specs: vec![ModelSpec::new("model-a", &[])] });
        manager.accept_user_message(llm.clone(), "model-a", "hi").await.unwrap();

        for _ in 0..50 {
            if !manager.current_turn.lock().await.is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        let err = manager.accept_user_message(llm, "model-b", "hi again").await.unwrap_err();
        assert!(matches!(err, Error::ModelMismatch { .. }));
    }

    #[tokio::test]
    async fn tool_call_round_trip_then_end_of_turn() {
        let id = ConversationId::new();
        let log: Arc<dyn LogStore> = Arc::new(InMemoryLogStore::new());
        let conversations = Arc::new(ConversationStore::new());
        conversations.create(id, None);
        let list_bus = Arc::new(Bus::new());
        let manager = ConversationManager::hydrate(
            id,
            log.clone(),
            conversations.clone(),
            registry(),
            list_bus,
            ManagerConfig::default(),
        )
        .await
        .unwrap();

        let llm: Arc<dyn LlmProvider> = Arc::new(ToolThenDoneProvider { calls: AtomicUsize::new(0) });
        manager.accept_user_message(llm, "test-model", "use the tool").await.unwrap();

        for _ in 0..100 {
            let msgs = log.list(id).await;
            if msgs.iter().any(|m| m.is_final_agent_turn()) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        let msgs = log.list(id).await;
        // user, agent(tool_use), tool(result), agent(final)
        assert_eq!(msgs.len(), 4);
        assert!(matches!(msgs[2].body, MessageBody::Tool { .. }));
        assert!(msgs[3].is_final_agent_turn());
    }

    #[tokio::test]
    async fn hydrate_on_mid_turn_tail_synthesizes_cancellation() {
        let id = ConversationId::new();
        let log: Arc<dyn LogStore> = Arc::new(InMemoryLogStore::new());
        log.append(id, MessageBody::User { text: "hi".to_string() }, None, None).await.unwrap();
        log.append(
            id,
            MessageBody::Agent { content: vec![AgentContentBlock::Text { text: "thinking".into() }], end_of_turn: false },
            None,
            None,
        )
        .await
        .unwrap();

        let conversations = Arc::new(ConversationStore::new());
        conversations.create(id, None);
        let list_bus = Arc::new(Bus::new());
        ConversationManager::hydrate(id, log.clone(), conversations, registry(), list_bus, ManagerConfig::default())
            .await
            .unwrap();

        let msgs = log.list(id).await;
        assert_eq!(msgs.len(), 3);
        assert!(matches!(msgs[2].body, MessageBody::Error { .. }));
        assert!(!agent_working(&msgs));
    }
}
