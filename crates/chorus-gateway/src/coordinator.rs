//! Server Coordinator (spec §4.F): owns the `conversation_id -> Manager` map,
//! lazily hydrating managers on first access, relaying append activity onto
//! the process-wide conversation-list bus, and periodically evicting idle
//! managers.

use chorus_agent::{ConversationManager, ConversationStore, InMemoryLogStore, LogStore, ManagerConfig, SlugAllocator};
use chorus_core::config::EvictionConfig;
use chorus_core::{Bus, Conversation, ConversationId, ConversationListUpdate, ConversationSnapshot, Error, Result, Subscription};
use chorus_llm::{LlmProvider, LlmRegistry};
use chorus_tools::ToolRegistry;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

pub struct Coordinator {
    managers: DashMap<ConversationId, Arc<ConversationManager>>,
    conversations: Arc<ConversationStore>,
    log: Arc<dyn LogStore>,
    tools: Arc<ToolRegistry>,
    llm_registry: Arc<LlmRegistry>,
    slug_allocator: SlugAllocator,
    list_bus: Arc<Bus<ConversationListUpdate>>,
    manager_config: ManagerConfig,
    eviction: EvictionConfig,
    /// Serializes the check-then-create sequence in `get_or_create_manager`
    /// so concurrent first callers for the same (or different) conversation
    /// never construct two managers. Coarse — one lock for the whole
    /// coordinator rather than per-conversation — but correct, and simple
    /// enough to be worth the contention at this scale (see DESIGN.md).
    creation_lock: tokio::sync::Mutex<()>,
}

impl Coordinator {
    pub fn new(
        tools: Arc<ToolRegistry>,
        llm_registry: Arc<LlmRegistry>,
        manager_config: ManagerConfig,
        eviction: EvictionConfig,
    ) -> Arc<Self> {
        let conversations = Arc::new(ConversationStore::new());
        let slug_allocator = SlugAllocator::new(llm_registry.clone(), conversations.clone());
        Arc::new(Self {
            managers: DashMap::new(),
            conversations,
            log: Arc::new(InMemoryLogStore::new()),
            tools,
            llm_registry,
            slug_allocator,
            list_bus: Arc::new(Bus::new()),
            manager_config,
            eviction,
            creation_lock: tokio::sync::Mutex::new(()),
        })
    }

    /// Spawns the periodic eviction sweep (spec §4.F). Runs until the
    /// returned handle is dropped or the process exits.
    pub fn spawn_eviction_sweep(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let this = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(this.eviction.sweep_interval);
            loop {
                interval.tick().await;
                this.run_eviction_sweep().await;
            }
        })
    }

    async fn run_eviction_sweep(&self) {
        let threshold = chrono::Utc::now() - chrono::Duration::from_std(self.eviction.idle_threshold).unwrap_or_default();
        let idle = self.conversations.idle_since(threshold);
        for id in idle {
            if let Some((_, manager)) = self.managers.remove(&id) {
                tracing::info!(conversation_id = %id, "evicting idle conversation manager");
                manager.stop_loop().await;
            }
        }
    }

    pub fn conversations(&self) -> &Arc<ConversationStore> {
        &self.conversations
    }

    pub fn subscribe_list(&self, cancel: CancellationToken) -> Subscription<ConversationListUpdate> {
        self.list_bus.subscribe(cancel, -1)
    }

    pub fn create_conversation(self: &Arc<Self>, cwd: Option<String>) -> ConversationSnapshot {
        let id = ConversationId::new();
        let conversation = self.conversations.create(id, cwd);
        let snapshot = ConversationSnapshot::from(&conversation);
        self.list_bus.broadcast(ConversationListUpdate::Update { conversation: snapshot.clone() });
        snapshot
    }

    /// Returns the manager for `id`, hydrating it from the Message Log on
    /// first access since this coordinator started (or since it was last
    /// evicted). Singleflight: concurrent first-callers share one hydrate.
    pub async fn get_or_create_manager(self: &Arc<Self>, id: ConversationId) -> Result<Arc<ConversationManager>> {
        if let Some(manager) = self.managers.get(&id) {
            return Ok(manager.clone());
        }
        let _guard = self.creation_lock.lock().await;
        if let Some(manager) = self.managers.get(&id) {
            return Ok(manager.clone());
        }
        if !self.conversations.exists(id) {
            return Err(Error::ConversationNotFound(id.to_string()));
        }
        let manager = ConversationManager::hydrate(
            id,
            self.log.clone(),
            self.conversations.clone(),
            self.tools.clone(),
            self.list_bus.clone(),
            self.manager_config.clone(),
        )
        .await?;
        self.managers.insert(id, manager.clone());
        Ok(manager)
    }

    /// Accepts a message for `id`, resolving `model_id` to a provider via the
    /// LLM registry. On success, fires slug allocation in the background
    /// exactly once, the first time a conversation receives a message.
    pub async fn post_message(self: &Arc<Self>, id: ConversationId, model_id: &str, text: &str) -> Result<()> {
        let provider = self
            .llm_registry
            .provider_for_model(model_id)
            .ok_or_else(|| Error::LlmError { provider: "unknown".to_string(), message: format!("no provider registered for model {model_id}") })?;
        let manager = self.get_or_create_manager(id).await?;
        let is_first = manager.accept_user_message(provider, model_id, text).await?;

        if is_first {
            let this = self.clone();
            let model_id = model_id.to_string();
            let text = text.to_string();
            tokio::spawn(async move {
                match this.slug_allocator.assign_slug(id, &model_id, &text).await {
                    Ok(slug) => {
                        if let Some(conversation) = this.conversations.get(id) {
                            this.list_bus.broadcast(ConversationListUpdate::Update {
                                conversation: ConversationSnapshot::from(&conversation),
                            });
                        }
                        tracing::debug!(conversation_id = %id, slug, "assigned conversation slug");
                    }
                    Err(e) => tracing::warn!(conversation_id = %id, error = %e, "slug allocation failed"),
                }
            });
        }
        Ok(())
    }

    pub async fn cancel(self: &Arc<Self>, id: ConversationId) -> Result<()> {
        let manager = self.get_or_create_manager(id).await?;
        manager.cancel_conversation().await
    }

    pub fn archive(&self, id: ConversationId) -> Result<()> {
        if !self.conversations.exists(id) {
            return Err(Error::ConversationNotFound(id.to_string()));
        }
        self.conversations.archive(id);
        self.broadcast_current(id);
        Ok(())
    }

    pub fn unarchive(&self, id: ConversationId) -> Result<()> {
        if !self.conversations.exists(id) {
            return Err(Error::ConversationNotFound(id.to_string()));
        }
        self.conversations.unarchive(id);
        self.broadcast_current(id);
        Ok(())
    }

    /// Manually (not LLM-) assigns a slug, e.g. via the rename endpoint.
    pub fn set_slug(&self, id: ConversationId, slug: &str) -> Result<()> {
        if !self.conversations.exists(id) {
            return Err(Error::ConversationNotFound(id.to_string()));
        }
        let sanitized = chorus_agent::sanitize(slug);
        if sanitized.is_empty() {
            return Err(Error::InvalidMessage("slug is empty after sanitization".to_string()));
        }
        if !self.conversations.try_set_slug(id, &sanitized) {
            return Err(Error::InvalidMessage(format!("slug '{sanitized}' is already in use")));
        }
        self.broadcast_current(id);
        Ok(())
    }

    fn broadcast_current(&self, id: ConversationId) {
        if let Some(conversation) = self.conversations.get(id) {
            self.list_bus
                .broadcast(ConversationListUpdate::Update { conversation: ConversationSnapshot::from(&conversation) });
        }
    }

    pub fn get(&self, id: ConversationId) -> Option<Conversation> {
        self.conversations.get(id)
    }

    pub fn list(&self, include_archived: bool) -> Vec<Conversation> {
        self.conversations.list(include_archived)
    }

    /// Removes a conversation's row and log entirely. Refuses while a
    /// manager is live for it — a conversation is never hard-deleted out
    /// from under an active turn loop (spec §4.F).
    pub fn delete(&self, id: ConversationId) -> Result<()> {
        if self.managers.contains_key(&id) {
            return Err(Error::TurnInProgress(id.to_string()));
        }
        match self.conversations.remove(id) {
            Some(_) => {
                self.list_bus.broadcast(ConversationListUpdate::Delete { conversation_id: id });
                Ok(())
            }
            None => Err(Error::ConversationNotFound(id.to_string())),
        }
    }
}
