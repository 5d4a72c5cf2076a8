//! A small provider registry used by the slug allocator's model-tier
//! fallback (spec §4.G): given a tag, list the models that carry it, in
//! registration order, across every configured provider.

use crate::provider::LlmProvider;
use std::sync::Arc;

pub struct LlmRegistry {
    providers: Vec<Arc<dyn LlmProvider>>,
}

impl LlmRegistry {
    pub fn new() -> Self {
        Self { providers: Vec::new() }
    }

    pub fn register(&mut self, provider: Arc<dyn LlmProvider>) {
        self.providers.push(provider);
    }

    pub fn provider_for_model(&self, model_id: &str) -> Option<Arc<dyn LlmProvider>> {
        self.providers
            .iter()
            .find(|p| p.supports_model(model_id))
            .cloned()
    }

    /// Models tagged `tag`, paired with the provider that hosts them, in
    /// provider-then-model registration order.
    pub fn models_tagged(&self, tag: &str) -> Vec<(Arc<dyn LlmProvider>, String)> {
        let mut out = Vec::new();
        for provider in &self.providers {
            for spec in provider.model_specs() {
                if spec.has_tag(tag) {
                    out.push((provider.clone(), spec.id.clone()));
                }
            }
        }
        out
    }
}

impl Default for LlmRegistry {
    fn default() -> Self {
        Self::new()
    }
}
