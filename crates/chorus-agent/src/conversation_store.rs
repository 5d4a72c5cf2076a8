//! Conversation list read model (supplemental to spec §4.B/§4.F): the small
//! in-memory table of `Conversation` rows the Message Log's journal entries
//! hang off of. Lives alongside `LogStore` because every append touches it
//! (bumping `updated_at`), and the slug allocator needs its uniqueness check.

use chorus_core::{Conversation, ConversationId};
use dashmap::DashMap;

/// `DashMap`-backed table of conversation rows, keyed by id. Slug uniqueness
/// is enforced by a linear scan — fine at the scale a single gateway process
/// holds in memory; a SQL-backed store would use a unique index instead.
#[derive(Default)]
pub struct ConversationStore {
    rows: DashMap<ConversationId, Conversation>,
}

impl ConversationStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create(&self, id: ConversationId, cwd: Option<String>) -> Conversation {
        let conversation = Conversation::new(id, cwd);
        self.rows.insert(id, conversation.clone());
        conversation
    }

    pub fn get(&self, id: ConversationId) -> Option<Conversation> {
        self.rows.get(&id).map(|r| r.clone())
    }

    pub fn exists(&self, id: ConversationId) -> bool {
        self.rows.contains_key(&id)
    }

    /// Bumps `updated_at` to now. Called after every Message Log append.
    pub fn touch_activity(&self, id: ConversationId) {
        if let Some(mut row) = self.rows.get_mut(&id) {
            row.updated_at = chrono::Utc::now();
        }
    }

    pub fn sticky_model(&self, id: ConversationId) -> Option<String> {
        self.rows.get(&id).and_then(|r| r.model_id.clone())
    }

    /// Fixes the conversation's model on its first turn. No-op if already set
    /// (callers must check `sticky_model` first to detect a mismatch).
    pub fn set_sticky_model(&self, id: ConversationId, model_id: &str) {
        if let Some(mut row) = self.rows.get_mut(&id) {
            if row.model_id.is_none() {
                row.model_id = Some(model_id.to_string());
            }
        }
    }

    /// Attempts to set `slug`, failing (returning `false`) if another
    /// conversation already holds it. Does not touch `updated_at` — slug
    /// assignment is metadata, not conversation activity (spec §4.G).
    pub fn try_set_slug(&self, id: ConversationId, slug: &str) -> bool {
        let conflict = self
            .rows
            .iter()
            .any(|r| r.key() != &id && r.slug.as_deref() == Some(slug));
        if conflict {
            return false;
        }
        if let Some(mut row) = self.rows.get_mut(&id) {
            row.slug = Some(slug.to_string());
            true
        } else {
            false
        }
    }

    /// Archiving/unarchiving does not touch `updated_at` (spec §4.B: slug
    /// and archive mutations are metadata, not activity).
    pub fn archive(&self, id: ConversationId) {
        if let Some(mut row) = self.rows.get_mut(&id) {
            row.archived = true;
        }
    }

    pub fn unarchive(&self, id: ConversationId) {
        if let Some(mut row) = self.rows.get_mut(&id) {
            row.archived = false;
        }
    }

    pub fn remove(&self, id: ConversationId) -> Option<Conversation> {
        self.rows.remove(&id).map(|(_, v)| v)
    }

    pub fn list(&self, include_archived: bool) -> Vec<Conversation> {
        self.rows
            .iter()
            .filter(|r| include_archived || !r.archived)
            .map(|r| r.clone())
            .collect()
    }

    /// Idle conversations whose `updated_at` is older than `threshold`,
    /// for the coordinator's eviction sweep (spec §4.F).
    pub fn idle_since(&self, threshold: chrono::DateTime<chrono::Utc>) -> Vec<ConversationId> {
        self.rows
            .iter()
            .filter(|r| r.updated_at < threshold)
            .map(|r| *r.key())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slug_conflict_is_rejected_across_conversations() {
        let store = ConversationStore::new();
        let a = ConversationId::new();
        let b = ConversationId::new();
        store.create(a, None);
        store.create(b, None);

        assert!(store.try_set_slug(a, "fix-the-bug"));
        assert!(!store.try_set_slug(b, "fix-the-bug"));
        assert!(store.try_set_slug(b, "fix-the-bug-2"));
    }

    #[test]
    fn archive_does_not_change_updated_at() {
        let store = ConversationStore::new();
        let id = ConversationId::new();
        let created = store.create(id, None);
        store.archive(id);
        let row = store.get(id).unwrap();
        assert!(row.archived);
        assert_eq!(row.updated_at, created.updated_at);
    }

    #[test]
    fn sticky_model_is_fixed_on_first_set() {
        let store = ConversationStore::new();
        let id = ConversationId::new();
        store.create(id, None);
        assert_eq!(store.sticky_model(id), None);
        store.set_sticky_model(id, "model-a");
        store.set_sticky_model(id, "model-b");
        assert_eq!(store.sticky_model(id), Some("model-a".to_string()));
    }

    #[test]
    fn list_filters_archived_by_default() {
        let store = ConversationStore::new();
        let a = ConversationId::new();
        let b = ConversationId::new();
        store.create(a, None);
        store.create(b, None);
        store.archive(b);

        assert_eq!(store.list(false).len(), 1);
        assert_eq!(store.list(true).len(), 2);
    }
}
