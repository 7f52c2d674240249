//! In-memory store: an arena of messages per conversation, keyed by id.
//!
//! Serves as the dev-mode store when no `DATABASE_URL` is configured and as
//! the test double. Mutations take the write lock for their whole unit, which
//! gives `append_and_advance` the same all-or-nothing behavior the Postgres
//! store gets from a transaction.

use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;
use chrono::Utc;

use crate::db::store::{ChatStore, HeadAdvance};
use crate::errors::AppError;
use crate::models::{Branch, Conversation, Message};

#[derive(Default)]
pub struct MemoryStore {
    inner: RwLock<HashMap<String, ConversationState>>,
}

struct ConversationState {
    conversation: Conversation,
    /// Append-only; tree structure lives in the parent ids.
    messages: Vec<Message>,
    branches: HashMap<String, Branch>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ConversationState {
    fn message(&self, id: &str) -> Option<&Message> {
        self.messages.iter().find(|m| m.id == id)
    }

    fn message_mut(&mut self, id: &str) -> Option<&mut Message> {
        self.messages.iter_mut().find(|m| m.id == id)
    }

    /// Shared validation for both advance flavors.
    fn checked_branch(&self, name: &str, expected_version: i64) -> Result<&Branch, AppError> {
        let branch = self
            .branches
            .get(name)
            .ok_or_else(|| AppError::BranchNotFound { name: name.to_string() })?;
        if branch.version != expected_version {
            return Err(AppError::VersionConflict {
                branch: name.to_string(),
                expected: expected_version,
            });
        }
        Ok(branch)
    }

    fn move_head(&mut self, name: &str, new_head: String) {
        let now = Utc::now();
        let branch = self.branches.get_mut(name).expect("branch checked above");
        branch.head_message_id = Some(new_head);
        branch.version += 1;
        branch.updated_at = now;
        self.conversation.updated_at = now;
    }
}

fn lock_poisoned() -> AppError {
    AppError::Unexpected("memory store lock poisoned".to_string())
}

#[async_trait]
impl ChatStore for MemoryStore {
    async fn create_conversation(&self, conversation: &Conversation) -> Result<(), AppError> {
        let mut inner = self.inner.write().map_err(|_| lock_poisoned())?;
        if inner.contains_key(&conversation.id) {
            return Err(AppError::Unexpected(format!(
                "conversation '{}' already exists",
                conversation.id
            )));
        }
        let default_branch = Branch::new(
            conversation.id.clone(),
            conversation.active_branch.clone(),
            None,
            None,
        );
        inner.insert(
            conversation.id.clone(),
            ConversationState {
                conversation: conversation.clone(),
                messages: Vec::new(),
                branches: HashMap::from([(default_branch.name.clone(), default_branch)]),
            },
        );
        Ok(())
    }

    async fn find_conversation(&self, id: &str) -> Result<Option<Conversation>, AppError> {
        let inner = self.inner.read().map_err(|_| lock_poisoned())?;
        Ok(inner.get(id).map(|s| s.conversation.clone()))
    }

    async fn list_conversations(&self) -> Result<Vec<Conversation>, AppError> {
        let inner = self.inner.read().map_err(|_| lock_poisoned())?;
        let mut conversations: Vec<Conversation> =
            inner.values().map(|s| s.conversation.clone()).collect();
        conversations.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(conversations)
    }

    async fn set_active_branch(&self, conversation_id: &str, name: &str) -> Result<(), AppError> {
        let mut inner = self.inner.write().map_err(|_| lock_poisoned())?;
        let state = inner
            .get_mut(conversation_id)
            .ok_or_else(|| AppError::ConversationNotFound { id: conversation_id.to_string() })?;
        if !state.branches.contains_key(name) {
            return Err(AppError::BranchNotFound { name: name.to_string() });
        }
        state.conversation.active_branch = name.to_string();
        state.conversation.updated_at = Utc::now();
        Ok(())
    }

    async fn delete_conversation(&self, id: &str) -> Result<(), AppError> {
        let mut inner = self.inner.write().map_err(|_| lock_poisoned())?;
        inner
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| AppError::ConversationNotFound { id: id.to_string() })
    }

    async fn find_message(
        &self,
        conversation_id: &str,
        id: &str,
    ) -> Result<Option<Message>, AppError> {
        let inner = self.inner.read().map_err(|_| lock_poisoned())?;
        let state = inner
            .get(conversation_id)
            .ok_or_else(|| AppError::ConversationNotFound { id: conversation_id.to_string() })?;
        Ok(state.message(id).cloned())
    }

    async fn conversation_messages(&self, conversation_id: &str) -> Result<Vec<Message>, AppError> {
        let inner = self.inner.read().map_err(|_| lock_poisoned())?;
        let state = inner
            .get(conversation_id)
            .ok_or_else(|| AppError::ConversationNotFound { id: conversation_id.to_string() })?;
        Ok(state.messages.clone())
    }

    async fn insert_branch(&self, branch: &Branch) -> Result<(), AppError> {
        let mut inner = self.inner.write().map_err(|_| lock_poisoned())?;
        let state = inner.get_mut(&branch.conversation_id).ok_or_else(|| {
            AppError::ConversationNotFound { id: branch.conversation_id.clone() }
        })?;
        if state.branches.contains_key(&branch.name) {
            return Err(AppError::BranchExists { name: branch.name.clone() });
        }
        state.branches.insert(branch.name.clone(), branch.clone());
        Ok(())
    }

    async fn find_branch(
        &self,
        conversation_id: &str,
        name: &str,
    ) -> Result<Option<Branch>, AppError> {
        let inner = self.inner.read().map_err(|_| lock_poisoned())?;
        let state = inner
            .get(conversation_id)
            .ok_or_else(|| AppError::ConversationNotFound { id: conversation_id.to_string() })?;
        Ok(state.branches.get(name).cloned())
    }

    async fn list_branches(&self, conversation_id: &str) -> Result<Vec<Branch>, AppError> {
        let inner = self.inner.read().map_err(|_| lock_poisoned())?;
        let state = inner
            .get(conversation_id)
            .ok_or_else(|| AppError::ConversationNotFound { id: conversation_id.to_string() })?;
        let mut branches: Vec<Branch> = state.branches.values().cloned().collect();
        branches.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.name.cmp(&b.name)));
        Ok(branches)
    }

    async fn delete_branch(&self, conversation_id: &str, name: &str) -> Result<(), AppError> {
        let mut inner = self.inner.write().map_err(|_| lock_poisoned())?;
        let state = inner
            .get_mut(conversation_id)
            .ok_or_else(|| AppError::ConversationNotFound { id: conversation_id.to_string() })?;
        state
            .branches
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| AppError::BranchNotFound { name: name.to_string() })
    }

    async fn advance_head(
        &self,
        conversation_id: &str,
        name: &str,
        new_head_id: &str,
        expected_version: i64,
    ) -> Result<Branch, AppError> {
        let mut inner = self.inner.write().map_err(|_| lock_poisoned())?;
        let state = inner
            .get_mut(conversation_id)
            .ok_or_else(|| AppError::ConversationNotFound { id: conversation_id.to_string() })?;
        state.checked_branch(name, expected_version)?;
        if state.message(new_head_id).is_none() {
            return Err(AppError::MessageNotFound { id: new_head_id.to_string() });
        }
        state.move_head(name, new_head_id.to_string());
        Ok(state.branches[name].clone())
    }

    async fn append_and_advance(&self, op: HeadAdvance<'_>) -> Result<Branch, AppError> {
        let mut inner = self.inner.write().map_err(|_| lock_poisoned())?;
        let state = inner
            .get_mut(op.conversation_id)
            .ok_or_else(|| AppError::ConversationNotFound { id: op.conversation_id.to_string() })?;
        state.checked_branch(op.branch_name, op.expected_version)?;

        let Some(first) = op.messages.first() else {
            return Err(AppError::invalid_operation("nothing to append"));
        };

        match &first.parent_id {
            Some(parent) => {
                let parent = state
                    .message(parent)
                    .ok_or_else(|| AppError::MessageNotFound { id: parent.clone() })?;
                if parent.superseded && !op.fork {
                    return Err(AppError::InvalidParent { id: parent.id.clone() });
                }
            }
            None => {
                if !state.messages.is_empty() {
                    return Err(AppError::invariant(
                        "rootless append into a non-empty conversation",
                    ));
                }
            }
        }
        for pair in op.messages.windows(2) {
            if pair[1].parent_id.as_deref() != Some(pair[0].id.as_str()) {
                return Err(AppError::invariant("appended messages must form a chain"));
            }
        }
        if let Some(target) = op.supersede {
            if state.message(target).is_none() {
                return Err(AppError::MessageNotFound { id: target.to_string() });
            }
        }

        // Validation done; apply the whole unit.
        if let Some(target) = op.supersede {
            state.message_mut(target).expect("checked above").superseded = true;
        }
        state.messages.extend(op.messages.iter().cloned());
        let new_head = op.messages.last().expect("non-empty").id.clone();
        state.move_head(op.branch_name, new_head);
        Ok(state.branches[op.branch_name].clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{MessageRole, DEFAULT_BRANCH};

    fn conv(id: &str) -> Conversation {
        Conversation::new(id.to_string(), "user-1".to_string(), "test".to_string())
    }

    fn message(conversation: &str, parent: Option<&str>, content: &str) -> Message {
        Message::new(
            conversation.to_string(),
            parent.map(String::from),
            MessageRole::User,
            content.to_string(),
        )
    }

    async fn seeded() -> (MemoryStore, Message) {
        let store = MemoryStore::new();
        store.create_conversation(&conv("c1")).await.unwrap();
        let root = message("c1", None, "root");
        store
            .append_and_advance(HeadAdvance {
                conversation_id: "c1",
                branch_name: DEFAULT_BRANCH,
                expected_version: 0,
                messages: std::slice::from_ref(&root),
                fork: false,
                supersede: None,
            })
            .await
            .unwrap();
        (store, root)
    }

    #[tokio::test]
    async fn create_conversation_seeds_default_branch() {
        let store = MemoryStore::new();
        store.create_conversation(&conv("c1")).await.unwrap();
        let branch = store.find_branch("c1", DEFAULT_BRANCH).await.unwrap().unwrap();
        assert_eq!(branch.version, 0);
        assert!(branch.head_message_id.is_none());
    }

    #[tokio::test]
    async fn append_moves_head_and_bumps_version() {
        let (store, root) = seeded().await;
        let branch = store.find_branch("c1", DEFAULT_BRANCH).await.unwrap().unwrap();
        assert_eq!(branch.version, 1);
        assert_eq!(branch.head_message_id.as_deref(), Some(root.id.as_str()));
    }

    #[tokio::test]
    async fn stale_version_is_rejected() {
        let (store, root) = seeded().await;
        let child = message("c1", Some(&root.id), "next");
        // Head already moved once, so expected_version 0 is stale.
        let err = store
            .append_and_advance(HeadAdvance {
                conversation_id: "c1",
                branch_name: DEFAULT_BRANCH,
                expected_version: 0,
                messages: std::slice::from_ref(&child),
                fork: false,
                supersede: None,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::VersionConflict { .. }));
        // And nothing was written.
        assert_eq!(store.conversation_messages("c1").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn missing_parent_is_rejected() {
        let (store, _root) = seeded().await;
        let child = message("c1", Some("ghost"), "next");
        let err = store
            .append_and_advance(HeadAdvance {
                conversation_id: "c1",
                branch_name: DEFAULT_BRANCH,
                expected_version: 1,
                messages: std::slice::from_ref(&child),
                fork: false,
                supersede: None,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::MessageNotFound { .. }));
    }

    #[tokio::test]
    async fn superseded_parent_requires_fork() {
        let (store, root) = seeded().await;
        let reply = message("c1", Some(&root.id), "old reply");
        store
            .append_and_advance(HeadAdvance {
                conversation_id: "c1",
                branch_name: DEFAULT_BRANCH,
                expected_version: 1,
                messages: std::slice::from_ref(&reply),
                fork: false,
                supersede: None,
            })
            .await
            .unwrap();
        // Regeneration flags the reply superseded.
        let sibling = message("c1", Some(&root.id), "new reply");
        store
            .append_and_advance(HeadAdvance {
                conversation_id: "c1",
                branch_name: DEFAULT_BRANCH,
                expected_version: 2,
                messages: std::slice::from_ref(&sibling),
                fork: false,
                supersede: Some(&reply.id),
            })
            .await
            .unwrap();

        let under_superseded = message("c1", Some(&reply.id), "continue old");
        let err = store
            .append_and_advance(HeadAdvance {
                conversation_id: "c1",
                branch_name: DEFAULT_BRANCH,
                expected_version: 3,
                messages: std::slice::from_ref(&under_superseded),
                fork: false,
                supersede: None,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::InvalidParent { .. }));

        // The same append through an explicit fork is legal.
        store
            .append_and_advance(HeadAdvance {
                conversation_id: "c1",
                branch_name: DEFAULT_BRANCH,
                expected_version: 3,
                messages: std::slice::from_ref(&under_superseded),
                fork: true,
                supersede: None,
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn duplicate_branch_name_conflicts() {
        let (store, root) = seeded().await;
        let branch = Branch::new(
            "c1".to_string(),
            "alt".to_string(),
            Some(root.id.clone()),
            Some(root.id.clone()),
        );
        store.insert_branch(&branch).await.unwrap();
        let err = store.insert_branch(&branch).await.unwrap_err();
        assert!(matches!(err, AppError::BranchExists { .. }));
    }

    #[tokio::test]
    async fn deleting_a_branch_keeps_messages() {
        let (store, root) = seeded().await;
        let branch = Branch::new(
            "c1".to_string(),
            "alt".to_string(),
            Some(root.id.clone()),
            Some(root.id.clone()),
        );
        store.insert_branch(&branch).await.unwrap();
        store.delete_branch("c1", "alt").await.unwrap();
        assert_eq!(store.conversation_messages("c1").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn deleting_a_conversation_cascades() {
        let (store, _root) = seeded().await;
        store.delete_conversation("c1").await.unwrap();
        let err = store.conversation_messages("c1").await.unwrap_err();
        assert!(matches!(err, AppError::ConversationNotFound { .. }));
    }

    #[tokio::test]
    async fn second_root_is_an_invariant_violation() {
        let (store, _root) = seeded().await;
        let rogue = message("c1", None, "another root");
        let err = store
            .append_and_advance(HeadAdvance {
                conversation_id: "c1",
                branch_name: DEFAULT_BRANCH,
                expected_version: 1,
                messages: std::slice::from_ref(&rogue),
                fork: false,
                supersede: None,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::InvariantViolation { .. }));
    }
}
