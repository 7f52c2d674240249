//! Postgres-backed [`ChatStore`]. Simple reads go straight to the
//! repositories; the compound writes run in transactions so the
//! append+advance pair is a single atomic unit.

use async_trait::async_trait;
use chrono::Utc;
use sqlx::PgPool;

use crate::db::branch_repository::BranchRepository;
use crate::db::conversation_repository::ConversationRepository;
use crate::db::message_repository::MessageRepository;
use crate::db::store::{ChatStore, HeadAdvance};
use crate::errors::AppError;
use crate::models::{Branch, Conversation, Message};

#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
    conversations: ConversationRepository,
    messages: MessageRepository,
    branches: BranchRepository,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            conversations: ConversationRepository::new(pool.clone()),
            messages: MessageRepository::new(pool.clone()),
            branches: BranchRepository::new(pool.clone()),
            pool,
        }
    }

    async fn begin(&self) -> Result<sqlx::Transaction<'_, sqlx::Postgres>, AppError> {
        self.pool
            .begin()
            .await
            .map_err(|e| AppError::db_query("Failed to begin transaction", e))
    }

    async fn commit(tx: sqlx::Transaction<'_, sqlx::Postgres>) -> Result<(), AppError> {
        tx.commit()
            .await
            .map_err(|e| AppError::db_query("Failed to commit transaction", e))
    }

    /// Classifies a missing (conversation, branch) pair for error reporting.
    async fn branch_missing(&self, conversation_id: &str, name: &str) -> AppError {
        match self.conversations.find_by_id(conversation_id).await {
            Ok(None) => AppError::ConversationNotFound { id: conversation_id.to_string() },
            _ => AppError::BranchNotFound { name: name.to_string() },
        }
    }
}

#[async_trait]
impl ChatStore for PgStore {
    async fn create_conversation(&self, conversation: &Conversation) -> Result<(), AppError> {
        let mut tx = self.begin().await?;
        self.conversations.insert(&mut *tx, conversation).await?;
        let default_branch = Branch::new(
            conversation.id.clone(),
            conversation.active_branch.clone(),
            None,
            None,
        );
        self.branches.insert(&mut *tx, &default_branch).await?;
        Self::commit(tx).await
    }

    async fn find_conversation(&self, id: &str) -> Result<Option<Conversation>, AppError> {
        self.conversations.find_by_id(id).await
    }

    async fn list_conversations(&self) -> Result<Vec<Conversation>, AppError> {
        self.conversations.find_all().await
    }

    async fn set_active_branch(&self, conversation_id: &str, name: &str) -> Result<(), AppError> {
        if self.branches.find(conversation_id, name).await?.is_none() {
            return Err(self.branch_missing(conversation_id, name).await);
        }
        if !self.conversations.set_active_branch(conversation_id, name).await? {
            return Err(AppError::ConversationNotFound { id: conversation_id.to_string() });
        }
        Ok(())
    }

    async fn delete_conversation(&self, id: &str) -> Result<(), AppError> {
        if !self.conversations.delete(id).await? {
            return Err(AppError::ConversationNotFound { id: id.to_string() });
        }
        Ok(())
    }

    async fn find_message(
        &self,
        conversation_id: &str,
        id: &str,
    ) -> Result<Option<Message>, AppError> {
        if self.conversations.find_by_id(conversation_id).await?.is_none() {
            return Err(AppError::ConversationNotFound { id: conversation_id.to_string() });
        }
        self.messages.find_by_id(conversation_id, id).await
    }

    async fn conversation_messages(&self, conversation_id: &str) -> Result<Vec<Message>, AppError> {
        if self.conversations.find_by_id(conversation_id).await?.is_none() {
            return Err(AppError::ConversationNotFound { id: conversation_id.to_string() });
        }
        self.messages.find_by_conversation_id(conversation_id).await
    }

    async fn insert_branch(&self, branch: &Branch) -> Result<(), AppError> {
        if self.conversations.find_by_id(&branch.conversation_id).await?.is_none() {
            return Err(AppError::ConversationNotFound { id: branch.conversation_id.clone() });
        }
        self.branches.insert(&self.pool, branch).await
    }

    async fn find_branch(
        &self,
        conversation_id: &str,
        name: &str,
    ) -> Result<Option<Branch>, AppError> {
        if self.conversations.find_by_id(conversation_id).await?.is_none() {
            return Err(AppError::ConversationNotFound { id: conversation_id.to_string() });
        }
        self.branches.find(conversation_id, name).await
    }

    async fn list_branches(&self, conversation_id: &str) -> Result<Vec<Branch>, AppError> {
        if self.conversations.find_by_id(conversation_id).await?.is_none() {
            return Err(AppError::ConversationNotFound { id: conversation_id.to_string() });
        }
        self.branches.find_all(conversation_id).await
    }

    async fn delete_branch(&self, conversation_id: &str, name: &str) -> Result<(), AppError> {
        if !self.branches.delete(conversation_id, name).await? {
            return Err(self.branch_missing(conversation_id, name).await);
        }
        Ok(())
    }

    async fn advance_head(
        &self,
        conversation_id: &str,
        name: &str,
        new_head_id: &str,
        expected_version: i64,
    ) -> Result<Branch, AppError> {
        let mut tx = self.begin().await?;
        let Some(mut branch) =
            self.branches.find_for_update(&mut *tx, conversation_id, name).await?
        else {
            return Err(self.branch_missing(conversation_id, name).await);
        };
        if branch.version != expected_version {
            return Err(AppError::VersionConflict {
                branch: name.to_string(),
                expected: expected_version,
            });
        }
        if self.messages.find_in(&mut *tx, conversation_id, new_head_id).await?.is_none() {
            return Err(AppError::MessageNotFound { id: new_head_id.to_string() });
        }
        if !self
            .branches
            .cas_advance(&mut *tx, conversation_id, name, new_head_id, expected_version)
            .await?
        {
            return Err(AppError::VersionConflict {
                branch: name.to_string(),
                expected: expected_version,
            });
        }
        self.conversations.touch(&mut *tx, conversation_id).await?;
        Self::commit(tx).await?;

        branch.head_message_id = Some(new_head_id.to_string());
        branch.version = expected_version + 1;
        branch.updated_at = Utc::now();
        Ok(branch)
    }

    async fn append_and_advance(&self, op: HeadAdvance<'_>) -> Result<Branch, AppError> {
        let mut tx = self.begin().await?;
        let Some(mut branch) = self
            .branches
            .find_for_update(&mut *tx, op.conversation_id, op.branch_name)
            .await?
        else {
            return Err(self.branch_missing(op.conversation_id, op.branch_name).await);
        };
        if branch.version != op.expected_version {
            return Err(AppError::VersionConflict {
                branch: op.branch_name.to_string(),
                expected: op.expected_version,
            });
        }

        let Some(first) = op.messages.first() else {
            return Err(AppError::invalid_operation("nothing to append"));
        };
        match &first.parent_id {
            Some(parent_id) => {
                let parent = self
                    .messages
                    .find_in(&mut *tx, op.conversation_id, parent_id)
                    .await?
                    .ok_or_else(|| AppError::MessageNotFound { id: parent_id.clone() })?;
                if parent.superseded && !op.fork {
                    return Err(AppError::InvalidParent { id: parent.id });
                }
            }
            None => {
                if self.messages.has_any(&mut *tx, op.conversation_id).await? {
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
            if !self.messages.mark_superseded(&mut *tx, op.conversation_id, target).await? {
                return Err(AppError::MessageNotFound { id: target.to_string() });
            }
        }
        for message in op.messages {
            self.messages.insert(&mut *tx, message).await?;
        }
        let new_head = op.messages.last().expect("non-empty").id.as_str();
        if !self
            .branches
            .cas_advance(
                &mut *tx,
                op.conversation_id,
                op.branch_name,
                new_head,
                op.expected_version,
            )
            .await?
        {
            return Err(AppError::VersionConflict {
                branch: op.branch_name.to_string(),
                expected: op.expected_version,
            });
        }
        self.conversations.touch(&mut *tx, op.conversation_id).await?;
        Self::commit(tx).await?;

        branch.head_message_id = Some(new_head.to_string());
        branch.version = op.expected_version + 1;
        branch.updated_at = Utc::now();
        Ok(branch)
    }
}
