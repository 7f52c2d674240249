use chrono::Utc;
use sqlx::{PgExecutor, PgPool};
use tracing::error;

use crate::errors::AppError;
use crate::models::Conversation;

#[derive(Clone)]
pub struct ConversationRepository {
    pool: PgPool,
}

impl ConversationRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn find_all(&self) -> Result<Vec<Conversation>, AppError> {
        sqlx::query_as::<_, Conversation>(
            "SELECT id, user_id, title, active_branch, created_at, updated_at
             FROM conversations
             ORDER BY updated_at DESC",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to fetch all conversations: {e}");
            AppError::db_query("Failed to fetch conversations", e)
        })
    }

    pub async fn find_by_id(&self, id: &str) -> Result<Option<Conversation>, AppError> {
        sqlx::query_as::<_, Conversation>(
            "SELECT id, user_id, title, active_branch, created_at, updated_at
             FROM conversations
             WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to find conversation {id}: {e}");
            AppError::db_query(format!("Failed to find conversation {id}"), e)
        })
    }

    /// Executor-parameterized so it can join the create-conversation transaction.
    pub async fn insert(
        &self,
        executor: impl PgExecutor<'_>,
        conversation: &Conversation,
    ) -> Result<(), AppError> {
        sqlx::query(
            "INSERT INTO conversations (id, user_id, title, active_branch, created_at, updated_at)
             VALUES ($1, $2, $3, $4, $5, $6)",
        )
        .bind(&conversation.id)
        .bind(&conversation.user_id)
        .bind(&conversation.title)
        .bind(&conversation.active_branch)
        .bind(conversation.created_at)
        .bind(conversation.updated_at)
        .execute(executor)
        .await
        .map_err(|e| {
            error!("Failed to save conversation {}: {e}", conversation.id);
            AppError::db_query("Failed to save conversation", e)
        })?;
        Ok(())
    }

    pub async fn set_active_branch(&self, id: &str, name: &str) -> Result<bool, AppError> {
        let result = sqlx::query(
            "UPDATE conversations SET active_branch = $1, updated_at = $2 WHERE id = $3",
        )
        .bind(name)
        .bind(Utc::now())
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to switch active branch for conversation {id}: {e}");
            AppError::db_query("Failed to switch active branch", e)
        })?;
        Ok(result.rows_affected() == 1)
    }

    pub async fn touch(
        &self,
        executor: impl PgExecutor<'_>,
        id: &str,
    ) -> Result<(), AppError> {
        sqlx::query("UPDATE conversations SET updated_at = $1 WHERE id = $2")
            .bind(Utc::now())
            .bind(id)
            .execute(executor)
            .await
            .map_err(|e| {
                error!("Failed to update conversation timestamp {id}: {e}");
                AppError::db_query("Failed to update conversation", e)
            })?;
        Ok(())
    }

    /// Cascades to messages and branches via foreign keys.
    pub async fn delete(&self, id: &str) -> Result<bool, AppError> {
        let result = sqlx::query("DELETE FROM conversations WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(|e| {
                error!("Failed to delete conversation {id}: {e}");
                AppError::db_query("Failed to delete conversation", e)
            })?;
        Ok(result.rows_affected() == 1)
    }
}
