use sqlx::postgres::PgRow;
use sqlx::{PgExecutor, PgPool, Row};
use tracing::error;

use crate::errors::AppError;
use crate::models::{Message, MessageRole};

const COLUMNS: &str = "id, conversation_id, parent_id, role, content, model, \
                       prompt_tokens, completion_tokens, superseded, truncated, created_at";

#[derive(Clone)]
pub struct MessageRepository {
    pool: PgPool,
}

impl MessageRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn find_by_conversation_id(
        &self,
        conversation_id: &str,
    ) -> Result<Vec<Message>, AppError> {
        let rows = sqlx::query(&format!(
            "SELECT {COLUMNS} FROM messages
             WHERE conversation_id = $1
             ORDER BY created_at ASC, id ASC",
        ))
        .bind(conversation_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to fetch messages for conversation {conversation_id}: {e}");
            AppError::db_query(
                format!("Failed to fetch messages for conversation {conversation_id}"),
                e,
            )
        })?;

        rows.iter().map(message_from_row).collect()
    }

    pub async fn find_by_id(
        &self,
        conversation_id: &str,
        id: &str,
    ) -> Result<Option<Message>, AppError> {
        self.find_in(&self.pool, conversation_id, id).await
    }

    /// Executor-parameterized lookup, usable inside a transaction.
    pub async fn find_in(
        &self,
        executor: impl PgExecutor<'_>,
        conversation_id: &str,
        id: &str,
    ) -> Result<Option<Message>, AppError> {
        let row = sqlx::query(&format!(
            "SELECT {COLUMNS} FROM messages WHERE conversation_id = $1 AND id = $2",
        ))
        .bind(conversation_id)
        .bind(id)
        .fetch_optional(executor)
        .await
        .map_err(|e| {
            error!("Failed to find message {id}: {e}");
            AppError::db_query(format!("Failed to find message {id}"), e)
        })?;

        row.as_ref().map(message_from_row).transpose()
    }

    pub async fn insert(
        &self,
        executor: impl PgExecutor<'_>,
        message: &Message,
    ) -> Result<(), AppError> {
        sqlx::query(
            "INSERT INTO messages (id, conversation_id, parent_id, role, content, model,
                                   prompt_tokens, completion_tokens, superseded, truncated, created_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)",
        )
        .bind(&message.id)
        .bind(&message.conversation_id)
        .bind(&message.parent_id)
        .bind(message.role.as_str())
        .bind(&message.content)
        .bind(&message.model)
        .bind(message.prompt_tokens)
        .bind(message.completion_tokens)
        .bind(message.superseded)
        .bind(message.truncated)
        .bind(message.created_at)
        .execute(executor)
        .await
        .map_err(|e| {
            error!("Failed to save message {}: {e}", message.id);
            AppError::db_query("Failed to save message", e)
        })?;
        Ok(())
    }

    pub async fn mark_superseded(
        &self,
        executor: impl PgExecutor<'_>,
        conversation_id: &str,
        id: &str,
    ) -> Result<bool, AppError> {
        let result = sqlx::query(
            "UPDATE messages SET superseded = TRUE WHERE conversation_id = $1 AND id = $2",
        )
        .bind(conversation_id)
        .bind(id)
        .execute(executor)
        .await
        .map_err(|e| {
            error!("Failed to mark message {id} superseded: {e}");
            AppError::db_query("Failed to mark message superseded", e)
        })?;
        Ok(result.rows_affected() == 1)
    }

    pub async fn has_any(
        &self,
        executor: impl PgExecutor<'_>,
        conversation_id: &str,
    ) -> Result<bool, AppError> {
        let row = sqlx::query("SELECT EXISTS(SELECT 1 FROM messages WHERE conversation_id = $1)")
            .bind(conversation_id)
            .fetch_one(executor)
            .await
            .map_err(|e| {
                error!("Failed to probe messages for conversation {conversation_id}: {e}");
                AppError::db_query("Failed to probe messages", e)
            })?;
        row.try_get(0)
            .map_err(|e| AppError::db_query("Failed to read exists flag", e))
    }
}

/// Manual mapping: `role` round-trips through its DB string form.
pub fn message_from_row(row: &PgRow) -> Result<Message, AppError> {
    let role_str: String = row
        .try_get("role")
        .map_err(|e| AppError::db_query("Failed to read role", e))?;
    let role = MessageRole::try_from(role_str)
        .map_err(|e| AppError::Unexpected(format!("Unknown message role: {e}")))?;
    Ok(Message {
        id: row
            .try_get("id")
            .map_err(|e| AppError::db_query("Failed to read id", e))?,
        conversation_id: row
            .try_get("conversation_id")
            .map_err(|e| AppError::db_query("Failed to read conversation_id", e))?,
        parent_id: row
            .try_get("parent_id")
            .map_err(|e| AppError::db_query("Failed to read parent_id", e))?,
        role,
        content: row
            .try_get("content")
            .map_err(|e| AppError::db_query("Failed to read content", e))?,
        model: row
            .try_get("model")
            .map_err(|e| AppError::db_query("Failed to read model", e))?,
        prompt_tokens: row
            .try_get("prompt_tokens")
            .map_err(|e| AppError::db_query("Failed to read prompt_tokens", e))?,
        completion_tokens: row
            .try_get("completion_tokens")
            .map_err(|e| AppError::db_query("Failed to read completion_tokens", e))?,
        superseded: row
            .try_get("superseded")
            .map_err(|e| AppError::db_query("Failed to read superseded", e))?,
        truncated: row
            .try_get("truncated")
            .map_err(|e| AppError::db_query("Failed to read truncated", e))?,
        created_at: row
            .try_get("created_at")
            .map_err(|e| AppError::db_query("Failed to read created_at", e))?,
    })
}
