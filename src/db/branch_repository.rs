use chrono::Utc;
use sqlx::postgres::PgRow;
use sqlx::{PgExecutor, PgPool, Row};
use tracing::error;

use crate::errors::AppError;
use crate::models::Branch;

const COLUMNS: &str =
    "conversation_id, name, head_message_id, forked_from_id, version, created_at, updated_at";

#[derive(Clone)]
pub struct BranchRepository {
    pool: PgPool,
}

impl BranchRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn find(
        &self,
        conversation_id: &str,
        name: &str,
    ) -> Result<Option<Branch>, AppError> {
        let row = sqlx::query(&format!(
            "SELECT {COLUMNS} FROM branches WHERE conversation_id = $1 AND name = $2",
        ))
        .bind(conversation_id)
        .bind(name)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to find branch {name}: {e}");
            AppError::db_query(format!("Failed to find branch {name}"), e)
        })?;

        row.as_ref().map(branch_from_row).transpose()
    }

    /// Same lookup inside a transaction, locking the row so a concurrent
    /// advance serializes behind this one.
    pub async fn find_for_update(
        &self,
        executor: impl PgExecutor<'_>,
        conversation_id: &str,
        name: &str,
    ) -> Result<Option<Branch>, AppError> {
        let row = sqlx::query(&format!(
            "SELECT {COLUMNS} FROM branches WHERE conversation_id = $1 AND name = $2 FOR UPDATE",
        ))
        .bind(conversation_id)
        .bind(name)
        .fetch_optional(executor)
        .await
        .map_err(|e| {
            error!("Failed to lock branch {name}: {e}");
            AppError::db_query(format!("Failed to lock branch {name}"), e)
        })?;

        row.as_ref().map(branch_from_row).transpose()
    }

    pub async fn find_all(&self, conversation_id: &str) -> Result<Vec<Branch>, AppError> {
        let rows = sqlx::query(&format!(
            "SELECT {COLUMNS} FROM branches
             WHERE conversation_id = $1
             ORDER BY created_at ASC, name ASC",
        ))
        .bind(conversation_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to fetch branches for conversation {conversation_id}: {e}");
            AppError::db_query("Failed to fetch branches", e)
        })?;

        rows.iter().map(branch_from_row).collect()
    }

    pub async fn insert(
        &self,
        executor: impl PgExecutor<'_>,
        branch: &Branch,
    ) -> Result<(), AppError> {
        sqlx::query(
            "INSERT INTO branches (conversation_id, name, head_message_id, forked_from_id,
                                   version, created_at, updated_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7)",
        )
        .bind(&branch.conversation_id)
        .bind(&branch.name)
        .bind(&branch.head_message_id)
        .bind(&branch.forked_from_id)
        .bind(branch.version)
        .bind(branch.created_at)
        .bind(branch.updated_at)
        .execute(executor)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                return AppError::BranchExists { name: branch.name.clone() };
            }
            error!("Failed to save branch {}: {e}", branch.name);
            AppError::db_query("Failed to save branch", e)
        })?;
        Ok(())
    }

    pub async fn delete(&self, conversation_id: &str, name: &str) -> Result<bool, AppError> {
        let result = sqlx::query("DELETE FROM branches WHERE conversation_id = $1 AND name = $2")
            .bind(conversation_id)
            .bind(name)
            .execute(&self.pool)
            .await
            .map_err(|e| {
                error!("Failed to delete branch {name}: {e}");
                AppError::db_query("Failed to delete branch", e)
            })?;
        Ok(result.rows_affected() == 1)
    }

    /// Compare-and-swap head move: refuses (0 rows) when `expected_version`
    /// is stale. Callers translate 0 rows into `VersionConflict`.
    pub async fn cas_advance(
        &self,
        executor: impl PgExecutor<'_>,
        conversation_id: &str,
        name: &str,
        new_head_id: &str,
        expected_version: i64,
    ) -> Result<bool, AppError> {
        let result = sqlx::query(
            "UPDATE branches
             SET head_message_id = $1, version = version + 1, updated_at = $2
             WHERE conversation_id = $3 AND name = $4 AND version = $5",
        )
        .bind(new_head_id)
        .bind(Utc::now())
        .bind(conversation_id)
        .bind(name)
        .bind(expected_version)
        .execute(executor)
        .await
        .map_err(|e| {
            error!("Failed to advance branch {name}: {e}");
            AppError::db_query("Failed to advance branch", e)
        })?;
        Ok(result.rows_affected() == 1)
    }
}

fn is_unique_violation(e: &sqlx::Error) -> bool {
    matches!(e, sqlx::Error::Database(db) if db.is_unique_violation())
}

pub fn branch_from_row(row: &PgRow) -> Result<Branch, AppError> {
    Ok(Branch {
        conversation_id: row
            .try_get("conversation_id")
            .map_err(|e| AppError::db_query("Failed to read conversation_id", e))?,
        name: row
            .try_get("name")
            .map_err(|e| AppError::db_query("Failed to read name", e))?,
        head_message_id: row
            .try_get("head_message_id")
            .map_err(|e| AppError::db_query("Failed to read head_message_id", e))?,
        forked_from_id: row
            .try_get("forked_from_id")
            .map_err(|e| AppError::db_query("Failed to read forked_from_id", e))?,
        version: row
            .try_get("version")
            .map_err(|e| AppError::db_query("Failed to read version", e))?,
        created_at: row
            .try_get("created_at")
            .map_err(|e| AppError::db_query("Failed to read created_at", e))?,
        updated_at: row
            .try_get("updated_at")
            .map_err(|e| AppError::db_query("Failed to read updated_at", e))?,
    })
}
