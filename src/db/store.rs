use async_trait::async_trait;

use crate::errors::AppError;
use crate::models::{Branch, Conversation, Message};

/// One head move: append `messages` (parent-chained, last becomes the new
/// head), optionally flag an existing message superseded, and CAS the branch
/// version — all or nothing.
#[derive(Debug)]
pub struct HeadAdvance<'a> {
    pub conversation_id: &'a str,
    pub branch_name: &'a str,
    /// Version the caller last read; the write is refused with
    /// `VersionConflict` if another writer advanced the branch since.
    pub expected_version: i64,
    pub messages: &'a [Message],
    /// The append continues an explicit fork, which makes a superseded
    /// parent legal.
    pub fork: bool,
    /// Flagged `superseded = true` in the same unit (regeneration).
    pub supersede: Option<&'a str>,
}

/// Persistence capability consumed by the engine. Implementations must make
/// `append_and_advance` atomic: a message must never become durable without
/// the head move that references it, and vice versa.
#[async_trait]
pub trait ChatStore: Send + Sync {
    // ── Conversations ────────────────────────────────────────────────────────

    /// Creates the conversation together with its default branch.
    async fn create_conversation(&self, conversation: &Conversation) -> Result<(), AppError>;

    async fn find_conversation(&self, id: &str) -> Result<Option<Conversation>, AppError>;

    /// Most recently updated first.
    async fn list_conversations(&self) -> Result<Vec<Conversation>, AppError>;

    /// Points subsequent sends/regenerations at `name`. Tree state is untouched.
    async fn set_active_branch(&self, conversation_id: &str, name: &str) -> Result<(), AppError>;

    /// Removes the conversation and everything it owns.
    async fn delete_conversation(&self, id: &str) -> Result<(), AppError>;

    // ── Messages ─────────────────────────────────────────────────────────────

    async fn find_message(
        &self,
        conversation_id: &str,
        id: &str,
    ) -> Result<Option<Message>, AppError>;

    /// Every message of the conversation, oldest first — the tree snapshot.
    async fn conversation_messages(&self, conversation_id: &str) -> Result<Vec<Message>, AppError>;

    // ── Branches ─────────────────────────────────────────────────────────────

    /// `Conflict` if the name is already taken in the conversation.
    async fn insert_branch(&self, branch: &Branch) -> Result<(), AppError>;

    async fn find_branch(
        &self,
        conversation_id: &str,
        name: &str,
    ) -> Result<Option<Branch>, AppError>;

    async fn list_branches(&self, conversation_id: &str) -> Result<Vec<Branch>, AppError>;

    /// Removes the pointer only; messages stay.
    async fn delete_branch(&self, conversation_id: &str, name: &str) -> Result<(), AppError>;

    /// Bare CAS head move (no append): points the branch at an existing
    /// message. Used when re-targeting a head inside an already-written tree.
    async fn advance_head(
        &self,
        conversation_id: &str,
        name: &str,
        new_head_id: &str,
        expected_version: i64,
    ) -> Result<Branch, AppError>;

    /// The compound write described on [`HeadAdvance`]. Returns the branch
    /// after the move.
    async fn append_and_advance(&self, op: HeadAdvance<'_>) -> Result<Branch, AppError>;
}
