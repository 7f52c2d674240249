pub mod branch_service;
pub mod chat_service;

use std::sync::Arc;

use crate::db::store::ChatStore;
use crate::errors::AppError;
use crate::models::{Branch, Conversation};
use crate::tree::MessageTree;

pub(crate) async fn load_conversation(
    store: &Arc<dyn ChatStore>,
    id: &str,
) -> Result<Conversation, AppError> {
    store
        .find_conversation(id)
        .await?
        .ok_or_else(|| AppError::ConversationNotFound { id: id.to_string() })
}

pub(crate) async fn load_branch(
    store: &Arc<dyn ChatStore>,
    conversation_id: &str,
    name: &str,
) -> Result<Branch, AppError> {
    store
        .find_branch(conversation_id, name)
        .await?
        .ok_or_else(|| AppError::BranchNotFound { name: name.to_string() })
}

/// Snapshot of the whole conversation tree; validates structure on load.
pub(crate) async fn load_tree(
    store: &Arc<dyn ChatStore>,
    conversation_id: &str,
) -> Result<MessageTree, AppError> {
    MessageTree::from_messages(store.conversation_messages(conversation_id).await?)
}

/// A branch still sitting on its fork point may append under a superseded
/// head: the fork was explicit.
pub(crate) fn is_fork_append(branch: &Branch) -> bool {
    branch.head_message_id.is_some() && branch.head_message_id == branch.forked_from_id
}
