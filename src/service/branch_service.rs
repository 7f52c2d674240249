use std::sync::Arc;

use tracing::warn;

use crate::db::store::{ChatStore, HeadAdvance};
use crate::errors::AppError;
use crate::models::{Branch, MergePolicy, Message, DEFAULT_BRANCH};
use crate::service::{is_fork_append, load_branch, load_conversation, load_tree};
use crate::tree::history::{build_history, HistoryNode};
use crate::tree::merge::{plan_merge, MergePlan};

const MAX_BRANCH_NAME_LENGTH: usize = 100;
const CAS_MAX_ATTEMPTS: u32 = 3;

/// Branch manager and merge engine: named pointers into the message tree,
/// plus the two pointer-moving algorithms built on top of them.
#[derive(Clone)]
pub struct BranchService {
    store: Arc<dyn ChatStore>,
}

impl BranchService {
    pub fn new(store: Arc<dyn ChatStore>) -> Self {
        Self { store }
    }

    /// New branch with head and fork point both at `from_message_id`.
    pub async fn create_branch(
        &self,
        conversation_id: &str,
        name: &str,
        from_message_id: &str,
    ) -> Result<Branch, AppError> {
        if name.trim().is_empty() {
            return Err(AppError::EmptyField { field_name: "name".to_string() });
        }
        if name.len() > MAX_BRANCH_NAME_LENGTH {
            return Err(AppError::FieldTooLong {
                field_name: "name".to_string(),
                max_length: MAX_BRANCH_NAME_LENGTH,
                actual_length: name.len(),
            });
        }

        load_conversation(&self.store, conversation_id).await?;
        if self.store.find_message(conversation_id, from_message_id).await?.is_none() {
            return Err(AppError::MessageNotFound { id: from_message_id.to_string() });
        }

        let branch = Branch::new(
            conversation_id.to_string(),
            name.to_string(),
            Some(from_message_id.to_string()),
            Some(from_message_id.to_string()),
        );
        self.store.insert_branch(&branch).await?;
        Ok(branch)
    }

    /// Re-points the conversation's active-branch field. Never touches the
    /// tree: sends after a switch simply target the other head.
    pub async fn switch_branch(
        &self,
        conversation_id: &str,
        name: &str,
    ) -> Result<Branch, AppError> {
        let branch = load_branch(&self.store, conversation_id, name).await?;
        self.store.set_active_branch(conversation_id, name).await?;
        Ok(branch)
    }

    pub async fn list_branches(&self, conversation_id: &str) -> Result<Vec<Branch>, AppError> {
        self.store.list_branches(conversation_id).await
    }

    /// Removes the pointer only. The active and default branches are
    /// protected; everything they can reach stays reachable.
    pub async fn delete_branch(&self, conversation_id: &str, name: &str) -> Result<(), AppError> {
        let conversation = load_conversation(&self.store, conversation_id).await?;
        if name == conversation.active_branch {
            return Err(AppError::invalid_operation(format!(
                "cannot delete the active branch '{name}'"
            )));
        }
        if name == DEFAULT_BRANCH {
            return Err(AppError::invalid_operation(format!(
                "cannot delete the default branch '{name}'"
            )));
        }
        self.store.delete_branch(conversation_id, name).await
    }

    /// Branch-annotated tree for the history view; `None` while empty.
    pub async fn history(&self, conversation_id: &str) -> Result<Option<HistoryNode>, AppError> {
        load_conversation(&self.store, conversation_id).await?;
        let tree = load_tree(&self.store, conversation_id).await?;
        let branches = self.store.list_branches(conversation_id).await?;
        build_history(&tree, &branches)
    }

    /// Replays the source-only segment onto the target head as fresh nodes
    /// and CAS-advances the target. The source branch and its messages are
    /// untouched. A lost race re-reads and re-plans from scratch.
    pub async fn merge(
        &self,
        conversation_id: &str,
        source_name: &str,
        target_name: &str,
        policy: MergePolicy,
    ) -> Result<Branch, AppError> {
        load_conversation(&self.store, conversation_id).await?;

        let mut last_err = None;
        for _ in 0..CAS_MAX_ATTEMPTS {
            let source = load_branch(&self.store, conversation_id, source_name).await?;
            let target = load_branch(&self.store, conversation_id, target_name).await?;
            let tree = load_tree(&self.store, conversation_id).await?;

            let segment = match plan_merge(&tree, &source, &target, policy)? {
                MergePlan::NoOp => return Ok(target),
                MergePlan::Append { segment, .. } => segment,
            };

            let replayed = replay_segment(conversation_id, target.head_message_id.clone(), &segment);
            match self
                .store
                .append_and_advance(HeadAdvance {
                    conversation_id,
                    branch_name: target_name,
                    expected_version: target.version,
                    messages: &replayed,
                    fork: is_fork_append(&target),
                    supersede: None,
                })
                .await
            {
                Ok(advanced) => return Ok(advanced),
                Err(e @ AppError::VersionConflict { .. }) => {
                    warn!("Lost head race merging into '{target_name}', re-planning");
                    last_err = Some(e);
                }
                Err(e) => return Err(e),
            }
        }
        Err(last_err.expect("retries exhausted only after a conflict"))
    }
}

/// Fresh message nodes carrying the segment's role/content/metadata, parent
/// chain continued from `parent`. The copies start un-superseded: no
/// regeneration has happened at their new location.
fn replay_segment(
    conversation_id: &str,
    parent: Option<String>,
    segment: &[Message],
) -> Vec<Message> {
    let mut parent = parent;
    let mut replayed = Vec::with_capacity(segment.len());
    for original in segment {
        let mut message = Message::new(
            conversation_id.to_string(),
            parent.clone(),
            original.role,
            original.content.clone(),
        );
        message.model = original.model.clone();
        message.prompt_tokens = original.prompt_tokens;
        message.completion_tokens = original.completion_tokens;
        message.truncated = original.truncated;
        parent = Some(message.id.clone());
        replayed.push(message);
    }
    replayed
}
