//! Merge planning: given two branch heads on one tree, decide what (if
//! anything) must be appended onto the target. Pure — the service layer
//! turns a plan into storage writes.

use crate::errors::AppError;
use crate::models::{Branch, ConflictPair, Message, MergePolicy, MessageRole};
use crate::tree::MessageTree;

#[derive(Debug)]
pub enum MergePlan {
    /// Target already contains everything the source has (self-merge, empty
    /// source, or target strictly ahead). The target head is untouched.
    NoOp,
    /// Re-append `segment` (source-only messages, root-to-leaf order) onto
    /// the target head as fresh nodes.
    Append { base_id: String, segment: Vec<Message> },
}

pub fn plan_merge(
    tree: &MessageTree,
    source: &Branch,
    target: &Branch,
    policy: MergePolicy,
) -> Result<MergePlan, AppError> {
    if source.name == target.name {
        return Ok(MergePlan::NoOp);
    }

    let Some(source_head) = source.head_message_id.as_deref() else {
        // Nothing on the source yet.
        return Ok(MergePlan::NoOp);
    };
    let Some(target_head) = target.head_message_id.as_deref() else {
        // A headless branch next to a populated one cannot happen through
        // the public operations.
        return Err(AppError::invariant(format!(
            "branch '{}' has no head while '{}' does",
            target.name, source.name
        )));
    };

    if !tree.contains(source_head) || !tree.contains(target_head) {
        return Err(AppError::invariant("branch head missing from conversation tree"));
    }
    if source_head == target_head {
        return Ok(MergePlan::NoOp);
    }

    let base = tree
        .lca(source_head, target_head)
        .ok_or_else(|| AppError::invariant("no common ancestor between branch heads"))?
        .id
        .clone();

    if base == source_head {
        // Target is strictly ahead of the source.
        return Ok(MergePlan::NoOp);
    }

    let segment = segment_after(tree, &base, source_head)?;

    if policy == MergePolicy::FailOnConflict {
        let target_segment = segment_after(tree, &base, target_head)?;
        let conflicts = find_conflicts(&segment, &target_segment);
        if !conflicts.is_empty() {
            return Err(AppError::MergeConflict { conflicts });
        }
    }

    Ok(MergePlan::Append { base_id: base, segment })
}

/// Messages on the path from `base` (exclusive) down to `head` (inclusive).
fn segment_after(tree: &MessageTree, base: &str, head: &str) -> Result<Vec<Message>, AppError> {
    let path = tree.path_to_root(head)?;
    let base_idx = path
        .iter()
        .position(|m| m.id == base)
        .ok_or_else(|| AppError::invariant("merge base not on head path"))?;
    Ok(path[base_idx + 1..].iter().map(|m| (*m).clone()).collect())
}

/// User messages at the same depth offset past the base with different
/// content conflict; assistant/system messages never do.
fn find_conflicts(source_segment: &[Message], target_segment: &[Message]) -> Vec<ConflictPair> {
    source_segment
        .iter()
        .zip(target_segment.iter())
        .enumerate()
        .filter(|(_, (s, t))| {
            s.role == MessageRole::User && t.role == MessageRole::User && s.content != t.content
        })
        .map(|(offset, (s, t))| ConflictPair {
            offset,
            role: MessageRole::User,
            source_id: s.id.clone(),
            target_id: t.id.clone(),
        })
        .collect()
}
