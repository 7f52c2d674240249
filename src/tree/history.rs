//! Read-only branch-history view: the message tree annotated with branch
//! names, ready for the UI to render divergence points.

use std::collections::HashMap;

use serde::Serialize;

use crate::errors::AppError;
use crate::models::{Branch, Message};
use crate::tree::MessageTree;

#[derive(Debug, Clone, Serialize)]
pub struct HistoryNode {
    pub message: Message,
    /// Every branch whose head is this node or a descendant of it, i.e. the
    /// branches this node is part of. A branch "diverges" where the label
    /// sets of two siblings differ.
    pub branch_labels: Vec<String>,
    pub children: Vec<HistoryNode>,
}

/// Single traversal from the root; `None` for an empty conversation.
/// A branch head that is not in the tree means the reachability invariant
/// broke in storage.
pub fn build_history(
    tree: &MessageTree,
    branches: &[Branch],
) -> Result<Option<HistoryNode>, AppError> {
    let mut labels: HashMap<&str, Vec<String>> = HashMap::new();
    for branch in branches {
        let Some(head) = branch.head_message_id.as_deref() else {
            continue;
        };
        if !tree.contains(head) {
            return Err(AppError::invariant(format!(
                "branch '{}' head '{head}' is not in the conversation tree",
                branch.name
            )));
        }
        for node in tree.ancestors(head) {
            labels.entry(node.id.as_str()).or_default().push(branch.name.clone());
        }
    }
    for names in labels.values_mut() {
        names.sort();
    }

    Ok(tree.root().map(|root| build_node(tree, root, &labels)))
}

fn build_node(
    tree: &MessageTree,
    message: &Message,
    labels: &HashMap<&str, Vec<String>>,
) -> HistoryNode {
    HistoryNode {
        message: message.clone(),
        branch_labels: labels.get(message.id.as_str()).cloned().unwrap_or_default(),
        children: tree
            .children(&message.id)
            .into_iter()
            .map(|child| build_node(tree, child, labels))
            .collect(),
    }
}
