//! In-memory view of one conversation's message tree.
//!
//! Messages are held in an id-indexed arena; parents are referenced by id, so
//! there are no object cycles to manage. All reads (`path_to_root`,
//! `children`, LCA) work on a snapshot and never touch storage.

pub mod history;
pub mod merge;

use std::collections::{HashMap, HashSet};

use crate::errors::AppError;
use crate::models::Message;

#[derive(Debug)]
pub struct MessageTree {
    by_id: HashMap<String, Message>,
    children: HashMap<String, Vec<String>>,
    root: Option<String>,
}

impl MessageTree {
    /// Builds and structurally validates the tree: every parent present,
    /// exactly one root (unless empty), no cycles. A violation here means
    /// corrupted storage, not caller error.
    pub fn from_messages(messages: Vec<Message>) -> Result<Self, AppError> {
        let mut by_id: HashMap<String, Message> = HashMap::with_capacity(messages.len());
        for m in messages {
            if by_id.insert(m.id.clone(), m).is_some() {
                return Err(AppError::invariant("duplicate message id in conversation"));
            }
        }

        let mut children: HashMap<String, Vec<String>> = HashMap::new();
        let mut roots: Vec<String> = Vec::new();
        for m in by_id.values() {
            match &m.parent_id {
                Some(parent) => {
                    if !by_id.contains_key(parent) {
                        return Err(AppError::invariant(format!(
                            "message '{}' references missing parent '{parent}'",
                            m.id
                        )));
                    }
                    children.entry(parent.clone()).or_default().push(m.id.clone());
                }
                None => roots.push(m.id.clone()),
            }
        }

        if !by_id.is_empty() && roots.len() != 1 {
            return Err(AppError::invariant(format!(
                "conversation has {} roots, expected 1",
                roots.len()
            )));
        }

        // Deterministic sibling order for history rendering.
        for ids in children.values_mut() {
            ids.sort_by(|a, b| {
                let (ma, mb) = (&by_id[a], &by_id[b]);
                ma.created_at.cmp(&mb.created_at).then_with(|| ma.id.cmp(&mb.id))
            });
        }

        let tree = Self { by_id, children, root: roots.into_iter().next() };

        // Ancestor chains must terminate at the root. With all parents
        // present, any walk longer than the node count is a cycle.
        let bound = tree.by_id.len();
        for id in tree.by_id.keys() {
            let mut steps = 0usize;
            let mut cur = Some(id.as_str());
            while let Some(c) = cur {
                steps += 1;
                if steps > bound {
                    return Err(AppError::invariant(format!(
                        "cycle detected in ancestor chain of message '{id}'"
                    )));
                }
                cur = tree.by_id[c].parent_id.as_deref();
            }
        }

        Ok(tree)
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }

    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    pub fn root(&self) -> Option<&Message> {
        self.root.as_deref().map(|id| &self.by_id[id])
    }

    pub fn get(&self, id: &str) -> Option<&Message> {
        self.by_id.get(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.by_id.contains_key(id)
    }

    /// Lazy walk from `id` towards the root (leaf-first). Restartable: call
    /// again for a fresh walk.
    pub fn ancestors<'a>(&'a self, id: &str) -> Ancestors<'a> {
        Ancestors { tree: self, next: self.by_id.get(id).map(|m| m.id.as_str()) }
    }

    /// Messages from the root down to `id` inclusive — the context window
    /// replayed to the generator.
    pub fn path_to_root(&self, id: &str) -> Result<Vec<&Message>, AppError> {
        if !self.contains(id) {
            return Err(AppError::MessageNotFound { id: id.to_string() });
        }
        let mut path: Vec<&Message> = self.ancestors(id).collect();
        path.reverse();
        Ok(path)
    }

    /// Direct children of `id`, in creation order.
    pub fn children(&self, id: &str) -> Vec<&Message> {
        self.children
            .get(id)
            .map(|ids| ids.iter().map(|c| &self.by_id[c]).collect())
            .unwrap_or_default()
    }

    /// Number of edges between `id` and the root.
    pub fn depth(&self, id: &str) -> Option<usize> {
        if !self.contains(id) {
            return None;
        }
        Some(self.ancestors(id).count() - 1)
    }

    /// Lowest common ancestor of two nodes: visited-set over one root path,
    /// then the first hit walking the other. `None` only on corruption
    /// (nodes in the same conversation always share the root).
    pub fn lca(&self, a: &str, b: &str) -> Option<&Message> {
        let seen: HashSet<&str> = self.ancestors(a).map(|m| m.id.as_str()).collect();
        self.ancestors(b).find(|m| seen.contains(m.id.as_str()))
    }

    /// Whether `ancestor` lies on the path from the root to `id` (inclusive).
    pub fn is_ancestor_or_self(&self, ancestor: &str, id: &str) -> bool {
        self.ancestors(id).any(|m| m.id == ancestor)
    }
}

pub struct Ancestors<'a> {
    tree: &'a MessageTree,
    next: Option<&'a str>,
}

impl<'a> Iterator for Ancestors<'a> {
    type Item = &'a Message;

    fn next(&mut self) -> Option<Self::Item> {
        let id = self.next?;
        let msg = &self.tree.by_id[id];
        self.next = msg.parent_id.as_deref();
        Some(msg)
    }
}
