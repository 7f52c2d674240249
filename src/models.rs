use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Name of the branch every conversation is created with.
pub const DEFAULT_BRANCH: &str = "main";

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Conversation {
    pub id: String,
    pub user_id: String,
    pub title: String,
    /// Name of the branch that `send`/`regenerate` currently target.
    pub active_branch: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Conversation {
    pub fn new(id: String, user_id: String, title: String) -> Self {
        let now = Utc::now();
        Self {
            id,
            user_id,
            title,
            active_branch: DEFAULT_BRANCH.to_string(),
            created_at: now,
            updated_at: now,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum MessageRole {
    User,
    Assistant,
    System,
}

impl MessageRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageRole::User => "USER",
            MessageRole::Assistant => "ASSISTANT",
            MessageRole::System => "SYSTEM",
        }
    }
}

impl std::fmt::Display for MessageRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl TryFrom<String> for MessageRole {
    type Error = String;
    fn try_from(s: String) -> Result<Self, Self::Error> {
        match s.to_uppercase().as_str() {
            "USER" => Ok(MessageRole::User),
            "ASSISTANT" => Ok(MessageRole::Assistant),
            "SYSTEM" => Ok(MessageRole::System),
            other => Err(format!("Unknown role: {other}")),
        }
    }
}

/// One immutable node in a conversation's message tree.
///
/// `parent_id` is `None` only for the root. Nodes are append-only: once
/// written, only the `superseded` flag ever changes (set when a regeneration
/// replaces this message with a sibling).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub conversation_id: String,
    pub parent_id: Option<String>,
    pub role: MessageRole,
    pub content: String,
    /// Identifier of the model that produced this message, if any.
    pub model: Option<String>,
    pub prompt_tokens: Option<i64>,
    pub completion_tokens: Option<i64>,
    /// A regeneration produced a sibling that became the branch head.
    pub superseded: bool,
    /// The generating stream died or was cancelled before finishing.
    pub truncated: bool,
    pub created_at: DateTime<Utc>,
}

impl Message {
    pub fn new(
        conversation_id: String,
        parent_id: Option<String>,
        role: MessageRole,
        content: String,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            conversation_id,
            parent_id,
            role,
            content,
            model: None,
            prompt_tokens: None,
            completion_tokens: None,
            superseded: false,
            truncated: false,
            created_at: Utc::now(),
        }
    }
}

/// A named, mutable pointer into the message tree: one continuation of a
/// conversation. Deleting a branch never deletes messages.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Branch {
    pub conversation_id: String,
    pub name: String,
    /// The message this branch points at; `None` while the conversation is empty.
    pub head_message_id: Option<String>,
    /// Ancestor at which this branch diverged; `None` for the default branch.
    pub forked_from_id: Option<String>,
    /// Incremented on every head advance; the optimistic-concurrency guard.
    pub version: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Branch {
    pub fn new(
        conversation_id: String,
        name: String,
        head_message_id: Option<String>,
        forked_from_id: Option<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            conversation_id,
            name,
            head_message_id,
            forked_from_id,
            version: 0,
            created_at: now,
            updated_at: now,
        }
    }
}

/// How `merge` reconciles two diverged branches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MergePolicy {
    /// Re-append the source-only segment onto the target head. Running the
    /// same merge twice appends the segment twice; that repetition is the
    /// defined behavior of this policy, not an idempotence bug.
    #[default]
    Append,
    /// Abort with `MergeConflict` before writing anything if the source
    /// segment collides with what the target appended past the merge base.
    FailOnConflict,
}

/// One colliding pair surfaced by a `fail-on-conflict` merge: same role at
/// the same depth offset past the merge base, different content.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConflictPair {
    /// 0-based depth offset past the common ancestor.
    pub offset: usize,
    pub role: MessageRole,
    pub source_id: String,
    pub target_id: String,
}

// ── Request / response shapes ─────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct ChatRequest {
    pub conversation_id: Option<String>,
    pub message: String,
}

#[derive(Debug, Serialize)]
pub struct ChatResponse {
    pub conversation_id: String,
    pub branch: String,
    pub message: Message,
}

#[derive(Debug, Deserialize)]
pub struct CreateBranchRequest {
    pub name: String,
    pub from_message_id: String,
}

#[derive(Debug, Deserialize)]
pub struct MergeRequest {
    pub source: String,
    pub target: String,
    #[serde(default)]
    pub policy: MergePolicy,
}

// ── WebSocket protocol ────────────────────────────────────────────────────────

/// Client → server over `/ws/chat`.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WsRequest {
    Send {
        conversation_id: Option<String>,
        message: String,
    },
    Regenerate {
        conversation_id: String,
        message_id: String,
    },
    /// Abort the in-flight stream; partial content is still committed.
    Cancel,
}

/// Server → client over `/ws/chat`.
#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WsEvent {
    StreamStart {
        conversation_id: String,
        branch: String,
    },
    StreamChunk {
        content: String,
    },
    StreamEnd {
        message_id: String,
        full_content: String,
        truncated: bool,
    },
    Error {
        message: String,
    },
}
