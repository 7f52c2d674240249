use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, warn};
use uuid::Uuid;

use crate::agent::{GeneratedReply, GenerationService, PromptMessage};
use crate::config::GenerationSettings;
use crate::db::store::{ChatStore, HeadAdvance};
use crate::errors::AppError;
use crate::models::{
    Branch, ChatRequest, ChatResponse, Conversation, Message, MessageRole,
};
use crate::service::{is_fork_append, load_branch, load_conversation, load_tree};

const MAX_MESSAGE_LENGTH: usize = 8000;
/// Bounded retries for a lost CAS race before the conflict is surfaced.
const CAS_MAX_ATTEMPTS: u32 = 3;

/// A generated reply waiting to be committed: everything the commit needs,
/// captured before generation starts. `branch` is the last state this writer
/// observed; the commit CAS-checks it.
#[derive(Debug, Clone)]
pub struct PendingReply {
    pub conversation_id: String,
    pub branch: Branch,
    /// Root-to-tip context replayed to the generator.
    pub context: Vec<PromptMessage>,
    /// Parent of the reply message to be appended.
    pub parent_id: Option<String>,
    /// Set when this is a regeneration: the message to flag superseded.
    pub supersede: Option<String>,
    fork: bool,
}

/// Conversation orchestrator: sequences append user message → generate →
/// append reply → advance head, in both buffered and streaming form.
#[derive(Clone)]
pub struct ChatService {
    store: Arc<dyn ChatStore>,
    agent: Arc<dyn GenerationService>,
    generation: GenerationSettings,
}

impl ChatService {
    pub fn new(
        store: Arc<dyn ChatStore>,
        agent: Arc<dyn GenerationService>,
        generation: GenerationSettings,
    ) -> Self {
        Self { store, agent, generation }
    }

    pub async fn get_conversations(&self) -> Result<Vec<Conversation>, AppError> {
        self.store.list_conversations().await
    }

    /// Messages of the active branch, root first. The rest of the tree is
    /// reachable through the history view, not here.
    pub async fn get_messages(&self, conversation_id: &str) -> Result<Vec<Message>, AppError> {
        let conversation = load_conversation(&self.store, conversation_id).await?;
        let branch = load_branch(&self.store, conversation_id, &conversation.active_branch).await?;
        let Some(head) = branch.head_message_id.as_deref() else {
            return Ok(Vec::new());
        };
        let tree = load_tree(&self.store, conversation_id).await?;
        Ok(tree.path_to_root(head)?.into_iter().cloned().collect())
    }

    pub async fn delete_conversation(&self, conversation_id: &str) -> Result<(), AppError> {
        self.store.delete_conversation(conversation_id).await
    }

    // ── Send ─────────────────────────────────────────────────────────────────

    /// Non-streaming send: user message and reply each commit with their own
    /// head advance, so a crash in between leaves the head on the user
    /// message — behind, but valid.
    pub async fn chat(&self, request: ChatRequest) -> Result<ChatResponse, AppError> {
        let pending = self.prepare_send(request).await?;
        match self.generate_with_retry(&pending.context).await {
            Ok(reply) => {
                let message = self.commit_reply(&pending, reply_message(&pending, reply)).await?;
                Ok(ChatResponse {
                    conversation_id: pending.conversation_id.clone(),
                    branch: pending.branch.name.clone(),
                    message,
                })
            }
            Err(e) => {
                // Nothing usable came back; persist the failure as an empty
                // truncated reply so the head still advances, then surface it.
                let mut message = reply_message(&pending, empty_reply(self.agent.model_id()));
                message.truncated = true;
                if let Err(commit_err) = self.commit_reply(&pending, message).await {
                    error!("Failed to persist truncated reply: {commit_err}");
                }
                Err(e)
            }
        }
    }

    /// Validates, resolves or creates the conversation, and commits the user
    /// message onto the active branch. The returned [`PendingReply`] is ready
    /// for either `chat` or the streaming path.
    pub async fn prepare_send(&self, request: ChatRequest) -> Result<PendingReply, AppError> {
        if request.message.trim().is_empty() {
            return Err(AppError::EmptyField { field_name: "message".to_string() });
        }
        if request.message.len() > MAX_MESSAGE_LENGTH {
            return Err(AppError::FieldTooLong {
                field_name: "message".to_string(),
                max_length: MAX_MESSAGE_LENGTH,
                actual_length: request.message.len(),
            });
        }

        let conversation_id = request
            .conversation_id
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        let conversation = match self.store.find_conversation(&conversation_id).await? {
            Some(c) => c,
            None => {
                let conv = Conversation::new(
                    conversation_id.clone(),
                    "local".to_string(),
                    derive_title(&request.message),
                );
                self.store.create_conversation(&conv).await?;
                conv
            }
        };

        let mut branch =
            load_branch(&self.store, &conversation_id, &conversation.active_branch).await?;

        // The user message parents onto whatever the head is at commit time,
        // so each lost CAS race re-reads the branch and re-parents.
        let mut last_err = None;
        for _ in 0..CAS_MAX_ATTEMPTS {
            let user_message = Message::new(
                conversation_id.clone(),
                branch.head_message_id.clone(),
                MessageRole::User,
                request.message.clone(),
            );
            match self
                .store
                .append_and_advance(HeadAdvance {
                    conversation_id: &conversation_id,
                    branch_name: &branch.name,
                    expected_version: branch.version,
                    messages: std::slice::from_ref(&user_message),
                    fork: is_fork_append(&branch),
                    supersede: None,
                })
                .await
            {
                Ok(advanced) => {
                    let tree = load_tree(&self.store, &conversation_id).await?;
                    let context =
                        tree.path_to_root(&user_message.id)?.into_iter().map(PromptMessage::from).collect();
                    return Ok(PendingReply {
                        conversation_id,
                        branch: advanced,
                        context,
                        parent_id: Some(user_message.id),
                        supersede: None,
                        fork: false,
                    });
                }
                Err(e @ AppError::VersionConflict { .. }) => {
                    warn!("Lost head race on branch '{}', retrying", branch.name);
                    branch = load_branch(&self.store, &conversation_id, &branch.name).await?;
                    last_err = Some(e);
                }
                Err(e) => return Err(e),
            }
        }
        Err(last_err.expect("retries exhausted only after a conflict"))
    }

    // ── Regenerate ───────────────────────────────────────────────────────────

    /// Non-streaming regeneration: fork at the parent, supersede the old
    /// reply, land the sibling as the new head.
    pub async fn regenerate(
        &self,
        conversation_id: &str,
        message_id: &str,
    ) -> Result<ChatResponse, AppError> {
        let pending = self.prepare_regenerate(conversation_id, message_id).await?;
        let reply = self.generate_with_retry(&pending.context).await;
        match reply {
            Ok(reply) => {
                let message = self.commit_reply(&pending, reply_message(&pending, reply)).await?;
                Ok(ChatResponse {
                    conversation_id: pending.conversation_id.clone(),
                    branch: pending.branch.name.clone(),
                    message,
                })
            }
            Err(e) => {
                let mut message = reply_message(&pending, empty_reply(self.agent.model_id()));
                message.truncated = true;
                if let Err(commit_err) = self.commit_reply(&pending, message).await {
                    error!("Failed to persist truncated regeneration: {commit_err}");
                }
                Err(e)
            }
        }
    }

    /// Resolves the regeneration target and builds the fork-at-parent
    /// context. Commits nothing: the supersede flag and the sibling land
    /// together when the reply commits.
    pub async fn prepare_regenerate(
        &self,
        conversation_id: &str,
        message_id: &str,
    ) -> Result<PendingReply, AppError> {
        let conversation = load_conversation(&self.store, conversation_id).await?;
        let branch = load_branch(&self.store, conversation_id, &conversation.active_branch).await?;
        let tree = load_tree(&self.store, conversation_id).await?;

        let target = tree
            .get(message_id)
            .ok_or_else(|| AppError::MessageNotFound { id: message_id.to_string() })?;
        if target.role != MessageRole::Assistant {
            return Err(AppError::invalid_operation("only assistant replies can be regenerated"));
        }

        let context = match target.parent_id.as_deref() {
            Some(parent) => tree.path_to_root(parent)?.into_iter().map(PromptMessage::from).collect(),
            None => Vec::new(),
        };

        Ok(PendingReply {
            conversation_id: conversation_id.to_string(),
            branch,
            context,
            parent_id: target.parent_id.clone(),
            supersede: Some(target.id.clone()),
            // A regeneration is by definition a fork at the parent.
            fork: true,
        })
    }

    // ── Generation plumbing ──────────────────────────────────────────────────

    async fn generate_with_retry(
        &self,
        context: &[PromptMessage],
    ) -> Result<GeneratedReply, AppError> {
        let mut backoff = self.generation.retry_backoff;
        let mut attempt = 0;
        loop {
            match self.agent.generate(context).await {
                Ok(reply) => return Ok(reply),
                Err(e) if attempt < self.generation.max_retries => {
                    attempt += 1;
                    warn!("Generation attempt {attempt} failed: {e}; retrying in {backoff:?}");
                    tokio::time::sleep(backoff).await;
                    backoff *= 2;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Streams the reply, forwarding each fragment to `chunks` while
    /// buffering the whole text, and commits exactly one finished message at
    /// the end — complete, or partial and flagged truncated when the stream
    /// failed or was cancelled. Returns the committed message.
    pub async fn stream_reply(
        &self,
        pending: &PendingReply,
        chunks: mpsc::Sender<String>,
        cancel: CancellationToken,
    ) -> Result<Message, AppError> {
        let mut full_content = String::new();
        let mut failure: Option<AppError> = None;
        let mut backoff = self.generation.retry_backoff;
        let mut attempt = 0;

        loop {
            let (tx, mut rx) = mpsc::channel::<String>(self.generation.stream_buffer);
            let agent = self.agent.clone();
            let context = pending.context.clone();
            let producer_cancel = cancel.clone();
            let producer = tokio::spawn(async move {
                agent.stream_generate(&context, tx, producer_cancel).await
            });

            while let Some(chunk) = rx.recv().await {
                full_content.push_str(&chunk);
                if chunks.send(chunk).await.is_err() {
                    // Consumer hung up: treat as cancellation.
                    cancel.cancel();
                }
            }

            match producer.await {
                Ok(Ok(())) => break,
                Ok(Err(e)) => {
                    // Retry only a stream that died before producing
                    // anything; partial output must not be doubled.
                    if full_content.is_empty() && attempt < self.generation.max_retries {
                        attempt += 1;
                        warn!("Stream attempt {attempt} failed: {e}; retrying in {backoff:?}");
                        tokio::time::sleep(backoff).await;
                        backoff *= 2;
                        continue;
                    }
                    failure = Some(e);
                    break;
                }
                Err(e) => {
                    error!("Generation task panicked: {e}");
                    failure = Some(AppError::Unexpected("generation task panicked".to_string()));
                    break;
                }
            }
        }

        let truncated = failure.is_some() || cancel.is_cancelled();
        if let Some(e) = &failure {
            error!("Generation stream failed; committing partial reply: {e}");
        }

        let mut message = reply_message(
            pending,
            GeneratedReply {
                content: full_content,
                model: self.agent.model_id().to_string(),
                prompt_tokens: None,
                completion_tokens: None,
            },
        );
        message.truncated = truncated;
        self.commit_reply(pending, message).await
    }

    /// Commits the reply with a CAS head advance, re-reading the branch on a
    /// lost race. The parent is pinned — retries move the head, not the
    /// attachment point.
    async fn commit_reply(
        &self,
        pending: &PendingReply,
        message: Message,
    ) -> Result<Message, AppError> {
        let mut branch = pending.branch.clone();
        let mut last_err = None;
        for _ in 0..CAS_MAX_ATTEMPTS {
            match self
                .store
                .append_and_advance(HeadAdvance {
                    conversation_id: &pending.conversation_id,
                    branch_name: &branch.name,
                    expected_version: branch.version,
                    messages: std::slice::from_ref(&message),
                    fork: pending.fork,
                    supersede: pending.supersede.as_deref(),
                })
                .await
            {
                Ok(_) => return Ok(message),
                Err(e @ AppError::VersionConflict { .. }) => {
                    warn!("Lost head race committing reply on '{}', retrying", branch.name);
                    branch =
                        load_branch(&self.store, &pending.conversation_id, &branch.name).await?;
                    last_err = Some(e);
                }
                Err(e) => return Err(e),
            }
        }
        Err(last_err.expect("retries exhausted only after a conflict"))
    }
}

fn derive_title(message: &str) -> String {
    let t = message.trim();
    if t.chars().count() > 60 {
        format!("{}…", t.chars().take(60).collect::<String>())
    } else {
        t.to_string()
    }
}

fn reply_message(pending: &PendingReply, reply: GeneratedReply) -> Message {
    let mut message = Message::new(
        pending.conversation_id.clone(),
        pending.parent_id.clone(),
        MessageRole::Assistant,
        reply.content,
    );
    message.model = Some(reply.model);
    message.prompt_tokens = reply.prompt_tokens;
    message.completion_tokens = reply.completion_tokens;
    message
}

fn empty_reply(model: &str) -> GeneratedReply {
    GeneratedReply {
        content: String::new(),
        model: model.to_string(),
        prompt_tokens: None,
        completion_tokens: None,
    }
}
