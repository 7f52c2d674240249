//! End-to-end branching scenarios over the in-memory store and the scripted
//! generation backend: send, regenerate, fork, switch, merge, and the
//! streaming/cancellation path.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use braid::agent::{GeneratedReply, GenerationService, PromptMessage, ScriptedGenerationService};
use braid::config::GenerationSettings;
use braid::db::memory::MemoryStore;
use braid::db::store::ChatStore;
use braid::errors::AppError;
use braid::models::{ChatRequest, ChatResponse, MergePolicy, MessageRole, DEFAULT_BRANCH};
use braid::service::branch_service::BranchService;
use braid::service::chat_service::ChatService;

fn services_with(agent: Arc<dyn GenerationService>) -> (Arc<dyn ChatStore>, ChatService, BranchService) {
    let store: Arc<dyn ChatStore> = Arc::new(MemoryStore::new());
    let chat = ChatService::new(store.clone(), agent, GenerationSettings::scripted());
    let branches = BranchService::new(store.clone());
    (store, chat, branches)
}

fn services() -> (Arc<dyn ChatStore>, ChatService, BranchService) {
    services_with(Arc::new(ScriptedGenerationService::new()))
}

async fn send(chat: &ChatService, conversation_id: Option<&str>, text: &str) -> ChatResponse {
    chat.chat(ChatRequest {
        conversation_id: conversation_id.map(String::from),
        message: text.to_string(),
    })
    .await
    .expect("send failed")
}

#[tokio::test]
async fn send_creates_conversation_with_default_branch() {
    let (store, chat, _branches) = services();
    let response = send(&chat, None, "Hi").await;

    assert_eq!(response.branch, DEFAULT_BRANCH);
    assert_eq!(response.message.role, MessageRole::Assistant);

    let branch = store
        .find_branch(&response.conversation_id, DEFAULT_BRANCH)
        .await
        .unwrap()
        .unwrap();
    // User message then reply: two head advances.
    assert_eq!(branch.version, 2);
    assert_eq!(branch.head_message_id.as_deref(), Some(response.message.id.as_str()));

    let messages = chat.get_messages(&response.conversation_id).await.unwrap();
    assert_eq!(messages.len(), 2);
    assert_eq!(messages[0].role, MessageRole::User);
    assert_eq!(messages[0].content, "Hi");
    assert!(messages[0].parent_id.is_none());
}

#[tokio::test]
async fn regenerate_supersedes_without_losing_anything() {
    let (store, chat, _branches) = services();
    let first = send(&chat, None, "Hi").await;
    let conv = first.conversation_id.clone();

    let before = store.conversation_messages(&conv).await.unwrap().len();
    let regenerated = chat.regenerate(&conv, &first.message.id).await.unwrap();

    // A sibling under the same parent, never a replacement.
    assert_ne!(regenerated.message.id, first.message.id);
    let old = store.find_message(&conv, &first.message.id).await.unwrap().unwrap();
    let new = store.find_message(&conv, &regenerated.message.id).await.unwrap().unwrap();
    assert_eq!(old.parent_id, new.parent_id);
    assert!(old.superseded);
    assert!(!new.superseded);

    // Message count only ever grows.
    let after = store.conversation_messages(&conv).await.unwrap().len();
    assert_eq!(after, before + 1);

    let branch = store.find_branch(&conv, DEFAULT_BRANCH).await.unwrap().unwrap();
    assert_eq!(branch.head_message_id.as_deref(), Some(regenerated.message.id.as_str()));

    // The active path now runs through the new sibling.
    let path = chat.get_messages(&conv).await.unwrap();
    assert!(path.iter().any(|m| m.id == regenerated.message.id));
    assert!(!path.iter().any(|m| m.id == first.message.id));
}

#[tokio::test]
async fn regenerating_a_user_message_is_rejected() {
    let (_store, chat, _branches) = services();
    let first = send(&chat, None, "Hi").await;
    let conv = first.conversation_id.clone();
    let user_id = chat.get_messages(&conv).await.unwrap()[0].id.clone();

    let err = chat.regenerate(&conv, &user_id).await.unwrap_err();
    assert!(matches!(err, AppError::InvalidOperation { .. }));
}

#[tokio::test]
async fn appending_after_a_superseded_head_requires_a_fork() {
    let (_store, chat, branches) = services();
    let first = send(&chat, None, "Hi").await;
    let conv = first.conversation_id.clone();
    chat.regenerate(&conv, &first.message.id).await.unwrap();

    // Branch created on the superseded reply: sending there is the explicit
    // fork the append rule asks for.
    branches.create_branch(&conv, "salvage", &first.message.id).await.unwrap();
    branches.switch_branch(&conv, "salvage").await.unwrap();
    let on_fork = send(&chat, Some(&conv), "continue the old reply").await;

    let path = chat.get_messages(&conv).await.unwrap();
    assert!(path.iter().any(|m| m.id == first.message.id));
    assert!(path.iter().any(|m| m.id == on_fork.message.id));
}

/// The full walkthrough: Hi/Hello, regenerate, fork at the first user
/// message, reply on the fork, merge back.
#[tokio::test]
async fn fork_switch_merge_walkthrough() {
    let (store, chat, branches) = services();

    let first = send(&chat, None, "Hi").await;
    let conv = first.conversation_id.clone();
    let user_hi = chat.get_messages(&conv).await.unwrap()[0].clone();

    let regenerated = chat.regenerate(&conv, &first.message.id).await.unwrap();

    // Fork at the user message and continue there.
    branches.create_branch(&conv, "alt", &user_hi.id).await.unwrap();
    branches.switch_branch(&conv, "alt").await.unwrap();
    let bye = send(&chat, Some(&conv), "Bye").await;

    let alt_path = chat.get_messages(&conv).await.unwrap();
    let bye_user = alt_path.iter().find(|m| m.content == "Bye").unwrap().clone();

    // Merge alt back into main.
    let main_before = store.find_branch(&conv, DEFAULT_BRANCH).await.unwrap().unwrap();
    let tree_before = store.conversation_messages(&conv).await.unwrap().len();
    let merged = branches
        .merge(&conv, "alt", DEFAULT_BRANCH, MergePolicy::Append)
        .await
        .unwrap();

    // One head advance for the whole segment.
    assert_eq!(merged.version, main_before.version + 1);
    // Segment re-appended as fresh nodes: "Bye" + its reply.
    let tree_after = store.conversation_messages(&conv).await.unwrap().len();
    assert_eq!(tree_after, tree_before + 2);

    // The originals are untouched; the copies chain after main's head.
    let original = store.find_message(&conv, &bye_user.id).await.unwrap().unwrap();
    assert_eq!(original.parent_id, bye_user.parent_id);
    branches.switch_branch(&conv, DEFAULT_BRANCH).await.unwrap();
    let main_path = chat.get_messages(&conv).await.unwrap();
    let ids: Vec<&str> = main_path.iter().map(|m| m.id.as_str()).collect();
    assert_eq!(ids[0], user_hi.id);
    assert_eq!(ids[1], regenerated.message.id);
    let copied_bye = &main_path[2];
    assert_eq!(copied_bye.content, "Bye");
    assert_ne!(copied_bye.id, bye_user.id);
    assert_eq!(main_path[3].content, bye.message.content);

    // alt itself never moved.
    let alt = store.find_branch(&conv, "alt").await.unwrap().unwrap();
    assert_eq!(alt.head_message_id.as_deref(), Some(bye.message.id.as_str()));
}

#[tokio::test]
async fn merge_twice_appends_twice() {
    let (store, chat, branches) = services();
    let first = send(&chat, None, "Hi").await;
    let conv = first.conversation_id.clone();
    let user_hi = chat.get_messages(&conv).await.unwrap()[0].clone();

    branches.create_branch(&conv, "alt", &user_hi.id).await.unwrap();
    branches.switch_branch(&conv, "alt").await.unwrap();
    send(&chat, Some(&conv), "Bye").await;
    branches.switch_branch(&conv, DEFAULT_BRANCH).await.unwrap();

    let before = store.conversation_messages(&conv).await.unwrap().len();
    let once = branches.merge(&conv, "alt", DEFAULT_BRANCH, MergePolicy::Append).await.unwrap();
    let after_once = store.conversation_messages(&conv).await.unwrap().len();
    let twice = branches.merge(&conv, "alt", DEFAULT_BRANCH, MergePolicy::Append).await.unwrap();
    let after_twice = store.conversation_messages(&conv).await.unwrap().len();

    // Append policy is deliberately not idempotent: the segment lands again.
    assert_eq!(after_once, before + 2);
    assert_eq!(after_twice, after_once + 2);
    assert_eq!(twice.version, once.version + 1);
}

#[tokio::test]
async fn merge_into_itself_is_a_no_op() {
    let (store, chat, branches) = services();
    let first = send(&chat, None, "Hi").await;
    let conv = first.conversation_id.clone();

    let before = store.find_branch(&conv, DEFAULT_BRANCH).await.unwrap().unwrap();
    let merged = branches
        .merge(&conv, DEFAULT_BRANCH, DEFAULT_BRANCH, MergePolicy::Append)
        .await
        .unwrap();
    assert_eq!(merged.version, before.version);
    assert_eq!(merged.head_message_id, before.head_message_id);
}

#[tokio::test]
async fn fail_on_conflict_aborts_before_writing() {
    let (store, chat, branches) = services();
    let first = send(&chat, None, "Hi").await;
    let conv = first.conversation_id.clone();

    // Fork at the reply, then ask a different question on each side: two
    // user messages at the same depth offset past the merge base.
    branches.create_branch(&conv, "alt", &first.message.id).await.unwrap();
    branches.switch_branch(&conv, "alt").await.unwrap();
    send(&chat, Some(&conv), "Tell me about boats").await;
    branches.switch_branch(&conv, DEFAULT_BRANCH).await.unwrap();
    send(&chat, Some(&conv), "Tell me about trains").await;

    let before = store.conversation_messages(&conv).await.unwrap().len();
    let err = branches
        .merge(&conv, "alt", DEFAULT_BRANCH, MergePolicy::FailOnConflict)
        .await
        .unwrap_err();
    match err {
        AppError::MergeConflict { conflicts } => {
            assert_eq!(conflicts.len(), 1);
            assert_eq!(conflicts[0].role, MessageRole::User);
        }
        other => panic!("expected merge conflict, got {other:?}"),
    }
    // All-or-nothing: nothing was appended.
    assert_eq!(store.conversation_messages(&conv).await.unwrap().len(), before);

    // The same merge under append policy goes through.
    branches.merge(&conv, "alt", DEFAULT_BRANCH, MergePolicy::Append).await.unwrap();
}

#[tokio::test]
async fn switch_round_trip_is_idempotent() {
    let (_store, chat, branches) = services();
    let first = send(&chat, None, "Hi").await;
    let conv = first.conversation_id.clone();
    let user_hi = chat.get_messages(&conv).await.unwrap()[0].clone();
    branches.create_branch(&conv, "alt", &user_hi.id).await.unwrap();

    let main_path_before = chat.get_messages(&conv).await.unwrap();
    branches.switch_branch(&conv, "alt").await.unwrap();
    branches.switch_branch(&conv, DEFAULT_BRANCH).await.unwrap();
    let main_path_after = chat.get_messages(&conv).await.unwrap();

    let ids = |msgs: &[braid::models::Message]| {
        msgs.iter().map(|m| m.id.clone()).collect::<Vec<_>>()
    };
    assert_eq!(ids(&main_path_before), ids(&main_path_after));
}

#[tokio::test]
async fn deleting_active_or_default_branch_is_rejected() {
    let (store, chat, branches) = services();
    let first = send(&chat, None, "Hi").await;
    let conv = first.conversation_id.clone();
    let user_hi = chat.get_messages(&conv).await.unwrap()[0].clone();
    branches.create_branch(&conv, "alt", &user_hi.id).await.unwrap();

    // Active branch.
    let err = branches.delete_branch(&conv, DEFAULT_BRANCH).await.unwrap_err();
    assert!(matches!(err, AppError::InvalidOperation { .. }));

    // Default branch, even when no longer active.
    branches.switch_branch(&conv, "alt").await.unwrap();
    let err = branches.delete_branch(&conv, DEFAULT_BRANCH).await.unwrap_err();
    assert!(matches!(err, AppError::InvalidOperation { .. }));

    // Nothing changed.
    assert_eq!(branches.list_branches(&conv).await.unwrap().len(), 2);

    // A plain branch deletes fine once inactive, and messages survive.
    branches.switch_branch(&conv, DEFAULT_BRANCH).await.unwrap();
    let messages_before = store.conversation_messages(&conv).await.unwrap().len();
    branches.delete_branch(&conv, "alt").await.unwrap();
    assert_eq!(store.conversation_messages(&conv).await.unwrap().len(), messages_before);
}

#[tokio::test]
async fn history_annotates_branch_membership() {
    let (_store, chat, branches) = services();
    let first = send(&chat, None, "Hi").await;
    let conv = first.conversation_id.clone();
    let user_hi = chat.get_messages(&conv).await.unwrap()[0].clone();

    let regenerated = chat.regenerate(&conv, &first.message.id).await.unwrap();
    branches.create_branch(&conv, "alt", &user_hi.id).await.unwrap();

    let root = branches.history(&conv).await.unwrap().unwrap();
    assert_eq!(root.message.id, user_hi.id);
    assert_eq!(root.branch_labels, ["alt", "main"]);

    // The superseded reply is still rendered, but no branch runs through it.
    let old = root.children.iter().find(|n| n.message.id == first.message.id).unwrap();
    assert!(old.branch_labels.is_empty());
    assert!(old.message.superseded);
    let new = root.children.iter().find(|n| n.message.id == regenerated.message.id).unwrap();
    assert_eq!(new.branch_labels, ["main"]);
}

#[tokio::test]
async fn concurrent_head_advances_elect_one_winner() {
    let (store, chat, _branches) = services();
    let first = send(&chat, None, "Hi").await;
    let conv = first.conversation_id.clone();
    let user_hi = chat.get_messages(&conv).await.unwrap()[0].clone();
    let branch = store.find_branch(&conv, DEFAULT_BRANCH).await.unwrap().unwrap();

    // Two writers race the same CAS back to the user message.
    let (a, b) = tokio::join!(
        store.advance_head(&conv, DEFAULT_BRANCH, &user_hi.id, branch.version),
        store.advance_head(&conv, DEFAULT_BRANCH, &user_hi.id, branch.version),
    );
    let winners = [&a, &b].iter().filter(|r| r.is_ok()).count();
    assert_eq!(winners, 1);
    let loser = if a.is_err() { a.unwrap_err() } else { b.unwrap_err() };
    assert!(matches!(loser, AppError::VersionConflict { .. }));

    let after = store.find_branch(&conv, DEFAULT_BRANCH).await.unwrap().unwrap();
    assert_eq!(after.version, branch.version + 1);
}

#[tokio::test]
async fn cancelled_stream_commits_truncated_partial() {
    let agent = Arc::new(
        ScriptedGenerationService::new().with_fragment_delay(Duration::from_millis(20)),
    );
    let (store, chat, _branches) = services_with(agent);

    let pending = chat
        .prepare_send(ChatRequest {
            conversation_id: None,
            message: "Stream me a long reply please".to_string(),
        })
        .await
        .unwrap();
    let conv = pending.conversation_id.clone();

    let cancel = CancellationToken::new();
    let (tx, mut rx) = mpsc::channel::<String>(64);
    let canceller = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(70)).await;
            cancel.cancel();
            // Keep draining so the stream is not blocked on a full channel.
            while rx.recv().await.is_some() {}
        })
    };

    let message = chat.stream_reply(&pending, tx, cancel).await.unwrap();
    canceller.await.unwrap();

    assert!(message.truncated);
    assert!(!message.content.is_empty());

    // The partial is durably on the branch head — cancellation never
    // discards received content.
    let branch = store.find_branch(&conv, DEFAULT_BRANCH).await.unwrap().unwrap();
    assert_eq!(branch.head_message_id.as_deref(), Some(message.id.as_str()));
}

#[tokio::test]
async fn completed_stream_commits_untruncated_reply() {
    let (_store, chat, _branches) = services();
    let pending = chat
        .prepare_send(ChatRequest {
            conversation_id: None,
            message: "Hello there".to_string(),
        })
        .await
        .unwrap();
    let conv = pending.conversation_id.clone();

    let cancel = CancellationToken::new();
    let (tx, mut rx) = mpsc::channel::<String>(64);
    let collector = tokio::spawn(async move {
        let mut seen = String::new();
        while let Some(chunk) = rx.recv().await {
            seen.push_str(&chunk);
        }
        seen
    });

    let message = chat.stream_reply(&pending, tx, cancel).await.unwrap();
    let forwarded = collector.await.unwrap();

    assert!(!message.truncated);
    // The consumer saw exactly what was committed.
    assert_eq!(forwarded, message.content);
    let path = chat.get_messages(&conv).await.unwrap();
    assert_eq!(path.last().unwrap().id, message.id);
}

/// Vendor that always fails, for the retry-then-persist path.
struct FailingGenerator;

#[async_trait]
impl GenerationService for FailingGenerator {
    fn model_id(&self) -> &str {
        "failing"
    }

    async fn generate(&self, _context: &[PromptMessage]) -> Result<GeneratedReply, AppError> {
        Err(AppError::InferenceError { message: "boom".to_string() })
    }

    async fn stream_generate(
        &self,
        _context: &[PromptMessage],
        _fragments: mpsc::Sender<String>,
        _cancel: CancellationToken,
    ) -> Result<(), AppError> {
        Err(AppError::InferenceError { message: "boom".to_string() })
    }
}

#[tokio::test]
async fn exhausted_generation_persists_truncated_reply_and_surfaces() {
    let (store, chat, _branches) = services_with(Arc::new(FailingGenerator));

    let err = chat
        .chat(ChatRequest { conversation_id: None, message: "Hi".to_string() })
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::InferenceError { .. }));

    // The user message and a truncated reply both landed; the head advanced.
    let conversations = store.list_conversations().await.unwrap();
    assert_eq!(conversations.len(), 1);
    let conv = conversations[0].id.clone();
    let messages = store.conversation_messages(&conv).await.unwrap();
    assert_eq!(messages.len(), 2);
    let reply = messages.iter().find(|m| m.role == MessageRole::Assistant).unwrap();
    assert!(reply.truncated);

    let branch = store.find_branch(&conv, DEFAULT_BRANCH).await.unwrap().unwrap();
    assert_eq!(branch.head_message_id.as_deref(), Some(reply.id.as_str()));
}

#[tokio::test]
async fn deleting_a_conversation_cascades_everywhere() {
    let (store, chat, branches) = services();
    let first = send(&chat, None, "Hi").await;
    let conv = first.conversation_id.clone();
    let user_hi = chat.get_messages(&conv).await.unwrap()[0].clone();
    branches.create_branch(&conv, "alt", &user_hi.id).await.unwrap();

    chat.delete_conversation(&conv).await.unwrap();
    assert!(store.find_conversation(&conv).await.unwrap().is_none());
    let err = store.conversation_messages(&conv).await.unwrap_err();
    assert!(matches!(err, AppError::ConversationNotFound { .. }));
}
