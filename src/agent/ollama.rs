use async_trait::async_trait;
use futures_util::StreamExt;
use rig::client::Nothing;
use rig::completion::Chat;
use rig::message::Message as RigMessage;
use rig::prelude::CompletionClient;
use rig::providers::ollama;
use rig::agent::MultiTurnStreamItem;
use rig::streaming::{StreamedAssistantContent, StreamingChat};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::error;

use crate::agent::{GeneratedReply, GenerationService, PromptMessage};
use crate::errors::AppError;
use crate::models::MessageRole;

const PREAMBLE: &str = "You are a helpful AI assistant running locally via Ollama. \
                        Be concise, accurate, and friendly. \
                        If you don't know something, say so.";

/// Splits a context into rig history plus the final prompt. System messages
/// are carried by the preamble, not the history.
fn to_rig_parts(context: &[PromptMessage]) -> (Vec<RigMessage>, String) {
    let prompt = context
        .last()
        .map(|m| m.content.clone())
        .unwrap_or_default();
    let history = context[..context.len().saturating_sub(1)]
        .iter()
        .filter_map(|m| match m.role {
            MessageRole::User => Some(RigMessage::user(&m.content)),
            MessageRole::Assistant => Some(RigMessage::assistant(&m.content)),
            MessageRole::System => None,
        })
        .collect();
    (history, prompt)
}

/// Ollama vendor behind the generation interface, via rig. A fresh agent is
/// built per request so the history is replayed from storage each time.
#[derive(Clone)]
pub struct OllamaGenerationService {
    client: ollama::Client,
    base_url: String,
    model: String,
}

impl OllamaGenerationService {
    pub fn new(base_url: &str, model: String) -> Self {
        let client = ollama::Client::builder()
            .api_key(Nothing)
            .base_url(base_url)
            .build()
            .expect("Failed to build Ollama client");
        Self { client, base_url: base_url.to_string(), model }
    }

    fn classify_error(&self, msg: String) -> AppError {
        if msg.contains("Connection refused") || msg.contains("connect") {
            AppError::OllamaUnavailable { host: self.base_url.clone() }
        } else if msg.contains("model") {
            AppError::ModelNotFound { model_name: self.model.clone() }
        } else {
            AppError::InferenceError { message: msg }
        }
    }
}

#[async_trait]
impl GenerationService for OllamaGenerationService {
    fn model_id(&self) -> &str {
        &self.model
    }

    async fn generate(&self, context: &[PromptMessage]) -> Result<GeneratedReply, AppError> {
        let agent = self.client.agent(&self.model).preamble(PREAMBLE).build();
        let (history, prompt) = to_rig_parts(context);

        let content = agent.chat(prompt, history).await.map_err(|e| {
            error!("Ollama inference failed: {e}");
            self.classify_error(e.to_string())
        })?;

        Ok(GeneratedReply {
            content,
            model: self.model.clone(),
            prompt_tokens: None,
            completion_tokens: None,
        })
    }

    async fn stream_generate(
        &self,
        context: &[PromptMessage],
        fragments: mpsc::Sender<String>,
        cancel: CancellationToken,
    ) -> Result<(), AppError> {
        let agent = self.client.agent(&self.model).preamble(PREAMBLE).build();
        let (history, prompt) = to_rig_parts(context);

        let mut stream = agent.stream_chat(prompt, history).await;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                chunk = stream.next() => match chunk {
                    None => return Ok(()),
                    Some(Ok(MultiTurnStreamItem::StreamAssistantItem(
                        StreamedAssistantContent::Text(text),
                    ))) => {
                        if fragments.send(text.text).await.is_err() {
                            // Consumer hung up; stop generating.
                            return Ok(());
                        }
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        error!("Ollama stream died: {e}");
                        return Err(self.classify_error(e.to_string()));
                    }
                },
            }
        }
    }
}
