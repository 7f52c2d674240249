use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::agent::{GeneratedReply, GenerationService, PromptMessage};
use crate::errors::AppError;
use crate::models::MessageRole;

const MODEL_ID: &str = "scripted";

/// Deterministic local backend: replies are a pure function of the context.
/// Used when no model server is available (dev mode) and throughout the
/// test suite.
pub struct ScriptedGenerationService {
    fragment_delay: Duration,
}

impl Default for ScriptedGenerationService {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptedGenerationService {
    pub fn new() -> Self {
        Self { fragment_delay: Duration::ZERO }
    }

    /// Pause between fragments, to mimic real token cadence in the UI.
    pub fn with_fragment_delay(mut self, delay: Duration) -> Self {
        self.fragment_delay = delay;
        self
    }

    fn reply_for(&self, context: &[PromptMessage]) -> GeneratedReply {
        let last_user = context
            .iter()
            .rev()
            .find(|m| m.role == MessageRole::User)
            .map(|m| m.content.as_str())
            .unwrap_or("nothing");
        let content = format!(
            "You said: \"{last_user}\". This is a scripted reply over {} context message(s).",
            context.len()
        );
        let prompt_tokens: usize = context.iter().map(|m| m.content.split_whitespace().count()).sum();
        let completion_tokens = content.split_whitespace().count();
        GeneratedReply {
            content,
            model: MODEL_ID.to_string(),
            prompt_tokens: Some(prompt_tokens as i64),
            completion_tokens: Some(completion_tokens as i64),
        }
    }
}

#[async_trait]
impl GenerationService for ScriptedGenerationService {
    fn model_id(&self) -> &str {
        MODEL_ID
    }

    async fn generate(&self, context: &[PromptMessage]) -> Result<GeneratedReply, AppError> {
        Ok(self.reply_for(context))
    }

    async fn stream_generate(
        &self,
        context: &[PromptMessage],
        fragments: mpsc::Sender<String>,
        cancel: CancellationToken,
    ) -> Result<(), AppError> {
        let reply = self.reply_for(context);
        let mut words = reply.content.split_inclusive(' ');
        // First fragment goes out before any delay so consumers see output
        // immediately.
        if let Some(first) = words.next() {
            if fragments.send(first.to_string()).await.is_err() {
                return Ok(());
            }
        }
        for word in words {
            if !self.fragment_delay.is_zero() {
                tokio::select! {
                    _ = cancel.cancelled() => return Ok(()),
                    _ = tokio::time::sleep(self.fragment_delay) => {}
                }
            } else if cancel.is_cancelled() {
                return Ok(());
            }
            if fragments.send(word.to_string()).await.is_err() {
                return Ok(());
            }
        }
        Ok(())
    }
}
