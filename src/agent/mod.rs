//! Generation capability consumed by the orchestrator: one interface, one
//! implementation per vendor, selected by explicit configuration.

mod ollama;
mod scripted;

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

pub use ollama::OllamaGenerationService;
pub use scripted::ScriptedGenerationService;

use crate::config::{GenerationBackend, GenerationSettings};
use crate::errors::AppError;
use crate::models::{Message, MessageRole};

/// One context item replayed to the model, stripped to what vendors need.
#[derive(Debug, Clone)]
pub struct PromptMessage {
    pub role: MessageRole,
    pub content: String,
}

impl From<&Message> for PromptMessage {
    fn from(m: &Message) -> Self {
        Self { role: m.role, content: m.content.clone() }
    }
}

/// A finished (non-streamed) reply.
#[derive(Debug, Clone)]
pub struct GeneratedReply {
    pub content: String,
    pub model: String,
    pub prompt_tokens: Option<i64>,
    pub completion_tokens: Option<i64>,
}

#[async_trait]
pub trait GenerationService: Send + Sync {
    /// Identifier stamped onto messages this service produces.
    fn model_id(&self) -> &str;

    async fn generate(&self, context: &[PromptMessage]) -> Result<GeneratedReply, AppError>;

    /// Streams fragments into `fragments` until the reply finishes, the
    /// token is cancelled, or the vendor fails. Returning `Ok` after
    /// cancellation is normal — the consumer owns what was received so far.
    /// A closed receiver also ends the stream without error.
    async fn stream_generate(
        &self,
        context: &[PromptMessage],
        fragments: mpsc::Sender<String>,
        cancel: CancellationToken,
    ) -> Result<(), AppError>;
}

pub fn make_generation_service(settings: &GenerationSettings) -> Arc<dyn GenerationService> {
    match settings.backend {
        GenerationBackend::Ollama => Arc::new(OllamaGenerationService::new(
            &settings.ollama_base_url,
            settings.model.clone(),
        )),
        GenerationBackend::Scripted => Arc::new(ScriptedGenerationService::new()),
    }
}
