use std::time::Duration;

/// Runtime settings, read once at startup from the environment
/// (`.env` is loaded first in `main` as a development convenience).
#[derive(Debug, Clone)]
pub struct Settings {
    pub port: u16,
    /// When unset the server runs on the in-memory store (dev mode).
    pub database_url: Option<String>,
    pub generation: GenerationSettings,
}

#[derive(Debug, Clone)]
pub struct GenerationSettings {
    pub backend: GenerationBackend,
    pub ollama_base_url: String,
    pub model: String,
    /// Retries after a failed generation call, before the partial result is
    /// committed as truncated and the failure surfaced.
    pub max_retries: u32,
    pub retry_backoff: Duration,
    /// Capacity of the fragment channel between producer task and consumer.
    pub stream_buffer: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GenerationBackend {
    Ollama,
    /// Deterministic local replies; no model server required.
    Scripted,
}

impl Settings {
    pub fn from_env() -> anyhow::Result<Self> {
        let port = std::env::var("PORT")
            .ok()
            .and_then(|p| p.parse().ok())
            .unwrap_or(8080);

        let database_url = std::env::var("DATABASE_URL").ok().filter(|s| !s.is_empty());

        let backend = match std::env::var("GENERATION_BACKEND").as_deref() {
            Ok("scripted") => GenerationBackend::Scripted,
            Ok("ollama") | Err(_) => GenerationBackend::Ollama,
            Ok(other) => anyhow::bail!("Unknown GENERATION_BACKEND: {other}"),
        };

        let generation = GenerationSettings {
            backend,
            ollama_base_url: std::env::var("OLLAMA_API_BASE_URL")
                .unwrap_or_else(|_| "http://localhost:11434".to_string()),
            model: std::env::var("OLLAMA_MODEL").unwrap_or_else(|_| "llama3.2".to_string()),
            max_retries: std::env::var("GENERATION_MAX_RETRIES")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(2),
            retry_backoff: Duration::from_millis(
                std::env::var("GENERATION_RETRY_BACKOFF_MS")
                    .ok()
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(500),
            ),
            stream_buffer: 64,
        };

        Ok(Self { port, database_url, generation })
    }
}

impl GenerationSettings {
    /// Defaults suitable for tests: scripted backend, no backoff delay.
    pub fn scripted() -> Self {
        Self {
            backend: GenerationBackend::Scripted,
            ollama_base_url: String::new(),
            model: "scripted".to_string(),
            max_retries: 1,
            retry_backoff: Duration::from_millis(0),
            stream_buffer: 64,
        }
    }
}
