use std::time::Duration;

use thiserror::Error;

/// Failures of the external LLM collaborator.
#[derive(Debug, Error)]
pub enum LlmError {
    #[error("LLM call timed out after {0:?}")]
    Timeout(Duration),

    #[error("Model not found: {0}")]
    ModelNotFound(String),

    #[error("API key for provider '{0}' is not configured")]
    MissingApiKey(String),

    #[error("Unsupported AI provider: {0}")]
    UnsupportedProvider(String),

    #[error("LLM API error ({status}): {body}")]
    Api { status: u16, body: String },

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("LLM returned an empty response")]
    EmptyResponse,
}

impl LlmError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, LlmError::Timeout(_))
    }
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("Invalid input: {0}")]
    Validation(String),

    #[error("{kind} {id} not found")]
    NotFound { kind: &'static str, id: i64 },

    #[error("Note {note_id} was modified concurrently")]
    Conflict { note_id: i64 },

    #[error(transparent)]
    Llm(#[from] LlmError),

    #[error("AI queue error: {0}")]
    Queue(String),

    #[error("Storage error: {0}")]
    Storage(#[from] sqlx::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    pub fn note_not_found(id: i64) -> Self {
        Error::NotFound { kind: "Note", id }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
