//! Text completion capability.

pub mod ollama;

pub use ollama::OllamaCompleter;

#[derive(Debug, Clone, thiserror::Error)]
pub enum CompletionError {
    #[error("completion timed out")]
    Timeout,

    #[error("completion rate limited")]
    RateLimited,

    #[error("could not reach completion backend: {0}")]
    Connection(String),

    #[error("completion backend returned status {status}: {message}")]
    Upstream { status: u16, message: String },

    #[error("invalid completion response: {0}")]
    InvalidResponse(String),

    #[error("not supported by this backend: {0}")]
    Unsupported(String),
}

impl CompletionError {
    /// Whether waiting and trying again can help.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Timeout | Self::RateLimited | Self::Connection(_) => true,
            Self::Upstream { status, .. } => *status >= 500,
            Self::InvalidResponse(_) | Self::Unsupported(_) => false,
        }
    }
}

pub trait Completer: Send + Sync {
    fn complete(&self, prompt: &str) -> Result<String, CompletionError>;

    /// Completion constrained to a JSON document where the backend supports it.
    fn complete_json(&self, prompt: &str) -> Result<String, CompletionError> {
        self.complete(prompt)
    }

    fn model_name(&self) -> String;

    /// Models the backend can serve.
    fn list_models(&self) -> Result<Vec<String>, CompletionError> {
        Ok(vec![self.model_name()])
    }

    fn set_model(&self, model: &str) -> Result<(), CompletionError> {
        Err(CompletionError::Unsupported(format!("switching to model {model}")))
    }
}
