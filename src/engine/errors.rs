use crate::codebase::CodebaseError;
use crate::fetch::FetchError;
use crate::index::IndexError;
use crate::llm::CompletionError;

#[derive(thiserror::Error, Debug)]
pub enum EngineError {
    #[error("invalid input: {0}")]
    Validation(String),

    #[error("{0} not found")]
    NotFound(String),

    #[error("fetch error: {0}")]
    Fetch(FetchError),

    #[error("index error: {0}")]
    Index(IndexError),

    #[error("codebase error: {0}")]
    Codebase(CodebaseError),

    #[error("completion error: {0}")]
    Completion(#[from] CompletionError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("unexpected error: {0:?}")]
    Other(#[from] anyhow::Error),
}

/// Coarse error classes, mapped to exit codes and HTTP statuses by callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    Invalid,
    NotFound,
    Conflict,
    Internal,
}

impl EngineError {
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::Validation(_) => ErrorClass::Invalid,
            Self::NotFound(_) => ErrorClass::NotFound,
            Self::Index(e) if e.is_consistency_violation() => ErrorClass::Conflict,
            _ => ErrorClass::Internal,
        }
    }
}

impl From<FetchError> for EngineError {
    fn from(err: FetchError) -> Self {
        match err {
            FetchError::InvalidIdentity(msg) => Self::Validation(msg),
            other => Self::Fetch(other),
        }
    }
}

impl From<IndexError> for EngineError {
    fn from(err: IndexError) -> Self {
        match err {
            IndexError::Validation(msg) => Self::Validation(msg),
            other => Self::Index(other),
        }
    }
}

impl From<CodebaseError> for EngineError {
    fn from(err: CodebaseError) -> Self {
        match err {
            CodebaseError::Validation(msg) => Self::Validation(msg),
            CodebaseError::NotFound(path) => Self::NotFound(path.display().to_string()),
            other => Self::Codebase(other),
        }
    }
}
