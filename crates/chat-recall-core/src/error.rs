//! Error taxonomy for chat-recall.
//!
//! [`RecallError`] is what the query path renders back to the user; every
//! failure that crosses `handle_inbound` ends up as one of its variants.
//! [`ProviderError`] is the narrower failure type returned by embedding and
//! stance providers, split into retryable and non-retryable cases.

use thiserror::Error;

/// Failure of an external provider call (embedding, stance classification).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProviderError {
    /// Quota, timeout, 429/5xx, network. Worth retrying with backoff.
    #[error("transient provider error: {0}")]
    Transient(String),

    /// Bad request, bad credentials, malformed response. Retrying now won't help.
    #[error("permanent provider error: {0}")]
    Permanent(String),
}

impl ProviderError {
    pub fn is_transient(&self) -> bool {
        matches!(self, ProviderError::Transient(_))
    }

    pub fn message(&self) -> &str {
        match self {
            ProviderError::Transient(m) | ProviderError::Permanent(m) => m,
        }
    }
}

/// Main error type for the query and alias-management paths.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RecallError {
    /// Structurally invalid input (export entry, CLI argument).
    #[error("malformed input: {0}")]
    MalformedInput(String),

    /// External provider failed after the retry policy was exhausted.
    #[error(transparent)]
    Provider(#[from] ProviderError),

    /// Nickname already bound to another identity.
    #[error("nickname '{nickname}' already belongs to {bound_to}")]
    Conflict { nickname: String, bound_to: String },

    /// Identity or message lookup miss.
    #[error("{what} not found: {key}")]
    NotFound {
        what: &'static str,
        key: String,
        /// Close matches offered back as a clarification.
        suggestions: Vec<String>,
    },

    /// The question could not be classified.
    #[error("ambiguous question: {0}")]
    AmbiguousIntent(String),

    /// A full reindex holds the index lock.
    #[error("index is busy: a reindex is in progress")]
    IndexBusy,
}

impl RecallError {
    pub fn not_found(what: &'static str, key: impl Into<String>) -> Self {
        RecallError::NotFound {
            what,
            key: key.into(),
            suggestions: Vec::new(),
        }
    }
}

/// Result type alias for chat-recall core operations.
pub type Result<T> = std::result::Result<T, RecallError>;
