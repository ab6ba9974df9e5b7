//! Error types for the codeloop domain.
//!
//! Uses `thiserror` for ergonomic error definitions.
//! Each bounded context has its own error enum; the top-level [`Error`]
//! carries a machine-readable [`ErrorKind`] alongside its message.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// The top-level error type for all codeloop operations.
#[derive(Debug, Error)]
pub enum Error {
    // --- Provider errors ---
    #[error("Provider error: {0}")]
    Provider(#[from] ProviderError),

    // --- Execution errors ---
    #[error("Execution error: {0}")]
    Execution(#[from] ExecutionError),

    // --- Session startup ---
    #[error("Session startup failed: {0}")]
    Startup(String),

    // --- Cancellation ---
    #[error("Session cancelled")]
    Cancelled,

    // --- Configuration errors ---
    #[error("Configuration error: {message}")]
    Config { message: String },

    // --- Serialization ---
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    // --- Generic ---
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Machine-readable kind for callers that branch on failure type.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Provider(e) => match e.kind() {
                ProviderErrorKind::NotFound => ErrorKind::NotFound,
                ProviderErrorKind::Authentication => ErrorKind::Authentication,
                ProviderErrorKind::RateLimited => ErrorKind::RateLimited,
                ProviderErrorKind::Timeout => ErrorKind::Timeout,
                ProviderErrorKind::Api => ErrorKind::Api,
            },
            Self::Execution(_) => ErrorKind::Execution,
            Self::Startup(_) => ErrorKind::Startup,
            Self::Cancelled => ErrorKind::Cancelled,
            Self::Config { .. } => ErrorKind::Config,
            Self::Serialization(_) | Self::Internal(_) => ErrorKind::Internal,
        }
    }
}

/// Result type alias using our Error.
pub type Result<T> = std::result::Result<T, Error>;

/// Machine-readable error kinds surfaced to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    NotFound,
    Authentication,
    RateLimited,
    Timeout,
    Api,
    Execution,
    Startup,
    Cancelled,
    Config,
    Internal,
}

// --- Bounded context errors ---

#[derive(Debug, Clone, Error)]
pub enum ProviderError {
    #[error("API request failed: {message} (status: {status_code})")]
    ApiError { status_code: u16, message: String },

    #[error("Rate limited by provider, retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    #[error("Model or endpoint not found: {0}")]
    NotFound(String),

    #[error("Stream interrupted: {0}")]
    StreamInterrupted(String),

    #[error("Provider not configured: {0}")]
    NotConfigured(String),

    #[error("Request timed out: {0}")]
    Timeout(String),

    #[error("Network error: {0}")]
    Network(String),
}

/// The fixed set of causes a completion failure is reported as.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderErrorKind {
    NotFound,
    Authentication,
    RateLimited,
    Timeout,
    Api,
}

impl ProviderError {
    /// Classify this error into one of the fixed causes.
    ///
    /// Typed variants map directly; variants that only carry a free-form
    /// message (network, stream, generic API failures) are classified by
    /// their content, since many backends report e.g. a missing model as a
    /// plain 400 with an explanatory body.
    pub fn kind(&self) -> ProviderErrorKind {
        match self {
            Self::NotFound(_) => ProviderErrorKind::NotFound,
            Self::AuthenticationFailed(_) => ProviderErrorKind::Authentication,
            Self::RateLimited { .. } => ProviderErrorKind::RateLimited,
            Self::Timeout(_) => ProviderErrorKind::Timeout,
            Self::ApiError { status_code, message } => match *status_code {
                404 => ProviderErrorKind::NotFound,
                401 | 403 => ProviderErrorKind::Authentication,
                429 => ProviderErrorKind::RateLimited,
                408 | 504 => ProviderErrorKind::Timeout,
                _ => classify_message(message),
            },
            Self::StreamInterrupted(message)
            | Self::NotConfigured(message)
            | Self::Network(message) => classify_message(message),
        }
    }

    /// Build a typed error from a free-form failure message.
    pub fn classify(message: impl Into<String>) -> Self {
        let message = message.into();
        match classify_message(&message) {
            ProviderErrorKind::NotFound => Self::NotFound(message),
            ProviderErrorKind::Authentication => Self::AuthenticationFailed(message),
            ProviderErrorKind::RateLimited => Self::RateLimited {
                retry_after_secs: 0,
            },
            ProviderErrorKind::Timeout => Self::Timeout(message),
            ProviderErrorKind::Api => Self::ApiError {
                status_code: 0,
                message,
            },
        }
    }
}

fn classify_message(message: &str) -> ProviderErrorKind {
    let lower = message.to_lowercase();
    let any = |needles: &[&str]| needles.iter().any(|n| lower.contains(n));

    if any(&["404", "not found", "does not exist", "no such model", "unknown model"]) {
        ProviderErrorKind::NotFound
    } else if any(&[
        "401",
        "403",
        "unauthorized",
        "forbidden",
        "api key",
        "api_key",
        "authentication",
        "permission denied",
    ]) {
        ProviderErrorKind::Authentication
    } else if any(&["429", "rate limit", "rate_limit", "too many requests", "quota"]) {
        ProviderErrorKind::RateLimited
    } else if any(&["timeout", "timed out", "deadline exceeded"]) {
        ProviderErrorKind::Timeout
    } else {
        ProviderErrorKind::Api
    }
}

#[derive(Debug, Clone, Error)]
pub enum ExecutionError {
    #[error("Executor not available: {0}")]
    Unavailable(String),

    #[error("Execution failed: {0}")]
    Failed(String),

    #[error("Execution timed out after {timeout_secs}s")]
    Timeout { timeout_secs: u64 },

    #[error("Unsupported language: {0}")]
    UnsupportedLanguage(String),

    #[error("Executor initialization failed: {0}")]
    Initialization(String),
}
