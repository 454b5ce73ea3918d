//! Error types used throughout the application

use std::path::PathBuf;
use thiserror::Error;

/// Main error type for the Omnibox pipeline
#[derive(Error, Debug)]
pub enum OmniError {
    #[error("No applicable route found for the query")]
    NoRoute,

    #[error("Parameter extraction failed: {message}")]
    ExtractionFailed {
        message: String,
        /// Reasoning returned by the model, if any survived the parse failure.
        reasoning: Option<String>,
    },

    #[error("Unresolved entity parameters: {parameters:?}")]
    UnresolvedEntity { parameters: Vec<String> },

    #[error("Fetch failed after primary and fallback: {message}")]
    FetchFailed { message: String },

    #[error("Operation timed out after {timeout_ms}ms: {operation}")]
    Timeout { operation: String, timeout_ms: u64 },

    #[error("Cancelled: {operation}")]
    Cancelled { operation: String },

    #[error("LLM provider error: {0}")]
    Llm(#[from] crate::llm::LlmError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Catalog error: {message}")]
    Catalog { message: String },

    #[error("Vector store error: {message}")]
    VectorStore { message: String },

    #[error("Subscription store error: {message}")]
    Subscription { message: String },

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("HTTP request error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON serialization/deserialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {message}")]
    Internal { message: String },
}

/// Configuration-specific errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Missing configuration key: {key}")]
    MissingKey { key: String },

    #[error("Invalid configuration value for {key}: {value}")]
    InvalidValue { key: String, value: String },

    #[error("Configuration file not found: {path}")]
    FileNotFound { path: PathBuf },

    #[error("Failed to read configuration: {source}")]
    ReadError {
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse configuration: {source}")]
    ParseError {
        #[source]
        source: toml::de::Error,
    },
}

impl OmniError {
    /// Create a new extraction-failed error
    pub fn extraction<S: Into<String>>(message: S, reasoning: Option<String>) -> Self {
        Self::ExtractionFailed {
            message: message.into(),
            reasoning,
        }
    }

    /// Create a new unresolved-entity error naming the failed parameters
    pub fn unresolved(parameters: Vec<String>) -> Self {
        Self::UnresolvedEntity { parameters }
    }

    /// Create a new fetch-failed error
    pub fn fetch<S: Into<String>>(message: S) -> Self {
        Self::FetchFailed {
            message: message.into(),
        }
    }

    /// Create a new timeout error
    pub fn timeout<S: Into<String>>(operation: S, timeout_ms: u64) -> Self {
        Self::Timeout {
            operation: operation.into(),
            timeout_ms,
        }
    }

    /// Create a new cancelled error
    pub fn cancelled<S: Into<String>>(operation: S) -> Self {
        Self::Cancelled {
            operation: operation.into(),
        }
    }

    /// Create a new catalog error
    pub fn catalog<S: Into<String>>(message: S) -> Self {
        Self::Catalog {
            message: message.into(),
        }
    }

    /// Create a new vector store error
    pub fn vector<S: Into<String>>(message: S) -> Self {
        Self::VectorStore {
            message: message.into(),
        }
    }

    /// Create a new subscription store error
    pub fn subscription<S: Into<String>>(message: S) -> Self {
        Self::Subscription {
            message: message.into(),
        }
    }

    /// Create a new internal error
    pub fn internal<S: Into<String>>(message: S) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Stable machine-readable code surfaced to clients.
    ///
    /// These strings are part of the wire contract and must not change.
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::NoRoute => "no_route",
            Self::ExtractionFailed { .. } => "extraction_failed",
            Self::UnresolvedEntity { .. } => "unresolved_entity",
            Self::FetchFailed { .. } | Self::Http(_) => "fetch_failed",
            Self::Timeout { .. } => "timeout",
            Self::Cancelled { .. } => "cancelled",
            Self::Llm(_) => "extraction_failed",
            Self::Config(_)
            | Self::Catalog { .. }
            | Self::VectorStore { .. }
            | Self::Subscription { .. }
            | Self::Database(_)
            | Self::Json(_)
            | Self::Io(_)
            | Self::Internal { .. } => "internal",
        }
    }

    /// Message safe to show to an end user. Never contains raw LLM output,
    /// stack traces, or backend response bodies.
    pub fn user_message(&self) -> String {
        match self {
            Self::NoRoute => {
                "I couldn't find a data source matching that request. \
                 Could you rephrase it?"
                    .to_string()
            }
            Self::ExtractionFailed { .. } | Self::Llm(_) => {
                "I couldn't work out how to query that. Could you rephrase \
                 the request?"
                    .to_string()
            }
            Self::UnresolvedEntity { parameters } => format!(
                "I couldn't resolve these names to known accounts: {}. \
                 Add them as subscriptions or use their numeric identifiers.",
                parameters.join(", ")
            ),
            Self::FetchFailed { .. } | Self::Http(_) => {
                "The data source is unreachable right now. Please try again \
                 shortly."
                    .to_string()
            }
            Self::Timeout { .. } => "The request took too long and was abandoned.".to_string(),
            Self::Cancelled { .. } => "The request was cancelled.".to_string(),
            _ => "Something went wrong on our side. The error has been logged.".to_string(),
        }
    }

    /// Check if this error is recoverable by a retry
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::Timeout { .. } | Self::Http(_) | Self::FetchFailed { .. } => true,
            Self::Llm(e) => e.is_retryable(),
            Self::Cancelled { .. } => false,
            _ => false,
        }
    }

    /// Get error category for logging/metrics
    pub fn category(&self) -> &'static str {
        match self {
            Self::NoRoute => "no_route",
            Self::ExtractionFailed { .. } => "extraction",
            Self::UnresolvedEntity { .. } => "resolution",
            Self::FetchFailed { .. } => "fetch",
            Self::Timeout { .. } => "timeout",
            Self::Cancelled { .. } => "cancelled",
            Self::Llm(_) => "llm",
            Self::Config(_) => "config",
            Self::Catalog { .. } => "catalog",
            Self::VectorStore { .. } => "vector",
            Self::Subscription { .. } => "subscription",
            Self::Database(_) => "database",
            Self::Http(_) => "http",
            Self::Json(_) => "json",
            Self::Io(_) => "io",
            Self::Internal { .. } => "internal",
        }
    }
}
