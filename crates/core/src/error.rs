//! Error types for the Storyloom domain.
//!
//! Uses `thiserror` for ergonomic error definitions.
//! Each bounded context has its own error variant.

use thiserror::Error;

/// The top-level error type for all Storyloom operations.
#[derive(Debug, Error)]
pub enum Error {
    // --- Adapter errors ---
    #[error("Adapter error: {0}")]
    Adapter(#[from] AdapterError),

    // --- Pipeline errors ---
    #[error("Pipeline error: {0}")]
    Pipeline(#[from] PipelineError),

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

/// Result type alias using our Error.
pub type Result<T> = std::result::Result<T, Error>;

// --- Bounded context errors ---

/// Errors raised by the LLM, image, and audio adapters.
#[derive(Debug, Clone, Error)]
pub enum AdapterError {
    #[error("API request failed: {message} (status: {status_code})")]
    ApiError { status_code: u16, message: String },

    #[error("Rate limited by vendor, retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    #[error("Stream interrupted: {0}")]
    StreamInterrupted(String),

    #[error("Adapter not configured: {0}")]
    NotConfigured(String),

    #[error("Request timed out: {0}")]
    Timeout(String),

    #[error("Network error: {0}")]
    Network(String),
}

/// Errors raised by the pipeline orchestrator itself.
#[derive(Debug, Clone, Error)]
pub enum PipelineError {
    /// Required configuration is missing. Reported once, before any stage
    /// starts; the run never begins.
    #[error("Pipeline configuration incomplete. Missing: {0}")]
    MissingConfig(String),

    #[error("Stage {stage} failed: {reason}")]
    StageFailed { stage: String, reason: String },

    #[error("Run aborted by caller")]
    Aborted,
}
