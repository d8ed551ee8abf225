//! Error types for Quarry services
//!
//! Provides a comprehensive error handling system with:
//! - Distinct error types for different failure modes
//! - HTTP status code mapping
//! - Structured error responses
//! - Error codes for client handling
//!
//! Most research-path failures are recoverable and never reach a caller:
//! source failures are recorded on the round, embedding failures fall back
//! to zero vectors, count mismatches are rescaled. `Unroutable` is the one
//! hard failure a user is expected to see.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type alias using AppError
pub type Result<T> = std::result::Result<T, AppError>;

/// Error codes for machine-readable error identification
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    // Validation errors (1xxx)
    ValidationError,
    Unroutable,

    // Resource errors (4xxx)
    SessionNotFound,

    // Conflict errors (5xxx)
    SessionClosed,
    InvariantViolation,

    // Rate limiting (6xxx)
    RateLimited,

    // External service errors (8xxx)
    UpstreamError,
    SourceUnavailable,
    SourceTimeout,
    TotalSourceOutage,
    EmbeddingError,
    EmbeddingTimeout,
    GenerationError,
    GenerationTimeout,
    CacheError,

    // Internal errors (9xxx)
    InternalError,
    ConfigurationError,
    SerializationError,
    Cancelled,
}

impl ErrorCode {
    /// Get the numeric code for this error
    pub fn as_code(&self) -> u16 {
        match self {
            // Validation (1xxx)
            ErrorCode::ValidationError => 1001,
            ErrorCode::Unroutable => 1002,

            // Resources (4xxx)
            ErrorCode::SessionNotFound => 4002,

            // Conflicts (5xxx)
            ErrorCode::SessionClosed => 5001,
            ErrorCode::InvariantViolation => 5002,

            // Rate limits (6xxx)
            ErrorCode::RateLimited => 6001,

            // External (8xxx)
            ErrorCode::UpstreamError => 8001,
            ErrorCode::SourceUnavailable => 8002,
            ErrorCode::SourceTimeout => 8003,
            ErrorCode::TotalSourceOutage => 8004,
            ErrorCode::EmbeddingError => 8005,
            ErrorCode::EmbeddingTimeout => 8006,
            ErrorCode::GenerationError => 8007,
            ErrorCode::GenerationTimeout => 8008,
            ErrorCode::CacheError => 8009,

            // Internal (9xxx)
            ErrorCode::InternalError => 9001,
            ErrorCode::ConfigurationError => 9002,
            ErrorCode::SerializationError => 9003,
            ErrorCode::Cancelled => 9004,
        }
    }
}

/// Application error types
#[derive(Error, Debug)]
pub enum AppError {
    // Validation errors
    #[error("Validation failed: {message}")]
    Validation {
        message: String,
        field: Option<String>,
    },

    #[error("Query could not be routed: {message}")]
    Unroutable { message: String },

    // Resource errors
    #[error("Session not found: {id}")]
    SessionNotFound { id: String },

    #[error("Session {id} is complete and can no longer be modified")]
    SessionClosed { id: String },

    #[error("Invariant violated: {message}")]
    InvariantViolation { message: String },

    // Rate limiting
    #[error("Rate limit exceeded: {limit} requests per second")]
    RateLimited { limit: u32 },

    // External service errors
    #[error("Source {source_type} unavailable: {message}")]
    SourceUnavailable { source_type: String, message: String },

    #[error("Source {source_type} timed out after {timeout_ms}ms")]
    SourceTimeout { source_type: String, timeout_ms: u64 },

    #[error("All sources failed in round {round}")]
    TotalSourceOutage { round: u32 },

    #[error("Embedding service error: {message}")]
    EmbeddingError { message: String },

    #[error("Embedding timeout after {timeout_ms}ms")]
    EmbeddingTimeout { timeout_ms: u64 },

    #[error("Generation error: {message}")]
    GenerationError { message: String },

    #[error("Generation timeout after {timeout_ms}ms")]
    GenerationTimeout { timeout_ms: u64 },

    #[error("Cache error: {message}")]
    CacheError { message: String },

    #[error("HTTP client error: {0}")]
    HttpClient(#[from] reqwest::Error),

    // Internal errors
    #[error("Internal server error: {message}")]
    Internal { message: String },

    #[error("Configuration error: {message}")]
    Configuration { message: String },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Operation cancelled")]
    Cancelled,

    // Generic
    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

impl AppError {
    /// Get the error code for this error
    pub fn code(&self) -> ErrorCode {
        match self {
            AppError::Validation { .. } => ErrorCode::ValidationError,
            AppError::Unroutable { .. } => ErrorCode::Unroutable,
            AppError::SessionNotFound { .. } => ErrorCode::SessionNotFound,
            AppError::SessionClosed { .. } => ErrorCode::SessionClosed,
            AppError::InvariantViolation { .. } => ErrorCode::InvariantViolation,
            AppError::RateLimited { .. } => ErrorCode::RateLimited,
            AppError::SourceUnavailable { .. } => ErrorCode::SourceUnavailable,
            AppError::SourceTimeout { .. } => ErrorCode::SourceTimeout,
            AppError::TotalSourceOutage { .. } => ErrorCode::TotalSourceOutage,
            AppError::EmbeddingError { .. } => ErrorCode::EmbeddingError,
            AppError::EmbeddingTimeout { .. } => ErrorCode::EmbeddingTimeout,
            AppError::GenerationError { .. } => ErrorCode::GenerationError,
            AppError::GenerationTimeout { .. } => ErrorCode::GenerationTimeout,
            AppError::CacheError { .. } => ErrorCode::CacheError,
            AppError::HttpClient(_) => ErrorCode::UpstreamError,
            AppError::Internal { .. } => ErrorCode::InternalError,
            AppError::Configuration { .. } => ErrorCode::ConfigurationError,
            AppError::Serialization(_) => ErrorCode::SerializationError,
            AppError::Cancelled => ErrorCode::Cancelled,
            AppError::Other(_) => ErrorCode::InternalError,
        }
    }

    /// Get the HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            // 400 Bad Request
            AppError::Validation { .. } | AppError::Unroutable { .. } => StatusCode::BAD_REQUEST,

            // 404 Not Found
            AppError::SessionNotFound { .. } => StatusCode::NOT_FOUND,

            // 409 Conflict
            AppError::SessionClosed { .. } => StatusCode::CONFLICT,

            // 429 Too Many Requests
            AppError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,

            AppError::Cancelled => StatusCode::CONFLICT,

            // 500 Internal Server Error
            AppError::InvariantViolation { .. }
            | AppError::Internal { .. }
            | AppError::Configuration { .. }
            | AppError::Serialization(_)
            | AppError::Other(_) => StatusCode::INTERNAL_SERVER_ERROR,

            // 502 Bad Gateway
            AppError::SourceUnavailable { .. }
            | AppError::EmbeddingError { .. }
            | AppError::GenerationError { .. }
            | AppError::HttpClient(_) => StatusCode::BAD_GATEWAY,

            // 504 Gateway Timeout
            AppError::SourceTimeout { .. }
            | AppError::EmbeddingTimeout { .. }
            | AppError::GenerationTimeout { .. } => StatusCode::GATEWAY_TIMEOUT,

            // 503 Service Unavailable
            AppError::TotalSourceOutage { .. } | AppError::CacheError { .. } => {
                StatusCode::SERVICE_UNAVAILABLE
            }
        }
    }

    /// Check if this error should be logged at error level
    pub fn is_server_error(&self) -> bool {
        self.status_code().is_server_error()
    }

    /// Check if this error is a client error
    pub fn is_client_error(&self) -> bool {
        self.status_code().is_client_error()
    }

    /// Whether the failure came from an external collaborator and may succeed on retry
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            AppError::SourceUnavailable { .. }
                | AppError::SourceTimeout { .. }
                | AppError::EmbeddingTimeout { .. }
                | AppError::GenerationTimeout { .. }
                | AppError::HttpClient(_)
        )
    }
}

/// Structured error response for API
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: ErrorDetails,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorDetails {
    pub code: ErrorCode,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let code = self.code();
        let message = self.to_string();

        // Log based on severity
        if self.is_server_error() {
            tracing::error!(
                error = %message,
                code = ?code,
                status = status.as_u16(),
                "Server error"
            );
        } else if self.is_client_error() {
            tracing::warn!(
                error = %message,
                code = ?code,
                status = status.as_u16(),
                "Client error"
            );
        }

        let details = match &self {
            AppError::Validation {
                field: Some(field), ..
            } => Some(serde_json::json!({ "field": field })),
            _ => None,
        };

        let body = ErrorResponse {
            error: ErrorDetails {
                code,
                message,
                details,
                request_id: None, // Should be filled by middleware
            },
        };

        (status, Json(body)).into_response()
    }
}

impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        AppError::Internal {
            message: err.to_string(),
        }
    }
}

impl From<redis::RedisError> for AppError {
    fn from(err: redis::RedisError) -> Self {
        AppError::CacheError {
            message: err.to_string(),
        }
    }
}

impl From<config::ConfigError> for AppError {
    fn from(err: config::ConfigError) -> Self {
        AppError::Configuration {
            message: err.to_string(),
        }
    }
}
