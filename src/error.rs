//! Error types for finflow.

use thiserror::Error;

/// Result type alias for finflow operations.
pub type Result<T> = std::result::Result<T, Error>;

/// finflow error types.
#[derive(Error, Debug)]
pub enum Error {
    #[error("Workflow error: {0}")]
    Workflow(String),

    #[error("Step error: {0}")]
    Step(String),

    #[error("Execution error: {0}")]
    Execution(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Generation error: {0}")]
    Generation(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Get the error code for machine parsing.
    pub fn code(&self) -> &'static str {
        match self {
            Error::Workflow(_) => "WORKFLOW_ERROR",
            Error::Step(_) => "STEP_ERROR",
            Error::Execution(_) => "EXECUTION_ERROR",
            Error::Storage(_) => "STORAGE_ERROR",
            Error::Generation(_) => "GENERATION_ERROR",
            Error::Validation(_) => "VALIDATION_ERROR",
            Error::Config(_) => "CONFIG_ERROR",
            Error::Internal(_) => "INTERNAL_ERROR",
            Error::Http(_) => "HTTP_ERROR",
            Error::Database(_) => "DATABASE_ERROR",
            Error::Json(_) => "JSON_ERROR",
            Error::Io(_) => "IO_ERROR",
        }
    }

    /// Get a sanitized error message safe for external consumers.
    ///
    /// Hides internal details like file paths and SQL statements that could
    /// leak sensitive information to API clients.
    pub fn external_message(&self) -> String {
        match self {
            // User-facing errors - safe to expose the message
            Error::Workflow(msg) => format!("Workflow error: {}", msg),
            Error::Step(msg) => format!("Step error: {}", msg),
            Error::Execution(msg) => format!("Execution error: {}", msg),
            Error::Validation(msg) => format!("Validation error: {}", msg),
            Error::Config(msg) => format!("Configuration error: {}", msg),

            // Internal errors - sanitize
            Error::Storage(_) => "A storage error occurred".to_string(),
            Error::Database(_) => "A database error occurred".to_string(),
            Error::Internal(_) => "An internal error occurred".to_string(),
            Error::Io(_) => "An I/O error occurred".to_string(),

            // Upstream AI failures are always recovered via fallback before
            // reaching a client; this message is for polling surfaces only.
            Error::Generation(_) => "The analysis service is temporarily unavailable".to_string(),

            Error::Http(e) => {
                if let Some(status) = e.status() {
                    format!("HTTP request failed with status {}", status.as_u16())
                } else if e.is_timeout() {
                    "HTTP request timed out".to_string()
                } else if e.is_connect() {
                    "Failed to connect to remote server".to_string()
                } else {
                    "HTTP request failed".to_string()
                }
            }

            Error::Json(_) => "Invalid JSON format".to_string(),
        }
    }

    /// Convert to a JSON error body with sanitized message.
    pub fn to_external_json(&self) -> serde_json::Value {
        serde_json::json!({
            "error": {
                "code": self.code(),
                "message": self.external_message(),
            }
        })
    }
}
