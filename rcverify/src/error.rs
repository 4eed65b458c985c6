//! Error types for the verification client

use thiserror::Error;

/// Main error type for client operations
#[derive(Error, Debug)]
pub enum ClientError {
    #[error("HTTP request failed: {0}")]
    RequestError(#[from] reqwest::Error),

    #[error("Server returned {status}: {body}")]
    HttpStatus { status: u16, body: String },

    #[error("Server error: {0}")]
    Server(String),

    #[error("Failed to decode response: {0}")]
    Decode(String),

    #[error("Analysis stream ended before a result was delivered")]
    StreamEnded,

    #[error("Request cancelled")]
    Cancelled,

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

impl ClientError {
    /// Network-level failure: request rejected, connection dropped, bad status.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            ClientError::RequestError(_) | ClientError::HttpStatus { .. } | ClientError::StreamEnded
        )
    }

    /// Failure reported by the backend itself (`success: false` or an error event).
    pub fn is_server(&self) -> bool {
        matches!(self, ClientError::Server(_))
    }

    /// Short message suitable for a dismissable notification.
    pub fn user_message(&self) -> String {
        match self {
            ClientError::Server(msg) => msg.clone(),
            ClientError::HttpStatus { status, .. } => format!("Server error ({})", status),
            ClientError::RequestError(e) if e.is_timeout() => "Request timed out".to_string(),
            ClientError::RequestError(e) if e.is_connect() => "Could not reach the analysis service".to_string(),
            other => other.to_string(),
        }
    }
}

/// Result type for client operations
pub type ClientResult<T> = Result<T, ClientError>;
