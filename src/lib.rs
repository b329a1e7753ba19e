pub mod chat;
pub mod config;
pub mod directive;
pub mod generation;
pub mod llm;
pub mod messages;
pub mod server;

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TangError {
    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Upstream model error: {0}")]
    UpstreamError(String),

    #[error("Generation error: {0}")]
    GenerationError(String),

    #[error("Storage error: {0}")]
    StorageError(String),

    #[error("IO error: {0}")]
    IOError(String),

    #[error("Client disconnected: {0}")]
    SinkClosed(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),
}

impl From<std::io::Error> for TangError {
    fn from(e: std::io::Error) -> Self {
        TangError::IOError(e.to_string())
    }
}

impl TangError {
    /// Check if this error is recoverable
    pub fn is_recoverable(&self) -> bool {
        match self {
            TangError::ConfigError(_) => false,
            // The model endpoint may come back on the next request
            TangError::UpstreamError(_) => true,
            // Surfaced inline, the stream carries on
            TangError::GenerationError(_) => true,
            TangError::StorageError(_) => false,
            TangError::IOError(_) => false,
            TangError::SinkClosed(_) => false,
            TangError::NotFound(_) => true,
            TangError::Unauthorized(_) => true,
            TangError::InvalidRequest(_) => true,
        }
    }

    /// Get a user-friendly description
    pub fn user_message(&self) -> String {
        match self {
            TangError::ConfigError(_) => {
                "Server configuration error. Please contact the administrator.".to_string()
            }
            TangError::UpstreamError(e) => format!("The language model is unavailable: {}", e),
            TangError::GenerationError(e) => format!("Generation failed: {}", e),
            TangError::StorageError(_) => "Failed to save the conversation.".to_string(),
            TangError::IOError(_) => "File system error occurred.".to_string(),
            TangError::SinkClosed(_) => "The connection was closed.".to_string(),
            TangError::NotFound(what) => format!("{} not found", what),
            TangError::Unauthorized(_) => "Authentication required.".to_string(),
            TangError::InvalidRequest(e) => format!("Invalid request: {}", e),
        }
    }
}

pub type Result<T> = std::result::Result<T, TangError>;
