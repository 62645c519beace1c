use std::time::Duration;
use thiserror::Error;

/// Generic message shown for any failure the user can only retry
pub const GENERIC_FAILURE_MESSAGE: &str = "Something went wrong. Please try again later.";

/// Provider-specific errors
#[derive(Error, Debug)]
pub enum ProviderError {
    #[error("HTTP request failed: {0}")]
    HttpError(#[from] reqwest::Error),

    #[error("JSON serialization failed: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("Unexpected status {status}: {message}")]
    UnexpectedStatus { status: u16, message: String },

    #[error("Request cancelled")]
    Cancelled,

    #[error("No data received for {0:?}")]
    StreamTimeout(Duration),

    #[error("Empty response from {0}")]
    EmptyResponse(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),
}

impl ProviderError {
    /// User-initiated cancellation is a normal terminal state, not a failure
    pub fn is_cancellation(&self) -> bool {
        matches!(self, ProviderError::Cancelled)
    }

    /// Check if this is a client error (4xx)
    pub fn is_client_error(&self) -> bool {
        match self {
            ProviderError::UnexpectedStatus { status, .. } => *status >= 400 && *status < 500,
            _ => false,
        }
    }

    /// Text stored on a failed message for the UI to display
    pub fn user_message(&self) -> String {
        match self {
            ProviderError::StreamTimeout(_) => {
                "The response stopped arriving. Please try again.".to_string()
            }
            ProviderError::EmptyResponse(_) => "No response was generated.".to_string(),
            _ => GENERIC_FAILURE_MESSAGE.to_string(),
        }
    }
}
