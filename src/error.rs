use thiserror::Error;

#[derive(Error, Debug)]
pub enum StreamError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("State backend error: {0}")]
    State(String),

    #[error("Timer service error: {0}")]
    Timer(String),

    #[error("User code error in {context}: {message}")]
    UserCode { context: String, message: String },

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Invalid operation: {0}")]
    InvalidOperation(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl StreamError {
    /// Wrap a user-code failure with the key/window context it occurred in.
    pub fn user_code(context: impl Into<String>, message: impl std::fmt::Display) -> Self {
        StreamError::UserCode {
            context: context.into(),
            message: message.to_string(),
        }
    }
}

impl Clone for StreamError {
    fn clone(&self) -> Self {
        match self {
            StreamError::Configuration(s) => StreamError::Configuration(s.clone()),
            StreamError::State(s) => StreamError::State(s.clone()),
            StreamError::Timer(s) => StreamError::Timer(s.clone()),
            StreamError::UserCode { context, message } => StreamError::UserCode {
                context: context.clone(),
                message: message.clone(),
            },
            StreamError::Serialization(s) => StreamError::Serialization(s.clone()),
            StreamError::InvalidOperation(s) => StreamError::InvalidOperation(s.clone()),
            StreamError::NotFound(s) => StreamError::NotFound(s.clone()),
            StreamError::Internal(s) => StreamError::Internal(s.clone()),
        }
    }
}

pub type Result<T> = std::result::Result<T, StreamError>;

// Error conversions for common error types

impl From<bincode::error::EncodeError> for StreamError {
    fn from(e: bincode::error::EncodeError) -> Self {
        StreamError::Serialization(e.to_string())
    }
}

impl From<bincode::error::DecodeError> for StreamError {
    fn from(e: bincode::error::DecodeError) -> Self {
        StreamError::Serialization(e.to_string())
    }
}

impl From<serde_json::Error> for StreamError {
    fn from(e: serde_json::Error) -> Self {
        StreamError::Serialization(e.to_string())
    }
}
