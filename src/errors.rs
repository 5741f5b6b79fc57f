/*!
 * Error types for the threadrelay pipeline.
 *
 * Typed errors are defined with thiserror per concern. Application-level
 * code propagates them through anyhow, and `AppError` wraps everything the
 * binary can surface.
 */

use thiserror::Error;

use crate::status::Status;

/// A status change that the lifecycle table does not allow
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StatusTransitionError {
    /// The requested transition is not an edge of the status graph
    #[error("Invalid status transition from {from} to {to}")]
    InvalidTransition {
        /// Status the entity currently has
        from: Status,
        /// Status the caller tried to move to
        to: Status,
    },
}

/// Errors raised by a task queue itself
#[derive(Error, Debug)]
pub enum QueueError {
    /// The processor of a queue can only be set once
    #[error("Processor already set for queue '{queue}'")]
    ProcessorAlreadySet {
        /// Diagnostic name of the queue
        queue: String,
    },

    /// A processor could not decode the payload of its task
    #[error("Invalid payload for task {task_id}: {reason}")]
    InvalidPayload {
        /// Identifier of the offending task
        task_id: String,
        /// Decoder message
        reason: String,
    },
}

/// Errors that can occur when talking to external collaborators
/// (translation provider, social platform)
#[derive(Error, Debug, Clone)]
pub enum ProviderError {
    /// Error when making an API request fails
    #[error("API request failed: {0}")]
    RequestFailed(String),

    /// Error when parsing an API response fails
    #[error("Failed to parse API response: {0}")]
    ParseError(String),

    /// Error returned by the API itself
    #[error("API responded with error: {status_code} - {message}")]
    ApiError {
        /// HTTP status code
        status_code: u16,
        /// Error message from the API
        message: String,
    },

    /// Error establishing or maintaining a connection
    #[error("Connection error: {0}")]
    ConnectionError(String),

    /// The remote side asked us to slow down
    #[error("Rate limit exceeded: {message}")]
    RateLimitExceeded {
        /// Message reported by the remote side
        message: String,
        /// Seconds until the limit resets, when the remote side says so
        retry_after_secs: Option<u64>,
    },

    /// Error with authentication
    #[error("Authentication error: {0}")]
    AuthenticationError(String),
}

impl ProviderError {
    /// Whether a later attempt of the same call may succeed
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::RequestFailed(_) | Self::ConnectionError(_) | Self::RateLimitExceeded { .. } => {
                true
            }
            Self::ApiError { status_code, .. } => *status_code >= 500,
            Self::ParseError(_) | Self::AuthenticationError(_) => false,
        }
    }

    /// Seconds to wait before retrying, if this is a rate-limit error that says so
    pub fn retry_after(&self) -> Option<u64> {
        match self {
            Self::RateLimitExceeded {
                retry_after_secs, ..
            } => *retry_after_secs,
            _ => None,
        }
    }
}

/// Errors surfaced by stage services and their processors
#[derive(Error, Debug)]
pub enum StageError {
    /// The persistent store failed
    #[error("Store error: {0}")]
    Store(#[source] anyhow::Error),

    /// An external collaborator failed
    #[error("Provider error: {0}")]
    Provider(#[from] ProviderError),

    /// A lifecycle invariant would have been violated
    #[error("Transition error: {0}")]
    Transition(#[from] StatusTransitionError),

    /// An entity referenced by a task no longer exists
    #[error("{entity} '{id}' not found")]
    NotFound {
        /// Kind of entity ("post", "thread")
        entity: &'static str,
        /// Identifier that was looked up
        id: String,
    },
}

/// Main application error type that wraps all other errors
#[derive(Error, Debug)]
pub enum AppError {
    /// Invalid or unreadable configuration
    #[error("Configuration error: {0}")]
    Config(String),

    /// Error from a file operation
    #[error("File error: {0}")]
    File(String),

    /// Error from an external collaborator
    #[error("Provider error: {0}")]
    Provider(#[from] ProviderError),

    /// Error from a stage service
    #[error("Stage error: {0}")]
    Stage(#[from] StageError),

    /// Error from a task queue
    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    /// Any other error
    #[error("Unknown error: {0}")]
    Unknown(String),
}

impl From<anyhow::Error> for AppError {
    fn from(error: anyhow::Error) -> Self {
        Self::Unknown(error.to_string())
    }
}

impl From<std::io::Error> for AppError {
    fn from(error: std::io::Error) -> Self {
        Self::File(error.to_string())
    }
}

impl From<StatusTransitionError> for AppError {
    fn from(error: StatusTransitionError) -> Self {
        Self::Stage(StageError::Transition(error))
    }
}
