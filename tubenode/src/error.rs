//! Application-wide error types.

use thiserror::Error;

/// Application-wide result type.
pub type Result<T> = std::result::Result<T, Error>;

/// Application-wide error type.
#[derive(Error, Debug)]
pub enum Error {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// The store rejected a write job. Surfaced to the originating request
    /// only; never fatal to the coordinator.
    #[error("Write job failed: {0}")]
    WriteFailed(String),

    /// A bus endpoint went away. For a worker this means respawn under
    /// supervision; for the coordinator it is process-fatal.
    #[error("Bus closed: {0}")]
    BusClosed(&'static str),

    #[error("Invalid transition for video {video_id}: {reason}")]
    InvalidTransition { video_id: String, reason: String },

    #[error("Video not found: {0}")]
    VideoNotFound(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

impl Error {
    pub fn invalid_transition(video_id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidTransition {
            video_id: video_id.into(),
            reason: reason.into(),
        }
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }
}
