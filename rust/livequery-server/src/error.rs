use thiserror::Error;

/// Errors surfaced by the live-query engine.
///
/// `Authorization` and `NotFound` are rejections returned to the caller with no
/// state change. `TransientStore` and `Transport` are raised on the delivery path
/// and never propagate back to the write that triggered a recompute.
#[derive(Error, Debug)]
pub enum LiveQueryError {
    #[error("Not authorized: {0}")]
    Authorization(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid row: {0}")]
    InvalidRow(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Data store error: {0}")]
    TransientStore(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("JSON serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl LiveQueryError {
    pub fn is_transport(&self) -> bool {
        matches!(self, LiveQueryError::Transport(_))
    }
}

pub type Result<T> = std::result::Result<T, LiveQueryError>;
