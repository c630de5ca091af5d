use thiserror::Error;

/// Typed errors crossing module boundaries (transport, store, dispatch).
///
/// Leaf code keeps using `anyhow::Result`; the `Internal` variant lets `?`
/// lift those errors into a `BotError` without ceremony.
#[derive(Debug, Error)]
pub enum BotError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Store error: {0}")]
    Store(String),

    #[error("Command '{command}' failed: {message}")]
    Handler { command: String, message: String },

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

pub type BotResult<T> = std::result::Result<T, BotError>;

impl BotError {
    pub fn transport(message: impl Into<String>) -> Self {
        BotError::Transport(message.into())
    }
}

impl From<rusqlite::Error> for BotError {
    fn from(e: rusqlite::Error) -> Self {
        BotError::Store(e.to_string())
    }
}

impl From<serde_json::Error> for BotError {
    fn from(e: serde_json::Error) -> Self {
        BotError::Store(format!("invalid record: {}", e))
    }
}
