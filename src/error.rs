//! Error types for remote operations

use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum RemoteError {
    /// The remote command ran but failed; carries the remote diagnostic text.
    #[error("Remote command failed: {0}")]
    Transport(String),

    #[error("Remote command timed out after {0:?}")]
    Timeout(Duration),

    #[error("Failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Transfer of {path} failed: {message}")]
    Transfer { path: String, message: String },

    #[error("Invalid name: {0}")]
    InvalidName(String),

    #[error("Operation cancelled")]
    Cancelled,
}

// One listing result is handed to every request waiting on that path.
impl Clone for RemoteError {
    fn clone(&self) -> Self {
        match self {
            RemoteError::Transport(msg) => RemoteError::Transport(msg.clone()),
            RemoteError::Timeout(d) => RemoteError::Timeout(*d),
            RemoteError::Spawn { program, source } => RemoteError::Spawn {
                program: program.clone(),
                source: std::io::Error::new(source.kind(), source.to_string()),
            },
            RemoteError::Transfer { path, message } => RemoteError::Transfer {
                path: path.clone(),
                message: message.clone(),
            },
            RemoteError::InvalidName(name) => RemoteError::InvalidName(name.clone()),
            RemoteError::Cancelled => RemoteError::Cancelled,
        }
    }
}

impl RemoteError {
    pub fn spawn(program: &str, source: std::io::Error) -> Self {
        RemoteError::Spawn {
            program: program.to_string(),
            source,
        }
    }
}

pub type RemoteResult<T> = std::result::Result<T, RemoteError>;
