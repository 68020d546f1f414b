//! Error taxonomy shared by every layer of the stash library

use std::path::PathBuf;

use crate::object::ObjectId;

/// Result type for stash operations
pub type Result<T> = std::result::Result<T, StashError>;

/// Errors that can occur while storing, merging or synchronizing history
#[derive(Debug, thiserror::Error)]
pub enum StashError {
    #[error("Object not found: {0}")]
    ObjectNotFound(ObjectId),

    #[error("Malformed object: {0}")]
    MalformedObject(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    #[error("Directory traversal rejected: {0}")]
    DirectoryTraversal(String),

    #[error("Merge conflict in '{0}'")]
    MergeConflict(String),

    #[error("No common ancestor between {0} and {1}")]
    NoCommonAncestor(String, String),

    #[error("Nothing to synchronize: {0}")]
    NoChangesToSync(String),

    #[error("Push rejected: {0}")]
    NonFastForward(String),

    #[error("Remote error: {0}")]
    Remote(String),

    #[error("Timed out waiting for the peer")]
    Timeout,

    #[error("Connection closed by peer")]
    ConnectionClosed,

    #[error("Not a stash repository: {0:?}")]
    NotARepository(PathBuf),

    #[error("Branch not found: {0}")]
    BranchNotFound(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Cryptography error: {0}")]
    Crypto(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Repository lock error: {0}")]
    Lock(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Configuration parse error: {0}")]
    Toml(#[from] toml::de::Error),
}

impl StashError {
    /// Whether the error ends the connection it occurred on.
    pub fn is_connection_fatal(&self) -> bool {
        matches!(
            self,
            StashError::Protocol(_)
                | StashError::AuthenticationFailed(_)
                | StashError::DirectoryTraversal(_)
                | StashError::Timeout
                | StashError::ConnectionClosed
                | StashError::Crypto(_)
                | StashError::Io(_)
        )
    }
}
