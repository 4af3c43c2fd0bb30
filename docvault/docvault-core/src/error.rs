//! Error types surfaced by the repository and its engine boundary.

use thiserror::Error;
use uuid::Uuid;

/// Failure reported by the underlying content engine.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("engine session {0} is not open")]
    SessionClosed(Uuid),

    #[error("engine node {0} does not exist")]
    MissingNode(Uuid),

    #[error("engine node {0} already exists")]
    DuplicateNode(Uuid),

    #[error("version {version} of node {id} does not exist")]
    MissingVersion { id: Uuid, version: String },

    #[error("node {id} is not checked out")]
    NotCheckedOut { id: Uuid },

    #[error("version history of node {0} is still referenced")]
    Referenced(Uuid),

    #[error("engine rejected {operation}: {reason}")]
    Rejected {
        operation: &'static str,
        reason: String,
    },

    #[error("engine io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("engine serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Errors returned by every public repository call.
#[derive(Debug, Error)]
pub enum VaultError {
    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("{kind} already exists: {id}")]
    AlreadyExists { kind: &'static str, id: String },

    #[error("document {id} is locked by {owner}")]
    ResourceLocked { id: Uuid, owner: String },

    #[error("session expired, please log in again")]
    SessionExpired,

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("engine failure: {0}")]
    EngineFailure(#[from] EngineError),
}

impl VaultError {
    pub fn not_found(kind: &'static str, id: impl ToString) -> Self {
        VaultError::NotFound {
            kind,
            id: id.to_string(),
        }
    }

    pub fn already_exists(kind: &'static str, id: impl ToString) -> Self {
        VaultError::AlreadyExists {
            kind,
            id: id.to_string(),
        }
    }

    pub fn denied(msg: impl Into<String>) -> Self {
        VaultError::PermissionDenied(msg.into())
    }

    pub fn invalid(msg: impl Into<String>) -> Self {
        VaultError::InvalidArgument(msg.into())
    }
}

pub type Result<T> = std::result::Result<T, VaultError>;

/// Result type used inside the engine boundary.
pub type EngineResult<T> = std::result::Result<T, EngineError>;
