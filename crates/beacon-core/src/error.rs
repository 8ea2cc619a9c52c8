use std::fmt;

use thiserror::Error;

/// Core error type for Beacon operations.
#[derive(Error, Debug)]
pub enum BeaconError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error(transparent)]
    UndefinedClusterView(#[from] UndefinedClusterView),

    #[error("Connector error: {0}")]
    Connector(String),

    #[error("Job error: {0}")]
    Job(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<serde_json::Error> for BeaconError {
    fn from(e: serde_json::Error) -> Self {
        BeaconError::Serialization(e.to_string())
    }
}

/// Result type alias using BeaconError.
pub type Result<T> = std::result::Result<T, BeaconError>;

/// Errors raised by a resource store.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// The store could not be reached.
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// A commit collided with a concurrent writer.
    #[error("commit conflict at {path}: {message}")]
    Conflict { path: String, message: String },

    #[error("resource not found: {0}")]
    NotFound(String),

    #[error("invalid resource data: {0}")]
    Serialization(String),

    #[error("store backend error: {0}")]
    Backend(String),
}

impl StoreError {
    pub fn conflict(path: impl Into<String>, message: impl Into<String>) -> Self {
        StoreError::Conflict {
            path: path.into(),
            message: message.into(),
        }
    }

    /// Whether the failure is worth retrying on the next pass.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            StoreError::Unavailable(_) | StoreError::Conflict { .. } | StoreError::Backend(_)
        )
    }
}

/// Result type alias for store operations.
pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Why the local cluster view could not be determined.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UndefinedReason {
    /// Reading the store failed.
    RepositoryException,
    /// This instance's own heartbeat is missing or stale.
    IsolatedFromTopology,
    /// No voting has established a view yet.
    NoEstablishedView,
    /// The established view no longer matches the live instances.
    EstablishedViewMismatch,
}

impl UndefinedReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RepositoryException => "REPOSITORY_EXCEPTION",
            Self::IsolatedFromTopology => "ISOLATED_FROM_TOPOLOGY",
            Self::NoEstablishedView => "NO_ESTABLISHED_VIEW",
            Self::EstablishedViewMismatch => "ESTABLISHED_VIEW_MISMATCH",
        }
    }
}

impl fmt::Display for UndefinedReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The local cluster view is currently undefined.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("undefined cluster view ({reason}): {message}")]
pub struct UndefinedClusterView {
    pub reason: UndefinedReason,
    pub message: String,
}

impl UndefinedClusterView {
    /// Create an error with the given reason.
    pub fn new(reason: UndefinedReason, message: impl Into<String>) -> Self {
        Self {
            reason,
            message: message.into(),
        }
    }

    pub fn is_isolation(&self) -> bool {
        self.reason == UndefinedReason::IsolatedFromTopology
    }
}
