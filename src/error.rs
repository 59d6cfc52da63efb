use thiserror::Error;

/// Failures of the local document store and the replication primitive.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Database '{0}' not found")]
    DatabaseNotFound(String),

    #[error("Invalid database name '{0}'")]
    InvalidDatabaseName(String),

    #[error("Document '{0}' not found")]
    DocumentNotFound(String),

    #[error("Document update conflict on '{0}'")]
    Conflict(String),

    #[error("Invalid document: {0}")]
    InvalidDocument(String),

    #[error("Remote '{0}' is unavailable")]
    RemoteUnavailable(String),

    #[error("Invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),

    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Replication requires a Tokio runtime: {0}")]
    Runtime(#[from] tokio::runtime::TryCurrentError),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Failures of the session/channel/subscription/installation lifecycle.
#[derive(Error, Debug)]
pub enum SyncpointError {
    #[error("Session is not paired")]
    NotPaired,

    #[error("Channel '{0}' is not ready")]
    NotReady(String),

    #[error("Channel '{0}' is already subscribed")]
    AlreadySubscribed(String),

    #[error("Installation '{0}' belongs to another device")]
    NotLocal(String),

    #[error("Installation '{0}' has been uninstalled")]
    Uninstalled(String),

    #[error("Pairing rejected: {0}")]
    PairingRejected(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

pub type SyncpointResult<T> = Result<T, SyncpointError>;

impl SyncpointError {
    /// The underlying store failure, if this error wraps one.
    pub fn store_cause(&self) -> Option<&StoreError> {
        match self {
            SyncpointError::Store(cause) => Some(cause),
            _ => None,
        }
    }
}

impl serde::Serialize for SyncpointError {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.collect_str(self)
    }
}

impl From<rusqlite::Error> for SyncpointError {
    fn from(err: rusqlite::Error) -> Self {
        SyncpointError::Store(StoreError::Sqlite(err))
    }
}
