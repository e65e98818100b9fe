use thiserror::Error;

pub type Result<T> = std::result::Result<T, B2sError>;

#[derive(Debug, Error)]
pub enum B2sError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("lock already held by pid {0}")]
    LockHeld(String),

    #[error("snapshot operation failed: {0}")]
    Snapshot(String),

    #[error("btrfs send failed: {0}")]
    Send(String),

    #[error("btrfs receive failed: {0}")]
    Receive(String),

    #[error("upload failed: {0}")]
    Upload(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("integrity check failed: {0}")]
    Integrity(String),

    #[error("archive restore not ready: {0}")]
    RestoreTimeout(String),

    #[error("precondition failed: {0}")]
    Precondition(String),

    #[error("interrupted by signal")]
    Interrupted,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("{0}")]
    Other(String),
}

impl B2sError {
    /// Process exit code for this error kind.
    ///
    /// 0 success, 1 generic, 2 config, 3 lock contention, 4 external tool,
    /// 5 S3 after retries, 6 integrity, 7 restore readiness timeout.
    pub fn exit_code(&self) -> i32 {
        match self {
            B2sError::Config(_) => 2,
            B2sError::LockHeld(_) => 3,
            B2sError::Snapshot(_) | B2sError::Send(_) | B2sError::Receive(_) => 4,
            B2sError::Upload(_) | B2sError::Storage(_) => 5,
            B2sError::Integrity(_) => 6,
            B2sError::RestoreTimeout(_) => 7,
            B2sError::Precondition(_)
            | B2sError::Interrupted
            | B2sError::Io(_)
            | B2sError::Json(_)
            | B2sError::Other(_) => 1,
        }
    }
}
