use crate::Mac;

/// Error kinds callers are expected to react to.
///
/// Application code propagates `anyhow::Error`; these variants are attached
/// where the kind matters so callers can classify with `downcast_ref`.
#[derive(Debug, thiserror::Error)]
pub enum RepositoryError {
    #[error("packfile {0} not found")]
    PackfileNotFound(Mac),

    #[error("state {0} not found")]
    StateNotFound(Mac),

    #[error("blob {0} not found")]
    BlobNotFound(Mac),

    #[error("snapshot {0} not found")]
    SnapshotNotFound(String),

    #[error("no such entry: {0}")]
    EntryNotFound(String),

    #[error("integrity check failed: {0}")]
    Integrity(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error("{0} is in use by another process")]
    InUse(String),

    #[error("store does not allow writes")]
    NotWritable,

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("unable to unlock repository: invalid passphrase")]
    Unauthorized,
}

impl RepositoryError {
    /// Whether an enumeration may skip over this error and continue.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            RepositoryError::PackfileNotFound(_)
                | RepositoryError::StateNotFound(_)
                | RepositoryError::EntryNotFound(_)
        )
    }
}

/// Classify an `anyhow::Error` as cancellation.
pub fn is_cancelled(err: &anyhow::Error) -> bool {
    matches!(
        err.downcast_ref::<RepositoryError>(),
        Some(RepositoryError::Cancelled)
    )
}
