use thiserror::Error;

use palaver_store::StoreError;

/// Error kinds surfaced by the core. User-visible text never carries internal
/// identifiers; the detail lives in logs keyed by request id.
#[derive(Error, Debug)]
pub enum CoreError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("not found")]
    NotFound,

    #[error("conflict")]
    Conflict,

    #[error("key generation failed")]
    KeyGeneration,

    #[error("key persistence failed")]
    KeyPersistence,

    #[error("key decryption failed")]
    KeyDecryption,

    #[error("key not found")]
    KeyNotFound,

    #[error("key revoked")]
    KeyRevoked,

    #[error("encryption error")]
    Encryption,

    #[error("decryption error")]
    Decryption,

    #[error("storage unavailable")]
    StorageUnavailable,

    #[error("unauthorized")]
    Unauthorized,

    #[error("user is not a member of this room")]
    ForbiddenMember,

    #[error("operation cancelled")]
    Cancelled,
}

impl From<StoreError> for CoreError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound => CoreError::NotFound,
            StoreError::InvalidId => CoreError::InvalidArgument("invalid id".to_string()),
            StoreError::InvalidUserId => {
                CoreError::InvalidArgument("invalid user id".to_string())
            }
            StoreError::InvalidCursor(_) => {
                CoreError::InvalidArgument("invalid cursor".to_string())
            }
            other => {
                tracing::error!(error = %other, "store operation failed");
                CoreError::StorageUnavailable
            }
        }
    }
}
