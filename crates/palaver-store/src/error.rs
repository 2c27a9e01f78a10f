use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("could not determine application data directory")]
    NoDataDir,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("record not found")]
    NotFound,

    #[error("invalid id")]
    InvalidId,

    #[error("invalid user id")]
    InvalidUserId,

    #[error("invalid cursor: {0}")]
    InvalidCursor(#[from] chrono::ParseError),

    #[error("migration error: {0}")]
    Migration(String),

    #[error("metadata encoding error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, StoreError>;
