use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("{what} not found: {id}")]
    NotFound { what: &'static str, id: String },

    #[error("invalid stored data: {0}")]
    InvalidData(String),

    #[error("refund rejected: {0}")]
    RefundRejected(String),
}

pub type Result<T> = std::result::Result<T, StoreError>;
