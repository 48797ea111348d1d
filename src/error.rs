//! Error types for the MoteDB B-tree engine

use thiserror::Error;

pub type Result<T> = std::result::Result<T, StorageError>;

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Index error: {0}")]
    Index(String),

    #[error("Invalid data: {0}")]
    InvalidData(String),

    /// No free page could be reserved; raised before any structural change.
    #[error("Resource exhausted: {0}")]
    ResourceExhausted(String),

    /// The tuple can never fit on a page of the configured size.
    #[error("Record too big: {size} bytes (max {max})")]
    RecordTooBig { size: usize, max: usize },

    #[error("Data corruption: {0}")]
    Corruption(String),

    #[error("Lock error: {0}")]
    Lock(String),

    #[error("Duplicate key")]
    DuplicateKey,

    #[error("Key not found")]
    NotFound,

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
}

impl From<bincode::Error> for StorageError {
    fn from(err: bincode::Error) -> Self {
        StorageError::Serialization(err.to_string())
    }
}
