//! Failures of the plugin store, and their mapping onto runtime errors.
//!
//! Every redb failure collapses into [`Error::Storage`] tagged with the stage
//! that failed (open, transaction, table, commit), which is all the runtime
//! can act on.

use thiserror::Error;

pub use hearth_core::error::Error as CoreError;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// Creating the store directory or reading the database file failed.
    #[error("Plugin store I/O failed: {0}")]
    Io(#[from] std::io::Error),

    /// A record or config document could not be encoded or decoded as JSON.
    #[error("Plugin store encoding failed: {0}")]
    Serialization(String),

    #[error("Plugin store failed: {0}")]
    Storage(String),

    /// A stored value whose key disagrees with its content.
    #[error("Corrupt record '{key}': {reason}")]
    Corrupt { key: String, reason: String },
}

impl From<Error> for CoreError {
    fn from(e: Error) -> Self {
        match e {
            Error::Serialization(s) => CoreError::Serialization(s),
            Error::Storage(s) => CoreError::Storage(s),
            e @ (Error::Io(_) | Error::Corrupt { .. }) => CoreError::Storage(e.to_string()),
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

macro_rules! redb_stage {
    ($($ty:ty => $stage:literal),* $(,)?) => {
        $(
            impl From<$ty> for Error {
                fn from(e: $ty) -> Self {
                    Error::Storage(format!("{}: {}", $stage, e))
                }
            }
        )*
    };
}

redb_stage! {
    redb::Error => "redb",
    redb::DatabaseError => "opening database",
    redb::TransactionError => "beginning transaction",
    redb::TableError => "opening table",
    redb::StorageError => "reading table",
    redb::CommitError => "committing",
}

impl From<tokio::task::JoinError> for Error {
    fn from(e: tokio::task::JoinError) -> Self {
        Error::Storage(format!("blocking store task failed: {}", e))
    }
}
