use std::fmt::Display;

use serde::{Deserialize, Serialize};

/// Hypershard errors.
///
/// The capacity variants (`DataFull`, `SearchFull`, `HashFull`) never escape
/// the disk: the flush path matches on them and turns them into a clean or a
/// four-way split of the offending shard.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Error {
    /// A record's column count does not match the disk's arity.
    WrongArity,
    /// A shard's data segment cannot fit the record.
    DataFull,
    /// A shard's search log has no free entries.
    SearchFull,
    /// A shard's hash table probe wrapped without finding a free slot.
    HashFull,
    /// Flushing a memory mapping to disk failed.
    SyncFailed(String),
    /// Removing shard files or the disk directory failed.
    DropFailed(String),
    /// A full shard could not be cleaned or split.
    SplitFailed(String),
    /// The disk directory is missing or could not be claimed.
    MissingDisk(String),
    /// Invalid on-disk data, typically decoding errors or corruption.
    InvalidData(String),
    /// An IO error.
    IO(String),
}

impl std::error::Error for Error {}

impl Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Error::WrongArity => write!(f, "record arity does not match disk arity"),
            Error::DataFull => write!(f, "shard data segment is full"),
            Error::SearchFull => write!(f, "shard search log is full"),
            Error::HashFull => write!(f, "shard hash table is full"),
            Error::SyncFailed(msg) => write!(f, "sync failed: {msg}"),
            Error::DropFailed(msg) => write!(f, "drop failed: {msg}"),
            Error::SplitFailed(msg) => write!(f, "split failed: {msg}"),
            Error::MissingDisk(msg) => write!(f, "missing disk: {msg}"),
            Error::InvalidData(msg) => write!(f, "invalid data: {msg}"),
            Error::IO(msg) => write!(f, "io error: {msg}"),
        }
    }
}

/// A hypershard Result returning Error.
pub type Result<T> = std::result::Result<T, Error>;

impl<T> From<Error> for Result<T> {
    fn from(error: Error) -> Self {
        Err(error)
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::IO(err.to_string())
    }
}

impl<T> From<std::sync::PoisonError<T>> for Error {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        Error::IO(err.to_string())
    }
}

impl From<tokio::task::JoinError> for Error {
    fn from(err: tokio::task::JoinError) -> Self {
        Error::IO(err.to_string())
    }
}
