use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by the index engine.
#[derive(Debug, Error)]
pub enum Error {
    /// Malformed encoder output or vector input: length mismatch, id out of range, bad weight.
    #[error("validation error: {0}")]
    Validation(String),

    #[error("dimension mismatch: index has {expected} dims, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    /// On-disk state failed consistency checks at open time.
    #[error("corrupt index: {0}")]
    CorruptIndex(String),

    #[error("query vector has no terms")]
    EmptyQueryVector,

    #[error("index is closed")]
    IndexClosed,

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("text input requires an encoder; open the index with one attached")]
    EncoderMissing,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("storage error: {0}")]
    Storage(#[from] sled::Error),

    #[error("encoding error: {0}")]
    Encoding(String),
}

impl Error {
    pub(crate) fn corrupt(msg: impl Into<String>) -> Self { Error::CorruptIndex(msg.into()) }

    pub(crate) fn validation(msg: impl Into<String>) -> Self { Error::Validation(msg.into()) }
}

impl From<bincode::Error> for Error {
    fn from(e: bincode::Error) -> Self { Error::Encoding(e.to_string()) }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self { Error::Encoding(e.to_string()) }
}
