use thiserror::Error;

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Encoding error: {0}")]
    EncodeError(String),

    #[error("Decoding error: {0}")]
    DecodeError(String),

    #[error("Corrupt log: {0}")]
    Corrupt(String),

    #[error("Storage unavailable: {0}")]
    Unavailable(String),

    #[error("Storage lock poisoned")]
    Poisoned,
}
