use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("{0}")]
    IoError(#[from] std::io::Error),
    #[error("{0}")]
    JsonError(#[from] serde_json::Error),
    #[error("Invalid format: {0}")]
    InvalidFormat(String),
    #[error("Metadata must be written once, before any entry")]
    MetadataAlreadyWritten,
    #[error("Resume offset mismatch: token expects {expected} bytes, archive has {actual}")]
    TokenMismatch { expected: u64, actual: u64 },
    #[error("Invalid encryption key")]
    InvalidKey,
    #[error("Encrypted archive requires a password")]
    PasswordRequired,
    #[error("Random number generator failure")]
    RandomError,
    #[error("Invalid backup file name: {0}")]
    InvalidBackupName(String),
    #[error("Inconsistency found in increment files of {0}, a full backup is required")]
    BrokenChain(String),
    #[error("Parent backup not found: {0}")]
    ParentNotFound(String),
    #[error("Required space not available: need {required} bytes, {available} available")]
    InsufficientSpace { required: u64, available: u64 },
    #[error("{0}")]
    PatternError(#[from] globset::Error),
    #[error("{0}")]
    WalkError(#[from] walkdir::Error),
}

impl From<ring::error::Unspecified> for Error {
    fn from(_error: ring::error::Unspecified) -> Error {
        Error::RandomError
    }
}

impl From<hex::FromHexError> for Error {
    fn from(error: hex::FromHexError) -> Error {
        Error::InvalidFormat(error.to_string())
    }
}

impl From<std::num::ParseIntError> for Error {
    fn from(error: std::num::ParseIntError) -> Error {
        Error::InvalidFormat(error.to_string())
    }
}

impl From<std::string::FromUtf8Error> for Error {
    fn from(error: std::string::FromUtf8Error) -> Error {
        Error::InvalidFormat(error.to_string())
    }
}
