use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("storage unavailable: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error("not found")]
    NotFound,

    #[error("already exists")]
    AlreadyExists,

    #[error("validation failed: {0}")]
    Validation(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("invalid configuration file: {0}")]
    ConfigParse(#[from] toml::de::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl Error {
    pub fn validation(message: impl Into<String>) -> Self {
        Error::Validation(message.into())
    }

    /// True for failures of the backing store, as opposed to bad input.
    #[must_use]
    pub fn is_storage(&self) -> bool {
        matches!(self, Error::Storage(_) | Error::Io(_))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
