use thiserror::Error;

/// Canonical result for core.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Invalid configuration: {0}")]
    Config(String),

    // The core crate does not issue syscalls, but `Platform` implementations
    // map their OS errors into this variant.
    #[error("Platform error: {0}")]
    Platform(String),

    #[error("Unsupported platform operation: {0}")]
    Unsupported(&'static str),
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Config(e.to_string())
    }
}
