//! Error types for mailcode-linker

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Mailbox connection error: {0}")]
    Connection(String),

    #[error("No verification code found: {0}")]
    NotFound(String),

    #[error("Mailbox {0} already exists")]
    DuplicateIdentity(String),

    #[error("Guard type not supported in batch mode: {0}")]
    UnsupportedGuard(String),

    #[error("No mailbox mapped for login {0}")]
    MissingMapping(String),

    #[error("Login failed: {0}")]
    Login(String),

    #[error("Link failed: {0}")]
    Link(String),

    #[error("Persisting linked account failed: {0}")]
    Persist(String),

    #[error("Secret encryption error: {0}")]
    Crypto(String),

    #[error("A batch run is already in progress")]
    RunInProgress,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
