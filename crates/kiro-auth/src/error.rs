//! Error types for credential storage and provider calls
//!
//! Provider rejections are not errors here: they come back as
//! `RefreshOutcome::Failure` or `ProbeOutcome`. These variants cover
//! local conditions the caller cannot route around.

/// Errors from credential storage and HTTP client setup.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("HTTP client error: {0}")]
    Http(String),

    #[error("credential parse error: {0}")]
    CredentialParse(String),

    #[error("invalid credential record: {0}")]
    InvalidRecord(String),

    #[error("I/O error: {0}")]
    Io(String),

    #[error("not found: {0}")]
    NotFound(String),
}

/// Result alias for auth operations.
pub type Result<T> = std::result::Result<T, Error>;
