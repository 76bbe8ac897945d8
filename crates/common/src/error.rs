//! Configuration error types

use thiserror::Error;

/// Errors raised while loading and validating switcher configuration
#[derive(Error, Debug)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("cannot resolve {0}: HOME is not set and no explicit path was configured")]
    UnresolvedPath(&'static str),
}

/// Result alias using common Error
pub type Result<T> = std::result::Result<T, Error>;
