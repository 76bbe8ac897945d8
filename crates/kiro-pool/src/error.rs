//! Error types for account service operations
//!
//! Provider rejections are values (`SwitchResult`, `RefreshOutcome`,
//! `HealthReport`). These variants cover unknown ids and local I/O.

/// Errors from account service operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("account not found: {0}")]
    NotFound(String),

    #[error("credential store error: {0}")]
    Store(#[from] kiro_auth::Error),

    #[error("usage cache error: {0}")]
    Cache(String),
}

/// Result alias for pool operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_errors_convert() {
        let err: Error = kiro_auth::Error::Io("disk full".into()).into();
        assert!(matches!(err, Error::Store(_)));
        assert_eq!(err.to_string(), "credential store error: I/O error: disk full");
    }
}
