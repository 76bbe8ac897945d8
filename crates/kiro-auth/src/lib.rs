//! Kiro credential library
//!
//! File-per-account credential storage, the OIDC refresh-token exchange,
//! the usage-limits probe and ban classification. No pool state lives
//! here; `kiro-pool` builds the account service on top of these pieces.
//!
//! Credential flow:
//! 1. The registration tool (or `CredentialStore::import`) drops `token-*.json` files
//! 2. `CredentialStore::list_all()` loads them
//! 3. `RefreshClient::refresh()` renews access tokens near expiry
//! 4. `BanClassifier::check_ban_status()` refreshes and probes usage limits
//! 5. `CredentialStore::install_current()` hands a token to the IDE

pub mod ban;
pub mod constants;
pub mod credentials;
pub mod error;
pub mod expiry;
pub mod persist;
pub mod token;
pub mod usage;

pub use ban::{BanCheck, BanClassifier, HealthVerdict, is_blocked_access_error};
pub use constants::*;
pub use credentials::{CredentialRecord, CredentialStore, InstalledToken, StoredCredential};
pub use error::{Error, Result};
pub use token::{OidcErrorKind, RefreshClient, RefreshFailure, RefreshOutcome, RefreshedToken};
pub use usage::{ProbeOutcome, UsageClient, UsageLimits, UsageSnapshot};
