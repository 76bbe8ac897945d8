//! Operation results returned to collaborators
//!
//! Everything here is a value, not an error: a failed switch is a
//! `SwitchResult` with `success == false`.

use chrono::{DateTime, Utc};
use kiro_auth::{BanCheck, HealthVerdict, OidcErrorKind, RefreshFailure, UsageSnapshot};
use serde::Serialize;

/// Service-level failure taxonomy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Retriable, not specific to the account
    NetworkError,
    /// Retriable after backoff
    RateLimited,
    /// Missing refresh token or client credentials; needs re-import
    CredentialIncomplete,
    /// Token unusable and refresh rejected; needs refresh or re-import
    TokenExpiredPastGrace,
    Banned,
    Unknown,
}

impl FailureKind {
    /// Classify a refresh failure given the record's state at the time.
    pub fn classify(
        failure: &RefreshFailure,
        refreshable: bool,
        expires_at: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Self {
        if !refreshable {
            Self::CredentialIncomplete
        } else if failure.is_banned {
            Self::Banned
        } else if failure.kind == OidcErrorKind::NetworkError {
            Self::NetworkError
        } else if failure.is_rate_limited {
            Self::RateLimited
        } else if kiro_auth::expiry::is_truly_invalid(expires_at, now) {
            Self::TokenExpiredPastGrace
        } else {
            Self::Unknown
        }
    }

    pub fn is_retriable(self) -> bool {
        matches!(self, Self::NetworkError | Self::RateLimited | Self::Unknown)
    }
}

/// Result of `switch_to`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SwitchResult {
    pub account_id: String,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure_kind: Option<FailureKind>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub is_banned: bool,
    /// Switched with the old token after a failed refresh
    pub used_grace_period: bool,
}

impl SwitchResult {
    pub fn switched(account_id: &str, used_grace_period: bool) -> Self {
        Self {
            account_id: account_id.to_string(),
            success: true,
            error: None,
            error_message: None,
            failure_kind: None,
            is_banned: false,
            used_grace_period,
        }
    }

    pub fn failed(account_id: &str, failure: &RefreshFailure, kind: FailureKind) -> Self {
        Self {
            account_id: account_id.to_string(),
            success: false,
            error: Some(failure.kind.to_string()),
            error_message: Some(failure.message.clone()),
            failure_kind: Some(kind),
            is_banned: kind == FailureKind::Banned,
            used_grace_period: false,
        }
    }
}

/// Result of `check_health`, without token material.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthReport {
    pub account_id: String,
    pub verdict: HealthVerdict,
    pub is_banned: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usage: Option<UsageSnapshot>,
}

impl HealthReport {
    pub fn from_check(account_id: &str, check: &BanCheck) -> Self {
        Self {
            account_id: account_id.to_string(),
            verdict: check.verdict,
            is_banned: check.is_banned(),
            error: check.error.clone(),
            message: check.message.clone(),
            usage: check.usage.clone(),
        }
    }
}

/// Per-verdict counts for a batch refresh or health check.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BatchSummary {
    pub total: usize,
    pub healthy: usize,
    pub banned: usize,
    pub expired: usize,
    pub credential_incomplete: usize,
    pub failed: usize,
}

impl BatchSummary {
    pub fn record(&mut self, verdict: HealthVerdict) {
        self.total += 1;
        match verdict {
            HealthVerdict::Healthy => self.healthy += 1,
            HealthVerdict::Banned => self.banned += 1,
            HealthVerdict::Expired => self.expired += 1,
            HealthVerdict::CredentialIncomplete => self.credential_incomplete += 1,
            HealthVerdict::Transient => self.failed += 1,
        }
    }

    /// An account whose operation errored locally.
    pub fn record_error(&mut self) {
        self.total += 1;
        self.failed += 1;
    }
}
