//! Ban classification
//!
//! A bare `AccessDeniedException` is not a ban: rate limits and regional
//! hiccups come back as access-denied too. Only two signals count:
//! - a refresh error whose message says access is "not available"
//! - a 403 from the usage endpoint with reason `TEMPORARILY_SUSPENDED`

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, warn};

use crate::constants::ACCESS_NOT_AVAILABLE_SIGNAL;
use crate::credentials::CredentialRecord;
use crate::token::{OidcErrorKind, RefreshClient, RefreshFailure, RefreshOutcome, RefreshedToken};
use crate::usage::{ProbeOutcome, UsageClient, UsageSnapshot};

/// Whether a refresh rejection is an unambiguous ban.
///
/// The kind is deliberately ignored: the message alone decides.
pub fn is_blocked_access_error(_kind: OidcErrorKind, message: &str) -> bool {
    message
        .to_ascii_lowercase()
        .contains(ACCESS_NOT_AVAILABLE_SIGNAL)
}

/// Health verdict for one account.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthVerdict {
    Healthy,
    /// Refresh or probe failed for a reason that may pass (network, rate limit)
    Transient,
    /// Refresh token rejected as invalid or expired
    Expired,
    Banned,
    /// Record lacks refresh token or client credentials; no call was made
    CredentialIncomplete,
}

impl HealthVerdict {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Healthy => "healthy",
            Self::Transient => "transient",
            Self::Expired => "expired",
            Self::Banned => "banned",
            Self::CredentialIncomplete => "credential_incomplete",
        }
    }
}

/// Outcome of [`BanClassifier::check_ban_status`].
#[derive(Debug, Clone)]
pub struct BanCheck {
    pub verdict: HealthVerdict,
    /// New token material when the refresh step succeeded. The caller
    /// persists it; the classifier never writes.
    pub refreshed: Option<RefreshedToken>,
    /// Fresh snapshot on a healthy verdict with quota data, or a ban record
    pub usage: Option<UsageSnapshot>,
    /// Refresh failure, when that is what decided the verdict
    pub failure: Option<RefreshFailure>,
    pub error: Option<String>,
    pub message: Option<String>,
}

impl BanCheck {
    fn verdict(verdict: HealthVerdict) -> Self {
        Self {
            verdict,
            refreshed: None,
            usage: None,
            failure: None,
            error: None,
            message: None,
        }
    }

    pub fn is_banned(&self) -> bool {
        self.verdict == HealthVerdict::Banned
    }
}

/// Map a refresh failure to a verdict.
pub fn verdict_for_failure(failure: &RefreshFailure) -> HealthVerdict {
    if failure.is_banned {
        HealthVerdict::Banned
    } else if matches!(
        failure.kind,
        OidcErrorKind::InvalidGrant | OidcErrorKind::ExpiredToken
    ) {
        HealthVerdict::Expired
    } else {
        HealthVerdict::Transient
    }
}

/// Refresh + probe health check.
#[derive(Clone)]
pub struct BanClassifier {
    refresh: RefreshClient,
    usage: UsageClient,
}

impl BanClassifier {
    pub fn new(refresh: RefreshClient, usage: UsageClient) -> Self {
        Self { refresh, usage }
    }

    pub fn refresh_client(&self) -> &RefreshClient {
        &self.refresh
    }

    pub fn usage_client(&self) -> &UsageClient {
        &self.usage
    }

    /// Refresh the record's token, then probe the usage endpoint with it.
    pub async fn check_ban_status(&self, record: &CredentialRecord, now: DateTime<Utc>) -> BanCheck {
        let (Some(refresh_token), Some(client_id), Some(client_secret)) = (
            record.refresh_token.as_ref(),
            record.client_id.as_deref(),
            record.client_secret.as_ref(),
        ) else {
            return BanCheck {
                message: Some("missing refresh token or client credentials".into()),
                ..BanCheck::verdict(HealthVerdict::CredentialIncomplete)
            };
        };
        if !record.is_refreshable() {
            return BanCheck::verdict(HealthVerdict::CredentialIncomplete);
        }

        let region = record.region();
        let token = match self
            .refresh
            .refresh(
                refresh_token.expose(),
                client_id,
                client_secret.expose(),
                region,
            )
            .await
        {
            RefreshOutcome::Success(token) => token,
            RefreshOutcome::Failure(failure) => {
                let verdict = verdict_for_failure(&failure);
                debug!(account_id = %record.id, kind = %failure.kind, verdict = verdict.as_str(), "health check refresh failed");
                return BanCheck {
                    usage: (verdict == HealthVerdict::Banned)
                        .then(|| UsageSnapshot::banned(failure.message.clone(), now)),
                    error: Some(failure.kind.to_string()),
                    message: Some(failure.message.clone()),
                    failure: Some(failure),
                    ..BanCheck::verdict(verdict)
                };
            }
        };

        let probe = self.usage.probe(token.access_token.expose(), region).await;
        let mut check = match probe {
            ProbeOutcome::Usage(limits) => BanCheck {
                usage: Some(limits.into_snapshot(now)),
                ..BanCheck::verdict(HealthVerdict::Healthy)
            },
            ProbeOutcome::Denied {
                banned: true,
                reason,
                message,
            } => {
                warn!(account_id = %record.id, %reason, "usage probe reports account suspended");
                BanCheck {
                    usage: Some(UsageSnapshot::banned(reason, now)),
                    error: Some(OidcErrorKind::AccessDenied.to_string()),
                    message: Some(message),
                    ..BanCheck::verdict(HealthVerdict::Banned)
                }
            }
            // Refresh succeeded and no ban signal: the account works even
            // though quota data is unavailable right now.
            ProbeOutcome::Denied { message, .. } => BanCheck {
                error: Some(OidcErrorKind::AccessDenied.to_string()),
                message: Some(message),
                ..BanCheck::verdict(HealthVerdict::Healthy)
            },
            ProbeOutcome::Failed { error, message } => BanCheck {
                error: Some(error),
                message: Some(message),
                ..BanCheck::verdict(HealthVerdict::Healthy)
            },
        };
        check.refreshed = Some(token);
        check
    }
}
