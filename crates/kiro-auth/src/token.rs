//! OIDC refresh-token exchange
//!
//! One POST to `https://oidc.{region}.amazonaws.com/token` with a JSON body
//! `{clientId, clientSecret, grantType, refreshToken}`. Provider rejections
//! are classified into [`OidcErrorKind`] and returned as
//! [`RefreshOutcome::Failure`]; they are never `Err`. Transport failures
//! (DNS, refused connection, timeout) become `NetworkError` so they can't be
//! mistaken for a provider verdict.
//!
//! No retries happen here. Retry policy belongs to the caller.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use common::Secret;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::constants::{DEFAULT_EXPIRES_IN_SECS, MAX_EXPIRES_IN_SECS, endpoint_for};
use crate::error::{Error, Result};

/// Provider error classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OidcErrorKind {
    InvalidGrant,
    AccessDenied,
    ExpiredToken,
    InvalidClient,
    UnauthorizedClient,
    InvalidRequest,
    SlowDown,
    InternalServer,
    AuthorizationPending,
    NetworkError,
    Unknown,
}

impl OidcErrorKind {
    /// Wire name, as the provider spells it in `error` / `__type`.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::InvalidGrant => "InvalidGrantException",
            Self::AccessDenied => "AccessDeniedException",
            Self::ExpiredToken => "ExpiredTokenException",
            Self::InvalidClient => "InvalidClientException",
            Self::UnauthorizedClient => "UnauthorizedClientException",
            Self::InvalidRequest => "InvalidRequestException",
            Self::SlowDown => "SlowDownException",
            Self::InternalServer => "InternalServerException",
            Self::AuthorizationPending => "AuthorizationPendingException",
            Self::NetworkError => "NetworkError",
            Self::Unknown => "UnknownError",
        }
    }

    /// Infer a kind from the HTTP status alone.
    pub fn from_status(status: u16) -> Self {
        match status {
            400 => Self::InvalidRequest,
            401 => Self::InvalidClient,
            403 => Self::AccessDenied,
            429 => Self::SlowDown,
            500..=599 => Self::InternalServer,
            _ => Self::Unknown,
        }
    }
}

impl fmt::Display for OidcErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OidcErrorKind {
    type Err = ();

    /// Accepts `InvalidGrantException`, `invalid_grant`, and AWS-qualified
    /// forms like `com.amazonaws.ssooidc#InvalidGrantException`.
    fn from_str(s: &str) -> std::result::Result<Self, ()> {
        let name = s.rsplit('#').next().unwrap_or(s).trim();
        let kind = match name {
            "InvalidGrantException" | "invalid_grant" => Self::InvalidGrant,
            "AccessDeniedException" | "access_denied" => Self::AccessDenied,
            "ExpiredTokenException" | "expired_token" => Self::ExpiredToken,
            "InvalidClientException" | "invalid_client" => Self::InvalidClient,
            "UnauthorizedClientException" | "unauthorized_client" => Self::UnauthorizedClient,
            "InvalidRequestException" | "invalid_request" => Self::InvalidRequest,
            "SlowDownException" | "slow_down" => Self::SlowDown,
            "InternalServerException" | "internal_server_error" => Self::InternalServer,
            "AuthorizationPendingException" | "authorization_pending" => {
                Self::AuthorizationPending
            }
            _ => return Err(()),
        };
        Ok(kind)
    }
}

/// New token material from a successful refresh.
#[derive(Debug, Clone, PartialEq)]
pub struct RefreshedToken {
    pub access_token: Secret<String>,
    /// Present only when the provider rotated the refresh token
    pub refresh_token: Option<Secret<String>>,
    /// Seconds until the access token expires (delta, not absolute)
    pub expires_in: u64,
}

/// A classified refresh rejection.
#[derive(Debug, Clone, PartialEq)]
pub struct RefreshFailure {
    pub kind: OidcErrorKind,
    pub message: String,
    /// HTTP status when the provider answered at all
    pub status: Option<u16>,
    pub is_banned: bool,
    pub is_invalid_credentials: bool,
    pub is_rate_limited: bool,
}

impl RefreshFailure {
    /// Build a failure and derive its flags from `kind` and `message`.
    pub fn new(kind: OidcErrorKind, message: impl Into<String>, status: Option<u16>) -> Self {
        let message = message.into();
        Self {
            is_banned: crate::ban::is_blocked_access_error(kind, &message),
            is_invalid_credentials: matches!(
                kind,
                OidcErrorKind::InvalidClient | OidcErrorKind::UnauthorizedClient
            ),
            is_rate_limited: kind == OidcErrorKind::SlowDown,
            kind,
            message,
            status,
        }
    }

    /// Failure for a record that lacks refresh token or client credentials.
    pub fn credential_incomplete() -> Self {
        Self::new(
            OidcErrorKind::InvalidRequest,
            "missing refresh token or client credentials",
            None,
        )
    }
}

/// Result of one refresh attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum RefreshOutcome {
    Success(RefreshedToken),
    Failure(RefreshFailure),
}

impl RefreshOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success(_))
    }

    pub fn failure(&self) -> Option<&RefreshFailure> {
        match self {
            Self::Failure(f) => Some(f),
            Self::Success(_) => None,
        }
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct RefreshRequest<'a> {
    client_id: &'a str,
    client_secret: &'a str,
    grant_type: &'static str,
    refresh_token: &'a str,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct TokenResponse {
    #[serde(alias = "access_token")]
    access_token: String,
    #[serde(default, alias = "refresh_token")]
    refresh_token: Option<String>,
    #[serde(default, alias = "expires_in")]
    expires_in: Option<u64>,
}

/// Client for the OIDC token endpoint.
#[derive(Clone)]
pub struct RefreshClient {
    http: reqwest::Client,
    token_url_template: String,
}

impl RefreshClient {
    /// Build a client whose every request carries `timeout`.
    pub fn new(token_url_template: impl Into<String>, timeout: Duration) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::Http(format!("building token client: {e}")))?;
        Ok(Self::with_client(http, token_url_template))
    }

    /// Use an existing `reqwest::Client` (shared connection pool).
    pub fn with_client(http: reqwest::Client, token_url_template: impl Into<String>) -> Self {
        Self {
            http,
            token_url_template: token_url_template.into(),
        }
    }

    /// Exchange a refresh token for a new access token.
    pub async fn refresh(
        &self,
        refresh_token: &str,
        client_id: &str,
        client_secret: &str,
        region: &str,
    ) -> RefreshOutcome {
        let url = endpoint_for(&self.token_url_template, region);
        let body = RefreshRequest {
            client_id,
            client_secret,
            grant_type: "refresh_token",
            refresh_token,
        };

        let response = match self.http.post(&url).json(&body).send().await {
            Ok(r) => r,
            Err(e) => {
                let message = if e.is_timeout() {
                    "token refresh timed out".to_string()
                } else {
                    format!("token refresh request failed: {e}")
                };
                warn!(region, error = %e, "token endpoint unreachable");
                return RefreshOutcome::Failure(RefreshFailure::new(
                    OidcErrorKind::NetworkError,
                    message,
                    None,
                ));
            }
        };

        let status = response.status().as_u16();
        let text = match response.text().await {
            Ok(t) => t,
            Err(e) => {
                return RefreshOutcome::Failure(RefreshFailure::new(
                    OidcErrorKind::NetworkError,
                    format!("reading token response: {e}"),
                    Some(status),
                ));
            }
        };

        if status == 200 {
            return match serde_json::from_str::<TokenResponse>(&text) {
                Ok(token)
                    if !token.access_token.is_empty()
                        && token.expires_in.is_none_or(|s| s <= MAX_EXPIRES_IN_SECS) =>
                {
                    debug!(region, "token refreshed");
                    RefreshOutcome::Success(RefreshedToken {
                        access_token: Secret::new(token.access_token),
                        refresh_token: token
                            .refresh_token
                            .filter(|r| !r.is_empty())
                            .map(Secret::new),
                        expires_in: token.expires_in.unwrap_or(DEFAULT_EXPIRES_IN_SECS),
                    })
                }
                _ => RefreshOutcome::Failure(RefreshFailure::new(
                    OidcErrorKind::Unknown,
                    "failed to parse token response",
                    Some(status),
                )),
            };
        }

        let (kind, message) = parse_error_body(status, &text);
        debug!(status, kind = %kind, "token endpoint rejected refresh");
        RefreshOutcome::Failure(RefreshFailure::new(kind, message, Some(status)))
    }
}

/// Classify a non-200 token endpoint body.
///
/// The type comes from `error` or `__type`; the message from
/// `error_description`, `message` or `Message`, else the raw body. Bodies
/// that are not JSON, or carry no recognised type, fall back to
/// [`OidcErrorKind::from_status`].
pub fn parse_error_body(status: u16, body: &str) -> (OidcErrorKind, String) {
    let fallback_message = || {
        if body.trim().is_empty() {
            format!("HTTP {status}")
        } else {
            body.to_string()
        }
    };

    let Ok(serde_json::Value::Object(json)) = serde_json::from_str::<serde_json::Value>(body)
    else {
        return (OidcErrorKind::from_status(status), fallback_message());
    };

    let str_field = |key: &str| {
        json.get(key)
            .and_then(|v| v.as_str())
            .filter(|s| !s.is_empty())
    };

    let kind = str_field("error")
        .or_else(|| str_field("__type"))
        .and_then(|t| t.parse::<OidcErrorKind>().ok())
        .unwrap_or_else(|| OidcErrorKind::from_status(status));
    let message = str_field("error_description")
        .or_else(|| str_field("message"))
        .or_else(|| str_field("Message"))
        .map(str::to_string)
        .unwrap_or_else(fallback_message);

    (kind, message)
}
