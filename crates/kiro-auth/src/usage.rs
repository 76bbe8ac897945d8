//! Usage-limits probe and the cached usage snapshot
//!
//! The usage-limits endpoint serves two purposes: it reports quota, and it
//! is the only reliable ban signal. A successful refresh alone does not
//! prove the account can still call the API.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::constants::{DEFAULT_USAGE_LIMIT, PROBE_USER_AGENT, SUSPENDED_REASON, endpoint_for};
use crate::error::{Error, Result};

/// Quota figures from one successful probe.
#[derive(Debug, Clone, PartialEq)]
pub struct UsageLimits {
    /// `-1` when the provider did not report usage
    pub current_usage: i64,
    pub usage_limit: i64,
    pub percentage_used: i64,
    pub next_reset: Option<DateTime<Utc>>,
}

impl UsageLimits {
    /// Convert into a fresh (non-stale, non-banned) snapshot.
    pub fn into_snapshot(self, now: DateTime<Utc>) -> UsageSnapshot {
        UsageSnapshot {
            current_usage: self.current_usage,
            usage_limit: self.usage_limit,
            percentage_used: self.percentage_used,
            days_remaining: days_until(self.next_reset, now),
            next_reset: self.next_reset,
            stale: false,
            suspended: false,
            is_banned: false,
            ban_reason: None,
            updated_at: Some(now),
        }
    }
}

/// Result of one probe call.
#[derive(Debug, Clone, PartialEq)]
pub enum ProbeOutcome {
    Usage(UsageLimits),
    /// HTTP 403. `banned` only when the reason is `TEMPORARILY_SUSPENDED`.
    Denied {
        reason: String,
        message: String,
        banned: bool,
    },
    /// Any other status, an unparseable body, or a transport failure
    Failed { error: String, message: String },
}

/// Per-account quota snapshot, persisted in the usage cache file.
///
/// Once `is_banned` is set only an explicit healthy re-check clears it;
/// marking the entry stale keeps every ban and suspension flag.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageSnapshot {
    #[serde(default = "unknown")]
    pub current_usage: i64,
    #[serde(default = "default_limit")]
    pub usage_limit: i64,
    #[serde(default)]
    pub percentage_used: i64,
    #[serde(default = "unknown")]
    pub days_remaining: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_reset: Option<DateTime<Utc>>,
    #[serde(default)]
    pub stale: bool,
    #[serde(default)]
    pub suspended: bool,
    #[serde(default)]
    pub is_banned: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ban_reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

fn unknown() -> i64 {
    -1
}

fn default_limit() -> i64 {
    DEFAULT_USAGE_LIMIT
}

impl Default for UsageSnapshot {
    fn default() -> Self {
        Self {
            current_usage: -1,
            usage_limit: DEFAULT_USAGE_LIMIT,
            percentage_used: 0,
            days_remaining: -1,
            next_reset: None,
            stale: false,
            suspended: false,
            is_banned: false,
            ban_reason: None,
            updated_at: None,
        }
    }
}

impl UsageSnapshot {
    /// A snapshot that only records a ban.
    pub fn banned(reason: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            is_banned: true,
            suspended: true,
            ban_reason: Some(reason.into()),
            updated_at: Some(now),
            ..Self::default()
        }
    }

    /// Quota used up. Unknown usage is never exhausted.
    pub fn is_exhausted(&self) -> bool {
        self.current_usage >= 0 && self.percentage_used >= 100
    }

    /// Known to be unusable: banned or suspended.
    pub fn is_blocked(&self) -> bool {
        self.is_banned || self.suspended
    }

    /// Same flags, usage figures unknown. Used to render stale entries.
    pub fn with_unknown_usage(&self) -> Self {
        Self {
            current_usage: -1,
            days_remaining: -1,
            percentage_used: 0,
            ..self.clone()
        }
    }
}

/// Whole days until `reset`, rounded up; `-1` when unknown.
pub fn days_until(reset: Option<DateTime<Utc>>, now: DateTime<Utc>) -> i64 {
    const DAY_SECS: i64 = 86_400;
    match reset {
        Some(at) => {
            let secs = (at - now).num_seconds();
            // ceil for positive and negative spans alike
            secs.div_euclid(DAY_SECS) + i64::from(secs.rem_euclid(DAY_SECS) != 0)
        }
        None => -1,
    }
}

/// Client for the authenticated usage-limits endpoint.
#[derive(Clone)]
pub struct UsageClient {
    http: reqwest::Client,
    usage_url_template: String,
}

impl UsageClient {
    pub fn new(usage_url_template: impl Into<String>, timeout: Duration) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::Http(format!("building usage client: {e}")))?;
        Ok(Self::with_client(http, usage_url_template))
    }

    pub fn with_client(http: reqwest::Client, usage_url_template: impl Into<String>) -> Self {
        Self {
            http,
            usage_url_template: usage_url_template.into(),
        }
    }

    /// Fetch usage limits with `access_token`.
    pub async fn probe(&self, access_token: &str, region: &str) -> ProbeOutcome {
        let url = endpoint_for(&self.usage_url_template, region);
        let sent = self
            .http
            .get(&url)
            .bearer_auth(access_token)
            .header(reqwest::header::USER_AGENT, PROBE_USER_AGENT)
            .header(reqwest::header::ACCEPT, "application/json")
            .header("x-amzn-codewhisperer-optout", "true")
            .send()
            .await;

        let response = match sent {
            Ok(r) => r,
            Err(e) if e.is_timeout() => {
                return ProbeOutcome::Failed {
                    error: "Timeout".into(),
                    message: "usage probe timed out".into(),
                };
            }
            Err(e) => {
                warn!(region, error = %e, "usage endpoint unreachable");
                return ProbeOutcome::Failed {
                    error: "NetworkError".into(),
                    message: e.to_string(),
                };
            }
        };

        let status = response.status().as_u16();
        let text = response.text().await.unwrap_or_default();
        let json = serde_json::from_str::<serde_json::Value>(&text).ok();
        debug!(status, region, "usage probe answered");

        match (status, json) {
            (200, Some(json)) => ProbeOutcome::Usage(parse_limits(&json)),
            (403, json) => {
                let field = |key: &str| {
                    json.as_ref()
                        .and_then(|j| j.get(key))
                        .and_then(|v| v.as_str())
                        .filter(|s| !s.is_empty())
                        .map(str::to_string)
                };
                let reason = field("reason").unwrap_or_default();
                let message = field("message")
                    .or_else(|| field("Message"))
                    .unwrap_or_else(|| "Access Denied".into());
                ProbeOutcome::Denied {
                    banned: reason == SUSPENDED_REASON,
                    reason,
                    message,
                }
            }
            (200, None) => ProbeOutcome::Failed {
                error: "ParseError".into(),
                message: text,
            },
            (status, json) => ProbeOutcome::Failed {
                error: format!("HTTP {status}"),
                message: json
                    .as_ref()
                    .and_then(|j| j.get("message"))
                    .and_then(|v| v.as_str())
                    .map(str::to_string)
                    .unwrap_or(text),
            },
        }
    }
}

fn parse_limits(json: &serde_json::Value) -> UsageLimits {
    let limit = json
        .get("limits")
        .and_then(|l| l.get(0))
        .cloned()
        .unwrap_or(serde_json::Value::Null);

    let number = |key: &str| limit.get(key).and_then(|v| v.as_f64());
    let current = number("currentUsage").map(|v| v as i64);
    let usage_limit = number("usageLimit").map(|v| v as i64);

    let percentage_used = match (current, usage_limit) {
        (Some(c), Some(l)) if c > 0 && l > 0 => ((c as f64 / l as f64) * 100.0).round() as i64,
        _ => 0,
    };

    let next_reset = limit
        .get("nextDateReset")
        .or_else(|| json.get("nextDateReset"))
        .and_then(parse_reset);

    UsageLimits {
        current_usage: current.unwrap_or(-1),
        usage_limit: usage_limit.unwrap_or(DEFAULT_USAGE_LIMIT),
        percentage_used,
        next_reset,
    }
}

/// `nextDateReset` arrives as epoch seconds (sometimes milliseconds) or an
/// ISO-8601 string.
fn parse_reset(value: &serde_json::Value) -> Option<DateTime<Utc>> {
    match value {
        serde_json::Value::Number(n) => {
            let raw = n.as_f64()?;
            let secs = if raw > 1e12 { raw / 1000.0 } else { raw };
            DateTime::from_timestamp(secs as i64, 0)
        }
        serde_json::Value::String(s) => DateTime::parse_from_rfc3339(s)
            .map(|d| d.with_timezone(&Utc))
            .ok(),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use axum::Router;
    use axum::http::{HeaderMap, StatusCode};
    use axum::routing::get;
    use chrono::Duration as ChronoDuration;

    use super::*;

    async fn mock_usage_endpoint(
        status: StatusCode,
        body: &'static str,
    ) -> (String, Arc<Mutex<Option<HeaderMap>>>) {
        let seen = Arc::new(Mutex::new(None));
        let recorder = seen.clone();
        let app = Router::new().route(
            "/getUsageLimits",
            get(move |headers: HeaderMap| {
                let recorder = recorder.clone();
                async move {
                    *recorder.lock().unwrap() = Some(headers);
                    (status, body)
                }
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });
        (format!("http://{addr}/getUsageLimits?origin=AI_EDITOR"), seen)
    }

    async fn probe_with(status: StatusCode, body: &'static str) -> ProbeOutcome {
        let (url, _) = mock_usage_endpoint(status, body).await;
        UsageClient::new(url, Duration::from_secs(5))
            .unwrap()
            .probe("at", "us-east-1")
            .await
    }

    #[tokio::test]
    async fn usage_is_parsed_and_headers_sent() {
        let (url, seen) = mock_usage_endpoint(
            StatusCode::OK,
            r#"{"limits":[{"currentUsage":125,"usageLimit":500,"nextDateReset":1893456000}]}"#,
        )
        .await;
        let outcome = UsageClient::new(url, Duration::from_secs(5))
            .unwrap()
            .probe("at_secret", "us-east-1")
            .await;

        let ProbeOutcome::Usage(limits) = outcome else {
            panic!("expected usage, got {outcome:?}");
        };
        assert_eq!(limits.current_usage, 125);
        assert_eq!(limits.usage_limit, 500);
        assert_eq!(limits.percentage_used, 25);
        assert_eq!(limits.next_reset, DateTime::from_timestamp(1_893_456_000, 0));

        let headers = seen.lock().unwrap().clone().unwrap();
        assert_eq!(headers["authorization"], "Bearer at_secret");
        assert_eq!(headers["user-agent"], PROBE_USER_AGENT);
        assert_eq!(headers["x-amzn-codewhisperer-optout"], "true");
    }

    #[tokio::test]
    async fn missing_limits_use_defaults() {
        let ProbeOutcome::Usage(limits) = probe_with(StatusCode::OK, r#"{"limits":[]}"#).await
        else {
            panic!("expected usage");
        };
        assert_eq!(limits.current_usage, -1);
        assert_eq!(limits.usage_limit, 500);
        assert_eq!(limits.percentage_used, 0);
        assert!(limits.next_reset.is_none());
    }

    #[tokio::test]
    async fn suspended_403_is_banned() {
        let outcome = probe_with(
            StatusCode::FORBIDDEN,
            r#"{"reason":"TEMPORARILY_SUSPENDED","message":"Account suspended"}"#,
        )
        .await;
        assert_eq!(
            outcome,
            ProbeOutcome::Denied {
                reason: "TEMPORARILY_SUSPENDED".into(),
                message: "Account suspended".into(),
                banned: true,
            }
        );
    }

    #[tokio::test]
    async fn other_403_is_not_banned() {
        let outcome = probe_with(StatusCode::FORBIDDEN, "not json").await;
        let ProbeOutcome::Denied { banned, message, .. } = outcome else {
            panic!("expected denied");
        };
        assert!(!banned);
        assert_eq!(message, "Access Denied");
    }

    #[tokio::test]
    async fn server_error_is_failed() {
        let outcome = probe_with(StatusCode::INTERNAL_SERVER_ERROR, r#"{"message":"boom"}"#).await;
        assert_eq!(
            outcome,
            ProbeOutcome::Failed {
                error: "HTTP 500".into(),
                message: "boom".into()
            }
        );
    }

    #[tokio::test]
    async fn garbage_200_is_parse_error() {
        let outcome = probe_with(StatusCode::OK, "<html>").await;
        assert!(matches!(outcome, ProbeOutcome::Failed { error, .. } if error == "ParseError"));
    }

    #[test]
    fn reset_accepts_iso_and_millis() {
        let iso = serde_json::json!("2030-01-01T00:00:00Z");
        let millis = serde_json::json!(1_893_456_000_000u64);
        assert_eq!(parse_reset(&iso), DateTime::from_timestamp(1_893_456_000, 0));
        assert_eq!(parse_reset(&millis), DateTime::from_timestamp(1_893_456_000, 0));
    }

    #[test]
    fn days_until_rounds_up() {
        let now = Utc::now();
        assert_eq!(days_until(None, now), -1);
        assert_eq!(days_until(Some(now + ChronoDuration::hours(1)), now), 1);
        assert_eq!(days_until(Some(now + ChronoDuration::days(3)), now), 3);
        assert_eq!(
            days_until(Some(now + ChronoDuration::days(3) + ChronoDuration::seconds(1)), now),
            4
        );
    }

    #[test]
    fn exhaustion_requires_known_usage() {
        let mut snap = UsageSnapshot {
            current_usage: 500,
            percentage_used: 100,
            ..UsageSnapshot::default()
        };
        assert!(snap.is_exhausted());
        snap.current_usage = -1;
        assert!(!snap.is_exhausted());
        snap.current_usage = 10;
        snap.percentage_used = 2;
        assert!(!snap.is_exhausted());
    }

    #[test]
    fn unknown_usage_keeps_ban_flags() {
        let snap = UsageSnapshot::banned("TEMPORARILY_SUSPENDED", Utc::now());
        let rendered = snap.with_unknown_usage();
        assert!(rendered.is_banned);
        assert!(rendered.suspended);
        assert_eq!(rendered.ban_reason.as_deref(), Some("TEMPORARILY_SUSPENDED"));
        assert_eq!(rendered.current_usage, -1);
    }

    #[test]
    fn snapshot_reads_sparse_json() {
        let snap: UsageSnapshot = serde_json::from_str(r#"{"isBanned":true}"#).unwrap();
        assert!(snap.is_banned);
        assert_eq!(snap.current_usage, -1);
        assert_eq!(snap.usage_limit, 500);
        assert!(!snap.stale);
    }
}
