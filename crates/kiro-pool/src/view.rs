//! Derived per-account view
//!
//! `AccountView` joins a credential record with its cached usage and
//! switch counters and adds computed flags. Views are rebuilt on every load
//! and never mutated. They carry no secrets, so they are safe to serialize
//! to collaborators.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use kiro_auth::expiry;
use kiro_auth::{DEFAULT_USAGE_LIMIT, InstalledToken, StoredCredential, UsageSnapshot};
use serde::Serialize;

use crate::aliases::AccountKeys;
use crate::usage_stats::UsageStat;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AccountView {
    pub id: String,
    pub label: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    pub region: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    /// Refresh token matches the installed current token
    pub is_active: bool,
    pub is_expired: bool,
    pub needs_refresh: bool,
    pub is_truly_invalid: bool,
    pub is_refreshable: bool,
    /// Cached usage; stale entries have unknown usage but keep ban flags
    pub usage: Option<UsageSnapshot>,
    pub usage_count: u64,
    pub token_limit: i64,
}

impl AccountView {
    pub fn keys(&self) -> AccountKeys {
        AccountKeys {
            id: self.id.clone(),
            label: Some(self.label.clone()).filter(|l| *l != self.id),
            email: self.email.clone(),
        }
    }

    pub fn is_banned(&self) -> bool {
        self.usage.as_ref().is_some_and(|u| u.is_banned)
    }

    pub fn is_suspended(&self) -> bool {
        self.usage.as_ref().is_some_and(|u| u.suspended)
    }

    pub fn is_exhausted(&self) -> bool {
        self.usage.as_ref().is_some_and(|u| u.is_exhausted())
    }

    /// Remaining lifetime label, see [`expiry::expires_in_text`].
    pub fn expires_in_text(&self, now: DateTime<Utc>) -> String {
        expiry::expires_in_text(self.expires_at, now)
    }
}

/// Build the sorted view list: active first, then newest first.
///
/// Pure: every input is passed in, including the clock reading.
pub fn build_views(
    stored: &[StoredCredential],
    current: Option<&InstalledToken>,
    usage: &HashMap<String, UsageSnapshot>,
    stats: &HashMap<String, UsageStat>,
    now: DateTime<Utc>,
) -> Vec<AccountView> {
    let active_refresh = current
        .and_then(|c| c.refresh_token.as_ref())
        .filter(|r| !r.is_empty());

    let mut views: Vec<AccountView> = stored
        .iter()
        .map(|s| {
            let record = &s.record;
            let keys = AccountKeys::from_record(record);
            let usage = keys.lookup(usage).map(|u| {
                if u.stale {
                    u.with_unknown_usage()
                } else {
                    u.clone()
                }
            });
            let stat = keys.lookup(stats);
            let is_active = match (active_refresh, record.refresh_token.as_ref()) {
                (Some(active), Some(own)) => active == own,
                _ => false,
            };

            AccountView {
                id: record.id.clone(),
                label: record.label().to_string(),
                email: keys.email.clone(),
                region: record.region().to_string(),
                provider: record.provider.clone(),
                expires_at: record.expires_at,
                created_at: s.created_at,
                is_active,
                is_expired: record.is_expired(now),
                needs_refresh: record.needs_refresh(now),
                is_truly_invalid: record.is_truly_invalid(now),
                is_refreshable: record.is_refreshable(),
                usage,
                usage_count: stat.map(|s| s.count).unwrap_or(0),
                token_limit: stat.map(|s| s.limit).unwrap_or(DEFAULT_USAGE_LIMIT),
            }
        })
        .collect();

    views.sort_by(|a, b| {
        b.is_active
            .cmp(&a.is_active)
            .then_with(|| b.created_at.cmp(&a.created_at))
            .then_with(|| a.id.cmp(&b.id))
    });
    views
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use chrono::Duration;
    use common::Secret;
    use kiro_auth::CredentialRecord;

    use super::*;

    fn stored(id: &str, created_days_ago: i64, now: DateTime<Utc>) -> StoredCredential {
        let mut record = CredentialRecord::new(id, format!("at_{id}"));
        record.refresh_token = Some(Secret::new(format!("rt_{id}")));
        record.client_id = Some("cid".into());
        record.client_secret = Some(Secret::from("csec"));
        record.expires_at = Some(now + Duration::hours(1));
        StoredCredential {
            record,
            path: PathBuf::from(id),
            created_at: now - Duration::days(created_days_ago),
        }
    }

    fn installed(refresh: &str) -> InstalledToken {
        serde_json::from_value(serde_json::json!({
            "accessToken": "x",
            "refreshToken": refresh,
        }))
        .unwrap()
    }

    #[test]
    fn active_first_then_newest() {
        let now = Utc::now();
        let accounts = vec![
            stored("token-old.json", 30, now),
            stored("token-new.json", 1, now),
            stored("token-mid.json", 10, now),
        ];
        let current = installed("rt_token-old.json");

        let views = build_views(
            &accounts,
            Some(&current),
            &HashMap::new(),
            &HashMap::new(),
            now,
        );
        let ids: Vec<_> = views.iter().map(|v| v.id.as_str()).collect();
        assert_eq!(ids, vec!["token-old.json", "token-new.json", "token-mid.json"]);
        assert!(views[0].is_active);
        assert!(!views[1].is_active);
    }

    #[test]
    fn no_installed_token_means_nothing_active() {
        let now = Utc::now();
        let views = build_views(
            &[stored("token-a.json", 1, now)],
            None,
            &HashMap::new(),
            &HashMap::new(),
            now,
        );
        assert!(!views[0].is_active);
    }

    #[test]
    fn stale_usage_renders_unknown_but_banned() {
        let now = Utc::now();
        let mut usage = HashMap::new();
        usage.insert(
            "token-a.json".to_string(),
            UsageSnapshot {
                current_usage: 300,
                percentage_used: 60,
                days_remaining: 9,
                stale: true,
                is_banned: true,
                ban_reason: Some("TEMPORARILY_SUSPENDED".into()),
                ..UsageSnapshot::default()
            },
        );

        let views = build_views(
            &[stored("token-a.json", 1, now)],
            None,
            &usage,
            &HashMap::new(),
            now,
        );
        let u = views[0].usage.as_ref().unwrap();
        assert_eq!(u.current_usage, -1);
        assert_eq!(u.days_remaining, -1);
        assert!(views[0].is_banned());
    }

    #[test]
    fn expiry_flags_and_stats() {
        let now = Utc::now();
        let mut s = stored("token-a.json", 1, now);
        s.record.expires_at = Some(now + Duration::minutes(5));
        s.record.account_label = Some("alpha".into());
        let mut stats = HashMap::new();
        stats.insert(
            "alpha".to_string(),
            UsageStat {
                count: 4,
                last_used: None,
                limit: 800,
            },
        );

        let views = build_views(&[s], None, &HashMap::new(), &stats, now);
        let v = &views[0];
        assert!(!v.is_expired);
        assert!(v.needs_refresh);
        assert!(!v.is_truly_invalid);
        assert_eq!(v.usage_count, 4);
        assert_eq!(v.token_limit, 800);
        assert_eq!(v.label, "alpha");
        assert_eq!(v.expires_in_text(now), "5m");
    }

    #[test]
    fn view_serializes_without_secrets() {
        let now = Utc::now();
        let views = build_views(
            &[stored("token-a.json", 1, now)],
            None,
            &HashMap::new(),
            &HashMap::new(),
            now,
        );
        let json = serde_json::to_string(&views[0]).unwrap();
        assert!(!json.contains("at_token-a.json"));
        assert!(!json.contains("rt_token-a.json"));
        assert!(!json.contains("csec"));
        assert!(json.contains("\"isActive\":false"));
    }
}
