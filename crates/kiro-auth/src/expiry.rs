//! Refresh-ahead and grace-period policy
//!
//! Two asymmetric windows around a token's `expiresAt`:
//! - refresh-ahead: a token expiring within 10 minutes should be refreshed
//! - grace: an expired token stays usable until it has been expired for
//!   more than 3 minutes
//!
//! A missing expiry counts as expired, due for refresh and truly invalid.
//! All checks take `now` explicitly so callers and tests share one clock
//! reading per decision.

use chrono::{DateTime, Duration, Utc};

use crate::constants::{AUTH_TOKEN_INVALIDATION_OFFSET_SECS, REFRESH_BEFORE_EXPIRY_SECS};

/// Whether the token is expired at `now + offset_secs`.
pub fn is_expired_with_offset(
    expires_at: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
    offset_secs: i64,
) -> bool {
    match expires_at {
        Some(at) => at <= now + Duration::seconds(offset_secs),
        None => true,
    }
}

/// Plain expiry check (no offset).
pub fn is_expired(expires_at: Option<DateTime<Utc>>, now: DateTime<Utc>) -> bool {
    is_expired_with_offset(expires_at, now, 0)
}

/// Token expires within the refresh-ahead window.
pub fn needs_refresh(expires_at: Option<DateTime<Utc>>, now: DateTime<Utc>) -> bool {
    is_expired_with_offset(expires_at, now, REFRESH_BEFORE_EXPIRY_SECS)
}

/// Token has been expired for longer than the grace period.
pub fn is_truly_invalid(expires_at: Option<DateTime<Utc>>, now: DateTime<Utc>) -> bool {
    match expires_at {
        Some(at) => now > at + Duration::seconds(AUTH_TOKEN_INVALIDATION_OFFSET_SECS),
        None => true,
    }
}

/// Compact remaining-lifetime label: `Exp`, `42m`, `5h`, `3d`, or `?`.
pub fn expires_in_text(expires_at: Option<DateTime<Utc>>, now: DateTime<Utc>) -> String {
    let Some(at) = expires_at else {
        return "?".into();
    };
    let remaining = at - now;
    if remaining <= Duration::zero() {
        return "Exp".into();
    }
    let minutes = remaining.num_minutes();
    if minutes < 60 {
        return format!("{minutes}m");
    }
    let hours = minutes / 60;
    if hours < 24 {
        return format!("{hours}h");
    }
    format!("{}d", hours / 24)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(now: DateTime<Utc>, offset_secs: i64) -> Option<DateTime<Utc>> {
        Some(now + Duration::seconds(offset_secs))
    }

    #[test]
    fn needs_refresh_inside_window() {
        let now = Utc::now();
        for offset in [0, 1, 60, 300, 599, 600] {
            assert!(needs_refresh(at(now, offset), now), "offset {offset}");
        }
    }

    #[test]
    fn needs_refresh_outside_window() {
        let now = Utc::now();
        for offset in [601, 660, 900, 3600, 86_400] {
            assert!(!needs_refresh(at(now, offset), now), "offset {offset}");
        }
    }

    #[test]
    fn already_expired_needs_refresh() {
        let now = Utc::now();
        assert!(needs_refresh(at(now, -60), now));
    }

    #[test]
    fn grace_period_keeps_token_usable() {
        let now = Utc::now();
        for offset in [0, -1, -60, -120, -179, -180] {
            assert!(!is_truly_invalid(at(now, offset), now), "offset {offset}");
        }
    }

    #[test]
    fn past_grace_period_is_truly_invalid() {
        let now = Utc::now();
        for offset in [-181, -240, -300, -86_400] {
            assert!(is_truly_invalid(at(now, offset), now), "offset {offset}");
        }
    }

    #[test]
    fn missing_expiry_is_invalid_everywhere() {
        let now = Utc::now();
        assert!(is_expired(None, now));
        assert!(needs_refresh(None, now));
        assert!(is_truly_invalid(None, now));
    }

    #[test]
    fn expired_two_minutes_ago_is_in_grace() {
        let now = Utc::now();
        let expires = at(now, -120);
        assert!(is_expired(expires, now));
        assert!(needs_refresh(expires, now));
        assert!(!is_truly_invalid(expires, now));
    }

    #[test]
    fn offset_shifts_expiry() {
        let now = Utc::now();
        let expires = at(now, 300);
        assert!(!is_expired_with_offset(expires, now, 0));
        assert!(!is_expired_with_offset(expires, now, 180));
        assert!(is_expired_with_offset(expires, now, 600));
    }

    #[test]
    fn expires_in_text_buckets() {
        let now = Utc::now();
        assert_eq!(expires_in_text(None, now), "?");
        assert_eq!(expires_in_text(at(now, -5), now), "Exp");
        assert_eq!(expires_in_text(at(now, 42 * 60 + 5), now), "42m");
        assert_eq!(expires_in_text(at(now, 5 * 3600 + 5), now), "5h");
        assert_eq!(expires_in_text(at(now, 3 * 86_400 + 5), now), "3d");
    }
}
