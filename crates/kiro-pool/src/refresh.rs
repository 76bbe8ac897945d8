//! Proactive background token refresh
//!
//! Spawns a periodic task that reloads the store and refreshes tokens
//! approaching expiration, so most switches find a token that is already
//! valid. The task runs independently of collaborator requests.
//!
//! An account whose refresh token the provider rejected outright
//! (`InvalidGrant`, `ExpiredToken`) is not retried until its file changes.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use kiro_auth::ban::verdict_for_failure;
use kiro_auth::{HealthVerdict, RefreshOutcome};
use tracing::{debug, info, warn};

use crate::service::AccountService;

/// Spawn a background task that proactively refreshes expiring tokens.
///
/// Runs every `interval` and refreshes any refreshable, non-banned account
/// whose token expires within `threshold`. Failures are recorded by the
/// service (bans land in the usage cache) and retried next cycle, except
/// for rejected refresh tokens.
///
/// Returns a `JoinHandle` for the spawned task.
pub fn spawn_refresh_task(
    service: Arc<AccountService>,
    interval: Duration,
    threshold: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        // Skip the immediate first tick, accounts were just loaded
        ticker.tick().await;

        let mut dead = DeadTokens::default();
        loop {
            ticker.tick().await;
            refresh_cycle(&service, threshold, &mut dead).await;
        }
    })
}

/// Accounts with a rejected refresh token, keyed by id, with the expiry
/// their file had at the time. A different expiry means the file was
/// re-imported or refreshed by hand.
#[derive(Debug, Default)]
pub(crate) struct DeadTokens(HashMap<String, Option<DateTime<Utc>>>);

impl DeadTokens {
    fn skips(&self, id: &str, expires_at: Option<DateTime<Utc>>) -> bool {
        self.0.get(id) == Some(&expires_at)
    }
}

/// Run one refresh cycle. Returns how many accounts were refreshed.
pub(crate) async fn refresh_cycle(
    service: &AccountService,
    threshold: Duration,
    dead: &mut DeadTokens,
) -> usize {
    let views = match service.load_all().await {
        Ok(views) => views,
        Err(e) => {
            warn!(error = %e, "background refresh could not load accounts");
            return 0;
        }
    };

    dead.0.retain(|id, _| views.iter().any(|v| &v.id == id));

    let threshold =
        chrono::Duration::from_std(threshold).unwrap_or_else(|_| chrono::Duration::weeks(52));
    let deadline = Utc::now().checked_add_signed(threshold);
    let due: Vec<(String, Option<DateTime<Utc>>)> = views
        .iter()
        .filter(|v| v.is_refreshable && !v.is_banned())
        .filter(|v| !dead.skips(&v.id, v.expires_at))
        .filter(|v| match (v.expires_at, deadline) {
            (Some(expires_at), Some(deadline)) => expires_at <= deadline,
            (Some(_), None) => true,
            (None, _) => false,
        })
        .map(|v| (v.id.clone(), v.expires_at))
        .collect();

    if due.is_empty() {
        debug!(accounts = views.len(), "no tokens due for refresh");
        return 0;
    }

    let mut refreshed = 0;
    for (id, expires_at) in due {
        debug!(account_id = %id, "token expiring within threshold, refreshing");
        match service.refresh_token(&id).await {
            Ok(RefreshOutcome::Success(_)) => {
                dead.0.remove(&id);
                refreshed += 1;
                info!(account_id = %id, "background token refresh succeeded");
            }
            Ok(RefreshOutcome::Failure(failure))
                if verdict_for_failure(&failure) == HealthVerdict::Expired =>
            {
                warn!(
                    account_id = %id,
                    kind = %failure.kind,
                    "refresh token rejected, skipping until the account file changes"
                );
                dead.0.insert(id, expires_at);
            }
            Ok(RefreshOutcome::Failure(failure)) => {
                warn!(
                    account_id = %id,
                    kind = %failure.kind,
                    banned = failure.is_banned,
                    "background refresh failed, will retry next cycle"
                );
            }
            Err(e) => {
                warn!(account_id = %id, error = %e, "background refresh errored");
            }
        }
    }
    refreshed
}
