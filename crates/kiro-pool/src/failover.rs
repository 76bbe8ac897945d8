//! Failover selection
//!
//! When the active account stops working, `FailoverSelector` walks the
//! account list in display order and switches to the first usable one.
//! Candidates whose switch fails with a ban, or that come out of the
//! switch flagged banned, are skipped within the same cycle; any other
//! failure ends the cycle. Accounts that failed stay
//! excluded until a failover succeeds or runs out of candidates.
//!
//! `spawn_auto_failover_task` triggers a failover on its own whenever the
//! active account is banned or its token is past the grace window.

use std::collections::HashSet;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use metrics::counter;
use serde::Serialize;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::outcome::SwitchResult;
use crate::service::AccountService;
use crate::view::AccountView;

pub const DEFAULT_DEBOUNCE: Duration = Duration::from_secs(5);

/// Read + switch surface the selector needs from the account service.
///
/// Uses `Pin<Box<dyn Future>>` return types for dyn-compatibility
/// (`&dyn FailoverTarget`).
pub trait FailoverTarget: Send + Sync {
    /// Accounts in display order (active first, then newest first).
    fn accounts(&self) -> Pin<Box<dyn Future<Output = Arc<Vec<AccountView>>> + Send + '_>>;

    fn switch_to<'a>(
        &'a self,
        id: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<SwitchResult>> + Send + 'a>>;
}

impl FailoverTarget for AccountService {
    fn accounts(&self) -> Pin<Box<dyn Future<Output = Arc<Vec<AccountView>>> + Send + '_>> {
        Box::pin(AccountService::accounts(self))
    }

    fn switch_to<'a>(
        &'a self,
        id: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<SwitchResult>> + Send + 'a>> {
        Box::pin(AccountService::switch_to(self, id))
    }
}

/// First usable account after `current_id`, in list order.
///
/// Never returns the current account, an excluded one, or one that is
/// expired, banned or missing refresh credentials.
pub fn pick_next(
    accounts: &[AccountView],
    current_id: Option<&str>,
    excluded: &HashSet<String>,
) -> Option<String> {
    accounts
        .iter()
        .filter(|a| Some(a.id.as_str()) != current_id)
        .filter(|a| !excluded.contains(&a.id))
        .find(|a| !a.is_expired && !a.is_banned() && a.is_refreshable)
        .map(|a| a.id.clone())
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum FailoverOutcome {
    #[serde(rename_all = "camelCase")]
    Switched {
        account_id: String,
        attempts: usize,
        used_grace_period: bool,
    },
    NoCandidates {
        attempts: usize,
    },
    /// Another failover ran within the debounce window
    Debounced,
    /// Candidate failed for a reason other than a ban
    #[serde(rename_all = "camelCase")]
    Failed {
        account_id: String,
        result: SwitchResult,
    },
}

impl FailoverOutcome {
    fn label(&self) -> &'static str {
        match self {
            Self::Switched { .. } => "switched",
            Self::NoCandidates { .. } => "no_candidates",
            Self::Debounced => "debounced",
            Self::Failed { .. } => "failed",
        }
    }
}

#[derive(Default)]
struct SelectorState {
    last_attempt: Option<Instant>,
    excluded: HashSet<String>,
}

pub struct FailoverSelector {
    debounce: Duration,
    state: Mutex<SelectorState>,
}

impl Default for FailoverSelector {
    fn default() -> Self {
        Self::new(DEFAULT_DEBOUNCE)
    }
}

impl FailoverSelector {
    pub fn new(debounce: Duration) -> Self {
        Self {
            debounce,
            state: Mutex::new(SelectorState::default()),
        }
    }

    fn state(&self) -> std::sync::MutexGuard<'_, SelectorState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Accounts that failed in the current failover session.
    pub fn excluded(&self) -> Vec<String> {
        let mut ids: Vec<_> = self.state().excluded.iter().cloned().collect();
        ids.sort();
        ids
    }

    /// Switch away from the active account.
    pub async fn failover(&self, target: &dyn FailoverTarget) -> FailoverOutcome {
        {
            let mut state = self.state();
            let now = Instant::now();
            if let Some(last) = state.last_attempt
                && now.duration_since(last) < self.debounce
            {
                debug!("failover requested inside debounce window, ignoring");
                counter!("account_failover_total", "outcome" => "debounced").increment(1);
                return FailoverOutcome::Debounced;
            }
            state.last_attempt = Some(now);
        }

        let outcome = self.run(target).await;
        counter!("account_failover_total", "outcome" => outcome.label()).increment(1);
        outcome
    }

    async fn run(&self, target: &dyn FailoverTarget) -> FailoverOutcome {
        let mut attempts = 0;
        loop {
            let accounts = target.accounts().await;
            let current = accounts.iter().find(|a| a.is_active).map(|a| a.id.as_str());
            let excluded = self.state().excluded.clone();

            let Some(candidate) = pick_next(&accounts, current, &excluded) else {
                warn!(attempts, excluded = excluded.len(), "failover found no usable account");
                self.state().excluded.clear();
                return FailoverOutcome::NoCandidates { attempts };
            };
            attempts += 1;

            let result = match target.switch_to(&candidate).await {
                Ok(result) => result,
                Err(e) => {
                    warn!(account_id = %candidate, error = %e, "failover candidate unavailable, trying next");
                    self.state().excluded.insert(candidate);
                    continue;
                }
            };

            // A switch inside the grace period goes ahead even when its
            // refresh was rejected as a ban; the reloaded view carries the flag.
            if result.success && is_banned_now(target, &candidate).await {
                warn!(account_id = %candidate, "failover candidate banned during switch, trying next");
                self.state().excluded.insert(candidate);
                continue;
            }

            if result.success {
                self.state().excluded.clear();
                info!(account_id = %candidate, attempts, "failover switched account");
                return FailoverOutcome::Switched {
                    account_id: candidate,
                    attempts,
                    used_grace_period: result.used_grace_period,
                };
            }

            self.state().excluded.insert(candidate.clone());
            if result.is_banned {
                warn!(account_id = %candidate, "failover candidate is banned, trying next");
                continue;
            }
            warn!(
                account_id = %candidate,
                error = result.error.as_deref().unwrap_or("unknown"),
                "failover candidate failed"
            );
            return FailoverOutcome::Failed {
                account_id: candidate,
                result,
            };
        }
    }
}

/// Spawn a background task that fails over away from a dead active account.
///
/// Every `interval` the store is reloaded; if the active account is banned
/// or truly invalid, `selector` picks a replacement. The selector's debounce
/// still applies, so this never races a manual `POST /failover`.
pub fn spawn_auto_failover_task(
    service: Arc<AccountService>,
    selector: Arc<FailoverSelector>,
    interval: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await;

        loop {
            ticker.tick().await;
            auto_failover_check(&service, &selector).await;
        }
    })
}

/// Run one check. Returns the failover outcome if one was attempted.
pub(crate) async fn auto_failover_check(
    service: &AccountService,
    selector: &FailoverSelector,
) -> Option<FailoverOutcome> {
    let views = match service.load_all().await {
        Ok(views) => views,
        Err(e) => {
            warn!(error = %e, "auto failover could not load accounts");
            return None;
        }
    };

    let active = views.iter().find(|a| a.is_active)?;
    if !active.is_banned() && !active.is_truly_invalid {
        return None;
    }

    info!(
        account_id = %active.id,
        banned = active.is_banned(),
        "active account unusable, failing over"
    );
    Some(selector.failover(service).await)
}

async fn is_banned_now(target: &dyn FailoverTarget, id: &str) -> bool {
    target
        .accounts()
        .await
        .iter()
        .any(|a| a.id == id && a.is_banned())
}
