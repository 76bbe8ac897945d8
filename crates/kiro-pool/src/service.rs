//! Account service
//!
//! Owns the in-memory account list and the active pointer, and is the only
//! writer of credential files after load. Every state-changing operation
//! follows the same shape:
//! 1. resolve the key (id, label, email or id stem) to a canonical id
//! 2. take that account's flow lock
//! 3. re-read the record from disk
//! 4. do the work (refresh, probe, install, delete)
//! 5. `load_all()` so readers see the write before the change notification
//!
//! Operations on different accounts interleave freely. Change
//! notifications go out over a broadcast channel, never by callback, and a
//! load that changes nothing emits nothing, so a subscriber that reloads on
//! every notification settles after one extra pass.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use kiro_auth::{
    BanClassifier, CredentialRecord, CredentialStore, HealthVerdict, RefreshFailure,
    RefreshOutcome, StoredCredential,
};
use metrics::{counter, gauge};
use tokio::sync::{Mutex, OwnedMutexGuard, RwLock, broadcast};
use tracing::{debug, info, warn};

use crate::aliases::AccountKeys;
use crate::error::{Error, Result};
use crate::lifecycle::{AccountPhase, PhaseEvent, transition};
use crate::outcome::{BatchSummary, FailureKind, HealthReport, SwitchResult};
use crate::usage_cache::UsageCache;
use crate::usage_stats::UsageStats;
use crate::view::{AccountView, build_views};

/// Pause between accounts in batch operations
pub const DEFAULT_BATCH_DELAY: Duration = Duration::from_millis(300);

const EVENT_CAPACITY: usize = 64;

#[derive(Debug, Clone)]
pub struct AccountServiceOptions {
    pub batch_delay: Duration,
}

impl Default for AccountServiceOptions {
    fn default() -> Self {
        Self {
            batch_delay: DEFAULT_BATCH_DELAY,
        }
    }
}

/// Change notification: the account list after a load that changed it.
#[derive(Debug, Clone)]
pub struct AccountsChanged {
    pub generation: u64,
    pub accounts: Arc<Vec<AccountView>>,
}

/// Handle returned by [`AccountService::subscribe`]. Dropping it (or
/// calling `unsubscribe`) ends the subscription.
pub struct AccountsSubscription {
    rx: broadcast::Receiver<AccountsChanged>,
}

impl AccountsSubscription {
    /// Next notification. A slow subscriber skips ahead to the newest;
    /// `None` once the service is gone.
    pub async fn recv(&mut self) -> Option<AccountsChanged> {
        loop {
            match self.rx.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    debug!(skipped, "subscriber lagged, skipping to latest");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    pub fn unsubscribe(self) {}
}

#[derive(Default)]
struct PoolState {
    records: HashMap<String, CredentialRecord>,
    views: Arc<Vec<AccountView>>,
    generation: u64,
}

pub struct AccountService {
    store: CredentialStore,
    classifier: BanClassifier,
    usage: UsageCache,
    stats: UsageStats,
    state: RwLock<PoolState>,
    phases: RwLock<HashMap<String, AccountPhase>>,
    flow_locks: std::sync::Mutex<HashMap<String, Arc<Mutex<()>>>>,
    load_lock: Mutex<()>,
    events: broadcast::Sender<AccountsChanged>,
    options: AccountServiceOptions,
}

impl AccountService {
    pub fn new(
        store: CredentialStore,
        classifier: BanClassifier,
        usage: UsageCache,
        stats: UsageStats,
        options: AccountServiceOptions,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            store,
            classifier,
            usage,
            stats,
            state: RwLock::new(PoolState::default()),
            phases: RwLock::new(HashMap::new()),
            flow_locks: std::sync::Mutex::new(HashMap::new()),
            load_lock: Mutex::new(()),
            events,
            options,
        }
    }

    pub fn store(&self) -> &CredentialStore {
        &self.store
    }

    pub fn usage_cache(&self) -> &UsageCache {
        &self.usage
    }

    pub fn subscribe(&self) -> AccountsSubscription {
        AccountsSubscription {
            rx: self.events.subscribe(),
        }
    }

    /// Re-read the store, cache and stats, rebuild views, and notify
    /// subscribers when the list changed. Concurrent calls are serialized.
    pub async fn load_all(&self) -> Result<Arc<Vec<AccountView>>> {
        let _loading = self.load_lock.lock().await;

        let stored = self.store.list_all().await?;
        let current = self.store.read_current().await;
        let usage = self.usage.get_all().await;
        let stats = self.stats.get_all().await;
        let views = build_views(&stored, current.as_ref(), &usage, &stats, Utc::now());

        self.sync_phases(&stored).await;

        let (views, notification) = {
            let mut state = self.state.write().await;
            state.records = stored
                .into_iter()
                .map(|s| (s.record.id.clone(), s.record))
                .collect();

            if state.generation > 0 && *state.views == views {
                (state.views.clone(), None)
            } else {
                state.generation += 1;
                state.views = Arc::new(views);
                let event = AccountsChanged {
                    generation: state.generation,
                    accounts: state.views.clone(),
                };
                (state.views.clone(), Some(event))
            }
        };

        gauge!("accounts_loaded").set(views.len() as f64);
        if let Some(event) = notification {
            debug!(generation = event.generation, accounts = views.len(), "accounts changed");
            // Err only means nobody is subscribed
            let _ = self.events.send(event);
        }
        Ok(views)
    }

    async fn sync_phases(&self, stored: &[StoredCredential]) {
        let mut phases = self.phases.write().await;
        phases.retain(|id, _| stored.iter().any(|s| &s.record.id == id));
        for s in stored {
            let phase = phases
                .entry(s.record.id.clone())
                .or_insert(AccountPhase::Unloaded);
            *phase = transition(*phase, PhaseEvent::Load);
        }
    }

    /// Current views, sorted active-first then newest-first.
    pub async fn accounts(&self) -> Arc<Vec<AccountView>> {
        self.state.read().await.views.clone()
    }

    pub async fn account(&self, key: &str) -> Option<AccountView> {
        let id = self.resolve(key).await?;
        self.accounts().await.iter().find(|v| v.id == id).cloned()
    }

    pub async fn active_account(&self) -> Option<AccountView> {
        self.accounts().await.iter().find(|v| v.is_active).cloned()
    }

    pub async fn phase(&self, key: &str) -> Option<AccountPhase> {
        let id = self.resolve(key).await?;
        self.phases.read().await.get(&id).copied()
    }

    /// Canonical id for an id, label, email or id without `.json`. Exact
    /// ids win; aliases are tried in display order.
    pub async fn resolve(&self, key: &str) -> Option<String> {
        let state = self.state.read().await;
        if state.records.contains_key(key) {
            return Some(key.to_string());
        }
        state
            .views
            .iter()
            .filter_map(|v| state.records.get(&v.id))
            .find(|r| AccountKeys::from_record(r).matches(key))
            .map(|r| r.id.clone())
    }

    async fn require(&self, key: &str) -> Result<String> {
        self.resolve(key)
            .await
            .ok_or_else(|| Error::NotFound(key.to_string()))
    }

    async fn fetch_record(&self, id: &str) -> Result<CredentialRecord> {
        self.store
            .get(id)
            .await?
            .map(|s| s.record)
            .ok_or_else(|| Error::NotFound(id.to_string()))
    }

    async fn lock_account(&self, id: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.flow_locks.lock().unwrap_or_else(PoisonError::into_inner);
            locks.entry(id.to_string()).or_default().clone()
        };
        lock.lock_owned().await
    }

    async fn set_phase(&self, id: &str, event: PhaseEvent) {
        let mut phases = self.phases.write().await;
        let phase = phases.entry(id.to_string()).or_insert(AccountPhase::Loaded);
        *phase = transition(*phase, event);
    }

    /// Refresh `record` in place and persist it on success. A ban-classified
    /// failure is recorded in the usage cache.
    async fn refresh_record(
        &self,
        record: &mut CredentialRecord,
        now: DateTime<Utc>,
    ) -> Result<RefreshOutcome> {
        let outcome = match (
            record.refresh_token.as_ref(),
            record.client_id.as_deref(),
            record.client_secret.as_ref(),
        ) {
            (Some(refresh), Some(client_id), Some(secret)) if record.is_refreshable() => {
                self.classifier
                    .refresh_client()
                    .refresh(refresh.expose(), client_id, secret.expose(), record.region())
                    .await
            }
            _ => RefreshOutcome::Failure(RefreshFailure::credential_incomplete()),
        };

        match &outcome {
            RefreshOutcome::Success(token) => {
                let previous_refresh = record.refresh_token.clone();
                record.apply_refresh(token, now);
                self.store.write(record).await?;
                self.reinstall_if_active(previous_refresh.as_ref(), record)
                    .await?;
                counter!("account_refresh_total", "outcome" => "success").increment(1);
                info!(account_id = %record.id, "token refreshed");
            }
            RefreshOutcome::Failure(failure) => {
                counter!("account_refresh_total", "outcome" => failure.kind.as_str())
                    .increment(1);
                if failure.is_banned {
                    self.usage.mark_banned(&record.id, &failure.message).await?;
                }
                warn!(
                    account_id = %record.id,
                    kind = %failure.kind,
                    message = %failure.message,
                    banned = failure.is_banned,
                    "token refresh failed"
                );
            }
        }
        Ok(outcome)
    }

    /// The installed token is matched by refresh token. When a refresh
    /// rotates the refresh token of the active account, reinstall it so the
    /// account stays active.
    async fn reinstall_if_active(
        &self,
        previous_refresh: Option<&common::Secret<String>>,
        record: &CredentialRecord,
    ) -> Result<()> {
        let Some(previous) = previous_refresh else {
            return Ok(());
        };
        if record.refresh_token.as_ref() == Some(previous) {
            return Ok(());
        }
        let installed = self.store.read_current().await;
        if installed.and_then(|t| t.refresh_token).as_ref() == Some(previous) {
            debug!(account_id = %record.id, "refresh token rotated on active account, reinstalling");
            self.store.install_current(record).await?;
        }
        Ok(())
    }

    /// Make `key` the active account.
    ///
    /// A token inside the refresh-ahead window is refreshed first. If that
    /// fails but the token is still inside the grace window, the switch goes
    /// ahead with the old token. A ban is still recorded in the usage cache.
    pub async fn switch_to(&self, key: &str) -> Result<SwitchResult> {
        let id = self.require(key).await?;
        let _flow = self.lock_account(&id).await;
        let mut record = self.fetch_record(&id).await?;
        let now = Utc::now();
        let mut used_grace_period = false;

        if record.needs_refresh(now) {
            self.set_phase(&id, PhaseEvent::RefreshStarted).await;
            match self.refresh_record(&mut record, now).await? {
                RefreshOutcome::Success(_) => {
                    self.set_phase(&id, PhaseEvent::RefreshSucceeded).await;
                }
                RefreshOutcome::Failure(failure) => {
                    let within_grace = !record.is_truly_invalid(now);
                    self.set_phase(&id, PhaseEvent::RefreshFailed { within_grace })
                        .await;
                    if !within_grace {
                        let kind = FailureKind::classify(
                            &failure,
                            record.is_refreshable(),
                            record.expires_at,
                            now,
                        );
                        warn!(account_id = %id, ?kind, "switch aborted");
                        counter!("account_switch_total", "outcome" => "failed").increment(1);
                        self.load_all().await?;
                        return Ok(SwitchResult::failed(&id, &failure, kind));
                    }
                    warn!(
                        account_id = %id,
                        kind = %failure.kind,
                        "refresh failed, switching with token inside grace period"
                    );
                    used_grace_period = true;
                }
            }
        }

        let keys = AccountKeys::from_record(&record);
        if let Some(previous) = self.active_account().await.filter(|a| a.id != id) {
            self.usage.invalidate(&previous.keys()).await?;
        }
        self.usage.invalidate(&keys).await?;
        self.store.install_current(&record).await?;
        if let Err(e) = self.stats.increment(&keys).await {
            warn!(account_id = %id, error = %e, "failed to record switch in usage stats");
        }

        counter!("account_switch_total", "outcome" => "success").increment(1);
        info!(account_id = %id, used_grace_period, "switched active account");
        self.load_all().await?;
        Ok(SwitchResult::switched(&id, used_grace_period))
    }

    /// Refresh one account's token and persist it.
    pub async fn refresh_token(&self, key: &str) -> Result<RefreshOutcome> {
        let id = self.require(key).await?;
        let _flow = self.lock_account(&id).await;
        let mut record = self.fetch_record(&id).await?;
        let now = Utc::now();

        self.set_phase(&id, PhaseEvent::RefreshStarted).await;
        let outcome = self.refresh_record(&mut record, now).await?;
        let event = match &outcome {
            RefreshOutcome::Success(_) => PhaseEvent::RefreshSucceeded,
            RefreshOutcome::Failure(_) => PhaseEvent::RefreshFailed {
                within_grace: !record.is_truly_invalid(now),
            },
        };
        self.set_phase(&id, event).await;

        self.load_all().await?;
        Ok(outcome)
    }

    /// Remove the account file plus every cache and stats entry under the
    /// account's id, label and email.
    pub async fn delete_account(&self, key: &str) -> Result<()> {
        let id = self.require(key).await?;
        let _flow = self.lock_account(&id).await;

        let record = self.state.read().await.records.get(&id).cloned();
        let keys = match record {
            Some(r) => AccountKeys::from_record(&r),
            None => AccountKeys {
                id: id.clone(),
                label: None,
                email: None,
            },
        };

        self.store.delete(&id).await?;
        self.usage.remove(&keys).await?;
        self.stats.remove(&keys).await?;
        self.set_phase(&id, PhaseEvent::Unload).await;
        info!(account_id = %id, "account deleted");

        self.load_all().await?;
        self.flow_locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id);
        Ok(())
    }

    /// Refresh + probe; persists the new token, fresh usage, or the ban.
    pub async fn check_health(&self, key: &str) -> Result<HealthReport> {
        let id = self.require(key).await?;
        let _flow = self.lock_account(&id).await;
        let mut record = self.fetch_record(&id).await?;
        let now = Utc::now();

        self.set_phase(&id, PhaseEvent::RefreshStarted).await;
        let check = self.classifier.check_ban_status(&record, now).await;

        if let Some(token) = &check.refreshed {
            let previous_refresh = record.refresh_token.clone();
            record.apply_refresh(token, now);
            self.store.write(&record).await?;
            self.reinstall_if_active(previous_refresh.as_ref(), &record)
                .await?;
        }

        let keys = AccountKeys::from_record(&record);
        match check.verdict {
            HealthVerdict::Healthy => {
                self.usage.record_healthy(&keys, check.usage.clone()).await?;
            }
            HealthVerdict::Banned => {
                let reason = check
                    .usage
                    .as_ref()
                    .and_then(|u| u.ban_reason.clone())
                    .or_else(|| check.message.clone())
                    .unwrap_or_else(|| "banned".into());
                self.usage.mark_banned(&id, &reason).await?;
            }
            HealthVerdict::Expired
            | HealthVerdict::Transient
            | HealthVerdict::CredentialIncomplete => {}
        }

        let event = match check.verdict {
            HealthVerdict::Healthy => PhaseEvent::RefreshSucceeded,
            HealthVerdict::Banned | HealthVerdict::CredentialIncomplete => {
                PhaseEvent::RefreshFailed {
                    within_grace: false,
                }
            }
            HealthVerdict::Expired | HealthVerdict::Transient => PhaseEvent::RefreshFailed {
                within_grace: !record.is_truly_invalid(now),
            },
        };
        self.set_phase(&id, event).await;

        counter!("account_health_check_total", "verdict" => check.verdict.as_str()).increment(1);
        debug!(account_id = %id, verdict = check.verdict.as_str(), "health check complete");

        self.load_all().await?;
        Ok(HealthReport::from_check(&id, &check))
    }

    /// Record a ban reported from outside (e.g. a failed API call).
    pub async fn mark_banned(&self, key: &str, reason: &str) -> Result<()> {
        let id = self.require(key).await?;
        self.usage.mark_banned(&id, reason).await?;
        self.load_all().await?;
        Ok(())
    }

    /// Copy an external credential file into the store.
    pub async fn import(&self, path: &Path) -> Result<String> {
        let id = self.store.import(path).await?;
        self.load_all().await?;
        Ok(id)
    }

    /// Refresh each account in turn. One account's failure never stops the
    /// batch.
    pub async fn refresh_many(&self, keys: &[String]) -> BatchSummary {
        let mut summary = BatchSummary::default();
        let mut first = true;
        for key in keys {
            let Some(view) = self.account(key).await else {
                warn!(account = %key, "batch refresh: unknown account");
                summary.record_error();
                continue;
            };
            if !view.is_refreshable {
                summary.record(HealthVerdict::CredentialIncomplete);
                continue;
            }
            if !first {
                tokio::time::sleep(self.options.batch_delay).await;
            }
            first = false;

            match self.refresh_token(&view.id).await {
                Ok(RefreshOutcome::Success(_)) => summary.record(HealthVerdict::Healthy),
                Ok(RefreshOutcome::Failure(failure)) => {
                    summary.record(kiro_auth::ban::verdict_for_failure(&failure));
                }
                Err(e) => {
                    warn!(account_id = %view.id, error = %e, "batch refresh failed");
                    summary.record_error();
                }
            }
        }
        info!(?summary, "batch refresh finished");
        summary
    }

    /// Refresh every expired account that is not banned, suspended or
    /// exhausted.
    pub async fn refresh_expired(&self) -> BatchSummary {
        let ids: Vec<String> = self
            .accounts()
            .await
            .iter()
            .filter(|v| v.is_expired && !v.is_banned() && !v.is_suspended() && !v.is_exhausted())
            .map(|v| v.id.clone())
            .collect();
        self.refresh_many(&ids).await
    }

    /// Health-check every account that is not already banned or exhausted.
    pub async fn check_all_health(&self) -> BatchSummary {
        let ids: Vec<String> = self
            .accounts()
            .await
            .iter()
            .filter(|v| !v.is_banned() && !v.is_exhausted())
            .map(|v| v.id.clone())
            .collect();

        let mut summary = BatchSummary::default();
        for (i, id) in ids.iter().enumerate() {
            if i > 0 {
                tokio::time::sleep(self.options.batch_delay).await;
            }
            match self.check_health(id).await {
                Ok(report) => summary.record(report.verdict),
                Err(e) => {
                    warn!(account_id = %id, error = %e, "batch health check failed");
                    summary.record_error();
                }
            }
        }
        info!(?summary, "batch health check finished");
        summary
    }

    /// Delete every banned account. Returns how many were removed.
    pub async fn delete_banned(&self) -> usize {
        let ids: Vec<String> = self
            .accounts()
            .await
            .iter()
            .filter(|v| v.is_banned())
            .map(|v| v.id.clone())
            .collect();
        self.delete_each(&ids).await
    }

    /// Delete every account whose quota is used up.
    pub async fn delete_exhausted(&self) -> usize {
        let ids: Vec<String> = self
            .accounts()
            .await
            .iter()
            .filter(|v| v.is_exhausted())
            .map(|v| v.id.clone())
            .collect();
        self.delete_each(&ids).await
    }

    async fn delete_each(&self, ids: &[String]) -> usize {
        let mut deleted = 0;
        for id in ids {
            match self.delete_account(id).await {
                Ok(()) => deleted += 1,
                Err(e) => warn!(account_id = %id, error = %e, "bulk delete skipped account"),
            }
        }
        deleted
    }
}
