//! Per-account usage snapshot cache
//!
//! Backed by one JSON file mapping account key to [`UsageSnapshot`]. Every
//! mutation rewrites the file atomically while holding the write lock, so
//! file writes land in mutation order.
//!
//! Ban flags are sticky. `put` and `invalidate` never clear `isBanned`,
//! `suspended` or `banReason`; only `record_healthy` (an explicit
//! successful health re-check) does.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use chrono::Utc;
use kiro_auth::UsageSnapshot;
use kiro_auth::persist::{read_json_optional, write_json_atomic};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::aliases::AccountKeys;
use crate::error::{Error, Result};

pub struct UsageCache {
    path: PathBuf,
    entries: RwLock<HashMap<String, UsageSnapshot>>,
}

impl UsageCache {
    /// Load the cache file. Missing or corrupt files start an empty cache.
    pub async fn load(path: PathBuf) -> Self {
        let entries = match read_json_optional::<HashMap<String, UsageSnapshot>>(&path).await {
            Ok(Some(entries)) => entries,
            Ok(None) => HashMap::new(),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "usage cache unreadable, starting empty");
                HashMap::new()
            }
        };
        debug!(entries = entries.len(), "usage cache loaded");
        Self {
            path,
            entries: RwLock::new(entries),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn get(&self, key: &str) -> Option<UsageSnapshot> {
        self.entries.read().await.get(key).cloned()
    }

    /// First entry found under any of the account's keys.
    pub async fn get_for(&self, keys: &AccountKeys) -> Option<UsageSnapshot> {
        keys.lookup(&*self.entries.read().await).cloned()
    }

    pub async fn get_all(&self) -> HashMap<String, UsageSnapshot> {
        self.entries.read().await.clone()
    }

    /// Store a fresh snapshot. A ban already recorded under `key` survives.
    pub async fn put(&self, key: &str, mut snapshot: UsageSnapshot) -> Result<()> {
        let mut entries = self.entries.write().await;
        if let Some(existing) = entries.get(key)
            && existing.is_banned
            && !snapshot.is_banned
        {
            snapshot.is_banned = true;
            snapshot.suspended = existing.suspended;
            snapshot.ban_reason = existing.ban_reason.clone();
        }
        entries.insert(key.to_string(), snapshot);
        self.persist(&entries).await
    }

    /// Mark every entry under the account's keys stale. Flags are kept.
    pub async fn invalidate(&self, keys: &AccountKeys) -> Result<()> {
        let mut entries = self.entries.write().await;
        let mut touched = false;
        for key in keys.candidates() {
            if let Some(entry) = entries.get_mut(key) {
                entry.stale = true;
                touched = true;
            }
        }
        if touched {
            self.persist(&entries).await?;
        }
        Ok(())
    }

    /// Record a ban under `key`, keeping whatever usage figures exist.
    pub async fn mark_banned(&self, key: &str, reason: &str) -> Result<()> {
        let mut entries = self.entries.write().await;
        let entry = entries
            .entry(key.to_string())
            .or_insert_with(UsageSnapshot::default);
        entry.is_banned = true;
        entry.suspended = true;
        entry.ban_reason = Some(reason.to_string());
        entry.updated_at = Some(Utc::now());
        warn!(account_id = %key, reason, "account marked banned");
        self.persist(&entries).await
    }

    /// Apply a successful health re-check: clears any ban recorded under
    /// the account's keys and stores `snapshot` under the canonical id.
    pub async fn record_healthy(
        &self,
        keys: &AccountKeys,
        snapshot: Option<UsageSnapshot>,
    ) -> Result<()> {
        let mut entries = self.entries.write().await;
        let mut cleared = false;
        for key in keys.candidates() {
            if let Some(entry) = entries.get_mut(key)
                && (entry.is_banned || entry.suspended)
            {
                entry.is_banned = false;
                entry.suspended = false;
                entry.ban_reason = None;
                cleared = true;
            }
        }
        if cleared {
            info!(account_id = %keys.id, "health re-check cleared ban");
        }
        if let Some(snapshot) = snapshot {
            entries.insert(keys.id.clone(), snapshot);
        } else if !cleared {
            return Ok(());
        }
        self.persist(&entries).await
    }

    /// Drop every entry under the account's keys.
    pub async fn remove(&self, keys: &AccountKeys) -> Result<usize> {
        let mut entries = self.entries.write().await;
        let removed = keys
            .candidates()
            .into_iter()
            .filter(|k| entries.remove(*k).is_some())
            .count();
        if removed > 0 {
            self.persist(&entries).await?;
        }
        Ok(removed)
    }

    async fn persist(&self, entries: &HashMap<String, UsageSnapshot>) -> Result<()> {
        write_json_atomic(&self.path, entries)
            .await
            .map_err(|e| Error::Cache(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keys() -> AccountKeys {
        AccountKeys {
            id: "token-a.json".into(),
            label: Some("alpha".into()),
            email: Some("a@example.com".into()),
        }
    }

    fn snapshot(current: i64) -> UsageSnapshot {
        UsageSnapshot {
            current_usage: current,
            usage_limit: 500,
            percentage_used: current * 100 / 500,
            days_remaining: 12,
            ..UsageSnapshot::default()
        }
    }

    async fn cache(dir: &tempfile::TempDir) -> UsageCache {
        UsageCache::load(dir.path().join("account-usage.json")).await
    }

    #[tokio::test]
    async fn put_and_get_persist_across_reload() {
        let dir = tempfile::tempdir().unwrap();
        let c = cache(&dir).await;
        c.put("token-a.json", snapshot(100)).await.unwrap();

        let reloaded = cache(&dir).await;
        assert_eq!(reloaded.get("token-a.json").await, Some(snapshot(100)));
    }

    #[tokio::test]
    async fn invalidate_keeps_ban_flags() {
        let dir = tempfile::tempdir().unwrap();
        let c = cache(&dir).await;
        c.put("token-a.json", snapshot(100)).await.unwrap();
        c.mark_banned("token-a.json", "TEMPORARILY_SUSPENDED")
            .await
            .unwrap();

        c.invalidate(&keys()).await.unwrap();
        c.invalidate(&keys()).await.unwrap();

        let entry = c.get("token-a.json").await.unwrap();
        assert!(entry.stale);
        assert!(entry.is_banned);
        assert!(entry.suspended);
        assert_eq!(entry.ban_reason.as_deref(), Some("TEMPORARILY_SUSPENDED"));
    }

    #[tokio::test]
    async fn put_does_not_clear_ban() {
        let dir = tempfile::tempdir().unwrap();
        let c = cache(&dir).await;
        c.mark_banned("token-a.json", "suspended").await.unwrap();
        c.put("token-a.json", snapshot(10)).await.unwrap();

        let entry = c.get("token-a.json").await.unwrap();
        assert!(entry.is_banned);
        assert_eq!(entry.current_usage, 10);
    }

    #[tokio::test]
    async fn healthy_recheck_clears_ban_under_aliases() {
        let dir = tempfile::tempdir().unwrap();
        let c = cache(&dir).await;
        c.mark_banned("alpha", "old ban").await.unwrap();

        c.record_healthy(&keys(), Some(snapshot(5))).await.unwrap();

        assert!(!c.get("alpha").await.unwrap().is_banned);
        let fresh = c.get("token-a.json").await.unwrap();
        assert!(!fresh.is_banned);
        assert_eq!(fresh.current_usage, 5);
    }

    #[tokio::test]
    async fn get_for_falls_back_to_aliases() {
        let dir = tempfile::tempdir().unwrap();
        let c = cache(&dir).await;
        c.put("a@example.com", snapshot(42)).await.unwrap();
        assert_eq!(c.get_for(&keys()).await.unwrap().current_usage, 42);
    }

    #[tokio::test]
    async fn remove_clears_every_key() {
        let dir = tempfile::tempdir().unwrap();
        let c = cache(&dir).await;
        for key in ["token-a.json", "alpha", "a@example.com", "token-b.json"] {
            c.put(key, snapshot(1)).await.unwrap();
        }

        assert_eq!(c.remove(&keys()).await.unwrap(), 3);
        let all = c.get_all().await;
        assert_eq!(all.len(), 1);
        assert!(all.contains_key("token-b.json"));
    }

    #[tokio::test]
    async fn corrupt_file_starts_empty() {
        let dir = tempfile::tempdir().unwrap();
        tokio::fs::write(dir.path().join("account-usage.json"), "[[[")
            .await
            .unwrap();
        assert!(cache(&dir).await.get_all().await.is_empty());
    }
}
