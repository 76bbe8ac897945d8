//! Local switch counters
//!
//! `usage-stats.json` maps account key to `{count, lastUsed, limit}`. The
//! count goes up on every successful switch. Existing entries may sit under
//! an alias key; increments land on whichever key already has an entry.

use std::collections::HashMap;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use kiro_auth::DEFAULT_USAGE_LIMIT;
use kiro_auth::persist::{read_json_optional, write_json_atomic};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::warn;

use crate::aliases::AccountKeys;
use crate::error::{Error, Result};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageStat {
    #[serde(default)]
    pub count: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_used: Option<DateTime<Utc>>,
    #[serde(default = "default_limit")]
    pub limit: i64,
}

fn default_limit() -> i64 {
    DEFAULT_USAGE_LIMIT
}

impl Default for UsageStat {
    fn default() -> Self {
        Self {
            count: 0,
            last_used: None,
            limit: DEFAULT_USAGE_LIMIT,
        }
    }
}

pub struct UsageStats {
    path: PathBuf,
    entries: RwLock<HashMap<String, UsageStat>>,
}

impl UsageStats {
    pub async fn load(path: PathBuf) -> Self {
        let entries = match read_json_optional::<HashMap<String, UsageStat>>(&path).await {
            Ok(entries) => entries.unwrap_or_default(),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "usage stats unreadable, starting empty");
                HashMap::new()
            }
        };
        Self {
            path,
            entries: RwLock::new(entries),
        }
    }

    pub async fn get_for(&self, keys: &AccountKeys) -> Option<UsageStat> {
        keys.lookup(&*self.entries.read().await).cloned()
    }

    pub async fn get_all(&self) -> HashMap<String, UsageStat> {
        self.entries.read().await.clone()
    }

    /// Bump the switch count and return the new value.
    pub async fn increment(&self, keys: &AccountKeys) -> Result<u64> {
        let mut entries = self.entries.write().await;
        let key = keys
            .candidates()
            .into_iter()
            .find(|k| entries.contains_key(*k))
            .unwrap_or(&keys.id)
            .to_string();
        let entry = entries.entry(key).or_default();
        entry.count += 1;
        entry.last_used = Some(Utc::now());
        let count = entry.count;
        self.persist(&entries).await?;
        Ok(count)
    }

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

    async fn persist(&self, entries: &HashMap<String, UsageStat>) -> Result<()> {
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
            email: None,
        }
    }

    #[tokio::test]
    async fn increment_creates_and_counts() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("usage-stats.json");
        let stats = UsageStats::load(path.clone()).await;

        assert_eq!(stats.increment(&keys()).await.unwrap(), 1);
        assert_eq!(stats.increment(&keys()).await.unwrap(), 2);

        let reloaded = UsageStats::load(path).await;
        let stat = reloaded.get_for(&keys()).await.unwrap();
        assert_eq!(stat.count, 2);
        assert_eq!(stat.limit, 500);
        assert!(stat.last_used.is_some());
    }

    #[tokio::test]
    async fn increment_uses_existing_alias_key() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("usage-stats.json");
        tokio::fs::write(&path, r#"{"alpha":{"count":7,"limit":1000}}"#)
            .await
            .unwrap();
        let stats = UsageStats::load(path).await;

        assert_eq!(stats.increment(&keys()).await.unwrap(), 8);
        let all = stats.get_all().await;
        assert_eq!(all.len(), 1);
        assert_eq!(all["alpha"].limit, 1000);
    }

    #[tokio::test]
    async fn remove_drops_all_aliases() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("usage-stats.json");
        tokio::fs::write(
            &path,
            r#"{"alpha":{"count":1},"token-a.json":{"count":2},"other":{"count":3}}"#,
        )
        .await
        .unwrap();
        let stats = UsageStats::load(path).await;

        assert_eq!(stats.remove(&keys()).await.unwrap(), 2);
        assert_eq!(stats.get_all().await.len(), 1);
    }
}
