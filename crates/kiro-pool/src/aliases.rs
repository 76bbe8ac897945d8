//! Account lookup keys
//!
//! One account is known by its file id, its label and its email. Older
//! cache and stats files were keyed by whichever was handy, so every
//! subsystem that keys by "account" goes through [`AccountKeys`].

use std::collections::HashMap;

use kiro_auth::{CredentialRecord, TOKEN_FILE_SUFFIX};

/// Canonical id plus the aliases it may appear under.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccountKeys {
    pub id: String,
    pub label: Option<String>,
    pub email: Option<String>,
}

impl AccountKeys {
    pub fn from_record(record: &CredentialRecord) -> Self {
        Self {
            id: record.id.clone(),
            label: record.account_label.clone().filter(|l| !l.is_empty()),
            email: record.email_alias(),
        }
    }

    /// Lookup order: id, label, email. Empty and duplicate keys dropped.
    pub fn candidates(&self) -> Vec<&str> {
        let mut keys: Vec<&str> = Vec::with_capacity(3);
        for key in [Some(self.id.as_str()), self.label.as_deref(), self.email.as_deref()]
            .into_iter()
            .flatten()
        {
            if !key.is_empty() && !keys.contains(&key) {
                keys.push(key);
            }
        }
        keys
    }

    /// Whether `key` names this account: exact id, id without `.json`,
    /// exact label or exact email.
    pub fn matches(&self, key: &str) -> bool {
        if key.is_empty() {
            return false;
        }
        key == self.id
            || self.id.strip_suffix(TOKEN_FILE_SUFFIX) == Some(key)
            || self.label.as_deref() == Some(key)
            || self.email.as_deref() == Some(key)
    }

    /// First entry in `map` under any of this account's keys.
    pub fn lookup<'m, V>(&self, map: &'m HashMap<String, V>) -> Option<&'m V> {
        self.candidates().into_iter().find_map(|k| map.get(k))
    }
}
