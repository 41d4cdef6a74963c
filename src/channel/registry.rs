// Presence Registry
//
// Reconciled roster of present users: one record per presence key, rebuilt
// in full from the authoritative presence table.

use crate::transport::PresenceTable;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Presence payload as published on the wire.
///
/// Older clients leave out the name or timestamp and send the team as `equipe`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresencePayload {
    #[serde(default)]
    pub online_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_name: Option<String>,
    #[serde(default, alias = "equipe")]
    pub team: Option<String>,
}

/// One announced participant
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresenceRecord {
    pub key: String,
    pub online_at: Option<DateTime<Utc>>,
    pub user_name: String,
    pub team: Option<String>,
}

impl PresenceRecord {
    fn from_payload(key: String, payload: PresencePayload, unknown_label: &str) -> Self {
        let user_name = payload
            .user_name
            .filter(|name| !name.trim().is_empty())
            .unwrap_or_else(|| unknown_label.to_string());
        Self {
            key,
            online_at: payload.online_at,
            user_name,
            team: payload.team,
        }
    }
}

/// Presence key -> first record tracked under it
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PresenceRegistry {
    records: HashMap<String, PresenceRecord>,
}

impl PresenceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from a presence table, keeping the first record of every key.
    ///
    /// Keys without records are skipped, and so are keys whose first record
    /// is malformed. Records without a name are listed as `unknown_label`.
    pub fn from_table(table: &PresenceTable, unknown_label: &str) -> Self {
        let mut records = HashMap::with_capacity(table.len());
        for (key, entries) in table {
            let Some(first) = entries.first() else {
                continue;
            };
            match serde_json::from_value::<PresencePayload>(first.clone()) {
                Ok(payload) => {
                    records.insert(
                        key.clone(),
                        PresenceRecord::from_payload(key.clone(), payload, unknown_label),
                    );
                }
                Err(e) => tracing::warn!("Skipping malformed presence record '{}': {}", key, e),
            }
        }
        Self { records }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.records.contains_key(key)
    }

    pub fn get(&self, key: &str) -> Option<&PresenceRecord> {
        self.records.get(key)
    }

    /// Records ordered by key
    pub fn snapshot(&self) -> Vec<PresenceRecord> {
        let mut records: Vec<PresenceRecord> = self.records.values().cloned().collect();
        records.sort_by(|a, b| a.key.cmp(&b.key));
        records
    }
}
