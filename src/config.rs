use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Realtime channel configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RealtimeConfig {
    /// Topic every session announces its presence on
    #[serde(default = "default_presence_topic")]
    pub presence_topic: String,

    /// Change-notification topic for the supervisor message log
    #[serde(default = "default_notification_topic")]
    pub notification_topic: String,

    /// Table whose inserted rows are delivered on the notification topic
    #[serde(default = "default_notification_table")]
    pub notification_table: String,

    /// Delay before re-reading the presence table after a join, in milliseconds
    #[serde(default = "default_join_resync_delay_ms")]
    pub join_resync_delay_ms: u64,

    /// Presence key used when a session has neither seller name nor username
    #[serde(default = "default_unknown_user_label")]
    pub unknown_user_label: String,

    /// Team published for sessions that have none
    #[serde(default = "default_unassigned_team_label")]
    pub unassigned_team_label: String,
}

fn default_presence_topic() -> String {
    "online-users".to_string()
}

fn default_notification_topic() -> String {
    "public:chat_messages:app".to_string()
}

fn default_notification_table() -> String {
    "chat_messages".to_string()
}

fn default_join_resync_delay_ms() -> u64 {
    100
}

fn default_unknown_user_label() -> String {
    "unknown".to_string()
}

fn default_unassigned_team_label() -> String {
    "unassigned".to_string()
}

impl Default for RealtimeConfig {
    fn default() -> Self {
        Self {
            presence_topic: default_presence_topic(),
            notification_topic: default_notification_topic(),
            notification_table: default_notification_table(),
            join_resync_delay_ms: default_join_resync_delay_ms(),
            unknown_user_label: default_unknown_user_label(),
            unassigned_team_label: default_unassigned_team_label(),
        }
    }
}

impl RealtimeConfig {
    pub fn join_resync_delay(&self) -> Duration {
        Duration::from_millis(self.join_resync_delay_ms)
    }

    /// Load from an explicit path, or from the first default location that exists.
    ///
    /// Falls back to defaults when no path is given and no default file exists.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let config_path = match path {
            Some(p) => {
                if !p.exists() {
                    return Err(ConfigError::NotFound {
                        path: p.display().to_string(),
                    });
                }
                p.to_path_buf()
            }
            None => match Self::default_paths().into_iter().find(|p| p.exists()) {
                Some(p) => p,
                None => {
                    tracing::debug!("No realtime config file found, using defaults");
                    return Ok(Self::default());
                }
            },
        };

        let content = std::fs::read_to_string(&config_path)?;
        let config: RealtimeConfig = serde_yml::from_str(&content)?;
        config.validate()?;

        tracing::info!("Loaded realtime config from {:?}", config_path);
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let content = serde_yml::to_string(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Generate a sample configuration
    pub fn sample() -> Self {
        Self::default()
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let required = [
            ("presence_topic", &self.presence_topic),
            ("notification_topic", &self.notification_topic),
            ("notification_table", &self.notification_table),
            ("unknown_user_label", &self.unknown_user_label),
            ("unassigned_team_label", &self.unassigned_team_label),
        ];
        for (field, value) in required {
            if value.trim().is_empty() {
                return Err(ConfigError::Invalid {
                    field: field.to_string(),
                    reason: "cannot be empty".to_string(),
                });
            }
        }
        if self.presence_topic == self.notification_topic {
            return Err(ConfigError::Invalid {
                field: "notification_topic".to_string(),
                reason: "must differ from presence_topic".to_string(),
            });
        }
        Ok(())
    }

    fn default_paths() -> Vec<PathBuf> {
        vec![
            dirs::home_dir().map(|h| h.join(".salesdesk/realtime.yaml")),
            dirs::config_dir().map(|c| c.join("salesdesk/realtime.yaml")),
            Some(PathBuf::from("./salesdesk.yaml")),
        ]
        .into_iter()
        .flatten()
        .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults() {
        let config = RealtimeConfig::default();
        assert_eq!(config.presence_topic, "online-users");
        assert_eq!(config.notification_topic, "public:chat_messages:app");
        assert_eq!(config.notification_table, "chat_messages");
        assert_eq!(config.join_resync_delay(), Duration::from_millis(100));
        assert_eq!(config.unassigned_team_label, "unassigned");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_save_and_load_round_trip() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("realtime.yaml");

        let mut config = RealtimeConfig::sample();
        config.join_resync_delay_ms = 250;
        config.save(&path).expect("save");

        let loaded = RealtimeConfig::load(Some(&path)).expect("load");
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("realtime.yaml");
        std::fs::write(&path, "join_resync_delay_ms: 300\n").expect("write");

        let loaded = RealtimeConfig::load(Some(&path)).expect("load");
        assert_eq!(loaded.join_resync_delay_ms, 300);
        assert_eq!(loaded.presence_topic, "online-users");
    }

    #[test]
    fn test_missing_explicit_path_is_an_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("absent.yaml");
        let err = RealtimeConfig::load(Some(&path)).unwrap_err();
        assert!(matches!(err, ConfigError::NotFound { .. }));
    }

    #[test]
    fn test_validate_rejects_shared_topic() {
        let config = RealtimeConfig {
            notification_topic: "online-users".to_string(),
            ..RealtimeConfig::default()
        };
        let err = config.validate().unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { ref field, .. } if field == "notification_topic"));
    }

    #[test]
    fn test_validate_rejects_empty_table() {
        let config = RealtimeConfig {
            notification_table: "  ".to_string(),
            ..RealtimeConfig::default()
        };
        assert!(config.validate().is_err());
    }
}
