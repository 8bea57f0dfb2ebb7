//! brgy-health configuration system.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{BrgyError, Result};

/// Longest accepted job or loop interval: one year.
pub const MAX_INTERVAL_SECS: u64 = 366 * 24 * 60 * 60;

/// Root configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrgyConfig {
    #[serde(default = "default_database_path")]
    pub database_path: String,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub followups: FollowUpConfig,
    #[serde(default)]
    pub notifications: NotificationConfig,
}

fn default_database_path() -> String { "~/.brgy/health.db".into() }

impl Default for BrgyConfig {
    fn default() -> Self {
        Self {
            database_path: default_database_path(),
            scheduler: SchedulerConfig::default(),
            followups: FollowUpConfig::default(),
            notifications: NotificationConfig::default(),
        }
    }
}

impl BrgyConfig {
    /// Load config from the default path (~/.brgy/config.toml).
    pub fn load() -> Result<Self> {
        let path = Self::default_path();
        if path.exists() {
            Self::load_from(&path)
        } else {
            Ok(Self::default())
        }
    }

    /// Load config from a specific path.
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| BrgyError::Config(format!("Failed to read config: {e}")))?;
        let config: Self = toml::from_str(&content)
            .map_err(|e| BrgyError::Config(format!("Failed to parse config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Save config to the given path, creating parent directories.
    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)
            .map_err(|e| BrgyError::Config(format!("Failed to serialize config: {e}")))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Reject values the scheduler and reconciler cannot work with.
    pub fn validate(&self) -> Result<()> {
        if !(1..=MAX_INTERVAL_SECS).contains(&self.scheduler.check_interval_secs) {
            return Err(BrgyError::Config(format!(
                "scheduler.check_interval_secs must be between 1 and {MAX_INTERVAL_SECS}"
            )));
        }
        if self.scheduler.utc_offset_minutes.abs() >= 24 * 60 {
            return Err(BrgyError::Config(format!(
                "scheduler.utc_offset_minutes out of range: {}",
                self.scheduler.utc_offset_minutes
            )));
        }
        if self.notifications.enabled
            && !(1..=MAX_INTERVAL_SECS).contains(&self.notifications.dispatch_interval_secs)
        {
            return Err(BrgyError::Config(format!(
                "notifications.dispatch_interval_secs must be between 1 and {MAX_INTERVAL_SECS}"
            )));
        }
        Ok(())
    }

    /// Database path with `~` expanded.
    pub fn database_path(&self) -> PathBuf {
        PathBuf::from(shellexpand::tilde(&self.database_path).to_string())
    }

    /// Get the default config path.
    pub fn default_path() -> PathBuf {
        Self::home_dir().join("config.toml")
    }

    /// Get the brgy-health home directory.
    pub fn home_dir() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".brgy")
    }
}

/// Scheduler loop configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    #[serde(default = "default_check_interval")]
    pub check_interval_secs: u64,
    /// Offset used to evaluate cron triggers. Barangay local time is UTC+08:00.
    #[serde(default = "default_utc_offset")]
    pub utc_offset_minutes: i32,
    /// Persist every job run in the `job_runs` table.
    #[serde(default = "bool_true")]
    pub record_history: bool,
}

fn bool_true() -> bool { true }
fn default_check_interval() -> u64 { 30 }
fn default_utc_offset() -> i32 { 8 * 60 }

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            check_interval_secs: default_check_interval(),
            utc_offset_minutes: default_utc_offset(),
            record_history: true,
        }
    }
}

/// What the reconciler does with a visit whose patient came back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SatisfiedPolicy {
    /// Leave the visit as pending.
    #[default]
    LeavePending,
    /// Mark the visit completed and stamp `completed_at`.
    Complete,
}

/// Follow-up reconciliation job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FollowUpConfig {
    #[serde(default = "bool_true")]
    pub enabled: bool,
    #[serde(default = "default_followup_cron")]
    pub cron: String,
    #[serde(default = "default_grace_period")]
    pub grace_period_days: u32,
    #[serde(default)]
    pub satisfied_policy: SatisfiedPolicy,
    #[serde(default)]
    pub notify_on_missed: bool,
    #[serde(default = "default_notify_feature")]
    pub notify_feature: String,
    #[serde(default = "default_staff_category")]
    pub staff_category: String,
}

fn default_followup_cron() -> String { "0 1 * * *".into() }
fn default_grace_period() -> u32 { 3 }
fn default_notify_feature() -> String { "PATIENT RECORDS".into() }
fn default_staff_category() -> String { "HEALTH".into() }

impl Default for FollowUpConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            cron: default_followup_cron(),
            grace_period_days: default_grace_period(),
            satisfied_policy: SatisfiedPolicy::default(),
            notify_on_missed: false,
            notify_feature: default_notify_feature(),
            staff_category: default_staff_category(),
        }
    }
}

/// Outbound notification delivery.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_dispatch_interval")]
    pub dispatch_interval_secs: u64,
    /// Empty means notifications are written to the log only.
    #[serde(default)]
    pub webhook_url: String,
    #[serde(default)]
    pub webhook_headers: Vec<(String, String)>,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
}

fn default_dispatch_interval() -> u64 { 60 }
fn default_batch_size() -> usize { 50 }
fn default_max_attempts() -> u32 { 5 }

impl Default for NotificationConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            dispatch_interval_secs: default_dispatch_interval(),
            webhook_url: String::new(),
            webhook_headers: Vec::new(),
            batch_size: default_batch_size(),
            max_attempts: default_max_attempts(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = BrgyConfig::default();
        assert_eq!(config.followups.grace_period_days, 3);
        assert_eq!(config.followups.cron, "0 1 * * *");
        assert_eq!(config.followups.satisfied_policy, SatisfiedPolicy::LeavePending);
        assert!(!config.followups.notify_on_missed);
        assert_eq!(config.scheduler.utc_offset_minutes, 480);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_from_toml() {
        let toml_str = r#"
            database_path = "/var/lib/brgy/health.db"

            [followups]
            grace_period_days = 5
            satisfied_policy = "complete"
            notify_on_missed = true
            notify_feature = "MATERNAL"

            [notifications]
            enabled = true
            webhook_url = "https://hooks.example.org/brgy"
        "#;

        let config: BrgyConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.database_path, "/var/lib/brgy/health.db");
        assert_eq!(config.followups.grace_period_days, 5);
        assert_eq!(config.followups.satisfied_policy, SatisfiedPolicy::Complete);
        assert_eq!(config.followups.notify_feature, "MATERNAL");
        assert_eq!(config.followups.staff_category, "HEALTH");
        assert!(config.notifications.enabled);
        assert_eq!(config.notifications.max_attempts, 5);
    }

    #[test]
    fn test_config_missing_fields_use_defaults() {
        let config: BrgyConfig = toml::from_str("").unwrap();
        assert_eq!(config.scheduler.check_interval_secs, 30);
        assert_eq!(config.notifications.dispatch_interval_secs, 60);
        assert!(config.followups.enabled);
    }

    #[test]
    fn test_validate_rejects_zero_interval() {
        let mut config = BrgyConfig::default();
        config.scheduler.check_interval_secs = 0;
        assert!(matches!(config.validate(), Err(BrgyError::Config(_))));
    }

    #[test]
    fn test_validate_rejects_huge_dispatch_interval() {
        let config: BrgyConfig = toml::from_str(
            "[notifications]\nenabled = true\ndispatch_interval_secs = 10000000000000000\n",
        )
        .unwrap();
        assert!(matches!(config.validate(), Err(BrgyError::Config(_))));

        let mut config = BrgyConfig::default();
        config.notifications.enabled = true;
        config.notifications.dispatch_interval_secs = MAX_INTERVAL_SECS;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_bad_offset() {
        let mut config = BrgyConfig::default();
        config.scheduler.utc_offset_minutes = 24 * 60;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_save_and_reload() {
        let dir = std::env::temp_dir().join("brgy-config-roundtrip");
        let path = dir.join("config.toml");
        let mut config = BrgyConfig::default();
        config.followups.grace_period_days = 7;
        config.save_to(&path).unwrap();

        let loaded = BrgyConfig::load_from(&path).unwrap();
        assert_eq!(loaded.followups.grace_period_days, 7);
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_home_dir() {
        let home = BrgyConfig::home_dir();
        assert!(home.to_string_lossy().contains(".brgy"));
    }
}
