//! Configuration for the subscription lifecycle manager.
//!
//! Loaded from `~/.mailwatch/config.json`. Every field carries a serde
//! default so a partial (or absent) file still yields a runnable config;
//! provider credentials are the only values an operator must supply.

use std::collections::HashMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Default Outlook-style subscription lifetime. Graph caps mailbox
/// subscriptions at roughly three days.
pub const DEFAULT_SUBSCRIPTION_TTL_HOURS: i64 = 72;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    #[serde(default)]
    pub gmail: GmailConfig,
    #[serde(default)]
    pub outlook: OutlookConfig,
    #[serde(default)]
    pub schedules: Schedules,
    /// Renew Outlook-style subscriptions whose expiry is within this window.
    #[serde(default = "default_renewal_window_hours")]
    pub renewal_window_hours: i64,
    /// Re-validate a nominally live subscription after this long.
    #[serde(default = "default_validation_interval_hours")]
    pub validation_interval_hours: i64,
    /// Courtesy pause between accounts inside one reconcile run.
    #[serde(default = "default_inter_account_delay_ms")]
    pub inter_account_delay_ms: u64,
    /// Hard timeout on every provider API call.
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    /// Bound on the router's async sync hand-off queue.
    #[serde(default = "default_sync_queue_capacity")]
    pub sync_queue_capacity: usize,
    /// Consecutive failed ticks before an account is flagged for attention.
    #[serde(default = "default_failure_alert_threshold")]
    pub failure_alert_threshold: u32,
    /// Run one reconcile pass immediately on daemon start.
    #[serde(default = "default_true")]
    pub reconcile_on_start: bool,
    #[serde(default)]
    pub features: HashMap<String, bool>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            gmail: GmailConfig::default(),
            outlook: OutlookConfig::default(),
            schedules: Schedules::default(),
            renewal_window_hours: default_renewal_window_hours(),
            validation_interval_hours: default_validation_interval_hours(),
            inter_account_delay_ms: default_inter_account_delay_ms(),
            request_timeout_secs: default_request_timeout_secs(),
            sync_queue_capacity: default_sync_queue_capacity(),
            failure_alert_threshold: default_failure_alert_threshold(),
            reconcile_on_start: true,
            features: HashMap::new(),
        }
    }
}

/// OAuth client registration used for refresh-token grants.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OAuthClientConfig {
    #[serde(default)]
    pub client_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_secret: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_uri: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GmailConfig {
    /// Fully-qualified Pub/Sub topic prefix; the per-account routing key is
    /// appended, e.g. `projects/storefront-prod/topics/mailwatch`.
    #[serde(default = "default_pubsub_topic_prefix")]
    pub pubsub_topic_prefix: String,
    #[serde(default)]
    pub oauth: OAuthClientConfig,
}

impl Default for GmailConfig {
    fn default() -> Self {
        Self {
            pubsub_topic_prefix: default_pubsub_topic_prefix(),
            oauth: OAuthClientConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutlookConfig {
    /// Public webhook URL Graph delivers change notifications to.
    #[serde(default)]
    pub notification_url: String,
    #[serde(default = "default_subscription_ttl_hours")]
    pub subscription_ttl_hours: i64,
    #[serde(default)]
    pub oauth: OAuthClientConfig,
}

impl Default for OutlookConfig {
    fn default() -> Self {
        Self {
            notification_url: String::new(),
            subscription_ttl_hours: DEFAULT_SUBSCRIPTION_TTL_HOURS,
            oauth: OAuthClientConfig::default(),
        }
    }
}

/// A single schedule entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScheduleEntry {
    pub enabled: bool,
    pub cron: String,
    pub timezone: String,
}

impl ScheduleEntry {
    pub fn default_reconcile() -> Self {
        Self {
            enabled: true,
            cron: "15 * * * *".to_string(),
            timezone: "UTC".to_string(),
        }
    }

    pub fn default_cleanup() -> Self {
        Self {
            enabled: true,
            cron: "45 3 * * *".to_string(),
            timezone: "UTC".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Schedules {
    /// Hourly health/renewal pass.
    #[serde(default = "ScheduleEntry::default_reconcile")]
    pub reconcile: ScheduleEntry,
    /// Daily orphan/collision sweep.
    #[serde(default = "ScheduleEntry::default_cleanup")]
    pub cleanup: ScheduleEntry,
}

impl Default for Schedules {
    fn default() -> Self {
        Self {
            reconcile: ScheduleEntry::default_reconcile(),
            cleanup: ScheduleEntry::default_cleanup(),
        }
    }
}

fn default_renewal_window_hours() -> i64 {
    24
}

fn default_validation_interval_hours() -> i64 {
    6
}

fn default_inter_account_delay_ms() -> u64 {
    1500
}

fn default_request_timeout_secs() -> u64 {
    20
}

fn default_sync_queue_capacity() -> usize {
    256
}

fn default_failure_alert_threshold() -> u32 {
    12
}

fn default_subscription_ttl_hours() -> i64 {
    DEFAULT_SUBSCRIPTION_TTL_HOURS
}

fn default_pubsub_topic_prefix() -> String {
    "projects/storefront-prod/topics/mailwatch".to_string()
}

fn default_true() -> bool {
    true
}

/// Config file location: `~/.mailwatch/config.json`.
pub fn config_path() -> Option<PathBuf> {
    dirs::home_dir().map(|home| home.join(".mailwatch").join("config.json"))
}

/// Load the config file, falling back to defaults when the file is absent.
/// A present-but-unparsable file is an error: silently reverting an
/// operator's provider settings to defaults would strand every account.
pub fn load_config() -> Result<Config, String> {
    let Some(path) = config_path() else {
        return Ok(Config::default());
    };
    if !path.exists() {
        return Ok(Config::default());
    }
    let content = std::fs::read_to_string(&path)
        .map_err(|e| format!("Failed to read {}: {}", path.display(), e))?;
    serde_json::from_str(&content).map_err(|e| format!("Invalid config {}: {}", path.display(), e))
}
