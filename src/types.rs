//! Shared domain types for mail accounts and their subscription sync state.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Push-notification provider backing a mail account.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    Gmail,
    Outlook,
}

impl Provider {
    pub fn as_str(&self) -> &'static str {
        match self {
            Provider::Gmail => "gmail",
            Provider::Outlook => "outlook",
        }
    }

    /// Parse the stored column value. Unknown values are rejected rather
    /// than defaulted; a row with a bad provider must never be routed.
    pub fn parse(value: &str) -> Option<Provider> {
        match value {
            "gmail" => Some(Provider::Gmail),
            "outlook" => Some(Provider::Outlook),
            _ => None,
        }
    }
}

impl std::fmt::Display for Provider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// OAuth credential bundle for one account. Token fields hold ciphertext;
/// decryption is the credential resolver's job.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CredentialBundle {
    pub access_token: Option<String>,
    pub refresh_token: Option<String>,
    /// When the access token lapses. `None` means unknown and is treated as
    /// already expired so the resolver always refreshes.
    pub token_expiry: Option<DateTime<Utc>>,
}

impl CredentialBundle {
    /// Whether the bundle can possibly yield a bearer token.
    pub fn usable(&self) -> bool {
        self.access_token.is_some() || self.refresh_token.is_some()
    }
}

/// Subscription sync state, owned exclusively by the reconciler and the
/// notification router. All other services treat it as opaque.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncState {
    /// Remote-assigned identifier: Gmail topic name / Graph subscription id.
    pub subscription_id: Option<String>,
    /// Derived routing key registered with the provider as topic suffix or
    /// clientState. Written once at first creation, stable afterwards.
    pub routing_key: Option<String>,
    /// When the remote subscription lapses. Absent for Gmail-style topics.
    pub expiry: Option<DateTime<Utc>>,
    /// True only while a subscription is believed live.
    pub watching: bool,
    /// Last time the subscription/endpoint was confirmed reachable.
    pub last_validated: Option<DateTime<Utc>>,
    /// Gmail incremental-sync cursor (last processed historyId).
    pub history_id: Option<String>,
    /// When the current subscription was first registered. Tie-breaker for
    /// routing-key collision repair (first registered keeps the simple key).
    pub watch_started_at: Option<DateTime<Utc>>,
    /// Reconcile ticks that have failed in a row for this account.
    pub consecutive_failures: u32,
    pub last_error: Option<String>,
    pub last_error_at: Option<DateTime<Utc>>,
}

/// A mail account as the lifecycle manager sees it.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MailAccount {
    pub id: String,
    pub email: String,
    pub provider: Provider,
    /// Inactive accounts must never hold a live subscription.
    pub active: bool,
    /// Stable nonce minted at account creation; input to the hashed
    /// routing-key fallback so regeneration stays deterministic.
    pub identity_nonce: String,
    pub credentials: CredentialBundle,
    pub sync: SyncState,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl MailAccount {
    pub fn has_credential(&self) -> bool {
        self.credentials.usable()
    }
}

/// A newly created remote subscription, normalized across providers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreatedSubscription {
    pub subscription_id: String,
    /// `None` for Gmail-style infinite-renewal topics.
    pub expiry: Option<DateTime<Utc>>,
    /// Initial sync cursor, when the provider hands one back at creation.
    pub cursor: Option<String>,
}

/// What the reconciler did (or decided not to do) for one account.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AccountAction {
    /// Healthy, nothing due this tick.
    Unchanged,
    Created,
    Renewed,
    /// Renewal reported the subscription gone; a fresh one was registered.
    Recreated,
    Validated,
    Cleaned,
}

/// Aggregate counters for one reconcile tick. Logged, and returned by the
/// administrative trigger endpoints.
#[derive(Debug, Clone, Copy, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TickSummary {
    pub examined: usize,
    pub created: usize,
    pub renewed: usize,
    pub recreated: usize,
    pub validated: usize,
    pub cleaned: usize,
    pub failed: usize,
    /// True when the tick was skipped because the previous run is still
    /// in flight.
    pub skipped: bool,
}

/// Aggregate counters for one deep-cleanup sweep.
#[derive(Debug, Clone, Copy, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SweepSummary {
    pub orphans_cleaned: usize,
    pub collisions_repaired: usize,
    pub failed: usize,
    pub skipped: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn provider_roundtrip() {
        assert_eq!(Provider::parse("gmail"), Some(Provider::Gmail));
        assert_eq!(Provider::parse("outlook"), Some(Provider::Outlook));
        assert_eq!(Provider::parse("imap"), None);
        assert_eq!(Provider::Gmail.as_str(), "gmail");
    }

    #[test]
    fn provider_serde_lowercase() {
        let json = serde_json::to_string(&Provider::Outlook).unwrap();
        assert_eq!(json, "\"outlook\"");
        let back: Provider = serde_json::from_str("\"gmail\"").unwrap();
        assert_eq!(back, Provider::Gmail);
    }

    #[test]
    fn credential_bundle_usable() {
        let mut bundle = CredentialBundle::default();
        assert!(!bundle.usable());
        bundle.refresh_token = Some("enc:r".to_string());
        assert!(bundle.usable());
    }
}
