//! Administrative operations.
//!
//! Invoked manually or by a higher-level controller, never by the core
//! loop: trigger reconciliation for one account, list accounts missing
//! subscriptions, force-renew everything, and report per-account sync
//! status. Failures come back as structured payloads (account id,
//! provider, failure kind) so an operator can make a retry decision
//! without grepping logs.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::reconciler::Reconciler;
use crate::store::AccountStore;
use crate::types::{AccountAction, MailAccount, Provider, TickSummary};

/// Structured failure payload for administrative callers.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AdminFailure {
    pub account_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provider: Option<Provider>,
    pub kind: &'static str,
    pub message: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MissingSubscription {
    pub account_id: String,
    pub email: String,
    pub provider: Provider,
    pub consecutive_failures: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AccountSyncStatus {
    pub account_id: String,
    pub email: String,
    pub provider: Provider,
    pub active: bool,
    /// Coarse lifecycle label: watching, expired, no-subscription,
    /// inactive, orphaned, or attention.
    pub state: &'static str,
    pub watching: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subscription_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub routing_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expiry: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_validated: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub history_id: Option<String>,
    pub consecutive_failures: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error_at: Option<DateTime<Utc>>,
}

pub struct AdminApi {
    store: Arc<AccountStore>,
    reconciler: Arc<Reconciler>,
    attention_threshold: u32,
}

impl AdminApi {
    pub fn new(store: Arc<AccountStore>, reconciler: Arc<Reconciler>, attention_threshold: u32) -> Self {
        Self {
            store,
            reconciler,
            attention_threshold: attention_threshold.max(1),
        }
    }

    /// Run one reconcile step for a single account, outside the schedule.
    pub async fn reconcile_account(&self, account_id: &str) -> Result<AccountAction, AdminFailure> {
        let account = self
            .store
            .get_account(account_id)
            .map_err(|e| AdminFailure {
                account_id: account_id.to_string(),
                provider: None,
                kind: "store",
                message: e.to_string(),
            })?
            .ok_or_else(|| AdminFailure {
                account_id: account_id.to_string(),
                provider: None,
                kind: "not-found",
                message: format!("no account with id {account_id}"),
            })?;

        match self.reconciler.reconcile_account(account_id).await {
            Ok(Some(action)) => Ok(action),
            Ok(None) => Err(AdminFailure {
                account_id: account_id.to_string(),
                provider: Some(account.provider),
                kind: "not-found",
                message: format!("account {account_id} vanished mid-operation"),
            }),
            Err(e) => Err(AdminFailure {
                account_id: account_id.to_string(),
                provider: Some(account.provider),
                kind: e.kind(),
                message: e.to_string(),
            }),
        }
    }

    /// Active accounts that should be watching but aren't.
    pub fn missing_subscriptions(&self) -> Result<Vec<MissingSubscription>, AdminFailure> {
        let accounts = self.store.find_missing_subscriptions().map_err(|e| AdminFailure {
            account_id: String::new(),
            provider: None,
            kind: "store",
            message: e.to_string(),
        })?;
        Ok(accounts
            .into_iter()
            .map(|account| MissingSubscription {
                account_id: account.id,
                email: account.email,
                provider: account.provider,
                consecutive_failures: account.sync.consecutive_failures,
                last_error: account.sync.last_error,
            })
            .collect())
    }

    /// Renew every watching account now, ignoring renewal windows.
    pub async fn force_renew_all(&self) -> TickSummary {
        self.reconciler.force_renew_all().await
    }

    /// Current sync status for every account.
    pub fn sync_status(&self) -> Result<Vec<AccountSyncStatus>, AdminFailure> {
        let accounts = self.store.all_accounts().map_err(|e| AdminFailure {
            account_id: String::new(),
            provider: None,
            kind: "store",
            message: e.to_string(),
        })?;
        let now = Utc::now();
        Ok(accounts
            .into_iter()
            .map(|account| {
                let state = state_of(&account, self.attention_threshold, now);
                AccountSyncStatus {
                    account_id: account.id,
                    email: account.email,
                    provider: account.provider,
                    active: account.active,
                    state,
                    watching: account.sync.watching,
                    subscription_id: account.sync.subscription_id,
                    routing_key: account.sync.routing_key,
                    expiry: account.sync.expiry,
                    last_validated: account.sync.last_validated,
                    history_id: account.sync.history_id,
                    consecutive_failures: account.sync.consecutive_failures,
                    last_error: account.sync.last_error,
                    last_error_at: account.sync.last_error_at,
                }
            })
            .collect())
    }
}

fn state_of(account: &MailAccount, attention_threshold: u32, now: DateTime<Utc>) -> &'static str {
    if !account.active {
        if account.sync.watching || account.sync.subscription_id.is_some() {
            return "orphaned";
        }
        return "inactive";
    }
    if account.sync.consecutive_failures >= attention_threshold {
        return "attention";
    }
    if account.sync.watching {
        if account.sync.expiry.is_some_and(|at| at <= now) {
            return "expired";
        }
        return "watching";
    }
    "no-subscription"
}
