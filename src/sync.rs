//! External sync collaborator contract and the async hand-off queue.
//!
//! The router never runs mailbox sync inline: providers expect their
//! webhook acknowledged within a few seconds, and a slow sync would trigger
//! timeout-driven redelivery. Dispatches are pushed onto a bounded queue
//! and drained by a worker task; a full queue drops the job (provider
//! redelivery and the hourly reconcile cover the gap).

use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::mpsc;

use crate::store::AccountStore;
use crate::types::MailAccount;

/// Result of one sync pass, as reported by the collaborator.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncOutcome {
    pub success: bool,
    pub processed_count: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// The external mailbox-sync collaborator. Opaque to this crate beyond
/// success/failure and a count for the logs.
#[async_trait]
pub trait AccountSyncer: Send + Sync {
    async fn sync_account(&self, account: &MailAccount, cursor: Option<&str>) -> SyncOutcome;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncJob {
    pub account_id: String,
    /// Provider-supplied cursor (Gmail historyId), when the notification
    /// carried one.
    pub cursor: Option<String>,
}

/// Non-blocking dispatch seam between the router and the queue. The router
/// only needs fire-and-forget semantics; tests substitute a recorder.
pub trait SyncDispatch: Send + Sync {
    /// Returns false when the job was dropped (queue full or worker gone).
    fn dispatch(&self, job: SyncJob) -> bool;
}

#[derive(Clone)]
pub struct SyncQueue {
    tx: mpsc::Sender<SyncJob>,
}

impl SyncQueue {
    /// Spawn the drain worker and return the queue handle.
    pub fn start(
        store: Arc<AccountStore>,
        syncer: Arc<dyn AccountSyncer>,
        capacity: usize,
    ) -> (Self, tokio::task::JoinHandle<()>) {
        let (tx, mut rx) = mpsc::channel::<SyncJob>(capacity.max(1));
        let handle = tokio::spawn(async move {
            while let Some(job) = rx.recv().await {
                // Reload the account: it may have been deactivated or lost
                // its credential while the job sat in the queue.
                let account = match store.get_account(&job.account_id) {
                    Ok(Some(account)) => account,
                    Ok(None) => {
                        log::info!("Dropping sync for deleted account {}", job.account_id);
                        continue;
                    }
                    Err(e) => {
                        log::warn!("Sync lookup failed for {}: {}", job.account_id, e);
                        continue;
                    }
                };
                if !account.active || !account.has_credential() {
                    log::debug!(
                        "Dropping sync for {} (inactive or credential-less)",
                        account.email
                    );
                    continue;
                }

                let outcome = syncer.sync_account(&account, job.cursor.as_deref()).await;
                if outcome.success {
                    log::info!(
                        "Synced {} ({} changes)",
                        account.email,
                        outcome.processed_count
                    );
                } else {
                    log::warn!(
                        "Sync failed for {}: {}",
                        account.email,
                        outcome.error.as_deref().unwrap_or("unknown error")
                    );
                }
            }
        });
        (Self { tx }, handle)
    }
}

impl SyncDispatch for SyncQueue {
    fn dispatch(&self, job: SyncJob) -> bool {
        match self.tx.try_send(job) {
            Ok(()) => true,
            Err(e) => {
                log::warn!("Sync queue rejected job: {}", e);
                false
            }
        }
    }
}
