//! Reconciliation engine.
//!
//! Each tick compares desired state (active accounts want a live
//! subscription) against actual state (subscription presence + expiry) and
//! issues create/renew/validate/cleanup actions per account:
//!
//! - no subscription, active, credentialed → create
//! - watching, expiry inside the renewal window → renew; a not-found
//!   renewal falls through to recreate, a transient failure waits for the
//!   next tick
//! - watching, validation overdue → validate; unreachable → recreate
//! - inactive or credential-less with subscription state → clean up
//!
//! Accounts are processed sequentially with a courtesy delay between them.
//! Ticks and sweeps each refuse to overlap themselves: a trigger that
//! fires while the previous run is still executing is skipped, never run
//! concurrently (racing a renewal against itself is how duplicate
//! subscriptions happen).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{Duration, Utc};

use crate::config::Config;
use crate::credentials::TokenSource;
use crate::error::ReconcileError;
use crate::identity::{self, IdentityScheme};
use crate::provider::{ClientRegistry, SubscriptionClient};
use crate::store::AccountStore;
use crate::types::{AccountAction, MailAccount, SweepSummary, TickSummary};

#[derive(Debug, Clone)]
pub struct ReconcilerSettings {
    /// Renew when expiry is closer than this.
    pub renewal_window: Duration,
    /// Re-validate a live subscription after this long without contact.
    pub validation_interval: Duration,
    /// Pause between accounts inside one run. Provider politeness, not
    /// correctness.
    pub inter_account_delay: StdDuration,
    /// Consecutive failures before an account is flagged at error level.
    pub failure_alert_threshold: u32,
}

impl ReconcilerSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            renewal_window: Duration::hours(config.renewal_window_hours.max(1)),
            validation_interval: Duration::hours(config.validation_interval_hours.max(1)),
            inter_account_delay: StdDuration::from_millis(config.inter_account_delay_ms),
            failure_alert_threshold: config.failure_alert_threshold.max(1),
        }
    }
}

impl Default for ReconcilerSettings {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

/// Single-flight guard: acquired when the flag flips false→true, released
/// on drop.
struct RunGuard<'a> {
    flag: &'a AtomicBool,
}

impl<'a> RunGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
            .then_some(Self { flag })
    }
}

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::SeqCst);
    }
}

pub struct Reconciler {
    store: Arc<AccountStore>,
    tokens: Arc<dyn TokenSource>,
    clients: ClientRegistry,
    identity: IdentityScheme,
    settings: ReconcilerSettings,
    tick_running: AtomicBool,
    sweep_running: AtomicBool,
}

impl Reconciler {
    pub fn new(
        store: Arc<AccountStore>,
        tokens: Arc<dyn TokenSource>,
        clients: ClientRegistry,
        settings: ReconcilerSettings,
    ) -> Self {
        let identity = IdentityScheme::new(store.clone());
        Self {
            store,
            tokens,
            clients,
            identity,
            settings,
            tick_running: AtomicBool::new(false),
            sweep_running: AtomicBool::new(false),
        }
    }

    // =========================================================================
    // Scheduled entry points
    // =========================================================================

    /// The hourly health/renewal pass.
    pub async fn run_tick(&self) -> TickSummary {
        let mut summary = TickSummary::default();
        let Some(_guard) = RunGuard::acquire(&self.tick_running) else {
            log::warn!("Reconcile tick still running, skipping this trigger");
            summary.skipped = true;
            return summary;
        };

        let accounts = match self.store.find_reconcilable() {
            Ok(accounts) => accounts,
            Err(e) => {
                log::error!("Reconcile tick aborted, account query failed: {}", e);
                summary.failed += 1;
                return summary;
            }
        };
        log::info!("Reconcile tick: examining {} account(s)", accounts.len());

        for (index, account) in accounts.iter().enumerate() {
            if index > 0 {
                tokio::time::sleep(self.settings.inter_account_delay).await;
            }
            summary.examined += 1;
            self.run_step(account, false, &mut summary).await;
        }

        log::info!(
            "Reconcile tick complete: examined={} created={} renewed={} recreated={} validated={} cleaned={} failed={}",
            summary.examined,
            summary.created,
            summary.renewed,
            summary.recreated,
            summary.validated,
            summary.cleaned,
            summary.failed
        );
        summary
    }

    /// The daily deep sweep: orphan cleanup independent of the tick's
    /// trigger conditions, plus routing-key collision repair.
    pub async fn run_deep_cleanup(&self) -> SweepSummary {
        let mut summary = SweepSummary::default();
        let Some(_guard) = RunGuard::acquire(&self.sweep_running) else {
            log::warn!("Deep cleanup still running, skipping this trigger");
            summary.skipped = true;
            return summary;
        };

        match self.store.find_orphaned() {
            Ok(orphans) => {
                for (index, account) in orphans.iter().enumerate() {
                    if index > 0 {
                        tokio::time::sleep(self.settings.inter_account_delay).await;
                    }
                    let client = self.clients.client_for(account.provider);
                    match self.cleanup(account, client.as_ref()).await {
                        Ok(()) => summary.orphans_cleaned += 1,
                        Err(e) => {
                            summary.failed += 1;
                            self.note_failure(account, &e);
                        }
                    }
                }
            }
            Err(e) => {
                log::error!("Orphan query failed: {}", e);
                summary.failed += 1;
            }
        }

        self.repair_collisions(&mut summary).await;

        log::info!(
            "Deep cleanup complete: orphans_cleaned={} collisions_repaired={} failed={}",
            summary.orphans_cleaned,
            summary.collisions_repaired,
            summary.failed
        );
        summary
    }

    /// Repair duplicate routing keys among active watching accounts. The
    /// first-registered account keeps its key; later claimants get their
    /// hashed form and re-register on the next tick. Two accounts sharing a
    /// hashed key is unrepairable here and flagged for manual intervention.
    async fn repair_collisions(&self, summary: &mut SweepSummary) {
        let groups = match self.store.find_routing_collisions() {
            Ok(groups) => groups,
            Err(e) => {
                log::error!("Collision query failed: {}", e);
                summary.failed += 1;
                return;
            }
        };

        for group in groups {
            let mut members = group.into_iter();
            let Some(keeper) = members.next() else {
                continue;
            };
            log::warn!(
                "Routing key {:?} claimed by multiple {} accounts; {} keeps it",
                keeper.sync.routing_key,
                keeper.provider,
                keeper.email
            );

            for account in members {
                let hashed =
                    identity::hashed_key(&account.email, &account.id, &account.identity_nonce);
                if account.sync.routing_key.as_deref() == Some(hashed.as_str()) {
                    log::error!(
                        "Hashed routing key collision on {} for {}, manual intervention required",
                        hashed,
                        account.email
                    );
                    summary.failed += 1;
                    continue;
                }

                // Drop the misrouted remote registration before rekeying.
                let client = self.clients.client_for(account.provider);
                match self.tokens.bearer_token(&account).await {
                    Ok(token) => {
                        if let Err(e) = client.delete(&account, &token).await {
                            log::warn!(
                                "Failed to delete colliding subscription for {}: {}",
                                account.email,
                                e
                            );
                        }
                    }
                    Err(e) => {
                        log::info!(
                            "No credential to delete colliding subscription for {}: {}",
                            account.email,
                            e
                        );
                    }
                }

                match self.store.repair_routing_key(&account.id, &hashed) {
                    Ok(_) => {
                        log::info!(
                            "Rekeyed {} to hashed routing key {}; will re-register next tick",
                            account.email,
                            hashed
                        );
                        summary.collisions_repaired += 1;
                    }
                    Err(e) => {
                        log::error!("Failed to rekey {}: {}", account.email, e);
                        summary.failed += 1;
                    }
                }
            }
        }
    }

    // =========================================================================
    // Administrative entry points
    // =========================================================================

    /// Reconcile a single account outside the scheduled loop. `None` when
    /// the account does not exist.
    pub async fn reconcile_account(
        &self,
        account_id: &str,
    ) -> Result<Option<AccountAction>, ReconcileError> {
        let Some(account) = self.store.get_account(account_id)? else {
            return Ok(None);
        };
        match self.step(&account, false).await {
            Ok(action) => {
                self.note_success(&account);
                Ok(Some(action))
            }
            Err(e) => {
                self.note_failure(&account, &e);
                Err(e)
            }
        }
    }

    /// Renew every watching account now, ignoring the renewal window.
    pub async fn force_renew_all(&self) -> TickSummary {
        let mut summary = TickSummary::default();
        let Some(_guard) = RunGuard::acquire(&self.tick_running) else {
            log::warn!("Reconcile run in flight, refusing forced renewal");
            summary.skipped = true;
            return summary;
        };

        let accounts = match self.store.find_watching() {
            Ok(accounts) => accounts,
            Err(e) => {
                log::error!("Forced renewal aborted, account query failed: {}", e);
                summary.failed += 1;
                return summary;
            }
        };

        for (index, account) in accounts.iter().enumerate() {
            if index > 0 {
                tokio::time::sleep(self.settings.inter_account_delay).await;
            }
            summary.examined += 1;
            self.run_step(account, true, &mut summary).await;
        }
        summary
    }

    // =========================================================================
    // Per-account state machine
    // =========================================================================

    async fn run_step(&self, account: &MailAccount, force_renew: bool, summary: &mut TickSummary) {
        match self.step(account, force_renew).await {
            Ok(action) => {
                self.note_success(account);
                match action {
                    AccountAction::Unchanged => {}
                    AccountAction::Created => summary.created += 1,
                    AccountAction::Renewed => summary.renewed += 1,
                    AccountAction::Recreated => summary.recreated += 1,
                    AccountAction::Validated => summary.validated += 1,
                    AccountAction::Cleaned => summary.cleaned += 1,
                }
            }
            Err(e) => {
                summary.failed += 1;
                self.note_failure(account, &e);
            }
        }
    }

    async fn step(
        &self,
        account: &MailAccount,
        force_renew: bool,
    ) -> Result<AccountAction, ReconcileError> {
        let client = self.clients.client_for(account.provider).clone();

        // Decommission path: inactive or credential-less accounts must not
        // keep a live subscription.
        if !account.active || !account.has_credential() {
            if account.sync.watching || account.sync.subscription_id.is_some() {
                self.cleanup(account, client.as_ref()).await?;
                return Ok(AccountAction::Cleaned);
            }
            return Ok(AccountAction::Unchanged);
        }

        // Tokens are resolved per step, never cached across the loop.
        let token = self.tokens.bearer_token(account).await?;

        if account.sync.watching && account.sync.subscription_id.is_some() {
            let now = Utc::now();

            if account.sync.expiry.is_some_and(|at| at <= now) {
                // Already lapsed remotely; renewal would just 404.
                return self.recreate(account, &token, client.as_ref()).await;
            }

            let renewal_due = force_renew
                || account
                    .sync
                    .expiry
                    .is_some_and(|at| at - now <= self.settings.renewal_window);
            if renewal_due {
                return match client.renew(account, &token).await {
                    Ok(true) => {
                        let expiry = client.subscription_ttl().map(|ttl| Utc::now() + ttl);
                        self.store.refresh_subscription_expiry(&account.id, expiry)?;
                        Ok(AccountAction::Renewed)
                    }
                    // Subscription gone. Recoverable by recreation, and
                    // only by recreation.
                    Ok(false) => self.recreate(account, &token, client.as_ref()).await,
                    // Transient: stay Watching, the next tick retries.
                    Err(e) => Err(e.into()),
                };
            }

            let validation_due = account
                .sync
                .last_validated
                .is_none_or(|at| now - at >= self.settings.validation_interval);
            if validation_due {
                return match client.validate(account, &token).await {
                    Ok(true) => {
                        self.store.touch_validated(&account.id)?;
                        Ok(AccountAction::Validated)
                    }
                    Ok(false) => self.recreate(account, &token, client.as_ref()).await,
                    Err(e) => Err(e.into()),
                };
            }

            return Ok(AccountAction::Unchanged);
        }

        self.create(account, &token, client.as_ref()).await
    }

    /// First-time registration for an account with no live subscription.
    async fn create(
        &self,
        account: &MailAccount,
        token: &str,
        client: &dyn SubscriptionClient,
    ) -> Result<AccountAction, ReconcileError> {
        let key = self.identity.ensure_routing_key(account)?;
        let mut registered = account.clone();
        registered.sync.routing_key = Some(key.clone());

        let sub = client.create(&registered, token).await?;

        // Guarded write: only land the subscription if nobody else did in
        // the meantime. Losing the race means our remote registration is a
        // duplicate to discard.
        let stored = self.store.store_subscription(&account.id, &key, &sub, true)?;
        if !stored {
            log::warn!(
                "Concurrent subscription creation for {}; deleting duplicate {}",
                account.email,
                sub.subscription_id
            );
            registered.sync.subscription_id = Some(sub.subscription_id);
            if let Err(e) = client.delete(&registered, token).await {
                log::warn!(
                    "Failed to delete duplicate subscription for {}: {}",
                    account.email,
                    e
                );
            }
            return Ok(AccountAction::Unchanged);
        }

        log::info!(
            "Subscription created for {} ({}): {}",
            account.email,
            account.provider,
            sub.subscription_id
        );
        Ok(AccountAction::Created)
    }

    /// The remote side reported the subscription gone or unreachable.
    /// Delete first (idempotent, keeps a half-alive registration from
    /// lingering as a duplicate), then register fresh under the same
    /// routing key. A transient delete failure propagates; the next tick
    /// retries the whole path rather than risking two live registrations.
    async fn recreate(
        &self,
        account: &MailAccount,
        token: &str,
        client: &dyn SubscriptionClient,
    ) -> Result<AccountAction, ReconcileError> {
        client.delete(account, token).await?;

        let key = self.identity.ensure_routing_key(account)?;
        let mut registered = account.clone();
        registered.sync.routing_key = Some(key.clone());

        let sub = client.create(&registered, token).await?;
        self.store
            .store_subscription(&account.id, &key, &sub, false)?;

        log::info!(
            "Subscription recreated for {} ({}): {}",
            account.email,
            account.provider,
            sub.subscription_id
        );
        Ok(AccountAction::Recreated)
    }

    /// Drop the remote subscription (best-effort, a token may no longer be
    /// resolvable) and clear local sync state. Local state clears
    /// regardless: an undeletable remote registration lapses on its own,
    /// while a stale local `watching` flag would block the invariant that
    /// inactive accounts stop watching within one cycle.
    async fn cleanup(
        &self,
        account: &MailAccount,
        client: &dyn SubscriptionClient,
    ) -> Result<(), ReconcileError> {
        if account.sync.subscription_id.is_some() {
            match self.tokens.bearer_token(account).await {
                Ok(token) => {
                    if let Err(e) = client.delete(account, &token).await {
                        log::warn!(
                            "Remote delete failed for {} (registration will lapse remotely): {}",
                            account.email,
                            e
                        );
                    }
                }
                Err(e) => {
                    log::info!(
                        "No credential to delete remote subscription for {}: {}",
                        account.email,
                        e
                    );
                }
            }
        }
        self.store.clear_sync_state(&account.id)?;
        log::info!("Cleared subscription state for {}", account.email);
        Ok(())
    }

    // =========================================================================
    // Failure accounting
    // =========================================================================

    fn note_success(&self, account: &MailAccount) {
        if account.sync.consecutive_failures > 0 {
            if let Err(e) = self.store.clear_failures(&account.id) {
                log::warn!("Failed to reset failure counter for {}: {}", account.id, e);
            }
        }
    }

    fn note_failure(&self, account: &MailAccount, err: &ReconcileError) {
        match self.store.record_failure(&account.id, &err.to_string()) {
            Ok(count) if count >= self.settings.failure_alert_threshold => {
                log::error!(
                    "Account {} ({}) failed {} consecutive reconcile attempts [{}]: {}",
                    account.email,
                    account.provider,
                    count,
                    err.kind(),
                    err
                );
            }
            Ok(_) => {
                log::warn!(
                    "Reconcile failed for {} ({}) [{}]: {}",
                    account.email,
                    account.provider,
                    err.kind(),
                    err
                );
            }
            Err(e) => {
                log::warn!("Failed to record failure for {}: {}", account.id, e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::{CredentialError, TokenSource};
    use crate::provider::ProviderError;
    use crate::types::{CreatedSubscription, CredentialBundle, Provider};
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::collections::VecDeque;

    struct FakeTokens {
        fail: bool,
    }

    #[async_trait]
    impl TokenSource for FakeTokens {
        async fn bearer_token(&self, _account: &MailAccount) -> Result<String, CredentialError> {
            if self.fail {
                Err(CredentialError::RefreshFailed("refresh endpoint down".into()))
            } else {
                Ok("tok".to_string())
            }
        }
    }

    /// Scripted provider client recording every call.
    struct FakeClient {
        provider: Provider,
        ttl: Option<Duration>,
        calls: Mutex<Vec<&'static str>>,
        create_results: Mutex<VecDeque<Result<CreatedSubscription, ProviderError>>>,
        renew_results: Mutex<VecDeque<Result<bool, ProviderError>>>,
        validate_results: Mutex<VecDeque<Result<bool, ProviderError>>>,
    }

    impl FakeClient {
        fn new(provider: Provider, ttl: Option<Duration>) -> Self {
            Self {
                provider,
                ttl,
                calls: Mutex::new(Vec::new()),
                create_results: Mutex::new(VecDeque::new()),
                renew_results: Mutex::new(VecDeque::new()),
                validate_results: Mutex::new(VecDeque::new()),
            }
        }

        fn calls(&self) -> Vec<&'static str> {
            self.calls.lock().clone()
        }

        fn default_created(&self) -> CreatedSubscription {
            CreatedSubscription {
                subscription_id: format!("sub-{}", self.calls.lock().len()),
                expiry: self.ttl.map(|ttl| Utc::now() + ttl),
                cursor: None,
            }
        }
    }

    #[async_trait]
    impl SubscriptionClient for FakeClient {
        fn provider(&self) -> Provider {
            self.provider
        }

        fn subscription_ttl(&self) -> Option<Duration> {
            self.ttl
        }

        async fn create(
            &self,
            _account: &MailAccount,
            _token: &str,
        ) -> Result<CreatedSubscription, ProviderError> {
            self.calls.lock().push("create");
            match self.create_results.lock().pop_front() {
                Some(result) => result,
                None => Ok(self.default_created()),
            }
        }

        async fn renew(&self, _account: &MailAccount, _token: &str) -> Result<bool, ProviderError> {
            self.calls.lock().push("renew");
            self.renew_results.lock().pop_front().unwrap_or(Ok(true))
        }

        async fn delete(
            &self,
            _account: &MailAccount,
            _token: &str,
        ) -> Result<bool, ProviderError> {
            self.calls.lock().push("delete");
            Ok(true)
        }

        async fn validate(
            &self,
            _account: &MailAccount,
            _token: &str,
        ) -> Result<bool, ProviderError> {
            self.calls.lock().push("validate");
            self.validate_results.lock().pop_front().unwrap_or(Ok(true))
        }
    }

    struct Harness {
        _dir: tempfile::TempDir,
        store: Arc<AccountStore>,
        gmail: Arc<FakeClient>,
        outlook: Arc<FakeClient>,
        reconciler: Reconciler,
    }

    fn harness() -> Harness {
        harness_with_tokens(false)
    }

    fn harness_with_tokens(fail_tokens: bool) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(AccountStore::open_at(dir.path().join("t.db")).unwrap());
        let gmail = Arc::new(FakeClient::new(Provider::Gmail, None));
        let outlook = Arc::new(FakeClient::new(Provider::Outlook, Some(Duration::hours(72))));
        let clients = ClientRegistry::new(gmail.clone(), outlook.clone());
        let settings = ReconcilerSettings {
            renewal_window: Duration::hours(12),
            validation_interval: Duration::hours(6),
            inter_account_delay: StdDuration::from_millis(0),
            failure_alert_threshold: 3,
        };
        let reconciler = Reconciler::new(
            store.clone(),
            Arc::new(FakeTokens { fail: fail_tokens }),
            clients,
            settings,
        );
        Harness {
            _dir: dir,
            store,
            gmail,
            outlook,
            reconciler,
        }
    }

    fn credentialed_account(h: &Harness, email: &str, provider: Provider) -> MailAccount {
        let account = h.store.insert_account(email, provider).unwrap();
        h.store
            .update_credentials(
                &account.id,
                &CredentialBundle {
                    access_token: None,
                    refresh_token: Some("enc:rt".to_string()),
                    token_expiry: None,
                },
            )
            .unwrap();
        h.store.get_account(&account.id).unwrap().unwrap()
    }

    #[tokio::test]
    async fn fresh_outlook_account_gets_subscription() {
        let h = harness();
        let account = credentialed_account(&h, "a@x.com", Provider::Outlook);

        let summary = h.reconciler.run_tick().await;
        assert_eq!(summary.created, 1);
        assert_eq!(summary.failed, 0);
        assert_eq!(h.outlook.calls(), vec!["create"]);

        let loaded = h.store.get_account(&account.id).unwrap().unwrap();
        assert!(loaded.sync.watching);
        assert!(loaded.sync.subscription_id.is_some());
        assert_eq!(loaded.sync.routing_key.as_deref(), Some("axcom"));
        let expiry = loaded.sync.expiry.expect("outlook subscription has expiry");
        let hours_out = (expiry - Utc::now()).num_hours();
        assert!((70..=72).contains(&hours_out), "expiry ~72h out, got {hours_out}h");
    }

    #[tokio::test]
    async fn renewal_not_found_falls_back_to_single_create() {
        let h = harness();
        let account = credentialed_account(&h, "a@x.com", Provider::Outlook);
        // Live subscription expiring in 2h, inside the 12h window.
        h.store
            .store_subscription(
                &account.id,
                "axcom",
                &CreatedSubscription {
                    subscription_id: "sub-old".to_string(),
                    expiry: Some(Utc::now() + Duration::hours(2)),
                    cursor: None,
                },
                true,
            )
            .unwrap();
        h.outlook
            .renew_results
            .lock()
            .push_back(Ok(false));

        let summary = h.reconciler.run_tick().await;
        assert_eq!(summary.recreated, 1);
        // Exactly one renew, then delete+create. Never a second renewal.
        assert_eq!(h.outlook.calls(), vec!["renew", "delete", "create"]);

        let loaded = h.store.get_account(&account.id).unwrap().unwrap();
        assert!(loaded.sync.watching);
        assert_ne!(loaded.sync.subscription_id.as_deref(), Some("sub-old"));
        // The routing key survives recreation.
        assert_eq!(loaded.sync.routing_key.as_deref(), Some("axcom"));
    }

    #[tokio::test]
    async fn renewal_inside_window_refreshes_expiry() {
        let h = harness();
        let account = credentialed_account(&h, "a@x.com", Provider::Outlook);
        h.store
            .store_subscription(
                &account.id,
                "axcom",
                &CreatedSubscription {
                    subscription_id: "sub-1".to_string(),
                    expiry: Some(Utc::now() + Duration::hours(2)),
                    cursor: None,
                },
                true,
            )
            .unwrap();

        let summary = h.reconciler.run_tick().await;
        assert_eq!(summary.renewed, 1);
        assert_eq!(h.outlook.calls(), vec!["renew"]);

        let loaded = h.store.get_account(&account.id).unwrap().unwrap();
        let hours_out = (loaded.sync.expiry.unwrap() - Utc::now()).num_hours();
        assert!(hours_out > 70, "expiry should be pushed out ~72h, got {hours_out}h");
    }

    #[tokio::test]
    async fn transient_renewal_failure_leaves_state_untouched() {
        let h = harness();
        let account = credentialed_account(&h, "a@x.com", Provider::Outlook);
        let expiry = Utc::now() + Duration::hours(2);
        h.store
            .store_subscription(
                &account.id,
                "axcom",
                &CreatedSubscription {
                    subscription_id: "sub-1".to_string(),
                    expiry: Some(expiry),
                    cursor: None,
                },
                true,
            )
            .unwrap();
        h.outlook
            .renew_results
            .lock()
            .push_back(Err(ProviderError::Transient("503".into())));

        let summary = h.reconciler.run_tick().await;
        assert_eq!(summary.failed, 1);
        assert_eq!(h.outlook.calls(), vec!["renew"]);

        let loaded = h.store.get_account(&account.id).unwrap().unwrap();
        assert!(loaded.sync.watching);
        assert_eq!(loaded.sync.subscription_id.as_deref(), Some("sub-1"));
        assert_eq!(loaded.sync.consecutive_failures, 1);
    }

    #[tokio::test]
    async fn inactive_account_is_cleaned_within_one_tick() {
        let h = harness();
        let account = credentialed_account(&h, "gone@x.com", Provider::Outlook);
        h.store
            .store_subscription(
                &account.id,
                "gonexcom",
                &CreatedSubscription {
                    subscription_id: "sub-1".to_string(),
                    expiry: Some(Utc::now() + Duration::hours(48)),
                    cursor: None,
                },
                true,
            )
            .unwrap();
        h.store.set_active(&account.id, false).unwrap();

        let summary = h.reconciler.run_tick().await;
        assert_eq!(summary.cleaned, 1);
        assert_eq!(h.outlook.calls(), vec!["delete"]);

        let loaded = h.store.get_account(&account.id).unwrap().unwrap();
        assert!(!loaded.sync.watching);
        assert!(loaded.sync.subscription_id.is_none());
    }

    #[tokio::test]
    async fn cleanup_is_idempotent_across_ticks() {
        let h = harness();
        let account = credentialed_account(&h, "gone@x.com", Provider::Outlook);
        h.store
            .store_subscription(
                &account.id,
                "gonexcom",
                &CreatedSubscription {
                    subscription_id: "sub-1".to_string(),
                    expiry: Some(Utc::now() + Duration::hours(48)),
                    cursor: None,
                },
                true,
            )
            .unwrap();
        h.store.set_active(&account.id, false).unwrap();

        let first = h.reconciler.run_tick().await;
        assert_eq!(first.cleaned, 1);
        assert_eq!(h.outlook.calls(), vec!["delete"]);

        // Second tick: state already cleared, the account drops out of the
        // reconcilable set and nothing is deleted again.
        let second = h.reconciler.run_tick().await;
        assert_eq!(second.examined, 0);
        assert_eq!(second.cleaned, 0);
        assert_eq!(h.outlook.calls(), vec!["delete"]);
    }

    #[tokio::test]
    async fn gmail_validation_failure_triggers_recreate() {
        let h = harness();
        let account = credentialed_account(&h, "g@x.com", Provider::Gmail);
        h.store
            .store_subscription(
                &account.id,
                "gxcom",
                &CreatedSubscription {
                    subscription_id: "topic-old".to_string(),
                    expiry: None,
                    cursor: Some("100".to_string()),
                },
                true,
            )
            .unwrap();
        // A zero validation interval makes the health check due immediately.
        let settings = ReconcilerSettings {
            renewal_window: Duration::hours(12),
            validation_interval: Duration::zero(),
            inter_account_delay: StdDuration::from_millis(0),
            failure_alert_threshold: 3,
        };
        let clients = ClientRegistry::new(h.gmail.clone(), h.outlook.clone());
        let reconciler = Reconciler::new(
            h.store.clone(),
            Arc::new(FakeTokens { fail: false }),
            clients,
            settings,
        );
        h.gmail.validate_results.lock().push_back(Ok(false));

        let summary = reconciler.run_tick().await;
        assert_eq!(summary.recreated, 1);
        assert_eq!(h.gmail.calls(), vec!["validate", "delete", "create"]);
    }

    #[tokio::test]
    async fn healthy_validated_account_is_untouched() {
        let h = harness();
        let account = credentialed_account(&h, "a@x.com", Provider::Outlook);
        h.store
            .store_subscription(
                &account.id,
                "axcom",
                &CreatedSubscription {
                    subscription_id: "sub-1".to_string(),
                    expiry: Some(Utc::now() + Duration::hours(48)),
                    cursor: None,
                },
                true,
            )
            .unwrap();

        let summary = h.reconciler.run_tick().await;
        // 48h out is outside the 12h window and validation was just touched
        // by store_subscription.
        assert_eq!(summary.created + summary.renewed + summary.recreated, 0);
        assert!(h.outlook.calls().is_empty());
    }

    #[tokio::test]
    async fn credential_failure_counts_and_preserves_state() {
        let h = harness_with_tokens(true);
        let account = credentialed_account(&h, "a@x.com", Provider::Outlook);

        let summary = h.reconciler.run_tick().await;
        assert_eq!(summary.failed, 1);
        assert!(h.outlook.calls().is_empty());

        let loaded = h.store.get_account(&account.id).unwrap().unwrap();
        assert_eq!(loaded.sync.consecutive_failures, 1);
        assert!(loaded.sync.last_error.is_some());
    }

    #[tokio::test]
    async fn deep_cleanup_clears_orphans() {
        let h = harness();
        let account = credentialed_account(&h, "gone@x.com", Provider::Gmail);
        h.store
            .store_subscription(
                &account.id,
                "gonexcom",
                &CreatedSubscription {
                    subscription_id: "topic".to_string(),
                    expiry: None,
                    cursor: None,
                },
                true,
            )
            .unwrap();
        h.store.set_active(&account.id, false).unwrap();

        let summary = h.reconciler.run_deep_cleanup().await;
        assert_eq!(summary.orphans_cleaned, 1);
        assert_eq!(h.gmail.calls(), vec!["delete"]);

        let loaded = h.store.get_account(&account.id).unwrap().unwrap();
        assert!(!loaded.sync.watching);
        assert!(loaded.sync.subscription_id.is_none());
    }

    #[tokio::test]
    async fn deep_cleanup_repairs_routing_collision_fifo() {
        let h = harness();
        let first = credentialed_account(&h, "a.b@x.com", Provider::Outlook);
        let second = credentialed_account(&h, "ab@x.com", Provider::Outlook);
        for account in [&first, &second] {
            h.store
                .store_subscription(
                    &account.id,
                    "abxcom",
                    &CreatedSubscription {
                        subscription_id: format!("sub-{}", account.email),
                        expiry: Some(Utc::now() + Duration::hours(48)),
                        cursor: None,
                    },
                    true,
                )
                .unwrap();
        }

        let summary = h.reconciler.run_deep_cleanup().await;
        assert_eq!(summary.collisions_repaired, 1);

        // First registered keeps the simple key and stays watching.
        let keeper = h.store.get_account(&first.id).unwrap().unwrap();
        assert_eq!(keeper.sync.routing_key.as_deref(), Some("abxcom"));
        assert!(keeper.sync.watching);

        // Later claimant is rekeyed to its hashed form and re-registers
        // on the next tick.
        let rekeyed = h.store.get_account(&second.id).unwrap().unwrap();
        assert_eq!(
            rekeyed.sync.routing_key.as_deref(),
            Some(identity::hashed_key("ab@x.com", &second.id, &second.identity_nonce).as_str())
        );
        assert!(!rekeyed.sync.watching);

        let tick = h.reconciler.run_tick().await;
        assert_eq!(tick.created, 1);
    }

    #[tokio::test]
    async fn force_renew_ignores_window() {
        let h = harness();
        let account = credentialed_account(&h, "a@x.com", Provider::Outlook);
        h.store
            .store_subscription(
                &account.id,
                "axcom",
                &CreatedSubscription {
                    subscription_id: "sub-1".to_string(),
                    expiry: Some(Utc::now() + Duration::hours(60)),
                    cursor: None,
                },
                true,
            )
            .unwrap();

        let summary = h.reconciler.force_renew_all().await;
        assert_eq!(summary.renewed, 1);
        assert_eq!(h.outlook.calls(), vec!["renew"]);
    }

    #[test]
    fn run_guard_is_single_flight() {
        let flag = AtomicBool::new(false);
        let guard = RunGuard::acquire(&flag);
        assert!(guard.is_some());
        assert!(RunGuard::acquire(&flag).is_none());
        drop(guard);
        assert!(RunGuard::acquire(&flag).is_some());
    }

    #[tokio::test]
    async fn reconcile_account_reports_missing() {
        let h = harness();
        let result = h.reconciler.reconcile_account("no-such-id").await.unwrap();
        assert!(result.is_none());
    }
}
