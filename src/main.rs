//! mailwatchd: the subscription lifecycle daemon.
//!
//! Wires the store, credential resolver, provider clients and reconciler
//! together and runs the cron scheduler until ctrl-c. The webhook receive
//! path lives in the host HTTP application, which embeds
//! [`mailwatch::router::NotificationRouter`] directly; this binary only
//! drives the scheduled reconcile and cleanup passes.

use std::sync::Arc;

use mailwatch::cipher::AesGcmCipher;
use mailwatch::config;
use mailwatch::credentials::CredentialResolver;
use mailwatch::provider::gmail::GmailWatchClient;
use mailwatch::provider::outlook::OutlookSubscriptionClient;
use mailwatch::provider::ClientRegistry;
use mailwatch::reconciler::{Reconciler, ReconcilerSettings};
use mailwatch::scheduler::WatchScheduler;
use mailwatch::store::AccountStore;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = config::load_config().map_err(std::io::Error::other)?;

    let store = Arc::new(AccountStore::open()?);
    let cipher = Arc::new(AesGcmCipher::from_env().map_err(std::io::Error::other)?);
    let http = reqwest::Client::builder()
        .timeout(std::time::Duration::from_secs(config.request_timeout_secs))
        .build()?;

    let resolver = Arc::new(CredentialResolver::new(
        store.clone(),
        cipher,
        http.clone(),
        config.gmail.oauth.clone(),
        config.outlook.oauth.clone(),
    ));
    let clients = ClientRegistry::new(
        Arc::new(GmailWatchClient::new(http.clone(), &config.gmail)),
        Arc::new(OutlookSubscriptionClient::new(http, &config.outlook)),
    );
    let reconciler = Arc::new(Reconciler::new(
        store,
        resolver,
        clients,
        ReconcilerSettings::from_config(&config),
    ));

    if config.reconcile_on_start {
        let boot = reconciler.clone();
        tokio::spawn(async move {
            boot.run_tick().await;
        });
    }

    let scheduler = WatchScheduler::new(config.schedules.clone(), reconciler);
    scheduler.start();
    log::info!("mailwatchd running (reconcile: {}, cleanup: {})",
        config.schedules.reconcile.cron,
        config.schedules.cleanup.cron
    );

    tokio::signal::ctrl_c().await?;
    log::info!("Shutting down");
    scheduler.stop();
    Ok(())
}
