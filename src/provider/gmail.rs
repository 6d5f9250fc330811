//! Gmail watch API client.
//!
//! A Gmail "subscription" is a `users.watch` registration pointing at a
//! Cloud Pub/Sub topic; the per-account routing key is the topic suffix.
//! Watches carry no expiry in our model (the topic outlives individual
//! watch windows), so liveness is maintained by the validation pass and by
//! re-issuing the watch, not by a renewal window.

use async_trait::async_trait;
use serde::Deserialize;

use super::{
    classify_response, routing_key, send_with_retry, ProviderError, RetryPolicy,
    SubscriptionClient,
};
use crate::config::GmailConfig;
use crate::types::{CreatedSubscription, MailAccount, Provider};

const GMAIL_API_BASE: &str = "https://gmail.googleapis.com/gmail/v1";

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WatchResponse {
    #[serde(default)]
    history_id: Option<String>,
    #[serde(default)]
    expiration: Option<String>,
}

pub struct GmailWatchClient {
    http: reqwest::Client,
    topic_prefix: String,
    retry: RetryPolicy,
}

impl GmailWatchClient {
    pub fn new(http: reqwest::Client, config: &GmailConfig) -> Self {
        Self {
            http,
            topic_prefix: config.pubsub_topic_prefix.clone(),
            retry: RetryPolicy::default(),
        }
    }

    /// Fully-qualified Pub/Sub topic for one routing key.
    fn topic_name(&self, key: &str) -> String {
        format!("{}-{}", self.topic_prefix, key)
    }

    async fn watch(
        &self,
        account: &MailAccount,
        token: &str,
    ) -> Result<WatchResponse, ProviderError> {
        let key = routing_key(account)?;
        let body = serde_json::json!({
            "topicName": self.topic_name(key),
            "labelIds": ["INBOX"],
            "labelFilterBehavior": "INCLUDE",
        });
        let resp = send_with_retry(
            self.http
                .post(format!("{GMAIL_API_BASE}/users/me/watch"))
                .bearer_auth(token)
                .json(&body),
            &self.retry,
        )
        .await?;

        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(classify_response(status, text));
        }
        Ok(resp.json().await?)
    }
}

#[async_trait]
impl SubscriptionClient for GmailWatchClient {
    fn provider(&self) -> Provider {
        Provider::Gmail
    }

    fn subscription_ttl(&self) -> Option<chrono::Duration> {
        None
    }

    async fn create(
        &self,
        account: &MailAccount,
        token: &str,
    ) -> Result<CreatedSubscription, ProviderError> {
        let key = routing_key(account)?.to_string();
        let watch = self.watch(account, token).await?;
        if let Some(expiration) = &watch.expiration {
            log::debug!(
                "Gmail watch for {} reports expiration {} (superseded by re-watch)",
                account.email,
                expiration
            );
        }
        Ok(CreatedSubscription {
            subscription_id: self.topic_name(&key),
            expiry: None,
            cursor: watch.history_id,
        })
    }

    async fn renew(&self, account: &MailAccount, token: &str) -> Result<bool, ProviderError> {
        // Renewal is just re-issuing the watch against the same topic.
        match self.watch(account, token).await {
            Ok(_) => Ok(true),
            Err(ProviderError::NotFound) => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn delete(&self, account: &MailAccount, token: &str) -> Result<bool, ProviderError> {
        let resp = send_with_retry(
            self.http
                .post(format!("{GMAIL_API_BASE}/users/me/stop"))
                .bearer_auth(token)
                .header(reqwest::header::CONTENT_LENGTH, 0),
            &self.retry,
        )
        .await?;

        let status = resp.status();
        if status.is_success() || status == reqwest::StatusCode::NOT_FOUND {
            return Ok(true);
        }
        let text = resp.text().await.unwrap_or_default();
        Err(classify_response(status, text))
    }

    async fn validate(&self, account: &MailAccount, token: &str) -> Result<bool, ProviderError> {
        // Gmail exposes no watch-inspection endpoint; profile reachability
        // is the proxy for "this account can still receive pushes".
        let resp = send_with_retry(
            self.http
                .get(format!("{GMAIL_API_BASE}/users/me/profile"))
                .bearer_auth(token),
            &self.retry,
        )
        .await?;

        let status = resp.status();
        if status.is_success() {
            return Ok(true);
        }
        if status == reqwest::StatusCode::TOO_MANY_REQUESTS
            || status == reqwest::StatusCode::REQUEST_TIMEOUT
            || status.is_server_error()
        {
            let text = resp.text().await.unwrap_or_default();
            return Err(classify_response(status, text));
        }
        log::debug!(
            "Gmail validate for {} returned {}, treating as unreachable",
            account.email,
            status
        );
        Ok(false)
    }
}
