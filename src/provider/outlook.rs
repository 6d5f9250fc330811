//! Microsoft Graph change-notification subscription client.
//!
//! Graph mailbox subscriptions are capped at roughly three days, so the
//! reconciler renews them via PATCH well before expiry. The account's
//! routing key rides in `clientState` and comes back verbatim on every
//! notification.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::Deserialize;

use super::{
    classify_response, routing_key, send_with_retry, ProviderError, RetryPolicy,
    SubscriptionClient,
};
use crate::config::OutlookConfig;
use crate::types::{CreatedSubscription, MailAccount, Provider};

const GRAPH_API_BASE: &str = "https://graph.microsoft.com/v1.0";
const CHANGE_TYPE: &str = "created,updated";
const WATCH_RESOURCE: &str = "me/mailFolders('inbox')/messages";

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GraphSubscription {
    id: String,
    #[serde(default)]
    expiration_date_time: Option<String>,
}

pub struct OutlookSubscriptionClient {
    http: reqwest::Client,
    notification_url: String,
    ttl: Duration,
    retry: RetryPolicy,
}

impl OutlookSubscriptionClient {
    pub fn new(http: reqwest::Client, config: &OutlookConfig) -> Self {
        Self {
            http,
            notification_url: config.notification_url.clone(),
            ttl: Duration::hours(config.subscription_ttl_hours.max(1)),
            retry: RetryPolicy::default(),
        }
    }

    fn next_expiry(&self) -> DateTime<Utc> {
        Utc::now() + self.ttl
    }

    fn parse_expiry(raw: Option<&str>, fallback: DateTime<Utc>) -> DateTime<Utc> {
        raw.and_then(|value| DateTime::parse_from_rfc3339(value).ok())
            .map(|dt| dt.with_timezone(&Utc))
            .unwrap_or(fallback)
    }
}

#[async_trait]
impl SubscriptionClient for OutlookSubscriptionClient {
    fn provider(&self) -> Provider {
        Provider::Outlook
    }

    fn subscription_ttl(&self) -> Option<Duration> {
        Some(self.ttl)
    }

    async fn create(
        &self,
        account: &MailAccount,
        token: &str,
    ) -> Result<CreatedSubscription, ProviderError> {
        let key = routing_key(account)?;
        let requested_expiry = self.next_expiry();
        let body = serde_json::json!({
            "changeType": CHANGE_TYPE,
            "notificationUrl": self.notification_url,
            "resource": WATCH_RESOURCE,
            "expirationDateTime": requested_expiry.to_rfc3339(),
            "clientState": key,
        });
        let resp = send_with_retry(
            self.http
                .post(format!("{GRAPH_API_BASE}/subscriptions"))
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
        let sub: GraphSubscription = resp.json().await?;
        Ok(CreatedSubscription {
            subscription_id: sub.id,
            expiry: Some(Self::parse_expiry(
                sub.expiration_date_time.as_deref(),
                requested_expiry,
            )),
            cursor: None,
        })
    }

    async fn renew(&self, account: &MailAccount, token: &str) -> Result<bool, ProviderError> {
        let Some(subscription_id) = account.sync.subscription_id.as_deref() else {
            // Nothing to extend; let the caller fall through to create.
            return Ok(false);
        };

        let body = serde_json::json!({
            "expirationDateTime": self.next_expiry().to_rfc3339(),
        });
        let resp = send_with_retry(
            self.http
                .patch(format!("{GRAPH_API_BASE}/subscriptions/{subscription_id}"))
                .bearer_auth(token)
                .json(&body),
            &self.retry,
        )
        .await?;

        let status = resp.status();
        if status.is_success() {
            return Ok(true);
        }
        if status == reqwest::StatusCode::NOT_FOUND {
            return Ok(false);
        }
        let text = resp.text().await.unwrap_or_default();
        Err(classify_response(status, text))
    }

    async fn delete(&self, account: &MailAccount, token: &str) -> Result<bool, ProviderError> {
        let Some(subscription_id) = account.sync.subscription_id.as_deref() else {
            return Ok(true);
        };

        let resp = send_with_retry(
            self.http
                .delete(format!("{GRAPH_API_BASE}/subscriptions/{subscription_id}"))
                .bearer_auth(token),
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
        let Some(subscription_id) = account.sync.subscription_id.as_deref() else {
            return Ok(false);
        };

        let resp = send_with_retry(
            self.http
                .get(format!("{GRAPH_API_BASE}/subscriptions/{subscription_id}"))
                .bearer_auth(token),
            &self.retry,
        )
        .await?;

        let status = resp.status();
        if status.is_success() {
            return Ok(true);
        }
        if status == reqwest::StatusCode::NOT_FOUND {
            return Ok(false);
        }
        let text = resp.text().await.unwrap_or_default();
        Err(classify_response(status, text))
    }
}
