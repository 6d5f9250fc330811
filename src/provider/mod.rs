//! Provider subscription clients.
//!
//! One client per push-notification provider, behind a common trait so the
//! reconciler never branches on provider type. Transport and HTTP-status
//! errors are converted to the [`ProviderError`] taxonomy at this boundary;
//! nothing above it sees a raw reqwest error.
//!
//! Modules:
//! - gmail: Gmail watch API (`users.watch` / `users.stop`)
//! - outlook: Microsoft Graph change-notification subscriptions

pub mod gmail;
pub mod outlook;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::types::{CreatedSubscription, MailAccount, Provider};

/// Provider/transport failures, classified by what the caller should do.
#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    /// Timeout, connect failure, rate limit, or 5xx. Retry next tick; the
    /// subscription's remote state is unknown.
    #[error("transient provider error: {0}")]
    Transient(String),

    /// The provider says the subscription does not exist.
    #[error("subscription not found")]
    NotFound,

    /// Definitive rejection (bad request, revoked grant, forbidden).
    #[error("provider rejected request ({status}): {message}")]
    Rejected { status: u16, message: String },
}

impl ProviderError {
    pub fn is_transient(&self) -> bool {
        matches!(self, ProviderError::Transient(_))
    }
}

impl From<reqwest::Error> for ProviderError {
    fn from(err: reqwest::Error) -> Self {
        // A timed-out call never proves the subscription absent.
        ProviderError::Transient(err.to_string())
    }
}

/// Map a non-2xx response to the taxonomy.
pub(crate) fn classify_response(status: reqwest::StatusCode, body: String) -> ProviderError {
    if status == reqwest::StatusCode::NOT_FOUND {
        return ProviderError::NotFound;
    }
    if status == reqwest::StatusCode::TOO_MANY_REQUESTS
        || status == reqwest::StatusCode::REQUEST_TIMEOUT
        || status.is_server_error()
    {
        return ProviderError::Transient(format!("HTTP {}: {}", status.as_u16(), body));
    }
    ProviderError::Rejected {
        status: status.as_u16(),
        message: body,
    }
}

/// The routing key the engine stamped onto the account before calling in.
pub(crate) fn routing_key(account: &MailAccount) -> Result<&str, ProviderError> {
    account
        .sync
        .routing_key
        .as_deref()
        .ok_or_else(|| ProviderError::Rejected {
            status: 0,
            message: format!("account {} has no routing key", account.id),
        })
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff_ms: 250,
            max_backoff_ms: 2_000,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RetryDecision {
    Retryable,
    NonRetryable,
}

fn retry_decision_for_status(status: reqwest::StatusCode) -> RetryDecision {
    if status == reqwest::StatusCode::TOO_MANY_REQUESTS
        || status == reqwest::StatusCode::REQUEST_TIMEOUT
        || status.is_server_error()
    {
        RetryDecision::Retryable
    } else {
        RetryDecision::NonRetryable
    }
}

fn retry_delay(
    attempt: u32,
    policy: &RetryPolicy,
    retry_after: Option<&reqwest::header::HeaderValue>,
) -> Duration {
    if let Some(value) = retry_after.and_then(|v| v.to_str().ok()) {
        if let Ok(secs) = value.parse::<u64>() {
            return Duration::from_secs(secs.min(30));
        }
    }

    let exponent = 2u64.saturating_pow(attempt.saturating_sub(1));
    let base = policy
        .initial_backoff_ms
        .saturating_mul(exponent)
        .min(policy.max_backoff_ms);
    let jitter = (std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.subsec_nanos() as u64)
        .unwrap_or(0))
        % 150;
    Duration::from_millis(base.saturating_add(jitter))
}

/// Send a request, retrying rate limits, 5xx and transport blips within the
/// policy. Returns the final response (which may still be non-2xx).
pub(crate) async fn send_with_retry(
    request: reqwest::RequestBuilder,
    policy: &RetryPolicy,
) -> Result<reqwest::Response, ProviderError> {
    let attempts = policy.max_attempts.max(1);
    for attempt in 1..=attempts {
        let Some(cloned) = request.try_clone() else {
            return request.send().await.map_err(ProviderError::from);
        };

        match cloned.send().await {
            Ok(response) => {
                let status = response.status();
                let decision = retry_decision_for_status(status);
                if decision == RetryDecision::Retryable && attempt < attempts {
                    let delay = retry_delay(
                        attempt,
                        policy,
                        response.headers().get(reqwest::header::RETRY_AFTER),
                    );
                    log::warn!(
                        "provider retry {}/{} after status {} (sleep {:?})",
                        attempt,
                        attempts,
                        status,
                        delay
                    );
                    tokio::time::sleep(delay).await;
                    continue;
                }
                return Ok(response);
            }
            Err(err) => {
                let retryable_transport = err.is_timeout() || err.is_connect();
                if retryable_transport && attempt < attempts {
                    let delay = retry_delay(attempt, policy, None);
                    log::warn!(
                        "provider retry {}/{} after transport error: {} (sleep {:?})",
                        attempt,
                        attempts,
                        err,
                        delay
                    );
                    tokio::time::sleep(delay).await;
                    continue;
                }
                return Err(ProviderError::from(err));
            }
        }
    }

    Err(ProviderError::Transient("request exhausted retries".into()))
}

/// Uniform lifecycle operations over a remote push subscription.
#[async_trait]
pub trait SubscriptionClient: Send + Sync {
    fn provider(&self) -> Provider;

    /// How long a fresh subscription lives. `None` for infinite-renewal
    /// (Gmail-style) registrations.
    fn subscription_ttl(&self) -> Option<chrono::Duration>;

    /// Register a push subscription carrying the account's routing key as
    /// the provider-visible correlation value.
    async fn create(
        &self,
        account: &MailAccount,
        token: &str,
    ) -> Result<CreatedSubscription, ProviderError>;

    /// Extend the subscription's expiry. `Ok(false)` means the provider
    /// reports it gone; fall back to `create`, don't retry the renewal.
    async fn renew(&self, account: &MailAccount, token: &str) -> Result<bool, ProviderError>;

    /// Idempotent delete: not-found counts as success.
    async fn delete(&self, account: &MailAccount, token: &str) -> Result<bool, ProviderError>;

    /// Confirm existence/reachability without mutating anything. Health
    /// checks only, never routing.
    async fn validate(&self, account: &MailAccount, token: &str) -> Result<bool, ProviderError>;
}

/// Per-provider client selection, resolved once per account.
pub struct ClientRegistry {
    gmail: Arc<dyn SubscriptionClient>,
    outlook: Arc<dyn SubscriptionClient>,
}

impl ClientRegistry {
    pub fn new(gmail: Arc<dyn SubscriptionClient>, outlook: Arc<dyn SubscriptionClient>) -> Self {
        Self { gmail, outlook }
    }

    pub fn client_for(&self, provider: Provider) -> &Arc<dyn SubscriptionClient> {
        match provider {
            Provider::Gmail => &self.gmail,
            Provider::Outlook => &self.outlook,
        }
    }
}
