//! Credential resolution for provider API calls.
//!
//! Every reconcile step re-resolves its bearer token through here rather
//! than caching one across a long-running loop. An expiring or expired
//! access token is refreshed against the provider's token endpoint and the
//! refreshed bundle is persisted before the token is returned, so a crash
//! mid-tick never loses a rotated refresh token.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::Deserialize;
use thiserror::Error;

use crate::config::OAuthClientConfig;
use crate::store::AccountStore;
use crate::types::{CredentialBundle, MailAccount, Provider};

pub const GOOGLE_TOKEN_URI: &str = "https://oauth2.googleapis.com/token";
pub const MICROSOFT_TOKEN_URI: &str =
    "https://login.microsoftonline.com/common/oauth2/v2.0/token";

/// Scope requested on Microsoft refresh grants.
const GRAPH_SCOPE: &str = "https://graph.microsoft.com/.default";

/// Consider a token expired this many seconds before its stated expiry.
const EXPIRY_SKEW_SECS: i64 = 60;

#[derive(Debug, Error)]
pub enum CredentialError {
    #[error("no usable credential: {0}")]
    NoCredential(String),

    #[error("token refresh failed: {0}")]
    RefreshFailed(String),

    #[error("provider rejected credential: {0}")]
    ProviderRejected(String),
}

/// Encrypt/decrypt primitive for token ciphertext. Supplied by the host
/// backend's secret layer; see [`crate::cipher::AesGcmCipher`] for the
/// daemon's own implementation.
pub trait SecretCipher: Send + Sync {
    fn decrypt(&self, ciphertext: &str) -> Result<String, String>;
    fn encrypt(&self, plaintext: &str) -> Result<String, String>;
}

/// What the reconciler depends on. Kept as a trait so tests can substitute
/// a canned token without any HTTP.
#[async_trait]
pub trait TokenSource: Send + Sync {
    /// Return a bearer token valid for at least the next minute.
    async fn bearer_token(&self, account: &MailAccount) -> Result<String, CredentialError>;
}

/// Whether a token with this expiry must be refreshed before use.
/// `None` means unknown and is treated as expired.
pub fn is_token_expired(expiry: Option<DateTime<Utc>>) -> bool {
    match expiry {
        None => true,
        Some(at) => at <= Utc::now() + Duration::seconds(EXPIRY_SKEW_SECS),
    }
}

#[derive(Debug, Deserialize)]
struct RefreshResponse {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    expires_in: Option<i64>,
}

pub struct CredentialResolver {
    store: Arc<AccountStore>,
    cipher: Arc<dyn SecretCipher>,
    http: reqwest::Client,
    gmail_oauth: OAuthClientConfig,
    outlook_oauth: OAuthClientConfig,
}

impl CredentialResolver {
    pub fn new(
        store: Arc<AccountStore>,
        cipher: Arc<dyn SecretCipher>,
        http: reqwest::Client,
        gmail_oauth: OAuthClientConfig,
        outlook_oauth: OAuthClientConfig,
    ) -> Self {
        Self {
            store,
            cipher,
            http,
            gmail_oauth,
            outlook_oauth,
        }
    }

    fn oauth_for(&self, provider: Provider) -> (&OAuthClientConfig, &'static str) {
        match provider {
            Provider::Gmail => (&self.gmail_oauth, GOOGLE_TOKEN_URI),
            Provider::Outlook => (&self.outlook_oauth, MICROSOFT_TOKEN_URI),
        }
    }

    /// Exchange the refresh token for a fresh access token and persist the
    /// updated bundle. Returns the plaintext access token.
    async fn refresh(&self, account: &MailAccount) -> Result<String, CredentialError> {
        let encrypted_refresh = account
            .credentials
            .refresh_token
            .as_ref()
            .ok_or_else(|| CredentialError::NoCredential("no refresh token on file".into()))?;
        let refresh_token = self
            .cipher
            .decrypt(encrypted_refresh)
            .map_err(CredentialError::NoCredential)?;

        let (oauth, default_uri) = self.oauth_for(account.provider);
        let token_uri = oauth.token_uri.as_deref().unwrap_or(default_uri);

        let mut form = vec![
            ("client_id", oauth.client_id.as_str()),
            ("refresh_token", refresh_token.as_str()),
            ("grant_type", "refresh_token"),
        ];
        if let Some(secret) = oauth.client_secret.as_deref() {
            form.push(("client_secret", secret));
        }
        if account.provider == Provider::Outlook {
            form.push(("scope", GRAPH_SCOPE));
        }

        let resp = self
            .http
            .post(token_uri)
            .form(&form)
            .send()
            .await
            .map_err(|e| CredentialError::RefreshFailed(e.to_string()))?;
        let status = resp.status();
        let body = resp.text().await.unwrap_or_default();

        if !status.is_success() {
            return Err(map_refresh_error(status.as_u16(), &body));
        }

        let parsed: RefreshResponse = serde_json::from_str(&body)
            .map_err(|e| CredentialError::RefreshFailed(format!("bad token response: {e}")))?;
        let expiry = Utc::now() + Duration::seconds(parsed.expires_in.unwrap_or(3600));

        // Persist (encrypted) before handing the token out. Providers may
        // rotate the refresh token; keep the old ciphertext when they don't.
        let new_refresh = match &parsed.refresh_token {
            Some(rotated) => Some(
                self.cipher
                    .encrypt(rotated)
                    .map_err(CredentialError::RefreshFailed)?,
            ),
            None => Some(encrypted_refresh.clone()),
        };
        let bundle = CredentialBundle {
            access_token: Some(
                self.cipher
                    .encrypt(&parsed.access_token)
                    .map_err(CredentialError::RefreshFailed)?,
            ),
            refresh_token: new_refresh,
            token_expiry: Some(expiry),
        };
        self.store
            .update_credentials(&account.id, &bundle)
            .map_err(|e| CredentialError::RefreshFailed(format!("persist failed: {e}")))?;

        Ok(parsed.access_token)
    }
}

#[async_trait]
impl TokenSource for CredentialResolver {
    async fn bearer_token(&self, account: &MailAccount) -> Result<String, CredentialError> {
        if !account.credentials.usable() {
            return Err(CredentialError::NoCredential(format!(
                "account {} has no tokens on file",
                account.id
            )));
        }

        if !is_token_expired(account.credentials.token_expiry) {
            if let Some(ciphertext) = &account.credentials.access_token {
                return self
                    .cipher
                    .decrypt(ciphertext)
                    .map_err(CredentialError::NoCredential);
            }
        }

        self.refresh(account).await
    }
}

fn map_refresh_error(status: u16, body: &str) -> CredentialError {
    let lowered = body.to_lowercase();
    if (status == 400 || status == 401)
        && (lowered.contains("invalid_grant") || lowered.contains("token has been expired"))
    {
        return CredentialError::ProviderRejected(format!("HTTP {}: {}", status, body));
    }
    CredentialError::RefreshFailed(format!("HTTP {}: {}", status, body))
}
