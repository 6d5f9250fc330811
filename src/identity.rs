//! Routing-key derivation for push subscriptions.
//!
//! The routing key is the correlation value registered with the provider
//! (Pub/Sub topic suffix for Gmail, clientState for Graph) and the value
//! inbound notifications are matched back to an account with. Derivation
//! must be pure and deterministic: the simple form is the normalized email
//! address; when that is empty or already claimed by another account of the
//! same provider, a hashed form over local-part + account id + the
//! account's stored nonce takes over.

use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::store::{AccountStore, StoreError};
use crate::types::MailAccount;

/// Hex characters kept from the digest. Short enough for a topic suffix,
/// long enough that accidental collisions mean corrupted inputs.
const HASHED_KEY_LEN: usize = 16;

#[derive(Debug, Error)]
pub enum IdentityError {
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Both the simple and the hashed form are taken. Requires manual
    /// intervention; never auto-repaired.
    #[error("routing key collision for account {account_id}: hashed key {key} already in use")]
    FallbackCollision { account_id: String, key: String },
}

/// Normalized simple form: the whole address lowercased with every
/// non-alphanumeric character stripped (`a@x.com` → `axcom`).
/// `None` when nothing survives normalization.
pub fn simple_key(email: &str) -> Option<String> {
    let key: String = email
        .to_lowercase()
        .chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .collect();
    if key.is_empty() {
        None
    } else {
        Some(key)
    }
}

/// Hashed fallback form. Inputs are all stable for the account's lifetime,
/// so regeneration always reproduces the same key.
pub fn hashed_key(email: &str, account_id: &str, nonce: &str) -> String {
    let local_part = email.split('@').next().unwrap_or(email);
    let mut hasher = Sha256::new();
    hasher.update(local_part.to_lowercase().as_bytes());
    hasher.update(b":");
    hasher.update(account_id.as_bytes());
    hasher.update(b":");
    hasher.update(nonce.as_bytes());
    let digest = hex::encode(hasher.finalize());
    format!("k{}", &digest[..HASHED_KEY_LEN])
}

/// Pure derivation without collision awareness: the key this account would
/// get on an empty slate.
pub fn derive(account: &MailAccount) -> String {
    simple_key(&account.email)
        .unwrap_or_else(|| hashed_key(&account.email, &account.id, &account.identity_nonce))
}

pub struct IdentityScheme {
    store: std::sync::Arc<AccountStore>,
}

impl IdentityScheme {
    pub fn new(store: std::sync::Arc<AccountStore>) -> Self {
        Self { store }
    }

    /// The key to register a new subscription under.
    ///
    /// A key already stored on the account wins unconditionally: it is the
    /// value the remote registration carries, and regenerating it would
    /// break routing until the next renewal. Otherwise the simple form is
    /// tried first; a collision with another account of the same provider
    /// falls back to the hashed form (first-registered keeps the simple
    /// key). A hashed-form collision is not auto-resolved.
    pub fn ensure_routing_key(&self, account: &MailAccount) -> Result<String, IdentityError> {
        if let Some(existing) = &account.sync.routing_key {
            return Ok(existing.clone());
        }

        if let Some(simple) = simple_key(&account.email) {
            if !self
                .store
                .routing_key_in_use(account.provider, &simple, &account.id)?
            {
                return Ok(simple);
            }
            log::info!(
                "Routing key '{}' already claimed ({} {}), falling back to hashed form",
                simple,
                account.provider,
                account.email
            );
        }

        let hashed = hashed_key(&account.email, &account.id, &account.identity_nonce);
        if self
            .store
            .routing_key_in_use(account.provider, &hashed, &account.id)?
        {
            return Err(IdentityError::FallbackCollision {
                account_id: account.id.clone(),
                key: hashed,
            });
        }
        Ok(hashed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Provider;

    #[test]
    fn simple_key_normalizes() {
        assert_eq!(simple_key("a@x.com").as_deref(), Some("axcom"));
        assert_eq!(
            simple_key("First.Last+tag@Shop.Example").as_deref(),
            Some("firstlasttagshopexample")
        );
        assert_eq!(simple_key("@.+"), None);
    }

    #[test]
    fn hashed_key_is_deterministic_and_nonce_sensitive() {
        let a = hashed_key("a@x.com", "acct-1", "nonce-1");
        let b = hashed_key("a@x.com", "acct-1", "nonce-1");
        assert_eq!(a, b);
        assert_eq!(a.len(), HASHED_KEY_LEN + 1);
        assert!(a.starts_with('k'));

        assert_ne!(a, hashed_key("a@x.com", "acct-1", "nonce-2"));
        assert_ne!(a, hashed_key("a@x.com", "acct-2", "nonce-1"));
    }

    #[test]
    fn ensure_prefers_stored_key() {
        let dir = tempfile::tempdir().unwrap();
        let store =
            std::sync::Arc::new(AccountStore::open_at(dir.path().join("t.db")).unwrap());
        let scheme = IdentityScheme::new(store.clone());

        let mut account = store.insert_account("a@x.com", Provider::Outlook).unwrap();
        account.sync.routing_key = Some("frozen".to_string());
        assert_eq!(scheme.ensure_routing_key(&account).unwrap(), "frozen");
    }

    #[test]
    fn collision_falls_back_to_hash_fifo() {
        let dir = tempfile::tempdir().unwrap();
        let store =
            std::sync::Arc::new(AccountStore::open_at(dir.path().join("t.db")).unwrap());
        let scheme = IdentityScheme::new(store.clone());

        // "a.b@x.com" and "ab@x.com" normalize to the same simple key.
        let first = store.insert_account("a.b@x.com", Provider::Outlook).unwrap();
        let key = scheme.ensure_routing_key(&first).unwrap();
        assert_eq!(key, "abxcom");
        store
            .store_subscription(
                &first.id,
                &key,
                &crate::types::CreatedSubscription {
                    subscription_id: "sub-1".to_string(),
                    expiry: None,
                    cursor: None,
                },
                true,
            )
            .unwrap();

        let second = store.insert_account("ab@x.com", Provider::Outlook).unwrap();
        let fallback = scheme.ensure_routing_key(&second).unwrap();
        assert_ne!(fallback, "abxcom");
        assert_eq!(
            fallback,
            hashed_key("ab@x.com", &second.id, &second.identity_nonce)
        );

        // Same key under a different provider is not a collision.
        let gmail = store.insert_account("a+b@x.com", Provider::Gmail).unwrap();
        let gmail_key = scheme.ensure_routing_key(&gmail).unwrap();
        assert_eq!(gmail_key, "abxcom");
    }
}
