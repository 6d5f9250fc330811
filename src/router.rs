//! Notification router: the webhook receive path.
//!
//! Handlers are framework-agnostic: they take raw payloads and return
//! [`RouterResponse`] values for the host HTTP layer to serialize. The path
//! per inbound call is decode → resolve owning account → hand off to the
//! sync queue. Orphans (no matching account) are acknowledged with 200 so
//! the provider doesn't retry-storm a condition retries cannot fix; only a
//! malformed payload earns a client error.
//!
//! The router keeps no dedupe state: a redelivered notification dispatches
//! again, and idempotency is the sync collaborator's contract. The one
//! guard is the Gmail history cursor, which only ever advances.

use std::sync::Arc;

use base64::engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD};
use base64::Engine;
use serde::Deserialize;

use crate::store::AccountStore;
use crate::sync::{SyncDispatch, SyncJob};
use crate::types::{MailAccount, Provider};

/// A minimal HTTP response for the host framework to emit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouterResponse {
    pub status: u16,
    pub content_type: &'static str,
    pub body: String,
}

impl RouterResponse {
    fn ok() -> Self {
        Self {
            status: 200,
            content_type: "text/plain",
            body: String::new(),
        }
    }

    fn ok_text(body: impl Into<String>) -> Self {
        Self {
            status: 200,
            content_type: "text/plain",
            body: body.into(),
        }
    }

    fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: 400,
            content_type: "text/plain",
            body: message.into(),
        }
    }

    fn server_error() -> Self {
        Self {
            status: 500,
            content_type: "text/plain",
            body: "internal error".to_string(),
        }
    }
}

// ============================================================================
// Wire shapes
// ============================================================================

/// Pub/Sub push envelope wrapping a Gmail change notification.
#[derive(Debug, Deserialize)]
struct PubSubEnvelope {
    message: PubSubMessage,
    #[serde(default)]
    #[allow(dead_code)]
    subscription: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PubSubMessage {
    data: String,
    #[serde(default)]
    message_id: Option<String>,
}

/// The decoded `message.data` payload.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GmailChange {
    email_address: String,
    /// Number on the wire in practice, but strings have been observed.
    #[serde(default)]
    history_id: Option<serde_json::Value>,
}

impl GmailChange {
    fn cursor(&self) -> Option<String> {
        match &self.history_id {
            Some(serde_json::Value::Number(n)) => Some(n.to_string()),
            Some(serde_json::Value::String(s)) if !s.is_empty() => Some(s.clone()),
            _ => None,
        }
    }
}

/// Graph delivers change notifications as an array under `value`.
#[derive(Debug, Deserialize)]
struct GraphEnvelope {
    #[serde(default)]
    value: Vec<GraphNotification>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GraphNotification {
    #[serde(default)]
    subscription_id: Option<String>,
    #[serde(default)]
    client_state: Option<String>,
    #[serde(default)]
    change_type: Option<String>,
}

// ============================================================================
// Router
// ============================================================================

pub struct NotificationRouter {
    store: Arc<AccountStore>,
    dispatch: Arc<dyn SyncDispatch>,
}

impl NotificationRouter {
    pub fn new(store: Arc<AccountStore>, dispatch: Arc<dyn SyncDispatch>) -> Self {
        Self { store, dispatch }
    }

    /// Endpoint-ownership proof: echo the provider's validation token back
    /// verbatim as plain text. Protocol requirement, not optional.
    pub fn validation_challenge(&self, token: &str) -> RouterResponse {
        RouterResponse::ok_text(token)
    }

    /// Handle a Pub/Sub push carrying a Gmail change notification.
    pub fn receive_gmail(&self, body: &[u8]) -> RouterResponse {
        let envelope: PubSubEnvelope = match serde_json::from_slice(body) {
            Ok(envelope) => envelope,
            Err(e) => {
                log::warn!("Rejected malformed Pub/Sub envelope: {}", e);
                return RouterResponse::bad_request("malformed envelope");
            }
        };

        let decoded = match decode_base64(&envelope.message.data) {
            Some(bytes) => bytes,
            None => {
                log::warn!(
                    "Rejected Pub/Sub message {:?}: data is not base64",
                    envelope.message.message_id
                );
                return RouterResponse::bad_request("data is not base64");
            }
        };
        let change: GmailChange = match serde_json::from_slice(&decoded) {
            Ok(change) => change,
            Err(e) => {
                log::warn!("Rejected undecodable Gmail change payload: {}", e);
                return RouterResponse::bad_request("malformed change payload");
            }
        };

        let account = match self.store.find_by_email(&change.email_address) {
            Ok(account) => account,
            Err(e) => {
                log::error!("Account lookup failed for Gmail notification: {}", e);
                return RouterResponse::server_error();
            }
        };
        let Some(account) = account else {
            log::info!(
                "Orphan Gmail notification for {}: no matching account, ack without dispatch",
                change.email_address
            );
            return RouterResponse::ok();
        };

        let cursor = change.cursor();
        if let Some(history_id) = cursor.as_deref() {
            // Advance-only; redelivered older notifications don't rewind.
            if let Err(e) = self.store.advance_history_id(&account.id, history_id) {
                log::warn!("Failed to advance history cursor for {}: {}", account.email, e);
            }
        }

        self.dispatch_for(&account, cursor)
    }

    /// Handle a Graph change-notification POST. A `validationToken` query
    /// parameter short-circuits into the echo response.
    pub fn receive_outlook(
        &self,
        validation_token: Option<&str>,
        body: &[u8],
    ) -> RouterResponse {
        if let Some(token) = validation_token {
            return self.validation_challenge(token);
        }

        let envelope: GraphEnvelope = match serde_json::from_slice(body) {
            Ok(envelope) => envelope,
            Err(e) => {
                log::warn!("Rejected malformed Graph notification body: {}", e);
                return RouterResponse::bad_request("malformed notification");
            }
        };

        for notification in &envelope.value {
            let Some(client_state) = notification.client_state.as_deref() else {
                log::warn!(
                    "Graph notification {:?} carries no clientState, skipping",
                    notification.subscription_id
                );
                continue;
            };

            let account = match self.store.find_by_routing_key(Provider::Outlook, client_state) {
                Ok(account) => account,
                Err(e) => {
                    log::error!("Account lookup failed for Graph notification: {}", e);
                    return RouterResponse::server_error();
                }
            };
            let Some(account) = account else {
                log::info!(
                    "Orphan Graph notification (clientState {}, change {:?}), ack without dispatch",
                    client_state,
                    notification.change_type
                );
                continue;
            };

            self.dispatch_for(&account, None);
        }

        RouterResponse::ok()
    }

    /// Final routing step. Always acknowledges with 200: an inactive or
    /// credential-less account is not something the provider can fix by
    /// retrying.
    fn dispatch_for(&self, account: &MailAccount, cursor: Option<String>) -> RouterResponse {
        if !account.active || !account.has_credential() {
            log::info!(
                "Not dispatching sync for {} (inactive or credential-less)",
                account.email
            );
            return RouterResponse::ok();
        }

        let accepted = self.dispatch.dispatch(SyncJob {
            account_id: account.id.clone(),
            cursor,
        });
        if !accepted {
            log::warn!(
                "Sync hand-off dropped for {}; relying on redelivery/reconcile",
                account.email
            );
        }
        RouterResponse::ok()
    }
}

/// Pub/Sub emits standard base64; URL-safe unpadded shows up from some
/// forwarders. Accept both.
fn decode_base64(data: &str) -> Option<Vec<u8>> {
    STANDARD
        .decode(data)
        .or_else(|_| URL_SAFE_NO_PAD.decode(data))
        .ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{CreatedSubscription, CredentialBundle};
    use parking_lot::Mutex;

    struct RecordingDispatch {
        jobs: Mutex<Vec<SyncJob>>,
    }

    impl RecordingDispatch {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                jobs: Mutex::new(Vec::new()),
            })
        }
    }

    impl SyncDispatch for RecordingDispatch {
        fn dispatch(&self, job: SyncJob) -> bool {
            self.jobs.lock().push(job);
            true
        }
    }

    fn router() -> (
        tempfile::TempDir,
        Arc<AccountStore>,
        Arc<RecordingDispatch>,
        NotificationRouter,
    ) {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(AccountStore::open_at(dir.path().join("t.db")).unwrap());
        let dispatch = RecordingDispatch::new();
        let router = NotificationRouter::new(store.clone(), dispatch.clone());
        (dir, store, dispatch, router)
    }

    fn with_credential(store: &AccountStore, id: &str) {
        store
            .update_credentials(
                id,
                &CredentialBundle {
                    access_token: None,
                    refresh_token: Some("enc:rt".to_string()),
                    token_expiry: None,
                },
            )
            .unwrap();
    }

    fn gmail_push(email: &str, history_id: u64) -> Vec<u8> {
        let change = serde_json::json!({ "emailAddress": email, "historyId": history_id });
        let data = STANDARD.encode(serde_json::to_vec(&change).unwrap());
        serde_json::to_vec(&serde_json::json!({
            "message": { "data": data, "messageId": "msg-1" },
            "subscription": "projects/storefront-prod/subscriptions/mailwatch"
        }))
        .unwrap()
    }

    #[test]
    fn validation_token_is_echoed_verbatim() {
        let (_dir, _store, _dispatch, router) = router();
        let resp = router.validation_challenge("Validation: abc+123 %7F");
        assert_eq!(resp.status, 200);
        assert_eq!(resp.content_type, "text/plain");
        assert_eq!(resp.body, "Validation: abc+123 %7F");
    }

    #[test]
    fn outlook_validation_short_circuits_before_body_parse() {
        let (_dir, _store, dispatch, router) = router();
        let resp = router.receive_outlook(Some("tok-9"), b"not json at all");
        assert_eq!(resp.status, 200);
        assert_eq!(resp.body, "tok-9");
        assert!(dispatch.jobs.lock().is_empty());
    }

    #[test]
    fn gmail_notification_dispatches_with_cursor() {
        let (_dir, store, dispatch, router) = router();
        let account = store.insert_account("a@x.com", Provider::Gmail).unwrap();
        with_credential(&store, &account.id);

        let resp = router.receive_gmail(&gmail_push("a@x.com", 764215));
        assert_eq!(resp.status, 200);

        let jobs = dispatch.jobs.lock();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].account_id, account.id);
        assert_eq!(jobs[0].cursor.as_deref(), Some("764215"));

        let loaded = store.get_account(&account.id).unwrap().unwrap();
        assert_eq!(loaded.sync.history_id.as_deref(), Some("764215"));
    }

    #[test]
    fn gmail_orphan_acked_without_dispatch() {
        let (_dir, _store, dispatch, router) = router();
        let resp = router.receive_gmail(&gmail_push("nobody@x.com", 1));
        assert_eq!(resp.status, 200);
        assert!(dispatch.jobs.lock().is_empty());
    }

    #[test]
    fn gmail_malformed_envelope_rejected() {
        let (_dir, _store, dispatch, router) = router();
        assert_eq!(router.receive_gmail(b"{\"nope\":1}").status, 400);
        assert_eq!(router.receive_gmail(b"garbage").status, 400);

        // Valid envelope, garbage base64.
        let body = serde_json::to_vec(&serde_json::json!({
            "message": { "data": "!!!not-base64!!!", "messageId": "m" }
        }))
        .unwrap();
        assert_eq!(router.receive_gmail(&body).status, 400);
        assert!(dispatch.jobs.lock().is_empty());
    }

    #[test]
    fn outlook_client_state_routes_to_account() {
        let (_dir, store, dispatch, router) = router();
        let account = store.insert_account("a@x.com", Provider::Outlook).unwrap();
        with_credential(&store, &account.id);
        store
            .store_subscription(
                &account.id,
                "axcom",
                &CreatedSubscription {
                    subscription_id: "sub-1".to_string(),
                    expiry: None,
                    cursor: None,
                },
                true,
            )
            .unwrap();

        let body = serde_json::to_vec(&serde_json::json!({
            "value": [
                { "subscriptionId": "sub-1", "clientState": "axcom", "changeType": "created" }
            ]
        }))
        .unwrap();
        let resp = router.receive_outlook(None, &body);
        assert_eq!(resp.status, 200);

        let jobs = dispatch.jobs.lock();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].account_id, account.id);
        assert_eq!(jobs[0].cursor, None);
    }

    #[test]
    fn outlook_unknown_client_state_acked_without_dispatch() {
        let (_dir, _store, dispatch, router) = router();
        let body = serde_json::to_vec(&serde_json::json!({
            "value": [ { "clientState": "zzz", "changeType": "created" } ]
        }))
        .unwrap();
        let resp = router.receive_outlook(None, &body);
        assert_eq!(resp.status, 200);
        assert!(dispatch.jobs.lock().is_empty());
    }

    #[test]
    fn outlook_malformed_body_rejected() {
        let (_dir, _store, _dispatch, router) = router();
        assert_eq!(router.receive_outlook(None, b"[not, valid").status, 400);
    }

    #[test]
    fn inactive_account_acked_without_dispatch() {
        let (_dir, store, dispatch, router) = router();
        let account = store.insert_account("a@x.com", Provider::Gmail).unwrap();
        with_credential(&store, &account.id);
        store.set_active(&account.id, false).unwrap();

        let resp = router.receive_gmail(&gmail_push("a@x.com", 5));
        assert_eq!(resp.status, 200);
        assert!(dispatch.jobs.lock().is_empty());
    }

    #[test]
    fn credential_less_account_acked_without_dispatch() {
        let (_dir, store, dispatch, router) = router();
        store.insert_account("a@x.com", Provider::Gmail).unwrap();

        let resp = router.receive_gmail(&gmail_push("a@x.com", 5));
        assert_eq!(resp.status, 200);
        assert!(dispatch.jobs.lock().is_empty());
    }

    #[test]
    fn redelivered_older_history_id_does_not_rewind_cursor() {
        let (_dir, store, dispatch, router) = router();
        let account = store.insert_account("a@x.com", Provider::Gmail).unwrap();
        with_credential(&store, &account.id);

        router.receive_gmail(&gmail_push("a@x.com", 200));
        router.receive_gmail(&gmail_push("a@x.com", 150));

        // Both dispatch (no dedupe by design), but the cursor stays put.
        assert_eq!(dispatch.jobs.lock().len(), 2);
        let loaded = store.get_account(&account.id).unwrap().unwrap();
        assert_eq!(loaded.sync.history_id.as_deref(), Some("200"));
    }
}
