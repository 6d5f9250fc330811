//! Error taxonomy for reconciliation.
//!
//! Errors are classified by recoverability: transient provider/network
//! failures resolve themselves on the next tick (the cron interval is the
//! backoff), while rejections and collisions need operator action. Raw
//! transport errors never reach this level; they are converted at the
//! provider-client and store boundaries.

use thiserror::Error;

use crate::credentials::CredentialError;
use crate::identity::IdentityError;
use crate::provider::ProviderError;
use crate::store::StoreError;

#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error(transparent)]
    Credential(#[from] CredentialError),

    #[error(transparent)]
    Provider(#[from] ProviderError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Identity(#[from] IdentityError),
}

impl ReconcileError {
    /// Whether waiting for the next tick is a plausible fix.
    pub fn is_retryable(&self) -> bool {
        match self {
            ReconcileError::Credential(CredentialError::RefreshFailed(_)) => true,
            ReconcileError::Credential(_) => false,
            ReconcileError::Provider(p) => p.is_transient(),
            ReconcileError::Store(_) => true,
            ReconcileError::Identity(_) => false,
        }
    }

    /// Stable failure-kind label for structured admin payloads and logs.
    pub fn kind(&self) -> &'static str {
        match self {
            ReconcileError::Credential(CredentialError::NoCredential(_)) => "credential-missing",
            ReconcileError::Credential(CredentialError::RefreshFailed(_)) => "credential-refresh",
            ReconcileError::Credential(CredentialError::ProviderRejected(_)) => {
                "credential-rejected"
            }
            ReconcileError::Provider(ProviderError::Transient(_)) => "provider-transient",
            ReconcileError::Provider(ProviderError::NotFound) => "provider-not-found",
            ReconcileError::Provider(ProviderError::Rejected { .. }) => "provider-rejected",
            ReconcileError::Store(_) => "store",
            ReconcileError::Identity(_) => "routing-collision",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_provider_errors_are_retryable() {
        let err = ReconcileError::Provider(ProviderError::Transient("503".into()));
        assert!(err.is_retryable());
        assert_eq!(err.kind(), "provider-transient");
    }

    #[test]
    fn rejections_are_not_retryable() {
        let err = ReconcileError::Provider(ProviderError::Rejected {
            status: 403,
            message: "forbidden".into(),
        });
        assert!(!err.is_retryable());
        assert_eq!(err.kind(), "provider-rejected");

        let err = ReconcileError::Credential(CredentialError::ProviderRejected("grant".into()));
        assert!(!err.is_retryable());
        assert_eq!(err.kind(), "credential-rejected");
    }

    #[test]
    fn refresh_failures_are_retryable() {
        let err = ReconcileError::Credential(CredentialError::RefreshFailed("timeout".into()));
        assert!(err.is_retryable());
    }
}
