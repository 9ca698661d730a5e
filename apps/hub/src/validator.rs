//! API key validator backed by the config file's key table.

use sha2::{Digest, Sha256};

use threateye_hub_server::{AuthFuture, AuthVerdict, CredentialValidator};
use threateye_protocol::messages::{AuthRequest, SubscribeRequest};

use crate::config::ApiKeyEntry;

const INVALID_KEY: &str = "Invalid API key";

/// Accepts keys whose SHA-256 digest is listed for the requested
/// organization.
#[derive(Debug, Clone, Default)]
pub struct StaticKeyValidator {
    keys: Vec<ApiKeyEntry>,
}

impl StaticKeyValidator {
    pub fn new(keys: Vec<ApiKeyEntry>) -> Self {
        if keys.is_empty() {
            tracing::warn!("no API keys configured, every connection will be rejected");
        }
        Self { keys }
    }

    fn find(&self, api_key: &str, organization_id: &str) -> Option<&ApiKeyEntry> {
        let digest = hex::encode(Sha256::digest(api_key.as_bytes()));
        self.keys.iter().find(|entry| {
            entry.organization_id == organization_id
                && entry.key_sha256.eq_ignore_ascii_case(&digest)
        })
    }

    fn check_device(&self, request: &AuthRequest) -> AuthVerdict {
        match self.find(&request.api_key, &request.organization_id) {
            Some(entry) => {
                tracing::debug!(
                    device_id = %request.device_id,
                    org = %request.organization_id,
                    key = entry.label.as_deref().unwrap_or("-"),
                    "device key accepted"
                );
                AuthVerdict::Authorized
            }
            None => AuthVerdict::Rejected(INVALID_KEY.into()),
        }
    }

    fn check_observer(&self, request: &SubscribeRequest) -> AuthVerdict {
        match self.find(&request.api_key, &request.organization_id) {
            Some(entry) if entry.observer => AuthVerdict::Authorized,
            Some(_) => AuthVerdict::Rejected("key is not allowed to observe".into()),
            None => AuthVerdict::Rejected(INVALID_KEY.into()),
        }
    }
}

impl CredentialValidator for StaticKeyValidator {
    fn validate<'a>(&'a self, request: &'a AuthRequest) -> AuthFuture<'a> {
        Box::pin(async move { self.check_device(request) })
    }

    fn validate_observer<'a>(&'a self, request: &'a SubscribeRequest) -> AuthFuture<'a> {
        Box::pin(async move { self.check_observer(request) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(org: &str, key: &str, observer: bool) -> ApiKeyEntry {
        ApiKeyEntry {
            organization_id: org.into(),
            key_sha256: hex::encode(Sha256::digest(key.as_bytes())),
            label: None,
            observer,
        }
    }

    fn device(key: &str, org: &str) -> AuthRequest {
        AuthRequest {
            api_key: key.into(),
            device_id: "d1".into(),
            user_id: "u1".into(),
            organization_id: org.into(),
        }
    }

    fn observer(key: &str, org: &str) -> SubscribeRequest {
        SubscribeRequest {
            api_key: key.into(),
            organization_id: org.into(),
        }
    }

    #[tokio::test]
    async fn device_keys_are_org_bound() {
        let v = StaticKeyValidator::new(vec![entry("org-a", "secret-a", false)]);
        assert_eq!(v.validate(&device("secret-a", "org-a")).await, AuthVerdict::Authorized);
        assert_eq!(
            v.validate(&device("secret-a", "org-b")).await,
            AuthVerdict::Rejected(INVALID_KEY.into())
        );
        assert_eq!(
            v.validate(&device("wrong", "org-a")).await,
            AuthVerdict::Rejected(INVALID_KEY.into())
        );
    }

    #[tokio::test]
    async fn uppercase_digest_matches() {
        let mut e = entry("org-a", "secret-a", false);
        e.key_sha256 = e.key_sha256.to_uppercase();
        let v = StaticKeyValidator::new(vec![e]);
        assert_eq!(v.validate(&device("secret-a", "org-a")).await, AuthVerdict::Authorized);
    }

    #[tokio::test]
    async fn observer_needs_flag() {
        let v = StaticKeyValidator::new(vec![
            entry("org-a", "device-key", false),
            entry("org-a", "admin-key", true),
        ]);
        assert_eq!(
            v.validate_observer(&observer("admin-key", "org-a")).await,
            AuthVerdict::Authorized
        );
        assert!(matches!(
            v.validate_observer(&observer("device-key", "org-a")).await,
            AuthVerdict::Rejected(_)
        ));
        assert!(matches!(
            v.validate_observer(&observer("admin-key", "org-b")).await,
            AuthVerdict::Rejected(_)
        ));
    }

    #[tokio::test]
    async fn empty_table_rejects_all() {
        let v = StaticKeyValidator::default();
        assert!(matches!(
            v.validate(&device("anything", "org-a")).await,
            AuthVerdict::Rejected(_)
        ));
    }
}
