use std::path::Path;

use nutrisync_core::BackendClient;
use rand::Rng;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::storage::{KvChange, StateStore, StoreError};

const SESSION_ID_KEY: &str = "identity.session_id";
const EMAIL_KEY: &str = "identity.email";
const BACKEND_ID_KEY: &str = "identity.backend_id";
const DEVICE_ID_KEY: &str = "identity.device_id";
const MACHINE_ID_PATH: &str = "/etc/machine-id";

#[derive(Debug, Error)]
pub enum IdentityError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("user id must not be empty")]
    EmptyUserId,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CurrentUser {
    pub user_id: Option<String>,
    pub user_email: Option<String>,
}

/// Sources tried by [`IdentityResolver::resolve`]. `DeviceFallback` is
/// terminal and always yields an id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolutionTier {
    Cached,
    NumericSession,
    RemoteLookup,
    DeviceFallback,
}

impl ResolutionTier {
    /// Tiers tried before the device fallback, in priority order.
    pub const LOOKUP_ORDER: [ResolutionTier; 3] = [
        ResolutionTier::Cached,
        ResolutionTier::NumericSession,
        ResolutionTier::RemoteLookup,
    ];
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedUser {
    pub id: String,
    pub tier: ResolutionTier,
}

/// Maps the locally signed-in account to the id the backend files records
/// under.
#[derive(Clone)]
pub struct IdentityResolver {
    store: StateStore,
    backend: BackendClient,
    device_override: Option<String>,
}

impl IdentityResolver {
    pub fn new(store: StateStore, backend: BackendClient) -> Self {
        Self {
            store,
            backend,
            device_override: None,
        }
    }

    pub fn with_device_id(mut self, device_id: Option<String>) -> Self {
        self.device_override = device_id.filter(|value| !value.trim().is_empty());
        self
    }

    /// Records a sign-in. Any previously cached backend id belonged to the
    /// old session and is dropped in the same transaction.
    pub async fn set_user(&self, user_id: &str, email: Option<&str>) -> Result<(), IdentityError> {
        let user_id = user_id.trim();
        if user_id.is_empty() {
            return Err(IdentityError::EmptyUserId);
        }
        let email = email.map(str::trim).filter(|value| !value.is_empty());
        let mut changes = vec![
            KvChange::Set(SESSION_ID_KEY, user_id),
            KvChange::Remove(BACKEND_ID_KEY),
        ];
        changes.push(match email {
            Some(email) => KvChange::Set(EMAIL_KEY, email),
            None => KvChange::Remove(EMAIL_KEY),
        });
        self.store.apply(&changes).await?;
        info!(user_id, has_email = email.is_some(), "user set");
        Ok(())
    }

    pub async fn clear_user(&self) -> Result<(), IdentityError> {
        self.store
            .apply(&[
                KvChange::Remove(SESSION_ID_KEY),
                KvChange::Remove(EMAIL_KEY),
                KvChange::Remove(BACKEND_ID_KEY),
            ])
            .await?;
        info!("user cleared");
        Ok(())
    }

    pub async fn current_user(&self) -> Result<CurrentUser, IdentityError> {
        Ok(CurrentUser {
            user_id: self.store.get(SESSION_ID_KEY).await?,
            user_email: self.store.get(EMAIL_KEY).await?,
        })
    }

    pub async fn cached_backend_id(&self) -> Result<Option<String>, IdentityError> {
        Ok(self.store.get(BACKEND_ID_KEY).await?)
    }

    /// Walks [`ResolutionTier::LOOKUP_ORDER`] and stops at the first tier
    /// that yields an id. A tier that fails is logged and skipped. Errors
    /// only when the device id itself cannot be read.
    pub async fn resolve(&self) -> Result<ResolvedUser, IdentityError> {
        for tier in ResolutionTier::LOOKUP_ORDER {
            match self.try_tier(tier).await {
                Ok(Some(id)) => {
                    debug!(user_id = %id, ?tier, "user resolved");
                    return Ok(ResolvedUser { id, tier });
                }
                Ok(None) => {}
                Err(err) => warn!(?tier, %err, "user id source failed, trying next"),
            }
        }
        warn!("no backend user id, falling back to device id");
        Ok(ResolvedUser {
            id: self.device_id().await?,
            tier: ResolutionTier::DeviceFallback,
        })
    }

    async fn try_tier(&self, tier: ResolutionTier) -> Result<Option<String>, IdentityError> {
        match tier {
            ResolutionTier::Cached => self.cached_backend_id().await,
            ResolutionTier::NumericSession => {
                let Some(session) = self.store.get(SESSION_ID_KEY).await? else {
                    return Ok(None);
                };
                if !is_numeric_id(&session) {
                    return Ok(None);
                }
                self.store.set(BACKEND_ID_KEY, &session).await?;
                Ok(Some(session))
            }
            ResolutionTier::RemoteLookup => {
                let Some(email) = self.store.get(EMAIL_KEY).await? else {
                    return Ok(None);
                };
                let session = self.store.get(SESSION_ID_KEY).await?;
                match self
                    .backend
                    .lookup_user_id(Some(&email), session.as_deref())
                    .await
                {
                    Ok(Some(id)) => {
                        self.store.set(BACKEND_ID_KEY, &id).await?;
                        info!(user_id = %id, "backend user id looked up");
                        Ok(Some(id))
                    }
                    Ok(None) => {
                        debug!("backend does not know this user");
                        Ok(None)
                    }
                    Err(err) => {
                        warn!(%err, "user id lookup failed");
                        Ok(None)
                    }
                }
            }
            // Terminal; `resolve` reaches it after every lookup tier.
            ResolutionTier::DeviceFallback => Ok(None),
        }
    }

    /// Stable per-installation id: the configured override, else a hash of
    /// the machine id, else random. Persisted under its own key.
    pub async fn device_id(&self) -> Result<String, IdentityError> {
        if let Some(id) = &self.device_override {
            return Ok(id.clone());
        }
        if let Some(id) = self.store.get(DEVICE_ID_KEY).await? {
            return Ok(id);
        }
        let id = match tokio::fs::read_to_string(Path::new(MACHINE_ID_PATH)).await {
            Ok(machine_id) if !machine_id.trim().is_empty() => hash_machine_id(machine_id.trim()),
            _ => random_device_id(),
        };
        self.store.set(DEVICE_ID_KEY, &id).await?;
        Ok(id)
    }
}

fn is_numeric_id(value: &str) -> bool {
    !value.is_empty() && value.bytes().all(|b| b.is_ascii_digit())
}

fn hash_machine_id(machine_id: &str) -> String {
    let digest = format!(
        "{:x}",
        Sha256::digest(format!("nutrisync:{machine_id}").as_bytes())
    );
    format!("device-{}", &digest[..32])
}

fn random_device_id() -> String {
    format!("device-{:032x}", rand::thread_rng().r#gen::<u128>())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use sqlx::SqlitePool;
    use wiremock::matchers::{body_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn make_store() -> StateStore {
        let pool = SqlitePool::connect("sqlite::memory:").await.unwrap();
        let store = StateStore::from_pool(pool);
        store.init().await.unwrap();
        store
    }

    async fn resolver(server: &MockServer) -> IdentityResolver {
        let backend = BackendClient::new(&server.uri()).unwrap();
        IdentityResolver::new(make_store().await, backend)
            .with_device_id(Some("device-test".into()))
    }

    #[test]
    fn numeric_ids_are_digits_only() {
        assert!(is_numeric_id("42"));
        assert!(!is_numeric_id(""));
        assert!(!is_numeric_id("4a2"));
        assert!(!is_numeric_id("-1"));
    }

    #[test]
    fn machine_id_hash_is_stable() {
        assert_eq!(hash_machine_id("abc"), hash_machine_id("abc"));
        assert_ne!(hash_machine_id("abc"), hash_machine_id("abd"));
        assert!(hash_machine_id("abc").starts_with("device-"));
        assert_eq!(hash_machine_id("abc").len(), "device-".len() + 32);
    }

    #[tokio::test]
    async fn set_user_is_visible_in_current_user() {
        let server = MockServer::start().await;
        let identity = resolver(&server).await;

        identity.set_user("42", Some("a@x.com")).await.unwrap();

        assert_eq!(
            identity.current_user().await.unwrap(),
            CurrentUser {
                user_id: Some("42".into()),
                user_email: Some("a@x.com".into()),
            }
        );
    }

    #[tokio::test]
    async fn numeric_session_is_cached() {
        let server = MockServer::start().await;
        let identity = resolver(&server).await;
        identity.set_user("42", None).await.unwrap();

        let first = identity.resolve().await.unwrap();
        assert_eq!(first.id, "42");
        assert_eq!(first.tier, ResolutionTier::NumericSession);

        let second = identity.resolve().await.unwrap();
        assert_eq!(second.tier, ResolutionTier::Cached);
    }

    #[tokio::test]
    async fn remote_lookup_runs_once_then_cached() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/lookup-user-id"))
            .and(body_json(json!({ "email": "a@x.com", "firebaseUid": "uid-abc" })))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(json!({ "success": true, "userId": 77 })),
            )
            .expect(1)
            .mount(&server)
            .await;
        let identity = resolver(&server).await;
        identity.set_user("uid-abc", Some("a@x.com")).await.unwrap();

        let first = identity.resolve().await.unwrap();
        let second = identity.resolve().await.unwrap();

        assert_eq!(first.id, "77");
        assert_eq!(first.tier, ResolutionTier::RemoteLookup);
        assert_eq!(second.id, "77");
        assert_eq!(second.tier, ResolutionTier::Cached);
    }

    #[tokio::test]
    async fn failed_lookup_falls_back_to_device_without_caching() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/lookup-user-id"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;
        let identity = resolver(&server).await;
        identity.set_user("uid-abc", Some("a@x.com")).await.unwrap();

        let resolved = identity.resolve().await.unwrap();

        assert_eq!(resolved.id, "device-test");
        assert_eq!(resolved.tier, ResolutionTier::DeviceFallback);
        assert_eq!(identity.cached_backend_id().await.unwrap(), None);
    }

    #[tokio::test]
    async fn clear_user_falls_through_to_device_id() {
        let server = MockServer::start().await;
        let identity = resolver(&server).await;
        identity.set_user("42", Some("a@x.com")).await.unwrap();
        assert_eq!(identity.resolve().await.unwrap().id, "42");

        identity.clear_user().await.unwrap();

        assert_eq!(identity.current_user().await.unwrap(), CurrentUser::default());
        let resolved = identity.resolve().await.unwrap();
        assert_eq!(resolved.id, "device-test");
        assert_eq!(resolved.tier, ResolutionTier::DeviceFallback);
    }

    #[tokio::test]
    async fn set_user_drops_cached_backend_id() {
        let server = MockServer::start().await;
        let identity = resolver(&server).await;
        identity.set_user("42", None).await.unwrap();
        identity.resolve().await.unwrap();
        assert_eq!(identity.cached_backend_id().await.unwrap().as_deref(), Some("42"));

        identity.set_user("43", None).await.unwrap();

        assert_eq!(identity.cached_backend_id().await.unwrap(), None);
        assert_eq!(identity.resolve().await.unwrap().id, "43");
    }

    #[tokio::test]
    async fn empty_user_id_is_rejected() {
        let server = MockServer::start().await;
        let identity = resolver(&server).await;
        assert!(matches!(
            identity.set_user("  ", None).await,
            Err(IdentityError::EmptyUserId)
        ));
    }

    #[tokio::test]
    async fn generated_device_id_is_persisted() {
        let server = MockServer::start().await;
        let backend = BackendClient::new(&server.uri()).unwrap();
        let identity = IdentityResolver::new(make_store().await, backend);

        let first = identity.device_id().await.unwrap();
        let second = identity.device_id().await.unwrap();

        assert!(first.starts_with("device-"));
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn store_failure_falls_back_to_device_id() {
        let server = MockServer::start().await;
        let backend = BackendClient::new(&server.uri()).unwrap();
        let pool = SqlitePool::connect("sqlite::memory:").await.unwrap();
        pool.close().await;
        let broken = StateStore::from_pool(pool);

        let identity = IdentityResolver::new(broken.clone(), backend.clone())
            .with_device_id(Some("device-test".into()));
        let resolved = identity.resolve().await.unwrap();
        assert_eq!(resolved.id, "device-test");
        assert_eq!(resolved.tier, ResolutionTier::DeviceFallback);

        let without_override = IdentityResolver::new(broken, backend);
        assert!(without_override.resolve().await.is_err());
    }

    #[test]
    fn random_device_ids_are_hex() {
        let id = random_device_id();
        let suffix = id.strip_prefix("device-").unwrap();
        assert_eq!(suffix.len(), 32);
        assert!(suffix.bytes().all(|b| b.is_ascii_hexdigit()));
        assert_ne!(id, random_device_id());
    }
}
