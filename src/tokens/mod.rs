use crate::{constants, models::Provider, store::TaskStore, MendError, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tracing::debug;

/// A short-lived provider access token.
///
/// The secret is reachable only through `reveal()`, and the `Debug` and
/// `Display` impls redact it, so a token can never leak through logging
/// or error formatting.
#[derive(Clone)]
pub struct AccessToken {
    secret: String,
    pub expires_at: chrono::DateTime<chrono::Utc>,
}

impl AccessToken {
    pub fn new(secret: String, expires_at: chrono::DateTime<chrono::Utc>) -> Self {
        Self { secret, expires_at }
    }

    pub fn reveal(&self) -> &str {
        &self.secret
    }

    /// Valid for at least the grace window from `now`.
    pub fn is_fresh(&self, now: chrono::DateTime<chrono::Utc>) -> bool {
        self.expires_at - now > chrono::Duration::seconds(constants::TOKEN_GRACE_SECS)
    }
}

impl fmt::Debug for AccessToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AccessToken")
            .field("secret", &"***")
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

impl fmt::Display for AccessToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("***")
    }
}

/// Resolves `(provider, organization)` to a fresh access token.
///
/// The core never stores raw tokens; it requests one per git or HTTP
/// operation and forgets it afterwards.
#[async_trait]
pub trait TokenBroker: Send + Sync {
    async fn get_token(&self, provider: Provider, organization_id: &str) -> Result<AccessToken>;

    async fn invalidate(&self, provider: Provider, organization_id: &str);
}

type BrokerKey = (Provider, String);

/// Broker that resolves an installation's `access_token_ref` as an
/// environment variable name. Refreshes coalesce per key: concurrent
/// callers for the same installation share one resolution.
pub struct EnvTokenBroker {
    store: Arc<dyn TaskStore>,
    cache: RwLock<HashMap<BrokerKey, AccessToken>>,
    refresh_locks: Mutex<HashMap<BrokerKey, Arc<Mutex<()>>>>,
    token_lifetime: chrono::Duration,
}

impl EnvTokenBroker {
    pub fn new(store: Arc<dyn TaskStore>) -> Self {
        Self {
            store,
            cache: RwLock::new(HashMap::new()),
            refresh_locks: Mutex::new(HashMap::new()),
            token_lifetime: chrono::Duration::hours(1),
        }
    }

    async fn refresh_lock(&self, key: &BrokerKey) -> Arc<Mutex<()>> {
        let mut locks = self.refresh_locks.lock().await;
        locks.entry(key.clone()).or_default().clone()
    }

    async fn resolve(&self, provider: Provider, organization_id: &str) -> Result<AccessToken> {
        let installation = self
            .store
            .installation(provider, organization_id)
            .await?
            .ok_or_else(|| MendError::TokenUnavailable {
                provider: provider.to_string(),
                organization: organization_id.to_string(),
                message: "no installation registered".to_string(),
            })?;

        let secret = std::env::var(&installation.access_token_ref).map_err(|_| {
            MendError::TokenUnavailable {
                provider: provider.to_string(),
                organization: organization_id.to_string(),
                message: format!(
                    "token reference {} is not set",
                    installation.access_token_ref
                ),
            }
        })?;

        if secret.trim().is_empty() {
            return Err(MendError::TokenUnavailable {
                provider: provider.to_string(),
                organization: organization_id.to_string(),
                message: format!("token reference {} is empty", installation.access_token_ref),
            });
        }

        Ok(AccessToken::new(
            secret,
            chrono::Utc::now() + self.token_lifetime,
        ))
    }
}

#[async_trait]
impl TokenBroker for EnvTokenBroker {
    async fn get_token(&self, provider: Provider, organization_id: &str) -> Result<AccessToken> {
        let key = (provider, organization_id.to_string());
        let now = chrono::Utc::now();

        {
            let cache = self.cache.read().await;
            if let Some(token) = cache.get(&key) {
                if token.is_fresh(now) {
                    return Ok(token.clone());
                }
            }
        }

        // One refresh per key at a time; late arrivals find the cache warm.
        let lock = self.refresh_lock(&key).await;
        let _guard = lock.lock().await;

        {
            let cache = self.cache.read().await;
            if let Some(token) = cache.get(&key) {
                if token.is_fresh(now) {
                    return Ok(token.clone());
                }
            }
        }

        debug!(provider = %provider, organization = organization_id, "Refreshing token");
        let token = self.resolve(provider, organization_id).await?;
        self.cache.write().await.insert(key, token.clone());
        Ok(token)
    }

    async fn invalidate(&self, provider: Provider, organization_id: &str) {
        let key = (provider, organization_id.to_string());
        self.cache.write().await.remove(&key);
    }
}
