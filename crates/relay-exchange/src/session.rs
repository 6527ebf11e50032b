//! Per-subscriber exchange sessions.
//!
//! Decrypting credentials and building a client is done at most once per
//! subscriber per process. Entries are never evicted; a restart re-derives
//! them.

use dashmap::DashMap;
use std::sync::Arc;
use tracing::info;

use relay_core::{Subscriber, SubscriberId};

use crate::client::DynExchangeClient;
use crate::credentials::{DynCredentialStore, SecretKey};
use crate::error::{ExchangeError, ExchangeResult};

/// Builds an exchange client from decrypted credentials.
pub trait SessionFactory: Send + Sync {
    fn connect(&self, subscriber: &Subscriber, key: SecretKey)
        -> ExchangeResult<DynExchangeClient>;
}

pub type DynSessionFactory = Arc<dyn SessionFactory>;

/// Lazily populated map from subscriber to exchange client.
pub struct SessionCache {
    sessions: DashMap<SubscriberId, DynExchangeClient>,
    credentials: DynCredentialStore,
    factory: DynSessionFactory,
}

impl SessionCache {
    pub fn new(credentials: DynCredentialStore, factory: DynSessionFactory) -> Self {
        Self {
            sessions: DashMap::new(),
            credentials,
            factory,
        }
    }

    /// Cached client for the subscriber, connecting on first use.
    ///
    /// # Errors
    /// `ExchangeError::Credentials` when no credentials are configured or
    /// they fail to decrypt; any error from the session factory.
    pub fn get_or_connect(&self, subscriber: &Subscriber) -> ExchangeResult<DynExchangeClient> {
        if let Some(client) = self.sessions.get(&subscriber.id) {
            return Ok(Arc::clone(client.value()));
        }

        let blob = subscriber
            .encrypted_credentials
            .as_deref()
            .filter(|blob| !blob.is_empty())
            .ok_or_else(|| ExchangeError::Credentials("no credentials configured".to_string()))?;

        let key = self
            .credentials
            .decrypt(blob)
            .ok_or_else(|| ExchangeError::Credentials("failed to decrypt credentials".to_string()))?;

        let client = self.factory.connect(subscriber, key)?;
        info!(
            subscriber = %subscriber.short_key(),
            account = %client.account(),
            "Exchange session created"
        );

        // Concurrent first use: keep whichever client landed first.
        let entry = self.sessions.entry(subscriber.id).or_insert(client);
        Ok(Arc::clone(entry.value()))
    }

    pub fn contains(&self, id: SubscriberId) -> bool {
        self.sessions.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::HexKeyCredentialStore;
    use crate::paper::{PaperMarket, PaperSessionFactory};
    use rust_decimal_macros::dec;

    const KEY: &str = "0x4c0883a69102937d6231471b5dbb6204fe5129617082792ae468d01a3f362318";

    fn cache() -> (SessionCache, Arc<PaperSessionFactory>) {
        let factory = Arc::new(PaperSessionFactory::new(
            Arc::new(PaperMarket::new()),
            dec!(10000),
        ));
        let cache = SessionCache::new(Arc::new(HexKeyCredentialStore), factory.clone());
        (cache, factory)
    }

    fn subscriber(id: i64, creds: Option<&str>) -> Subscriber {
        let mut sub = Subscriber::new(SubscriberId(id), format!("rk_{id}"));
        sub.encrypted_credentials = creds.map(|c| c.as_bytes().to_vec());
        sub
    }

    #[test]
    fn test_session_is_created_once() {
        let (cache, factory) = cache();
        let sub = subscriber(1, Some(KEY));

        let first = cache.get_or_connect(&sub).unwrap();
        let second = cache.get_or_connect(&sub).unwrap();

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(cache.len(), 1);
        assert_eq!(factory.connect_count(), 1);
    }

    #[test]
    fn test_missing_or_bad_credentials() {
        let (cache, _) = cache();

        let err = cache.get_or_connect(&subscriber(1, None)).err().unwrap();
        assert!(matches!(err, ExchangeError::Credentials(_)));

        let err = cache
            .get_or_connect(&subscriber(2, Some("garbage")))
            .err()
            .unwrap();
        assert!(matches!(err, ExchangeError::Credentials(_)));
        assert!(cache.is_empty());
    }

    #[test]
    fn test_sessions_are_kept_per_subscriber() {
        let (cache, factory) = cache();
        let first = subscriber(3, Some(KEY));
        let second = subscriber(4, Some(KEY));
        cache.get_or_connect(&first).unwrap();
        cache.get_or_connect(&second).unwrap();
        cache.get_or_connect(&first).unwrap();

        assert!(cache.contains(first.id) && cache.contains(second.id));
        assert!(!cache.contains(SubscriberId(5)));
        assert_eq!(cache.len(), 2);
        assert_eq!(factory.connect_count(), 2);
    }
}
