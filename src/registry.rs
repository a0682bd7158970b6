/**
Named-store registry: owns the notifier sources, hands out typed store
handles, and parks keep-alive caches between owners.

The registry is the single writer for keep-alive hand-off: a parked cache is
removed when a new registration under the same key consumes it, and a store's
teardown (via `unregister` or a direct `destroy`) is what parks it.
*/
use crate::cache::store::CacheHandle;
use crate::config::{QueryOptions, QueryParam, DESTROY_CHANNEL_CAPACITY};
use crate::error::{Error, Result};
use crate::notifier::Notifier;
use crate::query::Query;
use crate::static_store::StaticStore;
use async_trait::async_trait;
use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, watch, Mutex};
use tracing::{debug, info, warn};

/// Store-side surface the registry needs for lifecycle forwarding.
#[async_trait]
trait RegisteredStore: Send + Sync {
    async fn teardown(&self);
    fn parked_cache(&self) -> Option<Box<dyn Any + Send + Sync>>;
    fn defunct(&self) -> bool;
}

#[async_trait]
impl<A, P> RegisteredStore for Query<A, P>
where
    A: Clone + Send + Sync + 'static,
    P: QueryParam,
{
    async fn teardown(&self) {
        self.destroy().await;
    }

    fn parked_cache(&self) -> Option<Box<dyn Any + Send + Sync>> {
        self.keep_alived_state()
            .map(|cache| Box::new(cache) as Box<dyn Any + Send + Sync>)
    }

    fn defunct(&self) -> bool {
        self.destroyed()
    }
}

#[async_trait]
impl<A, P> RegisteredStore for StaticStore<A, P>
where
    A: Clone + Send + Sync + 'static,
    P: QueryParam,
{
    async fn teardown(&self) {
        self.destroy().await;
    }

    fn parked_cache(&self) -> Option<Box<dyn Any + Send + Sync>> {
        None
    }

    fn defunct(&self) -> bool {
        self.destroyed()
    }
}

struct Registered {
    store: Arc<dyn RegisteredStore>,
    any: Arc<dyn Any + Send + Sync>,
}

#[derive(Default)]
struct RegistryInner {
    stores: HashMap<String, Registered>,
    parked: HashMap<String, Box<dyn Any + Send + Sync>>,
}

/// Registry mapping store keys to live stores, with keep-alive cache parking
/// and the environment signal sources every store's notifier reads.
pub struct StoreRegistry {
    inner: Arc<Mutex<RegistryInner>>,
    online_tx: watch::Sender<bool>,
    visibility_tx: watch::Sender<bool>,
    destroy_tx: mpsc::Sender<String>,
}

impl Default for StoreRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl StoreRegistry {
    /// A registry seeded visible and online.
    #[must_use]
    pub fn new() -> Self {
        Self::with_state(true, true)
    }

    /// A registry whose signals are seeded from the environment's current
    /// visibility and connectivity.
    #[must_use]
    pub fn with_state(visible: bool, online: bool) -> Self {
        let (visibility_tx, _) = watch::channel(visible);
        let (online_tx, _) = watch::channel(online);
        let (destroy_tx, mut destroy_rx) = mpsc::channel(DESTROY_CHANNEL_CAPACITY);
        let inner = Arc::new(Mutex::new(RegistryInner::default()));

        // reap stores destroyed without going through unregister
        let reaped = Arc::clone(&inner);
        tokio::spawn(async move {
            while let Some(key) = destroy_rx.recv().await {
                let mut inner = reaped.lock().await;
                let destroyed = inner.stores.get(&key).is_some_and(|r| r.store.defunct());
                if !destroyed {
                    continue;
                }
                if let Some(registered) = inner.stores.remove(&key) {
                    match registered.store.parked_cache() {
                        Some(cache) => {
                            debug!("🅿️ keep-alive cache parked: {key}");
                            inner.parked.insert(key, cache);
                        }
                        None => {
                            inner.parked.remove(&key);
                        }
                    }
                }
            }
        });

        Self {
            inner,
            online_tx,
            visibility_tx,
            destroy_tx,
        }
    }

    /// The notifier handed to every store this registry builds. Also usable
    /// for standalone stores that should follow the registry's signals.
    #[must_use]
    pub fn notifier(&self) -> Notifier {
        Notifier {
            destroy: self.destroy_tx.clone(),
            online: self.online_tx.subscribe(),
            visibility: self.visibility_tx.subscribe(),
        }
    }

    /// Feed the visibility signal; duplicate values are suppressed.
    pub fn set_visible(&self, visible: bool) {
        self.visibility_tx.send_if_modified(|current| {
            if *current == visible {
                false
            } else {
                *current = visible;
                true
            }
        });
    }

    /// Feed the connectivity signal; every emission is forwarded.
    pub fn set_online(&self, online: bool) {
        self.online_tx.send_replace(online);
    }

    /// Build and register a [`Query`] under its configured key. A parked
    /// keep-alive cache for the key is handed to the new instance.
    /// Re-registering a live key warns and returns the existing store.
    ///
    /// # Errors
    ///
    /// Returns [`Error::WrongStoreType`] when the key is already registered
    /// with different data or parameter types.
    pub async fn register_query<A, P>(
        &self,
        options: QueryOptions<A, P>,
    ) -> Result<Arc<Query<A, P>>>
    where
        A: Clone + Send + Sync + 'static,
        P: QueryParam,
    {
        let key = options.key().to_string();
        let mut inner = self.inner.lock().await;
        if let Some(existing) = inner.stores.get(&key) {
            warn!("store already registered, returning the existing one: {key}");
            return Arc::clone(&existing.any)
                .downcast::<Query<A, P>>()
                .map_err(|_| Error::WrongStoreType { key });
        }
        let parked = inner.parked.remove(&key).and_then(|cache| {
            match cache.downcast::<CacheHandle<A>>() {
                Ok(cache) => Some(*cache),
                Err(_) => {
                    warn!("parked cache type mismatch, dropping: {key}");
                    None
                }
            }
        });
        let query = Arc::new(Query::with_cache(options, self.notifier(), parked));
        info!("query store registered: {key}");
        inner.stores.insert(
            key,
            Registered {
                store: query.clone(),
                any: query.clone(),
            },
        );
        Ok(query)
    }

    /// Build and register a [`StaticStore`] under its configured key.
    /// Re-registering a live key warns and returns the existing store.
    ///
    /// # Errors
    ///
    /// Returns [`Error::WrongStoreType`] when the key is already registered
    /// with different data or parameter types.
    pub async fn register_static<A, P>(
        &self,
        options: QueryOptions<A, P>,
    ) -> Result<Arc<StaticStore<A, P>>>
    where
        A: Clone + Send + Sync + 'static,
        P: QueryParam,
    {
        let key = options.key().to_string();
        let mut inner = self.inner.lock().await;
        if let Some(existing) = inner.stores.get(&key) {
            warn!("store already registered, returning the existing one: {key}");
            return Arc::clone(&existing.any)
                .downcast::<StaticStore<A, P>>()
                .map_err(|_| Error::WrongStoreType { key });
        }
        let store = Arc::new(StaticStore::new(options, self.notifier()));
        info!("static store registered: {key}");
        inner.stores.insert(
            key,
            Registered {
                store: store.clone(),
                any: store.clone(),
            },
        );
        Ok(store)
    }

    /// Typed lookup of a registered [`Query`].
    ///
    /// # Errors
    ///
    /// [`Error::MissingStore`] when nothing is registered under `key`;
    /// [`Error::WrongStoreType`] when the registered store has different
    /// types.
    pub async fn query<A, P>(&self, key: &str) -> Result<Arc<Query<A, P>>>
    where
        A: Clone + Send + Sync + 'static,
        P: QueryParam,
    {
        let inner = self.inner.lock().await;
        let registered = inner.stores.get(key).ok_or_else(|| Error::MissingStore {
            key: key.to_string(),
        })?;
        Arc::clone(&registered.any)
            .downcast::<Query<A, P>>()
            .map_err(|_| Error::WrongStoreType {
                key: key.to_string(),
            })
    }

    /// Typed lookup of a registered [`StaticStore`].
    ///
    /// # Errors
    ///
    /// [`Error::MissingStore`] when nothing is registered under `key`;
    /// [`Error::WrongStoreType`] when the registered store has different
    /// types.
    pub async fn static_store<A, P>(&self, key: &str) -> Result<Arc<StaticStore<A, P>>>
    where
        A: Clone + Send + Sync + 'static,
        P: QueryParam,
    {
        let inner = self.inner.lock().await;
        let registered = inner.stores.get(key).ok_or_else(|| Error::MissingStore {
            key: key.to_string(),
        })?;
        Arc::clone(&registered.any)
            .downcast::<StaticStore<A, P>>()
            .map_err(|_| Error::WrongStoreType {
                key: key.to_string(),
            })
    }

    pub async fn has(&self, key: &str) -> bool {
        self.inner.lock().await.stores.contains_key(key)
    }

    /// Destroy the store registered under `key`, parking its keep-alive
    /// cache (or dropping a previously parked one).
    ///
    /// # Errors
    ///
    /// Returns [`Error::MissingStore`] when nothing is registered under
    /// `key`.
    pub async fn unregister(&self, key: &str) -> Result<()> {
        let registered = {
            let mut inner = self.inner.lock().await;
            inner.stores.remove(key).ok_or_else(|| Error::MissingStore {
                key: key.to_string(),
            })?
        };
        registered.store.teardown().await;
        let mut inner = self.inner.lock().await;
        match registered.store.parked_cache() {
            Some(cache) => {
                info!("🅿️ keep-alive cache parked: {key}");
                inner.parked.insert(key.to_string(), cache);
            }
            None => {
                inner.parked.remove(key);
            }
        }
        Ok(())
    }
}
