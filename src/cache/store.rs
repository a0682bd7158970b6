use super::entry::{CacheEntry, QueryStatus};
use crate::config::MIN_CACHING;
use crate::equality::Equality;
use crate::error::QueryError;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, RwLock};
use tracing::{debug, warn};

/// Identifier distinguishing concurrently-cached results of one query under
/// different parameters.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum CacheKey {
    /// The reserved slot used when per-parameter caching is disabled and for
    /// parameterless fetches.
    Init,
    /// Output of the key-derivation policy.
    Derived(String),
}

/// Shared handle to a [`CacheStore`], the unit of keep-alive hand-off.
pub type CacheHandle<A> = Arc<CacheStore<A>>;

/// Capacity-bounded, key-addressed collection of cache entries.
///
/// The store owns the watch channel every subscription reads. Whichever entry
/// is active is the one published, so `select`/`status` streams forward
/// through key switches without resubscribing. `pause` gates publication for
/// keep-alive hand-off; `destroy` drops the channel, completing all streams.
pub struct CacheStore<A> {
    alive: AtomicBool,
    inner: RwLock<StoreInner<A>>,
}

struct StoreInner<A> {
    entries: HashMap<CacheKey, CacheEntry<A>>,
    active: CacheKey,
    /// Monotonic activation clock backing least-recently-activated eviction.
    clock: u64,
    max: usize,
    init_state: A,
    paused: bool,
    state_tx: Option<watch::Sender<QueryStatus<A>>>,
    state_rx: watch::Receiver<QueryStatus<A>>,
}

impl<A> StoreInner<A> {
    fn capacity(&self) -> usize {
        if self.max == 0 {
            MIN_CACHING
        } else {
            self.max.max(MIN_CACHING)
        }
    }
}

impl<A> CacheStore<A>
where
    A: Clone + Send + Sync + 'static,
{
    #[must_use]
    pub fn new(max: usize, init_state: A) -> CacheHandle<A> {
        let (state_tx, state_rx) = watch::channel(QueryStatus::seeded(init_state.clone()));
        let mut entries = HashMap::new();
        entries.insert(CacheKey::Init, CacheEntry::new(init_state.clone(), 0));
        Arc::new(Self {
            alive: AtomicBool::new(true),
            inner: RwLock::new(StoreInner {
                entries,
                active: CacheKey::Init,
                clock: 0,
                max,
                init_state,
                paused: false,
                state_tx: Some(state_tx),
                state_rx,
            }),
        })
    }

    /// Return the entry for `key`, creating it seeded with the initial value
    /// if absent, and mark it active. Creating beyond capacity first evicts
    /// the least-recently-activated non-active entry.
    pub async fn create_and_switch(&self, key: CacheKey) {
        if !self.alive() {
            warn!("create_and_switch on destroyed store ignored");
            return;
        }
        let mut inner = self.inner.write().await;
        inner.clock += 1;
        let stamp = inner.clock;
        if let Some(entry) = inner.entries.get_mut(&key) {
            entry.activate(stamp);
        } else {
            if inner.entries.len() >= inner.capacity() {
                let active = inner.active.clone();
                let victim = inner
                    .entries
                    .iter()
                    .filter(|(candidate, _)| **candidate != active)
                    .min_by_key(|(_, entry)| entry.activated_at())
                    .map(|(candidate, _)| candidate.clone())
                    .or_else(|| inner.entries.keys().next().cloned());
                if let Some(victim) = victim {
                    inner.entries.remove(&victim);
                    debug!("🗑️ evicted cache entry: {victim:?}");
                }
            }
            let seed = inner.init_state.clone();
            inner.entries.insert(key.clone(), CacheEntry::new(seed, stamp));
        }
        debug!("🎯 cache switch: {key:?}");
        inner.active = key;
        Self::publish_active(&inner);
    }

    pub async fn prepare_fetching(&self, key: &CacheKey) {
        let mut inner = self.inner.write().await;
        if let Some(entry) = inner.entries.get_mut(key) {
            entry.prepare_fetching();
            if inner.active == *key {
                Self::publish_active(&inner);
            }
        }
    }

    pub async fn commit_success(&self, key: &CacheKey, data: A) {
        let mut inner = self.inner.write().await;
        match inner.entries.get_mut(key) {
            Some(entry) => {
                entry.on_success(data);
                if inner.active == *key {
                    Self::publish_active(&inner);
                }
            }
            None => debug!("💨 success for evicted entry discarded: {key:?}"),
        }
    }

    pub async fn commit_error(&self, key: &CacheKey, error: QueryError, is_refetch: bool) {
        let mut inner = self.inner.write().await;
        match inner.entries.get_mut(key) {
            Some(entry) => {
                entry.on_error(error, is_refetch);
                if inner.active == *key {
                    Self::publish_active(&inner);
                }
            }
            None => debug!("💨 error for evicted entry discarded: {key:?}"),
        }
    }

    /// Apply `f` to the active entry's data, publishing when it changed under
    /// the comparator. `only_trusted` rejects mutation while the entry is
    /// loading or untrusted. Returns whether application was attempted.
    pub async fn mutate_active<F>(&self, f: F, is_equal: &dyn Equality<A>, only_trusted: bool) -> bool
    where
        F: FnOnce(A) -> A,
    {
        let mut inner = self.inner.write().await;
        let active = inner.active.clone();
        let Some(entry) = inner.entries.get_mut(&active) else {
            return false;
        };
        if only_trusted && (entry.status().loading || entry.status().untrusted_data) {
            return false;
        }
        if entry.on_mutate(f, is_equal) {
            Self::publish_active(&inner);
        }
        true
    }

    /// Whether the active entry is untrusted or its last success is older
    /// than `max_age`.
    pub async fn active_is_stale(&self, max_age: Duration) -> bool {
        let inner = self.inner.read().await;
        inner
            .entries
            .get(&inner.active)
            .is_none_or(|entry| entry.is_stale(max_age))
    }

    /// A receiver over the active entry's status. Key switches republish, so
    /// one subscription follows the active entry across switches.
    pub async fn subscribe(&self) -> watch::Receiver<QueryStatus<A>> {
        self.inner.read().await.state_rx.clone()
    }

    /// Suspend publication, preserving entry contents.
    pub async fn pause(&self) {
        self.inner.write().await.paused = true;
        debug!("cache store paused");
    }

    /// Resume publication and republish the active entry.
    pub async fn restart(&self) {
        let mut inner = self.inner.write().await;
        inner.paused = false;
        Self::publish_active(&inner);
        debug!("cache store restarted");
    }

    /// Drop all but the reserved entry and reseed it to the initial value.
    pub async fn reset(&self) {
        let mut inner = self.inner.write().await;
        inner.clock += 1;
        let stamp = inner.clock;
        let seed = inner.init_state.clone();
        inner.entries.clear();
        inner.entries.insert(CacheKey::Init, CacheEntry::new(seed, stamp));
        inner.active = CacheKey::Init;
        Self::publish_active(&inner);
    }

    /// Irreversibly release all entries and complete every subscription.
    pub async fn destroy(&self) {
        self.alive.store(false, Ordering::SeqCst);
        let mut inner = self.inner.write().await;
        inner.entries.clear();
        inner.state_tx = None;
        debug!("cache store destroyed");
    }

    /// Whether the store is in a usable, non-destroyed state.
    #[must_use]
    pub fn alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    pub async fn entry_count(&self) -> usize {
        self.inner.read().await.entries.len()
    }

    fn publish_active(inner: &StoreInner<A>) {
        if inner.paused {
            return;
        }
        let Some(state_tx) = &inner.state_tx else {
            return;
        };
        if let Some(entry) = inner.entries.get(&inner.active) {
            state_tx.send_replace(entry.status().clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::equality::DefaultEquality;

    fn derived(key: &str) -> CacheKey {
        CacheKey::Derived(key.to_string())
    }

    #[tokio::test]
    async fn test_switch_creates_and_publishes_seeded_entry() {
        let store = CacheStore::new(2, 0);
        let rx = store.subscribe().await;
        assert!(rx.borrow().untrusted_data);

        store.create_and_switch(derived("a")).await;
        store.commit_success(&derived("a"), 5).await;
        assert_eq!(rx.borrow().data, 5);

        store.create_and_switch(derived("b")).await;
        assert_eq!(rx.borrow().data, 0, "new entry is seeded from the initial value");
        assert!(rx.borrow().untrusted_data);

        store.create_and_switch(derived("a")).await;
        assert_eq!(rx.borrow().data, 5, "switching back republishes the cached entry");
    }

    #[tokio::test]
    async fn test_capacity_evicts_least_recently_activated() {
        let store = CacheStore::new(2, 0);
        store.create_and_switch(derived("a")).await;
        store.commit_success(&derived("a"), 1).await;
        store.create_and_switch(derived("b")).await;
        assert_eq!(store.entry_count().await, 2);

        // "a" is the least recently activated non-active entry
        store.create_and_switch(derived("c")).await;
        assert_eq!(store.entry_count().await, 2);

        // the evicted entry's data is unrecoverable
        store.create_and_switch(derived("a")).await;
        let rx = store.subscribe().await;
        assert_eq!(rx.borrow().data, 0);
        assert!(rx.borrow().untrusted_data);
    }

    #[tokio::test]
    async fn test_commit_for_evicted_key_is_discarded() {
        let store = CacheStore::new(2, 0);
        store.create_and_switch(derived("a")).await;
        store.create_and_switch(derived("b")).await;
        store.create_and_switch(derived("c")).await;

        store.commit_success(&derived("a"), 9).await;
        let rx = store.subscribe().await;
        assert_ne!(rx.borrow().data, 9);
        assert_eq!(store.entry_count().await, 2);
    }

    #[tokio::test]
    async fn test_reset_restores_single_seeded_entry() {
        let store = CacheStore::new(3, 0);
        store.create_and_switch(derived("a")).await;
        store.commit_success(&derived("a"), 7).await;
        store.create_and_switch(derived("b")).await;

        store.reset().await;
        assert_eq!(store.entry_count().await, 1);
        let rx = store.subscribe().await;
        assert_eq!(rx.borrow().data, 0);
        assert!(rx.borrow().untrusted_data);
        assert_eq!(rx.borrow().ts, 0);
    }

    #[tokio::test]
    async fn test_pause_gates_publication_and_restart_republishes() {
        let store = CacheStore::new(0, 0);
        let rx = store.subscribe().await;

        store.pause().await;
        store.commit_success(&CacheKey::Init, 5).await;
        assert_eq!(rx.borrow().data, 0, "paused store publishes nothing");

        store.restart().await;
        assert_eq!(rx.borrow().data, 5, "restart republishes the active entry");
        assert!(store.alive());
    }

    #[tokio::test]
    async fn test_destroy_completes_subscriptions() {
        let store = CacheStore::new(0, 0);
        let mut rx = store.subscribe().await;

        store.destroy().await;
        assert!(!store.alive());
        assert!(rx.changed().await.is_err(), "channel completes on destroy");
    }

    #[tokio::test]
    async fn test_guarded_mutation_rejects_untrusted_and_loading() {
        let store = CacheStore::new(0, 0);
        assert!(
            !store.mutate_active(|d| d + 1, &DefaultEquality, true).await,
            "untrusted data rejects guarded mutation"
        );
        assert!(store.mutate_active(|d| d + 1, &DefaultEquality, false).await);

        store.commit_success(&CacheKey::Init, 5).await;
        store.prepare_fetching(&CacheKey::Init).await;
        assert!(!store.mutate_active(|d| d + 1, &DefaultEquality, true).await);

        store.commit_success(&CacheKey::Init, 6).await;
        assert!(store.mutate_active(|d| d + 1, &DefaultEquality, true).await);
        let rx = store.subscribe().await;
        assert_eq!(rx.borrow().data, 7);
    }
}
