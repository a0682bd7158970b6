/**
 * Configuration constants and option normalization for query stores.
 */
use crate::cache::store::CacheKey;
use crate::equality::{DefaultEquality, Equality};
use crate::error::QueryError;
use futures::future::{BoxFuture, FutureExt};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Retry attempts after the initial failed invocation
pub const DEFAULT_RETRY: u32 = 2;

/// Delay between retry attempts in milliseconds
pub const DEFAULT_RETRY_DELAY_MS: u64 = 2_000;

/// Refetch interval in milliseconds, restarted on every successful fetch
pub const DEFAULT_REFETCH_INTERVAL_MS: u64 = 60_000;

/// Floor for the refetch interval in milliseconds
pub const MIN_REFETCH_INTERVAL_MS: u64 = 2_000;

/// Tolerated background age before a reconnect/emerge forces a refetch
pub const DEFAULT_BACKGROUND_STALE_MS: u64 = 300_000;

/// Default number of distinct cache keys (0 disables per-parameter caching)
pub const DEFAULT_CACHING: usize = 0;

/// Reserved floor so the single-slot mode always has a home
pub const MIN_CACHING: usize = 1;

/// Ceiling for distinct cache keys
pub const MAX_CACHING: usize = 50;

/// Settle delay between a came-back signal and the refetch it triggers
pub const RECONNECT_SETTLE_MS: u64 = 200;

/// Buffer size for status/select stream channels
pub const STREAM_CHANNEL_CAPACITY: usize = 32;

/// Buffer size for the per-store trigger/reset event channel
pub const EVENT_CHANNEL_CAPACITY: usize = 100;

/// Buffer size for the destroy-notification channel
pub const DESTROY_CHANNEL_CAPACITY: usize = 16;

/// Validate configuration constants at compile time
const _: () = {
    assert!(MIN_REFETCH_INTERVAL_MS > 0, "MIN_REFETCH_INTERVAL_MS must be greater than 0");
    assert!(
        DEFAULT_REFETCH_INTERVAL_MS >= MIN_REFETCH_INTERVAL_MS,
        "DEFAULT_REFETCH_INTERVAL_MS must not undercut the floor"
    );
    assert!(MIN_CACHING >= 1, "MIN_CACHING must be at least 1");
    assert!(MAX_CACHING >= MIN_CACHING, "MAX_CACHING must cover the floor");
    assert!(STREAM_CHANNEL_CAPACITY > 0, "STREAM_CHANNEL_CAPACITY must be greater than 0");
    assert!(EVENT_CHANNEL_CAPACITY > 0, "EVENT_CHANNEL_CAPACITY must be greater than 0");
    assert!(DESTROY_CHANNEL_CAPACITY > 0, "DESTROY_CHANNEL_CAPACITY must be greater than 0");
};

/// Type-erased query function: one asynchronous invocation per fetch param.
pub type QueryFn<A, P> =
    Arc<dyn Fn(Option<P>) -> BoxFuture<'static, core::result::Result<A, QueryError>> + Send + Sync>;

/// Cache-key derivation function supplied through the options.
pub type KeyFn<P> = Arc<dyn Fn(&P) -> String + Send + Sync>;

/// Fetch parameter contract.
///
/// `cache_key` is the explicit override slot: when it returns `Some`, it takes
/// precedence over the configured derivation function. The default falls
/// through to derivation (or the param's canonical `Debug` rendering).
pub trait QueryParam: Clone + fmt::Debug + Send + Sync + 'static {
    fn cache_key(&self) -> Option<String> {
        None
    }
}

macro_rules! plain_query_param {
    ($($t:ty),* $(,)?) => {
        $(impl QueryParam for $t {})*
    };
}

plain_query_param!((), bool, char, String, &'static str, i16, i32, i64, u16, u32, u64, usize, isize);

/// User-facing, partially-specified store options. Normalized into a
/// [`QueryConfig`] at construction; unset fields take system defaults.
pub struct QueryOptions<A, P> {
    key: String,
    init_state: A,
    query: QueryFn<A, P>,
    is_equal: Arc<dyn Equality<A>>,
    retry: Option<u32>,
    retry_delay: Option<Duration>,
    refetch_on_reconnect: bool,
    refetch_on_emerge: bool,
    refetch_interval: Option<Duration>,
    background_stale_time: Option<Duration>,
    background_refetch: bool,
    keep_alive: bool,
    param_to_cache_key: Option<KeyFn<P>>,
    caching: Option<usize>,
    prefetch: Option<Option<P>>,
}

impl<A, P> QueryOptions<A, P>
where
    A: Clone + PartialEq + Send + Sync + 'static,
    P: QueryParam,
{
    pub fn new<F, Fut>(key: impl Into<String>, init_state: A, query: F) -> Self
    where
        F: Fn(Option<P>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = core::result::Result<A, QueryError>> + Send + 'static,
    {
        Self {
            key: key.into(),
            init_state,
            query: Arc::new(move |param| query(param).boxed()),
            is_equal: Arc::new(DefaultEquality),
            retry: None,
            retry_delay: None,
            refetch_on_reconnect: false,
            refetch_on_emerge: false,
            refetch_interval: None,
            background_stale_time: None,
            background_refetch: false,
            keep_alive: false,
            param_to_cache_key: None,
            caching: None,
            prefetch: None,
        }
    }
}

impl<A, P> QueryOptions<A, P> {
    #[must_use]
    pub fn key(&self) -> &str {
        &self.key
    }

    #[must_use]
    pub fn equality(mut self, is_equal: impl Equality<A>) -> Self {
        self.is_equal = Arc::new(is_equal);
        self
    }

    #[must_use]
    pub fn retry(mut self, retry: u32) -> Self {
        self.retry = Some(retry);
        self
    }

    #[must_use]
    pub fn retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = Some(delay);
        self
    }

    #[must_use]
    pub fn refetch_on_reconnect(mut self, enabled: bool) -> Self {
        self.refetch_on_reconnect = enabled;
        self
    }

    #[must_use]
    pub fn refetch_on_emerge(mut self, enabled: bool) -> Self {
        self.refetch_on_emerge = enabled;
        self
    }

    #[must_use]
    pub fn refetch_interval(mut self, interval: Duration) -> Self {
        self.refetch_interval = Some(interval);
        self
    }

    #[must_use]
    pub fn background_stale_time(mut self, stale: Duration) -> Self {
        self.background_stale_time = Some(stale);
        self
    }

    #[must_use]
    pub fn background_refetch(mut self, enabled: bool) -> Self {
        self.background_refetch = enabled;
        self
    }

    #[must_use]
    pub fn keep_alive(mut self, enabled: bool) -> Self {
        self.keep_alive = enabled;
        self
    }

    #[must_use]
    pub fn param_to_cache_key(mut self, derive: impl Fn(&P) -> String + Send + Sync + 'static) -> Self {
        self.param_to_cache_key = Some(Arc::new(derive));
        self
    }

    #[must_use]
    pub fn caching(mut self, max_keys: usize) -> Self {
        self.caching = Some(max_keys);
        self
    }

    /// Perform a fetch with this param as part of store construction.
    #[must_use]
    pub fn prefetch(mut self, param: Option<P>) -> Self {
        self.prefetch = Some(param);
        self
    }

    pub(crate) fn normalize(self) -> QueryConfig<A, P> {
        let refetch_interval = self
            .refetch_interval
            .unwrap_or(Duration::from_millis(DEFAULT_REFETCH_INTERVAL_MS))
            .max(Duration::from_millis(MIN_REFETCH_INTERVAL_MS));
        QueryConfig {
            key: self.key,
            init_state: self.init_state,
            query: self.query,
            is_equal: self.is_equal,
            retry: self.retry.unwrap_or(DEFAULT_RETRY),
            retry_delay: self
                .retry_delay
                .unwrap_or(Duration::from_millis(DEFAULT_RETRY_DELAY_MS)),
            refetch_on_reconnect: self.refetch_on_reconnect,
            refetch_on_emerge: self.refetch_on_emerge,
            refetch_interval,
            background_stale_time: self
                .background_stale_time
                .unwrap_or(Duration::from_millis(DEFAULT_BACKGROUND_STALE_MS)),
            background_refetch: self.background_refetch,
            keep_alive: self.keep_alive,
            param_to_cache_key: self.param_to_cache_key,
            caching: self.caching.unwrap_or(DEFAULT_CACHING).min(MAX_CACHING),
            prefetch: self.prefetch,
        }
    }
}

/// Fully-defaulted configuration, every duration normalized to milliseconds.
pub(crate) struct QueryConfig<A, P> {
    pub key: String,
    pub init_state: A,
    pub query: QueryFn<A, P>,
    pub is_equal: Arc<dyn Equality<A>>,
    pub retry: u32,
    pub retry_delay: Duration,
    pub refetch_on_reconnect: bool,
    pub refetch_on_emerge: bool,
    pub refetch_interval: Duration,
    pub background_stale_time: Duration,
    pub background_refetch: bool,
    pub keep_alive: bool,
    pub param_to_cache_key: Option<KeyFn<P>>,
    pub caching: usize,
    pub prefetch: Option<Option<P>>,
}

impl<A, P> QueryConfig<A, P>
where
    P: QueryParam,
{
    /// Key derivation priority: capacity 0 routes everything to the reserved
    /// slot, then the param's own override, then the configured derivation,
    /// then the param's canonical rendering. No param addresses the reserved
    /// slot as well.
    pub fn cache_key(&self, param: Option<&P>) -> CacheKey {
        if self.caching == 0 {
            return CacheKey::Init;
        }
        let Some(param) = param else {
            return CacheKey::Init;
        };
        if let Some(key) = param.cache_key() {
            return CacheKey::Derived(key);
        }
        if let Some(derive) = &self.param_to_cache_key {
            return CacheKey::Derived(derive(param));
        }
        CacheKey::Derived(format!("{param:?}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn options() -> QueryOptions<i32, String> {
        QueryOptions::new("test", 0, |_param: Option<String>| async { Ok(1) })
    }

    #[test]
    fn test_defaults_applied() {
        let config = options().normalize();
        assert_eq!(config.retry, DEFAULT_RETRY);
        assert_eq!(config.retry_delay, Duration::from_millis(DEFAULT_RETRY_DELAY_MS));
        assert_eq!(
            config.refetch_interval,
            Duration::from_millis(DEFAULT_REFETCH_INTERVAL_MS)
        );
        assert_eq!(config.caching, DEFAULT_CACHING);
        assert!(!config.keep_alive);
    }

    #[test]
    fn test_interval_clamped_to_floor() {
        let config = options()
            .refetch_interval(Duration::from_millis(1))
            .normalize();
        assert_eq!(
            config.refetch_interval,
            Duration::from_millis(MIN_REFETCH_INTERVAL_MS)
        );
    }

    #[test]
    fn test_caching_clamped_to_ceiling() {
        let config = options().caching(10_000).normalize();
        assert_eq!(config.caching, MAX_CACHING);
    }

    #[test]
    fn test_cache_key_priority() {
        #[derive(Clone, Debug)]
        struct Keyed(String);
        impl QueryParam for Keyed {
            fn cache_key(&self) -> Option<String> {
                Some(self.0.clone())
            }
        }

        let derived: QueryConfig<i32, Keyed> =
            QueryOptions::new("test", 0, |_p: Option<Keyed>| async { Ok(1) })
                .caching(2)
                .param_to_cache_key(|_p| "from-derivation".to_string())
                .normalize();

        // param override wins over the derivation function
        assert_eq!(
            derived.cache_key(Some(&Keyed("override".to_string()))),
            CacheKey::Derived("override".to_string())
        );

        // capacity 0 routes everything to the reserved slot
        let uncached: QueryConfig<i32, Keyed> =
            QueryOptions::new("test", 0, |_p: Option<Keyed>| async { Ok(1) }).normalize();
        assert_eq!(uncached.cache_key(Some(&Keyed("x".to_string()))), CacheKey::Init);
        assert_eq!(uncached.cache_key(None), CacheKey::Init);
    }

    #[test]
    fn test_cache_key_falls_back_to_debug_rendering() {
        let config: QueryConfig<i32, String> = options().caching(2).normalize();
        assert_eq!(
            config.cache_key(Some(&"page-1".to_string())),
            CacheKey::Derived("\"page-1\"".to_string())
        );
    }
}
