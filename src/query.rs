/**
Query orchestrator: decides when to fetch, which cache slot to fetch into,
how to recover from failure, and when cached data is too stale to trust.

All state transitions are serialized in one driver task per orchestrator.
Fetch and reset requests arrive as events; completions, timers and
visibility/connectivity changes are lanes of the driver's select loop, with
trigger processing prioritized so a superseded execution can never commit.
*/
use crate::cache::entry::QueryStatus;
use crate::cache::store::{CacheHandle, CacheKey, CacheStore};
use crate::config::{
    QueryConfig, QueryOptions, QueryParam, EVENT_CHANNEL_CAPACITY, RECONNECT_SETTLE_MS,
};
use crate::error::QueryError;
use crate::monitor::BackgroundMonitor;
use crate::notifier::Notifier;
use crate::scheduler::{RefetchTimer, StaleWatcher};
use crate::stream::{select_stream, status_stream};
use futures::future::BoxFuture;
use std::future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::time::{sleep, Instant};
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Requests handed to the driver task.
pub(crate) enum StoreEvent<P> {
    Fetch { param: Option<P>, is_refetch: bool },
    Reset,
}

/// State readable outside the driver's timeline: whether a fetch has ever
/// been issued, whether refetching is suppressed, and the latest parameter.
struct Shared<P> {
    fetched: AtomicBool,
    refetch_disabled: AtomicBool,
    latest_param: Mutex<Option<P>>,
}

/// Asynchronous query orchestrator over a capacity-bounded per-key cache.
///
/// Constructed from [`QueryOptions`] and a [`Notifier`]; spawns its driver
/// task on the current runtime. Dropping the orchestrator stops the driver;
/// [`Query::destroy`] additionally pauses (keep-alive) or destroys the cache
/// store and announces teardown on the notifier's destroy channel.
pub struct Query<A, P> {
    config: Arc<QueryConfig<A, P>>,
    store: CacheHandle<A>,
    events: mpsc::Sender<StoreEvent<P>>,
    shared: Arc<Shared<P>>,
    cancel: CancellationToken,
    destroy_tx: mpsc::Sender<String>,
}

impl<A, P> Query<A, P>
where
    A: Clone + Send + Sync + 'static,
    P: QueryParam,
{
    #[must_use]
    pub fn new(options: QueryOptions<A, P>, notifier: Notifier) -> Self {
        Self::with_cache(options, notifier, None)
    }

    /// Construct with a cache parked by a previous keep-alive owner. The
    /// cache is adopted and restarted when keep-alive is on and the store is
    /// still alive; otherwise a fresh store is created.
    #[must_use]
    pub fn with_cache(
        options: QueryOptions<A, P>,
        notifier: Notifier,
        cache: Option<CacheHandle<A>>,
    ) -> Self {
        let config = Arc::new(options.normalize());
        let cancel = CancellationToken::new();
        let monitor = BackgroundMonitor::start(
            notifier.visibility.clone(),
            notifier.online.clone(),
            cancel.child_token(),
        );

        let (store, adopted) = match cache {
            Some(prior) if config.keep_alive && prior.alive() => {
                debug!("♻️ adopting keep-alive cache: {}", config.key);
                (prior, true)
            }
            _ => (CacheStore::new(config.caching, config.init_state.clone()), false),
        };

        let (events_tx, events_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let shared = Arc::new(Shared {
            fetched: AtomicBool::new(config.prefetch.is_some()),
            refetch_disabled: AtomicBool::new(false),
            latest_param: Mutex::new(config.prefetch.clone().unwrap_or_default()),
        });

        let driver = Driver {
            config: Arc::clone(&config),
            store: Arc::clone(&store),
            events: events_rx,
            self_events: events_tx.clone(),
            shared: Arc::clone(&shared),
            cancel: cancel.child_token(),
            backgrounded: monitor.subscribe(),
            visibility: notifier.visibility,
            online: notifier.online,
            restart_store: adopted,
        };
        tokio::spawn(driver.run());

        if let Some(param) = config.prefetch.clone() {
            let _ = events_tx.try_send(StoreEvent::Fetch {
                param,
                is_refetch: false,
            });
        }

        Self {
            config,
            store,
            events: events_tx,
            shared,
            cancel,
            destroy_tx: notifier.destroy,
        }
    }

    /// Issue a fetch for `param`, selecting or creating its cache entry as
    /// the active one. Side effect only; results arrive on the status stream.
    pub async fn fetch(&self, param: Option<P>) {
        self.fetch_inner(param, false).await;
    }

    /// Re-issue the latest fetch. No-op until a fetch has been issued or
    /// while refetching is disabled.
    pub async fn refetch(&self) {
        if !self.shared.fetched.load(Ordering::SeqCst)
            || self.shared.refetch_disabled.load(Ordering::SeqCst)
        {
            return;
        }
        let param = self.shared.latest_param.lock().await.clone();
        self.fetch_inner(param, true).await;
    }

    async fn fetch_inner(&self, param: Option<P>, is_refetch: bool) {
        self.shared.fetched.store(true, Ordering::SeqCst);
        *self.shared.latest_param.lock().await = param.clone();
        if self
            .events
            .send(StoreEvent::Fetch { param, is_refetch })
            .await
            .is_err()
        {
            warn!("fetch after destroy ignored: {}", self.config.key);
        }
    }

    /// Stream of whole statuses for the active entry, deduplicated with the
    /// configured comparator. Follows the active entry across key switches.
    pub async fn status(&self) -> ReceiverStream<QueryStatus<A>> {
        status_stream(self.store.subscribe().await, Arc::clone(&self.config.is_equal))
    }

    /// Stream of values projected from the active entry's data, consecutive
    /// duplicates suppressed.
    pub async fn select<T, F>(&self, selector: F) -> ReceiverStream<T>
    where
        T: Clone + PartialEq + Send + 'static,
        F: Fn(&A) -> T + Send + 'static,
    {
        select_stream(self.store.subscribe().await, selector)
    }

    /// Stream of the active entry's data itself.
    pub async fn data(&self) -> ReceiverStream<A>
    where
        A: PartialEq,
    {
        self.select(Clone::clone).await
    }

    /// Apply `f` to the active entry's data, committing when it changed under
    /// the comparator. Always attempts; returns true.
    pub async fn mutate<F>(&self, f: F) -> bool
    where
        F: FnOnce(A) -> A,
    {
        self.store
            .mutate_active(f, self.config.is_equal.as_ref(), false)
            .await
    }

    /// Cancel the interval timer, disable the stale watcher and restore the
    /// cache store to its initial single-entry state.
    pub async fn reset(&self) {
        self.shared.fetched.store(false, Ordering::SeqCst);
        if self.events.send(StoreEvent::Reset).await.is_err() {
            warn!("reset after destroy ignored: {}", self.config.key);
        }
    }

    /// Suppress interval- and signal-driven refetching without touching
    /// existing subscriptions.
    pub fn disable_refetch(&self, disabled: bool) {
        self.shared.refetch_disabled.store(disabled, Ordering::SeqCst);
    }

    /// Terminate the driver, pause (keep-alive) or destroy the cache store,
    /// and announce teardown under this orchestrator's key.
    pub async fn destroy(&self) {
        self.cancel.cancel();
        if self.config.keep_alive {
            self.store.pause().await;
        } else {
            self.store.destroy().await;
        }
        if self.destroy_tx.send(self.config.key.clone()).await.is_err() {
            debug!("destroy notification dropped: {}", self.config.key);
        }
    }

    /// The cache store for hand-off to a future instance under the same key,
    /// only while keep-alive is on and the store is alive.
    #[must_use]
    pub fn keep_alived_state(&self) -> Option<CacheHandle<A>> {
        (self.config.keep_alive && self.store.alive()).then(|| Arc::clone(&self.store))
    }

    #[must_use]
    pub fn init_data(&self) -> A {
        self.config.init_state.clone()
    }

    #[must_use]
    pub fn key(&self) -> &str {
        &self.config.key
    }

    /// Whether this orchestrator has been destroyed.
    #[must_use]
    pub fn destroyed(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

impl<A, P> Drop for Query<A, P> {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

impl<A, P> std::fmt::Debug for Query<A, P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Query")
            .field("key", &self.config.key)
            .field("destroyed", &self.cancel.is_cancelled())
            .finish_non_exhaustive()
    }
}

/// One execution of the query function, scoped to a single trigger. Retries
/// re-run the same invocation against the same cache key.
struct Flight<P> {
    key: CacheKey,
    param: Option<P>,
    is_refetch: bool,
    retries_left: u32,
}

struct Driver<A, P> {
    config: Arc<QueryConfig<A, P>>,
    store: CacheHandle<A>,
    events: mpsc::Receiver<StoreEvent<P>>,
    self_events: mpsc::Sender<StoreEvent<P>>,
    shared: Arc<Shared<P>>,
    cancel: CancellationToken,
    backgrounded: watch::Receiver<bool>,
    visibility: watch::Receiver<bool>,
    online: watch::Receiver<bool>,
    restart_store: bool,
}

impl<A, P> Driver<A, P>
where
    A: Clone + Send + Sync + 'static,
    P: QueryParam,
{
    #[allow(clippy::too_many_lines)]
    async fn run(mut self) {
        if self.restart_store {
            self.store.restart().await;
        }

        let mut exec: BoxFuture<'static, core::result::Result<A, QueryError>> =
            Box::pin(future::pending());
        let mut flight: Option<Flight<P>> = None;
        let mut interval = RefetchTimer::new(self.config.refetch_interval);
        let mut settle = RefetchTimer::new(Duration::from_millis(RECONNECT_SETTLE_MS));
        let mut watcher = StaleWatcher::new(
            self.config.refetch_on_emerge,
            self.config.refetch_on_reconnect,
        );
        let mut last_success: Option<Instant> = None;
        let mut visibility_live = true;
        let mut online_live = true;

        loop {
            tokio::select! {
                biased;

                () = self.cancel.cancelled() => break,

                event = self.events.recv() => {
                    let Some(event) = event else { break };
                    if let Some(fetch) = self
                        .process_events(event, &mut interval, &mut settle, &mut watcher)
                        .await
                    {
                        debug!("🚀 fetch dispatched: {} ({:?})", self.config.key, fetch.key);
                        exec = (self.config.query)(fetch.param.clone());
                        flight = Some(fetch);
                    }
                }

                result = &mut exec, if flight.is_some() => {
                    let Some(current) = flight.take() else { continue };
                    match result {
                        Ok(data) => {
                            debug!("✅ fetch success: {}", self.config.key);
                            self.store.commit_success(&current.key, data).await;
                            interval.restart();
                            last_success = Some(Instant::now());
                            exec = Box::pin(future::pending());
                        }
                        Err(error) if *self.backgrounded.borrow() => {
                            // backgrounded failures commit without a retry
                            warn!("🌙 fetch failed in background: {}: {error}", self.config.key);
                            self.store
                                .commit_error(&current.key, error, current.is_refetch)
                                .await;
                            exec = Box::pin(future::pending());
                        }
                        Err(error) if current.retries_left > 0 => {
                            let retries_left = current.retries_left - 1;
                            debug!(
                                "🔁 fetch retry: {}: {error} ({retries_left} left)",
                                self.config.key
                            );
                            let query = Arc::clone(&self.config.query);
                            let param = current.param.clone();
                            let delay = self.config.retry_delay;
                            exec = Box::pin(async move {
                                sleep(delay).await;
                                query(param).await
                            });
                            flight = Some(Flight { retries_left, ..current });
                        }
                        Err(error) => {
                            warn!("❌ fetch failed: {}: {error}", self.config.key);
                            self.store
                                .commit_error(&current.key, error, current.is_refetch)
                                .await;
                            exec = Box::pin(future::pending());
                        }
                    }
                }

                () = interval.fired(), if interval.armed() => {
                    interval.cancel();
                    if !self.shared.refetch_disabled.load(Ordering::SeqCst)
                        && (!*self.backgrounded.borrow() || self.config.background_refetch)
                    {
                        debug!("⏰ interval refetch: {}", self.config.key);
                        self.request_refetch().await;
                    }
                }

                changed = self.backgrounded.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let backgrounded = *self.backgrounded.borrow_and_update();
                    if !backgrounded && self.rescue_needed(last_success) {
                        debug!("🛟 stale after background, corrective refetch: {}", self.config.key);
                        self.request_refetch().await;
                    }
                }

                changed = self.visibility.changed(), if visibility_live && watcher.active() => {
                    if changed.is_err() {
                        visibility_live = false;
                    } else {
                        let visible = *self.visibility.borrow_and_update();
                        let online = *self.online.borrow();
                        self.observe_signals(visible, online, &mut watcher, &mut settle).await;
                    }
                }

                changed = self.online.changed(), if online_live && watcher.active() => {
                    if changed.is_err() {
                        online_live = false;
                    } else {
                        let online = *self.online.borrow_and_update();
                        let visible = *self.visibility.borrow();
                        self.observe_signals(visible, online, &mut watcher, &mut settle).await;
                    }
                }

                () = settle.fired(), if settle.armed() => {
                    settle.cancel();
                    self.request_refetch().await;
                }
            }
        }
        debug!("query driver stopped: {}", self.config.key);
    }

    /// Drain every queued event and apply store transitions in order. Fetches
    /// batched in the same drain collapse into one execution, the last one
    /// winning; each still prepares its own cache entry.
    async fn process_events(
        &mut self,
        first: StoreEvent<P>,
        interval: &mut RefetchTimer,
        settle: &mut RefetchTimer,
        watcher: &mut StaleWatcher,
    ) -> Option<Flight<P>> {
        let mut batch = vec![first];
        while let Ok(more) = self.events.try_recv() {
            batch.push(more);
        }

        let mut pending: Option<Flight<P>> = None;
        for event in batch {
            match event {
                StoreEvent::Fetch { param, is_refetch } => {
                    let key = self.config.cache_key(param.as_ref());
                    self.store.create_and_switch(key.clone()).await;
                    self.store.prepare_fetching(&key).await;
                    self.shared.fetched.store(true, Ordering::SeqCst);
                    watcher.set_enabled(true);
                    pending = Some(Flight {
                        key,
                        param,
                        is_refetch,
                        retries_left: self.config.retry,
                    });
                }
                StoreEvent::Reset => {
                    interval.cancel();
                    settle.cancel();
                    watcher.set_enabled(false);
                    self.shared.fetched.store(false, Ordering::SeqCst);
                    self.store.reset().await;
                    pending = None;
                }
            }
        }
        pending
    }

    /// Recompute the came-back condition on a signal emission; a stale active
    /// entry arms the settle delay before the refetch goes out.
    async fn observe_signals(
        &self,
        visible: bool,
        online: bool,
        watcher: &mut StaleWatcher,
        settle: &mut RefetchTimer,
    ) {
        if watcher.observe(visible, online)
            && self
                .store
                .active_is_stale(self.config.background_stale_time)
                .await
        {
            debug!("🌅 came back with stale data: {}", self.config.key);
            settle.restart();
        }
    }

    /// Last resort for intervals suppressed while backgrounded with no other
    /// recovery policy configured.
    fn rescue_needed(&self, last_success: Option<Instant>) -> bool {
        !self.config.background_refetch
            && !self.config.refetch_on_emerge
            && !self.config.refetch_on_reconnect
            && last_success.is_none_or(|at| at.elapsed() > self.config.refetch_interval)
    }

    async fn request_refetch(&self) {
        if !self.shared.fetched.load(Ordering::SeqCst)
            || self.shared.refetch_disabled.load(Ordering::SeqCst)
        {
            return;
        }
        let param = self.shared.latest_param.lock().await.clone();
        if self
            .self_events
            .try_send(StoreEvent::Fetch {
                param,
                is_refetch: true,
            })
            .is_err()
        {
            warn!("refetch dropped, event channel full: {}", self.config.key);
        }
    }
}
