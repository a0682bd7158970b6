use crate::cache::entry::QueryStatus;
use crate::cache::store::{CacheHandle, CacheKey, CacheStore};
use crate::config::{QueryConfig, QueryOptions, QueryParam, EVENT_CHANNEL_CAPACITY};
use crate::error::{Error, QueryError, Result};
use crate::notifier::Notifier;
use crate::query::StoreEvent;
use crate::stream::{select_stream, status_stream};
use futures::future::BoxFuture;
use std::future;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio::time::sleep;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Single-slot fetch-with-retry store: the same trigger/cancel pipeline as
/// [`crate::Query`] without caching, staleness, intervals or background
/// logic. Operations that only make sense with those policies fail fast.
pub struct StaticStore<A, P> {
    config: Arc<QueryConfig<A, P>>,
    store: CacheHandle<A>,
    events: mpsc::Sender<StoreEvent<P>>,
    latest_param: Mutex<Option<P>>,
    cancel: CancellationToken,
    destroy_tx: mpsc::Sender<String>,
}

impl<A, P> StaticStore<A, P>
where
    A: Clone + Send + Sync + 'static,
    P: QueryParam,
{
    #[must_use]
    pub fn new(options: QueryOptions<A, P>, notifier: Notifier) -> Self {
        let config = Arc::new(options.normalize());
        let cancel = CancellationToken::new();
        let store = CacheStore::new(0, config.init_state.clone());
        let (events_tx, events_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);

        let driver = StaticDriver {
            config: Arc::clone(&config),
            store: Arc::clone(&store),
            events: events_rx,
            cancel: cancel.child_token(),
        };
        tokio::spawn(driver.run());

        let latest_param = Mutex::new(config.prefetch.clone().unwrap_or_default());
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
            latest_param,
            cancel,
            destroy_tx: notifier.destroy,
        }
    }

    pub async fn fetch(&self, param: Option<P>) {
        *self.latest_param.lock().await = param.clone();
        if self
            .events
            .send(StoreEvent::Fetch {
                param,
                is_refetch: false,
            })
            .await
            .is_err()
        {
            warn!("fetch after destroy ignored: {}", self.config.key);
        }
    }

    /// Re-run the query with the most recent parameter.
    pub async fn reload(&self) {
        let param = self.latest_param.lock().await.clone();
        self.fetch(param).await;
    }

    pub async fn reset(&self) {
        if self.events.send(StoreEvent::Reset).await.is_err() {
            warn!("reset after destroy ignored: {}", self.config.key);
        }
    }

    pub async fn status(&self) -> ReceiverStream<QueryStatus<A>> {
        status_stream(self.store.subscribe().await, Arc::clone(&self.config.is_equal))
    }

    pub async fn select<T, F>(&self, selector: F) -> ReceiverStream<T>
    where
        T: Clone + PartialEq + Send + 'static,
        F: Fn(&A) -> T + Send + 'static,
    {
        select_stream(self.store.subscribe().await, selector)
    }

    pub async fn data(&self) -> ReceiverStream<A>
    where
        A: PartialEq,
    {
        self.select(Clone::clone).await
    }

    /// Guarded mutation: rejected while the slot is loading or its data has
    /// not been confirmed by a successful fetch.
    pub async fn mutate<F>(&self, f: F) -> bool
    where
        F: FnOnce(A) -> A,
    {
        self.store
            .mutate_active(f, self.config.is_equal.as_ref(), true)
            .await
    }

    /// A static store has no refetch machinery to disable.
    ///
    /// # Errors
    ///
    /// Always returns [`Error::Unsupported`].
    pub fn disable_refetch(&self, _disabled: bool) -> Result<()> {
        Err(Error::Unsupported {
            op: "disable_refetch",
        })
    }

    /// A static store never keeps its state alive across owners.
    #[must_use]
    pub fn keep_alived_state(&self) -> Option<CacheHandle<A>> {
        None
    }

    pub async fn destroy(&self) {
        self.cancel.cancel();
        self.store.destroy().await;
        if self.destroy_tx.send(self.config.key.clone()).await.is_err() {
            debug!("destroy notification dropped: {}", self.config.key);
        }
    }

    #[must_use]
    pub fn init_data(&self) -> A {
        self.config.init_state.clone()
    }

    #[must_use]
    pub fn key(&self) -> &str {
        &self.config.key
    }

    /// Whether this store has been destroyed.
    #[must_use]
    pub fn destroyed(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

impl<A, P> Drop for StaticStore<A, P> {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

impl<A, P> std::fmt::Debug for StaticStore<A, P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StaticStore")
            .field("key", &self.config.key)
            .field("destroyed", &self.cancel.is_cancelled())
            .finish_non_exhaustive()
    }
}

struct StaticFlight<P> {
    param: Option<P>,
    retries_left: u32,
}

struct StaticDriver<A, P> {
    config: Arc<QueryConfig<A, P>>,
    store: CacheHandle<A>,
    events: mpsc::Receiver<StoreEvent<P>>,
    cancel: CancellationToken,
}

impl<A, P> StaticDriver<A, P>
where
    A: Clone + Send + Sync + 'static,
    P: QueryParam,
{
    async fn run(mut self) {
        let mut exec: BoxFuture<'static, core::result::Result<A, QueryError>> =
            Box::pin(future::pending());
        let mut flight: Option<StaticFlight<P>> = None;

        loop {
            tokio::select! {
                biased;

                () = self.cancel.cancelled() => break,

                event = self.events.recv() => {
                    let Some(event) = event else { break };
                    match event {
                        StoreEvent::Fetch { param, is_refetch: _ } => {
                            debug!("🚀 fetch dispatched: {}", self.config.key);
                            self.store.prepare_fetching(&CacheKey::Init).await;
                            exec = (self.config.query)(param.clone());
                            flight = Some(StaticFlight {
                                param,
                                retries_left: self.config.retry,
                            });
                        }
                        StoreEvent::Reset => {
                            self.store.reset().await;
                        }
                    }
                }

                result = &mut exec, if flight.is_some() => {
                    let Some(current) = flight.take() else { continue };
                    match result {
                        Ok(data) => {
                            debug!("✅ fetch success: {}", self.config.key);
                            self.store.commit_success(&CacheKey::Init, data).await;
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
                            flight = Some(StaticFlight { retries_left, ..current });
                        }
                        Err(error) => {
                            warn!("❌ fetch failed: {}: {error}", self.config.key);
                            self.store.commit_error(&CacheKey::Init, error, false).await;
                            exec = Box::pin(future::pending());
                        }
                    }
                }
            }
        }
        debug!("static store driver stopped: {}", self.config.key);
    }
}
