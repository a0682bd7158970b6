/*!
Client-side asynchronous query cache.

A [`Query`] wraps an opaque asynchronous fetch operation with retry,
capacity-bounded per-parameter caching, staleness tracking and
background-aware refetching, exposing the result as a subscribable stream of
`data + loading + error` statuses. Consumers get caching, request
deduplication and recovery without re-implementing any of it.

Visibility and connectivity are injected through a [`Notifier`] rather than
read from platform APIs, so the engine runs anywhere a tokio runtime does.
[`StoreRegistry`] maps named stores to consumers and parks keep-alive caches
across owner instances; [`StaticStore`] is the single-slot sibling for plain
fetch-with-retry state.
*/
pub mod cache;
pub mod config;
pub mod equality;
pub mod error;
pub mod monitor;
pub mod notifier;
pub mod query;
pub mod registry;
mod scheduler;
pub mod static_store;
mod stream;

pub use cache::entry::QueryStatus;
pub use cache::store::{CacheHandle, CacheKey, CacheStore};
pub use config::{QueryOptions, QueryParam};
pub use equality::{DefaultEquality, Equality};
pub use error::{Error, QueryError, Result};
pub use monitor::BackgroundMonitor;
pub use notifier::{Notifier, NotifierSources};
pub use query::Query;
pub use registry::StoreRegistry;
pub use static_store::StaticStore;
