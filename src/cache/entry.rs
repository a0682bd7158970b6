use crate::equality::Equality;
use crate::error::QueryError;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

/// Observable state of one cache slot.
#[derive(Debug, Clone)]
pub struct QueryStatus<A> {
    /// Epoch milliseconds of the last successful update; 0 before the first.
    pub ts: i64,
    /// Last known value; the initial value until the first success.
    pub data: A,
    /// A request for this slot is in flight.
    pub loading: bool,
    /// Last error, cleared on success.
    pub error: Option<QueryError>,
    /// The value has never been confirmed by a successful fetch and should be
    /// treated as a placeholder.
    pub untrusted_data: bool,
}

impl<A> QueryStatus<A> {
    pub(crate) fn seeded(data: A) -> Self {
        Self {
            ts: 0,
            data,
            loading: false,
            error: None,
            untrusted_data: true,
        }
    }
}

/// One cache slot. Transitions mutate in place; the owning store decides when
/// a transition is published.
#[derive(Debug)]
pub(crate) struct CacheEntry<A> {
    status: QueryStatus<A>,
    activated_at: u64,
    last_success: Option<Instant>,
}

impl<A: Clone + 'static> CacheEntry<A> {
    pub fn new(data: A, activated_at: u64) -> Self {
        Self {
            status: QueryStatus::seeded(data),
            activated_at,
            last_success: None,
        }
    }

    pub fn status(&self) -> &QueryStatus<A> {
        &self.status
    }

    pub fn activated_at(&self) -> u64 {
        self.activated_at
    }

    pub fn activate(&mut self, stamp: u64) {
        self.activated_at = stamp;
    }

    /// Mark a request in flight, preserving current data and error.
    pub fn prepare_fetching(&mut self) {
        self.status.loading = true;
    }

    pub fn on_success(&mut self, data: A) {
        self.status.data = data;
        self.status.ts = chrono::Utc::now().timestamp_millis();
        self.status.loading = false;
        self.status.error = None;
        self.status.untrusted_data = false;
        self.last_success = Some(Instant::now());
    }

    /// A failed refetch keeps previously confirmed data trusted; only an entry
    /// with no successful commit behind it degrades to untrusted.
    pub fn on_error(&mut self, error: QueryError, is_refetch: bool) {
        self.status.loading = false;
        self.status.untrusted_data = self.status.ts == 0;
        debug!(
            refetch = is_refetch,
            untrusted = self.status.untrusted_data,
            "entry error: {error}"
        );
        self.status.error = Some(error);
    }

    /// Apply `f` to the current data; returns whether the entry changed under
    /// the configured comparator.
    pub fn on_mutate<F>(&mut self, f: F, is_equal: &dyn Equality<A>) -> bool
    where
        F: FnOnce(A) -> A,
    {
        let mutated = f(self.status.data.clone());
        if is_equal.data_eq(&mutated, &self.status.data) {
            return false;
        }
        self.status.data = mutated;
        true
    }

    pub fn is_stale(&self, max_age: Duration) -> bool {
        self.status.untrusted_data
            || self
                .last_success
                .is_none_or(|at| at.elapsed() > max_age)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::equality::DefaultEquality;

    #[tokio::test]
    async fn test_fresh_entry_is_untrusted() {
        let entry = CacheEntry::new(0, 0);
        assert!(entry.status().untrusted_data);
        assert_eq!(entry.status().ts, 0);
        assert!(entry.status().error.is_none());
        assert!(!entry.status().loading);
    }

    #[tokio::test]
    async fn test_success_transition_clears_error_and_trusts_data() {
        let mut entry = CacheEntry::new(0, 0);
        entry.prepare_fetching();
        assert!(entry.status().loading);

        entry.on_error(QueryError::msg("down"), false);
        assert!(entry.status().untrusted_data);
        assert!(entry.status().error.is_some());

        entry.on_success(5);
        assert_eq!(entry.status().data, 5);
        assert!(!entry.status().untrusted_data);
        assert!(entry.status().error.is_none());
        assert!(entry.status().ts > 0);
        assert!(!entry.status().loading);
    }

    #[tokio::test]
    async fn test_refetch_failure_keeps_trusted_data() {
        let mut entry = CacheEntry::new(0, 0);
        entry.on_success(5);

        entry.prepare_fetching();
        entry.on_error(QueryError::msg("down"), true);
        assert_eq!(entry.status().data, 5);
        assert!(!entry.status().untrusted_data);
        assert!(entry.status().error.is_some());
    }

    #[tokio::test]
    async fn test_prepare_fetching_preserves_data_and_error() {
        let mut entry = CacheEntry::new(1, 0);
        entry.on_error(QueryError::msg("down"), false);
        entry.prepare_fetching();
        assert_eq!(entry.status().data, 1);
        assert!(entry.status().error.is_some());
        assert!(entry.status().loading);
    }

    #[tokio::test]
    async fn test_mutate_commits_only_on_change() {
        let mut entry = CacheEntry::new(2, 0);
        assert!(!entry.on_mutate(|d| d, &DefaultEquality));
        assert!(entry.on_mutate(|d| d + 1, &DefaultEquality));
        assert_eq!(entry.status().data, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_staleness_tracks_last_success() {
        let mut entry = CacheEntry::new(0, 0);
        assert!(entry.is_stale(Duration::from_secs(60)), "no success yet");

        entry.on_success(1);
        assert!(!entry.is_stale(Duration::from_secs(60)));

        tokio::time::advance(Duration::from_secs(90)).await;
        assert!(entry.is_stale(Duration::from_secs(60)));
    }
}
