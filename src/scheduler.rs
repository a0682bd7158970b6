use std::future;
use std::time::Duration;
use tokio::time::{self, Instant};

/// Restartable one-shot deadline driven from the orchestrator's event loop.
///
/// The interval timer is armed to the configured period on every successful
/// fetch and idles after firing; only the next success re-arms it. `cancel`
/// suspends it indefinitely, which is how `reset` parks auto-refetching. The
/// same mechanism backs the settle delay between a came-back signal and the
/// refetch it triggers.
#[derive(Debug)]
pub(crate) struct RefetchTimer {
    period: Duration,
    deadline: Option<Instant>,
}

impl RefetchTimer {
    pub fn new(period: Duration) -> Self {
        Self {
            period,
            deadline: None,
        }
    }

    pub fn restart(&mut self) {
        self.deadline = Some(Instant::now() + self.period);
    }

    pub fn cancel(&mut self) {
        self.deadline = None;
    }

    pub fn armed(&self) -> bool {
        self.deadline.is_some()
    }

    /// Resolves when the armed deadline passes; an idle timer never resolves.
    pub async fn fired(&self) {
        match self.deadline {
            Some(deadline) => time::sleep_until(deadline).await,
            None => future::pending().await,
        }
    }
}

/// Decides when a visibility/connectivity emission means the client came back
/// and the active entry should be revalidated.
///
/// Only runs while at least one of the emerge/reconnect policies is on and a
/// fetch has occurred; enablement follows the orchestrator's fetched/reset
/// transitions. A disabled policy is treated as always satisfied, and
/// consecutive identical signals are suppressed.
pub(crate) struct StaleWatcher {
    refetch_on_emerge: bool,
    refetch_on_reconnect: bool,
    enabled: bool,
    last_signal: Option<bool>,
}

impl StaleWatcher {
    pub fn new(refetch_on_emerge: bool, refetch_on_reconnect: bool) -> Self {
        Self {
            refetch_on_emerge,
            refetch_on_reconnect,
            enabled: false,
            last_signal: None,
        }
    }

    pub fn active(&self) -> bool {
        self.enabled && (self.refetch_on_emerge || self.refetch_on_reconnect)
    }

    pub fn set_enabled(&mut self, enabled: bool) {
        if self.enabled != enabled {
            self.enabled = enabled;
            self.last_signal = None;
        }
    }

    /// Feed one emission; returns true on a deduplicated came-back signal.
    pub fn observe(&mut self, visible: bool, online: bool) -> bool {
        if !self.active() {
            return false;
        }
        let came_back = (visible || !self.refetch_on_emerge)
            && (online || !self.refetch_on_reconnect);
        let repeat = self.last_signal == Some(came_back);
        self.last_signal = Some(came_back);
        came_back && !repeat
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::timeout;

    #[tokio::test(start_paused = true)]
    async fn test_timer_fires_only_while_armed() {
        let mut timer = RefetchTimer::new(Duration::from_secs(2));
        assert!(!timer.armed());
        assert!(timeout(Duration::from_secs(5), timer.fired()).await.is_err());

        timer.restart();
        assert!(timer.armed());
        timeout(Duration::from_secs(5), timer.fired())
            .await
            .expect("fires at the period");

        timer.cancel();
        assert!(timeout(Duration::from_secs(5), timer.fired()).await.is_err());
    }

    #[test]
    fn test_watcher_needs_policy_and_enablement() {
        let mut none = StaleWatcher::new(false, false);
        none.set_enabled(true);
        assert!(!none.active());
        assert!(!none.observe(true, true));

        let mut emerge = StaleWatcher::new(true, false);
        assert!(!emerge.observe(true, true), "disabled until a fetch occurs");
        emerge.set_enabled(true);
        assert!(emerge.observe(true, true));
    }

    #[test]
    fn test_watcher_dedups_consecutive_signals() {
        let mut watcher = StaleWatcher::new(true, true);
        watcher.set_enabled(true);

        assert!(watcher.observe(true, true));
        assert!(!watcher.observe(true, true), "repeated came-back suppressed");
        assert!(!watcher.observe(false, true));
        assert!(watcher.observe(true, true), "fires again after going away");
    }

    #[test]
    fn test_disabled_policy_is_always_satisfied() {
        let mut reconnect_only = StaleWatcher::new(false, true);
        reconnect_only.set_enabled(true);
        // visibility is ignored when emerge refetching is off
        assert!(reconnect_only.observe(false, true));
        assert!(!reconnect_only.observe(false, false));
        assert!(reconnect_only.observe(false, true));
    }

    #[test]
    fn test_toggling_enablement_resets_dedup_state() {
        let mut watcher = StaleWatcher::new(true, false);
        watcher.set_enabled(true);
        assert!(watcher.observe(true, true));

        watcher.set_enabled(false);
        watcher.set_enabled(true);
        assert!(watcher.observe(true, true), "re-enabling starts fresh");
    }
}
