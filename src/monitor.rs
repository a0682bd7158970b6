use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Derives the backgrounded signal from injected visibility and connectivity
/// signals: backgrounded = not visible or not online.
///
/// The combined value is seeded from the receivers' current values and
/// re-emitted only on change. It gates interval refetching, the retry branch
/// of the fetch pipeline, and the corrective refetch issued when the client
/// comes back with no recovery policy configured.
pub struct BackgroundMonitor {
    backgrounded: watch::Receiver<bool>,
}

impl BackgroundMonitor {
    #[must_use]
    pub fn start(
        mut visibility: watch::Receiver<bool>,
        mut online: watch::Receiver<bool>,
        cancel: CancellationToken,
    ) -> Self {
        let seed = !*visibility.borrow_and_update() || !*online.borrow_and_update();
        let (backgrounded_tx, backgrounded_rx) = watch::channel(seed);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = cancel.cancelled() => break,
                    changed = visibility.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                    changed = online.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                }
                let next = !*visibility.borrow_and_update() || !*online.borrow_and_update();
                backgrounded_tx.send_if_modified(|current| {
                    if *current == next {
                        false
                    } else {
                        debug!("background mode: {next}");
                        *current = next;
                        true
                    }
                });
            }
        });
        Self {
            backgrounded: backgrounded_rx,
        }
    }

    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.backgrounded.clone()
    }

    #[must_use]
    pub fn is_backgrounded(&self) -> bool {
        *self.backgrounded.borrow()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::timeout;

    #[tokio::test]
    async fn test_backgrounded_when_hidden_or_offline() {
        let (visibility_tx, visibility_rx) = watch::channel(true);
        let (online_tx, online_rx) = watch::channel(true);
        let monitor = BackgroundMonitor::start(visibility_rx, online_rx, CancellationToken::new());
        let mut backgrounded = monitor.subscribe();
        assert!(!*backgrounded.borrow());

        visibility_tx.send_replace(false);
        timeout(Duration::from_secs(1), backgrounded.changed())
            .await
            .unwrap()
            .unwrap();
        assert!(*backgrounded.borrow_and_update());

        // hidden and offline is still backgrounded, no emission
        online_tx.send_replace(false);
        assert!(timeout(Duration::from_millis(50), backgrounded.changed())
            .await
            .is_err());

        // visible but offline is still backgrounded, no emission
        visibility_tx.send_replace(true);
        assert!(timeout(Duration::from_millis(50), backgrounded.changed())
            .await
            .is_err());

        online_tx.send_replace(true);
        timeout(Duration::from_secs(1), backgrounded.changed())
            .await
            .unwrap()
            .unwrap();
        assert!(!*backgrounded.borrow_and_update());
    }

    #[tokio::test]
    async fn test_seed_reflects_current_values() {
        let (_visibility_tx, visibility_rx) = watch::channel(false);
        let (_online_tx, online_rx) = watch::channel(true);
        let monitor = BackgroundMonitor::start(visibility_rx, online_rx, CancellationToken::new());
        assert!(monitor.is_backgrounded());
    }
}
