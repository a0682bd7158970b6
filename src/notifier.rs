use crate::config::DESTROY_CHANNEL_CAPACITY;
use tokio::sync::{mpsc, watch};

/// Environment contract injected into every store.
///
/// The watch receivers carry a synchronously-readable current value, which
/// serves as the seed the stores read at construction. The embedding
/// environment drives the senders; the core never touches platform APIs.
#[derive(Clone)]
pub struct Notifier {
    /// Teardown announcements keyed by store identity.
    pub destroy: mpsc::Sender<String>,
    /// Live connectivity signal.
    pub online: watch::Receiver<bool>,
    /// Live visibility signal.
    pub visibility: watch::Receiver<bool>,
}

/// Senders backing a standalone [`Notifier`].
pub struct NotifierSources {
    pub online: watch::Sender<bool>,
    pub visibility: watch::Sender<bool>,
    pub destroyed: mpsc::Receiver<String>,
}

impl Notifier {
    /// Build a notifier seeded visible and online, for use without a
    /// registry. The returned sources feed the signals.
    #[must_use]
    pub fn standalone() -> (Self, NotifierSources) {
        let (online_tx, online_rx) = watch::channel(true);
        let (visibility_tx, visibility_rx) = watch::channel(true);
        let (destroy_tx, destroy_rx) = mpsc::channel(DESTROY_CHANNEL_CAPACITY);
        (
            Self {
                destroy: destroy_tx,
                online: online_rx,
                visibility: visibility_rx,
            },
            NotifierSources {
                online: online_tx,
                visibility: visibility_tx,
                destroyed: destroy_rx,
            },
        )
    }
}
