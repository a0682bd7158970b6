use crate::cache::entry::QueryStatus;
use crate::config::STREAM_CHANNEL_CAPACITY;
use crate::equality::Equality;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio_stream::wrappers::ReceiverStream;

/// Stream of whole statuses from the active entry, starting with the current
/// value and suppressing consecutive duplicates at status sensitivity. The
/// stream completes only when the backing store is destroyed.
pub(crate) fn status_stream<A>(
    mut state_rx: watch::Receiver<QueryStatus<A>>,
    is_equal: Arc<dyn Equality<A>>,
) -> ReceiverStream<QueryStatus<A>>
where
    A: Clone + Send + Sync + 'static,
{
    let (tx, rx) = mpsc::channel(STREAM_CHANNEL_CAPACITY);
    tokio::spawn(async move {
        let mut last = state_rx.borrow_and_update().clone();
        if tx.send(last.clone()).await.is_err() {
            return;
        }
        while state_rx.changed().await.is_ok() {
            let next = state_rx.borrow_and_update().clone();
            if is_equal.status_eq(&last, &next) {
                continue;
            }
            if tx.send(next.clone()).await.is_err() {
                break;
            }
            last = next;
        }
    });
    ReceiverStream::new(rx)
}

/// Stream of values projected from the active entry's data, deduplicated on
/// the projection.
pub(crate) fn select_stream<A, T, F>(
    mut state_rx: watch::Receiver<QueryStatus<A>>,
    selector: F,
) -> ReceiverStream<T>
where
    A: Clone + Send + Sync + 'static,
    T: Clone + PartialEq + Send + 'static,
    F: Fn(&A) -> T + Send + 'static,
{
    let (tx, rx) = mpsc::channel(STREAM_CHANNEL_CAPACITY);
    tokio::spawn(async move {
        let mut last = selector(&state_rx.borrow_and_update().data);
        if tx.send(last.clone()).await.is_err() {
            return;
        }
        while state_rx.changed().await.is_ok() {
            let next = selector(&state_rx.borrow_and_update().data);
            if next == last {
                continue;
            }
            if tx.send(next.clone()).await.is_err() {
                break;
            }
            last = next;
        }
    });
    ReceiverStream::new(rx)
}
