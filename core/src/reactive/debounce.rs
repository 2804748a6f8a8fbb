//! Trailing-edge debouncing of change notifications
//!
//! The announce table notifies on any row change, which is far coarser than
//! the changes the control loop actually cares about. The debouncer
//! collapses each burst into a single downstream trigger carrying the most
//! recent value.

use super::distributor::ViewSubscription;
use std::time::Duration;
use tokio::sync::{mpsc, watch};

/// Debounce a view subscription into a trigger stream.
///
/// At most one value is emitted per `window`, and it is always the latest
/// observed one. The subscription guard lives inside the debounce task, so
/// the upstream stays observed exactly as long as the consumer keeps the
/// returned receiver.
pub fn debounce<T: Clone + Send + Sync + 'static>(
    mut sub: ViewSubscription<T>,
    window: Duration,
) -> mpsc::Receiver<T> {
    let (tx, rx) = mpsc::channel(1);
    tokio::spawn(async move {
        loop {
            // Exit promptly when the consumer is gone, even while the
            // upstream is quiet
            tokio::select! {
                changed = sub.changed() => {
                    if !changed {
                        break;
                    }
                }
                _ = tx.closed() => break,
            }
            // Let the burst settle, then take whatever is newest
            tokio::time::sleep(window).await;
            let latest = sub.latest();
            if tx.send(latest).await.is_err() {
                break;
            }
        }
    });
    rx
}

/// Same coalescing over a bare watch receiver.
pub fn debounce_receiver<T: Clone + Send + Sync + 'static>(
    mut rx: watch::Receiver<T>,
    window: Duration,
) -> mpsc::Receiver<T> {
    let (tx, out) = mpsc::channel(1);
    tokio::spawn(async move {
        loop {
            tokio::select! {
                changed = rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                _ = tx.closed() => break,
            }
            tokio::time::sleep(window).await;
            let latest = rx.borrow_and_update().clone();
            if tx.send(latest).await.is_err() {
                break;
            }
        }
    });
    out
}
