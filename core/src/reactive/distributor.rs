//! Subscriber-counted live views over the candidate source
//!
//! A view starts its upstream task when the first observer subscribes and
//! stops it only after a grace period with zero observers, so short
//! disconnect/reconnect cycles (screen rotations, process rebinds) never
//! tear down and restart the upstream query. Lifecycle is tracked with
//! explicit reference counts and epoch-stamped stop timers; observer
//! disappearance is never inferred from finalization.

use crate::announce::{AnnounceStore, AvailableRelaysState};
use crate::config::RelayControlConfig;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::watch;
use tokio::task::JoinHandle;

type SourceFn<T> = dyn Fn(watch::Sender<T>) -> JoinHandle<()> + Send + Sync;

struct Lifecycle {
    subscribers: usize,
    /// Bumped on every subscribe; a pending stop fires only if the epoch it
    /// captured is still current.
    epoch: u64,
    upstream: Option<JoinHandle<()>>,
}

struct ViewInner<T: Clone + Send + Sync + 'static> {
    value_tx: watch::Sender<T>,
    initial: T,
    grace: Duration,
    source: Box<SourceFn<T>>,
    runtime: Handle,
    lifecycle: Mutex<Lifecycle>,
}

impl<T: Clone + Send + Sync + 'static> Drop for ViewInner<T> {
    fn drop(&mut self) {
        if let Some(task) = self.lifecycle.lock().upstream.take() {
            task.abort();
        }
    }
}

/// A derived live value with start/stop subscription lifecycle.
pub struct LiveView<T: Clone + Send + Sync + 'static> {
    inner: Arc<ViewInner<T>>,
}

impl<T: Clone + Send + Sync + 'static> Clone for LiveView<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T: Clone + Send + Sync + 'static> LiveView<T> {
    /// Build a view around an upstream task factory.
    ///
    /// `source` is invoked on each cold start with the sender the task
    /// should publish through. Must be called from within a Tokio runtime;
    /// the handle is captured so stop timers can be scheduled from
    /// synchronous `Drop` contexts later.
    pub fn new<F>(initial: T, grace: Duration, source: F) -> Self
    where
        F: Fn(watch::Sender<T>) -> JoinHandle<()> + Send + Sync + 'static,
    {
        let (value_tx, _) = watch::channel(initial.clone());
        Self {
            inner: Arc::new(ViewInner {
                value_tx,
                initial,
                grace,
                source: Box::new(source),
                runtime: Handle::current(),
                lifecycle: Mutex::new(Lifecycle {
                    subscribers: 0,
                    epoch: 0,
                    upstream: None,
                }),
            }),
        }
    }

    /// Register an observer, (re)starting the upstream on 0→1.
    ///
    /// Subscribing while a stop timer is pending cancels the stop; the
    /// upstream keeps running and the current value is observable
    /// immediately, with no placeholder flash.
    pub fn subscribe(&self) -> ViewSubscription<T> {
        let mut lifecycle = self.inner.lifecycle.lock();
        lifecycle.epoch += 1;
        lifecycle.subscribers += 1;
        if lifecycle.upstream.is_none() {
            let _guard = self.inner.runtime.enter();
            let task = (self.inner.source)(self.inner.value_tx.clone());
            lifecycle.upstream = Some(task);
        }
        drop(lifecycle);

        ViewSubscription {
            rx: self.inner.value_tx.subscribe(),
            inner: self.inner.clone(),
        }
    }

    /// Derive a child view with the same lifecycle policy.
    ///
    /// The child's upstream task holds a subscription on the parent, so the
    /// parent is observed exactly while the child is: a child can neither
    /// outlive nor underlive its parent's upstream.
    pub fn derive<U, F>(&self, initial: U, map: F) -> LiveView<U>
    where
        U: Clone + Send + Sync + 'static,
        F: Fn(&T) -> U + Send + Sync + 'static,
    {
        let parent = self.clone();
        let map = Arc::new(map);
        LiveView::new(initial, self.inner.grace, move |tx| {
            let mut sub = parent.subscribe();
            let map = map.clone();
            tokio::spawn(async move {
                loop {
                    let mapped = map(&sub.latest());
                    let _ = tx.send_replace(mapped);
                    if !sub.changed().await {
                        break;
                    }
                }
            })
        })
    }

    /// Tear the upstream down immediately, bypassing the grace period.
    ///
    /// Only meant for process shutdown; live subscribers fall back to the
    /// placeholder value.
    pub fn stop_now(&self) {
        let mut lifecycle = self.inner.lifecycle.lock();
        lifecycle.epoch += 1;
        let upstream = lifecycle.upstream.take();
        drop(lifecycle);
        if let Some(task) = upstream {
            task.abort();
        }
        let _ = self.inner.value_tx.send_replace(self.inner.initial.clone());
    }

    /// Current observer count (diagnostics and tests).
    pub fn subscriber_count(&self) -> usize {
        self.inner.lifecycle.lock().subscribers
    }

    /// Whether the upstream task is currently running.
    pub fn is_active(&self) -> bool {
        self.inner
            .lifecycle
            .lock()
            .upstream
            .as_ref()
            .map(|task| !task.is_finished())
            .unwrap_or(false)
    }
}

/// Observer handle; dropping it decrements the view's reference count and
/// arms the grace timer when the count reaches zero.
pub struct ViewSubscription<T: Clone + Send + Sync + 'static> {
    rx: watch::Receiver<T>,
    inner: Arc<ViewInner<T>>,
}

impl<T: Clone + Send + Sync + 'static> ViewSubscription<T> {
    /// The latest published value.
    pub fn current(&self) -> T {
        self.rx.borrow().clone()
    }

    /// The latest value, marking it seen for `changed`.
    pub fn latest(&mut self) -> T {
        self.rx.borrow_and_update().clone()
    }

    /// Wait for the next change. Returns `false` once the view is gone.
    pub async fn changed(&mut self) -> bool {
        self.rx.changed().await.is_ok()
    }
}

impl<T: Clone + Send + Sync + 'static> Drop for ViewSubscription<T> {
    fn drop(&mut self) {
        let inner = self.inner.clone();
        let mut lifecycle = inner.lifecycle.lock();
        lifecycle.subscribers = lifecycle.subscribers.saturating_sub(1);
        if lifecycle.subscribers > 0 || lifecycle.upstream.is_none() {
            return;
        }
        let armed_epoch = lifecycle.epoch;
        drop(lifecycle);

        let grace = inner.grace;
        let timer_inner = inner.clone();
        inner.runtime.spawn(async move {
            tokio::time::sleep(grace).await;
            let mut lifecycle = timer_inner.lifecycle.lock();
            if lifecycle.subscribers == 0 && lifecycle.epoch == armed_epoch {
                if let Some(task) = lifecycle.upstream.take() {
                    task.abort();
                }
                drop(lifecycle);
                let _ = timer_inner
                    .value_tx
                    .send_replace(timer_inner.initial.clone());
                tracing::debug!("live view stopped after grace period");
            }
        });
    }
}

/// Wires the announce table into the views the rest of the system consumes.
pub struct RelayDistributor {
    relays: LiveView<AvailableRelaysState>,
}

impl RelayDistributor {
    pub fn new(store: Arc<AnnounceStore>, config: &RelayControlConfig) -> Self {
        let max_candidates = config.max_candidates;
        let relays = LiveView::new(
            AvailableRelaysState::Loading,
            config.subscriber_grace,
            move |tx| {
                let store = store.clone();
                tokio::spawn(async move {
                    let mut changes = store.watch_changes();
                    loop {
                        // Query failures become an in-band value; nothing is
                        // thrown across the subscription boundary.
                        let state = match store.snapshot() {
                            Ok(mut relays) => {
                                relays.truncate(max_candidates);
                                AvailableRelaysState::Loaded(relays)
                            }
                            Err(e) => {
                                tracing::warn!(error = %e, "candidate query failed");
                                AvailableRelaysState::Unavailable(e.to_string())
                            }
                        };
                        tx.send_if_modified(|current| {
                            if *current == state {
                                false
                            } else {
                                *current = state;
                                true
                            }
                        });
                        if changes.changed().await.is_err() {
                            break;
                        }
                    }
                })
            },
        );
        Self { relays }
    }

    /// The live candidate-list view.
    pub fn available_relays(&self) -> &LiveView<AvailableRelaysState> {
        &self.relays
    }

    pub fn subscribe_available(&self) -> ViewSubscription<AvailableRelaysState> {
        self.relays.subscribe()
    }

    /// Immediate teardown for process shutdown.
    pub fn shutdown(&self) {
        self.relays.stop_now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::announce::CandidateRelay;
    use crate::store::backend::FlakyStorage;
    use crate::store::MemoryStorage;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::time::{advance, Duration};

    const GRACE: Duration = Duration::from_millis(5_000);

    /// View that forwards an input watch channel and counts cold starts.
    fn counting_view(
        input: watch::Receiver<u32>,
        starts: Arc<AtomicUsize>,
    ) -> LiveView<Option<u32>> {
        LiveView::new(None, GRACE, move |tx| {
            starts.fetch_add(1, Ordering::SeqCst);
            let mut input = input.clone();
            tokio::spawn(async move {
                loop {
                    let value = *input.borrow_and_update();
                    let _ = tx.send_replace(Some(value));
                    if input.changed().await.is_err() {
                        break;
                    }
                }
            })
        })
    }

    #[tokio::test(start_paused = true)]
    async fn test_cold_start_publishes_first_value() {
        let (input_tx, input_rx) = watch::channel(7u32);
        let starts = Arc::new(AtomicUsize::new(0));
        let view = counting_view(input_rx, starts.clone());

        assert!(!view.is_active());
        let mut sub = view.subscribe();
        assert!(view.is_active());
        assert_eq!(starts.load(Ordering::SeqCst), 1);

        // First emission after a cold start
        assert!(sub.changed().await);
        assert_eq!(sub.latest(), Some(7));

        input_tx.send(9).unwrap();
        assert!(sub.changed().await);
        assert_eq!(sub.latest(), Some(9));
    }

    #[tokio::test(start_paused = true)]
    async fn test_upstream_stops_after_grace() {
        let (_input_tx, input_rx) = watch::channel(1u32);
        let starts = Arc::new(AtomicUsize::new(0));
        let view = counting_view(input_rx, starts.clone());

        let mut sub = view.subscribe();
        assert!(sub.changed().await);
        drop(sub);

        // Let the grace timer register before the clock jumps, then let its
        // teardown body run after.
        tokio::task::yield_now().await;
        advance(GRACE + Duration::from_millis(100)).await;
        tokio::task::yield_now().await;
        assert!(!view.is_active());

        // Next subscriber gets the placeholder back, then a fresh start
        let sub2 = view.subscribe();
        assert_eq!(starts.load(Ordering::SeqCst), 2);
        drop(sub2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_resubscribe_within_grace_keeps_upstream() {
        let (_input_tx, input_rx) = watch::channel(42u32);
        let starts = Arc::new(AtomicUsize::new(0));
        let view = counting_view(input_rx, starts.clone());

        let mut sub = view.subscribe();
        assert!(sub.changed().await);
        assert_eq!(sub.latest(), Some(42));
        drop(sub);

        // Zero subscribers for 3s — inside the 5s grace window
        advance(Duration::from_millis(3_000)).await;
        let sub2 = view.subscribe();

        // No restart and no placeholder flash: the cached value is visible
        // immediately on the new subscription.
        assert_eq!(starts.load(Ordering::SeqCst), 1);
        assert_eq!(sub2.current(), Some(42));

        // The canceled stop timer must not fire later either
        advance(GRACE * 3).await;
        assert!(view.is_active());
        drop(sub2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_value_resets_to_placeholder_after_stop() {
        let (_input_tx, input_rx) = watch::channel(5u32);
        let starts = Arc::new(AtomicUsize::new(0));
        let view = counting_view(input_rx, starts);

        let mut sub = view.subscribe();
        assert!(sub.changed().await);
        drop(sub);
        // Let the grace timer register, fire, and run its teardown.
        tokio::task::yield_now().await;
        advance(GRACE + Duration::from_millis(100)).await;
        tokio::task::yield_now().await;

        let sub2 = view.subscribe();
        // Freshly restarted: placeholder until the new upstream emits
        assert_eq!(sub2.current(), None);
        drop(sub2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_derived_view_follows_parent_lifecycle() {
        let (input_tx, input_rx) = watch::channel(3u32);
        let starts = Arc::new(AtomicUsize::new(0));
        let parent = counting_view(input_rx, starts.clone());
        let child = parent.derive(None, |value: &Option<u32>| value.map(|v| v * 10));

        let mut sub = child.subscribe();
        assert!(sub.changed().await);
        // Parent observed exactly while the child is
        assert!(parent.is_active());
        assert_eq!(starts.load(Ordering::SeqCst), 1);

        input_tx.send(4).unwrap();
        loop {
            assert!(sub.changed().await);
            if sub.latest() == Some(40) {
                break;
            }
        }

        drop(sub);
        // Child grace, then the dropped parent subscription starts the
        // parent's own grace. Yields let each grace timer register before the
        // clock jumps and run its teardown after.
        tokio::task::yield_now().await;
        advance(GRACE + Duration::from_millis(100)).await;
        tokio::task::yield_now().await;
        assert!(!child.is_active());
        tokio::task::yield_now().await;
        advance(GRACE + Duration::from_millis(100)).await;
        tokio::task::yield_now().await;
        assert!(!parent.is_active());
    }

    #[tokio::test(start_paused = true)]
    async fn test_distributor_publishes_candidates() {
        let backend = Arc::new(MemoryStorage::new());
        let store = Arc::new(AnnounceStore::new(backend, 10));
        store
            .record_announce(CandidateRelay::new(format!("{:032x}", 1), 2))
            .unwrap();

        let distributor = RelayDistributor::new(store.clone(), &RelayControlConfig::default());
        let mut sub = distributor.subscribe_available();

        assert!(sub.changed().await);
        let state = sub.latest();
        let relays = state.relays().unwrap();
        assert_eq!(relays.len(), 1);
        assert_eq!(relays[0].relay_id, format!("{:032x}", 1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_distributor_surfaces_query_failure_in_band() {
        let backend = Arc::new(FlakyStorage::new());
        backend.set_fail_reads(true);
        let store = Arc::new(AnnounceStore::new(backend, 10));

        let distributor = RelayDistributor::new(store, &RelayControlConfig::default());
        let mut sub = distributor.subscribe_available();

        assert!(sub.changed().await);
        assert!(matches!(
            sub.latest(),
            AvailableRelaysState::Unavailable(_)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_distributor_caps_snapshot_at_config_bound() {
        let backend = Arc::new(MemoryStorage::new());
        let store = Arc::new(AnnounceStore::new(backend, 100));
        for i in 0..10u8 {
            let mut relay = CandidateRelay::new(format!("{:032x}", i), 2);
            relay.last_seen = 100 + u64::from(i);
            store.record_announce(relay).unwrap();
        }

        let config = RelayControlConfig {
            max_candidates: 3,
            ..Default::default()
        };
        let distributor = RelayDistributor::new(store, &config);
        let mut sub = distributor.subscribe_available();

        assert!(sub.changed().await);
        let state = sub.latest();
        assert_eq!(state.relays().unwrap().len(), 3);
    }
}
