//! Snapshot publication and change notification
//!
//! The current book of an instrument sits behind an `ArcSwap`: readers take a
//! single atomic load and then compute over an immutable snapshot, writers
//! replace the whole reference at once. Listeners are notified on a separate
//! pool. Every listener has its own mailbox drained by at most one pool task
//! at a time, so it sees changes in publish order while different listeners
//! run in parallel. Each callback is isolated so a failing listener cannot
//! affect the others or the publishing path.

mod pool;

pub use pool::NotificationPool;

use arc_swap::ArcSwap;
use parking_lot::{Mutex, RwLock};
use rust_decimal::Decimal;
use std::collections::VecDeque;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, error, warn};

use crate::orderbook::{OrderBookState, PriceLevel};
use crate::telemetry::EngineMetrics;

/// Book change callbacks
///
/// Every hook defaults to a no-op. Errors and panics are caught and logged
/// by the dispatcher.
pub trait BookListener: Send + Sync {
    fn on_best_bid_changed(
        &self,
        _instrument: &str,
        _price: Decimal,
        _size: Decimal,
        _timestamp: u64,
    ) -> anyhow::Result<()> {
        Ok(())
    }

    fn on_best_ask_changed(
        &self,
        _instrument: &str,
        _price: Decimal,
        _size: Decimal,
        _timestamp: u64,
    ) -> anyhow::Result<()> {
        Ok(())
    }

    /// Only called when the publisher is configured with an imbalance lambda
    fn on_imbalance_changed(
        &self,
        _instrument: &str,
        _value: f64,
        _timestamp: u64,
    ) -> anyhow::Result<()> {
        Ok(())
    }

    /// Called on every publish with a private copy of the new book
    fn on_book_snapshot(&self, _book: &OrderBookState, _timestamp: u64) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Handle returned by `subscribe`, used to unsubscribe
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

impl std::fmt::Display for ListenerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "listener-{}", self.0)
    }
}

/// Changes waiting for one listener
#[derive(Default)]
struct Mailbox {
    pending: VecDeque<Arc<BookChange>>,
    /// A pool task currently owns delivery for this listener
    draining: bool,
}

/// A registered listener and its ordered delivery queue
struct Subscription {
    id: ListenerId,
    listener: Arc<dyn BookListener>,
    mailbox: Mutex<Mailbox>,
}

impl Subscription {
    fn new(id: ListenerId, listener: Arc<dyn BookListener>) -> Self {
        Self {
            id,
            listener,
            mailbox: Mutex::new(Mailbox::default()),
        }
    }

    /// Queue a change; true if the caller must start a drain task
    fn post(&self, change: Arc<BookChange>) -> bool {
        let mut mailbox = self.mailbox.lock();
        mailbox.pending.push_back(change);
        !std::mem::replace(&mut mailbox.draining, true)
    }

    /// Deliver queued changes in order until the mailbox is empty
    fn drain(&self, metrics: &EngineMetrics) {
        loop {
            let next = {
                let mut mailbox = self.mailbox.lock();
                match mailbox.pending.pop_front() {
                    Some(change) => change,
                    None => {
                        mailbox.draining = false;
                        return;
                    }
                }
            };
            deliver(self.id, self.listener.as_ref(), &next, metrics);
        }
    }

    /// Discard everything queued when no drain task could be started
    fn abandon(&self) -> usize {
        let mut mailbox = self.mailbox.lock();
        mailbox.draining = false;
        let dropped = mailbox.pending.len();
        mailbox.pending.clear();
        dropped
    }
}

/// Thread-safe listener registry shared by all publishers of an engine
#[derive(Default)]
pub struct ListenerSet {
    next_id: AtomicU64,
    listeners: RwLock<Vec<Arc<Subscription>>>,
}

impl ListenerSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, listener: Arc<dyn BookListener>) -> ListenerId {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.listeners
            .write()
            .push(Arc::new(Subscription::new(id, listener)));
        id
    }

    /// Returns false if the id was not registered
    pub fn unsubscribe(&self, id: ListenerId) -> bool {
        let mut listeners = self.listeners.write();
        let before = listeners.len();
        listeners.retain(|subscription| subscription.id != id);
        listeners.len() != before
    }

    pub fn len(&self) -> usize {
        self.listeners.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.listeners.read().is_empty()
    }

    fn snapshot(&self) -> Vec<Arc<Subscription>> {
        self.listeners.read().clone()
    }
}

/// What changed between two consecutive published states
#[derive(Debug, Clone)]
struct BookChange {
    state: Arc<OrderBookState>,
    best_bid: Option<PriceLevel>,
    best_ask: Option<PriceLevel>,
    imbalance: Option<f64>,
}

impl BookChange {
    fn between(
        previous: &OrderBookState,
        next: Arc<OrderBookState>,
        imbalance_lambda: Option<f64>,
    ) -> Self {
        let first_publish = !previous.is_initialized();

        let changed = |before: PriceLevel, after: PriceLevel| -> Option<PriceLevel> {
            if first_publish {
                // No spurious callbacks before the book has real data
                (!after.is_empty()).then_some(after)
            } else {
                (before != after).then_some(after)
            }
        };

        let best_bid = changed(previous.best_bid(), next.best_bid());
        let best_ask = changed(previous.best_ask(), next.best_ask());

        let imbalance = imbalance_lambda.and_then(|lambda| {
            let before = previous.weighted_imbalance(lambda);
            let after = next.weighted_imbalance(lambda);
            ((after - before).abs() > f64::EPSILON).then_some(after)
        });

        Self {
            state: next,
            best_bid,
            best_ask,
            imbalance,
        }
    }
}

/// Owns the published book of one instrument
pub struct SnapshotPublisher {
    current: ArcSwap<OrderBookState>,
    listeners: Arc<ListenerSet>,
    pool: Arc<NotificationPool>,
    metrics: Arc<EngineMetrics>,
    imbalance_lambda: Option<f64>,
}

impl SnapshotPublisher {
    pub fn new(
        initial: OrderBookState,
        listeners: Arc<ListenerSet>,
        pool: Arc<NotificationPool>,
        metrics: Arc<EngineMetrics>,
        imbalance_lambda: Option<f64>,
    ) -> Self {
        Self {
            current: ArcSwap::from_pointee(initial),
            listeners,
            pool,
            metrics,
            imbalance_lambda,
        }
    }

    /// Current published book; never blocks
    pub fn current(&self) -> Arc<OrderBookState> {
        self.current.load_full()
    }

    pub fn subscribe(&self, listener: Arc<dyn BookListener>) -> ListenerId {
        self.listeners.subscribe(listener)
    }

    pub fn unsubscribe(&self, id: ListenerId) -> bool {
        self.listeners.unsubscribe(id)
    }

    /// Atomically replace the published book and notify listeners
    pub fn publish(&self, next: OrderBookState) {
        let next = Arc::new(next);
        let previous = self.current.swap(next.clone());

        if self.listeners.is_empty() {
            return;
        }

        let change = Arc::new(BookChange::between(&previous, next, self.imbalance_lambda));
        self.dispatch(change);
    }

    /// Replace the published book without notifying anyone
    pub fn replace_quietly(&self, next: OrderBookState) {
        self.current.store(Arc::new(next));
    }

    fn dispatch(&self, change: Arc<BookChange>) {
        for subscription in self.listeners.snapshot() {
            if !self.pool.is_accepting() {
                self.dropped(subscription.id, &change, 1);
                continue;
            }

            // An active drain task picks the change up in order
            if !subscription.post(change.clone()) {
                continue;
            }

            let task_subscription = subscription.clone();
            let metrics = self.metrics.clone();
            if !self.pool.spawn(move || task_subscription.drain(&metrics)) {
                let dropped = subscription.abandon();
                self.dropped(subscription.id, &change, dropped);
            }
        }
    }

    fn dropped(&self, id: ListenerId, change: &BookChange, count: usize) {
        self.metrics.record_dropped_notifications(count);
        debug!(
            instrument = %change.state.instrument(),
            listener = %id,
            dropped = count,
            "Notification pool shut down, dropping notifications"
        );
    }
}

fn deliver(
    id: ListenerId,
    listener: &dyn BookListener,
    change: &BookChange,
    metrics: &EngineMetrics,
) {
    let state = change.state.as_ref();
    let instrument = state.instrument();
    let timestamp = state.timestamp();

    if let Some(bid) = change.best_bid {
        isolate(id, instrument, "on_best_bid_changed", metrics, || {
            listener.on_best_bid_changed(instrument, bid.price, bid.size, timestamp)
        });
    }

    if let Some(ask) = change.best_ask {
        isolate(id, instrument, "on_best_ask_changed", metrics, || {
            listener.on_best_ask_changed(instrument, ask.price, ask.size, timestamp)
        });
    }

    if let Some(value) = change.imbalance {
        isolate(id, instrument, "on_imbalance_changed", metrics, || {
            listener.on_imbalance_changed(instrument, value, timestamp)
        });
    }

    // Each listener gets its own copy so it never shares state with the live book
    let book = state.clone();
    isolate(id, instrument, "on_book_snapshot", metrics, || {
        listener.on_book_snapshot(&book, timestamp)
    });
}

fn isolate<F>(
    id: ListenerId,
    instrument: &str,
    hook: &'static str,
    metrics: &EngineMetrics,
    callback: F,
) where
    F: FnOnce() -> anyhow::Result<()>,
{
    match catch_unwind(AssertUnwindSafe(callback)) {
        Ok(Ok(())) => {}
        Ok(Err(e)) => {
            metrics.record_listener_failure();
            warn!(
                instrument = %instrument,
                listener = %id,
                hook,
                error = %e,
                "Listener callback failed"
            );
        }
        Err(_) => {
            metrics.record_listener_failure();
            error!(
                instrument = %instrument,
                listener = %id,
                hook,
                "Listener callback panicked"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orderbook::TickSize;
    use crate::update::LevelDelta;
    use rust_decimal_macros::dec;
    use std::time::Duration;

    #[derive(Default)]
    struct Recorder {
        bids: Mutex<Vec<PriceLevel>>,
        asks: Mutex<Vec<PriceLevel>>,
        snapshots: Mutex<Vec<OrderBookState>>,
        imbalances: Mutex<Vec<f64>>,
    }

    impl BookListener for Recorder {
        fn on_best_bid_changed(
            &self,
            _: &str,
            price: Decimal,
            size: Decimal,
            _: u64,
        ) -> anyhow::Result<()> {
            self.bids.lock().push(PriceLevel { price, size });
            Ok(())
        }

        fn on_best_ask_changed(
            &self,
            _: &str,
            price: Decimal,
            size: Decimal,
            _: u64,
        ) -> anyhow::Result<()> {
            self.asks.lock().push(PriceLevel { price, size });
            Ok(())
        }

        fn on_imbalance_changed(&self, _: &str, value: f64, _: u64) -> anyhow::Result<()> {
            self.imbalances.lock().push(value);
            Ok(())
        }

        fn on_book_snapshot(&self, book: &OrderBookState, _: u64) -> anyhow::Result<()> {
            self.snapshots.lock().push(book.clone());
            Ok(())
        }
    }

    fn publisher(imbalance_lambda: Option<f64>) -> (SnapshotPublisher, Arc<NotificationPool>) {
        let pool = Arc::new(
            NotificationPool::new(2, Duration::from_secs(2), Duration::from_millis(100)).unwrap(),
        );
        let publisher = SnapshotPublisher::new(
            OrderBookState::new("BTC-X", TickSize::new(dec!(1)).unwrap()),
            Arc::new(ListenerSet::new()),
            pool.clone(),
            Arc::new(EngineMetrics::new().unwrap()),
            imbalance_lambda,
        );
        (publisher, pool)
    }

    #[test]
    fn test_publish_swaps_reference() {
        let (publisher, pool) = publisher(None);
        let before = publisher.current();
        let (next, _) = before.rebuilt(&[LevelDelta::new(dec!(100), dec!(1))], &[]);
        publisher.publish(next);

        assert!(!before.is_initialized());
        assert!(publisher.current().is_initialized());
        pool.shutdown();
    }

    #[test]
    fn test_initial_publish_suppresses_empty_side() {
        let (publisher, pool) = publisher(None);
        let recorder = Arc::new(Recorder::default());
        publisher.subscribe(recorder.clone());

        let (next, _) = publisher
            .current()
            .rebuilt(&[LevelDelta::new(dec!(100), dec!(1))], &[]);
        publisher.publish(next);
        pool.shutdown();

        assert_eq!(recorder.bids.lock().len(), 1);
        assert!(recorder.asks.lock().is_empty());
        assert_eq!(recorder.snapshots.lock().len(), 1);
    }

    #[test]
    fn test_only_changed_sides_are_notified() {
        let (publisher, pool) = publisher(Some(0.5));
        let recorder = Arc::new(Recorder::default());

        let (first, _) = publisher.current().rebuilt(
            &[LevelDelta::new(dec!(100), dec!(1))],
            &[LevelDelta::new(dec!(101), dec!(1))],
        );
        publisher.publish(first);

        let id = publisher.subscribe(recorder.clone());
        // Deeper ask level: touch unchanged on both sides
        let (second, _) = publisher
            .current()
            .with_deltas(&[], &[LevelDelta::new(dec!(105), dec!(1))]);
        publisher.publish(second);
        // Bid touch size change
        let (third, _) = publisher
            .current()
            .with_deltas(&[LevelDelta::new(dec!(100), dec!(4))], &[]);
        publisher.publish(third);
        pool.shutdown();

        assert_eq!(
            *recorder.bids.lock(),
            vec![PriceLevel {
                price: dec!(100),
                size: dec!(4)
            }]
        );
        assert!(recorder.asks.lock().is_empty());
        assert_eq!(recorder.snapshots.lock().len(), 2);
        assert!(!recorder.imbalances.lock().is_empty());
        assert!(publisher.unsubscribe(id));
        assert!(!publisher.unsubscribe(id));
    }

    #[test]
    fn test_snapshot_copy_is_independent() {
        let (publisher, pool) = publisher(None);
        let recorder = Arc::new(Recorder::default());
        publisher.subscribe(recorder.clone());

        let (first, _) = publisher
            .current()
            .rebuilt(&[LevelDelta::new(dec!(100), dec!(1))], &[]);
        publisher.publish(first);
        let (second, _) = publisher
            .current()
            .with_deltas(&[LevelDelta::new(dec!(100), dec!(0))], &[]);
        publisher.publish(second);
        pool.shutdown();

        let snapshots = recorder.snapshots.lock();
        assert_eq!(snapshots.len(), 2);
        assert!(snapshots.iter().any(|book| book.bid_side().len() == 1));
        assert!(publisher.current().bid_side().is_empty());
    }

    /// Stalls on the first best bid it sees
    #[derive(Default)]
    struct SlowStart {
        bids: Mutex<Vec<Decimal>>,
    }

    impl BookListener for SlowStart {
        fn on_best_bid_changed(
            &self,
            _: &str,
            price: Decimal,
            _: Decimal,
            _: u64,
        ) -> anyhow::Result<()> {
            if price == dec!(100) {
                std::thread::sleep(Duration::from_millis(300));
            }
            self.bids.lock().push(price);
            Ok(())
        }
    }

    #[test]
    fn test_listener_sees_changes_in_publish_order() {
        let (publisher, pool) = publisher(None);
        let slow = Arc::new(SlowStart::default());
        let recorder = Arc::new(Recorder::default());
        publisher.subscribe(slow.clone());
        publisher.subscribe(recorder.clone());

        let (first, _) = publisher
            .current()
            .rebuilt(&[LevelDelta::new(dec!(100), dec!(1))], &[]);
        publisher.publish(first);
        let (second, _) = publisher.current().with_deltas(
            &[
                LevelDelta::new(dec!(100), dec!(0)),
                LevelDelta::new(dec!(101), dec!(1)),
            ],
            &[],
        );
        publisher.publish(second);

        // The fast listener is not held back by the slow one
        let deadline = std::time::Instant::now() + Duration::from_millis(250);
        while recorder.bids.lock().len() < 2 && std::time::Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(recorder.bids.lock().len(), 2);

        pool.shutdown();
        assert_eq!(*slow.bids.lock(), vec![dec!(100), dec!(101)]);
        assert_eq!(publisher.current().best_bid().price, dec!(101));
    }

    #[test]
    fn test_publish_after_shutdown_still_swaps() {
        let (publisher, pool) = publisher(None);
        publisher.subscribe(Arc::new(Recorder::default()));
        pool.shutdown();

        let (next, _) = publisher
            .current()
            .rebuilt(&[LevelDelta::new(dec!(100), dec!(1))], &[]);
        publisher.publish(next);
        assert!(publisher.current().is_initialized());
        assert_eq!(publisher.metrics.notifications_dropped(), 1);
    }
}
