//! Order book engine
//!
//! Routes level updates to per-instrument books. Writers for one instrument
//! are serialized by that instrument's controller lock, which covers the
//! whole decide, build and publish step; writers for different instruments
//! never contend. Readers go straight to the published snapshot.

use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, warn};

use crate::config::EngineConfig;
use crate::error::{BookError, Result};
use crate::orderbook::{OrderBookState, TickSize};
use crate::publisher::{BookListener, ListenerId, ListenerSet, NotificationPool, SnapshotPublisher};
use crate::reconcile::{Classification, ReconciliationController, SequenceState};
use crate::telemetry::EngineMetrics;
use crate::update::LevelUpdate;

/// One instrument: its writer-side state machine and its published book
struct InstrumentBook {
    controller: Mutex<ReconciliationController>,
    publisher: SnapshotPublisher,
}

/// Maintains consistent, queryable books for many instruments
pub struct OrderBookEngine {
    config: EngineConfig,
    default_tick: TickSize,
    books: RwLock<HashMap<String, Arc<InstrumentBook>>>,
    listeners: Arc<ListenerSet>,
    pool: Arc<NotificationPool>,
    metrics: Arc<EngineMetrics>,
}

impl OrderBookEngine {
    /// Build an engine with its own notification pool and metrics
    pub fn new(config: EngineConfig) -> Result<Self> {
        config.validate()?;
        let pool = NotificationPool::new(
            config.notify_workers,
            config.drain_timeout(),
            config.force_timeout(),
        )?;
        Self::with_collaborators(config, Arc::new(pool), Arc::new(EngineMetrics::new()?))
    }

    /// Build an engine around explicitly supplied collaborators
    pub fn with_collaborators(
        config: EngineConfig,
        pool: Arc<NotificationPool>,
        metrics: Arc<EngineMetrics>,
    ) -> Result<Self> {
        config.validate()?;
        let default_tick = config.default_tick()?;

        Ok(Self {
            config,
            default_tick,
            books: RwLock::new(HashMap::new()),
            listeners: Arc::new(ListenerSet::new()),
            pool,
            metrics,
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn metrics(&self) -> &Arc<EngineMetrics> {
        &self.metrics
    }

    /// Register an instrument with its own tick size
    ///
    /// Fails if the instrument already has a book.
    pub fn register_instrument(&self, instrument: &str, tick_size: TickSize) -> Result<()> {
        let mut books = self.books.write();
        if books.contains_key(instrument) {
            return Err(BookError::ConfigError(format!(
                "instrument {instrument} is already registered"
            )));
        }
        books.insert(instrument.to_string(), Arc::new(self.new_book(instrument, tick_size)));
        info!(instrument = %instrument, tick_size = %tick_size, "Instrument registered");
        Ok(())
    }

    fn new_book(&self, instrument: &str, tick_size: TickSize) -> InstrumentBook {
        InstrumentBook {
            controller: Mutex::new(ReconciliationController::new(instrument)),
            publisher: SnapshotPublisher::new(
                OrderBookState::new(instrument, tick_size),
                self.listeners.clone(),
                self.pool.clone(),
                self.metrics.clone(),
                self.config.imbalance_lambda,
            ),
        }
    }

    fn entry(&self, instrument: &str) -> Arc<InstrumentBook> {
        if let Some(book) = self.books.read().get(instrument) {
            return book.clone();
        }

        let mut books = self.books.write();
        books
            .entry(instrument.to_string())
            .or_insert_with(|| {
                info!(
                    instrument = %instrument,
                    tick_size = %self.default_tick,
                    "Instrument registered with default tick size"
                );
                Arc::new(self.new_book(instrument, self.default_tick))
            })
            .clone()
    }

    fn existing(&self, instrument: &str) -> Option<Arc<InstrumentBook>> {
        self.books.read().get(instrument).cloned()
    }

    /// Reconcile and publish one update
    pub fn apply(&self, update: &LevelUpdate) -> Classification {
        let book = self.entry(&update.instrument);

        let mut controller = book.controller.lock();
        let current = book.publisher.current();
        let reconciled = controller.apply(&current, update);

        self.metrics.record_update(reconciled.classification);
        self.metrics.record_malformed(reconciled.malformed);

        if let Some(next) = reconciled.state {
            if next.is_crossed() {
                self.metrics.record_crossed();
                warn!(
                    instrument = %update.instrument,
                    best_bid = %next.best_bid().price,
                    best_ask = %next.best_ask().price,
                    "Book is crossed"
                );
            }
            book.publisher.publish(next);
        }

        reconciled.classification
    }

    /// Latest published book for an instrument
    pub fn book(&self, instrument: &str) -> Option<Arc<OrderBookState>> {
        self.existing(instrument).map(|book| book.publisher.current())
    }

    pub fn is_initialized(&self, instrument: &str) -> bool {
        self.book(instrument)
            .map(|book| book.is_initialized())
            .unwrap_or(false)
    }

    pub fn sequence_state(&self, instrument: &str) -> Option<SequenceState> {
        self.existing(instrument)
            .map(|book| book.controller.lock().sequence())
    }

    /// Instruments with a book, sorted
    pub fn instruments(&self) -> Vec<String> {
        let mut instruments: Vec<String> = self.books.read().keys().cloned().collect();
        instruments.sort();
        instruments
    }

    /// Empty both sides and forget the sequence, e.g. on resubscribe
    pub fn clear(&self, instrument: &str) -> Result<()> {
        let book = self
            .existing(instrument)
            .ok_or_else(|| BookError::UnknownInstrument(instrument.to_string()))?;

        let mut controller = book.controller.lock();
        controller.reset();
        let tick_size = book.publisher.current().tick_size();
        book.publisher
            .replace_quietly(OrderBookState::new(instrument, tick_size));

        info!(instrument = %instrument, "Book cleared");
        Ok(())
    }

    pub fn subscribe(&self, listener: Arc<dyn BookListener>) -> ListenerId {
        self.listeners.subscribe(listener)
    }

    pub fn unsubscribe(&self, id: ListenerId) -> bool {
        self.listeners.unsubscribe(id)
    }

    /// Drain the notification pool; books stay readable afterwards
    pub fn shutdown(&self) {
        info!(instruments = self.books.read().len(), "Shutting down order book engine");
        self.pool.shutdown();
    }
}
