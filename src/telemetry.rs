//! Engine counters
//!
//! Each engine owns its own prometheus registry, so several engines in one
//! process never collide on metric names.

use prometheus::{Encoder, IntCounter, IntCounterVec, Opts, Registry, TextEncoder};

use crate::error::{BookError, Result};
use crate::reconcile::Classification;

pub struct EngineMetrics {
    registry: Registry,
    updates: IntCounterVec,
    malformed_levels: IntCounter,
    crossed_books: IntCounter,
    listener_failures: IntCounter,
    notifications_dropped: IntCounter,
}

impl EngineMetrics {
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        let updates = IntCounterVec::new(
            Opts::new("book_updates_total", "Level updates by reconciliation outcome"),
            &["classification"],
        )?;
        let malformed_levels = IntCounter::new(
            "book_malformed_levels_total",
            "Level rows dropped as malformed or out of decimal range",
        )?;
        let crossed_books = IntCounter::new(
            "book_crossed_total",
            "Published states whose best bid was above the best ask",
        )?;
        let listener_failures = IntCounter::new(
            "book_listener_failures_total",
            "Listener callbacks that returned an error or panicked",
        )?;
        let notifications_dropped = IntCounter::new(
            "book_notifications_dropped_total",
            "Listener notifications not dispatched because the pool was shut down",
        )?;

        registry.register(Box::new(updates.clone()))?;
        registry.register(Box::new(malformed_levels.clone()))?;
        registry.register(Box::new(crossed_books.clone()))?;
        registry.register(Box::new(listener_failures.clone()))?;
        registry.register(Box::new(notifications_dropped.clone()))?;

        // Pre-create every label so all outcomes show up in the exposition
        for classification in Classification::ALL {
            updates.with_label_values(&[classification.as_str()]);
        }

        Ok(Self {
            registry,
            updates,
            malformed_levels,
            crossed_books,
            listener_failures,
            notifications_dropped,
        })
    }

    pub fn record_update(&self, classification: Classification) {
        self.updates.with_label_values(&[classification.as_str()]).inc();
    }

    pub fn record_malformed(&self, count: usize) {
        if count > 0 {
            self.malformed_levels.inc_by(count as u64);
        }
    }

    pub fn record_crossed(&self) {
        self.crossed_books.inc();
    }

    pub fn record_listener_failure(&self) {
        self.listener_failures.inc();
    }

    pub fn record_dropped_notifications(&self, count: usize) {
        if count > 0 {
            self.notifications_dropped.inc_by(count as u64);
        }
    }

    pub fn updates(&self, classification: Classification) -> u64 {
        self.updates.with_label_values(&[classification.as_str()]).get()
    }

    pub fn malformed_levels(&self) -> u64 {
        self.malformed_levels.get()
    }

    pub fn crossed_books(&self) -> u64 {
        self.crossed_books.get()
    }

    pub fn listener_failures(&self) -> u64 {
        self.listener_failures.get()
    }

    pub fn notifications_dropped(&self) -> u64 {
        self.notifications_dropped.get()
    }

    /// Render all counters in the prometheus text format
    pub fn encode(&self) -> Result<String> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder.encode(&self.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| BookError::MetricsError(e.to_string()))
    }
}

impl std::fmt::Debug for EngineMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineMetrics")
            .field("malformed_levels", &self.malformed_levels())
            .field("crossed_books", &self.crossed_books())
            .field("listener_failures", &self.listener_failures())
            .finish()
    }
}
