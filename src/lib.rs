//! ORPflow HFT - Order Book Engine Library
//!
//! This crate maintains sequence-reconciled limit order books per instrument
//! from snapshot and delta feeds, publishes them as immutable snapshots for
//! lock-free reads, and computes pricing analytics over those snapshots.

pub mod config;
pub mod engine;
pub mod error;
pub mod orderbook;
pub mod publisher;
pub mod reconcile;
pub mod telemetry;
pub mod update;

pub use config::EngineConfig;
pub use engine::OrderBookEngine;
pub use error::{BookError, Result};
pub use orderbook::{
    DepthVwapParams, OrderBookMetrics, OrderBookState, PriceLevel, PriceLevelSide, Side, TickSize,
};
pub use publisher::{BookListener, ListenerId, ListenerSet, NotificationPool, SnapshotPublisher};
pub use reconcile::{classify, Classification, ReconciliationController, SequenceState};
pub use telemetry::EngineMetrics;
pub use update::{LevelDelta, LevelUpdate};
