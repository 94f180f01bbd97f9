//! ORPflow HFT - Order Book Replay
//!
//! Feeds JSON-lines level updates (from a file argument or stdin) through the
//! order book engine, logs touch changes as they are published and prints a
//! per-instrument summary plus the engine counters at the end.

use std::fs::File;
use std::io::{self, BufRead, BufReader};
use std::sync::Arc;

use rust_decimal::Decimal;
use tracing::{info, warn, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use orderbook_engine::{BookListener, EngineConfig, LevelUpdate, OrderBookEngine};

/// Logs every touch change
struct TouchLogger;

impl BookListener for TouchLogger {
    fn on_best_bid_changed(
        &self,
        instrument: &str,
        price: Decimal,
        size: Decimal,
        timestamp: u64,
    ) -> anyhow::Result<()> {
        info!(
            instrument = %instrument,
            price = %price,
            size = %size,
            timestamp,
            "Best bid changed"
        );
        Ok(())
    }

    fn on_best_ask_changed(
        &self,
        instrument: &str,
        price: Decimal,
        size: Decimal,
        timestamp: u64,
    ) -> anyhow::Result<()> {
        info!(
            instrument = %instrument,
            price = %price,
            size = %size,
            timestamp,
            "Best ask changed"
        );
        Ok(())
    }

    fn on_imbalance_changed(
        &self,
        instrument: &str,
        value: f64,
        timestamp: u64,
    ) -> anyhow::Result<()> {
        info!(instrument = %instrument, imbalance = value, timestamp, "Imbalance changed");
        Ok(())
    }
}

fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(fmt::layer().json())
        .with(EnvFilter::from_default_env().add_directive(Level::INFO.into()))
        .init();

    info!("Starting ORPflow Order Book Replay");

    let config = EngineConfig::load()?;
    info!(
        default_tick_size = %config.default_tick_size,
        notify_workers = config.notify_workers,
        "Configuration loaded"
    );

    let engine = OrderBookEngine::new(config)?;
    engine.subscribe(Arc::new(TouchLogger));

    let input: Box<dyn BufRead> = match std::env::args().nth(1) {
        Some(path) => {
            info!(path = %path, "Replaying updates from file");
            Box::new(BufReader::new(File::open(path)?))
        }
        None => {
            info!("Replaying updates from stdin");
            Box::new(BufReader::new(io::stdin()))
        }
    };

    let mut applied = 0u64;
    for (line_no, line) in input.lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }

        match LevelUpdate::from_json(&line) {
            Ok(update) => {
                engine.apply(&update);
                applied += 1;
            }
            Err(e) => warn!(line = line_no + 1, error = %e, "Skipping unparsable update"),
        }
    }

    engine.shutdown();

    let lambda = engine.config().metrics_lambda;
    let vwap_params = engine.config().depth_vwap;
    for instrument in engine.instruments() {
        let Some(book) = engine.book(&instrument) else {
            continue;
        };
        let metrics = book.metrics(lambda);
        info!(
            instrument = %instrument,
            initialized = book.is_initialized(),
            best_bid = %metrics.best_bid.price,
            best_ask = %metrics.best_ask.price,
            mid_price = ?metrics.mid_price,
            spread_bps = ?metrics.spread_bps,
            imbalance = metrics.weighted_imbalance,
            depth_vwap_mid = %book.depth_vwap_midpoint(&vwap_params),
            healthy = metrics.is_healthy(),
            "Order book status"
        );
    }

    info!(updates = applied, "Replay finished");
    println!("{}", engine.metrics().encode()?);

    Ok(())
}
