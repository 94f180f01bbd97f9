//! Immutable order book state for one instrument
//!
//! A published `OrderBookState` is never mutated. Writers clone it, apply the
//! next batch to the copy and publish the copy, so readers holding an older
//! reference keep a consistent frozen view.

use rust_decimal::Decimal;

use super::{mean, PriceLevel, PriceLevelSide, Side, TickSize};
use crate::update::LevelDelta;

/// Point-in-time book for a single instrument
#[derive(Debug, Clone, PartialEq)]
pub struct OrderBookState {
    instrument: String,
    tick_size: TickSize,
    bids: PriceLevelSide,
    asks: PriceLevelSide,
    /// Whether the book has been established from a snapshot
    initialized: bool,
    /// Sequence value of the last applied update, if the feed carries one
    nonce: Option<u64>,
    /// Event time of the last applied update
    timestamp: u64,
}

impl OrderBookState {
    /// Create an empty, uninitialized book
    pub fn new(instrument: &str, tick_size: TickSize) -> Self {
        Self {
            instrument: instrument.to_string(),
            tick_size,
            bids: PriceLevelSide::new(Side::Bid),
            asks: PriceLevelSide::new(Side::Ask),
            initialized: false,
            nonce: None,
            timestamp: 0,
        }
    }

    /// Build the next state by replacing both sides wholesale
    ///
    /// Returns the new state and the number of malformed rows dropped.
    pub fn rebuilt(&self, bids: &[LevelDelta], asks: &[LevelDelta]) -> (Self, usize) {
        let mut next = Self::new(&self.instrument, self.tick_size);
        let dropped = next.apply_rows(bids, asks);
        next.initialized = true;
        (next, dropped)
    }

    /// Build the next state by upserting rows into a copy of this one
    pub fn with_deltas(&self, bids: &[LevelDelta], asks: &[LevelDelta]) -> (Self, usize) {
        let mut next = self.clone();
        let dropped = next.apply_rows(bids, asks);
        next.initialized = true;
        (next, dropped)
    }

    fn apply_rows(&mut self, bids: &[LevelDelta], asks: &[LevelDelta]) -> usize {
        let tick = self.tick_size;
        let bad_bids = bids.iter().filter(|row| !self.bids.apply(row, tick)).count();
        let bad_asks = asks.iter().filter(|row| !self.asks.apply(row, tick)).count();
        bad_bids + bad_asks
    }

    pub(crate) fn stamped(mut self, nonce: Option<u64>, timestamp: u64) -> Self {
        self.nonce = nonce;
        self.timestamp = timestamp;
        self
    }

    pub fn instrument(&self) -> &str {
        &self.instrument
    }

    pub fn tick_size(&self) -> TickSize {
        self.tick_size
    }

    pub fn bid_side(&self) -> &PriceLevelSide {
        &self.bids
    }

    pub fn ask_side(&self) -> &PriceLevelSide {
        &self.asks
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    pub fn nonce(&self) -> Option<u64> {
        self.nonce
    }

    pub fn timestamp(&self) -> u64 {
        self.timestamp
    }

    /// Best aggregated bid, or the zero sentinel
    pub fn best_bid(&self) -> PriceLevel {
        self.bids.best_level(self.tick_size)
    }

    /// Best aggregated ask, or the zero sentinel
    pub fn best_ask(&self) -> PriceLevel {
        self.asks.best_level(self.tick_size)
    }

    /// `(best_bid + best_ask) / 2`, using zero for an empty side
    ///
    /// A one-sided book yields half the present price. Callers must check
    /// both sides before trusting the value.
    pub fn midpoint(&self) -> Decimal {
        let bid = self.bids.best_price(self.tick_size);
        let ask = self.asks.best_price(self.tick_size);
        mean(bid, ask)
    }

    /// Spread in basis points of the midpoint, when both sides are quoted
    pub fn spread_bps(&self) -> Option<Decimal> {
        let bid = self.best_bid();
        let ask = self.best_ask();
        if bid.is_empty() || ask.is_empty() {
            return None;
        }
        let mid = self.midpoint();
        if mid > Decimal::ZERO {
            (ask.price - bid.price)
                .checked_div(mid)?
                .checked_mul(Decimal::from(10_000))
        } else {
            None
        }
    }

    /// Best bid above best ask
    pub fn is_crossed(&self) -> bool {
        let bid = self.best_bid();
        let ask = self.best_ask();
        !bid.is_empty() && !ask.is_empty() && bid.price > ask.price
    }

    /// Top `depth` aggregated bids, best first
    pub fn bids(&self, depth: usize) -> Vec<PriceLevel> {
        self.bids.aggregated_levels(self.tick_size, depth)
    }

    /// Top `depth` aggregated asks, best first
    pub fn asks(&self, depth: usize) -> Vec<PriceLevel> {
        self.asks.aggregated_levels(self.tick_size, depth)
    }
}
