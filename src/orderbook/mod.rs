//! Order book module
//!
//! Immutable per-instrument book state, its two sides and the pricing
//! analytics computed over it.

mod analytics;
mod book;
mod metrics;
mod side;

pub use analytics::DepthVwapParams;
pub use book::OrderBookState;
pub use metrics::OrderBookMetrics;
pub use side::PriceLevelSide;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::error::{BookError, Result};

/// Side of the order book
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Side {
    Bid,
    Ask,
}

/// An aggregated (or raw) level: price and resting size
///
/// The default value is the "no price" sentinel used for empty sides.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PriceLevel {
    pub price: Decimal,
    pub size: Decimal,
}

impl PriceLevel {
    pub fn is_empty(&self) -> bool {
        self.price.is_zero()
    }
}

/// Finest tick accepted; keeps `price / tick` representable for any
/// realistic price
pub const MAX_TICK_DECIMALS: u32 = 12;

/// Aggregation granularity for display and best-price computation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "Decimal", into = "Decimal")]
pub struct TickSize(Decimal);

impl TickSize {
    /// Fails fast on a non-positive or overly fine tick
    pub fn new(value: Decimal) -> Result<Self> {
        if value <= Decimal::ZERO || value.normalize().scale() > MAX_TICK_DECIMALS {
            return Err(BookError::InvalidTickSize(value));
        }
        Ok(Self(value))
    }

    pub fn value(&self) -> Decimal {
        self.0
    }
}

impl TryFrom<Decimal> for TickSize {
    type Error = BookError;

    fn try_from(value: Decimal) -> Result<Self> {
        Self::new(value)
    }
}

impl From<TickSize> for Decimal {
    fn from(tick: TickSize) -> Self {
        tick.0
    }
}

/// `(a + b) / 2` without overflowing near `Decimal::MAX`
pub(crate) fn mean(a: Decimal, b: Decimal) -> Decimal {
    a.checked_add(b)
        .map(|sum| sum / Decimal::TWO)
        .or_else(|| (a / Decimal::TWO).checked_add(b / Decimal::TWO))
        .unwrap_or(Decimal::MAX)
}

impl std::fmt::Display for TickSize {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}
