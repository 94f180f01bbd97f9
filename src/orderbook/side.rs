//! One side of an order book
//!
//! Raw levels are kept at the feed's native price granularity in a BTreeMap.
//! Aggregation into tick buckets happens on read and rounds toward the worse
//! price (down for bids, up for asks), so a visible best price is never more
//! favourable than what actually rests in the book.

use rust_decimal::Decimal;
use std::collections::BTreeMap;
use std::ops::Bound;
use tracing::warn;

use super::{PriceLevel, Side, TickSize};
use crate::update::LevelDelta;

/// Price -> size table for a single side of a single instrument
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PriceLevelSide {
    side: Side,
    /// Raw levels; every stored size is > 0
    levels: BTreeMap<Decimal, Decimal>,
}

impl PriceLevelSide {
    pub fn new(side: Side) -> Self {
        Self {
            side,
            levels: BTreeMap::new(),
        }
    }

    pub fn side(&self) -> Side {
        self.side
    }

    /// True for bids: the best price is the maximum
    pub fn is_descending(&self) -> bool {
        self.side == Side::Bid
    }

    pub fn is_empty(&self) -> bool {
        self.levels.is_empty()
    }

    /// Number of raw (unaggregated) levels
    pub fn len(&self) -> usize {
        self.levels.len()
    }

    pub fn clear(&mut self) {
        self.levels.clear();
    }

    /// Store or overwrite a level; a non-positive size removes it
    pub fn upsert(&mut self, price: Decimal, size: Decimal) {
        if size > Decimal::ZERO {
            self.levels.insert(price, size);
        } else {
            self.levels.remove(&price);
        }
    }

    /// Apply a feed row, dropping it if malformed
    ///
    /// A row is malformed when its size is missing, its price is not
    /// positive, or its tick bucket or notional cannot be represented.
    /// Returns false when the row was rejected.
    pub fn apply(&mut self, delta: &LevelDelta, tick: TickSize) -> bool {
        let Some(size) = delta.size else {
            warn!(
                side = ?self.side,
                price = %delta.price,
                "Dropping level with missing size"
            );
            return false;
        };

        if delta.price <= Decimal::ZERO {
            warn!(
                side = ?self.side,
                price = %delta.price,
                size = %size,
                "Dropping level with non-positive price"
            );
            return false;
        }

        let representable = self.checked_bucket(delta.price, tick).is_some()
            && delta.price.checked_mul(size).is_some();
        if size > Decimal::ZERO && !representable {
            warn!(
                side = ?self.side,
                price = %delta.price,
                size = %size,
                tick_size = %tick,
                "Dropping level outside decimal range"
            );
            return false;
        }

        self.upsert(delta.price, size);
        true
    }

    /// Raw size stored at an exact price
    pub fn raw_size(&self, price: Decimal) -> Option<Decimal> {
        self.levels.get(&price).copied()
    }

    /// Tick bucket a raw price falls into, `None` if it overflows
    pub fn checked_bucket(&self, price: Decimal, tick: TickSize) -> Option<Decimal> {
        let tick = tick.value();
        let units = price.checked_div(tick)?;
        let units = match self.side {
            Side::Bid => units.floor(),
            Side::Ask => units.ceil(),
        };
        units.checked_mul(tick)
    }

    /// Tick bucket a raw price falls into
    ///
    /// A price whose bucket cannot be represented is its own bucket.
    pub fn bucket(&self, price: Decimal, tick: TickSize) -> Decimal {
        self.checked_bucket(price, tick).unwrap_or(price)
    }

    /// Best aggregated price, or zero when the side is empty
    pub fn best_price(&self, tick: TickSize) -> Decimal {
        let best_raw = match self.side {
            Side::Bid => self.levels.keys().next_back(),
            Side::Ask => self.levels.keys().next(),
        };

        // Bucketing is monotone, so the best raw price lands in the best bucket
        best_raw
            .map(|price| self.bucket(*price, tick))
            .unwrap_or(Decimal::ZERO)
    }

    /// Size of the aggregated bucket at an already-aggregated price
    pub fn size_at_price(&self, aggregated_price: Decimal, tick: TickSize) -> Decimal {
        let width = tick.value();
        let range = match self.side {
            // Bids: raw prices in [bucket, bucket + tick)
            Side::Bid => (
                Bound::Included(aggregated_price),
                aggregated_price
                    .checked_add(width)
                    .map_or(Bound::Unbounded, Bound::Excluded),
            ),
            // Asks: raw prices in (bucket - tick, bucket]
            Side::Ask => (
                aggregated_price
                    .checked_sub(width)
                    .map_or(Bound::Unbounded, Bound::Excluded),
                Bound::Included(aggregated_price),
            ),
        };

        self.levels
            .range(range)
            .fold(Decimal::ZERO, |total, (_, size)| total.saturating_add(*size))
    }

    /// Best aggregated level, or the zero sentinel when empty
    pub fn best_level(&self, tick: TickSize) -> PriceLevel {
        if self.is_empty() {
            return PriceLevel::default();
        }
        let price = self.best_price(tick);
        PriceLevel {
            price,
            size: self.size_at_price(price, tick),
        }
    }

    /// Full aggregation of the side at the given tick size
    pub fn aggregate(&self, tick: TickSize) -> BTreeMap<Decimal, Decimal> {
        let mut buckets = BTreeMap::new();
        for (price, size) in &self.levels {
            let total = buckets
                .entry(self.bucket(*price, tick))
                .or_insert(Decimal::ZERO);
            *total = total.saturating_add(*size);
        }
        buckets
    }

    /// Aggregated levels ordered best to worst, limited to `depth` entries
    pub fn aggregated_levels(&self, tick: TickSize, depth: usize) -> Vec<PriceLevel> {
        let buckets = self.aggregate(tick);
        let to_level = |(price, size): (Decimal, Decimal)| PriceLevel { price, size };

        match self.side {
            Side::Bid => buckets.into_iter().rev().take(depth).map(to_level).collect(),
            Side::Ask => buckets.into_iter().take(depth).map(to_level).collect(),
        }
    }

    /// Total resting size on this side
    pub fn total_size(&self) -> Decimal {
        self.levels
            .values()
            .fold(Decimal::ZERO, |total, size| total.saturating_add(*size))
    }
}
