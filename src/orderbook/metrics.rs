//! Order book summary metrics

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::{OrderBookState, PriceLevel};

/// Summary of a book snapshot for logging and health checks
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OrderBookMetrics {
    /// Best aggregated bid (zero sentinel when empty)
    pub best_bid: PriceLevel,

    /// Best aggregated ask (zero sentinel when empty)
    pub best_ask: PriceLevel,

    /// Mid price, only when both sides are quoted
    pub mid_price: Option<Decimal>,

    /// Spread in basis points
    pub spread_bps: Option<Decimal>,

    /// Distance-weighted imbalance in [-100, 100]
    pub weighted_imbalance: f64,

    /// Total bid depth (volume)
    pub bid_depth: Decimal,

    /// Total ask depth (volume)
    pub ask_depth: Decimal,

    /// Number of raw bid levels
    pub bid_levels: usize,

    /// Number of raw ask levels
    pub ask_levels: usize,

    /// Best bid above best ask
    pub crossed: bool,
}

impl OrderBookMetrics {
    /// Check if the order book is healthy (has valid, uncrossed data)
    pub fn is_healthy(&self) -> bool {
        self.mid_price.is_some() && self.bid_levels > 0 && self.ask_levels > 0 && !self.crossed
    }

    /// Get volume ratio (bid_depth / ask_depth)
    pub fn volume_ratio(&self) -> Option<Decimal> {
        if self.ask_depth > Decimal::ZERO {
            Some(self.bid_depth / self.ask_depth)
        } else {
            None
        }
    }
}

impl OrderBookState {
    /// Summarise this snapshot
    pub fn metrics(&self, imbalance_lambda: f64) -> OrderBookMetrics {
        let best_bid = self.best_bid();
        let best_ask = self.best_ask();
        let quoted = !best_bid.is_empty() && !best_ask.is_empty();

        OrderBookMetrics {
            best_bid,
            best_ask,
            mid_price: quoted.then(|| self.midpoint()),
            spread_bps: self.spread_bps(),
            weighted_imbalance: self.weighted_imbalance(imbalance_lambda),
            bid_depth: self.bid_side().total_size(),
            ask_depth: self.ask_side().total_size(),
            bid_levels: self.bid_side().len(),
            ask_levels: self.ask_side().len(),
            crossed: self.is_crossed(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orderbook::TickSize;
    use crate::update::LevelDelta;
    use rust_decimal_macros::dec;

    #[test]
    fn test_metrics_for_two_sided_book() {
        let empty = OrderBookState::new("BTC-X", TickSize::new(dec!(1)).unwrap());
        let (book, _) = empty.rebuilt(
            &[
                LevelDelta::new(dec!(100), dec!(1.0)),
                LevelDelta::new(dec!(99), dec!(2.0)),
            ],
            &[LevelDelta::new(dec!(101), dec!(1.5))],
        );

        let metrics = book.metrics(0.5);
        assert!(metrics.is_healthy());
        assert_eq!(metrics.mid_price, Some(dec!(100.5)));
        assert_eq!(metrics.bid_depth, dec!(3.0));
        assert_eq!(metrics.ask_depth, dec!(1.5));
        assert_eq!(metrics.bid_levels, 2);
        assert_eq!(metrics.volume_ratio(), Some(dec!(2)));
        assert!(metrics.weighted_imbalance > 0.0);
    }

    #[test]
    fn test_metrics_one_sided_is_unhealthy() {
        let empty = OrderBookState::new("BTC-X", TickSize::new(dec!(1)).unwrap());
        let (book, _) = empty.rebuilt(&[LevelDelta::new(dec!(100), dec!(1.0))], &[]);

        let metrics = book.metrics(0.5);
        assert!(!metrics.is_healthy());
        assert!(metrics.mid_price.is_none());
        assert!(metrics.volume_ratio().is_none());
    }
}
