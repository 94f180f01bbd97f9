//! Pricing analytics over an immutable book snapshot
//!
//! Prices and sizes stay in `Decimal`; only distance weighting and
//! exponential decay run in `f64`. Returned prices are rounded half-up to
//! `PRICE_DP` decimal places so identical books give identical results.
//! Accumulations use checked arithmetic: a walk stops at the first level
//! that would overflow, and a result that cannot be represented is absent.

use rust_decimal::prelude::{FromPrimitive, ToPrimitive};
use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};

use super::{mean, OrderBookState, PriceLevel, TickSize};

/// Decimal places kept on analytic prices
pub const PRICE_DP: u32 = 8;

/// Basis points per unit
const BPS: f64 = 10_000.0;

/// Parameters for the depth-capped VWAP midpoint
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DepthVwapParams {
    /// Target depth as a multiple of `slice_size`
    pub slice_multiple: f64,
    /// Typical order slice, in base units
    pub slice_size: f64,
    /// Maximum number of levels walked per side
    pub max_levels: usize,
    /// Stop once a level is this many basis points from the touch
    pub bp_cap: f64,
    /// Stop once a level is this many ticks from the touch
    pub tick_cap: u32,
    /// Per-level exponential decay; 0 weights all levels equally
    pub lambda_decay: f64,
}

impl Default for DepthVwapParams {
    fn default() -> Self {
        Self {
            slice_multiple: 5.0,
            slice_size: 1.0,
            max_levels: 10,
            bp_cap: 15.0,
            tick_cap: 6,
            lambda_decay: 0.0,
        }
    }
}

impl DepthVwapParams {
    pub fn target_depth(&self) -> f64 {
        self.slice_multiple * self.slice_size
    }

    fn level_weight(&self, index: usize) -> Decimal {
        if self.lambda_decay > 0.0 {
            Decimal::from_f64((-self.lambda_decay * index as f64).exp()).unwrap_or(Decimal::ZERO)
        } else {
            Decimal::ONE
        }
    }

    /// Target depth as a decimal; unbounded when not representable
    fn target_depth_decimal(&self) -> Decimal {
        Decimal::from_f64(self.target_depth()).unwrap_or(Decimal::MAX)
    }
}

fn round_price(value: Decimal) -> Decimal {
    value.round_dp_with_strategy(PRICE_DP, RoundingStrategy::MidpointAwayFromZero)
}

fn to_f64(value: Decimal) -> f64 {
    value.to_f64().unwrap_or(0.0)
}

/// Running `Σ price·size` and `Σ size`
#[derive(Debug, Clone, Copy, Default)]
struct Vwap {
    notional: Decimal,
    volume: Decimal,
}

impl Vwap {
    /// `None` once either sum overflows
    fn add(self, price: Decimal, size: Decimal) -> Option<Self> {
        Some(Self {
            notional: self.notional.checked_add(price.checked_mul(size)?)?,
            volume: self.volume.checked_add(size)?,
        })
    }

    fn price(&self) -> Option<Decimal> {
        if self.volume.is_zero() {
            None
        } else {
            self.notional.checked_div(self.volume)
        }
    }
}

/// Distance caps measured from the touch of one side
struct TouchCaps {
    touch: Decimal,
    reference_mid: Decimal,
    tick: TickSize,
    bp_cap: f64,
    tick_cap: f64,
}

impl TouchCaps {
    fn new(
        touch: Decimal,
        reference_mid: Decimal,
        tick: TickSize,
        params: &DepthVwapParams,
    ) -> Self {
        Self {
            touch,
            reference_mid,
            tick,
            bp_cap: params.bp_cap,
            tick_cap: f64::from(params.tick_cap),
        }
    }

    /// True once a level is too far from the touch to be used
    ///
    /// A distance too large to represent counts as too far.
    fn exceeded(&self, price: Decimal) -> bool {
        let Some(distance) = price.checked_sub(self.touch).map(|d| d.abs()) else {
            return true;
        };

        match distance.checked_div(self.tick.value()) {
            Some(ticks) if to_f64(ticks) >= self.tick_cap => return true,
            None => return true,
            Some(_) => {}
        }

        if self.reference_mid > Decimal::ZERO {
            match distance.checked_div(self.reference_mid) {
                Some(ratio) if to_f64(ratio) * BPS >= self.bp_cap => return true,
                None => return true,
                Some(_) => {}
            }
        }

        false
    }
}

impl OrderBookState {
    /// Distance-weighted order book imbalance in [-100, 100]
    ///
    /// Each level contributes `size * exp(-lambda * distance)` where distance
    /// is measured from the midpoint toward the worse price, floored at zero
    /// for levels on the far side of the midpoint (one-sided or crossed
    /// books). Returns 0 for an empty book or when both weighted sums vanish.
    pub fn weighted_imbalance(&self, lambda: f64) -> f64 {
        let mid = to_f64(self.midpoint());
        if mid == 0.0 {
            return 0.0;
        }

        let distances = |levels: Vec<PriceLevel>, distance: &dyn Fn(f64) -> f64| {
            levels
                .iter()
                .map(|level| (to_f64(level.size), distance(to_f64(level.price)).max(0.0)))
                .collect::<Vec<_>>()
        };
        let bids = distances(self.bids(usize::MAX), &|price: f64| mid - price);
        let asks = distances(self.asks(usize::MAX), &|price: f64| price - mid);

        // Measuring from the nearest level scales both sums by the same
        // factor, which cancels in the ratio and keeps exp() in range
        let nearest = bids
            .iter()
            .chain(asks.iter())
            .map(|(_, distance)| *distance)
            .fold(f64::INFINITY, f64::min);
        if !nearest.is_finite() {
            return 0.0;
        }

        let weigh = |levels: &[(f64, f64)]| -> f64 {
            levels
                .iter()
                .map(|(size, distance)| size * (-lambda * (distance - nearest)).exp())
                .sum()
        };
        let bid_weighted = weigh(bids.as_slice());
        let ask_weighted = weigh(asks.as_slice());

        let total = bid_weighted + ask_weighted;
        if total == 0.0 || !total.is_finite() {
            return 0.0;
        }

        let value = (bid_weighted - ask_weighted) / total * 100.0;
        if value.is_finite() {
            value.clamp(-100.0, 100.0)
        } else {
            0.0
        }
    }

    /// Centre of gravity of the top `levels` on both sides at the book's tick
    pub fn center_of_gravity_midpoint(&self, levels: usize) -> Option<Decimal> {
        self.center_of_gravity_midpoint_at(levels, self.tick_size())
    }

    /// Combined-volume weighted price over the top `levels` per side
    ///
    /// Both sides share one denominator, so the heavier side pulls the result
    /// toward itself. `None` when no volume is selected.
    pub fn center_of_gravity_midpoint_at(&self, levels: usize, tick: TickSize) -> Option<Decimal> {
        let bids = self.bid_side().aggregated_levels(tick, levels);
        let asks = self.ask_side().aggregated_levels(tick, levels);

        let vwap = bids
            .iter()
            .chain(asks.iter())
            .try_fold(Vwap::default(), |vwap, level| vwap.add(level.price, level.size))?;

        vwap.price().map(round_price)
    }

    /// Average of per-side VWAPs over the top `levels` at the book's tick
    pub fn vwap_midpoint(&self, levels: usize) -> Option<Decimal> {
        self.vwap_midpoint_at(levels, self.tick_size())
    }

    /// Each side's own VWAP over its top `levels`, then the mean of the two
    ///
    /// `None` when either side has no volume in range.
    pub fn vwap_midpoint_at(&self, levels: usize, tick: TickSize) -> Option<Decimal> {
        let bid_vwap = side_vwap(&self.bid_side().aggregated_levels(tick, levels))?;
        let ask_vwap = side_vwap(&self.ask_side().aggregated_levels(tick, levels))?;
        Some(round_price(mean(bid_vwap, ask_vwap)))
    }

    /// Mean of depth-capped, decay-weighted per-side VWAPs
    ///
    /// Each side is walked best to worst and stops at the first of: `max_levels`
    /// levels, `tick_cap` ticks or `bp_cap` basis points from the touch, or
    /// `target_depth()` cumulative size. A side with no qualifying level falls
    /// back to its best price.
    pub fn depth_vwap_midpoint(&self, params: &DepthVwapParams) -> Decimal {
        let tick = self.tick_size();
        let mid = self.midpoint();

        let bid_vwap = depth_side_vwap(&self.bids(params.max_levels), mid, tick, params);
        let ask_vwap = depth_side_vwap(&self.asks(params.max_levels), mid, tick, params);

        round_price(mean(bid_vwap, ask_vwap))
    }

    /// Mean of the average fill prices for `target_units` on each side
    ///
    /// The last level touched is partially consumed. The bp and tick caps of
    /// `params` bound the walk; a side that fills nothing falls back to its
    /// best price.
    pub fn impact_vwap_to_fill(
        &self,
        target_units: Decimal,
        params: &DepthVwapParams,
    ) -> Decimal {
        let tick = self.tick_size();
        let mid = self.midpoint();

        let bids = self.bids(usize::MAX);
        let asks = self.asks(usize::MAX);
        let bid_vwap = impact_side_vwap(&bids, target_units, mid, tick, params);
        let ask_vwap = impact_side_vwap(&asks, target_units, mid, tick, params);

        round_price(mean(bid_vwap, ask_vwap))
    }
}

fn side_vwap(levels: &[PriceLevel]) -> Option<Decimal> {
    levels
        .iter()
        .try_fold(Vwap::default(), |vwap, level| vwap.add(level.price, level.size))?
        .price()
}

fn depth_side_vwap(
    levels: &[PriceLevel],
    mid: Decimal,
    tick: TickSize,
    params: &DepthVwapParams,
) -> Decimal {
    let Some(best) = levels.first() else {
        return Decimal::ZERO;
    };

    let caps = TouchCaps::new(best.price, mid, tick, params);
    let target_depth = params.target_depth_decimal();

    let mut weighted = Vwap::default();
    let mut cumulative = Decimal::ZERO;

    for (index, level) in levels.iter().enumerate() {
        if index >= params.max_levels || caps.exceeded(level.price) || cumulative >= target_depth {
            break;
        }

        let Some(next) = level
            .size
            .checked_mul(params.level_weight(index))
            .and_then(|weighted_size| weighted.add(level.price, weighted_size))
        else {
            break;
        };
        weighted = next;
        cumulative = cumulative.saturating_add(level.size);
    }

    weighted.price().unwrap_or(best.price)
}

fn impact_side_vwap(
    levels: &[PriceLevel],
    target_units: Decimal,
    mid: Decimal,
    tick: TickSize,
    params: &DepthVwapParams,
) -> Decimal {
    let Some(best) = levels.first() else {
        return Decimal::ZERO;
    };

    let caps = TouchCaps::new(best.price, mid, tick, params);
    let mut remaining = target_units;
    let mut filled = Vwap::default();

    for level in levels {
        if remaining <= Decimal::ZERO || caps.exceeded(level.price) {
            break;
        }
        let take = level.size.min(remaining);
        let Some(next) = filled.add(level.price, take) else {
            break;
        };
        filled = next;
        remaining -= take;
    }

    filled.price().unwrap_or(best.price)
}
