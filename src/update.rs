//! Level update records handed to the engine by feed adapters
//!
//! A `LevelUpdate` is one batch of per-side level changes for a single
//! instrument, optionally tagged with the exchange sequence range it covers.

use rust_decimal::prelude::FromPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Deserializer, Serialize};
use std::str::FromStr;

use crate::error::Result;

/// One incoming row for a side of the book
///
/// `size == None` marks a malformed row (missing or non-numeric size). The
/// side drops such rows instead of failing the whole batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LevelDelta {
    pub price: Decimal,

    #[serde(default, deserialize_with = "deserialize_lenient_size")]
    pub size: Option<Decimal>,
}

impl LevelDelta {
    pub fn new(price: Decimal, size: Decimal) -> Self {
        Self {
            price,
            size: Some(size),
        }
    }

    /// Build a row from binary floats; NaN or infinite sizes become malformed
    pub fn from_f64(price: f64, size: f64) -> Option<Self> {
        let price = Decimal::from_f64(price)?;
        Some(Self {
            price,
            size: if size.is_finite() {
                Decimal::from_f64(size)
            } else {
                None
            },
        })
    }
}

/// A batch of level changes for one instrument
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LevelUpdate {
    pub instrument: String,

    #[serde(default)]
    pub bids: Vec<LevelDelta>,

    #[serde(default)]
    pub asks: Vec<LevelDelta>,

    /// Sequence value the producer assumes the book was at
    #[serde(default)]
    pub begin_nonce: Option<u64>,

    /// Sequence value after applying this batch
    #[serde(default)]
    pub nonce: Option<u64>,

    /// Exchange event time (milliseconds)
    #[serde(default)]
    pub timestamp: u64,
}

impl LevelUpdate {
    pub fn new(instrument: &str) -> Self {
        Self {
            instrument: instrument.to_string(),
            ..Self::default()
        }
    }

    pub fn with_nonces(mut self, begin_nonce: u64, nonce: u64) -> Self {
        self.begin_nonce = Some(begin_nonce);
        self.nonce = Some(nonce);
        self
    }

    pub fn with_timestamp(mut self, timestamp: u64) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn bid(mut self, price: Decimal, size: Decimal) -> Self {
        self.bids.push(LevelDelta::new(price, size));
        self
    }

    pub fn ask(mut self, price: Decimal, size: Decimal) -> Self {
        self.asks.push(LevelDelta::new(price, size));
        self
    }

    /// Parse a single JSON-encoded update
    pub fn from_json(raw: &str) -> Result<Self> {
        Ok(serde_json::from_str(raw)?)
    }

    pub fn level_count(&self) -> usize {
        self.bids.len() + self.asks.len()
    }
}

/// Sizes may arrive as strings or numbers; anything unparsable is treated as missing
fn deserialize_lenient_size<'de, D>(
    deserializer: D,
) -> std::result::Result<Option<Decimal>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw: Option<serde_json::Value> = Deserialize::deserialize(deserializer)?;
    Ok(match raw {
        Some(serde_json::Value::String(s)) => parse_decimal(&s),
        Some(serde_json::Value::Number(n)) => parse_decimal(&n.to_string()),
        _ => None,
    })
}

fn parse_decimal(s: &str) -> Option<Decimal> {
    let s = s.trim();
    Decimal::from_str(s)
        .or_else(|_| Decimal::from_scientific(s))
        .ok()
}
