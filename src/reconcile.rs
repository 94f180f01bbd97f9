//! Sequence reconciliation
//!
//! Decides, per incoming update, whether it is a fresh snapshot, a
//! continuation, a duplicate or a gap, and builds the next book state
//! accordingly. The decision is a flat table in [`classify`]; the order of
//! its rows matters because RESET re-bases a possibly partial payload as
//! the whole book.

use tracing::{debug, info, trace, warn};

use crate::orderbook::OrderBookState;
use crate::update::LevelUpdate;

/// Sequence tracking for one instrument
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SequenceState {
    /// Nothing applied yet; the next update establishes the book
    #[default]
    Uninitialized,
    /// Book established; `last_nonce` is `None` for feeds without sequencing
    Synced { last_nonce: Option<u64> },
}

impl SequenceState {
    pub fn last_nonce(&self) -> Option<u64> {
        match self {
            SequenceState::Uninitialized => None,
            SequenceState::Synced { last_nonce } => *last_nonce,
        }
    }
}

/// How an update was treated
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Classification {
    /// First update: both sides replaced wholesale
    Snapshot,
    /// Continuation: rows upserted into the current book
    Delta,
    /// Duplicate or older than the book: dropped
    Stale,
    /// Sequence gap: both sides replaced from this payload
    Reset,
}

impl Classification {
    pub fn as_str(&self) -> &'static str {
        match self {
            Classification::Snapshot => "snapshot",
            Classification::Delta => "delta",
            Classification::Stale => "stale",
            Classification::Reset => "reset",
        }
    }

    pub const ALL: [Classification; 4] = [
        Classification::Snapshot,
        Classification::Delta,
        Classification::Stale,
        Classification::Reset,
    ];
}

impl std::fmt::Display for Classification {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Classify an update against the current sequence state
pub fn classify(
    state: SequenceState,
    begin_nonce: Option<u64>,
    nonce: Option<u64>,
) -> Classification {
    use Classification::*;
    use SequenceState::*;

    match (state, begin_nonce, nonce) {
        (Uninitialized, _, _) => Snapshot,
        // Unsequenced updates are applied best effort
        (Synced { .. }, None, _) | (Synced { .. }, _, None) => Delta,
        (Synced { last_nonce: None }, Some(_), Some(_)) => Delta,
        (Synced { last_nonce: Some(last) }, Some(begin), Some(n)) if begin == last && n <= last => {
            Stale
        }
        (Synced { last_nonce: Some(last) }, Some(begin), Some(_)) if begin == last => Delta,
        (Synced { last_nonce: Some(last) }, Some(begin), Some(n)) if n <= last && begin <= last => {
            Stale
        }
        (Synced { last_nonce: Some(_) }, Some(_), Some(_)) => Reset,
    }
}

/// Result of reconciling one update
#[derive(Debug)]
pub struct Reconciled {
    pub classification: Classification,
    /// Next state to publish; `None` when the update was dropped
    pub state: Option<OrderBookState>,
    /// Malformed rows dropped while building the next state
    pub malformed: usize,
}

/// Per-instrument reconciliation state machine
///
/// Not thread safe by itself; the engine serializes calls per instrument.
#[derive(Debug)]
pub struct ReconciliationController {
    instrument: String,
    sequence: SequenceState,
}

impl ReconciliationController {
    pub fn new(instrument: &str) -> Self {
        Self {
            instrument: instrument.to_string(),
            sequence: SequenceState::Uninitialized,
        }
    }

    pub fn sequence(&self) -> SequenceState {
        self.sequence
    }

    /// Forget the sequence so the next update is treated as a snapshot
    pub fn reset(&mut self) {
        self.sequence = SequenceState::Uninitialized;
    }

    /// Classify `update` and build the next state from `current`
    pub fn apply(&mut self, current: &OrderBookState, update: &LevelUpdate) -> Reconciled {
        let classification = classify(self.sequence, update.begin_nonce, update.nonce);
        let last_nonce = self.sequence.last_nonce();

        let (next, malformed) = match classification {
            Classification::Stale => {
                debug!(
                    instrument = %self.instrument,
                    last_nonce = ?last_nonce,
                    begin_nonce = ?update.begin_nonce,
                    nonce = ?update.nonce,
                    "Dropping stale update"
                );
                return Reconciled {
                    classification,
                    state: None,
                    malformed: 0,
                };
            }
            Classification::Snapshot => {
                info!(
                    instrument = %self.instrument,
                    nonce = ?update.nonce,
                    levels = update.level_count(),
                    "Applying initial snapshot"
                );
                current.rebuilt(&update.bids, &update.asks)
            }
            Classification::Reset => {
                warn!(
                    instrument = %self.instrument,
                    last_nonce = ?last_nonce,
                    begin_nonce = ?update.begin_nonce,
                    nonce = ?update.nonce,
                    "Sequence gap detected, rebuilding book from update payload"
                );
                current.rebuilt(&update.bids, &update.asks)
            }
            Classification::Delta => {
                trace!(
                    instrument = %self.instrument,
                    nonce = ?update.nonce,
                    levels = update.level_count(),
                    "Applying delta"
                );
                current.with_deltas(&update.bids, &update.asks)
            }
        };

        self.sequence = SequenceState::Synced {
            last_nonce: match (update.begin_nonce, update.nonce) {
                // Best-effort deltas leave the sequence where it was
                (None, _) | (_, None) if classification == Classification::Delta => last_nonce,
                (_, nonce) => nonce,
            },
        };

        Reconciled {
            classification,
            state: Some(next.stamped(self.sequence.last_nonce(), update.timestamp)),
            malformed,
        }
    }
}
