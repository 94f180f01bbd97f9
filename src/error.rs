//! Error types for the order book engine
//!
//! Only construction paths fail. Feed processing and analytics never return
//! errors: crossed books, gaps and stale updates are normal market states.

use rust_decimal::Decimal;
use thiserror::Error;

/// Order book engine errors
#[derive(Error, Debug)]
pub enum BookError {
    #[error("Invalid tick size: {0} (must be positive, at most 12 decimal places)")]
    InvalidTickSize(Decimal),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Notification pool error: {0}")]
    NotifierError(String),

    #[error("Metrics error: {0}")]
    MetricsError(String),

    #[error("Failed to parse update: {0}")]
    ParseError(String),

    #[error("Unknown instrument: {0}")]
    UnknownInstrument(String),
}

impl From<std::io::Error> for BookError {
    fn from(err: std::io::Error) -> Self {
        BookError::NotifierError(err.to_string())
    }
}

impl From<serde_json::Error> for BookError {
    fn from(err: serde_json::Error) -> Self {
        BookError::ParseError(err.to_string())
    }
}

impl From<prometheus::Error> for BookError {
    fn from(err: prometheus::Error) -> Self {
        BookError::MetricsError(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, BookError>;
