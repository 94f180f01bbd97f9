//! Configuration module for the order book engine

use rust_decimal::Decimal;
use serde::Deserialize;
use std::env;
use std::str::FromStr;
use std::time::Duration;

use crate::error::{BookError, Result};
use crate::orderbook::{DepthVwapParams, TickSize};

/// Engine configuration
#[derive(Debug, Clone, Deserialize)]
pub struct EngineConfig {
    /// Tick size for instruments that are not registered explicitly
    pub default_tick_size: Decimal,

    /// Blocking threads used to run listener callbacks
    pub notify_workers: usize,

    /// Graceful drain window for in-flight notifications on shutdown
    pub drain_timeout_ms: u64,

    /// Extra time granted to stuck notifications before they are abandoned
    pub force_timeout_ms: u64,

    /// Decay used for imbalance-changed notifications; unset disables the hook
    pub imbalance_lambda: Option<f64>,

    /// Decay used for the imbalance reported in book summaries
    pub metrics_lambda: f64,

    /// Default parameters for depth-capped VWAP
    pub depth_vwap: DepthVwapParams,
}

fn env_or<T: FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

impl EngineConfig {
    /// Load configuration from environment variables
    pub fn load() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();

        let defaults = Self::default();
        let vwap = defaults.depth_vwap;

        let config = Self {
            default_tick_size: env_or("BOOK_DEFAULT_TICK_SIZE", defaults.default_tick_size),
            notify_workers: env_or("BOOK_NOTIFY_WORKERS", defaults.notify_workers),
            drain_timeout_ms: env_or("BOOK_DRAIN_TIMEOUT_MS", defaults.drain_timeout_ms),
            force_timeout_ms: env_or("BOOK_FORCE_TIMEOUT_MS", defaults.force_timeout_ms),
            imbalance_lambda: env::var("BOOK_IMBALANCE_LAMBDA")
                .ok()
                .and_then(|v| v.trim().parse().ok()),
            metrics_lambda: env_or("BOOK_METRICS_LAMBDA", defaults.metrics_lambda),
            depth_vwap: DepthVwapParams {
                slice_multiple: env_or("DEPTH_VWAP_SLICE_MULTIPLE", vwap.slice_multiple),
                slice_size: env_or("DEPTH_VWAP_SLICE_SIZE", vwap.slice_size),
                max_levels: env_or("DEPTH_VWAP_MAX_LEVELS", vwap.max_levels),
                bp_cap: env_or("DEPTH_VWAP_BP_CAP", vwap.bp_cap),
                tick_cap: env_or("DEPTH_VWAP_TICK_CAP", vwap.tick_cap),
                lambda_decay: env_or("DEPTH_VWAP_LAMBDA_DECAY", vwap.lambda_decay),
            },
        };

        config.validate()?;
        Ok(config)
    }

    /// Reject settings the engine cannot be built with
    pub fn validate(&self) -> Result<()> {
        TickSize::new(self.default_tick_size)?;

        if self.notify_workers == 0 {
            return Err(BookError::ConfigError(
                "notify_workers must be at least 1".to_string(),
            ));
        }

        let vwap = &self.depth_vwap;
        let non_negative = [
            ("slice_multiple", vwap.slice_multiple),
            ("bp_cap", vwap.bp_cap),
            ("lambda_decay", vwap.lambda_decay),
            ("metrics_lambda", self.metrics_lambda),
        ];
        for (name, value) in non_negative {
            if !value.is_finite() || value < 0.0 {
                return Err(BookError::ConfigError(format!(
                    "{name} must be finite and non-negative, got {value}"
                )));
            }
        }

        if !vwap.slice_size.is_finite() || vwap.slice_size <= 0.0 {
            return Err(BookError::ConfigError(format!(
                "slice_size must be positive, got {}",
                vwap.slice_size
            )));
        }

        if let Some(lambda) = self.imbalance_lambda {
            if !lambda.is_finite() || lambda < 0.0 {
                return Err(BookError::ConfigError(format!(
                    "imbalance_lambda must be finite and non-negative, got {lambda}"
                )));
            }
        }

        Ok(())
    }

    pub fn default_tick(&self) -> Result<TickSize> {
        TickSize::new(self.default_tick_size)
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.drain_timeout_ms)
    }

    pub fn force_timeout(&self) -> Duration {
        Duration::from_millis(self.force_timeout_ms)
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            default_tick_size: Decimal::new(1, 2),
            notify_workers: 4,
            drain_timeout_ms: 1000,
            force_timeout_ms: 500,
            imbalance_lambda: None,
            metrics_lambda: 0.5,
            depth_vwap: DepthVwapParams::default(),
        }
    }
}
