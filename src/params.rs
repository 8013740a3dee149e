//! Trade parameters
//!
//! The policy record every scheduler tick reads. Mutated only by the
//! command processor and persisted as JSON after each successful mutation;
//! readers take cloned snapshots, so no lock is held across an await.

use crate::types::Pair;
use anyhow::{Context, Result};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::str::FromStr;
use tracing::debug;

/// Market-making policy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Policy {
    /// Builder + provider + price defense
    Optimal,
    /// Builder + tight spread
    Spread,
    /// Provider only, no price-moving corrections
    Depth,
}

impl Policy {
    /// Policies under which volume-generating components run
    pub fn is_regular(self) -> bool {
        matches!(self, Policy::Optimal | Policy::Spread)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Policy::Optimal => "optimal",
            Policy::Spread => "spread",
            Policy::Depth => "depth",
        }
    }
}

impl FromStr for Policy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "optimal" => Ok(Policy::Optimal),
            // older configs used "orderbook" for the tight-spread policy
            "spread" | "orderbook" => Ok(Policy::Spread),
            "depth" => Ok(Policy::Depth),
            other => Err(format!("unknown policy '{}'", other)),
        }
    }
}

/// Skew of standing liquidity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LiqTrend {
    Middle,
    Uptrend,
    Downtrend,
}

impl LiqTrend {
    pub fn as_str(self) -> &'static str {
        match self {
            LiqTrend::Middle => "middle",
            LiqTrend::Uptrend => "uptrend",
            LiqTrend::Downtrend => "downtrend",
        }
    }
}

impl FromStr for LiqTrend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "middle" => Ok(LiqTrend::Middle),
            "uptrend" | "up" => Ok(LiqTrend::Uptrend),
            "downtrend" | "down" => Ok(LiqTrend::Downtrend),
            other => Err(format!("unknown trend '{}'", other)),
        }
    }
}

/// How staleness of the watcher range is treated
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PwPolicy {
    /// Tolerate a stale range inside a grace window
    Smart,
    /// Block placements as soon as the range is not actual
    Strict,
}

impl FromStr for PwPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "smart" => Ok(PwPolicy::Smart),
            "strict" => Ok(PwPolicy::Strict),
            other => Err(format!("unknown pw policy '{}'", other)),
        }
    }
}

/// What happens when price escapes the band
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PwAction {
    /// Push price back with a counter-order
    Fill,
    /// Cancel out-of-band orders, place nothing
    Prevent,
}

impl FromStr for PwAction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "fill" => Ok(PwAction::Fill),
            "prevent" => Ok(PwAction::Prevent),
            other => Err(format!("unknown pw action '{}'", other)),
        }
    }
}

/// Where the allowed price band comes from
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum PwSource {
    /// Operator-provided bounds in `currency`, converted to the traded quote
    Numeric {
        low: Decimal,
        high: Decimal,
        currency: String,
    },
    /// Another market's order book, expanded by `deviation_percent`
    Market {
        pair: Pair,
        exchange: String,
        deviation_percent: Decimal,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeParams {
    // global
    pub is_active: bool,
    pub policy: Policy,
    pub min_amount: Decimal,
    pub max_amount: Decimal,
    pub min_interval_ms: u64,
    pub max_interval_ms: u64,
    /// Probability of choosing the buy side, in percent
    pub buy_percent: Decimal,

    // order-book builder
    pub is_ob_active: bool,
    pub ob_orders_count: u32,
    /// How deep inside the visible book positions are sampled
    pub ob_height: u32,
    /// Max ob-order amount as a percentage of `max_amount`
    pub ob_max_order_percent: Decimal,

    // liquidity provider
    pub is_liq_active: bool,
    pub liq_spread_percent: Decimal,
    /// Standing ask budget, in base
    pub liq_sell_amount: Decimal,
    /// Standing bid budget, in quote
    pub liq_buy_quote_amount: Decimal,
    pub liq_trend: LiqTrend,

    // price watcher
    pub is_pw_active: bool,
    pub pw_source: Option<PwSource>,
    pub pw_policy: PwPolicy,
    pub pw_action: PwAction,
}

impl Default for TradeParams {
    fn default() -> Self {
        TradeParams {
            is_active: false,
            policy: Policy::Optimal,
            min_amount: dec!(0.01),
            max_amount: dec!(0.1),
            min_interval_ms: 60_000,
            max_interval_ms: 360_000,
            buy_percent: dec!(50),
            is_ob_active: false,
            ob_orders_count: 15,
            ob_height: 20,
            ob_max_order_percent: dec!(25),
            is_liq_active: false,
            liq_spread_percent: dec!(2),
            liq_sell_amount: Decimal::ZERO,
            liq_buy_quote_amount: Decimal::ZERO,
            liq_trend: LiqTrend::Middle,
            is_pw_active: false,
            pw_source: None,
            pw_policy: PwPolicy::Smart,
            pw_action: PwAction::Prevent,
        }
    }
}

impl TradeParams {
    /// Loads persisted parameters, falling back to defaults when the file
    /// does not exist yet
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            debug!("No trade params at {}, using defaults", path.display());
            return Ok(TradeParams::default());
        }
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read trade params: {}", path.display()))?;
        serde_json::from_str(&contents).context("Failed to parse trade params JSON")
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, serde_json::to_string_pretty(self)?)
            .with_context(|| format!("Failed to write trade params: {}", path.display()))?;
        debug!("Trade params saved to {}", path.display());
        Ok(())
    }

    /// Probability of the buy side as a fraction in [0, 1]
    pub fn buy_probability(&self) -> f64 {
        use rust_decimal::prelude::ToPrimitive;
        (self.buy_percent / dec!(100)).to_f64().unwrap_or(0.5).clamp(0.0, 1.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_policy_parse_with_legacy_alias() {
        assert_eq!("optimal".parse::<Policy>().unwrap(), Policy::Optimal);
        assert_eq!("orderbook".parse::<Policy>().unwrap(), Policy::Spread);
        assert!("grid".parse::<Policy>().is_err());
        assert!(Policy::Spread.is_regular());
        assert!(!Policy::Depth.is_regular());
    }

    #[test]
    fn test_json_roundtrip() {
        let mut params = TradeParams::default();
        params.is_active = true;
        params.pw_source = Some(PwSource::Market {
            pair: Pair::new("BTC", "USDT"),
            exchange: "binance".to_string(),
            deviation_percent: dec!(1.5),
        });

        let json = serde_json::to_string(&params).unwrap();
        let loaded: TradeParams = serde_json::from_str(&json).unwrap();
        assert!(loaded.is_active);
        assert_eq!(loaded.pw_source, params.pw_source);
        assert_eq!(loaded.buy_percent, dec!(50));
    }

    #[test]
    fn test_load_missing_file_defaults() {
        let params = TradeParams::load("/nonexistent/params.json").unwrap();
        assert!(!params.is_active);
        assert_eq!(params.ob_orders_count, 15);
    }

    #[test]
    fn test_buy_probability_clamped() {
        let mut params = TradeParams::default();
        params.buy_percent = dec!(130);
        assert_eq!(params.buy_probability(), 1.0);
        params.buy_percent = dec!(25);
        assert_eq!(params.buy_probability(), 0.25);
    }
}
