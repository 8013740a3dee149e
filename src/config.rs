//! Startup configuration
//!
//! Loads the agent's static configuration from JSON with environment
//! variable support for API credentials. Runtime policy lives in
//! `TradeParams`, not here.

use crate::types::Pair;
use anyhow::{Context, Result};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Exchange id resolved through the adapter registry
    pub exchange: String,
    /// The single traded pair
    pub pair: Pair,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_secret: Option<String>,
    /// Commands estimated at or above this USD notional require `y`
    #[serde(default = "default_amount_to_confirm")]
    pub amount_to_confirm_usd: Decimal,
    /// Directory holding the ledger database and persisted params
    #[serde(default = "default_state_dir")]
    pub state_dir: String,
}

fn default_amount_to_confirm() -> Decimal {
    dec!(100)
}

fn default_state_dir() -> String {
    "state".to_string()
}

impl Config {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let contents =
            fs::read_to_string(path.as_ref()).context("Failed to read config file")?;
        let mut config: Config =
            serde_json::from_str(&contents).context("Failed to parse config JSON")?;

        if let Ok(api_key) = std::env::var("MARKET_SHAPER_API_KEY") {
            config.api_key = Some(api_key);
        }
        if let Ok(api_secret) = std::env::var("MARKET_SHAPER_API_SECRET") {
            config.api_secret = Some(api_secret);
        }

        Ok(config)
    }

    pub fn credentials(&self) -> crate::exchange::registry::Credentials {
        crate::exchange::registry::Credentials {
            api_key: self.api_key.clone().unwrap_or_default(),
            api_secret: self.api_secret.clone().unwrap_or_default(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            exchange: "paper".to_string(),
            pair: Pair::new("BTC", "USDT"),
            api_key: None,
            api_secret: None,
            amount_to_confirm_usd: default_amount_to_confirm(),
            state_dir: default_state_dir(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_minimal_config() {
        let json = r#"{"exchange": "paper", "pair": {"base": "ETH", "quote": "USDT"}}"#;
        let config: Config = serde_json::from_str(json).unwrap();
        assert_eq!(config.exchange, "paper");
        assert_eq!(config.pair, Pair::new("ETH", "USDT"));
        assert_eq!(config.amount_to_confirm_usd, dec!(100));
        assert_eq!(config.state_dir, "state");
    }
}
