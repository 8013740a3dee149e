//! Exchange adapter registry
//!
//! Maps exchange-id strings to adapter constructors. The adapter is chosen
//! once at startup; everything downstream holds an `Arc<dyn TradingApi>`.

use super::binance::BinanceApi;
use super::paper::PaperExchange;
use super::TradingApi;
use anyhow::{bail, Result};
use std::sync::Arc;

/// Exchange ids accepted in configuration and in `pair@exchange` sources
pub const SUPPORTED_EXCHANGES: &[&str] = &["binance", "paper"];

/// Credentials handed to adapters that need signing
#[derive(Debug, Clone, Default)]
pub struct Credentials {
    pub api_key: String,
    pub api_secret: String,
}

/// Construct the adapter registered under `exchange_id`
pub fn create(exchange_id: &str, credentials: &Credentials) -> Result<Arc<dyn TradingApi>> {
    match exchange_id.to_ascii_lowercase().as_str() {
        "binance" => Ok(Arc::new(BinanceApi::new(
            &credentials.api_key,
            &credentials.api_secret,
        ))),
        "paper" => Ok(Arc::new(PaperExchange::default())),
        other => bail!(
            "unsupported exchange '{}', expected one of: {}",
            other,
            SUPPORTED_EXCHANGES.join(", ")
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_known_exchanges() {
        let creds = Credentials::default();
        assert_eq!(create("paper", &creds).unwrap().name(), "paper");
        assert_eq!(create("Binance", &creds).unwrap().name(), "binance");
    }

    #[test]
    fn test_create_unknown_exchange() {
        let err = match create("kraken", &Credentials::default()) {
            Err(err) => err,
            Ok(_) => panic!("expected unsupported exchange error"),
        };
        assert!(err.to_string().contains("unsupported exchange"));
    }
}
