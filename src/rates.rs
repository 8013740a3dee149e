//! Rate-info service
//!
//! Converts amounts between coins through cached USD reference rates.
//! The HTTP source reads public spot tickers; a static source backs paper
//! mode and tests.

use crate::cache::TtlMap;
use anyhow::{anyhow, Context, Result};
use reqwest::Client;
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::str::FromStr;
use std::time::Duration;
use tracing::debug;

/// Public ticker endpoint used for USD reference prices
const TICKER_URL: &str = "https://api.binance.com/api/v3/ticker/price";

/// Stablecoins treated as one USD
const USD_STABLES: &[&str] = &["USD", "USDT", "USDC", "BUSD", "DAI"];

const RATE_TTL: Duration = Duration::from_secs(60);

enum RateSource {
    Http(Client),
    Static(HashMap<String, Decimal>),
}

pub struct RateInfoClient {
    source: RateSource,
    cache: TtlMap<String, Decimal>,
}

impl RateInfoClient {
    pub fn new() -> Self {
        let client = Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .expect("Failed to build HTTP client");
        RateInfoClient {
            source: RateSource::Http(client),
            cache: TtlMap::new(RATE_TTL),
        }
    }

    /// Fixed rate table, keyed by coin symbol, each in USD
    pub fn with_static(rates: HashMap<String, Decimal>) -> Self {
        RateInfoClient {
            source: RateSource::Static(
                rates
                    .into_iter()
                    .map(|(coin, rate)| (coin.to_uppercase(), rate))
                    .collect(),
            ),
            cache: TtlMap::new(RATE_TTL),
        }
    }

    /// USD price of one unit of `coin`
    pub async fn usd_rate(&self, coin: &str) -> Result<Decimal> {
        let coin = coin.to_uppercase();
        if USD_STABLES.contains(&coin.as_str()) {
            return Ok(Decimal::ONE);
        }
        if let Some(rate) = self.cache.get(&coin).await {
            return Ok(rate);
        }

        let rate = match &self.source {
            RateSource::Static(table) => *table
                .get(&coin)
                .ok_or_else(|| anyhow!("no static rate for {}", coin))?,
            RateSource::Http(client) => {
                let symbol = format!("{}USDT", coin);
                let response = client
                    .get(TICKER_URL)
                    .query(&[("symbol", symbol.as_str())])
                    .send()
                    .await
                    .context("Failed to fetch reference rate")?;
                if !response.status().is_success() {
                    return Err(anyhow!("rate lookup for {} failed: {}", coin, response.status()));
                }
                let body: serde_json::Value = response.json().await?;
                let price = body
                    .get("price")
                    .and_then(|v| v.as_str())
                    .ok_or_else(|| anyhow!("rate response without price"))?;
                Decimal::from_str(price).context("unparseable reference rate")?
            }
        };

        debug!("Reference rate {} = {} USD", coin, rate);
        self.cache.put(coin, rate).await;
        Ok(rate)
    }

    /// Converts `amount` of `from` into `to` through USD
    pub async fn convert(&self, amount: Decimal, from: &str, to: &str) -> Result<Decimal> {
        if from.eq_ignore_ascii_case(to) {
            return Ok(amount);
        }
        let from_usd = self.usd_rate(from).await?;
        let to_usd = self.usd_rate(to).await?;
        if to_usd.is_zero() {
            return Err(anyhow!("zero reference rate for {}", to));
        }
        Ok(amount * from_usd / to_usd)
    }
}

impl Default for RateInfoClient {
    fn default() -> Self {
        RateInfoClient::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn static_client() -> RateInfoClient {
        let mut rates = HashMap::new();
        rates.insert("BTC".to_string(), dec!(50000));
        rates.insert("EUR".to_string(), dec!(1.10));
        RateInfoClient::with_static(rates)
    }

    #[tokio::test]
    async fn test_stables_are_one_usd() {
        let client = static_client();
        assert_eq!(client.usd_rate("usdt").await.unwrap(), Decimal::ONE);
        assert_eq!(client.usd_rate("USDC").await.unwrap(), Decimal::ONE);
    }

    #[tokio::test]
    async fn test_convert_through_usd() {
        let client = static_client();
        // 2 BTC -> USDT
        assert_eq!(
            client.convert(dec!(2), "BTC", "USDT").await.unwrap(),
            dec!(100000)
        );
        // 110 EUR -> 121 USDT
        assert_eq!(
            client.convert(dec!(110), "EUR", "USDT").await.unwrap(),
            dec!(121.000)
        );
    }

    #[tokio::test]
    async fn test_same_coin_is_identity() {
        let client = static_client();
        assert_eq!(
            client.convert(dec!(5), "XYZ", "xyz").await.unwrap(),
            dec!(5)
        );
    }

    #[tokio::test]
    async fn test_unknown_coin_errors() {
        let client = static_client();
        assert!(client.usd_rate("DOGE").await.is_err());
    }
}
