//! Binance spot adapter
//!
//! Signed REST client implementing the trading-API contract. Requests are
//! throttled by a token bucket, signed with HMAC-SHA256 over the query
//! string, and classified into the transient/rejected/unknown taxonomy.

use super::error::ExchangeError;
use super::types::{
    BalanceEntry, BookLevel, CancelOutcome, Features, MarketDescriptor, OpenOrder, OrderBook,
    OrderDetails, OrderDetailsStatus, PlaceRequest, Rates,
};
use super::{TradingApi, API_DEADLINE_SECS};
use crate::types::{Pair, Side};
use async_trait::async_trait;
use chrono::Utc;
use hmac::{Hmac, Mac};
use reqwest::{Client, Method, StatusCode};
use rust_decimal::Decimal;
use serde::Deserialize;
use sha2::Sha256;
use std::collections::HashMap;
use std::str::FromStr;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::debug;

/// Base URL for the Binance spot API
const API_BASE_URL: &str = "https://api.binance.com/api/v3";

/// Order book depth requested per snapshot
const BOOK_DEPTH_LIMIT: u32 = 100;

/// Signature validity window passed as recvWindow (ms)
const RECV_WINDOW_MS: u32 = 5000;

/// Binance error code for "order does not exist"
const CODE_UNKNOWN_ORDER: i64 = -2013;

/// Binance error code for "unknown order sent" on cancellation
const CODE_CANCEL_UNKNOWN: i64 = -2011;

/// Token bucket smoothing request bursts below the exchange weight limits
struct RequestBucket {
    capacity: u32,
    tokens: Mutex<(u32, Instant)>,
    refill: Duration,
}

impl RequestBucket {
    fn new(capacity: u32, refill: Duration) -> Self {
        RequestBucket {
            capacity,
            tokens: Mutex::new((capacity, Instant::now())),
            refill,
        }
    }

    async fn acquire(&self) {
        loop {
            let wait = {
                let mut guard = self.tokens.lock().await;
                let (ref mut tokens, ref mut stamped) = *guard;
                if stamped.elapsed() >= self.refill {
                    *tokens = self.capacity;
                    *stamped = Instant::now();
                }
                if *tokens > 0 {
                    *tokens -= 1;
                    None
                } else {
                    Some(self.refill.saturating_sub(stamped.elapsed()))
                }
            };
            match wait {
                None => return,
                Some(delay) => tokio::time::sleep(delay).await,
            }
        }
    }
}

/// Binance spot REST adapter
pub struct BinanceApi {
    http: Client,
    api_key: String,
    api_secret: String,
    bucket: RequestBucket,
}

impl BinanceApi {
    pub fn new(api_key: &str, api_secret: &str) -> Self {
        let http = Client::builder()
            .timeout(Duration::from_secs(API_DEADLINE_SECS))
            .pool_max_idle_per_host(10)
            .build()
            .expect("Failed to build HTTP client");

        BinanceApi {
            http,
            api_key: api_key.to_string(),
            api_secret: api_secret.to_string(),
            bucket: RequestBucket::new(10, Duration::from_secs(1)),
        }
    }

    fn sign(&self, query: &str) -> String {
        let mut mac = Hmac::<Sha256>::new_from_slice(self.api_secret.as_bytes())
            .expect("HMAC accepts any key length");
        mac.update(query.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    /// Executes a request and maps HTTP/exchange failures onto the taxonomy
    async fn request(
        &self,
        method: Method,
        path: &str,
        params: &[(&str, String)],
        signed: bool,
    ) -> Result<serde_json::Value, ExchangeError> {
        self.bucket.acquire().await;

        let mut query = params
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect::<Vec<_>>()
            .join("&");

        if signed {
            let stamped = format!(
                "{}{}timestamp={}&recvWindow={}",
                query,
                if query.is_empty() { "" } else { "&" },
                Utc::now().timestamp_millis(),
                RECV_WINDOW_MS
            );
            let signature = self.sign(&stamped);
            query = format!("{}&signature={}", stamped, signature);
        }

        let url = if query.is_empty() {
            format!("{}/{}", API_BASE_URL, path)
        } else {
            format!("{}/{}?{}", API_BASE_URL, path, query)
        };

        debug!("binance {} {}", method, path);

        let mut builder = self.http.request(method, &url);
        if signed {
            builder = builder.header("X-MBX-APIKEY", &self.api_key);
        }

        let response = builder.send().await?;
        let status = response.status();
        let body = response.text().await?;

        if status.is_success() {
            return serde_json::from_str(&body)
                .map_err(|e| ExchangeError::transient(format!("malformed response: {}", e)));
        }

        if status.is_server_error()
            || status == StatusCode::TOO_MANY_REQUESTS
            || status.as_u16() == 418
        {
            return Err(ExchangeError::transient(format!(
                "binance {}: {}",
                status, body
            )));
        }

        #[derive(Deserialize)]
        struct ApiError {
            code: i64,
            msg: String,
        }

        match serde_json::from_str::<ApiError>(&body) {
            Ok(err) if err.code == CODE_UNKNOWN_ORDER => Err(ExchangeError::UnknownOrder),
            Ok(err) => Err(ExchangeError::Rejected {
                reason: format!("{} (code {})", err.msg, err.code),
            }),
            Err(_) => Err(ExchangeError::rejected(format!(
                "binance {}: {}",
                status, body
            ))),
        }
    }
}

fn parse_decimal(value: &serde_json::Value, field: &str) -> Result<Decimal, ExchangeError> {
    value
        .get(field)
        .and_then(|v| v.as_str())
        .and_then(|s| Decimal::from_str(s).ok())
        .ok_or_else(|| ExchangeError::transient(format!("missing decimal field '{}'", field)))
}

fn parse_levels(value: &serde_json::Value, field: &str) -> Result<Vec<BookLevel>, ExchangeError> {
    let rows = value
        .get(field)
        .and_then(|v| v.as_array())
        .ok_or_else(|| ExchangeError::transient(format!("missing book side '{}'", field)))?;
    rows.iter()
        .map(|row| {
            let price = row
                .get(0)
                .and_then(|v| v.as_str())
                .and_then(|s| Decimal::from_str(s).ok());
            let amount = row
                .get(1)
                .and_then(|v| v.as_str())
                .and_then(|s| Decimal::from_str(s).ok());
            match (price, amount) {
                (Some(price), Some(amount)) => Ok(BookLevel { price, amount }),
                _ => Err(ExchangeError::transient("malformed book level")),
            }
        })
        .collect()
}

fn map_order_status(status: &str) -> OrderDetailsStatus {
    match status {
        "NEW" => OrderDetailsStatus::New,
        "PARTIALLY_FILLED" => OrderDetailsStatus::PartFilled,
        "FILLED" => OrderDetailsStatus::Filled,
        "CANCELED" | "EXPIRED" | "REJECTED" | "EXPIRED_IN_MATCH" => OrderDetailsStatus::Cancelled,
        _ => OrderDetailsStatus::Unknown,
    }
}

#[async_trait]
impl TradingApi for BinanceApi {
    fn name(&self) -> &'static str {
        "binance"
    }

    fn features(&self) -> Features {
        Features {
            place_market_order: true,
            amount_for_market_buy: true,
            amount_for_market_order_necessary: false,
            get_deposit_address: false,
            get_trading_fees: false,
            support_coin_networks: false,
            order_number_limit: Some(200),
        }
    }

    async fn load_markets(&self) -> Result<HashMap<String, MarketDescriptor>, ExchangeError> {
        let body = self
            .request(Method::GET, "exchangeInfo", &[], false)
            .await?;
        let symbols = body
            .get("symbols")
            .and_then(|v| v.as_array())
            .ok_or_else(|| ExchangeError::transient("exchangeInfo without symbols"))?;

        let mut markets = HashMap::new();
        for symbol in symbols {
            let base = symbol.get("baseAsset").and_then(|v| v.as_str());
            let quote = symbol.get("quoteAsset").and_then(|v| v.as_str());
            let (Some(base), Some(quote)) = (base, quote) else {
                continue;
            };
            let pair = Pair::new(base, quote);

            let mut min_amount = Decimal::ZERO;
            let mut max_amount = None;
            let mut price_tick = Decimal::ZERO;
            if let Some(filters) = symbol.get("filters").and_then(|v| v.as_array()) {
                for filter in filters {
                    match filter.get("filterType").and_then(|v| v.as_str()) {
                        Some("LOT_SIZE") => {
                            min_amount = parse_decimal(filter, "minQty").unwrap_or_default();
                            max_amount = parse_decimal(filter, "maxQty").ok();
                        }
                        Some("PRICE_FILTER") => {
                            price_tick = parse_decimal(filter, "tickSize").unwrap_or_default();
                        }
                        _ => {}
                    }
                }
            }

            markets.insert(
                pair.symbol(),
                MarketDescriptor {
                    pair,
                    base_decimals: symbol
                        .get("baseAssetPrecision")
                        .and_then(|v| v.as_u64())
                        .unwrap_or(8) as u32,
                    quote_decimals: symbol
                        .get("quoteAssetPrecision")
                        .and_then(|v| v.as_u64())
                        .unwrap_or(8) as u32,
                    min_amount,
                    max_amount,
                    price_tick,
                },
            );
        }
        Ok(markets)
    }

    async fn balances(&self, include_zero: bool) -> Result<Vec<BalanceEntry>, ExchangeError> {
        let body = self.request(Method::GET, "account", &[], true).await?;
        let rows = body
            .get("balances")
            .and_then(|v| v.as_array())
            .ok_or_else(|| ExchangeError::transient("account without balances"))?;

        let mut entries = Vec::new();
        for row in rows {
            let coin = row
                .get("asset")
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string();
            let free = parse_decimal(row, "free")?;
            let locked = parse_decimal(row, "locked")?;
            if include_zero || !(free + locked).is_zero() {
                entries.push(BalanceEntry { coin, free, locked });
            }
        }
        Ok(entries)
    }

    async fn open_orders(&self, pair: &Pair) -> Result<Vec<OpenOrder>, ExchangeError> {
        let params = [("symbol", pair.symbol())];
        let body = self
            .request(Method::GET, "openOrders", &params, true)
            .await?;
        let rows = body
            .as_array()
            .ok_or_else(|| ExchangeError::transient("openOrders not a list"))?;

        rows.iter()
            .map(|row| {
                let id = row
                    .get("orderId")
                    .and_then(|v| v.as_i64())
                    .ok_or_else(|| ExchangeError::transient("order without id"))?;
                let side = match row.get("side").and_then(|v| v.as_str()) {
                    Some("BUY") => Side::Buy,
                    Some("SELL") => Side::Sell,
                    other => {
                        return Err(ExchangeError::transient(format!(
                            "unexpected side {:?}",
                            other
                        )))
                    }
                };
                Ok(OpenOrder {
                    id: id.to_string(),
                    side,
                    price: parse_decimal(row, "price")?,
                    base_amount: parse_decimal(row, "origQty")?,
                    base_executed: parse_decimal(row, "executedQty")?,
                })
            })
            .collect()
    }

    async fn order_details(&self, id: &str, pair: &Pair) -> Result<OrderDetails, ExchangeError> {
        let params = [("symbol", pair.symbol()), ("orderId", id.to_string())];
        match self.request(Method::GET, "order", &params, true).await {
            Ok(body) => {
                let status = body
                    .get("status")
                    .and_then(|v| v.as_str())
                    .map(map_order_status)
                    .unwrap_or(OrderDetailsStatus::Unknown);
                Ok(OrderDetails {
                    status,
                    base_filled: parse_decimal(&body, "executedQty").unwrap_or_default(),
                    quote_filled: parse_decimal(&body, "cummulativeQuoteQty").unwrap_or_default(),
                })
            }
            Err(ExchangeError::UnknownOrder) => Ok(OrderDetails::unknown()),
            Err(e) => Err(e),
        }
    }

    async fn place_order(&self, req: &PlaceRequest) -> Result<String, ExchangeError> {
        let side = match req.side {
            Side::Buy => "BUY",
            Side::Sell => "SELL",
        };
        let mut params: Vec<(&str, String)> = vec![
            ("symbol", req.pair.symbol()),
            ("side", side.to_string()),
        ];

        if req.is_limit {
            let price = req
                .price
                .ok_or_else(|| ExchangeError::rejected("limit order without price"))?;
            let amount = req
                .base_amount
                .ok_or_else(|| ExchangeError::rejected("limit order without base amount"))?;
            params.push(("type", "LIMIT".to_string()));
            params.push(("timeInForce", "GTC".to_string()));
            params.push(("price", price.normalize().to_string()));
            params.push(("quantity", amount.normalize().to_string()));
        } else {
            params.push(("type", "MARKET".to_string()));
            match (req.base_amount, req.quote_amount) {
                (Some(amount), _) => params.push(("quantity", amount.normalize().to_string())),
                (None, Some(quote)) => {
                    params.push(("quoteOrderQty", quote.normalize().to_string()))
                }
                (None, None) => return Err(ExchangeError::rejected("market order without amount")),
            }
        }

        let body = self.request(Method::POST, "order", &params, true).await?;
        body.get("orderId")
            .and_then(|v| v.as_i64())
            .map(|id| id.to_string())
            .ok_or_else(|| ExchangeError::transient("order accepted without id"))
    }

    async fn cancel_order(
        &self,
        id: &str,
        _side: Side,
        pair: &Pair,
    ) -> Result<CancelOutcome, ExchangeError> {
        let params = [("symbol", pair.symbol()), ("orderId", id.to_string())];
        match self.request(Method::DELETE, "order", &params, true).await {
            Ok(_) => Ok(CancelOutcome::Cancelled),
            Err(ExchangeError::UnknownOrder) => Ok(CancelOutcome::Unknown),
            Err(ExchangeError::Rejected { reason })
                if reason.contains(&CODE_CANCEL_UNKNOWN.to_string()) =>
            {
                // Cancellation raced a fill or an earlier cancel
                Ok(CancelOutcome::AlreadyClosed)
            }
            Err(e) => Err(e),
        }
    }

    async fn rates(&self, pair: &Pair) -> Result<Rates, ExchangeError> {
        let params = [("symbol", pair.symbol())];
        let body = self
            .request(Method::GET, "ticker/24hr", &params, false)
            .await?;
        Ok(Rates {
            bid: parse_decimal(&body, "bidPrice")?,
            ask: parse_decimal(&body, "askPrice")?,
            last: parse_decimal(&body, "lastPrice")?,
            high_24h: parse_decimal(&body, "highPrice")?,
            low_24h: parse_decimal(&body, "lowPrice")?,
            volume_24h: parse_decimal(&body, "volume")?,
            quote_volume_24h: parse_decimal(&body, "quoteVolume")?,
        })
    }

    async fn order_book(&self, pair: &Pair) -> Result<OrderBook, ExchangeError> {
        let params = [
            ("symbol", pair.symbol()),
            ("limit", BOOK_DEPTH_LIMIT.to_string()),
        ];
        let body = self.request(Method::GET, "depth", &params, false).await?;
        Ok(OrderBook {
            bids: parse_levels(&body, "bids")?,
            asks: parse_levels(&body, "asks")?,
        })
    }
}
