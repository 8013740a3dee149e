//! Uniform trading-API contract and the adapters implementing it
//!
//! Every exchange is wrapped behind [`TradingApi`]; the rest of the agent
//! depends only on this trait. Adapters keep their own connection pools
//! and rate limiting; the contract itself is stateless across calls and
//! every call resolves within the 10-second adapter deadline.

pub mod binance;
pub mod error;
pub mod paper;
pub mod registry;
pub mod types;

pub use error::ExchangeError;
pub use types::{
    BalanceEntry, BookLevel, CancelOutcome, Features, MarketDescriptor, OpenOrder, OrderBook,
    OrderDetails, OrderDetailsStatus, PlaceRequest, Rates,
};

use crate::types::{Pair, Side};
use async_trait::async_trait;
use std::collections::HashMap;

/// Deadline applied to every external call; expiry maps to a transient error
pub const API_DEADLINE_SECS: u64 = 10;

#[async_trait]
pub trait TradingApi: Send + Sync {
    /// Exchange identifier, as registered in [`registry`]
    fn name(&self) -> &'static str;

    /// Capability flags; constant per adapter
    fn features(&self) -> Features;

    /// All listed markets keyed by wire symbol. Called once; the result
    /// is cached by the caller.
    async fn load_markets(&self) -> Result<HashMap<String, MarketDescriptor>, ExchangeError>;

    async fn balances(&self, include_zero: bool) -> Result<Vec<BalanceEntry>, ExchangeError>;

    async fn open_orders(&self, pair: &Pair) -> Result<Vec<OpenOrder>, ExchangeError>;

    async fn order_details(&self, id: &str, pair: &Pair) -> Result<OrderDetails, ExchangeError>;

    /// Returns the exchange-assigned order id on acceptance
    async fn place_order(&self, req: &PlaceRequest) -> Result<String, ExchangeError>;

    async fn cancel_order(
        &self,
        id: &str,
        side: Side,
        pair: &Pair,
    ) -> Result<CancelOutcome, ExchangeError>;

    async fn rates(&self, pair: &Pair) -> Result<Rates, ExchangeError>;

    async fn order_book(&self, pair: &Pair) -> Result<OrderBook, ExchangeError>;
}
