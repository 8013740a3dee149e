//! Wire-level data types shared by all exchange adapters

use crate::types::{Pair, Side};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};

/// Static description of a listed market, loaded once per exchange
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarketDescriptor {
    pub pair: Pair,
    /// Decimal places accepted for base amounts
    pub base_decimals: u32,
    /// Decimal places accepted for quote amounts and prices
    pub quote_decimals: u32,
    pub min_amount: Decimal,
    pub max_amount: Option<Decimal>,
    /// Minimum price increment
    pub price_tick: Decimal,
}

/// Capability flags reported by an adapter
#[derive(Debug, Clone, Copy, Default)]
pub struct Features {
    pub place_market_order: bool,
    pub amount_for_market_buy: bool,
    pub amount_for_market_order_necessary: bool,
    pub get_deposit_address: bool,
    pub get_trading_fees: bool,
    pub support_coin_networks: bool,
    /// Cap on simultaneously open orders, when the exchange enforces one
    pub order_number_limit: Option<u32>,
}

/// Per-coin balance entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BalanceEntry {
    pub coin: String,
    pub free: Decimal,
    pub locked: Decimal,
}

impl BalanceEntry {
    pub fn total(&self) -> Decimal {
        self.free + self.locked
    }
}

/// 24h market rates snapshot
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Rates {
    pub bid: Decimal,
    pub ask: Decimal,
    pub last: Decimal,
    pub high_24h: Decimal,
    pub low_24h: Decimal,
    pub volume_24h: Decimal,
    pub quote_volume_24h: Decimal,
}

impl Rates {
    pub fn spread(&self) -> Decimal {
        self.ask - self.bid
    }

    pub fn mid(&self) -> Decimal {
        (self.ask + self.bid) / dec!(2)
    }
}

/// One price level of the order book
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct BookLevel {
    pub price: Decimal,
    pub amount: Decimal,
}

/// Order book snapshot: bids descending, asks ascending
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OrderBook {
    pub bids: Vec<BookLevel>,
    pub asks: Vec<BookLevel>,
}

impl OrderBook {
    pub fn best_bid(&self) -> Option<Decimal> {
        self.bids.first().map(|l| l.price)
    }

    pub fn best_ask(&self) -> Option<Decimal> {
        self.asks.first().map(|l| l.price)
    }

    /// Side of the book a resting order of `side` joins
    pub fn levels(&self, side: Side) -> &[BookLevel] {
        match side {
            Side::Buy => &self.bids,
            Side::Sell => &self.asks,
        }
    }

    /// Price level where cumulative volume reaches `fraction` of the
    /// side's total. Skips dust walls near the top of the book, which is
    /// what makes it usable as a reference price for a watched market.
    pub fn smart_price(&self, side: Side, fraction: Decimal) -> Option<Decimal> {
        let levels = self.levels(side);
        let total: Decimal = levels.iter().map(|l| l.amount).sum();
        if total.is_zero() {
            return None;
        }
        let threshold = total * fraction;
        let mut cumulative = Decimal::ZERO;
        for level in levels {
            cumulative += level.amount;
            if cumulative >= threshold {
                return Some(level.price);
            }
        }
        levels.last().map(|l| l.price)
    }

    /// Cumulative base amount on `side` up to and including `price_limit`
    /// (moving away from the top of the book).
    pub fn depth_to(&self, side: Side, price_limit: Decimal) -> Decimal {
        self.levels(side)
            .iter()
            .take_while(|l| match side {
                Side::Buy => l.price >= price_limit,
                Side::Sell => l.price <= price_limit,
            })
            .map(|l| l.amount)
            .sum()
    }
}

/// Status reported by `order_details`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderDetailsStatus {
    New,
    PartFilled,
    Filled,
    Cancelled,
    /// The id is not recognized by the exchange
    Unknown,
}

/// Result of an `order_details` lookup
#[derive(Debug, Clone)]
pub struct OrderDetails {
    pub status: OrderDetailsStatus,
    pub base_filled: Decimal,
    pub quote_filled: Decimal,
}

impl OrderDetails {
    pub fn unknown() -> Self {
        OrderDetails {
            status: OrderDetailsStatus::Unknown,
            base_filled: Decimal::ZERO,
            quote_filled: Decimal::ZERO,
        }
    }
}

/// An order as listed by the exchange's open-orders endpoint
#[derive(Debug, Clone)]
pub struct OpenOrder {
    pub id: String,
    pub side: Side,
    pub price: Decimal,
    pub base_amount: Decimal,
    pub base_executed: Decimal,
}

/// Placement request handed to an adapter
#[derive(Debug, Clone)]
pub struct PlaceRequest {
    pub pair: Pair,
    pub side: Side,
    /// None for market orders
    pub price: Option<Decimal>,
    /// Base amount; None when sizing a market buy by quote
    pub base_amount: Option<Decimal>,
    /// Quote amount; used for market buys on venues that require it
    pub quote_amount: Option<Decimal>,
    pub is_limit: bool,
}

impl PlaceRequest {
    pub fn limit(pair: Pair, side: Side, price: Decimal, base_amount: Decimal) -> Self {
        PlaceRequest {
            pair,
            side,
            price: Some(price),
            base_amount: Some(base_amount),
            quote_amount: None,
            is_limit: true,
        }
    }

    pub fn market(pair: Pair, side: Side, base_amount: Option<Decimal>, quote_amount: Option<Decimal>) -> Self {
        PlaceRequest {
            pair,
            side,
            price: None,
            base_amount,
            quote_amount,
            is_limit: false,
        }
    }
}

/// Tri-state outcome of a cancellation attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    Cancelled,
    AlreadyClosed,
    Unknown,
}
