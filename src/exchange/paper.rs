//! In-memory paper exchange
//!
//! Deterministic adapter backing `--paper` mode and the test suite. It keeps
//! balances with free/locked accounting, a synthetic order book standing in
//! for other participants, and a flat order table. Crossing limit orders and
//! market orders fill instantly at their price; resting orders stay open
//! until cancelled or force-filled through the test hooks. Queue priority is
//! not simulated.

use super::error::ExchangeError;
use super::types::{
    BalanceEntry, BookLevel, CancelOutcome, Features, MarketDescriptor, OpenOrder, OrderBook,
    OrderDetails, OrderDetailsStatus, PlaceRequest, Rates,
};
use super::TradingApi;
use crate::types::{Pair, Side};
use async_trait::async_trait;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::collections::HashMap;
use std::sync::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PaperOrderStatus {
    Open,
    PartFilled,
    Filled,
    Cancelled,
}

#[derive(Debug, Clone)]
struct PaperOrder {
    id: String,
    pair: Pair,
    side: Side,
    price: Decimal,
    base_amount: Decimal,
    base_filled: Decimal,
    quote_filled: Decimal,
    status: PaperOrderStatus,
}

#[derive(Debug, Default)]
struct Wallet {
    free: Decimal,
    locked: Decimal,
}

struct PaperState {
    balances: HashMap<String, Wallet>,
    orders: HashMap<String, PaperOrder>,
    book: OrderBook,
    market: MarketDescriptor,
    next_id: u64,
}

/// Deterministic in-memory exchange
pub struct PaperExchange {
    state: Mutex<PaperState>,
}

impl Default for PaperExchange {
    fn default() -> Self {
        // 20 levels per side at one-tick spacing around 100.0
        PaperExchange::new(Pair::new("BTC", "USDT"), dec!(100), dec!(0.1), 20, dec!(1))
    }
}

impl PaperExchange {
    /// Build an exchange with a synthetic book of `levels` per side around
    /// `mid` at one-tick spacing, each level carrying `level_amount` base.
    pub fn new(pair: Pair, mid: Decimal, tick: Decimal, levels: u32, level_amount: Decimal) -> Self {
        let mut bids = Vec::new();
        let mut asks = Vec::new();
        for i in 1..=levels {
            let offset = tick * Decimal::from(i);
            bids.push(BookLevel {
                price: mid - offset,
                amount: level_amount,
            });
            asks.push(BookLevel {
                price: mid + offset,
                amount: level_amount,
            });
        }

        let market = MarketDescriptor {
            pair: pair.clone(),
            base_decimals: 8,
            quote_decimals: 8,
            min_amount: dec!(0.0001),
            max_amount: None,
            price_tick: tick,
        };

        PaperExchange {
            state: Mutex::new(PaperState {
                balances: HashMap::new(),
                orders: HashMap::new(),
                book: OrderBook { bids, asks },
                market,
                next_id: 1,
            }),
        }
    }

    /// Seed a coin balance (free funds)
    pub fn deposit(&self, coin: &str, amount: Decimal) {
        let mut state = self.state.lock().unwrap();
        state.balances.entry(coin.to_uppercase()).or_default().free += amount;
    }

    /// Replace the synthetic book
    pub fn set_book(&self, book: OrderBook) {
        self.state.lock().unwrap().book = book;
    }

    /// Force-fill an open order, as if another participant took it
    pub fn force_fill(&self, id: &str) -> bool {
        let mut state = self.state.lock().unwrap();
        let Some(mut order) = state.orders.get(id).cloned() else {
            return false;
        };
        if order.status != PaperOrderStatus::Open && order.status != PaperOrderStatus::PartFilled {
            return false;
        }
        let remaining = order.base_amount - order.base_filled;
        settle_fill(&mut state, &order.pair, order.side, order.price, remaining, true);
        order.base_filled = order.base_amount;
        order.quote_filled += order.price * remaining;
        order.status = PaperOrderStatus::Filled;
        state.orders.insert(id.to_string(), order);
        true
    }

    /// Force a partial fill of `amount` base on an open order
    pub fn force_partial_fill(&self, id: &str, amount: Decimal) -> bool {
        let mut state = self.state.lock().unwrap();
        let Some(mut order) = state.orders.get(id).cloned() else {
            return false;
        };
        let remaining = order.base_amount - order.base_filled;
        if remaining <= amount || order.status == PaperOrderStatus::Filled {
            drop(state);
            return self.force_fill(id);
        }
        settle_fill(&mut state, &order.pair, order.side, order.price, amount, true);
        order.base_filled += amount;
        order.quote_filled += order.price * amount;
        order.status = PaperOrderStatus::PartFilled;
        state.orders.insert(id.to_string(), order);
        true
    }

    /// Drop all knowledge of an order, simulating an id the exchange no
    /// longer recognizes
    pub fn forget_order(&self, id: &str) -> bool {
        self.state.lock().unwrap().orders.remove(id).is_some()
    }

    /// Register an exchange-visible order that no ledger row points at
    pub fn inject_foreign_order(&self, pair: &Pair, side: Side, price: Decimal, amount: Decimal) -> String {
        let mut state = self.state.lock().unwrap();
        let id = format!("paper-{}", state.next_id);
        state.next_id += 1;
        state.orders.insert(
            id.clone(),
            PaperOrder {
                id: id.clone(),
                pair: pair.clone(),
                side,
                price,
                base_amount: amount,
                base_filled: Decimal::ZERO,
                quote_filled: Decimal::ZERO,
                status: PaperOrderStatus::Open,
            },
        );
        id
    }

    fn coin_free(state: &PaperState, coin: &str) -> Decimal {
        state.balances.get(coin).map(|w| w.free).unwrap_or_default()
    }
}

/// Move funds for an executed fill. `from_locked` is true when the filled
/// amount was reserved by a resting order.
fn settle_fill(
    state: &mut PaperState,
    pair: &Pair,
    side: Side,
    price: Decimal,
    base_amount: Decimal,
    from_locked: bool,
) {
    let quote_amount = price * base_amount;
    match side {
        Side::Buy => {
            let quote = state.balances.entry(pair.quote.clone()).or_default();
            if from_locked {
                quote.locked -= quote_amount;
            } else {
                quote.free -= quote_amount;
            }
            state.balances.entry(pair.base.clone()).or_default().free += base_amount;
        }
        Side::Sell => {
            let base = state.balances.entry(pair.base.clone()).or_default();
            if from_locked {
                base.locked -= base_amount;
            } else {
                base.free -= base_amount;
            }
            state.balances.entry(pair.quote.clone()).or_default().free += quote_amount;
        }
    }
}

#[async_trait]
impl TradingApi for PaperExchange {
    fn name(&self) -> &'static str {
        "paper"
    }

    fn features(&self) -> Features {
        Features {
            place_market_order: true,
            amount_for_market_buy: false,
            amount_for_market_order_necessary: false,
            get_deposit_address: false,
            get_trading_fees: false,
            support_coin_networks: false,
            order_number_limit: None,
        }
    }

    async fn load_markets(&self) -> Result<HashMap<String, MarketDescriptor>, ExchangeError> {
        let state = self.state.lock().unwrap();
        let mut markets = HashMap::new();
        markets.insert(state.market.pair.symbol(), state.market.clone());
        Ok(markets)
    }

    async fn balances(&self, include_zero: bool) -> Result<Vec<BalanceEntry>, ExchangeError> {
        let state = self.state.lock().unwrap();
        let mut entries: Vec<BalanceEntry> = state
            .balances
            .iter()
            .map(|(coin, w)| BalanceEntry {
                coin: coin.clone(),
                free: w.free,
                locked: w.locked,
            })
            .filter(|e| include_zero || !e.total().is_zero())
            .collect();
        entries.sort_by(|a, b| a.coin.cmp(&b.coin));
        Ok(entries)
    }

    async fn open_orders(&self, pair: &Pair) -> Result<Vec<OpenOrder>, ExchangeError> {
        let state = self.state.lock().unwrap();
        let mut orders: Vec<OpenOrder> = state
            .orders
            .values()
            .filter(|o| &o.pair == pair)
            .filter(|o| {
                matches!(
                    o.status,
                    PaperOrderStatus::Open | PaperOrderStatus::PartFilled
                )
            })
            .map(|o| OpenOrder {
                id: o.id.clone(),
                side: o.side,
                price: o.price,
                base_amount: o.base_amount,
                base_executed: o.base_filled,
            })
            .collect();
        orders.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(orders)
    }

    async fn order_details(&self, id: &str, _pair: &Pair) -> Result<OrderDetails, ExchangeError> {
        let state = self.state.lock().unwrap();
        let Some(order) = state.orders.get(id) else {
            return Ok(OrderDetails::unknown());
        };
        let status = match order.status {
            PaperOrderStatus::Open => OrderDetailsStatus::New,
            PaperOrderStatus::PartFilled => OrderDetailsStatus::PartFilled,
            PaperOrderStatus::Filled => OrderDetailsStatus::Filled,
            PaperOrderStatus::Cancelled => OrderDetailsStatus::Cancelled,
        };
        Ok(OrderDetails {
            status,
            base_filled: order.base_filled,
            quote_filled: order.quote_filled,
        })
    }

    async fn place_order(&self, req: &PlaceRequest) -> Result<String, ExchangeError> {
        let mut state = self.state.lock().unwrap();

        let (price, marketable) = if req.is_limit {
            let price = req
                .price
                .ok_or_else(|| ExchangeError::rejected("limit order without price"))?;
            let crossing = match req.side {
                Side::Buy => state.book.best_ask().map(|a| price >= a).unwrap_or(false),
                Side::Sell => state.book.best_bid().map(|b| price <= b).unwrap_or(false),
            };
            (price, crossing)
        } else {
            let best = match req.side {
                Side::Buy => state.book.best_ask(),
                Side::Sell => state.book.best_bid(),
            };
            let price = best.ok_or_else(|| ExchangeError::rejected("empty book for market order"))?;
            (price, true)
        };

        let base_amount = match (req.base_amount, req.quote_amount) {
            (Some(base), _) => base,
            (None, Some(quote)) if !price.is_zero() => quote / price,
            _ => return Err(ExchangeError::rejected("order without amount")),
        };

        if base_amount < state.market.min_amount {
            return Err(ExchangeError::rejected(format!(
                "amount {} below market minimum {}",
                base_amount, state.market.min_amount
            )));
        }

        // Funds check before anything is booked
        match req.side {
            Side::Buy => {
                let needed = price * base_amount;
                if PaperExchange::coin_free(&state, &req.pair.quote) < needed {
                    return Err(ExchangeError::rejected(format!(
                        "insufficient {} balance",
                        req.pair.quote
                    )));
                }
            }
            Side::Sell => {
                if PaperExchange::coin_free(&state, &req.pair.base) < base_amount {
                    return Err(ExchangeError::rejected(format!(
                        "insufficient {} balance",
                        req.pair.base
                    )));
                }
            }
        }

        let id = format!("paper-{}", state.next_id);
        state.next_id += 1;

        if marketable {
            settle_fill(&mut state, &req.pair, req.side, price, base_amount, false);
            state.orders.insert(
                id.clone(),
                PaperOrder {
                    id: id.clone(),
                    pair: req.pair.clone(),
                    side: req.side,
                    price,
                    base_amount,
                    base_filled: base_amount,
                    quote_filled: price * base_amount,
                    status: PaperOrderStatus::Filled,
                },
            );
        } else {
            // Reserve funds while the order rests
            match req.side {
                Side::Buy => {
                    let needed = price * base_amount;
                    let quote = state.balances.entry(req.pair.quote.clone()).or_default();
                    quote.free -= needed;
                    quote.locked += needed;
                }
                Side::Sell => {
                    let base = state.balances.entry(req.pair.base.clone()).or_default();
                    base.free -= base_amount;
                    base.locked += base_amount;
                }
            }
            state.orders.insert(
                id.clone(),
                PaperOrder {
                    id: id.clone(),
                    pair: req.pair.clone(),
                    side: req.side,
                    price,
                    base_amount,
                    base_filled: Decimal::ZERO,
                    quote_filled: Decimal::ZERO,
                    status: PaperOrderStatus::Open,
                },
            );
        }

        Ok(id)
    }

    async fn cancel_order(
        &self,
        id: &str,
        _side: Side,
        _pair: &Pair,
    ) -> Result<CancelOutcome, ExchangeError> {
        let mut state = self.state.lock().unwrap();
        let Some(order) = state.orders.get(id).cloned() else {
            return Ok(CancelOutcome::Unknown);
        };
        match order.status {
            PaperOrderStatus::Filled | PaperOrderStatus::Cancelled => {
                Ok(CancelOutcome::AlreadyClosed)
            }
            PaperOrderStatus::Open | PaperOrderStatus::PartFilled => {
                let remaining = order.base_amount - order.base_filled;
                match order.side {
                    Side::Buy => {
                        let held = order.price * remaining;
                        let quote = state.balances.entry(order.pair.quote.clone()).or_default();
                        quote.locked -= held;
                        quote.free += held;
                    }
                    Side::Sell => {
                        let base = state.balances.entry(order.pair.base.clone()).or_default();
                        base.locked -= remaining;
                        base.free += remaining;
                    }
                }
                let entry = state.orders.get_mut(id).unwrap();
                entry.status = PaperOrderStatus::Cancelled;
                Ok(CancelOutcome::Cancelled)
            }
        }
    }

    async fn rates(&self, _pair: &Pair) -> Result<Rates, ExchangeError> {
        let state = self.state.lock().unwrap();
        let bid = state
            .book
            .best_bid()
            .ok_or_else(|| ExchangeError::transient("empty bid side"))?;
        let ask = state
            .book
            .best_ask()
            .ok_or_else(|| ExchangeError::transient("empty ask side"))?;
        let mid = (bid + ask) / dec!(2);
        Ok(Rates {
            bid,
            ask,
            last: mid,
            high_24h: ask * dec!(1.05),
            low_24h: bid * dec!(0.95),
            volume_24h: dec!(1000),
            quote_volume_24h: mid * dec!(1000),
        })
    }

    async fn order_book(&self, _pair: &Pair) -> Result<OrderBook, ExchangeError> {
        Ok(self.state.lock().unwrap().book.clone())
    }
}
