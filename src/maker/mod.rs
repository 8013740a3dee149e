//! Maker components and their shared context
//!
//! All background activities (builder, provider, watcher, price maker) and
//! the command processor work through one [`MakerContext`]: the chosen
//! adapter, the ledger, the parameter record and the TTL caches that bound
//! API pressure.

pub mod liquidity;
pub mod orderbook;
pub mod pricemaker;
pub mod scheduler;
pub mod watcher;

use crate::cache::{TtlCell, TtlMap};
use crate::exchange::{
    BalanceEntry, ExchangeError, Features, MarketDescriptor, OrderBook, PlaceRequest, TradingApi,
};
use crate::ledger::Ledger;
use crate::notify::Notifier;
use crate::orders::{Order, OrderKind, Purpose};
use crate::params::{PwPolicy, TradeParams};
use crate::rates::RateInfoClient;
use crate::types::{Pair, Side};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::RwLock as StdRwLock;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::debug;
use watcher::PwRange;

/// Balance snapshots stay fresh this long unless eagerly invalidated
const BALANCE_TTL: Duration = Duration::from_secs(5);

/// Order book snapshots per pair
const BOOK_TTL: Duration = Duration::from_secs(3);

/// How long a stale watcher range is still honored under the smart policy
pub const PW_SMART_GRACE_SECS: i64 = 600;

/// Re-entrancy guard: one iteration of a component at a time
#[derive(Default)]
pub struct ComponentGuard {
    running: AtomicBool,
}

pub struct GuardToken<'a>(&'a AtomicBool);

impl ComponentGuard {
    /// Returns a token while no other iteration holds one
    pub fn try_enter(&self) -> Option<GuardToken<'_>> {
        if self.running.swap(true, Ordering::SeqCst) {
            None
        } else {
            Some(GuardToken(&self.running))
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

impl Drop for GuardToken<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// What the price watcher currently allows
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PwVerdict {
    /// Watcher disabled or unconfigured: no constraint
    Disabled,
    /// Orders must price inside `[low, high]`
    Range { low: Decimal, high: Decimal },
    /// No usable range: block all new placements
    Blocked,
}

/// Outcome of a tracked placement
#[derive(Debug)]
pub enum PlaceOutcome {
    Placed(Order),
    Rejected(String),
    Transient(String),
}

pub struct MakerContext {
    pub pair: Pair,
    pub api: Arc<dyn TradingApi>,
    pub ledger: Arc<Ledger>,
    pub rates: Arc<RateInfoClient>,
    pub notifier: Arc<Notifier>,
    pub market: MarketDescriptor,

    params: RwLock<TradeParams>,
    params_path: Option<PathBuf>,

    balance_cache: TtlCell<Vec<BalanceEntry>>,
    book_cache: TtlMap<Pair, OrderBook>,

    pw_state: StdRwLock<Option<PwRange>>,

    /// Forces the liquidity provider to re-seed both pools
    pub reset_liq: AtomicBool,

    pub ob_guard: ComponentGuard,
    pub liq_guard: ComponentGuard,
    pub pw_guard: ComponentGuard,
}

impl MakerContext {
    pub fn new(
        pair: Pair,
        api: Arc<dyn TradingApi>,
        ledger: Arc<Ledger>,
        rates: Arc<RateInfoClient>,
        notifier: Arc<Notifier>,
        market: MarketDescriptor,
        params: TradeParams,
        params_path: Option<PathBuf>,
    ) -> Self {
        MakerContext {
            pair,
            api,
            ledger,
            rates,
            notifier,
            market,
            params: RwLock::new(params),
            params_path,
            balance_cache: TtlCell::new(BALANCE_TTL),
            book_cache: TtlMap::new(BOOK_TTL),
            pw_state: StdRwLock::new(None),
            reset_liq: AtomicBool::new(false),
            ob_guard: ComponentGuard::default(),
            liq_guard: ComponentGuard::default(),
            pw_guard: ComponentGuard::default(),
        }
    }

    /// Lock-free-for-readers snapshot of the parameter record
    pub async fn snapshot_params(&self) -> TradeParams {
        self.params.read().await.clone()
    }

    /// Applies a mutation and persists the record
    pub async fn mutate_params<F: FnOnce(&mut TradeParams)>(&self, mutate: F) -> Result<TradeParams> {
        let mut params = self.params.write().await;
        mutate(&mut params);
        let snapshot = params.clone();
        drop(params);
        if let Some(path) = &self.params_path {
            snapshot.save(path)?;
        }
        Ok(snapshot)
    }

    /// Balance snapshot through the cache
    pub async fn balances(&self) -> Result<Vec<BalanceEntry>, ExchangeError> {
        if let Some(cached) = self.balance_cache.get().await {
            return Ok(cached);
        }
        let fresh = self.api.balances(false).await?;
        self.balance_cache.put(fresh.clone()).await;
        Ok(fresh)
    }

    pub async fn free_balance(&self, coin: &str) -> Result<Decimal, ExchangeError> {
        Ok(self
            .balances()
            .await?
            .into_iter()
            .find(|b| b.coin.eq_ignore_ascii_case(coin))
            .map(|b| b.free)
            .unwrap_or_default())
    }

    pub async fn invalidate_balances(&self) {
        self.balance_cache.invalidate().await;
    }

    /// Order book snapshot through the cache
    pub async fn order_book(&self, pair: &Pair) -> Result<OrderBook, ExchangeError> {
        if let Some(cached) = self.book_cache.get(pair).await {
            return Ok(cached);
        }
        let fresh = self.api.order_book(pair).await?;
        self.book_cache.put(pair.clone(), fresh.clone()).await;
        Ok(fresh)
    }

    pub async fn invalidate_book(&self, pair: &Pair) {
        self.book_cache.invalidate(pair).await;
    }

    pub fn features(&self) -> Features {
        self.api.features()
    }

    /// Publishes a fresh watcher range
    pub fn publish_pw_range(&self, range: PwRange) {
        *self.pw_state.write().unwrap() = Some(range);
    }

    pub fn pw_range(&self) -> Option<PwRange> {
        self.pw_state.read().unwrap().clone()
    }

    /// Resolves the watcher state into a placement constraint under the
    /// configured staleness policy
    pub fn pw_verdict(&self, params: &TradeParams) -> PwVerdict {
        if !params.is_pw_active || params.pw_source.is_none() {
            return PwVerdict::Disabled;
        }
        let Some(range) = self.pw_range() else {
            return PwVerdict::Blocked;
        };
        if range.is_actual && !range.is_anomaly {
            return PwVerdict::Range {
                low: range.low,
                high: range.high,
            };
        }
        let age = Utc::now() - range.updated_at;
        match params.pw_policy {
            PwPolicy::Smart if age.num_seconds() < PW_SMART_GRACE_SECS => PwVerdict::Range {
                low: range.low,
                high: range.high,
            },
            _ => PwVerdict::Blocked,
        }
    }

    /// Places an order and records the accepted row in the ledger. The
    /// balance and book caches are invalidated on success.
    pub async fn place_tracked(
        &self,
        req: PlaceRequest,
        purpose: Purpose,
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<PlaceOutcome> {
        let exchange_id = match self.api.place_order(&req).await {
            Ok(id) => id,
            Err(ExchangeError::Rejected { reason }) => {
                debug!("Placement rejected ({}): {}", purpose, reason);
                if purpose == Purpose::Ld {
                    // Rejected ladder rungs stay visible to the operator
                    let mut order = order_from_request(&req, purpose, None, expires_at);
                    order.closed = true;
                    order.cancelled = true;
                    order.not_placed_reason = Some(reason.clone());
                    self.ledger.insert(&mut order)?;
                }
                return Ok(PlaceOutcome::Rejected(reason));
            }
            Err(e) if e.is_transient() => return Ok(PlaceOutcome::Transient(e.to_string())),
            Err(e) => return Ok(PlaceOutcome::Rejected(e.to_string())),
        };

        let mut order = order_from_request(&req, purpose, Some(exchange_id), expires_at);
        self.ledger
            .insert(&mut order)
            .context("placed order could not be recorded")?;

        self.invalidate_balances().await;
        self.invalidate_book(&req.pair).await;
        Ok(PlaceOutcome::Placed(order))
    }
}

fn order_from_request(
    req: &PlaceRequest,
    purpose: Purpose,
    exchange_id: Option<String>,
    expires_at: Option<DateTime<Utc>>,
) -> Order {
    let now = Utc::now();
    let base_amount = req.base_amount.unwrap_or_default();
    let quote_amount = match (req.price, req.base_amount, req.quote_amount) {
        (Some(price), Some(base), _) => price * base,
        (_, _, Some(quote)) => quote,
        _ => Decimal::ZERO,
    };
    Order {
        id: 0,
        exchange_id,
        pair: req.pair.clone(),
        side: req.side,
        kind: if req.is_limit {
            OrderKind::Limit
        } else {
            OrderKind::Market
        },
        purpose,
        price: req.price,
        base_amount,
        quote_amount,
        base_filled: Decimal::ZERO,
        quote_filled: Decimal::ZERO,
        created_at: now,
        updated_at: now,
        expires_at,
        processed: false,
        executed: false,
        cancelled: false,
        closed: false,
        close_reason: None,
        missing_count: 0,
        ladder_index: None,
        ladder_state: None,
        not_placed_reason: None,
    }
}

/// Checks the cached balance snapshot covers an intended limit order
pub async fn has_funds_for(
    ctx: &MakerContext,
    side: Side,
    price: Decimal,
    base_amount: Decimal,
) -> Result<bool, ExchangeError> {
    match side {
        Side::Buy => {
            let free = ctx.free_balance(&ctx.pair.quote).await?;
            Ok(free >= price * base_amount)
        }
        Side::Sell => {
            let free = ctx.free_balance(&ctx.pair.base).await?;
            Ok(free >= base_amount)
        }
    }
}

#[cfg(test)]
pub(crate) mod testutil {
    use super::*;
    use crate::exchange::paper::PaperExchange;
    use rust_decimal_macros::dec;
    use std::collections::HashMap;

    /// Context over a funded paper exchange with a default synthetic book
    pub async fn paper_context() -> (Arc<PaperExchange>, Arc<MakerContext>) {
        paper_context_with(TradeParams::default()).await
    }

    pub async fn paper_context_with(params: TradeParams) -> (Arc<PaperExchange>, Arc<MakerContext>) {
        let exchange = Arc::new(PaperExchange::default());
        exchange.deposit("BTC", dec!(1000));
        exchange.deposit("USDT", dec!(100000));

        let pair = Pair::new("BTC", "USDT");
        let ledger = Arc::new(Ledger::open_in_memory().unwrap());
        let mut usd = HashMap::new();
        usd.insert("BTC".to_string(), dec!(100));
        let rates = Arc::new(RateInfoClient::with_static(usd));
        let market = exchange
            .load_markets()
            .await
            .unwrap()
            .remove(&pair.symbol())
            .unwrap();

        let ctx = Arc::new(MakerContext::new(
            pair,
            exchange.clone(),
            ledger,
            rates,
            Arc::new(Notifier::new()),
            market,
            params,
            None,
        ));
        (exchange, ctx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;
    use rust_decimal_macros::dec;
    use testutil::paper_context;

    #[test]
    fn test_guard_excludes_second_entry() {
        let guard = ComponentGuard::default();
        let token = guard.try_enter().unwrap();
        assert!(guard.try_enter().is_none());
        assert!(guard.is_running());
        drop(token);
        assert!(guard.try_enter().is_some());
    }

    #[tokio::test]
    async fn test_place_tracked_records_row_and_invalidates() {
        let (_exchange, ctx) = paper_context().await;
        let before = ctx.free_balance("USDT").await.unwrap();

        let req = PlaceRequest::limit(ctx.pair.clone(), Side::Buy, dec!(99), dec!(1));
        let outcome = ctx.place_tracked(req, Purpose::Ob, None).await.unwrap();
        let order = match outcome {
            PlaceOutcome::Placed(order) => order,
            other => panic!("expected placement, got {:?}", other),
        };
        assert!(order.id > 0);
        assert_eq!(order.purpose, Purpose::Ob);

        // cache was invalidated: the reserved quote is gone from free
        let after = ctx.free_balance("USDT").await.unwrap();
        assert_eq!(before - after, dec!(99));
    }

    #[tokio::test]
    async fn test_place_tracked_rejection_not_inserted() {
        let (_exchange, ctx) = paper_context().await;
        let req = PlaceRequest::limit(ctx.pair.clone(), Side::Buy, dec!(99), dec!(100000));
        let outcome = ctx.place_tracked(req, Purpose::Ob, None).await.unwrap();
        assert!(matches!(outcome, PlaceOutcome::Rejected(_)));
        assert!(ctx.ledger.find_open(&ctx.pair, None).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_pw_verdict_strict_blocks_without_range() {
        let params = TradeParams {
            is_pw_active: true,
            pw_source: Some(crate::params::PwSource::Numeric {
                low: dec!(90),
                high: dec!(110),
                currency: "USDT".to_string(),
            }),
            pw_policy: PwPolicy::Strict,
            ..Default::default()
        };
        let (_exchange, ctx) = testutil::paper_context_with(params.clone()).await;

        assert_eq!(ctx.pw_verdict(&params), PwVerdict::Blocked);

        ctx.publish_pw_range(PwRange {
            low: dec!(90),
            mid: dec!(100),
            high: dec!(110),
            is_actual: true,
            is_anomaly: false,
            updated_at: Utc::now(),
        });
        assert_eq!(
            ctx.pw_verdict(&params),
            PwVerdict::Range {
                low: dec!(90),
                high: dec!(110)
            }
        );

        // not-actual under strict blocks immediately
        ctx.publish_pw_range(PwRange {
            low: dec!(90),
            mid: dec!(100),
            high: dec!(110),
            is_actual: false,
            is_anomaly: false,
            updated_at: Utc::now(),
        });
        assert_eq!(ctx.pw_verdict(&params), PwVerdict::Blocked);
    }

    #[tokio::test]
    async fn test_pw_verdict_smart_grace() {
        let mut params = TradeParams {
            is_pw_active: true,
            pw_source: Some(crate::params::PwSource::Numeric {
                low: dec!(90),
                high: dec!(110),
                currency: "USDT".to_string(),
            }),
            pw_policy: PwPolicy::Smart,
            ..Default::default()
        };
        let (_exchange, ctx) = testutil::paper_context_with(params.clone()).await;

        // stale-but-recent range is still honored
        ctx.publish_pw_range(PwRange {
            low: dec!(90),
            mid: dec!(100),
            high: dec!(110),
            is_actual: false,
            is_anomaly: false,
            updated_at: Utc::now(),
        });
        assert!(matches!(ctx.pw_verdict(&params), PwVerdict::Range { .. }));

        // past the grace window it blocks
        ctx.publish_pw_range(PwRange {
            low: dec!(90),
            mid: dec!(100),
            high: dec!(110),
            is_actual: false,
            is_anomaly: false,
            updated_at: Utc::now() - ChronoDuration::minutes(11),
        });
        assert_eq!(ctx.pw_verdict(&params), PwVerdict::Blocked);

        params.is_pw_active = false;
        assert_eq!(ctx.pw_verdict(&params), PwVerdict::Disabled);
    }
}
