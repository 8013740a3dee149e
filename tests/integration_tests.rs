//! End-to-end scenarios for the market-shaper agent
//!
//! Every test drives the full stack (command processor, makers, ledger,
//! reconciler) against the in-memory paper exchange.

use std::collections::HashMap;
use std::sync::Arc;

use rust_decimal::Decimal;
use rust_decimal_macros::dec;

use market_shaper::commands::CommandProcessor;
use market_shaper::exchange::paper::PaperExchange;
use market_shaper::exchange::{BookLevel, OrderBook, PlaceRequest, TradingApi};
use market_shaper::ledger::{Ledger, StatsWindow};
use market_shaper::maker::liquidity::LiquidityProvider;
use market_shaper::maker::orderbook::OrderBookBuilder;
use market_shaper::maker::watcher::PwRange;
use market_shaper::maker::MakerContext;
use market_shaper::notify::Notifier;
use market_shaper::orders::reconciler::Reconciler;
use market_shaper::orders::{CloseReason, Order, Purpose};
use market_shaper::params::{PwAction, PwPolicy, PwSource, TradeParams};
use market_shaper::rates::RateInfoClient;
use market_shaper::types::{Pair, Side};

// =============================================================================
// Test Utilities
// =============================================================================

fn pair() -> Pair {
    Pair::new("BTC", "USDT")
}

/// Full agent over a funded paper exchange with the default synthetic book
/// (20 levels per side at one-tick spacing around 100.0)
async fn build_agent(params: TradeParams) -> (Arc<PaperExchange>, Arc<MakerContext>) {
    build_agent_funded(params, dec!(1000), dec!(100000)).await
}

async fn build_agent_funded(
    params: TradeParams,
    base_funds: Decimal,
    quote_funds: Decimal,
) -> (Arc<PaperExchange>, Arc<MakerContext>) {
    let exchange = Arc::new(PaperExchange::default());
    if base_funds > Decimal::ZERO {
        exchange.deposit("BTC", base_funds);
    }
    if quote_funds > Decimal::ZERO {
        exchange.deposit("USDT", quote_funds);
    }

    let market = exchange
        .load_markets()
        .await
        .unwrap()
        .remove(&pair().symbol())
        .unwrap();
    let mut usd = HashMap::new();
    usd.insert("BTC".to_string(), dec!(100));

    let ctx = Arc::new(MakerContext::new(
        pair(),
        exchange.clone(),
        Arc::new(Ledger::open_in_memory().unwrap()),
        Arc::new(RateInfoClient::with_static(usd)),
        Arc::new(Notifier::new()),
        market,
        params,
        None,
    ));
    (exchange, ctx)
}

fn ob_params(count: u32) -> TradeParams {
    TradeParams {
        is_active: true,
        is_ob_active: true,
        ob_orders_count: count,
        ob_height: 20,
        ob_max_order_percent: dec!(50),
        min_amount: dec!(0.01),
        max_amount: dec!(0.1),
        ..Default::default()
    }
}

async fn place_tracked_order(
    exchange: &PaperExchange,
    ctx: &MakerContext,
    purpose: Purpose,
    side: Side,
    price: Decimal,
    amount: Decimal,
) -> Order {
    let req = PlaceRequest::limit(pair(), side, price, amount);
    let id = exchange.place_order(&req).await.unwrap();
    let mut order = Order::new_limit(pair(), side, purpose, id, price, amount, None);
    ctx.ledger.insert(&mut order).unwrap();
    order
}

// =============================================================================
// Scenario: order-book builder fills and maintains its budget
// =============================================================================

#[tokio::test]
async fn test_builder_reaches_budget_and_replaces_fills() {
    let (exchange, ctx) = build_agent(ob_params(10)).await;
    let builder = OrderBookBuilder::new(ctx.clone());

    // up to five placements per iteration
    builder.tick().await.unwrap();
    builder.tick().await.unwrap();

    let open = ctx.ledger.find_open(&pair(), Some(&[Purpose::Ob])).unwrap();
    assert_eq!(open.len(), 10);
    for order in &open {
        let price = order.price.unwrap();
        // strictly inside the visible book, never at the best price
        match order.side {
            Side::Buy => assert!(price < dec!(99.9) && price >= dec!(98.0), "buy {}", price),
            Side::Sell => assert!(price > dec!(100.1) && price <= dec!(102.0), "sell {}", price),
        }
        let lifetime = (order.expires_at.unwrap() - order.created_at).num_milliseconds();
        assert!(lifetime >= 1500, "lifetime {}", lifetime);
        // ledger and exchange agree the order is live
        assert!(exchange
            .open_orders(&pair())
            .await
            .unwrap()
            .iter()
            .any(|o| Some(&o.id) == order.exchange_id.as_ref()));
    }

    // a fill frees one budget slot, the next tick restores it
    let victim = open[0].exchange_id.clone().unwrap();
    exchange.force_fill(&victim);
    builder.tick().await.unwrap();

    assert_eq!(ctx.ledger.count_open(&pair(), Purpose::Ob).unwrap(), 10);
    let filled = ctx.ledger.find_by_exchange_id(&victim).unwrap().unwrap();
    assert!(filled.closed);
    assert!(filled.executed);
    assert_eq!(filled.close_reason, Some(CloseReason::Filled));
}

// =============================================================================
// Scenario: strict price watcher contains every ob-order in the band
// =============================================================================

#[tokio::test]
async fn test_strict_band_survives_price_shock() {
    let mut params = ob_params(8);
    params.is_pw_active = true;
    params.pw_policy = PwPolicy::Strict;
    params.pw_action = PwAction::Prevent;
    params.pw_source = Some(PwSource::Numeric {
        low: dec!(95),
        high: dec!(105),
        currency: "USDT".to_string(),
    });
    let (exchange, ctx) = build_agent(params).await;
    ctx.publish_pw_range(PwRange {
        low: dec!(95),
        mid: dec!(100),
        high: dec!(105),
        is_actual: true,
        is_anomaly: false,
        updated_at: chrono::Utc::now(),
    });

    // an external shock moved the whole book down to 89
    let mut shocked = OrderBook::default();
    for i in 1..=20u32 {
        let offset = dec!(0.1) * Decimal::from(i);
        shocked.bids.push(BookLevel {
            price: dec!(89) - offset,
            amount: dec!(5),
        });
        shocked.asks.push(BookLevel {
            price: dec!(89) + offset,
            amount: dec!(5),
        });
    }
    exchange.set_book(shocked);

    // sell orders stranded below the band after the shock
    let stranded_a =
        place_tracked_order(&exchange, &ctx, Purpose::Ob, Side::Sell, dec!(90), dec!(1)).await;
    let stranded_b =
        place_tracked_order(&exchange, &ctx, Purpose::Ob, Side::Sell, dec!(93), dec!(1)).await;

    let builder = OrderBookBuilder::new(ctx.clone());
    let mut out_of_band = 0;
    for _ in 0..2 {
        out_of_band += builder.tick().await.unwrap().out_of_band_cancelled;
    }
    assert_eq!(out_of_band, 2, "stranded orders not collected within two ticks");

    for stranded in [&stranded_a, &stranded_b] {
        let row = ctx.ledger.find_by_id(stranded.id).unwrap().unwrap();
        assert!(row.closed);
        assert_eq!(row.close_reason, Some(CloseReason::OutOfPwRange));
    }

    // everything placed meanwhile is inside [95, 105]
    for order in ctx.ledger.find_open(&pair(), Some(&[Purpose::Ob])).unwrap() {
        let price = order.price.unwrap();
        assert!(price >= dec!(95) && price <= dec!(105), "price {}", price);
    }
}

// =============================================================================
// Scenario: liquidity pools via operator commands
// =============================================================================

#[tokio::test]
async fn test_liquidity_enabled_by_command_builds_skewed_pools() {
    let (_exchange, ctx) = build_agent(TradeParams::default()).await;
    let processor = CommandProcessor::new(ctx.clone(), dec!(1000000));

    processor.handle("start mm").await;
    let outcome = processor.handle("enable liq 2% 100 BTC 50 USDT uptrend").await;
    assert!(outcome.reply.contains("Liquidity enabled"), "{}", outcome.reply);

    let provider = LiquidityProvider::new(ctx.clone());
    let report = provider.tick().await.unwrap();

    assert!(report.ask_base_total >= dec!(95), "asks {}", report.ask_base_total);
    assert!(report.bid_quote_total >= dec!(47.5), "bids {}", report.bid_quote_total);

    let open = ctx.ledger.find_open(&pair(), Some(&[Purpose::Liq])).unwrap();
    let asks: Vec<_> = open.iter().filter(|o| o.side == Side::Sell).collect();
    let bids: Vec<_> = open.iter().filter(|o| o.side == Side::Buy).collect();
    assert!(asks.len() >= 2);
    assert!(bids.len() >= 2);
    // uptrend skew around mid = 100
    for ask in asks {
        assert!(ask.price.unwrap() >= dec!(100.6), "ask {:?}", ask.price);
    }
    for bid in bids {
        assert!(bid.price.unwrap() <= dec!(100), "bid {:?}", bid.price);
    }
}

// =============================================================================
// Scenario: selective clear by purpose, side and price filter
// =============================================================================

#[tokio::test]
async fn test_clear_command_with_price_filter() {
    let (exchange, ctx) = build_agent(TradeParams::default()).await;
    let processor = CommandProcessor::new(ctx.clone(), dec!(1000000));

    for price in [dec!(100.3), dec!(100.4), dec!(100.6), dec!(100.7)] {
        place_tracked_order(&exchange, &ctx, Purpose::Mm, Side::Sell, price, dec!(1)).await;
    }

    let outcome = processor.handle("clear mm sell >100.5 USDT").await;
    assert!(
        outcome.reply.contains("attempted=2, cancelled=2"),
        "reply: {}",
        outcome.reply
    );

    let open = ctx.ledger.find_open(&pair(), None).unwrap();
    assert_eq!(open.len(), 2);
    assert!(open.iter().all(|o| o.price.unwrap() < dec!(100.5)));
    assert_eq!(exchange.open_orders(&pair()).await.unwrap().len(), 2);
}

// =============================================================================
// Scenario: fill command rejects when the balance cannot cover it
// =============================================================================

#[tokio::test]
async fn test_fill_command_rejected_without_funds() {
    let (exchange, ctx) = build_agent_funded(TradeParams::default(), dec!(0), dec!(0.005)).await;
    let processor = CommandProcessor::new(ctx.clone(), dec!(1000000));

    let outcome = processor
        .handle("fill buy quote=0.01 low=100 high=110 count=5")
        .await;
    assert!(outcome.reply.contains("Not enough USDT"), "{}", outcome.reply);
    assert!(ctx.ledger.find_open(&pair(), None).unwrap().is_empty());
    assert!(exchange.open_orders(&pair()).await.unwrap().is_empty());
}

// =============================================================================
// Scenario: make price through confirmation
// =============================================================================

#[tokio::test]
async fn test_make_price_confirmed_moves_through_depth() {
    let (exchange, ctx) = build_agent(TradeParams::default()).await;
    let processor = CommandProcessor::new(ctx.clone(), dec!(1000000));

    // best ask 1.00, cumulative 50 base up to 1.10
    exchange.set_book(OrderBook {
        bids: vec![BookLevel {
            price: dec!(0.99),
            amount: dec!(10),
        }],
        asks: vec![
            BookLevel {
                price: dec!(1.00),
                amount: dec!(30),
            },
            BookLevel {
                price: dec!(1.10),
                amount: dec!(20),
            },
        ],
    });

    let outcome = processor.handle("make price 1.10 now").await;
    assert!(outcome.reply.contains("Reply y"), "{}", outcome.reply);

    let outcome = processor.handle("y").await;
    assert!(outcome.reply.contains("placed"), "{}", outcome.reply);

    let rows = ctx.ledger.find_open(&pair(), Some(&[Purpose::Pm])).unwrap();
    assert_eq!(rows.len(), 1);
    // reliability factor of at least 1.05 on the measured 50 base
    assert!(rows[0].base_amount >= dec!(50) * dec!(1.05));
    assert_eq!(rows[0].price, Some(dec!(1.10)));

    // the crossing order filled on the exchange; a reconcile pass lands it
    let reconciler = Reconciler::new(exchange.clone() as Arc<dyn TradingApi>, ctx.ledger.clone());
    reconciler.refresh(&pair(), None).await.unwrap();
    let row = ctx.ledger.find_by_id(rows[0].id).unwrap().unwrap();
    assert!(row.executed);
    assert_eq!(row.base_filled, row.base_amount);

    // a repeated y does not place a second pm order
    let outcome = processor.handle("y").await;
    assert_eq!(outcome.reply, "Nothing to confirm");
    let stats = ctx
        .ledger
        .stats_by_purpose(&pair(), &[Purpose::Pm], StatsWindow::All)
        .unwrap();
    assert_eq!(stats[0].placed, 1);
}

// =============================================================================
// Property: no orphan ledger rows
// =============================================================================

#[tokio::test]
async fn test_every_open_row_is_live_or_closed_within_two_passes() {
    let (exchange, ctx) = build_agent(TradeParams::default()).await;

    let live =
        place_tracked_order(&exchange, &ctx, Purpose::Ob, Side::Sell, dec!(101), dec!(1)).await;
    let filled =
        place_tracked_order(&exchange, &ctx, Purpose::Ob, Side::Sell, dec!(102), dec!(1)).await;
    let vanished =
        place_tracked_order(&exchange, &ctx, Purpose::Liq, Side::Buy, dec!(99), dec!(1)).await;

    exchange.force_fill(filled.exchange_id.as_deref().unwrap());
    exchange.forget_order(vanished.exchange_id.as_deref().unwrap());

    let reconciler = Reconciler::new(exchange.clone() as Arc<dyn TradingApi>, ctx.ledger.clone());
    reconciler.refresh(&pair(), None).await.unwrap();
    reconciler.refresh(&pair(), None).await.unwrap();

    let exchange_ids: Vec<String> = exchange
        .open_orders(&pair())
        .await
        .unwrap()
        .into_iter()
        .map(|o| o.id)
        .collect();
    for row in ctx.ledger.find_open(&pair(), None).unwrap() {
        assert!(
            exchange_ids.contains(row.exchange_id.as_ref().unwrap()),
            "ledger row #{} is open but not live on the exchange",
            row.id
        );
    }

    assert!(!ctx.ledger.find_by_id(live.id).unwrap().unwrap().closed);
    assert!(ctx.ledger.find_by_id(filled.id).unwrap().unwrap().executed);
    let vanished_row = ctx.ledger.find_by_id(vanished.id).unwrap().unwrap();
    assert!(vanished_row.closed);
    assert_eq!(vanished_row.close_reason, Some(CloseReason::ExternalCancel));
}

// =============================================================================
// Property: fill conservation
// =============================================================================

#[tokio::test]
async fn test_partial_fills_conserve_amounts() {
    let (exchange, ctx) = build_agent(TradeParams::default()).await;
    let order =
        place_tracked_order(&exchange, &ctx, Purpose::Liq, Side::Sell, dec!(103), dec!(4)).await;

    let reconciler = Reconciler::new(exchange.clone() as Arc<dyn TradingApi>, ctx.ledger.clone());
    for chunk in [dec!(0.5), dec!(1.25), dec!(0.75)] {
        exchange.force_partial_fill(order.exchange_id.as_deref().unwrap(), chunk);
        reconciler.refresh(&pair(), None).await.unwrap();

        let row = ctx.ledger.find_by_id(order.id).unwrap().unwrap();
        assert_eq!(row.base_filled + row.base_remaining(), row.base_amount);
    }

    let row = ctx.ledger.find_by_id(order.id).unwrap().unwrap();
    assert_eq!(row.base_filled, dec!(2.5));
    assert!(!row.closed);
}

// =============================================================================
// Property: re-entrancy guards exclude overlapping iterations
// =============================================================================

#[tokio::test]
async fn test_component_guard_blocks_second_iteration() {
    let (_exchange, ctx) = build_agent(ob_params(5)).await;

    let token = ctx.ob_guard.try_enter().expect("first entry");
    assert!(ctx.ob_guard.try_enter().is_none());
    drop(token);
    assert!(ctx.ob_guard.try_enter().is_some());
}

// =============================================================================
// Durability: the ledger survives a restart
// =============================================================================

#[tokio::test]
async fn test_ledger_rows_survive_reopen() {
    let path = std::env::temp_dir().join(format!(
        "market-shaper-it-{}-{}.db",
        std::process::id(),
        chrono::Utc::now().timestamp_nanos_opt().unwrap_or_default()
    ));

    {
        let ledger = Ledger::open(&path).unwrap();
        let mut order = Order::new_limit(
            pair(),
            Side::Buy,
            Purpose::Man,
            "restart-1".to_string(),
            dec!(99.5),
            dec!(2),
            None,
        );
        ledger.insert(&mut order).unwrap();
    }

    let reopened = Ledger::open(&path).unwrap();
    let row = reopened.find_by_exchange_id("restart-1").unwrap().unwrap();
    assert_eq!(row.price, Some(dec!(99.5)));
    assert_eq!(row.base_amount, dec!(2));
    assert!(!row.closed);

    drop(reopened);
    let _ = std::fs::remove_file(&path);
}
