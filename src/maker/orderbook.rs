//! Order-book builder
//!
//! Places short-lived ob-orders inside the visible book to create depth.
//! Each iteration reconciles, collects expired and out-of-band orders, then
//! tops the pool back up to the configured count with randomized side,
//! position, price, amount and lifetime.

use super::{has_funds_for, MakerContext, PlaceOutcome, PwVerdict};
use crate::exchange::{OrderBook, PlaceRequest};
use crate::notify::NotifyType;
use crate::orders::collector::{Collector, OrderSelector};
use crate::orders::reconciler::Reconciler;
use crate::orders::{CloseReason, Purpose};
use crate::types::{round_to_tick, Side};
use anyhow::Result;
use chrono::{Duration as ChronoDuration, Utc};
use rand::Rng;
use rust_decimal::prelude::*;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Hard cap on placements per iteration
const MAX_PLACEMENTS_PER_TICK: u64 = 5;

/// Soft padding applied when a band edge lies outside the visible window
const BAND_EDGE_PADDING: Decimal = dec!(0.05);

#[derive(Debug, Default, Clone, Copy)]
pub struct ObTickReport {
    pub expired_cancelled: u64,
    pub out_of_band_cancelled: u64,
    pub placed: u64,
    pub skipped: u64,
}

pub struct OrderBookBuilder {
    ctx: Arc<MakerContext>,
}

impl OrderBookBuilder {
    pub fn new(ctx: Arc<MakerContext>) -> Self {
        OrderBookBuilder { ctx }
    }

    pub async fn tick(&self) -> Result<ObTickReport> {
        let ctx = &self.ctx;
        let params = ctx.snapshot_params().await;
        let mut report = ObTickReport::default();

        // Reconcile before deciding: the placement decision below must see
        // fills and external cancellations from this very tick
        let reconciler = Reconciler::new(ctx.api.clone(), ctx.ledger.clone());
        reconciler.refresh(&ctx.pair, Some(&[Purpose::Ob])).await?;

        let collector = Collector::new(ctx.api.clone(), ctx.ledger.clone());
        let expired = collector
            .collect(
                &OrderSelector {
                    expired_by: Some(Utc::now()),
                    ..OrderSelector::purposes(ctx.pair.clone(), vec![Purpose::Ob])
                },
                CloseReason::Expired,
            )
            .await?;
        report.expired_cancelled = expired.cancelled + expired.already_closed;

        let verdict = ctx.pw_verdict(&params);
        if let PwVerdict::Range { low, high } = verdict {
            let out_of_band = collector
                .collect(
                    &OrderSelector {
                        outside_band: Some((low, high)),
                        ..OrderSelector::purposes(ctx.pair.clone(), vec![Purpose::Ob])
                    },
                    CloseReason::OutOfPwRange,
                )
                .await?;
            report.out_of_band_cancelled = out_of_band.cancelled + out_of_band.already_closed;
        }

        if report.expired_cancelled + report.out_of_band_cancelled > 0 {
            ctx.invalidate_balances().await;
        }

        if verdict == PwVerdict::Blocked {
            debug!("ob builder: price watcher range unavailable, no placements");
            return Ok(report);
        }

        let open = ctx.ledger.count_open(&ctx.pair, Purpose::Ob)?;
        let target = params.ob_orders_count as u64;
        let to_place = target.saturating_sub(open).min(MAX_PLACEMENTS_PER_TICK);
        if to_place == 0 {
            return Ok(report);
        }

        let book = ctx.order_book(&ctx.pair).await?;
        let order_limit = ctx.features().order_number_limit;

        for _ in 0..to_place {
            let Some(plan) = plan_ob_order(&params, &book, &verdict, &ctx.market, order_limit)
            else {
                report.skipped += 1;
                continue;
            };

            if !has_funds_for(ctx, plan.side, plan.price, plan.amount).await? {
                report.skipped += 1;
                ctx.notifier.notify_throttled(
                    "ob-insufficient-balance",
                    NotifyType::Warning,
                    &format!(
                        "Not enough {} to keep building the {} book",
                        match plan.side {
                            Side::Buy => &ctx.pair.quote,
                            Side::Sell => &ctx.pair.base,
                        },
                        ctx.pair
                    ),
                );
                continue;
            }

            let expires_at = Utc::now() + ChronoDuration::milliseconds(plan.lifetime_ms);
            let req = PlaceRequest::limit(ctx.pair.clone(), plan.side, plan.price, plan.amount);
            match ctx.place_tracked(req, Purpose::Ob, Some(expires_at)).await? {
                PlaceOutcome::Placed(order) => {
                    report.placed += 1;
                    info!(
                        "ob order #{} {} {} @ {} for {} ms",
                        order.id, plan.side, plan.amount, plan.price, plan.lifetime_ms
                    );
                }
                PlaceOutcome::Rejected(reason) => {
                    warn!("ob placement rejected: {}", reason);
                    report.skipped += 1;
                }
                PlaceOutcome::Transient(reason) => {
                    // Abandon the rest of this tick; nothing was recorded
                    debug!("ob placement hit transient error, abandoning tick: {}", reason);
                    report.skipped += 1;
                    break;
                }
            }
        }

        Ok(report)
    }
}

#[derive(Debug, Clone, Copy)]
struct ObPlan {
    side: Side,
    price: Decimal,
    amount: Decimal,
    lifetime_ms: i64,
}

/// Samples one ob-order: side, book position, gap price, band correction,
/// amount and lifetime. Returns None when the book side is too shallow or
/// the band cannot be honored.
fn plan_ob_order(
    params: &crate::params::TradeParams,
    book: &OrderBook,
    verdict: &PwVerdict,
    market: &crate::exchange::MarketDescriptor,
    order_number_limit: Option<u32>,
) -> Option<ObPlan> {
    let mut rng = rand::thread_rng();

    let side = if rng.gen_bool(params.buy_probability()) {
        Side::Buy
    } else {
        Side::Sell
    };

    let levels = book.levels(side);
    let deepest = levels.len().min(params.ob_height as usize);
    if deepest < 2 {
        return None;
    }
    let position = rng.gen_range(2..=deepest);

    let mut price = price_in_gap(book, side, position, market.price_tick, &mut rng)?;

    if let PwVerdict::Range { low, high } = verdict {
        if price < *low || price > *high {
            let visible_min = levels[..deepest].iter().map(|l| l.price).min()?;
            let visible_max = levels[..deepest].iter().map(|l| l.price).max()?;
            price = correct_into_band(
                price,
                *low,
                *high,
                visible_min,
                visible_max,
                market.price_tick,
            )?;
        }
    }

    let amount = sample_amount(
        &mut rng,
        params.min_amount,
        params.max_amount * params.ob_max_order_percent / dec!(100),
        market,
    )?;

    let lifetime_ms = sample_lifetime(&mut rng, params.ob_orders_count, position, order_number_limit);

    Some(ObPlan {
        side,
        price,
        amount,
        lifetime_ms,
    })
}

/// Uniform price in the gap between the orders at `position - 1` and
/// `position` (1-indexed from the top of the side), exclusive by one tick.
/// Falls back to the adjacent level's price when the gap has no room.
fn price_in_gap(
    book: &OrderBook,
    side: Side,
    position: usize,
    tick: Decimal,
    rng: &mut impl Rng,
) -> Option<Decimal> {
    let levels = book.levels(side);
    if position < 2 || levels.len() < position || tick <= Decimal::ZERO {
        return None;
    }
    let own = levels[position - 1].price;
    let neighbor = levels[position - 2].price;
    let (lower, upper) = match side {
        Side::Buy => (own, neighbor),
        Side::Sell => (neighbor, own),
    };

    let slots = ((upper - lower) / tick).floor().to_i64().unwrap_or(0) - 1;
    if slots < 1 {
        return Some(own);
    }
    let offset = rng.gen_range(1..=slots);
    Some(lower + tick * Decimal::from(offset))
}

/// Pulls an out-of-band price to the nearest allowed edge, padding by 5%
/// when the band edge lies outside the visible window
fn correct_into_band(
    price: Decimal,
    low: Decimal,
    high: Decimal,
    visible_min: Decimal,
    visible_max: Decimal,
    tick: Decimal,
) -> Option<Decimal> {
    let corrected = if price < low {
        let edge = if low < visible_min {
            visible_min * (Decimal::ONE - BAND_EDGE_PADDING)
        } else {
            low
        };
        ceil_to_tick(edge.max(low), tick)
    } else {
        let edge = if high > visible_max {
            visible_max * (Decimal::ONE + BAND_EDGE_PADDING)
        } else {
            high
        };
        round_to_tick(edge.min(high), tick)
    };

    (corrected >= low && corrected <= high).then_some(corrected)
}

fn ceil_to_tick(price: Decimal, tick: Decimal) -> Decimal {
    if tick.is_zero() {
        return price;
    }
    (price / tick).ceil() * tick
}

/// Uniform amount between the minimum and the per-order cap. A collapsed
/// range widens to 1.1x the minimum.
fn sample_amount(
    rng: &mut impl Rng,
    min: Decimal,
    cap: Decimal,
    market: &crate::exchange::MarketDescriptor,
) -> Option<Decimal> {
    let min = min.max(market.min_amount);
    let cap = if cap <= min { min * dec!(1.1) } else { cap };
    let fraction = Decimal::from_f64_retain(rng.gen::<f64>())?;
    let amount = (min + (cap - min) * fraction).round_dp(market.base_decimals);
    Some(amount.max(min))
}

/// Lifetime in milliseconds: U(1500, count * 500) stretched by the cube
/// root of the position, so orders near the spread expire sooner. A tight
/// exchange order-number limit shortens lifetimes proportionally.
fn sample_lifetime(
    rng: &mut impl Rng,
    ob_orders_count: u32,
    position: usize,
    order_number_limit: Option<u32>,
) -> i64 {
    let upper = (ob_orders_count as f64 * 500.0).max(1600.0);
    let base = rng.gen_range(1500.0..upper);
    let mut lifetime = base * (position as f64).cbrt();
    if let Some(limit) = order_number_limit {
        let scale = limit as f64 / (3.0 * ob_orders_count as f64);
        if scale < 1.0 {
            lifetime *= scale;
        }
    }
    lifetime as i64
}
