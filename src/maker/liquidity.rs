//! Liquidity provider
//!
//! Maintains two standing pools around the trend anchor: asks totaling a
//! configured base budget and bids totaling a configured quote budget,
//! spread inside `liq_spread_percent`. Each tick reconciles, drops orders
//! that drifted out of the current spread, and places new ones to close the
//! gap between target and live amounts.

use super::{has_funds_for, MakerContext, PlaceOutcome, PwVerdict};
use crate::exchange::PlaceRequest;
use crate::notify::NotifyType;
use crate::orders::collector::{Collector, OrderSelector};
use crate::orders::reconciler::Reconciler;
use crate::orders::{CloseReason, Purpose};
use crate::params::{LiqTrend, TradeParams};
use crate::types::{round_to_tick, Side};
use anyhow::Result;
use rand::Rng;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Upper bound on how many orders one refill splits a side's delta into
const MAX_ORDERS_PER_SIDE: u32 = 5;

#[derive(Debug, Default, Clone, Copy)]
pub struct LiqTickReport {
    pub cancelled: u64,
    pub placed: u64,
    pub skipped: u64,
    /// Standing ask base after the tick
    pub ask_base_total: Decimal,
    /// Standing bid quote after the tick
    pub bid_quote_total: Decimal,
}

/// Price interval one side's pool lives in
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpreadBand {
    pub low: Decimal,
    pub high: Decimal,
}

pub struct LiquidityProvider {
    ctx: Arc<MakerContext>,
}

impl LiquidityProvider {
    pub fn new(ctx: Arc<MakerContext>) -> Self {
        LiquidityProvider { ctx }
    }

    pub async fn tick(&self) -> Result<LiqTickReport> {
        let ctx = &self.ctx;
        let params = ctx.snapshot_params().await;
        let mut report = LiqTickReport::default();

        let reconciler = Reconciler::new(ctx.api.clone(), ctx.ledger.clone());
        reconciler.refresh(&ctx.pair, Some(&[Purpose::Liq])).await?;

        let book = ctx.order_book(&ctx.pair).await?;
        let (Some(best_bid), Some(best_ask)) = (book.best_bid(), book.best_ask()) else {
            debug!("liq provider: empty book, nothing to anchor on");
            return Ok(report);
        };
        let mid = (best_bid + best_ask) / dec!(2);
        let (bid_band, ask_band) = spread_bands(mid, &params);

        let collector = Collector::new(ctx.api.clone(), ctx.ledger.clone());
        if ctx.reset_liq.swap(false, Ordering::SeqCst) {
            info!("liq provider: reset requested, reseeding both pools");
            let result = collector
                .collect(
                    &OrderSelector::purposes(ctx.pair.clone(), vec![Purpose::Liq]),
                    CloseReason::UserCommand,
                )
                .await?;
            report.cancelled += result.cancelled + result.already_closed;
        } else {
            // Quotes that drifted out of the current spread are stale
            for (side, band) in [(Side::Buy, bid_band), (Side::Sell, ask_band)] {
                let result = collector
                    .collect(
                        &OrderSelector {
                            side: Some(side),
                            outside_band: Some((band.low, band.high)),
                            ..OrderSelector::purposes(ctx.pair.clone(), vec![Purpose::Liq])
                        },
                        CloseReason::Expired,
                    )
                    .await?;
                report.cancelled += result.cancelled + result.already_closed;
            }
        }

        if report.cancelled > 0 {
            ctx.invalidate_balances().await;
        }

        // Placement bands may be narrowed further by the price watcher
        let verdict = ctx.pw_verdict(&params);
        if verdict == PwVerdict::Blocked {
            debug!("liq provider: price watcher range unavailable, no placements");
            return Ok(report);
        }
        let (bid_band, ask_band) = match verdict {
            PwVerdict::Range { low, high } => (
                intersect(bid_band, low, high),
                intersect(ask_band, low, high),
            ),
            _ => (Some(bid_band), Some(ask_band)),
        };

        let open = ctx.ledger.find_open(&ctx.pair, Some(&[Purpose::Liq]))?;
        let mut ask_total: Decimal = open
            .iter()
            .filter(|o| o.side == Side::Sell)
            .map(|o| o.base_remaining())
            .sum();
        let mut bid_quote_total: Decimal = open
            .iter()
            .filter(|o| o.side == Side::Buy)
            .filter_map(|o| o.price.map(|p| p * o.base_remaining()))
            .sum();

        if let Some(band) = ask_band {
            let placed = self
                .fill_side(Side::Sell, band, params.liq_sell_amount - ask_total, &mut report)
                .await?;
            ask_total += placed;
        }
        if let Some(band) = bid_band {
            let placed_quote = self
                .fill_side(
                    Side::Buy,
                    band,
                    params.liq_buy_quote_amount - bid_quote_total,
                    &mut report,
                )
                .await?;
            bid_quote_total += placed_quote;
        }

        report.ask_base_total = ask_total;
        report.bid_quote_total = bid_quote_total;
        Ok(report)
    }

    /// Places orders on `side` to cover `budget_delta`, split across a few
    /// randomly sized chunks. The delta is in base for asks and in quote
    /// for bids; the covered amount is returned in the same unit.
    async fn fill_side(
        &self,
        side: Side,
        band: SpreadBand,
        budget_delta: Decimal,
        report: &mut LiqTickReport,
    ) -> Result<Decimal> {
        let ctx = &self.ctx;
        // the smallest delta still worth an order, in the side's unit
        let min_step = match side {
            Side::Sell => ctx.market.min_amount,
            Side::Buy => band.low * ctx.market.min_amount,
        };
        if budget_delta < min_step {
            return Ok(Decimal::ZERO);
        }

        let slots = {
            let mut rng = rand::thread_rng();
            rng.gen_range(2..=MAX_ORDERS_PER_SIDE)
        };
        let mut remaining = budget_delta;
        let mut covered = Decimal::ZERO;

        for slot in 0..slots {
            if remaining < min_step {
                break;
            }
            let (price, step) = {
                let mut rng = rand::thread_rng();
                let fraction = Decimal::from_f64_retain(rng.gen::<f64>()).unwrap_or(dec!(0.5));
                let price = round_to_tick(
                    band.low + (band.high - band.low) * fraction,
                    ctx.market.price_tick,
                )
                .max(band.low);
                let slots_left = slots - slot;
                let step = if slots_left == 1 {
                    remaining
                } else {
                    let jitter =
                        Decimal::from_f64_retain(0.75 + rng.gen::<f64>() * 0.5).unwrap_or(Decimal::ONE);
                    (remaining / Decimal::from(slots_left) * jitter).min(remaining)
                };
                (price, step)
            };
            if price.is_zero() {
                break;
            }

            let base_amount = match side {
                Side::Sell => step,
                Side::Buy => step / price,
            }
            .round_dp(ctx.market.base_decimals)
            .max(ctx.market.min_amount);

            if !has_funds_for(ctx, side, price, base_amount).await? {
                report.skipped += 1;
                ctx.notifier.notify_throttled(
                    "liq-insufficient-balance",
                    NotifyType::Warning,
                    &format!("Not enough funds to maintain {} liquidity on {}", side, ctx.pair),
                );
                break;
            }

            let req = PlaceRequest::limit(ctx.pair.clone(), side, price, base_amount);
            match ctx.place_tracked(req, Purpose::Liq, None).await? {
                PlaceOutcome::Placed(order) => {
                    report.placed += 1;
                    let placed = match side {
                        Side::Sell => base_amount,
                        Side::Buy => price * base_amount,
                    };
                    remaining -= placed;
                    covered += placed;
                    debug!(
                        "liq order #{} {} {} @ {}",
                        order.id, side, base_amount, price
                    );
                }
                PlaceOutcome::Rejected(reason) => {
                    warn!("liq placement rejected: {}", reason);
                    report.skipped += 1;
                    break;
                }
                PlaceOutcome::Transient(reason) => {
                    debug!("liq placement hit transient error, abandoning side: {}", reason);
                    report.skipped += 1;
                    break;
                }
            }
        }
        Ok(covered)
    }
}

/// Spread intervals for both pools around the mid anchor, skewed by trend
fn spread_bands(mid: Decimal, params: &TradeParams) -> (SpreadBand, SpreadBand) {
    let spread = params.liq_spread_percent / dec!(100);
    // skew factors: how far each side's interval shifts away from mid
    let (bid_near, bid_far, ask_near, ask_far) = match params.liq_trend {
        LiqTrend::Middle => (dec!(0), dec!(1), dec!(0), dec!(1)),
        LiqTrend::Uptrend => (dec!(0), dec!(0.7), dec!(0.3), dec!(1.3)),
        LiqTrend::Downtrend => (dec!(0.3), dec!(1.3), dec!(0), dec!(0.7)),
    };
    let bid = SpreadBand {
        low: mid * (Decimal::ONE - spread * bid_far),
        high: mid * (Decimal::ONE - spread * bid_near),
    };
    let ask = SpreadBand {
        low: mid * (Decimal::ONE + spread * ask_near),
        high: mid * (Decimal::ONE + spread * ask_far),
    };
    (bid, ask)
}

fn intersect(band: SpreadBand, low: Decimal, high: Decimal) -> Option<SpreadBand> {
    let clipped = SpreadBand {
        low: band.low.max(low),
        high: band.high.min(high),
    };
    (clipped.low <= clipped.high).then_some(clipped)
}
