//! Price maker
//!
//! Ad-hoc corrective orders that move the last price toward a target. The
//! needed amount is the opposite side's cumulative depth up to the target,
//! padded by a reliability factor so races with other participants do not
//! leave the move half-done.

use super::{has_funds_for, MakerContext, PlaceOutcome, PwVerdict};
use crate::exchange::{PlaceRequest, Rates};
use crate::orders::Purpose;
use crate::types::Side;
use anyhow::Result;
use rand::Rng;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::sync::Arc;
use tracing::info;

/// Structured outcome of a price-make attempt
#[derive(Debug, Clone)]
pub struct PriceMakeReport {
    pub placed: bool,
    pub side: Side,
    pub target_price: Decimal,
    pub amount: Decimal,
    pub order_id: Option<i64>,
    pub rates_before: Option<Rates>,
    pub rates_after: Option<Rates>,
    pub message: String,
}

impl PriceMakeReport {
    fn not_placed(side: Side, target_price: Decimal, message: String) -> Self {
        PriceMakeReport {
            placed: false,
            side,
            target_price,
            amount: Decimal::ZERO,
            order_id: None,
            rates_before: None,
            rates_after: None,
            message,
        }
    }
}

/// Multiplier on measured depth, sampled per attempt
fn reliability_factor() -> Decimal {
    let factor = 1.05 + rand::thread_rng().gen::<f64>() * 0.05;
    Decimal::from_f64_retain(factor).unwrap_or(dec!(1.05))
}

/// Places a single pm-order sized to push the market to `target`
pub async fn make_price(ctx: &Arc<MakerContext>, target: Decimal) -> Result<PriceMakeReport> {
    let params = ctx.snapshot_params().await;

    ctx.invalidate_book(&ctx.pair).await;
    let book = ctx.order_book(&ctx.pair).await?;
    let (Some(best_bid), Some(best_ask)) = (book.best_bid(), book.best_ask()) else {
        return Ok(PriceMakeReport::not_placed(
            Side::Buy,
            target,
            "order book is empty".to_string(),
        ));
    };

    let mid = (best_bid + best_ask) / dec!(2);
    let (side, depth) = if target > best_ask {
        (Side::Buy, book.depth_to(Side::Sell, target))
    } else if target < best_bid {
        (Side::Sell, book.depth_to(Side::Buy, target))
    } else if target >= mid {
        (Side::Buy, Decimal::ZERO)
    } else {
        (Side::Sell, Decimal::ZERO)
    };

    // Reliability padding applies to the measured depth, before any
    // price-watcher clamp of the target itself
    let mut amount = (depth * reliability_factor()).round_dp(ctx.market.base_decimals);
    if amount < ctx.market.min_amount {
        amount = ctx.market.min_amount;
    }

    let target = match ctx.pw_verdict(&params) {
        PwVerdict::Blocked => {
            return Ok(PriceMakeReport::not_placed(
                side,
                target,
                "price watcher range unavailable".to_string(),
            ));
        }
        PwVerdict::Range { low, high } => target.clamp(low, high),
        PwVerdict::Disabled => target,
    };

    if !has_funds_for(ctx, side, target, amount).await? {
        return Ok(PriceMakeReport::not_placed(
            side,
            target,
            format!(
                "not enough {} to move the price to {}",
                match side {
                    Side::Buy => &ctx.pair.quote,
                    Side::Sell => &ctx.pair.base,
                },
                target
            ),
        ));
    }

    let rates_before = ctx.api.rates(&ctx.pair).await.ok();
    let req = PlaceRequest::limit(ctx.pair.clone(), side, target, amount);
    let outcome = ctx.place_tracked(req, Purpose::Pm, None).await?;
    let order_id = match outcome {
        PlaceOutcome::Placed(order) => {
            info!(
                "pm order #{}: {} {} @ {} to reach target",
                order.id, side, amount, target
            );
            Some(order.id)
        }
        PlaceOutcome::Rejected(reason) | PlaceOutcome::Transient(reason) => {
            return Ok(PriceMakeReport::not_placed(side, target, reason));
        }
    };
    let rates_after = ctx.api.rates(&ctx.pair).await.ok();

    let message = format!("{} {} @ {} placed to move the price", side, amount, target);
    Ok(PriceMakeReport {
        placed: true,
        side,
        target_price: target,
        amount,
        order_id,
        rates_before,
        rates_after,
        message,
    })
}
