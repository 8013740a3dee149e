//! Operator command processor
//!
//! Executes the text protocol against the maker context and returns
//! structured outcomes; rendering is kept inside this module so the
//! components themselves never build user-facing strings. Commands with a
//! large estimated notional or a destructive effect park behind a
//! confirmation that `y` redeems within ten minutes.

pub mod parser;

use crate::ledger::StatsWindow;
use crate::maker::{pricemaker, MakerContext, PlaceOutcome};
use crate::notify::NotifyType;
use crate::orders::collector::{Collector, OrderSelector, PurposeSelector};
use crate::orders::{CloseReason, Purpose};
use crate::params::PwSource;
use crate::exchange::PlaceRequest;
use crate::types::{round_to_tick, Pair, Side};
use anyhow::Result;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use parser::{ClearTarget, Command, ParsedCommand, PwSourceArg, Subsystem};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};
use tracing::{info, warn};

/// How long a parked command stays redeemable, in minutes
const CONFIRM_TIMEOUT_MIN: i64 = 10;

/// What the host routes to the reply and notification sinks
#[derive(Debug, Clone)]
pub struct CommandOutcome {
    pub reply: String,
    pub notify: Option<String>,
    pub notify_type: NotifyType,
}

impl CommandOutcome {
    fn reply(text: impl Into<String>) -> Self {
        CommandOutcome {
            reply: text.into(),
            notify: None,
            notify_type: NotifyType::Info,
        }
    }

    fn with_notify(text: impl Into<String>, notify_type: NotifyType) -> Self {
        let text = text.into();
        CommandOutcome {
            notify: Some(text.clone()),
            reply: text,
            notify_type,
        }
    }
}

#[derive(Debug)]
struct Pending {
    parsed: ParsedCommand,
    expires_at: DateTime<Utc>,
}

pub struct CommandProcessor {
    ctx: Arc<MakerContext>,
    amount_to_confirm_usd: Decimal,
    pending: Mutex<Option<Pending>>,
}

impl CommandProcessor {
    pub fn new(ctx: Arc<MakerContext>, amount_to_confirm_usd: Decimal) -> Self {
        CommandProcessor {
            ctx,
            amount_to_confirm_usd,
            pending: Mutex::new(None),
        }
    }

    /// Parses and executes one operator input line
    pub async fn handle(&self, input: &str) -> CommandOutcome {
        let parsed = match parser::parse(input) {
            Ok(parsed) => parsed,
            Err(e) => return CommandOutcome::reply(e.to_string()),
        };
        info!("command: {:?}", parsed.command);

        if matches!(parsed.command, Command::Confirm) {
            let taken = self.pending.lock().unwrap().take();
            return match taken {
                Some(pending) if pending.expires_at >= Utc::now() => {
                    self.execute(pending.parsed).await
                }
                Some(_) => CommandOutcome::reply("Confirmation expired, run the command again"),
                None => CommandOutcome::reply("Nothing to confirm"),
            };
        }

        if !parsed.confirmed {
            if let Some(prompt) = self.confirmation_prompt(&parsed.command).await {
                *self.pending.lock().unwrap() = Some(Pending {
                    parsed,
                    expires_at: Utc::now() + ChronoDuration::minutes(CONFIRM_TIMEOUT_MIN),
                });
                return CommandOutcome::reply(prompt);
            }
        }
        self.execute(parsed).await
    }

    /// Returns the prompt when the command must be confirmed first
    async fn confirmation_prompt(&self, command: &Command) -> Option<String> {
        match command {
            Command::Clear { target, .. }
                if matches!(target, ClearTarget::All | ClearTarget::Unknown) =>
            {
                Some("This cancels orders beyond the agent's own records. Reply y to proceed".to_string())
            }
            Command::MakePrice { price } => Some(format!(
                "This will trade through the book to move the price to {}. Reply y to proceed",
                price
            )),
            Command::Fill { quote, amount, high, .. } => {
                let usd = self
                    .notional_usd(*quote, *amount, Some(*high))
                    .await
                    .unwrap_or(Decimal::MAX);
                (usd >= self.amount_to_confirm_usd).then(|| {
                    format!(
                        "Estimated notional is {:.0} USD. Reply y to proceed",
                        usd.min(dec!(1000000000))
                    )
                })
            }
            Command::Place { quote, amount, price, .. } => {
                let usd = self
                    .notional_usd(*quote, *amount, *price)
                    .await
                    .unwrap_or(Decimal::MAX);
                (usd >= self.amount_to_confirm_usd).then(|| {
                    format!(
                        "Estimated notional is {:.0} USD. Reply y to proceed",
                        usd.min(dec!(1000000000))
                    )
                })
            }
            _ => None,
        }
    }

    /// Rough USD notional of a manual order
    async fn notional_usd(
        &self,
        quote: Option<Decimal>,
        amount: Option<Decimal>,
        price: Option<Decimal>,
    ) -> Result<Decimal> {
        let pair = &self.ctx.pair;
        if let Some(quote_amount) = quote {
            return self.ctx.rates.convert(quote_amount, &pair.quote, "USD").await;
        }
        let amount = amount.unwrap_or_default();
        if let Some(price) = price {
            return self
                .ctx
                .rates
                .convert(amount * price, &pair.quote, "USD")
                .await;
        }
        self.ctx.rates.convert(amount, &pair.base, "USD").await
    }

    async fn execute(&self, parsed: ParsedCommand) -> CommandOutcome {
        let result = match parsed.command {
            Command::Start { policy } => self.start(policy).await,
            Command::Stop => self.stop().await,
            Command::EnableOb {
                count,
                max_order_percent,
            } => self.enable_ob(count, max_order_percent).await,
            Command::EnableLiq {
                spread_percent,
                amount1,
                coin1,
                amount2,
                coin2,
                trend,
            } => {
                self.enable_liq(spread_percent, amount1, coin1, amount2, coin2, trend)
                    .await
            }
            Command::EnablePw {
                source,
                policy,
                action,
            } => self.enable_pw(source, policy, action).await,
            Command::Disable(subsystem) => self.disable(subsystem).await,
            Command::Amount { min, max } => self.set_amount(min, max).await,
            Command::Interval { min_ms, max_ms } => self.set_interval(min_ms, max_ms).await,
            Command::BuyPercent(value) => self.set_buy_percent(value).await,
            Command::Clear {
                pair,
                target,
                side,
                price_filter,
                force,
            } => self.clear(pair, target, side, price_filter, force).await,
            Command::Fill {
                pair,
                side,
                quote,
                amount,
                low,
                high,
                count,
            } => self.fill(pair, side, quote, amount, low, high, count).await,
            Command::Place {
                side,
                pair,
                amount,
                quote,
                price,
                market,
            } => self.place(side, pair, amount, quote, price, market).await,
            Command::MakePrice { price } => self.make_price(price).await,
            Command::Confirm => Ok(CommandOutcome::reply("Nothing to confirm")),
            Command::Rates => self.rates().await,
            Command::Stats { window } => self.stats(window).await,
            Command::Orders { purpose } => self.orders(purpose).await,
            Command::Balances => self.balances().await,
            Command::Params => self.params().await,
            Command::Info => self.info().await,
            Command::PairInfo => self.pair_info().await,
            Command::Calc { amount, from, to } => self.calc(amount, from, to).await,
            Command::Deposit { coin } => self.deposit(coin),
            Command::Account => self.account().await,
            Command::Version => Ok(CommandOutcome::reply(format!(
                "market-shaper {}",
                env!("CARGO_PKG_VERSION")
            ))),
            Command::Help => Ok(CommandOutcome::reply(HELP_TEXT)),
        };

        match result {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!("command failed: {:#}", e);
                CommandOutcome::with_notify(format!("Command failed: {}", e), NotifyType::Error)
            }
        }
    }

    async fn start(&self, policy: Option<crate::params::Policy>) -> Result<CommandOutcome> {
        let params = self
            .ctx
            .mutate_params(|p| {
                p.is_active = true;
                if let Some(policy) = policy {
                    p.policy = policy;
                }
            })
            .await?;
        Ok(CommandOutcome::with_notify(
            format!("Market making started with policy '{}'", params.policy.as_str()),
            NotifyType::Info,
        ))
    }

    async fn stop(&self) -> Result<CommandOutcome> {
        self.ctx.mutate_params(|p| p.is_active = false).await?;
        Ok(CommandOutcome::with_notify(
            "Market making stopped. Live orders stay on the exchange",
            NotifyType::Info,
        ))
    }

    async fn enable_ob(
        &self,
        count: Option<u32>,
        max_order_percent: Option<Decimal>,
    ) -> Result<CommandOutcome> {
        let params = self
            .ctx
            .mutate_params(|p| {
                p.is_ob_active = true;
                if let Some(count) = count {
                    p.ob_orders_count = count;
                }
                if let Some(pct) = max_order_percent {
                    p.ob_max_order_percent = pct;
                }
            })
            .await?;
        Ok(CommandOutcome::reply(format!(
            "Order-book builder enabled: up to {} orders, {}% of max amount each",
            params.ob_orders_count, params.ob_max_order_percent
        )))
    }

    async fn enable_liq(
        &self,
        spread_percent: Decimal,
        amount1: Decimal,
        coin1: String,
        amount2: Decimal,
        coin2: String,
        trend: Option<crate::params::LiqTrend>,
    ) -> Result<CommandOutcome> {
        let pair = self.ctx.pair.clone();
        let (sell_amount, buy_quote_amount) = if coin1 == pair.base && coin2 == pair.quote {
            (amount1, amount2)
        } else if coin1 == pair.quote && coin2 == pair.base {
            (amount2, amount1)
        } else {
            return Ok(CommandOutcome::reply(format!(
                "Liquidity amounts must be in {} and {}",
                pair.base, pair.quote
            )));
        };

        let params = self
            .ctx
            .mutate_params(|p| {
                p.is_liq_active = true;
                p.liq_spread_percent = spread_percent;
                p.liq_sell_amount = sell_amount;
                p.liq_buy_quote_amount = buy_quote_amount;
                if let Some(trend) = trend {
                    p.liq_trend = trend;
                }
            })
            .await?;
        self.ctx.reset_liq.store(true, Ordering::SeqCst);
        Ok(CommandOutcome::reply(format!(
            "Liquidity enabled: {} {} asks + {} {} bids within {}%, trend {}",
            sell_amount,
            pair.base,
            buy_quote_amount,
            pair.quote,
            params.liq_spread_percent,
            params.liq_trend.as_str()
        )))
    }

    async fn enable_pw(
        &self,
        source: PwSourceArg,
        policy: Option<crate::params::PwPolicy>,
        action: Option<crate::params::PwAction>,
    ) -> Result<CommandOutcome> {
        let quote = self.ctx.pair.quote.clone();
        let pw_source = match source {
            PwSourceArg::Numeric {
                low,
                high,
                currency,
            } => PwSource::Numeric {
                low,
                high,
                currency: currency.unwrap_or(quote),
            },
            PwSourceArg::Market {
                pair,
                exchange,
                deviation_percent,
            } => PwSource::Market {
                pair,
                exchange,
                deviation_percent,
            },
        };
        let description = match &pw_source {
            PwSource::Numeric { low, high, currency } => {
                format!("{}-{} {}", low, high, currency)
            }
            PwSource::Market {
                pair,
                exchange,
                deviation_percent,
            } => format!("{}@{} +-{}%", pair, exchange, deviation_percent),
        };
        self.ctx
            .mutate_params(|p| {
                p.is_pw_active = true;
                p.pw_source = Some(pw_source);
                if let Some(policy) = policy {
                    p.pw_policy = policy;
                }
                if let Some(action) = action {
                    p.pw_action = action;
                }
            })
            .await?;
        Ok(CommandOutcome::reply(format!(
            "Price watcher enabled on {}",
            description
        )))
    }

    async fn disable(&self, subsystem: Subsystem) -> Result<CommandOutcome> {
        let name = match subsystem {
            Subsystem::Ob => "order-book builder",
            Subsystem::Liq => "liquidity provider",
            Subsystem::Pw => "price watcher",
        };
        self.ctx
            .mutate_params(|p| match subsystem {
                Subsystem::Ob => p.is_ob_active = false,
                Subsystem::Liq => p.is_liq_active = false,
                Subsystem::Pw => p.is_pw_active = false,
            })
            .await?;
        Ok(CommandOutcome::reply(format!("{} disabled", name)))
    }

    async fn set_amount(&self, min: Decimal, max: Decimal) -> Result<CommandOutcome> {
        self.ctx
            .mutate_params(|p| {
                p.min_amount = min;
                p.max_amount = max;
            })
            .await?;
        Ok(CommandOutcome::reply(format!(
            "Order amounts set to {}-{} {}",
            min, max, self.ctx.pair.base
        )))
    }

    async fn set_interval(&self, min_ms: u64, max_ms: u64) -> Result<CommandOutcome> {
        self.ctx
            .mutate_params(|p| {
                p.min_interval_ms = min_ms;
                p.max_interval_ms = max_ms;
            })
            .await?;
        Ok(CommandOutcome::reply(format!(
            "Tick interval set to {}-{} ms",
            min_ms, max_ms
        )))
    }

    async fn set_buy_percent(&self, value: Decimal) -> Result<CommandOutcome> {
        self.ctx.mutate_params(|p| p.buy_percent = value).await?;
        Ok(CommandOutcome::reply(format!("Buy bias set to {}%", value)))
    }

    async fn clear(
        &self,
        pair: Option<Pair>,
        target: ClearTarget,
        side: Option<Side>,
        price_filter: Option<crate::orders::collector::PriceFilter>,
        force: bool,
    ) -> Result<CommandOutcome> {
        let purposes = match target {
            ClearTarget::All => PurposeSelector::All,
            ClearTarget::Unknown => PurposeSelector::Unknown,
            ClearTarget::Purposes(purposes) => PurposeSelector::List(purposes),
        };
        let selector = OrderSelector {
            purposes,
            pair: pair.unwrap_or_else(|| self.ctx.pair.clone()),
            side,
            price_filter,
            expired_by: None,
            outside_band: None,
            force,
        };
        let collector = Collector::new(self.ctx.api.clone(), self.ctx.ledger.clone());
        let result = collector.collect(&selector, CloseReason::UserCommand).await?;
        self.ctx.invalidate_balances().await;
        Ok(CommandOutcome::reply(format!("Clear done: {}", result.log_message)))
    }

    async fn fill(
        &self,
        pair: Option<Pair>,
        side: Side,
        quote: Option<Decimal>,
        amount: Option<Decimal>,
        low: Decimal,
        high: Decimal,
        count: u32,
    ) -> Result<CommandOutcome> {
        let pair = pair.unwrap_or_else(|| self.ctx.pair.clone());

        // the whole budget must be available before the first order
        match (side, quote, amount) {
            (Side::Buy, Some(quote_total), _) => {
                if self.ctx.free_balance(&pair.quote).await? < quote_total {
                    return Ok(CommandOutcome::with_notify(
                        format!("Not enough {} to fill {}", pair.quote, quote_total),
                        NotifyType::Warning,
                    ));
                }
            }
            (Side::Buy, None, Some(base_total)) => {
                if self.ctx.free_balance(&pair.quote).await? < base_total * high {
                    return Ok(CommandOutcome::with_notify(
                        format!("Not enough {} to fill {} {}", pair.quote, base_total, pair.base),
                        NotifyType::Warning,
                    ));
                }
            }
            (Side::Sell, quote_total, base_total) => {
                let needed = match (quote_total, base_total) {
                    (_, Some(base_total)) => base_total,
                    (Some(quote_total), None) if !low.is_zero() => quote_total / low,
                    _ => Decimal::ZERO,
                };
                if self.ctx.free_balance(&pair.base).await? < needed {
                    return Ok(CommandOutcome::with_notify(
                        format!("Not enough {} to fill {}", pair.base, needed),
                        NotifyType::Warning,
                    ));
                }
            }
            (Side::Buy, None, None) => unreachable!("parser guarantees quote or amount is set"),
        }

        let tick = self.ctx.market.price_tick;
        let count_dec = Decimal::from(count);
        let mut placed = 0u64;
        let mut rejected = 0u64;
        for index in 0..count {
            let price = if count == 1 {
                (low + high) / dec!(2)
            } else {
                low + (high - low) * Decimal::from(index) / Decimal::from(count - 1)
            };
            let price = round_to_tick(price, tick);
            let base_amount = match (quote, amount) {
                (Some(quote_total), _) if !price.is_zero() => {
                    (quote_total / count_dec / price).round_dp(self.ctx.market.base_decimals)
                }
                (_, Some(base_total)) => {
                    (base_total / count_dec).round_dp(self.ctx.market.base_decimals)
                }
                _ => Decimal::ZERO,
            };
            if base_amount <= Decimal::ZERO {
                rejected += 1;
                continue;
            }

            let req = PlaceRequest::limit(pair.clone(), side, price, base_amount);
            match self.ctx.place_tracked(req, Purpose::Man, None).await? {
                PlaceOutcome::Placed(_) => placed += 1,
                PlaceOutcome::Rejected(reason) => {
                    warn!("fill order rejected: {}", reason);
                    rejected += 1;
                }
                PlaceOutcome::Transient(reason) => {
                    return Ok(CommandOutcome::with_notify(
                        format!(
                            "Fill interrupted after {} orders: {}",
                            placed, reason
                        ),
                        NotifyType::Warning,
                    ));
                }
            }
        }

        Ok(CommandOutcome::with_notify(
            format!(
                "Fill done: {} {} orders placed across {}-{}{}",
                placed,
                side,
                low,
                high,
                if rejected > 0 {
                    format!(", {} rejected", rejected)
                } else {
                    String::new()
                }
            ),
            NotifyType::Info,
        ))
    }

    async fn place(
        &self,
        side: Side,
        pair: Option<Pair>,
        amount: Option<Decimal>,
        quote: Option<Decimal>,
        price: Option<Decimal>,
        market: bool,
    ) -> Result<CommandOutcome> {
        let pair = pair.unwrap_or_else(|| self.ctx.pair.clone());
        let features = self.ctx.features();

        let req = if market {
            if !features.place_market_order {
                return Ok(CommandOutcome::reply(format!(
                    "{} does not support market orders",
                    self.ctx.api.name()
                )));
            }
            if side == Side::Buy && amount.is_none() && !features.amount_for_market_buy {
                return Ok(CommandOutcome::reply(
                    "This exchange needs amount= for market buys",
                ));
            }
            if amount.is_none() && features.amount_for_market_order_necessary {
                return Ok(CommandOutcome::reply(
                    "This exchange needs amount= for market orders",
                ));
            }
            PlaceRequest::market(pair.clone(), side, amount, quote)
        } else {
            let Some(price) = price else {
                return Ok(CommandOutcome::reply("Limit orders need price="));
            };
            let base_amount = match (amount, quote) {
                (Some(amount), _) => amount,
                (None, Some(quote_amount)) if !price.is_zero() => quote_amount / price,
                _ => Decimal::ZERO,
            }
            .round_dp(self.ctx.market.base_decimals);
            PlaceRequest::limit(pair.clone(), side, price, base_amount)
        };

        match self.ctx.place_tracked(req, Purpose::Man, None).await? {
            PlaceOutcome::Placed(order) => Ok(CommandOutcome::with_notify(
                format!(
                    "Order #{} placed: {} {} {}{}",
                    order.id,
                    side,
                    if order.base_amount.is_zero() {
                        format!("{} {}", order.quote_amount, pair.quote)
                    } else {
                        format!("{} {}", order.base_amount, pair.base)
                    },
                    pair,
                    order
                        .price
                        .map(|p| format!(" @ {}", p))
                        .unwrap_or_else(|| " at market".to_string())
                ),
                NotifyType::Info,
            )),
            PlaceOutcome::Rejected(reason) => Ok(CommandOutcome::with_notify(
                format!("Order rejected: {}", reason),
                NotifyType::Warning,
            )),
            PlaceOutcome::Transient(reason) => Ok(CommandOutcome::with_notify(
                format!("Exchange unavailable, try again: {}", reason),
                NotifyType::Warning,
            )),
        }
    }

    async fn make_price(&self, price: Decimal) -> Result<CommandOutcome> {
        let report = pricemaker::make_price(&self.ctx, price).await?;
        let rates = |r: &Option<crate::exchange::Rates>| {
            r.as_ref()
                .map(|r| format!("last {}", r.last))
                .unwrap_or_else(|| "n/a".to_string())
        };
        let text = format!(
            "{} (before: {}, after: {})",
            report.message,
            rates(&report.rates_before),
            rates(&report.rates_after)
        );
        Ok(CommandOutcome::with_notify(
            text,
            if report.placed {
                NotifyType::Info
            } else {
                NotifyType::Warning
            },
        ))
    }

    async fn rates(&self) -> Result<CommandOutcome> {
        let rates = self.ctx.api.rates(&self.ctx.pair).await?;
        Ok(CommandOutcome::reply(format!(
            "{}: bid {}, ask {}, last {}\n24h: high {}, low {}, volume {} {} ({} {})",
            self.ctx.pair,
            rates.bid,
            rates.ask,
            rates.last,
            rates.high_24h,
            rates.low_24h,
            rates.volume_24h,
            self.ctx.pair.base,
            rates.quote_volume_24h,
            self.ctx.pair.quote,
        )))
    }

    async fn stats(&self, window: StatsWindow) -> Result<CommandOutcome> {
        let stats = self
            .ctx
            .ledger
            .stats_by_purpose(&self.ctx.pair, &Purpose::ALL, window)?;
        let mut lines = vec![format!("Stats for {}:", self.ctx.pair)];
        for entry in stats.iter().filter(|s| s.placed > 0) {
            lines.push(format!(
                "  {}: placed {}, filled {}, cancelled {}, volume {} {} / {} {}",
                entry.purpose,
                entry.placed,
                entry.filled,
                entry.cancelled,
                entry.base_filled,
                self.ctx.pair.base,
                entry.quote_filled,
                self.ctx.pair.quote,
            ));
        }
        if lines.len() == 1 {
            lines.push("  nothing in this window".to_string());
        }
        Ok(CommandOutcome::reply(lines.join("\n")))
    }

    async fn orders(&self, purpose: Option<Purpose>) -> Result<CommandOutcome> {
        use itertools::Itertools;

        let filter = purpose.map(|p| vec![p]);
        let open = self
            .ctx
            .ledger
            .find_open(&self.ctx.pair, filter.as_deref())?;
        let mut lines = vec![format!("{} open orders on {}:", open.len(), self.ctx.pair)];
        for order in open
            .iter()
            .sorted_by_key(|o| (o.purpose.as_str(), o.price))
            .take(30)
        {
            lines.push(format!(
                "  #{} [{}] {} {} @ {} (filled {})",
                order.id,
                order.purpose,
                order.side,
                order.base_amount,
                order
                    .price
                    .map(|p| p.to_string())
                    .unwrap_or_else(|| "market".to_string()),
                order.base_filled,
            ));
        }
        if open.len() > 30 {
            lines.push(format!("  ... and {} more", open.len() - 30));
        }
        Ok(CommandOutcome::reply(lines.join("\n")))
    }

    async fn balances(&self) -> Result<CommandOutcome> {
        let balances = self.ctx.balances().await?;
        let mut lines = vec!["Balances:".to_string()];
        let mut total_usd = Decimal::ZERO;
        for entry in &balances {
            let line = format!(
                "  {}: {} free, {} locked",
                entry.coin, entry.free, entry.locked
            );
            match self.ctx.rates.usd_rate(&entry.coin).await {
                Ok(rate) => {
                    let usd = entry.total() * rate;
                    total_usd += usd;
                    lines.push(format!("{} (~{:.2} USD)", line, usd));
                }
                Err(_) => lines.push(line),
            }
        }
        let mut total_line = format!("Total: ~{:.2} USD", total_usd);
        if let Ok(btc_rate) = self.ctx.rates.usd_rate("BTC").await {
            if !btc_rate.is_zero() {
                total_line = format!("{} (~{:.6} BTC)", total_line, total_usd / btc_rate);
            }
        }
        lines.push(total_line);
        Ok(CommandOutcome::reply(lines.join("\n")))
    }

    async fn params(&self) -> Result<CommandOutcome> {
        let params = self.ctx.snapshot_params().await;
        Ok(CommandOutcome::reply(serde_json::to_string_pretty(&params)?))
    }

    async fn info(&self) -> Result<CommandOutcome> {
        let params = self.ctx.snapshot_params().await;
        let pw_line = match self.ctx.pw_range() {
            Some(range) => format!(
                "[{}, {}] (actual: {}, anomaly: {})",
                range.low, range.mid, range.is_actual, range.is_anomaly
            ),
            None => "no range yet".to_string(),
        };
        Ok(CommandOutcome::reply(format!(
            "{} on {}\nActive: {}, policy {}\nob: {} (count {}), liq: {} ({} {} / {} {}), pw: {} {}",
            self.ctx.pair,
            self.ctx.api.name(),
            params.is_active,
            params.policy.as_str(),
            params.is_ob_active,
            params.ob_orders_count,
            params.is_liq_active,
            params.liq_sell_amount,
            self.ctx.pair.base,
            params.liq_buy_quote_amount,
            self.ctx.pair.quote,
            params.is_pw_active,
            pw_line,
        )))
    }

    async fn pair_info(&self) -> Result<CommandOutcome> {
        let market = &self.ctx.market;
        let rates = self.ctx.api.rates(&self.ctx.pair).await?;
        Ok(CommandOutcome::reply(format!(
            "{}: {} decimals base, {} decimals quote\nmin amount {}, tick {}\nbid {}, ask {}, last {}",
            self.ctx.pair,
            market.base_decimals,
            market.quote_decimals,
            market.min_amount,
            market.price_tick,
            rates.bid,
            rates.ask,
            rates.last,
        )))
    }

    async fn calc(&self, amount: Decimal, from: String, to: String) -> Result<CommandOutcome> {
        let converted = self.ctx.rates.convert(amount, &from, &to).await?;
        Ok(CommandOutcome::reply(format!(
            "{} {} = {} {}",
            amount, from, converted, to
        )))
    }

    fn deposit(&self, coin: String) -> Result<CommandOutcome> {
        if !self.ctx.features().get_deposit_address {
            return Ok(CommandOutcome::reply(format!(
                "{} does not expose deposit addresses through this agent",
                self.ctx.api.name()
            )));
        }
        Ok(CommandOutcome::reply(format!(
            "Deposit addresses for {} are not configured",
            coin
        )))
    }

    async fn account(&self) -> Result<CommandOutcome> {
        let features = self.ctx.features();
        let balances = self.balances().await?;
        Ok(CommandOutcome::reply(format!(
            "Account on {}\n{}\nmarket orders: {}, deposit addresses: {}, trading fees: {}",
            self.ctx.api.name(),
            balances.reply,
            features.place_market_order,
            features.get_deposit_address,
            features.get_trading_fees,
        )))
    }
}

const HELP_TEXT: &str = "\
Commands:
  start mm [optimal|spread|depth]   enable market making
  stop mm                           disable market making
  enable ob [count] [pct%]          order-book builder
  enable liq <spread%> <a1> <c1> <a2> <c2> [trend]
  enable pw <low-high [coin] | dev% PAIR@EXCHANGE> [smart|strict] [fill|prevent]
  disable ob|liq|pw
  amount MIN-MAX                    order amount range
  interval MIN-MAX sec|min|hour     tick interval range
  buypercent N                      buy bias
  clear [pair] <purpose|all|unk> [buy|sell] [>P|<P] [force]
  fill [pair] buy|sell quote=X|amount=X low=L high=H count=N
  buy|sell [pair] amount=X|quote=X price=P|market
  make price T now                  move the market price
  y                                 confirm the pending command
  rates stats orders balances params info pair calc deposit account version help";

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::paper::PaperExchange;
    use crate::exchange::TradingApi;
    use crate::maker::testutil::{paper_context, paper_context_with};
    use crate::orders::Order;
    use crate::params::TradeParams;

    async fn processor(threshold: Decimal) -> (Arc<PaperExchange>, Arc<MakerContext>, CommandProcessor) {
        let (exchange, ctx) = paper_context().await;
        let processor = CommandProcessor::new(ctx.clone(), threshold);
        (exchange, ctx, processor)
    }

    #[tokio::test]
    async fn test_start_stop_mutate_params() {
        let (_e, ctx, processor) = processor(dec!(1000000)).await;

        let outcome = processor.handle("start mm spread").await;
        assert!(outcome.reply.contains("spread"));
        assert!(ctx.snapshot_params().await.is_active);

        processor.handle("stop mm").await;
        assert!(!ctx.snapshot_params().await.is_active);
    }

    #[tokio::test]
    async fn test_validation_error_returns_usage() {
        let (_e, _ctx, processor) = processor(dec!(1000000)).await;
        let outcome = processor.handle("amount banana").await;
        assert!(outcome.reply.contains("Example"));
    }

    #[tokio::test]
    async fn test_clear_with_price_filter_scenario() {
        let (exchange, ctx, processor) = processor(dec!(1000000)).await;
        for price in [dec!(100.3), dec!(100.4), dec!(100.6), dec!(100.7)] {
            let req = PlaceRequest::limit(ctx.pair.clone(), Side::Sell, price, dec!(1));
            let id = exchange.place_order(&req).await.unwrap();
            let mut order = Order::new_limit(
                ctx.pair.clone(),
                Side::Sell,
                Purpose::Mm,
                id,
                price,
                dec!(1),
                None,
            );
            ctx.ledger.insert(&mut order).unwrap();
        }

        let outcome = processor.handle("clear mm sell >0.5 USDT").await;
        assert!(
            outcome.reply.contains("attempted=2, cancelled=2"),
            "reply: {}",
            outcome.reply
        );
        assert_eq!(ctx.ledger.find_open(&ctx.pair, None).unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_fill_rejects_on_insufficient_quote() {
        let exchange = Arc::new(PaperExchange::default());
        exchange.deposit("USDT", dec!(0.005));
        let pair = Pair::new("BTC", "USDT");
        let market = exchange
            .load_markets()
            .await
            .unwrap()
            .remove(&pair.symbol())
            .unwrap();
        let ctx = Arc::new(MakerContext::new(
            pair,
            exchange.clone(),
            Arc::new(crate::ledger::Ledger::open_in_memory().unwrap()),
            Arc::new(crate::rates::RateInfoClient::with_static(Default::default())),
            Arc::new(crate::notify::Notifier::new()),
            market,
            TradeParams::default(),
            None,
        ));
        let processor = CommandProcessor::new(ctx.clone(), dec!(1000000));

        let outcome = processor
            .handle("fill buy quote=0.01 low=100 high=110 count=5")
            .await;
        assert!(outcome.reply.contains("Not enough USDT"), "{}", outcome.reply);
        assert!(ctx.ledger.find_open(&ctx.pair, None).unwrap().is_empty());
        assert!(exchange.open_orders(&ctx.pair).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_fill_places_count_orders_across_range() {
        let (_e, ctx, processor) = processor(dec!(1000000)).await;
        let outcome = processor
            .handle("fill buy quote=100 low=95 high=99 count=5")
            .await;
        assert!(outcome.reply.contains("5 buy orders"), "{}", outcome.reply);

        let open = ctx.ledger.find_open(&ctx.pair, Some(&[Purpose::Man])).unwrap();
        assert_eq!(open.len(), 5);
        let mut prices: Vec<Decimal> = open.iter().map(|o| o.price.unwrap()).collect();
        prices.sort();
        assert_eq!(prices.first(), Some(&dec!(95)));
        assert_eq!(prices.last(), Some(&dec!(99)));
    }

    #[tokio::test]
    async fn test_confirmation_idempotent() {
        // threshold low enough that the fill always parks
        let (_e, ctx, processor) = processor(dec!(10)).await;

        let outcome = processor
            .handle("fill buy quote=100 low=95 high=99 count=2")
            .await;
        assert!(outcome.reply.contains("Reply y"), "{}", outcome.reply);
        assert!(ctx.ledger.find_open(&ctx.pair, None).unwrap().is_empty());

        let outcome = processor.handle("y").await;
        assert!(outcome.reply.contains("2 buy orders"), "{}", outcome.reply);
        assert_eq!(ctx.ledger.find_open(&ctx.pair, None).unwrap().len(), 2);

        // the second y finds nothing pending: executed exactly once
        let outcome = processor.handle("y").await;
        assert_eq!(outcome.reply, "Nothing to confirm");
        assert_eq!(ctx.ledger.find_open(&ctx.pair, None).unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_inline_confirm_bypasses_prompt() {
        let (_e, ctx, processor) = processor(dec!(10)).await;
        let outcome = processor
            .handle("fill buy quote=100 low=95 high=99 count=2 -y")
            .await;
        assert!(outcome.reply.contains("2 buy orders"), "{}", outcome.reply);
        assert_eq!(ctx.ledger.find_open(&ctx.pair, None).unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_enable_liq_maps_coins_either_order() {
        let (_e, ctx, processor) = processor(dec!(1000000)).await;
        processor.handle("enable liq 2% 5000 USDT 100 BTC down").await;
        let params = ctx.snapshot_params().await;
        assert!(params.is_liq_active);
        assert_eq!(params.liq_sell_amount, dec!(100));
        assert_eq!(params.liq_buy_quote_amount, dec!(5000));
        assert_eq!(params.liq_trend, crate::params::LiqTrend::Downtrend);
        assert!(ctx.reset_liq.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_enable_pw_defaults_currency_to_quote() {
        let (_e, ctx, processor) = processor(dec!(1000000)).await;
        processor.handle("enable pw 95-105 strict").await;
        let params = ctx.snapshot_params().await;
        assert!(params.is_pw_active);
        assert_eq!(
            params.pw_source,
            Some(PwSource::Numeric {
                low: dec!(95),
                high: dec!(105),
                currency: "USDT".to_string(),
            })
        );
        assert_eq!(params.pw_policy, crate::params::PwPolicy::Strict);
    }

    #[tokio::test]
    async fn test_make_price_requires_confirmation() {
        let (_e, ctx, processor) = processor(dec!(1000000)).await;
        let outcome = processor.handle("make price 100.5 now").await;
        assert!(outcome.reply.contains("Reply y"), "{}", outcome.reply);

        let outcome = processor.handle("y").await;
        assert!(outcome.reply.contains("placed"), "{}", outcome.reply);
        // crossed and filled instantly or resting, the row is recorded
        let all = ctx
            .ledger
            .stats_by_purpose(&ctx.pair, &[Purpose::Pm], StatsWindow::All)
            .unwrap();
        assert_eq!(all[0].placed, 1);
    }

    #[tokio::test]
    async fn test_informational_commands_answer() {
        let (_e, _ctx, processor) = processor(dec!(1000000)).await;
        assert!(processor.handle("rates").await.reply.contains("bid"));
        assert!(processor.handle("balances").await.reply.contains("Balances"));
        assert!(processor.handle("params").await.reply.contains("policy"));
        assert!(processor.handle("info").await.reply.contains("paper"));
        assert!(processor.handle("help").await.reply.contains("start mm"));
        assert!(processor
            .handle("version")
            .await
            .reply
            .contains(env!("CARGO_PKG_VERSION")));
        assert!(processor
            .handle("calc 2 BTC in USDT")
            .await
            .reply
            .contains("200"));
        assert!(processor.handle("orders").await.reply.contains("open orders"));
        assert!(processor.handle("stats day").await.reply.contains("Stats"));
    }

    #[tokio::test]
    async fn test_manual_buy_and_market_sell() {
        let (_e, ctx, processor) = processor(dec!(1000000)).await;
        let outcome = processor.handle("buy amount=0.5 price=99").await;
        assert!(outcome.reply.contains("placed"), "{}", outcome.reply);
        let open = ctx.ledger.find_open(&ctx.pair, Some(&[Purpose::Man])).unwrap();
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].price, Some(dec!(99)));

        let outcome = processor.handle("sell amount=0.5 market").await;
        assert!(outcome.reply.contains("placed"), "{}", outcome.reply);
    }

    #[tokio::test]
    async fn test_expired_confirmation() {
        let (_e, _ctx, processor) = processor(dec!(10)).await;
        processor
            .handle("fill buy quote=100 low=95 high=99 count=2")
            .await;
        // force the deadline into the past
        processor.pending.lock().unwrap().as_mut().unwrap().expires_at =
            Utc::now() - ChronoDuration::seconds(1);

        let outcome = processor.handle("y").await;
        assert!(outcome.reply.contains("expired"), "{}", outcome.reply);
        let outcome = processor.handle("y").await;
        assert_eq!(outcome.reply, "Nothing to confirm");
    }

    #[tokio::test]
    async fn test_disable_subsystems() {
        let (_e, ctx, processor) = processor(dec!(1000000)).await;
        processor.handle("enable ob 10").await;
        assert!(ctx.snapshot_params().await.is_ob_active);
        processor.handle("disable ob").await;
        assert!(!ctx.snapshot_params().await.is_ob_active);
    }

    #[tokio::test]
    async fn test_interval_and_buypercent() {
        let (_e, ctx, processor) = processor(dec!(1000000)).await;
        processor.handle("interval 2-10 sec").await;
        processor.handle("buypercent 70").await;
        let params = ctx.snapshot_params().await;
        assert_eq!(params.min_interval_ms, 2000);
        assert_eq!(params.max_interval_ms, 10_000);
        assert_eq!(params.buy_percent, dec!(70));
    }

    #[tokio::test]
    async fn test_clear_unknown_requires_confirmation() {
        let (exchange, ctx, processor) = processor(dec!(1000000)).await;
        exchange.inject_foreign_order(&ctx.pair, Side::Sell, dec!(103), dec!(1));

        let outcome = processor.handle("clear unk").await;
        assert!(outcome.reply.contains("Reply y"), "{}", outcome.reply);
        assert_eq!(exchange.open_orders(&ctx.pair).await.unwrap().len(), 1);

        let outcome = processor.handle("y").await;
        assert!(outcome.reply.contains("cancelled=1"), "{}", outcome.reply);
        assert!(exchange.open_orders(&ctx.pair).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_params_snapshot_visible_after_mutation() {
        let params = TradeParams::default();
        let (_e, ctx) = paper_context_with(params).await;
        let processor = CommandProcessor::new(ctx.clone(), dec!(1000000));
        processor.handle("amount 0.5-2").await;
        let snapshot = ctx.snapshot_params().await;
        assert_eq!(snapshot.min_amount, dec!(0.5));
        assert_eq!(snapshot.max_amount, dec!(2));
    }
}
