//! Price watcher
//!
//! Background coroutine maintaining the allowed price band for the traded
//! pair. The band comes either from operator-provided numeric bounds
//! (converted into the traded quote) or from another market's order book,
//! expanded by a deviation percentage. Sudden range jumps are treated as
//! anomalies and suppressed until confirmed by consecutive ticks.

use super::MakerContext;
use crate::exchange::registry::{self, Credentials};
use crate::exchange::TradingApi;
use crate::orders::collector::{Collector, OrderSelector, PurposeSelector};
use crate::orders::CloseReason;
use crate::params::{PwAction, PwSource};
use crate::types::Side;
use anyhow::Result;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Volume fraction defining the smart bid/ask of a watched market
const SMART_FRACTION: Decimal = dec!(0.02);

/// Relative move (percent) treated as a price anomaly
const ANOMALY_THRESHOLD_PERCENT: Decimal = dec!(15);

/// Consecutive ticks a jumped range must persist before it is accepted
const ANOMALY_CONFIRM_TICKS: u32 = 3;

/// Published watcher state
#[derive(Debug, Clone)]
pub struct PwRange {
    pub low: Decimal,
    pub mid: Decimal,
    pub high: Decimal,
    pub is_actual: bool,
    pub is_anomaly: bool,
    pub updated_at: DateTime<Utc>,
}

impl PwRange {
    fn fresh(low: Decimal, high: Decimal) -> Self {
        PwRange {
            low,
            mid: (low + high) / dec!(2),
            high,
            is_actual: true,
            is_anomaly: false,
            updated_at: Utc::now(),
        }
    }

    fn differs_beyond_threshold(&self, other: &PwRange) -> bool {
        let moved = |old: Decimal, new: Decimal| {
            !old.is_zero() && ((new - old) / old).abs() * dec!(100) > ANOMALY_THRESHOLD_PERCENT
        };
        moved(self.mid, other.mid) || moved(self.low, other.low) || moved(self.high, other.high)
    }
}

pub struct PriceWatcher {
    ctx: Arc<MakerContext>,
    /// Adapters for watched markets on other exchanges, created lazily
    source_apis: Mutex<HashMap<String, Arc<dyn TradingApi>>>,
    /// A jumped range waiting for confirmation, with its streak length
    anomaly_candidate: Mutex<Option<(PwRange, u32)>>,
}

impl PriceWatcher {
    pub fn new(ctx: Arc<MakerContext>) -> Self {
        PriceWatcher {
            ctx,
            source_apis: Mutex::new(HashMap::new()),
            anomaly_candidate: Mutex::new(None),
        }
    }

    /// Runs the watcher until shutdown, one tick every 1-3 seconds
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        loop {
            let delay = {
                use rand::Rng;
                rand::thread_rng().gen_range(1000..=3000)
            };
            tokio::select! {
                _ = tokio::time::sleep(std::time::Duration::from_millis(delay)) => {}
                _ = shutdown.changed() => break,
            }
            let Some(_token) = self.ctx.pw_guard.try_enter() else {
                debug!("price watcher: previous iteration still running, skip");
                continue;
            };
            if let Err(e) = self.tick().await {
                warn!("price watcher tick failed: {}", e);
            }
        }
        info!("price watcher stopped");
    }

    /// One watcher pass: derive the range, filter anomalies, publish, and
    /// enforce the configured action
    pub async fn tick(&self) -> Result<()> {
        let params = self.ctx.snapshot_params().await;
        if !params.is_pw_active {
            return Ok(());
        }
        let Some(source) = params.pw_source.clone() else {
            return Ok(());
        };

        let derived = match self.derive_range(&source).await {
            Ok(range) => range,
            Err(e) => {
                debug!("price watcher source unavailable: {}", e);
                self.mark_stale();
                return Ok(());
            }
        };

        let published = self.filter_anomaly(derived);
        self.ctx.publish_pw_range(published.clone());

        if published.is_actual && !published.is_anomaly {
            self.enforce_action(&params, &published).await?;
        }
        Ok(())
    }

    async fn derive_range(&self, source: &PwSource) -> Result<PwRange> {
        match source {
            PwSource::Numeric {
                low,
                high,
                currency,
            } => {
                let quote = &self.ctx.pair.quote;
                let low = self.ctx.rates.convert(*low, currency, quote).await?;
                let high = self.ctx.rates.convert(*high, currency, quote).await?;
                Ok(PwRange::fresh(low, high))
            }
            PwSource::Market {
                pair,
                exchange,
                deviation_percent,
            } => {
                let api = self.source_api(exchange)?;
                let book = api.order_book(pair).await?;
                let smart_bid = book
                    .smart_price(Side::Buy, SMART_FRACTION)
                    .ok_or_else(|| anyhow::anyhow!("watched market has no bids"))?;
                let smart_ask = book
                    .smart_price(Side::Sell, SMART_FRACTION)
                    .ok_or_else(|| anyhow::anyhow!("watched market has no asks"))?;
                let deviation = *deviation_percent / dec!(100);
                Ok(PwRange::fresh(
                    smart_bid * (Decimal::ONE - deviation),
                    smart_ask * (Decimal::ONE + deviation),
                ))
            }
        }
    }

    fn source_api(&self, exchange: &str) -> Result<Arc<dyn TradingApi>> {
        if exchange.eq_ignore_ascii_case(self.ctx.api.name()) {
            return Ok(self.ctx.api.clone());
        }
        let mut apis = self.source_apis.lock().unwrap();
        if let Some(api) = apis.get(exchange) {
            return Ok(api.clone());
        }
        // Watched books only need public endpoints
        let api = registry::create(exchange, &Credentials::default())?;
        apis.insert(exchange.to_string(), api.clone());
        Ok(api)
    }

    /// Keeps the previous range on the books while a jumped candidate
    /// earns its confirmation streak
    fn filter_anomaly(&self, derived: PwRange) -> PwRange {
        let Some(previous) = self.ctx.pw_range() else {
            return derived;
        };
        if !previous.is_actual || !previous.differs_beyond_threshold(&derived) {
            *self.anomaly_candidate.lock().unwrap() = None;
            return derived;
        }

        let mut candidate = self.anomaly_candidate.lock().unwrap();
        let streak = match candidate.take() {
            Some((held, streak)) if !held.differs_beyond_threshold(&derived) => streak + 1,
            _ => 1,
        };
        if streak >= ANOMALY_CONFIRM_TICKS {
            info!(
                "price watcher: range jump confirmed after {} ticks, accepting [{}, {}]",
                streak, derived.low, derived.high
            );
            *candidate = None;
            return derived;
        }
        warn!(
            "price watcher: anomalous range [{}, {}] suppressed ({}/{})",
            derived.low, derived.high, streak, ANOMALY_CONFIRM_TICKS
        );
        *candidate = Some((derived, streak));
        PwRange {
            is_anomaly: true,
            ..previous
        }
    }

    /// Flags the published range as no longer actual without discarding it
    fn mark_stale(&self) {
        if let Some(range) = self.ctx.pw_range() {
            if range.is_actual {
                self.ctx.publish_pw_range(PwRange {
                    is_actual: false,
                    ..range
                });
            }
        }
    }

    /// Applies the configured action when the traded price escapes the band
    async fn enforce_action(
        &self,
        params: &crate::params::TradeParams,
        range: &PwRange,
    ) -> Result<()> {
        let last = match self.ctx.api.rates(&self.ctx.pair).await {
            Ok(rates) => rates.last,
            Err(e) if e.is_transient() => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        if last >= range.low && last <= range.high {
            return Ok(());
        }

        match params.pw_action {
            PwAction::Fill => {
                // Price defense is a price-moving correction
                if !params.is_active || params.policy == crate::params::Policy::Depth {
                    return Ok(());
                }
                let target = if last < range.low { range.low } else { range.high };
                info!(
                    "price watcher: last {} escaped [{}, {}], pushing toward {}",
                    last, range.low, range.high, target
                );
                let report = super::pricemaker::make_price(&self.ctx, target).await?;
                if !report.placed {
                    warn!("price watcher correction not placed: {}", report.message);
                }
            }
            PwAction::Prevent => {
                let collector = Collector::new(self.ctx.api.clone(), self.ctx.ledger.clone());
                let selector = OrderSelector {
                    purposes: PurposeSelector::All,
                    pair: self.ctx.pair.clone(),
                    side: None,
                    price_filter: None,
                    expired_by: None,
                    outside_band: Some((range.low, range.high)),
                    force: false,
                };
                collector
                    .collect(&selector, CloseReason::OutOfPwRange)
                    .await?;
            }
        }
        Ok(())
    }
}
