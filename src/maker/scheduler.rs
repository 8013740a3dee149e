//! Scheduler/supervisor
//!
//! Owns the background loops for the order-book builder, the liquidity
//! provider and the price watcher. Every loop body checks the activity
//! flag, the policy gate and the component's re-entrancy guard before
//! running a tick; errors are logged and never break the loop. Flipping
//! the activity flag off does not cancel an in-flight tick, it only stops
//! further iterations.

use super::liquidity::LiquidityProvider;
use super::orderbook::OrderBookBuilder;
use super::watcher::PriceWatcher;
use super::MakerContext;
use crate::params::TradeParams;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

fn random_delay(min_ms: u64, max_ms: u64) -> Duration {
    use rand::Rng;
    let max_ms = max_ms.max(min_ms + 1);
    Duration::from_millis(rand::thread_rng().gen_range(min_ms..=max_ms))
}

/// Builder period per iteration, independent of the configured liquidity
/// interval range
const OB_MIN_PERIOD_MS: u64 = 1500;
const OB_MAX_PERIOD_MS: u64 = 3000;

fn ob_gate(params: &TradeParams) -> bool {
    params.is_active && params.policy.is_regular() && params.is_ob_active
}

fn liq_gate(params: &TradeParams) -> bool {
    // the provider runs under every policy, including depth
    params.is_active && params.is_liq_active
}

pub struct Scheduler {
    ctx: Arc<MakerContext>,
}

impl Scheduler {
    pub fn new(ctx: Arc<MakerContext>) -> Self {
        Scheduler { ctx }
    }

    /// Spawns one task per background component. Tasks exit when the
    /// shutdown channel flips.
    pub fn spawn(&self, shutdown: watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
        let mut handles = Vec::new();

        {
            let ctx = self.ctx.clone();
            let mut shutdown = shutdown.clone();
            handles.push(tokio::spawn(async move {
                let builder = OrderBookBuilder::new(ctx.clone());
                loop {
                    let delay = random_delay(OB_MIN_PERIOD_MS, OB_MAX_PERIOD_MS);
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = shutdown.changed() => break,
                    }
                    let params = ctx.snapshot_params().await;
                    if !ob_gate(&params) {
                        debug!("ob builder: inactive or out of policy, skip");
                        continue;
                    }
                    let Some(_token) = ctx.ob_guard.try_enter() else {
                        info!("ob builder: previous iteration still running, skip");
                        continue;
                    };
                    match builder.tick().await {
                        Ok(report) => debug!(
                            "ob tick: placed={} expired={} out_of_band={} skipped={}",
                            report.placed,
                            report.expired_cancelled,
                            report.out_of_band_cancelled,
                            report.skipped
                        ),
                        Err(e) => {
                            error!("ob builder tick failed: {}", e);
                            ctx.notifier.notify_throttled(
                                "ob-tick-errors",
                                crate::notify::NotifyType::Warning,
                                "Order-book builder keeps failing, check the logs",
                            );
                        }
                    }
                }
                info!("ob builder stopped");
            }));
        }

        {
            let ctx = self.ctx.clone();
            let mut shutdown = shutdown.clone();
            handles.push(tokio::spawn(async move {
                let provider = LiquidityProvider::new(ctx.clone());
                loop {
                    let params = ctx.snapshot_params().await;
                    let delay = random_delay(params.min_interval_ms, params.max_interval_ms);
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = shutdown.changed() => break,
                    }
                    let params = ctx.snapshot_params().await;
                    if !liq_gate(&params) {
                        debug!("liq provider: inactive, skip");
                        continue;
                    }
                    let Some(_token) = ctx.liq_guard.try_enter() else {
                        info!("liq provider: previous iteration still running, skip");
                        continue;
                    };
                    match provider.tick().await {
                        Ok(report) => debug!(
                            "liq tick: placed={} cancelled={} asks={} bid_quote={}",
                            report.placed,
                            report.cancelled,
                            report.ask_base_total,
                            report.bid_quote_total
                        ),
                        Err(e) => {
                            error!("liq provider tick failed: {}", e);
                            ctx.notifier.notify_throttled(
                                "liq-tick-errors",
                                crate::notify::NotifyType::Warning,
                                "Liquidity provider keeps failing, check the logs",
                            );
                        }
                    }
                }
                info!("liq provider stopped");
            }));
        }

        {
            let watcher = Arc::new(PriceWatcher::new(self.ctx.clone()));
            handles.push(tokio::spawn(watcher.run(shutdown)));
        }

        handles
    }
}
