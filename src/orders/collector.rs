//! Order collector
//!
//! Cancels ledger orders matching a selector: by purpose set, side and
//! price filter, with a force escape hatch for uncertain exchange state.
//! The `unk` mode sweeps exchange-visible orders that have no ledger row.

use crate::exchange::{CancelOutcome, ExchangeError, OrderDetailsStatus, TradingApi};
use crate::ledger::{Ledger, OrderPatch};
use crate::orders::{CloseReason, Order, Purpose};
use crate::types::{Pair, Side};
use anyhow::Result;
use rust_decimal::Decimal;
use std::sync::Arc;
use tracing::{info, warn};

/// Which purposes a collection run targets
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PurposeSelector {
    List(Vec<Purpose>),
    All,
    /// Exchange-visible orders with no ledger row
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PriceOp {
    Above,
    Below,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PriceFilter {
    pub op: PriceOp,
    pub value: Decimal,
}

impl PriceFilter {
    fn matches(&self, price: Decimal) -> bool {
        match self.op {
            PriceOp::Above => price > self.value,
            PriceOp::Below => price < self.value,
        }
    }
}

/// Selector handed to [`Collector::collect`]
#[derive(Debug, Clone)]
pub struct OrderSelector {
    pub purposes: PurposeSelector,
    pub pair: Pair,
    pub side: Option<Side>,
    pub price_filter: Option<PriceFilter>,
    /// Matches orders whose expiry lies before this instant
    pub expired_by: Option<chrono::DateTime<chrono::Utc>>,
    /// Matches orders priced outside `(low, high)`
    pub outside_band: Option<(Decimal, Decimal)>,
    /// Close rows locally even when the exchange outcome is uncertain
    pub force: bool,
}

impl OrderSelector {
    pub fn purposes(pair: Pair, purposes: Vec<Purpose>) -> Self {
        OrderSelector {
            purposes: PurposeSelector::List(purposes),
            pair,
            side: None,
            price_filter: None,
            expired_by: None,
            outside_band: None,
            force: false,
        }
    }

    fn matches(&self, order: &Order) -> bool {
        if let Some(side) = self.side {
            if order.side != side {
                return false;
            }
        }
        if let Some(filter) = self.price_filter {
            match order.price {
                Some(price) if filter.matches(price) => {}
                _ => return false,
            }
        }
        if let Some(deadline) = self.expired_by {
            if !order.is_expired(deadline) {
                return false;
            }
        }
        if let Some((low, high)) = self.outside_band {
            match order.price {
                Some(price) if price < low || price > high => {}
                _ => return false,
            }
        }
        true
    }
}

/// Counters returned to the caller, plus a rendered one-line summary
#[derive(Debug, Clone, Default)]
pub struct CollectResult {
    pub attempted: u64,
    pub cancelled: u64,
    pub failed: u64,
    pub already_closed: u64,
    pub log_message: String,
}

pub struct Collector {
    api: Arc<dyn TradingApi>,
    ledger: Arc<Ledger>,
}

impl Collector {
    pub fn new(api: Arc<dyn TradingApi>, ledger: Arc<Ledger>) -> Self {
        Collector { api, ledger }
    }

    pub async fn collect(
        &self,
        selector: &OrderSelector,
        reason: CloseReason,
    ) -> Result<CollectResult> {
        let mut result = match &selector.purposes {
            PurposeSelector::Unknown => self.collect_unknown(selector).await?,
            PurposeSelector::All => self.collect_ledger(selector, None, reason).await?,
            PurposeSelector::List(purposes) => {
                self.collect_ledger(selector, Some(purposes.as_slice()), reason)
                    .await?
            }
        };

        result.log_message = format!(
            "attempted={}, cancelled={}, already_closed={}, failed={}",
            result.attempted, result.cancelled, result.already_closed, result.failed
        );
        info!("Collector ({}): {}", reason.as_str(), result.log_message);
        Ok(result)
    }

    async fn collect_ledger(
        &self,
        selector: &OrderSelector,
        purposes: Option<&[Purpose]>,
        reason: CloseReason,
    ) -> Result<CollectResult> {
        let open = self.ledger.find_open(&selector.pair, purposes)?;
        let mut result = CollectResult::default();

        for order in open.into_iter().filter(|o| selector.matches(o)) {
            let Some(exchange_id) = order.exchange_id.clone() else {
                self.ledger.mark_closed(order.id, reason)?;
                result.already_closed += 1;
                continue;
            };
            result.attempted += 1;

            match self
                .api
                .cancel_order(&exchange_id, order.side, &selector.pair)
                .await
            {
                Ok(CancelOutcome::Cancelled) => {
                    self.ledger.mark_closed(order.id, reason)?;
                    result.cancelled += 1;
                }
                Ok(CancelOutcome::AlreadyClosed) => {
                    // The order ended before we got to it; capture whether
                    // it filled so statistics stay honest
                    self.close_settled(&order, &exchange_id, &selector.pair)
                        .await?;
                    result.already_closed += 1;
                }
                Ok(CancelOutcome::Unknown) => {
                    if selector.force {
                        self.ledger
                            .mark_closed(order.id, CloseReason::ExternalCancel)?;
                        result.already_closed += 1;
                    } else {
                        // Leave for the reconciler's two-strike rule
                        result.failed += 1;
                    }
                }
                Err(e) if e.is_transient() => {
                    if selector.force {
                        warn!(
                            "Force-closing order #{} despite uncertain exchange state: {}",
                            order.id, e
                        );
                        self.ledger.mark_closed(order.id, reason)?;
                        result.cancelled += 1;
                    } else {
                        result.failed += 1;
                    }
                }
                Err(e) => {
                    warn!("Cancel of order #{} rejected: {}", order.id, e);
                    result.failed += 1;
                }
            }
        }
        Ok(result)
    }

    /// Closes a row whose exchange order finished before cancellation
    async fn close_settled(&self, order: &Order, exchange_id: &str, pair: &Pair) -> Result<()> {
        match self.api.order_details(exchange_id, pair).await {
            Ok(details) if details.status == OrderDetailsStatus::Filled => {
                self.ledger.update(
                    order.id,
                    &OrderPatch {
                        base_filled: Some(order.base_amount),
                        quote_filled: Some(details.quote_filled),
                        ..Default::default()
                    },
                )?;
                self.ledger.mark_closed(order.id, CloseReason::Filled)?;
            }
            Ok(details) => {
                self.ledger.update(
                    order.id,
                    &OrderPatch {
                        base_filled: Some(details.base_filled.min(order.base_amount)),
                        quote_filled: Some(details.quote_filled),
                        ..Default::default()
                    },
                )?;
                self.ledger
                    .mark_closed(order.id, CloseReason::ExternalCancel)?;
            }
            Err(_) => {
                self.ledger
                    .mark_closed(order.id, CloseReason::ExternalCancel)?;
            }
        }
        Ok(())
    }

    /// Cancels exchange-live orders absent from the ledger
    async fn collect_unknown(&self, selector: &OrderSelector) -> Result<CollectResult> {
        let mut result = CollectResult::default();
        let live = match self.api.open_orders(&selector.pair).await {
            Ok(live) => live,
            Err(ExchangeError::Transient(e)) => {
                warn!("Unknown-order sweep skipped: {}", e);
                return Ok(result);
            }
            Err(e) => return Err(e.into()),
        };

        for open in live {
            if self.ledger.find_by_exchange_id(&open.id)?.is_some() {
                continue;
            }
            if let Some(side) = selector.side {
                if open.side != side {
                    continue;
                }
            }
            if let Some(filter) = selector.price_filter {
                if !filter.matches(open.price) {
                    continue;
                }
            }
            result.attempted += 1;
            match self
                .api
                .cancel_order(&open.id, open.side, &selector.pair)
                .await
            {
                Ok(CancelOutcome::Cancelled) => {
                    info!("Cancelled unknown order {} on exchange", open.id);
                    result.cancelled += 1;
                }
                Ok(_) => result.already_closed += 1,
                Err(e) => {
                    warn!("Cancel of unknown order {} failed: {}", open.id, e);
                    result.failed += 1;
                }
            }
        }
        Ok(result)
    }
}
