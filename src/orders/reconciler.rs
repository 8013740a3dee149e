//! Order reconciler
//!
//! Refreshes open ledger rows against the exchange before any maker
//! decision that counts them. Detects fills, partial fills and external
//! cancellations; ids the exchange stops recognizing are tolerated once
//! and closed on the second consecutive observation.

use crate::exchange::{ExchangeError, OrderDetailsStatus, TradingApi};
use crate::ledger::{Ledger, OrderPatch};
use crate::orders::{CloseReason, Purpose};
use crate::types::Pair;
use anyhow::Result;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Outcome counters of one reconciliation pass
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ReconcileSummary {
    pub checked: u64,
    pub filled: u64,
    pub part_filled: u64,
    pub closed_external: u64,
    pub missing_once: u64,
    pub transient_skipped: u64,
}

pub struct Reconciler {
    api: Arc<dyn TradingApi>,
    ledger: Arc<Ledger>,
}

impl Reconciler {
    pub fn new(api: Arc<dyn TradingApi>, ledger: Arc<Ledger>) -> Self {
        Reconciler { api, ledger }
    }

    /// Refreshes every open ledger order of the pair (optionally narrowed
    /// to a purpose set) against the exchange
    pub async fn refresh(
        &self,
        pair: &Pair,
        purposes: Option<&[Purpose]>,
    ) -> Result<ReconcileSummary> {
        let open = self.ledger.find_open(pair, purposes)?;
        let mut summary = ReconcileSummary::default();

        for order in open {
            let Some(exchange_id) = order.exchange_id.clone() else {
                // Rows without an exchange id never became live
                self.ledger.mark_closed(order.id, CloseReason::ExternalCancel)?;
                continue;
            };
            summary.checked += 1;

            let details = match self.api.order_details(&exchange_id, pair).await {
                Ok(details) => details,
                Err(e) if e.is_transient() => {
                    summary.transient_skipped += 1;
                    debug!("reconcile: transient on order {}: {}", exchange_id, e);
                    continue;
                }
                Err(ExchangeError::UnknownOrder) => crate::exchange::OrderDetails::unknown(),
                Err(e) => {
                    warn!("reconcile: order {} lookup failed: {}", exchange_id, e);
                    continue;
                }
            };

            // The exchange may round; never report more filled than placed
            let base_filled = details.base_filled.min(order.base_amount);

            match details.status {
                OrderDetailsStatus::Filled => {
                    self.ledger.update(
                        order.id,
                        &OrderPatch {
                            base_filled: Some(order.base_amount),
                            quote_filled: Some(details.quote_filled),
                            processed: Some(true),
                            ..Default::default()
                        },
                    )?;
                    self.ledger.mark_closed(order.id, CloseReason::Filled)?;
                    summary.filled += 1;
                    info!(
                        "Order #{} ({}) filled: {} {}",
                        order.id, order.purpose, order.base_amount, pair.base
                    );
                }
                OrderDetailsStatus::Cancelled => {
                    self.ledger.update(
                        order.id,
                        &OrderPatch {
                            base_filled: Some(base_filled),
                            quote_filled: Some(details.quote_filled),
                            processed: Some(true),
                            ..Default::default()
                        },
                    )?;
                    self.ledger
                        .mark_closed(order.id, CloseReason::ExternalCancel)?;
                    summary.closed_external += 1;
                    info!("Order #{} ({}) cancelled externally", order.id, order.purpose);
                }
                OrderDetailsStatus::PartFilled => {
                    self.ledger.update(
                        order.id,
                        &OrderPatch {
                            base_filled: Some(base_filled),
                            quote_filled: Some(details.quote_filled),
                            processed: Some(true),
                            missing_count: Some(0),
                            ..Default::default()
                        },
                    )?;
                    summary.part_filled += 1;
                }
                OrderDetailsStatus::New => {
                    self.ledger.update(
                        order.id,
                        &OrderPatch {
                            processed: Some(true),
                            missing_count: Some(0),
                            ..Default::default()
                        },
                    )?;
                }
                OrderDetailsStatus::Unknown => {
                    if order.missing_count == 0 {
                        self.ledger.update(
                            order.id,
                            &OrderPatch {
                                missing_count: Some(1),
                                ..Default::default()
                            },
                        )?;
                        summary.missing_once += 1;
                        debug!("Order #{} missing once on exchange", order.id);
                    } else {
                        self.ledger
                            .mark_closed(order.id, CloseReason::ExternalCancel)?;
                        summary.closed_external += 1;
                        info!(
                            "Order #{} missing twice, treated as externally cancelled",
                            order.id
                        );
                    }
                }
            }
        }

        Ok(summary)
    }
}
