//! Order records and lifecycle
//!
//! Defines the central ledger order, its purpose tags and closure causes.

pub mod collector;
pub mod reconciler;

use crate::types::{Pair, Side};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Why an order was placed. `unk` is deliberately absent: it is a
/// classification for exchange-visible orders with no ledger row, not a
/// purpose the agent places under.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Purpose {
    /// Market-making core
    Mm,
    /// Order-book builder
    Ob,
    /// Liquidity provider
    Liq,
    /// Price watcher
    Pw,
    /// Price maker
    Pm,
    /// Closer
    Cl,
    /// Quote-hold
    Qh,
    /// Ladder
    Ld,
    /// Manual operator order
    Man,
}

impl Purpose {
    pub const ALL: [Purpose; 9] = [
        Purpose::Mm,
        Purpose::Ob,
        Purpose::Liq,
        Purpose::Pw,
        Purpose::Pm,
        Purpose::Cl,
        Purpose::Qh,
        Purpose::Ld,
        Purpose::Man,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Purpose::Mm => "mm",
            Purpose::Ob => "ob",
            Purpose::Liq => "liq",
            Purpose::Pw => "pw",
            Purpose::Pm => "pm",
            Purpose::Cl => "cl",
            Purpose::Qh => "qh",
            Purpose::Ld => "ld",
            Purpose::Man => "man",
        }
    }
}

impl fmt::Display for Purpose {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Purpose {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "mm" => Ok(Purpose::Mm),
            "ob" => Ok(Purpose::Ob),
            "liq" => Ok(Purpose::Liq),
            "pw" => Ok(Purpose::Pw),
            "pm" => Ok(Purpose::Pm),
            "cl" => Ok(Purpose::Cl),
            "qh" => Ok(Purpose::Qh),
            "ld" => Ok(Purpose::Ld),
            "man" => Ok(Purpose::Man),
            other => Err(format!("unknown purpose '{}'", other)),
        }
    }
}

/// Why a ledger row was closed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CloseReason {
    Expired,
    OutOfPwRange,
    UserCommand,
    ExternalCancel,
    Filled,
}

impl CloseReason {
    pub fn as_str(self) -> &'static str {
        match self {
            CloseReason::Expired => "expired",
            CloseReason::OutOfPwRange => "out_of_pw_range",
            CloseReason::UserCommand => "user_command",
            CloseReason::ExternalCancel => "external_cancel",
            CloseReason::Filled => "filled",
        }
    }
}

impl FromStr for CloseReason {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "expired" => Ok(CloseReason::Expired),
            "out_of_pw_range" => Ok(CloseReason::OutOfPwRange),
            "user_command" => Ok(CloseReason::UserCommand),
            "external_cancel" => Ok(CloseReason::ExternalCancel),
            "filled" => Ok(CloseReason::Filled),
            other => Err(format!("unknown close reason '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderKind {
    Limit,
    Market,
}

impl OrderKind {
    pub fn as_str(self) -> &'static str {
        match self {
            OrderKind::Limit => "limit",
            OrderKind::Market => "market",
        }
    }
}

impl FromStr for OrderKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "limit" => Ok(OrderKind::Limit),
            "market" => Ok(OrderKind::Market),
            other => Err(format!("unknown order kind '{}'", other)),
        }
    }
}

/// A ledger order: everything the agent has placed (or tried to place),
/// from acceptance through closure. Rows are retained for statistics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Order {
    /// Internal id, stable across restarts (ledger rowid)
    pub id: i64,
    /// Exchange-assigned id; absent for rejected ladder rows
    pub exchange_id: Option<String>,
    pub pair: Pair,
    pub side: Side,
    pub kind: OrderKind,
    pub purpose: Purpose,
    pub price: Option<Decimal>,
    pub base_amount: Decimal,
    pub quote_amount: Decimal,
    pub base_filled: Decimal,
    pub quote_filled: Decimal,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
    /// Seen at least once by the reconciler
    pub processed: bool,
    /// Fully filled
    pub executed: bool,
    /// Cancelled (by the agent or externally)
    pub cancelled: bool,
    /// Terminal: no longer expected on the exchange
    pub closed: bool,
    pub close_reason: Option<CloseReason>,
    /// Consecutive "unknown" observations by the reconciler
    pub missing_count: u32,
    pub ladder_index: Option<u32>,
    pub ladder_state: Option<String>,
    pub not_placed_reason: Option<String>,
}

impl Order {
    /// A freshly accepted limit order, before ledger insertion
    pub fn new_limit(
        pair: Pair,
        side: Side,
        purpose: Purpose,
        exchange_id: String,
        price: Decimal,
        base_amount: Decimal,
        expires_at: Option<DateTime<Utc>>,
    ) -> Self {
        let now = Utc::now();
        Order {
            id: 0,
            exchange_id: Some(exchange_id),
            pair,
            side,
            kind: OrderKind::Limit,
            purpose,
            price: Some(price),
            base_amount,
            quote_amount: price * base_amount,
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

    pub fn base_remaining(&self) -> Decimal {
        self.base_amount - self.base_filled
    }

    pub fn quote_remaining(&self) -> Decimal {
        self.quote_amount - self.quote_filled
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.map(|t| now > t).unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use rust_decimal_macros::dec;

    fn order() -> Order {
        Order::new_limit(
            Pair::new("BTC", "USDT"),
            Side::Buy,
            Purpose::Ob,
            "x-1".to_string(),
            dec!(100),
            dec!(2),
            Some(Utc::now() + Duration::seconds(3)),
        )
    }

    #[test]
    fn test_new_limit_amounts() {
        let o = order();
        assert_eq!(o.quote_amount, dec!(200));
        assert_eq!(o.base_remaining(), dec!(2));
        assert!(!o.closed);
    }

    #[test]
    fn test_expiry() {
        let o = order();
        assert!(!o.is_expired(Utc::now()));
        assert!(o.is_expired(Utc::now() + Duration::seconds(10)));
    }

    #[test]
    fn test_purpose_roundtrip() {
        for p in Purpose::ALL {
            assert_eq!(p.as_str().parse::<Purpose>().unwrap(), p);
        }
        assert!("unk".parse::<Purpose>().is_err());
    }
}
