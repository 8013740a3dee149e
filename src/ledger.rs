//! Persistent order ledger
//!
//! SQLite-backed store of every order the agent has placed. Rows survive
//! restarts and are retained after closure for statistics. Single-row
//! updates are atomic; money columns are TEXT decimals so amounts
//! round-trip exactly.

use crate::orders::{CloseReason, Order, Purpose};
use crate::types::{Pair, Side};
use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use rusqlite::types::Type;
use rusqlite::{params, params_from_iter, Connection, Row, ToSql};
use rust_decimal::Decimal;
use std::path::Path;
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use tracing::{debug, info};

/// Aggregation window for purpose statistics
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatsWindow {
    Hour,
    Day,
    Month,
    All,
}

impl StatsWindow {
    fn cutoff(self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self {
            StatsWindow::Hour => Some(now - Duration::hours(1)),
            StatsWindow::Day => Some(now - Duration::days(1)),
            StatsWindow::Month => Some(now - Duration::days(30)),
            StatsWindow::All => None,
        }
    }
}

impl FromStr for StatsWindow {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "hour" => Ok(StatsWindow::Hour),
            "day" => Ok(StatsWindow::Day),
            "month" => Ok(StatsWindow::Month),
            "all" => Ok(StatsWindow::All),
            other => Err(format!("unknown stats window '{}'", other)),
        }
    }
}

/// Per-purpose aggregates over a window
#[derive(Debug, Clone)]
pub struct PurposeStats {
    pub purpose: Purpose,
    pub placed: u64,
    pub filled: u64,
    pub cancelled: u64,
    pub base_filled: Decimal,
    pub quote_filled: Decimal,
}

/// Partial update applied to one ledger row. Unset fields are untouched;
/// `updated_at` is always stamped.
#[derive(Debug, Default, Clone)]
pub struct OrderPatch {
    pub exchange_id: Option<String>,
    pub base_filled: Option<Decimal>,
    pub quote_filled: Option<Decimal>,
    pub processed: Option<bool>,
    pub executed: Option<bool>,
    pub cancelled: Option<bool>,
    pub closed: Option<bool>,
    pub close_reason: Option<CloseReason>,
    pub missing_count: Option<u32>,
    pub not_placed_reason: Option<String>,
}

const ORDER_COLUMNS: &str = "id, exchange_id, base, quote, side, kind, purpose, price, \
     base_amount, quote_amount, base_filled, quote_filled, created_at, updated_at, expires_at, \
     processed, executed, cancelled, closed, close_reason, missing_count, \
     ladder_index, ladder_state, not_placed_reason";

pub struct Ledger {
    conn: Arc<Mutex<Connection>>,
}

impl Ledger {
    pub fn open<P: AsRef<Path>>(db_path: P) -> Result<Self> {
        let db_path = db_path.as_ref();
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(db_path)
            .with_context(|| format!("Failed to open ledger: {}", db_path.display()))?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        let ledger = Ledger {
            conn: Arc::new(Mutex::new(conn)),
        };
        ledger.create_tables()?;
        info!("Order ledger opened at {}", db_path.display());
        Ok(ledger)
    }

    /// Private in-memory ledger, used by tests and `exec` one-shots
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let ledger = Ledger {
            conn: Arc::new(Mutex::new(conn)),
        };
        ledger.create_tables()?;
        Ok(ledger)
    }

    fn create_tables(&self) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "CREATE TABLE IF NOT EXISTS orders (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                exchange_id TEXT,
                base TEXT NOT NULL,
                quote TEXT NOT NULL,
                side TEXT NOT NULL,
                kind TEXT NOT NULL,
                purpose TEXT NOT NULL,
                price TEXT,
                base_amount TEXT NOT NULL,
                quote_amount TEXT NOT NULL,
                base_filled TEXT NOT NULL DEFAULT '0',
                quote_filled TEXT NOT NULL DEFAULT '0',
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                expires_at TEXT,
                processed INTEGER NOT NULL DEFAULT 0,
                executed INTEGER NOT NULL DEFAULT 0,
                cancelled INTEGER NOT NULL DEFAULT 0,
                closed INTEGER NOT NULL DEFAULT 0,
                close_reason TEXT,
                missing_count INTEGER NOT NULL DEFAULT 0,
                ladder_index INTEGER,
                ladder_state TEXT,
                not_placed_reason TEXT
            )",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_orders_closed ON orders(closed)",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_orders_purpose ON orders(purpose)",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_orders_exchange_id ON orders(exchange_id)",
            [],
        )?;
        debug!("Ledger schema verified");
        Ok(())
    }

    /// Inserts the order and assigns its internal id
    pub fn insert(&self, order: &mut Order) -> Result<i64> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO orders (exchange_id, base, quote, side, kind, purpose, price,
                base_amount, quote_amount, base_filled, quote_filled,
                created_at, updated_at, expires_at, processed, executed, cancelled, closed,
                close_reason, missing_count, ladder_index, ladder_state, not_placed_reason)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19, ?20, ?21, ?22, ?23)",
            params![
                order.exchange_id,
                order.pair.base,
                order.pair.quote,
                order.side.as_str(),
                order.kind.as_str(),
                order.purpose.as_str(),
                order.price.map(|p| p.to_string()),
                order.base_amount.to_string(),
                order.quote_amount.to_string(),
                order.base_filled.to_string(),
                order.quote_filled.to_string(),
                order.created_at.to_rfc3339(),
                order.updated_at.to_rfc3339(),
                order.expires_at.map(|t| t.to_rfc3339()),
                order.processed,
                order.executed,
                order.cancelled,
                order.closed,
                order.close_reason.map(|r| r.as_str()),
                order.missing_count,
                order.ladder_index,
                order.ladder_state,
                order.not_placed_reason,
            ],
        )?;
        order.id = conn.last_insert_rowid();
        debug!(
            "Ledger insert: #{} {} {} {} @ {:?}",
            order.id, order.purpose, order.side, order.base_amount, order.price
        );
        Ok(order.id)
    }

    /// Applies a partial update to one row
    pub fn update(&self, id: i64, patch: &OrderPatch) -> Result<()> {
        let mut sets: Vec<&str> = vec!["updated_at = ?"];
        let mut values: Vec<Box<dyn ToSql>> = vec![Box::new(Utc::now().to_rfc3339())];

        if let Some(exchange_id) = &patch.exchange_id {
            sets.push("exchange_id = ?");
            values.push(Box::new(exchange_id.clone()));
        }
        if let Some(base_filled) = patch.base_filled {
            sets.push("base_filled = ?");
            values.push(Box::new(base_filled.to_string()));
        }
        if let Some(quote_filled) = patch.quote_filled {
            sets.push("quote_filled = ?");
            values.push(Box::new(quote_filled.to_string()));
        }
        if let Some(processed) = patch.processed {
            sets.push("processed = ?");
            values.push(Box::new(processed));
        }
        if let Some(executed) = patch.executed {
            sets.push("executed = ?");
            values.push(Box::new(executed));
        }
        if let Some(cancelled) = patch.cancelled {
            sets.push("cancelled = ?");
            values.push(Box::new(cancelled));
        }
        if let Some(closed) = patch.closed {
            sets.push("closed = ?");
            values.push(Box::new(closed));
        }
        if let Some(reason) = patch.close_reason {
            sets.push("close_reason = ?");
            values.push(Box::new(reason.as_str()));
        }
        if let Some(missing) = patch.missing_count {
            sets.push("missing_count = ?");
            values.push(Box::new(missing));
        }
        if let Some(reason) = &patch.not_placed_reason {
            sets.push("not_placed_reason = ?");
            values.push(Box::new(reason.clone()));
        }

        let sql = format!("UPDATE orders SET {} WHERE id = ?", sets.join(", "));
        values.push(Box::new(id));

        let conn = self.conn.lock().unwrap();
        conn.execute(&sql, params_from_iter(values.iter().map(|v| &**v)))?;
        Ok(())
    }

    /// Terminal transition; sets the executed/cancelled flags implied by
    /// the closure cause
    pub fn mark_closed(&self, id: i64, reason: CloseReason) -> Result<()> {
        self.update(
            id,
            &OrderPatch {
                closed: Some(true),
                close_reason: Some(reason),
                executed: Some(reason == CloseReason::Filled),
                cancelled: Some(reason != CloseReason::Filled),
                ..Default::default()
            },
        )
    }

    pub fn find_by_id(&self, id: i64) -> Result<Option<Order>> {
        let conn = self.conn.lock().unwrap();
        let sql = format!("SELECT {} FROM orders WHERE id = ?1", ORDER_COLUMNS);
        let mut stmt = conn.prepare(&sql)?;
        match stmt.query_row(params![id], order_from_row) {
            Ok(order) => Ok(Some(order)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub fn find_by_exchange_id(&self, exchange_id: &str) -> Result<Option<Order>> {
        let conn = self.conn.lock().unwrap();
        let sql = format!(
            "SELECT {} FROM orders WHERE exchange_id = ?1 ORDER BY id DESC LIMIT 1",
            ORDER_COLUMNS
        );
        let mut stmt = conn.prepare(&sql)?;
        match stmt.query_row(params![exchange_id], order_from_row) {
            Ok(order) => Ok(Some(order)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Open (not closed) orders for the pair, optionally narrowed to a
    /// purpose set
    pub fn find_open(&self, pair: &Pair, purposes: Option<&[Purpose]>) -> Result<Vec<Order>> {
        let conn = self.conn.lock().unwrap();
        let mut sql = format!(
            "SELECT {} FROM orders WHERE closed = 0 AND base = ?1 AND quote = ?2",
            ORDER_COLUMNS
        );
        let mut values: Vec<Box<dyn ToSql>> =
            vec![Box::new(pair.base.clone()), Box::new(pair.quote.clone())];

        if let Some(purposes) = purposes {
            if purposes.is_empty() {
                return Ok(Vec::new());
            }
            let placeholders = vec!["?"; purposes.len()].join(", ");
            sql.push_str(&format!(" AND purpose IN ({})", placeholders));
            for purpose in purposes {
                values.push(Box::new(purpose.as_str()));
            }
        }
        sql.push_str(" ORDER BY id");

        let mut stmt = conn.prepare(&sql)?;
        let orders = stmt
            .query_map(params_from_iter(values.iter().map(|v| &**v)), order_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(orders)
    }

    pub fn count_open(&self, pair: &Pair, purpose: Purpose) -> Result<u64> {
        Ok(self.find_open(pair, Some(&[purpose]))?.len() as u64)
    }

    /// Aggregates per purpose over rows created inside the window
    pub fn stats_by_purpose(
        &self,
        pair: &Pair,
        purposes: &[Purpose],
        window: StatsWindow,
    ) -> Result<Vec<PurposeStats>> {
        let conn = self.conn.lock().unwrap();
        let mut sql = format!(
            "SELECT {} FROM orders WHERE base = ?1 AND quote = ?2",
            ORDER_COLUMNS
        );
        let mut values: Vec<Box<dyn ToSql>> =
            vec![Box::new(pair.base.clone()), Box::new(pair.quote.clone())];
        if let Some(cutoff) = window.cutoff(Utc::now()) {
            sql.push_str(" AND created_at >= ?3");
            values.push(Box::new(cutoff.to_rfc3339()));
        }

        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map(params_from_iter(values.iter().map(|v| &**v)), order_from_row)?
            .collect::<Result<Vec<_>, _>>()?;

        let mut stats = Vec::new();
        for &purpose in purposes {
            let mut entry = PurposeStats {
                purpose,
                placed: 0,
                filled: 0,
                cancelled: 0,
                base_filled: Decimal::ZERO,
                quote_filled: Decimal::ZERO,
            };
            for order in rows.iter().filter(|o| o.purpose == purpose) {
                entry.placed += 1;
                if order.executed {
                    entry.filled += 1;
                }
                if order.cancelled {
                    entry.cancelled += 1;
                }
                entry.base_filled += order.base_filled;
                entry.quote_filled += order.quote_filled;
            }
            stats.push(entry);
        }
        Ok(stats)
    }
}

fn decimal_column(row: &Row<'_>, idx: usize) -> rusqlite::Result<Decimal> {
    let text: String = row.get(idx)?;
    Decimal::from_str(&text)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn optional_decimal_column(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<Decimal>> {
    let text: Option<String> = row.get(idx)?;
    text.map(|t| {
        Decimal::from_str(&t)
            .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
    })
    .transpose()
}

fn time_column(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let text: String = row.get(idx)?;
    DateTime::parse_from_rfc3339(&text)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn order_from_row(row: &Row<'_>) -> rusqlite::Result<Order> {
    let side_text: String = row.get(4)?;
    let kind_text: String = row.get(5)?;
    let purpose_text: String = row.get(6)?;
    let reason_text: Option<String> = row.get(19)?;

    let conversion = |idx: usize, msg: String| {
        rusqlite::Error::FromSqlConversionFailure(
            idx,
            Type::Text,
            Box::new(std::io::Error::new(std::io::ErrorKind::InvalidData, msg)),
        )
    };

    Ok(Order {
        id: row.get(0)?,
        exchange_id: row.get(1)?,
        pair: Pair::new(row.get::<_, String>(2)?, row.get::<_, String>(3)?),
        side: side_text.parse().map_err(|e: String| conversion(4, e))?,
        kind: kind_text.parse().map_err(|e: String| conversion(5, e))?,
        purpose: purpose_text.parse().map_err(|e: String| conversion(6, e))?,
        price: optional_decimal_column(row, 7)?,
        base_amount: decimal_column(row, 8)?,
        quote_amount: decimal_column(row, 9)?,
        base_filled: decimal_column(row, 10)?,
        quote_filled: decimal_column(row, 11)?,
        created_at: time_column(row, 12)?,
        updated_at: time_column(row, 13)?,
        expires_at: {
            let text: Option<String> = row.get(14)?;
            match text {
                Some(t) => Some(
                    DateTime::parse_from_rfc3339(&t)
                        .map(|t| t.with_timezone(&Utc))
                        .map_err(|e| {
                            rusqlite::Error::FromSqlConversionFailure(14, Type::Text, Box::new(e))
                        })?,
                ),
                None => None,
            }
        },
        processed: row.get(15)?,
        executed: row.get(16)?,
        cancelled: row.get(17)?,
        closed: row.get(18)?,
        close_reason: reason_text
            .map(|t| t.parse().map_err(|e: String| conversion(19, e)))
            .transpose()?,
        missing_count: row.get(20)?,
        ladder_index: row.get(21)?,
        ladder_state: row.get(22)?,
        not_placed_reason: row.get(23)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn pair() -> Pair {
        Pair::new("BTC", "USDT")
    }

    fn sample(purpose: Purpose, price: Decimal) -> Order {
        Order::new_limit(
            pair(),
            Side::Buy,
            purpose,
            format!("x-{}", price),
            price,
            dec!(1.5),
            None,
        )
    }

    #[test]
    fn test_insert_assigns_ids() {
        let ledger = Ledger::open_in_memory().unwrap();
        let mut first = sample(Purpose::Ob, dec!(100));
        let mut second = sample(Purpose::Liq, dec!(101));
        let id1 = ledger.insert(&mut first).unwrap();
        let id2 = ledger.insert(&mut second).unwrap();
        assert!(id2 > id1);
        assert_eq!(first.id, id1);
    }

    #[test]
    fn test_roundtrip_preserves_decimals() {
        let ledger = Ledger::open_in_memory().unwrap();
        let mut order = sample(Purpose::Ob, dec!(123.456789));
        order.base_amount = dec!(0.00012345);
        order.quote_amount = order.price.unwrap() * order.base_amount;
        ledger.insert(&mut order).unwrap();

        let loaded = ledger.find_by_id(order.id).unwrap().unwrap();
        assert_eq!(loaded.price, Some(dec!(123.456789)));
        assert_eq!(loaded.base_amount, dec!(0.00012345));
        assert_eq!(loaded.quote_amount, order.quote_amount);
        assert_eq!(loaded.side, Side::Buy);
        assert_eq!(loaded.purpose, Purpose::Ob);
    }

    #[test]
    fn test_patch_and_mark_closed() {
        let ledger = Ledger::open_in_memory().unwrap();
        let mut order = sample(Purpose::Ob, dec!(100));
        ledger.insert(&mut order).unwrap();

        ledger
            .update(
                order.id,
                &OrderPatch {
                    base_filled: Some(dec!(0.5)),
                    quote_filled: Some(dec!(50)),
                    processed: Some(true),
                    ..Default::default()
                },
            )
            .unwrap();

        let loaded = ledger.find_by_id(order.id).unwrap().unwrap();
        assert_eq!(loaded.base_filled, dec!(0.5));
        assert!(loaded.processed);
        assert!(!loaded.closed);

        ledger.mark_closed(order.id, CloseReason::Filled).unwrap();
        let loaded = ledger.find_by_id(order.id).unwrap().unwrap();
        assert!(loaded.closed);
        assert!(loaded.executed);
        assert!(!loaded.cancelled);
        assert_eq!(loaded.close_reason, Some(CloseReason::Filled));
    }

    #[test]
    fn test_find_open_filters() {
        let ledger = Ledger::open_in_memory().unwrap();
        let mut ob = sample(Purpose::Ob, dec!(100));
        let mut liq = sample(Purpose::Liq, dec!(101));
        let mut closed = sample(Purpose::Ob, dec!(102));
        ledger.insert(&mut ob).unwrap();
        ledger.insert(&mut liq).unwrap();
        ledger.insert(&mut closed).unwrap();
        ledger.mark_closed(closed.id, CloseReason::Expired).unwrap();

        let open = ledger.find_open(&pair(), None).unwrap();
        assert_eq!(open.len(), 2);

        let only_ob = ledger.find_open(&pair(), Some(&[Purpose::Ob])).unwrap();
        assert_eq!(only_ob.len(), 1);
        assert_eq!(only_ob[0].id, ob.id);

        let other_pair = Pair::new("ETH", "USDT");
        assert!(ledger.find_open(&other_pair, None).unwrap().is_empty());
    }

    #[test]
    fn test_find_by_exchange_id() {
        let ledger = Ledger::open_in_memory().unwrap();
        let mut order = sample(Purpose::Man, dec!(99));
        order.exchange_id = Some("abc-7".to_string());
        ledger.insert(&mut order).unwrap();

        let loaded = ledger.find_by_exchange_id("abc-7").unwrap().unwrap();
        assert_eq!(loaded.id, order.id);
        assert!(ledger.find_by_exchange_id("missing").unwrap().is_none());
    }

    #[test]
    fn test_stats_by_purpose() {
        let ledger = Ledger::open_in_memory().unwrap();
        let mut filled = sample(Purpose::Ob, dec!(100));
        let mut open = sample(Purpose::Ob, dec!(101));
        let mut liq = sample(Purpose::Liq, dec!(102));
        ledger.insert(&mut filled).unwrap();
        ledger.insert(&mut open).unwrap();
        ledger.insert(&mut liq).unwrap();

        ledger
            .update(
                filled.id,
                &OrderPatch {
                    base_filled: Some(dec!(1.5)),
                    quote_filled: Some(dec!(150)),
                    ..Default::default()
                },
            )
            .unwrap();
        ledger.mark_closed(filled.id, CloseReason::Filled).unwrap();

        let stats = ledger
            .stats_by_purpose(&pair(), &[Purpose::Ob, Purpose::Liq], StatsWindow::All)
            .unwrap();
        let ob = stats.iter().find(|s| s.purpose == Purpose::Ob).unwrap();
        assert_eq!(ob.placed, 2);
        assert_eq!(ob.filled, 1);
        assert_eq!(ob.base_filled, dec!(1.5));
        let liq_stats = stats.iter().find(|s| s.purpose == Purpose::Liq).unwrap();
        assert_eq!(liq_stats.placed, 1);
        assert_eq!(liq_stats.filled, 0);

        let hour = ledger
            .stats_by_purpose(&pair(), &[Purpose::Ob], StatsWindow::Hour)
            .unwrap();
        assert_eq!(hour[0].placed, 2);
    }
}
