//! Market shaper
//!
//! An automated market-making and order-book-shaping agent for a single
//! spot pair: background builders create synthetic depth and standing
//! liquidity, a price watcher defends a configured band, and an operator
//! command surface drives everything through one trading-API contract.

pub mod cache;
pub mod commands;
pub mod config;
pub mod exchange;
pub mod ledger;
pub mod maker;
pub mod notify;
pub mod orders;
pub mod params;
pub mod rates;
pub mod types;

pub use config::Config;
pub use params::TradeParams;
pub use types::{Pair, Side};
