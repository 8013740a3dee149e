//! Text-protocol parser
//!
//! Tokenizes operator input into structured commands. The first token is
//! the verb (a leading slash is tolerated); an inline `-y` anywhere marks
//! the command pre-confirmed. Malformed input returns a validation error
//! carrying a usage example.

use crate::ledger::StatsWindow;
use crate::orders::collector::{PriceFilter, PriceOp};
use crate::orders::Purpose;
use crate::params::{LiqTrend, Policy, PwAction, PwPolicy};
use crate::types::{Pair, Side};
use rust_decimal::Decimal;
use std::str::FromStr;
use thiserror::Error;

#[derive(Debug, Error)]
#[error("{message}. Example: {usage}")]
pub struct ValidationError {
    pub message: String,
    pub usage: &'static str,
}

impl ValidationError {
    fn new(message: impl Into<String>, usage: &'static str) -> Self {
        ValidationError {
            message: message.into(),
            usage,
        }
    }
}

/// Which subsystem an enable/disable verb addresses
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Subsystem {
    Ob,
    Liq,
    Pw,
}

/// Purposes addressed by `clear`
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClearTarget {
    Purposes(Vec<Purpose>),
    All,
    Unknown,
}

/// Price watcher source as written by the operator
#[derive(Debug, Clone, PartialEq)]
pub enum PwSourceArg {
    Numeric {
        low: Decimal,
        high: Decimal,
        currency: Option<String>,
    },
    Market {
        pair: Pair,
        exchange: String,
        deviation_percent: Decimal,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Start {
        policy: Option<Policy>,
    },
    Stop,
    EnableOb {
        count: Option<u32>,
        max_order_percent: Option<Decimal>,
    },
    EnableLiq {
        spread_percent: Decimal,
        amount1: Decimal,
        coin1: String,
        amount2: Decimal,
        coin2: String,
        trend: Option<LiqTrend>,
    },
    EnablePw {
        source: PwSourceArg,
        policy: Option<PwPolicy>,
        action: Option<PwAction>,
    },
    Disable(Subsystem),
    Amount {
        min: Decimal,
        max: Decimal,
    },
    Interval {
        min_ms: u64,
        max_ms: u64,
    },
    BuyPercent(Decimal),
    Clear {
        pair: Option<Pair>,
        target: ClearTarget,
        side: Option<Side>,
        price_filter: Option<PriceFilter>,
        force: bool,
    },
    Fill {
        pair: Option<Pair>,
        side: Side,
        quote: Option<Decimal>,
        amount: Option<Decimal>,
        low: Decimal,
        high: Decimal,
        count: u32,
    },
    Place {
        side: Side,
        pair: Option<Pair>,
        amount: Option<Decimal>,
        quote: Option<Decimal>,
        price: Option<Decimal>,
        market: bool,
    },
    MakePrice {
        price: Decimal,
    },
    Confirm,
    Rates,
    Stats {
        window: StatsWindow,
    },
    Orders {
        purpose: Option<Purpose>,
    },
    Balances,
    Params,
    Info,
    PairInfo,
    Calc {
        amount: Decimal,
        from: String,
        to: String,
    },
    Deposit {
        coin: String,
    },
    Account,
    Version,
    Help,
}

/// A parsed command plus its inline confirmation marker
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedCommand {
    pub command: Command,
    /// `-y` appeared inline: skip the confirmation prompt
    pub confirmed: bool,
}

pub fn parse(input: &str) -> Result<ParsedCommand, ValidationError> {
    let mut confirmed = false;
    let tokens: Vec<&str> = input
        .split_whitespace()
        .filter(|t| {
            if t.eq_ignore_ascii_case("-y") {
                confirmed = true;
                false
            } else {
                true
            }
        })
        .collect();

    let Some(&verb) = tokens.first() else {
        return Err(ValidationError::new("empty command", "help"));
    };
    let verb = verb.trim_start_matches('/').to_ascii_lowercase();
    let args = &tokens[1..];

    let command = match verb.as_str() {
        "start" => parse_start(args)?,
        "stop" => parse_stop(args)?,
        "enable" => parse_enable(args)?,
        "disable" => parse_disable(args)?,
        "amount" => parse_amount(args)?,
        "interval" => parse_interval(args)?,
        "buypercent" => parse_buypercent(args)?,
        "clear" => parse_clear(args)?,
        "fill" => parse_fill(args)?,
        "buy" => parse_place(Side::Buy, args)?,
        "sell" => parse_place(Side::Sell, args)?,
        "make" => parse_make(args)?,
        "y" => Command::Confirm,
        "rates" => Command::Rates,
        "stats" => Command::Stats {
            window: args
                .first()
                .map(|w| w.parse())
                .transpose()
                .map_err(|e: String| ValidationError::new(e, "stats day"))?
                .unwrap_or(StatsWindow::All),
        },
        "orders" => Command::Orders {
            purpose: match args.first() {
                None => None,
                Some(p) if p.eq_ignore_ascii_case("all") => None,
                Some(p) => Some(
                    p.parse()
                        .map_err(|e: String| ValidationError::new(e, "orders ob"))?,
                ),
            },
        },
        "balances" => Command::Balances,
        "params" => Command::Params,
        "info" => Command::Info,
        "pair" => Command::PairInfo,
        "calc" => parse_calc(args)?,
        "deposit" => Command::Deposit {
            coin: args
                .first()
                .map(|c| c.to_uppercase())
                .ok_or_else(|| ValidationError::new("deposit needs a coin", "deposit BTC"))?,
        },
        "account" => Command::Account,
        "version" => Command::Version,
        "help" => Command::Help,
        other => {
            return Err(ValidationError::new(
                format!("unknown command '{}'", other),
                "help",
            ))
        }
    };

    Ok(ParsedCommand { command, confirmed })
}

fn decimal(token: &str, usage: &'static str) -> Result<Decimal, ValidationError> {
    Decimal::from_str(token)
        .map_err(|_| ValidationError::new(format!("'{}' is not a number", token), usage))
}

/// Parses "min-max" into an ordered decimal range
fn range(token: &str, usage: &'static str) -> Result<(Decimal, Decimal), ValidationError> {
    let (low, high) = token
        .split_once('-')
        .ok_or_else(|| ValidationError::new(format!("'{}' is not a range", token), usage))?;
    let low = decimal(low, usage)?;
    let high = decimal(high, usage)?;
    if low > high {
        return Err(ValidationError::new("range bounds are reversed", usage));
    }
    Ok((low, high))
}

fn parse_start(args: &[&str]) -> Result<Command, ValidationError> {
    const USAGE: &str = "start mm optimal";
    match args {
        [module, rest @ ..] if module.eq_ignore_ascii_case("mm") => {
            let policy = rest
                .first()
                .map(|p| p.parse())
                .transpose()
                .map_err(|e: String| ValidationError::new(e, USAGE))?;
            Ok(Command::Start { policy })
        }
        _ => Err(ValidationError::new("start what?", USAGE)),
    }
}

fn parse_stop(args: &[&str]) -> Result<Command, ValidationError> {
    match args {
        [module] if module.eq_ignore_ascii_case("mm") => Ok(Command::Stop),
        _ => Err(ValidationError::new("stop what?", "stop mm")),
    }
}

fn parse_enable(args: &[&str]) -> Result<Command, ValidationError> {
    match args.first().map(|s| s.to_ascii_lowercase()).as_deref() {
        Some("ob") => parse_enable_ob(&args[1..]),
        Some("liq") => parse_enable_liq(&args[1..]),
        Some("pw") => parse_enable_pw(&args[1..]),
        _ => Err(ValidationError::new(
            "enable expects ob, liq or pw",
            "enable ob 15",
        )),
    }
}

fn parse_enable_ob(args: &[&str]) -> Result<Command, ValidationError> {
    const USAGE: &str = "enable ob 15 20%";
    let mut count = None;
    let mut max_order_percent = None;
    for token in args {
        if let Some(pct) = token.strip_suffix('%') {
            max_order_percent = Some(decimal(pct, USAGE)?);
        } else {
            count = Some(
                token
                    .parse::<u32>()
                    .map_err(|_| ValidationError::new(format!("'{}' is not a count", token), USAGE))?,
            );
        }
    }
    Ok(Command::EnableOb {
        count,
        max_order_percent,
    })
}

fn parse_enable_liq(args: &[&str]) -> Result<Command, ValidationError> {
    const USAGE: &str = "enable liq 2% 100 BTC 5000 USDT uptrend";
    if args.len() < 5 {
        return Err(ValidationError::new("liq needs spread and two amounts", USAGE));
    }
    let spread_percent = decimal(
        args[0].strip_suffix('%').unwrap_or(args[0]),
        USAGE,
    )?;
    let amount1 = decimal(args[1], USAGE)?;
    let coin1 = args[2].to_uppercase();
    let amount2 = decimal(args[3], USAGE)?;
    let coin2 = args[4].to_uppercase();
    let trend = args
        .get(5)
        .map(|t| t.parse())
        .transpose()
        .map_err(|e: String| ValidationError::new(e, USAGE))?;
    Ok(Command::EnableLiq {
        spread_percent,
        amount1,
        coin1,
        amount2,
        coin2,
        trend,
    })
}

fn parse_enable_pw(args: &[&str]) -> Result<Command, ValidationError> {
    const USAGE: &str = "enable pw 95-105 USDT strict prevent | enable pw 1.5% BTC/USDT@binance smart fill";
    let Some(&first) = args.first() else {
        return Err(ValidationError::new("pw needs a range or a deviation", USAGE));
    };

    let mut policy = None;
    let mut action = None;
    let mut tail_start;

    let source = if let Some(pct) = first.strip_suffix('%') {
        let deviation_percent = decimal(pct, USAGE)?;
        let Some(source_token) = args.get(1) else {
            return Err(ValidationError::new("market source missing", USAGE));
        };
        let (pair_text, exchange) = source_token
            .split_once('@')
            .ok_or_else(|| ValidationError::new("expected PAIR@EXCHANGE", USAGE))?;
        let pair = pair_text
            .parse::<Pair>()
            .map_err(|e| ValidationError::new(e, USAGE))?;
        tail_start = 2;
        PwSourceArg::Market {
            pair,
            exchange: exchange.to_lowercase(),
            deviation_percent,
        }
    } else {
        let (low, high) = range(first, USAGE)?;
        let mut currency = None;
        tail_start = 1;
        if let Some(token) = args.get(1) {
            if token.parse::<PwPolicy>().is_err() && token.parse::<PwAction>().is_err() {
                currency = Some(token.to_uppercase());
                tail_start = 2;
            }
        }
        PwSourceArg::Numeric {
            low,
            high,
            currency,
        }
    };

    for token in &args[tail_start.min(args.len())..] {
        if let Ok(p) = token.parse::<PwPolicy>() {
            policy = Some(p);
        } else if let Ok(a) = token.parse::<PwAction>() {
            action = Some(a);
        } else {
            return Err(ValidationError::new(
                format!("unexpected token '{}'", token),
                USAGE,
            ));
        }
    }

    Ok(Command::EnablePw {
        source,
        policy,
        action,
    })
}

fn parse_disable(args: &[&str]) -> Result<Command, ValidationError> {
    match args.first().map(|s| s.to_ascii_lowercase()).as_deref() {
        Some("ob") => Ok(Command::Disable(Subsystem::Ob)),
        Some("liq") => Ok(Command::Disable(Subsystem::Liq)),
        Some("pw") => Ok(Command::Disable(Subsystem::Pw)),
        _ => Err(ValidationError::new(
            "disable expects ob, liq or pw",
            "disable ob",
        )),
    }
}

fn parse_amount(args: &[&str]) -> Result<Command, ValidationError> {
    const USAGE: &str = "amount 0.01-0.1";
    let token = args
        .first()
        .ok_or_else(|| ValidationError::new("amount needs a range", USAGE))?;
    let (min, max) = range(token, USAGE)?;
    if min <= Decimal::ZERO {
        return Err(ValidationError::new("amounts must be positive", USAGE));
    }
    Ok(Command::Amount { min, max })
}

fn parse_interval(args: &[&str]) -> Result<Command, ValidationError> {
    const USAGE: &str = "interval 1-5 min";
    let token = args
        .first()
        .ok_or_else(|| ValidationError::new("interval needs a range", USAGE))?;
    let (min, max) = range(token, USAGE)?;
    let unit_ms: Decimal = match args.get(1).map(|u| u.to_ascii_lowercase()).as_deref() {
        Some("sec") | Some("s") => Decimal::from(1000),
        Some("min") | Some("m") => Decimal::from(60_000),
        Some("hour") | Some("h") => Decimal::from(3_600_000),
        _ => return Err(ValidationError::new("interval needs a unit", USAGE)),
    };
    use rust_decimal::prelude::ToPrimitive;
    let min_ms = (min * unit_ms).to_u64();
    let max_ms = (max * unit_ms).to_u64();
    match (min_ms, max_ms) {
        (Some(min_ms), Some(max_ms)) if min_ms > 0 => Ok(Command::Interval { min_ms, max_ms }),
        _ => Err(ValidationError::new("interval out of range", USAGE)),
    }
}

fn parse_buypercent(args: &[&str]) -> Result<Command, ValidationError> {
    const USAGE: &str = "buypercent 65";
    let token = args
        .first()
        .ok_or_else(|| ValidationError::new("buypercent needs a value", USAGE))?;
    let value = decimal(token.strip_suffix('%').unwrap_or(token), USAGE)?;
    if value < Decimal::ZERO || value > Decimal::from(100) {
        return Err(ValidationError::new("buypercent must be 0-100", USAGE));
    }
    Ok(Command::BuyPercent(value))
}

fn parse_clear(args: &[&str]) -> Result<Command, ValidationError> {
    const USAGE: &str = "clear mm sell >0.5 USDT force";
    let mut pair = None;
    let mut target = None;
    let mut side = None;
    let mut price_filter: Option<PriceFilter> = None;
    let mut force = false;

    for token in args {
        let lowered = token.to_ascii_lowercase();
        if lowered == "force" {
            force = true;
        } else if lowered == "all" {
            target = Some(ClearTarget::All);
        } else if lowered == "unk" {
            target = Some(ClearTarget::Unknown);
        } else if let Ok(parsed_side) = lowered.parse::<Side>() {
            side = Some(parsed_side);
        } else if let Some(rest) = token.strip_prefix('>') {
            price_filter = Some(PriceFilter {
                op: PriceOp::Above,
                value: decimal(rest, USAGE)?,
            });
        } else if let Some(rest) = token.strip_prefix('<') {
            price_filter = Some(PriceFilter {
                op: PriceOp::Below,
                value: decimal(rest, USAGE)?,
            });
        } else if let Ok(purpose) = lowered.parse::<Purpose>() {
            match target {
                Some(ClearTarget::Purposes(ref mut purposes)) => purposes.push(purpose),
                _ => target = Some(ClearTarget::Purposes(vec![purpose])),
            }
        } else if token.contains('/') {
            pair = Some(token.parse::<Pair>().map_err(|e| ValidationError::new(e, USAGE))?);
        } else if price_filter.is_some() && token.chars().all(|c| c.is_ascii_alphabetic()) {
            // the coin tag after a price filter, ">0.5 USDT", is decorative
        } else {
            return Err(ValidationError::new(
                format!("unexpected token '{}'", token),
                USAGE,
            ));
        }
    }

    let target = target.ok_or_else(|| {
        ValidationError::new("clear needs a purpose, 'all' or 'unk'", USAGE)
    })?;
    Ok(Command::Clear {
        pair,
        target,
        side,
        price_filter,
        force,
    })
}

/// Collects `key=value` tokens
fn keyed(args: &[&str]) -> Vec<(String, String)> {
    args.iter()
        .filter_map(|t| t.split_once('='))
        .map(|(k, v)| (k.to_ascii_lowercase(), v.to_string()))
        .collect()
}

fn parse_fill(args: &[&str]) -> Result<Command, ValidationError> {
    const USAGE: &str = "fill buy quote=100 low=95 high=105 count=5";
    let mut pair = None;
    let mut side = None;
    for token in args.iter().filter(|t| !t.contains('=')) {
        if let Ok(parsed_side) = token.parse::<Side>() {
            side = Some(parsed_side);
        } else if token.contains('/') {
            pair = Some(token.parse::<Pair>().map_err(|e| ValidationError::new(e, USAGE))?);
        }
    }
    let side = side.ok_or_else(|| ValidationError::new("fill needs buy or sell", USAGE))?;

    let mut quote = None;
    let mut amount = None;
    let mut low = None;
    let mut high = None;
    let mut count = None;
    for (key, value) in keyed(args) {
        match key.as_str() {
            "quote" => quote = Some(decimal(&value, USAGE)?),
            "amount" => amount = Some(decimal(&value, USAGE)?),
            "low" => low = Some(decimal(&value, USAGE)?),
            "high" => high = Some(decimal(&value, USAGE)?),
            "count" => {
                count = Some(value.parse::<u32>().map_err(|_| {
                    ValidationError::new(format!("'{}' is not a count", value), USAGE)
                })?)
            }
            other => {
                return Err(ValidationError::new(
                    format!("unknown key '{}'", other),
                    USAGE,
                ))
            }
        }
    }
    let (low, high) = match (low, high) {
        (Some(low), Some(high)) if low <= high => (low, high),
        (Some(_), Some(_)) => return Err(ValidationError::new("low must not exceed high", USAGE)),
        _ => return Err(ValidationError::new("fill needs low= and high=", USAGE)),
    };
    if quote.is_none() == amount.is_none() {
        return Err(ValidationError::new(
            "give exactly one of quote= or amount=",
            USAGE,
        ));
    }
    let count = count.ok_or_else(|| ValidationError::new("fill needs count=", USAGE))?;
    if count == 0 {
        return Err(ValidationError::new("count must be at least 1", USAGE));
    }

    Ok(Command::Fill {
        pair,
        side,
        quote,
        amount,
        low,
        high,
        count,
    })
}

fn parse_place(side: Side, args: &[&str]) -> Result<Command, ValidationError> {
    const USAGE: &str = "buy amount=0.1 price=100 | sell quote=500 market";
    let mut pair = None;
    let mut market = false;
    for token in args.iter().filter(|t| !t.contains('=')) {
        if token.eq_ignore_ascii_case("market") {
            market = true;
        } else if token.contains('/') {
            pair = Some(token.parse::<Pair>().map_err(|e| ValidationError::new(e, USAGE))?);
        } else {
            return Err(ValidationError::new(
                format!("unexpected token '{}'", token),
                USAGE,
            ));
        }
    }

    let mut amount = None;
    let mut quote = None;
    let mut price = None;
    for (key, value) in keyed(args) {
        match key.as_str() {
            "amount" => amount = Some(decimal(&value, USAGE)?),
            "quote" => quote = Some(decimal(&value, USAGE)?),
            "price" => price = Some(decimal(&value, USAGE)?),
            other => {
                return Err(ValidationError::new(
                    format!("unknown key '{}'", other),
                    USAGE,
                ))
            }
        }
    }

    if amount.is_none() && quote.is_none() {
        return Err(ValidationError::new(
            "give amount= or quote=",
            USAGE,
        ));
    }
    if price.is_some() && market {
        return Err(ValidationError::new(
            "market orders take no price",
            USAGE,
        ));
    }
    if price.is_none() && !market {
        return Err(ValidationError::new(
            "give price= or 'market'",
            USAGE,
        ));
    }

    Ok(Command::Place {
        side,
        pair,
        amount,
        quote,
        price,
        market,
    })
}

fn parse_make(args: &[&str]) -> Result<Command, ValidationError> {
    const USAGE: &str = "make price 1.10 USDT now";
    match args.first().map(|s| s.to_ascii_lowercase()).as_deref() {
        Some("price") => {}
        _ => return Err(ValidationError::new("make expects 'price'", USAGE)),
    }
    let token = args
        .get(1)
        .ok_or_else(|| ValidationError::new("make price needs a target", USAGE))?;
    let price = decimal(token, USAGE)?;
    Ok(Command::MakePrice { price })
}

fn parse_calc(args: &[&str]) -> Result<Command, ValidationError> {
    const USAGE: &str = "calc 0.5 BTC in USDT";
    let cleaned: Vec<&str> = args
        .iter()
        .filter(|t| !t.eq_ignore_ascii_case("in"))
        .copied()
        .collect();
    match cleaned.as_slice() {
        [amount, from, to] => Ok(Command::Calc {
            amount: decimal(amount, USAGE)?,
            from: from.to_uppercase(),
            to: to.to_uppercase(),
        }),
        _ => Err(ValidationError::new("calc needs amount and two coins", USAGE)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_verb_with_slash_and_inline_confirm() {
        let parsed = parse("/start mm spread").unwrap();
        assert_eq!(
            parsed.command,
            Command::Start {
                policy: Some(Policy::Spread)
            }
        );
        assert!(!parsed.confirmed);

        let parsed = parse("clear all -y").unwrap();
        assert!(parsed.confirmed);
    }

    #[test]
    fn test_legacy_policy_alias() {
        let parsed = parse("start mm orderbook").unwrap();
        assert_eq!(
            parsed.command,
            Command::Start {
                policy: Some(Policy::Spread)
            }
        );
    }

    #[test]
    fn test_enable_liq() {
        let parsed = parse("enable liq 2% 100 BTC 5000 USDT uptrend").unwrap();
        assert_eq!(
            parsed.command,
            Command::EnableLiq {
                spread_percent: dec!(2),
                amount1: dec!(100),
                coin1: "BTC".to_string(),
                amount2: dec!(5000),
                coin2: "USDT".to_string(),
                trend: Some(LiqTrend::Uptrend),
            }
        );
    }

    #[test]
    fn test_enable_pw_numeric_and_market() {
        let parsed = parse("enable pw 95-105 USDT strict prevent").unwrap();
        assert_eq!(
            parsed.command,
            Command::EnablePw {
                source: PwSourceArg::Numeric {
                    low: dec!(95),
                    high: dec!(105),
                    currency: Some("USDT".to_string()),
                },
                policy: Some(PwPolicy::Strict),
                action: Some(PwAction::Prevent),
            }
        );

        let parsed = parse("enable pw 1.5% BTC/USDT@binance smart fill").unwrap();
        assert_eq!(
            parsed.command,
            Command::EnablePw {
                source: PwSourceArg::Market {
                    pair: Pair::new("BTC", "USDT"),
                    exchange: "binance".to_string(),
                    deviation_percent: dec!(1.5),
                },
                policy: Some(PwPolicy::Smart),
                action: Some(PwAction::Fill),
            }
        );
    }

    #[test]
    fn test_clear_with_price_filter() {
        let parsed = parse("clear mm sell >0.5 USDT").unwrap();
        let Command::Clear {
            target,
            side,
            price_filter,
            force,
            ..
        } = parsed.command
        else {
            panic!("not a clear command");
        };
        assert_eq!(target, ClearTarget::Purposes(vec![Purpose::Mm]));
        assert_eq!(side, Some(Side::Sell));
        let filter = price_filter.unwrap();
        assert_eq!(filter.op, PriceOp::Above);
        assert_eq!(filter.value, dec!(0.5));
        assert!(!force);
    }

    #[test]
    fn test_clear_unk_force() {
        let parsed = parse("clear BTC/USDT unk force").unwrap();
        let Command::Clear {
            pair, target, force, ..
        } = parsed.command
        else {
            panic!("not a clear command");
        };
        assert_eq!(pair, Some(Pair::new("BTC", "USDT")));
        assert_eq!(target, ClearTarget::Unknown);
        assert!(force);
    }

    #[test]
    fn test_fill() {
        let parsed = parse("fill buy quote=0.01 low=100 high=110 count=5").unwrap();
        assert_eq!(
            parsed.command,
            Command::Fill {
                pair: None,
                side: Side::Buy,
                quote: Some(dec!(0.01)),
                amount: None,
                low: dec!(100),
                high: dec!(110),
                count: 5,
            }
        );

        assert!(parse("fill buy quote=1 amount=1 low=1 high=2 count=2").is_err());
        assert!(parse("fill buy quote=1 low=5 high=2 count=2").is_err());
    }

    #[test]
    fn test_place_variants() {
        let parsed = parse("buy amount=0.1 price=100").unwrap();
        assert_eq!(
            parsed.command,
            Command::Place {
                side: Side::Buy,
                pair: None,
                amount: Some(dec!(0.1)),
                quote: None,
                price: Some(dec!(100)),
                market: false,
            }
        );

        let parsed = parse("sell ETH/USDT quote=500 market").unwrap();
        assert!(matches!(
            parsed.command,
            Command::Place {
                side: Side::Sell,
                market: true,
                ..
            }
        ));

        assert!(parse("buy amount=1 price=5 market").is_err());
        assert!(parse("buy amount=1").is_err());
    }

    #[test]
    fn test_interval_units() {
        let parsed = parse("interval 1-5 min").unwrap();
        assert_eq!(
            parsed.command,
            Command::Interval {
                min_ms: 60_000,
                max_ms: 300_000,
            }
        );
        assert!(parse("interval 1-5").is_err());
    }

    #[test]
    fn test_validation_error_carries_usage() {
        let err = parse("amount nope").unwrap_err();
        assert!(err.to_string().contains("Example: amount 0.01-0.1"));

        let err = parse("frobnicate").unwrap_err();
        assert!(err.to_string().contains("unknown command"));
    }

    #[test]
    fn test_make_price() {
        let parsed = parse("make price 1.10 USDT now").unwrap();
        assert_eq!(parsed.command, Command::MakePrice { price: dec!(1.10) });
    }

    #[test]
    fn test_buypercent_bounds() {
        assert_eq!(
            parse("buypercent 65").unwrap().command,
            Command::BuyPercent(dec!(65))
        );
        assert!(parse("buypercent 130").is_err());
    }
}
