//! Core data types used across the agent

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// A spot trading pair, e.g. `BTC/USDT`
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Pair {
    pub base: String,
    pub quote: String,
}

impl Pair {
    pub fn new(base: impl Into<String>, quote: impl Into<String>) -> Self {
        Pair {
            base: base.into().to_uppercase(),
            quote: quote.into().to_uppercase(),
        }
    }

    /// Exchange wire format without separator, e.g. `BTCUSDT`
    pub fn symbol(&self) -> String {
        format!("{}{}", self.base, self.quote)
    }
}

impl fmt::Display for Pair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.base, self.quote)
    }
}

impl FromStr for Pair {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (base, quote) = s
            .split_once(['/', '_', '-'])
            .ok_or_else(|| format!("invalid pair '{}', expected BASE/QUOTE", s))?;
        if base.is_empty() || quote.is_empty() {
            return Err(format!("invalid pair '{}', expected BASE/QUOTE", s));
        }
        Ok(Pair::new(base, quote))
    }
}

/// Trade direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    pub fn opposite(self) -> Side {
        match self {
            Side::Buy => Side::Sell,
            Side::Sell => Side::Buy,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Side::Buy => "buy",
            Side::Sell => "sell",
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Side {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "buy" | "bid" => Ok(Side::Buy),
            "sell" | "ask" => Ok(Side::Sell),
            other => Err(format!("invalid side '{}'", other)),
        }
    }
}

/// Round a price down to the market's tick
pub fn round_to_tick(price: Decimal, tick: Decimal) -> Decimal {
    if tick.is_zero() {
        return price;
    }
    (price / tick).floor() * tick
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_pair_parse_and_display() {
        let pair: Pair = "btc/usdt".parse().unwrap();
        assert_eq!(pair.base, "BTC");
        assert_eq!(pair.quote, "USDT");
        assert_eq!(pair.to_string(), "BTC/USDT");
        assert_eq!(pair.symbol(), "BTCUSDT");

        assert!("BTCUSDT".parse::<Pair>().is_err());
        assert!("/USDT".parse::<Pair>().is_err());
    }

    #[test]
    fn test_side_roundtrip() {
        assert_eq!("buy".parse::<Side>().unwrap(), Side::Buy);
        assert_eq!("SELL".parse::<Side>().unwrap(), Side::Sell);
        assert_eq!(Side::Buy.opposite(), Side::Sell);
    }

    #[test]
    fn test_round_to_tick() {
        assert_eq!(round_to_tick(dec!(100.057), dec!(0.01)), dec!(100.05));
        assert_eq!(round_to_tick(dec!(100.05), dec!(0)), dec!(100.05));
    }
}
