//! Error taxonomy for exchange adapters
//!
//! Every adapter call resolves to one of three classes: transient faults
//! worth retrying on the next tick, permanent rejections carrying the
//! exchange's reason, and the distinct "order id not recognized" outcome.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ExchangeError {
    /// Network failure, rate limit, 5xx or timed-out call. Safe to retry.
    #[error("transient exchange error: {0}")]
    Transient(String),

    /// The exchange refused the request (insufficient balance, precision,
    /// min-amount, self-trade prevention).
    #[error("rejected by exchange: {reason}")]
    Rejected { reason: String },

    /// Order id not recognized by the exchange.
    #[error("order not known to exchange")]
    UnknownOrder,
}

impl ExchangeError {
    pub fn transient(msg: impl Into<String>) -> Self {
        ExchangeError::Transient(msg.into())
    }

    pub fn rejected(reason: impl Into<String>) -> Self {
        ExchangeError::Rejected {
            reason: reason.into(),
        }
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, ExchangeError::Transient(_))
    }
}

impl From<reqwest::Error> for ExchangeError {
    fn from(err: reqwest::Error) -> Self {
        // Timeouts and connection drops are retryable; HTTP status errors
        // are classified by the adapter before reaching here.
        ExchangeError::Transient(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(ExchangeError::transient("503").is_transient());
        assert!(!ExchangeError::rejected("min amount").is_transient());
        assert!(!ExchangeError::UnknownOrder.is_transient());
    }
}
