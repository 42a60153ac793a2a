use api_client::error::ApiError;
use core_types::ExchangeId;
use rust_decimal::Decimal;
use thiserror::Error;

/// Why one (user, exchange) leg did not produce a usable fill.
#[derive(Error, Debug)]
pub enum ExecutorError {
    #[error("{0} is not enabled for this user")]
    ExchangeNotEnabled(ExchangeId),

    #[error("User has no enabled exchange")]
    NoExchangesEnabled,

    #[error("Not enough balance to open a position. Required notional: {required}, available: {available}")]
    InsufficientBalance { required: Decimal, available: Decimal },

    #[error("Quantity {quantity} is below the exchange minimum {min_qty}")]
    BelowMinimumQuantity { quantity: Decimal, min_qty: Decimal },

    #[error("Invalid instrument metadata for {symbol}: {reason}")]
    InvalidInstrument { symbol: String, reason: String },

    #[error("Invalid reference price {0}")]
    InvalidPrice(Decimal),

    #[error("Order rejected: {0}")]
    OrderRejected(String),

    #[error("Order {order_id} was not filled within {millis} ms")]
    FillTimeout {
        order_id: String,
        millis: u128,
        filled_qty: Decimal,
    },

    #[error("Order {order_id} filled {fill_pct}% which is below the accepted minimum")]
    PartialFillBelowThreshold {
        order_id: String,
        fill_pct: Decimal,
        filled_qty: Decimal,
        avg_price: Decimal,
    },

    #[error("API error: {0}")]
    Api(#[from] ApiError),
}

impl ExecutorError {
    /// Machine-readable code reported in trade summaries and execution records.
    pub fn code(&self) -> &'static str {
        match self {
            ExecutorError::ExchangeNotEnabled(_) => "EXCHANGE_NOT_ENABLED",
            ExecutorError::NoExchangesEnabled => "NO_EXCHANGES_ENABLED",
            ExecutorError::InsufficientBalance { .. } => "INSUFFICIENT_BALANCE",
            ExecutorError::BelowMinimumQuantity { .. } => "BELOW_MINIMUM_QUANTITY",
            ExecutorError::InvalidInstrument { .. } => "INVALID_INSTRUMENT",
            ExecutorError::InvalidPrice(_) => "INVALID_PRICE",
            ExecutorError::OrderRejected(_) | ExecutorError::Api(ApiError::OrderRejected(_)) => {
                "ORDER_REJECTED"
            }
            ExecutorError::FillTimeout { .. } => "FILL_TIMEOUT",
            ExecutorError::PartialFillBelowThreshold { .. } => "PARTIAL_FILL_BELOW_THRESHOLD",
            ExecutorError::Api(ApiError::Timeout { .. }) => "EXCHANGE_TIMEOUT",
            ExecutorError::Api(ApiError::Authentication(_)) => "CREDENTIALS_INVALID",
            ExecutorError::Api(e) if e.is_transient() => "EXCHANGE_UNAVAILABLE",
            ExecutorError::Api(_) => "EXCHANGE_ERROR",
        }
    }

    /// Quantity (and average price, when known) that filled on an order that was
    /// then given up on. That quantity is live on the exchange.
    pub fn partial_fill(&self) -> Option<(Decimal, Option<Decimal>)> {
        match self {
            ExecutorError::FillTimeout { filled_qty, .. } if *filled_qty > Decimal::ZERO => {
                Some((*filled_qty, None))
            }
            ExecutorError::PartialFillBelowThreshold {
                filled_qty,
                avg_price,
                ..
            } if *filled_qty > Decimal::ZERO => Some((*filled_qty, Some(*avg_price))),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn codes_are_stable() {
        let err = ExecutorError::BelowMinimumQuantity {
            quantity: dec!(0),
            min_qty: dec!(0.001),
        };
        assert_eq!(err.code(), "BELOW_MINIMUM_QUANTITY");
        assert_eq!(
            ExecutorError::from(ApiError::Unavailable("down".into())).code(),
            "EXCHANGE_UNAVAILABLE"
        );
        assert_eq!(
            ExecutorError::from(ApiError::OrderRejected("margin".into())).code(),
            "ORDER_REJECTED"
        );
    }

    #[test]
    fn only_fill_failures_with_quantity_report_a_partial_fill() {
        let nothing = ExecutorError::FillTimeout {
            order_id: "1".into(),
            millis: 10_000,
            filled_qty: dec!(0),
        };
        assert_eq!(nothing.partial_fill(), None);
        let partial = ExecutorError::PartialFillBelowThreshold {
            order_id: "1".into(),
            fill_pct: dec!(30),
            filled_qty: dec!(0.006),
            avg_price: dec!(50000),
        };
        assert_eq!(partial.partial_fill(), Some((dec!(0.006), Some(dec!(50000)))));
        assert_eq!(ExecutorError::OrderRejected("x".into()).partial_fill(), None);
    }
}
