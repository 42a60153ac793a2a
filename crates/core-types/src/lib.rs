pub mod enums;
pub mod error;
pub mod structs;

// Re-export the core types to provide a clean public API.
pub use enums::{
    DecisionAction, ExchangeId, ExitReason, OrderSide, OrderStatus, PositionSide, PositionStatus,
    RiskTolerance, SignalOperation,
};
pub use error::CoreError;
pub use structs::{
    BalanceChange, Contributor, CurrencyBalance, Decision, Distribution, ExchangeCredential,
    ExecutionAttempt, InstrumentInfo, OrderAck, OrderFill, OrderRequest, Position, Settlement,
    Signal, SignalOutcome, SignalSummary, TradeReport, UserProfile, UserTradingConfig,
    quote_currency_of,
};
