use chrono::{DateTime, Utc};
use core_types::{Distribution, ExchangeId, ExitReason, Position, SignalOutcome};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Enum representing the severity of a log message for structured logging.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum LogLevel {
    Info,
    Warn,
    Error,
}

/// A free-form operational message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogMessage {
    pub timestamp: DateTime<Utc>,
    pub level: LogLevel,
    pub message: String,
}

/// A leg that failed on the exchange.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionFailed {
    pub user_id: Uuid,
    pub exchange: ExchangeId,
    pub symbol: String,
    pub code: String,
    pub message: String,
}

/// A position that reached `CLOSED` and was settled.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PositionClosed {
    pub position: Position,
    pub reason: ExitReason,
    pub distributions: Vec<Distribution>,
}

/// A closed position whose ledger update could not be written.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SettlementFailed {
    pub position_id: Uuid,
    pub user_id: Uuid,
    pub realized_pnl: Decimal,
    pub error: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserSuspended {
    pub user_id: Uuid,
    pub warnings: u32,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalProcessed {
    pub signal_id: Uuid,
    pub symbol: String,
    pub outcome: SignalOutcome,
    pub succeeded: usize,
    pub failed: usize,
}

/// Every state transition the engine announces.
///
/// Serialised with `#[serde(tag = "type", content = "payload")]`, so a closure
/// looks like `{"type": "PositionClosed", "payload": {...}}` to whatever
/// transport sits behind the notifier.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum EngineEvent {
    Log(LogMessage),
    PositionOpened(Position),
    PositionClosed(PositionClosed),
    ExecutionFailed(ExecutionFailed),
    SettlementFailed(SettlementFailed),
    UserSuspended(UserSuspended),
    SignalProcessed(SignalProcessed),
}

impl EngineEvent {
    pub fn log(level: LogLevel, message: impl Into<String>) -> Self {
        EngineEvent::Log(LogMessage {
            timestamp: Utc::now(),
            level,
            message: message.into(),
        })
    }

    /// Events an operator has to act on.
    pub fn is_critical(&self) -> bool {
        matches!(
            self,
            EngineEvent::SettlementFailed(_) | EngineEvent::UserSuspended(_)
        ) || matches!(self, EngineEvent::Log(LogMessage { level: LogLevel::Error, .. }))
    }
}
