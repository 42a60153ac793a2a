use crate::enums::{
    DecisionAction, ExchangeId, ExitReason, OrderSide, OrderStatus, PositionSide, PositionStatus,
    RiskTolerance, SignalOperation,
};
use crate::error::CoreError;
use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

// ==============================================================================
// Inputs
// ==============================================================================

/// An inbound trading signal. Immutable once received.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Signal {
    #[serde(default = "Uuid::new_v4")]
    pub id: Uuid,
    pub symbol: String,
    pub operation: SignalOperation,
    /// The reference price the signal source saw when it fired.
    pub price: Decimal,
    #[serde(default)]
    pub exchange: Option<ExchangeId>,
    #[serde(default)]
    pub stop_loss: Option<Decimal>,
    #[serde(default)]
    pub take_profit: Option<Decimal>,
    /// Arrival time. Stamped on receipt when the source leaves it out.
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
}

impl Signal {
    /// How long ago the signal arrived, relative to `now`.
    pub fn age(&self, now: DateTime<Utc>) -> Duration {
        now - self.timestamp
    }

    /// Splits the quote currency off the symbol (`BTCUSDT` -> `USDT`).
    pub fn quote_currency(&self, known_quotes: &[String]) -> Result<String, CoreError> {
        quote_currency_of(&self.symbol, known_quotes)
    }
}

/// The first of `known_quotes` that `symbol` ends with, leaving a non-empty base.
pub fn quote_currency_of(symbol: &str, known_quotes: &[String]) -> Result<String, CoreError> {
    known_quotes
        .iter()
        .find(|q| symbol.len() > q.len() && symbol.ends_with(q.as_str()))
        .cloned()
        .ok_or_else(|| CoreError::InvalidInput("symbol".into(), symbol.to_string()))
}

fn default_cooldown_minutes() -> u32 {
    120
}

/// The output of the decision oracle for one signal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Decision {
    pub action: DecisionAction,
    /// 0 to 100.
    pub confidence: Decimal,
    #[serde(default)]
    pub stop_loss: Option<Decimal>,
    #[serde(default)]
    pub take_profit: Option<Decimal>,
    /// How long a successful execution on the same symbol blocks new entries.
    #[serde(default = "default_cooldown_minutes")]
    pub cooldown_minutes: u32,
    #[serde(default)]
    pub reasoning: Option<String>,
}

impl Decision {
    pub fn hold(reason: impl Into<String>) -> Self {
        Self {
            action: DecisionAction::Hold,
            confidence: Decimal::ZERO,
            stop_loss: None,
            take_profit: None,
            cooldown_minutes: default_cooldown_minutes(),
            reasoning: Some(reason.into()),
        }
    }

    pub fn cooldown(&self) -> Duration {
        Duration::minutes(i64::from(self.cooldown_minutes))
    }
}

// ==============================================================================
// Users
// ==============================================================================

#[derive(Clone, PartialEq, Serialize, Deserialize)]
pub struct ExchangeCredential {
    pub exchange: ExchangeId,
    pub api_key: String,
    pub api_secret: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub testnet: bool,
}

fn default_true() -> bool {
    true
}

impl fmt::Debug for ExchangeCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExchangeCredential")
            .field("exchange", &self.exchange)
            .field("api_key", &self.api_key)
            .field("api_secret", &"<redacted>")
            .field("enabled", &self.enabled)
            .field("testnet", &self.testnet)
            .finish()
    }
}

/// Operational balance in one currency: real funds plus administrative credit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CurrencyBalance {
    pub currency: String,
    pub real: Decimal,
    #[serde(default)]
    pub credit: Decimal,
}

impl CurrencyBalance {
    pub fn total(&self) -> Decimal {
        self.real + self.credit
    }
}

/// Per-user execution settings. Every field has a documented default.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UserTradingConfig {
    /// Leverage applied on the exchange. Default 1.
    pub leverage: u8,
    /// Stop distance used when neither the decision nor the signal carries one. Default 2%.
    pub stop_loss_pct: Decimal,
    /// Target distance used when neither the decision nor the signal carries one. Default 4%.
    pub take_profit_pct: Decimal,
    /// Fraction of the exchange balance committed per position. Default 10%.
    pub position_size_pct: Decimal,
    /// Upper bound on exchanges traded at once for one signal. Default 2.
    pub max_simultaneous_exchanges: usize,
}

impl Default for UserTradingConfig {
    fn default() -> Self {
        Self {
            leverage: 1,
            stop_loss_pct: dec!(0.02),
            take_profit_pct: dec!(0.04),
            position_size_pct: dec!(0.10),
            max_simultaneous_exchanges: 2,
        }
    }
}

impl UserTradingConfig {
    pub fn validate(&self) -> Result<(), CoreError> {
        if self.leverage == 0 || self.leverage > 125 {
            return Err(CoreError::InvalidTradingConfig(format!(
                "leverage must be within 1..=125, got {}",
                self.leverage
            )));
        }
        for (name, value) in [
            ("stop_loss_pct", self.stop_loss_pct),
            ("take_profit_pct", self.take_profit_pct),
            ("position_size_pct", self.position_size_pct),
        ] {
            if value <= Decimal::ZERO || value > Decimal::ONE {
                return Err(CoreError::InvalidTradingConfig(format!(
                    "{name} must be within (0, 1], got {value}"
                )));
            }
        }
        if self.max_simultaneous_exchanges == 0 {
            return Err(CoreError::InvalidTradingConfig(
                "max_simultaneous_exchanges must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

/// The account-system view of a user, as far as the engine needs it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserProfile {
    pub id: Uuid,
    pub tier: String,
    #[serde(default)]
    pub risk_tolerance: RiskTolerance,
    pub subscription_active: bool,
    #[serde(default)]
    pub subscription_expires_at: Option<DateTime<Utc>>,
    pub trading_enabled: bool,
    #[serde(default)]
    pub trading_suspended: bool,
    #[serde(default)]
    pub credentials: Vec<ExchangeCredential>,
    #[serde(default)]
    pub balances: Vec<CurrencyBalance>,
    #[serde(default)]
    pub trading: UserTradingConfig,
}

impl UserProfile {
    pub fn has_active_subscription(&self, now: DateTime<Utc>) -> bool {
        self.subscription_active && self.subscription_expires_at.is_none_or(|expires| expires > now)
    }

    /// Real plus credit balance in `currency`, zero when the user holds none.
    pub fn operational_balance(&self, currency: &str) -> Decimal {
        self.balances
            .iter()
            .find(|b| b.currency == currency)
            .map(CurrencyBalance::total)
            .unwrap_or(Decimal::ZERO)
    }

    pub fn enabled_exchanges(&self) -> Vec<ExchangeId> {
        self.credentials
            .iter()
            .filter(|c| c.enabled)
            .map(|c| c.exchange)
            .collect()
    }

    pub fn credential(&self, exchange: ExchangeId) -> Option<&ExchangeCredential> {
        self.credentials.iter().find(|c| c.exchange == exchange && c.enabled)
    }
}

// ==============================================================================
// Positions and the audit trail
// ==============================================================================

/// A position opened by the engine on behalf of a user.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub id: Uuid,
    pub user_id: Uuid,
    pub symbol: String,
    pub side: PositionSide,
    pub exchange: ExchangeId,
    pub entry_price: Decimal,
    pub quantity: Decimal,
    /// Quote-currency value at entry.
    pub notional: Decimal,
    pub leverage: u8,
    pub status: PositionStatus,
    pub stop_loss: Option<Decimal>,
    pub take_profit: Option<Decimal>,
    pub entry_time: DateTime<Utc>,
    /// Last price recorded by the lifecycle monitor.
    pub current_price: Decimal,
    pub unrealized_pnl: Decimal,
    /// Largest favourable excursion seen, as a fraction of entry.
    pub max_profit_pct: Decimal,
    /// Largest adverse excursion seen, as a positive fraction of entry.
    pub max_drawdown_pct: Decimal,
    pub exit_price: Option<Decimal>,
    pub exit_time: Option<DateTime<Utc>>,
    pub exit_reason: Option<ExitReason>,
    /// Final P&L once closed. While open, what partial closes have realized so far.
    pub realized_pnl: Option<Decimal>,
    pub commission: Option<Decimal>,
}

impl Position {
    /// P&L of the whole position if it were closed at `price`, signed by side.
    pub fn pnl_at(&self, price: Decimal) -> Decimal {
        match self.side {
            PositionSide::Long => (price - self.entry_price) * self.quantity,
            PositionSide::Short => (self.entry_price - price) * self.quantity,
        }
    }

    /// Price move relative to entry in the position's favour (negative when adverse).
    pub fn return_pct_at(&self, price: Decimal) -> Decimal {
        if self.entry_price.is_zero() {
            return Decimal::ZERO;
        }
        let raw = (price - self.entry_price) / self.entry_price;
        match self.side {
            PositionSide::Long => raw,
            PositionSide::Short => -raw,
        }
    }

    pub fn is_open(&self) -> bool {
        self.status == PositionStatus::Open
    }

    /// The position left after `closed_qty` of it was closed at `price`. Quantity
    /// and notional shrink pro rata and the closed part's P&L is added to
    /// `realized_pnl`.
    pub fn after_partial_close(&self, closed_qty: Decimal, price: Decimal) -> Position {
        let closed_qty = closed_qty.clamp(Decimal::ZERO, self.quantity);
        let closed_part = Position {
            quantity: closed_qty,
            ..self.clone()
        };

        let mut rest = self.clone();
        rest.quantity = self.quantity - closed_qty;
        rest.notional = if self.quantity.is_zero() {
            Decimal::ZERO
        } else {
            self.notional * rest.quantity / self.quantity
        };
        rest.realized_pnl = Some(self.realized_pnl.unwrap_or_default() + closed_part.pnl_at(price));
        rest.unrealized_pnl = rest.pnl_at(rest.current_price);
        rest
    }
}

/// One order placement outcome. Append-only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionAttempt {
    pub id: Uuid,
    pub user_id: Uuid,
    pub position_id: Option<Uuid>,
    pub signal_id: Option<Uuid>,
    pub exchange: ExchangeId,
    pub symbol: String,
    pub side: OrderSide,
    pub reduce_only: bool,
    pub requested_qty: Decimal,
    pub filled_qty: Decimal,
    pub requested_price: Decimal,
    pub avg_price: Option<Decimal>,
    pub slippage: Option<Decimal>,
    pub order_id: Option<String>,
    pub success: bool,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl ExecutionAttempt {
    pub fn filled_notional(&self) -> Decimal {
        self.avg_price.map(|p| p * self.filled_qty).unwrap_or(Decimal::ZERO)
    }
}

/// A party that funded part of a position.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Contributor {
    pub user_id: Uuid,
    pub contributed: Decimal,
    /// Commission rate of the contributor's tier, as a fraction.
    pub commission_rate: Decimal,
}

/// One contributor's share of a closed position's P&L. Immutable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Distribution {
    pub id: Uuid,
    pub position_id: Uuid,
    pub user_id: Uuid,
    pub contributed: Decimal,
    /// Percentage points, e.g. 70 for 70%.
    pub share_pct: Decimal,
    pub raw_pnl: Decimal,
    pub commission: Decimal,
    pub net_pnl: Decimal,
    pub created_at: DateTime<Utc>,
}

/// An audit entry for a change applied to a user's balance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BalanceChange {
    pub id: Uuid,
    pub user_id: Uuid,
    pub position_id: Option<Uuid>,
    pub currency: String,
    pub amount: Decimal,
    pub reason: String,
    pub created_at: DateTime<Utc>,
}

/// Everything written atomically when a position is settled.
#[derive(Debug, Clone, PartialEq)]
pub struct Settlement {
    /// The position in its final, closed state.
    pub position: Position,
    pub distributions: Vec<Distribution>,
    pub balance_changes: Vec<BalanceChange>,
}

// ==============================================================================
// Exchange-facing types
// ==============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderRequest {
    pub client_order_id: Uuid,
    pub symbol: String,
    pub side: OrderSide,
    pub quantity: Decimal,
    pub reduce_only: bool,
    /// The price the engine sized the order against. Only simulated venues use it.
    pub expected_price: Option<Decimal>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderAck {
    pub order_id: String,
    pub accepted: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderFill {
    pub order_id: String,
    pub status: OrderStatus,
    pub filled_qty: Decimal,
    pub avg_price: Option<Decimal>,
}

/// Lot-size rules for one instrument.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstrumentInfo {
    pub symbol: String,
    pub min_qty: Decimal,
    pub max_qty: Decimal,
    pub qty_step: Decimal,
}

// ==============================================================================
// Results returned to the caller
// ==============================================================================

/// One line of the per-signal summary: a leg, a closure, or a rejection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TradeReport {
    pub user_id: Uuid,
    pub exchange: Option<ExchangeId>,
    pub success: bool,
    pub order_id: Option<String>,
    pub filled_qty: Option<Decimal>,
    pub slippage: Option<Decimal>,
    /// Machine-readable failure code, e.g. `COOLDOWN_ACTIVE`.
    pub category: Option<String>,
    pub message: String,
}

impl TradeReport {
    pub fn rejected(user_id: Uuid, category: &str, message: impl Into<String>) -> Self {
        Self {
            user_id,
            exchange: None,
            success: false,
            order_id: None,
            filled_qty: None,
            slippage: None,
            category: Some(category.to_string()),
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SignalOutcome {
    /// Users were dispatched; see the trade reports.
    Processed,
    /// The oracle answered HOLD (or too little confidence); nothing was executed.
    Held,
    /// The signal was older than the validity window.
    #[serde(rename = "SIGNAL_EXPIRED")]
    Expired,
}

/// What the engine reports back for one signal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignalSummary {
    pub signal_id: Uuid,
    pub outcome: SignalOutcome,
    pub decision: Option<Decision>,
    pub total_eligible_users: usize,
    pub executed_trades: Vec<TradeReport>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn position(side: PositionSide) -> Position {
        Position {
            id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
            symbol: "BTCUSDT".into(),
            side,
            exchange: ExchangeId::Paper,
            entry_price: dec!(100),
            quantity: dec!(2),
            notional: dec!(200),
            leverage: 1,
            status: PositionStatus::Open,
            stop_loss: None,
            take_profit: None,
            entry_time: Utc::now(),
            current_price: dec!(100),
            unrealized_pnl: Decimal::ZERO,
            max_profit_pct: Decimal::ZERO,
            max_drawdown_pct: Decimal::ZERO,
            exit_price: None,
            exit_time: None,
            exit_reason: None,
            realized_pnl: None,
            commission: None,
        }
    }

    #[test]
    fn pnl_is_signed_by_side() {
        assert_eq!(position(PositionSide::Long).pnl_at(dec!(110)), dec!(20));
        assert_eq!(position(PositionSide::Short).pnl_at(dec!(110)), dec!(-20));
        assert_eq!(position(PositionSide::Short).return_pct_at(dec!(90)), dec!(0.1));
    }

    #[test]
    fn partial_close_shrinks_the_position_and_banks_its_pnl() {
        let long = position(PositionSide::Long);
        let rest = long.after_partial_close(dec!(1.5), dec!(110));
        assert_eq!(rest.quantity, dec!(0.5));
        assert_eq!(rest.notional, dec!(50));
        assert_eq!(rest.realized_pnl, Some(dec!(15)));

        let rest = rest.after_partial_close(dec!(0.25), dec!(90));
        assert_eq!(rest.quantity, dec!(0.25));
        assert_eq!(rest.realized_pnl, Some(dec!(12.5)));
    }

    #[test]
    fn quote_currency_is_split_from_symbol() {
        let quotes = vec!["USDT".to_string(), "USDC".to_string()];
        let mut signal = Signal {
            id: Uuid::new_v4(),
            symbol: "ETHUSDC".into(),
            operation: SignalOperation::OpenLong,
            price: dec!(3000),
            exchange: None,
            stop_loss: None,
            take_profit: None,
            timestamp: Utc::now(),
        };
        assert_eq!(signal.quote_currency(&quotes).unwrap(), "USDC");
        signal.symbol = "USDT".into();
        assert!(signal.quote_currency(&quotes).is_err());
    }

    #[test]
    fn signal_parses_wire_format() {
        let json = r#"{"symbol":"BTCUSDT","operation":"OPEN_SHORT","price":"64000.5","exchange":"bybit","timestamp":"2024-05-01T12:00:00Z"}"#;
        let signal: Signal = serde_json::from_str(json).unwrap();
        assert_eq!(signal.operation, SignalOperation::OpenShort);
        assert_eq!(signal.exchange, Some(ExchangeId::Bybit));
        assert!(signal.stop_loss.is_none());

        let before = Utc::now();
        let unstamped: Signal =
            serde_json::from_str(r#"{"symbol":"BTCUSDT","operation":"CLOSE_LONG","price":"1"}"#).unwrap();
        assert!(unstamped.timestamp >= before);
    }

    #[test]
    fn trading_config_rejects_out_of_range_values() {
        let mut config = UserTradingConfig::default();
        assert!(config.validate().is_ok());
        config.position_size_pct = dec!(1.5);
        assert!(config.validate().is_err());
    }

    #[test]
    fn expired_subscription_is_inactive() {
        let now = Utc::now();
        let user = UserProfile {
            id: Uuid::new_v4(),
            tier: "trial".into(),
            risk_tolerance: RiskTolerance::Moderate,
            subscription_active: true,
            subscription_expires_at: Some(now - Duration::days(1)),
            trading_enabled: true,
            trading_suspended: false,
            credentials: vec![],
            balances: vec![],
            trading: UserTradingConfig::default(),
        };
        assert!(!user.has_active_subscription(now));
    }
}
