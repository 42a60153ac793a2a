use chrono::Duration;
use core_types::PositionSide;
use rust_decimal::Decimal;
use thiserror::Error;

/// Why a user was not admitted for a signal. Rejections are per-user results,
/// never faults: other users keep going.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum AdmissionRejection {
    #[error("Signal is {age_secs}s old; the validity window is {max_secs}s")]
    SignalExpired { age_secs: i64, max_secs: i64 },

    #[error("User is not eligible to trade: {0}")]
    UserIneligible(String),

    #[error("User is suspended pending manual review")]
    UserSuspended,

    #[error("Cooldown active on {symbol} for another {remaining_minutes} min")]
    CooldownActive { symbol: String, remaining_minutes: i64 },

    #[error("Open position cap reached ({open} of {max})")]
    PositionCapReached { open: usize, max: usize },

    #[error("A {side} position on {symbol} is already open")]
    DuplicatePosition { symbol: String, side: PositionSide },

    #[error("Insufficient balance: {0}")]
    InsufficientBalance(String),

    #[error("Daily volume limit exceeded: {used} used, {requested} requested, {limit} allowed")]
    DailyVolumeExceeded { used: Decimal, requested: Decimal, limit: Decimal },

    #[error("Leverage {requested}x exceeds the allowed {max}x")]
    LeverageExceeded { requested: u8, max: u8 },

    #[error("Stop-loss distance {distance_pct} exceeds the allowed {max_pct}")]
    StopLossExceeded { distance_pct: Decimal, max_pct: Decimal },
}

impl AdmissionRejection {
    pub fn category(&self) -> &'static str {
        match self {
            AdmissionRejection::SignalExpired { .. } => "SIGNAL_EXPIRED",
            AdmissionRejection::UserIneligible(_) => "USER_INELIGIBLE",
            AdmissionRejection::UserSuspended => "USER_SUSPENDED",
            AdmissionRejection::CooldownActive { .. } => "COOLDOWN_ACTIVE",
            AdmissionRejection::PositionCapReached { .. } => "POSITION_CAP_REACHED",
            AdmissionRejection::DuplicatePosition { .. } => "DUPLICATE_POSITION",
            AdmissionRejection::InsufficientBalance(_) => "INSUFFICIENT_BALANCE",
            AdmissionRejection::DailyVolumeExceeded { .. } => "DAILY_VOLUME_EXCEEDED",
            AdmissionRejection::LeverageExceeded { .. } => "LEVERAGE_EXCEEDED",
            AdmissionRejection::StopLossExceeded { .. } => "STOP_LOSS_EXCEEDED",
        }
    }

    /// Risk-bound violations count towards the user's warning threshold.
    /// Timing and state rejections (expiry, cooldown, capacity) do not.
    pub fn is_violation(&self) -> bool {
        matches!(
            self,
            AdmissionRejection::InsufficientBalance(_)
                | AdmissionRejection::DailyVolumeExceeded { .. }
                | AdmissionRejection::LeverageExceeded { .. }
                | AdmissionRejection::StopLossExceeded { .. }
        )
    }

    pub(crate) fn cooldown(symbol: &str, remaining: Duration) -> Self {
        // Round up so "0 min remaining" is never reported.
        let minutes = (remaining.num_seconds() + 59) / 60;
        AdmissionRejection::CooldownActive {
            symbol: symbol.to_string(),
            remaining_minutes: minutes,
        }
    }
}
