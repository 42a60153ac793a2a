use configuration::TierConfig;
use core_types::{Decision, PositionSide, RiskTolerance, Signal, UserTradingConfig};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;

/// Limits that apply to one user, derived from their tier and risk tolerance.
/// Cheap to compute; recomputed whenever it is needed rather than stored.
#[derive(Debug, Clone, PartialEq)]
pub struct RiskProfile {
    pub tier: String,
    pub max_open_positions: usize,
    pub max_position_notional: Decimal,
    pub max_daily_volume: Decimal,
    pub max_leverage: u8,
    pub max_stop_loss_pct: Decimal,
    pub min_balance: Decimal,
    pub commission_rate: Decimal,
}

impl RiskProfile {
    /// Tier limits are ceilings. A conservative tolerance tightens them;
    /// moderate and aggressive users get the tier limits as they are.
    pub fn derive(tier: &TierConfig, tolerance: RiskTolerance) -> Self {
        let base = Self {
            tier: tier.name.clone(),
            max_open_positions: tier.max_open_positions,
            max_position_notional: tier.max_position_notional,
            max_daily_volume: tier.max_daily_volume,
            max_leverage: tier.max_leverage,
            max_stop_loss_pct: tier.max_stop_loss_pct,
            min_balance: tier.min_balance,
            commission_rate: tier.commission_rate,
        };
        match tolerance {
            RiskTolerance::Conservative => Self {
                max_open_positions: base.max_open_positions.saturating_sub(1).max(1),
                max_position_notional: base.max_position_notional * dec!(0.5),
                max_daily_volume: base.max_daily_volume * dec!(0.5),
                max_leverage: (base.max_leverage / 2).max(1),
                ..base
            },
            RiskTolerance::Moderate | RiskTolerance::Aggressive => base,
        }
    }
}

/// Stop-loss and take-profit prices for a new position.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ExitLevels {
    pub stop_loss: Decimal,
    pub take_profit: Decimal,
}

impl ExitLevels {
    /// Picks each level from the decision, then the signal, then the user's
    /// configured percentage around `entry`. Levels on the wrong side of the
    /// entry for `side` are skipped.
    pub fn resolve(
        side: PositionSide,
        entry: Decimal,
        decision: Option<&Decision>,
        signal: &Signal,
        config: &UserTradingConfig,
    ) -> Self {
        let stop_ok = |price: &Decimal| match side {
            PositionSide::Long => *price > Decimal::ZERO && *price < entry,
            PositionSide::Short => *price > entry,
        };
        let target_ok = |price: &Decimal| match side {
            PositionSide::Long => *price > entry,
            PositionSide::Short => *price > Decimal::ZERO && *price < entry,
        };

        let fallback_stop = match side {
            PositionSide::Long => entry * (Decimal::ONE - config.stop_loss_pct),
            PositionSide::Short => entry * (Decimal::ONE + config.stop_loss_pct),
        };
        let fallback_target = match side {
            PositionSide::Long => entry * (Decimal::ONE + config.take_profit_pct),
            PositionSide::Short => entry * (Decimal::ONE - config.take_profit_pct),
        };

        let stop_loss = [decision.and_then(|d| d.stop_loss), signal.stop_loss]
            .into_iter()
            .flatten()
            .find(stop_ok)
            .unwrap_or(fallback_stop);
        let take_profit = [decision.and_then(|d| d.take_profit), signal.take_profit]
            .into_iter()
            .flatten()
            .find(target_ok)
            .unwrap_or(fallback_target);

        Self {
            stop_loss,
            take_profit,
        }
    }

    /// Distance from entry to the stop, as a fraction of entry.
    pub fn stop_distance_pct(&self, entry: Decimal) -> Decimal {
        if entry.is_zero() {
            return Decimal::ZERO;
        }
        ((entry - self.stop_loss) / entry).abs()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use core_types::{DecisionAction, SignalOperation};
    use uuid::Uuid;

    fn tier() -> TierConfig {
        TierConfig {
            name: "standard".into(),
            priority: 2,
            delay_ms: 1000,
            commission_rate: dec!(0.15),
            max_open_positions: 3,
            max_position_notional: dec!(10000),
            max_daily_volume: dec!(50000),
            max_leverage: 10,
            max_stop_loss_pct: dec!(0.05),
            min_balance: dec!(10),
        }
    }

    fn signal(stop_loss: Option<Decimal>) -> Signal {
        Signal {
            id: Uuid::new_v4(),
            symbol: "ETHUSDT".into(),
            operation: SignalOperation::OpenLong,
            price: dec!(2000),
            exchange: None,
            stop_loss,
            take_profit: None,
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn conservative_tolerance_tightens_tier_limits() {
        let profile = RiskProfile::derive(&tier(), RiskTolerance::Conservative);
        assert_eq!(profile.max_open_positions, 2);
        assert_eq!(profile.max_position_notional, dec!(5000));
        assert_eq!(profile.max_leverage, 5);

        let profile = RiskProfile::derive(&tier(), RiskTolerance::Aggressive);
        assert_eq!(profile.max_open_positions, 3);
        assert_eq!(profile.max_leverage, 10);
    }

    #[test]
    fn decision_levels_win_over_signal_and_config() {
        let decision = Decision {
            action: DecisionAction::Buy,
            confidence: dec!(80),
            stop_loss: Some(dec!(1950)),
            take_profit: None,
            cooldown_minutes: 120,
            reasoning: None,
        };
        let levels = ExitLevels::resolve(
            PositionSide::Long,
            dec!(2000),
            Some(&decision),
            &signal(Some(dec!(1900))),
            &UserTradingConfig::default(),
        );
        assert_eq!(levels.stop_loss, dec!(1950));
        // No target anywhere: 4% above entry.
        assert_eq!(levels.take_profit, dec!(2080));
        assert_eq!(levels.stop_distance_pct(dec!(2000)), dec!(0.025));
    }

    #[test]
    fn wrong_side_levels_are_skipped() {
        let levels = ExitLevels::resolve(
            PositionSide::Short,
            dec!(2000),
            None,
            &signal(Some(dec!(1900))),
            &UserTradingConfig::default(),
        );
        assert_eq!(levels.stop_loss, dec!(2040));
        assert_eq!(levels.take_profit, dec!(1920));
    }
}
