use crate::error::AdmissionRejection;
use crate::profile::{ExitLevels, RiskProfile};
use chrono::{DateTime, Duration, Utc};
use configuration::AdmissionSettings;
use core_types::{Decision, Position, PositionSide, Signal, UserProfile};
use rust_decimal::Decimal;
use std::collections::HashSet;

/// Per-user state read from the store immediately before admission.
#[derive(Debug, Clone, Default)]
pub struct AdmissionState {
    /// All of the user's open positions.
    pub open_positions: Vec<Position>,
    /// Most recent successful opening execution for (user, symbol).
    pub last_execution_at: Option<DateTime<Utc>>,
    /// Filled notional of successful opening executions over the last 24 h.
    pub daily_volume: Decimal,
}

/// One candidate trade to check.
#[derive(Debug, Clone, Copy)]
pub struct Candidate<'a> {
    pub signal: &'a Signal,
    pub decision: &'a Decision,
    pub side: PositionSide,
    pub user: &'a UserProfile,
    pub profile: &'a RiskProfile,
    pub quote_currency: &'a str,
    pub now: DateTime<Utc>,
}

/// A passed admission. `reversals` holds the opposite-side positions (one per
/// exchange leg) that have to be closed before the new one is opened.
#[derive(Debug, Clone, PartialEq)]
pub struct Approval {
    pub reversals: Vec<Position>,
    pub levels: ExitLevels,
    /// The notional the orchestrator will aim for, before exchange balances are known.
    pub planned_notional: Decimal,
}

#[derive(Debug, Clone)]
pub struct AdmissionController {
    signal_validity: Duration,
    min_notional: Decimal,
}

impl AdmissionController {
    pub fn new(settings: &AdmissionSettings, signal_validity: Duration) -> Self {
        Self {
            signal_validity,
            min_notional: settings.min_notional,
        }
    }

    /// Freshness on its own, so stale signals can be dropped before anything else runs.
    pub fn check_freshness(&self, signal: &Signal, now: DateTime<Utc>) -> Result<(), AdmissionRejection> {
        let age = signal.age(now);
        if age > self.signal_validity {
            return Err(AdmissionRejection::SignalExpired {
                age_secs: age.num_seconds(),
                max_secs: self.signal_validity.num_seconds(),
            });
        }
        Ok(())
    }

    /// Runs every check in order and stops at the first failure.
    pub fn evaluate(
        &self,
        candidate: &Candidate<'_>,
        state: &AdmissionState,
    ) -> Result<Approval, AdmissionRejection> {
        let Candidate {
            signal,
            decision,
            side,
            user,
            profile,
            quote_currency,
            now,
        } = *candidate;

        // 1. Freshness.
        self.check_freshness(signal, now)?;

        // 2. Eligibility.
        if !user.has_active_subscription(now) {
            return Err(AdmissionRejection::UserIneligible("no active subscription".into()));
        }
        if !user.trading_enabled {
            return Err(AdmissionRejection::UserIneligible("trading is disabled".into()));
        }
        if user.trading_suspended {
            return Err(AdmissionRejection::UserSuspended);
        }

        // 3. Cooldown.
        if let Some(last) = state.last_execution_at {
            let until = last + decision.cooldown();
            if now < until {
                return Err(AdmissionRejection::cooldown(&signal.symbol, until - now));
            }
        }

        // 4. Capacity, duplicates, reversal. Legs of one (symbol, side) on several
        // exchanges count as a single position.
        let open = state
            .open_positions
            .iter()
            .filter(|p| p.is_open())
            .map(|p| (p.symbol.as_str(), p.side))
            .collect::<HashSet<_>>()
            .len();
        if open >= profile.max_open_positions {
            return Err(AdmissionRejection::PositionCapReached {
                open,
                max: profile.max_open_positions,
            });
        }
        let on_symbol = |s: PositionSide| {
            state
                .open_positions
                .iter()
                .filter(move |p| p.symbol == signal.symbol && p.side == s && p.is_open())
        };
        if on_symbol(side).next().is_some() {
            return Err(AdmissionRejection::DuplicatePosition {
                symbol: signal.symbol.clone(),
                side,
            });
        }
        let reversals: Vec<Position> = on_symbol(side.opposite()).cloned().collect();

        // 5. Balance and volume.
        let balance = user.operational_balance(quote_currency);
        if balance < profile.min_balance {
            return Err(AdmissionRejection::InsufficientBalance(format!(
                "{balance} {quote_currency} is below the {} minimum",
                profile.min_balance
            )));
        }
        let planned_notional =
            (balance * user.trading.position_size_pct).min(profile.max_position_notional);
        if planned_notional < self.min_notional {
            return Err(AdmissionRejection::InsufficientBalance(format!(
                "position notional {planned_notional} {quote_currency} is below the {} minimum",
                self.min_notional
            )));
        }
        if state.daily_volume + planned_notional > profile.max_daily_volume {
            return Err(AdmissionRejection::DailyVolumeExceeded {
                used: state.daily_volume,
                requested: planned_notional,
                limit: profile.max_daily_volume,
            });
        }

        // 6. Leverage and stop bounds.
        if user.trading.leverage > profile.max_leverage {
            return Err(AdmissionRejection::LeverageExceeded {
                requested: user.trading.leverage,
                max: profile.max_leverage,
            });
        }
        let levels = ExitLevels::resolve(side, signal.price, Some(decision), signal, &user.trading);
        let distance_pct = levels.stop_distance_pct(signal.price);
        if distance_pct > profile.max_stop_loss_pct {
            return Err(AdmissionRejection::StopLossExceeded {
                distance_pct: distance_pct.round_dp(6),
                max_pct: profile.max_stop_loss_pct,
            });
        }

        Ok(Approval {
            reversals,
            levels,
            planned_notional,
        })
    }
}
