//! Proportional P&L distribution with profit-only commission.

use chrono::{DateTime, Utc};
use core_types::{BalanceChange, Contributor, Distribution, Position, Settlement};
use rust_decimal::Decimal;
use uuid::Uuid;

/// Money is kept to 8 decimal places; rounding residue goes to the last contributor.
const MONEY_DP: u32 = 8;

/// Splits `realized_pnl` between `contributors` in proportion to what each put in.
///
/// Shares sum to exactly 100 and raw P&L to exactly `realized_pnl`. Commission is
/// only taken from a positive raw share.
pub fn distribute(
    position_id: Uuid,
    realized_pnl: Decimal,
    contributors: &[Contributor],
    now: DateTime<Utc>,
) -> Vec<Distribution> {
    let total: Decimal = contributors.iter().map(|c| c.contributed).sum();
    if total <= Decimal::ZERO {
        return Vec::new();
    }

    let hundred = Decimal::ONE_HUNDRED;
    let last = contributors.len() - 1;
    let mut allocated_pnl = Decimal::ZERO;
    let mut allocated_pct = Decimal::ZERO;

    contributors
        .iter()
        .enumerate()
        .map(|(i, c)| {
            let (share_pct, raw) = if i == last {
                (hundred - allocated_pct, realized_pnl - allocated_pnl)
            } else {
                let share = c.contributed / total;
                (
                    (share * hundred).round_dp(MONEY_DP),
                    (realized_pnl * share).round_dp(MONEY_DP),
                )
            };
            allocated_pct += share_pct;
            allocated_pnl += raw;

            let commission = if raw > Decimal::ZERO {
                (raw * c.commission_rate).round_dp(MONEY_DP)
            } else {
                Decimal::ZERO
            };
            Distribution {
                id: Uuid::new_v4(),
                position_id,
                user_id: c.user_id,
                contributed: c.contributed,
                share_pct,
                raw_pnl: raw,
                commission,
                net_pnl: raw - commission,
                created_at: now,
            }
        })
        .collect()
}

/// Builds everything written atomically for a closed position: the final
/// position row, one distribution per contributor and the balance credits.
pub fn settle(
    mut closed: Position,
    contributors: &[Contributor],
    currency: &str,
    now: DateTime<Utc>,
) -> Settlement {
    let realized = closed.realized_pnl.unwrap_or(Decimal::ZERO);
    let distributions = distribute(closed.id, realized, contributors, now);
    closed.commission = Some(distributions.iter().map(|d| d.commission).sum());

    let balance_changes = distributions
        .iter()
        .filter(|d| !d.net_pnl.is_zero())
        .map(|d| BalanceChange {
            id: Uuid::new_v4(),
            user_id: d.user_id,
            position_id: Some(closed.id),
            currency: currency.to_string(),
            amount: d.net_pnl,
            reason: format!(
                "{} {} {} settlement",
                closed.symbol,
                closed.side,
                closed.exit_reason.map(|r| r.as_str()).unwrap_or("CLOSE")
            ),
            created_at: now,
        })
        .collect();

    Settlement {
        position: closed,
        distributions,
        balance_changes,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core_types::{ExchangeId, ExitReason, PositionSide, PositionStatus};
    use rust_decimal_macros::dec;

    fn contributor(amount: Decimal, rate: Decimal) -> Contributor {
        Contributor {
            user_id: Uuid::new_v4(),
            contributed: amount,
            commission_rate: rate,
        }
    }

    #[test]
    fn profit_is_split_by_contribution_then_commissioned() {
        let a = contributor(dec!(700), dec!(0.10));
        let b = contributor(dec!(300), dec!(0.10));
        let d = distribute(Uuid::new_v4(), dec!(100), &[a, b], Utc::now());

        assert_eq!(d[0].share_pct, dec!(70));
        assert_eq!(d[0].raw_pnl, dec!(70));
        assert_eq!(d[0].commission, dec!(7));
        assert_eq!(d[0].net_pnl, dec!(63));
        assert_eq!(d[1].share_pct, dec!(30));
        assert_eq!(d[1].raw_pnl, dec!(30));
        assert_eq!(d[1].commission, dec!(3));
        assert_eq!(d[1].net_pnl, dec!(27));
    }

    #[test]
    fn losses_carry_no_commission() {
        let parties = [contributor(dec!(500), dec!(0.2)), contributor(dec!(500), dec!(0.2))];
        let d = distribute(Uuid::new_v4(), dec!(-40), &parties, Utc::now());
        assert!(d.iter().all(|x| x.commission.is_zero()));
        assert_eq!(d.iter().map(|x| x.net_pnl).sum::<Decimal>(), dec!(-40));
    }

    #[test]
    fn uneven_split_still_sums_exactly() {
        let parties = [
            contributor(dec!(1), dec!(0.1)),
            contributor(dec!(1), dec!(0.1)),
            contributor(dec!(1), dec!(0.1)),
        ];
        let d = distribute(Uuid::new_v4(), dec!(100), &parties, Utc::now());
        assert_eq!(d.iter().map(|x| x.share_pct).sum::<Decimal>(), dec!(100));
        assert_eq!(d.iter().map(|x| x.raw_pnl).sum::<Decimal>(), dec!(100));
        assert_eq!(d[0].raw_pnl, dec!(33.33333333));
        assert_eq!(d[2].raw_pnl, dec!(33.33333334));
    }

    #[test]
    fn settlement_totals_commission_on_the_position() {
        let owner = contributor(dec!(1000), dec!(0.15));
        let now = Utc::now();
        let closed = Position {
            id: Uuid::new_v4(),
            user_id: owner.user_id,
            symbol: "ETHUSDT".into(),
            side: PositionSide::Short,
            exchange: ExchangeId::Bybit,
            entry_price: dec!(2000),
            quantity: dec!(0.5),
            notional: dec!(1000),
            leverage: 1,
            status: PositionStatus::Closed,
            stop_loss: None,
            take_profit: None,
            entry_time: now,
            current_price: dec!(1900),
            unrealized_pnl: Decimal::ZERO,
            max_profit_pct: Decimal::ZERO,
            max_drawdown_pct: Decimal::ZERO,
            exit_price: Some(dec!(1900)),
            exit_time: Some(now),
            exit_reason: Some(ExitReason::TakeProfit),
            realized_pnl: Some(dec!(50)),
            commission: None,
        };

        let s = settle(closed, &[owner.clone()], "USDT", now);
        assert_eq!(s.position.commission, Some(dec!(7.5)));
        assert_eq!(s.balance_changes.len(), 1);
        assert_eq!(s.balance_changes[0].amount, dec!(42.5));
        assert_eq!(s.balance_changes[0].user_id, owner.user_id);
    }
}
