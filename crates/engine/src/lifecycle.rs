use crate::error::EngineError;
use crate::settlement;
use chrono::{DateTime, Utc};
use configuration::{Config, LifecycleSettings};
use core_types::{
    Contributor, ExitReason, Position, PositionSide, PositionStatus, Settlement, TradeReport,
    UserProfile, quote_currency_of,
};
use database::{DbError, TradingStore};
use events::{EngineEvent, Notifier, PositionClosed, SettlementFailed};
use executor::ExecutionOrchestrator;
use futures::stream::{self, StreamExt};
use risk::UserLocks;
use rust_decimal::Decimal;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::time::interval;
use uuid::Uuid;

/// Stop-loss, take-profit, then maximum hold time.
pub fn exit_reason(
    position: &Position,
    price: Decimal,
    now: DateTime<Utc>,
    max_hold: chrono::Duration,
) -> Option<ExitReason> {
    let (stop_hit, target_hit) = match position.side {
        PositionSide::Long => (
            position.stop_loss.is_some_and(|sl| price <= sl),
            position.take_profit.is_some_and(|tp| price >= tp),
        ),
        PositionSide::Short => (
            position.stop_loss.is_some_and(|sl| price >= sl),
            position.take_profit.is_some_and(|tp| price <= tp),
        ),
    };
    if stop_hit {
        Some(ExitReason::StopLoss)
    } else if target_hit {
        Some(ExitReason::TakeProfit)
    } else if now - position.entry_time >= max_hold {
        Some(ExitReason::Timeout)
    } else {
        None
    }
}

/// Applies a new price to the position's running figures. Returns true when the
/// move since the last recorded price reaches `threshold` and should be written.
pub fn reprice(position: &mut Position, price: Decimal, threshold: Decimal) -> bool {
    let moved = if position.current_price.is_zero() {
        true
    } else {
        ((price - position.current_price) / position.current_price).abs() >= threshold
    };

    let ret = position.return_pct_at(price);
    position.max_profit_pct = position.max_profit_pct.max(ret);
    position.max_drawdown_pct = position.max_drawdown_pct.max(-ret);
    if moved {
        position.current_price = price;
        position.unrealized_pnl = position.pnl_at(price);
    }
    moved
}

/// What happened to a position handed to `close_position`.
#[derive(Debug)]
pub enum CloseOutcome {
    /// Closed on the exchange and settled.
    Settled(Settlement),
    /// Closed on the exchange; the ledger update is queued for retry.
    PendingSettlement(Settlement),
}

impl CloseOutcome {
    pub fn settlement(&self) -> &Settlement {
        match self {
            CloseOutcome::Settled(s) | CloseOutcome::PendingSettlement(s) => s,
        }
    }
}

/// Registers, re-prices and closes positions, and settles them.
///
/// Every close, whether from a signal, a reversal or the monitor, goes through
/// `close_position`. Callers must hold the user's lock.
pub struct LifecycleManager {
    config: Arc<Config>,
    settings: LifecycleSettings,
    store: Arc<dyn TradingStore>,
    orchestrator: Arc<ExecutionOrchestrator>,
    locks: Arc<UserLocks>,
    notifier: Arc<dyn Notifier>,
    pending: Mutex<Vec<Settlement>>,
}

impl LifecycleManager {
    pub fn new(
        config: Arc<Config>,
        store: Arc<dyn TradingStore>,
        orchestrator: Arc<ExecutionOrchestrator>,
        locks: Arc<UserLocks>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self {
            settings: config.lifecycle.clone(),
            config,
            store,
            orchestrator,
            locks,
            notifier,
            pending: Mutex::new(Vec::new()),
        }
    }

    /// Persists a freshly opened position with its contributors.
    pub async fn register(
        &self,
        position: &Position,
        contributors: &[Contributor],
    ) -> Result<(), EngineError> {
        self.store.insert_position(position, contributors).await?;
        tracing::info!(
            user_id = %position.user_id,
            position_id = %position.id,
            symbol = %position.symbol,
            side = %position.side,
            exchange = %position.exchange,
            quantity = %position.quantity,
            entry_price = %position.entry_price,
            "position opened"
        );
        self.notifier.publish(EngineEvent::PositionOpened(position.clone()));
        Ok(())
    }

    /// Closes one position: reduce-only order, realized P&L from the fill, then
    /// settlement. A failed exchange close leaves the position open for the next
    /// tick, shrunk by whatever part of it did fill; a failed settlement is
    /// queued and retried.
    pub async fn close_position(
        &self,
        user: &UserProfile,
        position: &Position,
        reason: ExitReason,
        reference_price: Decimal,
    ) -> Result<CloseOutcome, EngineError> {
        let leg = self.orchestrator.close(user, position, reference_price).await;
        if let Err(e) = self.store.record_execution_attempt(&leg.attempt).await {
            tracing::error!(position_id = %position.id, error = %e, "failed to record close attempt");
        }
        let filled = match leg.result {
            Ok(filled) => filled,
            Err(e) => {
                if let Some((closed_qty, price)) = e.partial_fill() {
                    self.record_partial_close(position, closed_qty, price.unwrap_or(reference_price))
                        .await;
                }
                return Err(e.into());
            }
        };

        let now = Utc::now();
        let exit_price = filled.fill.avg_price;
        let mut closed = position.clone();
        closed.status = PositionStatus::Closed;
        closed.exit_price = Some(exit_price);
        closed.exit_time = Some(now);
        closed.exit_reason = Some(reason);
        closed.current_price = exit_price;
        closed.unrealized_pnl = Decimal::ZERO;
        closed.realized_pnl =
            Some(position.realized_pnl.unwrap_or_default() + position.pnl_at(exit_price));

        let contributors = self.contributors_for(user, position).await?;
        let currency = quote_currency_of(&position.symbol, &self.config.engine.quote_currencies)?;
        let settlement = settlement::settle(closed, &contributors, &currency, now);

        tracing::info!(
            user_id = %user.id,
            position_id = %position.id,
            reason = reason.as_str(),
            exit_price = %exit_price,
            realized_pnl = %settlement.position.realized_pnl.unwrap_or_default(),
            "position closed on exchange"
        );

        if self.try_settle(&settlement).await {
            Ok(CloseOutcome::Settled(settlement))
        } else {
            self.pending.lock().await.push(settlement.clone());
            Ok(CloseOutcome::PendingSettlement(settlement))
        }
    }

    /// Keeps only the unfilled remainder of a position open after its close
    /// order filled in part, so the next attempt sends just that remainder.
    async fn record_partial_close(&self, position: &Position, closed_qty: Decimal, price: Decimal) {
        let rest = position.after_partial_close(closed_qty, price);
        match self.store.reduce_position(&rest).await {
            Ok(()) => tracing::warn!(
                user_id = %position.user_id,
                position_id = %position.id,
                closed = %closed_qty,
                remaining = %rest.quantity,
                realized_so_far = %rest.realized_pnl.unwrap_or_default(),
                "close filled in part, remainder stays open"
            ),
            Err(e) => tracing::error!(
                user_id = %position.user_id,
                position_id = %position.id,
                closed = %closed_qty,
                error = %e,
                "CRITICAL: close filled in part but the position could not be reduced"
            ),
        }
    }

    /// Writes a settlement. Returns false when it has to be retried later.
    async fn try_settle(&self, settlement: &Settlement) -> bool {
        let position = &settlement.position;
        match self.store.settle_position(settlement).await {
            Ok(()) => {
                self.notifier.publish(EngineEvent::PositionClosed(PositionClosed {
                    position: position.clone(),
                    reason: position.exit_reason.unwrap_or(ExitReason::Signal),
                    distributions: settlement.distributions.clone(),
                }));
                true
            }
            Err(DbError::AlreadySettled(id)) => {
                tracing::warn!(position_id = %id, "position was already settled");
                true
            }
            Err(e) => {
                tracing::error!(
                    position_id = %position.id,
                    user_id = %position.user_id,
                    error = %e,
                    "CRITICAL: settlement failed after the exchange close, queued for retry"
                );
                self.notifier.publish(EngineEvent::SettlementFailed(SettlementFailed {
                    position_id: position.id,
                    user_id: position.user_id,
                    realized_pnl: position.realized_pnl.unwrap_or_default(),
                    error: e.to_string(),
                }));
                false
            }
        }
    }

    /// Stored contributors, or the owner alone at their tier's commission rate.
    async fn contributors_for(
        &self,
        user: &UserProfile,
        position: &Position,
    ) -> Result<Vec<Contributor>, EngineError> {
        let stored = self.store.position_contributors(position.id).await?;
        if !stored.is_empty() {
            return Ok(stored);
        }
        let rate = self
            .config
            .tier_or_fallback(&user.tier)
            .map(|t| t.commission_rate)
            .unwrap_or(Decimal::ZERO);
        Ok(vec![Contributor {
            user_id: position.user_id,
            contributed: position.notional,
            commission_rate: rate,
        }])
    }

    /// Closes every open position of `user` on `symbol` with `side`, one per exchange.
    pub async fn close_matching(
        &self,
        user: &UserProfile,
        symbol: &str,
        side: PositionSide,
        reason: ExitReason,
        reference_price: Decimal,
    ) -> Result<Vec<TradeReport>, EngineError> {
        let open = self.store.open_positions_for_user(user.id).await?;
        let mut reports = Vec::new();
        for position in open.iter().filter(|p| p.symbol == symbol && p.side == side) {
            reports.push(
                self.close_and_report(user, position, reason, reference_price)
                    .await,
            );
        }
        Ok(reports)
    }

    /// `close_position` folded into a trade report line.
    pub async fn close_and_report(
        &self,
        user: &UserProfile,
        position: &Position,
        reason: ExitReason,
        reference_price: Decimal,
    ) -> TradeReport {
        match self.close_position(user, position, reason, reference_price).await {
            Ok(outcome) => {
                let closed = &outcome.settlement().position;
                let pending = matches!(outcome, CloseOutcome::PendingSettlement(_));
                TradeReport {
                    user_id: user.id,
                    exchange: Some(position.exchange),
                    success: true,
                    order_id: None,
                    filled_qty: Some(position.quantity),
                    slippage: None,
                    category: pending.then(|| "SETTLEMENT_PENDING".to_string()),
                    message: format!(
                        "closed {} {} ({}) at {}, realized {}",
                        position.side,
                        position.symbol,
                        reason.as_str(),
                        closed.exit_price.unwrap_or_default(),
                        closed.realized_pnl.unwrap_or_default()
                    ),
                }
            }
            Err(e) => TradeReport {
                user_id: user.id,
                exchange: Some(position.exchange),
                success: false,
                order_id: None,
                filled_qty: None,
                slippage: None,
                category: Some(e.code().to_string()),
                message: format!("close of {} failed: {e}", position.id),
            },
        }
    }

    pub async fn pending_settlements(&self) -> usize {
        self.pending.lock().await.len()
    }

    /// Retries every queued settlement once.
    pub async fn retry_pending(&self) {
        let queued: Vec<Settlement> = std::mem::take(&mut *self.pending.lock().await);
        if queued.is_empty() {
            return;
        }
        tracing::info!(count = queued.len(), "retrying pending settlements");
        let mut still_pending = Vec::new();
        for settlement in queued {
            if !self.try_settle(&settlement).await {
                still_pending.push(settlement);
            }
        }
        self.pending.lock().await.extend(still_pending);
    }

    /// One monitor pass: pending settlements first, then every open position.
    pub async fn tick(&self) -> Result<(), EngineError> {
        self.retry_pending().await;

        let skip: HashSet<Uuid> = self
            .pending
            .lock()
            .await
            .iter()
            .map(|s| s.position.id)
            .collect();
        let open = self.store.all_open_positions().await?;
        let candidates: Vec<Position> = open.into_iter().filter(|p| !skip.contains(&p.id)).collect();
        tracing::debug!(open = candidates.len(), "monitoring positions");

        stream::iter(candidates)
            .for_each_concurrent(self.settings.max_concurrent_checks.max(1), |position| async move {
                if let Err(e) = self.check_position(position.id).await {
                    tracing::warn!(position_id = %position.id, code = e.code(), error = %e, "position check failed");
                }
            })
            .await;
        Ok(())
    }

    /// Re-prices one position under its owner's lock and closes it when an exit
    /// condition holds.
    async fn check_position(&self, position_id: Uuid) -> Result<(), EngineError> {
        let user_id = self.store.get_position(position_id).await?.user_id;
        let _guard = self.locks.lock(user_id).await;

        // Re-read under the lock; a signal may have closed it meanwhile.
        let mut position = self.store.get_position(position_id).await?;
        if !position.is_open() {
            return Ok(());
        }
        let user = self.store.load_user(user_id).await?;
        let price = self
            .orchestrator
            .mark_price(&user, position.exchange, &position.symbol)
            .await?;

        if reprice(&mut position, price, self.settings.price_move_threshold_pct) {
            self.store.update_position_mark(&position).await?;
        }

        if let Some(reason) = exit_reason(&position, price, Utc::now(), self.settings.max_hold()) {
            tracing::info!(
                position_id = %position.id,
                user_id = %user_id,
                reason = reason.as_str(),
                price = %price,
                "exit condition met"
            );
            self.close_position(&user, &position, reason, price).await?;
        }
        Ok(())
    }

    /// Runs `tick` on the configured interval until the task is dropped.
    pub async fn run(self: Arc<Self>) {
        tracing::info!(
            interval_secs = self.settings.monitor_interval_secs,
            "starting position monitor"
        );
        let mut timer = interval(self.settings.monitor_interval());
        loop {
            timer.tick().await;
            if let Err(e) = self.tick().await {
                tracing::error!(error = %e, "position monitor pass failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core_types::ExchangeId;
    use rust_decimal_macros::dec;

    fn long(entry_time: DateTime<Utc>) -> Position {
        Position {
            id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
            symbol: "BTCUSDT".into(),
            side: PositionSide::Long,
            exchange: ExchangeId::Paper,
            entry_price: dec!(100),
            quantity: dec!(1),
            notional: dec!(100),
            leverage: 1,
            status: PositionStatus::Open,
            stop_loss: Some(dec!(95)),
            take_profit: Some(dec!(110)),
            entry_time,
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
    fn exits_are_side_aware() {
        let now = Utc::now();
        let hold = chrono::Duration::hours(1);
        let mut p = long(now);
        assert_eq!(exit_reason(&p, dec!(94), now, hold), Some(ExitReason::StopLoss));
        assert_eq!(exit_reason(&p, dec!(111), now, hold), Some(ExitReason::TakeProfit));
        assert_eq!(exit_reason(&p, dec!(101), now, hold), None);

        p.side = PositionSide::Short;
        p.stop_loss = Some(dec!(105));
        p.take_profit = Some(dec!(90));
        assert_eq!(exit_reason(&p, dec!(106), now, hold), Some(ExitReason::StopLoss));
        assert_eq!(exit_reason(&p, dec!(89), now, hold), Some(ExitReason::TakeProfit));
    }

    #[test]
    fn held_too_long_times_out() {
        let now = Utc::now();
        let p = long(now - chrono::Duration::minutes(61));
        assert_eq!(
            exit_reason(&p, dec!(101), now, chrono::Duration::hours(1)),
            Some(ExitReason::Timeout)
        );
    }

    #[test]
    fn small_moves_update_excursions_but_not_the_mark() {
        let mut p = long(Utc::now());
        assert!(!reprice(&mut p, dec!(100.3), dec!(0.005)));
        assert_eq!(p.current_price, dec!(100));
        assert_eq!(p.max_profit_pct, dec!(0.003));

        assert!(reprice(&mut p, dec!(98), dec!(0.005)));
        assert_eq!(p.current_price, dec!(98));
        assert_eq!(p.unrealized_pnl, dec!(-2));
        assert_eq!(p.max_drawdown_pct, dec!(0.02));
    }
}
