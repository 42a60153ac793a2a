use crate::error::DbError;
use crate::store::TradingStore;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use core_types::{
    BalanceChange, Contributor, CurrencyBalance, Distribution, ExecutionAttempt, Position,
    PositionStatus, Settlement, UserProfile,
};
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU32, Ordering};
use uuid::Uuid;

#[derive(Default)]
struct Tables {
    users: Vec<UserProfile>,
    suspension_reasons: HashMap<Uuid, String>,
    positions: Vec<Position>,
    contributors: HashMap<Uuid, Vec<Contributor>>,
    attempts: Vec<ExecutionAttempt>,
    distributions: Vec<Distribution>,
    balance_changes: Vec<BalanceChange>,
}

/// A `TradingStore` held entirely in process memory. Used for paper trading
/// and tests; it enforces the same uniqueness and settlement rules as Postgres.
#[derive(Default)]
pub struct InMemoryStore {
    tables: Mutex<Tables>,
    failing_settlements: AtomicU32,
    failing_user_loads: AtomicU32,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn tables(&self) -> Result<std::sync::MutexGuard<'_, Tables>, DbError> {
        self.tables
            .lock()
            .map_err(|_| DbError::Unavailable("in-memory store poisoned".into()))
    }

    /// Adds or replaces a user.
    pub fn insert_user(&self, user: UserProfile) -> Result<(), DbError> {
        let mut tables = self.tables()?;
        tables.users.retain(|u| u.id != user.id);
        tables.users.push(user);
        Ok(())
    }

    /// Real balance of `user_id` in `currency`.
    pub fn balance(&self, user_id: Uuid, currency: &str) -> Decimal {
        self.tables()
            .ok()
            .and_then(|t| {
                t.users
                    .iter()
                    .find(|u| u.id == user_id)
                    .and_then(|u| u.balances.iter().find(|b| b.currency == currency))
                    .map(|b| b.real)
            })
            .unwrap_or(Decimal::ZERO)
    }

    pub fn execution_attempts(&self) -> Vec<ExecutionAttempt> {
        self.tables().map(|t| t.attempts.clone()).unwrap_or_default()
    }

    pub fn balance_changes(&self) -> Vec<BalanceChange> {
        self.tables().map(|t| t.balance_changes.clone()).unwrap_or_default()
    }

    pub fn positions(&self) -> Vec<Position> {
        self.tables().map(|t| t.positions.clone()).unwrap_or_default()
    }

    pub fn suspension_reason(&self, user_id: Uuid) -> Option<String> {
        self.tables()
            .ok()
            .and_then(|t| t.suspension_reasons.get(&user_id).cloned())
    }

    /// Makes the next `count` settlements fail as if the store were down.
    pub fn fail_next_settlements(&self, count: u32) {
        self.failing_settlements.store(count, Ordering::SeqCst);
    }

    /// Makes the next `count` single-user loads fail as if the store were down.
    /// Batch loads are unaffected.
    pub fn fail_next_user_loads(&self, count: u32) {
        self.failing_user_loads.store(count, Ordering::SeqCst);
    }

    fn take_injected_failure(counter: &AtomicU32) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

fn is_successful_entry(attempt: &ExecutionAttempt, user_id: Uuid) -> bool {
    attempt.user_id == user_id && attempt.success && !attempt.reduce_only
}

#[async_trait]
impl TradingStore for InMemoryStore {
    async fn load_trading_users(&self) -> Result<Vec<UserProfile>, DbError> {
        Ok(self
            .tables()?
            .users
            .iter()
            .filter(|u| u.trading_enabled)
            .cloned()
            .collect())
    }

    async fn load_user(&self, user_id: Uuid) -> Result<UserProfile, DbError> {
        if Self::take_injected_failure(&self.failing_user_loads) {
            return Err(DbError::Unavailable("injected user load failure".into()));
        }
        self.tables()?
            .users
            .iter()
            .find(|u| u.id == user_id)
            .cloned()
            .ok_or(DbError::NotFound)
    }

    async fn open_positions_for_user(&self, user_id: Uuid) -> Result<Vec<Position>, DbError> {
        Ok(self
            .tables()?
            .positions
            .iter()
            .filter(|p| p.user_id == user_id && p.is_open())
            .cloned()
            .collect())
    }

    async fn all_open_positions(&self) -> Result<Vec<Position>, DbError> {
        Ok(self
            .tables()?
            .positions
            .iter()
            .filter(|p| p.is_open())
            .cloned()
            .collect())
    }

    async fn open_positions_for_symbol(&self, symbol: &str) -> Result<Vec<Position>, DbError> {
        Ok(self
            .tables()?
            .positions
            .iter()
            .filter(|p| p.symbol == symbol && p.is_open())
            .cloned()
            .collect())
    }

    async fn get_position(&self, position_id: Uuid) -> Result<Position, DbError> {
        self.tables()?
            .positions
            .iter()
            .find(|p| p.id == position_id)
            .cloned()
            .ok_or(DbError::NotFound)
    }

    async fn last_successful_execution(
        &self,
        user_id: Uuid,
        symbol: &str,
    ) -> Result<Option<DateTime<Utc>>, DbError> {
        Ok(self
            .tables()?
            .attempts
            .iter()
            .filter(|a| is_successful_entry(a, user_id) && a.symbol == symbol)
            .map(|a| a.created_at)
            .max())
    }

    async fn daily_volume(&self, user_id: Uuid, since: DateTime<Utc>) -> Result<Decimal, DbError> {
        Ok(self
            .tables()?
            .attempts
            .iter()
            .filter(|a| is_successful_entry(a, user_id) && a.created_at >= since)
            .map(ExecutionAttempt::filled_notional)
            .sum())
    }

    async fn insert_position(
        &self,
        position: &Position,
        contributors: &[Contributor],
    ) -> Result<(), DbError> {
        let mut tables = self.tables()?;
        let clash = tables.positions.iter().any(|p| {
            p.is_open()
                && p.user_id == position.user_id
                && p.exchange == position.exchange
                && p.symbol == position.symbol
                && p.side == position.side
        });
        if clash {
            return Err(DbError::InvalidData(format!(
                "an open {} position on {} at {} already exists for user {}",
                position.side, position.symbol, position.exchange, position.user_id
            )));
        }
        tables.positions.push(position.clone());
        tables.contributors.insert(position.id, contributors.to_vec());
        Ok(())
    }

    async fn update_position_mark(&self, position: &Position) -> Result<(), DbError> {
        let mut tables = self.tables()?;
        if let Some(stored) = tables
            .positions
            .iter_mut()
            .find(|p| p.id == position.id && p.is_open())
        {
            stored.current_price = position.current_price;
            stored.unrealized_pnl = position.unrealized_pnl;
            stored.max_profit_pct = position.max_profit_pct;
            stored.max_drawdown_pct = position.max_drawdown_pct;
        }
        Ok(())
    }

    async fn reduce_position(&self, position: &Position) -> Result<(), DbError> {
        let mut tables = self.tables()?;
        let stored = tables
            .positions
            .iter_mut()
            .find(|p| p.id == position.id && p.is_open())
            .ok_or(DbError::NotFound)?;
        stored.quantity = position.quantity;
        stored.notional = position.notional;
        stored.realized_pnl = position.realized_pnl;
        stored.unrealized_pnl = position.unrealized_pnl;
        Ok(())
    }

    async fn record_execution_attempt(&self, attempt: &ExecutionAttempt) -> Result<(), DbError> {
        let mut tables = self.tables()?;
        if !tables.attempts.iter().any(|a| a.id == attempt.id) {
            tables.attempts.push(attempt.clone());
        }
        Ok(())
    }

    async fn position_contributors(&self, position_id: Uuid) -> Result<Vec<Contributor>, DbError> {
        Ok(self
            .tables()?
            .contributors
            .get(&position_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn settle_position(&self, settlement: &Settlement) -> Result<(), DbError> {
        if Self::take_injected_failure(&self.failing_settlements) {
            return Err(DbError::Unavailable("injected settlement failure".into()));
        }

        let mut tables = self.tables()?;
        let closed = &settlement.position;
        let stored = tables
            .positions
            .iter_mut()
            .find(|p| p.id == closed.id)
            .ok_or(DbError::NotFound)?;
        if stored.status != PositionStatus::Open {
            return Err(DbError::AlreadySettled(closed.id));
        }
        *stored = closed.clone();
        stored.status = PositionStatus::Closed;

        tables
            .distributions
            .extend(settlement.distributions.iter().cloned());

        for change in &settlement.balance_changes {
            if let Some(user) = tables.users.iter_mut().find(|u| u.id == change.user_id) {
                match user.balances.iter_mut().find(|b| b.currency == change.currency) {
                    Some(balance) => balance.real += change.amount,
                    None => user.balances.push(CurrencyBalance {
                        currency: change.currency.clone(),
                        real: change.amount,
                        credit: Decimal::ZERO,
                    }),
                }
            }
        }
        tables
            .balance_changes
            .extend(settlement.balance_changes.iter().cloned());
        Ok(())
    }

    async fn distributions_for_position(&self, position_id: Uuid) -> Result<Vec<Distribution>, DbError> {
        Ok(self
            .tables()?
            .distributions
            .iter()
            .filter(|d| d.position_id == position_id)
            .cloned()
            .collect())
    }

    async fn suspend_user(&self, user_id: Uuid, reason: &str) -> Result<(), DbError> {
        let mut tables = self.tables()?;
        let user = tables
            .users
            .iter_mut()
            .find(|u| u.id == user_id)
            .ok_or(DbError::NotFound)?;
        user.trading_suspended = true;
        tables.suspension_reasons.insert(user_id, reason.to_string());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core_types::{
        ExchangeId, ExitReason, OrderSide, PositionSide, RiskTolerance, UserTradingConfig,
    };
    use rust_decimal_macros::dec;

    fn user() -> UserProfile {
        UserProfile {
            id: Uuid::new_v4(),
            tier: "pro".into(),
            risk_tolerance: RiskTolerance::Moderate,
            subscription_active: true,
            subscription_expires_at: None,
            trading_enabled: true,
            trading_suspended: false,
            credentials: vec![],
            balances: vec![CurrencyBalance {
                currency: "USDT".into(),
                real: dec!(1000),
                credit: Decimal::ZERO,
            }],
            trading: UserTradingConfig::default(),
        }
    }

    fn position(user_id: Uuid) -> Position {
        Position {
            id: Uuid::new_v4(),
            user_id,
            symbol: "BTCUSDT".into(),
            side: PositionSide::Long,
            exchange: ExchangeId::Paper,
            entry_price: dec!(100),
            quantity: dec!(1),
            notional: dec!(100),
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

    fn attempt(user_id: Uuid, reduce_only: bool, success: bool) -> ExecutionAttempt {
        ExecutionAttempt {
            id: Uuid::new_v4(),
            user_id,
            position_id: None,
            signal_id: None,
            exchange: ExchangeId::Paper,
            symbol: "BTCUSDT".into(),
            side: OrderSide::Buy,
            reduce_only,
            requested_qty: dec!(2),
            filled_qty: dec!(2),
            requested_price: dec!(100),
            avg_price: Some(dec!(100)),
            slippage: Some(Decimal::ZERO),
            order_id: Some("1".into()),
            success,
            error: None,
            created_at: Utc::now(),
        }
    }

    fn settlement(position: &Position, amount: Decimal) -> Settlement {
        let mut closed = position.clone();
        closed.status = PositionStatus::Closed;
        closed.exit_price = Some(dec!(110));
        closed.exit_reason = Some(ExitReason::TakeProfit);
        closed.realized_pnl = Some(amount);
        Settlement {
            position: closed,
            distributions: vec![],
            balance_changes: vec![BalanceChange {
                id: Uuid::new_v4(),
                user_id: position.user_id,
                position_id: Some(position.id),
                currency: "USDT".into(),
                amount,
                reason: "settlement".into(),
                created_at: Utc::now(),
            }],
        }
    }

    #[tokio::test]
    async fn second_open_position_on_same_side_is_refused() {
        let store = InMemoryStore::new();
        let u = user();
        store.insert_user(u.clone()).unwrap();
        store.insert_position(&position(u.id), &[]).await.unwrap();
        assert!(store.insert_position(&position(u.id), &[]).await.is_err());
    }

    #[tokio::test]
    async fn only_successful_entries_count_towards_volume_and_cooldown() {
        let store = InMemoryStore::new();
        let u = user();
        store.record_execution_attempt(&attempt(u.id, false, true)).await.unwrap();
        store.record_execution_attempt(&attempt(u.id, true, true)).await.unwrap();
        store.record_execution_attempt(&attempt(u.id, false, false)).await.unwrap();

        let since = Utc::now() - chrono::Duration::hours(24);
        assert_eq!(store.daily_volume(u.id, since).await.unwrap(), dec!(200));
        assert!(store.last_successful_execution(u.id, "BTCUSDT").await.unwrap().is_some());
        assert!(store.last_successful_execution(u.id, "ETHUSDT").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn symbol_lookup_includes_users_with_trading_disabled() {
        let store = InMemoryStore::new();
        let mut u = user();
        u.trading_enabled = false;
        store.insert_user(u.clone()).unwrap();
        store.insert_position(&position(u.id), &[]).await.unwrap();

        assert!(store.load_trading_users().await.unwrap().is_empty());
        assert_eq!(store.open_positions_for_symbol("BTCUSDT").await.unwrap().len(), 1);
        assert!(store.open_positions_for_symbol("ETHUSDT").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn reducing_keeps_the_position_open() {
        let store = InMemoryStore::new();
        let u = user();
        let p = position(u.id);
        store.insert_position(&p, &[]).await.unwrap();

        let rest = p.after_partial_close(dec!(0.4), dec!(110));
        store.reduce_position(&rest).await.unwrap();
        let stored = store.get_position(p.id).await.unwrap();
        assert!(stored.is_open());
        assert_eq!(stored.quantity, dec!(0.6));
        assert_eq!(stored.notional, dec!(60));
        assert_eq!(stored.realized_pnl, Some(dec!(4)));
    }

    #[tokio::test]
    async fn settlement_applies_once() {
        let store = InMemoryStore::new();
        let u = user();
        store.insert_user(u.clone()).unwrap();
        let p = position(u.id);
        store.insert_position(&p, &[]).await.unwrap();

        let s = settlement(&p, dec!(9));
        store.settle_position(&s).await.unwrap();
        assert!(matches!(
            store.settle_position(&s).await,
            Err(DbError::AlreadySettled(id)) if id == p.id
        ));
        assert_eq!(store.balance(u.id, "USDT"), dec!(1009));
        assert!(store.all_open_positions().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn injected_failure_leaves_position_open() {
        let store = InMemoryStore::new();
        let u = user();
        store.insert_user(u.clone()).unwrap();
        let p = position(u.id);
        store.insert_position(&p, &[]).await.unwrap();
        store.fail_next_settlements(1);

        let s = settlement(&p, dec!(5));
        assert!(store.settle_position(&s).await.unwrap_err().is_transient());
        assert_eq!(store.open_positions_for_user(u.id).await.unwrap().len(), 1);
        store.settle_position(&s).await.unwrap();
        assert_eq!(store.balance(u.id, "USDT"), dec!(1005));
    }
}
