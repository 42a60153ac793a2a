use crate::error::DbError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use core_types::{Contributor, Distribution, ExecutionAttempt, Position, Settlement, UserProfile};
use rust_decimal::Decimal;
use uuid::Uuid;

/// Everything the engine persists or reads back. Positions and cooldowns live
/// here rather than in process memory.
#[async_trait]
pub trait TradingStore: Send + Sync {
    /// Users with trading enabled, with credentials, balances and trading config.
    async fn load_trading_users(&self) -> Result<Vec<UserProfile>, DbError>;

    async fn load_user(&self, user_id: Uuid) -> Result<UserProfile, DbError>;

    async fn open_positions_for_user(&self, user_id: Uuid) -> Result<Vec<Position>, DbError>;

    async fn all_open_positions(&self) -> Result<Vec<Position>, DbError>;

    /// Open positions on `symbol` across every user, whatever their trading state.
    async fn open_positions_for_symbol(&self, symbol: &str) -> Result<Vec<Position>, DbError>;

    async fn get_position(&self, position_id: Uuid) -> Result<Position, DbError>;

    /// Time of the last successful opening execution for (user, symbol).
    async fn last_successful_execution(
        &self,
        user_id: Uuid,
        symbol: &str,
    ) -> Result<Option<DateTime<Utc>>, DbError>;

    /// Filled notional of successful opening executions since `since`.
    async fn daily_volume(&self, user_id: Uuid, since: DateTime<Utc>) -> Result<Decimal, DbError>;

    async fn insert_position(
        &self,
        position: &Position,
        contributors: &[Contributor],
    ) -> Result<(), DbError>;

    /// Writes the monitor's view: current price, unrealized P&L and excursions.
    async fn update_position_mark(&self, position: &Position) -> Result<(), DbError>;

    /// Writes what is left after a partial close: quantity, notional and the P&L
    /// realized so far. The position stays open.
    async fn reduce_position(&self, position: &Position) -> Result<(), DbError>;

    async fn record_execution_attempt(&self, attempt: &ExecutionAttempt) -> Result<(), DbError>;

    async fn position_contributors(&self, position_id: Uuid) -> Result<Vec<Contributor>, DbError>;

    /// Closes the position and applies every distribution and balance change in
    /// one transaction. Fails with `AlreadySettled` when the position is not open.
    async fn settle_position(&self, settlement: &Settlement) -> Result<(), DbError>;

    async fn distributions_for_position(&self, position_id: Uuid) -> Result<Vec<Distribution>, DbError>;

    async fn suspend_user(&self, user_id: Uuid, reason: &str) -> Result<(), DbError>;
}
