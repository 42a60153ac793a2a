use crate::connection::DbRouter;
use crate::error::DbError;
use crate::store::TradingStore;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use core_types::{
    Contributor, CurrencyBalance, Distribution, ExchangeCredential, ExchangeId, ExecutionAttempt,
    ExitReason, OrderSide, Position, PositionSide, PositionStatus, RiskTolerance, Settlement,
    UserProfile, UserTradingConfig,
};
use rust_decimal::Decimal;
use serde_json::Value as JsonValue;
use sqlx::postgres::{PgPool, PgRow};
use sqlx::Row;
use std::collections::HashMap;
use std::future::Future;
use std::str::FromStr;
use std::sync::Arc;
use uuid::Uuid;

const POSITION_COLUMNS: &str = "id, user_id, symbol, side, exchange, entry_price, quantity, notional, \
    leverage, status, stop_loss, take_profit, entry_time, current_price, unrealized_pnl, \
    max_profit_pct, max_drawdown_pct, exit_price, exit_time, exit_reason, realized_pnl, commission";

/// The Postgres implementation of `TradingStore`. Writes go to the primary;
/// reads go through the router's replicas with a primary fallback.
#[derive(Clone)]
pub struct DbRepository {
    router: Arc<DbRouter>,
}

fn parse<T: FromStr>(column: &str, raw: &str) -> Result<T, DbError> {
    T::from_str(raw).map_err(|_| DbError::InvalidData(format!("{column} = {raw:?}")))
}

fn order_side_str(side: OrderSide) -> &'static str {
    match side {
        OrderSide::Buy => "BUY",
        OrderSide::Sell => "SELL",
    }
}

fn position_from_row(row: &PgRow) -> Result<Position, DbError> {
    let side: String = row.try_get("side")?;
    let exchange: String = row.try_get("exchange")?;
    let status: String = row.try_get("status")?;
    let exit_reason: Option<String> = row.try_get("exit_reason")?;
    let leverage: i16 = row.try_get("leverage")?;

    Ok(Position {
        id: row.try_get("id")?,
        user_id: row.try_get("user_id")?,
        symbol: row.try_get("symbol")?,
        side: parse::<PositionSide>("side", &side)?,
        exchange: parse::<ExchangeId>("exchange", &exchange)?,
        entry_price: row.try_get("entry_price")?,
        quantity: row.try_get("quantity")?,
        notional: row.try_get("notional")?,
        leverage: u8::try_from(leverage)
            .map_err(|_| DbError::InvalidData(format!("leverage = {leverage}")))?,
        status: parse::<PositionStatus>("status", &status)?,
        stop_loss: row.try_get("stop_loss")?,
        take_profit: row.try_get("take_profit")?,
        entry_time: row.try_get("entry_time")?,
        current_price: row.try_get("current_price")?,
        unrealized_pnl: row.try_get("unrealized_pnl")?,
        max_profit_pct: row.try_get("max_profit_pct")?,
        max_drawdown_pct: row.try_get("max_drawdown_pct")?,
        exit_price: row.try_get("exit_price")?,
        exit_time: row.try_get("exit_time")?,
        exit_reason: exit_reason
            .map(|r| parse::<ExitReason>("exit_reason", &r))
            .transpose()?,
        realized_pnl: row.try_get("realized_pnl")?,
        commission: row.try_get("commission")?,
    })
}

impl DbRepository {
    /// Creates a new `DbRepository` over a shared router.
    pub fn new(router: Arc<DbRouter>) -> Self {
        Self { router }
    }

    pub fn router(&self) -> &Arc<DbRouter> {
        &self.router
    }

    /// Runs a read on the next healthy replica; connection-level failures mark
    /// it unhealthy and the read is repeated on the primary.
    async fn read<T, F, Fut>(&self, op: F) -> Result<T, DbError>
    where
        F: Fn(PgPool) -> Fut,
        Fut: Future<Output = Result<T, DbError>>,
    {
        if let Some((index, pool)) = self.router.replica() {
            match op(pool.clone()).await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_transient() => {
                    tracing::warn!(error = %e, "replica read failed, falling back to primary");
                    self.router.mark_unhealthy(index);
                }
                Err(e) => return Err(e),
            }
        }
        op(self.router.primary().clone()).await
    }

    /// Assembles profiles from the users row plus credential and balance rows.
    async fn hydrate_users(pool: &PgPool, rows: Vec<PgRow>) -> Result<Vec<UserProfile>, DbError> {
        let ids: Vec<Uuid> = rows
            .iter()
            .map(|r| r.try_get::<Uuid, _>("id"))
            .collect::<Result<_, _>>()?;

        let mut credentials: HashMap<Uuid, Vec<ExchangeCredential>> = HashMap::new();
        let credential_rows = sqlx::query(
            "SELECT user_id, exchange, api_key, api_secret, enabled, testnet \
             FROM user_exchange_credentials WHERE user_id = ANY($1) ORDER BY user_id, exchange",
        )
        .bind(&ids)
        .fetch_all(pool)
        .await?;
        for row in credential_rows {
            let exchange: String = row.try_get("exchange")?;
            credentials
                .entry(row.try_get("user_id")?)
                .or_default()
                .push(ExchangeCredential {
                    exchange: parse::<ExchangeId>("exchange", &exchange)?,
                    api_key: row.try_get("api_key")?,
                    api_secret: row.try_get("api_secret")?,
                    enabled: row.try_get("enabled")?,
                    testnet: row.try_get("testnet")?,
                });
        }

        let mut balances: HashMap<Uuid, Vec<CurrencyBalance>> = HashMap::new();
        let balance_rows = sqlx::query(
            "SELECT user_id, currency, real_balance, credit_balance FROM user_balances WHERE user_id = ANY($1)",
        )
        .bind(&ids)
        .fetch_all(pool)
        .await?;
        for row in balance_rows {
            balances
                .entry(row.try_get("user_id")?)
                .or_default()
                .push(CurrencyBalance {
                    currency: row.try_get("currency")?,
                    real: row.try_get("real_balance")?,
                    credit: row.try_get("credit_balance")?,
                });
        }

        rows.into_iter()
            .map(|row| -> Result<UserProfile, DbError> {
                let id: Uuid = row.try_get("id")?;
                let tolerance: String = row.try_get("risk_tolerance")?;
                let trading: JsonValue = row.try_get("trading_config")?;
                let trading: UserTradingConfig = serde_json::from_value(trading)?;
                Ok(UserProfile {
                    id,
                    tier: row.try_get("tier")?,
                    risk_tolerance: parse::<RiskTolerance>("risk_tolerance", &tolerance)?,
                    subscription_active: row.try_get("subscription_active")?,
                    subscription_expires_at: row.try_get("subscription_expires_at")?,
                    trading_enabled: row.try_get("trading_enabled")?,
                    trading_suspended: row.try_get("trading_suspended")?,
                    credentials: credentials.remove(&id).unwrap_or_default(),
                    balances: balances.remove(&id).unwrap_or_default(),
                    trading,
                })
            })
            .collect()
    }
}

const USER_COLUMNS: &str = "id, tier, risk_tolerance, subscription_active, subscription_expires_at, \
    trading_enabled, trading_suspended, trading_config";

async fn fetch_trading_users(pool: PgPool) -> Result<Vec<UserProfile>, DbError> {
    let rows = sqlx::query(&format!(
        "SELECT {USER_COLUMNS} FROM users WHERE trading_enabled ORDER BY created_at"
    ))
    .fetch_all(&pool)
    .await?;
    DbRepository::hydrate_users(&pool, rows).await
}

async fn fetch_user(pool: PgPool, user_id: Uuid) -> Result<UserProfile, DbError> {
    let row = sqlx::query(&format!("SELECT {USER_COLUMNS} FROM users WHERE id = $1"))
        .bind(user_id)
        .fetch_optional(&pool)
        .await?
        .ok_or(DbError::NotFound)?;
    DbRepository::hydrate_users(&pool, vec![row])
        .await?
        .pop()
        .ok_or(DbError::NotFound)
}

async fn fetch_all_open_positions(pool: PgPool) -> Result<Vec<Position>, DbError> {
    let rows = sqlx::query(&format!(
        "SELECT {POSITION_COLUMNS} FROM positions WHERE status = 'OPEN' ORDER BY entry_time"
    ))
    .fetch_all(&pool)
    .await?;
    rows.iter().map(position_from_row).collect()
}

async fn fetch_open_positions_for_symbol(pool: PgPool, symbol: String) -> Result<Vec<Position>, DbError> {
    let rows = sqlx::query(&format!(
        "SELECT {POSITION_COLUMNS} FROM positions WHERE symbol = $1 AND status = 'OPEN' ORDER BY entry_time"
    ))
    .bind(symbol)
    .fetch_all(&pool)
    .await?;
    rows.iter().map(position_from_row).collect()
}

async fn fetch_distributions(pool: PgPool, position_id: Uuid) -> Result<Vec<Distribution>, DbError> {
    let rows = sqlx::query(
        "SELECT id, position_id, user_id, contributed, share_pct, raw_pnl, commission, net_pnl, created_at \
         FROM distributions WHERE position_id = $1 ORDER BY created_at, user_id",
    )
    .bind(position_id)
    .fetch_all(&pool)
    .await?;
    rows.iter()
        .map(|row| -> Result<Distribution, DbError> {
            Ok(Distribution {
                id: row.try_get("id")?,
                position_id: row.try_get("position_id")?,
                user_id: row.try_get("user_id")?,
                contributed: row.try_get("contributed")?,
                share_pct: row.try_get("share_pct")?,
                raw_pnl: row.try_get("raw_pnl")?,
                commission: row.try_get("commission")?,
                net_pnl: row.try_get("net_pnl")?,
                created_at: row.try_get("created_at")?,
            })
        })
        .collect()
}

#[async_trait]
impl TradingStore for DbRepository {
    async fn load_trading_users(&self) -> Result<Vec<UserProfile>, DbError> {
        self.read(fetch_trading_users).await
    }

    async fn load_user(&self, user_id: Uuid) -> Result<UserProfile, DbError> {
        self.read(|pool| fetch_user(pool, user_id)).await
    }

    async fn open_positions_for_user(&self, user_id: Uuid) -> Result<Vec<Position>, DbError> {
        // Admission depends on this being current, so it always reads the primary.
        let rows = sqlx::query(&format!(
            "SELECT {POSITION_COLUMNS} FROM positions WHERE user_id = $1 AND status = 'OPEN' ORDER BY entry_time"
        ))
        .bind(user_id)
        .fetch_all(self.router.primary())
        .await?;
        rows.iter().map(position_from_row).collect()
    }

    async fn all_open_positions(&self) -> Result<Vec<Position>, DbError> {
        self.read(fetch_all_open_positions).await
    }

    async fn open_positions_for_symbol(&self, symbol: &str) -> Result<Vec<Position>, DbError> {
        self.read(|pool| fetch_open_positions_for_symbol(pool, symbol.to_string()))
            .await
    }

    async fn get_position(&self, position_id: Uuid) -> Result<Position, DbError> {
        let row = sqlx::query(&format!("SELECT {POSITION_COLUMNS} FROM positions WHERE id = $1"))
            .bind(position_id)
            .fetch_optional(self.router.primary())
            .await?
            .ok_or(DbError::NotFound)?;
        position_from_row(&row)
    }

    async fn last_successful_execution(
        &self,
        user_id: Uuid,
        symbol: &str,
    ) -> Result<Option<DateTime<Utc>>, DbError> {
        let last: Option<DateTime<Utc>> = sqlx::query_scalar(
            "SELECT MAX(created_at) FROM execution_attempts \
             WHERE user_id = $1 AND symbol = $2 AND success AND NOT reduce_only",
        )
        .bind(user_id)
        .bind(symbol)
        .fetch_one(self.router.primary())
        .await?;
        Ok(last)
    }

    async fn daily_volume(&self, user_id: Uuid, since: DateTime<Utc>) -> Result<Decimal, DbError> {
        let volume: Option<Decimal> = sqlx::query_scalar(
            "SELECT SUM(filled_qty * avg_price) FROM execution_attempts \
             WHERE user_id = $1 AND created_at >= $2 AND success AND NOT reduce_only",
        )
        .bind(user_id)
        .bind(since)
        .fetch_one(self.router.primary())
        .await?;
        Ok(volume.unwrap_or(Decimal::ZERO))
    }

    async fn insert_position(
        &self,
        position: &Position,
        contributors: &[Contributor],
    ) -> Result<(), DbError> {
        let mut tx = self.router.primary().begin().await?;
        sqlx::query(&format!(
            "INSERT INTO positions ({POSITION_COLUMNS}) VALUES \
             ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18, $19, $20, $21, $22)"
        ))
        .bind(position.id)
        .bind(position.user_id)
        .bind(&position.symbol)
        .bind(position.side.as_str())
        .bind(position.exchange.as_str())
        .bind(position.entry_price)
        .bind(position.quantity)
        .bind(position.notional)
        .bind(i16::from(position.leverage))
        .bind(position.status.as_str())
        .bind(position.stop_loss)
        .bind(position.take_profit)
        .bind(position.entry_time)
        .bind(position.current_price)
        .bind(position.unrealized_pnl)
        .bind(position.max_profit_pct)
        .bind(position.max_drawdown_pct)
        .bind(position.exit_price)
        .bind(position.exit_time)
        .bind(position.exit_reason.map(|r| r.as_str()))
        .bind(position.realized_pnl)
        .bind(position.commission)
        .execute(&mut *tx)
        .await?;

        for contributor in contributors {
            sqlx::query(
                "INSERT INTO position_contributors (position_id, user_id, contributed, commission_rate) \
                 VALUES ($1, $2, $3, $4)",
            )
            .bind(position.id)
            .bind(contributor.user_id)
            .bind(contributor.contributed)
            .bind(contributor.commission_rate)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn update_position_mark(&self, position: &Position) -> Result<(), DbError> {
        sqlx::query(
            "UPDATE positions SET current_price = $2, unrealized_pnl = $3, max_profit_pct = $4, \
             max_drawdown_pct = $5 WHERE id = $1 AND status = 'OPEN'",
        )
        .bind(position.id)
        .bind(position.current_price)
        .bind(position.unrealized_pnl)
        .bind(position.max_profit_pct)
        .bind(position.max_drawdown_pct)
        .execute(self.router.primary())
        .await?;
        Ok(())
    }

    async fn reduce_position(&self, position: &Position) -> Result<(), DbError> {
        let updated = sqlx::query(
            "UPDATE positions SET quantity = $2, notional = $3, realized_pnl = $4, unrealized_pnl = $5 \
             WHERE id = $1 AND status = 'OPEN'",
        )
        .bind(position.id)
        .bind(position.quantity)
        .bind(position.notional)
        .bind(position.realized_pnl)
        .bind(position.unrealized_pnl)
        .execute(self.router.primary())
        .await?;
        if updated.rows_affected() == 0 {
            return Err(DbError::NotFound);
        }
        Ok(())
    }

    async fn record_execution_attempt(&self, attempt: &ExecutionAttempt) -> Result<(), DbError> {
        sqlx::query(
            r#"
            INSERT INTO execution_attempts (
                id, user_id, position_id, signal_id, exchange, symbol, side, reduce_only,
                requested_qty, filled_qty, requested_price, avg_price, slippage,
                exchange_order_id, success, error, created_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17)
            ON CONFLICT (id) DO NOTHING
            "#,
        )
        .bind(attempt.id)
        .bind(attempt.user_id)
        .bind(attempt.position_id)
        .bind(attempt.signal_id)
        .bind(attempt.exchange.as_str())
        .bind(&attempt.symbol)
        .bind(order_side_str(attempt.side))
        .bind(attempt.reduce_only)
        .bind(attempt.requested_qty)
        .bind(attempt.filled_qty)
        .bind(attempt.requested_price)
        .bind(attempt.avg_price)
        .bind(attempt.slippage)
        .bind(&attempt.order_id)
        .bind(attempt.success)
        .bind(&attempt.error)
        .bind(attempt.created_at)
        .execute(self.router.primary())
        .await?;
        Ok(())
    }

    async fn position_contributors(&self, position_id: Uuid) -> Result<Vec<Contributor>, DbError> {
        let rows = sqlx::query(
            "SELECT user_id, contributed, commission_rate FROM position_contributors \
             WHERE position_id = $1 ORDER BY contributed DESC, user_id",
        )
        .bind(position_id)
        .fetch_all(self.router.primary())
        .await?;
        rows.iter()
            .map(|row| -> Result<Contributor, DbError> {
                Ok(Contributor {
                    user_id: row.try_get("user_id")?,
                    contributed: row.try_get("contributed")?,
                    commission_rate: row.try_get("commission_rate")?,
                })
            })
            .collect()
    }

    async fn settle_position(&self, settlement: &Settlement) -> Result<(), DbError> {
        let position = &settlement.position;
        let mut tx = self.router.primary().begin().await?;

        // The status guard makes a second settlement of the same position a no-op.
        let closed = sqlx::query(
            "UPDATE positions SET status = 'CLOSED', exit_price = $2, exit_time = $3, exit_reason = $4, \
             realized_pnl = $5, commission = $6, current_price = $7, unrealized_pnl = 0 \
             WHERE id = $1 AND status = 'OPEN'",
        )
        .bind(position.id)
        .bind(position.exit_price)
        .bind(position.exit_time)
        .bind(position.exit_reason.map(|r| r.as_str()))
        .bind(position.realized_pnl)
        .bind(position.commission)
        .bind(position.current_price)
        .execute(&mut *tx)
        .await?;
        if closed.rows_affected() == 0 {
            tx.rollback().await?;
            return Err(DbError::AlreadySettled(position.id));
        }

        for d in &settlement.distributions {
            sqlx::query(
                "INSERT INTO distributions (id, position_id, user_id, contributed, share_pct, raw_pnl, \
                 commission, net_pnl, created_at) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)",
            )
            .bind(d.id)
            .bind(d.position_id)
            .bind(d.user_id)
            .bind(d.contributed)
            .bind(d.share_pct)
            .bind(d.raw_pnl)
            .bind(d.commission)
            .bind(d.net_pnl)
            .bind(d.created_at)
            .execute(&mut *tx)
            .await?;
        }

        for change in &settlement.balance_changes {
            sqlx::query(
                "INSERT INTO user_balances (user_id, currency, real_balance) VALUES ($1, $2, $3) \
                 ON CONFLICT (user_id, currency) DO UPDATE \
                 SET real_balance = user_balances.real_balance + EXCLUDED.real_balance, updated_at = NOW()",
            )
            .bind(change.user_id)
            .bind(&change.currency)
            .bind(change.amount)
            .execute(&mut *tx)
            .await?;

            sqlx::query(
                "INSERT INTO balance_changes (id, user_id, position_id, currency, amount, reason, created_at) \
                 VALUES ($1, $2, $3, $4, $5, $6, $7)",
            )
            .bind(change.id)
            .bind(change.user_id)
            .bind(change.position_id)
            .bind(&change.currency)
            .bind(change.amount)
            .bind(&change.reason)
            .bind(change.created_at)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn distributions_for_position(&self, position_id: Uuid) -> Result<Vec<Distribution>, DbError> {
        self.read(|pool| fetch_distributions(pool, position_id)).await
    }

    async fn suspend_user(&self, user_id: Uuid, reason: &str) -> Result<(), DbError> {
        let updated = sqlx::query(
            "UPDATE users SET trading_suspended = TRUE, suspension_reason = $2, updated_at = NOW() WHERE id = $1",
        )
        .bind(user_id)
        .bind(reason)
        .execute(self.router.primary())
        .await?;
        if updated.rows_affected() == 0 {
            return Err(DbError::NotFound);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stored_enum_text_round_trips_through_from_str() {
        assert_eq!(parse::<PositionSide>("side", "SHORT").unwrap(), PositionSide::Short);
        assert_eq!(parse::<ExchangeId>("exchange", "bybit").unwrap(), ExchangeId::Bybit);
        assert!(matches!(
            parse::<PositionStatus>("status", "PENDING"),
            Err(DbError::InvalidData(_))
        ));
    }

    #[test]
    fn column_list_matches_insert_placeholders() {
        assert_eq!(POSITION_COLUMNS.split(',').count(), 22);
    }
}
