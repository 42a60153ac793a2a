use crate::error::ExecutorError;
use crate::fill::{FillVerifier, VerifiedFill};
use crate::quantity::{InstrumentCache, normalize_quantity};
use api_client::error::ApiError;
use api_client::{ConnectorFactory, ExchangeConnector, RetryPolicy, retry_with_backoff, with_timeout};
use chrono::Utc;
use configuration::ExecutionSettings;
use core_types::{
    ExchangeId, ExecutionAttempt, OrderRequest, Position, PositionSide, Signal, TradeReport,
    UserProfile,
};
use futures::future::join_all;
use rust_decimal::Decimal;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

/// Everything needed to open one user's position on each target exchange.
#[derive(Debug, Clone, Copy)]
pub struct OpenRequest<'a> {
    pub user: &'a UserProfile,
    pub signal: &'a Signal,
    pub side: PositionSide,
    pub quote_currency: &'a str,
    /// Upper bound on the notional of a single position.
    pub max_notional: Decimal,
}

/// A leg whose order filled well enough to count.
#[derive(Debug, Clone, PartialEq)]
pub struct FilledLeg {
    pub fill: VerifiedFill,
    /// Positive when the fill was worse than the reference price.
    pub slippage: Decimal,
    pub notional: Decimal,
}

/// The result of one order placement on one exchange, with its audit record.
#[derive(Debug)]
pub struct LegOutcome {
    pub exchange: ExchangeId,
    pub attempt: ExecutionAttempt,
    pub result: Result<FilledLeg, ExecutorError>,
    /// The reduce-only order sent back for an opening fill too small to keep.
    pub unwind: Option<ExecutionAttempt>,
}

impl LegOutcome {
    pub fn succeeded(&self) -> bool {
        self.result.is_ok()
    }

    pub fn to_report(&self) -> TradeReport {
        match &self.result {
            Ok(leg) => TradeReport {
                user_id: self.attempt.user_id,
                exchange: Some(self.exchange),
                success: true,
                order_id: Some(leg.fill.order_id.clone()),
                filled_qty: Some(leg.fill.filled_qty),
                slippage: Some(leg.slippage),
                category: None,
                message: format!(
                    "filled {} {} @ {} ({}% of requested)",
                    leg.fill.filled_qty, self.attempt.symbol, leg.fill.avg_price, leg.fill.fill_pct
                ),
            },
            Err(e) => TradeReport {
                user_id: self.attempt.user_id,
                exchange: Some(self.exchange),
                success: false,
                order_id: self.attempt.order_id.clone(),
                filled_qty: None,
                slippage: None,
                category: Some(e.code().to_string()),
                message: e.to_string(),
            },
        }
    }
}

/// What an opening order left on the exchange when it missed the fill minimum.
#[derive(Debug)]
struct PartialOpen {
    order_id: String,
    requested_qty: Decimal,
    filled_qty: Decimal,
    avg_price: Decimal,
}

/// "M of N legs succeeded".
pub fn summarize_legs(legs: &[LegOutcome]) -> String {
    let succeeded = legs.iter().filter(|l| l.succeeded()).count();
    format!("{succeeded} of {} legs succeeded", legs.len())
}

/// Slippage of `actual` against `expected`, signed so that positive is adverse.
pub fn signed_slippage(expected: Decimal, actual: Decimal, buying: bool) -> Decimal {
    if expected.is_zero() {
        return Decimal::ZERO;
    }
    let raw = (actual - expected) / expected;
    if buying { raw } else { -raw }
}

/// Sizes, normalises, submits and verifies orders for one user at a time.
///
/// It never touches the store: callers persist the returned attempts and
/// register positions from the successful legs.
pub struct ExecutionOrchestrator {
    factory: Arc<dyn ConnectorFactory>,
    instruments: InstrumentCache,
    verifier: FillVerifier,
    retry: RetryPolicy,
    call_timeout: Duration,
    min_notional: Decimal,
}

impl ExecutionOrchestrator {
    pub fn new(
        factory: Arc<dyn ConnectorFactory>,
        settings: &ExecutionSettings,
        min_notional: Decimal,
    ) -> Self {
        Self {
            factory,
            instruments: InstrumentCache::new(settings.instrument_cache_ttl()),
            verifier: FillVerifier::from_settings(settings),
            retry: RetryPolicy::from(&settings.retry),
            call_timeout: settings.exchange_call_timeout(),
            min_notional,
        }
    }

    pub fn connector(
        &self,
        user: &UserProfile,
        exchange: ExchangeId,
    ) -> Result<Arc<dyn ExchangeConnector>, ExecutorError> {
        Ok(self.factory.connector(user, exchange)?)
    }

    /// An idempotent exchange read: bounded retries, each try under the call timeout.
    async fn read<T, F, Fut>(&self, operation: &str, mut call: F) -> Result<T, ApiError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ApiError>>,
    {
        retry_with_backoff(&self.retry, operation, ApiError::is_transient, || {
            with_timeout(self.call_timeout, operation, call())
        })
        .await
    }

    /// Current mark price of `symbol` on one of the user's exchanges.
    pub async fn mark_price(
        &self,
        user: &UserProfile,
        exchange: ExchangeId,
        symbol: &str,
    ) -> Result<Decimal, ExecutorError> {
        let connector = self.connector(user, exchange)?;
        let price = self
            .read("get_mark_price", || connector.get_mark_price(symbol))
            .await?;
        if price <= Decimal::ZERO {
            return Err(ExecutorError::InvalidPrice(price));
        }
        Ok(price)
    }

    /// The signal's exchange when the user has it enabled, otherwise every enabled
    /// exchange up to the user's simultaneous-exchange limit.
    pub fn resolve_targets(
        &self,
        user: &UserProfile,
        signal: &Signal,
    ) -> Result<Vec<ExchangeId>, ExecutorError> {
        let enabled = user.enabled_exchanges();
        if let Some(explicit) = signal.exchange {
            return if enabled.contains(&explicit) {
                Ok(vec![explicit])
            } else {
                Err(ExecutorError::ExchangeNotEnabled(explicit))
            };
        }
        if enabled.is_empty() {
            return Err(ExecutorError::NoExchangesEnabled);
        }
        Ok(enabled
            .into_iter()
            .take(user.trading.max_simultaneous_exchanges)
            .collect())
    }

    /// Opens the position on every target exchange concurrently. Leg failures are
    /// isolated; only target resolution fails the whole call.
    pub async fn open(&self, request: OpenRequest<'_>) -> Result<Vec<LegOutcome>, ExecutorError> {
        let targets = self.resolve_targets(request.user, request.signal)?;
        let legs = join_all(targets.into_iter().map(|exchange| self.open_leg(request, exchange))).await;

        tracing::info!(
            user_id = %request.user.id,
            symbol = %request.signal.symbol,
            side = %request.side,
            "{}",
            summarize_legs(&legs)
        );
        Ok(legs)
    }

    async fn open_leg(&self, request: OpenRequest<'_>, exchange: ExchangeId) -> LegOutcome {
        let side = request.side.entry_side();
        let client_order_id = Uuid::new_v4();
        let mut attempt = ExecutionAttempt {
            id: client_order_id,
            user_id: request.user.id,
            position_id: None,
            signal_id: Some(request.signal.id),
            exchange,
            symbol: request.signal.symbol.clone(),
            side,
            reduce_only: false,
            requested_qty: Decimal::ZERO,
            filled_qty: Decimal::ZERO,
            requested_price: request.signal.price,
            avg_price: None,
            slippage: None,
            order_id: None,
            success: false,
            error: None,
            created_at: Utc::now(),
        };

        let mut unwind = None;
        let result = self
            .try_open_leg(request, exchange, client_order_id, &mut attempt, &mut unwind)
            .await;
        finish_attempt(&mut attempt, &result);
        if let Err(e) = &result {
            tracing::warn!(
                user_id = %request.user.id,
                %exchange,
                symbol = %request.signal.symbol,
                code = e.code(),
                error = %e,
                "open leg failed"
            );
        }
        LegOutcome {
            exchange,
            attempt,
            result,
            unwind,
        }
    }

    async fn try_open_leg(
        &self,
        request: OpenRequest<'_>,
        exchange: ExchangeId,
        client_order_id: Uuid,
        attempt: &mut ExecutionAttempt,
        unwind: &mut Option<ExecutionAttempt>,
    ) -> Result<FilledLeg, ExecutorError> {
        let connector = self.connector(request.user, exchange)?;
        let symbol = request.signal.symbol.as_str();
        let price = request.signal.price;

        let balance = self
            .read("get_balance", || connector.get_balance(request.quote_currency))
            .await?;
        let notional = (balance * request.user.trading.position_size_pct).min(request.max_notional);
        if notional < self.min_notional {
            return Err(ExecutorError::InsufficientBalance {
                required: self.min_notional,
                available: notional,
            });
        }

        let info = self
            .instruments
            .get_or_fetch(exchange, symbol, || {
                self.read("get_instrument_info", || connector.get_instrument_info(symbol))
            })
            .await?;
        let quantity = normalize_quantity(notional, price, &info)?;
        attempt.requested_qty = quantity;

        let leverage = request.user.trading.leverage;
        if let Err(e) = with_timeout(
            self.call_timeout,
            "set_leverage",
            connector.set_leverage(symbol, leverage),
        )
        .await
        {
            tracing::warn!(user_id = %request.user.id, %exchange, symbol, leverage, error = %e, "could not set leverage, continuing with the account setting");
        }

        let order = OrderRequest {
            client_order_id,
            symbol: symbol.to_string(),
            side: attempt.side,
            quantity,
            reduce_only: false,
            expected_price: Some(price),
        };
        let result = self
            .submit_and_verify(connector.as_ref(), &order, &self.verifier, attempt)
            .await;
        let stranded = result.as_ref().err().and_then(ExecutorError::partial_fill);
        match stranded {
            Some((filled_qty, avg_price)) => {
                let fill = PartialOpen {
                    order_id: attempt.order_id.clone().unwrap_or_default(),
                    requested_qty: quantity,
                    filled_qty,
                    avg_price: avg_price.unwrap_or(price),
                };
                self.unwind_partial_open(connector.as_ref(), request, exchange, fill, result, unwind)
                    .await
            }
            None => result,
        }
    }

    /// An opening order ended with a fill below the accepted minimum. The filled
    /// part is sent back with a reduce-only order and the leg fails. If that order
    /// does not go through, whatever is still held is kept as the leg's position
    /// so the monitor manages it.
    async fn unwind_partial_open(
        &self,
        connector: &dyn ExchangeConnector,
        request: OpenRequest<'_>,
        exchange: ExchangeId,
        fill: PartialOpen,
        opened: Result<FilledLeg, ExecutorError>,
        record: &mut Option<ExecutionAttempt>,
    ) -> Result<FilledLeg, ExecutorError> {
        let side = request.side.exit_side();
        let client_order_id = Uuid::new_v4();
        let mut attempt = ExecutionAttempt {
            id: client_order_id,
            user_id: request.user.id,
            position_id: None,
            signal_id: Some(request.signal.id),
            exchange,
            symbol: request.signal.symbol.clone(),
            side,
            reduce_only: true,
            requested_qty: fill.filled_qty,
            filled_qty: Decimal::ZERO,
            requested_price: fill.avg_price,
            avg_price: None,
            slippage: None,
            order_id: None,
            success: false,
            error: None,
            created_at: Utc::now(),
        };
        let order = OrderRequest {
            client_order_id,
            symbol: request.signal.symbol.clone(),
            side,
            quantity: fill.filled_qty,
            reduce_only: true,
            expected_price: Some(fill.avg_price),
        };
        let verifier = self.verifier.requiring(Decimal::ONE);
        let result = self
            .submit_and_verify(connector, &order, &verifier, &mut attempt)
            .await;
        finish_attempt(&mut attempt, &result);

        let unwound = match &result {
            Ok(leg) => leg.fill.filled_qty,
            Err(e) => e.partial_fill().map_or(Decimal::ZERO, |(qty, _)| qty),
        };
        *record = Some(attempt);
        let held = fill.filled_qty - unwound;
        if held <= Decimal::ZERO {
            tracing::warn!(
                user_id = %request.user.id,
                %exchange,
                symbol = %request.signal.symbol,
                quantity = %fill.filled_qty,
                "partial opening fill below the minimum was unwound"
            );
            return opened;
        }

        tracing::error!(
            user_id = %request.user.id,
            %exchange,
            symbol = %request.signal.symbol,
            held = %held,
            "CRITICAL: could not unwind a partial opening fill, keeping it as a position"
        );
        let fill_pct = if fill.requested_qty > Decimal::ZERO {
            (held / fill.requested_qty * Decimal::ONE_HUNDRED).round_dp(2)
        } else {
            Decimal::ONE_HUNDRED
        };
        let buying = request.side.entry_side().is_buy();
        Ok(FilledLeg {
            notional: held * fill.avg_price,
            slippage: signed_slippage(request.signal.price, fill.avg_price, buying),
            fill: VerifiedFill {
                order_id: fill.order_id,
                filled_qty: held,
                avg_price: fill.avg_price,
                fill_pct,
                complete: false,
            },
        })
    }

    /// Places a reduce-only market order for the whole position. The close only
    /// counts when the full quantity fills; otherwise the caller retries later.
    pub async fn close(
        &self,
        user: &UserProfile,
        position: &Position,
        reference_price: Decimal,
    ) -> LegOutcome {
        let side = position.side.exit_side();
        let client_order_id = Uuid::new_v4();
        let mut attempt = ExecutionAttempt {
            id: client_order_id,
            user_id: user.id,
            position_id: Some(position.id),
            signal_id: None,
            exchange: position.exchange,
            symbol: position.symbol.clone(),
            side,
            reduce_only: true,
            requested_qty: position.quantity,
            filled_qty: Decimal::ZERO,
            requested_price: reference_price,
            avg_price: None,
            slippage: None,
            order_id: None,
            success: false,
            error: None,
            created_at: Utc::now(),
        };

        let order = OrderRequest {
            client_order_id,
            symbol: position.symbol.clone(),
            side,
            quantity: position.quantity,
            reduce_only: true,
            expected_price: Some(reference_price),
        };
        let verifier = self.verifier.requiring(Decimal::ONE);
        let result = match self.connector(user, position.exchange) {
            Ok(connector) => {
                self.submit_and_verify(connector.as_ref(), &order, &verifier, &mut attempt)
                    .await
            }
            Err(e) => Err(e),
        };
        finish_attempt(&mut attempt, &result);
        if let Err(e) = &result {
            tracing::warn!(
                user_id = %user.id,
                position_id = %position.id,
                exchange = %position.exchange,
                code = e.code(),
                error = %e,
                "close order failed"
            );
        }
        LegOutcome {
            exchange: position.exchange,
            attempt,
            result,
            unwind: None,
        }
    }

    /// Submits once (orders are never retried), then verifies the fill.
    async fn submit_and_verify(
        &self,
        connector: &dyn ExchangeConnector,
        order: &OrderRequest,
        verifier: &FillVerifier,
        attempt: &mut ExecutionAttempt,
    ) -> Result<FilledLeg, ExecutorError> {
        let ack = with_timeout(self.call_timeout, "place_order", connector.place_order(order)).await?;
        attempt.order_id = Some(ack.order_id.clone());
        if !ack.accepted {
            return Err(ExecutorError::OrderRejected(format!(
                "order {} was not accepted",
                ack.order_id
            )));
        }

        let fill = verifier
            .verify(connector, &order.symbol, &ack.order_id, order.quantity)
            .await?;
        let expected = order.expected_price.unwrap_or(fill.avg_price);
        let slippage = signed_slippage(expected, fill.avg_price, order.side.is_buy());
        Ok(FilledLeg {
            notional: fill.filled_qty * fill.avg_price,
            slippage,
            fill,
        })
    }
}

fn finish_attempt(attempt: &mut ExecutionAttempt, result: &Result<FilledLeg, ExecutorError>) {
    match result {
        Ok(leg) => {
            attempt.success = true;
            attempt.filled_qty = leg.fill.filled_qty;
            attempt.avg_price = Some(leg.fill.avg_price);
            attempt.slippage = Some(leg.slippage);
        }
        Err(e) => {
            attempt.success = false;
            attempt.error = Some(format!("{}: {}", e.code(), e));
            if let Some((filled_qty, avg_price)) = e.partial_fill() {
                attempt.filled_qty = filled_qty;
                attempt.avg_price = avg_price;
            }
        }
    }
}
