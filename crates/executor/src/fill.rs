use crate::error::ExecutorError;
use api_client::{ExchangeConnector, RetryPolicy, retry_with_backoff, with_timeout};
use api_client::error::ApiError;
use configuration::ExecutionSettings;
use core_types::{OrderFill, OrderStatus};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::time::Duration;
use tokio::time::Instant;

/// A fill that was accepted, completely or partially.
#[derive(Debug, Clone, PartialEq)]
pub struct VerifiedFill {
    pub order_id: String,
    pub filled_qty: Decimal,
    pub avg_price: Decimal,
    /// Percent of the requested quantity that filled, 0 to 100.
    pub fill_pct: Decimal,
    pub complete: bool,
}

/// Polls an order until it fills, dies, or the verification window closes.
#[derive(Debug, Clone)]
pub struct FillVerifier {
    pub window: Duration,
    pub poll_interval: Duration,
    pub call_timeout: Duration,
    /// Smallest accepted fraction of the requested quantity, 0 to 1.
    pub min_partial_fill_pct: Decimal,
    pub retry: RetryPolicy,
}

impl FillVerifier {
    pub fn from_settings(settings: &ExecutionSettings) -> Self {
        Self {
            window: settings.fill_timeout(),
            poll_interval: settings.fill_poll_interval(),
            call_timeout: settings.exchange_call_timeout(),
            min_partial_fill_pct: settings.min_partial_fill_pct,
            retry: RetryPolicy::from(&settings.retry),
        }
    }

    /// The same verifier with a different partial-fill floor; closes demand 1.
    pub fn requiring(&self, min_partial_fill_pct: Decimal) -> Self {
        Self {
            min_partial_fill_pct,
            ..self.clone()
        }
    }

    /// Polls until the order settles. The whole verification, retries included,
    /// is bounded by `window`; the last observed fill is judged when it closes.
    pub async fn verify(
        &self,
        connector: &dyn ExchangeConnector,
        symbol: &str,
        order_id: &str,
        requested_qty: Decimal,
    ) -> Result<VerifiedFill, ExecutorError> {
        let deadline = Instant::now() + self.window;
        let mut last: Option<OrderFill> = None;

        let polling = self.poll(connector, symbol, order_id, &mut last);
        if let Ok(Err(e)) = tokio::time::timeout_at(deadline, polling).await {
            return Err(e);
        }

        self.judge(order_id, requested_qty, last)
    }

    /// Returns once the order is filled or terminal. Never returns on its own
    /// while the order is still working; the caller's deadline ends it.
    async fn poll(
        &self,
        connector: &dyn ExchangeConnector,
        symbol: &str,
        order_id: &str,
        last: &mut Option<OrderFill>,
    ) -> Result<(), ExecutorError> {
        loop {
            let polled = retry_with_backoff(&self.retry, "order_fill", ApiError::is_transient, || {
                with_timeout(
                    self.call_timeout,
                    "get_order_fill",
                    connector.get_order_fill(symbol, order_id),
                )
            })
            .await;

            match polled {
                Ok(fill) => {
                    let status = fill.status;
                    let has_fill = fill.filled_qty > Decimal::ZERO;
                    *last = Some(fill);
                    if status == OrderStatus::Filled {
                        return Ok(());
                    }
                    if status.is_terminal() {
                        // Cancelled or expired after a partial fill is judged on what filled.
                        if !has_fill {
                            return Err(ExecutorError::OrderRejected(format!(
                                "order {order_id} ended as {status:?}"
                            )));
                        }
                        return Ok(());
                    }
                }
                Err(e) if e.is_transient() => {
                    tracing::warn!(order_id, error = %e, "fill query failed, polling again");
                }
                Err(e) => return Err(e.into()),
            }

            tokio::time::sleep(self.poll_interval).await;
        }
    }

    fn judge(
        &self,
        order_id: &str,
        requested_qty: Decimal,
        last: Option<OrderFill>,
    ) -> Result<VerifiedFill, ExecutorError> {
        let Some(fill) = last else {
            return Err(ExecutorError::FillTimeout {
                order_id: order_id.to_string(),
                millis: self.window.as_millis(),
                filled_qty: Decimal::ZERO,
            });
        };
        let Some(avg_price) = fill.avg_price.filter(|_| fill.filled_qty > Decimal::ZERO) else {
            return Err(ExecutorError::FillTimeout {
                order_id: order_id.to_string(),
                millis: self.window.as_millis(),
                filled_qty: fill.filled_qty,
            });
        };

        let ratio = if requested_qty > Decimal::ZERO {
            (fill.filled_qty / requested_qty).min(Decimal::ONE)
        } else {
            Decimal::ONE
        };
        let fill_pct = (ratio * dec!(100)).round_dp(2);
        let complete = fill.status == OrderStatus::Filled || ratio >= Decimal::ONE;

        if !complete && ratio < self.min_partial_fill_pct {
            return Err(ExecutorError::PartialFillBelowThreshold {
                order_id: order_id.to_string(),
                fill_pct,
                filled_qty: fill.filled_qty,
                avg_price,
            });
        }

        Ok(VerifiedFill {
            order_id: fill.order_id,
            filled_qty: fill.filled_qty,
            avg_price,
            fill_pct,
            complete,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use api_client::{FillBehaviour, PaperExchange};
    use async_trait::async_trait;
    use configuration::PaperConfig;
    use core_types::{ExchangeId, InstrumentInfo, OrderAck, OrderRequest, OrderSide};
    use uuid::Uuid;

    /// Accepts the fill query and never answers it.
    struct SilentVenue;

    #[async_trait]
    impl ExchangeConnector for SilentVenue {
        fn exchange(&self) -> ExchangeId {
            ExchangeId::Paper
        }
        async fn get_balance(&self, _asset: &str) -> Result<Decimal, ApiError> {
            unreachable!()
        }
        async fn place_order(&self, _order: &OrderRequest) -> Result<OrderAck, ApiError> {
            unreachable!()
        }
        async fn get_order_fill(&self, _symbol: &str, _order_id: &str) -> Result<OrderFill, ApiError> {
            std::future::pending().await
        }
        async fn get_instrument_info(&self, _symbol: &str) -> Result<InstrumentInfo, ApiError> {
            unreachable!()
        }
        async fn get_mark_price(&self, _symbol: &str) -> Result<Decimal, ApiError> {
            unreachable!()
        }
        async fn set_leverage(&self, _symbol: &str, _leverage: u8) -> Result<(), ApiError> {
            unreachable!()
        }
    }

    fn verifier() -> FillVerifier {
        FillVerifier::from_settings(&ExecutionSettings::default())
    }

    async fn submit(venue: &PaperExchange, behaviour: FillBehaviour) -> String {
        venue.set_mark_price("BTCUSDT", dec!(50000));
        venue.script(behaviour);
        venue
            .place_order(&OrderRequest {
                client_order_id: Uuid::new_v4(),
                symbol: "BTCUSDT".into(),
                side: OrderSide::Buy,
                quantity: dec!(1),
                reduce_only: false,
                expected_price: None,
            })
            .await
            .unwrap()
            .order_id
    }

    #[tokio::test(start_paused = true)]
    async fn full_fill_is_complete() {
        let venue = PaperExchange::new(ExchangeId::Paper, PaperConfig::default());
        let order_id = submit(&venue, FillBehaviour::Fill).await;
        let fill = verifier().verify(&venue, "BTCUSDT", &order_id, dec!(1)).await.unwrap();
        assert!(fill.complete);
        assert_eq!(fill.fill_pct, dec!(100));
    }

    #[tokio::test(start_paused = true)]
    async fn partial_fill_above_floor_is_accepted_after_the_window() {
        let venue = PaperExchange::new(ExchangeId::Paper, PaperConfig::default());
        let order_id = submit(&venue, FillBehaviour::Partial(dec!(0.6))).await;
        let fill = verifier().verify(&venue, "BTCUSDT", &order_id, dec!(1)).await.unwrap();
        assert!(!fill.complete);
        assert_eq!(fill.fill_pct, dec!(60));
    }

    #[tokio::test(start_paused = true)]
    async fn small_partial_fill_fails() {
        let venue = PaperExchange::new(ExchangeId::Paper, PaperConfig::default());
        let order_id = submit(&venue, FillBehaviour::Partial(dec!(0.2))).await;
        let err = verifier().verify(&venue, "BTCUSDT", &order_id, dec!(1)).await.unwrap_err();
        assert_eq!(err.code(), "PARTIAL_FILL_BELOW_THRESHOLD");
    }

    #[tokio::test(start_paused = true)]
    async fn unfilled_order_times_out() {
        let venue = PaperExchange::new(ExchangeId::Paper, PaperConfig::default());
        let order_id = submit(&venue, FillBehaviour::Unfilled).await;
        let err = verifier().verify(&venue, "BTCUSDT", &order_id, dec!(1)).await.unwrap_err();
        assert_eq!(err.code(), "FILL_TIMEOUT");
    }

    #[tokio::test(start_paused = true)]
    async fn retries_of_a_hanging_query_stay_inside_the_window() {
        // 3 tries at a 5 s call timeout would take over 15 s on their own.
        let verifier = verifier();
        let started = Instant::now();
        let err = verifier
            .verify(&SilentVenue, "BTCUSDT", "42", dec!(1))
            .await
            .unwrap_err();

        let elapsed = started.elapsed();
        assert!(elapsed >= verifier.window);
        assert!(elapsed < verifier.window + Duration::from_millis(50), "took {elapsed:?}");
        assert!(matches!(
            err,
            ExecutorError::FillTimeout { filled_qty, .. } if filled_qty.is_zero()
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn a_rejected_partial_fill_reports_what_filled() {
        let venue = PaperExchange::new(ExchangeId::Paper, PaperConfig::default());
        let order_id = submit(&venue, FillBehaviour::Partial(dec!(0.3))).await;
        let err = verifier().verify(&venue, "BTCUSDT", &order_id, dec!(1)).await.unwrap_err();
        assert_eq!(err.partial_fill(), Some((dec!(0.3), Some(dec!(50025)))));
    }

    #[tokio::test(start_paused = true)]
    async fn closes_require_a_complete_fill() {
        let venue = PaperExchange::new(ExchangeId::Paper, PaperConfig::default());
        let order_id = submit(&venue, FillBehaviour::Partial(dec!(0.9))).await;
        let err = verifier()
            .requiring(Decimal::ONE)
            .verify(&venue, "BTCUSDT", &order_id, dec!(1))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "PARTIAL_FILL_BELOW_THRESHOLD");
    }
}
