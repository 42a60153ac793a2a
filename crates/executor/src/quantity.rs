use crate::error::ExecutorError;
use api_client::error::ApiError;
use core_types::{ExchangeId, InstrumentInfo};
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time::Instant;

/// Rounds a quantity down to the nearest multiple of the step size.
pub fn round_quantity_to_step(quantity: Decimal, step: Decimal) -> Decimal {
    if step <= Decimal::ZERO {
        return quantity;
    }
    ((quantity / step).floor() * step).normalize()
}

/// Converts a target notional at `price` into an exchange-valid quantity.
///
/// The quantity is floored to `qty_step`. A result below `min_qty` fails the leg;
/// a result above `max_qty` is clamped to the largest step multiple not exceeding it.
pub fn normalize_quantity(
    notional: Decimal,
    price: Decimal,
    info: &InstrumentInfo,
) -> Result<Decimal, ExecutorError> {
    if price <= Decimal::ZERO {
        return Err(ExecutorError::InvalidPrice(price));
    }
    if info.qty_step <= Decimal::ZERO || info.max_qty < info.min_qty {
        return Err(ExecutorError::InvalidInstrument {
            symbol: info.symbol.clone(),
            reason: format!(
                "step {} / min {} / max {}",
                info.qty_step, info.min_qty, info.max_qty
            ),
        });
    }

    let quantity = round_quantity_to_step(notional / price, info.qty_step);
    if quantity < info.min_qty || quantity.is_zero() {
        return Err(ExecutorError::BelowMinimumQuantity {
            quantity,
            min_qty: info.min_qty,
        });
    }
    if quantity > info.max_qty {
        return Ok(round_quantity_to_step(info.max_qty, info.qty_step));
    }
    Ok(quantity)
}

/// Instrument metadata per (exchange, symbol), refreshed after `ttl`.
pub struct InstrumentCache {
    ttl: Duration,
    entries: RwLock<HashMap<(ExchangeId, String), (InstrumentInfo, Instant)>>,
}

impl InstrumentCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: RwLock::new(HashMap::new()),
        }
    }

    pub async fn get(&self, exchange: ExchangeId, symbol: &str) -> Option<InstrumentInfo> {
        let entries = self.entries.read().await;
        entries
            .get(&(exchange, symbol.to_string()))
            .filter(|(_, fetched_at)| fetched_at.elapsed() < self.ttl)
            .map(|(info, _)| info.clone())
    }

    /// Returns the cached entry, or runs `fetch` and caches its result.
    pub async fn get_or_fetch<F, Fut>(
        &self,
        exchange: ExchangeId,
        symbol: &str,
        fetch: F,
    ) -> Result<InstrumentInfo, ApiError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<InstrumentInfo, ApiError>>,
    {
        if let Some(info) = self.get(exchange, symbol).await {
            return Ok(info);
        }
        let info = fetch().await?;
        tracing::debug!(%exchange, symbol, min_qty = %info.min_qty, step = %info.qty_step, "instrument metadata refreshed");
        self.entries
            .write()
            .await
            .insert((exchange, symbol.to_string()), (info.clone(), Instant::now()));
        Ok(info)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn btc() -> InstrumentInfo {
        InstrumentInfo {
            symbol: "BTCUSDT".into(),
            min_qty: dec!(0.001),
            max_qty: dec!(120),
            qty_step: dec!(0.001),
        }
    }

    #[test]
    fn floors_to_step() {
        // 1000 / 64000 = 0.015625
        assert_eq!(normalize_quantity(dec!(1000), dec!(64000), &btc()).unwrap(), dec!(0.015));
    }

    #[test]
    fn tiny_notional_is_below_minimum() {
        let err = normalize_quantity(dec!(5), dec!(50000), &btc()).unwrap_err();
        assert_eq!(err.code(), "BELOW_MINIMUM_QUANTITY");
    }

    #[test]
    fn oversized_quantity_is_clamped_to_a_step_multiple() {
        let info = InstrumentInfo {
            max_qty: dec!(10.0005),
            ..btc()
        };
        let quantity = normalize_quantity(dec!(1_000_000), dec!(100), &info).unwrap();
        assert_eq!(quantity, dec!(10));
        assert!(quantity <= info.max_qty);
        assert!((quantity / info.qty_step).fract().is_zero());
    }

    #[test]
    fn rejects_non_positive_price() {
        assert!(matches!(
            normalize_quantity(dec!(100), Decimal::ZERO, &btc()),
            Err(ExecutorError::InvalidPrice(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn cache_refetches_after_ttl() {
        let cache = InstrumentCache::new(Duration::from_secs(3600));
        let fetches = AtomicU32::new(0);
        let fetch = || async {
            fetches.fetch_add(1, Ordering::SeqCst);
            Ok(btc())
        };

        cache.get_or_fetch(ExchangeId::Binance, "BTCUSDT", fetch).await.unwrap();
        cache.get_or_fetch(ExchangeId::Binance, "BTCUSDT", fetch).await.unwrap();
        assert_eq!(fetches.load(Ordering::SeqCst), 1);

        tokio::time::advance(Duration::from_secs(3601)).await;
        cache.get_or_fetch(ExchangeId::Binance, "BTCUSDT", fetch).await.unwrap();
        assert_eq!(fetches.load(Ordering::SeqCst), 2);
    }
}
