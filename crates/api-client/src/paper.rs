use crate::ExchangeConnector;
use crate::error::ApiError;
use async_trait::async_trait;
use configuration::PaperConfig;
use core_types::{
    ExchangeId, InstrumentInfo, OrderAck, OrderFill, OrderRequest, OrderSide, OrderStatus,
};
use rust_decimal::Decimal;
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

/// How the paper venue treats the next order it receives.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum FillBehaviour {
    /// Filled completely straight away.
    Fill,
    /// Only this fraction of the quantity ever fills; the rest stays working.
    Partial(Decimal),
    /// Refused at submission.
    Reject,
    /// Accepted but never filled.
    Unfilled,
}

#[derive(Default)]
struct Book {
    balances: HashMap<String, Decimal>,
    marks: HashMap<String, Decimal>,
    instruments: HashMap<String, InstrumentInfo>,
    orders: HashMap<String, OrderFill>,
    placed: Vec<OrderRequest>,
    leverage: HashMap<String, u8>,
    script: VecDeque<FillBehaviour>,
}

/// An in-process exchange account. Market orders fill against the stored mark price
/// (or the order's expected price) moved against the trader by a fixed slippage.
pub struct PaperExchange {
    exchange: ExchangeId,
    config: PaperConfig,
    book: Mutex<Book>,
    next_id: AtomicU64,
    unreachable: AtomicBool,
}

impl PaperExchange {
    pub fn new(exchange: ExchangeId, config: PaperConfig) -> Self {
        Self {
            exchange,
            config,
            book: Mutex::new(Book::default()),
            next_id: AtomicU64::new(1),
            unreachable: AtomicBool::new(false),
        }
    }

    fn book(&self) -> Result<std::sync::MutexGuard<'_, Book>, ApiError> {
        self.book
            .lock()
            .map_err(|_| ApiError::Unavailable("paper book lock poisoned".into()))
    }

    fn check_reachable(&self) -> Result<(), ApiError> {
        if self.unreachable.load(Ordering::SeqCst) {
            return Err(ApiError::Unavailable(format!("{} paper venue is offline", self.exchange)));
        }
        Ok(())
    }

    pub fn set_balance(&self, asset: &str, amount: Decimal) {
        if let Ok(mut book) = self.book() {
            book.balances.insert(asset.to_string(), amount);
        }
    }

    pub fn set_mark_price(&self, symbol: &str, price: Decimal) {
        if let Ok(mut book) = self.book() {
            book.marks.insert(symbol.to_string(), price);
        }
    }

    pub fn set_instrument(&self, info: InstrumentInfo) {
        if let Ok(mut book) = self.book() {
            book.instruments.insert(info.symbol.clone(), info);
        }
    }

    /// Queues the behaviour for the next order. Unscripted orders fill.
    pub fn script(&self, behaviour: FillBehaviour) {
        if let Ok(mut book) = self.book() {
            book.script.push_back(behaviour);
        }
    }

    /// While set, every call fails as if the venue could not be reached.
    pub fn set_unreachable(&self, unreachable: bool) {
        self.unreachable.store(unreachable, Ordering::SeqCst);
    }

    /// Every order submitted so far, in order.
    pub fn placed_orders(&self) -> Vec<OrderRequest> {
        self.book().map(|b| b.placed.clone()).unwrap_or_default()
    }

    pub fn leverage_for(&self, symbol: &str) -> Option<u8> {
        self.book().ok().and_then(|b| b.leverage.get(symbol).copied())
    }

    fn fill_price(&self, reference: Decimal, side: OrderSide) -> Decimal {
        match side {
            OrderSide::Buy => reference * (Decimal::ONE + self.config.slippage_pct),
            OrderSide::Sell => reference * (Decimal::ONE - self.config.slippage_pct),
        }
    }
}

#[async_trait]
impl ExchangeConnector for PaperExchange {
    fn exchange(&self) -> ExchangeId {
        self.exchange
    }

    async fn get_balance(&self, asset: &str) -> Result<Decimal, ApiError> {
        self.check_reachable()?;
        let book = self.book()?;
        Ok(book
            .balances
            .get(asset)
            .copied()
            .unwrap_or(self.config.starting_balance))
    }

    async fn place_order(&self, order: &OrderRequest) -> Result<OrderAck, ApiError> {
        self.check_reachable()?;
        let mut book = self.book()?;
        book.placed.push(order.clone());
        let behaviour = book.script.pop_front().unwrap_or(FillBehaviour::Fill);

        if behaviour == FillBehaviour::Reject {
            return Err(ApiError::OrderRejected(format!(
                "paper venue refused {} {}",
                order.quantity, order.symbol
            )));
        }

        let reference = order
            .expected_price
            .or_else(|| book.marks.get(&order.symbol).copied())
            .ok_or_else(|| ApiError::UnknownInstrument(order.symbol.clone()))?;
        let price = self.fill_price(reference, order.side);

        let order_id = format!("paper-{}", self.next_id.fetch_add(1, Ordering::SeqCst));
        let (status, filled_qty) = match behaviour {
            FillBehaviour::Partial(fraction) => (OrderStatus::PartiallyFilled, order.quantity * fraction),
            FillBehaviour::Unfilled => (OrderStatus::New, Decimal::ZERO),
            _ => (OrderStatus::Filled, order.quantity),
        };
        book.orders.insert(
            order_id.clone(),
            OrderFill {
                order_id: order_id.clone(),
                status,
                filled_qty,
                avg_price: (filled_qty > Decimal::ZERO).then_some(price),
            },
        );

        Ok(OrderAck {
            order_id,
            accepted: true,
        })
    }

    async fn get_order_fill(&self, _symbol: &str, order_id: &str) -> Result<OrderFill, ApiError> {
        self.check_reachable()?;
        self.book()?
            .orders
            .get(order_id)
            .cloned()
            .ok_or_else(|| ApiError::InvalidData(format!("order {order_id} not found")))
    }

    async fn get_instrument_info(&self, symbol: &str) -> Result<InstrumentInfo, ApiError> {
        self.check_reachable()?;
        let book = self.book()?;
        Ok(book.instruments.get(symbol).cloned().unwrap_or_else(|| InstrumentInfo {
            symbol: symbol.to_string(),
            min_qty: self.config.min_qty,
            max_qty: self.config.max_qty,
            qty_step: self.config.qty_step,
        }))
    }

    async fn get_mark_price(&self, symbol: &str) -> Result<Decimal, ApiError> {
        self.check_reachable()?;
        self.book()?
            .marks
            .get(symbol)
            .copied()
            .ok_or_else(|| ApiError::UnknownInstrument(symbol.to_string()))
    }

    async fn set_leverage(&self, symbol: &str, leverage: u8) -> Result<(), ApiError> {
        self.check_reachable()?;
        self.book()?.leverage.insert(symbol.to_string(), leverage);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use uuid::Uuid;

    fn order(side: OrderSide, quantity: Decimal) -> OrderRequest {
        OrderRequest {
            client_order_id: Uuid::new_v4(),
            symbol: "BTCUSDT".into(),
            side,
            quantity,
            reduce_only: false,
            expected_price: None,
        }
    }

    #[tokio::test]
    async fn fills_against_mark_with_adverse_slippage() {
        let venue = PaperExchange::new(ExchangeId::Paper, PaperConfig::default());
        venue.set_mark_price("BTCUSDT", dec!(100));

        let ack = venue.place_order(&order(OrderSide::Buy, dec!(1))).await.unwrap();
        let fill = venue.get_order_fill("BTCUSDT", &ack.order_id).await.unwrap();
        assert_eq!(fill.status, OrderStatus::Filled);
        assert_eq!(fill.avg_price, Some(dec!(100.0500)));

        let ack = venue.place_order(&order(OrderSide::Sell, dec!(1))).await.unwrap();
        let fill = venue.get_order_fill("BTCUSDT", &ack.order_id).await.unwrap();
        assert_eq!(fill.avg_price, Some(dec!(99.9500)));
    }

    #[tokio::test]
    async fn scripted_behaviours_apply_in_order() {
        let venue = PaperExchange::new(ExchangeId::Paper, PaperConfig::default());
        venue.set_mark_price("BTCUSDT", dec!(100));
        venue.script(FillBehaviour::Reject);
        venue.script(FillBehaviour::Partial(dec!(0.4)));

        assert!(matches!(
            venue.place_order(&order(OrderSide::Buy, dec!(1))).await,
            Err(ApiError::OrderRejected(_))
        ));
        let ack = venue.place_order(&order(OrderSide::Buy, dec!(1))).await.unwrap();
        let fill = venue.get_order_fill("BTCUSDT", &ack.order_id).await.unwrap();
        assert_eq!(fill.status, OrderStatus::PartiallyFilled);
        assert_eq!(fill.filled_qty, dec!(0.4));
        assert_eq!(venue.placed_orders().len(), 2);
    }

    #[tokio::test]
    async fn offline_venue_reports_unavailable() {
        let venue = PaperExchange::new(ExchangeId::Paper, PaperConfig::default());
        venue.set_unreachable(true);
        let err = venue.get_balance("USDT").await.unwrap_err();
        assert!(err.is_transient());
    }
}
