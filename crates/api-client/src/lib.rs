//! Exchange connectivity: a uniform connector trait, signed REST clients for
//! Binance USD-M futures and Bybit v5 linear contracts, an in-process paper venue,
//! and the retry and timeout helpers every exchange call goes through.

use crate::auth::sign_request;
use crate::error::ApiError;
use async_trait::async_trait;
use core_types::{
    ExchangeId, InstrumentInfo, OrderAck, OrderFill, OrderRequest, OrderSide, OrderStatus,
};
use reqwest::header::{HeaderMap, HeaderValue};
use rust_decimal::Decimal;
use serde::{Deserialize, de::DeserializeOwned};
use std::collections::BTreeMap;

mod auth;
pub mod bybit;
pub mod error;
pub mod factory;
pub mod paper;
pub mod responses;
pub mod retry;

// --- Public API ---
pub use bybit::BybitClient;
pub use factory::{ConnectorFactory, LiveConnectorFactory, PaperConnectorFactory};
pub use paper::{FillBehaviour, PaperExchange};
pub use responses::{
    ApiErrorResponse, BalanceResponse, ExchangeInfoResponse, OrderResponse, PremiumIndexResponse,
    SymbolFilter,
};
pub use retry::{RetryPolicy, retry_with_backoff, with_timeout};

/// The uniform interface the engine uses to talk to one account on one exchange.
/// Live venues, the paper venue and test doubles all sit behind it.
#[async_trait]
pub trait ExchangeConnector: Send + Sync {
    fn exchange(&self) -> ExchangeId;

    /// Available balance of `asset` in the futures wallet. (Authenticated)
    async fn get_balance(&self, asset: &str) -> Result<Decimal, ApiError>;

    /// Submits a market order. Never retried by callers. (Authenticated)
    async fn place_order(&self, order: &OrderRequest) -> Result<OrderAck, ApiError>;

    /// Current fill state of a previously placed order. (Authenticated)
    async fn get_order_fill(&self, symbol: &str, order_id: &str) -> Result<OrderFill, ApiError>;

    /// Lot-size rules for `symbol`.
    async fn get_instrument_info(&self, symbol: &str) -> Result<InstrumentInfo, ApiError>;

    async fn get_mark_price(&self, symbol: &str) -> Result<Decimal, ApiError>;

    /// Sets the leverage for a given symbol. (Authenticated)
    async fn set_leverage(&self, symbol: &str, leverage: u8) -> Result<(), ApiError>;
}

pub(crate) fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

pub(crate) fn side_str(side: OrderSide) -> &'static str {
    match side {
        OrderSide::Buy => "BUY",
        OrderSide::Sell => "SELL",
    }
}

/// Maps a Binance order status string onto the normalised state.
fn binance_status(raw: &str) -> Result<OrderStatus, ApiError> {
    match raw {
        "NEW" => Ok(OrderStatus::New),
        "PARTIALLY_FILLED" => Ok(OrderStatus::PartiallyFilled),
        "FILLED" => Ok(OrderStatus::Filled),
        "CANCELED" => Ok(OrderStatus::Canceled),
        "REJECTED" => Ok(OrderStatus::Rejected),
        "EXPIRED" | "EXPIRED_IN_MATCH" => Ok(OrderStatus::Expired),
        other => Err(ApiError::InvalidData(format!("unknown order status: {other}"))),
    }
}

impl OrderResponse {
    fn into_fill(self) -> Result<OrderFill, ApiError> {
        let status = binance_status(&self.status)?;
        Ok(OrderFill {
            order_id: self.order_id.to_string(),
            status,
            filled_qty: self.executed_qty,
            avg_price: (self.avg_price > Decimal::ZERO).then_some(self.avg_price),
        })
    }
}

/// A concrete `ExchangeConnector` for Binance USD-M futures.
#[derive(Clone)]
pub struct BinanceClient {
    client: reqwest::Client,
    base_url: String,
    api_secret: String,
    recv_window_ms: u64,
}

impl BinanceClient {
    pub fn new(
        base_url: &str,
        api_key: &str,
        api_secret: &str,
        recv_window_ms: u64,
    ) -> Result<Self, ApiError> {
        let mut headers = HeaderMap::new();
        let key = HeaderValue::from_str(api_key)
            .map_err(|e| ApiError::Authentication(format!("invalid API key header: {e}")))?;
        headers.insert("X-MBX-APIKEY", key);

        Ok(Self {
            client: reqwest::Client::builder().default_headers(headers).build()?,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_secret: api_secret.to_string(),
            recv_window_ms,
        })
    }

    fn signed_url(&self, path: &str, params: &mut BTreeMap<&str, String>) -> Result<String, ApiError> {
        params.insert("timestamp", now_millis().to_string());
        params.insert("recvWindow", self.recv_window_ms.to_string());

        let query_string =
            serde_qs::to_string(params).map_err(|e| ApiError::InvalidData(e.to_string()))?;
        let signature = sign_request(&self.api_secret, &query_string);

        Ok(format!(
            "{}{}?{}&signature={}",
            self.base_url, path, query_string, signature
        ))
    }

    async fn parse<T: DeserializeOwned>(response: reqwest::Response) -> Result<T, ApiError> {
        let status = response.status();
        let text = response.text().await?;

        if status.is_success() {
            serde_json::from_str::<T>(&text).map_err(|e| ApiError::Deserialization(e.to_string()))
        } else if status.is_server_error() {
            Err(ApiError::Unavailable(format!("HTTP {status}: {text}")))
        } else {
            let api_error: ApiErrorResponse = serde_json::from_str(&text).map_err(|e| {
                ApiError::Deserialization(format!(
                    "Failed to deserialize error response: {}. Original text: {}",
                    e, text
                ))
            })?;
            Err(ApiError::Exchange {
                code: api_error.code,
                message: api_error.msg,
            })
        }
    }

    async fn _get_signed<T: DeserializeOwned>(
        &self,
        path: &str,
        params: &mut BTreeMap<&str, String>,
    ) -> Result<T, ApiError> {
        let url = self.signed_url(path, params)?;
        let response = self.client.get(&url).send().await?;
        Self::parse(response).await
    }

    async fn _post_signed<T: DeserializeOwned>(
        &self,
        path: &str,
        params: &mut BTreeMap<&str, String>,
    ) -> Result<T, ApiError> {
        let url = self.signed_url(path, params)?;
        let response = self.client.post(&url).send().await?;
        Self::parse(response).await
    }

    async fn _get_public<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, &str)],
    ) -> Result<T, ApiError> {
        let url = format!("{}{}", self.base_url, path);
        let response = self.client.get(&url).query(query).send().await?;
        Self::parse(response).await
    }
}

#[async_trait]
impl ExchangeConnector for BinanceClient {
    fn exchange(&self) -> ExchangeId {
        ExchangeId::Binance
    }

    async fn get_balance(&self, asset: &str) -> Result<Decimal, ApiError> {
        let mut params = BTreeMap::new();
        let balances: Vec<BalanceResponse> = self._get_signed("/fapi/v2/balance", &mut params).await?;
        Ok(balances
            .into_iter()
            .find(|b| b.asset == asset)
            .map(|b| b.available_balance)
            .unwrap_or(Decimal::ZERO))
    }

    async fn place_order(&self, order: &OrderRequest) -> Result<OrderAck, ApiError> {
        let mut params = BTreeMap::new();
        params.insert("symbol", order.symbol.clone());
        params.insert("side", side_str(order.side).to_string());
        params.insert("type", "MARKET".to_string());
        params.insert("quantity", order.quantity.normalize().to_string());
        params.insert("newClientOrderId", order.client_order_id.simple().to_string());
        if order.reduce_only {
            params.insert("reduceOnly", "true".to_string());
        }

        let response: OrderResponse = match self._post_signed("/fapi/v1/order", &mut params).await {
            Ok(response) => response,
            // -2010/-2019/-2021/-2022 and the -4xxx family are order-level rejections.
            Err(ApiError::Exchange { code, message }) if code <= -2010 => {
                return Err(ApiError::OrderRejected(format!("{code}: {message}")));
            }
            Err(e) => return Err(e),
        };
        let accepted = !matches!(binance_status(&response.status)?, OrderStatus::Rejected);
        Ok(OrderAck {
            order_id: response.order_id.to_string(),
            accepted,
        })
    }

    async fn get_order_fill(&self, symbol: &str, order_id: &str) -> Result<OrderFill, ApiError> {
        let mut params = BTreeMap::new();
        params.insert("symbol", symbol.to_string());
        params.insert("orderId", order_id.to_string());
        let response: OrderResponse = self._get_signed("/fapi/v1/order", &mut params).await?;
        response.into_fill()
    }

    async fn get_instrument_info(&self, symbol: &str) -> Result<InstrumentInfo, ApiError> {
        let info: ExchangeInfoResponse = self._get_public("/fapi/v1/exchangeInfo", &[]).await?;
        let symbol_info = info
            .symbols
            .into_iter()
            .find(|s| s.symbol == symbol)
            .ok_or_else(|| ApiError::UnknownInstrument(symbol.to_string()))?;

        // Market orders are bounded by MARKET_LOT_SIZE; LOT_SIZE is the fallback.
        let mut lot = None;
        for filter in symbol_info.filters {
            match filter {
                SymbolFilter::MarketLotSize { min_qty, max_qty, step_size } if step_size > Decimal::ZERO => {
                    lot = Some((min_qty, max_qty, step_size));
                    break;
                }
                SymbolFilter::LotSize { min_qty, max_qty, step_size } if lot.is_none() => {
                    lot = Some((min_qty, max_qty, step_size));
                }
                _ => {}
            }
        }
        let (min_qty, max_qty, qty_step) =
            lot.ok_or_else(|| ApiError::InvalidData(format!("{symbol} has no lot size filter")))?;

        Ok(InstrumentInfo {
            symbol: symbol.to_string(),
            min_qty,
            max_qty,
            qty_step,
        })
    }

    async fn get_mark_price(&self, symbol: &str) -> Result<Decimal, ApiError> {
        let index: PremiumIndexResponse = self
            ._get_public("/fapi/v1/premiumIndex", &[("symbol", symbol)])
            .await?;
        Ok(index.mark_price)
    }

    async fn set_leverage(&self, symbol: &str, leverage: u8) -> Result<(), ApiError> {
        let mut params = BTreeMap::new();
        params.insert("symbol", symbol.to_string());
        params.insert("leverage", leverage.to_string());

        #[derive(Deserialize)]
        struct LeverageResponse {
            #[allow(dead_code)]
            leverage: u8,
        }
        self._post_signed::<LeverageResponse>("/fapi/v1/leverage", &mut params).await?;
        Ok(())
    }
}
