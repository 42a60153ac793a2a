use crate::auth::sign_request;
use crate::error::ApiError;
use crate::{ExchangeConnector, now_millis};
use async_trait::async_trait;
use core_types::{ExchangeId, InstrumentInfo, OrderAck, OrderFill, OrderRequest, OrderSide, OrderStatus};
use reqwest::Method;
use rust_decimal::Decimal;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use std::collections::BTreeMap;
use std::str::FromStr;

const CATEGORY: &str = "linear";
/// "leverage not modified": the requested leverage is already in place.
const LEVERAGE_NOT_MODIFIED: i64 = 110043;

/// Bybit v5 unified-account client, trading linear (USDT/USDC) contracts.
#[derive(Clone)]
pub struct BybitClient {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    api_secret: String,
    recv_window_ms: u64,
}

/// The v5 envelope. `result` is decoded only once `retCode` says the call succeeded,
/// since failed calls often carry an empty object there.
#[derive(Deserialize)]
struct ApiResponse {
    #[serde(rename = "retCode")]
    ret_code: i64,
    #[serde(rename = "retMsg")]
    ret_msg: String,
    #[serde(default)]
    result: Value,
}

#[derive(Deserialize)]
struct ListResult<T> {
    list: Vec<T>,
}

#[derive(Deserialize)]
struct AccountEntry {
    coin: Vec<CoinBalance>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CoinBalance {
    coin: String,
    wallet_balance: String,
    #[serde(default)]
    available_to_withdraw: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateOrderResult {
    order_id: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct OrderItem {
    order_id: String,
    order_status: String,
    cum_exec_qty: String,
    avg_price: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct InstrumentItem {
    symbol: String,
    lot_size_filter: LotSizeFilter,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct LotSizeFilter {
    min_order_qty: String,
    max_order_qty: String,
    #[serde(default)]
    max_mkt_order_qty: Option<String>,
    qty_step: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct TickerItem {
    mark_price: String,
}

/// Bybit sends empty strings for numbers it has no value for yet.
fn parse_decimal(field: &str, raw: &str) -> Result<Decimal, ApiError> {
    if raw.is_empty() {
        return Ok(Decimal::ZERO);
    }
    Decimal::from_str(raw).map_err(|e| ApiError::Deserialization(format!("{field}={raw:?}: {e}")))
}

pub(crate) fn map_order_status(raw: &str) -> Result<OrderStatus, ApiError> {
    match raw {
        "New" | "Created" | "Untriggered" | "Triggered" | "Active" => Ok(OrderStatus::New),
        "PartiallyFilled" => Ok(OrderStatus::PartiallyFilled),
        "Filled" => Ok(OrderStatus::Filled),
        "Cancelled" | "PartiallyFilledCanceled" | "Deactivated" => Ok(OrderStatus::Canceled),
        "Rejected" => Ok(OrderStatus::Rejected),
        other => Err(ApiError::InvalidData(format!("unknown order status: {other}"))),
    }
}

impl BybitClient {
    pub fn new(base_url: &str, api_key: &str, api_secret: &str, recv_window_ms: u64) -> Result<Self, ApiError> {
        Ok(Self {
            client: reqwest::Client::builder().build()?,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            api_secret: api_secret.to_string(),
            recv_window_ms,
        })
    }

    /// Signature payload: timestamp, key, recv window, then the query string or JSON body.
    fn signature(&self, timestamp: i64, query_or_body: &str) -> String {
        let payload = format!(
            "{timestamp}{}{}{query_or_body}",
            self.api_key, self.recv_window_ms
        );
        sign_request(&self.api_secret, &payload)
    }

    fn ensure_success<T: DeserializeOwned>(resp: ApiResponse) -> Result<T, ApiError> {
        if resp.ret_code != 0 {
            return Err(ApiError::Exchange {
                code: resp.ret_code,
                message: resp.ret_msg,
            });
        }
        serde_json::from_value(resp.result).map_err(|e| ApiError::Deserialization(e.to_string()))
    }

    async fn signed_request(
        &self,
        method: Method,
        path: &str,
        query: BTreeMap<&str, String>,
        body: Value,
    ) -> Result<ApiResponse, ApiError> {
        let timestamp = now_millis();
        let query_string =
            serde_qs::to_string(&query).map_err(|e| ApiError::InvalidData(e.to_string()))?;
        let (url, signed_part) = if method == Method::GET {
            let url = if query_string.is_empty() {
                format!("{}{}", self.base_url, path)
            } else {
                format!("{}{}?{}", self.base_url, path, query_string)
            };
            (url, query_string)
        } else {
            (format!("{}{}", self.base_url, path), body.to_string())
        };

        let mut request = self
            .client
            .request(method.clone(), &url)
            .header("X-BAPI-API-KEY", &self.api_key)
            .header("X-BAPI-TIMESTAMP", timestamp.to_string())
            .header("X-BAPI-SIGN", self.signature(timestamp, &signed_part))
            .header("X-BAPI-RECV-WINDOW", self.recv_window_ms.to_string());
        if method != Method::GET {
            request = request
                .header("Content-Type", "application/json")
                .body(signed_part);
        }
        Self::read(request.send().await?).await
    }

    async fn public_get(&self, path: &str, query: &[(&str, &str)]) -> Result<ApiResponse, ApiError> {
        let url = format!("{}{}", self.base_url, path);
        Self::read(self.client.get(&url).query(query).send().await?).await
    }

    async fn read(response: reqwest::Response) -> Result<ApiResponse, ApiError> {
        let status = response.status();
        let text = response.text().await?;
        if status.is_server_error() {
            return Err(ApiError::Unavailable(format!("HTTP {status}: {text}")));
        }
        serde_json::from_str(&text).map_err(|e| {
            ApiError::Deserialization(format!("{e}. Original text: {text}"))
        })
    }

    async fn find_order(&self, path: &str, symbol: &str, order_id: &str) -> Result<Option<OrderItem>, ApiError> {
        let mut query = BTreeMap::new();
        query.insert("category", CATEGORY.to_string());
        query.insert("symbol", symbol.to_string());
        query.insert("orderId", order_id.to_string());
        let resp = self.signed_request(Method::GET, path, query, Value::Null).await?;
        Ok(Self::ensure_success::<ListResult<OrderItem>>(resp)?
            .list
            .into_iter()
            .find(|o| o.order_id == order_id))
    }
}

#[async_trait]
impl ExchangeConnector for BybitClient {
    fn exchange(&self) -> ExchangeId {
        ExchangeId::Bybit
    }

    async fn get_balance(&self, asset: &str) -> Result<Decimal, ApiError> {
        let mut query = BTreeMap::new();
        query.insert("accountType", "UNIFIED".to_string());
        query.insert("coin", asset.to_string());
        let resp = self
            .signed_request(Method::GET, "/v5/account/wallet-balance", query, Value::Null)
            .await?;

        for account in Self::ensure_success::<ListResult<AccountEntry>>(resp)?.list {
            if let Some(coin) = account.coin.into_iter().find(|c| c.coin == asset) {
                return match coin.available_to_withdraw.as_deref() {
                    Some(available) if !available.is_empty() => {
                        parse_decimal("availableToWithdraw", available)
                    }
                    _ => parse_decimal("walletBalance", &coin.wallet_balance),
                };
            }
        }
        Ok(Decimal::ZERO)
    }

    async fn place_order(&self, order: &OrderRequest) -> Result<OrderAck, ApiError> {
        let side = match order.side {
            OrderSide::Buy => "Buy",
            OrderSide::Sell => "Sell",
        };
        let body = json!({
            "category": CATEGORY,
            "symbol": order.symbol,
            "side": side,
            "orderType": "Market",
            "qty": order.quantity.normalize().to_string(),
            "reduceOnly": order.reduce_only,
            "orderLinkId": order.client_order_id.simple().to_string(),
        });
        let resp = self
            .signed_request(Method::POST, "/v5/order/create", BTreeMap::new(), body)
            .await?;
        match Self::ensure_success::<CreateOrderResult>(resp) {
            Ok(created) => Ok(OrderAck {
                order_id: created.order_id,
                accepted: true,
            }),
            // 110xxx codes are order-level rejections (quantity, margin, reduce-only...).
            Err(ApiError::Exchange { code, message }) if (110_000..120_000).contains(&code) => {
                Err(ApiError::OrderRejected(format!("{code}: {message}")))
            }
            Err(e) => Err(e),
        }
    }

    async fn get_order_fill(&self, symbol: &str, order_id: &str) -> Result<OrderFill, ApiError> {
        // Orders drop out of the realtime view once they finish; history has them then.
        let item = match self.find_order("/v5/order/realtime", symbol, order_id).await? {
            Some(item) => item,
            None => self
                .find_order("/v5/order/history", symbol, order_id)
                .await?
                .ok_or_else(|| ApiError::InvalidData(format!("order {order_id} not found")))?,
        };

        let avg_price = parse_decimal("avgPrice", &item.avg_price)?;
        Ok(OrderFill {
            order_id: item.order_id,
            status: map_order_status(&item.order_status)?,
            filled_qty: parse_decimal("cumExecQty", &item.cum_exec_qty)?,
            avg_price: (avg_price > Decimal::ZERO).then_some(avg_price),
        })
    }

    async fn get_instrument_info(&self, symbol: &str) -> Result<InstrumentInfo, ApiError> {
        let resp = self
            .public_get(
                "/v5/market/instruments-info",
                &[("category", CATEGORY), ("symbol", symbol)],
            )
            .await?;
        let item = Self::ensure_success::<ListResult<InstrumentItem>>(resp)?
            .list
            .into_iter()
            .find(|i| i.symbol == symbol)
            .ok_or_else(|| ApiError::UnknownInstrument(symbol.to_string()))?;

        let lot = item.lot_size_filter;
        let max_raw = lot
            .max_mkt_order_qty
            .filter(|v| !v.is_empty())
            .unwrap_or(lot.max_order_qty);
        Ok(InstrumentInfo {
            symbol: item.symbol,
            min_qty: parse_decimal("minOrderQty", &lot.min_order_qty)?,
            max_qty: parse_decimal("maxOrderQty", &max_raw)?,
            qty_step: parse_decimal("qtyStep", &lot.qty_step)?,
        })
    }

    async fn get_mark_price(&self, symbol: &str) -> Result<Decimal, ApiError> {
        let resp = self
            .public_get("/v5/market/tickers", &[("category", CATEGORY), ("symbol", symbol)])
            .await?;
        let ticker = Self::ensure_success::<ListResult<TickerItem>>(resp)?
            .list
            .into_iter()
            .next()
            .ok_or_else(|| ApiError::UnknownInstrument(symbol.to_string()))?;
        parse_decimal("markPrice", &ticker.mark_price)
    }

    async fn set_leverage(&self, symbol: &str, leverage: u8) -> Result<(), ApiError> {
        let body = json!({
            "category": CATEGORY,
            "symbol": symbol,
            "buyLeverage": leverage.to_string(),
            "sellLeverage": leverage.to_string(),
        });
        let resp = self
            .signed_request(Method::POST, "/v5/position/set-leverage", BTreeMap::new(), body)
            .await?;
        match Self::ensure_success::<Value>(resp) {
            Ok(_) | Err(ApiError::Exchange { code: LEVERAGE_NOT_MODIFIED, .. }) => Ok(()),
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn signature_is_hex_sha256_over_documented_payload() {
        let client = BybitClient::new("https://api.bybit.com", "XXXXXXXXXX", &"sec".repeat(10), 5000).unwrap();
        let signature = client.signature(1_658_385_579_423, r#"{"category": "option"}"#);
        let expected = sign_request(
            &"sec".repeat(10),
            r#"1658385579423XXXXXXXXXX5000{"category": "option"}"#,
        );
        assert_eq!(signature, expected);
        assert_eq!(signature.len(), 64);
    }

    #[test]
    fn empty_numbers_read_as_zero() {
        assert_eq!(parse_decimal("avgPrice", "").unwrap(), Decimal::ZERO);
        assert_eq!(parse_decimal("qtyStep", "0.001").unwrap(), dec!(0.001));
        assert!(parse_decimal("qtyStep", "abc").is_err());
    }

    #[test]
    fn order_statuses_are_normalised() {
        assert_eq!(map_order_status("PartiallyFilledCanceled").unwrap(), OrderStatus::Canceled);
        assert_eq!(map_order_status("Filled").unwrap(), OrderStatus::Filled);
    }

    #[test]
    fn error_envelope_becomes_exchange_error() {
        let resp: ApiResponse =
            serde_json::from_str(r#"{"retCode":110043,"retMsg":"leverage not modified","result":{}}"#).unwrap();
        assert!(matches!(
            BybitClient::ensure_success::<Value>(resp),
            Err(ApiError::Exchange { code: LEVERAGE_NOT_MODIFIED, .. })
        ));
    }
}
