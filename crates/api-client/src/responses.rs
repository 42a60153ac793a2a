use rust_decimal::Decimal;
use serde::Deserialize;

// Using `#[serde(rename_all = "camelCase")]` to automatically map from JSON camelCase to Rust snake_case.

/// The response from `POST /fapi/v1/order` and `GET /fapi/v1/order`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderResponse {
    pub client_order_id: String,
    pub executed_qty: Decimal,
    pub order_id: i64,
    #[serde(default)]
    pub avg_price: Decimal,
    pub orig_qty: Decimal,
    #[serde(default)]
    pub reduce_only: bool,
    pub side: String,
    pub status: String,
    pub symbol: String,
}

/// A single asset's balance from `GET /fapi/v2/balance`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BalanceResponse {
    pub asset: String,
    pub balance: Decimal,
    pub available_balance: Decimal,
}

/// `GET /fapi/v1/exchangeInfo`, trimmed to what lot-size normalisation needs.
#[derive(Debug, Clone, Deserialize)]
pub struct ExchangeInfoResponse {
    pub symbols: Vec<SymbolInfo>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SymbolInfo {
    pub symbol: String,
    pub filters: Vec<SymbolFilter>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "filterType")]
pub enum SymbolFilter {
    #[serde(rename = "LOT_SIZE", rename_all = "camelCase")]
    LotSize {
        min_qty: Decimal,
        max_qty: Decimal,
        step_size: Decimal,
    },
    #[serde(rename = "MARKET_LOT_SIZE", rename_all = "camelCase")]
    MarketLotSize {
        min_qty: Decimal,
        max_qty: Decimal,
        step_size: Decimal,
    },
    #[serde(other)]
    Other,
}

/// `GET /fapi/v1/premiumIndex?symbol=...`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PremiumIndexResponse {
    pub symbol: String,
    pub mark_price: Decimal,
}

/// Represents an error response from the Binance API.
#[derive(Debug, Clone, Deserialize)]
pub struct ApiErrorResponse {
    pub code: i64,
    pub msg: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn lot_size_filters_are_picked_out_of_exchange_info() {
        let json = r#"{"symbols":[{"symbol":"BTCUSDT","filters":[
            {"filterType":"PRICE_FILTER","minPrice":"556.80","maxPrice":"4529764","tickSize":"0.10"},
            {"filterType":"LOT_SIZE","minQty":"0.001","maxQty":"1000","stepSize":"0.001"},
            {"filterType":"MARKET_LOT_SIZE","minQty":"0.001","maxQty":"120","stepSize":"0.001"}
        ]}]}"#;
        let info: ExchangeInfoResponse = serde_json::from_str(json).unwrap();
        let filters = &info.symbols[0].filters;
        assert!(matches!(filters[0], SymbolFilter::Other));
        assert!(matches!(
            filters[2],
            SymbolFilter::MarketLotSize { max_qty, .. } if max_qty == dec!(120)
        ));
    }

    #[test]
    fn order_response_parses_string_decimals() {
        let json = r#"{"clientOrderId":"abc","executedQty":"0.010","orderId":22542179,"avgPrice":"64012.30",
            "origQty":"0.010","reduceOnly":false,"side":"BUY","status":"FILLED","symbol":"BTCUSDT"}"#;
        let order: OrderResponse = serde_json::from_str(json).unwrap();
        assert_eq!(order.executed_qty, dec!(0.010));
        assert_eq!(order.avg_price, dec!(64012.30));
    }
}
