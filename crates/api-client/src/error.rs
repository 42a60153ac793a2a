use thiserror::Error;

#[derive(Error, Debug)]
pub enum ApiError {
    #[error("HTTP transport failure: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("Exchange returned error {code}: {message}")]
    Exchange { code: i64, message: String },

    #[error("Failed to deserialize the API response: {0}")]
    Deserialization(String),

    #[error("Invalid data format from API: {0}")]
    InvalidData(String),

    #[error("Missing or invalid credentials: {0}")]
    Authentication(String),

    #[error("{operation} timed out after {millis} ms")]
    Timeout { operation: String, millis: u128 },

    #[error("Exchange is unreachable: {0}")]
    Unavailable(String),

    #[error("Order rejected by the exchange: {0}")]
    OrderRejected(String),

    #[error("Unknown instrument: {0}")]
    UnknownInstrument(String),
}

impl ApiError {
    /// Errors worth retrying: the request may succeed if sent again unchanged.
    pub fn is_transient(&self) -> bool {
        match self {
            ApiError::Transport(e) => e.is_timeout() || e.is_connect() || e.is_request(),
            ApiError::Timeout { .. } | ApiError::Unavailable(_) => true,
            // Binance -1001 (disconnected), -1003 (rate limit), -1007 (backend timeout);
            // Bybit 10002 (timestamp window), 10006 (rate limit), 10016 (server error).
            ApiError::Exchange { code, .. } => matches!(code, -1001 | -1003 | -1007 | 10002 | 10006 | 10016),
            _ => false,
        }
    }
}
