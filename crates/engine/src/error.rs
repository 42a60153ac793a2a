use thiserror::Error;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Invalid signal: {0}")]
    InvalidSignal(#[from] core_types::CoreError),

    #[error("Decision oracle error: {0}")]
    Oracle(String),

    #[error("Decision oracle did not answer within {0} ms")]
    OracleTimeout(u128),

    #[error("Database error: {0}")]
    Database(#[from] database::DbError),

    #[error("Execution error: {0}")]
    Execution(#[from] executor::ExecutorError),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Serialization/deserialization error: {0}")]
    SerdeJson(#[from] serde_json::Error),
}

impl EngineError {
    /// Stable code used when an infrastructure failure ends up in a trade report.
    pub fn code(&self) -> &'static str {
        match self {
            EngineError::Configuration(_) => "CONFIGURATION_ERROR",
            EngineError::InvalidSignal(_) => "INVALID_SIGNAL",
            EngineError::Oracle(_) | EngineError::OracleTimeout(_) => "ORACLE_UNAVAILABLE",
            EngineError::Database(_) => "STORE_ERROR",
            EngineError::Execution(e) => e.code(),
            EngineError::Http(_) | EngineError::SerdeJson(_) => "INTERNAL_ERROR",
        }
    }
}
