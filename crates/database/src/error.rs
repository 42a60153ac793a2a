use thiserror::Error;
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum DbError {
    #[error("Failed to load environment variables for database connection: {0}")]
    ConnectionConfigError(String),

    #[error("Database error: {0}")]
    ConnectionError(#[from] sqlx::Error),

    #[error("Database migration failed: {0}")]
    MigrationError(#[from] sqlx::migrate::MigrateError),

    #[error("An error occurred during JSON serialization/deserialization: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("The requested data was not found in the database.")]
    NotFound,

    #[error("Position {0} is not open; it was settled already")]
    AlreadySettled(Uuid),

    #[error("Stored value could not be decoded: {0}")]
    InvalidData(String),

    #[error("Store unavailable: {0}")]
    Unavailable(String),
}

impl DbError {
    /// Failures where the same call may succeed a moment later.
    pub fn is_transient(&self) -> bool {
        match self {
            DbError::ConnectionError(e) => matches!(
                e,
                sqlx::Error::PoolTimedOut | sqlx::Error::Io(_) | sqlx::Error::Tls(_) | sqlx::Error::PoolClosed
            ),
            DbError::Unavailable(_) => true,
            _ => false,
        }
    }
}

impl From<core_types::CoreError> for DbError {
    fn from(e: core_types::CoreError) -> Self {
        DbError::InvalidData(e.to_string())
    }
}
