use crate::error::DbError;
use configuration::DatabaseConfig;
use sqlx::postgres::{PgConnectOptions, PgPoolOptions};
use sqlx::PgPool;
use std::env;
use std::str::FromStr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::task::JoinHandle;

/// Resolves the primary URL: the configured one, else `DATABASE_URL` from the
/// environment or a `.env` file.
pub fn primary_url(config: &DatabaseConfig) -> Result<String, DbError> {
    if let Some(url) = &config.primary_url {
        return Ok(url.clone());
    }
    // A missing .env file is fine; the variable may come from the real environment.
    let _ = dotenvy::dotenv();
    env::var("DATABASE_URL")
        .map_err(|_e| DbError::ConnectionConfigError("DATABASE_URL must be set.".to_string()))
}

/// Establishes a connection pool with the configured limits. Every connection
/// carries the statement timeout.
pub async fn connect(url: &str, config: &DatabaseConfig) -> Result<PgPool, DbError> {
    let options = PgConnectOptions::from_str(url)?
        .options([("statement_timeout", config.statement_timeout_ms.to_string())]);

    let pool = PgPoolOptions::new()
        .max_connections(config.max_connections)
        .acquire_timeout(Duration::from_secs(config.acquire_timeout_secs))
        .connect_with(options)
        .await?;

    Ok(pool)
}

/// Applies the embedded migrations to the primary.
pub async fn run_migrations(pool: &PgPool) -> Result<(), DbError> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

struct Replica {
    label: String,
    pool: PgPool,
    healthy: AtomicBool,
}

/// Routes writes to the primary and reads round-robin over healthy replicas.
/// A background task re-checks replica health; a failed read marks its replica
/// unhealthy straight away.
pub struct DbRouter {
    primary: PgPool,
    replicas: Vec<Replica>,
    next: AtomicUsize,
}

impl DbRouter {
    pub fn new(primary: PgPool, replicas: Vec<(String, PgPool)>) -> Self {
        Self {
            primary,
            replicas: replicas
                .into_iter()
                .map(|(label, pool)| Replica {
                    label,
                    pool,
                    healthy: AtomicBool::new(true),
                })
                .collect(),
            next: AtomicUsize::new(0),
        }
    }

    /// Connects the primary (which must succeed) and every replica (which may not).
    pub async fn connect(config: &DatabaseConfig) -> Result<Self, DbError> {
        let primary = connect(&primary_url(config)?, config).await?;
        let mut replicas = Vec::new();
        for (i, url) in config.replica_urls.iter().enumerate() {
            let label = format!("replica-{i}");
            match connect(url, config).await {
                Ok(pool) => replicas.push((label, pool)),
                Err(e) => tracing::warn!(replica = %label, error = %e, "replica unavailable at startup, reads go to primary"),
            }
        }
        tracing::info!(replicas = replicas.len(), "database router connected");
        Ok(Self::new(primary, replicas))
    }

    pub fn primary(&self) -> &PgPool {
        &self.primary
    }

    /// The next healthy replica, if any.
    pub fn replica(&self) -> Option<(usize, &PgPool)> {
        let count = self.replicas.len();
        if count == 0 {
            return None;
        }
        let start = self.next.fetch_add(1, Ordering::Relaxed);
        (0..count)
            .map(|offset| (start + offset) % count)
            .find(|&i| self.replicas[i].healthy.load(Ordering::Relaxed))
            .map(|i| (i, &self.replicas[i].pool))
    }

    pub fn mark_unhealthy(&self, index: usize) {
        if let Some(replica) = self.replicas.get(index) {
            if replica.healthy.swap(false, Ordering::Relaxed) {
                tracing::warn!(replica = %replica.label, "replica marked unhealthy");
            }
        }
    }

    pub fn healthy_replicas(&self) -> usize {
        self.replicas
            .iter()
            .filter(|r| r.healthy.load(Ordering::Relaxed))
            .count()
    }

    /// Pings every pool once and updates replica health.
    pub async fn check_health(&self) {
        if let Err(e) = sqlx::query("SELECT 1").execute(&self.primary).await {
            tracing::error!(error = %e, "primary database health check failed");
        }
        for replica in &self.replicas {
            let ok = sqlx::query("SELECT 1").execute(&replica.pool).await.is_ok();
            let was = replica.healthy.swap(ok, Ordering::Relaxed);
            if ok && !was {
                tracing::info!(replica = %replica.label, "replica healthy again");
            } else if !ok && was {
                tracing::warn!(replica = %replica.label, "replica failed health check");
            }
        }
    }

    pub fn spawn_health_checks(self: &Arc<Self>, every: Duration) -> JoinHandle<()> {
        let router = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            loop {
                ticker.tick().await;
                router.check_health().await;
            }
        })
    }
}
