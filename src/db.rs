use crate::config::AppConfig;
use crate::errors::ServiceError;
use metrics::{counter, gauge};
use sea_orm::{ConnectOptions, Database, DatabaseConnection};
use sea_orm_migration::MigratorTrait;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

pub type DbPool = DatabaseConnection;

/// Pool sizing and timeouts
#[derive(Debug, Clone)]
pub struct PoolSettings {
    pub url: String,
    pub max_connections: u32,
    pub min_connections: u32,
    pub connect_timeout: Duration,
    pub idle_timeout: Duration,
    pub acquire_timeout: Duration,
}

impl PoolSettings {
    /// Every connection to `sqlite::memory:` opens its own empty database,
    /// so such pools are pinned to a single connection.
    fn normalized(mut self) -> Self {
        if is_in_memory_sqlite(&self.url) && self.max_connections != 1 {
            warn!(
                requested = self.max_connections,
                "in-memory SQLite pool limited to one connection"
            );
            self.max_connections = 1;
            self.min_connections = 1;
        }
        self
    }
}

impl From<&AppConfig> for PoolSettings {
    fn from(cfg: &AppConfig) -> Self {
        Self {
            url: cfg.database_url.clone(),
            max_connections: cfg.db_max_connections,
            min_connections: cfg.db_min_connections,
            connect_timeout: Duration::from_secs(cfg.db_connect_timeout_secs),
            idle_timeout: Duration::from_secs(cfg.db_idle_timeout_secs),
            acquire_timeout: Duration::from_secs(cfg.db_acquire_timeout_secs),
        }
    }
}

fn is_in_memory_sqlite(url: &str) -> bool {
    url.starts_with("sqlite::memory:") || (url.starts_with("sqlite:") && url.contains("mode=memory"))
}

/// Opens the connection pool.
///
/// # Errors
/// Returns `ServiceError::DatabaseError` when the database is unreachable.
pub async fn connect(settings: PoolSettings) -> Result<DbPool, ServiceError> {
    let settings = settings.normalized();
    debug!(
        max_connections = settings.max_connections,
        min_connections = settings.min_connections,
        "opening database pool"
    );

    let mut options = ConnectOptions::new(settings.url);
    options
        .max_connections(settings.max_connections)
        .min_connections(settings.min_connections)
        .connect_timeout(settings.connect_timeout)
        .acquire_timeout(settings.acquire_timeout)
        .idle_timeout(settings.idle_timeout)
        .sqlx_logging(false);
    gauge!("orderline_db.max_connections", settings.max_connections as f64);

    let pool = Database::connect(options).await.map_err(|e| {
        error!(error = %e, "could not open database pool");
        counter!("orderline_db.connection_failures", 1);
        ServiceError::DatabaseError(e)
    })?;

    info!("database pool ready");
    Ok(pool)
}

pub async fn establish_connection_from_app_config(cfg: &AppConfig) -> Result<DbPool, ServiceError> {
    connect(PoolSettings::from(cfg)).await
}

/// Applies pending schema migrations
pub async fn run_migrations(pool: &DbPool) -> Result<(), ServiceError> {
    let started = Instant::now();
    crate::migrator::Migrator::up(pool, None)
        .await
        .map_err(|e| {
            error!(error = %e, elapsed = ?started.elapsed(), "schema migration failed");
            ServiceError::DatabaseError(e)
        })?;
    info!(elapsed = ?started.elapsed(), "schema up to date");
    Ok(())
}

/// Round-trips a ping; used by the readiness probe.
pub async fn check_connection(pool: &DbPool) -> Result<(), ServiceError> {
    let started = Instant::now();
    match pool.ping().await {
        Ok(()) => {
            gauge!(
                "orderline_db.ping_latency_ms",
                started.elapsed().as_millis() as f64
            );
            Ok(())
        }
        Err(e) => {
            error!(error = %e, "database ping failed");
            counter!("orderline_db.connection_failures", 1);
            Err(ServiceError::DatabaseError(e))
        }
    }
}
