use deadpool_postgres::{Manager, ManagerConfig, Pool, RecyclingMethod};
use std::time::Duration;
use tokio_postgres::{Config as PgConfig, NoTls};
use tracing::info;

use crate::error::AppError;

const SCHEMA: &str = include_str!("../migrations/0001_init.sql");

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Build the pool, verify one connection and apply the schema
pub async fn init_pool(database_url: &str, max_connections: usize) -> Result<Pool, AppError> {
    let pg_config: PgConfig = database_url
        .parse()
        .map_err(|e| AppError::Config(format!("DATABASE_URL: {e}")))?;

    let mgr = Manager::from_config(
        pg_config,
        NoTls,
        ManagerConfig {
            recycling_method: RecyclingMethod::Fast,
        },
    );
    let pool = Pool::builder(mgr)
        .max_size(max_connections)
        .build()
        .map_err(|e| AppError::StartServer(format!("db pool: {e}")))?;

    tokio::time::timeout(CONNECT_TIMEOUT, run_migrations(&pool))
        .await
        .map_err(|_| AppError::Timeout("database connection verification".into()))??;

    info!(max_connections, "database pool created and schema applied");
    Ok(pool)
}

pub async fn run_migrations(pool: &Pool) -> Result<(), AppError> {
    let client = pool.get().await?;
    client
        .batch_execute(SCHEMA)
        .await
        .map_err(|e| AppError::Database(format!("apply schema: {e}")))?;
    Ok(())
}
