use std::time::Duration;

use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;

use crate::error::AppError;

/// How long a roster query waits for a free connection.
const ACQUIRE_TIMEOUT: Duration = Duration::from_secs(5);

/// Open the pool behind the Postgres roster and check it answers.
pub async fn create_pool(database_url: &str, max_connections: u32) -> Result<PgPool, AppError> {
    if max_connections == 0 {
        return Err(AppError::Config(
            "DB_MAX_CONNECTIONS must be at least 1".to_string(),
        ));
    }

    let pool = PgPoolOptions::new()
        .max_connections(max_connections)
        .acquire_timeout(ACQUIRE_TIMEOUT)
        .connect(database_url)
        .await?;

    sqlx::query("SELECT 1").execute(&pool).await?;

    tracing::info!(max_connections, "Roster database reachable");
    Ok(pool)
}
