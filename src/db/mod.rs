use std::time::Duration;

use sqlx::postgres::{PgPool, PgPoolOptions};
use tokio::time::sleep;

use crate::config::Config;

const MAX_CONNECT_ATTEMPTS: u32 = 5;

/// Connects to Postgres, retrying with exponential backoff while the database comes up.
pub async fn create_pool(config: &Config) -> Result<PgPool, sqlx::Error> {
    let mut attempt = 0;

    loop {
        match PgPoolOptions::new()
            .max_connections(10)
            .acquire_timeout(Duration::from_secs(5))
            .connect(&config.database_url)
            .await
        {
            Ok(pool) => {
                tracing::info!("Database connection established");
                return Ok(pool);
            }
            Err(e) if attempt + 1 < MAX_CONNECT_ATTEMPTS => {
                attempt += 1;
                let backoff = Duration::from_secs(2u64.pow(attempt));
                tracing::warn!(
                    "Connection attempt {} failed: {}. Retrying in {:?}",
                    attempt,
                    e,
                    backoff
                );
                sleep(backoff).await;
            }
            Err(e) => {
                tracing::error!(
                    "Failed to establish connection after {} attempts",
                    MAX_CONNECT_ATTEMPTS
                );
                return Err(e);
            }
        }
    }
}
