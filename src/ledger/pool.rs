//! SQLite connection pool and schema migrations.

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use std::ops::Deref;
use std::time::Duration;

use crate::config::DatabaseConfig;
use crate::ledger::types::LedgerResult;

/// New type for `sqlx::SqlitePool`.
///
/// To use as `&sqlx::SqlitePool` in `Query::execute`, use its `Deref`
/// implementation: `&*pool`.
#[derive(Debug, Clone)]
pub struct LedgerPool(sqlx::SqlitePool);

impl LedgerPool {
    /// Open a pool for the configured database and apply pending migrations.
    pub async fn connect(config: &DatabaseConfig) -> LedgerResult<Self> {
        let in_memory = config.url.contains(":memory:");
        let mut options = config
            .url
            .parse::<SqliteConnectOptions>()?
            .create_if_missing(true)
            .foreign_keys(true)
            .busy_timeout(Duration::from_secs(config.busy_timeout_secs));
        if !in_memory {
            options = options.journal_mode(SqliteJournalMode::Wal);
        }

        let mut pool_options = SqlitePoolOptions::new().max_connections(config.max_connections);
        if in_memory {
            // The database lives and dies with its only connection.
            pool_options = pool_options
                .min_connections(1)
                .idle_timeout(None)
                .max_lifetime(None);
        }
        let inner = pool_options.connect_with(options).await?;
        let pool = LedgerPool(inner);
        pool.migrate().await?;

        tracing::debug!(
            url = %config.url,
            max_connections = config.max_connections,
            "Ledger pool ready"
        );
        Ok(pool)
    }

    /// In-memory ledger with the schema applied.
    pub async fn in_memory() -> LedgerResult<Self> {
        Self::connect(&DatabaseConfig {
            url: "sqlite::memory:".to_string(),
            max_connections: 1,
            busy_timeout_secs: 5,
        })
        .await
    }

    /// Apply the embedded migrations.
    pub async fn migrate(&self) -> LedgerResult<()> {
        sqlx::migrate!("./migrations").run(&self.0).await?;
        Ok(())
    }
}

impl Deref for LedgerPool {
    type Target = sqlx::SqlitePool;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_in_memory_pool_has_schema() {
        let pool = LedgerPool::in_memory().await.unwrap();
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM onchain_tx")
            .fetch_one(&*pool)
            .await
            .unwrap();
        assert_eq!(count, 0);
    }

    #[tokio::test]
    async fn test_migrations_are_idempotent() {
        let pool = LedgerPool::in_memory().await.unwrap();
        assert!(pool.migrate().await.is_ok());
    }
}
