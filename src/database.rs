use anyhow::Result;
use std::sync::Arc;
#[cfg(feature = "database")]
use sqlx::{migrate::MigrateDatabase, sqlite::SqlitePoolOptions, SqlitePool};
use tracing::info;

use crate::config::DatabaseConfig;
use crate::storage::WorkflowStore;
#[cfg(feature = "database")]
use crate::storage::SqliteStore;

#[cfg(feature = "database")]
/// Owns the SQLite pool behind the workflow store
pub struct DatabaseManager {
    pool: SqlitePool,
}

#[cfg(feature = "database")]
impl DatabaseManager {
    /// Open (creating if needed) the database and optionally migrate it
    pub async fn new(config: &DatabaseConfig) -> Result<Self> {
        if !sqlx::Sqlite::database_exists(&config.url).await? {
            info!("Creating database at {}", config.url);
            sqlx::Sqlite::create_database(&config.url).await?;
        }

        let pool = SqlitePoolOptions::new()
            .max_connections(config.max_connections)
            .connect(&config.url)
            .await?;

        let manager = Self { pool };
        if config.auto_migrate {
            manager.migrate().await?;
        }
        Ok(manager)
    }

    pub async fn migrate(&self) -> Result<()> {
        info!("Running database migrations...");
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        info!("Database migrations completed");
        Ok(())
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub fn store(&self) -> SqliteStore {
        SqliteStore::new(self.pool.clone())
    }

    /// Close database connections gracefully
    pub async fn shutdown(&self) {
        info!("Shutting down database connections...");
        self.pool.close().await;
        info!("Database connections closed");
    }
}

#[cfg(feature = "database")]
static DB_MANAGER: std::sync::LazyLock<tokio::sync::RwLock<Option<DatabaseManager>>> =
    std::sync::LazyLock::new(|| tokio::sync::RwLock::new(None));

#[cfg(feature = "database")]
/// Open the configured database and return the store backed by it
pub async fn init_database(config: &DatabaseConfig) -> Result<Arc<dyn WorkflowStore>> {
    info!("Initializing database at {}", config.url);
    let manager = DatabaseManager::new(config).await?;
    let store: Arc<dyn WorkflowStore> = Arc::new(manager.store());
    *DB_MANAGER.write().await = Some(manager);
    Ok(store)
}

#[cfg(feature = "database")]
/// Shutdown database connections
pub async fn shutdown_database() {
    if let Some(manager) = DB_MANAGER.write().await.take() {
        manager.shutdown().await;
    }
}

// Without the database feature the workflow runs on the in-memory store
#[cfg(not(feature = "database"))]
pub async fn init_database(_config: &DatabaseConfig) -> Result<Arc<dyn WorkflowStore>> {
    tracing::warn!("Database feature not enabled; state lives in memory and is lost on exit");
    Ok(Arc::new(crate::storage::MemoryStore::new()))
}

#[cfg(not(feature = "database"))]
pub async fn shutdown_database() {
    tracing::info!("Database feature not enabled, no database to shutdown");
}

#[cfg(all(test, feature = "database"))]
mod tests {
    use super::*;

    #[tokio::test]
    async fn creates_and_migrates_a_file_database() {
        let dir = tempfile::tempdir().unwrap();
        let config = DatabaseConfig {
            url: format!("sqlite://{}", dir.path().join("bend.db").display()),
            max_connections: 2,
            auto_migrate: true,
        };
        let manager = DatabaseManager::new(&config).await.unwrap();
        let store = manager.store();
        assert!(store.emergency_history().await.unwrap().is_empty());
        manager.shutdown().await;
    }
}
