pub mod migrations;
pub mod models;
pub mod repos;

use r2d2::{CustomizeConnection, Pool};
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::params;

use crate::config::DatabaseConfig;
use crate::error::AppError;

pub type DbPool = Pool<SqliteConnectionManager>;

/// Connection customizer that sets per-connection SQLite pragmas.
#[derive(Debug)]
struct SqlitePragmaCustomizer;

impl CustomizeConnection<rusqlite::Connection, rusqlite::Error> for SqlitePragmaCustomizer {
    fn on_acquire(&self, conn: &mut rusqlite::Connection) -> Result<(), rusqlite::Error> {
        conn.execute_batch(
            "PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;
             PRAGMA synchronous = NORMAL;
             PRAGMA cache_size = -8000;",
        )?;
        Ok(())
    }
}

/// Initialize the database: create file, enable WAL + foreign keys, run migrations, seed rules.
///
/// Failure here is an unrecoverable startup error.
pub fn init_db(config: &DatabaseConfig) -> Result<DbPool, AppError> {
    if let Some(parent) = config.path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }

    tracing::info!(path = %config.path.display(), "Initializing database");

    let manager = SqliteConnectionManager::file(&config.path);
    let pool = Pool::builder()
        .max_size(config.pool_size.max(2))
        .connection_customizer(Box::new(SqlitePragmaCustomizer))
        .build(manager)
        .map_err(|e| AppError::Connectivity(format!("persistent store unavailable: {e}")))?;

    // Database-wide, only needs to run once
    {
        let conn = pool.get()?;
        conn.execute_batch("PRAGMA journal_mode = WAL;")?;
        tracing::debug!("SQLite pragmas configured (WAL, FK, busy_timeout)");
    }

    {
        let conn = pool.get()?;
        migrations::run(&conn)?;
        seed_default_rules(&conn)?;
    }

    tracing::info!("Database initialized successfully");
    Ok(pool)
}

/// Seed classification rules for cluster failure signatures that the keyword
/// fallback table does not recognise on its own.
fn seed_default_rules(conn: &rusqlite::Connection) -> Result<(), AppError> {
    let now = chrono::Utc::now().to_rfc3339();
    let rules = [
        ("rule-crashloop", r"crashloopbackoff|back-off restarting failed container", "kubernetes", 10, "Pod restart loop"),
        ("rule-image-pull", r"imagepullbackoff|errimagepull", "kubernetes", 20, "Image cannot be pulled"),
        ("rule-open-files", r"too many open files", "system", 30, "File descriptor exhaustion"),
        ("rule-cert-expiry", r"x509:|certificate (has )?expired", "security", 40, "TLS certificate problem"),
    ];

    for (id, pattern, category, priority, description) in &rules {
        conn.execute(
            "INSERT OR IGNORE INTO classification_rules
             (id, pattern, category, priority, description, enabled, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, 1, ?6)",
            params![id, pattern, category, priority, description, now],
        )?;
    }

    tracing::debug!("Default classification rules seeded");
    Ok(())
}

#[cfg(test)]
pub fn init_test_db() -> Result<DbPool, AppError> {
    use std::time::Duration;

    // Use a unique temp file for each test to avoid in-memory connection issues with r2d2.
    let tmp = std::env::temp_dir().join(format!("logheal_test_{}.db", uuid::Uuid::new_v4()));
    let manager = SqliteConnectionManager::file(&tmp);
    let pool = Pool::builder()
        .max_size(2)
        .connection_timeout(Duration::from_secs(5))
        .connection_customizer(Box::new(SqlitePragmaCustomizer))
        .build(manager)?;

    let conn = pool.get()?;
    migrations::run(&conn)?;
    seed_default_rules(&conn)?;
    drop(conn);
    Ok(pool)
}
