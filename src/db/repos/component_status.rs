use rusqlite::{params, Row};

use crate::db::models::ComponentStatus;
use crate::db::DbPool;
use crate::error::AppError;

fn row_to_status(row: &Row) -> rusqlite::Result<ComponentStatus> {
    Ok(ComponentStatus {
        component_name: row.get("component_name")?,
        status: row.get("status")?,
        error_count: row.get("error_count")?,
        last_check: row.get("last_check")?,
    })
}

/// Record the latest health snapshot for a component. Latest write wins.
pub fn upsert(
    pool: &DbPool,
    component_name: &str,
    status: &str,
    error_count: i64,
) -> Result<(), AppError> {
    let now = chrono::Utc::now().to_rfc3339();
    let conn = pool.get()?;

    let updated = conn.execute(
        "UPDATE component_status SET status = ?1, error_count = ?2, last_check = ?3
         WHERE component_name = ?4",
        params![status, error_count, now, component_name],
    )?;

    if updated == 0 {
        conn.execute(
            "INSERT INTO component_status (component_name, status, error_count, last_check)
             VALUES (?1, ?2, ?3, ?4)",
            params![component_name, status, error_count, now],
        )?;
    }
    Ok(())
}

pub fn get(pool: &DbPool, component_name: &str) -> Result<ComponentStatus, AppError> {
    let conn = pool.get()?;
    conn.query_row(
        "SELECT * FROM component_status WHERE component_name = ?1",
        params![component_name],
        row_to_status,
    )
    .map_err(|e| match e {
        rusqlite::Error::QueryReturnedNoRows => {
            AppError::NotFound(format!("ComponentStatus {component_name}"))
        }
        other => AppError::Database(other),
    })
}

pub fn get_all(pool: &DbPool) -> Result<Vec<ComponentStatus>, AppError> {
    let conn = pool.get()?;
    let mut stmt = conn.prepare("SELECT * FROM component_status ORDER BY component_name")?;
    let rows = stmt.query_map([], row_to_status)?;
    rows.collect::<Result<Vec<_>, _>>().map_err(AppError::Database)
}
