use rusqlite::{params, Row};

use crate::db::models::{CreateExecutionRecordInput, ExecutionRecord};
use crate::db::DbPool;
use crate::error::AppError;

fn row_to_record(row: &Row) -> rusqlite::Result<ExecutionRecord> {
    Ok(ExecutionRecord {
        id: row.get("id")?,
        error_event_id: row.get("error_event_id")?,
        plan_id: row.get("plan_id")?,
        status: row.get("status")?,
        output: row.get("output")?,
        failure_reason: row.get("failure_reason")?,
        elapsed_ms: row.get("elapsed_ms")?,
        created_at: row.get("created_at")?,
    })
}

/// Append one record to the audit trail. Records are never updated.
pub fn append(
    pool: &DbPool,
    input: &CreateExecutionRecordInput,
) -> Result<ExecutionRecord, AppError> {
    let id = uuid::Uuid::new_v4().to_string();
    let now = chrono::Utc::now().to_rfc3339();

    let conn = pool.get()?;
    conn.execute(
        "INSERT INTO execution_records
         (id, error_event_id, plan_id, status, output, failure_reason, elapsed_ms, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        params![
            id,
            input.error_event_id,
            input.plan_id,
            input.status,
            input.output,
            input.failure_reason,
            input.elapsed_ms,
            now,
        ],
    )?;

    conn.query_row(
        "SELECT * FROM execution_records WHERE id = ?1",
        params![id],
        row_to_record,
    )
    .map_err(AppError::Database)
}

pub fn get_by_error_event(
    pool: &DbPool,
    error_event_id: &str,
) -> Result<Vec<ExecutionRecord>, AppError> {
    let conn = pool.get()?;
    let mut stmt = conn.prepare(
        "SELECT * FROM execution_records WHERE error_event_id = ?1 ORDER BY created_at ASC",
    )?;
    let rows = stmt.query_map(params![error_event_id], row_to_record)?;
    rows.collect::<Result<Vec<_>, _>>().map_err(AppError::Database)
}

pub fn get_recent(pool: &DbPool, limit: i64) -> Result<Vec<ExecutionRecord>, AppError> {
    let conn = pool.get()?;
    let mut stmt =
        conn.prepare("SELECT * FROM execution_records ORDER BY created_at DESC LIMIT ?1")?;
    let rows = stmt.query_map(params![limit], row_to_record)?;
    rows.collect::<Result<Vec<_>, _>>().map_err(AppError::Database)
}

pub fn count(pool: &DbPool) -> Result<i64, AppError> {
    let conn = pool.get()?;
    let n = conn.query_row("SELECT COUNT(*) FROM execution_records", [], |row| row.get(0))?;
    Ok(n)
}

pub fn delete_older_than(pool: &DbPool, cutoff: &str) -> Result<usize, AppError> {
    let conn = pool.get()?;
    let rows = conn.execute(
        "DELETE FROM execution_records WHERE created_at < ?1",
        params![cutoff],
    )?;
    Ok(rows)
}
