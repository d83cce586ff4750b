use rusqlite::{params, OptionalExtension, Row};

use crate::db::models::{CreateErrorEventInput, ErrorEvent};
use crate::db::DbPool;
use crate::error::AppError;

fn row_to_error_event(row: &Row) -> rusqlite::Result<ErrorEvent> {
    Ok(ErrorEvent {
        id: row.get("id")?,
        signature: row.get("signature")?,
        category: row.get("category")?,
        message: row.get("message")?,
        source: row.get("source")?,
        severity: row.get("severity")?,
        stack_trace: row.get("stack_trace")?,
        raw_payload: row.get("raw_payload")?,
        origin_id: row.get("origin_id")?,
        observed_at: row.get("observed_at")?,
        created_at: row.get("created_at")?,
    })
}

pub fn get_by_id(pool: &DbPool, id: &str) -> Result<ErrorEvent, AppError> {
    let conn = pool.get()?;
    conn.query_row(
        "SELECT * FROM error_events WHERE id = ?1",
        params![id],
        row_to_error_event,
    )
    .map_err(|e| match e {
        rusqlite::Error::QueryReturnedNoRows => AppError::NotFound(format!("ErrorEvent {id}")),
        other => AppError::Database(other),
    })
}

/// The stored event for `signature` if it may be handed downstream again:
/// no plan has run against it, and fewer than `max_attempts` generation
/// failures (records without a plan) have been appended for it.
pub fn find_unhandled_by_signature(
    pool: &DbPool,
    signature: &str,
    max_attempts: u32,
) -> Result<Option<ErrorEvent>, AppError> {
    let conn = pool.get()?;
    conn.query_row(
        "SELECT * FROM error_events e
         WHERE e.signature = ?1
           AND NOT EXISTS (SELECT 1 FROM execution_records r
                           WHERE r.error_event_id = e.id AND r.plan_id IS NOT NULL)
           AND (SELECT COUNT(*) FROM execution_records r
                WHERE r.error_event_id = e.id AND r.plan_id IS NULL) < ?2",
        params![signature, max_attempts],
        row_to_error_event,
    )
    .optional()
    .map_err(AppError::Database)
}

/// Generation failures already recorded against an event.
pub fn count_failed_attempts(pool: &DbPool, event_id: &str) -> Result<u32, AppError> {
    let conn = pool.get()?;
    let n: i64 = conn.query_row(
        "SELECT COUNT(*) FROM execution_records WHERE error_event_id = ?1 AND plan_id IS NULL",
        params![event_id],
        |row| row.get(0),
    )?;
    Ok(n as u32)
}

pub fn exists_by_signature(pool: &DbPool, signature: &str) -> Result<bool, AppError> {
    let conn = pool.get()?;
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM error_events WHERE signature = ?1",
        params![signature],
        |row| row.get(0),
    )?;
    Ok(count > 0)
}

/// Insert the event unless one with the same signature is already stored.
///
/// Returns `None` for a suppressed duplicate.
pub fn insert_if_absent(
    pool: &DbPool,
    input: &CreateErrorEventInput,
) -> Result<Option<ErrorEvent>, AppError> {
    if input.message.trim().is_empty() {
        return Err(AppError::Validation("Message cannot be empty".into()));
    }

    let id = uuid::Uuid::new_v4().to_string();
    let now = chrono::Utc::now().to_rfc3339();

    let conn = pool.get()?;
    let inserted = conn.execute(
        "INSERT INTO error_events
         (id, signature, category, message, source, severity, stack_trace, raw_payload, origin_id, observed_at, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
         ON CONFLICT(signature) DO NOTHING",
        params![
            id,
            input.signature,
            input.category,
            input.message,
            input.source,
            input.severity,
            input.stack_trace,
            input.raw_payload,
            input.origin_id,
            input.observed_at,
            now,
        ],
    )?;
    drop(conn);

    if inserted == 0 {
        tracing::debug!(signature = %input.signature, "Duplicate error event suppressed");
        return Ok(None);
    }
    get_by_id(pool, &id).map(Some)
}

pub fn count(pool: &DbPool) -> Result<i64, AppError> {
    let conn = pool.get()?;
    let n = conn.query_row("SELECT COUNT(*) FROM error_events", [], |row| row.get(0))?;
    Ok(n)
}

/// Delete events created before `cutoff` that no execution record still references.
pub fn delete_older_than(pool: &DbPool, cutoff: &str) -> Result<usize, AppError> {
    let conn = pool.get()?;
    let rows = conn.execute(
        "DELETE FROM error_events
         WHERE created_at < ?1
           AND id NOT IN (SELECT error_event_id FROM execution_records WHERE error_event_id IS NOT NULL)",
        params![cutoff],
    )?;
    Ok(rows)
}

#[cfg(test)]
pub(crate) fn sample_input(category: &str, message: &str) -> CreateErrorEventInput {
    CreateErrorEventInput {
        signature: crate::engine::signature::compute(category, message),
        category: category.into(),
        message: message.into(),
        source: "node-1".into(),
        severity: "ERROR".into(),
        stack_trace: None,
        raw_payload: None,
        origin_id: Some("doc-1".into()),
        observed_at: chrono::Utc::now().to_rfc3339(),
    }
}
