use rusqlite::types::Type;
use rusqlite::{params, OptionalExtension, Row};

use crate::db::models::{ActionSpec, CreatePlanInput, RemediationPlan};
use crate::db::DbPool;
use crate::error::AppError;

fn row_to_plan(row: &Row) -> rusqlite::Result<RemediationPlan> {
    let actions_json: String = row.get("actions_json")?;
    let actions: Vec<ActionSpec> = serde_json::from_str(&actions_json)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(0, Type::Text, Box::new(e)))?;
    Ok(RemediationPlan {
        id: row.get("id")?,
        signature: row.get("signature")?,
        category: row.get("category")?,
        description: row.get("description")?,
        actions,
        generator_notes: row.get("generator_notes")?,
        priority: row.get("priority")?,
        success_rate: row.get("success_rate")?,
        execution_count: row.get("execution_count")?,
        created_at: row.get("created_at")?,
    })
}

pub fn get_by_id(pool: &DbPool, id: &str) -> Result<RemediationPlan, AppError> {
    let conn = pool.get()?;
    conn.query_row(
        "SELECT * FROM remediation_plans WHERE id = ?1",
        params![id],
        row_to_plan,
    )
    .map_err(|e| match e {
        rusqlite::Error::QueryReturnedNoRows => AppError::NotFound(format!("RemediationPlan {id}")),
        other => AppError::Database(other),
    })
}

/// Best candidate plan for a signature: success rate first, then execution count.
pub fn find_best_for_signature(
    pool: &DbPool,
    signature: &str,
) -> Result<Option<RemediationPlan>, AppError> {
    let conn = pool.get()?;
    conn.query_row(
        "SELECT * FROM remediation_plans
         WHERE signature = ?1
         ORDER BY success_rate DESC, execution_count DESC
         LIMIT 1",
        params![signature],
        row_to_plan,
    )
    .optional()
    .map_err(AppError::Database)
}

pub fn create(pool: &DbPool, input: &CreatePlanInput) -> Result<RemediationPlan, AppError> {
    if input.description.trim().is_empty() {
        return Err(AppError::Validation("Plan description cannot be empty".into()));
    }
    if input.category.trim().is_empty() {
        return Err(AppError::Validation("Plan category cannot be empty".into()));
    }

    let id = uuid::Uuid::new_v4().to_string();
    let now = chrono::Utc::now().to_rfc3339();
    let actions_json = serde_json::to_string(&input.actions)?;

    let conn = pool.get()?;
    conn.execute(
        "INSERT INTO remediation_plans
         (id, signature, category, description, actions_json, generator_notes, priority, success_rate, execution_count, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 0, 0, ?8)",
        params![
            id,
            input.signature,
            input.category,
            input.description,
            actions_json,
            input.generator_notes,
            input.priority,
            now,
        ],
    )?;
    drop(conn);

    get_by_id(pool, &id)
}

/// Overwrite the historical statistics of a plan.
///
/// Nothing in the pipeline calls this after an execution; the statistics are
/// curated by operators or external tooling.
pub fn set_statistics(
    pool: &DbPool,
    id: &str,
    success_rate: f64,
    execution_count: i64,
) -> Result<(), AppError> {
    if !(0.0..=100.0).contains(&success_rate) {
        return Err(AppError::Validation(format!(
            "success_rate must be within 0..=100, got {success_rate}"
        )));
    }
    let conn = pool.get()?;
    let rows = conn.execute(
        "UPDATE remediation_plans SET success_rate = ?1, execution_count = ?2 WHERE id = ?3",
        params![success_rate, execution_count, id],
    )?;
    if rows == 0 {
        return Err(AppError::NotFound(format!("RemediationPlan {id}")));
    }
    Ok(())
}

pub fn count(pool: &DbPool) -> Result<i64, AppError> {
    let conn = pool.get()?;
    let n = conn.query_row("SELECT COUNT(*) FROM remediation_plans", [], |row| row.get(0))?;
    Ok(n)
}

/// Delete plans created before `cutoff` that no execution record references.
pub fn delete_unreferenced_older_than(pool: &DbPool, cutoff: &str) -> Result<usize, AppError> {
    let conn = pool.get()?;
    let rows = conn.execute(
        "DELETE FROM remediation_plans
         WHERE created_at < ?1
           AND id NOT IN (SELECT plan_id FROM execution_records WHERE plan_id IS NOT NULL)",
        params![cutoff],
    )?;
    Ok(rows)
}

#[cfg(test)]
pub(crate) fn sample_input(signature: &str) -> CreatePlanInput {
    CreatePlanInput {
        signature: signature.into(),
        category: "scaling".into(),
        description: "Scale the api deployment".into(),
        actions: vec![ActionSpec {
            kind: "kubectl".into(),
            command: "kubectl scale deployment api --replicas=3".into(),
            description: "scale up".into(),
            safe: true,
            critical: true,
            config_type: None,
            config_path: None,
            config_changes: None,
        }],
        generator_notes: Some("memory pressure".into()),
        priority: "high".into(),
    }
}
