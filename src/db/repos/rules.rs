use rusqlite::{params, Row};

use crate::db::models::ClassificationRule;
use crate::db::DbPool;
use crate::error::AppError;

fn row_to_rule(row: &Row) -> rusqlite::Result<ClassificationRule> {
    Ok(ClassificationRule {
        id: row.get("id")?,
        pattern: row.get("pattern")?,
        category: row.get("category")?,
        priority: row.get("priority")?,
        description: row.get("description")?,
        enabled: row.get::<_, i32>("enabled")? != 0,
        created_at: row.get("created_at")?,
    })
}

/// Enabled rules in evaluation order (priority ascending).
pub fn get_enabled(pool: &DbPool) -> Result<Vec<ClassificationRule>, AppError> {
    let conn = pool.get()?;
    let mut stmt = conn.prepare(
        "SELECT * FROM classification_rules WHERE enabled = 1 ORDER BY priority ASC, created_at ASC",
    )?;
    let rows = stmt.query_map([], row_to_rule)?;
    rows.collect::<Result<Vec<_>, _>>().map_err(AppError::Database)
}

pub fn create(
    pool: &DbPool,
    pattern: &str,
    category: &str,
    priority: i64,
    description: Option<&str>,
) -> Result<ClassificationRule, AppError> {
    if pattern.trim().is_empty() {
        return Err(AppError::Validation("Pattern cannot be empty".into()));
    }
    if category.trim().is_empty() {
        return Err(AppError::Validation("Category cannot be empty".into()));
    }
    regex::Regex::new(pattern)
        .map_err(|e| AppError::Validation(format!("Invalid pattern {pattern:?}: {e}")))?;

    let id = uuid::Uuid::new_v4().to_string();
    let now = chrono::Utc::now().to_rfc3339();
    let conn = pool.get()?;
    conn.execute(
        "INSERT INTO classification_rules (id, pattern, category, priority, description, enabled, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, 1, ?6)",
        params![id, pattern, category, priority, description, now],
    )?;

    conn.query_row(
        "SELECT * FROM classification_rules WHERE id = ?1",
        params![id],
        row_to_rule,
    )
    .map_err(AppError::Database)
}

pub fn set_enabled(pool: &DbPool, id: &str, enabled: bool) -> Result<(), AppError> {
    let conn = pool.get()?;
    let rows = conn.execute(
        "UPDATE classification_rules SET enabled = ?1 WHERE id = ?2",
        params![enabled as i32, id],
    )?;
    if rows == 0 {
        return Err(AppError::NotFound(format!("ClassificationRule {id}")));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::init_test_db;

    #[test]
    fn test_rules_ordered_by_priority() {
        let pool = init_test_db().unwrap();
        let seeded = get_enabled(&pool).unwrap().len();

        let late = create(&pool, r"disk pressure", "storage", 500, None).unwrap();
        let early = create(&pool, r"evicted", "kubernetes", 1, Some("Pod eviction")).unwrap();

        let rules = get_enabled(&pool).unwrap();
        assert_eq!(rules.len(), seeded + 2);
        assert_eq!(rules.first().unwrap().id, early.id);
        assert_eq!(rules.last().unwrap().id, late.id);
        assert!(rules.windows(2).all(|w| w[0].priority <= w[1].priority));
    }

    #[test]
    fn test_disabled_rules_are_skipped() {
        let pool = init_test_db().unwrap();
        let rule = create(&pool, r"quota exceeded", "storage", 5, None).unwrap();
        set_enabled(&pool, &rule.id, false).unwrap();

        let rules = get_enabled(&pool).unwrap();
        assert!(rules.iter().all(|r| r.id != rule.id));
        assert!(matches!(set_enabled(&pool, "missing", true), Err(AppError::NotFound(_))));
    }

    #[test]
    fn test_create_rejects_invalid_regex() {
        let pool = init_test_db().unwrap();
        let err = create(&pool, r"unclosed(", "system", 1, None).unwrap_err();
        assert!(matches!(err, AppError::Validation(_)));
    }
}
