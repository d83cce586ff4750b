use rusqlite::Connection;

use crate::error::AppError;

/// Run the schema migration. Every statement is idempotent.
pub fn run(conn: &Connection) -> Result<(), AppError> {
    tracing::debug!("Running database migrations");

    conn.execute_batch(SCHEMA)?;

    tracing::info!("Database migrations complete");
    Ok(())
}

const SCHEMA: &str = r#"

-- ============================================================================
-- Classification Rules (evaluated priority ascending, first match wins)
-- ============================================================================

CREATE TABLE IF NOT EXISTS classification_rules (
    id           TEXT PRIMARY KEY,
    pattern      TEXT NOT NULL UNIQUE,
    category     TEXT NOT NULL,
    priority     INTEGER NOT NULL DEFAULT 100,
    description  TEXT,
    enabled      INTEGER NOT NULL DEFAULT 1,
    created_at   TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_rules_priority ON classification_rules(priority);

-- ============================================================================
-- Error Events
-- ============================================================================

CREATE TABLE IF NOT EXISTS error_events (
    id           TEXT PRIMARY KEY,
    signature    TEXT NOT NULL UNIQUE,
    category     TEXT NOT NULL,
    message      TEXT NOT NULL,
    source       TEXT NOT NULL DEFAULT 'unknown',
    severity     TEXT NOT NULL DEFAULT 'ERROR',
    stack_trace  TEXT,
    raw_payload  TEXT,
    origin_id    TEXT,
    observed_at  TEXT NOT NULL,
    created_at   TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_error_events_category ON error_events(category);
CREATE INDEX IF NOT EXISTS idx_error_events_created  ON error_events(created_at);

-- ============================================================================
-- Remediation Plans (keyed by error signature, several per signature allowed)
-- ============================================================================

CREATE TABLE IF NOT EXISTS remediation_plans (
    id               TEXT PRIMARY KEY,
    signature        TEXT NOT NULL,
    category         TEXT NOT NULL,
    description      TEXT NOT NULL,
    actions_json     TEXT NOT NULL DEFAULT '[]',
    generator_notes  TEXT,
    priority         TEXT NOT NULL DEFAULT 'medium',
    success_rate     REAL NOT NULL DEFAULT 0,
    execution_count  INTEGER NOT NULL DEFAULT 0,
    created_at       TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_plans_signature ON remediation_plans(signature, success_rate DESC, execution_count DESC);
CREATE INDEX IF NOT EXISTS idx_plans_created   ON remediation_plans(created_at);

-- ============================================================================
-- Execution Records (append-only audit trail)
-- ============================================================================

CREATE TABLE IF NOT EXISTS execution_records (
    id              TEXT PRIMARY KEY,
    error_event_id  TEXT REFERENCES error_events(id),
    plan_id         TEXT REFERENCES remediation_plans(id),
    status          TEXT NOT NULL,
    output          TEXT NOT NULL DEFAULT '[]',
    failure_reason  TEXT,
    elapsed_ms      INTEGER NOT NULL DEFAULT 0,
    created_at      TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_exec_records_event   ON execution_records(error_event_id);
CREATE INDEX IF NOT EXISTS idx_exec_records_plan    ON execution_records(plan_id);
CREATE INDEX IF NOT EXISTS idx_exec_records_created ON execution_records(created_at);

-- ============================================================================
-- Component Status (one row per component, latest wins)
-- ============================================================================

CREATE TABLE IF NOT EXISTS component_status (
    component_name  TEXT PRIMARY KEY,
    status          TEXT NOT NULL,
    error_count     INTEGER NOT NULL DEFAULT 0,
    last_check      TEXT NOT NULL
);
"#;
