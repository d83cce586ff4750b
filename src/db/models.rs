use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

// ============================================================================
// Classification Rules
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClassificationRule {
    pub id: String,
    /// Regex evaluated case-insensitively against the error message.
    pub pattern: String,
    pub category: String,
    pub priority: i64,
    pub description: Option<String>,
    pub enabled: bool,
    pub created_at: String,
}

// ============================================================================
// Error Events
// ============================================================================

/// A persisted error occurrence. Immutable once stored.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorEvent {
    pub id: String,
    pub signature: String,
    pub category: String,
    pub message: String,
    pub source: String,
    pub severity: String,
    pub stack_trace: Option<String>,
    pub raw_payload: Option<String>,
    /// Document id in the log store.
    pub origin_id: Option<String>,
    pub observed_at: String,
    pub created_at: String,
}

#[derive(Debug, Clone)]
pub struct CreateErrorEventInput {
    pub signature: String,
    pub category: String,
    pub message: String,
    pub source: String,
    pub severity: String,
    pub stack_trace: Option<String>,
    pub raw_payload: Option<String>,
    pub origin_id: Option<String>,
    pub observed_at: String,
}

// ============================================================================
// Remediation Plans
// ============================================================================

/// Persisted form of one remediation step, as produced by the plan generator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionSpec {
    /// "kubectl" | "bash" | "config"
    #[serde(rename = "type", default = "default_action_kind")]
    pub kind: String,
    #[serde(default)]
    pub command: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub safe: bool,
    #[serde(default = "default_critical")]
    pub critical: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config_changes: Option<BTreeMap<String, serde_json::Value>>,
}

fn default_critical() -> bool {
    true
}

/// Steps without a `type` are kept and later rejected as unsupported.
fn default_action_kind() -> String {
    "unsupported".into()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemediationPlan {
    pub id: String,
    pub signature: String,
    /// Solution category, e.g. "kubernetes" | "restart" | "scaling" | "config_fix".
    pub category: String,
    pub description: String,
    pub actions: Vec<ActionSpec>,
    pub generator_notes: Option<String>,
    /// "high" | "medium" | "low"
    pub priority: String,
    pub success_rate: f64,
    pub execution_count: i64,
    pub created_at: String,
}

#[derive(Debug, Clone)]
pub struct CreatePlanInput {
    pub signature: String,
    pub category: String,
    pub description: String,
    pub actions: Vec<ActionSpec>,
    pub generator_notes: Option<String>,
    pub priority: String,
}

// ============================================================================
// Execution Records
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionRecord {
    pub id: String,
    pub error_event_id: Option<String>,
    pub plan_id: Option<String>,
    pub status: String,
    /// JSON array of per-action results.
    pub output: String,
    pub failure_reason: Option<String>,
    pub elapsed_ms: i64,
    pub created_at: String,
}

#[derive(Debug, Clone)]
pub struct CreateExecutionRecordInput {
    pub error_event_id: Option<String>,
    pub plan_id: Option<String>,
    pub status: String,
    pub output: String,
    pub failure_reason: Option<String>,
    pub elapsed_ms: i64,
}

// ============================================================================
// Component Status
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComponentStatus {
    pub component_name: String,
    /// "healthy" | "degraded" | "error"
    pub status: String,
    pub error_count: i64,
    pub last_check: String,
}
