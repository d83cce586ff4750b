use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::db::models::{CreateErrorEventInput, RemediationPlan};
use crate::error::AppError;

// ---------------------------------------------------------------------------
// Detection
// ---------------------------------------------------------------------------

/// An error occurrence normalized from a raw log-store record, before persistence.
#[derive(Debug, Clone, PartialEq)]
pub struct DetectedError {
    pub category: String,
    pub message: String,
    pub source: String,
    pub severity: String,
    pub stack_trace: Option<String>,
    pub raw_payload: Option<serde_json::Value>,
    pub origin_id: Option<String>,
    pub observed_at: DateTime<Utc>,
}

impl DetectedError {
    pub fn signature(&self) -> String {
        super::signature::compute(&self.category, &self.message)
    }

    pub fn to_create_input(&self) -> CreateErrorEventInput {
        CreateErrorEventInput {
            signature: self.signature(),
            category: self.category.clone(),
            message: self.message.clone(),
            source: self.source.clone(),
            severity: self.severity.clone(),
            stack_trace: self.stack_trace.clone(),
            raw_payload: self.raw_payload.as_ref().map(|v| v.to_string()),
            origin_id: self.origin_id.clone(),
            observed_at: self.observed_at.to_rfc3339(),
        }
    }
}

// ---------------------------------------------------------------------------
// Plans
// ---------------------------------------------------------------------------

/// Plan urgency. Ordering is `High < Medium < Low` so an ascending sort runs urgent plans first.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    High,
    #[default]
    Medium,
    Low,
}

impl Priority {
    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::High => "high",
            Priority::Medium => "medium",
            Priority::Low => "low",
        }
    }
}

impl FromStr for Priority {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "high" => Ok(Priority::High),
            "medium" => Ok(Priority::Medium),
            "low" => Ok(Priority::Low),
            other => Err(AppError::Validation(format!("unknown priority: {other}"))),
        }
    }
}

/// A plan handed to the executor, tagged with where it came from.
#[derive(Debug, Clone)]
pub struct ResolvedPlan {
    pub plan: RemediationPlan,
    pub reused: bool,
}

impl ResolvedPlan {
    /// Falls back to `Medium` for unrecognised stored values.
    pub fn priority(&self) -> Priority {
        self.plan.priority.parse().unwrap_or_default()
    }
}

// ---------------------------------------------------------------------------
// Execution
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Success,
    PartialSuccess,
    NeedsVerification,
    Failed,
    Error,
}

impl ExecutionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionStatus::Success => "success",
            ExecutionStatus::PartialSuccess => "partial_success",
            ExecutionStatus::NeedsVerification => "needs_verification",
            ExecutionStatus::Failed => "failed",
            ExecutionStatus::Error => "error",
        }
    }

    pub fn is_failure(&self) -> bool {
        matches!(self, ExecutionStatus::Failed | ExecutionStatus::Error)
    }
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// States an execution passes through; logged on each transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionPhase {
    PreCheck,
    Running,
    Succeeded,
    Partial,
    Failed,
    Verifying,
    Verified,
    NeedsVerification,
}

/// Outcome of one action.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionResult {
    pub index: usize,
    pub kind: String,
    pub command: String,
    pub description: String,
    pub critical: bool,
    pub success: bool,
    pub output: String,
    pub error: Option<String>,
    pub elapsed_ms: u64,
}

/// Everything the executor learned while running one plan.
#[derive(Debug, Clone)]
pub struct ExecutionOutcome {
    pub status: ExecutionStatus,
    pub results: Vec<ActionResult>,
    /// Commands dropped by the safety policy before execution.
    pub rejected: Vec<String>,
    pub failure_reason: Option<String>,
    pub elapsed: Duration,
    pub record_id: Option<String>,
}

impl ExecutionOutcome {
    /// Up to `limit` error strings from failed actions, for notifications.
    pub fn error_details(&self, limit: usize) -> Vec<String> {
        self.results
            .iter()
            .filter(|r| !r.success)
            .filter_map(|r| r.error.clone())
            .take(limit)
            .collect()
    }
}
