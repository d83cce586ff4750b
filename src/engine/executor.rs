//! Safety-gated sequential plan runner.
//!
//! `PRE_CHECK -> RUNNING -> {SUCCEEDED | PARTIAL | FAILED} -> VERIFYING -> {VERIFIED | NEEDS_VERIFICATION}`
//!
//! Every call appends exactly one execution record, whatever the outcome.

use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::clients::kube::ControlPlane;
use crate::config::ResolverConfig;
use crate::db::models::CreateExecutionRecordInput;
use crate::db::repos::execution_records as record_repo;
use crate::db::DbPool;
use crate::engine::actions::{self, Action, ActionContext};
use crate::engine::safety;
use crate::engine::types::{ExecutionOutcome, ExecutionPhase, ExecutionStatus, ResolvedPlan};
use crate::engine::verifier::Verifier;
use crate::error::AppError;

#[derive(Debug, Clone)]
pub struct ExecutorSettings {
    pub safe_mode: bool,
    pub namespace: String,
    pub command_timeout: Duration,
    pub action_delay: Duration,
}

impl ExecutorSettings {
    pub fn from_config(resolver: &ResolverConfig, namespace: &str) -> Self {
        Self {
            safe_mode: resolver.safe_mode,
            namespace: namespace.to_string(),
            command_timeout: Duration::from_secs(resolver.command_timeout_secs),
            action_delay: Duration::from_secs(resolver.action_delay_secs),
        }
    }
}

pub struct Executor {
    pool: DbPool,
    control_plane: Arc<dyn ControlPlane>,
    verifier: Verifier,
    settings: ExecutorSettings,
}

impl Executor {
    pub fn new(
        pool: DbPool,
        control_plane: Arc<dyn ControlPlane>,
        verifier: Verifier,
        settings: ExecutorSettings,
    ) -> Self {
        Self {
            pool,
            control_plane,
            verifier,
            settings,
        }
    }

    /// Run `resolved` against the target and record the outcome.
    pub async fn execute(&self, resolved: &ResolvedPlan, error_event_id: Option<&str>) -> ExecutionOutcome {
        let started = Instant::now();
        let plan = &resolved.plan;
        tracing::info!(
            plan_id = %plan.id,
            category = %plan.category,
            reused = resolved.reused,
            actions = plan.actions.len(),
            "Executing remediation plan"
        );

        let (admitted, rejected) = safety::partition(&plan.actions);
        let actions: Vec<Action> = admitted.iter().map(Action::from_spec).collect();

        let mut outcome = ExecutionOutcome {
            status: ExecutionStatus::Failed,
            results: Vec::new(),
            rejected,
            failure_reason: None,
            elapsed: Duration::ZERO,
            record_id: None,
        };

        transition(&plan.id, ExecutionPhase::PreCheck);
        match self.pre_check(&actions).await {
            Ok(()) if actions.is_empty() => {
                tracing::error!(
                    plan_id = %plan.id,
                    rejected = outcome.rejected.len(),
                    "Plan has no executable actions"
                );
                outcome.status = ExecutionStatus::Failed;
                outcome.failure_reason = Some("no executable actions".into());
                transition(&plan.id, ExecutionPhase::Failed);
            }
            Ok(()) => self.run_actions(&plan.id, &actions, &mut outcome).await,
            Err(reason) => {
                tracing::error!(plan_id = %plan.id, "Pre-check failed: {}", reason);
                outcome.status = ExecutionStatus::Failed;
                outcome.failure_reason = Some(format!("pre-check failed: {reason}"));
                transition(&plan.id, ExecutionPhase::Failed);
            }
        }

        if outcome.status == ExecutionStatus::Success {
            transition(&plan.id, ExecutionPhase::Verifying);
            if self.verifier.verify(plan).await {
                transition(&plan.id, ExecutionPhase::Verified);
            } else {
                outcome.status = ExecutionStatus::NeedsVerification;
                outcome.failure_reason = Some("post-execution verification failed".into());
                transition(&plan.id, ExecutionPhase::NeedsVerification);
            }
        }

        outcome.elapsed = started.elapsed();
        outcome.record_id = self.record(&plan.id, error_event_id, &outcome);

        tracing::info!(
            plan_id = %plan.id,
            status = %outcome.status,
            elapsed_ms = outcome.elapsed.as_millis() as u64,
            "Remediation finished"
        );
        outcome
    }

    /// Control-plane reachability, namespace existence, then the safe-mode gate.
    async fn pre_check(&self, actions: &[Action]) -> Result<(), String> {
        self.control_plane
            .probe()
            .await
            .map_err(|e| format!("control plane unreachable: {e}"))?;

        match self.control_plane.namespace_exists(&self.settings.namespace).await {
            Ok(true) => {}
            Ok(false) => return Err(format!("namespace '{}' does not exist", self.settings.namespace)),
            Err(e) => return Err(format!("namespace lookup failed: {e}")),
        }

        if self.settings.safe_mode {
            if let Some(unsafe_action) = actions.iter().find(|a| !a.safe) {
                return Err(format!(
                    "safe mode rejects action not marked safe: {}",
                    unsafe_action.command
                ));
            }
        }

        Ok(())
    }

    async fn run_actions(&self, plan_id: &str, actions: &[Action], outcome: &mut ExecutionOutcome) {
        transition(plan_id, ExecutionPhase::Running);
        let ctx = ActionContext {
            control_plane: self.control_plane.as_ref(),
            namespace: &self.settings.namespace,
            command_timeout: self.settings.command_timeout,
        };

        let mut any_failed = false;
        for (i, action) in actions.iter().enumerate() {
            tracing::info!(
                plan_id = %plan_id,
                step = i + 1,
                total = actions.len(),
                kind = action.kind.label(),
                "{}",
                action.description
            );

            let result = match actions::run(action, i, &ctx).await {
                Ok(r) => r,
                Err(e) => {
                    tracing::error!(plan_id = %plan_id, step = i + 1, "Unexpected error while executing plan: {}", e);
                    outcome.status = ExecutionStatus::Error;
                    outcome.failure_reason = Some(unexpected_reason(&e));
                    transition(plan_id, ExecutionPhase::Failed);
                    return;
                }
            };

            let failed = !result.success;
            let critical = result.critical;
            let error = result.error.clone().unwrap_or_else(|| "unknown error".into());
            outcome.results.push(result);

            if failed {
                any_failed = true;
                if critical {
                    tracing::error!(plan_id = %plan_id, step = i + 1, "Critical action failed, aborting plan");
                    outcome.status = ExecutionStatus::Failed;
                    outcome.failure_reason = Some(format!(
                        "critical action {} ({}) failed: {}",
                        i + 1,
                        action.description,
                        error
                    ));
                    transition(plan_id, ExecutionPhase::Failed);
                    return;
                }
                tracing::warn!(plan_id = %plan_id, step = i + 1, "Non-critical action failed, continuing");
                outcome.failure_reason.get_or_insert_with(|| format!("action {} failed: {}", i + 1, error));
            }

            if i + 1 < actions.len() && !self.settings.action_delay.is_zero() {
                tokio::time::sleep(self.settings.action_delay).await;
            }
        }

        if any_failed {
            outcome.status = ExecutionStatus::PartialSuccess;
            transition(plan_id, ExecutionPhase::Partial);
        } else {
            outcome.status = ExecutionStatus::Success;
            transition(plan_id, ExecutionPhase::Succeeded);
        }
    }

    fn record(&self, plan_id: &str, error_event_id: Option<&str>, outcome: &ExecutionOutcome) -> Option<String> {
        let output = match serde_json::to_string(&outcome.results) {
            Ok(s) => s,
            Err(e) => {
                tracing::error!("Failed to serialize action results: {}", e);
                "[]".into()
            }
        };
        let input = CreateExecutionRecordInput {
            error_event_id: error_event_id.map(str::to_string),
            plan_id: Some(plan_id.to_string()),
            status: outcome.status.as_str().to_string(),
            output,
            failure_reason: outcome.failure_reason.clone(),
            elapsed_ms: outcome.elapsed.as_millis() as i64,
        };
        match record_repo::append(&self.pool, &input) {
            Ok(rec) => Some(rec.id),
            Err(e) => {
                tracing::error!(plan_id = %plan_id, "Failed to append execution record: {}", e);
                None
            }
        }
    }
}

fn unexpected_reason(e: &AppError) -> String {
    format!("unexpected {} error: {}", e.kind(), e)
}

fn transition(plan_id: &str, phase: ExecutionPhase) {
    tracing::debug!(plan_id = %plan_id, ?phase, "Execution phase");
}
