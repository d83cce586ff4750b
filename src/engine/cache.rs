//! Reuse-or-regenerate decision for remediation plans.

use std::sync::Arc;

use crate::clients::generator::{GeneratedPlan, PlanGenerator, PlanRequest};
use crate::db::models::{CreatePlanInput, ErrorEvent};
use crate::db::repos::plans as plan_repo;
use crate::db::DbPool;
use crate::engine::safety;
use crate::engine::types::ResolvedPlan;
use crate::error::AppError;

pub struct SolutionCache {
    pool: DbPool,
    generator: Arc<dyn PlanGenerator>,
    /// A stored plan is replayed only when its success rate is strictly above this.
    reuse_threshold: f64,
}

impl SolutionCache {
    pub fn new(pool: DbPool, generator: Arc<dyn PlanGenerator>, reuse_threshold: f64) -> Self {
        Self {
            pool,
            generator,
            reuse_threshold,
        }
    }

    /// Return a plan for `event`: the best stored plan for its signature if it
    /// clears the reuse threshold, otherwise a freshly generated one.
    pub async fn resolve(&self, event: &ErrorEvent) -> Result<ResolvedPlan, AppError> {
        if let Some(plan) = plan_repo::find_best_for_signature(&self.pool, &event.signature)? {
            if plan.success_rate > self.reuse_threshold {
                tracing::info!(
                    signature = %event.signature,
                    plan_id = %plan.id,
                    success_rate = plan.success_rate,
                    "Reusing stored plan"
                );
                return Ok(ResolvedPlan { plan, reused: true });
            }
            tracing::debug!(
                signature = %event.signature,
                success_rate = plan.success_rate,
                threshold = self.reuse_threshold,
                "Stored plan below reuse threshold, regenerating"
            );
        }

        let request = PlanRequest {
            category: event.category.clone(),
            message: event.message.clone(),
            source: event.source.clone(),
            severity: event.severity.clone(),
            stack_trace: event.stack_trace.clone(),
            raw_payload: event.raw_payload.clone(),
        };
        let generated = self.generator.generate(&request).await?;
        let input = self.to_plan_input(&event.signature, generated);
        let plan = plan_repo::create(&self.pool, &input)?;

        tracing::info!(
            signature = %event.signature,
            plan_id = %plan.id,
            actions = plan.actions.len(),
            "Generated new plan"
        );
        Ok(ResolvedPlan { plan, reused: false })
    }

    fn to_plan_input(&self, signature: &str, generated: GeneratedPlan) -> CreatePlanInput {
        let (admitted, rejected) = safety::partition(&generated.commands);
        if !rejected.is_empty() {
            tracing::warn!(signature = %signature, dropped = rejected.len(), "Generated plan had unsafe actions");
        }

        let notes = format!(
            "{}\n\nestimated_time: {}\nsuccess_probability: {}",
            generated.analysis, generated.estimated_time, generated.success_probability
        );

        CreatePlanInput {
            signature: signature.to_string(),
            category: generated.solution_type,
            description: generated.description,
            actions: admitted,
            generator_notes: Some(notes),
            priority: generated.priority.as_str().to_string(),
        }
    }
}
