//! One detection cycle: detect, escalate, persist, resolve, execute, notify.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::config::AppConfig;
use crate::db::models::{CreateExecutionRecordInput, ErrorEvent};
use crate::db::repos::{component_status as status_repo, error_events as event_repo, execution_records as record_repo};
use crate::db::DbPool;
use crate::engine::background::RuntimeStats;
use crate::engine::cache::SolutionCache;
use crate::engine::detector::{self, CategoryBatch, Detector};
use crate::engine::executor::Executor;
use crate::engine::types::{ExecutionStatus, ResolvedPlan};
use crate::error::AppError;
use crate::notifications::{self, Notifier, MAX_SAMPLES};

pub const ELASTICSEARCH_COMPONENT: &str = "elasticsearch";
pub const RESOLVER_COMPONENT: &str = "resolver";

#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub error_threshold: usize,
    /// Generation attempts per event before it stops being handed downstream.
    pub max_retries: u32,
    pub plan_failure_delay: Duration,
}

impl PipelineSettings {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            error_threshold: config.monitoring.error_threshold,
            max_retries: config.resolver.max_retries,
            plan_failure_delay: Duration::from_secs(config.resolver.plan_failure_delay_secs),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleReport {
    pub detected: usize,
    pub escalated_categories: usize,
    pub queued: usize,
    pub executed: usize,
    pub resolved: usize,
    pub failed: usize,
}

pub struct Pipeline {
    pool: DbPool,
    detector: Detector,
    cache: SolutionCache,
    executor: Executor,
    notifier: Arc<dyn Notifier>,
    stats: Arc<RuntimeStats>,
    settings: PipelineSettings,
}

enum Resolution {
    Plan(ResolvedPlan),
    Failed,
    Cancelled,
}

impl Pipeline {
    pub fn new(
        pool: DbPool,
        detector: Detector,
        cache: SolutionCache,
        executor: Executor,
        notifier: Arc<dyn Notifier>,
        stats: Arc<RuntimeStats>,
        settings: PipelineSettings,
    ) -> Self {
        Self {
            pool,
            detector,
            cache,
            executor,
            notifier,
            stats,
            settings,
        }
    }

    /// Run one full pass over the last `window`.
    ///
    /// A log-store failure aborts the cycle with a retryable error. Everything
    /// after detection is handled per event and never aborts the cycle.
    pub async fn run_cycle(&self, window: Duration, cancel: &CancellationToken) -> Result<CycleReport, AppError> {
        let mut report = CycleReport::default();

        let errors = match self.detector.poll(window).await {
            Ok(errors) => {
                self.record_status(ELASTICSEARCH_COMPONENT, "healthy", errors.len() as i64);
                errors
            }
            Err(e) => {
                self.record_status(ELASTICSEARCH_COMPONENT, "error", 1);
                return Err(e);
            }
        };
        report.detected = errors.len();
        self.stats.record_detected(errors.len());
        if errors.is_empty() {
            return Ok(report);
        }

        let batches = detector::escalate(errors, self.settings.error_threshold);
        report.escalated_categories = batches.len();

        let mut queued = Vec::new();
        let mut seen = HashSet::new();
        for batch in &batches {
            let samples: Vec<String> = batch.samples().into_iter().take(MAX_SAMPLES).collect();
            notifications::notify_detected(self.notifier.as_ref(), &batch.category, batch.events.len(), &samples)
                .await;
            queued.extend(self.persist_batch(batch, &mut seen));
        }
        report.queued = queued.len();

        let mut plans: Vec<(ErrorEvent, ResolvedPlan)> = Vec::new();
        let queued_total = queued.len();
        for (i, event) in queued.into_iter().enumerate() {
            if cancel.is_cancelled() {
                tracing::info!(remaining = queued_total - i, "Shutdown requested, remaining events left unresolved");
                break;
            }
            match self.resolve(&event, cancel).await {
                Resolution::Plan(plan) => plans.push((event, plan)),
                Resolution::Failed => report.failed += 1,
                Resolution::Cancelled => {
                    tracing::info!(event_id = %event.id, "Shutdown requested during plan resolution");
                    break;
                }
            }
        }

        // Stable: equal priorities keep detection order.
        plans.sort_by_key(|(_, p)| p.priority());

        let total = plans.len();
        for (i, (event, plan)) in plans.iter().enumerate() {
            if cancel.is_cancelled() {
                tracing::info!(remaining = total - i, "Shutdown requested, remaining plans deferred");
                break;
            }

            let outcome = self.executor.execute(plan, Some(&event.id)).await;
            report.executed += 1;

            match outcome.status {
                ExecutionStatus::Success | ExecutionStatus::NeedsVerification => {
                    report.resolved += 1;
                    self.stats.record_resolved();
                    let mut summary = format!(
                        "{} ({} action(s) executed)",
                        plan.plan.description,
                        outcome.results.len()
                    );
                    if outcome.status == ExecutionStatus::NeedsVerification {
                        summary.push_str("; post-execution verification pending");
                    }
                    notifications::notify_resolved(
                        self.notifier.as_ref(),
                        &event.category,
                        &plan.plan.category,
                        &summary,
                        plan.reused,
                    )
                    .await;
                }
                ExecutionStatus::PartialSuccess | ExecutionStatus::Failed | ExecutionStatus::Error => {
                    report.failed += 1;
                    self.stats.record_failed();
                    let reason = outcome
                        .failure_reason
                        .clone()
                        .unwrap_or_else(|| outcome.status.to_string());
                    notifications::notify_failed(
                        self.notifier.as_ref(),
                        &event.category,
                        &plan.plan.category,
                        &reason,
                        outcome.error_details(MAX_SAMPLES),
                    )
                    .await;
                }
            }

            if outcome.status.is_failure() && i + 1 < total && !self.settings.plan_failure_delay.is_zero() {
                tokio::select! {
                    _ = cancel.cancelled() => {}
                    _ = tokio::time::sleep(self.settings.plan_failure_delay) => {}
                }
            }
        }

        let resolver_status = if report.failed == 0 { "healthy" } else { "degraded" };
        self.record_status(RESOLVER_COMPONENT, resolver_status, report.failed as i64);

        tracing::info!(
            detected = report.detected,
            categories = report.escalated_categories,
            executed = report.executed,
            resolved = report.resolved,
            failed = report.failed,
            "Cycle finished"
        );
        Ok(report)
    }

    /// Persist each event of an escalated batch and return those to hand
    /// downstream. A signature already stored is handed down again only if no
    /// resolution attempt was recorded for it.
    fn persist_batch(&self, batch: &CategoryBatch, seen: &mut HashSet<String>) -> Vec<ErrorEvent> {
        let mut out = Vec::new();
        for detected in &batch.events {
            let input = detected.to_create_input();
            if !seen.insert(input.signature.clone()) {
                continue;
            }

            let stored = match event_repo::insert_if_absent(&self.pool, &input) {
                Ok(Some(event)) => Some(event),
                Ok(None) => match event_repo::find_unhandled_by_signature(
                    &self.pool,
                    &input.signature,
                    self.attempt_limit(),
                ) {
                    Ok(found) => found,
                    Err(e) => {
                        tracing::error!(signature = %input.signature, "Duplicate lookup failed: {}", e);
                        None
                    }
                },
                Err(e) => {
                    tracing::warn!(category = %batch.category, "Error event not stored: {}", e);
                    None
                }
            };

            if let Some(event) = stored {
                tracing::debug!(event_id = %event.id, category = %event.category, "Error event queued");
                out.push(event);
            }
        }
        out
    }

    async fn resolve(&self, event: &ErrorEvent, cancel: &CancellationToken) -> Resolution {
        let result = tokio::select! {
            _ = cancel.cancelled() => return Resolution::Cancelled,
            result = self.cache.resolve(event) => result,
        };
        match result {
            Ok(plan) => {
                self.stats.record_analyzed();
                Resolution::Plan(plan)
            }
            Err(e) => {
                self.record_generation_failure(event, &e).await;
                Resolution::Failed
            }
        }
    }

    /// Every failed attempt gets one error record (no plan) and one failure
    /// notification. The event is handed down again next cycle until
    /// `max_retries` such records exist.
    async fn record_generation_failure(&self, event: &ErrorEvent, cause: &AppError) {
        let limit = self.attempt_limit();
        let previous = event_repo::count_failed_attempts(&self.pool, &event.id).unwrap_or_else(|e| {
            tracing::warn!(event_id = %event.id, "Attempt lookup failed: {}", e);
            0
        });
        let attempt = previous + 1;
        let reason = if attempt < limit {
            tracing::warn!(event_id = %event.id, attempt, limit, "Plan resolution failed, eligible next cycle: {}", cause);
            format!("plan generation failed (attempt {attempt} of {limit}), retrying next cycle: {cause}")
        } else {
            tracing::error!(event_id = %event.id, attempt, limit, "Plan resolution abandoned: {}", cause);
            format!("no remediation plan after {attempt} attempt(s): {cause}")
        };

        let input = CreateExecutionRecordInput {
            error_event_id: Some(event.id.clone()),
            plan_id: None,
            status: ExecutionStatus::Error.as_str().to_string(),
            output: "[]".into(),
            failure_reason: Some(reason.clone()),
            elapsed_ms: 0,
        };
        if let Err(e) = record_repo::append(&self.pool, &input) {
            tracing::error!(event_id = %event.id, "Failed to record generation failure: {}", e);
        }
        self.stats.record_failed();
        notifications::notify_failed(self.notifier.as_ref(), &event.category, "none", &reason, Vec::new()).await;
    }

    fn attempt_limit(&self) -> u32 {
        self.settings.max_retries.max(1)
    }

    fn record_status(&self, component: &str, status: &str, error_count: i64) {
        if let Err(e) = status_repo::upsert(&self.pool, component, status, error_count) {
            tracing::warn!(component, "Failed to record component status: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    use crate::clients::elastic::LogStore;
    use crate::clients::generator::PlanGenerator;
    use crate::clients::kube::ControlPlane;
    use crate::db::init_test_db;
    use crate::db::repos::plans as plan_repo;
    use crate::engine::classify::Classifier;
    use crate::engine::executor::ExecutorSettings;
    use crate::engine::testing::{
        action, generated_plan, FakeControlPlane, FakeGenerator, FakeLogStore, RecordingNotifier,
    };
    use crate::engine::verifier::Verifier;
    use crate::notifications::NotificationEvent;

    struct Harness {
        pool: DbPool,
        pipeline: Pipeline,
        notifier: Arc<RecordingNotifier>,
        generator: Arc<FakeGenerator>,
        stats: Arc<RuntimeStats>,
    }

    fn harness(hits: Vec<serde_json::Value>, generator: FakeGenerator, threshold: usize, max_retries: u32) -> Harness {
        let pool = init_test_db().unwrap();
        let store: Arc<dyn LogStore> = Arc::new(FakeLogStore::with_hits(hits));
        let cp: Arc<dyn ControlPlane> = Arc::new(FakeControlPlane::healthy());
        let generator = Arc::new(generator);
        let notifier = Arc::new(RecordingNotifier::default());
        let stats = Arc::new(RuntimeStats::new());

        let detector = Detector::new(store, Classifier::default(), "logstash-*", Duration::from_secs(86_400));
        let gen_dyn: Arc<dyn PlanGenerator> = generator.clone();
        let cache = SolutionCache::new(pool.clone(), gen_dyn, 50.0);
        let verifier = Verifier::new(pool.clone(), cp.clone(), None, "default");
        let executor = Executor::new(
            pool.clone(),
            cp,
            verifier,
            ExecutorSettings {
                safe_mode: true,
                namespace: "default".into(),
                command_timeout: Duration::from_secs(5),
                action_delay: Duration::ZERO,
            },
        );
        let notifier_dyn: Arc<dyn Notifier> = notifier.clone();
        let pipeline = Pipeline::new(
            pool.clone(),
            detector,
            cache,
            executor,
            notifier_dyn,
            stats.clone(),
            PipelineSettings {
                error_threshold: threshold,
                max_retries,
                plan_failure_delay: Duration::ZERO,
            },
        );
        Harness { pool, pipeline, notifier, generator, stats }
    }

    fn log_hit(id: &str, message: &str) -> serde_json::Value {
        json!({ "_id": id, "_source": { "message": message, "log": { "level": "ERROR" }, "host": { "name": "node-1" } } })
    }

    fn scale_generator() -> FakeGenerator {
        FakeGenerator::returning(generated_plan(
            "scaling",
            vec![action("kubectl", "kubectl scale deployment api --replicas=3", true, true)],
        ))
    }

    #[tokio::test]
    async fn test_oomkilled_end_to_end() {
        let h = harness(vec![log_hit("1", "OOMKilled: memory limit exceeded")], scale_generator(), 1, 3);
        let report = h.pipeline.run_cycle(Duration::from_secs(60), &CancellationToken::new()).await.unwrap();

        assert_eq!(report.detected, 1);
        assert_eq!(report.executed, 1);
        assert_eq!(report.resolved, 1);

        let events = h.notifier.events();
        assert_eq!(events.len(), 2);
        assert!(matches!(&events[0], NotificationEvent::Detected { category, count: 1, .. } if category == "memory"));
        match &events[1] {
            NotificationEvent::Resolved { category, solution_type, reused, .. } => {
                assert_eq!(category, "memory");
                assert_eq!(solution_type, "scaling");
                assert!(!reused);
            }
            other => panic!("unexpected notification: {other:?}"),
        }

        let records = record_repo::get_recent(&h.pool, 10).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].status, "success");
        assert_eq!(h.generator.calls(), 1);
        assert_eq!(h.stats.snapshot().resolved, 1);
        assert_eq!(status_repo::get(&h.pool, ELASTICSEARCH_COMPONENT).unwrap().status, "healthy");
    }

    #[tokio::test]
    async fn test_threshold_gates_notifications() {
        let hits = vec![
            log_hit("1", "OOMKilled pod api-1"),
            log_hit("2", "OOMKilled pod api-2"),
            log_hit("3", "OOMKilled pod api-3"),
            log_hit("4", "dial tcp: connection refused"),
        ];
        let h = harness(hits, scale_generator(), 2, 3);
        let report = h.pipeline.run_cycle(Duration::from_secs(60), &CancellationToken::new()).await.unwrap();

        assert_eq!(report.escalated_categories, 1);
        let detected: Vec<_> = h
            .notifier
            .events()
            .into_iter()
            .filter(|e| matches!(e, NotificationEvent::Detected { .. }))
            .collect();
        assert_eq!(detected.len(), 1);
        assert!(matches!(&detected[0], NotificationEvent::Detected { category, count: 3, samples } if category == "memory" && samples.len() == 3));
        assert_eq!(event_repo::count(&h.pool).unwrap(), 3);
    }

    #[tokio::test]
    async fn test_handled_duplicate_not_rerun() {
        let h = harness(vec![log_hit("1", "OOMKilled: memory limit exceeded")], scale_generator(), 1, 3);
        let cancel = CancellationToken::new();
        h.pipeline.run_cycle(Duration::from_secs(60), &cancel).await.unwrap();
        let second = h.pipeline.run_cycle(Duration::from_secs(60), &cancel).await.unwrap();

        assert_eq!(second.detected, 1);
        assert_eq!(second.queued, 0);
        assert_eq!(second.executed, 0);
        assert_eq!(event_repo::count(&h.pool).unwrap(), 1);
        assert_eq!(record_repo::count(&h.pool).unwrap(), 1);
    }

    #[tokio::test]
    async fn test_generation_failure_recorded_every_attempt() {
        let h = harness(vec![log_hit("1", "OOMKilled: memory limit exceeded")], FakeGenerator::failing(), 1, 2);
        let cancel = CancellationToken::new();

        let first = h.pipeline.run_cycle(Duration::from_secs(60), &cancel).await.unwrap();
        assert_eq!(first.queued, 1);
        assert_eq!(first.executed, 0);
        assert_eq!(first.failed, 1);
        let records = record_repo::get_recent(&h.pool, 10).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].status, "error");
        assert!(records[0].plan_id.is_none());
        assert!(records[0].failure_reason.as_deref().unwrap().contains("retrying next cycle"));

        let second = h.pipeline.run_cycle(Duration::from_secs(60), &cancel).await.unwrap();
        assert_eq!(second.queued, 1, "unresolved event is handed down again");
        assert_eq!(record_repo::count(&h.pool).unwrap(), 2);

        let third = h.pipeline.run_cycle(Duration::from_secs(60), &cancel).await.unwrap();
        assert_eq!(third.queued, 0);
        assert_eq!(h.generator.calls(), 2);

        let failed = h
            .notifier
            .events()
            .into_iter()
            .filter(|e| matches!(e, NotificationEvent::Failed { .. }))
            .count();
        assert_eq!(failed, 2);
    }

    #[tokio::test]
    async fn test_one_off_generation_failure_leaves_audit_trail() {
        let h = harness(vec![log_hit("1", "OOMKilled: memory limit exceeded")], FakeGenerator::failing(), 1, 3);
        h.pipeline.run_cycle(Duration::from_secs(60), &CancellationToken::new()).await.unwrap();

        let event = event_repo::find_unhandled_by_signature(
            &h.pool,
            &crate::engine::signature::compute("memory", "OOMKilled: memory limit exceeded"),
            3,
        )
        .unwrap()
        .expect("event still eligible");
        let records = record_repo::get_by_error_event(&h.pool, &event.id).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].status, "error");
        assert!(h
            .notifier
            .events()
            .iter()
            .any(|e| matches!(e, NotificationEvent::Failed { category, .. } if category == "memory")));
        assert_eq!(h.stats.snapshot().failed, 1);
    }

    #[tokio::test]
    async fn test_reused_plan_skips_generator() {
        let h = harness(vec![log_hit("1", "OOMKilled: memory limit exceeded")], scale_generator(), 1, 3);
        let signature = crate::engine::signature::compute("memory", "OOMKilled: memory limit exceeded");
        let plan = plan_repo::create(&h.pool, &plan_repo::sample_input(&signature)).unwrap();
        plan_repo::set_statistics(&h.pool, &plan.id, 90.0, 12).unwrap();

        h.pipeline.run_cycle(Duration::from_secs(60), &CancellationToken::new()).await.unwrap();
        assert_eq!(h.generator.calls(), 0);
        assert!(h
            .notifier
            .events()
            .iter()
            .any(|e| matches!(e, NotificationEvent::Resolved { reused: true, .. })));
    }

    #[tokio::test]
    async fn test_cancelled_cycle_starts_no_plans() {
        let h = harness(vec![log_hit("1", "OOMKilled: memory limit exceeded")], scale_generator(), 1, 3);
        let cancel = CancellationToken::new();
        cancel.cancel();
        let report = h.pipeline.run_cycle(Duration::from_secs(60), &cancel).await.unwrap();
        assert_eq!(report.queued, 1);
        assert_eq!(report.executed, 0);
        assert_eq!(h.generator.calls(), 0);
    }

    #[tokio::test]
    async fn test_cancel_interrupts_slow_generation() {
        let hits = vec![
            log_hit("1", "OOMKilled: memory limit exceeded"),
            log_hit("2", "dial tcp 10.0.0.7:9200: connection refused"),
        ];
        let h = harness(hits, scale_generator().slow(Duration::from_secs(30)), 1, 3);
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.cancel();
        });

        let started = std::time::Instant::now();
        let report = tokio::time::timeout(Duration::from_secs(5), h.pipeline.run_cycle(Duration::from_secs(60), &cancel))
            .await
            .expect("cycle returns promptly after cancel")
            .unwrap();
        assert!(started.elapsed() < Duration::from_secs(2));
        assert_eq!(report.queued, 2);
        assert_eq!(report.executed, 0);
        assert_eq!(h.generator.calls(), 1);
        assert_eq!(record_repo::count(&h.pool).unwrap(), 0);
    }

    #[tokio::test]
    async fn test_log_store_failure_is_retryable() {
        let pool = init_test_db().unwrap();
        let store: Arc<dyn LogStore> = Arc::new(FakeLogStore { fail_search: true, ..FakeLogStore::default() });
        let cp: Arc<dyn ControlPlane> = Arc::new(FakeControlPlane::healthy());
        let pipeline = Pipeline::new(
            pool.clone(),
            Detector::new(store, Classifier::default(), "logstash-*", Duration::from_secs(60)),
            SolutionCache::new(pool.clone(), Arc::new(FakeGenerator::failing()), 50.0),
            Executor::new(
                pool.clone(),
                cp.clone(),
                Verifier::new(pool.clone(), cp, None, "default"),
                ExecutorSettings {
                    safe_mode: true,
                    namespace: "default".into(),
                    command_timeout: Duration::from_secs(1),
                    action_delay: Duration::ZERO,
                },
            ),
            Arc::new(RecordingNotifier::default()),
            Arc::new(RuntimeStats::new()),
            PipelineSettings { error_threshold: 1, max_retries: 3, plan_failure_delay: Duration::ZERO },
        );

        let err = pipeline.run_cycle(Duration::from_secs(60), &CancellationToken::new()).await.unwrap_err();
        assert!(err.is_retryable_next_cycle());
        assert_eq!(status_repo::get(&pool, ELASTICSEARCH_COMPONENT).unwrap().status, "error");
    }
}
