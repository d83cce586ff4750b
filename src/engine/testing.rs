//! In-memory collaborators shared by the engine tests.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use serde_json::Value;

use crate::clients::elastic::LogStore;
use crate::clients::generator::{GeneratedPlan, PlanGenerator, PlanRequest};
use crate::clients::kube::{ControlPlane, PodStatus};
use crate::db::models::ActionSpec;
use crate::engine::types::Priority;
use crate::error::AppError;
use crate::notifications::{NotificationEvent, Notifier};

// ---------------------------------------------------------------------------
// Control plane
// ---------------------------------------------------------------------------

pub struct FakeControlPlane {
    pub reachable: bool,
    pub namespace_present: bool,
    pub pods: Vec<PodStatus>,
    calls: Mutex<Vec<String>>,
}

impl FakeControlPlane {
    pub fn healthy() -> Self {
        Self {
            reachable: true,
            namespace_present: true,
            pods: vec![PodStatus { name: "api-1".into(), phase: "Running".into() }],
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn unreachable() -> Self {
        Self { reachable: false, ..Self::healthy() }
    }

    pub fn with_pods(pods: &[(&str, &str)]) -> Self {
        Self {
            pods: pods
                .iter()
                .map(|(name, phase)| PodStatus { name: (*name).into(), phase: (*phase).into() })
                .collect(),
            ..Self::healthy()
        }
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    fn check(&self) -> Result<(), AppError> {
        if self.reachable {
            Ok(())
        } else {
            Err(AppError::Connectivity("kubernetes: connection refused".into()))
        }
    }
}

#[async_trait]
impl ControlPlane for FakeControlPlane {
    async fn probe(&self) -> Result<(), AppError> {
        self.check()
    }

    async fn namespace_exists(&self, _namespace: &str) -> Result<bool, AppError> {
        self.check()?;
        Ok(self.namespace_present)
    }

    async fn restart_deployment(&self, namespace: &str, name: &str) -> Result<String, AppError> {
        self.check()?;
        self.calls.lock().unwrap().push(format!("restart {namespace}/{name}"));
        Ok(format!("deployment.apps/{name} restarted"))
    }

    async fn scale_deployment(&self, namespace: &str, name: &str, replicas: i32) -> Result<String, AppError> {
        self.check()?;
        self.calls.lock().unwrap().push(format!("scale {namespace}/{name}={replicas}"));
        Ok(format!("deployment.apps/{name} scaled to {replicas}"))
    }

    async fn list_pods(&self, _namespace: &str) -> Result<Vec<PodStatus>, AppError> {
        self.check()?;
        Ok(self.pods.clone())
    }
}

// ---------------------------------------------------------------------------
// Log store
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct FakeLogStore {
    pub hits: Vec<Value>,
    pub fail_search: bool,
    pub reachable: bool,
    pub indices: Mutex<BTreeSet<String>>,
    pub deleted: Mutex<Vec<String>>,
    pub searches: Mutex<Vec<(String, Value)>>,
}

impl FakeLogStore {
    pub fn with_hits(hits: Vec<Value>) -> Self {
        Self { hits, reachable: true, ..Self::default() }
    }

    pub fn with_indices(names: &[String]) -> Self {
        Self {
            reachable: true,
            indices: Mutex::new(names.iter().cloned().collect()),
            ..Self::default()
        }
    }

    pub fn remaining_indices(&self) -> Vec<String> {
        self.indices.lock().unwrap().iter().cloned().collect()
    }
}

#[async_trait]
impl LogStore for FakeLogStore {
    async fn search(&self, index: &str, query: &Value) -> Result<Vec<Value>, AppError> {
        if self.fail_search {
            return Err(AppError::Connectivity("elasticsearch: connection refused".into()));
        }
        self.searches.lock().unwrap().push((index.to_string(), query.clone()));
        Ok(self.hits.clone())
    }

    async fn ping(&self) -> Result<bool, AppError> {
        Ok(self.reachable)
    }

    async fn index_exists(&self, index: &str) -> Result<bool, AppError> {
        Ok(self.indices.lock().unwrap().contains(index))
    }

    async fn delete_index(&self, index: &str) -> Result<(), AppError> {
        if !self.indices.lock().unwrap().remove(index) {
            return Err(AppError::Execution(format!("no such index: {index}")));
        }
        self.deleted.lock().unwrap().push(index.to_string());
        Ok(())
    }

    async fn delete_indices_matching(&self, pattern: &str) -> Result<(), AppError> {
        let prefix = pattern.trim_end_matches('*');
        let mut indices = self.indices.lock().unwrap();
        let matched: Vec<String> = indices.iter().filter(|i| i.starts_with(prefix)).cloned().collect();
        for name in matched {
            indices.remove(&name);
            self.deleted.lock().unwrap().push(name);
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Plan generator
// ---------------------------------------------------------------------------

pub struct FakeGenerator {
    plan: Option<GeneratedPlan>,
    calls: AtomicUsize,
    delay: std::time::Duration,
}

impl FakeGenerator {
    pub fn returning(plan: GeneratedPlan) -> Self {
        Self { plan: Some(plan), calls: AtomicUsize::new(0), delay: std::time::Duration::ZERO }
    }

    pub fn failing() -> Self {
        Self { plan: None, calls: AtomicUsize::new(0), delay: std::time::Duration::ZERO }
    }

    /// Sleep for `delay` before every reply.
    pub fn slow(mut self, delay: std::time::Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PlanGenerator for FakeGenerator {
    async fn generate(&self, _request: &PlanRequest) -> Result<GeneratedPlan, AppError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.plan
            .clone()
            .ok_or_else(|| AppError::Generation("missing required field: commands".into()))
    }
}

pub fn action(kind: &str, command: &str, safe: bool, critical: bool) -> ActionSpec {
    ActionSpec {
        kind: kind.into(),
        command: command.into(),
        description: format!("run {command}"),
        safe,
        critical,
        config_type: None,
        config_path: None,
        config_changes: None,
    }
}

pub fn generated_plan(solution_type: &str, commands: Vec<ActionSpec>) -> GeneratedPlan {
    GeneratedPlan {
        analysis: "container exceeded its memory limit".into(),
        solution_type: solution_type.into(),
        description: "scale out the affected deployment".into(),
        commands,
        priority: Priority::High,
        estimated_time: "5".into(),
        success_probability: "80".into(),
    }
}

// ---------------------------------------------------------------------------
// Notifier
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct RecordingNotifier {
    events: Mutex<Vec<NotificationEvent>>,
}

impl RecordingNotifier {
    pub fn events(&self) -> Vec<NotificationEvent> {
        self.events.lock().unwrap().clone()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn notify(&self, event: NotificationEvent) {
        self.events.lock().unwrap().push(event);
    }
}
