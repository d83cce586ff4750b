use std::sync::Arc;

use crate::clients::elastic::LogStore;
use crate::clients::kube::ControlPlane;
use crate::db::models::RemediationPlan;
use crate::db::repos::component_status as status_repo;
use crate::db::DbPool;

/// Plan categories whose effect shows up in workload state.
pub const WORKLOAD_CATEGORIES: &[&str] = &["kubernetes", "restart", "scaling"];
/// Plan categories that touch the log store as a network-facing dependency.
pub const NETWORK_CATEGORIES: &[&str] = &["kubernetes", "network"];

pub const KUBERNETES_COMPONENT: &str = "kubernetes";

/// Post-execution health check.
pub struct Verifier {
    pool: DbPool,
    control_plane: Arc<dyn ControlPlane>,
    /// Log-store client used only for reachability probes.
    probe: Option<Arc<dyn LogStore>>,
    namespace: String,
}

impl Verifier {
    pub fn new(
        pool: DbPool,
        control_plane: Arc<dyn ControlPlane>,
        probe: Option<Arc<dyn LogStore>>,
        namespace: impl Into<String>,
    ) -> Self {
        Self {
            pool,
            control_plane,
            probe,
            namespace: namespace.into(),
        }
    }

    /// `true` when the target looks recovered. Categories with no live check
    /// pass trivially.
    pub async fn verify(&self, plan: &RemediationPlan) -> bool {
        let category = plan.category.as_str();

        if WORKLOAD_CATEGORIES.contains(&category) && !self.check_workloads().await {
            return false;
        }

        if NETWORK_CATEGORIES.contains(&category) && !self.probe_log_store().await {
            return false;
        }

        true
    }

    async fn check_workloads(&self) -> bool {
        let pods = match self.control_plane.list_pods(&self.namespace).await {
            Ok(p) => p,
            Err(e) => {
                tracing::error!(namespace = %self.namespace, "Workload check failed: {}", e);
                self.record_status("error", 1);
                return false;
            }
        };

        let unhealthy: Vec<&str> = pods
            .iter()
            .filter(|p| !p.is_healthy())
            .map(|p| p.name.as_str())
            .collect();

        if unhealthy.is_empty() {
            tracing::info!(namespace = %self.namespace, pods = pods.len(), "All workloads healthy");
            self.record_status("healthy", 0);
            true
        } else {
            tracing::warn!(namespace = %self.namespace, ?unhealthy, "Unhealthy workloads after remediation");
            self.record_status("degraded", unhealthy.len() as i64);
            false
        }
    }

    async fn probe_log_store(&self) -> bool {
        let Some(store) = &self.probe else {
            return true;
        };
        match store.ping().await {
            Ok(true) => true,
            Ok(false) => {
                tracing::warn!("Log store probe returned an error status");
                false
            }
            Err(e) => {
                tracing::warn!("Log store probe failed: {}", e);
                false
            }
        }
    }

    fn record_status(&self, status: &str, error_count: i64) {
        if let Err(e) = status_repo::upsert(&self.pool, KUBERNETES_COMPONENT, status, error_count) {
            tracing::warn!("Failed to record {} status: {}", KUBERNETES_COMPONENT, e);
        }
    }
}
