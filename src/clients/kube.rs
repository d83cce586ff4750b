use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Method, StatusCode};
use serde_json::{json, Value};

use super::{http_client, http_err};
use crate::config::KubernetesConfig;
use crate::error::AppError;

const SERVICE_ACCOUNT_CA: &str = "/var/run/secrets/kubernetes.io/serviceaccount/ca.crt";
const RESTARTED_AT_ANNOTATION: &str = "kubectl.kubernetes.io/restartedAt";

/// Name and lifecycle phase of one workload unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PodStatus {
    pub name: String,
    pub phase: String,
}

impl PodStatus {
    pub fn is_healthy(&self) -> bool {
        matches!(self.phase.as_str(), "Running" | "Succeeded")
    }
}

/// Operations the executor and verifier need from the cluster control plane.
#[async_trait]
pub trait ControlPlane: Send + Sync {
    /// Cheap reachability check.
    async fn probe(&self) -> Result<(), AppError>;

    async fn namespace_exists(&self, namespace: &str) -> Result<bool, AppError>;

    /// Trigger a rolling restart by stamping the pod template.
    async fn restart_deployment(&self, namespace: &str, name: &str) -> Result<String, AppError>;

    async fn scale_deployment(
        &self,
        namespace: &str,
        name: &str,
        replicas: i32,
    ) -> Result<String, AppError>;

    async fn list_pods(&self, namespace: &str) -> Result<Vec<PodStatus>, AppError>;
}

fn kube_err(e: reqwest::Error) -> AppError {
    http_err("kubernetes", e)
}

/// Kubernetes API server client using a bearer token.
pub struct KubeClient {
    http: reqwest::Client,
    api_server: String,
    token: Option<String>,
}

impl KubeClient {
    pub fn new(config: &KubernetesConfig) -> Result<Self, AppError> {
        let ca = config.ca_certs.clone().or_else(|| {
            let default = PathBuf::from(SERVICE_ACCOUNT_CA);
            default.exists().then_some(default)
        });
        let http = http_client(
            Duration::from_secs(config.request_timeout_secs),
            config.verify_certs,
            ca.as_deref(),
        )?;

        let token = match &config.token {
            Some(t) if !t.trim().is_empty() => Some(t.trim().to_string()),
            _ => read_token(&config.token_path),
        };
        if token.is_none() {
            tracing::warn!("No Kubernetes token configured; requests are sent unauthenticated");
        }

        Ok(Self {
            http,
            api_server: config.api_server.trim_end_matches('/').to_string(),
            token,
        })
    }

    fn request(&self, method: Method, path: &str) -> reqwest::RequestBuilder {
        let req = self.http.request(method, format!("{}{}", self.api_server, path));
        match &self.token {
            Some(token) => req.bearer_auth(token),
            None => req,
        }
    }

    async fn patch(&self, path: &str, content_type: &str, body: &Value) -> Result<Value, AppError> {
        let resp = self
            .request(Method::PATCH, path)
            .header(reqwest::header::CONTENT_TYPE, content_type)
            .body(body.to_string())
            .send()
            .await
            .map_err(kube_err)?;
        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(AppError::Execution(format!(
                "kubernetes: PATCH {path} returned {status}: {}",
                truncate(&text, 300)
            )));
        }
        resp.json().await.map_err(kube_err)
    }
}

fn read_token(path: &Path) -> Option<String> {
    std::fs::read_to_string(path)
        .ok()
        .map(|t| t.trim().to_string())
        .filter(|t| !t.is_empty())
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

#[async_trait]
impl ControlPlane for KubeClient {
    async fn probe(&self) -> Result<(), AppError> {
        self.request(Method::GET, "/api/v1/namespaces?limit=1")
            .send()
            .await
            .map_err(kube_err)?
            .error_for_status()
            .map_err(|e| AppError::Connectivity(format!("kubernetes: {e}")))?;
        Ok(())
    }

    async fn namespace_exists(&self, namespace: &str) -> Result<bool, AppError> {
        let resp = self
            .request(Method::GET, &format!("/api/v1/namespaces/{namespace}"))
            .send()
            .await
            .map_err(kube_err)?;
        match resp.status() {
            s if s.is_success() => Ok(true),
            StatusCode::NOT_FOUND => Ok(false),
            other => Err(AppError::Connectivity(format!(
                "kubernetes: namespace lookup returned {other}"
            ))),
        }
    }

    async fn restart_deployment(&self, namespace: &str, name: &str) -> Result<String, AppError> {
        let now = chrono::Utc::now().to_rfc3339();
        let body = json!({
            "spec": { "template": { "metadata": { "annotations": { RESTARTED_AT_ANNOTATION: now } } } }
        });
        self.patch(
            &format!("/apis/apps/v1/namespaces/{namespace}/deployments/{name}"),
            "application/strategic-merge-patch+json",
            &body,
        )
        .await?;
        Ok(format!("deployment.apps/{name} restarted"))
    }

    async fn scale_deployment(
        &self,
        namespace: &str,
        name: &str,
        replicas: i32,
    ) -> Result<String, AppError> {
        let body = json!({ "spec": { "replicas": replicas } });
        self.patch(
            &format!("/apis/apps/v1/namespaces/{namespace}/deployments/{name}/scale"),
            "application/merge-patch+json",
            &body,
        )
        .await?;
        Ok(format!("deployment.apps/{name} scaled to {replicas}"))
    }

    async fn list_pods(&self, namespace: &str) -> Result<Vec<PodStatus>, AppError> {
        let body: Value = self
            .request(Method::GET, &format!("/api/v1/namespaces/{namespace}/pods"))
            .send()
            .await
            .map_err(kube_err)?
            .error_for_status()
            .map_err(kube_err)?
            .json()
            .await
            .map_err(kube_err)?;

        Ok(parse_pod_list(&body))
    }
}

fn parse_pod_list(body: &Value) -> Vec<PodStatus> {
    body.get("items")
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .map(|item| PodStatus {
                    name: item
                        .pointer("/metadata/name")
                        .and_then(Value::as_str)
                        .unwrap_or("unknown")
                        .to_string(),
                    phase: item
                        .pointer("/status/phase")
                        .and_then(Value::as_str)
                        .unwrap_or("Unknown")
                        .to_string(),
                })
                .collect()
        })
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_pod_list() {
        let body = json!({
            "items": [
                { "metadata": { "name": "api-1" }, "status": { "phase": "Running" } },
                { "metadata": { "name": "job-1" }, "status": { "phase": "Succeeded" } },
                { "metadata": { "name": "api-2" }, "status": { "phase": "Pending" } },
                { "metadata": { "name": "api-3" } }
            ]
        });
        let pods = parse_pod_list(&body);
        assert_eq!(pods.len(), 4);
        assert!(pods[0].is_healthy());
        assert!(pods[1].is_healthy());
        assert!(!pods[2].is_healthy());
        assert_eq!(pods[3].phase, "Unknown");
        assert!(parse_pod_list(&json!({})).is_empty());
    }

    #[test]
    fn test_truncate_on_char_boundary() {
        assert_eq!(truncate("héllo", 2), "hé");
        assert_eq!(truncate("ok", 10), "ok");
    }
}
