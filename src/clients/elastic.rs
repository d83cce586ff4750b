use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Method, StatusCode};
use serde_json::Value;

use super::{http_client, http_err};
use crate::config::ElasticsearchConfig;
use crate::error::AppError;

/// Operations the pipeline needs from the log store.
#[async_trait]
pub trait LogStore: Send + Sync {
    /// Run a search and return the raw `hits.hits` entries.
    async fn search(&self, index: &str, query: &Value) -> Result<Vec<Value>, AppError>;

    async fn ping(&self) -> Result<bool, AppError>;

    async fn index_exists(&self, index: &str) -> Result<bool, AppError>;

    async fn delete_index(&self, index: &str) -> Result<(), AppError>;

    /// Delete every index matching a wildcard pattern. A missing match is not an error.
    async fn delete_indices_matching(&self, pattern: &str) -> Result<(), AppError>;
}

fn es_err(e: reqwest::Error) -> AppError {
    http_err("elasticsearch", e)
}

/// Elasticsearch REST client.
#[derive(Clone)]
pub struct ElasticClient {
    http: reqwest::Client,
    base_url: String,
    verifies_certs: bool,
    username: Option<String>,
    password: Option<String>,
}

impl ElasticClient {
    /// Client for `base_url`. `relax_tls` disables certificate verification
    /// regardless of configuration.
    pub fn new(
        config: &ElasticsearchConfig,
        base_url: String,
        relax_tls: bool,
    ) -> Result<Self, AppError> {
        let verify = config.verify_certs && !relax_tls;
        let http = http_client(
            Duration::from_secs(config.request_timeout_secs),
            verify,
            config.ca_certs.as_deref().filter(|_| verify),
        )?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            verifies_certs: verify,
            username: config.username.clone(),
            password: config.password.clone(),
        })
    }

    /// Connect to the configured target, falling back once to the in-cluster
    /// service address when the primary target does not answer.
    pub async fn connect(config: &ElasticsearchConfig) -> Result<Self, AppError> {
        let primary = Self::new(config, config.base_url(), false)?;
        match primary.ping().await {
            Ok(true) => {
                tracing::info!(url = %primary.base_url, "Connected to log store");
                return Ok(primary);
            }
            Ok(false) => tracing::warn!(url = %primary.base_url, "Log store ping returned an error status"),
            Err(e) => tracing::warn!(url = %primary.base_url, "Log store unreachable: {}", e),
        }

        let Some(fallback_url) = config.fallback_url() else {
            return Err(AppError::Connectivity(format!(
                "log store unreachable at {}",
                primary.base_url
            )));
        };

        tracing::info!(url = %fallback_url, "Trying in-cluster log store address");
        let fallback = Self::new(config, fallback_url, true)?;
        match fallback.ping().await {
            Ok(true) => {
                tracing::info!(url = %fallback.base_url, "Connected to log store via fallback");
                Ok(fallback)
            }
            Ok(false) => Err(AppError::Connectivity(format!(
                "log store fallback {} returned an error status",
                fallback.base_url
            ))),
            Err(e) => Err(e),
        }
    }

    /// Fresh client for the target this one settled on, with the same TLS
    /// verification.
    pub fn sibling(&self, config: &ElasticsearchConfig) -> Result<Self, AppError> {
        Self::new(config, self.base_url.clone(), !self.verifies_certs)
    }

    /// Client for post-remediation reachability probes. Plain-HTTP targets
    /// are not probed.
    pub fn reachability_client(&self, config: &ElasticsearchConfig) -> Result<Option<Self>, AppError> {
        if !config.use_ssl {
            return Ok(None);
        }
        self.sibling(config).map(Some)
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn request(&self, method: Method, path: &str) -> reqwest::RequestBuilder {
        let req = self.http.request(method, format!("{}/{}", self.base_url, path.trim_start_matches('/')));
        match &self.username {
            Some(user) => req.basic_auth(user, self.password.as_deref()),
            None => req,
        }
    }
}

#[async_trait]
impl LogStore for ElasticClient {
    async fn search(&self, index: &str, query: &Value) -> Result<Vec<Value>, AppError> {
        let body: Value = self
            .request(Method::POST, &format!("{index}/_search"))
            .json(query)
            .send()
            .await
            .map_err(es_err)?
            .error_for_status()
            .map_err(es_err)?
            .json()
            .await
            .map_err(es_err)?;

        Ok(body
            .pointer("/hits/hits")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default())
    }

    async fn ping(&self) -> Result<bool, AppError> {
        let resp = self.request(Method::GET, "").send().await.map_err(es_err)?;
        Ok(resp.status().is_success())
    }

    async fn index_exists(&self, index: &str) -> Result<bool, AppError> {
        let resp = self.request(Method::HEAD, index).send().await.map_err(es_err)?;
        match resp.status() {
            s if s.is_success() => Ok(true),
            StatusCode::NOT_FOUND => Ok(false),
            other => Err(AppError::Execution(format!(
                "elasticsearch: HEAD {index} returned {other}"
            ))),
        }
    }

    async fn delete_index(&self, index: &str) -> Result<(), AppError> {
        self.request(Method::DELETE, index)
            .send()
            .await
            .map_err(es_err)?
            .error_for_status()
            .map_err(es_err)?;
        Ok(())
    }

    async fn delete_indices_matching(&self, pattern: &str) -> Result<(), AppError> {
        let resp = self
            .request(Method::DELETE, pattern)
            .query(&[("ignore_unavailable", "true"), ("allow_no_indices", "true")])
            .send()
            .await
            .map_err(es_err)?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Ok(());
        }
        resp.error_for_status().map_err(es_err)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn es_config(use_ssl: bool, verify_certs: bool) -> ElasticsearchConfig {
        ElasticsearchConfig {
            host: "es.example.internal".into(),
            port: 9200,
            use_ssl,
            verify_certs,
            k8s_service_host: Some("elasticsearch.elk-stack.svc.cluster.local".into()),
            ..ElasticsearchConfig::default()
        }
    }

    #[test]
    fn test_reachability_client_follows_fallback() {
        let config = es_config(true, true);
        let fallback = config.fallback_url().unwrap();
        let connected = ElasticClient::new(&config, fallback.clone(), true).unwrap();

        let client = connected.reachability_client(&config).unwrap().expect("https target is checked");
        assert_eq!(client.base_url(), fallback);
        assert!(!client.verifies_certs);
    }

    #[test]
    fn test_reachability_client_keeps_certificate_verification() {
        let config = es_config(true, true);
        let connected = ElasticClient::new(&config, config.base_url(), false).unwrap();

        let client = connected.reachability_client(&config).unwrap().unwrap();
        assert_eq!(client.base_url(), "https://es.example.internal:9200");
        assert!(client.verifies_certs);

        let relaxed = es_config(true, false);
        let connected = ElasticClient::new(&relaxed, relaxed.base_url(), false).unwrap();
        assert!(!connected.reachability_client(&relaxed).unwrap().unwrap().verifies_certs);
    }

    #[test]
    fn test_plain_http_target_has_no_reachability_client() {
        let config = es_config(false, true);
        let connected = ElasticClient::new(&config, config.base_url(), false).unwrap();
        assert!(connected.reachability_client(&config).unwrap().is_none());
    }
}
