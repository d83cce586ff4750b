//! Typed runtime configuration.
//!
//! Loaded once at startup from a YAML document. `${VAR}` placeholders are
//! resolved against the process environment first and a `.env` file second,
//! before the document is deserialized into [`AppConfig`].

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use std::time::Duration;

use regex::Regex;
use serde::{Deserialize, Deserializer, Serialize};
use serde_yaml::Value;

use crate::error::AppError;

/// Effective lower bound on the detection interval.
pub const MIN_CHECK_INTERVAL_SECS: u64 = 30;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub elasticsearch: ElasticsearchConfig,
    pub database: DatabaseConfig,
    pub kubernetes: KubernetesConfig,
    pub resolver: ResolverConfig,
    pub monitoring: MonitoringConfig,
    pub log_management: LogManagementConfig,
    pub generator: GeneratorConfig,
    pub slack: SlackConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ElasticsearchConfig {
    pub host: String,
    #[serde(deserialize_with = "lenient")]
    pub port: u16,
    #[serde(deserialize_with = "lenient")]
    pub use_ssl: bool,
    #[serde(deserialize_with = "lenient")]
    pub verify_certs: bool,
    pub ca_certs: Option<PathBuf>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub index_pattern: String,
    /// In-cluster service used once when the primary target is unreachable.
    pub k8s_service_host: Option<String>,
    #[serde(deserialize_with = "lenient_opt")]
    pub k8s_service_port: Option<u16>,
    #[serde(deserialize_with = "lenient")]
    pub request_timeout_secs: u64,
}

impl Default for ElasticsearchConfig {
    fn default() -> Self {
        Self {
            host: "localhost".into(),
            port: 9200,
            use_ssl: false,
            verify_certs: true,
            ca_certs: None,
            username: None,
            password: None,
            index_pattern: "logstash-*".into(),
            k8s_service_host: None,
            k8s_service_port: None,
            request_timeout_secs: 30,
        }
    }
}

impl ElasticsearchConfig {
    pub fn base_url(&self) -> String {
        let scheme = if self.use_ssl { "https" } else { "http" };
        format!("{scheme}://{}:{}", self.host, self.port)
    }

    /// Fallback target, if one is configured.
    pub fn fallback_url(&self) -> Option<String> {
        let host = self.k8s_service_host.as_deref()?;
        let scheme = if self.use_ssl { "https" } else { "http" };
        let port = self.k8s_service_port.unwrap_or(self.port);
        Some(format!("{scheme}://{host}:{port}"))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub path: PathBuf,
    #[serde(deserialize_with = "lenient")]
    pub pool_size: u32,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("data/logheal.db"),
            pool_size: 8,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct KubernetesConfig {
    pub api_server: String,
    pub token: Option<String>,
    pub token_path: PathBuf,
    pub namespace: String,
    #[serde(deserialize_with = "lenient")]
    pub verify_certs: bool,
    pub ca_certs: Option<PathBuf>,
    #[serde(deserialize_with = "lenient")]
    pub request_timeout_secs: u64,
}

impl Default for KubernetesConfig {
    fn default() -> Self {
        Self {
            api_server: "https://kubernetes.default.svc".into(),
            token: None,
            token_path: PathBuf::from("/var/run/secrets/kubernetes.io/serviceaccount/token"),
            namespace: "default".into(),
            verify_certs: true,
            ca_certs: None,
            request_timeout_secs: 15,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ResolverConfig {
    #[serde(deserialize_with = "lenient")]
    pub safe_mode: bool,
    #[serde(deserialize_with = "lenient")]
    pub max_retries: u32,
    #[serde(deserialize_with = "lenient")]
    pub command_timeout_secs: u64,
    #[serde(deserialize_with = "lenient")]
    pub action_delay_secs: u64,
    #[serde(deserialize_with = "lenient")]
    pub plan_failure_delay_secs: u64,
    /// Plans are reused only when their success rate is strictly above this.
    #[serde(deserialize_with = "lenient")]
    pub reuse_threshold: f64,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            safe_mode: true,
            max_retries: 3,
            command_timeout_secs: 300,
            action_delay_secs: 2,
            plan_failure_delay_secs: 5,
            reuse_threshold: 50.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitoringConfig {
    #[serde(deserialize_with = "lenient")]
    pub check_interval_secs: u64,
    #[serde(deserialize_with = "lenient")]
    pub error_threshold: usize,
    #[serde(deserialize_with = "lenient")]
    pub stats_interval_secs: u64,
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            check_interval_secs: 60,
            error_threshold: 1,
            stats_interval_secs: 300,
        }
    }
}

impl MonitoringConfig {
    pub fn check_interval(&self) -> Duration {
        Duration::from_secs(self.check_interval_secs.max(MIN_CHECK_INTERVAL_SECS))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogManagementConfig {
    #[serde(deserialize_with = "lenient")]
    pub retention_days: u32,
    #[serde(deserialize_with = "lenient")]
    pub cleanup_interval_hours: u64,
    #[serde(deserialize_with = "lenient")]
    pub max_search_hours: u64,
    pub elasticsearch_cleanup: IndexCleanupConfig,
    pub database_cleanup: DatabaseCleanupConfig,
    pub resource_check: ResourceCheckConfig,
}

impl Default for LogManagementConfig {
    fn default() -> Self {
        Self {
            retention_days: 7,
            cleanup_interval_hours: 24,
            max_search_hours: 24,
            elasticsearch_cleanup: IndexCleanupConfig::default(),
            database_cleanup: DatabaseCleanupConfig::default(),
            resource_check: ResourceCheckConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IndexCleanupConfig {
    #[serde(deserialize_with = "lenient")]
    pub enabled: bool,
    pub index_prefix: String,
}

impl Default for IndexCleanupConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            index_prefix: "logstash".into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseCleanupConfig {
    #[serde(deserialize_with = "lenient")]
    pub enabled: bool,
    /// Overrides `retention_days` for error events only.
    #[serde(deserialize_with = "lenient_opt")]
    pub error_events_retention_days: Option<u32>,
}

impl Default for DatabaseCleanupConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            error_events_retention_days: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceCheckConfig {
    #[serde(deserialize_with = "lenient")]
    pub enabled: bool,
    #[serde(deserialize_with = "lenient")]
    pub warn_percent: f64,
}

impl Default for ResourceCheckConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            warn_percent: 85.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneratorConfig {
    pub api_key: Option<String>,
    pub base_url: String,
    pub model: String,
    #[serde(deserialize_with = "lenient")]
    pub temperature: f32,
    #[serde(deserialize_with = "lenient")]
    pub max_tokens: u32,
    #[serde(deserialize_with = "lenient")]
    pub request_timeout_secs: u64,
}

impl Default for GeneratorConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            base_url: "https://api.perplexity.ai".into(),
            model: "sonar".into(),
            temperature: 0.1,
            max_tokens: 2000,
            request_timeout_secs: 60,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SlackConfig {
    #[serde(deserialize_with = "lenient")]
    pub enabled: bool,
    pub webhook_url: Option<String>,
    pub channel: Option<String>,
    pub username: String,
    #[serde(deserialize_with = "lenient")]
    pub request_timeout_secs: u64,
}

impl Default for SlackConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            webhook_url: None,
            channel: None,
            username: "logheal".into(),
            request_timeout_secs: 10,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Enables the daily rolling file layer when set.
    pub directory: Option<PathBuf>,
}

// ---------------------------------------------------------------------------
// Loading
// ---------------------------------------------------------------------------

impl AppConfig {
    /// Load `path`, resolving placeholders from the process environment and
    /// then from `env_path` (if it exists). The `.env` file never overrides a
    /// variable that is already set.
    pub fn load(path: &Path, env_path: Option<&Path>) -> Result<Self, AppError> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| AppError::Config(format!("cannot read {}: {e}", path.display())))?;
        let dotenv = match env_path {
            Some(p) if p.exists() => read_env_file(p)?,
            _ => HashMap::new(),
        };
        let config = Self::from_yaml_str(&raw, |name| {
            std::env::var(name)
                .ok()
                .or_else(|| dotenv.get(name).cloned())
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Parse a YAML document, substituting `${VAR}` through `lookup`.
    pub fn from_yaml_str<F>(raw: &str, lookup: F) -> Result<Self, AppError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut doc: Value = serde_yaml::from_str(raw)?;
        if doc.is_null() {
            doc = Value::Mapping(Default::default());
        }
        substitute_placeholders(&mut doc, &lookup);
        Ok(serde_yaml::from_value(doc)?)
    }

    pub fn validate(&self) -> Result<(), AppError> {
        if self.monitoring.error_threshold == 0 {
            return Err(AppError::Config("monitoring.error_threshold must be at least 1".into()));
        }
        if self.monitoring.check_interval_secs == 0 {
            return Err(AppError::Config("monitoring.check_interval_secs must be positive".into()));
        }
        if self.log_management.cleanup_interval_hours == 0 {
            return Err(AppError::Config(
                "log_management.cleanup_interval_hours must be positive".into(),
            ));
        }
        if !(0.0..=100.0).contains(&self.resolver.reuse_threshold) {
            return Err(AppError::Config("resolver.reuse_threshold must be within 0..=100".into()));
        }
        if self.elasticsearch.host.trim().is_empty() {
            return Err(AppError::Config("elasticsearch.host cannot be empty".into()));
        }
        check_url("elasticsearch", &self.elasticsearch.base_url())?;
        check_url("kubernetes.api_server", &self.kubernetes.api_server)?;
        check_url("generator.base_url", &self.generator.base_url)?;
        Ok(())
    }
}

/// Placeholders that did not resolve are tolerated here; they surface later as
/// connection errors with the literal value in the message.
fn check_url(field: &str, raw: &str) -> Result<(), AppError> {
    if raw.contains("${") {
        return Ok(());
    }
    url::Url::parse(raw)
        .map(|_| ())
        .map_err(|e| AppError::Config(format!("{field} is not a valid URL ({raw}): {e}")))
}

fn read_env_file(path: &Path) -> Result<HashMap<String, String>, AppError> {
    let iter = dotenvy::from_path_iter(path)
        .map_err(|e| AppError::Config(format!("cannot read {}: {e}", path.display())))?;
    let mut vars = HashMap::new();
    for item in iter {
        let (key, value) =
            item.map_err(|e| AppError::Config(format!("invalid entry in {}: {e}", path.display())))?;
        vars.insert(key, value);
    }
    Ok(vars)
}

#[allow(clippy::expect_used)]
static PLACEHOLDER_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\$\{([^}]+)\}").expect("valid regex"));

/// Replace placeholders in every string scalar of `value`. Substituted values
/// stay strings; numeric and boolean fields parse them through [`lenient`].
fn substitute_placeholders<F>(value: &mut Value, lookup: &F)
where
    F: Fn(&str) -> Option<String>,
{
    match value {
        Value::String(s) => {
            if PLACEHOLDER_RE.is_match(s) {
                *s = resolve_scalar(s, lookup);
            }
        }
        Value::Mapping(map) => {
            for (_, v) in map.iter_mut() {
                substitute_placeholders(v, lookup);
            }
        }
        Value::Sequence(items) => {
            for v in items.iter_mut() {
                substitute_placeholders(v, lookup);
            }
        }
        _ => {}
    }
}

fn resolve_scalar<F>(s: &str, lookup: &F) -> String
where
    F: Fn(&str) -> Option<String>,
{
    PLACEHOLDER_RE
        .replace_all(s, |caps: &regex::Captures| {
            let name = &caps[1];
            match lookup(name).filter(|v| !v.is_empty()) {
                Some(v) => v,
                None => {
                    tracing::warn!(variable = name, "Environment variable not set");
                    caps[0].to_string()
                }
            }
        })
        .into_owned()
}

#[derive(Deserialize)]
#[serde(untagged)]
enum NativeOrText<T> {
    Native(T),
    Text(String),
}

/// Accept either a native YAML scalar or its text form, so `port: ${ES_PORT}`
/// still deserializes into a number after substitution.
fn lenient<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de> + std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match NativeOrText::<T>::deserialize(deserializer)? {
        NativeOrText::Native(v) => Ok(v),
        NativeOrText::Text(s) => s
            .trim()
            .parse()
            .map_err(|e| serde::de::Error::custom(format!("cannot parse {s:?}: {e}"))),
    }
}

fn lenient_opt<'de, D, T>(deserializer: D) -> Result<Option<T>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de> + std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match Option::<NativeOrText<T>>::deserialize(deserializer)? {
        None => Ok(None),
        Some(NativeOrText::Native(v)) => Ok(Some(v)),
        Some(NativeOrText::Text(s)) if s.trim().is_empty() => Ok(None),
        Some(NativeOrText::Text(s)) => s
            .trim()
            .parse()
            .map(Some)
            .map_err(|e| serde::de::Error::custom(format!("cannot parse {s:?}: {e}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn vars(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn test_defaults_from_empty_document() {
        let cfg = AppConfig::from_yaml_str("", vars(&[])).unwrap();
        assert_eq!(cfg.elasticsearch.port, 9200);
        assert!(cfg.resolver.safe_mode);
        assert_eq!(cfg.resolver.reuse_threshold, 50.0);
        assert_eq!(cfg.monitoring.error_threshold, 1);
        assert_eq!(cfg.log_management.retention_days, 7);
        assert_eq!(cfg.log_management.cleanup_interval_hours, 24);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_placeholder_substitution() {
        let yaml = r#"
elasticsearch:
  host: es.internal
  port: ${ES_PORT}
  use_ssl: ${ES_SSL}
  password: "${ES_PASSWORD}"
slack:
  webhook_url: https://hooks.example.com/${SLACK_PATH}
"#;
        let cfg = AppConfig::from_yaml_str(
            yaml,
            vars(&[("ES_PORT", "9243"), ("ES_SSL", "true"), ("ES_PASSWORD", "s3cret"), ("SLACK_PATH", "T0/B0")]),
        )
        .unwrap();
        assert_eq!(cfg.elasticsearch.port, 9243);
        assert!(cfg.elasticsearch.use_ssl);
        assert_eq!(cfg.elasticsearch.password.as_deref(), Some("s3cret"));
        assert_eq!(cfg.slack.webhook_url.as_deref(), Some("https://hooks.example.com/T0/B0"));
        assert_eq!(cfg.elasticsearch.base_url(), "https://es.internal:9243");
    }

    #[test]
    fn test_unresolved_placeholder_is_kept() {
        let yaml = "generator:\n  api_key: ${MISSING_KEY}\n";
        let cfg = AppConfig::from_yaml_str(yaml, vars(&[])).unwrap();
        assert_eq!(cfg.generator.api_key.as_deref(), Some("${MISSING_KEY}"));
    }

    #[test]
    fn test_validate_rejects_zero_threshold() {
        let yaml = "monitoring:\n  error_threshold: 0\n";
        let cfg = AppConfig::from_yaml_str(yaml, vars(&[])).unwrap();
        assert!(matches!(cfg.validate(), Err(AppError::Config(_))));
    }

    #[test]
    fn test_check_interval_floor() {
        let mut m = MonitoringConfig::default();
        m.check_interval_secs = 5;
        assert_eq!(m.check_interval(), Duration::from_secs(MIN_CHECK_INTERVAL_SECS));
        m.check_interval_secs = 120;
        assert_eq!(m.check_interval(), Duration::from_secs(120));
    }

    #[test]
    fn test_fallback_url() {
        let mut es = ElasticsearchConfig::default();
        assert!(es.fallback_url().is_none());
        es.k8s_service_host = Some("elasticsearch.elk-stack.svc".into());
        es.use_ssl = true;
        assert_eq!(
            es.fallback_url().as_deref(),
            Some("https://elasticsearch.elk-stack.svc:9200")
        );
    }

    #[test]
    fn test_numeric_secret_stays_a_string() {
        let yaml = "elasticsearch:\n  password: \"${ES_PASSWORD}\"\n  username: ${ES_USER}\n";
        let cfg = AppConfig::from_yaml_str(yaml, vars(&[("ES_PASSWORD", "123456"), ("ES_USER", "1000")])).unwrap();
        assert_eq!(cfg.elasticsearch.password.as_deref(), Some("123456"));
        assert_eq!(cfg.elasticsearch.username.as_deref(), Some("1000"));
    }

    #[test]
    fn test_placeholder_in_numeric_field_must_parse() {
        let yaml = "elasticsearch:\n  port: ${ES_PORT}\n  k8s_service_port: ${ES_SVC_PORT}\n";
        let cfg = AppConfig::from_yaml_str(yaml, vars(&[("ES_PORT", "9243"), ("ES_SVC_PORT", "9200")])).unwrap();
        assert_eq!(cfg.elasticsearch.port, 9243);
        assert_eq!(cfg.elasticsearch.k8s_service_port, Some(9200));

        let err = AppConfig::from_yaml_str(yaml, vars(&[("ES_PORT", "not-a-port")])).unwrap_err();
        assert!(matches!(err, AppError::Yaml(_)));
    }

    #[test]
    fn test_load_process_env_wins_over_env_file() {
        let dir = tempfile::tempdir().unwrap();
        let cfg_path = dir.path().join("config.yaml");
        let env_path = dir.path().join(".env");
        std::fs::write(
            &cfg_path,
            "kubernetes:\n  namespace: ${LOGHEAL_TEST_NS}\nelasticsearch:\n  index_pattern: ${LOGHEAL_TEST_INDEX}\n",
        )
        .unwrap();
        let mut f = std::fs::File::create(&env_path).unwrap();
        writeln!(f, "LOGHEAL_TEST_NS=from-file").unwrap();
        writeln!(f, "LOGHEAL_TEST_INDEX=filebeat-*").unwrap();
        std::env::set_var("LOGHEAL_TEST_NS", "from-env");

        let cfg = AppConfig::load(&cfg_path, Some(&env_path)).unwrap();
        assert_eq!(cfg.kubernetes.namespace, "from-env");
        assert_eq!(cfg.elasticsearch.index_pattern, "filebeat-*");
    }
}
