//! Typed remediation actions and their dispatch.
//!
//! Stored plans carry loosely-typed [`ActionSpec`] records. Before execution
//! each one is lifted into an [`Action`] whose [`ActionKind`] carries only what
//! that kind needs; anything that cannot be lifted becomes
//! [`ActionKind::Unsupported`] and fails on its own without stopping the
//! executor.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};

use serde_yaml::{Mapping, Value as YamlValue};

use crate::clients::kube::ControlPlane;
use crate::db::models::ActionSpec;
use crate::engine::types::ActionResult;
use crate::error::AppError;

/// Captured stdout/stderr is cut at this many bytes.
const MAX_OUTPUT_BYTES: usize = 100 * 1024;

// ============================================================================
// Model
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
pub struct Action {
    pub kind: ActionKind,
    pub command: String,
    pub description: String,
    pub critical: bool,
    pub safe: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ActionKind {
    ControlPlane(ControlPlaneOp),
    Shell,
    Config(ConfigPatch),
    Unsupported { reason: String },
}

impl ActionKind {
    pub fn label(&self) -> &'static str {
        match self {
            ActionKind::ControlPlane(_) => "kubectl",
            ActionKind::Shell => "bash",
            ActionKind::Config(_) => "config",
            ActionKind::Unsupported { .. } => "unsupported",
        }
    }
}

/// The closed control-plane vocabulary. Anything else runs as a shell command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlPlaneOp {
    RolloutRestart {
        deployment: String,
        namespace: Option<String>,
    },
    Scale {
        deployment: String,
        replicas: i32,
        namespace: Option<String>,
    },
    Passthrough,
}

impl Action {
    pub fn from_spec(spec: &ActionSpec) -> Self {
        let kind = match spec.kind.trim().to_ascii_lowercase().as_str() {
            "kubectl" => ActionKind::ControlPlane(ControlPlaneOp::parse(&spec.command)),
            "bash" | "shell" if spec.command.trim().is_empty() => ActionKind::Unsupported {
                reason: "empty shell command".into(),
            },
            "bash" | "shell" => ActionKind::Shell,
            "config" => match ConfigPatch::from_spec(spec) {
                Ok(patch) => ActionKind::Config(patch),
                Err(reason) => ActionKind::Unsupported { reason },
            },
            other => ActionKind::Unsupported {
                reason: format!("unsupported action type: {other}"),
            },
        };
        Self {
            kind,
            command: spec.command.clone(),
            description: spec.description.clone(),
            critical: spec.critical,
            safe: spec.safe,
        }
    }
}

// ============================================================================
// Control-plane command parsing
// ============================================================================

impl ControlPlaneOp {
    /// Recognize `kubectl rollout restart deployment/<name>` and
    /// `kubectl scale deployment <name> --replicas=<n>` (both with optional
    /// `-n`/`--namespace`). Resource may be written `deployment/<name>` or
    /// `deployment <name>`.
    pub fn parse(command: &str) -> Self {
        let mut namespace = None;
        let mut replicas = None;
        let mut positional = Vec::new();

        let mut tokens = command.split_whitespace();
        while let Some(tok) = tokens.next() {
            match tok {
                "-n" | "--namespace" => namespace = tokens.next().map(str::to_string),
                "--replicas" => replicas = tokens.next().and_then(|v| v.parse::<i32>().ok()),
                t if t.starts_with("--namespace=") => {
                    namespace = Some(t["--namespace=".len()..].to_string())
                }
                t if t.starts_with("--replicas=") => {
                    replicas = t["--replicas=".len()..].parse::<i32>().ok()
                }
                t => positional.push(t),
            }
        }

        match positional.as_slice() {
            ["kubectl", "rollout", "restart", rest @ ..] => match deployment_name(rest) {
                Some(deployment) => ControlPlaneOp::RolloutRestart { deployment, namespace },
                None => ControlPlaneOp::Passthrough,
            },
            ["kubectl", "scale", rest @ ..] => match (deployment_name(rest), replicas) {
                (Some(deployment), Some(replicas)) if replicas >= 0 => ControlPlaneOp::Scale {
                    deployment,
                    replicas,
                    namespace,
                },
                _ => ControlPlaneOp::Passthrough,
            },
            _ => ControlPlaneOp::Passthrough,
        }
    }
}

fn deployment_name(rest: &[&str]) -> Option<String> {
    match rest {
        [resource] => resource
            .split_once('/')
            .filter(|(kind, name)| is_deployment(kind) && !name.is_empty())
            .map(|(_, name)| name.to_string()),
        [kind, name] if is_deployment(kind) => Some((*name).to_string()),
        _ => None,
    }
}

fn is_deployment(kind: &str) -> bool {
    matches!(kind, "deployment" | "deployments" | "deploy" | "deployment.apps")
}

// ============================================================================
// Configuration patches
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DocumentFormat {
    Yaml,
    Json,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldSelector {
    Key(String),
    Index(usize),
}

/// Path into a structured document, e.g. `pipeline.workers` or `inputs[0].port`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldPath(pub Vec<FieldSelector>);

impl FieldPath {
    pub fn parse(raw: &str) -> Result<Self, String> {
        let mut selectors = Vec::new();
        for segment in raw.split('.') {
            let (key, mut rest) = match segment.find('[') {
                Some(i) => (&segment[..i], &segment[i..]),
                None => (segment, ""),
            };
            if key.is_empty() && (selectors.is_empty() || rest.is_empty()) {
                return Err(format!("empty segment in field path '{raw}'"));
            }
            if !key.is_empty() {
                selectors.push(FieldSelector::Key(key.to_string()));
            }
            while !rest.is_empty() {
                let close = rest
                    .find(']')
                    .ok_or_else(|| format!("unclosed index in field path '{raw}'"))?;
                let index = rest[1..close]
                    .parse::<usize>()
                    .map_err(|_| format!("invalid index in field path '{raw}'"))?;
                selectors.push(FieldSelector::Index(index));
                rest = &rest[close + 1..];
                if !rest.is_empty() && !rest.starts_with('[') {
                    return Err(format!("unexpected text after index in field path '{raw}'"));
                }
            }
        }
        Ok(FieldPath(selectors))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FieldOverride {
    pub path: FieldPath,
    pub value: YamlValue,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ConfigPatch {
    pub document: PathBuf,
    pub format: DocumentFormat,
    pub overrides: Vec<FieldOverride>,
}

impl ConfigPatch {
    fn from_spec(spec: &ActionSpec) -> Result<Self, String> {
        let document = spec
            .config_path
            .as_deref()
            .filter(|p| !p.trim().is_empty())
            .map(PathBuf::from)
            .ok_or("config action without config_path")?;

        let format = match spec.config_type.as_deref().map(str::to_ascii_lowercase).as_deref() {
            Some("yaml") | Some("yml") => DocumentFormat::Yaml,
            Some("json") => DocumentFormat::Json,
            Some(other) => return Err(format!("unsupported config_type: {other}")),
            None => match document.extension().and_then(|e| e.to_str()) {
                Some("json") => DocumentFormat::Json,
                _ => DocumentFormat::Yaml,
            },
        };

        let changes = spec
            .config_changes
            .as_ref()
            .filter(|c| !c.is_empty())
            .ok_or("config action without config_changes")?;

        let overrides = changes
            .iter()
            .map(|(path, value)| -> Result<FieldOverride, String> {
                Ok(FieldOverride {
                    path: FieldPath::parse(path)?,
                    value: serde_yaml::to_value(value).map_err(|e| e.to_string())?,
                })
            })
            .collect::<Result<Vec<_>, String>>()?;

        Ok(Self { document, format, overrides })
    }

    /// Apply every override and rewrite the document in place.
    pub async fn apply(&self) -> Result<String, AppError> {
        let raw = tokio::fs::read_to_string(&self.document).await?;
        let mut doc: YamlValue = match self.format {
            DocumentFormat::Yaml => serde_yaml::from_str(&raw)?,
            DocumentFormat::Json => serde_json::from_str(&raw)?,
        };
        if doc.is_null() {
            doc = YamlValue::Mapping(Mapping::new());
        }

        for o in &self.overrides {
            set_path(&mut doc, &o.path.0, o.value.clone())?;
        }

        let rendered = match self.format {
            DocumentFormat::Yaml => serde_yaml::to_string(&doc)?,
            DocumentFormat::Json => serde_json::to_string_pretty(&doc)?,
        };
        write_atomic(&self.document, rendered.as_bytes()).await?;

        Ok(format!(
            "updated {} field(s) in {}",
            self.overrides.len(),
            self.document.display()
        ))
    }
}

fn set_path(node: &mut YamlValue, path: &[FieldSelector], value: YamlValue) -> Result<(), AppError> {
    let Some((head, tail)) = path.split_first() else {
        *node = value;
        return Ok(());
    };

    match head {
        FieldSelector::Key(key) => {
            if node.is_null() {
                *node = YamlValue::Mapping(Mapping::new());
            }
            let map = node.as_mapping_mut().ok_or_else(|| {
                AppError::Execution(format!("cannot set key '{key}' on a non-mapping value"))
            })?;
            let child = map
                .entry(YamlValue::String(key.clone()))
                .or_insert(YamlValue::Null);
            set_path(child, tail, value)
        }
        FieldSelector::Index(i) => {
            let seq = node.as_sequence_mut().ok_or_else(|| {
                AppError::Execution(format!("cannot index [{i}] into a non-sequence value"))
            })?;
            let len = seq.len();
            let child = seq.get_mut(*i).ok_or_else(|| {
                AppError::Execution(format!("index [{i}] out of range (length {len})"))
            })?;
            set_path(child, tail, value)
        }
    }
}

async fn write_atomic(path: &Path, contents: &[u8]) -> Result<(), AppError> {
    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| AppError::Validation(format!("invalid document path: {}", path.display())))?;
    let tmp = path.with_file_name(format!(".{file_name}.logheal.tmp"));
    tokio::fs::write(&tmp, contents).await?;
    if let Err(e) = tokio::fs::rename(&tmp, path).await {
        let _ = tokio::fs::remove_file(&tmp).await;
        return Err(e.into());
    }
    Ok(())
}

// ============================================================================
// Dispatch
// ============================================================================

pub struct ActionContext<'a> {
    pub control_plane: &'a dyn ControlPlane,
    pub namespace: &'a str,
    pub command_timeout: Duration,
}

/// Run one action.
///
/// Ordinary failures (non-zero exit, rejected patch, unsupported kind) come
/// back as `Ok` with `success = false`. `Err` is reserved for conditions that
/// make the rest of the plan meaningless: the control plane became
/// unreachable, or an internal fault.
pub async fn run(action: &Action, index: usize, ctx: &ActionContext<'_>) -> Result<ActionResult, AppError> {
    let started = Instant::now();
    let outcome = match &action.kind {
        ActionKind::ControlPlane(ControlPlaneOp::RolloutRestart { deployment, namespace }) => {
            let ns = namespace.as_deref().unwrap_or(ctx.namespace);
            ctx.control_plane
                .restart_deployment(ns, deployment)
                .await
                .map(StepOutput::ok)
        }
        ActionKind::ControlPlane(ControlPlaneOp::Scale { deployment, replicas, namespace }) => {
            let ns = namespace.as_deref().unwrap_or(ctx.namespace);
            ctx.control_plane
                .scale_deployment(ns, deployment, *replicas)
                .await
                .map(StepOutput::ok)
        }
        ActionKind::ControlPlane(ControlPlaneOp::Passthrough) | ActionKind::Shell => {
            run_shell(&action.command, ctx.command_timeout).await
        }
        ActionKind::Config(patch) => patch.apply().await.map(StepOutput::ok),
        ActionKind::Unsupported { reason } => Ok(StepOutput::failed(String::new(), reason.clone())),
    };

    let step = match outcome {
        Ok(step) => step,
        Err(e @ (AppError::Connectivity(_) | AppError::Internal(_))) => return Err(e),
        Err(e) => StepOutput::failed(String::new(), e.to_string()),
    };

    Ok(ActionResult {
        index,
        kind: action.kind.label().to_string(),
        command: action.command.clone(),
        description: action.description.clone(),
        critical: action.critical,
        success: step.success,
        output: step.output,
        error: step.error,
        elapsed_ms: started.elapsed().as_millis() as u64,
    })
}

struct StepOutput {
    success: bool,
    output: String,
    error: Option<String>,
}

impl StepOutput {
    fn ok(output: String) -> Self {
        Self { success: true, output, error: None }
    }

    fn failed(output: String, error: String) -> Self {
        Self { success: false, output, error: Some(error) }
    }
}

/// Run `command` through `sh -c`, success = zero exit. The shell runs in its
/// own process group, and the whole group is killed if the timeout elapses.
async fn run_shell(command: &str, timeout: Duration) -> Result<StepOutput, AppError> {
    let mut cmd = tokio::process::Command::new("sh");
    cmd.arg("-c")
        .arg(command)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    #[cfg(unix)]
    cmd.process_group(0);

    let child = match cmd.spawn() {
        Ok(c) => c,
        Err(e) => {
            return Ok(StepOutput::failed(
                String::new(),
                AppError::ProcessSpawn(format!("failed to spawn shell: {e}")).to_string(),
            ))
        }
    };

    let pid = child.id();
    match tokio::time::timeout(timeout, child.wait_with_output()).await {
        Ok(Ok(out)) => {
            let stdout = capped(&out.stdout);
            let stderr = capped(&out.stderr);
            if out.status.success() {
                Ok(StepOutput::ok(stdout))
            } else {
                let code = out
                    .status
                    .code()
                    .map_or_else(|| "signal".to_string(), |c| c.to_string());
                tracing::warn!(exit = %code, command = %command, "Shell action failed");
                let error = if stderr.trim().is_empty() {
                    format!("exit code {code}")
                } else {
                    format!("exit code {code}: {}", stderr.trim())
                };
                Ok(StepOutput::failed(stdout, error))
            }
        }
        Ok(Err(e)) => Ok(StepOutput::failed(String::new(), format!("failed to wait for shell: {e}"))),
        Err(_) => {
            // Backgrounded children would otherwise outlive the shell.
            #[cfg(unix)]
            if let Some(pid) = pid {
                super::port_forward::signal_group(pid, super::port_forward::Signal::Kill);
            }
            #[cfg(not(unix))]
            let _ = pid;
            tracing::warn!(command = %command, "Shell action timed out");
            Ok(StepOutput::failed(
                String::new(),
                format!("command timed out after {}s", timeout.as_secs()),
            ))
        }
    }
}

fn capped(bytes: &[u8]) -> String {
    let slice = &bytes[..bytes.len().min(MAX_OUTPUT_BYTES)];
    String::from_utf8_lossy(slice).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    use crate::engine::testing::FakeControlPlane;

    fn spec(kind: &str, command: &str) -> ActionSpec {
        ActionSpec {
            kind: kind.into(),
            command: command.into(),
            description: "step".into(),
            safe: true,
            critical: true,
            config_type: None,
            config_path: None,
            config_changes: None,
        }
    }

    fn ctx(cp: &FakeControlPlane) -> ActionContext<'_> {
        ActionContext {
            control_plane: cp,
            namespace: "elk-stack",
            command_timeout: Duration::from_secs(5),
        }
    }

    // --- parsing ---

    #[test]
    fn test_parse_rollout_restart() {
        assert_eq!(
            ControlPlaneOp::parse("kubectl rollout restart deployment/logstash -n elk"),
            ControlPlaneOp::RolloutRestart {
                deployment: "logstash".into(),
                namespace: Some("elk".into()),
            }
        );
        assert_eq!(
            ControlPlaneOp::parse("kubectl rollout restart deployment kibana"),
            ControlPlaneOp::RolloutRestart { deployment: "kibana".into(), namespace: None }
        );
    }

    #[test]
    fn test_parse_scale_variants() {
        let expected = ControlPlaneOp::Scale {
            deployment: "api".into(),
            replicas: 3,
            namespace: Some("prod".into()),
        };
        assert_eq!(
            ControlPlaneOp::parse("kubectl scale deployment api --replicas=3 --namespace=prod"),
            expected
        );
        assert_eq!(
            ControlPlaneOp::parse("kubectl -n prod scale deploy/api --replicas 3"),
            expected
        );
    }

    #[test]
    fn test_parse_other_verbs_pass_through() {
        assert_eq!(ControlPlaneOp::parse("kubectl get pods -n elk"), ControlPlaneOp::Passthrough);
        assert_eq!(
            ControlPlaneOp::parse("kubectl rollout restart statefulset/es"),
            ControlPlaneOp::Passthrough
        );
        assert_eq!(
            ControlPlaneOp::parse("kubectl scale deployment api --replicas=many"),
            ControlPlaneOp::Passthrough
        );
    }

    #[test]
    fn test_unknown_kind_is_unsupported() {
        let action = Action::from_spec(&spec("powershell", "Get-Process"));
        assert!(matches!(action.kind, ActionKind::Unsupported { .. }));
    }

    #[test]
    fn test_field_path_parse() {
        assert_eq!(
            FieldPath::parse("inputs[0].port").unwrap(),
            FieldPath(vec![
                FieldSelector::Key("inputs".into()),
                FieldSelector::Index(0),
                FieldSelector::Key("port".into()),
            ])
        );
        assert!(FieldPath::parse("a..b").is_err());
        assert!(FieldPath::parse("a[x]").is_err());
        assert!(FieldPath::parse("a[0").is_err());
    }

    #[test]
    fn test_config_without_path_is_unsupported() {
        let mut s = spec("config", "");
        s.config_changes = Some(BTreeMap::from([("a".to_string(), serde_json::json!(1))]));
        let action = Action::from_spec(&s);
        match action.kind {
            ActionKind::Unsupported { reason } => assert!(reason.contains("config_path")),
            other => panic!("unexpected kind: {other:?}"),
        }
    }

    // --- dispatch ---

    #[tokio::test]
    async fn test_restart_uses_default_namespace() {
        let cp = FakeControlPlane::healthy();
        let action = Action::from_spec(&spec("kubectl", "kubectl rollout restart deployment/logstash"));
        let result = run(&action, 0, &ctx(&cp)).await.unwrap();
        assert!(result.success);
        assert_eq!(cp.calls(), vec!["restart elk-stack/logstash".to_string()]);
    }

    #[tokio::test]
    async fn test_control_plane_connectivity_error_propagates() {
        let cp = FakeControlPlane::unreachable();
        let action = Action::from_spec(&spec("kubectl", "kubectl scale deployment api --replicas=2"));
        let err = run(&action, 0, &ctx(&cp)).await.unwrap_err();
        assert!(matches!(err, AppError::Connectivity(_)));
    }

    #[tokio::test]
    async fn test_shell_success_and_failure() {
        let cp = FakeControlPlane::healthy();
        let ok = run(&Action::from_spec(&spec("bash", "echo hello")), 0, &ctx(&cp))
            .await
            .unwrap();
        assert!(ok.success);
        assert_eq!(ok.output.trim(), "hello");

        let bad = run(&Action::from_spec(&spec("bash", "echo oops >&2; exit 3")), 1, &ctx(&cp))
            .await
            .unwrap();
        assert!(!bad.success);
        let err = bad.error.unwrap();
        assert!(err.contains("exit code 3"));
        assert!(err.contains("oops"));
    }

    #[tokio::test]
    async fn test_shell_timeout() {
        let cp = FakeControlPlane::healthy();
        let c = ActionContext {
            control_plane: &cp,
            namespace: "default",
            command_timeout: Duration::from_millis(200),
        };
        let result = run(&Action::from_spec(&spec("bash", "sleep 5")), 0, &c).await.unwrap();
        assert!(!result.success);
        assert!(result.error.unwrap().contains("timed out"));
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn test_shell_timeout_kills_background_children() {
        let dir = tempfile::tempdir().unwrap();
        let pid_file = dir.path().join("child.pid");
        let cp = FakeControlPlane::healthy();
        let c = ActionContext {
            control_plane: &cp,
            namespace: "default",
            command_timeout: Duration::from_millis(300),
        };
        let command = format!("sleep 30 & echo $! > {}; wait", pid_file.display());

        let started = std::time::Instant::now();
        let result = run(&Action::from_spec(&spec("bash", &command)), 0, &c).await.unwrap();
        assert!(!result.success);
        assert!(started.elapsed() < Duration::from_secs(5));

        let pid = std::fs::read_to_string(&pid_file).unwrap().trim().to_string();
        let stat = format!("/proc/{pid}/stat");
        let mut alive = true;
        for _ in 0..40 {
            // gone, or a zombie awaiting its reaper
            alive = std::fs::read_to_string(&stat)
                .map(|s| !s.contains(") Z "))
                .unwrap_or(false);
            if !alive {
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        assert!(!alive, "background sleep {pid} survived the timeout");
    }

    #[tokio::test]
    async fn test_unsupported_kind_fails_without_error() {
        let cp = FakeControlPlane::healthy();
        let result = run(&Action::from_spec(&spec("ansible", "site.yml")), 0, &ctx(&cp))
            .await
            .unwrap();
        assert!(!result.success);
        assert_eq!(result.kind, "unsupported");
    }

    #[tokio::test]
    async fn test_yaml_patch_rewrites_document() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("logstash.yml");
        std::fs::write(&path, "pipeline:\n  workers: 2\ninputs:\n  - port: 5044\n").unwrap();

        let mut s = spec("config", "");
        s.config_path = Some(path.display().to_string());
        s.config_changes = Some(BTreeMap::from([
            ("pipeline.workers".to_string(), serde_json::json!(4)),
            ("pipeline.batch.size".to_string(), serde_json::json!(250)),
            ("inputs[0].port".to_string(), serde_json::json!(5045)),
        ]));

        let cp = FakeControlPlane::healthy();
        let result = run(&Action::from_spec(&s), 0, &ctx(&cp)).await.unwrap();
        assert!(result.success, "{:?}", result.error);

        let doc: YamlValue = serde_yaml::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(doc["pipeline"]["workers"], YamlValue::from(4));
        assert_eq!(doc["pipeline"]["batch"]["size"], YamlValue::from(250));
        assert_eq!(doc["inputs"][0]["port"], YamlValue::from(5045));
    }

    #[tokio::test]
    async fn test_json_patch_index_out_of_range_fails() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, r#"{"hosts": ["a"]}"#).unwrap();

        let mut s = spec("config", "");
        s.config_path = Some(path.display().to_string());
        s.config_changes = Some(BTreeMap::from([("hosts[3]".to_string(), serde_json::json!("b"))]));

        let cp = FakeControlPlane::healthy();
        let result = run(&Action::from_spec(&s), 0, &ctx(&cp)).await.unwrap();
        assert!(!result.success);
        assert!(result.error.unwrap().contains("out of range"));
        assert_eq!(std::fs::read_to_string(&path).unwrap(), r#"{"hosts": ["a"]}"#);
    }
}
