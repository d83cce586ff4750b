use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use super::{http_client, http_err};
use crate::config::GeneratorConfig;
use crate::db::models::ActionSpec;
use crate::engine::types::Priority;
use crate::error::AppError;

/// What the generator is told about an unresolved error.
#[derive(Debug, Clone, Serialize)]
pub struct PlanRequest {
    pub category: String,
    pub message: String,
    pub source: String,
    pub severity: String,
    pub stack_trace: Option<String>,
    pub raw_payload: Option<String>,
}

/// A validated plan returned by the generator.
#[derive(Debug, Clone, PartialEq)]
pub struct GeneratedPlan {
    pub analysis: String,
    pub solution_type: String,
    pub description: String,
    pub commands: Vec<ActionSpec>,
    pub priority: Priority,
    pub estimated_time: String,
    pub success_probability: String,
}

#[async_trait]
pub trait PlanGenerator: Send + Sync {
    async fn generate(&self, request: &PlanRequest) -> Result<GeneratedPlan, AppError>;
}

fn generator_err(e: reqwest::Error) -> AppError {
    http_err("plan generator", e)
}

const SYSTEM_PROMPT: &str = "You are an expert in Kubernetes and the ELK stack. Analyse the error log \
and reply with an executable remediation plan as a single JSON object.";

/// Plan generator backed by an OpenAI-compatible chat completions endpoint.
pub struct ChatPlanGenerator {
    http: reqwest::Client,
    config: GeneratorConfig,
    namespace: String,
}

impl ChatPlanGenerator {
    pub fn new(config: &GeneratorConfig, namespace: &str) -> Result<Self, AppError> {
        if config.api_key.as_deref().map_or(true, |k| k.trim().is_empty()) {
            return Err(AppError::Config("generator.api_key is required".into()));
        }
        let http = http_client(Duration::from_secs(config.request_timeout_secs), true, None)?;
        Ok(Self {
            http,
            config: config.clone(),
            namespace: namespace.to_string(),
        })
    }

    fn build_prompt(&self, request: &PlanRequest) -> String {
        let mut prompt = format!(
            "Analyse the following error and propose a fix.\n\n\
             ## Error\n\
             - Category: {}\n\
             - Message: {}\n\
             - Source: {}\n\
             - Severity: {}\n",
            request.category, request.message, request.source, request.severity
        );
        if let Some(trace) = &request.stack_trace {
            prompt.push_str(&format!("- Stack trace: {}\n", truncate_chars(trace, 500)));
        }
        if let Some(raw) = &request.raw_payload {
            prompt.push_str(&format!("- Raw log: {}\n", truncate_chars(raw, 1000)));
        }
        prompt.push_str(&format!(
            r#"
## Response format
{{
  "analysis": "root cause analysis",
  "solution_type": "kubernetes|config_fix|restart|scaling|network|storage",
  "description": "what the fix does",
  "commands": [
    {{"type": "kubectl|bash|config", "command": "...", "description": "...", "safe": true, "critical": true}}
  ],
  "priority": "high|medium|low",
  "estimated_time": "minutes",
  "success_probability": "0-100"
}}

## Constraints
1. Kubernetes namespace: {}
2. Only propose safe, non-destructive commands.
3. Commands run in order; mark steps that may fail harmlessly with "critical": false.
"#,
            self.namespace
        ));
        prompt
    }
}

#[async_trait]
impl PlanGenerator for ChatPlanGenerator {
    async fn generate(&self, request: &PlanRequest) -> Result<GeneratedPlan, AppError> {
        let url = format!("{}/chat/completions", self.config.base_url.trim_end_matches('/'));
        let body = json!({
            "model": self.config.model,
            "messages": [
                { "role": "system", "content": SYSTEM_PROMPT },
                { "role": "user", "content": self.build_prompt(request) },
            ],
            "temperature": self.config.temperature,
            "max_tokens": self.config.max_tokens,
        });

        let resp: Value = self
            .http
            .post(&url)
            .bearer_auth(self.config.api_key.as_deref().unwrap_or_default())
            .json(&body)
            .send()
            .await
            .map_err(generator_err)?
            .error_for_status()
            .map_err(generator_err)?
            .json()
            .await
            .map_err(generator_err)?;

        let content = resp
            .pointer("/choices/0/message/content")
            .and_then(Value::as_str)
            .ok_or_else(|| AppError::Generation("response has no message content".into()))?;

        tracing::debug!(category = %request.category, "Plan generator replied");
        parse_plan_response(content)
    }
}

// ---------------------------------------------------------------------------
// Response parsing
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct RawPlan {
    analysis: Option<String>,
    solution_type: Option<String>,
    description: Option<String>,
    commands: Option<Vec<ActionSpec>>,
    priority: Option<String>,
    estimated_time: Option<Value>,
    success_probability: Option<Value>,
}

/// Extract and validate the JSON object embedded in a generator reply.
///
/// The object is taken from the first `{` to the last `}` so surrounding prose
/// or code fences are ignored.
pub fn parse_plan_response(text: &str) -> Result<GeneratedPlan, AppError> {
    let start = text.find('{');
    let end = text.rfind('}');
    let json_str = match (start, end) {
        (Some(s), Some(e)) if e > s => &text[s..=e],
        _ => return Err(AppError::Generation("no JSON object in response".into())),
    };

    let raw: RawPlan = serde_json::from_str(json_str)
        .map_err(|e| AppError::Generation(format!("unparsable plan: {e}")))?;

    let analysis = require(raw.analysis, "analysis")?;
    let solution_type = require(raw.solution_type, "solution_type")?;
    let description = require(raw.description, "description")?;
    let commands = raw
        .commands
        .ok_or_else(|| AppError::Generation("missing required field: commands".into()))?;

    let priority = raw
        .priority
        .as_deref()
        .and_then(|p| p.parse().ok())
        .unwrap_or_default();

    Ok(GeneratedPlan {
        analysis,
        solution_type,
        description,
        commands,
        priority,
        estimated_time: scalar_or(raw.estimated_time, "10"),
        success_probability: scalar_or(raw.success_probability, "70"),
    })
}

fn require(field: Option<String>, name: &str) -> Result<String, AppError> {
    match field {
        Some(v) if !v.trim().is_empty() => Ok(v),
        _ => Err(AppError::Generation(format!("missing required field: {name}"))),
    }
}

fn scalar_or(value: Option<Value>, default: &str) -> String {
    match value {
        Some(Value::String(s)) if !s.trim().is_empty() => s,
        Some(Value::Number(n)) => n.to_string(),
        _ => default.to_string(),
    }
}

fn truncate_chars(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let mut out: String = s.chars().take(max).collect();
        out.push_str("...");
        out
    }
}
