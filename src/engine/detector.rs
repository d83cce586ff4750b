//! Log-store polling, hit normalization and per-cycle threshold gating.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::{json, Value};

use crate::clients::elastic::LogStore;
use crate::db::repos::rules as rule_repo;
use crate::db::DbPool;
use crate::engine::classify::Classifier;
use crate::engine::types::DetectedError;
use crate::error::AppError;

/// Level values that select a record on their own.
pub const LEVEL_TERMS: &[&str] = &["ERROR", "FATAL", "CRITICAL"];

/// Message substrings that select a record on their own.
pub const MESSAGE_TERMS: &[&str] = &[
    "error",
    "exception",
    "failed",
    "crash",
    "panic",
    "fatal",
    "killed",
    "segmentation fault",
    "out of memory",
    "connection refused",
    "timeout",
    "permission denied",
];

const ORIGINAL_EVENT_TERMS: &[&str] = &["error", "exception", "failed"];

/// Hits fetched per poll.
pub const QUERY_SIZE: usize = 100;

const UNKNOWN_SOURCE: &str = "unknown";
const DEFAULT_SEVERITY: &str = "INFO";

// ============================================================================
// Query
// ============================================================================

/// Search body for records in `[now - window, now]` that match at least one
/// error signal.
pub fn build_query(window: Duration, now: DateTime<Utc>) -> Value {
    let start = now - chrono::Duration::seconds(window.as_secs() as i64);

    let mut should: Vec<Value> = Vec::new();
    for field in ["log.level", "level"] {
        for level in LEVEL_TERMS {
            should.push(json!({ "match": { field: level } }));
        }
    }
    for term in MESSAGE_TERMS {
        should.push(json!({ "match": { "message": term } }));
    }
    for term in ORIGINAL_EVENT_TERMS {
        should.push(json!({ "match": { "event.original": term } }));
    }
    should.push(json!({ "bool": { "must": [
        { "match": { "program": "kernel" } },
        { "wildcard": { "message": "*error*" } }
    ] } }));
    should.push(json!({ "bool": { "must": [
        { "match": { "program": "systemd" } },
        { "wildcard": { "message": "*failed*" } }
    ] } }));

    json!({
        "query": {
            "bool": {
                "filter": [
                    { "range": { "@timestamp": {
                        "gte": start.to_rfc3339_opts(SecondsFormat::Millis, true),
                        "lte": now.to_rfc3339_opts(SecondsFormat::Millis, true),
                    } } }
                ],
                "should": should,
                "minimum_should_match": 1
            }
        },
        "sort": [ { "@timestamp": { "order": "desc" } } ],
        "size": QUERY_SIZE
    })
}

// ============================================================================
// Normalization
// ============================================================================

/// Turn one raw hit into a classified error. Returns `None` for hits without a
/// `_source` document or with an empty message.
pub fn normalize_hit(hit: &Value, classifier: &Classifier) -> Option<DetectedError> {
    let source = hit.get("_source")?;

    let structured = match source.get("message") {
        Some(Value::Array(items)) => items.first().map(text_of).unwrap_or_default(),
        Some(v) => text_of(v),
        None => String::new(),
    };
    let original = source
        .pointer("/event/original")
        .map(text_of)
        .unwrap_or_default();

    // Favor completeness: the longer of the two, structured on a tie.
    let message = if original.chars().count() > structured.chars().count() {
        original
    } else {
        structured
    };
    if message.trim().is_empty() {
        return None;
    }

    let host = match source.get("host") {
        Some(Value::Object(h)) => h
            .get("name")
            .or_else(|| h.get("hostname"))
            .and_then(Value::as_str)
            .unwrap_or(UNKNOWN_SOURCE)
            .to_string(),
        Some(Value::String(s)) if !s.is_empty() => s.clone(),
        _ => UNKNOWN_SOURCE.to_string(),
    };
    let source_id = match source.get("program").map(text_of).filter(|p| !p.is_empty()) {
        Some(program) => format!("{host}-{program}"),
        None => host,
    };

    let severity = source
        .pointer("/log/level")
        .or_else(|| source.get("level"))
        .map(text_of)
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| DEFAULT_SEVERITY.to_string());

    let stack_trace = source
        .get("exception")
        .or_else(|| source.get("stack_trace"))
        .or_else(|| source.pointer("/error/stack_trace"))
        .map(text_of)
        .filter(|s| !s.is_empty());

    let observed_at = source
        .get("@timestamp")
        .and_then(Value::as_str)
        .and_then(|t| DateTime::parse_from_rfc3339(t).ok())
        .map(|t| t.with_timezone(&Utc))
        .unwrap_or_else(Utc::now);

    Some(DetectedError {
        category: classifier.classify(&message),
        message,
        source: source_id,
        severity,
        stack_trace,
        raw_payload: Some(source.clone()),
        origin_id: hit.get("_id").and_then(Value::as_str).map(str::to_string),
        observed_at,
    })
}

fn text_of(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

// ============================================================================
// Threshold gating
// ============================================================================

/// Events of one category that met the per-cycle threshold.
#[derive(Debug, Clone)]
pub struct CategoryBatch {
    pub category: String,
    pub events: Vec<DetectedError>,
}

impl CategoryBatch {
    pub fn samples(&self) -> Vec<String> {
        self.events.iter().map(|e| e.message.clone()).collect()
    }
}

/// Group by category in first-seen order and keep the categories whose count
/// meets `threshold`.
pub fn escalate(events: Vec<DetectedError>, threshold: usize) -> Vec<CategoryBatch> {
    let mut batches: Vec<CategoryBatch> = Vec::new();
    for event in events {
        match batches.iter_mut().find(|b| b.category == event.category) {
            Some(batch) => batch.events.push(event),
            None => batches.push(CategoryBatch {
                category: event.category.clone(),
                events: vec![event],
            }),
        }
    }

    batches
        .into_iter()
        .filter(|b| {
            let escalated = b.events.len() >= threshold;
            if escalated {
                tracing::warn!(category = %b.category, count = b.events.len(), "Error threshold reached");
            } else {
                tracing::debug!(category = %b.category, count = b.events.len(), threshold, "Below threshold");
            }
            escalated
        })
        .collect()
}

// ============================================================================
// Detector
// ============================================================================

pub struct Detector {
    store: Arc<dyn LogStore>,
    classifier: Classifier,
    index_pattern: String,
    max_lookback: Duration,
}

impl Detector {
    pub fn new(
        store: Arc<dyn LogStore>,
        classifier: Classifier,
        index_pattern: impl Into<String>,
        max_lookback: Duration,
    ) -> Self {
        Self {
            store,
            classifier,
            index_pattern: index_pattern.into(),
            max_lookback,
        }
    }

    /// Build a detector with the classification rules currently stored.
    pub fn load(
        pool: &DbPool,
        store: Arc<dyn LogStore>,
        index_pattern: &str,
        max_lookback: Duration,
    ) -> Result<Self, AppError> {
        let rules = rule_repo::get_enabled(pool)?;
        let classifier = Classifier::new(&rules);
        tracing::info!(rules = classifier.rule_count(), "Classification rules loaded");
        Ok(Self::new(store, classifier, index_pattern, max_lookback))
    }

    /// Fetch and classify the errors of the last `window`, clamped to the
    /// configured maximum lookback.
    pub async fn poll(&self, window: Duration) -> Result<Vec<DetectedError>, AppError> {
        let window = window.min(self.max_lookback);
        let now = Utc::now();
        let query = build_query(window, now);

        let hits = self.store.search(&self.index_pattern, &query).await?;
        let total = hits.len();
        let errors: Vec<DetectedError> = hits
            .iter()
            .filter_map(|hit| normalize_hit(hit, &self.classifier))
            .collect();

        tracing::info!(
            hits = total,
            errors = errors.len(),
            window_secs = window.as_secs(),
            "Log store polled"
        );
        Ok(errors)
    }
}
